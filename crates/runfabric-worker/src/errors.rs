//! The stable error taxonomy (spec §7), collected into one enum so every
//! site that needs to set `Run.error_code` or an `error` event's `code`
//! field uses the same strings.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunErrorCode {
    BudgetExhausted,
    ReservationError,
    ToolTimeout,
    ToolExecutionError,
    LlmError,
    RunNotFound,
    AssistantNotFound,
    WorkerException,
    WorkerAborted,
    WatchdogTimeout,
    HardTimeout,
}

impl RunErrorCode {
    pub fn as_code(self) -> &'static str {
        match self {
            RunErrorCode::BudgetExhausted => "budget_exhausted",
            RunErrorCode::ReservationError => "reservation_error",
            RunErrorCode::ToolTimeout => "tool_timeout",
            RunErrorCode::ToolExecutionError => "tool_execution_error",
            RunErrorCode::LlmError => "llm_error",
            RunErrorCode::RunNotFound => "run_not_found",
            RunErrorCode::AssistantNotFound => "assistant_not_found",
            RunErrorCode::WorkerException => "worker_exception",
            RunErrorCode::WorkerAborted => "worker_aborted",
            RunErrorCode::WatchdogTimeout => "watchdog_timeout",
            RunErrorCode::HardTimeout => "hard_timeout",
        }
    }
}

impl std::fmt::Display for RunErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_code())
    }
}
