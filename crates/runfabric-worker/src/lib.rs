//! Worker runtime: drives a single `Run` from PENDING through to a
//! terminal status, publishing the SSE wire protocol as it goes (spec
//! §4.6). Grounded on `original_source/app/workers/agent_tasks.py` and a
//! dequeue/dispatch loop shape.

mod collaborators;
mod config;
mod errors;
mod runtime;
mod watchdog;

pub use collaborators::{ChatSink, ConversationHistory, UsageRecorder};
pub use config::RuntimeConfig;
pub use errors::RunErrorCode;
pub use runtime::{on_agent_job_abort, run_agent, Worker};
pub use watchdog::watchdog_stuck_runs;
