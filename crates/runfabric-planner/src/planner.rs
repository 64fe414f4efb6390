//! Plan generation (spec §4.4 "Planner"), grounded on
//! `original_source/app/core/planner.py`.

use runfabric_providers::{CompletionOptions, ProviderRegistry};
use runfabric_types::{AgentProfile, Plan, PlanStep};

const PLAN_SYSTEM_PROMPT: &str = r#"Tu es un planificateur. Réponds uniquement avec un objet JSON de la forme
{"reasoning": string, "steps": [{"action": string, "description": string, "tool": string|null}, ...]}.

Actions autorisées : search_documents, synthesize, ensure_source_coverage.
Règles :
- Commence par search_documents si la question nécessite des informations.
- Termine toujours par ensure_source_coverage.
- Un simple message de politesse peut se réduire à [synthesize].
- Maximum 5 étapes.
Ne produis aucun texte en dehors de l'objet JSON."#;

#[derive(serde::Deserialize)]
struct RawPlan {
    reasoning: String,
    steps: Vec<RawStep>,
}

#[derive(serde::Deserialize)]
struct RawStep {
    action: String,
    description: String,
    tool: Option<String>,
}

/// Generates a plan for non-reactive profiles. Falls back to
/// [`Plan::default_for`] on any parse or transport failure — planning
/// must never be able to fail the run.
pub async fn generate_plan(
    providers: &ProviderRegistry,
    message: &str,
    profile: AgentProfile,
    available_tools: &[String],
    conversation_summary: Option<&str>,
) -> Plan {
    let mut user_prompt = format!("Message utilisateur : {message}\nOutils disponibles : {}", available_tools.join(", "));
    if let Some(summary) = conversation_summary {
        user_prompt.push_str(&format!("\nRésumé de la conversation : {summary}"));
    }

    let messages = vec![
        runfabric_types::ChatMessage::system(PLAN_SYSTEM_PROMPT),
        runfabric_types::ChatMessage::user(user_prompt),
    ];

    let result = providers
        .complete_for_provider(
            None,
            &messages,
            CompletionOptions { max_tokens: Some(500), temperature: Some(0.1), json_mode: true, ..Default::default() },
        )
        .await;

    let Ok((completion, _provider_id)) = result else {
        return Plan::default_for(profile);
    };

    let Ok(raw) = serde_json::from_str::<RawPlan>(&completion.text) else {
        return Plan::default_for(profile);
    };

    if raw.steps.is_empty() {
        return Plan::default_for(profile);
    }

    Plan {
        steps: raw
            .steps
            .into_iter()
            .take(5)
            .map(|s| PlanStep::new(s.action, s.description, s.tool))
            .collect(),
        reasoning: raw.reasoning,
        profile,
    }
}

/// `reactive` never plans; balanced/pro/exec do (spec §4.6 step 8).
pub fn needs_planning(profile: AgentProfile) -> bool {
    !matches!(profile, AgentProfile::Reactive)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reactive_never_needs_planning() {
        assert!(!needs_planning(AgentProfile::Reactive));
        assert!(needs_planning(AgentProfile::Balanced));
        assert!(needs_planning(AgentProfile::Pro));
        assert!(needs_planning(AgentProfile::Exec));
    }

    #[tokio::test]
    async fn falls_back_to_default_plan_when_no_provider_configured() {
        // `ProviderRegistry::new` with an empty config falls back to the
        // local echo provider, whose `complete()` never returns valid
        // plan JSON, so this exercises the fallback path end-to-end.
        let registry = ProviderRegistry::new(runfabric_providers::AppConfig::default());
        let plan = generate_plan(&registry, "bonjour", AgentProfile::Balanced, &["search_documents".to_string()], None).await;
        assert_eq!(plan.steps.len(), 3);
        assert_eq!(plan.steps[0].action, "search_documents");
        assert_eq!(plan.steps.last().unwrap().action, "ensure_source_coverage");
    }
}
