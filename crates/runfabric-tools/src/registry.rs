use std::collections::HashMap;
use std::sync::Arc;

use runfabric_types::{AgentProfile, FunctionSchema, ToolCategory, ToolDefinition};

use crate::dispatch::ToolHandler;

/// Process-global catalog of callable tools. Populated once at startup
/// via [`crate::register_builtin_tools`] and never mutated after; every
/// method here takes `&self`, so concurrent readers never contend.
#[derive(Default)]
pub struct ToolRegistry {
    definitions: HashMap<String, ToolDefinition>,
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: ToolDefinition, handler: Option<Arc<dyn ToolHandler>>) {
        let name = definition.name.clone();
        if !self.definitions.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.definitions.insert(name.clone(), definition);
        match handler {
            Some(h) => {
                self.handlers.insert(name, h);
            }
            None => {
                self.handlers.remove(&name);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.definitions.get(name)
    }

    pub fn get_handler(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn all_tools(&self) -> Vec<&ToolDefinition> {
        self.order.iter().filter_map(|name| self.definitions.get(name)).collect()
    }

    pub fn by_category(&self, category: ToolCategory) -> Vec<&ToolDefinition> {
        self.all_tools().into_iter().filter(|d| d.category == category).collect()
    }

    pub fn by_provider(&self, provider: &str) -> Vec<&ToolDefinition> {
        self.all_tools()
            .into_iter()
            .filter(|d| d.provider.as_deref() == Some(provider))
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.order.clone()
    }

    /// Profile + provider + category + blocklist gating (spec §4.3
    /// "Filtering"). Order is preserved from registration.
    pub fn get_allowed_tools(
        &self,
        profile: AgentProfile,
        providers: &[String],
        allowed_categories: Option<&[ToolCategory]>,
        blocked_tools: &[String],
    ) -> Vec<&ToolDefinition> {
        self.all_tools()
            .into_iter()
            .filter(|d| d.min_profile.order() <= profile.order())
            .filter(|d| allowed_categories.map_or(true, |cats| cats.contains(&d.category)))
            .filter(|d| !blocked_tools.iter().any(|blocked| blocked == &d.name))
            .filter(|d| {
                d.category != ToolCategory::Integration
                    || d.provider.as_deref().is_some_and(|p| providers.iter().any(|x| x == p))
            })
            .collect()
    }

    /// OpenAI-compatible function-calling schemas for a given tool-name
    /// allowlist, preserving the allowlist's order (spec §4.4 step 3.b).
    pub fn get_openai_schemas(&self, tool_names: &[String]) -> Vec<FunctionSchema> {
        tool_names
            .iter()
            .filter_map(|name| self.definitions.get(name))
            .map(|d| d.openai_schema.clone())
            .collect()
    }

    pub fn find_provider(&self, tool_name: &str) -> Option<&str> {
        self.definitions.get(tool_name).and_then(|d| d.provider.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(name: &str, category: ToolCategory, min_profile: AgentProfile) -> ToolDefinition {
        ToolDefinition::new(name, category, "test tool", serde_json::json!({}), min_profile)
    }

    #[test]
    fn reactive_profile_excludes_balanced_minimum_tools() {
        let mut registry = ToolRegistry::new();
        registry.register(def("search_documents", ToolCategory::Retrieval, AgentProfile::Reactive), None);
        registry.register(def("search_web", ToolCategory::Retrieval, AgentProfile::Balanced), None);

        let allowed = registry.get_allowed_tools(AgentProfile::Reactive, &[], None, &[]);
        assert_eq!(allowed.len(), 1);
        assert_eq!(allowed[0].name, "search_documents");
    }

    #[test]
    fn integration_tool_requires_connected_provider() {
        let mut registry = ToolRegistry::new();
        let mut nango = def("nango_gmail", ToolCategory::Integration, AgentProfile::Reactive);
        nango.provider = Some("gmail".to_string());
        registry.register(nango, None);

        assert!(registry.get_allowed_tools(AgentProfile::Exec, &[], None, &[]).is_empty());
        let providers = vec!["gmail".to_string()];
        assert_eq!(registry.get_allowed_tools(AgentProfile::Exec, &providers, None, &[]).len(), 1);
    }

    #[test]
    fn blocklist_removes_named_tool() {
        let mut registry = ToolRegistry::new();
        registry.register(def("delegate_to_assistant", ToolCategory::Delegation, AgentProfile::Balanced), None);

        let blocked = vec!["delegate_to_assistant".to_string()];
        assert!(registry.get_allowed_tools(AgentProfile::Exec, &[], None, &blocked).is_empty());
    }

    #[test]
    fn category_filter_restricts_to_allowed_set() {
        let mut registry = ToolRegistry::new();
        registry.register(def("kpi_cards", ToolCategory::Block, AgentProfile::Reactive), None);
        registry.register(def("search_documents", ToolCategory::Retrieval, AgentProfile::Reactive), None);

        let cats = [ToolCategory::Block];
        let allowed = registry.get_allowed_tools(AgentProfile::Exec, &[], Some(&cats), &[]);
        assert_eq!(allowed.len(), 1);
        assert_eq!(allowed[0].name, "kpi_cards");
    }
}
