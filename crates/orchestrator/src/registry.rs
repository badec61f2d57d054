//! Maps a `Panelist::provider` identifier to the `Orchestrator` configured
//! for that provider. A roundtable request names one provider per
//! panelist; the Edge Session looks each one up here before fanning out —
//! this is the "tagged variant over adapter identity, no inheritance"
//! pattern spec_full.md's design notes call for (spec.md §9), built once
//! at startup and read-only afterward, the only shared state besides the
//! persistence primary queue that spec.md §5 permits outside per-session
//! task trees.

use std::collections::HashMap;
use std::sync::Arc;

use panelstream_core::RequestError;

use crate::Orchestrator;

#[derive(Default)]
pub struct OrchestratorRegistry {
    by_provider: HashMap<String, Arc<Orchestrator>>,
}

impl OrchestratorRegistry {
    pub fn new() -> Self {
        OrchestratorRegistry::default()
    }

    pub fn register(&mut self, provider_id: impl Into<String>, orchestrator: Arc<Orchestrator>) {
        self.by_provider.insert(provider_id.into(), orchestrator);
    }

    pub fn get(&self, provider_id: &str) -> Result<Arc<Orchestrator>, RequestError> {
        self.by_provider
            .get(provider_id)
            .cloned()
            .ok_or_else(|| RequestError::UnknownProvider(provider_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use panelstream_adapters::mock::MockAdapter;
    use panelstream_tools::{ToolExecutor, ToolExecutorConfig, ToolRegistry};

    #[test]
    fn unregistered_provider_is_an_unknown_provider_error() {
        let registry = OrchestratorRegistry::new();
        let err = registry.get("anthropic").unwrap_err();
        assert_eq!(err, RequestError::UnknownProvider("anthropic".to_string()));
    }

    #[test]
    fn registered_provider_round_trips() {
        let mut registry = OrchestratorRegistry::new();
        let adapter = Arc::new(MockAdapter::new(vec![]));
        let tools = Arc::new(ToolExecutor::new(
            Arc::new(ToolRegistry::new()),
            ToolExecutorConfig::default(),
        ));
        registry.register("mock", Arc::new(Orchestrator::new(adapter, tools)));
        assert!(registry.get("mock").is_ok());
    }
}
