use std::sync::Arc;
use std::time::Duration;

use panelstream_core::{ToolCall, ToolResult};
use tokio::sync::Semaphore;

use crate::registry::ToolRegistry;

pub const DEFAULT_PER_CALL_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_CONCURRENT_CALLS: usize = 8;

fn default_per_call_timeout_ms() -> u64 {
    DEFAULT_PER_CALL_TIMEOUT_MS
}

fn default_max_concurrent_calls() -> usize {
    DEFAULT_MAX_CONCURRENT_CALLS
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ToolExecutorConfig {
    #[serde(default = "default_per_call_timeout_ms")]
    pub per_call_timeout_ms: u64,
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: usize,
}

impl Default for ToolExecutorConfig {
    fn default() -> Self {
        ToolExecutorConfig {
            per_call_timeout_ms: DEFAULT_PER_CALL_TIMEOUT_MS,
            max_concurrent_calls: DEFAULT_MAX_CONCURRENT_CALLS,
        }
    }
}

/// Executes `ToolCall`s against a `ToolRegistry` through a bounded worker
/// pool. Calls beyond `max_concurrent_calls` queue in FIFO order on the
/// semaphore rather than spawning unboundedly; each admitted call is capped
/// by `per_call_timeout_ms`, past which it yields a timeout `ToolResult`
/// without cancelling the underlying tool task (the tool may still be
/// running — the executor simply stops waiting on it).
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    semaphore: Arc<Semaphore>,
    config: ToolExecutorConfig,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, config: ToolExecutorConfig) -> Self {
        ToolExecutor {
            registry,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_calls)),
            config,
        }
    }

    #[tracing::instrument(skip(self), fields(tool = %call.name, call_id = %call.call_id))]
    pub async fn execute(&self, call: ToolCall) -> ToolResult {
        let Some(tool) = self.registry.find(&call.name) else {
            return ToolResult::error(format!("unknown tool: {}", call.name));
        };

        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => return ToolResult::error("tool executor is shutting down"),
        };

        let timeout = Duration::from_millis(self.config.per_call_timeout_ms);
        let call_future = tool.call(call.arguments);

        let outcome = tokio::time::timeout(timeout, call_future).await;
        drop(permit);

        match outcome {
            Ok(Ok(payload)) => ToolResult::ok(payload),
            Ok(Err(message)) => ToolResult::error(message),
            Err(_) => ToolResult::timeout(),
        }
    }
}
