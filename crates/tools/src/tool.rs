use async_trait::async_trait;
use serde_json::Value;

/// A single callable tool. Implementations should be cheap to hold behind
/// an `Arc` and safe to call concurrently — the executor may run multiple
/// calls to the same tool in parallel, bounded only by the shared worker
/// pool's concurrency limit.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    /// Run the tool. Returning `Err` produces a `ToolResult { ok: false }`
    /// with the error's message as the payload; it is not a panic and must
    /// not be allowed to unwind past this call.
    async fn call(&self, arguments: Value) -> Result<Value, String>;
}
