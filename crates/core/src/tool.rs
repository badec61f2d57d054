use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool definition as advertised to a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// A provider-requested invocation of one registered tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub name: String,
    pub arguments: Value,
}

/// The outcome of executing a `ToolCall`. `ok: false` is data, not a Rust
/// error — a failed tool call never terminates the containing stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    pub ok: bool,
    pub payload: Value,
}

impl ToolResult {
    pub fn ok(payload: Value) -> Self {
        ToolResult { ok: true, payload }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ToolResult {
            ok: false,
            payload: Value::String(message.into()),
        }
    }

    pub fn timeout() -> Self {
        ToolResult::error("tool call exceeded its per-call timeout")
    }
}
