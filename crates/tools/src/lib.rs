//! Tool Executor: a name-keyed registry of tools plus a bounded worker pool
//! that executes `ToolCall`s with a per-call timeout. A tool failing, or
//! timing out, never propagates as a Rust error out of this crate — it
//! always becomes a `ToolResult { ok: false, .. }`, because a failed tool
//! call must never terminate the containing domain stream (spec.md §4.2).

pub mod executor;
pub mod registry;
pub mod tool;

pub use executor::{ToolExecutor, ToolExecutorConfig};
pub use registry::ToolRegistry;
pub use tool::Tool;
