//! Shared types for the panelist streaming/persistence core.
//!
//! This crate has no async runtime dependency and no I/O; every other crate
//! in the workspace depends on it for the vocabulary they exchange chunks,
//! requests, and errors in.

pub mod chunk;
pub mod error;
pub mod persisted;
pub mod request;
pub mod tool;
pub mod usage;

pub use chunk::{Attribution, DomainChunk, StopReason};
pub use error::{PersistenceError, ProviderError, ProviderErrorKind, RequestError};
pub use persisted::PersistedChunk;
pub use request::{
    estimate_token_count, BundlerConfig, ChatMessage, ChatRole, Panelist, StreamOptions,
    StreamRequest,
};
pub use tool::{ToolCall, ToolResult, ToolSpec};
pub use usage::Usage;
