use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors rejected before a stream ever starts — malformed or inconsistent
/// requests. Always surfaced synchronously, never as a `DomainChunk::Error`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RequestError {
    #[error("stream request has no panelists")]
    NoPanelists,
    #[error("duplicate panelist_id: {0}")]
    DuplicatePanelistId(String),
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
    #[error("thread_id must not be empty")]
    EmptyThreadId,
    #[error("stream request has no messages")]
    EmptyMessages,
    #[error("unrecognized model for panelist {panelist_id}: {model}")]
    UnknownModel { panelist_id: String, model: String },
}

/// The taxonomy of ways a provider adapter's stream can end badly, plus
/// `Cancelled` for a consumer-initiated stop. Mirrors the wire `code` field
/// callers get on the `error` SSE event so both sides of the boundary agree
/// on what went wrong and what can be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ProviderErrorKind {
    RateLimited,
    QuotaExceeded,
    Timeout,
    ServerError,
    Network,
    InvalidApiKey,
    InvalidRequest,
    ContentFiltered,
    ModelNotFound,
    Unsupported,
    /// The stream was cancelled by the consumer before reaching a natural
    /// stop. Not logged as an error; reported uniformly as a terminal
    /// `error` chunk for the client/persistence contract.
    Cancelled,
    Unknown,
}

impl ProviderErrorKind {
    /// spec.md: only `rate_limited` and transient network/timeout/server
    /// errors are retryable, and then at most once with a short backoff.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            ProviderErrorKind::RateLimited
                | ProviderErrorKind::Timeout
                | ProviderErrorKind::ServerError
                | ProviderErrorKind::Network
        )
    }

    /// Classifies an HTTP status code from a provider's wire response into
    /// the shared retry taxonomy. 429 is `RateLimited` rather than
    /// `QuotaExceeded` here — providers overload 429 for both short-term
    /// throttling and hard quota exhaustion, and the adapters have no
    /// reliable way to tell those apart from the status code alone.
    pub fn classify_http_status(status: u16) -> ProviderErrorKind {
        match status {
            401 | 403 => ProviderErrorKind::InvalidApiKey,
            404 => ProviderErrorKind::ModelNotFound,
            408 => ProviderErrorKind::Timeout,
            429 => ProviderErrorKind::RateLimited,
            400 | 422 => ProviderErrorKind::InvalidRequest,
            s if (500..600).contains(&s) => ProviderErrorKind::ServerError,
            _ => ProviderErrorKind::Unknown,
        }
    }
}

/// An error produced by a provider adapter while it was streaming.
///
/// Unlike `querymt`'s `LLMError`, this carries a structured `kind` rather
/// than relying purely on string matching, because the retry loop and the
/// SSE `error` event both need to answer "is this retryable?" without
/// re-parsing a message.
#[derive(Debug, Error, Clone)]
#[error("{kind:?}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        ProviderError {
            kind,
            message: message.into(),
        }
    }

    pub fn retryable(&self) -> bool {
        self.kind.retryable()
    }
}

/// Errors from the persistence pipeline and its backing store.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum PersistenceError {
    #[error("store rejected append for ({thread_id}, {message_id}, seq {seq}): {reason}")]
    StoreRejected {
        thread_id: String,
        message_id: String,
        seq: u64,
        reason: String,
    },
    #[error("store is unavailable: {0}")]
    StoreUnavailable(String),
    #[error("overflow log I/O error: {0}")]
    OverflowIo(String),
    #[error("overflow record failed CRC validation and was skipped")]
    CorruptOverflowRecord,
    #[error("primary queue is closed")]
    QueueClosed,
}
