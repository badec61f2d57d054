use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use panelstream_core::{DomainChunk, RequestError, StreamRequest};
use tokio_util::sync::CancellationToken;

/// A cooperative cancel handle for an in-flight domain stream. Cancelling
/// prompts the adapter to stop producing new chunks and emit a final
/// `DomainChunk::Error { kind: ProviderErrorKind::Cancelled, .. }` rather
/// than simply being dropped mid-stream, so downstream consumers always see
/// a terminal chunk and cancellation is never confused with a clean `End`.
#[derive(Debug, Clone)]
pub struct CancelHandle(CancellationToken);

impl CancelHandle {
    pub fn new() -> Self {
        CancelHandle(CancellationToken::new())
    }

    pub fn cancel(&self) {
        self.0.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }

    pub fn token(&self) -> CancellationToken {
        self.0.clone()
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// One panelist's normalized chunk stream, plus the handle to cancel it.
pub struct PanelistStream {
    pub chunks: Pin<Box<dyn Stream<Item = DomainChunk> + Send>>,
    pub cancel: CancelHandle,
}

/// Implemented once per supported provider. `stream` is the only path that
/// produces chunks; everything else (system-message merging, `seq`
/// assignment) happens inside the implementation so callers never see
/// provider-native wire types.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Stable identifier matching `Panelist::provider`, e.g. `"anthropic"`.
    fn provider_id(&self) -> &str;

    /// Synchronous, side-effect-free shape check on an API key. This is
    /// NOT an authentication round-trip — it only rejects keys that are
    /// structurally impossible for this provider (spec.md §4.1).
    fn validate_api_key(&self, key: &str) -> bool;

    /// Begin streaming a single panelist's turn. Returns before the first
    /// chunk is necessarily available; the returned stream produces
    /// `DomainChunk`s with monotonically increasing `seq` starting at 0,
    /// terminated by exactly one `End` or `Error` chunk.
    async fn stream(&self, request: StreamRequest) -> Result<PanelistStream, RequestError>;
}
