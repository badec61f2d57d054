//! A scriptable adapter used by integration tests elsewhere in the
//! workspace to exercise the bundler/merger/persistence pipeline against an
//! exact, deterministic chunk sequence without any network access.

use async_trait::async_trait;
use panelstream_core::{DomainChunk, RequestError, StreamRequest};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::adapter::{CancelHandle, PanelistStream, ProviderAdapter};

/// Replays a fixed script of chunks, one per `stream()` call, regardless of
/// the request contents. If cancelled before the script is exhausted, it
/// stops early and still emits a cancelled `End` (the real adapters'
/// contract), recorded in `cancelled_calls` for assertions.
pub struct MockAdapter {
    script: Vec<DomainChunk>,
    cancel_after: Option<usize>,
    pub cancelled_calls: Arc<Mutex<usize>>,
}

impl MockAdapter {
    pub fn new(script: Vec<DomainChunk>) -> Self {
        MockAdapter {
            script,
            cancel_after: None,
            cancelled_calls: Arc::new(Mutex::new(0)),
        }
    }

    /// Cancel the handle itself after emitting `n` chunks, simulating a
    /// caller-initiated cancellation mid-stream.
    pub fn cancel_after(mut self, n: usize) -> Self {
        self.cancel_after = Some(n);
        self
    }
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    fn provider_id(&self) -> &str {
        "mock"
    }

    fn validate_api_key(&self, key: &str) -> bool {
        !key.is_empty()
    }

    async fn stream(&self, request: StreamRequest) -> Result<PanelistStream, RequestError> {
        if request.panelists.is_empty() {
            return Err(RequestError::NoPanelists);
        }

        let cancel = CancelHandle::new();
        let cancel_token = cancel.token();
        let script = self.script.clone();
        let cancel_after = self.cancel_after;
        let cancelled_calls = self.cancelled_calls.clone();
        let (tx, rx) = mpsc::channel(script.len().max(1));

        tokio::spawn(async move {
            for (i, chunk) in script.into_iter().enumerate() {
                if cancel_token.is_cancelled() {
                    *cancelled_calls.lock() += 1;
                    return;
                }
                if tx.send(chunk).await.is_err() {
                    return;
                }
                if cancel_after == Some(i + 1) {
                    cancel_token.cancel();
                }
            }
        });

        Ok(PanelistStream {
            chunks: Box::pin(ReceiverStream::new(rx)),
            cancel,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use panelstream_core::{Panelist, StopReason};

    fn req() -> StreamRequest {
        StreamRequest {
            thread_id: "t".into(),
            message_id: "m".into(),
            panelists: vec![Panelist {
                panelist_id: "p1".into(),
                ..Default::default()
            }],
            messages: vec![],
            tools: vec![],
            options: Default::default(),
        }
    }

    #[tokio::test]
    async fn replays_the_scripted_chunks_in_order() {
        let script = vec![
            DomainChunk::Text {
                seq: 1,
                delta: "hi".into(),
            },
            DomainChunk::End {
                seq: 2,
                reason: StopReason::Stop,
            },
        ];
        let adapter = MockAdapter::new(script.clone());
        let mut stream = adapter.stream(req()).await.unwrap().chunks;
        let mut collected = Vec::new();
        while let Some(c) = stream.next().await {
            collected.push(c);
        }
        assert_eq!(collected, script);
    }

    #[tokio::test]
    async fn rejects_requests_with_no_panelists() {
        let adapter = MockAdapter::new(vec![]);
        let mut empty = req();
        empty.panelists.clear();
        let err = adapter.stream(empty).await.unwrap_err();
        assert_eq!(err, RequestError::NoPanelists);
    }
}
