//! The primary persistence queue: a bounded, multi-producer,
//! multi-consumer channel of `PersistedChunk` bundles. Edge Sessions are
//! producers (through a `SessionSink`, see `pipeline.rs`); the worker pool
//! in `worker.rs` shares one receiver behind a `tokio::sync::Mutex` so
//! several workers can drain it concurrently — `tokio::sync::mpsc` only
//! gives multi-producer/single-consumer natively, so the receiver-side
//! fan-out is built the same way `event_bus.rs` shares its subscriber list
//! in the teacher codebase: a short-lived lock around an otherwise
//! lock-free hot path.

use std::sync::Arc;

use panelstream_core::PersistedChunk;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

#[derive(Clone)]
pub struct PrimaryQueue {
    tx: mpsc::Sender<PersistedChunk>,
    rx: Arc<AsyncMutex<mpsc::Receiver<PersistedChunk>>>,
    capacity: usize,
}

impl PrimaryQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        PrimaryQueue {
            tx,
            rx: Arc::new(AsyncMutex::new(rx)),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Non-blocking enqueue. `Err` means the queue was full (or closed);
    /// the caller (a `SessionSink` or the overflow replayer) is expected to
    /// fall back to the overflow log on `Full`.
    pub fn try_enqueue(&self, item: PersistedChunk) -> Result<(), TryEnqueueError> {
        match self.tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(item)) => Err(TryEnqueueError::Full(item)),
            Err(mpsc::error::TrySendError::Closed(item)) => Err(TryEnqueueError::Closed(item)),
        }
    }

    /// Blocking enqueue, used by the replayer which is allowed to wait for
    /// headroom rather than immediately re-spilling to overflow.
    pub async fn enqueue(&self, item: PersistedChunk) -> Result<(), PersistedChunk> {
        self.tx.send(item).await.map_err(|e| e.0)
    }

    /// Approximate current headroom; used by the replayer to decide
    /// whether it is worth attempting another batch from the overflow log.
    pub fn has_headroom(&self) -> bool {
        self.tx.capacity() > 0
    }

    pub async fn dequeue(&self) -> Option<PersistedChunk> {
        self.rx.lock().await.recv().await
    }

    /// Best-effort, non-blocking drain of whatever is immediately available
    /// — used by workers to opportunistically batch items for the same
    /// `(thread_id, message_id)` without waiting for new arrivals.
    pub async fn try_dequeue_more(&self, max: usize) -> Vec<PersistedChunk> {
        let mut rx = self.rx.lock().await;
        let mut out = Vec::new();
        while out.len() < max {
            match rx.try_recv() {
                Ok(item) => out.push(item),
                Err(_) => break,
            }
        }
        out
    }
}

pub enum TryEnqueueError {
    Full(PersistedChunk),
    Closed(PersistedChunk),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(seq: u64) -> PersistedChunk {
        PersistedChunk {
            thread_id: "t".into(),
            message_id: "m".into(),
            seq,
            kind: "text".into(),
            content: json!({"delta": "x"}),
            finalized: false,
            created_at: "2026-01-01T00:00:00Z".into(),
        }
    }

    #[tokio::test]
    async fn enqueue_then_dequeue_preserves_order() {
        let queue = PrimaryQueue::new(8);
        queue.try_enqueue(item(1)).ok();
        queue.try_enqueue(item(2)).ok();
        let a = queue.dequeue().await.unwrap();
        let b = queue.dequeue().await.unwrap();
        assert_eq!(a.seq, 1);
        assert_eq!(b.seq, 2);
    }

    #[tokio::test]
    async fn try_enqueue_reports_full_once_capacity_is_exhausted() {
        let queue = PrimaryQueue::new(1);
        assert!(queue.try_enqueue(item(1)).is_ok());
        match queue.try_enqueue(item(2)) {
            Err(TryEnqueueError::Full(i)) => assert_eq!(i.seq, 2),
            _ => panic!("expected Full"),
        }
    }
}
