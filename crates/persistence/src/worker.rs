//! Worker pool: drains the primary queue and writes bundles to the
//! `MessageStore`, batching consecutive items for the same
//! `(thread_id, message_id)` key, retrying transient store failures with
//! bounded exponential backoff, and falling back to the overflow log when
//! retries are exhausted. Permanent (non-dedup) store failures are logged,
//! counted, and dropped — spec.md §4.7/§7 is explicit that these never
//! fail the session.

use std::sync::Arc;
use std::time::Duration;

use panelstream_core::{PersistedChunk, PersistenceError};

use crate::metrics::Metrics;
use crate::overflow::OverflowLog;
use crate::queue::PrimaryQueue;
use crate::store::{AppendOutcome, MessageStore};

fn default_max_attempts() -> u32 {
    DEFAULT_RETRY_MAX_ATTEMPTS
}

fn default_backoff_base_ms() -> u64 {
    DEFAULT_RETRY_BACKOFF_BASE_MS
}

fn default_worker_count() -> usize {
    DEFAULT_WORKER_COUNT
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF_BASE_MS: u64 = 50;
pub const DEFAULT_WORKER_COUNT: usize = 4;
pub const DEFAULT_BATCH_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            backoff_base_ms: DEFAULT_RETRY_BACKOFF_BASE_MS,
            worker_count: DEFAULT_WORKER_COUNT,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Runs forever, processing items from `queue` until it is closed (the
/// pipeline is dropped). Intended to be spawned once per worker slot.
pub async fn run_worker(
    queue: PrimaryQueue,
    store: Arc<dyn MessageStore>,
    overflow: Arc<OverflowLog>,
    config: RetryConfig,
    metrics: Arc<Metrics>,
) {
    loop {
        let Some(first) = queue.dequeue().await else {
            return; // queue closed: pipeline shutting down
        };

        let mut batch = vec![first];
        batch.extend(
            queue
                .try_dequeue_more(config.batch_size.saturating_sub(1))
                .await,
        );

        for item in batch {
            write_with_retry(&item, &store, &overflow, &config, &metrics).await;
        }
    }
}

async fn write_with_retry(
    item: &PersistedChunk,
    store: &Arc<dyn MessageStore>,
    overflow: &Arc<OverflowLog>,
    config: &RetryConfig,
    metrics: &Arc<Metrics>,
) {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let outcome = store
            .append_chunk(
                &item.thread_id,
                &item.message_id,
                item.seq,
                &item.kind,
                &item.content,
                item.finalized,
                &item.created_at,
            )
            .await;

        match outcome {
            Ok(AppendOutcome::Appended) => {
                metrics.record_committed();
                return;
            }
            Ok(AppendOutcome::Deduplicated) => {
                metrics.record_deduplicated();
                return;
            }
            Err(err) if is_transient(&err) => {
                if attempt >= config.max_attempts {
                    tracing::warn!(
                        thread_id = %item.thread_id,
                        message_id = %item.message_id,
                        seq = item.seq,
                        attempts = attempt,
                        "persistence store write exhausted retries, spilling to overflow",
                    );
                    metrics.record_overflowed();
                    if let Err(io_err) = overflow.append(item) {
                        tracing::error!(error = %io_err, "overflow log append failed");
                        metrics.record_permanent_failure();
                    }
                    return;
                }
                let backoff =
                    Duration::from_millis(config.backoff_base_ms * 2u64.pow(attempt - 1));
                tokio::time::sleep(backoff).await;
            }
            Err(err) => {
                tracing::error!(
                    thread_id = %item.thread_id,
                    message_id = %item.message_id,
                    seq = item.seq,
                    error = %err,
                    "persistence store rejected chunk permanently",
                );
                metrics.record_permanent_failure();
                return;
            }
        }
    }
}

/// Transient store failures are retried; everything else (e.g. a
/// constraint violation unrelated to dedup) is treated as permanent.
fn is_transient(err: &PersistenceError) -> bool {
    matches!(err, PersistenceError::StoreUnavailable(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    struct FlakyStore {
        fail_times: AtomicU32,
        committed: Mutex<Vec<PersistedChunk>>,
    }

    #[async_trait]
    impl MessageStore for FlakyStore {
        async fn append_chunk(
            &self,
            thread_id: &str,
            message_id: &str,
            seq: u64,
            kind: &str,
            content: &serde_json::Value,
            finalized: bool,
            created_at: &str,
        ) -> Result<AppendOutcome, PersistenceError> {
            if self.fail_times.load(Ordering::SeqCst) > 0 {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
                return Err(PersistenceError::StoreUnavailable("flaky".into()));
            }
            self.committed.lock().await.push(PersistedChunk {
                thread_id: thread_id.into(),
                message_id: message_id.into(),
                seq,
                kind: kind.into(),
                content: content.clone(),
                finalized,
                created_at: created_at.into(),
            });
            Ok(AppendOutcome::Appended)
        }

        async fn read_full_content(
            &self,
            _thread_id: &str,
            _message_id: &str,
        ) -> Result<(String, bool), PersistenceError> {
            Ok((String::new(), false))
        }
    }

    fn item() -> PersistedChunk {
        PersistedChunk {
            thread_id: "t".into(),
            message_id: "m".into(),
            seq: 1,
            kind: "text".into(),
            content: json!({"delta": "hi"}),
            finalized: false,
            created_at: "2026-01-01T00:00:00Z".into(),
        }
    }

    #[tokio::test]
    async fn succeeds_after_a_couple_of_transient_failures_within_budget() {
        let store: Arc<dyn MessageStore> = Arc::new(FlakyStore {
            fail_times: AtomicU32::new(2),
            committed: Mutex::new(Vec::new()),
        });
        let dir = tempfile::tempdir().unwrap();
        let overflow = Arc::new(OverflowLog::open(dir.path()).unwrap());
        let metrics = Arc::new(Metrics::default());
        let config = RetryConfig {
            max_attempts: 5,
            backoff_base_ms: 1,
            ..Default::default()
        };

        write_with_retry(&item(), &store, &overflow, &config, &metrics).await;

        assert_eq!(metrics.committed(), 1);
        assert_eq!(overflow.segments().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn exhausting_retries_spills_to_overflow_instead_of_losing_the_bundle() {
        let store: Arc<dyn MessageStore> = Arc::new(FlakyStore {
            fail_times: AtomicU32::new(100),
            committed: Mutex::new(Vec::new()),
        });
        let dir = tempfile::tempdir().unwrap();
        let overflow = Arc::new(OverflowLog::open(dir.path()).unwrap());
        let metrics = Arc::new(Metrics::default());
        let config = RetryConfig {
            max_attempts: 2,
            backoff_base_ms: 1,
            ..Default::default()
        };

        write_with_retry(&item(), &store, &overflow, &config, &metrics).await;

        assert_eq!(metrics.overflowed(), 1);
        let segments = overflow.segments().unwrap();
        assert_eq!(segments.len(), 1);
        let records = overflow.read_segment(&segments[0]).unwrap();
        assert_eq!(records.len(), 1);
    }
}
