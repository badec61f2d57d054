//! Top-level wiring: spawns the worker pool and the overflow replayer, and
//! hands out `SessionSink`s that Edge Sessions submit bundles through.
//! Construction order matters — spec.md §4.7's crash-recovery invariant
//! requires the overflow log to be replayed before new work is accepted,
//! so `Pipeline::start` runs one full replay pass synchronously before
//! spawning the steady-state workers and the periodic replayer task.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use panelstream_core::{DomainChunk, PersistedChunk};
use panelstream_edge::session::PersistenceSink;

use crate::metrics::{Metrics, MetricsSnapshot};
use crate::overflow::OverflowLog;
use crate::queue::{PrimaryQueue, TryEnqueueError};
use crate::store::MessageStore;
use crate::worker::{run_worker, RetryConfig};

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_replay_interval_ms() -> u64 {
    DEFAULT_REPLAY_INTERVAL_MS
}

fn default_overflow_dir() -> PathBuf {
    PathBuf::from("./overflow")
}

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_REPLAY_INTERVAL_MS: u64 = 2_000;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_overflow_dir")]
    pub overflow_dir: PathBuf,
    pub retry: RetryConfig,
    #[serde(default = "default_replay_interval_ms")]
    pub replay_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            overflow_dir: default_overflow_dir(),
            retry: RetryConfig::default(),
            replay_interval_ms: DEFAULT_REPLAY_INTERVAL_MS,
        }
    }
}

/// A running pipeline: owns the primary queue and the handles needed to
/// build a `SessionSink` per Edge Session. Dropping every clone of the
/// queue closes it, which drains and stops the worker tasks.
#[derive(Clone)]
pub struct Pipeline {
    queue: PrimaryQueue,
    overflow: Arc<OverflowLog>,
    metrics: Arc<Metrics>,
}

impl Pipeline {
    /// Replays any overflow left behind by a previous process, then starts
    /// the worker pool and the ongoing background replayer.
    pub async fn start(
        store: Arc<dyn MessageStore>,
        config: PipelineConfig,
    ) -> Result<Self, std::io::Error> {
        let overflow = Arc::new(OverflowLog::open(&config.overflow_dir)?);
        let queue = PrimaryQueue::new(config.queue_capacity);
        let metrics = Arc::new(Metrics::default());

        replay_all_segments(&overflow, &queue, &metrics).await;

        for _ in 0..config.retry.worker_count.max(1) {
            tokio::spawn(run_worker(
                queue.clone(),
                store.clone(),
                overflow.clone(),
                config.retry,
                metrics.clone(),
            ));
        }

        tokio::spawn(replay_loop(
            queue.clone(),
            overflow.clone(),
            metrics.clone(),
            Duration::from_millis(config.replay_interval_ms),
        ));

        Ok(Pipeline {
            queue,
            overflow,
            metrics,
        })
    }

    /// A sink scoped to one `(thread_id, message_id)`, handed to one Edge
    /// Session. `submit` never blocks the caller: a full primary queue
    /// spills straight to the overflow log instead.
    pub fn sink_for(&self, thread_id: impl Into<String>, message_id: impl Into<String>) -> SessionSink {
        SessionSink {
            thread_id: thread_id.into(),
            message_id: message_id.into(),
            queue: self.queue.clone(),
            overflow: self.overflow.clone(),
            metrics: self.metrics.clone(),
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

/// Implements the Edge Session's `PersistenceSink` contract by enqueueing
/// onto the shared primary queue, stamping in the `(thread_id, message_id)`
/// this session owns.
pub struct SessionSink {
    thread_id: String,
    message_id: String,
    queue: PrimaryQueue,
    overflow: Arc<OverflowLog>,
    metrics: Arc<Metrics>,
}

#[async_trait]
impl PersistenceSink for SessionSink {
    async fn submit(&self, chunk: DomainChunk) {
        let row = PersistedChunk::from_domain_chunk(
            self.thread_id.as_str(),
            self.message_id.as_str(),
            &chunk,
        );
        match self.queue.try_enqueue(row) {
            Ok(()) => {}
            Err(TryEnqueueError::Full(row)) | Err(TryEnqueueError::Closed(row)) => {
                if let Err(err) = self.overflow.append(&row) {
                    tracing::error!(
                        thread_id = %self.thread_id,
                        message_id = %self.message_id,
                        error = %err,
                        "primary queue unavailable and overflow append failed",
                    );
                    self.metrics.record_permanent_failure();
                } else {
                    self.metrics.record_overflowed();
                }
            }
        }
    }
}

async fn replay_all_segments(overflow: &OverflowLog, queue: &PrimaryQueue, metrics: &Metrics) {
    let Ok(segments) = overflow.segments() else {
        return;
    };
    for path in segments {
        replay_segment(overflow, &path, queue, metrics).await;
    }
}

async fn replay_segment(
    overflow: &OverflowLog,
    path: &std::path::Path,
    queue: &PrimaryQueue,
    metrics: &Metrics,
) {
    let Ok(records) = overflow.read_segment(path) else {
        return;
    };
    let mut all_replayed = true;
    for (outcome, record) in records {
        match (outcome, record) {
            (crate::overflow::ReplayOutcome::Record, Some(record)) => {
                if queue.enqueue(record).await.is_ok() {
                    metrics.record_replayed();
                } else {
                    all_replayed = false;
                }
            }
            _ => {
                // corrupt record: already counted by the caller via logs;
                // treated as consumed so it doesn't block the rest of the
                // segment from being retired.
            }
        }
    }
    if all_replayed {
        overflow.remove_segment(path);
    }
}

/// Periodically re-attempts replaying whatever overflow segments remain,
/// so entries spilled during a primary-queue saturation spike eventually
/// make it into the store once headroom returns — spec.md §4.7's
/// "background replayer re-enqueues overflow entries when the primary
/// queue has headroom."
async fn replay_loop(
    queue: PrimaryQueue,
    overflow: Arc<OverflowLog>,
    metrics: Arc<Metrics>,
    interval: Duration,
) {
    loop {
        tokio::time::sleep(interval).await;
        if !queue.has_headroom() {
            continue;
        }
        replay_all_segments(&overflow, &queue, &metrics).await;
    }
}
