//! Persistence Pipeline: durably commits bundled `DomainChunk`s to a
//! `MessageStore` without coupling client latency to store latency
//! (spec.md §4.7). A bounded primary queue feeds a worker pool; when the
//! queue is saturated, producers spill straight to an on-disk overflow
//! log that a background replayer drains back into the queue once
//! headroom returns, and that is always fully replayed on startup before
//! new work is accepted.

pub mod metrics;
pub mod overflow;
pub mod pipeline;
pub mod queue;
pub mod store;
pub mod worker;

pub use metrics::{Metrics, MetricsSnapshot};
pub use overflow::OverflowLog;
pub use pipeline::{Pipeline, PipelineConfig, SessionSink};
pub use queue::PrimaryQueue;
pub use store::{AppendOutcome, MessageStore, SqliteStore};
pub use worker::RetryConfig;
