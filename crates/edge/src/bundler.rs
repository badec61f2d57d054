//! Token Bundler: folds a fast stream of `Text`/`Thinking` deltas into two
//! independently-paced accumulators — one for the client sink, one for the
//! persistence sink — each flushed on its own size/latency thresholds.
//! Every non-text chunk (`ToolUse`, `ToolResult`, `Usage`, `End`, `Error`)
//! forces an immediate flush of both sides before it is itself forwarded,
//! so neither side ever reorders a tool event relative to the text that
//! surrounds it. Grounded in the `flush_buffers!`/`BATCH_INTERVAL`/
//! `BATCH_CHARS` pattern used for streaming responses upstream of this
//! crate's provider adapters.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use panelstream_core::{estimate_token_count, BundlerConfig, DomainChunk};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};

use crate::ChunkStream;

/// The client-visible assistant text accumulated over the whole session so
/// far, independent of how it was chopped into bundles. The Edge Session
/// reads this when it emits the terminal SSE event so the client can
/// reconcile against `fullContent` rather than re-summing bundles itself
/// (spec.md §4.5, §9 "double-bookkeeping").
pub type FullContentHandle = Arc<Mutex<String>>;

pub struct TokenBundler {
    config: BundlerConfig,
}

impl TokenBundler {
    pub fn new(config: BundlerConfig) -> Self {
        TokenBundler { config }
    }

    /// Spawns the bundling task and returns the bounded client stream (lossy
    /// under backpressure, on intermediate text bundles only), the
    /// unbounded persistence stream (never drops), and a handle to the
    /// running total of client-visible text.
    pub fn spawn(&self, input: ChunkStream) -> (ChunkStream, ChunkStream, FullContentHandle) {
        let (client_tx, client_rx) = mpsc::channel(self.config.client_channel_capacity.max(1));
        let (persist_tx, persist_rx) = mpsc::unbounded_channel();
        let config = self.config;
        let full_content: FullContentHandle = Arc::new(Mutex::new(String::new()));

        tokio::spawn(run(input, config, client_tx, persist_tx, full_content.clone()));

        (
            Box::pin(ReceiverStream::new(client_rx)),
            Box::pin(UnboundedReceiverStream::new(persist_rx)),
            full_content,
        )
    }
}

struct Accumulator {
    text: String,
    thinking: String,
    token_count: usize,
    last_flush: Instant,
    max_tokens: usize,
    max_bytes: usize,
    max_latency: Duration,
    first_seq: Option<u64>,
}

impl Accumulator {
    fn new(max_tokens: usize, max_bytes: usize, max_latency_ms: u64) -> Self {
        Accumulator {
            text: String::new(),
            thinking: String::new(),
            token_count: 0,
            last_flush: Instant::now(),
            max_tokens,
            max_bytes,
            max_latency: Duration::from_millis(max_latency_ms),
            first_seq: None,
        }
    }

    fn push_text(&mut self, seq: u64, delta: &str) {
        self.first_seq.get_or_insert(seq);
        self.token_count += estimate_token_count(delta);
        self.text.push_str(delta);
    }

    fn push_thinking(&mut self, seq: u64, delta: &str) {
        self.first_seq.get_or_insert(seq);
        self.token_count += estimate_token_count(delta);
        self.thinking.push_str(delta);
    }

    fn is_empty(&self) -> bool {
        self.text.is_empty() && self.thinking.is_empty()
    }

    fn byte_count(&self) -> usize {
        self.text.len() + self.thinking.len()
    }

    /// True once any of `max_tokens`/`max_bytes`/`max_latency` is reached,
    /// matching the bundler contract's "flush on whichever threshold hits
    /// first" rule (spec.md §4.5, tested by T4).
    fn over_threshold(&self) -> bool {
        self.token_count >= self.max_tokens
            || self.byte_count() >= self.max_bytes
            || self.last_flush.elapsed() >= self.max_latency
    }

    /// Drains both buffers into at most two `DomainChunk`s, using `seq` as
    /// the outgoing sequence number for the first of them (matching
    /// spec.md's "seq is taken from the first buffered chunk" rule) and
    /// resetting the flush timer.
    fn drain(&mut self, seq: &mut u64) -> Vec<DomainChunk> {
        let mut out = Vec::new();
        if !self.text.is_empty() {
            out.push(DomainChunk::Text {
                seq: *seq,
                delta: std::mem::take(&mut self.text),
            });
            *seq += 1;
        }
        if !self.thinking.is_empty() {
            out.push(DomainChunk::Thinking {
                seq: *seq,
                delta: std::mem::take(&mut self.thinking),
            });
            *seq += 1;
        }
        self.last_flush = Instant::now();
        self.first_seq = None;
        self.token_count = 0;
        out
    }
}

async fn run(
    mut input: ChunkStream,
    config: BundlerConfig,
    client_tx: mpsc::Sender<DomainChunk>,
    persist_tx: mpsc::UnboundedSender<DomainChunk>,
    full_content: FullContentHandle,
) {
    let mut client_acc = Accumulator::new(
        config.client_max_tokens,
        config.client_max_bytes,
        config.client_max_latency_ms,
    );
    let mut persist_acc = Accumulator::new(
        config.persistence_max_tokens,
        config.persistence_max_bytes,
        config.persistence_max_latency_ms,
    );
    let mut client_seq = 0u64;
    let mut persist_seq = 0u64;

    while let Some(chunk) = input.next().await {
        if chunk.forces_flush() {
            flush(&mut client_acc, &mut client_seq, &client_tx).await;
            flush_unbounded(&mut persist_acc, &mut persist_seq, &persist_tx);

            let client_chunk = chunk.clone().with_seq(client_seq);
            client_seq += 1;
            let persist_chunk = chunk.with_seq(persist_seq);
            persist_seq += 1;

            // persistence is unbounded and must never wait on the client;
            // hand it off first so a stalled client can't delay durable
            // storage of a forced-flush chunk (spec.md §4.5).
            let _ = persist_tx.send(persist_chunk);
            let _ = client_tx.send(client_chunk).await;

            continue;
        }

        match &chunk {
            DomainChunk::Text { seq, delta } => {
                client_acc.push_text(*seq, delta);
                persist_acc.push_text(*seq, delta);
                full_content.lock().push_str(delta);
            }
            DomainChunk::Thinking { seq, delta } => {
                client_acc.push_thinking(*seq, delta);
                persist_acc.push_thinking(*seq, delta);
            }
            _ => unreachable!("non-text kinds are handled by forces_flush above"),
        }

        if client_acc.over_threshold() {
            flush(&mut client_acc, &mut client_seq, &client_tx).await;
        }
        if persist_acc.over_threshold() {
            flush_unbounded(&mut persist_acc, &mut persist_seq, &persist_tx);
        }
    }

    // Input ended without an explicit terminal chunk (e.g. upstream dropped);
    // flush whatever remains so no buffered text is silently lost.
    flush(&mut client_acc, &mut client_seq, &client_tx).await;
    flush_unbounded(&mut persist_acc, &mut persist_seq, &persist_tx);
}

async fn flush(acc: &mut Accumulator, seq: &mut u64, tx: &mpsc::Sender<DomainChunk>) {
    if acc.is_empty() {
        return;
    }
    for chunk in acc.drain(seq) {
        // Intermediate text/thinking bundles are allowed to drop under
        // backpressure; try_send never blocks the bundler task.
        let _ = tx.try_send(chunk);
    }
}

fn flush_unbounded(acc: &mut Accumulator, seq: &mut u64, tx: &mpsc::UnboundedSender<DomainChunk>) {
    if acc.is_empty() {
        return;
    }
    for chunk in acc.drain(seq) {
        let _ = tx.send(chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use panelstream_core::StopReason;
    use tokio::sync::mpsc as tmpsc;
    use tokio_stream::wrappers::ReceiverStream as TReceiverStream;

    fn make_input(chunks: Vec<DomainChunk>) -> ChunkStream {
        let (tx, rx) = tmpsc::channel(chunks.len().max(1));
        tokio::spawn(async move {
            for c in chunks {
                let _ = tx.send(c).await;
            }
        });
        Box::pin(TReceiverStream::new(rx))
    }

    #[tokio::test]
    async fn small_text_deltas_are_folded_into_one_bundle_on_terminal_flush() {
        let input = make_input(vec![
            DomainChunk::Text {
                seq: 1,
                delta: "he".into(),
            },
            DomainChunk::Text {
                seq: 2,
                delta: "llo".into(),
            },
            DomainChunk::End {
                seq: 3,
                reason: StopReason::Stop,
            },
        ]);
        let config = BundlerConfig {
            client_max_tokens: 1000,
            client_max_bytes: 1000,
            client_max_latency_ms: 60_000,
            persistence_max_tokens: 1000,
            persistence_max_bytes: 1000,
            persistence_max_latency_ms: 60_000,
            client_channel_capacity: 16,
        };
        let bundler = TokenBundler::new(config);
        let (mut client, mut persist, full_content) = bundler.spawn(input);

        let mut client_chunks = Vec::new();
        while let Some(c) = client.next().await {
            client_chunks.push(c);
        }
        let mut persist_chunks = Vec::new();
        while let Some(c) = persist.next().await {
            persist_chunks.push(c);
        }

        assert_eq!(client_chunks.len(), 2); // folded text + terminal End
        match &client_chunks[0] {
            DomainChunk::Text { delta, .. } => assert_eq!(delta, "hello"),
            other => panic!("expected folded Text, got {other:?}"),
        }
        assert!(client_chunks[1].is_terminal());
        assert_eq!(persist_chunks.len(), 2);
        assert_eq!(full_content.lock().as_str(), "hello");
    }

    #[tokio::test]
    async fn token_threshold_splits_bundles_independent_of_byte_threshold() {
        // "Hello world" is 2 words; a max_tokens of 2 should flush before
        // the trailing "!" delta arrives, matching spec.md §6 scenario 2.
        let input = make_input(vec![
            DomainChunk::Text {
                seq: 1,
                delta: "Hello".into(),
            },
            DomainChunk::Text {
                seq: 2,
                delta: " world".into(),
            },
            DomainChunk::Text {
                seq: 3,
                delta: "!".into(),
            },
            DomainChunk::End {
                seq: 4,
                reason: StopReason::Stop,
            },
        ]);
        let config = BundlerConfig {
            client_max_tokens: 2,
            client_max_bytes: 1_000_000,
            client_max_latency_ms: 60_000,
            persistence_max_tokens: 1_000_000,
            persistence_max_bytes: 1_000_000,
            persistence_max_latency_ms: 60_000,
            client_channel_capacity: 16,
        };
        let bundler = TokenBundler::new(config);
        let (mut client, _persist, _full_content) = bundler.spawn(input);

        let first = client.next().await.unwrap();
        match first {
            DomainChunk::Text { delta, .. } => assert_eq!(delta, "Hello world"),
            other => panic!("expected folded Text, got {other:?}"),
        }
        let second = client.next().await.unwrap();
        match second {
            DomainChunk::Text { delta, .. } => assert_eq!(delta, "!"),
            other => panic!("expected trailing Text, got {other:?}"),
        }
        let third = client.next().await.unwrap();
        assert!(third.is_terminal());
    }

    #[tokio::test]
    async fn tool_use_forces_a_flush_before_it_is_forwarded() {
        let input = make_input(vec![
            DomainChunk::Text {
                seq: 1,
                delta: "partial".into(),
            },
            DomainChunk::ToolUse {
                seq: 2,
                call: panelstream_core::ToolCall {
                    call_id: "c1".into(),
                    name: "t".into(),
                    arguments: serde_json::json!({}),
                },
            },
            DomainChunk::End {
                seq: 3,
                reason: StopReason::ToolUse,
            },
        ]);
        let config = BundlerConfig {
            client_max_tokens: 1_000_000,
            client_max_bytes: 1_000_000,
            client_max_latency_ms: 60_000,
            persistence_max_tokens: 1_000_000,
            persistence_max_bytes: 1_000_000,
            persistence_max_latency_ms: 60_000,
            client_channel_capacity: 16,
        };
        let bundler = TokenBundler::new(config);
        let (mut client, _persist, _full_content) = bundler.spawn(input);

        let first = client.next().await.unwrap();
        assert!(matches!(first, DomainChunk::Text { .. }));
        let second = client.next().await.unwrap();
        assert!(matches!(second, DomainChunk::ToolUse { .. }));
    }
}
