//! Fair Merger: combines several panelists' chunk streams into one, using
//! weighted round-robin scheduling over whichever panelists currently have
//! a chunk ready. Readiness score is `priority * (1 - recent_share)`,
//! ties broken by longest-idle then lexicographic `panelist_id`. A
//! panelist mid-way through a `tool_use`/`tool_result` pair is drained for
//! both chunks before control passes elsewhere, so the adjacency invariant
//! from the Domain Stream Orchestrator survives merging. This stage has no
//! direct precedent in a single upstream file; it is original, built in the
//! idiom of this workspace's other channel/fanout code (bounded mpsc
//! output, `parking_lot::Mutex` for the small shared attribution table).

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use futures::stream::Peekable;
use futures::{FutureExt, StreamExt};
use panelstream_core::{Attribution, DomainChunk, StopReason};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::ChunkStream;

pub const DEFAULT_STARVATION_BOUND: usize = 8;
const MERGED_CHANNEL_CAPACITY: usize = 64;

/// Maps a merged stream's `seq` back to which panelist produced it and what
/// that panelist's own `seq` was, for callers that need to reconstruct
/// per-panelist ordering after the fact (e.g. persistence replay tooling).
#[derive(Default)]
pub struct AttributionTable {
    entries: Mutex<HashMap<u64, Attribution>>,
}

impl AttributionTable {
    pub fn get(&self, merged_seq: u64) -> Option<Attribution> {
        self.entries.lock().get(&merged_seq).cloned()
    }

    fn insert(&self, merged_seq: u64, attribution: Attribution) {
        self.entries.lock().insert(merged_seq, attribution);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

struct Source {
    id: String,
    priority: f64,
    stream: Peekable<ChunkStream>,
    terminated: bool,
    emitted: u64,
    turns_idle: usize,
    /// Set once this source has emitted a `ToolUse` whose matching
    /// `ToolResult` has not yet been drained — forces continued draining
    /// of this source ahead of weighted selection.
    mid_tool_call: bool,
}

pub struct FairMerger {
    sources: Vec<Source>,
    starvation_bound: usize,
}

impl FairMerger {
    pub fn new(panelists: Vec<(String, f64, ChunkStream)>) -> Self {
        FairMerger::with_starvation_bound(panelists, DEFAULT_STARVATION_BOUND)
    }

    pub fn with_starvation_bound(
        panelists: Vec<(String, f64, ChunkStream)>,
        starvation_bound: usize,
    ) -> Self {
        let sources = panelists
            .into_iter()
            .map(|(id, priority, stream)| Source {
                id,
                priority,
                stream: stream.peekable(),
                terminated: false,
                emitted: 0,
                turns_idle: 0,
                mid_tool_call: false,
            })
            .collect();
        FairMerger {
            sources,
            starvation_bound,
        }
    }

    pub fn merge(self) -> (ChunkStream, Arc<AttributionTable>) {
        let table = Arc::new(AttributionTable::default());
        let (tx, rx) = mpsc::channel(MERGED_CHANNEL_CAPACITY);
        let table_clone = table.clone();
        tokio::spawn(run(self.sources, self.starvation_bound, tx, table_clone));
        (Box::pin(ReceiverStream::new(rx)), table)
    }
}

fn score(source: &Source, total_emitted: u64) -> f64 {
    let recent_share = if total_emitted == 0 {
        0.0
    } else {
        source.emitted as f64 / total_emitted as f64
    };
    source.priority * (1.0 - recent_share)
}

/// Rolls up every panelist's terminal reason into the single reason the
/// synthesized `End` reports, worst-first: an `Error` on any panelist
/// outranks everything else, then `Cancelled` (kept in the ranking for a
/// panelist whose own stream legitimately ends with `StopReason::Cancelled`
/// rather than a terminal `error` chunk — adapter-level cancellation no
/// longer takes this path, see `panelstream-adapters`), then `ToolUse` (a
/// panelist still waiting on tools is the most actionable non-error state),
/// then `Length`, with `Stop` only when every panelist stopped cleanly.
fn aggregate_reason(reasons: &[StopReason]) -> StopReason {
    let rank = |r: &StopReason| match r {
        StopReason::Error => 0,
        StopReason::Cancelled => 1,
        StopReason::ToolUse => 2,
        StopReason::Length => 3,
        StopReason::Stop => 4,
    };
    reasons
        .iter()
        .min_by_key(|r| rank(r))
        .copied()
        .unwrap_or(StopReason::Stop)
}

async fn run(
    mut sources: Vec<Source>,
    starvation_bound: usize,
    tx: mpsc::Sender<DomainChunk>,
    table: Arc<AttributionTable>,
) {
    let multi_panelist = sources.len() > 1;
    let mut total_emitted: u64 = 0;
    let mut merged_seq: u64 = 0;
    let mut terminal_reasons: Vec<StopReason> = Vec::new();

    loop {
        if sources.iter().all(|s| s.terminated) {
            break;
        }

        let Some(idx) = select_index(&mut sources, starvation_bound, total_emitted).await else {
            break;
        };

        let item = sources[idx].stream.next().await;
        let Some(chunk) = item else {
            sources[idx].terminated = true;
            sources[idx].mid_tool_call = false;
            continue;
        };

        sources[idx].mid_tool_call = matches!(chunk, DomainChunk::ToolUse { .. });
        let is_terminal = chunk.is_terminal();
        let original_seq = chunk.seq();

        let outgoing_seq = merged_seq;
        merged_seq += 1;
        total_emitted += 1;
        sources[idx].emitted += 1;
        for (i, s) in sources.iter_mut().enumerate() {
            s.turns_idle = if i == idx { 0 } else { s.turns_idle + 1 };
        }

        if multi_panelist {
            table.insert(
                outgoing_seq,
                Attribution {
                    panelist_id: sources[idx].id.clone(),
                    original_seq,
                },
            );
        }

        if is_terminal {
            sources[idx].terminated = true;
            sources[idx].mid_tool_call = false;

            // A lone panelist's own terminal chunk *is* the stream's
            // terminal chunk; forward it as-is and stop, with no
            // synthesized `End` on top of it.
            if !multi_panelist {
                let _ = tx.send(chunk.with_seq(outgoing_seq)).await;
                return;
            }

            terminal_reasons.push(match &chunk {
                DomainChunk::End { reason, .. } => *reason,
                DomainChunk::Error { .. } => StopReason::Error,
                _ => unreachable!("is_terminal only true for End/Error"),
            });
            if tx.send(chunk.with_seq(outgoing_seq)).await.is_err() {
                return;
            }
            continue;
        }

        if tx.send(chunk.with_seq(outgoing_seq)).await.is_err() {
            return;
        }
    }

    if multi_panelist {
        let _ = tx
            .send(DomainChunk::End {
                seq: merged_seq,
                reason: aggregate_reason(&terminal_reasons),
            })
            .await;
    }
}

/// Picks which source to draw from next: if any source is mid-tool-call it
/// is drained unconditionally; otherwise the highest-scoring source with an
/// immediately-available chunk wins, with the starvation bound forcing the
/// longest-waiting ready source through regardless of score. If nothing is
/// immediately ready, waits for the first source to produce anything.
async fn select_index(
    sources: &mut [Source],
    starvation_bound: usize,
    total_emitted: u64,
) -> Option<usize> {
    if let Some(idx) = sources
        .iter()
        .position(|s| !s.terminated && s.mid_tool_call)
    {
        return Some(idx);
    }

    let mut ready: Vec<usize> = Vec::new();
    for i in 0..sources.len() {
        if sources[i].terminated {
            continue;
        }
        let peeked = Pin::new(&mut sources[i].stream).peek().now_or_never();
        if let Some(Some(_)) = peeked {
            ready.push(i);
        }
    }

    if ready.is_empty() {
        let mut futs = Vec::new();
        for (i, s) in sources.iter_mut().enumerate() {
            if s.terminated {
                continue;
            }
            futs.push(Box::pin(
                async move { (i, Pin::new(&mut s.stream).peek().await.is_some()) },
            ));
        }
        if futs.is_empty() {
            return None;
        }
        let ((i, _has_item), _, _) = futures::future::select_all(futs).await;
        return Some(i);
    }

    if let Some(forced) = ready
        .iter()
        .copied()
        .find(|&i| sources[i].turns_idle >= starvation_bound)
    {
        return Some(forced);
    }

    ready.sort_by(|&a, &b| {
        let sa = score(&sources[a], total_emitted);
        let sb = score(&sources[b], total_emitted);
        sb.partial_cmp(&sa)
            .unwrap()
            .then_with(|| sources[b].turns_idle.cmp(&sources[a].turns_idle))
            .then_with(|| sources[a].id.cmp(&sources[b].id))
    });
    ready.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use panelstream_core::ToolCall;
    use tokio::sync::mpsc as tmpsc;
    use tokio_stream::wrappers::ReceiverStream as TReceiverStream;

    fn source_stream(chunks: Vec<DomainChunk>) -> ChunkStream {
        let (tx, rx) = tmpsc::channel(chunks.len().max(1));
        tokio::spawn(async move {
            for c in chunks {
                let _ = tx.send(c).await;
            }
        });
        Box::pin(TReceiverStream::new(rx))
    }

    #[tokio::test]
    async fn single_panelist_passes_through_with_no_attribution() {
        let a = source_stream(vec![
            DomainChunk::Text {
                seq: 1,
                delta: "hi".into(),
            },
            DomainChunk::End {
                seq: 2,
                reason: StopReason::Stop,
            },
        ]);
        let merger = FairMerger::new(vec![("p1".to_string(), 1.0, a)]);
        let (mut merged, table) = merger.merge();
        let mut collected = Vec::new();
        while let Some(c) = merged.next().await {
            collected.push(c);
        }
        assert_eq!(collected.len(), 2);
        assert!(collected.last().unwrap().is_terminal());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn forwards_every_panelist_terminal_then_one_synthesized_end() {
        let a = source_stream(vec![DomainChunk::End {
            seq: 1,
            reason: StopReason::Stop,
        }]);
        let b = source_stream(vec![DomainChunk::End {
            seq: 1,
            reason: StopReason::Stop,
        }]);
        let merger = FairMerger::new(vec![
            ("a".to_string(), 1.0, a),
            ("b".to_string(), 1.0, b),
        ]);
        let (mut merged, _table) = merger.merge();
        let mut collected = Vec::new();
        while let Some(c) = merged.next().await {
            collected.push(c);
        }
        // both panelists' own `End`s, plus the synthesized aggregate `End`.
        assert_eq!(collected.len(), 3);
        assert!(collected.iter().all(|c| c.is_terminal()));
        assert_eq!(collected.last().unwrap().seq(), 2);
    }

    #[tokio::test]
    async fn a_panelist_error_terminal_is_forwarded_and_wins_the_aggregate_reason() {
        let a = source_stream(vec![DomainChunk::Error {
            seq: 1,
            kind: panelstream_core::ProviderErrorKind::Unknown,
            message: "boom".into(),
            retryable: false,
        }]);
        let b = source_stream(vec![DomainChunk::End {
            seq: 1,
            reason: StopReason::Stop,
        }]);
        let merger = FairMerger::new(vec![
            ("a".to_string(), 1.0, a),
            ("b".to_string(), 1.0, b),
        ]);
        let (mut merged, _table) = merger.merge();
        let mut collected = Vec::new();
        while let Some(c) = merged.next().await {
            collected.push(c);
        }
        assert!(collected
            .iter()
            .any(|c| matches!(c, DomainChunk::Error { message, .. } if message == "boom")));
        match collected.last().unwrap() {
            DomainChunk::End { reason, .. } => assert_eq!(*reason, StopReason::Error),
            other => panic!("expected synthesized End, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn records_attribution_for_every_merged_chunk_with_multiple_panelists() {
        let a = source_stream(vec![
            DomainChunk::Text {
                seq: 5,
                delta: "from a".into(),
            },
            DomainChunk::End {
                seq: 6,
                reason: StopReason::Stop,
            },
        ]);
        let b = source_stream(vec![DomainChunk::End {
            seq: 1,
            reason: StopReason::Stop,
        }]);
        let merger = FairMerger::new(vec![
            ("a".to_string(), 1.0, a),
            ("b".to_string(), 1.0, b),
        ]);
        let (mut merged, table) = merger.merge();
        let mut collected = Vec::new();
        while let Some(c) = merged.next().await {
            collected.push(c);
        }
        // every chunk traceable to a single panelist carries attribution;
        // only the final synthesized `End` (no single originating panelist)
        // does not.
        for chunk in &collected[..collected.len() - 1] {
            assert!(table.get(chunk.seq()).is_some());
        }
    }

    #[tokio::test]
    async fn drains_tool_use_and_tool_result_from_the_same_panelist_consecutively() {
        let a = source_stream(vec![
            DomainChunk::ToolUse {
                seq: 1,
                call: ToolCall {
                    call_id: "c1".into(),
                    name: "t".into(),
                    arguments: serde_json::json!({}),
                },
            },
            DomainChunk::ToolResult {
                seq: 2,
                call_id: "c1".into(),
                result: panelstream_core::ToolResult::ok(serde_json::json!(null)),
            },
            DomainChunk::End {
                seq: 3,
                reason: StopReason::Stop,
            },
        ]);
        let b = source_stream(vec![
            DomainChunk::Text {
                seq: 1,
                delta: "b".into(),
            },
            DomainChunk::End {
                seq: 2,
                reason: StopReason::Stop,
            },
        ]);
        let merger = FairMerger::new(vec![
            ("a".to_string(), 1.0, a),
            ("b".to_string(), 1.0, b),
        ]);
        let (mut merged, _table) = merger.merge();
        let first = merged.next().await.unwrap();
        assert!(matches!(first, DomainChunk::ToolUse { .. }));
        let second = merged.next().await.unwrap();
        assert!(matches!(second, DomainChunk::ToolResult { .. }));
    }
}
