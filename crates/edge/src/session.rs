//! Edge Session: the per-client lifecycle that wires a `StreamRequest`
//! through the orchestrator(s), the Token Bundler, and out to a client sink
//! and a persistence sink, with idle-keepalive heartbeats, a total
//! wall-clock timeout, and cancellation propagation on client disconnect.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use panelstream_adapters::CancelHandle;
use panelstream_core::{
    BundlerConfig, DomainChunk, ProviderErrorKind, RequestError, StreamRequest, Usage,
};
use panelstream_orchestrator::{Orchestrator, OrchestratorRegistry};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::merger::{AttributionTable, FairMerger};
use crate::bundler::TokenBundler;
use crate::sse::{PanelistAttribution, SseEvent};
use crate::ChunkStream;

/// Resolves which panelist a merged chunk came from: for a single panelist
/// every chunk is trivially "from" it (no Fair Merger in the path, so no
/// `AttributionTable` either); for a roundtable, chunks are looked up by
/// merged `seq` in the table the merger populated, and the synthesized
/// aggregate `End` (absent from the table) carries no attribution.
enum AttributionSource {
    Single(PanelistAttribution),
    Merged {
        table: Arc<AttributionTable>,
        by_panelist: HashMap<String, PanelistAttribution>,
    },
}

impl AttributionSource {
    fn resolve(&self, seq: u64) -> Option<PanelistAttribution> {
        match self {
            AttributionSource::Single(attribution) => Some(attribution.clone()),
            AttributionSource::Merged { table, by_panelist } => {
                let attribution = table.get(seq)?;
                by_panelist.get(&attribution.panelist_id).cloned()
            }
        }
    }
}

fn attribution_for(panelist: &panelstream_core::Panelist) -> PanelistAttribution {
    PanelistAttribution {
        panelist_id: panelist.panelist_id.clone(),
        display_name: panelist.display_name.clone(),
        provider_id: panelist.provider.clone(),
        model_id: panelist.model.clone(),
    }
}

fn default_heartbeat_interval_ms() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_MS
}

fn default_total_timeout_ms() -> u64 {
    DEFAULT_TOTAL_TIMEOUT_MS
}

fn default_idle_timeout_ms() -> u64 {
    DEFAULT_IDLE_TIMEOUT_MS
}

pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 15_000;
pub const DEFAULT_TOTAL_TIMEOUT_MS: u64 = 10 * 60 * 1000;
/// `stream.idleTimeout`: killed if no upstream (bundled) chunk arrives
/// within this window, distinct from the heartbeat (which only keeps the
/// client connection alive) and from `total_timeout_ms` (an absolute
/// per-request ceiling regardless of activity).
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct EdgeSessionConfig {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_total_timeout_ms")]
    pub total_timeout_ms: u64,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    pub bundler: BundlerConfig,
}

impl Default for EdgeSessionConfig {
    fn default() -> Self {
        EdgeSessionConfig {
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            total_timeout_ms: DEFAULT_TOTAL_TIMEOUT_MS,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            bundler: BundlerConfig::default(),
        }
    }
}

/// Where bundled, lossless chunks headed for durable storage are sent. The
/// Persistence Pipeline crate implements this for its submission handle;
/// Edge Session has no dependency on how persistence actually works.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn submit(&self, chunk: DomainChunk);
}

/// A handle to a running session: lets the caller cancel it early (e.g. on
/// client disconnect) and await its completion.
pub struct SessionHandle {
    pub session_id: String,
    cancel: CancelHandle,
    join: tokio::task::JoinHandle<()>,
}

impl SessionHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn join(self) {
        let _ = self.join.await;
    }
}

pub struct EdgeSession;

impl EdgeSession {
    /// Opens one domain stream per panelist (dispatching each to the
    /// `Orchestrator` registered for its provider), merges them with the
    /// Fair Merger when there is more than one, and wires the combined
    /// stream through the Token Bundler into both sinks.
    #[tracing::instrument(skip(registry, client_tx, persistence, config), fields(thread_id = %request.thread_id))]
    pub async fn start(
        request: StreamRequest,
        registry: Arc<OrchestratorRegistry>,
        client_tx: mpsc::Sender<SseEvent>,
        persistence: Arc<dyn PersistenceSink>,
        config: EdgeSessionConfig,
    ) -> Result<SessionHandle, RequestError> {
        let session_id = uuid::Uuid::new_v4().to_string();
        Orchestrator::validate(&request)?;

        let by_panelist: HashMap<String, PanelistAttribution> = request
            .panelists
            .iter()
            .map(|p| (p.panelist_id.clone(), attribution_for(p)))
            .collect();

        let mut panelist_streams = Vec::with_capacity(request.panelists.len());
        for panelist in &request.panelists {
            let orchestrator = registry.get(&panelist.provider)?;
            let mut sub_request = request.clone();
            sub_request.panelists = vec![panelist.clone()];
            let stream = orchestrator.run(sub_request).await?;
            panelist_streams.push((panelist.panelist_id.clone(), panelist.priority, stream));
        }

        let (upstream_chunks, cancel, attribution): (ChunkStream, CancelHandle, AttributionSource) =
            if panelist_streams.len() == 1 {
                let (id, _, stream) = panelist_streams.into_iter().next().unwrap();
                let single = by_panelist
                    .get(&id)
                    .cloned()
                    .unwrap_or_else(|| PanelistAttribution {
                        panelist_id: id,
                        ..Default::default()
                    });
                (stream.chunks, stream.cancel, AttributionSource::Single(single))
            } else {
                let cancels: Vec<CancelHandle> =
                    panelist_streams.iter().map(|(_, _, s)| s.cancel.clone()).collect();
                let merger_inputs = panelist_streams
                    .into_iter()
                    .map(|(id, priority, s)| (id, priority, s.chunks))
                    .collect();
                let (merged, table) = FairMerger::new(merger_inputs).merge();
                (
                    merged,
                    combine_cancels(cancels),
                    AttributionSource::Merged {
                        table,
                        by_panelist,
                    },
                )
            };

        let bundler = TokenBundler::new(config.bundler);
        let (client_stream, persist_stream, full_content) = bundler.spawn(upstream_chunks);

        let persistence_task = tokio::spawn(drain_persistence(persist_stream, persistence));

        let heartbeat_interval = Duration::from_millis(config.heartbeat_interval_ms);
        let total_timeout = Duration::from_millis(config.total_timeout_ms);
        let idle_timeout = Duration::from_millis(config.idle_timeout_ms);
        let cancel_for_client = cancel.clone();
        let client_task = tokio::spawn(drain_client(
            client_stream,
            client_tx,
            cancel_for_client,
            heartbeat_interval,
            total_timeout,
            idle_timeout,
            full_content,
            attribution,
        ));

        let join = tokio::spawn(async move {
            let _ = client_task.await;
            let _ = persistence_task.await;
        });

        Ok(SessionHandle {
            session_id,
            cancel,
            join,
        })
    }
}

/// Builds one `CancelHandle` whose cancellation fans out to every
/// per-panelist cancel handle it wraps — used when the Fair Merger has
/// combined more than one panelist stream, since the session only exposes
/// a single cancel signal (spec.md §5) regardless of how many panelists it
/// owns underneath.
fn combine_cancels(handles: Vec<CancelHandle>) -> CancelHandle {
    let combined = CancelHandle::new();
    let token = combined.token();
    tokio::spawn(async move {
        token.cancelled().await;
        for handle in handles {
            handle.cancel();
        }
    });
    combined
}

async fn drain_persistence(
    mut stream: crate::ChunkStream,
    persistence: Arc<dyn PersistenceSink>,
) {
    while let Some(chunk) = stream.next().await {
        persistence.submit(chunk).await;
    }
}

async fn drain_client(
    mut stream: crate::ChunkStream,
    client_tx: mpsc::Sender<SseEvent>,
    cancel: CancelHandle,
    heartbeat_interval: Duration,
    total_timeout: Duration,
    idle_timeout: Duration,
    full_content: crate::bundler::FullContentHandle,
    attribution: AttributionSource,
) {
    let deadline = Instant::now() + total_timeout;
    let mut last_activity = Instant::now();
    let mut last_seq = 0u64;
    let mut last_usage: Option<Usage> = None;
    let mut idle_deadline = Instant::now() + idle_timeout;

    loop {
        let now = Instant::now();
        if now >= deadline {
            cancel.cancel();
            let _ = client_tx.send(timeout_error(last_seq)).await;
            return;
        }
        if now >= idle_deadline {
            cancel.cancel();
            let _ = client_tx.send(timeout_error(last_seq)).await;
            return;
        }
        let next_heartbeat = last_activity + heartbeat_interval;
        let next_wakeup = next_heartbeat.min(deadline).min(idle_deadline);

        tokio::select! {
            _ = tokio::time::sleep_until(next_wakeup) => {
                if Instant::now() >= deadline || Instant::now() >= idle_deadline {
                    cancel.cancel();
                    let _ = client_tx.send(timeout_error(last_seq)).await;
                    return;
                }
                if client_tx.send(SseEvent::Heartbeat).await.is_err() {
                    cancel.cancel();
                    return;
                }
                last_activity = Instant::now();
            }
            chunk = stream.next() => {
                let Some(chunk) = chunk else { return };
                last_seq = chunk.seq();
                idle_deadline = Instant::now() + idle_timeout;
                let is_terminal = chunk.is_terminal();
                if let DomainChunk::Usage { ref usage, .. } = chunk {
                    last_usage = Some(usage.clone());
                }
                let panelist = attribution.resolve(chunk.seq());
                let event = SseEvent::from_chunk(chunk, panelist.as_ref(), last_usage.clone());
                let event = if is_terminal {
                    event.with_full_content(full_content.lock().clone())
                } else {
                    event
                };
                if client_tx.send(event).await.is_err() {
                    // client disconnected: stop forwarding but let the
                    // persistence side (already bundled independently)
                    // keep draining to the domain stream's terminal chunk.
                    cancel.cancel();
                    return;
                }
                last_activity = Instant::now();
                // A multi-panelist stream forwards one terminal chunk per
                // panelist plus a synthesized aggregate `End`; keep draining
                // until the upstream channel itself closes rather than
                // stopping at the first terminal chunk seen.
            }
        }
    }
}

/// Synthesizes the terminal error the session itself delivers on a
/// total-timeout or idle-timeout expiry, per spec.md §4.4 ("exceeding it
/// cancels the domain stream and delivers a terminal error to both
/// sinks") — the session does not wait for the cancelled upstream to wind
/// its own way down to a terminal chunk.
fn timeout_error(seq: u64) -> SseEvent {
    SseEvent::Error {
        seq,
        kind: ProviderErrorKind::Timeout,
        message: "stream timed out".to_string(),
        retryable: false,
        panelist_id: None,
    }
}
