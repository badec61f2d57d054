//! The client-facing wire contract: one `SseEvent` per bundled
//! `DomainChunk`, rendered as a standard `event: <name>\ndata: <json>\n\n`
//! Server-Sent-Events frame. Heartbeats are a distinct, never-persisted
//! frame the Edge Session emits on its own idle timer — they never
//! originate from a `DomainChunk` and are not represented here as one.

use panelstream_core::{DomainChunk, ProviderErrorKind, StopReason, Usage};
use serde::Serialize;

/// Which panelist a client-visible chunk came from, resolved once per event
/// from the Fair Merger's `AttributionTable` (multi-panelist) or the sole
/// panelist on the request (single-panelist, where every chunk is trivially
/// "from" it). Carried on the wire so a roundtable client can render each
/// panelist's stream without maintaining its own id-to-label mapping.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PanelistAttribution {
    pub panelist_id: String,
    pub display_name: String,
    pub provider_id: String,
    pub model_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum SseEvent {
    Token {
        seq: u64,
        delta: String,
        #[serde(flatten)]
        attribution: PanelistAttribution,
    },
    Thinking {
        seq: u64,
        delta: String,
        #[serde(flatten)]
        attribution: PanelistAttribution,
    },
    ToolCall {
        seq: u64,
        call: panelstream_core::ToolCall,
        #[serde(flatten)]
        attribution: PanelistAttribution,
    },
    ToolResult {
        seq: u64,
        call_id: String,
        result: panelstream_core::ToolResult,
        #[serde(flatten)]
        attribution: PanelistAttribution,
    },
    Usage {
        seq: u64,
        usage: panelstream_core::Usage,
        #[serde(flatten)]
        attribution: PanelistAttribution,
    },
    End {
        seq: u64,
        /// The full client-visible assistant text accumulated over the
        /// whole session, so the client can reconcile against a single
        /// authoritative value instead of re-summing bundles itself.
        /// Empty until `EdgeSession` fills it in via `with_full_content`.
        full_content: String,
        stop_reason: StopReason,
        /// The most recent usage snapshot observed before the stream
        /// terminated, if any panelist ever reported one.
        usage: Option<Usage>,
    },
    Error {
        seq: u64,
        kind: ProviderErrorKind,
        message: String,
        retryable: bool,
        /// `None` for a session-level error (e.g. idle/total timeout) that
        /// has no single originating panelist.
        panelist_id: Option<String>,
    },
    /// Never derived from a `DomainChunk` — synthesized directly by the
    /// Edge Session on its idle-keepalive timer.
    Heartbeat,
}

impl SseEvent {
    /// Builds the wire event for one domain chunk, resolving panelist
    /// attribution (content-bearing kinds) and filling in the last known
    /// usage snapshot (the terminal `End` only). `attribution` is `None`
    /// for the merger's synthesized aggregate `End` and for session-level
    /// errors with no single owning panelist.
    pub fn from_chunk(
        chunk: DomainChunk,
        attribution: Option<&PanelistAttribution>,
        usage: Option<Usage>,
    ) -> Self {
        let attribution = attribution.cloned().unwrap_or_default();
        match chunk {
            DomainChunk::Text { seq, delta } => SseEvent::Token {
                seq,
                delta,
                attribution,
            },
            DomainChunk::Thinking { seq, delta } => SseEvent::Thinking {
                seq,
                delta,
                attribution,
            },
            DomainChunk::ToolUse { seq, call } => SseEvent::ToolCall {
                seq,
                call,
                attribution,
            },
            DomainChunk::ToolResult {
                seq,
                call_id,
                result,
            } => SseEvent::ToolResult {
                seq,
                call_id,
                result,
                attribution,
            },
            DomainChunk::Usage { seq, usage } => SseEvent::Usage {
                seq,
                usage,
                attribution,
            },
            DomainChunk::End { seq, reason } => SseEvent::End {
                seq,
                full_content: String::new(),
                stop_reason: reason,
                usage,
            },
            DomainChunk::Error {
                seq,
                kind,
                message,
                retryable,
            } => {
                let panelist_id = if attribution.panelist_id.is_empty() {
                    None
                } else {
                    Some(attribution.panelist_id)
                };
                SseEvent::Error {
                    seq,
                    kind,
                    message,
                    retryable,
                    panelist_id,
                }
            }
        }
    }

    /// Fills in `full_content` on an `End` event; a no-op on any other
    /// variant. Called by the Edge Session once, right before the event is
    /// sent, with the Token Bundler's running total of client-visible text.
    pub fn with_full_content(mut self, content: String) -> Self {
        if let SseEvent::End { full_content, .. } = &mut self {
            *full_content = content;
        }
        self
    }

    /// Render as a standard SSE frame, terminated by the blank line that
    /// signals the end of the event to a browser `EventSource`.
    pub fn to_frame(&self) -> String {
        let (event_name, payload) = self.frame_parts();
        format!("event: {event_name}\ndata: {payload}\n\n")
    }

    fn frame_parts(&self) -> (&'static str, String) {
        let name = match self {
            SseEvent::Token { .. } => "token",
            SseEvent::Thinking { .. } => "thinking",
            SseEvent::ToolCall { .. } => "tool_call",
            SseEvent::ToolResult { .. } => "tool_result",
            SseEvent::Usage { .. } => "usage",
            SseEvent::End { .. } => "end",
            SseEvent::Error { .. } => "error",
            SseEvent::Heartbeat => "heartbeat",
        };
        let payload = serde_json::to_string(self).unwrap_or_else(|_| "null".to_string());
        (name, payload)
    }
}
