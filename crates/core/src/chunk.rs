use serde::{Deserialize, Serialize};

use crate::error::ProviderErrorKind;
use crate::tool::{ToolCall, ToolResult};
use crate::usage::Usage;

/// Why a domain stream terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The panelist finished its turn normally.
    Stop,
    /// The provider cut the turn short at a token/length limit.
    Length,
    /// The panelist stopped to wait on one or more tool calls.
    ToolUse,
    /// The caller cancelled the stream before it reached a natural stop.
    Cancelled,
    /// A provider or infrastructure error forced an early stop.
    Error,
}

/// Where a merged chunk originally came from, and what its position was in
/// that panelist's own stream before merging. Only populated on chunks that
/// passed through the Fair Merger (single-panelist streams never carry one).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribution {
    pub panelist_id: String,
    pub original_seq: u64,
}

/// The single normalized unit every provider adapter emits and every
/// downstream stage (bundler, merger, persistence, edge session) consumes.
///
/// Exactly one `DomainChunk::End` or `DomainChunk::Error` terminates a given
/// domain stream; no further chunks follow it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DomainChunk {
    /// An incremental slice of assistant-visible text.
    Text { seq: u64, delta: String },
    /// An incremental slice of provider "thinking"/reasoning text, kept
    /// distinct from `Text` rather than collapsed into it.
    Thinking { seq: u64, delta: String },
    /// The provider has requested a tool invocation. Always followed,
    /// eventually, by exactly one matching `ToolResult` chunk with the same
    /// `call_id` and no intervening `Text`/`Thinking` chunk for that call.
    ToolUse { seq: u64, call: ToolCall },
    /// The result of a previously emitted `ToolUse` chunk.
    ToolResult {
        seq: u64,
        call_id: String,
        result: ToolResult,
    },
    /// A usage update. May appear zero or more times before the terminal
    /// chunk; later updates supersede earlier ones for fields they set.
    Usage { seq: u64, usage: Usage },
    /// Terminal: the stream ended without error.
    End { seq: u64, reason: StopReason },
    /// Terminal: the stream ended because of an error.
    Error {
        seq: u64,
        kind: ProviderErrorKind,
        message: String,
        retryable: bool,
    },
}

impl DomainChunk {
    pub fn seq(&self) -> u64 {
        match self {
            DomainChunk::Text { seq, .. }
            | DomainChunk::Thinking { seq, .. }
            | DomainChunk::ToolUse { seq, .. }
            | DomainChunk::ToolResult { seq, .. }
            | DomainChunk::Usage { seq, .. }
            | DomainChunk::End { seq, .. }
            | DomainChunk::Error { seq, .. } => *seq,
        }
    }

    /// True for `End`/`Error` — the two kinds that may only appear once, last.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DomainChunk::End { .. } | DomainChunk::Error { .. })
    }

    /// True for chunk kinds the Token Bundler must flush immediately rather
    /// than fold into the text/thinking accumulators.
    pub fn forces_flush(&self) -> bool {
        !matches!(self, DomainChunk::Text { .. } | DomainChunk::Thinking { .. })
    }

    pub fn with_seq(self, seq: u64) -> Self {
        match self {
            DomainChunk::Text { delta, .. } => DomainChunk::Text { seq, delta },
            DomainChunk::Thinking { delta, .. } => DomainChunk::Thinking { seq, delta },
            DomainChunk::ToolUse { call, .. } => DomainChunk::ToolUse { seq, call },
            DomainChunk::ToolResult {
                call_id, result, ..
            } => DomainChunk::ToolResult {
                seq,
                call_id,
                result,
            },
            DomainChunk::Usage { usage, .. } => DomainChunk::Usage { seq, usage },
            DomainChunk::End { reason, .. } => DomainChunk::End { seq, reason },
            DomainChunk::Error {
                kind,
                message,
                retryable,
                ..
            } => DomainChunk::Error {
                seq,
                kind,
                message,
                retryable,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_chunks_are_exactly_end_and_error() {
        let end = DomainChunk::End {
            seq: 1,
            reason: StopReason::Stop,
        };
        let err = DomainChunk::Error {
            seq: 2,
            kind: ProviderErrorKind::Unknown,
            message: "boom".into(),
            retryable: false,
        };
        let text = DomainChunk::Text {
            seq: 3,
            delta: "hi".into(),
        };
        assert!(end.is_terminal());
        assert!(err.is_terminal());
        assert!(!text.is_terminal());
    }

    #[test]
    fn only_text_and_thinking_do_not_force_a_flush() {
        assert!(!DomainChunk::Text {
            seq: 0,
            delta: String::new()
        }
        .forces_flush());
        assert!(!DomainChunk::Thinking {
            seq: 0,
            delta: String::new()
        }
        .forces_flush());
        assert!(DomainChunk::Usage {
            seq: 0,
            usage: Usage::default()
        }
        .forces_flush());
    }

    #[test]
    fn with_seq_reassigns_without_changing_payload() {
        let chunk = DomainChunk::Text {
            seq: 1,
            delta: "hello".into(),
        };
        let reassigned = chunk.with_seq(42);
        assert_eq!(reassigned.seq(), 42);
        match reassigned {
            DomainChunk::Text { delta, .. } => assert_eq!(delta, "hello"),
            _ => panic!("kind changed"),
        }
    }
}
