use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::chunk::DomainChunk;

/// The row shape the Persistence Pipeline's store contract writes:
/// `appendChunk(threadId, messageId, seq, kind, content, finalized, createdAt)`
/// from spec.md §6, with `(thread_id, message_id, seq)` as the dedup key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedChunk {
    pub thread_id: String,
    pub message_id: String,
    pub seq: u64,
    pub kind: String,
    pub content: Value,
    pub finalized: bool,
    pub created_at: String,
}

impl PersistedChunk {
    pub fn from_domain_chunk(thread_id: impl Into<String>, message_id: impl Into<String>, chunk: &DomainChunk) -> Self {
        let finalized = chunk.is_terminal();
        let created_at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        let (kind, content) = match chunk {
            DomainChunk::Text { delta, .. } => ("text", serde_json::json!({ "delta": delta })),
            DomainChunk::Thinking { delta, .. } => ("thinking", serde_json::json!({ "delta": delta })),
            DomainChunk::ToolUse { call, .. } => ("tool_use", serde_json::to_value(call).unwrap_or(Value::Null)),
            DomainChunk::ToolResult { call_id, result, .. } => (
                "tool_result",
                serde_json::json!({ "call_id": call_id, "result": result }),
            ),
            DomainChunk::Usage { usage, .. } => ("usage", serde_json::to_value(usage).unwrap_or(Value::Null)),
            DomainChunk::End { reason, .. } => ("end", serde_json::to_value(reason).unwrap_or(Value::Null)),
            DomainChunk::Error {
                kind,
                message,
                retryable,
                ..
            } => (
                "error",
                serde_json::json!({ "kind": kind, "message": message, "retryable": retryable }),
            ),
        };
        PersistedChunk {
            thread_id: thread_id.into(),
            message_id: message_id.into(),
            seq: chunk.seq(),
            kind: kind.to_string(),
            content,
            finalized,
            created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::StopReason;

    #[test]
    fn terminal_chunks_are_marked_finalized() {
        let chunk = DomainChunk::End {
            seq: 3,
            reason: StopReason::Stop,
        };
        let row = PersistedChunk::from_domain_chunk("t", "m", &chunk);
        assert!(row.finalized);
        assert_eq!(row.kind, "end");
    }

    #[test]
    fn text_chunks_are_not_finalized() {
        let chunk = DomainChunk::Text {
            seq: 1,
            delta: "hi".into(),
        };
        let row = PersistedChunk::from_domain_chunk("t", "m", &chunk);
        assert!(!row.finalized);
        assert_eq!(row.content, serde_json::json!({ "delta": "hi" }));
    }
}
