//! Minimal Server-Sent-Events line buffering shared by the HTTP-SSE based
//! adapters. `reqwest`'s byte stream delivers arbitrary chunk boundaries —
//! not necessarily aligned to `\n` — so incoming bytes are accumulated and
//! only complete lines are handed back to the caller.

/// Accumulates raw bytes and yields complete `data: ...` payloads as they
/// become available, skipping blank lines, comments (`:`-prefixed), and the
/// `[DONE]` sentinel some providers send as a final data line.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    pending: String,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        SseLineBuffer::default()
    }

    /// Feed newly received bytes in and drain every complete `data:` event
    /// payload that is now available. Lines that are not `data:` fields
    /// (event:, id:, comments, blank keep-alives) are silently dropped.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.push_str(&String::from_utf8_lossy(bytes));
        let mut out = Vec::new();
        while let Some(idx) = self.pending.find('\n') {
            let line = self.pending[..idx].trim_end_matches('\r').to_string();
            self.pending.drain(..=idx);
            if let Some(payload) = line.strip_prefix("data:") {
                let payload = payload.trim_start();
                if payload == "[DONE]" {
                    continue;
                }
                if !payload.is_empty() {
                    out.push(payload.to_string());
                }
            }
        }
        out
    }
}
