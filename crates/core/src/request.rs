use serde::{Deserialize, Serialize};

use crate::tool::ToolSpec;

/// One chat message in a conversation, provider-agnostic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One participant in a (possibly multi-panelist) streaming request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Panelist {
    pub panelist_id: String,
    /// Client-facing label for this panelist, distinct from `panelist_id`
    /// (an internal key); carried onto every `SseEvent` so a multi-panelist
    /// roundtable can be rendered without the client maintaining its own
    /// id-to-label mapping.
    pub display_name: String,
    pub provider: String,
    pub model: String,
    /// Scheduling weight for the Fair Merger; higher drains more often
    /// relative to other ready panelists. Ignored when there is only one
    /// panelist.
    pub priority: f64,
}

impl Default for Panelist {
    fn default() -> Self {
        Panelist {
            panelist_id: String::new(),
            display_name: String::new(),
            provider: String::new(),
            model: String::new(),
            priority: 1.0,
        }
    }
}

/// Provider-independent sampling parameters, forwarded into each adapter's
/// native request body. Every field is optional (`stop` defaults to empty)
/// so a caller can lean entirely on the provider's own defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub stop: Vec<String>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        StreamOptions {
            max_tokens: None,
            temperature: None,
            top_p: None,
            stop: Vec::new(),
        }
    }
}

/// A single request to stream a turn, across one or more panelists.
///
/// All system messages present in `messages` are merged by the adapter into
/// a single provider-native system field, concatenated by newline in
/// emission order — panelists never see more than one system message on the
/// wire even if the caller supplied several.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRequest {
    pub thread_id: String,
    pub message_id: String,
    pub panelists: Vec<Panelist>,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    #[serde(default)]
    pub options: StreamOptions,
}

impl StreamRequest {
    /// All `messages` with role `System`, concatenated by newline in order.
    /// Empty string if there are none.
    pub fn merged_system_message(&self) -> String {
        self.messages
            .iter()
            .filter(|m| m.role == ChatRole::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Tunables for the Token Bundler's two independent accumulators. Mirrors
/// the `bundle.client.*` / `bundle.persist.*` configuration keys: each side
/// flushes on whichever of `max_tokens`, `max_bytes`, or `max_latency_ms` is
/// reached first.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BundlerConfig {
    pub client_max_tokens: usize,
    pub client_max_bytes: usize,
    pub client_max_latency_ms: u64,
    pub persistence_max_tokens: usize,
    pub persistence_max_bytes: usize,
    pub persistence_max_latency_ms: u64,
    /// Capacity of the bounded client-facing channel; once full, new
    /// intermediate (non-terminal, text/thinking) bundles are dropped in
    /// favor of the newest one rather than blocking the producer.
    pub client_channel_capacity: usize,
}

pub const DEFAULT_CLIENT_MAX_TOKENS: usize = 15;
pub const DEFAULT_CLIENT_MAX_BYTES: usize = 1024;
pub const DEFAULT_CLIENT_MAX_LATENCY_MS: u64 = 100;
pub const DEFAULT_PERSISTENCE_MAX_TOKENS: usize = 50;
pub const DEFAULT_PERSISTENCE_MAX_BYTES: usize = 8192;
pub const DEFAULT_PERSISTENCE_MAX_LATENCY_MS: u64 = 500;
pub const DEFAULT_CLIENT_CHANNEL_CAPACITY: usize = 64;

impl Default for BundlerConfig {
    fn default() -> Self {
        BundlerConfig {
            client_max_tokens: DEFAULT_CLIENT_MAX_TOKENS,
            client_max_bytes: DEFAULT_CLIENT_MAX_BYTES,
            client_max_latency_ms: DEFAULT_CLIENT_MAX_LATENCY_MS,
            persistence_max_tokens: DEFAULT_PERSISTENCE_MAX_TOKENS,
            persistence_max_bytes: DEFAULT_PERSISTENCE_MAX_BYTES,
            persistence_max_latency_ms: DEFAULT_PERSISTENCE_MAX_LATENCY_MS,
            client_channel_capacity: DEFAULT_CLIENT_CHANNEL_CAPACITY,
        }
    }
}

/// Crude word-boundary token estimate, used only to evaluate the bundler's
/// `max_tokens` threshold against raw text deltas (providers do not expose
/// their own tokenizer mid-stream). Whitespace runs count as boundaries;
/// this deliberately over-counts relative to a real BPE tokenizer so the
/// threshold trips at least as eagerly as the configured intent.
pub fn estimate_token_count(s: &str) -> usize {
    s.split_whitespace().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merged_system_message_concatenates_in_order_and_skips_other_roles() {
        let req = StreamRequest {
            thread_id: "t".into(),
            message_id: "m".into(),
            panelists: vec![],
            messages: vec![
                ChatMessage {
                    role: ChatRole::System,
                    content: "be terse".into(),
                },
                ChatMessage {
                    role: ChatRole::User,
                    content: "hi".into(),
                },
                ChatMessage {
                    role: ChatRole::System,
                    content: "no emoji".into(),
                },
            ],
            tools: vec![],
            options: StreamOptions::default(),
        };
        assert_eq!(req.merged_system_message(), "be terse\nno emoji");
    }

    #[test]
    fn stream_options_default_to_provider_defaults() {
        let options = StreamOptions::default();
        assert_eq!(options.max_tokens, None);
        assert_eq!(options.temperature, None);
        assert_eq!(options.top_p, None);
        assert!(options.stop.is_empty());
    }

    #[test]
    fn bundler_config_default_matches_documented_constants() {
        let cfg = BundlerConfig::default();
        assert_eq!(cfg.client_max_tokens, DEFAULT_CLIENT_MAX_TOKENS);
        assert_eq!(cfg.persistence_max_latency_ms, DEFAULT_PERSISTENCE_MAX_LATENCY_MS);
    }

    #[test]
    fn token_estimate_counts_whitespace_separated_words() {
        assert_eq!(estimate_token_count("hello world!"), 2);
        assert_eq!(estimate_token_count(""), 0);
    }
}
