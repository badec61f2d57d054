use serde::{Deserialize, Serialize};

/// Token accounting for a single panelist turn.
///
/// Providers report `prompt`/`completion` token counts at different points
/// in their streaming protocol (some split them across two separate
/// events); adapters are expected to merge field-wise rather than overwrite,
/// taking the maximum of each field seen so far, which is correct
/// regardless of arrival order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]

pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// Set when `completion_tokens` is an adapter-side estimate rather than
    /// a provider-reported value (the provider omitted it entirely).
    pub estimated: bool,
}

impl Usage {
    pub fn merge_max(self, other: Usage) -> Usage {
        Usage {
            prompt_tokens: self.prompt_tokens.max(other.prompt_tokens),
            completion_tokens: self.completion_tokens.max(other.completion_tokens),
            estimated: self.estimated || other.estimated,
        }
    }
}
