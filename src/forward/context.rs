//! Forward context structures.
//!
//! Shared types passed between admission, the transport, and the handlers.

use serde::{Deserialize, Serialize};

/// Supported provider families, used both for channel types and for the
/// client-facing wire dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAI,
    Claude,
    Gemini,
}

impl Provider {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Some(Provider::OpenAI),
            "claude" | "anthropic" => Some(Provider::Claude),
            "gemini" => Some(Provider::Gemini),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAI => "openai",
            Provider::Claude => "claude",
            Provider::Gemini => "gemini",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Token usage for one request, in the four component buckets priced
/// independently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_creation_tokens: i64,
}

impl TokenUsage {
    pub fn total(&self) -> i64 {
        self.input_tokens + self.output_tokens + self.cache_read_tokens + self.cache_creation_tokens
    }

    /// Merge upstream-reported counts into this usage; non-zero fields win.
    pub fn absorb(&mut self, other: &TokenUsage) {
        if other.input_tokens > 0 {
            self.input_tokens = other.input_tokens;
        }
        if other.output_tokens > 0 {
            self.output_tokens = other.output_tokens;
        }
        if other.cache_read_tokens > 0 {
            self.cache_read_tokens = other.cache_read_tokens;
        }
        if other.cache_creation_tokens > 0 {
            self.cache_creation_tokens = other.cache_creation_tokens;
        }
    }
}

/// Rough token estimate (~3.5 chars per token) for upstreams that omit
/// usage counts.
pub fn estimate_tokens(text: &str) -> i64 {
    let char_count = text.chars().count();
    (char_count as f64 / 3.5).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_parses_aliases() {
        assert_eq!(Provider::from_str("anthropic"), Some(Provider::Claude));
        assert_eq!(Provider::from_str("Claude"), Some(Provider::Claude));
        assert_eq!(Provider::from_str("OPENAI"), Some(Provider::OpenAI));
        assert_eq!(Provider::from_str("unknown"), None);
    }

    #[test]
    fn usage_absorb_prefers_reported_counts() {
        let mut usage = TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
            ..Default::default()
        };
        usage.absorb(&TokenUsage {
            input_tokens: 100,
            output_tokens: 0,
            cache_read_tokens: 7,
            cache_creation_tokens: 0,
        });
        assert_eq!(usage.input_tokens, 100);
        assert_eq!(usage.output_tokens, 5);
        assert_eq!(usage.cache_read_tokens, 7);
        assert_eq!(usage.total(), 112);
    }

    #[test]
    fn estimate_is_roughly_chars_over_three_and_a_half() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("hello, world!!"), 4);
    }
}
