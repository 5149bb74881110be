//! Heuristic token estimation.
//!
//! Approximates tokenizer output as one token per four characters, inflated by
//! 20% for text that looks like source code (tokenizers split punctuation-heavy
//! text into more pieces). Non-empty text never costs zero tokens.

use regex::Regex;
use std::sync::LazyLock;

use crate::message::ContextMessage;

/// Characters per token for prose
pub const CHARS_PER_TOKEN: usize = 4;

/// Multiplier applied to code-like text
pub const CODE_INFLATION: f64 = 1.2;

static CODE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"```|\b(?:function|class|const)\b|[{}]").expect("code pattern is valid")
});

/// Deterministic token estimator
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenEstimator;

impl TokenEstimator {
    pub fn new() -> Self {
        Self
    }

    /// Estimate the token cost of `text`
    pub fn estimate(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }

        let chars = text.chars().count();
        let base = chars.div_ceil(CHARS_PER_TOKEN);

        let tokens = if Self::looks_like_code(text) {
            (base as f64 * CODE_INFLATION).ceil() as usize
        } else {
            base
        };

        tokens.max(1)
    }

    /// Sum of the token counts of `messages`, estimating entries that have none
    pub fn estimate_messages(&self, messages: &[ContextMessage]) -> usize {
        messages.iter().map(|m| self.message_tokens(m)).sum()
    }

    /// Token count of one message, falling back to an estimate of its content
    pub fn message_tokens(&self, message: &ContextMessage) -> usize {
        if message.token_count > 0 {
            message.token_count
        } else {
            self.estimate(&message.content)
        }
    }

    /// Cut `text` so that its estimate does not exceed `max_tokens`.
    ///
    /// Truncation always lands on a char boundary and trailing whitespace is
    /// trimmed.
    pub fn truncate_to_tokens(&self, text: &str, max_tokens: usize) -> String {
        if self.estimate(text) <= max_tokens {
            return text.to_string();
        }
        if max_tokens == 0 {
            return String::new();
        }

        let boundaries: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .collect();

        let mut keep = (max_tokens * CHARS_PER_TOKEN).min(boundaries.len() - 1);
        loop {
            let candidate = text[..boundaries[keep]].trim_end();
            if self.estimate(candidate) <= max_tokens || keep == 0 {
                return candidate.to_string();
            }
            keep = keep.saturating_sub(CHARS_PER_TOKEN.max(keep / 10));
        }
    }

    fn looks_like_code(text: &str) -> bool {
        CODE_PATTERN.is_match(text)
    }
}
