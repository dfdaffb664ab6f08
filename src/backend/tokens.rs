//! Prompt-token estimation.
//!
//! Estimates use the cl100k tokenizer plus a fixed per-message overhead. When
//! the tokenizer cannot be loaded the estimate is 0, which only makes the
//! completion budget generous; it never fails a call.

use std::sync::OnceLock;

use tiktoken_rs::{CoreBPE, cl100k_base};
use tracing::warn;

use super::ChatMessage;

/// Tokens added per message for the role/separator framing.
pub const PER_MESSAGE_OVERHEAD: usize = 15;

// Cached tokenizer, initialization is expensive
static BPE_TOKENIZER: OnceLock<Option<CoreBPE>> = OnceLock::new();

fn get_tokenizer() -> Option<&'static CoreBPE> {
    BPE_TOKENIZER
        .get_or_init(|| match cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(e) => {
                warn!("Tokenizer unavailable, token estimates fall back to 0: {}", e);
                None
            }
        })
        .as_ref()
}

/// Number of tokens in `text`, if the tokenizer is available.
pub fn count_text(text: &str) -> Option<usize> {
    get_tokenizer().map(|bpe| bpe.encode_ordinary(text).len())
}

/// Estimated prompt size of `messages`.
pub fn estimate_prompt_tokens(messages: &[ChatMessage]) -> u32 {
    let joined = messages
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    match count_text(&joined) {
        Some(count) => {
            let total = count + PER_MESSAGE_OVERHEAD * messages.len();
            u32::try_from(total).unwrap_or(u32::MAX)
        }
        None => 0,
    }
}

/// Completion tokens left after the prompt, clamped at 0.
pub fn completion_budget(messages: &[ChatMessage], context_window: u32) -> u32 {
    context_window.saturating_sub(estimate_prompt_tokens(messages))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_includes_overhead() {
        let messages = vec![ChatMessage::system("You are a helpful assistant."), ChatMessage::user("Hi")];
        let estimate = estimate_prompt_tokens(&messages);
        // Either the tokenizer ran (text tokens + 2 * overhead) or fell back to 0
        assert!(estimate == 0 || estimate > 2 * PER_MESSAGE_OVERHEAD as u32);
    }

    #[test]
    fn test_empty_messages() {
        assert_eq!(estimate_prompt_tokens(&[]), 0);
    }

    #[test]
    fn test_budget_clamps_at_zero() {
        let long = "word ".repeat(2000);
        let messages = vec![ChatMessage::user(long)];
        if count_text("word").is_some() {
            assert_eq!(completion_budget(&messages, 100), 0);
        }
        assert!(completion_budget(&messages, u32::MAX) > 0);
    }
}
