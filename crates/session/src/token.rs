//! Rough token estimation.
//!
//! Exact counting needs a tokenizer per model; for compaction triggers a
//! heuristic is enough. ASCII runs about 4 chars per token, CJK about 1.5
//! chars per token. The compactor multiplies by a 1.2 safety margin to
//! absorb the inaccuracy.

use aido_core::message::Message;

/// Estimate tokens for a string.
pub fn estimate_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    let mut chars: u64 = 0;
    let mut cjk: u64 = 0;
    for c in text.chars() {
        chars += 1;
        if ('\u{4E00}'..='\u{9FFF}').contains(&c) {
            cjk += 1;
        }
    }
    let ascii = chars - cjk;
    ascii / 4 + cjk * 2 / 3 + 1
}

/// Estimate total tokens for a message list, including tool-call payloads
/// and a 4-token per-message formatting overhead.
pub fn estimate_messages_tokens(messages: &[Message]) -> u64 {
    messages
        .iter()
        .map(|msg| {
            let mut total = estimate_tokens(&msg.content) + 4;
            for tc in &msg.tool_calls {
                total += estimate_tokens(&tc.name) + estimate_tokens(&tc.arguments);
            }
            total
        })
        .sum()
}
