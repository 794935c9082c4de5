//! Pre-flight token estimate.
//!
//! This is an approximation for admission only: characters divided by a
//! fixed average. It is never billed; cost is computed afterwards from the
//! usage the provider reports.

use crate::models::provider::ChatMessage;

pub const CHARS_PER_TOKEN: u64 = 4;

pub fn estimate_tokens(messages: &[ChatMessage]) -> u64 {
    let characters: u64 = messages.iter().map(|m| m.content.chars().count() as u64).sum();
    characters.div_ceil(CHARS_PER_TOKEN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rounds_up() {
        assert_eq!(estimate_tokens(&[]), 0);
        assert_eq!(estimate_tokens(&[ChatMessage::user("abc")]), 1);
        assert_eq!(
            estimate_tokens(&[ChatMessage::system("abcd"), ChatMessage::user("abcde")]),
            3
        );
    }

    #[test]
    fn test_counts_characters_not_bytes() {
        assert_eq!(estimate_tokens(&[ChatMessage::user("\u{e9}\u{e9}\u{e9}\u{e9}")]), 1);
    }
}
