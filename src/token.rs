//! Word-based token estimation.
//!
//! Chunking and batching decisions need a cheap, deterministic token count
//! without pulling in a real tokenizer. English prose averages roughly
//! three words per four tokens, so the estimate is word count × 4⁄3,
//! rounded up.

/// Estimate the token count of `text`. Deterministic; zero for
/// empty/whitespace-only input.
pub fn estimate_tokens(text: &str) -> usize {
    let words = text.split_whitespace().count();
    words.div_ceil(3) + words // words * 4/3, rounded up
}

/// Return the last `tokens`-worth of words from `text`, used to carry
/// overlap from a chunk's tail onto the next chunk's head.
pub fn tail_words(text: &str, tokens: usize) -> String {
    if tokens == 0 {
        return String::new();
    }
    // Invert the 4/3 ratio: n tokens cover about n * 3/4 words.
    let word_budget = (tokens * 3).div_ceil(4).max(1);
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= word_budget {
        return words.join(" ");
    }
    words[words.len() - word_budget..].join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_zero() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("   \n\t  "), 0);
    }

    #[test]
    fn scales_with_word_count() {
        // 3 words ≈ 4 tokens
        assert_eq!(estimate_tokens("one two three"), 4);
        // 300 words ≈ 400 tokens
        let text = vec!["word"; 300].join(" ");
        assert_eq!(estimate_tokens(&text), 400);
    }

    #[test]
    fn deterministic() {
        let text = "The quick brown fox jumps over the lazy dog.";
        assert_eq!(estimate_tokens(text), estimate_tokens(text));
    }

    #[test]
    fn tail_words_takes_suffix() {
        let text = "a b c d e f g h";
        let tail = tail_words(text, 4); // 4 tokens ≈ 3 words
        assert_eq!(tail, "f g h");
    }

    #[test]
    fn tail_words_short_text_returns_all() {
        assert_eq!(tail_words("only two", 100), "only two");
        assert_eq!(tail_words("anything", 0), "");
    }
}
