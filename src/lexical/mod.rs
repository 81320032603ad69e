//! Lexical (keyword) retrieval: pluggable tokenization and a BM25 index.
//!
//! Lexical segmentation is script-dependent, so the tokenizer is a strategy
//! the index is constructed with rather than a fixed rule. The default uses
//! UAX-29 word segmentation plus lowercasing, which keeps corpora that mix
//! scripts (including ones without whitespace word boundaries) searchable
//! without a language-specific segmenter.

mod bm25;

use unicode_segmentation::UnicodeSegmentation;

pub use bm25::Bm25Index;

/// Splits query and chunk text into index terms.
pub trait Tokenizer: Send + Sync {
    fn tokenize(&self, text: &str) -> Vec<String>;
}

/// UAX-29 word boundaries + lowercasing. Punctuation is dropped by the
/// segmentation itself; CJK ideographs come out as per-character terms.
#[derive(Clone, Copy, Debug, Default)]
pub struct UnicodeTokenizer;

impl Tokenizer for UnicodeTokenizer {
    fn tokenize(&self, text: &str) -> Vec<String> {
        text.unicode_words().map(|w| w.to_lowercase()).collect()
    }
}

/// BM25 free parameters.
///
/// `k1` controls term-frequency saturation, `b` the strength of document
/// length normalization.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bm25Params {
    pub k1: f32,
    pub b: f32,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.5, b: 0.75 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizer_lowercases_and_strips_punctuation() {
        let terms = UnicodeTokenizer.tokenize("Hello, World! It's BM25-time.");
        assert_eq!(terms, vec!["hello", "world", "it's", "bm25", "time"]);
    }

    #[test]
    fn tokenizer_handles_cjk_without_whitespace() {
        let terms = UnicodeTokenizer.tokenize("混合检索 engine");
        assert!(terms.contains(&"engine".to_string()));
        assert!(terms.len() > 1, "CJK text must yield terms: {terms:?}");
    }

    #[test]
    fn empty_input_yields_no_terms() {
        assert!(UnicodeTokenizer.tokenize("  ...  ").is_empty());
    }
}
