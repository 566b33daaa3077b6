use std::fmt;
use tantivy::tokenizer::{
    LowerCaser, RemoveLongFilter, SimpleTokenizer, StopWordFilter, TextAnalyzer, TokenStream,
};

/// Tokens longer than this are dropped (base64 blobs, hashes, urls without separators).
const MAX_TOKEN_LEN: usize = 40;

pub const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "he", "in", "is", "it",
    "its", "of", "on", "that", "the", "to", "was", "will", "with", "or", "but", "not", "this",
    "these", "they", "them", "their", "there", "then", "than", "so", "if", "when", "where", "why",
    "how", "what", "which", "who", "whom", "whose", "can", "could", "should", "would", "may",
    "might", "must", "shall", "do", "does", "did", "have", "had", "having",
];

/// Case-insensitive, punctuation-stripping tokenizer shared by indexing and querying.
///
/// Splits on anything that is not alphanumeric, lowercases, and optionally drops
/// common English stop words. Pure: the same text always yields the same tokens.
#[derive(Clone)]
pub struct Analyzer {
    inner: TextAnalyzer,
    stop_words: bool,
}

impl Analyzer {
    pub fn new(stop_words: bool) -> Self {
        let inner = if stop_words {
            TextAnalyzer::builder(SimpleTokenizer::default())
                .filter(RemoveLongFilter::limit(MAX_TOKEN_LEN))
                .filter(LowerCaser)
                .filter(StopWordFilter::remove(STOP_WORDS.iter().map(|s| s.to_string())))
                .build()
        } else {
            TextAnalyzer::builder(SimpleTokenizer::default())
                .filter(RemoveLongFilter::limit(MAX_TOKEN_LEN))
                .filter(LowerCaser)
                .build()
        };
        Self { inner, stop_words }
    }

    /// Analyzer without stop-word removal, used for shingling.
    pub fn plain() -> Self {
        Self::new(false)
    }

    pub fn tokenize(&self, text: &str) -> Vec<String> {
        let mut analyzer = self.inner.clone();
        let mut stream = analyzer.token_stream(text);
        let mut tokens = Vec::new();
        while stream.advance() {
            tokens.push(stream.token().text.clone());
        }
        tokens
    }
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::new(true)
    }
}

impl fmt::Debug for Analyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Analyzer").field("stop_words", &self.stop_words).finish()
    }
}
