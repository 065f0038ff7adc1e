//! Token stream boundary between analyzers and the segment writer.
//!
//! Hosts plug their own analysis pipelines; the crate ships a minimal
//! word tokenizer so indexing works out of the box.

use unicode_segmentation::UnicodeSegmentation;

/// One token produced by an analyzer for a field value.
///
/// Ordering within the stream determines positions: a token's position
/// is the previous position plus `position_increment`.
#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    /// Opaque term bytes, compared lexicographically.
    pub term: Vec<u8>,
    pub position_increment: u32,
    /// Start/end character offsets within the source value.
    pub offset: (u32, u32),
    pub payload: Option<Vec<u8>>,
}

impl Token {
    pub fn new(term: impl Into<Vec<u8>>) -> Self {
        Self {
            term: term.into(),
            position_increment: 1,
            offset: (0, 0),
            payload: None,
        }
    }

    pub fn with_offset(mut self, start: u32, end: u32) -> Self {
        self.offset = (start, end);
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = Some(payload.into());
        self
    }
}

/// Lazy sequence of tokens for one field value.
pub trait TokenStream {
    fn next_token(&mut self) -> Option<Token>;
}

impl<T: TokenStream + ?Sized> TokenStream for &mut T {
    fn next_token(&mut self) -> Option<Token> {
        (**self).next_token()
    }
}

/// Lowercasing Unicode-word tokenizer.
pub struct SimpleTokenizer;

impl SimpleTokenizer {
    pub fn stream(text: &str) -> SimpleTokenStream<'_> {
        SimpleTokenStream {
            words: text.unicode_word_indices(),
        }
    }
}

pub struct SimpleTokenStream<'a> {
    words: unicode_segmentation::UnicodeWordIndices<'a>,
}

impl TokenStream for SimpleTokenStream<'_> {
    fn next_token(&mut self) -> Option<Token> {
        let (start, word) = self.words.next()?;
        let end = start + word.len();
        Some(
            Token::new(word.to_lowercase().into_bytes()).with_offset(start as u32, end as u32),
        )
    }
}

/// Fixed token list, one position per term. Handy for tests and for
/// hosts that pre-analyze their values.
pub struct Tokens {
    tokens: std::vec::IntoIter<Token>,
}

impl Tokens {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens: tokens.into_iter(),
        }
    }

    pub fn of_terms<I, T>(terms: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Vec<u8>>,
    {
        Self::new(terms.into_iter().map(Token::new).collect())
    }
}

impl TokenStream for Tokens {
    fn next_token(&mut self) -> Option<Token> {
        self.tokens.next()
    }
}
