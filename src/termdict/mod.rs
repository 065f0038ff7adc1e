//! Burst-trie term dictionary.
//!
//! Per field, sorted terms are encoded as a trie of suffix blocks in
//! `.tm`; an FST in `.ti` maps block prefixes to their file offsets and
//! is kept in memory while a segment is open. Writing is bottom-up via
//! a pending-entry stack; reading walks the FST for seeks and the block
//! tree for iteration and automaton-driven scans.

pub mod reader;
pub mod writer;

pub use reader::{FieldReader, TermIterator, TermReader};
pub use writer::FieldWriter;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::postings::TermStats;

/// Burst-trie writer knobs. Changing these reshapes the on-disk trie
/// but not its contents.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TermWriterOptions {
    /// Blocks smaller than this merge into a neighbor.
    pub min_block_size: usize,
    /// A prefix level is flushed once this many entries accumulate.
    pub max_block_size: usize,
}

impl Default for TermWriterOptions {
    fn default() -> Self {
        Self {
            min_block_size: 25,
            max_block_size: 48,
        }
    }
}

impl TermWriterOptions {
    pub fn validate(&self) -> Result<()> {
        if self.min_block_size == 0 || self.max_block_size == 0 {
            return Err(Error::index("block sizes must be positive"));
        }
        if self.min_block_size >= self.max_block_size {
            return Err(Error::index(format!(
                "min_block_size {} must be < max_block_size {}",
                self.min_block_size, self.max_block_size
            )));
        }
        Ok(())
    }
}

/// Opaque resumption token for a term iterator position.
///
/// A cookie owns everything needed to re-evaluate the term's postings
/// later, so it may outlive the iterator (but not the field reader's
/// segment files).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeekCookie {
    pub(crate) term: Vec<u8>,
    pub(crate) stats: TermStats,
}

impl SeekCookie {
    pub fn term(&self) -> &[u8] {
        &self.term
    }

    pub fn stats(&self) -> &TermStats {
        &self.stats
    }
}

/// Byte-input DFA driven against the term trie by
/// [`TermReader::visit`]. Walks prune any subtree whose state cannot
/// reach a match.
pub trait TermMatcher {
    type State: Clone;

    fn start(&self) -> Self::State;

    fn accept(&self, state: &Self::State, byte: u8) -> Self::State;

    /// Can any extension of the consumed input still match?
    fn can_match(&self, state: &Self::State) -> bool;

    /// Does the input consumed so far match?
    fn is_match(&self, state: &Self::State) -> bool;

    /// Byte payload reported with an accepted term (e.g. edit
    /// distance).
    fn payload(&self, _state: &Self::State) -> u8 {
        0
    }
}

/// Matcher accepting every term with the given prefix.
pub struct PrefixMatcher {
    prefix: Vec<u8>,
}

impl PrefixMatcher {
    pub fn new(prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl TermMatcher for PrefixMatcher {
    /// Bytes of the prefix matched so far; saturates once complete.
    type State = Option<usize>;

    fn start(&self) -> Self::State {
        Some(0)
    }

    fn accept(&self, state: &Self::State, byte: u8) -> Self::State {
        match *state {
            Some(pos) if pos >= self.prefix.len() => Some(pos),
            Some(pos) if self.prefix[pos] == byte => Some(pos + 1),
            _ => None,
        }
    }

    fn can_match(&self, state: &Self::State) -> bool {
        state.is_some()
    }

    fn is_match(&self, state: &Self::State) -> bool {
        matches!(*state, Some(pos) if pos >= self.prefix.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_validation() {
        assert!(TermWriterOptions::default().validate().is_ok());
        assert!(TermWriterOptions {
            min_block_size: 0,
            max_block_size: 10,
        }
        .validate()
        .is_err());
        assert!(TermWriterOptions {
            min_block_size: 10,
            max_block_size: 10,
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_prefix_matcher() {
        let matcher = PrefixMatcher::new(b"ap".to_vec());
        let mut state = matcher.start();
        assert!(matcher.can_match(&state));
        assert!(!matcher.is_match(&state));

        state = matcher.accept(&state, b'a');
        state = matcher.accept(&state, b'p');
        assert!(matcher.is_match(&state));

        // anything after a full prefix still matches
        state = matcher.accept(&state, b'x');
        assert!(matcher.is_match(&state));

        let dead = matcher.accept(&matcher.start(), b'b');
        assert!(!matcher.can_match(&dead));
    }
}
