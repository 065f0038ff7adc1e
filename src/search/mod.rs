//! Query execution primitives.
//!
//! A [`Filter`] is a plain value describing what to match. `prepare`
//! binds it to an [`IndexSnapshot`], resolving terms to dictionary
//! cookies; the resulting [`PreparedFilter`] yields one ascending
//! [`DocIterator`] per segment. Structural problems never escape a
//! prepare call: they degrade to the empty filter.

mod boolean;
mod collectors;
mod levenshtein;
mod term;

pub use collectors::{AllTermsCollector, MultiTermPrepared, TopTermsCollector};
pub use levenshtein::{parametric_description, LevenshteinAutomaton, ParametricDescription};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::index::reader::{MaskedDocsIterator, SegmentSnapshot};
use crate::index::{doc_limits, DocId};
use crate::postings::PostingsIterator;

/// Score multiplier attached to filters and matched documents.
pub type Boost = f32;

/// The immutable set of segments one query round runs against.
pub struct IndexSnapshot {
    segments: Vec<SegmentSnapshot>,
}

impl IndexSnapshot {
    pub fn new(segments: Vec<SegmentSnapshot>) -> Self {
        Self { segments }
    }

    pub fn from_readers<'a, I>(readers: I) -> Self
    where
        I: IntoIterator<Item = &'a crate::index::SegmentReader>,
    {
        Self {
            segments: readers.into_iter().map(|r| r.snapshot()).collect(),
        }
    }

    pub fn segments(&self) -> &[SegmentSnapshot] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// Ascending doc-id iterator with a score attribute.
///
/// `value` is `doc_limits::INVALID` before the first `next` and
/// `doc_limits::EOF` once exhausted. Every `next` call is a safe
/// cancellation point.
pub trait DocIterator {
    fn next(&mut self) -> bool;

    fn value(&self) -> DocId;

    /// Advance to the first doc >= `target`; returns the new value.
    fn advance(&mut self, target: DocId) -> DocId {
        while !doc_limits::valid(self.value()) || self.value() < target {
            if !self.next() {
                break;
            }
        }
        self.value()
    }

    /// Score attribute of the current doc.
    fn boost(&self) -> Boost {
        1.0
    }
}

/// A filter bound to a specific reader snapshot.
pub trait PreparedFilter {
    /// Doc iterator over one segment of the snapshot the filter was
    /// prepared against.
    fn execute(&self, segment_ord: usize, segment: &SegmentSnapshot) -> Box<dyn DocIterator>;

    fn boost(&self) -> Boost {
        1.0
    }
}

/// Inclusive/exclusive/open bound of a range filter.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TermBound {
    Unbounded,
    Included(Vec<u8>),
    Excluded(Vec<u8>),
}

/// Structured query filter. Filters are pure values: two filters with
/// the same shape compare and hash equal.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Filter {
    /// Matches every live document.
    All,
    /// Matches nothing.
    Empty,
    /// Exact term match.
    Term { field: String, term: Vec<u8> },
    /// Every term starting with the prefix.
    Prefix { field: String, prefix: Vec<u8> },
    /// Terms between two byte bounds.
    Range {
        field: String,
        lower: TermBound,
        upper: TermBound,
    },
    /// Terms within a bounded Damerau-Levenshtein distance.
    EditDistance {
        field: String,
        term: Vec<u8>,
        max_distance: u8,
        with_transpositions: bool,
        /// 0 keeps every matched term; otherwise only the
        /// highest-similarity terms are retained.
        scored_terms_limit: usize,
    },
    /// All children must match; `Not` children exclude.
    And(Vec<Filter>),
    /// At least `min_match` children must match; `Not` children
    /// exclude from the union.
    Or { min_match: usize, filters: Vec<Filter> },
    /// Complement; meaningful as a boolean child, standalone it runs
    /// against `All`.
    Not(Box<Filter>),
}

impl Filter {
    pub fn term(field: impl Into<String>, term: impl Into<Vec<u8>>) -> Self {
        Filter::Term {
            field: field.into(),
            term: term.into(),
        }
    }

    pub fn prefix(field: impl Into<String>, prefix: impl Into<Vec<u8>>) -> Self {
        Filter::Prefix {
            field: field.into(),
            prefix: prefix.into(),
        }
    }

    pub fn range(field: impl Into<String>, lower: TermBound, upper: TermBound) -> Self {
        Filter::Range {
            field: field.into(),
            lower,
            upper,
        }
    }

    pub fn by_edit_distance(
        field: impl Into<String>,
        term: impl Into<Vec<u8>>,
        max_distance: u8,
        with_transpositions: bool,
        scored_terms_limit: usize,
    ) -> Self {
        Filter::EditDistance {
            field: field.into(),
            term: term.into(),
            max_distance,
            with_transpositions,
            scored_terms_limit,
        }
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::And(filters)
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Or {
            min_match: 1,
            filters,
        }
    }

    pub fn or_min_match(min_match: usize, filters: Vec<Filter>) -> Self {
        Filter::Or { min_match, filters }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(filter: Filter) -> Self {
        Filter::Not(Box::new(filter))
    }

    /// Bind this filter to a snapshot. Structural errors (missing
    /// fields are not errors; I/O or encoding problems are) log and
    /// produce the empty prepared filter.
    pub fn prepare(&self, index: &IndexSnapshot, boost: Boost) -> Box<dyn PreparedFilter> {
        let result = match self {
            Filter::All => Ok(Box::new(AllPrepared::new(boost)) as Box<dyn PreparedFilter>),
            Filter::Empty => Ok(empty_prepared()),
            Filter::Term { field, term } => term::prepare_term(index, field, term, boost),
            Filter::Prefix { field, prefix } => term::prepare_prefix(index, field, prefix, boost),
            Filter::Range {
                field,
                lower,
                upper,
            } => term::prepare_range(index, field, lower, upper, boost),
            Filter::EditDistance {
                field,
                term,
                max_distance,
                with_transpositions,
                scored_terms_limit,
            } => levenshtein::prepare_edit_distance(
                index,
                field,
                term,
                *max_distance,
                *with_transpositions,
                *scored_terms_limit,
                boost,
            ),
            Filter::And(filters) => boolean::prepare_and(index, filters, boost),
            Filter::Or { min_match, filters } => {
                boolean::prepare_or(index, *min_match, filters, boost)
            }
            Filter::Not(inner) => boolean::prepare_not(index, inner, boost),
        };
        match result {
            Ok(prepared) => prepared,
            Err(err) => {
                warn!(%err, "filter preparation failed, yielding empty filter");
                empty_prepared()
            }
        }
    }

    /// Convenience for tests and simple hosts: matching live doc ids
    /// per segment.
    pub fn matching_docs(&self, index: &IndexSnapshot) -> Vec<Vec<DocId>> {
        let prepared = self.prepare(index, 1.0);
        index
            .segments()
            .iter()
            .enumerate()
            .map(|(ord, segment)| {
                let mut iterator = prepared.execute(ord, segment);
                let mut docs = Vec::new();
                while iterator.next() {
                    docs.push(iterator.value());
                }
                docs
            })
            .collect()
    }
}

pub(crate) fn empty_prepared() -> Box<dyn PreparedFilter> {
    Box::new(EmptyPrepared)
}

/// Prepared form of [`Filter::Empty`] and of every structurally
/// broken filter.
struct EmptyPrepared;

impl PreparedFilter for EmptyPrepared {
    fn execute(&self, _ord: usize, _segment: &SegmentSnapshot) -> Box<dyn DocIterator> {
        Box::new(EmptyIterator::default())
    }
}

#[derive(Default)]
pub(crate) struct EmptyIterator {
    exhausted: bool,
}

impl DocIterator for EmptyIterator {
    fn next(&mut self) -> bool {
        self.exhausted = true;
        false
    }

    fn value(&self) -> DocId {
        if self.exhausted {
            doc_limits::EOF
        } else {
            doc_limits::INVALID
        }
    }
}

pub(crate) struct AllPrepared {
    boost: Boost,
}

impl AllPrepared {
    pub(crate) fn new(boost: Boost) -> Self {
        Self { boost }
    }
}

impl PreparedFilter for AllPrepared {
    fn execute(&self, _ord: usize, segment: &SegmentSnapshot) -> Box<dyn DocIterator> {
        Box::new(AllIterator {
            inner: segment.docs_iterator(),
            boost: self.boost,
        })
    }

    fn boost(&self) -> Boost {
        self.boost
    }
}

struct AllIterator {
    inner: MaskedDocsIterator,
    boost: Boost,
}

impl DocIterator for AllIterator {
    fn next(&mut self) -> bool {
        self.inner.next()
    }

    fn value(&self) -> DocId {
        self.inner.value()
    }

    fn boost(&self) -> Boost {
        self.boost
    }
}

/// Adapts the fallible postings iterator to the query contract; an
/// I/O error during iteration logs once and ends the stream.
pub(crate) struct PostingsDocIterator {
    postings: PostingsIterator,
    boost: Boost,
    failed: bool,
}

impl PostingsDocIterator {
    pub(crate) fn new(postings: PostingsIterator, boost: Boost) -> Self {
        Self {
            postings,
            boost,
            failed: false,
        }
    }
}

impl DocIterator for PostingsDocIterator {
    fn next(&mut self) -> bool {
        if self.failed {
            return false;
        }
        match self.postings.next() {
            Ok(more) => more,
            Err(err) => {
                warn!(%err, "postings iteration failed");
                self.failed = true;
                false
            }
        }
    }

    fn value(&self) -> DocId {
        if self.failed {
            doc_limits::EOF
        } else {
            self.postings.doc()
        }
    }

    fn boost(&self) -> Boost {
        self.boost
    }
}
