//! Term, prefix and range filters over the term dictionary.

use crate::error::Result;
use crate::index::Features;
use crate::index::reader::SegmentSnapshot;
use crate::search::collectors::MultiTermPrepared;
use crate::search::{Boost, DocIterator, IndexSnapshot, PostingsDocIterator, PreparedFilter, TermBound};
use crate::termdict::SeekCookie;

/// Exact term filter: one FST seek per segment at prepare time.
pub(crate) fn prepare_term(
    index: &IndexSnapshot,
    field: &str,
    term: &[u8],
    boost: Boost,
) -> Result<Box<dyn PreparedFilter>> {
    let mut states: Vec<Option<SeekCookie>> = Vec::with_capacity(index.len());
    for segment in index.segments() {
        let state = match segment.field(field) {
            Some(reader) => {
                let mut iterator = reader.iterator()?;
                if iterator.seek(term)? {
                    iterator.cookie()
                } else {
                    None
                }
            }
            None => None,
        };
        states.push(state);
    }
    Ok(Box::new(TermPrepared {
        field: field.to_string(),
        states,
        boost,
    }))
}

struct TermPrepared {
    field: String,
    states: Vec<Option<SeekCookie>>,
    boost: Boost,
}

impl PreparedFilter for TermPrepared {
    fn execute(&self, ord: usize, segment: &SegmentSnapshot) -> Box<dyn DocIterator> {
        let Some(Some(cookie)) = self.states.get(ord) else {
            return Box::new(crate::search::EmptyIterator::default());
        };
        let Some(reader) = segment.field(&self.field) else {
            return Box::new(crate::search::EmptyIterator::default());
        };
        match reader.postings_from(cookie, Features::NONE) {
            Ok(postings) => Box::new(PostingsDocIterator::new(postings, self.boost)),
            Err(err) => {
                tracing::warn!(%err, "failed to materialize postings");
                Box::new(crate::search::EmptyIterator::default())
            }
        }
    }

    fn boost(&self) -> Boost {
        self.boost
    }
}

/// Prefix filter: seek to the prefix, then take the whole subtree.
pub(crate) fn prepare_prefix(
    index: &IndexSnapshot,
    field: &str,
    prefix: &[u8],
    boost: Boost,
) -> Result<Box<dyn PreparedFilter>> {
    let mut states: Vec<Vec<(SeekCookie, Boost)>> = Vec::with_capacity(index.len());
    for segment in index.segments() {
        let mut collected = Vec::new();
        if let Some(reader) = segment.field(field) {
            let mut iterator = reader.iterator()?;
            let mut more = iterator.seek_ge(prefix)?;
            while more && iterator.term().starts_with(prefix) {
                if let Some(cookie) = iterator.cookie() {
                    collected.push((cookie, 1.0));
                }
                more = iterator.next()?;
            }
        }
        states.push(collected);
    }
    Ok(Box::new(MultiTermPrepared::new(
        field.to_string(),
        states,
        boost,
    )))
}

/// Range filter: a lower-bound seek plus a bounded scan.
pub(crate) fn prepare_range(
    index: &IndexSnapshot,
    field: &str,
    lower: &TermBound,
    upper: &TermBound,
    boost: Boost,
) -> Result<Box<dyn PreparedFilter>> {
    let mut states: Vec<Vec<(SeekCookie, Boost)>> = Vec::with_capacity(index.len());
    for segment in index.segments() {
        let mut collected = Vec::new();
        if let Some(reader) = segment.field(field) {
            let mut iterator = reader.iterator()?;
            let mut more = match lower {
                TermBound::Unbounded => {
                    // position on the first term
                    iterator.next()?
                }
                TermBound::Included(bound) => iterator.seek_ge(bound)?,
                TermBound::Excluded(bound) => {
                    let mut positioned = iterator.seek_ge(bound)?;
                    if positioned && iterator.term() == bound.as_slice() {
                        positioned = iterator.next()?;
                    }
                    positioned
                }
            };
            while more {
                let within = match upper {
                    TermBound::Unbounded => true,
                    TermBound::Included(bound) => iterator.term() <= bound.as_slice(),
                    TermBound::Excluded(bound) => iterator.term() < bound.as_slice(),
                };
                if !within {
                    break;
                }
                if let Some(cookie) = iterator.cookie() {
                    collected.push((cookie, 1.0));
                }
                more = iterator.next()?;
            }
        }
        states.push(collected);
    }
    Ok(Box::new(MultiTermPrepared::new(
        field.to_string(),
        states,
        boost,
    )))
}
