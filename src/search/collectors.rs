//! Multi-term collectors and the union query they feed.
//!
//! Automaton scans hand every accepted term to a collector; the
//! collector's retained cookies become per-segment scored states of a
//! multi-term union whose per-term boost is the retained similarity.

use std::collections::BTreeMap;

use crate::index::Features;
use crate::index::reader::SegmentSnapshot;
use crate::search::boolean::DisjunctionIterator;
use crate::search::{Boost, DocIterator, EmptyIterator, PostingsDocIterator, PreparedFilter};
use crate::termdict::SeekCookie;

/// Keeps every matched term as a scored state, grouped per segment.
pub struct AllTermsCollector {
    states: Vec<Vec<(SeekCookie, Boost)>>,
}

impl AllTermsCollector {
    pub fn new(segment_count: usize) -> Self {
        Self {
            states: vec![Vec::new(); segment_count],
        }
    }

    pub fn collect(&mut self, segment_ord: usize, cookie: SeekCookie, key: Boost) {
        self.states[segment_ord].push((cookie, key));
    }

    pub fn into_states(self) -> Vec<Vec<(SeekCookie, Boost)>> {
        self.states
    }
}

struct TopTerm {
    key: Boost,
    /// `(segment ord, cookie)` for every segment the term occurs in.
    segments: Vec<(usize, SeekCookie)>,
}

/// Keeps the `limit` highest-similarity terms across all segments;
/// ties prefer lexicographically smaller terms.
pub struct TopTermsCollector {
    limit: usize,
    terms: BTreeMap<Vec<u8>, TopTerm>,
}

impl TopTermsCollector {
    pub fn new(limit: usize) -> Self {
        debug_assert!(limit > 0);
        Self {
            limit,
            terms: BTreeMap::new(),
        }
    }

    pub fn collect(&mut self, segment_ord: usize, term: &[u8], cookie: SeekCookie, key: Boost) {
        if let Some(entry) = self.terms.get_mut(term) {
            entry.segments.push((segment_ord, cookie));
            return;
        }
        self.terms.insert(
            term.to_vec(),
            TopTerm {
                key,
                segments: vec![(segment_ord, cookie)],
            },
        );
        if self.terms.len() > self.limit {
            self.evict_worst();
        }
    }

    /// Worst = lowest key; among equals, the greatest term bytes.
    fn evict_worst(&mut self) {
        let mut worst: Option<(&Vec<u8>, Boost)> = None;
        for (term, entry) in &self.terms {
            let replace = match worst {
                None => true,
                Some((wterm, wkey)) => {
                    entry.key < wkey || (entry.key == wkey && term > wterm)
                }
            };
            if replace {
                worst = Some((term, entry.key));
            }
        }
        if let Some((term, _)) = worst {
            let term = term.clone();
            self.terms.remove(&term);
        }
    }

    /// Re-visit the retained cookies and aggregate them into
    /// per-segment scored states.
    pub fn into_states(self, segment_count: usize) -> Vec<Vec<(SeekCookie, Boost)>> {
        let mut states: Vec<Vec<(SeekCookie, Boost)>> = vec![Vec::new(); segment_count];
        for (_, entry) in self.terms {
            let key = entry.key.max(0.0);
            for (ord, cookie) in entry.segments {
                states[ord].push((cookie, key));
            }
        }
        states
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

/// Prepared union over a set of per-segment term states.
pub struct MultiTermPrepared {
    field: String,
    states: Vec<Vec<(SeekCookie, Boost)>>,
    boost: Boost,
}

impl MultiTermPrepared {
    pub fn new(field: String, states: Vec<Vec<(SeekCookie, Boost)>>, boost: Boost) -> Self {
        Self {
            field,
            states,
            boost,
        }
    }

    /// Number of scored term states for one segment.
    pub fn state_count(&self, segment_ord: usize) -> usize {
        self.states.get(segment_ord).map_or(0, Vec::len)
    }
}

impl PreparedFilter for MultiTermPrepared {
    fn execute(&self, ord: usize, segment: &SegmentSnapshot) -> Box<dyn DocIterator> {
        let Some(states) = self.states.get(ord) else {
            return Box::new(EmptyIterator::default());
        };
        if states.is_empty() {
            return Box::new(EmptyIterator::default());
        }
        let Some(reader) = segment.field(&self.field) else {
            return Box::new(EmptyIterator::default());
        };

        let mut children: Vec<Box<dyn DocIterator>> = Vec::with_capacity(states.len());
        for (cookie, key) in states {
            match reader.postings_from(cookie, Features::NONE) {
                Ok(postings) => {
                    children.push(Box::new(PostingsDocIterator::new(postings, key * self.boost)));
                }
                Err(err) => {
                    tracing::warn!(%err, "failed to materialize term state");
                }
            }
        }
        match children.len() {
            0 => Box::new(EmptyIterator::default()),
            1 => children.into_iter().next().unwrap(),
            _ => Box::new(DisjunctionIterator::new(children, 1)),
        }
    }

    fn boost(&self) -> Boost {
        self.boost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postings::TermStats;

    fn cookie(term: &[u8]) -> SeekCookie {
        SeekCookie {
            term: term.to_vec(),
            stats: TermStats::default(),
        }
    }

    #[test]
    fn test_all_terms_collector() {
        let mut collector = AllTermsCollector::new(2);
        collector.collect(0, cookie(b"a"), 1.0);
        collector.collect(1, cookie(b"a"), 1.0);
        collector.collect(1, cookie(b"b"), 0.5);

        let states = collector.into_states();
        assert_eq!(states[0].len(), 1);
        assert_eq!(states[1].len(), 2);
    }

    #[test]
    fn test_top_terms_keeps_highest() {
        let mut collector = TopTermsCollector::new(2);
        collector.collect(0, b"low", cookie(b"low"), 0.1);
        collector.collect(0, b"mid", cookie(b"mid"), 0.5);
        collector.collect(0, b"high", cookie(b"high"), 0.9);

        let states = collector.into_states(1);
        let terms: Vec<&[u8]> = states[0].iter().map(|(c, _)| c.term()).collect();
        assert_eq!(terms.len(), 2);
        assert!(terms.contains(&b"mid".as_ref()));
        assert!(terms.contains(&b"high".as_ref()));
    }

    #[test]
    fn test_top_terms_tie_prefers_smaller_term() {
        let mut collector = TopTermsCollector::new(2);
        collector.collect(0, b"bbb", cookie(b"bbb"), 0.5);
        collector.collect(0, b"aaa", cookie(b"aaa"), 0.5);
        collector.collect(0, b"ccc", cookie(b"ccc"), 0.5);

        let states = collector.into_states(1);
        let mut terms: Vec<&[u8]> = states[0].iter().map(|(c, _)| c.term()).collect();
        terms.sort();
        assert_eq!(terms, vec![b"aaa".as_ref(), b"bbb".as_ref()]);
    }

    #[test]
    fn test_top_terms_aggregates_segments() {
        let mut collector = TopTermsCollector::new(4);
        collector.collect(0, b"shared", cookie(b"shared"), 0.8);
        collector.collect(1, b"shared", cookie(b"shared"), 0.8);

        assert_eq!(collector.len(), 1);
        let states = collector.into_states(2);
        assert_eq!(states[0].len(), 1);
        assert_eq!(states[1].len(), 1);
    }
}
