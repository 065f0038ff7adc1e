//! Bounded edit-distance matching.
//!
//! A cached parametric description expands into a Levenshtein
//! automaton for a concrete query term; the automaton is fed bytes by
//! the term-dictionary walk, decoding UTF-8 incrementally and carrying
//! the exact edit distance of every accepted term as its payload.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::error::Result;
use crate::search::collectors::{AllTermsCollector, MultiTermPrepared, TopTermsCollector};
use crate::search::{empty_prepared, term, Boost, IndexSnapshot, PreparedFilter};
use crate::termdict::{SeekCookie, TermMatcher};

/// Largest supported edit distance; larger bounds have no description
/// and prepare to the empty filter.
pub const MAX_DISTANCE: u8 = 4;

/// Precomputed recipe for Levenshtein automata with a fixed distance
/// bound and transposition setting. Descriptions are cached by
/// `(max_distance, with_transpositions)`.
#[derive(Debug)]
pub struct ParametricDescription {
    max_distance: u8,
    with_transpositions: bool,
}

impl ParametricDescription {
    pub fn max_distance(&self) -> u8 {
        self.max_distance
    }

    pub fn with_transpositions(&self) -> bool {
        self.with_transpositions
    }
}

static DESCRIPTIONS: Mutex<Vec<((u8, bool), Arc<ParametricDescription>)>> = Mutex::new(Vec::new());

/// Description provider; `None` for unsupported distances.
pub fn parametric_description(
    max_distance: u8,
    with_transpositions: bool,
) -> Option<Arc<ParametricDescription>> {
    if max_distance == 0 || max_distance > MAX_DISTANCE {
        return None;
    }
    let key = (max_distance, with_transpositions);
    let mut cache = DESCRIPTIONS.lock();
    if let Some((_, description)) = cache.iter().find(|(k, _)| *k == key) {
        return Some(Arc::clone(description));
    }
    let description = Arc::new(ParametricDescription {
        max_distance,
        with_transpositions,
    });
    cache.push((key, Arc::clone(&description)));
    Some(description)
}

/// One live NFA position: `offset` query chars consumed with `edits`
/// errors; `transposing` marks the half-finished transposition state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Position {
    offset: u32,
    edits: u8,
    transposing: bool,
}

/// Automaton state: the reduced position set plus the partial UTF-8
/// sequence being decoded.
#[derive(Clone, Debug)]
pub struct LevState {
    positions: Vec<Position>,
    pending: [u8; 4],
    pending_len: u8,
    pending_need: u8,
}

impl LevState {
    fn dead() -> Self {
        Self {
            positions: Vec::new(),
            pending: [0; 4],
            pending_len: 0,
            pending_need: 0,
        }
    }
}

/// Levenshtein automaton over one query term.
pub struct LevenshteinAutomaton {
    query: Vec<char>,
    max_distance: u8,
    with_transpositions: bool,
}

impl LevenshteinAutomaton {
    pub fn new(description: &ParametricDescription, query: &str) -> Self {
        Self {
            query: query.chars().collect(),
            max_distance: description.max_distance,
            with_transpositions: description.with_transpositions,
        }
    }

    fn step(&self, positions: &[Position], input: char) -> Vec<Position> {
        let m = self.query.len() as u32;
        let mut next = Vec::with_capacity(positions.len() * 2);

        for &pos in positions {
            let i = pos.offset;
            let e = pos.edits;

            if pos.transposing {
                // only completing the transposition keeps this branch
                if self.query[i as usize] == input {
                    next.push(Position {
                        offset: i + 2,
                        edits: e,
                        transposing: false,
                    });
                }
                continue;
            }

            if i < m && self.query[i as usize] == input {
                next.push(Position {
                    offset: i + 1,
                    edits: e,
                    transposing: false,
                });
            }
            if e < self.max_distance {
                // the input char is extra
                next.push(Position {
                    offset: i,
                    edits: e + 1,
                    transposing: false,
                });
                if i < m {
                    // substitution
                    next.push(Position {
                        offset: i + 1,
                        edits: e + 1,
                        transposing: false,
                    });
                }
                // skip k query chars, then match the input char
                let budget = (self.max_distance - e) as u32;
                for k in 1..=budget {
                    let probe = i + k;
                    if probe >= m {
                        break;
                    }
                    if self.query[probe as usize] == input {
                        next.push(Position {
                            offset: probe + 1,
                            edits: e + k as u8,
                            transposing: false,
                        });
                    }
                }
                if self.with_transpositions
                    && i + 1 < m
                    && self.query[(i + 1) as usize] == input
                {
                    next.push(Position {
                        offset: i,
                        edits: e + 1,
                        transposing: true,
                    });
                }
            }
        }

        reduce(&mut next);
        next
    }

    fn distance(&self, positions: &[Position]) -> Option<u8> {
        let m = self.query.len() as u32;
        positions
            .iter()
            .filter(|p| !p.transposing)
            .map(|p| p.edits as u32 + (m - p.offset))
            .filter(|&d| d <= u32::from(self.max_distance))
            .min()
            .map(|d| d as u8)
    }
}

/// Drop duplicates and positions subsumed by a cheaper one.
fn reduce(positions: &mut Vec<Position>) {
    positions.sort_unstable();
    positions.dedup();
    let snapshot = positions.clone();
    positions.retain(|p| {
        !snapshot.iter().any(|q| {
            q != p
                && !q.transposing
                && !p.transposing
                && q.edits < p.edits
                && (i64::from(q.offset) - i64::from(p.offset)).unsigned_abs()
                    <= u64::from(p.edits - q.edits)
        })
    });
}

fn utf8_width(byte: u8) -> Option<u8> {
    match byte {
        0x00..=0x7F => Some(1),
        0xC0..=0xDF => Some(2),
        0xE0..=0xEF => Some(3),
        0xF0..=0xF7 => Some(4),
        _ => None,
    }
}

impl TermMatcher for LevenshteinAutomaton {
    type State = LevState;

    fn start(&self) -> LevState {
        LevState {
            positions: vec![Position {
                offset: 0,
                edits: 0,
                transposing: false,
            }],
            pending: [0; 4],
            pending_len: 0,
            pending_need: 0,
        }
    }

    fn accept(&self, state: &LevState, byte: u8) -> LevState {
        if state.positions.is_empty() {
            return LevState::dead();
        }
        let mut next = state.clone();
        if next.pending_need == 0 {
            match utf8_width(byte) {
                Some(1) => {
                    next.positions = self.step(&next.positions, byte as char);
                    return next;
                }
                Some(width) => {
                    next.pending[0] = byte;
                    next.pending_len = 1;
                    next.pending_need = width;
                    return next;
                }
                None => return LevState::dead(),
            }
        }
        if byte & 0xC0 != 0x80 {
            return LevState::dead();
        }
        next.pending[next.pending_len as usize] = byte;
        next.pending_len += 1;
        if next.pending_len == next.pending_need {
            let decoded = std::str::from_utf8(&next.pending[..next.pending_len as usize])
                .ok()
                .and_then(|s| s.chars().next());
            next.pending_len = 0;
            next.pending_need = 0;
            match decoded {
                Some(input) => next.positions = self.step(&next.positions, input),
                None => return LevState::dead(),
            }
        }
        next
    }

    fn can_match(&self, state: &LevState) -> bool {
        !state.positions.is_empty()
    }

    fn is_match(&self, state: &LevState) -> bool {
        state.pending_need == 0 && self.distance(&state.positions).is_some()
    }

    fn payload(&self, state: &LevState) -> u8 {
        self.distance(&state.positions).unwrap_or(self.max_distance + 1)
    }
}

/// Similarity key of a matched term.
fn similarity(distance: u8, term_chars: usize, query_chars: usize) -> f32 {
    let size = term_chars.min(query_chars).max(1);
    1.0 - f32::from(distance) / size as f32
}

pub(crate) fn prepare_edit_distance(
    index: &IndexSnapshot,
    field: &str,
    query_term: &[u8],
    max_distance: u8,
    with_transpositions: bool,
    scored_terms_limit: usize,
    boost: Boost,
) -> Result<Box<dyn PreparedFilter>> {
    // no edits allowed collapses to an exact term lookup
    if max_distance == 0 {
        return term::prepare_term(index, field, query_term, boost);
    }
    let Some(description) = parametric_description(max_distance, with_transpositions) else {
        warn!(max_distance, "no parametric description for distance");
        return Ok(empty_prepared());
    };
    let Ok(query) = std::str::from_utf8(query_term) else {
        warn!("edit-distance query term is not valid utf-8");
        return Ok(empty_prepared());
    };

    let automaton = LevenshteinAutomaton::new(&description, query);
    let query_chars = query.chars().count();

    let states = if scored_terms_limit == 0 {
        let mut collector = AllTermsCollector::new(index.len());
        for (ord, segment) in index.segments().iter().enumerate() {
            let Some(reader) = segment.field(field) else {
                continue;
            };
            reader.visit(&automaton, &mut |term, distance, stats| {
                let term_chars = std::str::from_utf8(term)
                    .map(|s| s.chars().count())
                    .unwrap_or(term.len());
                let key = similarity(distance, term_chars, query_chars);
                collector.collect(
                    ord,
                    SeekCookie {
                        term: term.to_vec(),
                        stats: stats.clone(),
                    },
                    key,
                );
                true
            })?;
        }
        collector.into_states()
    } else {
        let mut collector = TopTermsCollector::new(scored_terms_limit);
        for (ord, segment) in index.segments().iter().enumerate() {
            let Some(reader) = segment.field(field) else {
                continue;
            };
            reader.visit(&automaton, &mut |term, distance, stats| {
                let term_chars = std::str::from_utf8(term)
                    .map(|s| s.chars().count())
                    .unwrap_or(term.len());
                let key = similarity(distance, term_chars, query_chars);
                collector.collect(
                    ord,
                    term,
                    SeekCookie {
                        term: term.to_vec(),
                        stats: stats.clone(),
                    },
                    key,
                );
                true
            })?;
        }
        collector.into_states(index.len())
    };

    Ok(Box::new(MultiTermPrepared::new(
        field.to_string(),
        states,
        boost,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn automaton(query: &str, max_distance: u8, transpositions: bool) -> LevenshteinAutomaton {
        let description = parametric_description(max_distance, transpositions).unwrap();
        LevenshteinAutomaton::new(&description, query)
    }

    fn run(automaton: &LevenshteinAutomaton, term: &str) -> Option<u8> {
        let mut state = automaton.start();
        for &byte in term.as_bytes() {
            state = automaton.accept(&state, byte);
            if !automaton.can_match(&state) {
                return None;
            }
        }
        automaton
            .is_match(&state)
            .then(|| automaton.payload(&state))
    }

    /// Reference Damerau-Levenshtein (restricted transposition).
    fn reference_distance(a: &str, b: &str, transpositions: bool) -> usize {
        let a: Vec<char> = a.chars().collect();
        let b: Vec<char> = b.chars().collect();
        let mut d = vec![vec![0usize; b.len() + 1]; a.len() + 1];
        for (i, row) in d.iter_mut().enumerate() {
            row[0] = i;
        }
        for j in 0..=b.len() {
            d[0][j] = j;
        }
        for i in 1..=a.len() {
            for j in 1..=b.len() {
                let cost = usize::from(a[i - 1] != b[j - 1]);
                d[i][j] = (d[i - 1][j] + 1)
                    .min(d[i][j - 1] + 1)
                    .min(d[i - 1][j - 1] + cost);
                if transpositions
                    && i > 1
                    && j > 1
                    && a[i - 1] == b[j - 2]
                    && a[i - 2] == b[j - 1]
                {
                    d[i][j] = d[i][j].min(d[i - 2][j - 2] + 1);
                }
            }
        }
        d[a.len()][b.len()]
    }

    #[test]
    fn test_provider_bounds() {
        assert!(parametric_description(0, false).is_none());
        assert!(parametric_description(5, true).is_none());
        assert!(parametric_description(1, false).is_some());
        assert!(parametric_description(4, true).is_some());
    }

    #[test]
    fn test_provider_caches() {
        let a = parametric_description(2, true).unwrap();
        let b = parametric_description(2, true).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_exact_match_distance_zero() {
        let automaton = automaton("apple", 2, false);
        assert_eq!(run(&automaton, "apple"), Some(0));
    }

    #[test]
    fn test_basic_edits() {
        let automaton = automaton("apple", 1, false);
        assert_eq!(run(&automaton, "aple"), Some(1)); // deletion
        assert_eq!(run(&automaton, "apples"), Some(1)); // insertion
        assert_eq!(run(&automaton, "appme"), Some(1)); // substitution
        assert_eq!(run(&automaton, "banana"), None);
        assert_eq!(run(&automaton, "apricot"), None);
    }

    #[test]
    fn test_transpositions() {
        let without = automaton("apple", 1, false);
        assert_eq!(run(&without, "aplpe"), None); // swap costs 2 edits plain

        let with = automaton("apple", 1, true);
        assert_eq!(run(&with, "aplpe"), Some(1));
    }

    #[test]
    fn test_matches_reference_distance() {
        let queries = ["rust", "search", "ab", "", "banana"];
        let terms = [
            "rust", "rusty", "ruts", "rst", "crust", "sear", "searches", "ba", "ab", "abba",
            "banana", "bananas", "nanaba", "x", "",
        ];
        for transpositions in [false, true] {
            for max_distance in 1..=3u8 {
                for query in &queries {
                    let automaton = automaton(query, max_distance, transpositions);
                    for term in &terms {
                        let expected = reference_distance(query, term, transpositions);
                        let got = run(&automaton, term);
                        if expected <= max_distance as usize {
                            assert_eq!(
                                got,
                                Some(expected as u8),
                                "query={query:?} term={term:?} d={max_distance} t={transpositions}"
                            );
                        } else {
                            assert_eq!(
                                got, None,
                                "query={query:?} term={term:?} d={max_distance} t={transpositions}"
                            );
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_multibyte_input() {
        let automaton = automaton("über", 1, false);
        assert_eq!(run(&automaton, "über"), Some(0));
        assert_eq!(run(&automaton, "uber"), Some(1));
        assert_eq!(run(&automaton, "übers"), Some(1));
    }

    #[test]
    fn test_similarity_key() {
        assert_eq!(similarity(0, 5, 5), 1.0);
        assert_eq!(similarity(1, 4, 5), 0.75);
        assert_eq!(similarity(2, 1, 1), -1.0);
    }

    #[test]
    fn test_invalid_utf8_is_dead() {
        let automaton = automaton("abc", 2, false);
        let state = automaton.accept(&automaton.start(), 0xFF);
        assert!(!automaton.can_match(&state));
    }
}
