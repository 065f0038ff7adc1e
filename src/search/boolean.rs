//! Boolean composition: conjunction, disjunction with a minimum match
//! count, and exclusion.
//!
//! `Not` children contribute their inner filter to the exclude set of
//! the enclosing boolean; iterators are explicit state machines over
//! their children.

use crate::error::Result;
use crate::index::doc_limits;
use crate::index::reader::SegmentSnapshot;
use crate::index::DocId;
use crate::search::{
    empty_prepared, AllPrepared, Boost, DocIterator, Filter, IndexSnapshot, PreparedFilter,
};

/// Partition boolean children into include and exclude sets.
fn group_filters<'a>(filters: &'a [Filter]) -> (Vec<&'a Filter>, Vec<&'a Filter>) {
    let mut includes = Vec::new();
    let mut excludes = Vec::new();
    for filter in filters {
        match filter {
            Filter::Not(inner) => excludes.push(inner.as_ref()),
            other => includes.push(other),
        }
    }
    (includes, excludes)
}

pub(crate) fn prepare_and(
    index: &IndexSnapshot,
    filters: &[Filter],
    boost: Boost,
) -> Result<Box<dyn PreparedFilter>> {
    let (includes, excludes) = group_filters(filters);
    if includes.is_empty() {
        return Ok(empty_prepared());
    }

    let mut prepared_includes: Vec<Box<dyn PreparedFilter>> = includes
        .iter()
        .map(|f| f.prepare(index, boost))
        .collect();
    let prepared_excludes: Vec<Box<dyn PreparedFilter>> = excludes
        .iter()
        .map(|f| f.prepare(index, 1.0))
        .collect();

    if prepared_includes.len() == 1 && prepared_excludes.is_empty() {
        return Ok(prepared_includes.pop().unwrap());
    }
    Ok(Box::new(BooleanPrepared {
        includes: prepared_includes,
        excludes: prepared_excludes,
        min_match: usize::MAX, // conjunction
        boost,
    }))
}

pub(crate) fn prepare_or(
    index: &IndexSnapshot,
    min_match: usize,
    filters: &[Filter],
    boost: Boost,
) -> Result<Box<dyn PreparedFilter>> {
    let (includes, excludes) = group_filters(filters);
    let count = includes.len();
    let min_match = min_match.max(1);
    if count == 0 || min_match > count {
        return Ok(empty_prepared());
    }

    let mut prepared_includes: Vec<Box<dyn PreparedFilter>> = includes
        .iter()
        .map(|f| f.prepare(index, boost))
        .collect();
    let prepared_excludes: Vec<Box<dyn PreparedFilter>> = excludes
        .iter()
        .map(|f| f.prepare(index, 1.0))
        .collect();

    if count == 1 && prepared_excludes.is_empty() {
        return Ok(prepared_includes.pop().unwrap());
    }
    Ok(Box::new(BooleanPrepared {
        includes: prepared_includes,
        excludes: prepared_excludes,
        // requiring every child is exactly a conjunction
        min_match: if min_match == count {
            usize::MAX
        } else {
            min_match
        },
        boost,
    }))
}

/// Standalone `Not` runs its inner filter against everything.
pub(crate) fn prepare_not(
    index: &IndexSnapshot,
    inner: &Filter,
    boost: Boost,
) -> Result<Box<dyn PreparedFilter>> {
    Ok(Box::new(BooleanPrepared {
        includes: vec![Box::new(AllPrepared::new(boost))],
        excludes: vec![inner.prepare(index, 1.0)],
        min_match: usize::MAX,
        boost,
    }))
}

/// Prepared boolean; `min_match == usize::MAX` selects conjunction.
struct BooleanPrepared {
    includes: Vec<Box<dyn PreparedFilter>>,
    excludes: Vec<Box<dyn PreparedFilter>>,
    min_match: usize,
    boost: Boost,
}

impl PreparedFilter for BooleanPrepared {
    fn execute(&self, ord: usize, segment: &SegmentSnapshot) -> Box<dyn DocIterator> {
        let children: Vec<Box<dyn DocIterator>> = self
            .includes
            .iter()
            .map(|p| p.execute(ord, segment))
            .collect();

        let combined: Box<dyn DocIterator> = if children.len() == 1 {
            children.into_iter().next().unwrap()
        } else if self.min_match == usize::MAX {
            Box::new(ConjunctionIterator::new(children))
        } else {
            Box::new(DisjunctionIterator::new(children, self.min_match))
        };

        if self.excludes.is_empty() {
            return combined;
        }
        let excluded: Vec<Box<dyn DocIterator>> = self
            .excludes
            .iter()
            .map(|p| p.execute(ord, segment))
            .collect();
        let exclude: Box<dyn DocIterator> = if excluded.len() == 1 {
            excluded.into_iter().next().unwrap()
        } else {
            Box::new(DisjunctionIterator::new(excluded, 1))
        };
        Box::new(ExclusionIterator {
            include: combined,
            exclude,
        })
    }

    fn boost(&self) -> Boost {
        self.boost
    }
}

/// All children at the same doc; leapfrogs on the first child and
/// aligns the rest.
pub(crate) struct ConjunctionIterator {
    children: Vec<Box<dyn DocIterator>>,
    current: DocId,
}

impl ConjunctionIterator {
    pub(crate) fn new(children: Vec<Box<dyn DocIterator>>) -> Self {
        debug_assert!(children.len() > 1);
        Self {
            children,
            current: doc_limits::INVALID,
        }
    }

    fn align(&mut self) -> bool {
        'outer: loop {
            let mut target = self.children[0].value();
            if target == doc_limits::EOF {
                self.current = doc_limits::EOF;
                return false;
            }
            for i in 1..self.children.len() {
                let doc = self.children[i].advance(target);
                if doc == doc_limits::EOF {
                    self.current = doc_limits::EOF;
                    return false;
                }
                if doc > target {
                    target = self.children[0].advance(doc);
                    if target == doc_limits::EOF {
                        self.current = doc_limits::EOF;
                        return false;
                    }
                    continue 'outer;
                }
            }
            self.current = target;
            return true;
        }
    }
}

impl DocIterator for ConjunctionIterator {
    fn next(&mut self) -> bool {
        if self.current == doc_limits::EOF {
            return false;
        }
        if !self.children[0].next() {
            self.current = doc_limits::EOF;
            return false;
        }
        self.align()
    }

    fn advance(&mut self, target: DocId) -> DocId {
        if self.current == doc_limits::EOF {
            return doc_limits::EOF;
        }
        if self.children[0].advance(target) == doc_limits::EOF {
            self.current = doc_limits::EOF;
            return doc_limits::EOF;
        }
        self.align();
        self.current
    }

    fn value(&self) -> DocId {
        self.current
    }

    fn boost(&self) -> Boost {
        self.children.iter().map(|c| c.boost()).sum()
    }
}

struct DisjunctionChild {
    iterator: Box<dyn DocIterator>,
    doc: DocId,
}

/// At least `min_match` children on the same doc.
pub(crate) struct DisjunctionIterator {
    children: Vec<DisjunctionChild>,
    min_match: usize,
    current: DocId,
    current_boost: Boost,
    primed: bool,
}

impl DisjunctionIterator {
    pub(crate) fn new(children: Vec<Box<dyn DocIterator>>, min_match: usize) -> Self {
        Self {
            children: children
                .into_iter()
                .map(|iterator| DisjunctionChild {
                    iterator,
                    doc: doc_limits::INVALID,
                })
                .collect(),
            min_match: min_match.max(1),
            current: doc_limits::INVALID,
            current_boost: 0.0,
            primed: false,
        }
    }

    fn prime(&mut self) {
        for child in &mut self.children {
            child.doc = if child.iterator.next() {
                child.iterator.value()
            } else {
                doc_limits::EOF
            };
        }
        self.primed = true;
    }
}

impl DocIterator for DisjunctionIterator {
    fn next(&mut self) -> bool {
        if self.current == doc_limits::EOF {
            return false;
        }
        if !self.primed {
            self.prime();
        }
        loop {
            let min = self
                .children
                .iter()
                .map(|c| c.doc)
                .min()
                .unwrap_or(doc_limits::EOF);
            if min == doc_limits::EOF {
                self.current = doc_limits::EOF;
                return false;
            }

            let mut count = 0usize;
            let mut boost: Boost = 0.0;
            for child in &mut self.children {
                if child.doc == min {
                    count += 1;
                    boost = boost.max(child.iterator.boost());
                    child.doc = if child.iterator.next() {
                        child.iterator.value()
                    } else {
                        doc_limits::EOF
                    };
                }
            }

            if count >= self.min_match {
                self.current = min;
                self.current_boost = boost;
                return true;
            }
        }
    }

    fn value(&self) -> DocId {
        self.current
    }

    fn boost(&self) -> Boost {
        self.current_boost
    }
}

/// Documents of `include` that `exclude` does not match.
pub(crate) struct ExclusionIterator {
    include: Box<dyn DocIterator>,
    exclude: Box<dyn DocIterator>,
}

impl ExclusionIterator {
    pub(crate) fn new(include: Box<dyn DocIterator>, exclude: Box<dyn DocIterator>) -> Self {
        Self { include, exclude }
    }
}

impl DocIterator for ExclusionIterator {
    fn next(&mut self) -> bool {
        while self.include.next() {
            let doc = self.include.value();
            if self.exclude.advance(doc) != doc {
                return true;
            }
        }
        false
    }

    fn value(&self) -> DocId {
        self.include.value()
    }

    fn boost(&self) -> Boost {
        self.include.boost()
    }
}
