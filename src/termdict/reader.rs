//! Burst-trie field reader.
//!
//! `prepare` verifies both term files and loads each field's index FST
//! plus summary into memory. Term readers are views borrowed from the
//! field reader; iterators hold their own duplicated cursor over `.tm`
//! so concurrent scans do not contend.

use std::collections::HashMap;
use std::sync::Arc;

use fst::Map;
use roaring::RoaringBitmap;

use crate::codec::{ext, open_checked, segment_file};
use crate::error::{Error, Result};
use crate::index::{ColumnId, Features};
use crate::postings::{PostingsIterator, PostingsReader, TermStats};
use crate::store::{DataInput, Directory, IndexInput, IoAdvice};
use crate::termdict::writer::{
    FLAG_FLOOR, FLAG_LEAF, FLAG_SHIFT, TI_FORMAT, TI_VERSION, TM_FORMAT, TM_VERSION,
};
use crate::termdict::{SeekCookie, TermMatcher};

struct FieldData {
    name: String,
    features: Features,
    norm_column: Option<ColumnId>,
    terms_count: u64,
    doc_count: u64,
    sum_doc_freq: u64,
    sum_total_term_freq: u64,
    min_term: Vec<u8>,
    max_term: Vec<u8>,
    root_fp: u64,
    fst: Map<Vec<u8>>,
}

/// Open term dictionary of one segment: per-field FSTs, the shared
/// `.tm` cursor and the postings streams.
pub struct FieldReader {
    terms_in: Box<dyn IndexInput>,
    postings: PostingsReader,
    mask: Arc<RoaringBitmap>,
    fields: Vec<FieldData>,
    by_name: HashMap<String, usize>,
}

impl FieldReader {
    /// Open and verify `.tm` + `.ti`, decode every field summary and
    /// FST. Any checksum or format problem fails the whole prepare.
    pub fn prepare(dir: &dyn Directory, segment: &str, mask: Arc<RoaringBitmap>) -> Result<Self> {
        let (terms_in, _) = open_checked(
            dir,
            &segment_file(segment, ext::TM),
            IoAdvice::Random,
            TM_FORMAT,
            TM_VERSION,
        )?;
        let (mut index_in, _) = open_checked(
            dir,
            &segment_file(segment, ext::TI),
            IoAdvice::ReadOnce,
            TI_FORMAT,
            TI_VERSION,
        )?;

        let field_count = index_in.read_vu32()? as usize;
        let mut fields = Vec::with_capacity(field_count);
        let mut by_name = HashMap::with_capacity(field_count);
        for _ in 0..field_count {
            let name = index_in.read_str()?;
            let features = Features::from_bits(index_in.read_byte()?);
            let norm_column = if index_in.read_byte()? != 0 {
                Some(index_in.read_vu32()?)
            } else {
                None
            };
            let terms_count = index_in.read_vu64()?;
            let doc_count = index_in.read_vu64()?;
            let sum_doc_freq = index_in.read_vu64()?;
            let sum_total_term_freq = index_in.read_vu64()?;
            let min_term = index_in.read_blob()?;
            let max_term = index_in.read_blob()?;
            let root_fp = index_in.read_vu64()?;
            let fst_bytes = index_in.read_blob()?;
            let fst = Map::new(fst_bytes)
                .map_err(|e| Error::index(format!("field {name:?} term index fst: {e}")))?;

            if by_name.insert(name.clone(), fields.len()).is_some() {
                return Err(Error::index(format!("duplicate field {name:?}")));
            }
            fields.push(FieldData {
                name,
                features,
                norm_column,
                terms_count,
                doc_count,
                sum_doc_freq,
                sum_total_term_freq,
                min_term,
                max_term,
                root_fp,
                fst,
            });
        }

        let postings = PostingsReader::open(dir, segment)?;
        Ok(Self {
            terms_in,
            postings,
            mask,
            fields,
            by_name,
        })
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, name: &str) -> Option<TermReader<'_>> {
        self.by_name.get(name).map(|&idx| TermReader {
            reader: self,
            data: &self.fields[idx],
        })
    }

    /// Fields in name order.
    pub fn fields(&self) -> impl Iterator<Item = TermReader<'_>> {
        self.fields.iter().map(move |data| TermReader {
            reader: self,
            data,
        })
    }

    pub(crate) fn mask(&self) -> &Arc<RoaringBitmap> {
        &self.mask
    }
}

/// Per-field view over the term dictionary; borrowed from its owning
/// [`FieldReader`].
#[derive(Clone, Copy)]
pub struct TermReader<'a> {
    reader: &'a FieldReader,
    data: &'a FieldData,
}

impl<'a> TermReader<'a> {
    pub fn name(&self) -> &'a str {
        &self.data.name
    }

    pub fn features(&self) -> Features {
        self.data.features
    }

    pub fn norm_column(&self) -> Option<ColumnId> {
        self.data.norm_column
    }

    pub fn terms_count(&self) -> u64 {
        self.data.terms_count
    }

    /// Documents with at least one posting for this field.
    pub fn docs_count(&self) -> u64 {
        self.data.doc_count
    }

    pub fn sum_doc_freq(&self) -> u64 {
        self.data.sum_doc_freq
    }

    pub fn sum_total_term_freq(&self) -> u64 {
        self.data.sum_total_term_freq
    }

    pub fn min_term(&self) -> &'a [u8] {
        &self.data.min_term
    }

    pub fn max_term(&self) -> &'a [u8] {
        &self.data.max_term
    }

    pub fn iterator(&self) -> Result<TermIterator<'a>> {
        Ok(TermIterator {
            reader: self.reader,
            data: self.data,
            input: self.reader.terms_in.dup()?,
            stack: Vec::new(),
            term: Vec::new(),
            stats: None,
            state: IterState::Unpositioned,
        })
    }

    /// Materialize postings for a previously captured cookie without
    /// another dictionary walk.
    pub fn postings_from(
        &self,
        cookie: &SeekCookie,
        requested: Features,
    ) -> Result<PostingsIterator> {
        self.reader.postings.postings(
            &cookie.stats,
            self.data.features,
            requested,
            Arc::clone(&self.reader.mask),
        )
    }

    /// Walk the trie under a byte DFA, invoking the visitor for every
    /// accepted term with the matcher payload. Subtrees whose state
    /// cannot reach a match are pruned. The visitor returns `false` to
    /// stop the walk.
    pub fn visit<M: TermMatcher>(
        &self,
        matcher: &M,
        visitor: &mut dyn FnMut(&[u8], u8, &TermStats) -> bool,
    ) -> Result<()> {
        let mut input = self.reader.terms_in.dup()?;
        let mut prefix = Vec::new();
        self.visit_node(
            input.as_mut(),
            self.data.root_fp,
            &mut prefix,
            matcher.start(),
            matcher,
            visitor,
        )?;
        Ok(())
    }

    fn visit_node<M: TermMatcher>(
        &self,
        input: &mut dyn IndexInput,
        fp: u64,
        prefix: &mut Vec<u8>,
        state: M::State,
        matcher: &M,
        visitor: &mut dyn FnMut(&[u8], u8, &TermStats) -> bool,
    ) -> Result<bool> {
        let node = parse_node(input, fp, self.data.features)?;
        match node {
            ParsedNode::Floor(groups) => {
                for (_, group_fp) in groups {
                    if !self.visit_node(input, group_fp, prefix, state.clone(), matcher, visitor)? {
                        return Ok(false);
                    }
                }
            }
            ParsedNode::Block(entries) => {
                let base_len = prefix.len();
                for entry in entries {
                    let mut entry_state = state.clone();
                    let mut alive = true;
                    for &byte in entry.suffix() {
                        entry_state = matcher.accept(&entry_state, byte);
                        if !matcher.can_match(&entry_state) {
                            alive = false;
                            break;
                        }
                    }
                    if !alive {
                        continue;
                    }
                    match entry {
                        NodeEntry::Term { suffix, stats } => {
                            if matcher.is_match(&entry_state) {
                                prefix.truncate(base_len);
                                prefix.extend_from_slice(&suffix);
                                let payload = matcher.payload(&entry_state);
                                if !visitor(prefix, payload, &stats) {
                                    prefix.truncate(base_len);
                                    return Ok(false);
                                }
                            }
                        }
                        NodeEntry::Node { suffix, fp: child } => {
                            prefix.truncate(base_len);
                            prefix.extend_from_slice(&suffix);
                            if !self.visit_node(input, child, prefix, entry_state, matcher, visitor)?
                            {
                                prefix.truncate(base_len);
                                return Ok(false);
                            }
                        }
                    }
                }
                prefix.truncate(base_len);
            }
        }
        Ok(true)
    }
}

enum NodeEntry {
    Term { suffix: Vec<u8>, stats: TermStats },
    Node { suffix: Vec<u8>, fp: u64 },
}

impl NodeEntry {
    fn suffix(&self) -> &[u8] {
        match self {
            NodeEntry::Term { suffix, .. } | NodeEntry::Node { suffix, .. } => suffix,
        }
    }
}

enum ParsedNode {
    Block(Vec<NodeEntry>),
    /// Floor routing directory: `(first lead label, block offset)` per
    /// group, ascending by label.
    Floor(Vec<(u8, u64)>),
}

fn parse_node(input: &mut dyn IndexInput, fp: u64, features: Features) -> Result<ParsedNode> {
    input.seek(fp)?;
    let code = input.read_vu32()?;
    let count = (code >> FLAG_SHIFT) as usize;

    if code & FLAG_FLOOR != 0 {
        let mut groups = Vec::with_capacity(count);
        for _ in 0..count {
            let label = input.read_byte()?;
            let delta = input.read_vu64()?;
            groups.push((label, fp - delta));
        }
        return Ok(ParsedNode::Floor(groups));
    }

    let leaf = code & FLAG_LEAF != 0;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        if leaf {
            let suffix = input.read_blob()?;
            let stats = TermStats::read(input, features)?;
            entries.push(NodeEntry::Term { suffix, stats });
        } else {
            let tagged = input.read_vu64()?;
            let len = (tagged >> 1) as usize;
            let mut suffix = vec![0u8; len];
            input.read_exact(&mut suffix)?;
            if tagged & 1 != 0 {
                let delta = input.read_vu64()?;
                entries.push(NodeEntry::Node {
                    suffix,
                    fp: fp - delta,
                });
            } else {
                let stats = TermStats::read(input, features)?;
                entries.push(NodeEntry::Term { suffix, stats });
            }
        }
    }
    Ok(ParsedNode::Block(entries))
}

/// Longest keyed prefix of `key` in the field FST, with its offset.
/// The root block is keyed by the empty prefix, so there is always a
/// match.
fn fst_deepest(fst: &Map<Vec<u8>>, key: &[u8], root_fp: u64) -> (usize, u64) {
    let raw = fst.as_fst();
    let mut node = raw.root();
    let mut out = 0u64;
    let mut best = (0, root_fp);
    if node.is_final() {
        best = (0, out + node.final_output().value());
    }
    for (i, &byte) in key.iter().enumerate() {
        let Some(t) = node.find_input(byte) else {
            break;
        };
        let transition = node.transition(t);
        out += transition.out.value();
        node = raw.node(transition.addr);
        if node.is_final() {
            best = (i + 1, out + node.final_output().value());
        }
    }
    best
}

/// Route a floor directory by the first remainder byte.
fn floor_group(groups: &[(u8, u64)], rem: &[u8]) -> usize {
    let Some(&byte) = rem.first() else {
        return 0;
    };
    match groups.binary_search_by(|(label, _)| label.cmp(&byte)) {
        Ok(idx) => idx,
        Err(0) => 0,
        Err(idx) => idx - 1,
    }
}

struct Frame {
    prefix_len: usize,
    node: ParsedNode,
    idx: usize,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum IterState {
    /// Fresh iterator; `next` starts at the first term.
    Unpositioned,
    /// Stack reflects the current term.
    Positioned,
    /// Current term/stats are valid but the stack is not (restored
    /// from a cookie or an exact seek); `next` rebuilds lazily.
    Detached,
    Exhausted,
}

/// Seek-term iterator over one field.
pub struct TermIterator<'a> {
    reader: &'a FieldReader,
    data: &'a FieldData,
    input: Box<dyn IndexInput>,
    stack: Vec<Frame>,
    term: Vec<u8>,
    stats: Option<TermStats>,
    state: IterState,
}

impl<'a> TermIterator<'a> {
    /// Current term bytes; meaningful only while positioned.
    pub fn term(&self) -> &[u8] {
        &self.term
    }

    pub fn stats(&self) -> Option<&TermStats> {
        self.stats.as_ref()
    }

    /// Lexicographic advance.
    pub fn next(&mut self) -> Result<bool> {
        match self.state {
            IterState::Exhausted => Ok(false),
            IterState::Positioned => self.advance(),
            IterState::Unpositioned => {
                let root = parse_node(self.input.as_mut(), self.data.root_fp, self.data.features)?;
                self.stack.push(Frame {
                    prefix_len: 0,
                    node: root,
                    idx: 0,
                });
                self.term.clear();
                self.state = IterState::Positioned;
                self.advance()
            }
            IterState::Detached => {
                // rebuild the stack on the current term, then step past
                let current = self.term.clone();
                if !self.seek_ge(&current)? {
                    return Ok(false);
                }
                if self.term == current {
                    self.advance()
                } else {
                    // the cookie's term vanished from under us; the
                    // least greater term is already the right answer
                    Ok(true)
                }
            }
        }
    }

    /// Exact seek via FST walk plus in-block binary search. On a miss
    /// the iterator is left unpositioned.
    pub fn seek(&mut self, target: &[u8]) -> Result<bool> {
        self.stack.clear();
        let (depth, fp) = fst_deepest(&self.data.fst, target, self.data.root_fp);
        let rem = &target[depth..];

        let mut node = parse_node(self.input.as_mut(), fp, self.data.features)?;
        if let ParsedNode::Floor(groups) = &node {
            let group = floor_group(groups, rem);
            let group_fp = groups[group].1;
            node = parse_node(self.input.as_mut(), group_fp, self.data.features)?;
        }

        let ParsedNode::Block(entries) = &node else {
            return Err(Error::index("nested floor directory"));
        };
        let found = entries
            .binary_search_by(|entry| entry.suffix().cmp(rem))
            .ok()
            .and_then(|idx| match &entries[idx] {
                NodeEntry::Term { stats, .. } => Some(stats.clone()),
                NodeEntry::Node { .. } => None,
            });

        match found {
            Some(stats) => {
                self.term = target.to_vec();
                self.stats = Some(stats);
                self.state = IterState::Detached;
                Ok(true)
            }
            None => {
                self.term.clear();
                self.stats = None;
                self.state = IterState::Unpositioned;
                Ok(false)
            }
        }
    }

    /// Seek to the least term >= `target`; descends the trie and
    /// falls back to a linear in-block lower bound at each level.
    pub fn seek_ge(&mut self, target: &[u8]) -> Result<bool> {
        self.stack.clear();
        self.term.clear();

        let root = parse_node(self.input.as_mut(), self.data.root_fp, self.data.features)?;
        self.stack.push(Frame {
            prefix_len: 0,
            node: root,
            idx: 0,
        });
        let mut rem_start = 0usize;

        loop {
            let frame = self.stack.last_mut().expect("descending frame");
            let rem = &target[rem_start..];
            match &frame.node {
                ParsedNode::Floor(groups) => {
                    let group = floor_group(groups, rem);
                    let group_fp = groups[group].1;
                    let prefix_len = frame.prefix_len;
                    frame.idx = group + 1;
                    let node = parse_node(self.input.as_mut(), group_fp, self.data.features)?;
                    self.stack.push(Frame {
                        prefix_len,
                        node,
                        idx: 0,
                    });
                }
                ParsedNode::Block(entries) => {
                    let prefix_len = frame.prefix_len;
                    let mut action = None;
                    for (i, entry) in entries.iter().enumerate() {
                        let suffix = entry.suffix();
                        let descend = matches!(entry, NodeEntry::Node { .. })
                            && suffix.len() < rem.len()
                            && rem.starts_with(suffix);
                        if descend {
                            if let NodeEntry::Node { suffix, fp } = entry {
                                action = Some((i, Some((suffix.clone(), *fp))));
                            }
                            break;
                        }
                        if suffix >= rem {
                            action = Some((i, None));
                            break;
                        }
                    }
                    match action {
                        Some((i, Some((suffix, fp)))) => {
                            frame.idx = i + 1;
                            self.term.truncate(prefix_len);
                            self.term.extend_from_slice(&suffix);
                            rem_start += suffix.len();
                            let node = parse_node(self.input.as_mut(), fp, self.data.features)?;
                            self.stack.push(Frame {
                                prefix_len: prefix_len + suffix.len(),
                                node,
                                idx: 0,
                            });
                        }
                        Some((i, None)) => {
                            frame.idx = i;
                            self.state = IterState::Positioned;
                            return self.advance();
                        }
                        None => {
                            // spill into the parent's remaining entries
                            frame.idx = entries.len();
                            self.state = IterState::Positioned;
                            return self.advance();
                        }
                    }
                }
            }
        }
    }

    /// Capture the current position for later postings re-evaluation.
    pub fn cookie(&self) -> Option<SeekCookie> {
        self.stats.as_ref().map(|stats| SeekCookie {
            term: self.term.clone(),
            stats: stats.clone(),
        })
    }

    /// Restore a captured position. Only the term and its postings
    /// pointers are restored; iteration resumes lazily from there.
    pub fn seek_cookie(&mut self, cookie: &SeekCookie) {
        self.term = cookie.term.clone();
        self.stats = Some(cookie.stats.clone());
        self.stack.clear();
        self.state = IterState::Detached;
    }

    /// Postings for the current term under the requested feature
    /// subset.
    pub fn postings(&self, requested: Features) -> Result<PostingsIterator> {
        let stats = self
            .stats
            .as_ref()
            .ok_or_else(|| Error::index("term iterator is not positioned"))?;
        self.reader.postings.postings(
            stats,
            self.data.features,
            requested,
            Arc::clone(&self.reader.mask),
        )
    }

    /// Emit the next reachable term from the current stack position.
    fn advance(&mut self) -> Result<bool> {
        loop {
            let Some(frame) = self.stack.last_mut() else {
                self.state = IterState::Exhausted;
                self.stats = None;
                return Ok(false);
            };
            let prefix_len = frame.prefix_len;

            enum Step {
                Pop,
                Emit(Vec<u8>, TermStats),
                Descend(Vec<u8>, u64, usize),
                Group(u64, usize),
            }

            let step = match &frame.node {
                ParsedNode::Floor(groups) => {
                    if frame.idx < groups.len() {
                        let fp = groups[frame.idx].1;
                        frame.idx += 1;
                        Step::Group(fp, prefix_len)
                    } else {
                        Step::Pop
                    }
                }
                ParsedNode::Block(entries) => {
                    if frame.idx < entries.len() {
                        let entry = &entries[frame.idx];
                        frame.idx += 1;
                        match entry {
                            NodeEntry::Term { suffix, stats } => {
                                Step::Emit(suffix.clone(), stats.clone())
                            }
                            NodeEntry::Node { suffix, fp } => {
                                Step::Descend(suffix.clone(), *fp, prefix_len)
                            }
                        }
                    } else {
                        Step::Pop
                    }
                }
            };

            match step {
                Step::Pop => {
                    self.stack.pop();
                }
                Step::Emit(suffix, stats) => {
                    self.term.truncate(prefix_len);
                    self.term.extend_from_slice(&suffix);
                    self.stats = Some(stats);
                    self.state = IterState::Positioned;
                    return Ok(true);
                }
                Step::Descend(suffix, fp, prefix_len) => {
                    self.term.truncate(prefix_len);
                    self.term.extend_from_slice(&suffix);
                    let node = parse_node(self.input.as_mut(), fp, self.data.features)?;
                    self.stack.push(Frame {
                        prefix_len: prefix_len + suffix.len(),
                        node,
                        idx: 0,
                    });
                }
                Step::Group(fp, prefix_len) => {
                    let node = parse_node(self.input.as_mut(), fp, self.data.features)?;
                    self.stack.push(Frame {
                        prefix_len,
                        node,
                        idx: 0,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postings::PostingsBuffer;
    use crate::store::MemoryDirectory;
    use crate::termdict::writer::FieldWriter;
    use crate::termdict::{PrefixMatcher, TermWriterOptions};

    fn small_options() -> TermWriterOptions {
        TermWriterOptions {
            min_block_size: 2,
            max_block_size: 4,
        }
    }

    fn write_terms(dir: &MemoryDirectory, terms: &[&[u8]], options: TermWriterOptions) {
        let mut writer = FieldWriter::create(dir, "seg_1", options).unwrap();
        let buffers: Vec<PostingsBuffer> = (0..terms.len())
            .map(|i| {
                let mut buffer = PostingsBuffer::default();
                buffer.add((i + 1) as u32, 0, (0, 0), None);
                buffer
            })
            .collect();
        let pairs: Vec<(&[u8], &PostingsBuffer)> = terms
            .iter()
            .copied()
            .zip(buffers.iter())
            .collect();
        writer
            .write_field("body", Features::NONE, None, pairs)
            .unwrap();
        writer.finish().unwrap();
    }

    fn open(dir: &MemoryDirectory) -> FieldReader {
        FieldReader::prepare(dir, "seg_1", Arc::new(RoaringBitmap::new())).unwrap()
    }

    #[test]
    fn test_iterate_in_order() {
        let dir = MemoryDirectory::new();
        let terms: Vec<&[u8]> = vec![b"apple", b"apricot", b"banana", b"band", b"bandana"];
        write_terms(&dir, &terms, small_options());

        let reader = open(&dir);
        let field = reader.field("body").unwrap();
        assert_eq!(field.terms_count(), 5);
        assert_eq!(field.min_term(), b"apple");
        assert_eq!(field.max_term(), b"bandana");

        let mut iterator = field.iterator().unwrap();
        let mut seen = Vec::new();
        while iterator.next().unwrap() {
            seen.push(iterator.term().to_vec());
        }
        assert_eq!(seen, terms.iter().map(|t| t.to_vec()).collect::<Vec<_>>());
    }

    #[test]
    fn test_exact_seek() {
        let dir = MemoryDirectory::new();
        let terms: Vec<&[u8]> = vec![b"apple", b"apricot", b"banana", b"band", b"bandana"];
        write_terms(&dir, &terms, small_options());

        let reader = open(&dir);
        let field = reader.field("body").unwrap();
        let mut iterator = field.iterator().unwrap();

        for term in &terms {
            assert!(iterator.seek(term).unwrap(), "seek {:?}", term);
            assert_eq!(iterator.term(), *term);
            assert!(iterator.stats().is_some());
        }
        assert!(!iterator.seek(b"ap").unwrap());
        assert!(!iterator.seek(b"bananaz").unwrap());
        assert!(!iterator.seek(b"zzz").unwrap());
    }

    #[test]
    fn test_seek_ge() {
        let dir = MemoryDirectory::new();
        let terms: Vec<&[u8]> = vec![b"apple", b"apricot", b"banana", b"band", b"bandana"];
        write_terms(&dir, &terms, small_options());

        let reader = open(&dir);
        let field = reader.field("body").unwrap();
        let mut iterator = field.iterator().unwrap();

        assert!(iterator.seek_ge(b"ap").unwrap());
        assert_eq!(iterator.term(), b"apple");

        assert!(iterator.seek_ge(b"apple").unwrap());
        assert_eq!(iterator.term(), b"apple");

        assert!(iterator.seek_ge(b"apz").unwrap());
        assert_eq!(iterator.term(), b"banana");

        assert!(iterator.seek_ge(b"banc").unwrap());
        assert_eq!(iterator.term(), b"band");

        assert!(!iterator.seek_ge(b"caramel").unwrap());
    }

    #[test]
    fn test_next_after_seek() {
        let dir = MemoryDirectory::new();
        let terms: Vec<&[u8]> = vec![b"apple", b"apricot", b"banana", b"band", b"bandana"];
        write_terms(&dir, &terms, small_options());

        let reader = open(&dir);
        let field = reader.field("body").unwrap();
        let mut iterator = field.iterator().unwrap();

        assert!(iterator.seek(b"apricot").unwrap());
        assert!(iterator.next().unwrap());
        assert_eq!(iterator.term(), b"banana");
        assert!(iterator.next().unwrap());
        assert_eq!(iterator.term(), b"band");
    }

    #[test]
    fn test_cookie_restore() {
        let dir = MemoryDirectory::new();
        let terms: Vec<&[u8]> = vec![b"apple", b"apricot", b"banana"];
        write_terms(&dir, &terms, small_options());

        let reader = open(&dir);
        let field = reader.field("body").unwrap();
        let mut iterator = field.iterator().unwrap();

        assert!(iterator.seek(b"apricot").unwrap());
        let cookie = iterator.cookie().unwrap();

        // move away, then restore
        assert!(iterator.seek_ge(b"banana").unwrap());
        iterator.seek_cookie(&cookie);
        assert_eq!(iterator.term(), b"apricot");

        let mut postings = iterator.postings(Features::NONE).unwrap();
        assert!(postings.next().unwrap());
        assert_eq!(postings.doc(), 2);

        assert!(iterator.next().unwrap());
        assert_eq!(iterator.term(), b"banana");
    }

    #[test]
    fn test_default_block_sizes_many_terms() {
        let dir = MemoryDirectory::new();
        let mut owned: Vec<Vec<u8>> = (0..500u32)
            .map(|i| format!("term{i:05}").into_bytes())
            .collect();
        owned.sort();
        let terms: Vec<&[u8]> = owned.iter().map(|t| t.as_slice()).collect();
        write_terms(&dir, &terms, TermWriterOptions::default());

        let reader = open(&dir);
        let field = reader.field("body").unwrap();
        let mut iterator = field.iterator().unwrap();
        let mut count = 0;
        while iterator.next().unwrap() {
            assert_eq!(iterator.term(), owned[count].as_slice());
            count += 1;
        }
        assert_eq!(count, 500);

        let mut iterator = field.iterator().unwrap();
        assert!(iterator.seek(b"term00123").unwrap());
        assert!(iterator.seek_ge(b"term004999").unwrap());
        assert_eq!(iterator.term(), b"term00500");
    }

    #[test]
    fn test_visit_prefix_matcher() {
        let dir = MemoryDirectory::new();
        let terms: Vec<&[u8]> = vec![b"apple", b"apricot", b"banana", b"band"];
        write_terms(&dir, &terms, small_options());

        let reader = open(&dir);
        let field = reader.field("body").unwrap();
        let matcher = PrefixMatcher::new(b"ap".to_vec());
        let mut matched = Vec::new();
        field
            .visit(&matcher, &mut |term, _payload, _stats| {
                matched.push(term.to_vec());
                true
            })
            .unwrap();
        assert_eq!(matched, vec![b"apple".to_vec(), b"apricot".to_vec()]);
    }

    #[test]
    fn test_unknown_field() {
        let dir = MemoryDirectory::new();
        write_terms(&dir, &[b"a"], small_options());
        let reader = open(&dir);
        assert!(reader.field("missing").is_none());
    }
}
