//! Burst-trie field writer.
//!
//! Terms arrive sorted. A pending stack accumulates TERM entries; when
//! the shared-prefix boundary retreats, the run of entries above the
//! boundary is flushed as one or more suffix blocks and replaced by a
//! single BLOCK entry in the parent level. Oversized runs split into
//! floor groups routed by lead label through a small directory node;
//! every emitted node lands in the field's index FST as
//! `prefix → file offset`.

use fst::MapBuilder;
use roaring::RoaringBitmap;

use crate::codec::{ext, segment_file, write_footer, write_header};
use crate::error::{Error, Result};
use crate::index::{ColumnId, Features};
use crate::postings::{PostingsBuffer, PostingsWriter};
use crate::store::{DataOutput, Directory, IndexOutput};
use crate::termdict::TermWriterOptions;

pub(crate) const TM_FORMAT: u16 = 10;
pub(crate) const TM_VERSION: u16 = 0;
pub(crate) const TI_FORMAT: u16 = 11;
pub(crate) const TI_VERSION: u16 = 0;

/// Node flag bits in the leading code varint.
pub(crate) const FLAG_LEAF: u32 = 1;
pub(crate) const FLAG_HAS_SUB_BLOCKS: u32 = 2;
pub(crate) const FLAG_FLOOR: u32 = 4;
pub(crate) const FLAG_SHIFT: u32 = 3;

enum PendingEntry {
    Term {
        term: Vec<u8>,
        stats_blob: Vec<u8>,
    },
    Node {
        prefix: Vec<u8>,
        fp: u64,
    },
}

impl PendingEntry {
    fn key(&self) -> &[u8] {
        match self {
            PendingEntry::Term { term, .. } => term,
            PendingEntry::Node { prefix, .. } => prefix,
        }
    }
}

struct FieldSummary {
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
    fst_bytes: Vec<u8>,
}

/// Writes every field's term dictionary for one segment.
pub struct FieldWriter {
    segment: String,
    terms_out: Box<dyn IndexOutput>,
    index_out: Box<dyn IndexOutput>,
    postings: PostingsWriter,
    options: TermWriterOptions,
    fields: Vec<FieldSummary>,

    // per-field state, reset by `begin_field`
    pending: Vec<PendingEntry>,
    last_term: Vec<u8>,
    prefix_starts: Vec<usize>,
    fst_entries: Vec<(Vec<u8>, u64)>,
    min_term: Option<Vec<u8>>,
    max_term: Vec<u8>,
    terms_count: u64,
    sum_doc_freq: u64,
    sum_total_term_freq: u64,
    docs_seen: RoaringBitmap,
}

impl FieldWriter {
    pub fn create(dir: &dyn Directory, segment: &str, options: TermWriterOptions) -> Result<Self> {
        options.validate()?;
        let mut terms_out = dir.create(&segment_file(segment, ext::TM))?;
        write_header(terms_out.as_mut(), TM_FORMAT, TM_VERSION)?;
        let mut index_out = dir.create(&segment_file(segment, ext::TI))?;
        write_header(index_out.as_mut(), TI_FORMAT, TI_VERSION)?;
        let postings = PostingsWriter::create(dir, segment)?;
        Ok(Self {
            segment: segment.to_string(),
            terms_out,
            index_out,
            postings,
            options,
            fields: Vec::new(),
            pending: Vec::new(),
            last_term: Vec::new(),
            prefix_starts: Vec::new(),
            fst_entries: Vec::new(),
            min_term: None,
            max_term: Vec::new(),
            terms_count: 0,
            sum_doc_freq: 0,
            sum_total_term_freq: 0,
            docs_seen: RoaringBitmap::new(),
        })
    }

    /// Write one field. `terms` must be strictly ascending; fields must
    /// arrive sorted by name. Empty postings are dropped; a field that
    /// ends up with no terms leaves no trace.
    pub fn write_field<'a, I>(
        &mut self,
        name: &str,
        features: Features,
        norm_column: Option<ColumnId>,
        terms: I,
    ) -> Result<()>
    where
        I: IntoIterator<Item = (&'a [u8], &'a PostingsBuffer)>,
    {
        if let Some(last) = self.fields.last() {
            if last.name.as_str() >= name {
                return Err(Error::index(format!(
                    "fields written out of order: {name:?} after {:?}",
                    last.name
                )));
            }
        }
        self.begin_field();

        for (term, postings) in terms {
            if postings.doc_freq() == 0 {
                continue;
            }
            if self.terms_count > 0 && self.last_term.as_slice() >= term {
                return Err(Error::index("terms out of order"));
            }
            let stats = self.postings.write_term(features, postings)?;
            self.push_term(term)?;

            let mut stats_blob = Vec::new();
            stats.write(&mut stats_blob, features)?;
            self.pending.push(PendingEntry::Term {
                term: term.to_vec(),
                stats_blob,
            });

            if self.min_term.is_none() {
                self.min_term = Some(term.to_vec());
            }
            self.max_term = term.to_vec();
            self.terms_count += 1;
            self.sum_doc_freq += u64::from(stats.doc_freq);
            self.sum_total_term_freq += stats.total_term_freq;
            for doc in postings.docs() {
                self.docs_seen.insert(doc);
            }
        }

        self.end_field(name, features, norm_column)
    }

    /// Seal `.tm`, write `.ti` with the per-field FSTs, and close the
    /// postings streams. Returns every file name written.
    pub fn finish(&mut self) -> Result<Vec<String>> {
        write_footer(self.terms_out.as_mut())?;
        self.terms_out.close()?;

        self.index_out.write_vu32(self.fields.len() as u32)?;
        for field in &self.fields {
            self.index_out.write_str(&field.name)?;
            self.index_out.write_byte(field.features.bits())?;
            match field.norm_column {
                Some(column) => {
                    self.index_out.write_byte(1)?;
                    self.index_out.write_vu32(column)?;
                }
                None => self.index_out.write_byte(0)?,
            }
            self.index_out.write_vu64(field.terms_count)?;
            self.index_out.write_vu64(field.doc_count)?;
            self.index_out.write_vu64(field.sum_doc_freq)?;
            self.index_out.write_vu64(field.sum_total_term_freq)?;
            self.index_out.write_blob(&field.min_term)?;
            self.index_out.write_blob(&field.max_term)?;
            self.index_out.write_vu64(field.root_fp)?;
            self.index_out.write_blob(&field.fst_bytes)?;
        }
        write_footer(self.index_out.as_mut())?;
        self.index_out.close()?;

        let mut files = self.postings.finish()?;
        files.push(segment_file(&self.segment, ext::TM));
        files.push(segment_file(&self.segment, ext::TI));
        Ok(files)
    }

    fn begin_field(&mut self) {
        self.pending.clear();
        self.last_term.clear();
        self.prefix_starts.clear();
        self.fst_entries.clear();
        self.min_term = None;
        self.max_term.clear();
        self.terms_count = 0;
        self.sum_doc_freq = 0;
        self.sum_total_term_freq = 0;
        self.docs_seen.clear();
    }

    fn end_field(
        &mut self,
        name: &str,
        features: Features,
        norm_column: Option<ColumnId>,
    ) -> Result<()> {
        if self.terms_count == 0 {
            return Ok(());
        }
        // close every open level, then collapse the remainder to a root
        self.push_term(&[])?;
        let count = self.pending.len();
        self.write_blocks(0, count)?;
        debug_assert_eq!(self.pending.len(), 1);

        let root_fp = match self.pending.pop() {
            Some(PendingEntry::Node { fp, .. }) => fp,
            _ => return Err(Error::index("term trie did not collapse to a root block")),
        };

        self.fst_entries.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        let mut builder = MapBuilder::memory();
        for (prefix, fp) in &self.fst_entries {
            builder
                .insert(prefix, *fp)
                .map_err(|e| Error::index(format!("term index fst: {e}")))?;
        }
        let fst_bytes = builder
            .into_inner()
            .map_err(|e| Error::index(format!("term index fst: {e}")))?;

        self.fields.push(FieldSummary {
            name: name.to_string(),
            features,
            norm_column,
            terms_count: self.terms_count,
            doc_count: self.docs_seen.len(),
            sum_doc_freq: self.sum_doc_freq,
            sum_total_term_freq: self.sum_total_term_freq,
            min_term: self.min_term.take().unwrap_or_default(),
            max_term: std::mem::take(&mut self.max_term),
            root_fp,
            fst_bytes,
        });
        Ok(())
    }

    /// Close the levels the new term abandons, then open its tail.
    fn push_term(&mut self, term: &[u8]) -> Result<()> {
        let limit = self.last_term.len().min(term.len());
        let mut pos = 0;
        while pos < limit && self.last_term[pos] == term[pos] {
            pos += 1;
        }

        for idx in (pos..self.last_term.len()).rev() {
            let run = self.pending.len() - self.prefix_starts[idx];
            if run >= self.options.min_block_size {
                self.write_blocks(idx + 1, run)?;
                self.prefix_starts[idx] = self.prefix_starts[idx].wrapping_sub(run - 1);
            }
        }

        if self.prefix_starts.len() < term.len() {
            self.prefix_starts.resize(term.len(), 0);
        }
        for start in self.prefix_starts.iter_mut().take(term.len()).skip(pos) {
            *start = self.pending.len();
        }
        self.last_term = term.to_vec();
        Ok(())
    }

    /// Flush the top `count` pending entries, which share a prefix of
    /// `prefix_len` bytes, as one block or a floor group, and replace
    /// them with a single BLOCK entry.
    fn write_blocks(&mut self, prefix_len: usize, count: usize) -> Result<()> {
        debug_assert!(count > 0);
        let start = self.pending.len() - count;
        let prefix: Vec<u8> = self.pending[start].key()[..prefix_len].to_vec();

        let node_fp = if count <= self.options.max_block_size {
            self.write_block(prefix_len, start, self.pending.len())?
        } else {
            self.write_floor_blocks(prefix_len, start)?
        };

        self.fst_entries.push((prefix.clone(), node_fp));
        self.pending.truncate(start);
        self.pending.push(PendingEntry::Node {
            prefix,
            fp: node_fp,
        });
        Ok(())
    }

    /// Split an oversized run into label-aligned groups of
    /// `[min_block_size, max_block_size]` entries (a trailing runt
    /// merges into its predecessor), then emit the routing directory.
    fn write_floor_blocks(&mut self, prefix_len: usize, start: usize) -> Result<u64> {
        let end = self.pending.len();

        // label runs: consecutive entries sharing their lead byte
        let mut runs: Vec<(usize, usize)> = Vec::new();
        let mut run_start = start;
        let mut run_label = lead_label(self.pending[start].key(), prefix_len);
        for i in start + 1..end {
            let label = lead_label(self.pending[i].key(), prefix_len);
            if label != run_label {
                runs.push((run_start, i));
                run_start = i;
                run_label = label;
            }
        }
        runs.push((run_start, end));

        // greedy chunks of whole runs
        let mut chunks: Vec<(usize, usize)> = Vec::new();
        let mut chunk_start = start;
        for &(_, run_end) in &runs {
            let size = run_end - chunk_start;
            if size >= self.options.min_block_size && run_end < end {
                chunks.push((chunk_start, run_end));
                chunk_start = run_end;
            }
        }
        if chunk_start < end {
            let size = end - chunk_start;
            if size < self.options.min_block_size && !chunks.is_empty() {
                let (prev_start, _) = chunks.pop().unwrap();
                chunks.push((prev_start, end));
            } else {
                chunks.push((chunk_start, end));
            }
        }

        if chunks.len() == 1 {
            return self.write_block(prefix_len, start, end);
        }

        let mut groups: Vec<(u8, u64)> = Vec::with_capacity(chunks.len());
        for &(chunk_start, chunk_end) in &chunks {
            let label = lead_label(self.pending[chunk_start].key(), prefix_len).unwrap_or(0);
            let fp = self.write_block(prefix_len, chunk_start, chunk_end)?;
            groups.push((label, fp));
        }

        let dir_fp = self.terms_out.file_pointer();
        let code = ((groups.len() as u32) << FLAG_SHIFT) | FLAG_FLOOR;
        self.terms_out.write_vu32(code)?;
        for (label, fp) in &groups {
            self.terms_out.write_byte(*label)?;
            self.terms_out.write_vu64(dir_fp - fp)?;
        }
        Ok(dir_fp)
    }

    fn write_block(&mut self, prefix_len: usize, start: usize, end: usize) -> Result<u64> {
        let fp = self.terms_out.file_pointer();
        let leaf = self.pending[start..end]
            .iter()
            .all(|e| matches!(e, PendingEntry::Term { .. }));

        let mut code = ((end - start) as u32) << FLAG_SHIFT;
        code |= if leaf { FLAG_LEAF } else { FLAG_HAS_SUB_BLOCKS };
        self.terms_out.write_vu32(code)?;

        for entry in &self.pending[start..end] {
            let suffix = &entry.key()[prefix_len..];
            match entry {
                PendingEntry::Term { stats_blob, .. } => {
                    if leaf {
                        self.terms_out.write_blob(suffix)?;
                    } else {
                        self.terms_out.write_vu64((suffix.len() as u64) << 1)?;
                        self.terms_out.write_bytes(suffix)?;
                    }
                    self.terms_out.write_bytes(stats_blob)?;
                }
                PendingEntry::Node { fp: child_fp, .. } => {
                    debug_assert!(!leaf && *child_fp < fp);
                    self.terms_out
                        .write_vu64(((suffix.len() as u64) << 1) | 1)?;
                    self.terms_out.write_bytes(suffix)?;
                    self.terms_out.write_vu64(fp - child_fp)?;
                }
            }
        }
        Ok(fp)
    }
}

/// First suffix byte of an entry at the given trie depth; `None` for
/// the exact-prefix term, which sorts before every labeled entry.
fn lead_label(key: &[u8], prefix_len: usize) -> Option<u8> {
    key.get(prefix_len).copied()
}

impl std::fmt::Debug for FieldWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldWriter")
            .field("segment", &self.segment)
            .field("fields", &self.fields.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

// Round-trip coverage lives in `reader.rs` and the integration tests;
// here we only pin down the stack mechanics.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryDirectory;

    fn postings_with_doc(doc: u32) -> PostingsBuffer {
        let mut buffer = PostingsBuffer::default();
        buffer.add(doc, 0, (0, 0), None);
        buffer
    }

    #[test]
    fn test_rejects_unsorted_terms() {
        let dir = MemoryDirectory::new();
        let mut writer = FieldWriter::create(&dir, "seg_1", TermWriterOptions::default()).unwrap();
        let a = postings_with_doc(1);
        let b = postings_with_doc(2);
        let terms: Vec<(&[u8], &PostingsBuffer)> = vec![(b"b", &a), (b"a", &b)];
        assert!(writer
            .write_field("f", Features::NONE, None, terms)
            .is_err());
    }

    #[test]
    fn test_rejects_unsorted_fields() {
        let dir = MemoryDirectory::new();
        let mut writer = FieldWriter::create(&dir, "seg_1", TermWriterOptions::default()).unwrap();
        let p = postings_with_doc(1);
        writer
            .write_field("b", Features::NONE, None, vec![(b"x".as_ref(), &p)])
            .unwrap();
        assert!(writer
            .write_field("a", Features::NONE, None, vec![(b"x".as_ref(), &p)])
            .is_err());
    }

    #[test]
    fn test_empty_field_leaves_no_summary() {
        let dir = MemoryDirectory::new();
        let mut writer = FieldWriter::create(&dir, "seg_1", TermWriterOptions::default()).unwrap();
        writer
            .write_field("empty", Features::NONE, None, Vec::new())
            .unwrap();
        assert!(writer.fields.is_empty());
        writer.finish().unwrap();
    }

    #[test]
    fn test_lead_label() {
        assert_eq!(lead_label(b"apple", 0), Some(b'a'));
        assert_eq!(lead_label(b"apple", 2), Some(b'p'));
        assert_eq!(lead_label(b"apple", 5), None);
    }
}
