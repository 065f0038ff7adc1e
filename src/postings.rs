//! Postings codec: `.doc` (docs + freqs), `.pos` (positions), `.pay`
//! (offsets + payloads).
//!
//! The term dictionary stores one [`TermStats`] blob per term pointing
//! into these streams; materializing an iterator needs no dictionary
//! walk beyond that blob. Doc ids and positions are delta-coded
//! varints.

use std::sync::Arc;

use roaring::RoaringBitmap;

use crate::codec::{ext, open_checked, segment_file, write_footer, write_header};
use crate::error::{Error, Result};
use crate::index::{doc_limits, DocId, Features};
use crate::store::{DataInput, DataOutput, Directory, IndexInput, IndexOutput, IoAdvice};

const DOC_FORMAT: u16 = 7;
const DOC_VERSION: u16 = 0;
const POS_FORMAT: u16 = 8;
const POS_VERSION: u16 = 0;
const PAY_FORMAT: u16 = 9;
const PAY_VERSION: u16 = 0;

/// Per-term statistics and stream offsets, stored inline in the term
/// dictionary.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TermStats {
    pub doc_freq: u32,
    pub total_term_freq: u64,
    pub doc_start: u64,
    pub pos_start: u64,
    pub pay_start: u64,
}

impl TermStats {
    pub fn write(&self, out: &mut Vec<u8>, features: Features) -> Result<()> {
        out.write_vu32(self.doc_freq)?;
        if features.has_freq() {
            out.write_vu64(self.total_term_freq - u64::from(self.doc_freq))?;
        }
        out.write_vu64(self.doc_start)?;
        if features.has_positions() {
            out.write_vu64(self.pos_start)?;
        }
        if features.has_offsets() || features.has_payloads() {
            out.write_vu64(self.pay_start)?;
        }
        Ok(())
    }

    pub fn read<I: DataInput + ?Sized>(input: &mut I, features: Features) -> Result<Self> {
        let doc_freq = input.read_vu32()?;
        let total_term_freq = if features.has_freq() {
            input.read_vu64()? + u64::from(doc_freq)
        } else {
            u64::from(doc_freq)
        };
        let doc_start = input.read_vu64()?;
        let pos_start = if features.has_positions() {
            input.read_vu64()?
        } else {
            0
        };
        let pay_start = if features.has_offsets() || features.has_payloads() {
            input.read_vu64()?
        } else {
            0
        };
        Ok(Self {
            doc_freq,
            total_term_freq,
            doc_start,
            pos_start,
            pay_start,
        })
    }
}

/// One token occurrence inside a document's posting.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PositionEntry {
    pub position: u32,
    pub offset: (u32, u32),
    pub payload: Option<Vec<u8>>,
}

#[derive(Clone, Debug, Default)]
struct DocEntry {
    doc: DocId,
    freq: u32,
    positions: Vec<PositionEntry>,
}

/// In-memory postings for one term, accumulated by the inverter in
/// ascending doc order.
#[derive(Clone, Debug, Default)]
pub struct PostingsBuffer {
    docs: Vec<DocEntry>,
}

impl PostingsBuffer {
    pub fn doc_freq(&self) -> u32 {
        self.docs.len() as u32
    }

    pub fn total_term_freq(&self) -> u64 {
        self.docs.iter().map(|d| u64::from(d.freq)).sum()
    }

    /// Doc ids carrying this term, ascending.
    pub fn docs(&self) -> impl Iterator<Item = DocId> + '_ {
        self.docs.iter().map(|d| d.doc)
    }

    /// Record one occurrence of the term in `doc`.
    pub fn add(&mut self, doc: DocId, position: u32, offset: (u32, u32), payload: Option<Vec<u8>>) {
        if self.docs.last().map(|d| d.doc) != Some(doc) {
            debug_assert!(self.docs.last().map_or(true, |d| d.doc < doc));
            self.docs.push(DocEntry {
                doc,
                freq: 0,
                positions: Vec::new(),
            });
        }
        let entry = self.docs.last_mut().unwrap();
        entry.freq += 1;
        entry.positions.push(PositionEntry {
            position,
            offset,
            payload,
        });
    }
}

/// Writes the three postings streams for one segment.
pub struct PostingsWriter {
    segment: String,
    doc_out: Box<dyn IndexOutput>,
    pos_out: Box<dyn IndexOutput>,
    pay_out: Box<dyn IndexOutput>,
}

impl PostingsWriter {
    pub fn create(dir: &dyn Directory, segment: &str) -> Result<Self> {
        let mut doc_out = dir.create(&segment_file(segment, ext::DOC))?;
        write_header(doc_out.as_mut(), DOC_FORMAT, DOC_VERSION)?;
        let mut pos_out = dir.create(&segment_file(segment, ext::POS))?;
        write_header(pos_out.as_mut(), POS_FORMAT, POS_VERSION)?;
        let mut pay_out = dir.create(&segment_file(segment, ext::PAY))?;
        write_header(pay_out.as_mut(), PAY_FORMAT, PAY_VERSION)?;
        Ok(Self {
            segment: segment.to_string(),
            doc_out,
            pos_out,
            pay_out,
        })
    }

    /// Write one term's postings under the field's feature set and
    /// return the stats blob for the term dictionary.
    pub fn write_term(&mut self, features: Features, postings: &PostingsBuffer) -> Result<TermStats> {
        let stats = TermStats {
            doc_freq: postings.doc_freq(),
            total_term_freq: postings.total_term_freq(),
            doc_start: self.doc_out.file_pointer(),
            pos_start: self.pos_out.file_pointer(),
            pay_start: self.pay_out.file_pointer(),
        };

        self.doc_out.write_vu32(stats.doc_freq)?;
        let mut prev_doc: DocId = 0;
        for entry in &postings.docs {
            self.doc_out.write_vu32(entry.doc - prev_doc)?;
            prev_doc = entry.doc;
            if features.has_freq() {
                self.doc_out.write_vu32(entry.freq)?;
            }
            if features.has_positions() {
                let mut prev_pos = 0u32;
                for position in &entry.positions {
                    self.pos_out.write_vu32(position.position - prev_pos)?;
                    prev_pos = position.position;
                    if features.has_offsets() {
                        self.pay_out.write_vu32(position.offset.0)?;
                        self.pay_out
                            .write_vu32(position.offset.1.saturating_sub(position.offset.0))?;
                    }
                    if features.has_payloads() {
                        match &position.payload {
                            Some(payload) => self.pay_out.write_blob(payload)?,
                            None => self.pay_out.write_vu64(0)?,
                        }
                    }
                }
            }
        }
        Ok(stats)
    }

    /// Seal the three streams and return their file names.
    pub fn finish(&mut self) -> Result<Vec<String>> {
        write_footer(self.doc_out.as_mut())?;
        self.doc_out.close()?;
        write_footer(self.pos_out.as_mut())?;
        self.pos_out.close()?;
        write_footer(self.pay_out.as_mut())?;
        self.pay_out.close()?;
        Ok(vec![
            segment_file(&self.segment, ext::DOC),
            segment_file(&self.segment, ext::POS),
            segment_file(&self.segment, ext::PAY),
        ])
    }
}

/// Opens the postings streams of a flushed segment and materializes
/// iterators from [`TermStats`] blobs.
pub struct PostingsReader {
    doc_in: Box<dyn IndexInput>,
    pos_in: Box<dyn IndexInput>,
    pay_in: Box<dyn IndexInput>,
}

impl PostingsReader {
    pub fn open(dir: &dyn Directory, segment: &str) -> Result<Self> {
        let (doc_in, _) = open_checked(
            dir,
            &segment_file(segment, ext::DOC),
            IoAdvice::Random,
            DOC_FORMAT,
            DOC_VERSION,
        )?;
        let (pos_in, _) = open_checked(
            dir,
            &segment_file(segment, ext::POS),
            IoAdvice::Random,
            POS_FORMAT,
            POS_VERSION,
        )?;
        let (pay_in, _) = open_checked(
            dir,
            &segment_file(segment, ext::PAY),
            IoAdvice::Random,
            PAY_FORMAT,
            PAY_VERSION,
        )?;
        Ok(Self {
            doc_in,
            pos_in,
            pay_in,
        })
    }

    /// Materialize a postings iterator for one term.
    ///
    /// `requested` must be a subset of the field's written features;
    /// asking for more is `NotSupported`.
    pub fn postings(
        &self,
        stats: &TermStats,
        written: Features,
        requested: Features,
        mask: Arc<RoaringBitmap>,
    ) -> Result<PostingsIterator> {
        if !requested.is_subset_of(written) {
            return Err(Error::NotSupported(format!(
                "requested features {:#04x} exceed written {:#04x}",
                requested.bits(),
                written.bits()
            )));
        }
        let mut doc_in = self.doc_in.dup()?;
        doc_in.seek(stats.doc_start)?;
        let remaining = doc_in.read_vu32()?;
        debug_assert_eq!(remaining, stats.doc_freq);

        let pos_in = if written.has_positions() && requested.has_positions() {
            let mut input = self.pos_in.dup()?;
            input.seek(stats.pos_start)?;
            Some(input)
        } else {
            None
        };
        let pay_in = if written.has_offsets() || written.has_payloads() {
            let mut input = self.pay_in.dup()?;
            input.seek(stats.pay_start)?;
            Some(input)
        } else {
            None
        };

        Ok(PostingsIterator {
            doc_in,
            pos_in,
            pay_in,
            written,
            requested,
            mask,
            remaining,
            doc: doc_limits::INVALID,
            freq: 0,
            positions: Vec::new(),
        })
    }
}

/// Ascending doc-id iterator over one term's postings; masked docs are
/// skipped.
#[derive(Debug)]
pub struct PostingsIterator {
    doc_in: Box<dyn IndexInput>,
    pos_in: Option<Box<dyn IndexInput>>,
    pay_in: Option<Box<dyn IndexInput>>,
    written: Features,
    requested: Features,
    mask: Arc<RoaringBitmap>,
    remaining: u32,
    doc: DocId,
    freq: u32,
    positions: Vec<PositionEntry>,
}

impl PostingsIterator {
    /// Current doc id; `doc_limits::INVALID` before the first `next`,
    /// `doc_limits::EOF` after exhaustion.
    pub fn doc(&self) -> DocId {
        self.doc
    }

    pub fn freq(&self) -> u32 {
        self.freq
    }

    /// Positions of the current doc when positions were requested.
    pub fn positions(&self) -> &[PositionEntry] {
        &self.positions
    }

    pub fn next(&mut self) -> Result<bool> {
        loop {
            if self.remaining == 0 {
                self.doc = doc_limits::EOF;
                return Ok(false);
            }
            self.remaining -= 1;

            let prev = if doc_limits::valid(self.doc) { self.doc } else { 0 };
            self.doc = prev + self.doc_in.read_vu32()?;
            self.freq = if self.written.has_freq() {
                self.doc_in.read_vu32()?
            } else {
                1
            };
            self.read_positions()?;

            if !self.mask.contains(self.doc) {
                return Ok(true);
            }
        }
    }

    /// Advance to the first doc >= `target`.
    pub fn advance(&mut self, target: DocId) -> Result<DocId> {
        while self.doc < target || !doc_limits::valid(self.doc) {
            if !self.next()? {
                break;
            }
        }
        Ok(self.doc)
    }

    /// Position data for skipped and masked docs is still consumed so
    /// the per-term streams stay aligned.
    fn read_positions(&mut self) -> Result<()> {
        self.positions.clear();
        if !self.written.has_positions() {
            return Ok(());
        }
        let mut prev_pos = 0u32;
        for _ in 0..self.freq {
            let position = if let Some(pos_in) = self.pos_in.as_mut() {
                prev_pos += pos_in.read_vu32()?;
                prev_pos
            } else {
                0
            };
            let mut offset = (0u32, 0u32);
            let mut payload = None;
            if let Some(pay_in) = self.pay_in.as_mut() {
                if self.written.has_offsets() {
                    let start = pay_in.read_vu32()?;
                    let len = pay_in.read_vu32()?;
                    offset = (start, start + len);
                }
                if self.written.has_payloads() {
                    let bytes = pay_in.read_blob()?;
                    if !bytes.is_empty() {
                        payload = Some(bytes);
                    }
                }
            }
            if self.requested.has_positions() {
                self.positions.push(PositionEntry {
                    position,
                    offset: if self.requested.has_offsets() { offset } else { (0, 0) },
                    payload: if self.requested.has_payloads() { payload } else { None },
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryDirectory, SliceInput};

    fn buffer_of(docs: &[(DocId, &[u32])]) -> PostingsBuffer {
        let mut buffer = PostingsBuffer::default();
        for (doc, positions) in docs {
            for &pos in *positions {
                buffer.add(*doc, pos, (pos, pos + 1), None);
            }
        }
        buffer
    }

    #[test]
    fn test_docs_only_round_trip() {
        let dir = MemoryDirectory::new();
        let mut writer = PostingsWriter::create(&dir, "seg_1").unwrap();
        let stats = writer
            .write_term(Features::NONE, &buffer_of(&[(1, &[0]), (3, &[0]), (9, &[0])]))
            .unwrap();
        writer.finish().unwrap();

        assert_eq!(stats.doc_freq, 3);
        let reader = PostingsReader::open(&dir, "seg_1").unwrap();
        let mut iter = reader
            .postings(&stats, Features::NONE, Features::NONE, Arc::new(RoaringBitmap::new()))
            .unwrap();

        let mut docs = Vec::new();
        while iter.next().unwrap() {
            docs.push(iter.doc());
        }
        assert_eq!(docs, [1, 3, 9]);
        assert_eq!(iter.doc(), doc_limits::EOF);
    }

    #[test]
    fn test_freq_and_positions() {
        let dir = MemoryDirectory::new();
        let mut writer = PostingsWriter::create(&dir, "seg_1").unwrap();
        let stats = writer
            .write_term(
                Features::POSITION,
                &buffer_of(&[(2, &[1, 4, 6]), (5, &[0])]),
            )
            .unwrap();
        writer.finish().unwrap();

        assert_eq!(stats.total_term_freq, 4);

        let reader = PostingsReader::open(&dir, "seg_1").unwrap();
        let mut iter = reader
            .postings(
                &stats,
                Features::POSITION,
                Features::POSITION,
                Arc::new(RoaringBitmap::new()),
            )
            .unwrap();

        assert!(iter.next().unwrap());
        assert_eq!(iter.doc(), 2);
        assert_eq!(iter.freq(), 3);
        let positions: Vec<u32> = iter.positions().iter().map(|p| p.position).collect();
        assert_eq!(positions, [1, 4, 6]);

        assert!(iter.next().unwrap());
        assert_eq!(iter.doc(), 5);
        assert_eq!(iter.freq(), 1);
        assert!(!iter.next().unwrap());
    }

    #[test]
    fn test_multiple_terms_share_streams() {
        let dir = MemoryDirectory::new();
        let mut writer = PostingsWriter::create(&dir, "seg_1").unwrap();
        let first = writer
            .write_term(Features::POSITION, &buffer_of(&[(1, &[0, 2])]))
            .unwrap();
        let second = writer
            .write_term(Features::POSITION, &buffer_of(&[(2, &[7])]))
            .unwrap();
        writer.finish().unwrap();

        let reader = PostingsReader::open(&dir, "seg_1").unwrap();
        let mask = Arc::new(RoaringBitmap::new());

        let mut iter = reader
            .postings(&second, Features::POSITION, Features::POSITION, Arc::clone(&mask))
            .unwrap();
        assert!(iter.next().unwrap());
        assert_eq!(iter.doc(), 2);
        assert_eq!(iter.positions()[0].position, 7);

        let mut iter = reader
            .postings(&first, Features::POSITION, Features::POSITION, mask)
            .unwrap();
        assert!(iter.next().unwrap());
        assert_eq!(iter.doc(), 1);
        assert_eq!(iter.freq(), 2);
    }

    #[test]
    fn test_mask_skips_docs() {
        let dir = MemoryDirectory::new();
        let mut writer = PostingsWriter::create(&dir, "seg_1").unwrap();
        let stats = writer
            .write_term(Features::FREQ, &buffer_of(&[(1, &[0]), (2, &[0, 1]), (3, &[0])]))
            .unwrap();
        writer.finish().unwrap();

        let mut mask = RoaringBitmap::new();
        mask.insert(2);

        let reader = PostingsReader::open(&dir, "seg_1").unwrap();
        let mut iter = reader
            .postings(&stats, Features::FREQ, Features::FREQ, Arc::new(mask))
            .unwrap();
        let mut docs = Vec::new();
        while iter.next().unwrap() {
            docs.push(iter.doc());
        }
        assert_eq!(docs, [1, 3]);
    }

    #[test]
    fn test_advance() {
        let dir = MemoryDirectory::new();
        let mut writer = PostingsWriter::create(&dir, "seg_1").unwrap();
        let stats = writer
            .write_term(
                Features::NONE,
                &buffer_of(&[(1, &[0]), (4, &[0]), (7, &[0]), (20, &[0])]),
            )
            .unwrap();
        writer.finish().unwrap();

        let reader = PostingsReader::open(&dir, "seg_1").unwrap();
        let mut iter = reader
            .postings(&stats, Features::NONE, Features::NONE, Arc::new(RoaringBitmap::new()))
            .unwrap();

        assert_eq!(iter.advance(5).unwrap(), 7);
        assert_eq!(iter.advance(7).unwrap(), 7);
        assert_eq!(iter.advance(21).unwrap(), doc_limits::EOF);
    }

    #[test]
    fn test_feature_subset_enforced() {
        let dir = MemoryDirectory::new();
        let mut writer = PostingsWriter::create(&dir, "seg_1").unwrap();
        let stats = writer
            .write_term(Features::FREQ, &buffer_of(&[(1, &[0])]))
            .unwrap();
        writer.finish().unwrap();

        let reader = PostingsReader::open(&dir, "seg_1").unwrap();
        let err = reader
            .postings(
                &stats,
                Features::FREQ,
                Features::POSITION,
                Arc::new(RoaringBitmap::new()),
            )
            .unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[test]
    fn test_stats_blob_round_trip() {
        let stats = TermStats {
            doc_freq: 10,
            total_term_freq: 25,
            doc_start: 1000,
            pos_start: 2000,
            pay_start: 0,
        };
        let mut blob = Vec::new();
        stats.write(&mut blob, Features::POSITION).unwrap();
        let mut input = SliceInput::new(&blob);
        let loaded = TermStats::read(&mut input, Features::POSITION).unwrap();
        assert_eq!(loaded, stats);
    }
}
