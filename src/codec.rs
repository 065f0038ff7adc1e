//! File format plumbing and the codec registry.
//!
//! Every segment file starts with `magic | format_id | version` and ends
//! with a CRC-32 over all preceding bytes. Readers verify both before
//! accepting a file. Codecs are looked up by the id recorded in the
//! segment meta; registration is explicit and happens at initialization
//! time.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use roaring::RoaringBitmap;

use crate::columnstore::{ColumnstoreReader, ColumnstoreWriter};
use crate::error::{Error, Result};
use crate::index::meta::SegmentMeta;
use crate::store::{DataInput, DataOutput, Directory, IndexInput, IndexOutput, IoAdvice};
use crate::termdict::{FieldReader, FieldWriter, TermWriterOptions};

const MAGIC: u32 = u32::from_le_bytes(*b"silt");

/// Segment file extensions, all `<segment>.<ext>`.
pub mod ext {
    /// segment meta
    pub const SM: &str = "sm";
    /// deleted doc ids
    pub const DOC_MASK: &str = "doc_mask";
    /// field meta
    pub const FM: &str = "fm";
    /// terms index (per-field FSTs)
    pub const TI: &str = "ti";
    /// terms + inline postings stats
    pub const TM: &str = "tm";
    /// postings: docs + freqs
    pub const DOC: &str = "doc";
    /// postings: positions
    pub const POS: &str = "pos";
    /// postings: offsets + payloads
    pub const PAY: &str = "pay";
    /// columnstore data
    pub const CS: &str = "cs";
    /// column meta
    pub const CSI: &str = "csi";
}

pub fn segment_file(segment: &str, ext: &str) -> String {
    format!("{segment}.{ext}")
}

/// Write the standard file header.
pub fn write_header(out: &mut dyn IndexOutput, format_id: u16, version: u16) -> Result<()> {
    out.write_u32_le(MAGIC)?;
    out.write_u16_le(format_id)?;
    out.write_u16_le(version)
}

/// Read and validate the standard file header, returning the version.
pub fn read_header(input: &mut dyn IndexInput, format_id: u16, max_version: u16) -> Result<u16> {
    let magic = input.read_u32_le()?;
    if magic != MAGIC {
        return Err(Error::io(format!("bad magic: {magic:#010x}")));
    }
    let id = input.read_u16_le()?;
    if id != format_id {
        return Err(Error::index(format!(
            "unknown format id {id}, expected {format_id}"
        )));
    }
    let version = input.read_u16_le()?;
    if version > max_version {
        return Err(Error::NotSupported(format!(
            "format version {version} is newer than supported {max_version}"
        )));
    }
    Ok(version)
}

/// Append the trailing checksum over everything written so far.
pub fn write_footer(out: &mut dyn IndexOutput) -> Result<()> {
    let crc = out.checksum()?;
    out.write_u32_le(crc)
}

/// Verify the trailing checksum covers the file body. The cursor is
/// left at the start of the file.
pub fn verify_footer(input: &mut dyn IndexInput) -> Result<()> {
    let len = input.len();
    if len < 4 {
        return Err(Error::io("file too short for checksum footer"));
    }
    input.seek(0)?;
    let actual = input.checksum(len - 4)?;
    input.seek(len - 4)?;
    let stored = input.read_u32_le()?;
    if actual != stored {
        return Err(Error::io(format!(
            "checksum mismatch: stored {stored:#010x}, computed {actual:#010x}"
        )));
    }
    input.seek(0)?;
    Ok(())
}

/// Open a segment file, verify its checksum and header, and return the
/// input positioned after the header.
pub fn open_checked(
    dir: &dyn Directory,
    name: &str,
    advice: IoAdvice,
    format_id: u16,
    max_version: u16,
) -> Result<(Box<dyn IndexInput>, u16)> {
    let mut input = dir.open(name, advice)?;
    verify_footer(input.as_mut())?;
    let version = read_header(input.as_mut(), format_id, max_version)?;
    Ok((input, version))
}

/// Bundle of sub-format implementations a segment is written and read
/// with. The segment writer and reader dispatch through this so the
/// on-disk layout stays swappable per segment.
pub struct Codec {
    name: String,
    term_options: TermWriterOptions,
}

impl Codec {
    pub fn new(name: impl Into<String>, term_options: TermWriterOptions) -> Self {
        Self {
            name: name.into(),
            term_options,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn term_options(&self) -> &TermWriterOptions {
        &self.term_options
    }

    /// Field writer producing `.tm`/`.ti` plus the postings streams.
    pub fn field_writer(&self, dir: &dyn Directory, segment: &str) -> Result<FieldWriter> {
        FieldWriter::create(dir, segment, self.term_options.clone())
    }

    /// Field reader over a flushed segment's term dictionary.
    pub fn field_reader(
        &self,
        dir: &dyn Directory,
        meta: &SegmentMeta,
        mask: Arc<RoaringBitmap>,
    ) -> Result<FieldReader> {
        FieldReader::prepare(dir, &meta.name, mask)
    }

    pub fn columnstore_writer(&self, segment: &str) -> ColumnstoreWriter {
        ColumnstoreWriter::new(segment)
    }

    /// `None` when the segment carries no columnstore.
    pub fn columnstore_reader(
        &self,
        dir: &dyn Directory,
        meta: &SegmentMeta,
    ) -> Result<Option<ColumnstoreReader>> {
        let name = segment_file(&meta.name, ext::CS);
        if !dir.exists(&name)? {
            return Ok(None);
        }
        ColumnstoreReader::open(dir, &meta.name).map(Some)
    }
}

static REGISTRY: RwLock<Option<HashMap<String, Arc<Codec>>>> = RwLock::new(None);

/// Name of the codec registered by default.
pub const DEFAULT_CODEC: &str = "block0";

fn ensure_registry_init() {
    let initialized = REGISTRY.read().is_some();
    if initialized {
        return;
    }
    let mut registry = REGISTRY.write();
    if registry.is_none() {
        let mut map = HashMap::new();
        let codec = Arc::new(Codec::new(DEFAULT_CODEC, TermWriterOptions::default()));
        map.insert(codec.name().to_string(), codec);
        *registry = Some(map);
    }
}

/// Register a codec under its name, replacing any previous entry.
pub fn register_codec(codec: Arc<Codec>) {
    ensure_registry_init();
    let mut registry = REGISTRY.write();
    registry
        .as_mut()
        .expect("registry initialized")
        .insert(codec.name().to_string(), codec);
}

/// Look up a codec by the id recorded in a segment meta.
pub fn codec(name: &str) -> Option<Arc<Codec>> {
    ensure_registry_init();
    REGISTRY.read().as_ref().and_then(|map| map.get(name).cloned())
}

/// The codec new segments are written with unless told otherwise.
pub fn default_codec() -> Arc<Codec> {
    codec(DEFAULT_CODEC).expect("default codec registered")
}
