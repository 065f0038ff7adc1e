//! Segment and index metadata files.
//!
//! `.sm` publishes a segment (name, version, docs count, file set,
//! codec id); `.doc_mask` carries the deleted doc ids; `.fm` the field
//! table. `segments_<gen>` lists the published segments an index is
//! composed of and is what the cleaner's retain set is built from.

use std::collections::{BTreeSet, HashSet};

use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

use crate::codec::{ext, open_checked, segment_file, write_footer, write_header};
use crate::error::{Error, Result};
use crate::index::{DocId, FieldMeta, Features};
use crate::store::{DataInput, DataOutput, Directory, IoAdvice};

const SM_FORMAT: u16 = 1;
const SM_VERSION: u16 = 0;
const MASK_FORMAT: u16 = 2;
const MASK_VERSION: u16 = 0;
const FM_FORMAT: u16 = 3;
const FM_VERSION: u16 = 0;
const IM_FORMAT: u16 = 4;
const IM_VERSION: u16 = 0;

const SEGMENTS_PREFIX: &str = "segments_";

/// Immutable description of one published segment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SegmentMeta {
    pub name: String,
    /// Bumped whenever the segment is republished (e.g. mask updates).
    pub version: u64,
    /// Total accepted documents, masked ones included.
    pub docs_count: u32,
    /// Exactly the files constituting this segment.
    pub files: BTreeSet<String>,
    /// Codec id the segment was written with.
    pub codec: String,
}

impl SegmentMeta {
    pub fn new(name: impl Into<String>, codec: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: 0,
            docs_count: 0,
            files: BTreeSet::new(),
            codec: codec.into(),
        }
    }

    pub fn filename(&self) -> String {
        segment_file(&self.name, ext::SM)
    }

    pub fn live_docs_count(&self, mask: &RoaringBitmap) -> u64 {
        u64::from(self.docs_count) - mask.len()
    }
}

/// Write and publish the `.sm` file for this segment.
pub fn write_segment_meta(dir: &dyn Directory, meta: &SegmentMeta) -> Result<String> {
    let filename = meta.filename();
    let mut out = dir.create(&filename)?;
    write_header(out.as_mut(), SM_FORMAT, SM_VERSION)?;
    out.write_str(&meta.name)?;
    out.write_vu64(meta.version)?;
    out.write_vu32(meta.docs_count)?;
    out.write_vu64(meta.files.len() as u64)?;
    for file in &meta.files {
        out.write_str(file)?;
    }
    out.write_str(&meta.codec)?;
    write_footer(out.as_mut())?;
    out.close()?;
    dir.sync(&filename)?;
    Ok(filename)
}

pub fn read_segment_meta(dir: &dyn Directory, segment: &str) -> Result<SegmentMeta> {
    let filename = segment_file(segment, ext::SM);
    let (mut input, _) = open_checked(dir, &filename, IoAdvice::ReadOnce, SM_FORMAT, SM_VERSION)?;
    let name = input.read_str()?;
    if name != segment {
        return Err(Error::index(format!(
            "segment meta name mismatch: {name} != {segment}"
        )));
    }
    let version = input.read_vu64()?;
    let docs_count = input.read_vu32()?;
    let file_count = input.read_vu64()? as usize;
    let mut files = BTreeSet::new();
    for _ in 0..file_count {
        files.insert(input.read_str()?);
    }
    let codec = input.read_str()?;
    Ok(SegmentMeta {
        name,
        version,
        docs_count,
        files,
        codec,
    })
}

/// Write the deleted-docs mask as a sorted delta-coded id list.
pub fn write_document_mask(
    dir: &dyn Directory,
    segment: &str,
    mask: &RoaringBitmap,
) -> Result<String> {
    let filename = segment_file(segment, ext::DOC_MASK);
    let mut out = dir.create(&filename)?;
    write_header(out.as_mut(), MASK_FORMAT, MASK_VERSION)?;
    out.write_vu64(mask.len())?;
    let mut prev: DocId = 0;
    for doc in mask.iter() {
        out.write_vu32(doc - prev)?;
        prev = doc;
    }
    write_footer(out.as_mut())?;
    out.close()?;
    Ok(filename)
}

/// Load the deleted-docs mask; a missing file means nothing is masked.
pub fn read_document_mask(dir: &dyn Directory, segment: &str) -> Result<RoaringBitmap> {
    let filename = segment_file(segment, ext::DOC_MASK);
    if !dir.exists(&filename)? {
        return Ok(RoaringBitmap::new());
    }
    let (mut input, _) =
        open_checked(dir, &filename, IoAdvice::ReadOnce, MASK_FORMAT, MASK_VERSION)?;
    let count = input.read_vu64()?;
    let mut mask = RoaringBitmap::new();
    let mut prev: DocId = 0;
    for _ in 0..count {
        prev += input.read_vu32()?;
        mask.insert(prev);
    }
    Ok(mask)
}

/// Write the `.fm` field table, sorted by field name.
pub fn write_field_meta(dir: &dyn Directory, segment: &str, fields: &[FieldMeta]) -> Result<String> {
    debug_assert!(fields.windows(2).all(|w| w[0].name < w[1].name));
    let filename = segment_file(segment, ext::FM);
    let mut out = dir.create(&filename)?;
    write_header(out.as_mut(), FM_FORMAT, FM_VERSION)?;
    out.write_vu64(fields.len() as u64)?;
    for field in fields {
        out.write_str(&field.name)?;
        out.write_vu32(field.id)?;
        out.write_byte(field.features.bits())?;
        match field.norm_column {
            Some(column) => {
                out.write_byte(1)?;
                out.write_vu32(column)?;
            }
            None => out.write_byte(0)?,
        }
    }
    write_footer(out.as_mut())?;
    out.close()?;
    Ok(filename)
}

pub fn read_field_meta(dir: &dyn Directory, segment: &str) -> Result<Vec<FieldMeta>> {
    let filename = segment_file(segment, ext::FM);
    let (mut input, _) = open_checked(dir, &filename, IoAdvice::ReadOnce, FM_FORMAT, FM_VERSION)?;
    let count = input.read_vu64()? as usize;
    let mut fields = Vec::with_capacity(count);
    let mut last_name: Option<String> = None;
    for _ in 0..count {
        let name = input.read_str()?;
        if let Some(prev) = &last_name {
            if *prev >= name {
                return Err(Error::index("field meta out of order"));
            }
        }
        last_name = Some(name.clone());
        let id = input.read_vu32()?;
        let features = Features::from_bits(input.read_byte()?);
        let norm_column = if input.read_byte()? != 0 {
            Some(input.read_vu32()?)
        } else {
            None
        };
        fields.push(FieldMeta {
            name,
            id,
            features,
            norm_column,
        });
    }
    Ok(fields)
}

/// The published composition of an index: a generation plus the list
/// of live segments.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IndexMeta {
    pub generation: u64,
    pub segments: Vec<SegmentMeta>,
}

impl IndexMeta {
    pub fn filename(&self) -> String {
        index_meta_filename(self.generation)
    }

    /// File names the cleaner must retain: every published segment
    /// file plus the segments file itself.
    pub fn retain_set(&self) -> HashSet<String> {
        let mut retain: HashSet<String> = HashSet::new();
        retain.insert(self.filename());
        for segment in &self.segments {
            retain.insert(segment.filename());
            retain.extend(segment.files.iter().cloned());
        }
        retain
    }
}

pub fn index_meta_filename(generation: u64) -> String {
    format!("{SEGMENTS_PREFIX}{generation}")
}

/// Find the newest `segments_<gen>` file, if any index was published.
pub fn last_segments_file(dir: &dyn Directory) -> Result<Option<String>> {
    let mut best: Option<u64> = None;
    dir.visit(&mut |name| {
        if let Some(gen) = name
            .strip_prefix(SEGMENTS_PREFIX)
            .and_then(|suffix| suffix.parse::<u64>().ok())
        {
            best = Some(best.map_or(gen, |b| b.max(gen)));
        }
        true
    })?;
    Ok(best.map(index_meta_filename))
}

/// Sentinel file of the whole-directory publication lock.
pub const WRITE_LOCK_NAME: &str = "write.lock";

/// Publish an index composition under the directory write lock, so two
/// writers cannot race the segments file.
pub fn publish_index_meta(dir: &dyn Directory, meta: &IndexMeta) -> Result<String> {
    let mut lock = dir.make_lock(WRITE_LOCK_NAME)?;
    if !lock.lock()? {
        return Err(Error::Lock(
            "index is already locked by another writer".to_string(),
        ));
    }
    let result = write_index_meta(dir, meta);
    lock.unlock()?;
    result
}

pub fn write_index_meta(dir: &dyn Directory, meta: &IndexMeta) -> Result<String> {
    let filename = meta.filename();
    let mut out = dir.create(&filename)?;
    write_header(out.as_mut(), IM_FORMAT, IM_VERSION)?;
    out.write_vu64(meta.generation)?;
    out.write_vu64(meta.segments.len() as u64)?;
    for segment in &meta.segments {
        out.write_str(&segment.name)?;
        out.write_vu64(segment.version)?;
    }
    write_footer(out.as_mut())?;
    out.close()?;
    dir.sync(&filename)?;
    Ok(filename)
}

/// Read an index meta file; segment metas are loaded through their own
/// `.sm` files so the segments list always reflects published state.
pub fn read_index_meta(dir: &dyn Directory, filename: &str) -> Result<IndexMeta> {
    let (mut input, _) = open_checked(dir, filename, IoAdvice::ReadOnce, IM_FORMAT, IM_VERSION)?;
    let generation = input.read_vu64()?;
    let count = input.read_vu64()? as usize;
    let mut segments = Vec::with_capacity(count);
    for _ in 0..count {
        let name = input.read_str()?;
        let version = input.read_vu64()?;
        let mut meta = read_segment_meta(dir, &name)?;
        meta.version = version;
        segments.push(meta);
    }
    Ok(IndexMeta {
        generation,
        segments,
    })
}

/// Acceptor for [`crate::store::clean`] that keeps everything the
/// current index composition references. With no published index,
/// every unreferenced file may go.
pub fn current_segments_acceptor(dir: &dyn Directory) -> Result<impl Fn(&str) -> bool> {
    let retain = match last_segments_file(dir)? {
        Some(filename) => match read_index_meta(dir, &filename) {
            Ok(meta) => meta.retain_set(),
            Err(err) => {
                tracing::warn!(%err, "failed to read current segments file; retaining it");
                HashSet::from([filename])
            }
        },
        None => HashSet::new(),
    };
    Ok(crate::store::retain_current_segments(retain))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::store::MemoryDirectory;

    #[test]
    fn test_segment_meta_round_trip() {
        let dir = MemoryDirectory::new();
        let mut meta = SegmentMeta::new("seg_1", codec::DEFAULT_CODEC);
        meta.version = 3;
        meta.docs_count = 42;
        meta.files.insert("seg_1.tm".to_string());
        meta.files.insert("seg_1.ti".to_string());

        write_segment_meta(&dir, &meta).unwrap();
        let loaded = read_segment_meta(&dir, "seg_1").unwrap();
        assert_eq!(loaded, meta);
    }

    #[test]
    fn test_document_mask_round_trip() {
        let dir = MemoryDirectory::new();
        let mut mask = RoaringBitmap::new();
        for doc in [2u32, 5, 6, 100] {
            mask.insert(doc);
        }

        write_document_mask(&dir, "seg_1", &mask).unwrap();
        let loaded = read_document_mask(&dir, "seg_1").unwrap();
        assert_eq!(loaded, mask);
    }

    #[test]
    fn test_missing_mask_is_empty() {
        let dir = MemoryDirectory::new();
        let mask = read_document_mask(&dir, "seg_1").unwrap();
        assert!(mask.is_empty());
    }

    #[test]
    fn test_field_meta_round_trip() {
        let dir = MemoryDirectory::new();
        let fields = vec![
            FieldMeta {
                name: "body".to_string(),
                id: 1,
                features: Features::POSITION,
                norm_column: Some(7),
            },
            FieldMeta {
                name: "title".to_string(),
                id: 0,
                features: Features::FREQ,
                norm_column: None,
            },
        ];

        write_field_meta(&dir, "seg_1", &fields).unwrap();
        let loaded = read_field_meta(&dir, "seg_1").unwrap();
        assert_eq!(loaded, fields);
    }

    #[test]
    fn test_index_meta_round_trip() {
        let dir = MemoryDirectory::new();

        let mut seg = SegmentMeta::new("seg_1", codec::DEFAULT_CODEC);
        seg.docs_count = 10;
        seg.files.insert("seg_1.tm".to_string());
        write_segment_meta(&dir, &seg).unwrap();

        let meta = IndexMeta {
            generation: 2,
            segments: vec![seg],
        };
        write_index_meta(&dir, &meta).unwrap();

        assert_eq!(
            last_segments_file(&dir).unwrap(),
            Some("segments_2".to_string())
        );
        let loaded = read_index_meta(&dir, "segments_2").unwrap();
        assert_eq!(loaded, meta);

        let retain = meta.retain_set();
        assert!(retain.contains("segments_2"));
        assert!(retain.contains("seg_1.sm"));
        assert!(retain.contains("seg_1.tm"));
    }
}
