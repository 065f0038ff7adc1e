//! Segment writer: accumulates documents in memory and flushes them as
//! an immutable segment.
//!
//! All files are created through an owned tracking directory; `flush`
//! swaps the tracked set into the published meta, and a failed flush
//! leaves the partial files tracked so the cleaner can collect them.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use roaring::RoaringBitmap;
use tracing::debug;

use crate::analysis::TokenStream;
use crate::codec::Codec;
use crate::columnstore::{write_column_meta, ColumnMeta, ColumnstoreWriter};
use crate::error::{Error, Result};
use crate::index::meta::{
    write_document_mask, write_field_meta, write_segment_meta, SegmentMeta,
};
use crate::index::{doc_limits, ColumnId, DocId, FieldMeta, Features};
use crate::postings::PostingsBuffer;
use crate::store::{DataOutput, Directory, TrackingDirectory};

/// Name of the reserved column holding per-document stored-field
/// headers. Attribute columns may not use it.
const DOC_HEADER_COLUMN: &str = "";

/// Default norm; norms equal to it are not stored.
const DEFAULT_NORM: f32 = 1.0;

/// Opaque per-document bookkeeping supplied by the host at `finish`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpdateContext {
    pub generation: u64,
    pub update_id: u64,
}

/// Per-field inverter state.
struct FieldSlot {
    meta: FieldMeta,
    terms: std::collections::BTreeMap<Vec<u8>, PostingsBuffer>,
    used: bool,
    stored_column: Option<ColumnId>,
    // current-document state
    cur_doc: DocId,
    position: u32,
    length: u32,
    boost: f32,
    norm_pending: bool,
}

impl FieldSlot {
    fn new(name: &str, id: u32) -> Self {
        Self {
            meta: FieldMeta {
                name: name.to_string(),
                id,
                features: Features::NONE,
                norm_column: None,
            },
            terms: std::collections::BTreeMap::new(),
            used: false,
            stored_column: None,
            cur_doc: doc_limits::INVALID,
            position: 0,
            length: 0,
            boost: DEFAULT_NORM,
            norm_pending: false,
        }
    }

    fn begin_doc(&mut self, doc: DocId) {
        if self.cur_doc != doc {
            self.cur_doc = doc;
            self.position = 0;
            self.length = 0;
            self.boost = DEFAULT_NORM;
        }
    }
}

/// Accumulates documents and produces one segment per `flush`.
pub struct SegmentWriter {
    tracking: TrackingDirectory,
    codec: Arc<Codec>,
    segment: String,
    initialized: bool,
    slots: Vec<FieldSlot>,
    slots_by_name: HashMap<String, usize>,
    columns: ColumnstoreWriter,
    named_columns: Vec<ColumnMeta>,
    columns_by_name: HashMap<String, ColumnId>,
    doc_header: Vec<u32>,
    docs_mask: RoaringBitmap,
    docs_count: u32,
    docs_context: Vec<UpdateContext>,
}

impl SegmentWriter {
    pub fn new(dir: Arc<dyn Directory>, codec: Arc<Codec>) -> Self {
        Self {
            tracking: TrackingDirectory::new(dir),
            codec,
            segment: String::new(),
            initialized: false,
            slots: Vec::new(),
            slots_by_name: HashMap::new(),
            columns: ColumnstoreWriter::new(""),
            named_columns: Vec::new(),
            columns_by_name: HashMap::new(),
            doc_header: Vec::new(),
            docs_mask: RoaringBitmap::new(),
            docs_count: 0,
            docs_context: Vec::new(),
        }
    }

    /// Start a new segment under `name`, dropping any in-progress
    /// state. Previously tracked files become unreferenced and are
    /// left to the cleaner.
    pub fn reset(&mut self, name: &str) {
        let mut dropped = HashSet::new();
        self.tracking.swap_tracked(&mut dropped);
        if !dropped.is_empty() {
            debug!(segment = %self.segment, files = dropped.len(), "abandoning tracked files");
        }
        self.segment = name.to_string();
        self.slots.clear();
        self.slots_by_name.clear();
        self.columns = self.codec.columnstore_writer(name);
        self.named_columns.clear();
        self.columns_by_name.clear();
        self.doc_header.clear();
        self.docs_mask.clear();
        self.docs_count = 0;
        self.docs_context.clear();
        self.initialized = true;
    }

    pub fn name(&self) -> &str {
        &self.segment
    }

    /// Documents accepted so far, masked ones included.
    pub fn docs_count(&self) -> u32 {
        self.docs_count
    }

    pub fn live_docs_count(&self) -> u64 {
        u64::from(self.docs_count) - self.docs_mask.len()
    }

    /// The doc id operations must currently target.
    pub fn current_doc(&self) -> DocId {
        doc_limits::MIN + self.docs_count
    }

    pub fn doc_context(&self, doc: DocId) -> Option<&UpdateContext> {
        if doc < doc_limits::MIN {
            return None;
        }
        self.docs_context.get((doc - doc_limits::MIN) as usize)
    }

    pub fn directory(&self) -> &TrackingDirectory {
        &self.tracking
    }

    /// Invert one field value into the current document.
    ///
    /// The insertion's features must stay a subset of the field's
    /// recorded features; the first insertion records them.
    pub fn index_field(
        &mut self,
        doc: DocId,
        field: &str,
        tokens: &mut dyn TokenStream,
        features: Features,
        boost: f32,
    ) -> Result<()> {
        self.check_current(doc)?;
        validate_features(features)?;

        let slot_idx = self.slot_index(field);
        let slot = &mut self.slots[slot_idx];
        if !slot.used {
            slot.meta.features = features;
            slot.used = true;
        } else if !features.is_subset_of(slot.meta.features) {
            return Err(Error::index(format!(
                "features {:#04x} exceed field {field:?} features {:#04x}",
                features.bits(),
                slot.meta.features.bits()
            )));
        }

        slot.begin_doc(doc);
        slot.boost *= boost;
        while let Some(token) = tokens.next_token() {
            slot.position += token.position_increment;
            let position = slot.position.saturating_sub(1);
            let payload = if features.has_payloads() {
                token.payload
            } else {
                None
            };
            slot.terms
                .entry(token.term)
                .or_default()
                .add(doc, position, token.offset, payload);
            slot.length += 1;
        }

        if features.has_norm() {
            slot.norm_pending = true;
        }
        Ok(())
    }

    /// Store a field value; the field id is recorded in the current
    /// document's stored-field header.
    pub fn store_field(
        &mut self,
        doc: DocId,
        field: &str,
        serializer: impl FnOnce(&mut Vec<u8>) -> Result<()>,
    ) -> Result<()> {
        self.check_current(doc)?;
        let slot_idx = self.slot_index(field);
        let column = match self.slots[slot_idx].stored_column {
            Some(column) => column,
            None => {
                let column = self.named_column(field)?;
                self.slots[slot_idx].stored_column = Some(column);
                column
            }
        };
        let mut value = Vec::new();
        serializer(&mut value)?;
        self.columns.write(column, doc, &value)?;
        let field_id = self.slots[slot_idx].meta.id;
        self.doc_header.push(field_id);
        Ok(())
    }

    /// Store a named column value; insertion order of names defines
    /// the stable column id.
    pub fn store_attribute(
        &mut self,
        doc: DocId,
        name: &str,
        serializer: impl FnOnce(&mut Vec<u8>) -> Result<()>,
    ) -> Result<()> {
        self.check_current(doc)?;
        if name == DOC_HEADER_COLUMN {
            return Err(Error::index("attribute name must not be empty"));
        }
        let column = self.named_column(name)?;
        let mut value = Vec::new();
        serializer(&mut value)?;
        self.columns.write(column, doc, &value)
    }

    /// Mark an already-finalized document as deleted. Returns whether
    /// the mask changed.
    pub fn remove(&mut self, doc: DocId) -> Result<bool> {
        if doc < doc_limits::MIN || doc >= doc_limits::MIN + self.docs_count {
            return Err(Error::index(format!(
                "doc {doc} outside segment range [{}, {})",
                doc_limits::MIN,
                doc_limits::MIN + self.docs_count
            )));
        }
        Ok(self.docs_mask.insert(doc))
    }

    /// Finalize the current document: write norms and the stored-field
    /// header, then advance to the next doc id.
    pub fn finish(&mut self, doc: DocId, ctx: UpdateContext) -> Result<()> {
        self.check_current(doc)?;

        for idx in 0..self.slots.len() {
            let slot = &mut self.slots[idx];
            if !slot.norm_pending || slot.cur_doc != doc {
                slot.norm_pending = false;
                continue;
            }
            slot.norm_pending = false;
            let norm = slot.boost / (slot.length.max(1) as f32).sqrt();
            if norm != DEFAULT_NORM {
                let column = match slot.meta.norm_column {
                    Some(column) => column,
                    None => {
                        let column = self.columns.push_column();
                        self.slots[idx].meta.norm_column = Some(column);
                        column
                    }
                };
                let mut value = Vec::new();
                value.write_zvfloat(norm)?;
                self.columns.write(column, doc, &value)?;
            }
        }

        if !self.doc_header.is_empty() {
            let column = self.named_column(DOC_HEADER_COLUMN)?;
            let mut value = Vec::new();
            value.write_vu32(self.doc_header.len() as u32)?;
            for field_id in &self.doc_header {
                value.write_vu32(*field_id)?;
            }
            self.columns.write(column, doc, &value)?;
            self.doc_header.clear();
        }

        self.docs_context.push(ctx);
        self.docs_count += 1;
        Ok(())
    }

    /// Flush all sub-writers in order, swap the tracked file set into
    /// the meta and publish it. Returns the segment meta filename and
    /// the published meta.
    pub fn flush(&mut self) -> Result<(String, SegmentMeta)> {
        if !self.initialized {
            return Err(Error::index("segment writer is not initialized"));
        }

        let mut meta = SegmentMeta::new(&self.segment, self.codec.name());
        meta.docs_count = self.docs_count;

        // stored fields and attributes
        self.columns.flush(&self.tracking)?;

        // column meta, sorted by name
        if !self.named_columns.is_empty() {
            let mut columns = self.named_columns.clone();
            columns.sort_by(|a, b| a.name.cmp(&b.name));
            write_column_meta(&self.tracking, &self.segment, &columns)?;
        }

        // document mask
        if !self.docs_mask.is_empty() {
            write_document_mask(&self.tracking, &self.segment, &self.docs_mask)?;
        }

        // field meta + inverted index, fields sorted by name
        let mut order: Vec<usize> = (0..self.slots.len()).collect();
        order.sort_by(|&a, &b| self.slots[a].meta.name.cmp(&self.slots[b].meta.name));

        let fields: Vec<FieldMeta> = order.iter().map(|&i| self.slots[i].meta.clone()).collect();
        write_field_meta(&self.tracking, &self.segment, &fields)?;

        let mut field_writer = self.codec.field_writer(&self.tracking, &self.segment)?;
        for &idx in &order {
            let slot = &self.slots[idx];
            if slot.terms.is_empty() {
                continue;
            }
            field_writer.write_field(
                &slot.meta.name,
                slot.meta.features,
                slot.meta.norm_column,
                slot.terms.iter().map(|(term, postings)| (term.as_slice(), postings)),
            )?;
        }
        field_writer.finish()?;

        // transfer ownership of the produced files to the meta
        let mut files = HashSet::new();
        self.tracking.swap_tracked(&mut files);
        meta.files = files.into_iter().collect::<BTreeSet<String>>();

        let filename = write_segment_meta(&self.tracking, &meta)?;
        debug!(segment = %self.segment, docs = meta.docs_count, files = meta.files.len(), "flushed segment");
        // the writer must be reset before it accepts documents again
        self.initialized = false;
        Ok((filename, meta))
    }

    fn check_current(&self, doc: DocId) -> Result<()> {
        if !self.initialized {
            return Err(Error::index("segment writer is not initialized"));
        }
        let expected = self.current_doc();
        if doc != expected {
            return Err(Error::index(format!(
                "document {doc} out of order, expected {expected}"
            )));
        }
        Ok(())
    }

    fn slot_index(&mut self, name: &str) -> usize {
        if let Some(&idx) = self.slots_by_name.get(name) {
            return idx;
        }
        let idx = self.slots.len();
        self.slots.push(FieldSlot::new(name, idx as u32));
        self.slots_by_name.insert(name.to_string(), idx);
        idx
    }

    fn named_column(&mut self, name: &str) -> Result<ColumnId> {
        if let Some(&column) = self.columns_by_name.get(name) {
            return Ok(column);
        }
        let column = self.columns.push_column();
        self.columns_by_name.insert(name.to_string(), column);
        self.named_columns.push(ColumnMeta {
            name: name.to_string(),
            id: column,
        });
        Ok(column)
    }
}

fn validate_features(features: Features) -> Result<()> {
    if (features.has_offsets() || features.has_payloads()) && !features.has_positions() {
        return Err(Error::NotSupported(
            "offsets and payloads require positions".to_string(),
        ));
    }
    if features.has_positions() && !features.has_freq() {
        return Err(Error::NotSupported(
            "positions require frequencies".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::Tokens;
    use crate::codec::default_codec;
    use crate::store::MemoryDirectory;

    fn writer() -> SegmentWriter {
        let dir: Arc<dyn Directory> = Arc::new(MemoryDirectory::new());
        let mut writer = SegmentWriter::new(dir, default_codec());
        writer.reset("seg_1");
        writer
    }

    #[test]
    fn test_basic_flush() {
        let mut writer = writer();

        let mut tokens = Tokens::of_terms(["apple", "pie"]);
        writer
            .index_field(1, "body", &mut tokens, Features::FREQ, 1.0)
            .unwrap();
        writer.finish(1, UpdateContext::default()).unwrap();

        let mut tokens = Tokens::of_terms(["banana"]);
        writer
            .index_field(2, "body", &mut tokens, Features::FREQ, 1.0)
            .unwrap();
        writer.finish(2, UpdateContext::default()).unwrap();

        let (filename, meta) = writer.flush().unwrap();
        assert_eq!(filename, "seg_1.sm");
        assert_eq!(meta.docs_count, 2);
        assert!(meta.files.contains("seg_1.tm"));
        assert!(meta.files.contains("seg_1.ti"));
        assert!(meta.files.contains("seg_1.fm"));
        assert!(!meta.files.contains("seg_1.sm"));
    }

    #[test]
    fn test_out_of_order_doc_rejected() {
        let mut writer = writer();
        let mut tokens = Tokens::of_terms(["x"]);
        assert!(writer
            .index_field(2, "body", &mut tokens, Features::NONE, 1.0)
            .is_err());

        let mut tokens = Tokens::of_terms(["x"]);
        writer
            .index_field(1, "body", &mut tokens, Features::NONE, 1.0)
            .unwrap();
        assert!(writer.finish(2, UpdateContext::default()).is_err());
        writer.finish(1, UpdateContext::default()).unwrap();
    }

    #[test]
    fn test_feature_subset_rule() {
        let mut writer = writer();
        let mut tokens = Tokens::of_terms(["x"]);
        writer
            .index_field(1, "body", &mut tokens, Features::FREQ, 1.0)
            .unwrap();

        // asking for more than the field recorded is rejected
        let mut tokens = Tokens::of_terms(["y"]);
        assert!(writer
            .index_field(1, "body", &mut tokens, Features::POSITION, 1.0)
            .is_err());

        // a subset is fine
        let mut tokens = Tokens::of_terms(["z"]);
        writer
            .index_field(1, "body", &mut tokens, Features::NONE, 1.0)
            .unwrap();
    }

    #[test]
    fn test_remove_range() {
        let mut writer = writer();
        let mut tokens = Tokens::of_terms(["x"]);
        writer
            .index_field(1, "body", &mut tokens, Features::NONE, 1.0)
            .unwrap();
        writer.finish(1, UpdateContext::default()).unwrap();

        assert!(writer.remove(1).unwrap());
        assert!(!writer.remove(1).unwrap());
        assert!(writer.remove(2).is_err());
        assert!(writer.remove(0).is_err());
        assert_eq!(writer.live_docs_count(), 0);
    }

    #[test]
    fn test_reset_drops_tracked_files() {
        let mut writer = writer();
        let mut tokens = Tokens::of_terms(["x"]);
        writer
            .index_field(1, "body", &mut tokens, Features::NONE, 1.0)
            .unwrap();
        writer.finish(1, UpdateContext::default()).unwrap();
        writer.flush().unwrap();

        writer.reset("seg_2");
        assert_eq!(writer.docs_count(), 0);
        assert_eq!(writer.name(), "seg_2");
        assert!(writer.directory().tracked().is_empty());
    }

    #[test]
    fn test_update_context_recorded() {
        let mut writer = writer();
        let mut tokens = Tokens::of_terms(["x"]);
        writer
            .index_field(1, "body", &mut tokens, Features::NONE, 1.0)
            .unwrap();
        let ctx = UpdateContext {
            generation: 7,
            update_id: 3,
        };
        writer.finish(1, ctx).unwrap();
        assert_eq!(writer.doc_context(1), Some(&ctx));
        assert_eq!(writer.doc_context(2), None);
    }

    #[test]
    fn test_empty_attribute_name_rejected() {
        let mut writer = writer();
        assert!(writer.store_attribute(1, "", |_| Ok(())).is_err());
    }
}
