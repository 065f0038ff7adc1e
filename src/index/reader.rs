//! Segment reader: opens a published segment for query execution.
//!
//! The reader state lives behind an atomic snapshot pointer so a
//! `reopen` can race with in-flight reads; every query first acquires
//! a [`SegmentSnapshot`] and works against that immutable view.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use roaring::RoaringBitmap;
use tracing::warn;

use crate::codec;
use crate::columnstore::{read_column_meta, ColumnMeta, ColumnValues, ColumnstoreReader};
use crate::error::{Error, Result};
use crate::index::meta::{read_document_mask, read_field_meta, SegmentMeta};
use crate::index::{doc_limits, DocId, FieldId, FieldMeta};
use crate::store::{reference, Directory, FileRef};
use crate::termdict::{FieldReader, TermReader};

struct SegmentInner {
    dir: Arc<dyn Directory>,
    meta: SegmentMeta,
    mask: Arc<RoaringBitmap>,
    fields: FieldReader,
    field_meta: Vec<FieldMeta>,
    fields_by_id: HashMap<FieldId, usize>,
    columnstore: Option<ColumnstoreReader>,
    columns: Vec<ColumnMeta>,
    columns_by_name: HashMap<String, usize>,
    /// Pins every segment file against the cleaner while open.
    _refs: Vec<FileRef>,
}

/// Reader over one immutable segment.
pub struct SegmentReader {
    inner: ArcSwap<SegmentInner>,
}

impl SegmentReader {
    /// Open a published segment. Any failure logs the reason and
    /// yields `None`; nothing (file refs included) leaks on failure.
    pub fn open(dir: Arc<dyn Directory>, meta: &SegmentMeta) -> Option<SegmentReader> {
        match Self::open_inner(dir, meta) {
            Ok(inner) => Some(SegmentReader {
                inner: ArcSwap::from_pointee(inner),
            }),
            Err(err) => {
                warn!(segment = %meta.name, %err, "failed to open segment");
                None
            }
        }
    }

    fn open_inner(dir: Arc<dyn Directory>, meta: &SegmentMeta) -> Result<SegmentInner> {
        // pin the segment's files first so the cleaner cannot race the
        // open; refs drop on any failure below
        let meta_file = meta.filename();
        let mut refs = Vec::with_capacity(meta.files.len() + 1);
        for name in meta.files.iter().chain(std::iter::once(&meta_file)) {
            match reference(dir.as_ref(), name, false)? {
                Some(file_ref) => refs.push(file_ref),
                None => {
                    return Err(Error::io(format!("segment file missing: {name}")));
                }
            }
        }

        let mask = Arc::new(read_document_mask(dir.as_ref(), &meta.name)?);
        if mask.len() > u64::from(meta.docs_count) {
            return Err(Error::index("document mask larger than segment"));
        }

        let codec = codec::codec(&meta.codec).ok_or_else(|| {
            Error::NotSupported(format!("unknown codec {:?}", meta.codec))
        })?;

        let fields = codec.field_reader(dir.as_ref(), meta, Arc::clone(&mask))?;

        // a broken columnstore degrades to "no stored values"
        let columnstore = match codec.columnstore_reader(dir.as_ref(), meta) {
            Ok(reader) => reader,
            Err(err) => {
                warn!(segment = %meta.name, %err, "columnstore unavailable, continuing without");
                None
            }
        };

        let columns = read_column_meta(dir.as_ref(), &meta.name)?;
        let columns_by_name = columns
            .iter()
            .enumerate()
            .map(|(idx, column)| (column.name.clone(), idx))
            .collect();

        let field_meta = read_field_meta(dir.as_ref(), &meta.name)?;
        let fields_by_id = field_meta
            .iter()
            .enumerate()
            .map(|(idx, field)| (field.id, idx))
            .collect();

        Ok(SegmentInner {
            dir,
            meta: meta.clone(),
            mask,
            fields,
            field_meta,
            fields_by_id,
            columnstore,
            columns,
            columns_by_name,
            _refs: refs,
        })
    }

    /// Immutable view for the duration of a query.
    pub fn snapshot(&self) -> SegmentSnapshot {
        SegmentSnapshot(self.inner.load_full())
    }

    /// Reuse this reader when the meta version is unchanged, otherwise
    /// open the new version afresh.
    pub fn reopen(&self, meta: &SegmentMeta) -> Option<SegmentReader> {
        let current = self.inner.load_full();
        if current.meta.version == meta.version {
            return Some(SegmentReader {
                inner: ArcSwap::new(current),
            });
        }
        SegmentReader::open(Arc::clone(&current.dir), meta)
    }

    /// Atomically switch this reader to a newer segment version;
    /// concurrent reads keep the snapshot they already acquired.
    pub fn refresh(&self, meta: &SegmentMeta) -> bool {
        let current = self.inner.load_full();
        if current.meta.version == meta.version {
            return true;
        }
        match Self::open_inner(Arc::clone(&current.dir), meta) {
            Ok(inner) => {
                self.inner.store(Arc::new(inner));
                true
            }
            Err(err) => {
                warn!(segment = %meta.name, %err, "failed to refresh segment");
                false
            }
        }
    }

    pub fn meta(&self) -> SegmentMeta {
        self.inner.load().meta.clone()
    }

    pub fn docs_count(&self) -> u32 {
        self.inner.load().meta.docs_count
    }

    pub fn live_docs_count(&self) -> u64 {
        let inner = self.inner.load();
        u64::from(inner.meta.docs_count) - inner.mask.len()
    }
}

impl Clone for SegmentReader {
    fn clone(&self) -> Self {
        SegmentReader {
            inner: ArcSwap::new(self.inner.load_full()),
        }
    }
}

/// Cheaply cloneable immutable view over a segment.
#[derive(Clone)]
pub struct SegmentSnapshot(Arc<SegmentInner>);

impl SegmentSnapshot {
    pub fn meta(&self) -> &SegmentMeta {
        &self.0.meta
    }

    pub fn docs_count(&self) -> u32 {
        self.0.meta.docs_count
    }

    pub fn live_docs_count(&self) -> u64 {
        u64::from(self.0.meta.docs_count) - self.0.mask.len()
    }

    pub fn mask(&self) -> &Arc<RoaringBitmap> {
        &self.0.mask
    }

    /// Term dictionary view of one field.
    pub fn field(&self, name: &str) -> Option<TermReader<'_>> {
        self.0.fields.field(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = TermReader<'_>> {
        self.0.fields.fields()
    }

    pub fn field_meta(&self, name: &str) -> Option<&FieldMeta> {
        self.0.field_meta.iter().find(|f| f.name == name)
    }

    /// Named column lookup (hash map under the hood).
    pub fn column(&self, name: &str) -> Option<&ColumnMeta> {
        self.0
            .columns_by_name
            .get(name)
            .map(|&idx| &self.0.columns[idx])
    }

    /// All named columns in ascending name order.
    pub fn columns(&self) -> &[ColumnMeta] {
        &self.0.columns
    }

    /// Every live doc id in ascending order.
    pub fn docs_iterator(&self) -> MaskedDocsIterator {
        MaskedDocsIterator::new(
            doc_limits::MIN,
            doc_limits::MIN + self.0.meta.docs_count,
            Arc::clone(&self.0.mask),
        )
    }

    /// Stored-value accessor for a field; answers `false` for every
    /// doc when the segment has no columnstore or the field stores
    /// nothing.
    pub fn values(&self, field: FieldId) -> ColumnValues {
        let Some(store) = &self.0.columnstore else {
            return ColumnValues::empty();
        };
        let Some(&idx) = self.0.fields_by_id.get(&field) else {
            return ColumnValues::empty();
        };
        let name = &self.0.field_meta[idx].name;
        match self.0.columns_by_name.get(name) {
            Some(&column_idx) => store.values(self.0.columns[column_idx].id),
            None => ColumnValues::empty(),
        }
    }

    /// Stored-value accessor for a named attribute column.
    pub fn values_by_name(&self, name: &str) -> ColumnValues {
        let Some(store) = &self.0.columnstore else {
            return ColumnValues::empty();
        };
        match self.0.columns_by_name.get(name) {
            Some(&idx) => store.values(self.0.columns[idx].id),
            None => ColumnValues::empty(),
        }
    }

    /// Per-doc norm accessor for a field, when the field carries one.
    pub fn norms(&self, name: &str) -> Option<ColumnValues> {
        let store = self.0.columnstore.as_ref()?;
        let field = self.field_meta(name)?;
        field.norm_column.map(|column| store.values(column))
    }
}

/// Ascending scan over `[begin, end)` skipping masked documents.
pub struct MaskedDocsIterator {
    next: DocId,
    end: DocId,
    mask: Arc<RoaringBitmap>,
    current: DocId,
}

impl MaskedDocsIterator {
    pub fn new(begin: DocId, end: DocId, mask: Arc<RoaringBitmap>) -> Self {
        Self {
            next: begin,
            end,
            mask,
            current: doc_limits::INVALID,
        }
    }

    pub fn next(&mut self) -> bool {
        while self.next < self.end {
            let candidate = self.next;
            self.next += 1;
            if !self.mask.contains(candidate) {
                self.current = candidate;
                return true;
            }
        }
        self.current = doc_limits::EOF;
        false
    }

    pub fn value(&self) -> DocId {
        self.current
    }
}
