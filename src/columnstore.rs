//! Columnstore: per-column document values stored beside the inverted
//! index (`.cs` data, `.csi` column meta).
//!
//! Columns are addressed by a dense id assigned in insertion order;
//! named columns get their name → id mapping from the `.csi` table.
//! The bytes of a value are opaque to the store.

use std::sync::Arc;

use crate::codec::{ext, open_checked, segment_file, write_footer, write_header};
use crate::error::{Error, Result};
use crate::index::{ColumnId, DocId};
use crate::store::{DataInput, DataOutput, Directory, IoAdvice};

const CS_FORMAT: u16 = 5;
const CS_VERSION: u16 = 0;
const CSI_FORMAT: u16 = 6;
const CSI_VERSION: u16 = 0;

/// Name → column id entry of the `.csi` table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnMeta {
    pub name: String,
    pub id: ColumnId,
}

/// Accumulates column values in memory and writes the `.cs` file at
/// segment flush. Values must arrive in ascending doc order per column.
pub struct ColumnstoreWriter {
    segment: String,
    columns: Vec<ColumnBuffer>,
}

#[derive(Default)]
struct ColumnBuffer {
    docs: Vec<DocId>,
    values: Vec<Vec<u8>>,
}

impl ColumnstoreWriter {
    pub fn new(segment: impl Into<String>) -> Self {
        Self {
            segment: segment.into(),
            columns: Vec::new(),
        }
    }

    /// Allocate the next column; ids are dense and stable.
    pub fn push_column(&mut self) -> ColumnId {
        self.columns.push(ColumnBuffer::default());
        (self.columns.len() - 1) as ColumnId
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.iter().all(|c| c.docs.is_empty())
    }

    /// Append a value. Writing the same doc again extends the pending
    /// value bytes; going backwards is an error.
    pub fn write(&mut self, column: ColumnId, doc: DocId, value: &[u8]) -> Result<()> {
        let buffer = self
            .columns
            .get_mut(column as usize)
            .ok_or_else(|| Error::index(format!("unknown column id {column}")))?;
        match buffer.docs.last() {
            Some(&last) if last == doc => {
                buffer.values.last_mut().unwrap().extend_from_slice(value);
            }
            Some(&last) if last > doc => {
                return Err(Error::index(format!(
                    "column {column} written out of order: {doc} after {last}"
                )));
            }
            _ => {
                buffer.docs.push(doc);
                buffer.values.push(value.to_vec());
            }
        }
        Ok(())
    }

    /// Write `.cs` and drop the buffered state. Returns `false` when
    /// nothing was ever stored (no file is produced).
    pub fn flush(&mut self, dir: &dyn Directory) -> Result<bool> {
        if self.is_empty() {
            self.columns.clear();
            return Ok(false);
        }
        let filename = segment_file(&self.segment, ext::CS);
        let mut out = dir.create(&filename)?;
        write_header(out.as_mut(), CS_FORMAT, CS_VERSION)?;
        out.write_vu32(self.columns.len() as u32)?;
        for column in &self.columns {
            out.write_vu64(column.docs.len() as u64)?;
            let mut prev: DocId = 0;
            for (doc, value) in column.docs.iter().zip(&column.values) {
                out.write_vu32(doc - prev)?;
                out.write_blob(value)?;
                prev = *doc;
            }
        }
        write_footer(out.as_mut())?;
        out.close()?;
        self.columns.clear();
        Ok(true)
    }
}

struct ColumnData {
    docs: Vec<DocId>,
    values: Vec<Vec<u8>>,
}

/// Reader over a flushed `.cs` file.
pub struct ColumnstoreReader {
    columns: Arc<Vec<ColumnData>>,
}

impl ColumnstoreReader {
    pub fn open(dir: &dyn Directory, segment: &str) -> Result<Self> {
        let filename = segment_file(segment, ext::CS);
        let (mut input, _) = open_checked(dir, &filename, IoAdvice::Random, CS_FORMAT, CS_VERSION)?;
        let column_count = input.read_vu32()? as usize;
        let mut columns = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            let entry_count = input.read_vu64()? as usize;
            let mut docs = Vec::with_capacity(entry_count);
            let mut values = Vec::with_capacity(entry_count);
            let mut prev: DocId = 0;
            for _ in 0..entry_count {
                prev += input.read_vu32()?;
                docs.push(prev);
                values.push(input.read_blob()?);
            }
            columns.push(ColumnData { docs, values });
        }
        Ok(Self {
            columns: Arc::new(columns),
        })
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Value accessor for one column; unknown ids yield the empty view.
    pub fn values(&self, column: ColumnId) -> ColumnValues {
        if (column as usize) < self.columns.len() {
            ColumnValues {
                columns: Some(Arc::clone(&self.columns)),
                column: column as usize,
            }
        } else {
            ColumnValues::empty()
        }
    }

    /// Visit `(doc, bytes)` pairs in ascending doc order. Returns
    /// `false` when the column does not exist.
    pub fn visit(
        &self,
        column: ColumnId,
        visitor: &mut dyn FnMut(DocId, &[u8]) -> bool,
    ) -> bool {
        let Some(data) = self.columns.get(column as usize) else {
            return false;
        };
        for (doc, value) in data.docs.iter().zip(&data.values) {
            if !visitor(*doc, value) {
                break;
            }
        }
        true
    }
}

/// Cloneable `(doc, &mut out) -> bool` view over one column; answers
/// "has a stored value" and copies the bytes out when present.
#[derive(Clone)]
pub struct ColumnValues {
    columns: Option<Arc<Vec<ColumnData>>>,
    column: usize,
}

impl ColumnValues {
    /// View that never has a value, used when a segment carries no
    /// columnstore.
    pub fn empty() -> Self {
        Self {
            columns: None,
            column: 0,
        }
    }

    pub fn get(&self, doc: DocId, out: &mut Vec<u8>) -> bool {
        let Some(columns) = &self.columns else {
            return false;
        };
        let data = &columns[self.column];
        match data.docs.binary_search(&doc) {
            Ok(idx) => {
                out.clear();
                out.extend_from_slice(&data.values[idx]);
                true
            }
            Err(_) => false,
        }
    }
}

/// Write the `.csi` name → id table, sorted ascending by name.
pub fn write_column_meta(
    dir: &dyn Directory,
    segment: &str,
    columns: &[ColumnMeta],
) -> Result<String> {
    debug_assert!(columns.windows(2).all(|w| w[0].name < w[1].name));
    let filename = segment_file(segment, ext::CSI);
    let mut out = dir.create(&filename)?;
    write_header(out.as_mut(), CSI_FORMAT, CSI_VERSION)?;
    out.write_vu64(columns.len() as u64)?;
    for column in columns {
        out.write_str(&column.name)?;
        out.write_vu32(column.id)?;
    }
    write_footer(out.as_mut())?;
    out.close()?;
    Ok(filename)
}

/// Read the `.csi` table; a missing file means no named columns.
/// Entries must be sorted ascending by name and unique.
pub fn read_column_meta(dir: &dyn Directory, segment: &str) -> Result<Vec<ColumnMeta>> {
    let filename = segment_file(segment, ext::CSI);
    if !dir.exists(&filename)? {
        return Ok(Vec::new());
    }
    let (mut input, _) =
        open_checked(dir, &filename, IoAdvice::ReadOnce, CSI_FORMAT, CSI_VERSION)?;
    let count = input.read_vu64()? as usize;
    let mut columns: Vec<ColumnMeta> = Vec::with_capacity(count);
    for _ in 0..count {
        let name = input.read_str()?;
        if let Some(last) = columns.last() {
            if last.name >= name {
                return Err(Error::index(format!(
                    "column meta out of order: {name:?} after {:?}",
                    last.name
                )));
            }
        }
        let id = input.read_vu32()?;
        columns.push(ColumnMeta { name, id });
    }
    Ok(columns)
}
