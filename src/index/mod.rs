//! Segmented index: core types, metadata, writer and reader.

pub mod meta;
pub mod reader;
pub mod writer;

pub use meta::{read_index_meta, write_index_meta, IndexMeta, SegmentMeta};
pub use reader::{MaskedDocsIterator, SegmentReader, SegmentSnapshot};
pub use writer::{SegmentWriter, UpdateContext};

use serde::{Deserialize, Serialize};

/// Document identifier, local to one segment.
pub type DocId = u32;

/// Field identifier assigned by insertion order within a segment.
pub type FieldId = u32;

/// Columnstore column identifier, stable in insertion order.
pub type ColumnId = u32;

/// Sentinels and bounds for document identifiers.
pub mod doc_limits {
    use super::DocId;

    /// Reserved "no document" marker; never a valid id.
    pub const INVALID: DocId = 0;
    /// First valid document id within a segment.
    pub const MIN: DocId = 1;
    /// Reserved end-of-stream marker.
    pub const EOF: DocId = u32::MAX;

    pub fn valid(doc: DocId) -> bool {
        doc != INVALID && doc != EOF
    }
}

/// Per-field capability set. A field's effective features are the
/// union across insertions, but each insertion must stay a subset of
/// what the field already recorded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Features(u8);

impl Features {
    pub const NONE: Features = Features(0);
    /// Term frequencies per document.
    pub const FREQ: Features = Features(1);
    /// Token positions; requires `FREQ`.
    pub const POSITION: Features = Features(1 | 2);
    /// Start/end character offsets; requires `POSITION`.
    pub const OFFSET: Features = Features(1 | 2 | 4);
    /// Per-position payload bytes; requires `POSITION`.
    pub const PAYLOAD: Features = Features(1 | 2 | 8);
    /// Length-normalization factor stored per document.
    pub const NORM: Features = Features(16);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Self {
        Features(bits)
    }

    pub fn union(self, other: Features) -> Features {
        Features(self.0 | other.0)
    }

    pub fn is_subset_of(self, other: Features) -> bool {
        self.0 & !other.0 == 0
    }

    pub fn has_freq(self) -> bool {
        self.0 & 1 != 0
    }

    pub fn has_positions(self) -> bool {
        self.0 & 2 != 0
    }

    pub fn has_offsets(self) -> bool {
        self.0 & 4 != 0
    }

    pub fn has_payloads(self) -> bool {
        self.0 & 8 != 0
    }

    pub fn has_norm(self) -> bool {
        self.0 & 16 != 0
    }
}

impl std::ops::BitOr for Features {
    type Output = Features;

    fn bitor(self, rhs: Features) -> Features {
        self.union(rhs)
    }
}

/// Metadata of one indexed field within a segment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldMeta {
    pub name: String,
    pub id: FieldId,
    pub features: Features,
    /// Columnstore column holding this field's norms, when `NORM` is on.
    pub norm_column: Option<ColumnId>,
}
