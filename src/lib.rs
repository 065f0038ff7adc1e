//! Embeddable full-text search engine core.
//!
//! `silt` builds, persists and queries inverted indexes over document
//! fields. Documents accumulate in a [`SegmentWriter`], flush as
//! immutable segments, and are searched through [`SegmentReader`]
//! snapshots with structured [`Filter`] values (term / prefix / range /
//! fuzzy / boolean).
//!
//! ```no_run
//! use std::sync::Arc;
//! use silt::analysis::Tokens;
//! use silt::codec::default_codec;
//! use silt::index::{Features, SegmentReader, SegmentWriter, UpdateContext};
//! use silt::search::{Filter, IndexSnapshot};
//! use silt::store::{Directory, MemoryDirectory};
//!
//! # fn main() -> silt::Result<()> {
//! let dir: Arc<dyn Directory> = Arc::new(MemoryDirectory::new());
//!
//! let mut writer = SegmentWriter::new(Arc::clone(&dir), default_codec());
//! writer.reset("seg_1");
//! let mut tokens = Tokens::of_terms(["hello", "world"]);
//! writer.index_field(1, "body", &mut tokens, Features::FREQ, 1.0)?;
//! writer.finish(1, UpdateContext::default())?;
//! let (_, meta) = writer.flush()?;
//!
//! let reader = SegmentReader::open(dir, &meta).expect("open segment");
//! let index = IndexSnapshot::from_readers([&reader]);
//! let docs = Filter::term("body", b"hello".to_vec()).matching_docs(&index);
//! assert_eq!(docs[0], vec![1]);
//! # Ok(())
//! # }
//! ```

pub mod analysis;
pub mod codec;
pub mod columnstore;
pub mod error;
pub mod index;
pub mod postings;
pub mod search;
pub mod store;
pub mod termdict;

pub use error::{Error, Result};
pub use index::{SegmentReader, SegmentWriter};
pub use search::{Filter, IndexSnapshot};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
