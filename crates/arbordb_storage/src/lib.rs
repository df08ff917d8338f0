//! # ArborDB Storage
//!
//! Archive file layer for the ArborDB segment store.
//!
//! An archive is a single append-only container of segments, laid out as a
//! sequence of 512-byte blocks. Each entry is a header block followed by the
//! segment payload rounded up to the block size. When an archive is sealed,
//! three footer entries are appended:
//!
//! - `.brf`: external binary references discovered while writing,
//! - `.gph`: the inter-segment reference graph of this archive,
//! - `.idx`: an offset index over every segment in the file,
//!
//! followed by the conventional two zero blocks. Sealed archives are
//! immutable; the index footer is located by reading backwards from the end
//! of the file.
//!
//! ## Design principles
//!
//! - Archives are **opaque containers**: entries are identified by the two
//!   64-bit halves of a segment id and carry a GC generation, but this crate
//!   never interprets segment payloads. Where payload knowledge is
//!   unavoidable (rebuilding a reference graph during a sweep of a recovered
//!   file), it is obtained through the [`SegmentMetaParser`] callback.
//! - Writers append, seal, and never mutate existing bytes.
//! - A truncated unsealed archive is recovered by a forward scan; corruption
//!   inside a sealed footer rejects only that footer, never silently drops
//!   data.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod checksum;
mod entry;
mod error;
mod graph;
mod index;
mod reader;
mod writer;

pub use entry::{EntryId, BLOCK_SIZE};
pub use error::{StorageError, StorageResult};
pub use graph::{BinaryReferences, SegmentGraph};
pub use index::IndexEntry;
pub use reader::{ArchiveReader, SegmentMetaParser, Sweep};
pub use writer::ArchiveWriter;
