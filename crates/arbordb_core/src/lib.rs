//! # ArborDB Core
//!
//! Segment store engine for an immutable, content-addressed tree of nodes.
//!
//! This crate provides:
//! - The segment codec: immutable, self-describing byte buffers holding
//!   typed records, addressed as `(segment id, offset)`
//! - The record codec: blocks, lists, hash-trie maps, strings, binary
//!   streams, templates, nodes and properties on top of segments
//! - The segment tracker (interned ids) and the segment cache
//! - The file store: append-only archive files, the root journal, and the
//!   directory lock
//! - The generational garbage collector: estimate, compact, cleanup
//! - The node store: root access, merges, checkpoints and blobs
//!
//! The unit of storage is the **segment** (at most 256 KiB). Segments are
//! immutable once written; every change allocates new records in new
//! segments, and the current root is advanced by a compare-and-set on the
//! head record id, made durable by a journal append.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
pub mod config;
pub mod error;
pub mod journal;
pub mod node;
pub mod node_store;
pub mod record;
pub mod segment;
pub mod store;
pub mod tracker;

pub use config::{Config, GcOptions};
pub use error::{Error, Result};
pub use node::{Blob, NodeBuilder, NodeState, Property, Scalar, Type, Value};
pub use node_store::{BlobStore, CommitHook, EmptyHook, NodeStore};
pub use record::{RecordId, RecordType};
pub use segment::{Segment, SegmentId, SegmentKind};
pub use store::monitor::{GcMonitor, LoggingMonitor, NullMonitor};
pub use store::{FileStore, MemoryStore, SegmentStore, StoreStats};
pub use tracker::SegmentTracker;
