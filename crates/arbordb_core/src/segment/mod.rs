//! Segments: immutable, self-describing byte buffers holding records.

pub(crate) mod data;
pub(crate) mod id;
mod pool;
mod writer;

pub use data::{Segment, ALIGN, MAX_SEGMENT_SIZE, RECORD_ALIGN_BITS, SEGMENT_MAGIC, SEGMENT_VERSION};
pub use id::{is_data_segment_id, SegmentId, SegmentKind};
pub use pool::WriterPool;
pub use writer::SegmentBufferWriter;
