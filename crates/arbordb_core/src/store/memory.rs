//! In-memory segment store for tests and ephemeral use.

use crate::error::{Error, Result};
use crate::record::RecordReader;
use crate::segment::{Segment, SegmentId};
use crate::store::SegmentStore;
use crate::tracker::SegmentTracker;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// A segment store keeping every segment in a map.
///
/// Mirrors the semantics of the file store without touching disk. Used by
/// the codec tests; segments are never reclaimed.
pub struct MemoryStore {
    tracker: SegmentTracker,
    reader: RecordReader,
    segments: RwLock<HashMap<(u64, u64), Arc<Segment>>>,
}

impl MemoryStore {
    /// Creates an empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tracker: SegmentTracker::new(),
            reader: RecordReader::new(),
            segments: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the number of stored segments.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.read().len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentStore for MemoryStore {
    fn tracker(&self) -> &SegmentTracker {
        &self.tracker
    }

    fn record_reader(&self) -> &RecordReader {
        &self.reader
    }

    fn read_segment(&self, id: &SegmentId) -> Result<Arc<Segment>> {
        self.segments
            .read()
            .get(&(id.msb(), id.lsb()))
            .cloned()
            .ok_or_else(|| Error::segment_not_found(id))
    }

    fn write_segment(
        &self,
        id: &SegmentId,
        data: &[u8],
        _binary_references: &[String],
    ) -> Result<()> {
        let segment = Arc::new(Segment::parse(id.clone(), data.to_vec())?);
        self.segments
            .write()
            .insert((id.msb(), id.lsb()), segment);
        Ok(())
    }

    fn contains_segment(&self, id: &SegmentId) -> bool {
        self.segments.read().contains_key(&(id.msb(), id.lsb()))
    }
}
