//! Segment identifiers.
//!
//! A segment id is a 128-bit identifier split into two 64-bit halves. The
//! high nibble of the low half encodes the segment kind (`0xA` data, `0xB`
//! bulk); bits 12–15 of the high half carry the storage format version.
//! Everything else is random.
//!
//! Ids are interned by the [`SegmentTracker`](crate::tracker::SegmentTracker):
//! for any `(msb, lsb)` pair there is at most one live `SegmentId`, so
//! identity can be checked by pointer equality.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Mask clearing the version nibble of the high half.
pub(crate) const MSB_MASK: u64 = !(0xF << 12);

/// Mask clearing the kind nibble of the low half.
pub(crate) const LSB_MASK: u64 = !(0xF << 60);

/// Kind nibble of a data segment id.
pub(crate) const DATA_BITS: u64 = 0xA << 60;

/// Kind nibble of a bulk segment id.
pub(crate) const BULK_BITS: u64 = 0xB << 60;

/// Checks whether the low half of a segment id denotes a data segment.
#[must_use]
pub fn is_data_segment_id(lsb: u64) -> bool {
    (lsb >> 60) == 0xA
}

/// The kind of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// Contains records: nodes, properties, maps, lists, templates.
    Data,
    /// Contains opaque binary payload only; has no references.
    Bulk,
}

#[derive(Debug)]
pub(crate) struct SegmentIdInner {
    pub(crate) msb: u64,
    pub(crate) lsb: u64,
}

/// An interned segment identifier.
///
/// Cheap to clone; equality and ordering compare the id bits, while
/// [`SegmentId::ptr_eq`] checks interning identity.
#[derive(Debug, Clone)]
pub struct SegmentId(Arc<SegmentIdInner>);

impl SegmentId {
    pub(crate) fn from_inner(inner: Arc<SegmentIdInner>) -> Self {
        Self(inner)
    }

    /// Returns the most significant half of the id.
    #[must_use]
    pub fn msb(&self) -> u64 {
        self.0.msb
    }

    /// Returns the least significant half of the id.
    #[must_use]
    pub fn lsb(&self) -> u64 {
        self.0.lsb
    }

    /// Returns the kind encoded in the id.
    #[must_use]
    pub fn kind(&self) -> SegmentKind {
        if self.is_data() {
            SegmentKind::Data
        } else {
            SegmentKind::Bulk
        }
    }

    /// Checks whether this id denotes a data segment.
    #[must_use]
    pub fn is_data(&self) -> bool {
        is_data_segment_id(self.0.lsb)
    }

    /// Checks whether this id denotes a bulk segment.
    #[must_use]
    pub fn is_bulk(&self) -> bool {
        !self.is_data()
    }

    /// Returns the id as a UUID.
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        Uuid::from_u64_pair(self.0.msb, self.0.lsb)
    }

    /// Returns the id in the archive layer's form.
    #[must_use]
    pub fn entry_id(&self) -> arbordb_storage::EntryId {
        arbordb_storage::EntryId::new(self.0.msb, self.0.lsb)
    }

    /// Checks whether two ids are the same interned instance.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for SegmentId {
    fn eq(&self, other: &Self) -> bool {
        self.0.msb == other.0.msb && self.0.lsb == other.0.lsb
    }
}

impl Eq for SegmentId {}

impl PartialOrd for SegmentId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SegmentId {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.0.msb, self.0.lsb).cmp(&(other.0.msb, other.0.lsb))
    }
}

impl std::hash::Hash for SegmentId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.msb.hash(state);
        self.0.lsb.hash(state);
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_uuid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::SegmentTracker;

    #[test]
    fn kind_from_lsb() {
        let tracker = SegmentTracker::new();
        assert!(tracker.new_data_id().is_data());
        assert!(tracker.new_bulk_id().is_bulk());
    }

    #[test]
    fn display_is_uuid() {
        let tracker = SegmentTracker::new();
        let id = tracker.segment_id(0x0123_4567_89AB_4000, 0xA000_0000_0000_0001);
        assert_eq!(format!("{id}"), "01234567-89ab-4000-a000-000000000001");
    }

    #[test]
    fn value_equality_and_identity() {
        let tracker = SegmentTracker::new();
        let a = tracker.segment_id(1, DATA_BITS | 2);
        let b = tracker.segment_id(1, DATA_BITS | 2);
        assert_eq!(a, b);
        assert!(a.ptr_eq(&b));
    }
}
