//! Record identifiers.

use crate::error::{Error, Result};
use crate::segment::{SegmentId, ALIGN, MAX_SEGMENT_SIZE, RECORD_ALIGN_BITS};
use crate::tracker::SegmentTracker;
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

/// The type of a record, as stored in segment root tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordType {
    /// A raw byte run.
    Block = 0,
    /// A length-prefixed list stored as a complete tree of buckets.
    List = 1,
    /// A string in one of the inline size classes or as a block list.
    String = 2,
    /// A binary value; adds the two external-reference modes.
    Value = 3,
    /// A hash-trie map of string keys to record ids.
    Map = 4,
    /// A deduplicated descriptor of a node's shape.
    Template = 5,
    /// A node: template, property values, children.
    Node = 6,
    /// A multi-valued property: count plus value list.
    Property = 7,
}

impl TryFrom<u8> for RecordType {
    type Error = ();

    fn try_from(value: u8) -> std::result::Result<Self, ()> {
        match value {
            0 => Ok(Self::Block),
            1 => Ok(Self::List),
            2 => Ok(Self::String),
            3 => Ok(Self::Value),
            4 => Ok(Self::Map),
            5 => Ok(Self::Template),
            6 => Ok(Self::Node),
            7 => Ok(Self::Property),
            _ => Err(()),
        }
    }
}

/// The address of a record: a segment id and an aligned offset within the
/// segment.
///
/// Record ids are value types; they stay valid for as long as the segment
/// they point into is readable through the store.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RecordId {
    segment: SegmentId,
    offset: u32,
}

/// Size of a record id embedded in a record.
pub(crate) const RECORD_ID_BYTES: usize = 18;

impl RecordId {
    /// Creates a record id.
    ///
    /// # Panics
    ///
    /// Panics if the offset is not aligned or lies outside the segment
    /// address space; both indicate a bug in the codec.
    #[must_use]
    pub fn new(segment: SegmentId, offset: u32) -> Self {
        assert!(
            (offset as usize) < MAX_SEGMENT_SIZE,
            "record offset {offset:#x} out of bounds"
        );
        assert!(
            offset as usize % ALIGN == 0,
            "record offset {offset:#x} is not {ALIGN}-byte aligned"
        );
        Self { segment, offset }
    }

    /// Returns the segment id part.
    #[must_use]
    pub fn segment_id(&self) -> &SegmentId {
        &self.segment
    }

    /// Returns the offset within the segment.
    #[must_use]
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Serializes the id into its embedded 18-byte form.
    #[must_use]
    pub(crate) fn to_bytes(&self) -> [u8; RECORD_ID_BYTES] {
        let mut bytes = [0u8; RECORD_ID_BYTES];
        bytes[0..8].copy_from_slice(&self.segment.msb().to_be_bytes());
        bytes[8..16].copy_from_slice(&self.segment.lsb().to_be_bytes());
        let packed = (self.offset >> RECORD_ALIGN_BITS) as u16;
        bytes[16..18].copy_from_slice(&packed.to_be_bytes());
        bytes
    }

    /// Parses the textual form of a record id.
    ///
    /// Accepts the canonical `"<uuid>.<offset-hex4>"` form and the legacy
    /// `"<uuid>:<decimal-offset>"` form.
    pub fn parse(tracker: &SegmentTracker, text: &str) -> Result<Self> {
        let (uuid, rest) = match (text.get(..36), text.get(36..)) {
            (Some(uuid), Some(rest)) => (uuid, rest),
            _ => return Err(Error::invalid_record_id(text)),
        };
        let uuid = Uuid::parse_str(uuid).map_err(|_| Error::invalid_record_id(text))?;

        let offset = match rest.as_bytes().first() {
            Some(b'.') => u32::from_str_radix(&rest[1..], 16)
                .ok()
                .filter(|_| rest.len() == 5)
                .map(|packed| packed << RECORD_ALIGN_BITS),
            Some(b':') => rest[1..].parse::<u32>().ok(),
            _ => None,
        }
        .ok_or_else(|| Error::invalid_record_id(text))?;

        if offset as usize >= MAX_SEGMENT_SIZE || offset as usize % ALIGN != 0 {
            return Err(Error::invalid_record_id(text));
        }

        let (msb, lsb) = uuid.as_u64_pair();
        Ok(Self {
            segment: tracker.segment_id(msb, lsb),
            offset,
        })
    }
}

impl PartialOrd for RecordId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RecordId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.segment
            .cmp(&other.segment)
            .then(self.offset.cmp(&other.offset))
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:04x}",
            self.segment,
            self.offset >> RECORD_ALIGN_BITS
        )
    }
}

impl fmt::Debug for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordId({self})")
    }
}
