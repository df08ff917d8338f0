//! The segment codec.
//!
//! A data segment is laid out as (big-endian throughout):
//!
//! ```text
//! | magic (3) | version (1) | generation (4) | refCount (4) | rootCount (4) |
//! | refs: refCount * (msb 8, lsb 8) |
//! | roots: rootCount * (type 1, pad 1, packed offset 2) |
//! | record payload, growing down from the tail |
//! ```
//!
//! Record offsets are *virtual*: they address a segment-sized space whose
//! last byte sits at `MAX_SEGMENT_SIZE`, with records packed against the
//! tail. Offsets are 16-byte aligned and pack into a `u16` as
//! `offset >> RECORD_ALIGN_BITS`.
//!
//! A bulk segment has no header at all: the whole buffer is opaque payload,
//! addressed the same tail-relative way.
//!
//! ## Invariants
//!
//! - A segment only references segments listed in its refs header
//! - Root entries point at well-formed records of the declared type
//! - Segments are immutable once written

use crate::error::{Error, Result};
use crate::record::RecordType;
use crate::segment::SegmentId;

/// Maximum size of a segment in bytes.
pub const MAX_SEGMENT_SIZE: usize = 1 << 18;

/// Number of bits record offsets are shifted by when packed.
pub const RECORD_ALIGN_BITS: u32 = 4;

/// Record alignment in bytes.
pub const ALIGN: usize = 1 << RECORD_ALIGN_BITS;

/// Version number of the segment storage format.
pub const SEGMENT_VERSION: u8 = 4;

/// Magic bytes opening every data segment.
pub const SEGMENT_MAGIC: [u8; 3] = *b"aDB";

/// Fixed part of the data segment header.
pub(crate) const HEADER_SIZE: usize = 16;

/// Size of one encoded segment reference.
pub(crate) const REFERENCE_SIZE: usize = 16;

/// Size of one encoded root entry.
pub(crate) const ROOT_SIZE: usize = 4;

/// Packs an aligned record offset into its two-byte form.
#[must_use]
pub(crate) fn pack_offset(offset: u32) -> u16 {
    (offset >> RECORD_ALIGN_BITS) as u16
}

/// Unpacks a two-byte record offset.
#[must_use]
pub(crate) fn unpack_offset(packed: u16) -> u32 {
    u32::from(packed) << RECORD_ALIGN_BITS
}

/// Returns the header size for the given table sizes.
#[must_use]
pub(crate) fn header_size(references: usize, roots: usize) -> usize {
    HEADER_SIZE + references * REFERENCE_SIZE + roots * ROOT_SIZE
}

/// An immutable segment loaded into memory.
///
/// Provides random access to the record payload by virtual offset. Data
/// segments expose their version, GC generation, reference table and root
/// table; bulk segments are plain payload.
pub struct Segment {
    id: SegmentId,
    data: Vec<u8>,
    version: u8,
    generation: u32,
    references: Vec<(u64, u64)>,
    roots: Vec<(RecordType, u32)>,
    /// Virtual offset of the first payload byte.
    payload_start: u32,
}

impl Segment {
    /// Parses a segment from its on-disk bytes.
    pub fn parse(id: SegmentId, data: Vec<u8>) -> Result<Self> {
        if data.len() > MAX_SEGMENT_SIZE {
            return Err(Error::corruption(format!(
                "segment {id} exceeds the maximum segment size"
            )));
        }

        if id.is_bulk() {
            let payload_start = (MAX_SEGMENT_SIZE - data.len()) as u32;
            return Ok(Self {
                id,
                data,
                version: SEGMENT_VERSION,
                generation: 0,
                references: Vec::new(),
                roots: Vec::new(),
                payload_start,
            });
        }

        let header = parse_header(&data)
            .map_err(|err| Error::corruption(format!("segment {id}: {err}")))?;
        let payload_len = data.len() - header.size;
        let payload_start = (MAX_SEGMENT_SIZE - payload_len) as u32;

        for &(_, offset) in &header.roots {
            if offset < payload_start || offset as usize % ALIGN != 0 {
                return Err(Error::corruption(format!(
                    "segment {id}: root offset {offset:#x} out of bounds"
                )));
            }
        }

        Ok(Self {
            id,
            data,
            version: header.version,
            generation: header.generation,
            references: header.references,
            roots: header.roots,
            payload_start,
        })
    }

    /// Returns the segment id.
    #[must_use]
    pub fn id(&self) -> &SegmentId {
        &self.id
    }

    /// Returns the storage format version of the segment.
    #[must_use]
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Returns the GC generation stored in the header. Bulk segments have
    /// no generation and report zero.
    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Returns the raw size of the segment in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Returns the ids of the segments referenced from the header, as raw
    /// halves. Decoding never follows a reference absent from this list.
    #[must_use]
    pub fn references(&self) -> &[(u64, u64)] {
        &self.references
    }

    /// Returns the root records of the segment: records reachable from
    /// outside, with their types and offsets.
    #[must_use]
    pub fn roots(&self) -> &[(RecordType, u32)] {
        &self.roots
    }

    /// Translates a virtual offset into a physical index, bounds-checked
    /// for a read of `len` bytes.
    fn position(&self, offset: u32, len: usize) -> Result<usize> {
        let offset = offset as usize;
        if offset < self.payload_start as usize || offset + len > MAX_SEGMENT_SIZE {
            return Err(Error::corruption(format!(
                "segment {}: read of {len} bytes at {offset:#x} out of bounds",
                self.id
            )));
        }
        Ok(self.data.len() - (MAX_SEGMENT_SIZE - offset))
    }

    /// Reads `len` bytes at a virtual offset.
    pub fn read_bytes(&self, offset: u32, len: usize) -> Result<&[u8]> {
        let pos = self.position(offset, len)?;
        Ok(&self.data[pos..pos + len])
    }

    /// Reads one byte at a virtual offset.
    pub fn read_u8(&self, offset: u32) -> Result<u8> {
        Ok(self.read_bytes(offset, 1)?[0])
    }

    /// Reads a big-endian `u16` at a virtual offset.
    pub fn read_u16(&self, offset: u32) -> Result<u16> {
        Ok(u16::from_be_bytes(
            self.read_bytes(offset, 2)?.try_into().expect("2 bytes"),
        ))
    }

    /// Reads a big-endian `u32` at a virtual offset.
    pub fn read_u32(&self, offset: u32) -> Result<u32> {
        Ok(u32::from_be_bytes(
            self.read_bytes(offset, 4)?.try_into().expect("4 bytes"),
        ))
    }

    /// Reads a big-endian `u64` at a virtual offset.
    pub fn read_u64(&self, offset: u32) -> Result<u64> {
        Ok(u64::from_be_bytes(
            self.read_bytes(offset, 8)?.try_into().expect("8 bytes"),
        ))
    }

    /// Reads an embedded record id at a virtual offset, returning the raw
    /// segment id halves and the unpacked record offset.
    pub fn read_record_ref(&self, offset: u32) -> Result<(u64, u64, u32)> {
        let bytes = self.read_bytes(offset, 18)?;
        let msb = u64::from_be_bytes(bytes[0..8].try_into().expect("8 bytes"));
        let lsb = u64::from_be_bytes(bytes[8..16].try_into().expect("8 bytes"));
        let packed = u16::from_be_bytes(bytes[16..18].try_into().expect("2 bytes"));
        Ok((msb, lsb, unpack_offset(packed)))
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id.to_string())
            .field("size", &self.data.len())
            .field("generation", &self.generation)
            .field("references", &self.references.len())
            .field("roots", &self.roots.len())
            .finish()
    }
}

struct ParsedHeader {
    version: u8,
    generation: u32,
    references: Vec<(u64, u64)>,
    roots: Vec<(RecordType, u32)>,
    size: usize,
}

fn parse_header(data: &[u8]) -> std::result::Result<ParsedHeader, String> {
    if data.len() < HEADER_SIZE {
        return Err("truncated header".to_string());
    }
    if data[0..3] != SEGMENT_MAGIC {
        return Err("bad magic".to_string());
    }
    let version = data[3];
    if version == 0 || version > SEGMENT_VERSION {
        return Err(format!("unsupported segment version {version}"));
    }

    let generation = u32::from_be_bytes(data[4..8].try_into().expect("4 bytes"));
    let ref_count = u32::from_be_bytes(data[8..12].try_into().expect("4 bytes")) as usize;
    let root_count = u32::from_be_bytes(data[12..16].try_into().expect("4 bytes")) as usize;

    let size = header_size(ref_count, root_count);
    if size > data.len() {
        return Err("header tables exceed segment size".to_string());
    }

    let mut references = Vec::with_capacity(ref_count);
    let mut pos = HEADER_SIZE;
    for _ in 0..ref_count {
        let msb = u64::from_be_bytes(data[pos..pos + 8].try_into().expect("8 bytes"));
        let lsb = u64::from_be_bytes(data[pos + 8..pos + 16].try_into().expect("8 bytes"));
        references.push((msb, lsb));
        pos += REFERENCE_SIZE;
    }

    let mut roots = Vec::with_capacity(root_count);
    for _ in 0..root_count {
        let ty = RecordType::try_from(data[pos])
            .map_err(|_| format!("unknown record type {}", data[pos]))?;
        let packed = u16::from_be_bytes(data[pos + 2..pos + 4].try_into().expect("2 bytes"));
        roots.push((ty, unpack_offset(packed)));
        pos += ROOT_SIZE;
    }

    Ok(ParsedHeader {
        version,
        generation,
        references,
        roots,
        size,
    })
}

/// Reads the GC generation from raw data segment bytes.
pub fn parse_generation(data: &[u8]) -> Result<u32> {
    if data.len() < HEADER_SIZE || data[0..3] != SEGMENT_MAGIC {
        return Err(Error::corruption("not a data segment"));
    }
    Ok(u32::from_be_bytes(data[4..8].try_into().expect("4 bytes")))
}

/// Reads the reference table from raw data segment bytes.
///
/// Used to rebuild archive graphs without constructing a full [`Segment`].
pub fn parse_references(data: &[u8]) -> Result<Vec<(u64, u64)>> {
    let header = parse_header(data).map_err(Error::corruption)?;
    Ok(header.references)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::SegmentTracker;

    fn encode(generation: u32, references: &[(u64, u64)], roots: &[(RecordType, u32)], payload: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&SEGMENT_MAGIC);
        data.push(SEGMENT_VERSION);
        data.extend_from_slice(&generation.to_be_bytes());
        data.extend_from_slice(&(references.len() as u32).to_be_bytes());
        data.extend_from_slice(&(roots.len() as u32).to_be_bytes());
        for &(msb, lsb) in references {
            data.extend_from_slice(&msb.to_be_bytes());
            data.extend_from_slice(&lsb.to_be_bytes());
        }
        for &(ty, offset) in roots {
            data.push(ty as u8);
            data.push(0);
            data.extend_from_slice(&pack_offset(offset).to_be_bytes());
        }
        data.extend_from_slice(payload);
        data
    }

    #[test]
    fn parse_data_segment() {
        let tracker = SegmentTracker::new();
        let id = tracker.new_data_id();

        let payload = [0u8; 32];
        let root_offset = (MAX_SEGMENT_SIZE - 32) as u32;
        let data = encode(7, &[(1, 2)], &[(RecordType::Block, root_offset)], &payload);

        let segment = Segment::parse(id, data).unwrap();
        assert_eq!(segment.generation(), 7);
        assert_eq!(segment.references(), &[(1, 2)]);
        assert_eq!(segment.roots(), &[(RecordType::Block, root_offset)]);
    }

    #[test]
    fn read_accessors() {
        let tracker = SegmentTracker::new();
        let id = tracker.new_data_id();

        let mut payload = vec![0u8; 16];
        payload[0] = 0x12;
        payload[1..3].copy_from_slice(&0x3456u16.to_be_bytes());
        payload[3..7].copy_from_slice(&0x789A_BCDEu32.to_be_bytes());
        payload[7..15].copy_from_slice(&0x0102_0304_0506_0708u64.to_be_bytes());

        let data = encode(0, &[], &[], &payload);
        let segment = Segment::parse(id, data).unwrap();

        let base = (MAX_SEGMENT_SIZE - 16) as u32;
        assert_eq!(segment.read_u8(base).unwrap(), 0x12);
        assert_eq!(segment.read_u16(base + 1).unwrap(), 0x3456);
        assert_eq!(segment.read_u32(base + 3).unwrap(), 0x789A_BCDE);
        assert_eq!(segment.read_u64(base + 7).unwrap(), 0x0102_0304_0506_0708);
    }

    #[test]
    fn out_of_bounds_read_rejected() {
        let tracker = SegmentTracker::new();
        let id = tracker.new_data_id();
        let data = encode(0, &[], &[], &[0u8; 16]);
        let segment = Segment::parse(id, data).unwrap();

        let payload_start = (MAX_SEGMENT_SIZE - 16) as u32;
        assert!(segment.read_u8(payload_start - 1).is_err());
        assert!(segment.read_bytes(payload_start, 17).is_err());
    }

    #[test]
    fn bulk_segment_is_opaque() {
        let tracker = SegmentTracker::new();
        let id = tracker.new_bulk_id();
        let segment = Segment::parse(id, vec![0xAB; 64]).unwrap();

        assert_eq!(segment.generation(), 0);
        assert!(segment.references().is_empty());
        let base = (MAX_SEGMENT_SIZE - 64) as u32;
        assert_eq!(segment.read_u8(base).unwrap(), 0xAB);
    }

    #[test]
    fn bad_magic_rejected() {
        let tracker = SegmentTracker::new();
        let id = tracker.new_data_id();
        assert!(Segment::parse(id, vec![0u8; 32]).is_err());
    }

    #[test]
    fn generation_from_raw_bytes() {
        let data = encode(42, &[], &[], &[]);
        assert_eq!(parse_generation(&data).unwrap(), 42);
    }

    #[test]
    fn references_from_raw_bytes() {
        let data = encode(1, &[(0xA, 0xB), (0xC, 0xD)], &[], &[]);
        assert_eq!(parse_references(&data).unwrap(), vec![(0xA, 0xB), (0xC, 0xD)]);
    }

    #[test]
    fn offset_packing() {
        assert_eq!(pack_offset(0), 0);
        assert_eq!(unpack_offset(pack_offset(0x3FFF0)), 0x3FFF0);
        assert_eq!(unpack_offset(1), ALIGN as u32);
    }
}
