//! The index footer of a sealed archive.
//!
//! The index lists every segment entry in the file with its payload offset,
//! length and GC generation. Its payload is padded at the *front* so that
//! the 16-byte trailer (`crc32 | count | size | magic`) ends exactly on the
//! last block before the end-of-archive marker, which lets a reader locate
//! the index by reading backwards from the end of the file.

use crate::checksum::crc32;
use crate::entry::{padded, EntryId};
use crate::error::{StorageError, StorageResult};

/// Magic number terminating the index payload.
pub(crate) const INDEX_MAGIC: u32 = u32::from_be_bytes(*b"aDBI");

/// Size of one encoded index entry.
pub(crate) const INDEX_ENTRY_SIZE: usize = 28;

/// Size of the index trailer.
pub(crate) const TRAILER_SIZE: usize = 16;

/// One entry of the archive index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Segment id of the entry.
    pub id: EntryId,
    /// File offset of the entry payload (past the header block).
    pub offset: u32,
    /// Payload length in bytes.
    pub size: u32,
    /// GC generation recorded for the segment.
    pub generation: u32,
}

/// Encodes the index payload, front-padded to a block multiple.
///
/// Entries are sorted by id so that lookups can binary-search.
pub(crate) fn encode_index(entries: &mut Vec<IndexEntry>) -> Vec<u8> {
    entries.sort_by_key(|e| e.id);

    let mut content = Vec::with_capacity(entries.len() * INDEX_ENTRY_SIZE + TRAILER_SIZE);
    for entry in entries.iter() {
        content.extend_from_slice(&entry.id.msb.to_be_bytes());
        content.extend_from_slice(&entry.id.lsb.to_be_bytes());
        content.extend_from_slice(&entry.offset.to_be_bytes());
        content.extend_from_slice(&entry.size.to_be_bytes());
        content.extend_from_slice(&entry.generation.to_be_bytes());
    }

    let checksum = crc32(&content);
    let total = padded(content.len() + TRAILER_SIZE);

    let mut payload = vec![0u8; total];
    let start = total - TRAILER_SIZE - content.len();
    payload[start..total - TRAILER_SIZE].copy_from_slice(&content);

    let trailer = &mut payload[total - TRAILER_SIZE..];
    trailer[0..4].copy_from_slice(&checksum.to_be_bytes());
    trailer[4..8].copy_from_slice(&(entries.len() as u32).to_be_bytes());
    trailer[8..12].copy_from_slice(&(content.len() as u32).to_be_bytes());
    trailer[12..16].copy_from_slice(&INDEX_MAGIC.to_be_bytes());
    payload
}

/// Reads a `crc32 | count | size | magic` trailer from the end of a footer
/// payload. Returns `(checksum, count, content_size)`; the content size
/// excludes both the trailer and the front padding.
pub(crate) fn read_trailer(payload: &[u8], magic: u32) -> StorageResult<(u32, usize, usize)> {
    if payload.len() < TRAILER_SIZE {
        return Err(StorageError::corruption("footer payload too short"));
    }
    let trailer = &payload[payload.len() - TRAILER_SIZE..];
    let stored_magic = u32::from_be_bytes(trailer[12..16].try_into().expect("4 bytes"));
    if stored_magic != magic {
        return Err(StorageError::corruption("bad footer magic"));
    }
    let checksum = u32::from_be_bytes(trailer[0..4].try_into().expect("4 bytes"));
    let count = u32::from_be_bytes(trailer[4..8].try_into().expect("4 bytes")) as usize;
    let size = u32::from_be_bytes(trailer[8..12].try_into().expect("4 bytes")) as usize;
    Ok((checksum, count, size))
}

/// Decodes an index payload produced by [`encode_index`].
pub(crate) fn decode_index(payload: &[u8]) -> StorageResult<Vec<IndexEntry>> {
    let (checksum, count, size) = read_trailer(payload, INDEX_MAGIC)?;
    if size != count * INDEX_ENTRY_SIZE || size + TRAILER_SIZE > payload.len() {
        return Err(StorageError::corruption("index size mismatch"));
    }

    let content = &payload[payload.len() - TRAILER_SIZE - size..payload.len() - TRAILER_SIZE];
    if crc32(content) != checksum {
        return Err(StorageError::corruption("index checksum mismatch"));
    }

    let mut entries = Vec::with_capacity(count);
    for chunk in content.chunks_exact(INDEX_ENTRY_SIZE) {
        entries.push(IndexEntry {
            id: EntryId::new(
                u64::from_be_bytes(chunk[0..8].try_into().expect("8 bytes")),
                u64::from_be_bytes(chunk[8..16].try_into().expect("8 bytes")),
            ),
            offset: u32::from_be_bytes(chunk[16..20].try_into().expect("4 bytes")),
            size: u32::from_be_bytes(chunk[20..24].try_into().expect("4 bytes")),
            generation: u32::from_be_bytes(chunk[24..28].try_into().expect("4 bytes")),
        });
    }
    Ok(entries)
}
