//! The segment graph and binary references footers.
//!
//! The `.gph` footer records, for every data segment in the archive, the
//! list of segment ids it references (both in-file and external). The `.brf`
//! footer records the external binary references discovered while the
//! archive was written, grouped by GC generation. Both payloads carry the
//! same front-padded layout and `crc32 | count | size | magic` trailer as
//! the index, so they can be located by walking backwards from the index
//! entry.

use crate::checksum::crc32;
use crate::entry::{padded, EntryId};
use crate::error::{StorageError, StorageResult};
use crate::index::{read_trailer, TRAILER_SIZE};
use std::collections::{BTreeMap, BTreeSet};

/// Magic number terminating the graph payload.
pub(crate) const GRAPH_MAGIC: u32 = u32::from_be_bytes(*b"aDBG");

/// Magic number terminating the binary references payload.
pub(crate) const BINARY_REFERENCES_MAGIC: u32 = u32::from_be_bytes(*b"aDBB");

/// The inter-segment reference graph of one archive: maps each data segment
/// to the segment ids it references.
pub type SegmentGraph = BTreeMap<EntryId, Vec<EntryId>>;

/// External binary references discovered while writing an archive, grouped
/// by the GC generation of the segment that introduced them.
pub type BinaryReferences = BTreeMap<u32, BTreeSet<String>>;

/// Encodes the graph payload, front-padded to a block multiple.
pub(crate) fn encode_graph(graph: &SegmentGraph) -> Vec<u8> {
    let mut content = Vec::new();
    content.extend_from_slice(&(graph.len() as u32).to_be_bytes());
    for (id, refs) in graph {
        content.extend_from_slice(&id.msb.to_be_bytes());
        content.extend_from_slice(&id.lsb.to_be_bytes());
        content.extend_from_slice(&(refs.len() as u32).to_be_bytes());
        for referenced in refs {
            content.extend_from_slice(&referenced.msb.to_be_bytes());
            content.extend_from_slice(&referenced.lsb.to_be_bytes());
        }
    }
    seal_payload(content, graph.len() as u32, GRAPH_MAGIC)
}

/// Decodes a graph payload produced by [`encode_graph`].
pub(crate) fn decode_graph(payload: &[u8]) -> StorageResult<SegmentGraph> {
    let content = checked_content(payload, GRAPH_MAGIC)?;
    let mut cursor = Cursor::new(content);

    let count = cursor.read_u32()?;
    let mut graph = SegmentGraph::new();
    for _ in 0..count {
        let id = EntryId::new(cursor.read_u64()?, cursor.read_u64()?);
        let refs = cursor.read_u32()?;
        let mut referenced = Vec::with_capacity(refs as usize);
        for _ in 0..refs {
            referenced.push(EntryId::new(cursor.read_u64()?, cursor.read_u64()?));
        }
        graph.insert(id, referenced);
    }
    Ok(graph)
}

/// Encodes the binary references payload, front-padded to a block multiple.
pub(crate) fn encode_binary_references(refs: &BinaryReferences) -> Vec<u8> {
    let mut content = Vec::new();
    content.extend_from_slice(&(refs.len() as u32).to_be_bytes());
    for (generation, ids) in refs {
        content.extend_from_slice(&generation.to_be_bytes());
        content.extend_from_slice(&(ids.len() as u32).to_be_bytes());
        for id in ids {
            content.extend_from_slice(&(id.len() as u16).to_be_bytes());
            content.extend_from_slice(id.as_bytes());
        }
    }
    seal_payload(content, refs.len() as u32, BINARY_REFERENCES_MAGIC)
}

/// Decodes a binary references payload.
pub(crate) fn decode_binary_references(payload: &[u8]) -> StorageResult<BinaryReferences> {
    let content = checked_content(payload, BINARY_REFERENCES_MAGIC)?;
    let mut cursor = Cursor::new(content);

    let generations = cursor.read_u32()?;
    let mut refs = BinaryReferences::new();
    for _ in 0..generations {
        let generation = cursor.read_u32()?;
        let count = cursor.read_u32()?;
        let mut ids = BTreeSet::new();
        for _ in 0..count {
            let len = cursor.read_u16()? as usize;
            let bytes = cursor.read_bytes(len)?;
            let id = std::str::from_utf8(bytes)
                .map_err(|_| StorageError::corruption("binary reference is not UTF-8"))?;
            ids.insert(id.to_string());
        }
        refs.insert(generation, ids);
    }
    Ok(refs)
}

/// Front-pads content and appends the footer trailer.
fn seal_payload(content: Vec<u8>, count: u32, magic: u32) -> Vec<u8> {
    let checksum = crc32(&content);
    let total = padded(content.len() + TRAILER_SIZE);

    let mut payload = vec![0u8; total];
    let start = total - TRAILER_SIZE - content.len();
    payload[start..total - TRAILER_SIZE].copy_from_slice(&content);

    let trailer = &mut payload[total - TRAILER_SIZE..];
    trailer[0..4].copy_from_slice(&checksum.to_be_bytes());
    trailer[4..8].copy_from_slice(&count.to_be_bytes());
    trailer[8..12].copy_from_slice(&(content.len() as u32).to_be_bytes());
    trailer[12..16].copy_from_slice(&magic.to_be_bytes());
    payload
}

/// Validates the trailer and checksum, returning the content slice.
fn checked_content(payload: &[u8], magic: u32) -> StorageResult<&[u8]> {
    let (checksum, _, size) = read_trailer(payload, magic)?;
    if size + TRAILER_SIZE > payload.len() {
        return Err(StorageError::corruption("footer size mismatch"));
    }
    let content = &payload[payload.len() - TRAILER_SIZE - size..payload.len() - TRAILER_SIZE];
    if crc32(content) != checksum {
        return Err(StorageError::corruption("footer checksum mismatch"));
    }
    Ok(content)
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_bytes(&mut self, len: usize) -> StorageResult<&'a [u8]> {
        if self.pos + len > self.data.len() {
            return Err(StorageError::corruption("footer payload too short"));
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_u16(&mut self) -> StorageResult<u16> {
        Ok(u16::from_be_bytes(
            self.read_bytes(2)?.try_into().expect("2 bytes"),
        ))
    }

    fn read_u32(&mut self) -> StorageResult<u32> {
        Ok(u32::from_be_bytes(
            self.read_bytes(4)?.try_into().expect("4 bytes"),
        ))
    }

    fn read_u64(&mut self) -> StorageResult<u64> {
        Ok(u64::from_be_bytes(
            self.read_bytes(8)?.try_into().expect("8 bytes"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_round_trip() {
        let mut graph = SegmentGraph::new();
        graph.insert(
            EntryId::new(1, 0xA000_0000_0000_0001),
            vec![EntryId::new(2, 2), EntryId::new(3, 3)],
        );
        graph.insert(EntryId::new(4, 0xA000_0000_0000_0004), vec![]);

        let payload = encode_graph(&graph);
        let decoded = decode_graph(&payload).unwrap();
        assert_eq!(decoded, graph);
    }

    #[test]
    fn empty_graph_round_trip() {
        let payload = encode_graph(&SegmentGraph::new());
        assert!(decode_graph(&payload).unwrap().is_empty());
    }

    #[test]
    fn binary_references_round_trip() {
        let mut refs = BinaryReferences::new();
        refs.entry(1).or_default().insert("blob-a".to_string());
        refs.entry(1).or_default().insert("blob-b".to_string());
        refs.entry(3).or_default().insert("blob-c".to_string());

        let payload = encode_binary_references(&refs);
        let decoded = decode_binary_references(&payload).unwrap();
        assert_eq!(decoded, refs);
    }

    #[test]
    fn graph_corruption_detected() {
        let mut graph = SegmentGraph::new();
        graph.insert(EntryId::new(1, 1), vec![EntryId::new(2, 2)]);
        let mut payload = encode_graph(&graph);
        let len = payload.len();
        payload[len - TRAILER_SIZE - 3] ^= 0x55;
        assert!(decode_graph(&payload).is_err());
    }
}
