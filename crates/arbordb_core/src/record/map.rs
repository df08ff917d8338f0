//! Map records: a hash trie over 32-bit key hashes.
//!
//! A map node is one of three shapes, discriminated by its head word:
//!
//! ```text
//! head u32: | diff (1) | level (3) | size (28) |
//!
//! leaf:   | head | hashes: size * u32 | entries: size * (key id, value id) |
//! branch: | head | bitmap u32 | child ids: popcount(bitmap) * 18 |
//! diff:   | head | hash u32 | key id | value id | base map id |
//! ```
//!
//! A node is a branch iff its size exceeds [`BUCKETS_PER_LEVEL`] and its
//! level is below [`MAX_LEVELS`]; leaves at the deepest level hold any
//! number of colliding entries. Leaf entries are sorted by hash.
//! A diff node records a single-key update against a base map, giving
//! structural sharing for the common update-one-entry case; lookups
//! resolve diffs iteratively.

use crate::error::{Error, Result};
use crate::record::reader::RecordReader;
use crate::record::{map_hash, RecordId, BITS_PER_LEVEL, BUCKETS_PER_LEVEL, MAX_LEVELS};
use crate::store::SegmentStore;

pub(crate) const HEAD_DIFF: u32 = 1 << 31;
pub(crate) const LEVEL_SHIFT: u32 = 28;
pub(crate) const LEVEL_MASK: u32 = 0x7;
pub(crate) const SIZE_MASK: u32 = (1 << LEVEL_SHIFT) - 1;

/// Encodes a map head word.
#[must_use]
pub(crate) fn encode_head(size: u32, level: u32, diff: bool) -> u32 {
    let mut head = (size & SIZE_MASK) | ((level & LEVEL_MASK) << LEVEL_SHIFT);
    if diff {
        head |= HEAD_DIFF;
    }
    head
}

/// Checks whether a map node of the given size at the given level is
/// stored as a branch.
#[must_use]
pub(crate) fn is_branch(size: u32, level: u32) -> bool {
    size as usize > BUCKETS_PER_LEVEL && level < MAX_LEVELS
}

/// Returns the child slice of a hash at a trie level.
#[must_use]
pub(crate) fn slice(hash: u32, level: u32) -> u32 {
    (hash >> (level * BITS_PER_LEVEL)) & (BUCKETS_PER_LEVEL as u32 - 1)
}

/// The decoded shape of one map node.
#[derive(Debug)]
pub(crate) enum MapParse {
    Leaf {
        level: u32,
        entries: Vec<(u32, RecordId, RecordId)>,
    },
    Branch {
        level: u32,
        size: u32,
        bitmap: u32,
        children: Vec<RecordId>,
    },
    Diff {
        size: u32,
        hash: u32,
        key: RecordId,
        value: RecordId,
        base: RecordId,
    },
}

/// Decodes the map node at `id`.
pub(crate) fn parse(reader: &RecordReader, store: &dyn SegmentStore, id: &RecordId) -> Result<MapParse> {
    let segment = store.read_segment(id.segment_id())?;
    let offset = id.offset();
    let head = segment.read_u32(offset)?;
    let size = head & SIZE_MASK;
    let level = (head >> LEVEL_SHIFT) & LEVEL_MASK;

    if head & HEAD_DIFF != 0 {
        let hash = segment.read_u32(offset + 4)?;
        let key = reader.record_ref(store, &segment, offset + 8)?;
        let value = reader.record_ref(store, &segment, offset + 26)?;
        let base = reader.record_ref(store, &segment, offset + 44)?;
        return Ok(MapParse::Diff {
            size,
            hash,
            key,
            value,
            base,
        });
    }

    if is_branch(size, level) {
        let bitmap = segment.read_u32(offset + 4)?;
        let count = bitmap.count_ones() as usize;
        let mut children = Vec::with_capacity(count);
        for index in 0..count {
            children.push(reader.record_ref(store, &segment, offset + 8 + (index as u32) * 18)?);
        }
        return Ok(MapParse::Branch {
            level,
            size,
            bitmap,
            children,
        });
    }

    let mut entries = Vec::with_capacity(size as usize);
    let hashes_end = offset + 4 + size * 4;
    for index in 0..size {
        let hash = segment.read_u32(offset + 4 + index * 4)?;
        let key = reader.record_ref(store, &segment, hashes_end + index * 36)?;
        let value = reader.record_ref(store, &segment, hashes_end + index * 36 + 18)?;
        entries.push((hash, key, value));
    }
    Ok(MapParse::Leaf { level, entries })
}

/// A read handle on a map record.
#[derive(Debug, Clone)]
pub struct MapRecord {
    id: RecordId,
    size: u32,
}

impl MapRecord {
    pub(crate) fn new(id: RecordId, size: u32) -> Self {
        Self { id, size }
    }

    /// Returns the record id of the map.
    #[must_use]
    pub fn record_id(&self) -> &RecordId {
        &self.id
    }

    /// Returns the number of entries in the map.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Looks up the value record for a key.
    pub fn get(&self, store: &dyn SegmentStore, key: &str) -> Result<Option<RecordId>> {
        let reader = store.record_reader();
        let hash = map_hash(key);
        let mut node = self.id.clone();

        loop {
            match parse(reader, store, &node)? {
                MapParse::Diff {
                    hash: diff_hash,
                    key: key_id,
                    value,
                    base,
                    ..
                } => {
                    if diff_hash == hash && reader.read_string(store, &key_id)? == key {
                        return Ok(Some(value));
                    }
                    node = base;
                }
                MapParse::Branch {
                    level,
                    bitmap,
                    children,
                    ..
                } => {
                    let bit = 1u32 << slice(hash, level);
                    if bitmap & bit == 0 {
                        return Ok(None);
                    }
                    let rank = (bitmap & (bit - 1)).count_ones() as usize;
                    node = children[rank].clone();
                }
                MapParse::Leaf { entries, .. } => {
                    for (entry_hash, key_id, value) in entries {
                        if entry_hash == hash && reader.read_string(store, &key_id)? == key {
                            return Ok(Some(value));
                        }
                    }
                    return Ok(None);
                }
            }
        }
    }

    /// Returns all entries as `(key, value record id)`, in trie order.
    pub fn entries(&self, store: &dyn SegmentStore) -> Result<Vec<(String, RecordId)>> {
        let reader = store.record_reader();
        let mut overrides: Vec<(u32, String, RecordId)> = Vec::new();
        let mut node = self.id.clone();

        // Unwind diff chains, keeping the outermost override per key.
        let base = loop {
            match parse(reader, store, &node)? {
                MapParse::Diff {
                    hash, key, value, base, ..
                } => {
                    let key = reader.read_string(store, &key)?;
                    if !overrides.iter().any(|(_, k, _)| *k == key) {
                        overrides.push((hash, key, value));
                    }
                    node = base;
                }
                _ => break node,
            }
        };

        let mut entries = Vec::with_capacity(self.size as usize);
        collect(reader, store, &base, &mut entries)?;

        for entry in &mut entries {
            if let Some((_, _, value)) = overrides
                .iter()
                .find(|(_, key, _)| *key == entry.0)
            {
                entry.1 = value.clone();
            }
        }
        Ok(entries)
    }
}

fn collect(
    reader: &RecordReader,
    store: &dyn SegmentStore,
    node: &RecordId,
    into: &mut Vec<(String, RecordId)>,
) -> Result<()> {
    match parse(reader, store, node)? {
        MapParse::Leaf { entries, .. } => {
            for (_, key, value) in entries {
                into.push((reader.read_string(store, &key)?, value));
            }
            Ok(())
        }
        MapParse::Branch { children, .. } => {
            for child in children {
                collect(reader, store, &child, into)?;
            }
            Ok(())
        }
        MapParse::Diff { .. } => Err(Error::corruption(
            "diff map node nested under a branch or another diff base chain",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_round_trip() {
        let head = encode_head(12, 3, false);
        assert_eq!(head & SIZE_MASK, 12);
        assert_eq!((head >> LEVEL_SHIFT) & LEVEL_MASK, 3);
        assert_eq!(head & HEAD_DIFF, 0);

        let diff = encode_head(1, 0, true);
        assert_ne!(diff & HEAD_DIFF, 0);
    }

    #[test]
    fn branch_rule() {
        assert!(!is_branch(BUCKETS_PER_LEVEL as u32, 0));
        assert!(is_branch(BUCKETS_PER_LEVEL as u32 + 1, 0));
        // The deepest level never branches.
        assert!(!is_branch(1000, MAX_LEVELS));
    }

    #[test]
    fn slices_cover_the_hash() {
        let hash = 0xFFFF_FFFF;
        for level in 0..6 {
            assert_eq!(slice(hash, level), BUCKETS_PER_LEVEL as u32 - 1);
        }
        // The deepest branching level sees only the two top hash bits.
        assert_eq!(slice(hash, 6), 0b11);
        assert_eq!(slice(0b0110_0001, 0), 0b00001);
        assert_eq!(slice(0b0110_0001, 1), 0b00011);
    }
}
