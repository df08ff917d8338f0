//! Records: typed data addressable as `(segment id, offset)`.
//!
//! Records are the unit of structural sharing. The writer encodes nodes,
//! properties, maps, lists, strings and binary streams into segment
//! payloads; the reader walks them back. Record ids embedded inside records
//! are 18 bytes: the two id halves followed by the packed offset.

pub(crate) mod id;
pub(crate) mod map;
pub(crate) mod reader;
pub(crate) mod template;
pub(crate) mod writer;

pub use id::{RecordId, RecordType};
pub use map::MapRecord;
pub use reader::RecordReader;
pub use template::{ChildName, PropertyTemplate, Template};
pub use writer::SegmentWriter;

/// Fan-out of the complete tree backing list records.
pub const LEVEL_SIZE: usize = 255;

/// Chunk size for binary streams written into bulk segments.
pub const BLOCK_SIZE: usize = 4096;

/// Strings and values up to this many bytes are stored with a one-byte
/// length head.
pub const SMALL_LIMIT: usize = 0x80;

/// Strings and values up to this many bytes are stored inline with a
/// two-byte length head; anything longer becomes a block list.
pub const MEDIUM_LIMIT: usize = (1 << 14) + SMALL_LIMIT;

/// Number of hash bits consumed per map trie level.
pub const BITS_PER_LEVEL: u32 = 5;

/// Fan-out of one map trie level.
pub const BUCKETS_PER_LEVEL: usize = 1 << BITS_PER_LEVEL;

/// Deepest map trie level; leaves at this level hold all remaining entries
/// regardless of size.
pub const MAX_LEVELS: u32 = (32 + BITS_PER_LEVEL - 1) / BITS_PER_LEVEL;

/// Hash of a map key: the classic 31-multiplier polynomial over the key's
/// characters. Collisions are cheap to construct, which the map tests use.
#[must_use]
pub fn map_hash(key: &str) -> u32 {
    key.chars()
        .fold(0u32, |hash, c| hash.wrapping_mul(31).wrapping_add(c as u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_hash_collisions_are_constructible() {
        // The classic collision pair for the 31-multiplier hash.
        assert_eq!(map_hash("Aa"), map_hash("BB"));
        assert_ne!(map_hash("Aa"), map_hash("Ab"));
    }

    #[test]
    fn size_class_limits() {
        assert_eq!(SMALL_LIMIT, 128);
        assert_eq!(MEDIUM_LIMIT, 16512);
    }
}
