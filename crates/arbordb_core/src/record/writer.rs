//! The record writer: encodes records into buffered segments.
//!
//! One long-lived [`SegmentWriter`] per store holds the deduplication
//! caches (strings, templates, rewritten records) keyed by GC generation.
//! Each write operation borrows a buffered segment writer from the pool,
//! encodes its records, seals the buffer into the store and returns the
//! writer, so every record id handed out is immediately resolvable.

use crate::cache::Lru;
use crate::error::{Error, Result};
use crate::node::{Blob, ChildChange, ChildSlot, NodeBuilder, NodeState, Scalar, Type, Value};
use crate::record::map::{self, encode_head, is_branch, slice, MapParse};
use crate::record::template::{
    encode_type, ChildName, Template, MIXIN_COUNT_MAX, MIXIN_TYPES_NAME, PRIMARY_TYPE_NAME,
    PROPERTY_COUNT_MAX,
};
use crate::record::{
    map_hash, RecordId, RecordType, BLOCK_SIZE, BUCKETS_PER_LEVEL, LEVEL_SIZE, MEDIUM_LIMIT,
    SMALL_LIMIT,
};
use crate::segment::{SegmentBufferWriter, WriterPool, ALIGN, MAX_SEGMENT_SIZE};
use crate::store::SegmentStore;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::Read;

/// Budget of the written-string deduplication cache in bytes.
const STRING_CACHE_BYTES: usize = 16 * 1024 * 1024;

/// Capacity of the template deduplication cache in entries.
const TEMPLATE_CACHE_ENTRIES: usize = 4096;

/// Capacity of the rewritten-record cache in entries.
const RECORD_CACHE_ENTRIES: usize = 1 << 17;

struct WriterCaches {
    /// `(generation, string) -> record id` of an equal string already
    /// written into that generation.
    strings: Lru<(u32, String), RecordId>,
    /// `(generation, template) -> record id`.
    templates: Lru<(u32, Template), RecordId>,
    /// `(generation, old record id) -> rewritten record id`; preserves
    /// structural sharing across compaction rewrites.
    records: Lru<(u32, RecordId), RecordId>,
}

/// Encodes records into segments, deduplicating shared structure.
pub struct SegmentWriter {
    caches: Mutex<WriterCaches>,
}

impl SegmentWriter {
    /// Creates a writer with empty caches.
    #[must_use]
    pub fn new() -> Self {
        Self {
            caches: Mutex::new(WriterCaches {
                strings: Lru::new(STRING_CACHE_BYTES, |key: &(u32, String), _| key.1.len()),
                templates: Lru::with_capacity(TEMPLATE_CACHE_ENTRIES),
                records: Lru::with_capacity(RECORD_CACHE_ENTRIES),
            }),
        }
    }

    /// Drops cache entries whose generation matches the predicate.
    ///
    /// Called after compaction to release records of collected
    /// generations.
    pub fn evict_caches(&self, mut evict: impl FnMut(u32) -> bool) {
        let mut caches = self.caches.lock();
        caches.strings.retain(|(generation, _), _| !evict(*generation));
        caches.templates.retain(|(generation, _), _| !evict(*generation));
        caches.records.retain(|(generation, _), _| !evict(*generation));
    }

    /// Writes a builder's change set, returning the id of the new node
    /// record. Unchanged subtrees keep their existing records.
    pub fn write_builder(
        &self,
        store: &dyn SegmentStore,
        pool: &WriterPool,
        purpose: &str,
        generation: u32,
        builder: &NodeBuilder,
    ) -> Result<RecordId> {
        self.with_writer(store, pool, purpose, generation, None, |ctx| {
            ctx.write_builder_node(builder)
        })
    }

    /// Deep-copies a node tree into the target generation.
    ///
    /// Records already carrying the target generation are reused; the
    /// rewritten-record cache makes repeated rewrites of shared subtrees
    /// yield the same new ids. Returns `None` when cancelled; the records
    /// written so far stay unreachable and are reclaimed by the next
    /// cleanup.
    pub fn write_node(
        &self,
        store: &dyn SegmentStore,
        pool: &WriterPool,
        purpose: &str,
        generation: u32,
        node: &RecordId,
        cancel: &(dyn Fn() -> bool + Sync),
    ) -> Result<Option<RecordId>> {
        self.with_writer(store, pool, purpose, generation, Some(cancel), |ctx| {
            match ctx.write_node_deep(node) {
                Err(Error::Cancelled { .. }) => Ok(None),
                other => other.map(Some),
            }
        })
    }

    /// Writes a binary stream, chunking it into bulk segments.
    pub fn write_stream(
        &self,
        store: &dyn SegmentStore,
        pool: &WriterPool,
        purpose: &str,
        generation: u32,
        stream: &mut dyn Read,
    ) -> Result<Blob> {
        self.with_writer(store, pool, purpose, generation, None, |ctx| {
            ctx.write_stream(stream)
        })
    }

    fn with_writer<'a, T>(
        &'a self,
        store: &'a dyn SegmentStore,
        pool: &WriterPool,
        purpose: &str,
        generation: u32,
        cancel: Option<&'a (dyn Fn() -> bool + Sync)>,
        op: impl FnOnce(&mut WriteContext<'a>) -> Result<T>,
    ) -> Result<T> {
        let writer = pool.borrow(store, purpose, generation);
        let mut ctx = WriteContext {
            store,
            writer,
            caches: &self.caches,
            generation,
            cancel,
        };

        match op(&mut ctx) {
            Ok(value) => {
                ctx.writer.flush(store)?;
                pool.give_back(ctx.writer);
                Ok(value)
            }
            Err(err) => {
                pool.give_back(ctx.writer);
                Err(err)
            }
        }
    }
}

impl Default for SegmentWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SegmentWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentWriter").finish_non_exhaustive()
    }
}

/// One property slot while assembling a node.
enum PropertySlot {
    /// Reuse an existing value record.
    Existing {
        ty: Type,
        multiple: bool,
        id: RecordId,
    },
    /// A new value to encode.
    New(Value),
}

struct WriteContext<'a> {
    store: &'a dyn SegmentStore,
    writer: SegmentBufferWriter,
    caches: &'a Mutex<WriterCaches>,
    generation: u32,
    cancel: Option<&'a (dyn Fn() -> bool + Sync)>,
}

impl WriteContext<'_> {
    fn check_cancel(&self) -> Result<()> {
        if self.cancel.is_some_and(|cancel| cancel()) {
            return Err(Error::cancelled("compaction cancelled"));
        }
        Ok(())
    }

    fn write_raw(
        &mut self,
        ty: RecordType,
        bytes: &[u8],
        referenced: &[RecordId],
    ) -> Result<RecordId> {
        self.writer.write_record(self.store, ty, bytes, referenced)
    }

    // ---------------------------------------------------- values, strings

    /// Writes an inline or block-list value record of the given type.
    fn write_value_record(&mut self, ty: RecordType, data: &[u8]) -> Result<RecordId> {
        if data.len() < SMALL_LIMIT {
            let mut bytes = Vec::with_capacity(1 + data.len());
            bytes.push(data.len() as u8);
            bytes.extend_from_slice(data);
            return self.write_raw(ty, &bytes, &[]);
        }

        if data.len() < MEDIUM_LIMIT {
            let head = 0x8000 | ((data.len() - SMALL_LIMIT) as u16);
            let mut bytes = Vec::with_capacity(2 + data.len());
            bytes.extend_from_slice(&head.to_be_bytes());
            bytes.extend_from_slice(data);
            return self.write_raw(ty, &bytes, &[]);
        }

        let blocks = self.write_blocks(data)?;
        let list = self
            .write_list(&blocks)?
            .ok_or_else(|| Error::corruption("empty block list for a long value"))?;
        self.write_long_value_head(ty, data.len() as u64, list)
    }

    fn write_long_value_head(
        &mut self,
        ty: RecordType,
        length: u64,
        list: RecordId,
    ) -> Result<RecordId> {
        let head = (0x3u64 << 62) | (length - MEDIUM_LIMIT as u64);
        let mut bytes = Vec::with_capacity(8 + 18);
        bytes.extend_from_slice(&head.to_be_bytes());
        bytes.extend_from_slice(&list.to_bytes());
        self.write_raw(ty, &bytes, &[list])
    }

    /// Writes `data` as block records in fresh bulk segments.
    fn write_blocks(&mut self, data: &[u8]) -> Result<Vec<RecordId>> {
        let mut blocks = Vec::with_capacity(data.len().div_ceil(BLOCK_SIZE));
        for chunk in data.chunks(MAX_SEGMENT_SIZE) {
            blocks.extend(self.write_bulk_segment(chunk)?);
        }
        Ok(blocks)
    }

    /// Writes one bulk segment holding `data` and returns the block
    /// records inside it.
    fn write_bulk_segment(&mut self, data: &[u8]) -> Result<Vec<RecordId>> {
        let padded = data.len().div_ceil(ALIGN) * ALIGN;
        let mut payload = data.to_vec();
        payload.resize(padded, 0);

        let id = self.store.tracker().new_bulk_id();
        self.store.write_segment(&id, &payload, &[])?;

        let base = (MAX_SEGMENT_SIZE - padded) as u32;
        let mut blocks = Vec::with_capacity(data.len().div_ceil(BLOCK_SIZE));
        for index in 0..data.len().div_ceil(BLOCK_SIZE) {
            blocks.push(RecordId::new(
                id.clone(),
                base + (index * BLOCK_SIZE) as u32,
            ));
        }
        Ok(blocks)
    }

    /// Writes a string record, deduplicating equal strings per generation.
    fn write_string(&mut self, value: &str) -> Result<RecordId> {
        let key = (self.generation, value.to_string());
        if let Some(id) = self.caches.lock().strings.get(&key) {
            return Ok(id);
        }

        let id = self.write_value_record(RecordType::String, value.as_bytes())?;
        self.caches.lock().strings.insert(key, id.clone());
        Ok(id)
    }

    /// Writes an external blob reference record and registers it for the
    /// archive's binary references footer.
    fn write_external(&mut self, reference: &str) -> Result<RecordId> {
        self.writer.add_binary_reference(reference);

        let bytes = reference.as_bytes();
        if bytes.len() <= 0x0FFF {
            let head = 0xE000 | (bytes.len() as u16);
            let mut record = Vec::with_capacity(2 + bytes.len());
            record.extend_from_slice(&head.to_be_bytes());
            record.extend_from_slice(bytes);
            return self.write_raw(RecordType::Value, &record, &[]);
        }

        let string = self.write_string(reference)?;
        let mut record = Vec::with_capacity(1 + 18);
        record.push(0xF0);
        record.extend_from_slice(&string.to_bytes());
        self.write_raw(RecordType::Value, &record, &[string])
    }

    /// Reads a stream and writes it as a value record: inline when it fits
    /// the medium size class, a block list in bulk segments otherwise.
    fn write_stream(&mut self, stream: &mut dyn Read) -> Result<Blob> {
        let mut head = Vec::with_capacity(MEDIUM_LIMIT);
        let mut limited = (&mut *stream).take(MEDIUM_LIMIT as u64);
        let mut length = std::io::copy(&mut limited, &mut head)?;

        if (length as usize) < MEDIUM_LIMIT {
            let id = self.write_value_record(RecordType::Value, &head)?;
            return Ok(Blob::Record { id, length });
        }

        let mut blocks = self.write_blocks(&head)?;
        let mut buffer = vec![0u8; MAX_SEGMENT_SIZE];
        loop {
            let read = read_full(stream, &mut buffer)?;
            if read == 0 {
                break;
            }
            blocks.extend(self.write_bulk_segment(&buffer[..read])?);
            length += read as u64;
        }

        let list = self
            .write_list(&blocks)?
            .ok_or_else(|| Error::corruption("empty block list for a stream"))?;
        let id = self.write_long_value_head(RecordType::Value, length, list)?;
        Ok(Blob::Record { id, length })
    }

    // ------------------------------------------------------------- lists

    /// Writes a list as a complete tree of buckets. Empty lists have no
    /// record.
    fn write_list(&mut self, ids: &[RecordId]) -> Result<Option<RecordId>> {
        if ids.is_empty() {
            return Ok(None);
        }

        let mut level: Vec<RecordId> = ids.to_vec();
        while level.len() > LEVEL_SIZE {
            let mut next = Vec::with_capacity(level.len().div_ceil(LEVEL_SIZE));
            for bucket in level.chunks(LEVEL_SIZE) {
                let mut bytes = Vec::with_capacity(bucket.len() * 18);
                for id in bucket {
                    bytes.extend_from_slice(&id.to_bytes());
                }
                next.push(self.write_raw(RecordType::Block, &bytes, bucket)?);
            }
            level = next;
        }

        let mut bytes = Vec::with_capacity(4 + level.len() * 18);
        bytes.extend_from_slice(&(ids.len() as u32).to_be_bytes());
        for id in &level {
            bytes.extend_from_slice(&id.to_bytes());
        }
        Ok(Some(self.write_raw(RecordType::List, &bytes, &level)?))
    }

    // -------------------------------------------------------------- maps

    /// Writes a map: the base map (if any) updated with `changes`, where a
    /// `None` value removes the key.
    ///
    /// A single-key update of a sufficiently large map becomes a diff
    /// record sharing the base structurally. Removing an absent key leaves
    /// the base record id unchanged.
    fn write_map(
        &mut self,
        base: Option<&RecordId>,
        changes: BTreeMap<String, Option<RecordId>>,
    ) -> Result<RecordId> {
        if let Some(base_id) = base {
            if changes.is_empty() {
                return Ok(base_id.clone());
            }
            if let Some(id) = self.try_write_diff(base_id, &changes)? {
                return Ok(id);
            }
        }

        // Unwind any diff chain on the base, folding overrides into the
        // change set (outermost wins, and explicit changes win over all).
        let mut changes: BTreeMap<String, Option<RecordId>> = changes;
        let reader = self.store.record_reader();
        let mut base = base.cloned();
        while let Some(base_id) = &base {
            match map::parse(reader, self.store, base_id)? {
                MapParse::Diff {
                    key, value, base: below, ..
                } => {
                    let key = reader.read_string(self.store, &key)?;
                    changes.entry(key).or_insert(Some(value));
                    base = Some(below);
                }
                _ => break,
            }
        }

        let mut updates = Vec::with_capacity(changes.len());
        for (key, value) in changes {
            updates.push(MapUpdate {
                hash: map_hash(&key),
                key,
                value,
            });
        }

        match self.map_update(base.as_ref(), 0, updates)? {
            Some((id, _)) => Ok(id),
            None => self.write_map_leaf(0, &[]).map(|(id, _)| id),
        }
    }

    /// Writes a diff record when the change set is a single replacement of
    /// an existing key in a large map.
    fn try_write_diff(
        &mut self,
        base: &RecordId,
        changes: &BTreeMap<String, Option<RecordId>>,
    ) -> Result<Option<RecordId>> {
        let Some((key, Some(value))) = changes.iter().next() else {
            return Ok(None);
        };
        if changes.len() != 1 {
            return Ok(None);
        }

        let reader = self.store.record_reader();
        let map = reader.map(self.store, base)?;
        if map.size() as usize <= BUCKETS_PER_LEVEL {
            return Ok(None);
        }
        match map.get(self.store, key)? {
            Some(old) if &old != value => {}
            _ => return Ok(None),
        }

        let key_id = self.write_string(key)?;
        let mut bytes = Vec::with_capacity(8 + 3 * 18);
        bytes.extend_from_slice(&encode_head(map.size(), 0, true).to_be_bytes());
        bytes.extend_from_slice(&map_hash(key).to_be_bytes());
        bytes.extend_from_slice(&key_id.to_bytes());
        bytes.extend_from_slice(&value.to_bytes());
        bytes.extend_from_slice(&base.to_bytes());
        let referenced = [key_id, value.clone(), base.clone()];
        Ok(Some(self.write_raw(RecordType::Map, &bytes, &referenced)?))
    }

    /// Applies updates to one trie node. Returns the new `(record id,
    /// size)`, `None` for an empty result, reusing the node's record when
    /// nothing effectively changed.
    fn map_update(
        &mut self,
        node: Option<&RecordId>,
        level: u32,
        updates: Vec<MapUpdate>,
    ) -> Result<Option<(RecordId, u32)>> {
        let reader = self.store.record_reader();

        let Some(node) = node else {
            let mut entries = Vec::new();
            for update in updates {
                if let Some(value) = update.value {
                    let key_id = self.write_string(&update.key)?;
                    entries.push((update.hash, key_id, value));
                }
            }
            if entries.is_empty() {
                return Ok(None);
            }
            entries.sort_by_key(|entry| entry.0);
            return self.write_map_node(level, entries).map(Some);
        };

        match map::parse(reader, self.store, node)? {
            MapParse::Diff { .. } => Err(Error::corruption(
                "diff map node below the root of a map",
            )),
            MapParse::Leaf { entries, .. } => {
                let mut entries: Vec<(u32, RecordId, RecordId)> = entries;
                let mut changed = false;

                for update in updates {
                    let mut slot = None;
                    for (index, (hash, key_id, _)) in entries.iter().enumerate() {
                        if *hash == update.hash
                            && reader.read_string(self.store, key_id)? == update.key
                        {
                            slot = Some(index);
                            break;
                        }
                    }
                    match (slot, update.value) {
                        (Some(index), Some(value)) => {
                            if entries[index].2 != value {
                                entries[index].2 = value;
                                changed = true;
                            }
                        }
                        (Some(index), None) => {
                            entries.remove(index);
                            changed = true;
                        }
                        (None, Some(value)) => {
                            let key_id = self.write_string(&update.key)?;
                            let at = entries
                                .iter()
                                .position(|(hash, _, _)| *hash > update.hash)
                                .unwrap_or(entries.len());
                            entries.insert(at, (update.hash, key_id, value));
                            changed = true;
                        }
                        (None, None) => {}
                    }
                }

                if !changed {
                    return Ok(Some((node.clone(), entries.len() as u32)));
                }
                if entries.is_empty() {
                    return Ok(None);
                }
                self.write_map_node(level, entries).map(Some)
            }
            MapParse::Branch {
                bitmap, children, ..
            } => {
                // Group updates by child slice.
                let mut groups: BTreeMap<u32, Vec<MapUpdate>> = BTreeMap::new();
                for update in updates {
                    groups
                        .entry(slice(update.hash, level))
                        .or_default()
                        .push(update);
                }

                let mut slots: Vec<Option<(RecordId, u32)>> =
                    Vec::with_capacity(BUCKETS_PER_LEVEL);
                let mut changed = false;
                for bucket in 0..BUCKETS_PER_LEVEL as u32 {
                    let bit = 1u32 << bucket;
                    let existing = if bitmap & bit != 0 {
                        let rank = (bitmap & (bit - 1)).count_ones() as usize;
                        Some(children[rank].clone())
                    } else {
                        None
                    };

                    let slot = match groups.remove(&bucket) {
                        Some(group) => {
                            let updated =
                                self.map_update(existing.as_ref(), level + 1, group)?;
                            match (&existing, &updated) {
                                (Some(old), Some((new, _))) if old == new => {}
                                (None, None) => {}
                                _ => changed = true,
                            }
                            updated
                        }
                        None => match existing {
                            Some(id) => {
                                let size = self.map_node_size(&id)?;
                                Some((id, size))
                            }
                            None => None,
                        },
                    };
                    slots.push(slot);
                }

                if !changed {
                    let size = slots.iter().flatten().map(|(_, size)| size).sum();
                    return Ok(Some((node.clone(), size)));
                }

                let size: u32 = slots.iter().flatten().map(|(_, size)| size).sum();
                if size == 0 {
                    return Ok(None);
                }
                if size as usize <= BUCKETS_PER_LEVEL {
                    // Shrunk below the branching threshold: collapse into
                    // a leaf.
                    let mut entries = Vec::with_capacity(size as usize);
                    for (id, _) in slots.iter().flatten() {
                        self.collect_map_entries(id, &mut entries)?;
                    }
                    entries.sort_by_key(|entry| entry.0);
                    return self.write_map_node(level, entries).map(Some);
                }
                self.write_map_branch(level, size, &slots).map(Some)
            }
        }
    }

    /// Writes a trie node for the given entries, branching when the entry
    /// count calls for it.
    fn write_map_node(
        &mut self,
        level: u32,
        entries: Vec<(u32, RecordId, RecordId)>,
    ) -> Result<(RecordId, u32)> {
        let size = entries.len() as u32;
        if !is_branch(size, level) {
            return self.write_map_leaf(level, &entries);
        }

        let mut buckets: Vec<Vec<(u32, RecordId, RecordId)>> =
            vec![Vec::new(); BUCKETS_PER_LEVEL];
        for entry in entries {
            buckets[slice(entry.0, level) as usize].push(entry);
        }

        let mut slots = Vec::with_capacity(BUCKETS_PER_LEVEL);
        for bucket in buckets {
            if bucket.is_empty() {
                slots.push(None);
            } else {
                slots.push(Some(self.write_map_node(level + 1, bucket)?));
            }
        }
        self.write_map_branch(level, size, &slots)
    }

    fn write_map_leaf(
        &mut self,
        level: u32,
        entries: &[(u32, RecordId, RecordId)],
    ) -> Result<(RecordId, u32)> {
        let size = entries.len() as u32;
        let mut bytes = Vec::with_capacity(4 + entries.len() * 40);
        bytes.extend_from_slice(&encode_head(size, level, false).to_be_bytes());
        for (hash, _, _) in entries {
            bytes.extend_from_slice(&hash.to_be_bytes());
        }
        let mut referenced = Vec::with_capacity(entries.len() * 2);
        for (_, key, value) in entries {
            bytes.extend_from_slice(&key.to_bytes());
            bytes.extend_from_slice(&value.to_bytes());
            referenced.push(key.clone());
            referenced.push(value.clone());
        }
        let id = self.write_raw(RecordType::Map, &bytes, &referenced)?;
        Ok((id, size))
    }

    fn write_map_branch(
        &mut self,
        level: u32,
        size: u32,
        slots: &[Option<(RecordId, u32)>],
    ) -> Result<(RecordId, u32)> {
        let mut bitmap = 0u32;
        let mut children = Vec::new();
        for (bucket, slot) in slots.iter().enumerate() {
            if let Some((id, _)) = slot {
                bitmap |= 1 << bucket;
                children.push(id.clone());
            }
        }

        let mut bytes = Vec::with_capacity(8 + children.len() * 18);
        bytes.extend_from_slice(&encode_head(size, level, false).to_be_bytes());
        bytes.extend_from_slice(&bitmap.to_be_bytes());
        for child in &children {
            bytes.extend_from_slice(&child.to_bytes());
        }
        let id = self.write_raw(RecordType::Map, &bytes, &children)?;
        Ok((id, size))
    }

    fn map_node_size(&self, id: &RecordId) -> Result<u32> {
        let segment = self.store.read_segment(id.segment_id())?;
        Ok(segment.read_u32(id.offset())? & map::SIZE_MASK)
    }

    fn collect_map_entries(
        &self,
        node: &RecordId,
        into: &mut Vec<(u32, RecordId, RecordId)>,
    ) -> Result<()> {
        let reader = self.store.record_reader();
        match map::parse(reader, self.store, node)? {
            MapParse::Leaf { entries, .. } => {
                into.extend(entries);
                Ok(())
            }
            MapParse::Branch { children, .. } => {
                for child in children {
                    self.collect_map_entries(&child, into)?;
                }
                Ok(())
            }
            MapParse::Diff { .. } => Err(Error::corruption(
                "diff map node below the root of a map",
            )),
        }
    }

    // --------------------------------------------------------- templates

    fn write_template(&mut self, template: &Template) -> Result<RecordId> {
        let key = (self.generation, template.clone());
        if let Some(id) = self.caches.lock().templates.get(&key) {
            return Ok(id);
        }

        if template.mixin_types.len() > MIXIN_COUNT_MAX {
            return Err(Error::corruption("too many mixin types"));
        }
        if template.properties.len() > PROPERTY_COUNT_MAX {
            return Err(Error::corruption("too many properties for one node"));
        }

        let mut ids = Vec::new();
        if let Some(primary) = &template.primary_type {
            ids.push(self.write_string(primary)?);
        }
        for mixin in &template.mixin_types {
            ids.push(self.write_string(mixin)?);
        }
        if let ChildName::One(name) = &template.child_name {
            ids.push(self.write_string(name)?);
        }

        let mut bytes = Vec::with_capacity(4 + ids.len() * 18 + template.properties.len() * 19);
        bytes.extend_from_slice(&template.head().to_be_bytes());
        let mut referenced = ids.clone();
        for id in &ids {
            bytes.extend_from_slice(&id.to_bytes());
        }
        for property in &template.properties {
            let name = self.write_string(&property.name)?;
            bytes.extend_from_slice(&name.to_bytes());
            bytes.push(encode_type(property.ty, property.multiple));
            referenced.push(name);
        }

        let id = self.write_raw(RecordType::Template, &bytes, &referenced)?;
        self.caches.lock().templates.insert(key, id.clone());
        Ok(id)
    }

    // ------------------------------------------------------------- nodes

    /// Writes a builder, reusing the base record when nothing changed.
    fn write_builder_node(&mut self, builder: &NodeBuilder) -> Result<RecordId> {
        if let Some(base) = builder.base() {
            if !builder.has_changes() {
                return Ok(base.record_id().clone());
            }
        }

        // Assemble the effective property slots and type-folding state.
        let mut properties: BTreeMap<String, PropertySlot> = BTreeMap::new();
        let mut primary_type = None;
        let mut mixin_types = Vec::new();
        let mut base_child: Option<ChildSlot> = None;
        let mut base_single_name = None;

        if let Some(base) = builder.base() {
            let reader = self.store.record_reader();
            let record = reader.read_node(self.store, base.record_id())?;
            primary_type = record.template.primary_type.clone();
            mixin_types = record.template.mixin_types.clone();
            if let ChildName::One(name) = &record.template.child_name {
                base_single_name = Some(name.clone());
            }
            for (index, slot) in record.template.properties.iter().enumerate() {
                properties.insert(
                    slot.name.clone(),
                    PropertySlot::Existing {
                        ty: slot.ty,
                        multiple: slot.multiple,
                        id: record.property_values[index].clone(),
                    },
                );
            }
            base_child = Some(record.child);
        }

        for (name, change) in &builder.properties {
            if name == PRIMARY_TYPE_NAME {
                // Only a string value folds into the template; anything
                // else drops the primary type, like the mixin branch
                // below drops non-string mixins.
                primary_type = match change {
                    Some(value) => value.as_string().map(str::to_string),
                    None => None,
                };
                properties.remove(name);
                continue;
            }
            if name == MIXIN_TYPES_NAME {
                mixin_types = match change {
                    Some(Value::Multi(Type::String, scalars)) => scalars
                        .iter()
                        .filter_map(|scalar| match scalar {
                            Scalar::String(s) => Some(s.clone()),
                            _ => None,
                        })
                        .collect(),
                    Some(Value::Single(Scalar::String(s))) => vec![s.clone()],
                    _ => Vec::new(),
                };
                properties.remove(name);
                continue;
            }
            match change {
                Some(value) => {
                    properties.insert(name.clone(), PropertySlot::New(value.clone()));
                }
                None => {
                    properties.remove(name);
                }
            }
        }

        // Resolve changed children to record ids.
        let mut child_changes: BTreeMap<String, Option<RecordId>> = BTreeMap::new();
        for (name, change) in &builder.children {
            let resolved = match change {
                None => None,
                Some(ChildChange::State(state)) => Some(state.record_id().clone()),
                Some(ChildChange::Builder(nested)) => Some(self.write_builder_node(nested)?),
            };
            child_changes.insert(name.clone(), resolved);
        }

        let child = self.write_children(base_child, base_single_name, child_changes)?;

        self.write_node_record(primary_type, mixin_types, properties, child)
    }

    /// Computes and writes the child slot from the base shape and the
    /// resolved changes.
    fn write_children(
        &mut self,
        base_child: Option<ChildSlot>,
        base_single_name: Option<String>,
        changes: BTreeMap<String, Option<RecordId>>,
    ) -> Result<ChildOut> {
        let reader = self.store.record_reader();

        if let Some(ChildSlot::Map(map_id)) = &base_child {
            let map = reader.map(self.store, map_id)?;
            let mut count = i64::from(map.size());
            let mut effective: BTreeMap<String, Option<RecordId>> = BTreeMap::new();
            for (name, change) in changes {
                let existing = map.get(self.store, &name)?;
                match (change, existing) {
                    (None, Some(_)) => {
                        count -= 1;
                        effective.insert(name, None);
                    }
                    (None, None) => {}
                    (Some(id), Some(old)) => {
                        if old != id {
                            effective.insert(name, Some(id));
                        }
                    }
                    (Some(id), None) => {
                        count += 1;
                        effective.insert(name, Some(id));
                    }
                }
            }

            return match count {
                0 => Ok(ChildOut::Zero),
                1 => {
                    let mut survivors: BTreeMap<String, RecordId> = map
                        .entries(self.store)?
                        .into_iter()
                        .collect();
                    for (name, change) in &effective {
                        match change {
                            None => {
                                survivors.remove(name);
                            }
                            Some(id) => {
                                survivors.insert(name.clone(), id.clone());
                            }
                        }
                    }
                    let (name, id) = survivors
                        .into_iter()
                        .next()
                        .ok_or_else(|| Error::corruption("child map count out of sync"))?;
                    Ok(ChildOut::One(name, id))
                }
                _ => {
                    let id = self.write_map(Some(map_id), effective)?;
                    Ok(ChildOut::Many(id))
                }
            };
        }

        let mut children: BTreeMap<String, RecordId> = BTreeMap::new();
        if let (Some(ChildSlot::One(id)), Some(name)) = (&base_child, base_single_name) {
            children.insert(name, id.clone());
        }
        for (name, change) in changes {
            match change {
                Some(id) => {
                    children.insert(name, id);
                }
                None => {
                    children.remove(&name);
                }
            }
        }

        let mut children = children.into_iter();
        match (children.next(), children.len()) {
            (None, _) => Ok(ChildOut::Zero),
            (Some((name, id)), 0) => Ok(ChildOut::One(name, id)),
            (Some(first), _) => {
                let children = std::iter::once(first).chain(children);
                let changes = children
                    .into_iter()
                    .map(|(name, id)| (name, Some(id)))
                    .collect();
                let id = self.write_map(None, changes)?;
                Ok(ChildOut::Many(id))
            }
        }
    }

    /// Encodes the template and node records for the assembled state.
    fn write_node_record(
        &mut self,
        primary_type: Option<String>,
        mixin_types: Vec<String>,
        properties: BTreeMap<String, PropertySlot>,
        child: ChildOut,
    ) -> Result<RecordId> {
        let mut slots = Vec::with_capacity(properties.len());
        let mut template_properties = Vec::with_capacity(properties.len());
        for (name, slot) in properties {
            let (ty, multiple, id) = match slot {
                PropertySlot::Existing { ty, multiple, id } => (ty, multiple, id),
                PropertySlot::New(value) => {
                    let ty = value.ty();
                    let multiple = value.is_multiple();
                    (ty, multiple, self.write_value(&value)?)
                }
            };
            template_properties.push(crate::record::PropertyTemplate {
                name,
                ty,
                multiple,
            });
            slots.push(id);
        }

        let template = Template {
            primary_type,
            mixin_types,
            child_name: match &child {
                ChildOut::Zero => ChildName::Zero,
                ChildOut::One(name, _) => ChildName::One(name.clone()),
                ChildOut::Many(_) => ChildName::Many,
            },
            properties: template_properties,
        };
        let template_id = self.write_template(&template)?;

        let mut bytes = Vec::with_capacity(18 * (2 + slots.len()));
        let mut referenced = vec![template_id.clone()];
        bytes.extend_from_slice(&template_id.to_bytes());
        match &child {
            ChildOut::Zero => {}
            ChildOut::One(_, id) | ChildOut::Many(id) => {
                bytes.extend_from_slice(&id.to_bytes());
                referenced.push(id.clone());
            }
        }
        for id in &slots {
            bytes.extend_from_slice(&id.to_bytes());
            referenced.push(id.clone());
        }
        self.write_raw(RecordType::Node, &bytes, &referenced)
    }

    fn write_value(&mut self, value: &Value) -> Result<RecordId> {
        match value {
            Value::Single(scalar) => self.write_scalar(scalar),
            Value::Multi(_, scalars) => {
                let mut ids = Vec::with_capacity(scalars.len());
                for scalar in scalars {
                    ids.push(self.write_scalar(scalar)?);
                }
                let list = self.write_list(&ids)?;

                let mut bytes = Vec::with_capacity(4 + 18);
                bytes.extend_from_slice(&(scalars.len() as u32).to_be_bytes());
                let mut referenced = Vec::new();
                if let Some(list) = list {
                    bytes.extend_from_slice(&list.to_bytes());
                    referenced.push(list);
                }
                self.write_raw(RecordType::Property, &bytes, &referenced)
            }
        }
    }

    fn write_scalar(&mut self, scalar: &Scalar) -> Result<RecordId> {
        match scalar {
            Scalar::String(value) => self.write_string(value),
            Scalar::Long(value) => {
                self.write_value_record(RecordType::Value, &value.to_be_bytes())
            }
            Scalar::Double(value) => {
                self.write_value_record(RecordType::Value, &value.to_bits().to_be_bytes())
            }
            Scalar::Boolean(value) => {
                self.write_value_record(RecordType::Value, &[u8::from(*value)])
            }
            Scalar::Binary(blob) => match blob {
                Blob::Inline(bytes) => self.write_value_record(RecordType::Value, bytes),
                Blob::Record { id, .. } => Ok(id.clone()),
                Blob::External(reference) => self.write_external(reference),
            },
        }
    }

    // -------------------------------------------------------- compaction

    /// Deep-copies the node at `id` into the target generation.
    fn write_node_deep(&mut self, id: &RecordId) -> Result<RecordId> {
        self.check_cancel()?;

        let segment = self.store.read_segment(id.segment_id())?;
        if segment.generation() == self.generation {
            return Ok(id.clone());
        }
        let cache_key = (self.generation, id.clone());
        if let Some(rewritten) = self.caches.lock().records.get(&cache_key) {
            return Ok(rewritten);
        }

        let reader = self.store.record_reader();
        let record = reader.read_node(self.store, id)?;

        let child = match &record.child {
            ChildSlot::Zero => ChildOut::Zero,
            ChildSlot::One(child_id) => {
                let ChildName::One(name) = &record.template.child_name else {
                    return Err(Error::corruption("single-child template without a name"));
                };
                ChildOut::One(name.clone(), self.write_node_deep(child_id)?)
            }
            ChildSlot::Map(map_id) => ChildOut::Many(self.write_map_deep(map_id)?),
        };

        let mut properties = BTreeMap::new();
        for (index, slot) in record.template.properties.iter().enumerate() {
            let value = self.write_value_deep(&record.property_values[index], slot.multiple)?;
            properties.insert(
                slot.name.clone(),
                PropertySlot::Existing {
                    ty: slot.ty,
                    multiple: slot.multiple,
                    id: value,
                },
            );
        }

        let rewritten = self.write_node_record(
            record.template.primary_type.clone(),
            record.template.mixin_types.clone(),
            properties,
            child,
        )?;
        self.caches.lock().records.insert(cache_key, rewritten.clone());
        Ok(rewritten)
    }

    /// Deep-copies a child map, rewriting every child node.
    fn write_map_deep(&mut self, id: &RecordId) -> Result<RecordId> {
        let cache_key = (self.generation, id.clone());
        if let Some(rewritten) = self.caches.lock().records.get(&cache_key) {
            return Ok(rewritten);
        }

        let reader = self.store.record_reader();
        let entries = reader.map(self.store, id)?.entries(self.store)?;
        let mut changes = BTreeMap::new();
        for (name, child) in entries {
            self.check_cancel()?;
            changes.insert(name, Some(self.write_node_deep(&child)?));
        }

        let rewritten = self.write_map(None, changes)?;
        self.caches.lock().records.insert(cache_key, rewritten.clone());
        Ok(rewritten)
    }

    /// Deep-copies a property value record.
    ///
    /// Inline values are re-encoded; block lists are rewritten but keep
    /// referencing the same bulk blocks; external references are carried
    /// over.
    fn write_value_deep(&mut self, id: &RecordId, multiple: bool) -> Result<RecordId> {
        let cache_key = (self.generation, id.clone());
        if let Some(rewritten) = self.caches.lock().records.get(&cache_key) {
            return Ok(rewritten);
        }
        let reader = self.store.record_reader();

        let rewritten = if multiple {
            let segment = self.store.read_segment(id.segment_id())?;
            let count = segment.read_u32(id.offset())?;
            let mut ids = Vec::with_capacity(count as usize);
            if count > 0 {
                let list_id = reader.record_ref(self.store, &segment, id.offset() + 4)?;
                let list = reader.read_list_at(self.store, &list_id)?;
                for index in 0..count {
                    let element = reader.list_get(self.store, &list, index)?;
                    ids.push(self.write_single_value_deep(&element)?);
                }
            }

            let list = self.write_list(&ids)?;
            let mut bytes = Vec::with_capacity(4 + 18);
            bytes.extend_from_slice(&count.to_be_bytes());
            let mut referenced = Vec::new();
            if let Some(list) = list {
                bytes.extend_from_slice(&list.to_bytes());
                referenced.push(list);
            }
            self.write_raw(RecordType::Property, &bytes, &referenced)?
        } else {
            self.write_single_value_deep(id)?
        };

        self.caches.lock().records.insert(cache_key, rewritten.clone());
        Ok(rewritten)
    }

    fn write_single_value_deep(&mut self, id: &RecordId) -> Result<RecordId> {
        let reader = self.store.record_reader();
        if let Some(reference) = reader.external_reference(self.store, id)? {
            return self.write_external(&reference);
        }

        match reader.value_length(self.store, id)? {
            Some(length) if (length as usize) >= MEDIUM_LIMIT => {
                // Keep the bulk blocks; rewrite the list and head records.
                let segment = self.store.read_segment(id.segment_id())?;
                let list_id = reader.record_ref(self.store, &segment, id.offset() + 8)?;
                let list = reader.read_list_at(self.store, &list_id)?;
                let blocks = reader.list_ids(self.store, &list)?;
                let rewritten_list = self
                    .write_list(&blocks)?
                    .ok_or_else(|| Error::corruption("empty block list for a long value"))?;
                self.write_long_value_head(RecordType::Value, length, rewritten_list)
            }
            _ => {
                let bytes = reader.read_value_bytes(self.store, id)?;
                self.write_value_record(RecordType::Value, &bytes)
            }
        }
    }
}

/// The resolved child slot of a node being written.
enum ChildOut {
    Zero,
    One(String, RecordId),
    Many(RecordId),
}

struct MapUpdate {
    hash: u32,
    key: String,
    value: Option<RecordId>,
}

fn read_full(stream: &mut dyn Read, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match stream.read(&mut buffer[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SEGMENT_VERSION;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    struct Fixture {
        store: Arc<MemoryStore>,
        pool: WriterPool,
        writer: SegmentWriter,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(MemoryStore::new()),
                pool: WriterPool::new(SEGMENT_VERSION),
                writer: SegmentWriter::new(),
            }
        }

        fn with<T>(&self, op: impl FnOnce(&mut WriteContext<'_>) -> Result<T>) -> T {
            self.writer
                .with_writer(&*self.store, &self.pool, "test", 0, None, op)
                .unwrap()
        }
    }

    #[test]
    fn string_size_class_boundaries() {
        let fx = Fixture::new();
        for len in [
            0,
            SMALL_LIMIT - 1,
            SMALL_LIMIT,
            SMALL_LIMIT + 1,
            MEDIUM_LIMIT - 1,
            MEDIUM_LIMIT,
            MEDIUM_LIMIT + 1,
            MAX_SEGMENT_SIZE - 1,
            MAX_SEGMENT_SIZE + 1,
            2 * MAX_SEGMENT_SIZE + 1,
        ] {
            let value = "x".repeat(len);
            let id = fx.with(|ctx| ctx.write_string(&value));
            let read = fx
                .store
                .record_reader()
                .read_string(&*fx.store, &id)
                .unwrap();
            assert_eq!(read.len(), len, "string of length {len}");
            assert_eq!(read, value);
        }
    }

    #[test]
    fn equal_strings_share_a_record() {
        let fx = Fixture::new();
        let a = fx.with(|ctx| ctx.write_string("shared"));
        let b = fx.with(|ctx| ctx.write_string("shared"));
        assert_eq!(a, b);
    }

    #[test]
    fn list_boundaries() {
        let fx = Fixture::new();
        for count in [
            1,
            LEVEL_SIZE,
            LEVEL_SIZE + 1,
            LEVEL_SIZE * LEVEL_SIZE,
            LEVEL_SIZE * LEVEL_SIZE + 1,
        ] {
            let (list_id, ids) = fx.with(|ctx| {
                let mut ids = Vec::with_capacity(count);
                for index in 0..count {
                    ids.push(ctx.write_value_record(
                        RecordType::Block,
                        &(index as u32).to_be_bytes(),
                    )?);
                }
                let list = ctx.write_list(&ids)?.expect("non-empty list");
                Ok((list, ids))
            });

            let reader = fx.store.record_reader();
            let list = reader.read_list_at(&*fx.store, &list_id).unwrap();
            assert_eq!(list.count as usize, count);
            for probe in [0, count / 2, count - 1] {
                assert_eq!(
                    reader.list_get(&*fx.store, &list, probe as u32).unwrap(),
                    ids[probe],
                    "list of {count}, index {probe}"
                );
            }
        }
    }

    #[test]
    fn empty_list_has_no_record() {
        let fx = Fixture::new();
        let list = fx.with(|ctx| ctx.write_list(&[]));
        assert!(list.is_none());
    }

    #[test]
    fn map_put_and_get() {
        let fx = Fixture::new();
        let value = fx.with(|ctx| ctx.write_string("value"));
        let map_id = fx.with(|ctx| {
            let mut changes = BTreeMap::new();
            changes.insert("key".to_string(), Some(value.clone()));
            ctx.write_map(None, changes)
        });

        let reader = fx.store.record_reader();
        let map = reader.map(&*fx.store, &map_id).unwrap();
        assert_eq!(map.size(), 1);
        assert_eq!(map.get(&*fx.store, "key").unwrap(), Some(value));
        assert_eq!(map.get(&*fx.store, "other").unwrap(), None);
    }

    #[test]
    fn map_remove_absent_is_the_same_map() {
        let fx = Fixture::new();
        let value = fx.with(|ctx| ctx.write_string("v"));
        let map_id = fx.with(|ctx| {
            let mut changes = BTreeMap::new();
            changes.insert("key".to_string(), Some(value));
            ctx.write_map(None, changes)
        });

        let unchanged = fx.with(|ctx| {
            let mut changes = BTreeMap::new();
            changes.insert("absent".to_string(), None);
            ctx.write_map(Some(&map_id), changes)
        });
        assert_eq!(unchanged, map_id);
    }

    #[test]
    fn map_remove_then_get_is_none() {
        let fx = Fixture::new();
        let value = fx.with(|ctx| ctx.write_string("v"));
        let map_id = fx.with(|ctx| {
            let mut changes = BTreeMap::new();
            changes.insert("a".to_string(), Some(value.clone()));
            changes.insert("b".to_string(), Some(value));
            ctx.write_map(None, changes)
        });
        let removed = fx.with(|ctx| {
            let mut changes = BTreeMap::new();
            changes.insert("a".to_string(), None);
            ctx.write_map(Some(&map_id), changes)
        });

        let reader = fx.store.record_reader();
        let map = reader.map(&*fx.store, &removed).unwrap();
        assert_eq!(map.size(), 1);
        assert_eq!(map.get(&*fx.store, "a").unwrap(), None);
        assert!(map.get(&*fx.store, "b").unwrap().is_some());
    }

    #[test]
    fn map_grows_into_branches() {
        let fx = Fixture::new();
        let count = BUCKETS_PER_LEVEL * 4;
        let map_id = fx.with(|ctx| {
            let mut changes = BTreeMap::new();
            for index in 0..count {
                let value = ctx.write_string(&format!("value-{index}"))?;
                changes.insert(format!("key-{index}"), Some(value));
            }
            ctx.write_map(None, changes)
        });

        let reader = fx.store.record_reader();
        let map = reader.map(&*fx.store, &map_id).unwrap();
        assert_eq!(map.size() as usize, count);
        for index in 0..count {
            let value = map.get(&*fx.store, &format!("key-{index}")).unwrap();
            assert!(value.is_some(), "key-{index} lost");
        }
        assert_eq!(map.entries(&*fx.store).unwrap().len(), count);
    }

    #[test]
    fn map_survives_total_hash_collisions() {
        // 2^6 keys built from the colliding pair, all with one hash,
        // exceeding a bucket at every level.
        let keys: Vec<String> = (0..64u32)
            .map(|bits| {
                (0..6)
                    .map(|bit| if bits & (1 << bit) == 0 { "Aa" } else { "BB" })
                    .collect::<String>()
            })
            .collect();
        let hash = map_hash(&keys[0]);
        assert!(keys.iter().all(|key| map_hash(key) == hash));

        let fx = Fixture::new();
        let map_id = fx.with(|ctx| {
            let mut changes = BTreeMap::new();
            for key in &keys {
                let value = ctx.write_string(&format!("v-{key}"))?;
                changes.insert(key.clone(), Some(value));
            }
            ctx.write_map(None, changes)
        });

        let reader = fx.store.record_reader();
        let map = reader.map(&*fx.store, &map_id).unwrap();
        assert_eq!(map.size() as usize, keys.len());
        for key in &keys {
            let value = map.get(&*fx.store, key).unwrap().expect("colliding key");
            let read = reader.read_string(&*fx.store, &value).unwrap();
            assert_eq!(read, format!("v-{key}"));
        }
    }

    #[test]
    fn single_update_of_large_map_writes_a_diff() {
        let fx = Fixture::new();
        let map_id = fx.with(|ctx| {
            let mut changes = BTreeMap::new();
            for index in 0..(BUCKETS_PER_LEVEL * 2) {
                let value = ctx.write_string(&format!("v{index}"))?;
                changes.insert(format!("k{index}"), Some(value));
            }
            ctx.write_map(None, changes)
        });

        let replacement = fx.with(|ctx| ctx.write_string("replacement"));
        let updated = fx.with(|ctx| {
            let mut changes = BTreeMap::new();
            changes.insert("k3".to_string(), Some(replacement.clone()));
            ctx.write_map(Some(&map_id), changes)
        });

        let reader = fx.store.record_reader();
        assert!(matches!(
            map::parse(reader, &*fx.store, &updated).unwrap(),
            MapParse::Diff { .. }
        ));

        let map = reader.map(&*fx.store, &updated).unwrap();
        assert_eq!(map.get(&*fx.store, "k3").unwrap(), Some(replacement));
        assert!(map.get(&*fx.store, "k7").unwrap().is_some());
        assert_eq!(map.size() as usize, BUCKETS_PER_LEVEL * 2);
        // The diff resolves through entries() as well.
        let entries = map.entries(&*fx.store).unwrap();
        assert_eq!(entries.len(), BUCKETS_PER_LEVEL * 2);
    }

    #[test]
    fn builder_round_trip() {
        let fx = Fixture::new();
        let store: Arc<dyn SegmentStore> = fx.store.clone();

        let mut builder = NodeBuilder::new();
        builder.set_property("title", Value::string("hello"));
        builder.set_property("count", Value::long(-42));
        builder.set_property(
            "ratio",
            Value::Single(Scalar::Double(std::f64::consts::PI)),
        );
        builder.set_property("flag", Value::boolean(true));
        builder.set_property(
            "tags",
            Value::Multi(
                Type::String,
                vec![
                    Scalar::String("a".to_string()),
                    Scalar::String("b".to_string()),
                ],
            ),
        );
        builder.set_property("primaryType", Value::string("folder"));
        builder
            .child("docs")
            .unwrap()
            .set_property("n", Value::long(1));

        let id = fx
            .writer
            .write_builder(&*fx.store, &fx.pool, "test", 0, &builder)
            .unwrap();
        let node = NodeState::new(store, id);

        assert_eq!(
            node.property("title").unwrap(),
            Some(Value::string("hello"))
        );
        assert_eq!(node.property("count").unwrap(), Some(Value::long(-42)));
        assert_eq!(
            node.property("ratio").unwrap(),
            Some(Value::Single(Scalar::Double(std::f64::consts::PI)))
        );
        assert_eq!(node.property("flag").unwrap(), Some(Value::boolean(true)));
        assert_eq!(
            node.property("primaryType").unwrap(),
            Some(Value::string("folder"))
        );
        let Some(Value::Multi(Type::String, tags)) = node.property("tags").unwrap() else {
            panic!("expected a multi-valued string property");
        };
        assert_eq!(tags.len(), 2);

        let docs = node.child("docs").unwrap().expect("child exists");
        assert_eq!(docs.property("n").unwrap(), Some(Value::long(1)));
        assert_eq!(node.child_count().unwrap(), 1);
        assert_eq!(node.child_names().unwrap(), vec!["docs".to_string()]);
    }

    #[test]
    fn non_string_primary_type_is_dropped() {
        let fx = Fixture::new();
        let store: Arc<dyn SegmentStore> = fx.store.clone();

        let mut builder = NodeBuilder::new();
        builder.set_property("primaryType", Value::long(7));
        builder.set_property("kept", Value::boolean(true));
        let id = fx
            .writer
            .write_builder(&*fx.store, &fx.pool, "test", 0, &builder)
            .unwrap();

        let node = NodeState::new(store, id);
        // Neither folded into the template nor left behind as a shadow
        // property.
        assert_eq!(node.property("primaryType").unwrap(), None);
        assert!(!node
            .property_names()
            .unwrap()
            .contains(&"primaryType".to_string()));
        assert_eq!(node.property("kept").unwrap(), Some(Value::boolean(true)));
    }

    #[test]
    fn deep_collision_maps_use_the_deepest_level() {
        // 40 colliding keys force branching through every trie level and a
        // terminal leaf at the deepest one.
        let keys: Vec<String> = (0..40u32)
            .map(|bits| {
                (0..6)
                    .map(|bit| if bits & (1 << bit) == 0 { "Aa" } else { "BB" })
                    .collect::<String>()
            })
            .collect();

        let fx = Fixture::new();
        let map_id = fx.with(|ctx| {
            let mut changes = BTreeMap::new();
            for key in &keys {
                let value = ctx.write_string(key)?;
                changes.insert(key.clone(), Some(value));
            }
            ctx.write_map(None, changes)
        });

        let reader = fx.store.record_reader();
        let mut node = map_id;
        let mut depth = 0;
        loop {
            match map::parse(reader, &*fx.store, &node).unwrap() {
                MapParse::Branch { children, .. } => {
                    assert_eq!(children.len(), 1, "colliding keys share one slice");
                    node = children[0].clone();
                    depth += 1;
                }
                MapParse::Leaf { level, entries } => {
                    assert_eq!(level, crate::record::MAX_LEVELS);
                    assert_eq!(depth, crate::record::MAX_LEVELS);
                    assert_eq!(entries.len(), keys.len());
                    break;
                }
                MapParse::Diff { .. } => panic!("unexpected diff node"),
            }
        }
    }

    #[test]
    fn unchanged_builder_reuses_the_base_record() {
        let fx = Fixture::new();
        let store: Arc<dyn SegmentStore> = fx.store.clone();

        let mut builder = NodeBuilder::new();
        builder.set_property("a", Value::long(1));
        let id = fx
            .writer
            .write_builder(&*fx.store, &fx.pool, "test", 0, &builder)
            .unwrap();

        let state = NodeState::new(store, id.clone());
        let unchanged = state.builder();
        let rewritten = fx
            .writer
            .write_builder(&*fx.store, &fx.pool, "test", 0, &unchanged)
            .unwrap();
        assert_eq!(rewritten, id);
    }

    #[test]
    fn many_children_round_trip() {
        let fx = Fixture::new();
        let store: Arc<dyn SegmentStore> = fx.store.clone();

        let mut builder = NodeBuilder::new();
        for index in 0..40 {
            builder
                .child(&format!("child-{index}"))
                .unwrap()
                .set_property("i", Value::long(index));
        }
        let id = fx
            .writer
            .write_builder(&*fx.store, &fx.pool, "test", 0, &builder)
            .unwrap();

        let node = NodeState::new(store, id);
        assert_eq!(node.child_count().unwrap(), 40);
        let child = node.child("child-17").unwrap().expect("child exists");
        assert_eq!(child.property("i").unwrap(), Some(Value::long(17)));
    }

    #[test]
    fn removing_children_shrinks_to_single_and_zero() {
        let fx = Fixture::new();
        let store: Arc<dyn SegmentStore> = fx.store.clone();

        let mut builder = NodeBuilder::new();
        builder.child("a").unwrap().set_property("x", Value::long(1));
        builder.child("b").unwrap().set_property("x", Value::long(2));
        let id = fx
            .writer
            .write_builder(&*fx.store, &fx.pool, "test", 0, &builder)
            .unwrap();

        let state = NodeState::new(Arc::clone(&store), id);
        let mut shrink = state.builder();
        shrink.remove_child("a");
        let id = fx
            .writer
            .write_builder(&*fx.store, &fx.pool, "test", 0, &shrink)
            .unwrap();
        let state = NodeState::new(Arc::clone(&store), id);
        assert_eq!(state.child_count().unwrap(), 1);
        assert!(state.child("b").unwrap().is_some());
        assert!(state.child("a").unwrap().is_none());

        let mut empty = state.builder();
        empty.remove_child("b");
        let id = fx
            .writer
            .write_builder(&*fx.store, &fx.pool, "test", 0, &empty)
            .unwrap();
        let state = NodeState::new(store, id);
        assert_eq!(state.child_count().unwrap(), 0);
    }

    #[test]
    fn stream_round_trip() {
        let fx = Fixture::new();
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();

        let blob = fx
            .writer
            .write_stream(&*fx.store, &fx.pool, "test", 0, &mut data.as_slice())
            .unwrap();
        let Blob::Record { id, length } = &blob else {
            panic!("expected a record blob");
        };
        assert_eq!(*length, data.len() as u64);

        let read = fx
            .store
            .record_reader()
            .read_value_bytes(&*fx.store, id)
            .unwrap();
        assert_eq!(read, data);
    }

    #[test]
    fn small_stream_stays_inline() {
        let fx = Fixture::new();
        let data = vec![7u8; 100];
        let blob = fx
            .writer
            .write_stream(&*fx.store, &fx.pool, "test", 0, &mut data.as_slice())
            .unwrap();
        assert_eq!(blob.length(), Some(100));
        assert_eq!(blob.read(&*fx.store).unwrap(), data);
    }

    #[test]
    fn external_blob_round_trip() {
        let fx = Fixture::new();
        let store: Arc<dyn SegmentStore> = fx.store.clone();

        let mut builder = NodeBuilder::new();
        builder.set_property(
            "payload",
            Value::binary(Blob::External("blob-store://abc123".to_string())),
        );
        let id = fx
            .writer
            .write_builder(&*fx.store, &fx.pool, "test", 0, &builder)
            .unwrap();

        let node = NodeState::new(store, id);
        let value = node.property("payload").unwrap().expect("property exists");
        assert_eq!(
            value.as_blob().and_then(Blob::reference),
            Some("blob-store://abc123")
        );
    }

    #[test]
    fn deep_rewrite_preserves_content_and_bumps_generation() {
        let fx = Fixture::new();
        let store: Arc<dyn SegmentStore> = fx.store.clone();

        let mut builder = NodeBuilder::new();
        builder.set_property("name", Value::string("root"));
        builder
            .child("left")
            .unwrap()
            .set_property("n", Value::long(1));
        builder
            .child("right")
            .unwrap()
            .set_property("n", Value::long(2));
        let id = fx
            .writer
            .write_builder(&*fx.store, &fx.pool, "sys", 0, &builder)
            .unwrap();
        let node = NodeState::new(Arc::clone(&store), id.clone());

        let rewritten = fx
            .writer
            .write_node(&*fx.store, &fx.pool, "c", 1, node.record_id(), &|| false)
            .unwrap()
            .expect("not cancelled");
        assert_ne!(rewritten, id);

        let segment = fx.store.read_segment(rewritten.segment_id()).unwrap();
        assert_eq!(segment.generation(), 1);

        let compacted = NodeState::new(store, rewritten);
        assert_eq!(
            compacted.property("name").unwrap(),
            Some(Value::string("root"))
        );
        assert_eq!(
            compacted
                .child("left")
                .unwrap()
                .expect("child")
                .property("n")
                .unwrap(),
            Some(Value::long(1))
        );
    }

    #[test]
    fn deep_rewrite_deduplicates_shared_subtrees() {
        let fx = Fixture::new();
        let store: Arc<dyn SegmentStore> = fx.store.clone();

        let mut child = NodeBuilder::new();
        child.set_property("shared", Value::boolean(true));
        let child_id = fx
            .writer
            .write_builder(&*fx.store, &fx.pool, "sys", 0, &child)
            .unwrap();
        let child_state = NodeState::new(Arc::clone(&store), child_id);

        let mut builder = NodeBuilder::new();
        builder.set_child("a", child_state.clone());
        builder.set_child("b", child_state);
        let id = fx
            .writer
            .write_builder(&*fx.store, &fx.pool, "sys", 0, &builder)
            .unwrap();
        let node = NodeState::new(Arc::clone(&store), id);

        let rewritten = fx
            .writer
            .write_node(&*fx.store, &fx.pool, "c", 1, node.record_id(), &|| false)
            .unwrap()
            .expect("not cancelled");

        let compacted = NodeState::new(store, rewritten);
        let a = compacted.child("a").unwrap().expect("child a");
        let b = compacted.child("b").unwrap().expect("child b");
        assert_eq!(a.record_id(), b.record_id());
    }

    #[test]
    fn cancelled_rewrite_returns_none() {
        let fx = Fixture::new();
        let store: Arc<dyn SegmentStore> = fx.store.clone();

        let mut builder = NodeBuilder::new();
        builder.set_property("a", Value::long(1));
        let id = fx
            .writer
            .write_builder(&*fx.store, &fx.pool, "sys", 0, &builder)
            .unwrap();
        let node = NodeState::new(store, id);

        let result = fx
            .writer
            .write_node(&*fx.store, &fx.pool, "c", 1, node.record_id(), &|| true)
            .unwrap();
        assert!(result.is_none());
    }
}
