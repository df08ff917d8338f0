//! The record reader: decodes records out of segments.

use crate::cache::Lru;
use crate::error::{Error, Result};
use crate::node::{Blob, ChildSlot, Scalar, Type, Value};
use crate::record::map::MapRecord;
use crate::record::template::{decode_type, ChildName, Template};
use crate::record::template::{
    HEAD_MANY_CHILDREN, HEAD_MIXINS, HEAD_PRIMARY, HEAD_ZERO_CHILDREN, MIXIN_COUNT_SHIFT,
};
use crate::record::{RecordId, LEVEL_SIZE, MEDIUM_LIMIT, SMALL_LIMIT};
use crate::segment::Segment;
use crate::store::SegmentStore;
use parking_lot::Mutex;
use std::sync::Arc;

/// Budget of the decoded-string cache in bytes.
const STRING_CACHE_BYTES: usize = 16 * 1024 * 1024;

/// Capacity of the decoded-template cache in entries.
const TEMPLATE_CACHE_ENTRIES: usize = 4096;

/// A decoded node record.
pub(crate) struct NodeRecord {
    pub(crate) template: Arc<Template>,
    pub(crate) child: ChildSlot,
    pub(crate) property_values: Vec<RecordId>,
}

/// A decoded list head.
#[derive(Debug, Clone)]
pub(crate) struct ListRecord {
    pub(crate) id: RecordId,
    pub(crate) count: u32,
}

/// The size class of a value record.
enum ValueHead {
    Inline { length: usize, data_offset: u32 },
    Blocks { length: u64, list: RecordId },
    ExternalSmall { reference: String },
    ExternalLong { reference_id: RecordId },
}

/// Decodes records on top of the segment codec, with caches for hot
/// strings and templates.
///
/// The reader is stateless apart from its caches: every method takes the
/// store it resolves segments through, so a single reader can be shared
/// freely and holds no back-reference into the store.
pub struct RecordReader {
    strings: Mutex<Lru<RecordId, Arc<str>>>,
    templates: Mutex<Lru<RecordId, Arc<Template>>>,
}

impl RecordReader {
    /// Creates a reader with default cache sizes.
    #[must_use]
    pub fn new() -> Self {
        Self {
            strings: Mutex::new(Lru::new(STRING_CACHE_BYTES, |_, value: &Arc<str>| {
                value.len()
            })),
            templates: Mutex::new(Lru::with_capacity(TEMPLATE_CACHE_ENTRIES)),
        }
    }

    /// Drops all cached decodes.
    pub fn clear_caches(&self) {
        self.strings.lock().clear();
        self.templates.lock().clear();
    }

    /// Resolves a record id embedded at `offset`, enforcing that a foreign
    /// segment is listed in the current segment's reference table.
    pub(crate) fn record_ref(
        &self,
        store: &dyn SegmentStore,
        segment: &Segment,
        offset: u32,
    ) -> Result<RecordId> {
        let (msb, lsb, record_offset) = segment.read_record_ref(offset)?;
        let own = segment.id();
        if (own.msb(), own.lsb()) != (msb, lsb)
            && !segment.references().contains(&(msb, lsb))
        {
            return Err(Error::corruption(format!(
                "segment {own} follows a reference absent from its header"
            )));
        }
        Ok(RecordId::new(
            store.tracker().segment_id(msb, lsb),
            record_offset,
        ))
    }

    fn value_head(&self, store: &dyn SegmentStore, id: &RecordId) -> Result<ValueHead> {
        let segment = store.read_segment(id.segment_id())?;
        let offset = id.offset();
        let head = segment.read_u8(offset)?;

        if head < 0x80 {
            return Ok(ValueHead::Inline {
                length: head as usize,
                data_offset: offset + 1,
            });
        }
        if head & 0xC0 == 0x80 {
            let length = ((segment.read_u16(offset)? & 0x3FFF) as usize) + SMALL_LIMIT;
            return Ok(ValueHead::Inline {
                length,
                data_offset: offset + 2,
            });
        }
        if head & 0xE0 == 0xC0 {
            let length = (segment.read_u64(offset)? & 0x1FFF_FFFF_FFFF_FFFF) + MEDIUM_LIMIT as u64;
            let list = self.record_ref(store, &segment, offset + 8)?;
            return Ok(ValueHead::Blocks { length, list });
        }
        if head & 0xF0 == 0xE0 {
            let length = (segment.read_u16(offset)? & 0x0FFF) as usize;
            let bytes = segment.read_bytes(offset + 2, length)?;
            let reference = std::str::from_utf8(bytes)
                .map_err(|_| Error::corruption("external reference is not UTF-8"))?;
            return Ok(ValueHead::ExternalSmall {
                reference: reference.to_string(),
            });
        }
        if head & 0xF8 == 0xF0 {
            let reference_id = self.record_ref(store, &segment, offset + 1)?;
            return Ok(ValueHead::ExternalLong { reference_id });
        }
        Err(Error::corruption(format!(
            "invalid value head byte {head:#04x}"
        )))
    }

    /// Reads a string record.
    pub fn read_string(&self, store: &dyn SegmentStore, id: &RecordId) -> Result<String> {
        if let Some(cached) = self.strings.lock().get(id) {
            return Ok(cached.to_string());
        }

        let bytes = self.read_value_bytes(store, id)?;
        let string = String::from_utf8(bytes)
            .map_err(|_| Error::corruption(format!("string record {id} is not UTF-8")))?;
        self.strings
            .lock()
            .insert(id.clone(), Arc::from(string.as_str()));
        Ok(string)
    }

    /// Reads the full content of an inline or block-list value record.
    pub fn read_value_bytes(&self, store: &dyn SegmentStore, id: &RecordId) -> Result<Vec<u8>> {
        match self.value_head(store, id)? {
            ValueHead::Inline {
                length,
                data_offset,
            } => {
                let segment = store.read_segment(id.segment_id())?;
                Ok(segment.read_bytes(data_offset, length)?.to_vec())
            }
            ValueHead::Blocks { length, list } => {
                let list = self.read_list_at(store, &list)?;
                let mut data = Vec::with_capacity(length as usize);
                let block_size = crate::record::BLOCK_SIZE as u64;
                let blocks = length.div_ceil(block_size);
                for index in 0..blocks {
                    let block = self.list_get(store, &list, index as u32)?;
                    let block_len = (length - index * block_size).min(block_size) as usize;
                    let segment = store.read_segment(block.segment_id())?;
                    data.extend_from_slice(segment.read_bytes(block.offset(), block_len)?);
                }
                Ok(data)
            }
            ValueHead::ExternalSmall { .. } | ValueHead::ExternalLong { .. } => {
                Err(Error::corruption(format!(
                    "value record {id} is an external reference"
                )))
            }
        }
    }

    /// Reads a value record as a blob.
    pub fn read_blob(&self, store: &dyn SegmentStore, id: &RecordId) -> Result<Blob> {
        match self.value_head(store, id)? {
            ValueHead::Inline { length, .. } => Ok(Blob::Record {
                id: id.clone(),
                length: length as u64,
            }),
            ValueHead::Blocks { length, .. } => Ok(Blob::Record {
                id: id.clone(),
                length,
            }),
            ValueHead::ExternalSmall { reference } => Ok(Blob::External(reference)),
            ValueHead::ExternalLong { reference_id } => {
                Ok(Blob::External(self.read_string(store, &reference_id)?))
            }
        }
    }

    /// Reads the length of a value record without materializing it.
    pub fn value_length(&self, store: &dyn SegmentStore, id: &RecordId) -> Result<Option<u64>> {
        match self.value_head(store, id)? {
            ValueHead::Inline { length, .. } => Ok(Some(length as u64)),
            ValueHead::Blocks { length, .. } => Ok(Some(length)),
            ValueHead::ExternalSmall { .. } | ValueHead::ExternalLong { .. } => Ok(None),
        }
    }

    /// Reads the external blob references of a value record, if any.
    pub fn external_reference(
        &self,
        store: &dyn SegmentStore,
        id: &RecordId,
    ) -> Result<Option<String>> {
        match self.value_head(store, id)? {
            ValueHead::ExternalSmall { reference } => Ok(Some(reference)),
            ValueHead::ExternalLong { reference_id } => {
                Ok(Some(self.read_string(store, &reference_id)?))
            }
            _ => Ok(None),
        }
    }

    /// Reads a list head at a record id.
    pub(crate) fn read_list_at(
        &self,
        store: &dyn SegmentStore,
        id: &RecordId,
    ) -> Result<ListRecord> {
        let segment = store.read_segment(id.segment_id())?;
        let count = segment.read_u32(id.offset())?;
        Ok(ListRecord {
            id: id.clone(),
            count,
        })
    }

    /// Reads element `index` of a list.
    pub(crate) fn list_get(
        &self,
        store: &dyn SegmentStore,
        list: &ListRecord,
        index: u32,
    ) -> Result<RecordId> {
        if index >= list.count {
            return Err(Error::corruption(format!(
                "list index {index} out of bounds for {} elements",
                list.count
            )));
        }

        let mut span: u64 = 1;
        while span * (LEVEL_SIZE as u64) < u64::from(list.count) {
            span *= LEVEL_SIZE as u64;
        }

        let mut segment = store.read_segment(list.id.segment_id())?;
        let mut ids_offset = list.id.offset() + 4;
        let mut index = u64::from(index);

        loop {
            if span == 1 {
                return self.record_ref(store, &segment, ids_offset + (index as u32) * 18);
            }
            let child = index / span;
            let bucket = self.record_ref(store, &segment, ids_offset + (child as u32) * 18)?;
            segment = store.read_segment(bucket.segment_id())?;
            ids_offset = bucket.offset();
            index %= span;
            span /= LEVEL_SIZE as u64;
        }
    }

    /// Reads all elements of a list in order.
    pub(crate) fn list_ids(
        &self,
        store: &dyn SegmentStore,
        list: &ListRecord,
    ) -> Result<Vec<RecordId>> {
        let mut ids = Vec::with_capacity(list.count as usize);
        for index in 0..list.count {
            ids.push(self.list_get(store, list, index)?);
        }
        Ok(ids)
    }

    /// Opens a map record for reading.
    pub fn map(&self, store: &dyn SegmentStore, id: &RecordId) -> Result<MapRecord> {
        let segment = store.read_segment(id.segment_id())?;
        let head = segment.read_u32(id.offset())?;
        Ok(MapRecord::new(id.clone(), head & super::map::SIZE_MASK))
    }

    /// Reads a template record.
    pub fn read_template(
        &self,
        store: &dyn SegmentStore,
        id: &RecordId,
    ) -> Result<Arc<Template>> {
        if let Some(cached) = self.templates.lock().get(id) {
            return Ok(cached);
        }

        let segment = store.read_segment(id.segment_id())?;
        let offset = id.offset();
        let head = segment.read_u32(offset)?;
        let property_count = (head & 0x3FFFF) as usize;
        let mixin_count = ((head >> MIXIN_COUNT_SHIFT) & 0x3FF) as usize;
        let mut cursor = offset + 4;

        let primary_type = if head & HEAD_PRIMARY != 0 {
            let name = self.record_ref(store, &segment, cursor)?;
            cursor += 18;
            Some(self.read_string(store, &name)?)
        } else {
            None
        };

        let mut mixin_types = Vec::with_capacity(mixin_count);
        if head & HEAD_MIXINS != 0 {
            for _ in 0..mixin_count {
                let name = self.record_ref(store, &segment, cursor)?;
                cursor += 18;
                mixin_types.push(self.read_string(store, &name)?);
            }
        }

        let child_name = if head & HEAD_ZERO_CHILDREN != 0 {
            ChildName::Zero
        } else if head & HEAD_MANY_CHILDREN != 0 {
            ChildName::Many
        } else {
            let name = self.record_ref(store, &segment, cursor)?;
            cursor += 18;
            ChildName::One(self.read_string(store, &name)?)
        };

        let mut properties = Vec::with_capacity(property_count);
        for _ in 0..property_count {
            let name = self.record_ref(store, &segment, cursor)?;
            cursor += 18;
            let type_byte = segment.read_u8(cursor)?;
            cursor += 1;
            let (ty, multiple) = decode_type(type_byte).ok_or_else(|| {
                Error::corruption(format!("invalid property type byte {type_byte:#04x}"))
            })?;
            properties.push(crate::record::PropertyTemplate {
                name: self.read_string(store, &name)?,
                ty,
                multiple,
            });
        }

        let template = Arc::new(Template {
            primary_type,
            mixin_types,
            child_name,
            properties,
        });
        self.templates.lock().insert(id.clone(), Arc::clone(&template));
        Ok(template)
    }

    /// Reads a node record.
    pub(crate) fn read_node(
        &self,
        store: &dyn SegmentStore,
        id: &RecordId,
    ) -> Result<NodeRecord> {
        let segment = store.read_segment(id.segment_id())?;
        let offset = id.offset();

        let template_id = self.record_ref(store, &segment, offset)?;
        let template = self.read_template(store, &template_id)?;
        let mut cursor = offset + 18;

        let child = match template.child_name {
            ChildName::Zero => ChildSlot::Zero,
            ChildName::One(_) => {
                let child = self.record_ref(store, &segment, cursor)?;
                cursor += 18;
                ChildSlot::One(child)
            }
            ChildName::Many => {
                let map = self.record_ref(store, &segment, cursor)?;
                cursor += 18;
                ChildSlot::Map(map)
            }
        };

        let mut property_values = Vec::with_capacity(template.properties.len());
        for _ in 0..template.properties.len() {
            property_values.push(self.record_ref(store, &segment, cursor)?);
            cursor += 18;
        }

        Ok(NodeRecord {
            template,
            child,
            property_values,
        })
    }

    /// Reads a property value of the given type and multiplicity.
    pub(crate) fn read_property(
        &self,
        store: &dyn SegmentStore,
        value_id: &RecordId,
        ty: Type,
        multiple: bool,
    ) -> Result<Value> {
        if !multiple {
            return Ok(Value::Single(self.read_scalar(store, value_id, ty)?));
        }

        let segment = store.read_segment(value_id.segment_id())?;
        let count = segment.read_u32(value_id.offset())?;
        if count == 0 {
            return Ok(Value::Multi(ty, Vec::new()));
        }

        let list_id = self.record_ref(store, &segment, value_id.offset() + 4)?;
        let list = self.read_list_at(store, &list_id)?;
        let mut scalars = Vec::with_capacity(count as usize);
        for index in 0..count {
            let element = self.list_get(store, &list, index)?;
            scalars.push(self.read_scalar(store, &element, ty)?);
        }
        Ok(Value::Multi(ty, scalars))
    }

    fn read_scalar(
        &self,
        store: &dyn SegmentStore,
        id: &RecordId,
        ty: Type,
    ) -> Result<Scalar> {
        match ty {
            Type::String => Ok(Scalar::String(self.read_string(store, id)?)),
            Type::Binary => Ok(Scalar::Binary(self.read_blob(store, id)?)),
            Type::Long => {
                let bytes = self.read_value_bytes(store, id)?;
                let bytes: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::corruption("long value is not 8 bytes"))?;
                Ok(Scalar::Long(i64::from_be_bytes(bytes)))
            }
            Type::Double => {
                let bytes = self.read_value_bytes(store, id)?;
                let bytes: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::corruption("double value is not 8 bytes"))?;
                Ok(Scalar::Double(f64::from_bits(u64::from_be_bytes(bytes))))
            }
            Type::Boolean => {
                let bytes = self.read_value_bytes(store, id)?;
                match bytes.as_slice() {
                    [0] => Ok(Scalar::Boolean(false)),
                    [1] => Ok(Scalar::Boolean(true)),
                    _ => Err(Error::corruption("boolean value is not one byte")),
                }
            }
        }
    }
}

impl Default for RecordReader {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RecordReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordReader").finish_non_exhaustive()
    }
}
