//! The buffered segment writer.

use crate::error::{Error, Result};
use crate::record::{RecordId, RecordType};
use crate::segment::data::{header_size, pack_offset};
use crate::segment::{SegmentId, ALIGN, MAX_SEGMENT_SIZE, SEGMENT_MAGIC};
use crate::store::SegmentStore;
use std::collections::{BTreeMap, HashSet};

/// Builds one segment at a time in memory.
///
/// Records are allocated from the tail of the segment's virtual address
/// space downwards, each start offset 16-byte aligned. When the next record
/// would not fit alongside the header tables, the buffer is flushed as a
/// finished segment to the store and the writer resets onto a fresh
/// segment id.
///
/// A writer belongs to exactly one thread at a time; the
/// [`WriterPool`](crate::segment::WriterPool) enforces this by handing
/// writers out by value.
pub struct SegmentBufferWriter {
    id: SegmentId,
    purpose: String,
    generation: u32,
    version: u8,
    buffer: Vec<u8>,
    /// Virtual offset of the lowest written byte.
    position: u32,
    references: Vec<SegmentId>,
    reference_set: HashSet<(u64, u64)>,
    roots: BTreeMap<u32, RecordType>,
    binary_references: Vec<String>,
}

impl SegmentBufferWriter {
    /// Creates a writer for the given purpose and generation.
    #[must_use]
    pub fn new(store: &dyn SegmentStore, purpose: &str, generation: u32, version: u8) -> Self {
        Self {
            id: store.tracker().new_data_id(),
            purpose: purpose.to_string(),
            generation,
            version,
            buffer: vec![0u8; MAX_SEGMENT_SIZE],
            position: MAX_SEGMENT_SIZE as u32,
            references: Vec::new(),
            reference_set: HashSet::new(),
            roots: BTreeMap::new(),
            binary_references: Vec::new(),
        }
    }

    /// Returns the writer's purpose tag.
    #[must_use]
    pub fn purpose(&self) -> &str {
        &self.purpose
    }

    /// Returns the GC generation stamped on segments from this writer.
    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Returns true once the current buffer holds at least one record.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        (self.position as usize) < MAX_SEGMENT_SIZE
    }

    /// Registers an external blob reference introduced by the record being
    /// written.
    pub fn add_binary_reference(&mut self, reference: &str) {
        self.binary_references.push(reference.to_string());
    }

    /// Writes one record and returns its id.
    ///
    /// `referenced` lists every record id embedded in `bytes`; it keeps the
    /// segment's reference table complete and demotes referenced same-
    /// segment records from the root table.
    pub fn write_record(
        &mut self,
        store: &dyn SegmentStore,
        ty: RecordType,
        bytes: &[u8],
        referenced: &[RecordId],
    ) -> Result<RecordId> {
        // Count reference-table growth before checking the fit.
        let mut new_references = 0;
        for id in referenced {
            let segment = id.segment_id();
            if segment != &self.id && !self.reference_set.contains(&(segment.msb(), segment.lsb()))
            {
                new_references += 1;
            }
        }

        // Even a fresh segment could not hold this record.
        if header_size(referenced.len(), 1) + bytes.len() + ALIGN > MAX_SEGMENT_SIZE {
            return Err(Error::corruption(format!(
                "record of {} bytes does not fit in a segment",
                bytes.len()
            )));
        }

        let header = header_size(
            self.references.len() + new_references,
            self.roots.len() + 1,
        );
        if !self.fits(header, bytes.len()) {
            self.flush(store)?;
        }

        let offset = (self.position as usize - bytes.len()) & !(ALIGN - 1);
        let physical = self.buffer.len() - (MAX_SEGMENT_SIZE - offset);
        self.buffer[physical..physical + bytes.len()].copy_from_slice(bytes);
        self.position = offset as u32;

        let offset = offset as u32;
        self.roots.insert(offset, ty);
        for id in referenced {
            self.reference(id);
        }
        Ok(RecordId::new(self.id.clone(), offset))
    }

    fn fits(&self, header: usize, record: usize) -> bool {
        let payload = MAX_SEGMENT_SIZE - self.position as usize;
        header + payload + record + ALIGN <= MAX_SEGMENT_SIZE
    }

    fn reference(&mut self, id: &RecordId) {
        let segment = id.segment_id();
        if segment == &self.id {
            // An internal reference: the target is no longer a root.
            self.roots.remove(&id.offset());
            return;
        }
        if self.reference_set.insert((segment.msb(), segment.lsb())) {
            self.references.push(segment.clone());
        }
    }

    /// Flushes the buffer as a finished segment and resets the writer onto
    /// a fresh segment id. A clean buffer is a no-op.
    pub fn flush(&mut self, store: &dyn SegmentStore) -> Result<()> {
        if !self.is_dirty() {
            return Ok(());
        }

        let payload_start = self.buffer.len() - (MAX_SEGMENT_SIZE - self.position as usize);
        let mut data = Vec::with_capacity(
            header_size(self.references.len(), self.roots.len()) + self.buffer.len()
                - payload_start,
        );

        data.extend_from_slice(&SEGMENT_MAGIC);
        data.push(self.version);
        data.extend_from_slice(&self.generation.to_be_bytes());
        data.extend_from_slice(&(self.references.len() as u32).to_be_bytes());
        data.extend_from_slice(&(self.roots.len() as u32).to_be_bytes());
        for reference in &self.references {
            data.extend_from_slice(&reference.msb().to_be_bytes());
            data.extend_from_slice(&reference.lsb().to_be_bytes());
        }
        for (&offset, &ty) in &self.roots {
            data.push(ty as u8);
            data.push(0);
            data.extend_from_slice(&pack_offset(offset).to_be_bytes());
        }
        data.extend_from_slice(&self.buffer[payload_start..]);

        store.write_segment(&self.id, &data, &self.binary_references)?;

        self.id = store.tracker().new_data_id();
        self.position = MAX_SEGMENT_SIZE as u32;
        self.references.clear();
        self.reference_set.clear();
        self.roots.clear();
        self.binary_references.clear();
        Ok(())
    }
}

impl std::fmt::Debug for SegmentBufferWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentBufferWriter")
            .field("purpose", &self.purpose)
            .field("generation", &self.generation)
            .field("buffered", &(MAX_SEGMENT_SIZE - self.position as usize))
            .finish()
    }
}
