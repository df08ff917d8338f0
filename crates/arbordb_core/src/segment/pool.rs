//! Pool of buffered segment writers.

use crate::error::Result;
use crate::segment::SegmentBufferWriter;
use crate::store::SegmentStore;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::thread::ThreadId;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    purpose: String,
    generation: u32,
    thread: ThreadId,
}

/// Hands out one buffered segment writer per
/// `(purpose, generation, thread)` tuple.
///
/// Writing is serialized per writer but parallel across writers: a writer
/// is removed from the pool while borrowed, so no two threads ever share
/// one, and distinct purposes ("sys" commits, "init" bootstrap, "c"
/// compaction) never share buffers either.
pub struct WriterPool {
    version: u8,
    writers: Mutex<HashMap<PoolKey, SegmentBufferWriter>>,
}

impl WriterPool {
    /// Creates a pool producing segments of the given format version.
    #[must_use]
    pub fn new(version: u8) -> Self {
        Self {
            version,
            writers: Mutex::new(HashMap::new()),
        }
    }

    /// Borrows the calling thread's writer for a purpose and generation,
    /// creating it on first use.
    #[must_use]
    pub fn borrow(
        &self,
        store: &dyn SegmentStore,
        purpose: &str,
        generation: u32,
    ) -> SegmentBufferWriter {
        let key = PoolKey {
            purpose: purpose.to_string(),
            generation,
            thread: std::thread::current().id(),
        };
        self.writers
            .lock()
            .remove(&key)
            .unwrap_or_else(|| SegmentBufferWriter::new(store, purpose, generation, self.version))
    }

    /// Returns a borrowed writer to the pool.
    pub fn give_back(&self, writer: SegmentBufferWriter) {
        let key = PoolKey {
            purpose: writer.purpose().to_string(),
            generation: writer.generation(),
            thread: std::thread::current().id(),
        };
        self.writers.lock().insert(key, writer);
    }

    /// Seals every pooled buffer into the store.
    ///
    /// Writers currently borrowed are flushed by their borrowers when the
    /// enclosing operation completes.
    pub fn flush(&self, store: &dyn SegmentStore) -> Result<()> {
        let writers: Vec<SegmentBufferWriter> = {
            let mut pooled = self.writers.lock();
            pooled.drain().map(|(_, writer)| writer).collect()
        };
        for mut writer in writers {
            writer.flush(store)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for WriterPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterPool")
            .field("pooled", &self.writers.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordType;
    use crate::segment::SEGMENT_VERSION;
    use crate::store::MemoryStore;

    #[test]
    fn borrow_creates_then_reuses() {
        let store = MemoryStore::new();
        let pool = WriterPool::new(SEGMENT_VERSION);

        let mut writer = pool.borrow(&store, "sys", 0);
        let id = writer
            .write_record(&store, RecordType::Block, &[1u8; 8], &[])
            .unwrap();
        pool.give_back(writer);

        // The same thread gets the same buffer back.
        let writer = pool.borrow(&store, "sys", 0);
        assert!(writer.is_dirty());
        pool.give_back(writer);
        drop(id);
    }

    #[test]
    fn purposes_do_not_share_writers() {
        let store = MemoryStore::new();
        let pool = WriterPool::new(SEGMENT_VERSION);

        let mut sys = pool.borrow(&store, "sys", 0);
        let compact = pool.borrow(&store, "c", 1);

        sys.write_record(&store, RecordType::Block, &[1u8; 8], &[])
            .unwrap();
        assert!(!compact.is_dirty());

        pool.give_back(sys);
        pool.give_back(compact);
    }

    #[test]
    fn flush_seals_pooled_buffers() {
        let store = MemoryStore::new();
        let pool = WriterPool::new(SEGMENT_VERSION);

        let mut writer = pool.borrow(&store, "sys", 0);
        writer
            .write_record(&store, RecordType::Block, &[1u8; 8], &[])
            .unwrap();
        pool.give_back(writer);

        assert_eq!(store.segment_count(), 0);
        pool.flush(&store).unwrap();
        assert_eq!(store.segment_count(), 1);
    }
}
