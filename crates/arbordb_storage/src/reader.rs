//! Archive reader.

use crate::entry::{padded, parse_entry_name, parse_header, EntryId, BLOCK_SIZE};
use crate::error::{StorageError, StorageResult};
use crate::graph::{
    decode_binary_references, decode_graph, BinaryReferences, SegmentGraph,
    BINARY_REFERENCES_MAGIC, GRAPH_MAGIC,
};
use crate::index::{decode_index, read_trailer, IndexEntry, INDEX_MAGIC, TRAILER_SIZE};
use crate::writer::ArchiveWriter;
use memmap2::Mmap;
use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::warn;

/// Extracts segment metadata from raw segment payloads.
///
/// The archive layer stores segment references in the graph footer but does
/// not understand segment payloads itself. When a recovered archive (one
/// whose footers were lost to a crash) is swept, the replacement graph is
/// rebuilt by handing each retained payload to this callback.
pub trait SegmentMetaParser: Sync {
    /// Returns the segment ids referenced by the given segment payload.
    fn references(&self, id: EntryId, data: &[u8]) -> Vec<EntryId>;
}

/// Outcome of sweeping an archive.
pub enum Sweep {
    /// Too little to reclaim; the archive is kept as is.
    Kept,
    /// Every entry was reclaimed; the archive file can be deleted.
    Emptied,
    /// Retained entries were copied into a replacement archive.
    Rewritten(ArchiveReader),
}

/// Read access to one archive file.
///
/// Opening a sealed archive loads the index, graph and binary-reference
/// footers. Opening an unsealed archive (the most recent write file after a
/// crash) recovers the index by scanning entries forward and stopping at the
/// first incomplete or corrupt entry; partial tail entries are expected and
/// are silently dropped.
///
/// A reader can be [`closed`](ArchiveReader::close) by a concurrent cleanup
/// swap; reads then fail with [`StorageError::Closed`] and the store retries
/// against its fresh reader list.
pub struct ArchiveReader {
    path: PathBuf,
    file: Mutex<File>,
    mmap: Option<Mmap>,
    /// Sorted by id for binary search.
    index: Vec<IndexEntry>,
    graph: Option<SegmentGraph>,
    binary_refs: BinaryReferences,
    file_size: u64,
    closed: AtomicBool,
}

impl ArchiveReader {
    /// Opens an archive file, recovering the index if the footers are
    /// missing or damaged.
    pub fn open(path: impl AsRef<Path>, memory_mapping: bool) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let file_size = file.metadata()?.len();

        let mmap = if memory_mapping {
            Some(Self::map(&file)?)
        } else {
            None
        };

        let mut reader = Self {
            path,
            file: Mutex::new(file),
            mmap,
            index: Vec::new(),
            graph: None,
            binary_refs: BinaryReferences::new(),
            file_size,
            closed: AtomicBool::new(false),
        };

        match reader.load_footers() {
            Ok(()) => Ok(reader),
            Err(err) => {
                warn!(
                    path = %reader.path.display(),
                    error = %err,
                    "archive footers unreadable, recovering by forward scan"
                );
                reader.recover()?;
                Ok(reader)
            }
        }
    }

    #[allow(unsafe_code)]
    fn map(file: &File) -> StorageResult<Mmap> {
        // SAFETY: archive files are append-only and never truncated or
        // rewritten in place while a reader exists; replacement files are
        // written under a fresh name.
        let mmap = unsafe { Mmap::map(file)? };
        Ok(mmap)
    }

    /// Loads the index, graph and binary references footers from a sealed
    /// archive.
    fn load_footers(&mut self) -> StorageResult<()> {
        let len = self.file_size;
        let eof_marker = 2 * BLOCK_SIZE as u64;
        if len < eof_marker + BLOCK_SIZE as u64 + TRAILER_SIZE as u64 {
            return Err(StorageError::corruption("archive too short for footers"));
        }

        // Index trailer sits at the end of the last payload block before the
        // end-of-archive marker.
        let index_end = len - eof_marker;
        let trailer = self.read_at(index_end - TRAILER_SIZE as u64, TRAILER_SIZE)?;
        let (_, _, content_size) = read_trailer(&trailer, INDEX_MAGIC)?;
        let payload_size = padded(content_size + TRAILER_SIZE) as u64;
        if index_end < payload_size + BLOCK_SIZE as u64 {
            return Err(StorageError::corruption("index payload out of bounds"));
        }
        let payload = self.read_at(index_end - payload_size, payload_size as usize)?;
        let index = decode_index(&payload)?;

        for entry in &index {
            let end = u64::from(entry.offset) + u64::from(entry.size);
            if u64::from(entry.offset) < BLOCK_SIZE as u64 || end > len {
                return Err(StorageError::corruption("index entry out of bounds"));
            }
        }

        // The graph payload ends directly before the index header block, the
        // binary references payload directly before the graph header block.
        let index_header = index_end - payload_size - BLOCK_SIZE as u64;
        let (graph_payload, graph_header) = self.read_footer_before(index_header, GRAPH_MAGIC)?;
        let graph = decode_graph(&graph_payload)?;
        let (refs_payload, _) = self.read_footer_before(graph_header, BINARY_REFERENCES_MAGIC)?;
        let binary_refs = decode_binary_references(&refs_payload)?;

        self.index = index;
        self.graph = Some(graph);
        self.binary_refs = binary_refs;
        Ok(())
    }

    /// Reads the footer payload that ends at `end`, returning the payload
    /// and the offset of its header block.
    fn read_footer_before(&self, end: u64, magic: u32) -> StorageResult<(Vec<u8>, u64)> {
        if end < TRAILER_SIZE as u64 {
            return Err(StorageError::corruption("footer out of bounds"));
        }
        let trailer = self.read_at(end - TRAILER_SIZE as u64, TRAILER_SIZE)?;
        let (_, _, content_size) = read_trailer(&trailer, magic)?;
        let payload_size = padded(content_size + TRAILER_SIZE) as u64;
        if end < payload_size + BLOCK_SIZE as u64 {
            return Err(StorageError::corruption("footer payload out of bounds"));
        }
        let payload = self.read_at(end - payload_size, payload_size as usize)?;
        Ok((payload, end - payload_size - BLOCK_SIZE as u64))
    }

    /// Rebuilds the index by scanning entries from the start of the file.
    ///
    /// Stops at the end-of-archive marker, at the first footer entry, or at
    /// the first truncated or corrupt entry, whichever comes first. The
    /// entries scanned so far form the recovered index.
    fn recover(&mut self) -> StorageResult<()> {
        let mut index = Vec::new();
        let mut offset = 0u64;

        while offset + BLOCK_SIZE as u64 <= self.file_size {
            let block = self.read_at(offset, BLOCK_SIZE)?;
            let header = match parse_header(&block) {
                Ok(Some(header)) => header,
                // End-of-archive marker or a torn header: stop scanning.
                Ok(None) | Err(_) => break,
            };

            let Some((id, generation)) = parse_entry_name(&header.name) else {
                // Footer entry of a partially sealed archive.
                break;
            };

            let data_end = offset + BLOCK_SIZE as u64 + padded(header.size) as u64;
            if data_end > self.file_size {
                // Torn tail write.
                break;
            }

            index.push(IndexEntry {
                id,
                offset: (offset + BLOCK_SIZE as u64) as u32,
                size: header.size as u32,
                generation,
            });
            offset = data_end;
        }

        warn!(
            path = %self.path.display(),
            entries = index.len(),
            "recovered unsealed archive"
        );
        index.sort_by_key(|entry| entry.id);
        self.index = index;
        self.graph = None;
        self.binary_refs = BinaryReferences::new();
        Ok(())
    }

    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        if let Some(mmap) = &self.mmap {
            let start = offset as usize;
            let end = start + len;
            if end > mmap.len() {
                return Err(StorageError::corruption("read past end of archive"));
            }
            return Ok(mmap[start..end].to_vec());
        }

        let mut file = self.file.lock().expect("archive file lock poisoned");
        file.seek(SeekFrom::Start(offset))?;
        let mut data = vec![0u8; len];
        file.read_exact(&mut data)?;
        Ok(data)
    }

    /// Returns the path of the archive file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the archive size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.file_size
    }

    /// Returns the number of segments in the archive.
    #[must_use]
    pub fn count(&self) -> usize {
        self.index.len()
    }

    /// Returns the index entries, sorted by segment id.
    #[must_use]
    pub fn entries(&self) -> &[IndexEntry] {
        &self.index
    }

    /// Returns the ids of all segments in the archive.
    pub fn ids(&self) -> impl Iterator<Item = EntryId> + '_ {
        self.index.iter().map(|entry| entry.id)
    }

    /// Checks whether the archive contains a segment.
    #[must_use]
    pub fn contains(&self, id: EntryId) -> bool {
        self.index.binary_search_by_key(&id, |e| e.id).is_ok()
    }

    /// Returns the GC generation recorded for a segment.
    #[must_use]
    pub fn generation(&self, id: EntryId) -> Option<u32> {
        self.index
            .binary_search_by_key(&id, |e| e.id)
            .ok()
            .map(|slot| self.index[slot].generation)
    }

    /// Reads a segment payload.
    ///
    /// Returns `None` if the segment is not in this archive and
    /// [`StorageError::Closed`] if the reader has been closed by a cleanup.
    pub fn read(&self, id: EntryId) -> StorageResult<Option<Vec<u8>>> {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        let Ok(slot) = self.index.binary_search_by_key(&id, |e| e.id) else {
            return Ok(None);
        };
        let entry = self.index[slot];
        let data = self.read_at(u64::from(entry.offset), entry.size as usize)?;
        Ok(Some(data))
    }

    /// Returns the segment graph footer, or `None` for a recovered archive.
    #[must_use]
    pub fn graph(&self) -> Option<&SegmentGraph> {
        self.graph.as_ref()
    }

    /// Returns the binary references footer, grouped by generation.
    #[must_use]
    pub fn binary_references(&self) -> &BinaryReferences {
        &self.binary_refs
    }

    /// Marks the reader closed. Subsequent reads fail with
    /// [`StorageError::Closed`]; any mapped region stays valid until the
    /// reader is dropped.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Checks whether the reader has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Sweeps the archive, dropping the segments in `reclaim`.
    ///
    /// If fewer than `threshold_pct` percent of the payload bytes would be
    /// reclaimed the file is kept untouched. Otherwise the retained entries
    /// are copied into a replacement archive at `target` (conventionally the
    /// same index with the next generation letter) and a reader over the
    /// replacement is returned. `parser` recomputes segment references when
    /// this archive has no graph footer.
    pub fn sweep(
        &self,
        reclaim: &HashSet<EntryId>,
        threshold_pct: u8,
        target: &Path,
        parser: &dyn SegmentMetaParser,
    ) -> StorageResult<Sweep> {
        let total: u64 = self.index.iter().map(|e| u64::from(e.size)).sum();
        let reclaimed: u64 = self
            .index
            .iter()
            .filter(|e| reclaim.contains(&e.id))
            .map(|e| u64::from(e.size))
            .sum();

        if reclaimed == total && total > 0 {
            return Ok(Sweep::Emptied);
        }
        if total == 0 || reclaimed * 100 < u64::from(threshold_pct) * total {
            return Ok(Sweep::Kept);
        }

        // Copy retained entries in file order.
        let mut retained: Vec<IndexEntry> = self
            .index
            .iter()
            .filter(|e| !reclaim.contains(&e.id))
            .copied()
            .collect();
        retained.sort_by_key(|e| e.offset);

        let mut writer = ArchiveWriter::create(target)?;
        let mut generations = HashSet::new();
        for entry in &retained {
            let data = self.read_at(u64::from(entry.offset), entry.size as usize)?;
            let references = match &self.graph {
                Some(graph) => graph.get(&entry.id).cloned().unwrap_or_default(),
                None => parser.references(entry.id, &data),
            };
            let references: Vec<EntryId> = references
                .into_iter()
                .filter(|referenced| !reclaim.contains(referenced))
                .collect();
            writer.write_entry(entry.id, entry.generation, &data, &references, &[])?;
            generations.insert(entry.generation);
        }

        // Binary references survive for the generations still present.
        let refs: BinaryReferences = self
            .binary_refs
            .iter()
            .filter(|(generation, _)| generations.contains(*generation))
            .map(|(generation, ids)| (*generation, ids.clone()))
            .collect();
        writer.set_binary_references(refs);
        writer.seal()?;

        let reader = ArchiveReader::open(target, self.mmap.is_some())?;
        Ok(Sweep::Rewritten(reader))
    }
}

impl std::fmt::Debug for ArchiveReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveReader")
            .field("path", &self.path)
            .field("entries", &self.index.len())
            .field("size", &self.file_size)
            .field("sealed", &self.graph.is_some())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::tempdir;

    struct NoRefs;

    impl SegmentMetaParser for NoRefs {
        fn references(&self, _id: EntryId, _data: &[u8]) -> Vec<EntryId> {
            Vec::new()
        }
    }

    fn data_id(n: u64) -> EntryId {
        EntryId::new(n, 0xA000_0000_0000_0000 | n)
    }

    fn write_archive(path: &Path, count: u64, seal: bool) {
        let mut writer = ArchiveWriter::create(path).unwrap();
        for n in 1..=count {
            let payload = vec![n as u8; 64 * n as usize];
            let references = if n > 1 { vec![data_id(n - 1)] } else { vec![] };
            writer
                .write_entry(data_id(n), n as u32, &payload, &references, &[])
                .unwrap();
        }
        if seal {
            writer.seal().unwrap();
        }
    }

    #[test]
    fn sealed_archive_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data00000a.tar");
        write_archive(&path, 3, true);

        let reader = ArchiveReader::open(&path, false).unwrap();
        assert_eq!(reader.count(), 3);
        assert!(reader.contains(data_id(2)));
        assert_eq!(reader.read(data_id(2)).unwrap().unwrap(), vec![2u8; 128]);
        assert_eq!(reader.generation(data_id(3)), Some(3));

        let graph = reader.graph().unwrap();
        assert_eq!(graph.get(&data_id(2)), Some(&vec![data_id(1)]));
    }

    #[test]
    fn memory_mapped_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data00000a.tar");
        write_archive(&path, 2, true);

        let reader = ArchiveReader::open(&path, true).unwrap();
        assert_eq!(reader.read(data_id(1)).unwrap().unwrap(), vec![1u8; 64]);
    }

    #[test]
    fn unsealed_archive_recovered() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data00000a.tar");
        write_archive(&path, 3, false);

        let reader = ArchiveReader::open(&path, false).unwrap();
        assert_eq!(reader.count(), 3);
        assert!(reader.graph().is_none());
        assert_eq!(reader.read(data_id(3)).unwrap().unwrap(), vec![3u8; 192]);
    }

    #[test]
    fn torn_tail_entry_dropped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data00000a.tar");
        write_archive(&path, 2, false);

        // Append a header that promises more payload than the file holds.
        let file = OpenOptions::new().append(true).open(&path).unwrap();
        let header = crate::entry::write_header(
            &format!("{}.9", data_id(9).as_uuid()),
            4096,
        )
        .unwrap();
        let mut file = file;
        use std::io::Write;
        file.write_all(&header).unwrap();
        file.write_all(&[0xAB; 100]).unwrap();
        drop(file);

        let reader = ArchiveReader::open(&path, false).unwrap();
        assert_eq!(reader.count(), 2);
        assert!(!reader.contains(data_id(9)));
    }

    #[test]
    fn closed_reader_rejects_reads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data00000a.tar");
        write_archive(&path, 1, true);

        let reader = ArchiveReader::open(&path, false).unwrap();
        reader.close();
        assert!(matches!(
            reader.read(data_id(1)),
            Err(StorageError::Closed)
        ));
    }

    #[test]
    fn missing_segment_reads_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data00000a.tar");
        write_archive(&path, 1, true);

        let reader = ArchiveReader::open(&path, false).unwrap();
        assert!(reader.read(data_id(7)).unwrap().is_none());
    }

    #[test]
    fn sweep_below_threshold_keeps_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data00000a.tar");
        write_archive(&path, 3, true);

        let reader = ArchiveReader::open(&path, false).unwrap();
        // Entry 1 is 64 of 384 payload bytes, well under 50%.
        let reclaim: HashSet<EntryId> = [data_id(1)].into();
        let target = dir.path().join("data00000b.tar");
        let sweep = reader.sweep(&reclaim, 50, &target, &NoRefs).unwrap();
        assert!(matches!(sweep, Sweep::Kept));
        assert!(!target.exists());
    }

    #[test]
    fn sweep_rewrites_and_filters_graph() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data00000a.tar");
        write_archive(&path, 3, true);

        let reader = ArchiveReader::open(&path, false).unwrap();
        // Entry 3 is 192 of 384 payload bytes.
        let reclaim: HashSet<EntryId> = [data_id(3)].into();
        let target = dir.path().join("data00000b.tar");
        let sweep = reader.sweep(&reclaim, 25, &target, &NoRefs).unwrap();

        let Sweep::Rewritten(rewritten) = sweep else {
            panic!("expected a rewrite");
        };
        assert_eq!(rewritten.count(), 2);
        assert!(rewritten.contains(data_id(1)));
        assert!(!rewritten.contains(data_id(3)));
        assert_eq!(
            rewritten.graph().unwrap().get(&data_id(2)),
            Some(&vec![data_id(1)])
        );
    }

    #[test]
    fn sweep_of_everything_empties_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data00000a.tar");
        write_archive(&path, 2, true);

        let reader = ArchiveReader::open(&path, false).unwrap();
        let reclaim: HashSet<EntryId> = [data_id(1), data_id(2)].into();
        let target = dir.path().join("data00000b.tar");
        let sweep = reader.sweep(&reclaim, 25, &target, &NoRefs).unwrap();
        assert!(matches!(sweep, Sweep::Emptied));
    }
}
