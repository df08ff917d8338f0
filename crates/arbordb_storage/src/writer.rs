//! Archive writer.

use crate::entry::{
    entry_name, padded, write_header, EntryId, BINARY_REFERENCES_NAME, BLOCK_SIZE, GRAPH_NAME,
    INDEX_NAME,
};
use crate::error::StorageResult;
use crate::graph::{encode_binary_references, encode_graph, BinaryReferences, SegmentGraph};
use crate::index::{encode_index, IndexEntry};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Appends segment entries to a new archive file.
///
/// The writer keeps the offset index, the segment graph and the binary
/// reference table in memory and persists them as footer entries when the
/// archive is sealed. A sealed archive is immutable; further writes fail
/// with [`StorageError::Sealed`].
///
/// Entries written but not yet sealed can be read back through
/// [`ArchiveWriter::read`], which is how the store serves segments that
/// still live in the current write file.
pub struct ArchiveWriter {
    path: PathBuf,
    file: File,
    /// Current file length; the next entry header goes here.
    offset: u64,
    index: Vec<IndexEntry>,
    lookup: HashMap<EntryId, usize>,
    graph: SegmentGraph,
    binary_refs: BinaryReferences,
}

impl ArchiveWriter {
    /// Creates a new, empty archive file.
    pub fn create(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self {
            path,
            file,
            offset: 0,
            index: Vec::new(),
            lookup: HashMap::new(),
            graph: SegmentGraph::new(),
            binary_refs: BinaryReferences::new(),
        })
    }

    /// Returns the path of the archive file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a segment entry.
    ///
    /// `references` lists the segment ids referenced by this segment (data
    /// segments only; bulk segments reference nothing) and feeds the graph
    /// footer. `binary_references` lists external blob ids introduced by
    /// this segment and feeds the binary references footer.
    ///
    /// Returns the archive size after the write, which the caller uses to
    /// decide when to roll over to a new file.
    pub fn write_entry(
        &mut self,
        id: EntryId,
        generation: u32,
        data: &[u8],
        references: &[EntryId],
        binary_references: &[String],
    ) -> StorageResult<u64> {
        let header = write_header(&entry_name(id, generation), data.len())?;
        self.file.write_all(&header)?;
        self.file.write_all(data)?;
        let padding = padded(data.len()) - data.len();
        if padding > 0 {
            self.file.write_all(&vec![0u8; padding])?;
        }

        let entry = IndexEntry {
            id,
            offset: (self.offset + BLOCK_SIZE as u64) as u32,
            size: data.len() as u32,
            generation,
        };
        self.lookup.insert(id, self.index.len());
        self.index.push(entry);
        self.offset += (BLOCK_SIZE + padded(data.len())) as u64;

        if !references.is_empty() {
            self.graph.insert(id, references.to_vec());
        }
        if !binary_references.is_empty() {
            let refs = self.binary_refs.entry(generation).or_default();
            for reference in binary_references {
                refs.insert(reference.clone());
            }
        }

        Ok(self.offset)
    }

    /// Checks whether the archive contains a segment.
    #[must_use]
    pub fn contains(&self, id: EntryId) -> bool {
        self.lookup.contains_key(&id)
    }

    /// Reads back a segment written to this archive.
    ///
    /// Returns `None` if the segment is not in this file.
    pub fn read(&mut self, id: EntryId) -> StorageResult<Option<Vec<u8>>> {
        let Some(&slot) = self.lookup.get(&id) else {
            return Ok(None);
        };
        let entry = self.index[slot];

        self.file.seek(SeekFrom::Start(u64::from(entry.offset)))?;
        let mut data = vec![0u8; entry.size as usize];
        self.file.read_exact(&mut data)?;
        self.file.seek(SeekFrom::Start(self.offset))?;
        Ok(Some(data))
    }

    /// Returns the number of entries written so far.
    #[must_use]
    pub fn count(&self) -> usize {
        self.index.len()
    }

    /// Returns the current archive size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.offset
    }

    /// Returns true once at least one entry has been written.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        !self.index.is_empty()
    }

    /// Returns the ids of all entries written so far.
    pub fn ids(&self) -> impl Iterator<Item = EntryId> + '_ {
        self.index.iter().map(|entry| entry.id)
    }

    /// Returns the index entries written so far.
    #[must_use]
    pub fn entries(&self) -> &[IndexEntry] {
        &self.index
    }

    /// Returns the in-memory segment graph of this archive.
    #[must_use]
    pub fn graph(&self) -> &SegmentGraph {
        &self.graph
    }

    /// Forces written entries to durable storage.
    pub fn sync(&mut self) -> StorageResult<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Replaces the binary reference table wholesale.
    ///
    /// Used when rewriting an archive during a sweep.
    pub(crate) fn set_binary_references(&mut self, refs: BinaryReferences) {
        self.binary_refs = refs;
    }

    /// Seals the archive: writes the binary references, graph and index
    /// footers, the end-of-archive marker, and syncs the file.
    ///
    /// Sealing consumes the writer; a sealed archive is immutable.
    pub fn seal(mut self) -> StorageResult<()> {
        self.write_footer(BINARY_REFERENCES_NAME, &encode_binary_references(&self.binary_refs))?;
        self.write_footer(GRAPH_NAME, &encode_graph(&self.graph))?;
        let mut index = std::mem::take(&mut self.index);
        self.write_footer(INDEX_NAME, &encode_index(&mut index))?;

        // End-of-archive marker.
        self.file.write_all(&[0u8; 2 * BLOCK_SIZE])?;
        self.file.sync_all()?;
        Ok(())
    }

    fn write_footer(&mut self, name: &str, payload: &[u8]) -> StorageResult<()> {
        let header = write_header(name, payload.len())?;
        self.file.write_all(&header)?;
        self.file.write_all(payload)?;
        self.offset += (BLOCK_SIZE + payload.len()) as u64;
        Ok(())
    }
}

impl std::fmt::Debug for ArchiveWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveWriter")
            .field("path", &self.path)
            .field("entries", &self.index.len())
            .field("size", &self.offset)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_and_read_back() {
        let dir = tempdir().unwrap();
        let mut writer = ArchiveWriter::create(dir.path().join("data00000a.tar")).unwrap();

        let id = EntryId::new(1, 0xA000_0000_0000_0001);
        writer.write_entry(id, 0, b"hello segment", &[], &[]).unwrap();

        assert!(writer.contains(id));
        assert!(!writer.contains(EntryId::new(9, 9)));
        assert_eq!(writer.read(id).unwrap().unwrap(), b"hello segment");
        assert_eq!(writer.count(), 1);
    }

    #[test]
    fn size_accounts_for_padding() {
        let dir = tempdir().unwrap();
        let mut writer = ArchiveWriter::create(dir.path().join("data00000a.tar")).unwrap();

        let size = writer
            .write_entry(EntryId::new(1, 1), 0, &[7u8; 100], &[], &[])
            .unwrap();
        // Header block plus one padded payload block.
        assert_eq!(size, 1024);
    }

    #[test]
    fn sealed_archive_is_block_aligned() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data00000a.tar");
        let mut writer = ArchiveWriter::create(&path).unwrap();
        writer
            .write_entry(EntryId::new(1, 1), 0, b"x", &[], &[])
            .unwrap();
        writer.seal().unwrap();

        let len = std::fs::metadata(&path).unwrap().len();
        // Entry, three footers, end-of-archive marker, all block-aligned.
        assert_eq!(len % BLOCK_SIZE as u64, 0);
    }

    #[test]
    fn append_after_read_back() {
        let dir = tempdir().unwrap();
        let mut writer = ArchiveWriter::create(dir.path().join("data00000a.tar")).unwrap();

        writer
            .write_entry(EntryId::new(1, 1), 0, b"first", &[], &[])
            .unwrap();
        writer.read(EntryId::new(1, 1)).unwrap().unwrap();
        writer
            .write_entry(EntryId::new(2, 2), 0, b"second", &[], &[])
            .unwrap();

        assert_eq!(writer.read(EntryId::new(2, 2)).unwrap().unwrap(), b"second");
    }
}
