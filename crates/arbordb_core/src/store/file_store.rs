//! The file store: archive files, journal, lock file, head.

use crate::cache::SegmentCache;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::journal::{self, JournalReader, JournalWriter, JOURNAL_FILE_NAME};
use crate::node::NodeBuilder;
use crate::record::{RecordId, RecordReader, SegmentWriter};
use crate::segment::{Segment, SegmentId, WriterPool};
use crate::store::monitor::{GcMonitor, LoggingMonitor};
use crate::store::scheduler::{TaskRunner, TaskSignal};
use crate::store::SegmentStore;
use crate::tracker::SegmentTracker;
use arbordb_storage::{ArchiveReader, ArchiveWriter, EntryId};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Conventional file name of the lock file.
pub const LOCK_FILE_NAME: &str = "repo.lock";

/// Interval of the background flush.
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Interval of the disk-space probe.
const DISK_SPACE_INTERVAL: Duration = Duration::from_secs(60);

/// Name of the child node holding the user-visible root.
pub(crate) const ROOT_NODE: &str = "root";

/// Name of the child node holding checkpoints.
pub(crate) const CHECKPOINTS_NODE: &str = "checkpoints";

/// Store size and reclamation counters.
#[derive(Debug, Default)]
pub struct StoreStats {
    approximate_size: AtomicU64,
    reclaimed: AtomicU64,
}

impl StoreStats {
    /// Returns the approximate on-disk size of the repository.
    pub fn approximate_size(&self) -> u64 {
        self.approximate_size.load(Ordering::Relaxed)
    }

    /// Returns the total bytes reclaimed by cleanup so far.
    pub fn reclaimed(&self) -> u64 {
        self.reclaimed.load(Ordering::Relaxed)
    }

    pub(crate) fn set_approximate_size(&self, size: u64) {
        self.approximate_size.store(size, Ordering::Relaxed);
    }

    pub(crate) fn grow(&self, bytes: u64) {
        self.approximate_size.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_reclaimed(&self, bytes: u64) {
        self.reclaimed.fetch_add(bytes, Ordering::Relaxed);
    }
}

pub(crate) struct StoreInner {
    /// Archive readers, newest file first.
    pub(crate) readers: Vec<Arc<ArchiveReader>>,
    /// The current write file. `None` in read-only mode and after close.
    pub(crate) writer: Option<ArchiveWriter>,
    /// Index of the current write file.
    pub(crate) write_index: u32,
}

/// The storage implementation over a directory of archive files.
///
/// Owns the archive readers and writer, the journal, the lock file, the
/// segment tracker and caches, and the garbage collector. The store is
/// single-writer for head mutations (compare-and-set) and multi-reader for
/// everything else; cross-process exclusion goes through an advisory lock
/// on `repo.lock`.
pub struct FileStore {
    pub(crate) directory: PathBuf,
    pub(crate) config: Config,
    pub(crate) read_only: bool,

    pub(crate) tracker: SegmentTracker,
    pub(crate) record_reader: RecordReader,
    pub(crate) record_writer: SegmentWriter,
    pub(crate) pool: WriterPool,
    pub(crate) cache: SegmentCache,

    /// Protects the reader list and current writer.
    pub(crate) inner: RwLock<StoreInner>,
    /// The current head record id; `None` only during open.
    pub(crate) head: Mutex<Option<RecordId>>,
    /// The head recorded by the most recent journal line.
    pub(crate) persisted_head: Mutex<Option<RecordId>>,
    /// Commits take the read side; force compaction takes the write side.
    pub(crate) commit_lock: RwLock<()>,
    pub(crate) journal: Mutex<Option<JournalWriter>>,

    pub(crate) pending_remove: Mutex<Vec<PathBuf>>,
    pub(crate) cleanup_needed: AtomicBool,
    pub(crate) shutdown: AtomicBool,
    pub(crate) sufficient_disk_space: AtomicBool,
    pub(crate) gc_count: AtomicU64,
    pub(crate) monitor: Arc<dyn GcMonitor>,
    pub(crate) stats: StoreStats,

    lock_file: Mutex<Option<File>>,
    runner: Mutex<Option<TaskRunner>>,
    compaction_signal: Mutex<Option<Arc<TaskSignal>>>,
}

impl FileStore {
    /// Opens (or creates) a store in `directory` with default monitoring.
    pub fn open(directory: impl AsRef<Path>, config: Config) -> Result<Arc<Self>> {
        Self::open_with_monitor(directory, config, Arc::new(LoggingMonitor::new()))
    }

    /// Opens a store with a custom GC monitor.
    pub fn open_with_monitor(
        directory: impl AsRef<Path>,
        config: Config,
        monitor: Arc<dyn GcMonitor>,
    ) -> Result<Arc<Self>> {
        Self::build(directory.as_ref(), config, monitor, false)
    }

    /// Opens a store without the lock, the writer, or background workers.
    /// All mutating operations fail with [`Error::ReadOnly`].
    pub fn open_read_only(directory: impl AsRef<Path>, config: Config) -> Result<Arc<Self>> {
        Self::build(
            directory.as_ref(),
            config,
            Arc::new(LoggingMonitor::new()),
            true,
        )
    }

    fn build(
        directory: &Path,
        config: Config,
        monitor: Arc<dyn GcMonitor>,
        read_only: bool,
    ) -> Result<Arc<Self>> {
        if read_only {
            if !directory.is_dir() {
                return Err(Error::corruption(format!(
                    "store directory does not exist: {}",
                    directory.display()
                )));
            }
        } else {
            std::fs::create_dir_all(directory)?;
        }

        let lock_file = if read_only {
            None
        } else {
            let lock = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(directory.join(LOCK_FILE_NAME))?;
            if lock.try_lock_exclusive().is_err() {
                return Err(Error::Locked);
            }
            Some(lock)
        };

        let files = collect_files(directory, read_only)?;
        let mut readers = Vec::with_capacity(files.len());
        for (_, generations) in files.iter().rev() {
            readers.push(Arc::new(open_newest_generation(
                generations,
                config.memory_mapping,
                read_only,
            )?));
        }

        let write_index = files.keys().next_back().map_or(0, |index| index + 1);
        let writer = if read_only {
            None
        } else {
            Some(ArchiveWriter::create(
                directory.join(file_name(write_index, 'a')),
            )?)
        };

        let journal_writer = if read_only {
            None
        } else {
            Some(JournalWriter::open(directory.join(JOURNAL_FILE_NAME))?)
        };

        let store = Self {
            directory: directory.to_path_buf(),
            cache: SegmentCache::new(config.cache_size as usize * 1024 * 1024),
            pool: WriterPool::new(config.segment_version),
            config,
            read_only,
            tracker: SegmentTracker::new(),
            record_reader: RecordReader::new(),
            record_writer: SegmentWriter::new(),
            inner: RwLock::new(StoreInner {
                readers,
                writer,
                write_index,
            }),
            head: Mutex::new(None),
            persisted_head: Mutex::new(None),
            commit_lock: RwLock::new(()),
            journal: Mutex::new(journal_writer),
            pending_remove: Mutex::new(Vec::new()),
            cleanup_needed: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            sufficient_disk_space: AtomicBool::new(true),
            gc_count: AtomicU64::new(0),
            monitor,
            stats: StoreStats::default(),
            lock_file: Mutex::new(lock_file),
            runner: Mutex::new(None),
            compaction_signal: Mutex::new(None),
        };
        store.stats.set_approximate_size(store.size());

        // Adopt the most recent journal head whose segment still resolves.
        let journal_reader = JournalReader::open(directory.join(JOURNAL_FILE_NAME))?;
        let mut adopted = None;
        for head in journal_reader.heads(&store.tracker) {
            if store.contains_segment(head.segment_id()) {
                adopted = Some(head);
                break;
            }
            warn!(revision = %head, "unable to access revision, rewinding");
        }

        match adopted {
            Some(head) => {
                *store.persisted_head.lock() = Some(head.clone());
                *store.head.lock() = Some(head);
            }
            None if read_only => {
                return Err(Error::corruption(
                    "no resolvable head in the journal of a read-only store",
                ));
            }
            None => {
                // Fresh store: write an empty super-root.
                let mut builder = NodeBuilder::new();
                builder.child(ROOT_NODE)?;
                builder.child(CHECKPOINTS_NODE)?;
                let head =
                    store
                        .record_writer
                        .write_builder(&store, &store.pool, "init", 0, &builder)?;
                *store.head.lock() = Some(head);
            }
        }

        let store = Arc::new(store);
        if !read_only {
            store.start_background_workers();
            info!(directory = %store.directory.display(), mmap = store.config.memory_mapping, "store opened");
        } else {
            info!(directory = %store.directory.display(), "store opened read-only");
        }
        Ok(store)
    }

    fn start_background_workers(self: &Arc<Self>) {
        let mut runner = TaskRunner::new();

        let flush_store: Weak<FileStore> = Arc::downgrade(self);
        runner.spawn("arbordb-flush", Some(FLUSH_INTERVAL), move || {
            if let Some(store) = flush_store.upgrade() {
                if let Err(err) = store.flush() {
                    warn!(error = %err, "background flush failed");
                }
            }
        });

        let compact_store: Weak<FileStore> = Arc::downgrade(self);
        let signal = runner.spawn("arbordb-compaction", None, move || {
            if let Some(store) = compact_store.upgrade() {
                store.maybe_compact(true);
            }
        });
        *self.compaction_signal.lock() = Some(signal);

        let probe_store: Weak<FileStore> = Arc::downgrade(self);
        runner.spawn("arbordb-disk-space", Some(DISK_SPACE_INTERVAL), move || {
            if let Some(store) = probe_store.upgrade() {
                store.check_disk_space();
            }
        });

        *self.runner.lock() = Some(runner);
    }

    /// Returns the store configuration.
    #[must_use]
    pub fn store_config(&self) -> &Config {
        &self.config
    }

    /// Returns the store counters.
    #[must_use]
    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    /// Returns the segment cache hit/miss counters.
    #[must_use]
    pub fn cache_stats(&self) -> (u64, u64) {
        self.cache.stats().snapshot()
    }

    /// Returns the record-level writer.
    #[must_use]
    pub fn segment_writer(&self) -> &SegmentWriter {
        &self.record_writer
    }

    /// Returns the writer pool.
    #[must_use]
    pub fn writer_pool(&self) -> &WriterPool {
        &self.pool
    }

    /// Returns the current size of the store in bytes.
    pub fn size(&self) -> u64 {
        let inner = self.inner.read();
        let mut size = inner.writer.as_ref().map_or(0, ArchiveWriter::size);
        for reader in &inner.readers {
            size += reader.size();
        }
        size
    }

    /// Returns the number of archive readers.
    pub fn reader_count(&self) -> usize {
        self.inner.read().readers.len()
    }

    /// Returns the number of segments across all archives.
    pub fn segment_count(&self) -> usize {
        let inner = self.inner.read();
        let mut count = inner.writer.as_ref().map_or(0, ArchiveWriter::count);
        for reader in &inner.readers {
            count += reader.count();
        }
        count
    }

    // ------------------------------------------------------------- head

    /// Returns the current head record id.
    pub fn head_id(&self) -> RecordId {
        self.head
            .lock()
            .clone()
            .expect("store head is initialized at open")
    }

    /// Compare-and-sets the head record id.
    ///
    /// Returns `false` when the head moved concurrently; the caller must
    /// rebase and retry. `set_head(h, h)` succeeds and is a no-op.
    pub fn set_head(&self, expected: &RecordId, new_head: &RecordId) -> bool {
        let _commit = self.commit_lock.read();
        self.set_head_locked(expected, new_head)
    }

    /// The compare-and-set itself, for callers already holding the commit
    /// lock (force compaction holds its write side).
    pub(crate) fn set_head_locked(&self, expected: &RecordId, new_head: &RecordId) -> bool {
        let mut head = self.head.lock();
        if head.as_ref() == Some(expected) {
            *head = Some(new_head.clone());
            true
        } else {
            false
        }
    }

    /// Returns the GC generation of the current head.
    pub fn head_generation(&self) -> Result<u32> {
        let head = self.head_id();
        Ok(self.read_segment(head.segment_id())?.generation())
    }

    // ------------------------------------------------------------ flush

    /// Seals dirty segment buffers, appends the journal line for the
    /// current head and forces it, then performs deferred deletions.
    ///
    /// This is the linearization point for durability: after `flush`
    /// returns, every previously accepted head is durable.
    pub fn flush(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        let cleanup = self.cleanup_needed.swap(false, Ordering::SeqCst);

        {
            let mut persisted = self.persisted_head.lock();
            let after = self.head_id();
            if cleanup || persisted.as_ref() != Some(&after) {
                self.pool.flush(self)?;
                {
                    let mut inner = self.inner.write();
                    if let Some(writer) = inner.writer.as_mut() {
                        writer.sync()?;
                    }
                }
                if let Some(journal) = self.journal.lock().as_mut() {
                    debug!(before = ?persisted.as_ref(), after = %after, "journal update");
                    journal.append(&after, journal::unix_millis())?;
                }
                *persisted = Some(after);

                if cleanup {
                    let removed = self.cleanup()?;
                    self.pending_remove.lock().extend(removed);
                }
            }
        }

        // Retry deferred deletions of swept archive files.
        let mut pending = self.pending_remove.lock();
        pending.retain(|path| {
            if !path.exists() {
                return false;
            }
            match std::fs::remove_file(path) {
                Ok(()) => {
                    debug!(path = %path.display(), "removed old archive");
                    false
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to remove old archive, will retry");
                    true
                }
            }
        });
        Ok(())
    }

    // ------------------------------------------------------- segment io

    fn load_segment(&self, id: &SegmentId) -> Result<Arc<Segment>> {
        let entry = id.entry_id();

        // One extra pass when a cleanup closed a reader under us.
        for _ in 0..2 {
            let readers: Vec<Arc<ArchiveReader>> = self.inner.read().readers.clone();
            let mut retry = false;

            for reader in &readers {
                match reader.read(entry) {
                    Ok(Some(data)) => {
                        return Ok(Arc::new(Segment::parse(id.clone(), data)?));
                    }
                    Ok(None) => {}
                    Err(arbordb_storage::StorageError::Closed) => {
                        // A concurrent cleanup swapped this reader out;
                        // retry against the fresh list.
                        retry = true;
                    }
                    Err(err) => {
                        warn!(archive = %reader.path().display(), error = %err, "failed to read archive");
                    }
                }
            }

            {
                let mut inner = self.inner.write();
                if let Some(writer) = inner.writer.as_mut() {
                    if let Some(data) = writer.read(entry)? {
                        return Ok(Arc::new(Segment::parse(id.clone(), data)?));
                    }
                }
            }

            // The writer may have rolled over to a new file while we were
            // looking; check the refreshed reader list once more.
            let refreshed: Vec<Arc<ArchiveReader>> = self.inner.read().readers.clone();
            for reader in &refreshed {
                if let Ok(Some(data)) = reader.read(entry) {
                    return Ok(Arc::new(Segment::parse(id.clone(), data)?));
                }
            }

            if !retry {
                break;
            }
        }
        Err(Error::segment_not_found(id))
    }

    /// Switches to a new write file. Must be called with the inner lock
    /// held for writing.
    pub(crate) fn new_writer_locked(&self, inner: &mut StoreInner) -> Result<()> {
        let Some(writer) = inner.writer.take() else {
            return Ok(());
        };
        if !writer.is_dirty() {
            inner.writer = Some(writer);
            return Ok(());
        }

        let sealed_path = writer.path().to_path_buf();
        writer.seal()?;
        let reader = ArchiveReader::open(&sealed_path, self.config.memory_mapping)?;
        inner.readers.insert(0, Arc::new(reader));

        inner.write_index += 1;
        let path = self.directory.join(file_name(inner.write_index, 'a'));
        inner.writer = Some(ArchiveWriter::create(path)?);
        Ok(())
    }

    // ------------------------------------------------------------ debug

    /// Returns, per archive file, the set of segment ids it contains.
    pub fn archive_index(&self) -> BTreeMap<String, Vec<SegmentId>> {
        let inner = self.inner.read();
        let mut index = BTreeMap::new();
        for reader in &inner.readers {
            let ids = reader
                .ids()
                .map(|id| self.tracker.segment_id(id.msb, id.lsb))
                .collect();
            index.insert(reader.path().display().to_string(), ids);
        }
        index
    }

    /// Returns the reference graph of one archive file, if it has one.
    pub fn archive_graph(
        &self,
        file_name: &str,
    ) -> Option<BTreeMap<SegmentId, Vec<SegmentId>>> {
        let inner = self.inner.read();
        for reader in &inner.readers {
            if reader.path().file_name().and_then(|name| name.to_str()) == Some(file_name) {
                let graph = reader.graph()?;
                return Some(
                    graph
                        .iter()
                        .map(|(id, refs)| {
                            (
                                self.tracker.segment_id(id.msb, id.lsb),
                                refs.iter()
                                    .map(|r| self.tracker.segment_id(r.msb, r.lsb))
                                    .collect(),
                            )
                        })
                        .collect(),
                );
            }
        }
        None
    }

    /// Iterates every external blob reference recorded in the archive
    /// footers for the retained generations.
    pub fn collect_blob_references(
        &self,
        collector: &mut dyn FnMut(&str),
    ) -> Result<()> {
        self.pool.flush(self)?;
        let readers: Vec<Arc<ArchiveReader>> = {
            let mut inner = self.inner.write();
            self.new_writer_locked(&mut inner)?;
            inner.readers.clone()
        };

        let min_generation = i64::from(self.head_generation()?)
            - i64::from(self.config.gc.retained_generations)
            + 1;
        for reader in readers {
            for (&generation, references) in reader.binary_references() {
                if i64::from(generation) >= min_generation {
                    for reference in references {
                        collector(reference);
                    }
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------ close

    fn check_disk_space(&self) {
        let available = fs2::available_space(&self.directory).unwrap_or(u64::MAX);
        let repository = self.stats.approximate_size();
        let sufficient = self
            .config
            .gc
            .is_disk_space_sufficient(repository, available);
        let previous = self
            .sufficient_disk_space
            .swap(sufficient, Ordering::SeqCst);

        if previous && !sufficient {
            warn!(
                available,
                repository, "available disk space is too low for the repository"
            );
        }
        if sufficient && !previous {
            info!(
                available,
                repository, "available disk space is sufficient again"
            );
        }
    }

    /// Signals the background compaction worker to run a GC cycle.
    pub fn gc(&self) {
        if let Some(signal) = self.compaction_signal.lock().as_ref() {
            signal.trigger();
        }
    }

    /// Orderly shutdown: stops background workers, flushes, seals the
    /// writer, closes the readers and releases the file lock.
    pub fn close(&self) -> Result<()> {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(runner) = self.runner.lock().take() {
            runner.shutdown();
        }

        if !self.read_only {
            self.flush()?;
        }

        {
            let mut inner = self.inner.write();
            if let Some(writer) = inner.writer.take() {
                writer.seal()?;
            }
            for reader in inner.readers.drain(..) {
                reader.close();
            }
        }

        *self.journal.lock() = None;
        let _ = self.lock_file.lock().take();
        info!(directory = %self.directory.display(), "store closed");
        Ok(())
    }
}

impl SegmentStore for FileStore {
    fn tracker(&self) -> &SegmentTracker {
        &self.tracker
    }

    fn record_reader(&self) -> &RecordReader {
        &self.record_reader
    }

    fn read_segment(&self, id: &SegmentId) -> Result<Arc<Segment>> {
        self.cache.get_or_load(id, || self.load_segment(id))
    }

    fn write_segment(
        &self,
        id: &SegmentId,
        data: &[u8],
        binary_references: &[String],
    ) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }

        let (generation, references, parsed) = if id.is_data() {
            let segment = Arc::new(Segment::parse(id.clone(), data.to_vec())?);
            let references: Vec<EntryId> = segment
                .references()
                .iter()
                .map(|&(msb, lsb)| EntryId::new(msb, lsb))
                .collect();
            (segment.generation(), references, Some(segment))
        } else {
            (0, Vec::new(), None)
        };

        {
            let mut inner = self.inner.write();
            let writer = inner
                .writer
                .as_mut()
                .ok_or(Error::ReadOnly)?;
            let size = writer.write_entry(
                id.entry_id(),
                generation,
                data,
                &references,
                binary_references,
            )?;
            if size >= self.config.max_file_size * 1024 * 1024 {
                self.new_writer_locked(&mut inner)?;
            }
        }
        self.stats.grow(data.len() as u64 + 1024);

        // Fresh data segments are likely to be read back soon.
        if let Some(segment) = parsed {
            self.cache.put(segment);
        }
        Ok(())
    }

    fn contains_segment(&self, id: &SegmentId) -> bool {
        let entry = id.entry_id();

        let readers: Vec<Arc<ArchiveReader>> = self.inner.read().readers.clone();
        if readers.iter().any(|reader| reader.contains(entry)) {
            return true;
        }

        {
            let inner = self.inner.read();
            if let Some(writer) = inner.writer.as_ref() {
                if writer.contains(entry) {
                    return true;
                }
            }
        }

        // The writer may have rolled over; re-check the readers.
        let refreshed: Vec<Arc<ArchiveReader>> = self.inner.read().readers.clone();
        refreshed.iter().any(|reader| reader.contains(entry))
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        if !self.shutdown.load(Ordering::SeqCst) {
            if let Err(err) = self.close() {
                warn!(error = %err, "failed to close store on drop");
            }
        }
    }
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("directory", &self.directory)
            .field("read_only", &self.read_only)
            .field("readers", &self.reader_count())
            .finish_non_exhaustive()
    }
}

/// Formats an archive file name: zero-padded index plus generation letter.
pub(crate) fn file_name(index: u32, generation: char) -> String {
    format!("data{index:05}{generation}.tar")
}

/// Parses an archive file name into `(bulk, index, generation letter)`.
fn parse_file_name(name: &str) -> Option<(bool, u32, char)> {
    let (bulk, rest) = match name.strip_prefix("data") {
        Some(rest) => (false, rest),
        None => (true, name.strip_prefix("bulk")?),
    };
    let rest = rest.strip_suffix(".tar")?;

    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    if digits.len() < 5 {
        return None;
    }
    let index: u32 = digits.parse().ok()?;

    let suffix = &rest[digits.len()..];
    let generation = match suffix.chars().next() {
        None => 'a',
        Some(letter) if suffix.len() == 1 && letter.is_ascii_lowercase() => letter,
        Some(_) => return None,
    };
    Some((bulk, index, generation))
}

/// Scans the directory for archive files, upgrading legacy `bulk*.tar`
/// names, and returns them sorted by index with their generation letters.
fn collect_files(
    directory: &Path,
    read_only: bool,
) -> Result<BTreeMap<u32, BTreeMap<char, PathBuf>>> {
    let mut data_files: BTreeMap<u32, BTreeMap<char, PathBuf>> = BTreeMap::new();
    let mut bulk_files: BTreeMap<u32, PathBuf> = BTreeMap::new();

    for entry in std::fs::read_dir(directory)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some((bulk, index, generation)) = parse_file_name(name) else {
            continue;
        };
        if bulk {
            bulk_files.insert(index, entry.path());
        } else {
            data_files
                .entry(index)
                .or_default()
                .insert(generation, entry.path());
        }
    }

    if !bulk_files.is_empty() && !read_only {
        info!(directory = %directory.display(), "upgrading legacy archive file names");

        // Move the data files past the bulk range, then renumber the bulk
        // files from zero, oldest first.
        let mut position = data_files
            .keys()
            .next_back()
            .map_or(0, |max| max + 1)
            .max(bulk_files.len() as u32);
        let old_data = std::mem::take(&mut data_files);
        for (_, generations) in old_data {
            let mut renamed = BTreeMap::new();
            for (generation, path) in generations {
                let target = directory.join(file_name(position, generation));
                info!(from = %path.display(), to = %target.display(), "renaming archive");
                std::fs::rename(&path, &target)?;
                renamed.insert(generation, target);
            }
            data_files.insert(position, renamed);
            position += 1;
        }

        let mut position = 0;
        for (_, path) in bulk_files {
            let target = directory.join(file_name(position, 'a'));
            info!(from = %path.display(), to = %target.display(), "renaming archive");
            std::fs::rename(&path, &target)?;
            data_files.insert(position, BTreeMap::from([('a', target)]));
            position += 1;
        }
    }

    Ok(data_files)
}

/// Opens the newest valid generation of one archive index, removing
/// superseded generations left behind by an interrupted cleanup.
fn open_newest_generation(
    generations: &BTreeMap<char, PathBuf>,
    memory_mapping: bool,
    read_only: bool,
) -> Result<ArchiveReader> {
    let mut last_error = None;
    for (&letter, path) in generations.iter().rev() {
        match ArchiveReader::open(path, memory_mapping) {
            Ok(reader) => {
                if !read_only {
                    // Older generations of the same index were superseded
                    // by an interrupted cleanup.
                    for (_, obsolete) in generations.range(..letter) {
                        info!(path = %obsolete.display(), "removing superseded archive generation");
                        let _ = std::fs::remove_file(obsolete);
                    }
                }
                return Ok(reader);
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to open archive generation");
                last_error = Some(err);
            }
        }
    }
    Err(last_error
        .map(Error::from)
        .unwrap_or_else(|| Error::corruption("archive index with no generations")))
}
