//! The generational garbage collector: estimate, compact, cleanup.
//!
//! A GC cycle runs in two cancellable phases. **Compaction** copies every
//! record reachable from the current head into segments of the next
//! generation and advances the head by compare-and-set, rebasing over
//! concurrent commits up to a bounded number of cycles (optionally forcing
//! the last attempt under the exclusive commit lock). **Cleanup** then
//! reclaims segments of expired generations and unreferenced bulk
//! segments, rewriting archive files whose reclaimable share crosses the
//! configured threshold.
//!
//! Cancellation comes from store shutdown and from the disk-space probe;
//! a cancelled compaction leaves only unreachable new-generation segments
//! behind, which the next cleanup collects.

use crate::error::Result;
use crate::record::RecordId;
use crate::segment::{self, is_data_segment_id};
use crate::store::file_store::{file_name, FileStore};
use arbordb_storage::{ArchiveReader, EntryId, SegmentMetaParser, Sweep};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::warn;

/// Rebuilds segment references from raw payloads when an archive has lost
/// its graph footer.
struct SegmentRefParser;

impl SegmentMetaParser for SegmentRefParser {
    fn references(&self, id: EntryId, data: &[u8]) -> Vec<EntryId> {
        if !is_data_segment_id(id.lsb) {
            return Vec::new();
        }
        match segment::data::parse_references(data) {
            Ok(references) => references
                .into_iter()
                .map(|(msb, lsb)| EntryId::new(msb, lsb))
                .collect(),
            Err(err) => {
                warn!(segment = %id, error = %err, "failed to parse segment references");
                Vec::new()
            }
        }
    }
}

impl FileStore {
    /// Runs one GC cycle: estimation, compaction, and (if `cleanup` is
    /// set) cleanup deferred to the next flush.
    pub fn maybe_compact(&self, cleanup: bool) {
        let count = self.gc_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.monitor.info(&format!("GC #{count}: started"));

        let gain_threshold = self.config.gc.gain_threshold;
        let mut sufficient_gain = true;
        if gain_threshold == 0 {
            self.monitor.info(&format!(
                "GC #{count}: estimation skipped because the gain threshold is 0"
            ));
        } else if self.config.gc.paused {
            self.monitor
                .info(&format!("GC #{count}: estimation skipped because compaction is paused"));
        } else {
            self.monitor.info(&format!("GC #{count}: estimation started"));
            let (reachable, total) = self.estimate_reachability();
            if total == 0 {
                self.monitor.skipped(&format!(
                    "GC #{count}: estimation found an empty repository"
                ));
                sufficient_gain = false;
            } else {
                let gain = (total.saturating_sub(reachable)) * 100 / total;
                sufficient_gain = gain >= u64::from(gain_threshold);
                if sufficient_gain {
                    self.monitor.info(&format!(
                        "GC #{count}: estimated gain is {gain}% ({reachable}/{total} bytes reachable), running compaction"
                    ));
                } else {
                    self.monitor.skipped(&format!(
                        "GC #{count}: estimated gain is {gain}% ({reachable}/{total} bytes reachable), skipping compaction"
                    ));
                }
            }
        }

        if sufficient_gain {
            if self.config.gc.paused {
                self.monitor.skipped(&format!("GC #{count}: compaction paused"));
            } else if self.compact() {
                self.cleanup_needed.store(cleanup, Ordering::SeqCst);
            }
        }
    }

    /// Estimates how many bytes are reachable from the current head versus
    /// the total archive size, walking the persisted segment graphs.
    ///
    /// Returns `(reachable_bytes, total_bytes)`.
    pub fn estimate_reachability(&self) -> (u64, u64) {
        let head = self.head_id();
        let inner = self.inner.read();

        let mut reachable: HashSet<EntryId> = HashSet::new();
        reachable.insert(head.segment_id().entry_id());

        // Expand through every archive graph until no new segments appear.
        loop {
            let mut grown = false;
            for reader in &inner.readers {
                let Some(graph) = reader.graph() else {
                    continue;
                };
                for (id, references) in graph {
                    if reachable.contains(id) {
                        for reference in references {
                            grown |= reachable.insert(*reference);
                        }
                    }
                }
            }
            if let Some(writer) = inner.writer.as_ref() {
                for (id, references) in writer.graph() {
                    if reachable.contains(id) {
                        for reference in references {
                            grown |= reachable.insert(*reference);
                        }
                    }
                }
            }
            if !grown {
                break;
            }
        }

        let mut reachable_bytes = 0u64;
        let mut total_bytes = 0u64;
        for reader in &inner.readers {
            for entry in reader.entries() {
                total_bytes += u64::from(entry.size);
                if reachable.contains(&entry.id) {
                    reachable_bytes += u64::from(entry.size);
                }
            }
        }
        if let Some(writer) = inner.writer.as_ref() {
            for entry in writer.entries() {
                total_bytes += u64::from(entry.size);
                if reachable.contains(&entry.id) {
                    reachable_bytes += u64::from(entry.size);
                }
            }
        }
        (reachable_bytes, total_bytes)
    }

    /// Compacts the current head into the next generation and advances the
    /// head. Returns `true` on success.
    ///
    /// Concurrent commits are compacted on top of the already-compacted
    /// state for up to `retry_count` cycles; when `force_after_fail` is
    /// set, a final attempt runs under the exclusive commit lock.
    pub fn compact(&self) -> bool {
        let count = self.gc_count.load(Ordering::SeqCst).max(1);
        self.monitor
            .info(&format!("GC #{count}: compaction started, gc options={:?}", self.config.gc));

        let generation = match self.head_generation() {
            Ok(generation) => generation,
            Err(err) => {
                self.monitor
                    .error(&format!("GC #{count}: compaction failed to read the head: {err}"));
                return false;
            }
        };
        let new_generation = generation + 1;
        let cancel = || {
            self.shutdown.load(Ordering::SeqCst)
                || !self.sufficient_disk_space.load(Ordering::SeqCst)
        };

        let mut before = self.head_id();
        let mut after = match self.compact_head(&before, new_generation, &cancel) {
            Ok(Some(after)) => after,
            Ok(None) => {
                self.monitor.info(&format!("GC #{count}: compaction cancelled"));
                self.record_writer.evict_caches(|g| g == new_generation);
                return false;
            }
            Err(err) => {
                self.monitor
                    .error(&format!("GC #{count}: compaction encountered an error: {err}"));
                return false;
            }
        };
        self.monitor
            .info(&format!("GC #{count}: compacted {before} to {after}"));

        let mut cycles = 0;
        let mut success = self.set_head(&before, &after);
        while !success && cycles < self.config.gc.retry_count {
            cycles += 1;
            // Somebody else committed; rebase those commits onto the
            // compacted state and retry.
            self.monitor.info(&format!(
                "GC #{count}: compaction detected concurrent commits, compacting them (cycle {cycles})"
            ));
            let head = self.head_id();
            after = match self.compact_head(&head, new_generation, &cancel) {
                Ok(Some(after)) => after,
                Ok(None) => {
                    self.monitor.info(&format!("GC #{count}: compaction cancelled"));
                    self.record_writer.evict_caches(|g| g == new_generation);
                    return false;
                }
                Err(err) => {
                    self.monitor
                        .error(&format!("GC #{count}: compaction encountered an error: {err}"));
                    return false;
                }
            };
            before = head;
            success = self.set_head(&before, &after);
        }

        if !success && self.config.gc.force_after_fail {
            self.monitor.info(&format!(
                "GC #{count}: compaction gave up after {cycles} cycles, force compacting remaining commits"
            ));
            success = self.force_compact(new_generation, &cancel);
            if !success {
                self.monitor.warn(&format!(
                    "GC #{count}: compaction failed to force compact remaining commits, cleaning up"
                ));
                if let Err(err) = self.cleanup_where(|g| g == new_generation) {
                    self.monitor
                        .error(&format!("GC #{count}: cleanup of the failed generation failed: {err}"));
                }
            }
        }

        if success {
            self.record_writer.evict_caches(|g| g < new_generation);
            self.cache.evict_generations(|g| g < new_generation);
            self.monitor.compacted();
            self.monitor.info(&format!(
                "GC #{count}: compaction succeeded after {cycles} cycles"
            ));
            true
        } else {
            self.record_writer.evict_caches(|g| g == new_generation);
            self.monitor.info(&format!(
                "GC #{count}: compaction gave up after {cycles} cycles"
            ));
            false
        }
    }

    fn compact_head(
        &self,
        head: &RecordId,
        generation: u32,
        cancel: &(dyn Fn() -> bool + Sync),
    ) -> Result<Option<RecordId>> {
        self.record_writer
            .write_node(self, &self.pool, "c", generation, head, cancel)
    }

    fn force_compact(&self, generation: u32, cancel: &(dyn Fn() -> bool + Sync)) -> bool {
        // Block every committer for the final attempt; bounded by the
        // configured lock wait time.
        let Some(_commits) = self
            .commit_lock
            .try_write_for(self.config.gc.lock_wait_time)
        else {
            return false;
        };

        let head = self.head_id();
        match self.compact_head(&head, generation, cancel) {
            Ok(Some(after)) => self.set_head_locked(&head, &after),
            Ok(None) => {
                self.monitor.info("force compaction cancelled");
                false
            }
            Err(err) => {
                self.monitor
                    .error(&format!("force compaction encountered an error: {err}"));
                false
            }
        }
    }

    /// Reclaims segments of expired generations and unreferenced bulk
    /// segments. Returns the archive files that are ready for deletion.
    pub fn cleanup(&self) -> Result<Vec<PathBuf>> {
        let generation = i64::from(self.head_generation()?);
        let reclaim_generation = generation - i64::from(self.config.gc.retained_generations);
        self.cleanup_where(move |g| i64::from(g) <= reclaim_generation)
    }

    /// Cleanup with an explicit reclaim predicate over data segment
    /// generations.
    pub(crate) fn cleanup_where(
        &self,
        reclaim_if: impl Fn(u32) -> bool,
    ) -> Result<Vec<PathBuf>> {
        let count = self.gc_count.load(Ordering::SeqCst).max(1);
        let initial_size = self.size();
        self.monitor.info(&format!(
            "GC #{count}: cleanup started, current repository size is {initial_size} bytes"
        ));

        // Roll the write file over so the sealed archives cover everything
        // committed so far, and drop the segment cache so stale views of
        // reclaimed segments cannot linger.
        let readers: Vec<Arc<ArchiveReader>> = {
            let mut inner = self.inner.write();
            self.new_writer_locked(&mut inner)?;
            self.cache.clear();
            // Decode caches key by record id and would otherwise keep
            // reclaimed segment ids interned.
            self.record_reader.clear_caches();
            inner.readers.clone()
        };

        // Segments that must survive regardless of generation: everything
        // reachable from the head plus every id still referenced in
        // memory.
        let mut references = self.reachable_from_head(&readers);
        for id in self.tracker.referenced_ids() {
            references.insert(id.entry_id());
        }

        // Mark phase, newest archive first: a segment is retained if it is
        // referenced or if it is a data segment of a live generation;
        // retained segments propagate their outgoing references, within
        // the archive and into older ones.
        let mut reclaim_sets = Vec::with_capacity(readers.len());
        for reader in &readers {
            let mut retained: HashSet<EntryId> = HashSet::new();
            loop {
                let mut grown = false;
                for entry in reader.entries() {
                    if retained.contains(&entry.id) {
                        continue;
                    }
                    let keep = references.contains(&entry.id)
                        || (is_data_segment_id(entry.id.lsb) && !reclaim_if(entry.generation));
                    if keep {
                        retained.insert(entry.id);
                        grown = true;
                        if let Some(graph) = reader.graph() {
                            if let Some(outgoing) = graph.get(&entry.id) {
                                for reference in outgoing {
                                    references.insert(*reference);
                                }
                            }
                        }
                    }
                }
                if !grown {
                    break;
                }
            }

            let reclaim: HashSet<EntryId> = reader
                .entries()
                .iter()
                .map(|entry| entry.id)
                .filter(|id| !retained.contains(id))
                .collect();
            reclaim_sets.push(reclaim);

            if self.shutdown.load(Ordering::SeqCst) {
                self.monitor.info(&format!("GC #{count}: cleanup interrupted"));
                return Ok(Vec::new());
            }
        }

        // Sweep phase: rewrite or drop archives whose reclaimable share
        // crosses the threshold.
        let parser = SegmentRefParser;
        let mut swaps: Vec<(Arc<ArchiveReader>, Option<Arc<ArchiveReader>>)> = Vec::new();
        for (reader, reclaim) in readers.iter().zip(&reclaim_sets) {
            if reclaim.is_empty() {
                continue;
            }
            let target = match next_generation_path(reader.path()) {
                Ok(target) => target,
                Err(err) => {
                    self.monitor
                        .warn(&format!("GC #{count}: cannot sweep {}: {err}", reader.path().display()));
                    continue;
                }
            };
            match reader.sweep(reclaim, self.config.gc.cleanup_threshold, &target, &parser) {
                Ok(Sweep::Kept) => {}
                Ok(Sweep::Emptied) => swaps.push((Arc::clone(reader), None)),
                Ok(Sweep::Rewritten(rewritten)) => {
                    self.monitor.info(&format!(
                        "GC #{count}: cleanup rewrote {} to {}",
                        reader.path().display(),
                        target.display()
                    ));
                    swaps.push((Arc::clone(reader), Some(Arc::new(rewritten))));
                }
                Err(err) => {
                    // A corrupt archive aborts its own sweep only.
                    self.monitor
                        .warn(&format!("GC #{count}: sweep of {} failed: {err}", reader.path().display()));
                }
            }
            if self.shutdown.load(Ordering::SeqCst) {
                self.monitor.info(&format!("GC #{count}: cleanup interrupted"));
                break;
            }
        }

        // Swap the reader list, preserving readers that appeared through
        // concurrent writer roll-overs, then close the replaced readers.
        let mut removable = Vec::new();
        {
            let mut inner = self.inner.write();
            let mut fresh = Vec::with_capacity(inner.readers.len());
            for reader in &inner.readers {
                match swaps
                    .iter()
                    .find(|(old, _)| Arc::ptr_eq(old, reader))
                {
                    Some((_, Some(replacement))) => fresh.push(Arc::clone(replacement)),
                    Some((_, None)) => {}
                    None => fresh.push(Arc::clone(reader)),
                }
            }
            inner.readers = fresh;
        }
        for (old, _) in &swaps {
            old.close();
            self.monitor.info(&format!(
                "GC #{count}: cleanup marking file for deletion: {}",
                old.path().display()
            ));
            removable.push(old.path().to_path_buf());
        }

        let final_size = self.size();
        self.stats.set_approximate_size(final_size);
        let reclaimed = initial_size.saturating_sub(final_size);
        self.stats.record_reclaimed(reclaimed);
        self.monitor.cleaned(reclaimed, final_size);
        self.monitor.info(&format!(
            "GC #{count}: cleanup completed, post-cleanup size is {final_size} bytes, reclaimed {reclaimed} bytes"
        ));
        Ok(removable)
    }

    /// Computes the set of segments reachable from the head through the
    /// persisted archive graphs.
    fn reachable_from_head(&self, readers: &[Arc<ArchiveReader>]) -> HashSet<EntryId> {
        let mut reachable = HashSet::new();
        reachable.insert(self.head_id().segment_id().entry_id());
        loop {
            let mut grown = false;
            for reader in readers {
                let Some(graph) = reader.graph() else {
                    continue;
                };
                for (id, references) in graph {
                    if reachable.contains(id) {
                        for reference in references {
                            grown |= reachable.insert(*reference);
                        }
                    }
                }
            }
            if !grown {
                break;
            }
        }
        reachable
    }
}

/// Returns the sweep target for an archive: the same index with the next
/// generation letter.
fn next_generation_path(path: &Path) -> Result<PathBuf> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| crate::error::Error::corruption("archive file without a name"))?;

    // data<NNNNN><gen>.tar
    let stem = name
        .strip_prefix("data")
        .and_then(|rest| rest.strip_suffix(".tar"))
        .ok_or_else(|| {
            crate::error::Error::corruption(format!("unexpected archive file name {name}"))
        })?;
    let (digits, letter) = if stem.ends_with(|c: char| c.is_ascii_digit()) {
        (stem, 'a')
    } else {
        let (digits, letter) = stem.split_at(stem.len() - 1);
        (digits, letter.chars().next().unwrap_or('a'))
    };
    let index: u32 = digits
        .parse()
        .map_err(|_| crate::error::Error::corruption(format!("unexpected archive file name {name}")))?;
    if letter >= 'z' {
        return Err(crate::error::Error::corruption(format!(
            "archive {name} has exhausted its generation letters"
        )));
    }
    let next = (letter as u8 + 1) as char;
    Ok(path.with_file_name(file_name(index, next)))
}
