//! Store configuration.

use std::time::Duration;

/// Configuration for opening a file store.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum size of a single archive file in megabytes.
    pub max_file_size: u64,

    /// Size of the segment cache in megabytes. Zero disables caching.
    pub cache_size: u64,

    /// Whether archive files are memory-mapped for reading.
    pub memory_mapping: bool,

    /// Version number written into new segments.
    pub segment_version: u8,

    /// Garbage collection options.
    pub gc: GcOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_file_size: 256,
            cache_size: 256,
            memory_mapping: false,
            segment_version: crate::segment::SEGMENT_VERSION,
            gc: GcOptions::default(),
        }
    }
}

impl Config {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum archive file size in megabytes.
    #[must_use]
    pub const fn max_file_size(mut self, megabytes: u64) -> Self {
        self.max_file_size = megabytes;
        self
    }

    /// Sets the segment cache size in megabytes.
    #[must_use]
    pub const fn cache_size(mut self, megabytes: u64) -> Self {
        self.cache_size = megabytes;
        self
    }

    /// Turns the segment cache off.
    #[must_use]
    pub const fn no_cache(mut self) -> Self {
        self.cache_size = 0;
        self
    }

    /// Turns memory mapping on or off.
    #[must_use]
    pub const fn memory_mapping(mut self, enabled: bool) -> Self {
        self.memory_mapping = enabled;
        self
    }

    /// Sets the garbage collection options.
    #[must_use]
    pub fn gc_options(mut self, gc: GcOptions) -> Self {
        self.gc = gc;
        self
    }
}

/// Configuration options for the generational garbage collector.
#[derive(Debug, Clone)]
pub struct GcOptions {
    /// Whether revision gc is paused.
    pub paused: bool,

    /// Memory threshold (percent) below which compaction will not run.
    pub memory_threshold: u8,

    /// Estimated-gain threshold (percent) below which compaction is
    /// skipped. Zero disables estimation.
    pub gain_threshold: u8,

    /// Number of tries to compact concurrent commits on top of already
    /// compacted commits.
    pub retry_count: usize,

    /// Whether to force compaction under the exclusive commit lock after
    /// the retries are exhausted.
    pub force_after_fail: bool,

    /// How long force compaction waits for the exclusive commit lock.
    pub lock_wait_time: Duration,

    /// Number of segment generations retained during cleanup. At least 2.
    pub retained_generations: u32,

    /// Share of reclaimable bytes (percent) above which cleanup rewrites an
    /// archive file instead of keeping it.
    pub cleanup_threshold: u8,
}

impl Default for GcOptions {
    fn default() -> Self {
        Self {
            paused: false,
            memory_threshold: 5,
            gain_threshold: 10,
            retry_count: 5,
            force_after_fail: false,
            lock_wait_time: Duration::from_secs(60),
            retained_generations: 2,
            cleanup_threshold: 25,
        }
    }
}

impl GcOptions {
    /// Creates gc options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pauses or resumes revision gc.
    #[must_use]
    pub const fn paused(mut self, paused: bool) -> Self {
        self.paused = paused;
        self
    }

    /// Sets the estimated-gain threshold in percent.
    #[must_use]
    pub const fn gain_threshold(mut self, percent: u8) -> Self {
        self.gain_threshold = percent;
        self
    }

    /// Sets the number of compaction retry cycles.
    #[must_use]
    pub const fn retry_count(mut self, count: usize) -> Self {
        self.retry_count = count;
        self
    }

    /// Enables or disables force compaction after failed retries.
    #[must_use]
    pub const fn force_after_fail(mut self, force: bool) -> Self {
        self.force_after_fail = force;
        self
    }

    /// Sets the force-compaction lock wait time.
    #[must_use]
    pub const fn lock_wait_time(mut self, wait: Duration) -> Self {
        self.lock_wait_time = wait;
        self
    }

    /// Sets the number of retained generations.
    ///
    /// # Panics
    ///
    /// Panics if `generations` is below 2: cleanup must always retain the
    /// current generation and its predecessor.
    #[must_use]
    pub fn retained_generations(mut self, generations: u32) -> Self {
        assert!(
            generations >= 2,
            "retained generations must not be below 2, got {generations}"
        );
        self.retained_generations = generations;
        self
    }

    /// Sets the cleanup rewrite threshold in percent.
    #[must_use]
    pub const fn cleanup_threshold(mut self, percent: u8) -> Self {
        self.cleanup_threshold = percent;
        self
    }

    /// Checks whether the available disk space is considered sufficient for
    /// normal store operations, given the approximate repository size.
    #[must_use]
    pub fn is_disk_space_sufficient(&self, repository_size: u64, available: u64) -> bool {
        available * 4 > repository_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.max_file_size, 256);
        assert_eq!(config.cache_size, 256);
        assert!(!config.gc.paused);
        assert_eq!(config.gc.retained_generations, 2);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .max_file_size(16)
            .no_cache()
            .memory_mapping(true)
            .gc_options(GcOptions::new().gain_threshold(0).retry_count(3));

        assert_eq!(config.max_file_size, 16);
        assert_eq!(config.cache_size, 0);
        assert!(config.memory_mapping);
        assert_eq!(config.gc.gain_threshold, 0);
        assert_eq!(config.gc.retry_count, 3);
    }

    #[test]
    #[should_panic(expected = "retained generations")]
    fn retained_generations_below_two_rejected() {
        let _ = GcOptions::new().retained_generations(1);
    }

    #[test]
    fn disk_space_threshold() {
        let gc = GcOptions::default();
        // Sufficient while available space exceeds a quarter of the
        // repository size.
        assert!(gc.is_disk_space_sufficient(100, 26));
        assert!(!gc.is_disk_space_sufficient(100, 25));
    }
}
