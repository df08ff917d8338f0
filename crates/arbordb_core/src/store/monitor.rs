//! Garbage collection monitoring.

use std::sync::Arc;
use tracing::{error, info, warn};

/// Callbacks observing the progress of garbage collection cycles.
///
/// All methods default to no-ops so implementors can pick the events they
/// care about.
pub trait GcMonitor: Send + Sync {
    /// A informational progress message.
    fn info(&self, _message: &str) {}

    /// A condition worth attention but not fatal to the cycle.
    fn warn(&self, _message: &str) {}

    /// An error that terminated the cycle.
    fn error(&self, _message: &str) {}

    /// The cycle decided to skip compaction.
    fn skipped(&self, _reason: &str) {}

    /// Compaction succeeded and the head points at the new generation.
    fn compacted(&self) {}

    /// Cleanup finished; `reclaimed` bytes were freed, `current_size` is
    /// the repository size afterwards.
    fn cleaned(&self, _reclaimed: u64, _current_size: u64) {}
}

/// A monitor that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMonitor;

impl GcMonitor for NullMonitor {}

/// A monitor that logs every event and optionally forwards it.
pub struct LoggingMonitor {
    delegate: Option<Arc<dyn GcMonitor>>,
}

impl LoggingMonitor {
    /// Creates a monitor that only logs.
    #[must_use]
    pub fn new() -> Self {
        Self { delegate: None }
    }

    /// Creates a monitor that logs and forwards events.
    #[must_use]
    pub fn with_delegate(delegate: Arc<dyn GcMonitor>) -> Self {
        Self {
            delegate: Some(delegate),
        }
    }
}

impl Default for LoggingMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl GcMonitor for LoggingMonitor {
    fn info(&self, message: &str) {
        info!(target: "arbordb::gc", "{message}");
        if let Some(delegate) = &self.delegate {
            delegate.info(message);
        }
    }

    fn warn(&self, message: &str) {
        warn!(target: "arbordb::gc", "{message}");
        if let Some(delegate) = &self.delegate {
            delegate.warn(message);
        }
    }

    fn error(&self, message: &str) {
        error!(target: "arbordb::gc", "{message}");
        if let Some(delegate) = &self.delegate {
            delegate.error(message);
        }
    }

    fn skipped(&self, reason: &str) {
        info!(target: "arbordb::gc", "skipped: {reason}");
        if let Some(delegate) = &self.delegate {
            delegate.skipped(reason);
        }
    }

    fn compacted(&self) {
        if let Some(delegate) = &self.delegate {
            delegate.compacted();
        }
    }

    fn cleaned(&self, reclaimed: u64, current_size: u64) {
        info!(
            target: "arbordb::gc",
            reclaimed, current_size, "cleanup finished"
        );
        if let Some(delegate) = &self.delegate {
            delegate.cleaned(reclaimed, current_size);
        }
    }
}

impl std::fmt::Debug for LoggingMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoggingMonitor")
            .field("delegated", &self.delegate.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        events: AtomicUsize,
    }

    impl GcMonitor for Counting {
        fn info(&self, _message: &str) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }

        fn cleaned(&self, _reclaimed: u64, _current_size: u64) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn logging_monitor_forwards() {
        let counting = Arc::new(Counting::default());
        let monitor = LoggingMonitor::with_delegate(counting.clone());

        monitor.info("compaction started");
        monitor.cleaned(1024, 4096);
        // Events the delegate does not override are dropped silently.
        monitor.skipped("paused");

        assert_eq!(counting.events.load(Ordering::SeqCst), 2);
    }
}
