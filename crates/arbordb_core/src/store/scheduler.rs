//! Background task runner.
//!
//! The store runs three background workers: the periodic flush, the
//! triggered compaction, and the periodic disk-space probe. Each worker is
//! a named thread waiting on its own condition variable, so shutdown is a
//! single signal-and-join point.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Wakes a background task out of turn or shuts it down.
pub(crate) struct TaskSignal {
    state: Mutex<TaskState>,
    condvar: Condvar,
}

#[derive(Default)]
struct TaskState {
    shutdown: bool,
    triggered: bool,
}

impl TaskSignal {
    fn new() -> Self {
        Self {
            state: Mutex::new(TaskState::default()),
            condvar: Condvar::new(),
        }
    }

    /// Requests an immediate run of the task.
    pub(crate) fn trigger(&self) {
        self.state.lock().triggered = true;
        self.condvar.notify_all();
    }

    fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.condvar.notify_all();
    }

    /// Waits for the next run. Returns `false` when shutting down.
    fn await_run(&self, interval: Option<Duration>) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return false;
            }
            if state.triggered {
                state.triggered = false;
                return true;
            }
            match interval {
                Some(interval) => {
                    if self.condvar.wait_for(&mut state, interval).timed_out() {
                        return !state.shutdown;
                    }
                }
                None => self.condvar.wait(&mut state),
            }
        }
    }
}

/// Owns the background worker threads of one store.
pub(crate) struct TaskRunner {
    workers: Vec<(Arc<TaskSignal>, JoinHandle<()>)>,
}

impl TaskRunner {
    pub(crate) fn new() -> Self {
        Self {
            workers: Vec::new(),
        }
    }

    /// Spawns a worker. With an interval the task runs periodically and on
    /// trigger; without one it runs only when triggered.
    pub(crate) fn spawn(
        &mut self,
        name: &str,
        interval: Option<Duration>,
        task: impl Fn() + Send + 'static,
    ) -> Arc<TaskSignal> {
        let signal = Arc::new(TaskSignal::new());
        let worker_signal = Arc::clone(&signal);
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while worker_signal.await_run(interval) {
                    task();
                }
            })
            .expect("failed to spawn background worker");
        self.workers.push((signal.clone(), handle));
        signal
    }

    /// Signals every worker to stop and joins them.
    pub(crate) fn shutdown(self) {
        for (signal, _) in &self.workers {
            signal.shutdown();
        }
        for (_, handle) in self.workers {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[test]
    fn periodic_task_runs() {
        let mut runner = TaskRunner::new();
        let count = Arc::new(AtomicUsize::new(0));
        let task_count = Arc::clone(&count);

        runner.spawn("test-periodic", Some(Duration::from_millis(5)), move || {
            task_count.fetch_add(1, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(60));
        runner.shutdown();
        assert!(count.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn triggered_task_waits_for_trigger() {
        let mut runner = TaskRunner::new();
        let count = Arc::new(AtomicUsize::new(0));
        let task_count = Arc::clone(&count);

        let signal = runner.spawn("test-triggered", None, move || {
            task_count.fetch_add(1, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        signal.trigger();
        let deadline = Instant::now() + Duration::from_secs(1);
        while count.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        runner.shutdown();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn shutdown_stops_workers_promptly() {
        let mut runner = TaskRunner::new();
        runner.spawn("test-slow", Some(Duration::from_secs(3600)), || {});

        let start = Instant::now();
        runner.shutdown();
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
