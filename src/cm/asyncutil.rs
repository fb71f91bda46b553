use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Tracks the daemon's spawned tasks and carries the process-wide
/// cancellation flag. Placement tasks and maintenance loops check
/// `is_cancelled()` so shutdown does not strand background work.
#[derive(Debug, Clone, Default)]
pub struct TaskTracker {
    active: Arc<AtomicUsize>,
    spawned_total: Arc<AtomicUsize>,
    cancelled: Arc<AtomicBool>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current number of tasks that are alive (running or pending).
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Total number of tasks ever spawned via this tracker.
    pub fn total_spawned(&self) -> usize {
        self.spawned_total.load(Ordering::SeqCst)
    }

    /// Flip the cancellation flag. Tasks observe it cooperatively.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Spawn a Tokio task whose lifetime is counted via an RAII guard. The
    /// guard drops on normal completion, panic, or cancellation alike.
    pub fn spawn<F, T>(&self, fut: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.spawned_total.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_add(1, Ordering::SeqCst);

        let guard = TaskGuard {
            counter: Arc::clone(&self.active),
        };

        tokio::spawn(async move {
            let _guard = guard;
            fut.await
        })
    }

    /// Spawn a counted task on the blocking pool (for /proc and cgroupfs
    /// scans that would otherwise stall the runtime).
    pub fn spawn_blocking<F, T>(&self, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.spawned_total.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_add(1, Ordering::SeqCst);

        let guard = TaskGuard {
            counter: Arc::clone(&self.active),
        };

        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            f()
        })
    }
}

#[derive(Debug)]
struct TaskGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_spawn_counts() {
        let tracker = TaskTracker::new();
        let h = tracker.spawn(async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            7
        });
        assert_eq!(tracker.total_spawned(), 1);
        assert_eq!(tracker.active_count(), 1);
        assert_eq!(h.await.unwrap(), 7);
        // Guard drop races the JoinHandle completion by a hair.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_flag_shared_across_clones() {
        let tracker = TaskTracker::new();
        let clone = tracker.clone();
        assert!(!clone.is_cancelled());
        tracker.cancel();
        assert!(clone.is_cancelled());
    }

    #[tokio::test]
    async fn test_panicking_task_releases_guard() {
        let tracker = TaskTracker::new();
        let h = tracker.spawn(async {
            panic!("boom");
        });
        assert!(h.await.is_err());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(tracker.active_count(), 0);
    }
}
