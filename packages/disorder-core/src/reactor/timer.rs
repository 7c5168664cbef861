//! Lazily-cancelled timer heap.
//!
//! A binary heap ordered by absolute deadline, where cancelling a timer
//! just flips a flag instead of restructuring the heap. A background task
//! sleeps until the next live deadline and is woken early whenever a
//! sooner timer is pushed.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

/// A handle to a scheduled timer. Dropping it does not cancel the timer;
/// call [`TimerHandle::cancel`] explicitly.
#[derive(Clone)]
pub struct TimerHandle {
    id: u64,
    active: Arc<std::sync::atomic::AtomicBool>,
}

impl TimerHandle {
    /// Cancels the timer. If it has already fired, this is a no-op.
    pub fn cancel(&self) {
        self.active.store(false, AtomicOrdering::Relaxed);
    }
}

struct Entry {
    deadline: Instant,
    id: u64,
    active: Arc<std::sync::atomic::AtomicBool>,
    callback: Box<dyn FnOnce() + Send>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest deadline sorts
        // to the top.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// A min-heap of pending timeouts driven by a single background task.
pub struct TimerWheel {
    heap: Mutex<BinaryHeap<Entry>>,
    notify: Notify,
    next_id: AtomicU64,
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerWheel {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Schedules `callback` to run after `delay`, returning a handle that
    /// can cancel it before it fires.
    pub fn schedule<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, AtomicOrdering::Relaxed);
        let active = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let entry = Entry {
            deadline: Instant::now() + delay,
            id,
            active: active.clone(),
            callback: Box::new(callback),
        };
        let wake_immediately = {
            let mut heap = self.heap.lock();
            let should_wake = heap
                .peek()
                .map_or(true, |top| entry.deadline < top.deadline);
            heap.push(entry);
            should_wake
        };
        if wake_immediately {
            self.notify.notify_one();
        }
        TimerHandle { id, active }
    }

    /// Runs the timer loop until `shutdown` fires. Intended to be spawned
    /// once as a background task from `bootstrap`.
    pub async fn run(self: Arc<Self>, shutdown: tokio_util::sync::CancellationToken) {
        loop {
            let next_deadline = {
                let mut heap = self.heap.lock();
                loop {
                    match heap.peek() {
                        Some(entry) if !entry.active.load(AtomicOrdering::Relaxed) => {
                            heap.pop();
                            continue;
                        }
                        Some(entry) => break Some(entry.deadline),
                        None => break None,
                    }
                }
            };

            let sleep = async {
                match next_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = sleep => self.fire_due(),
                _ = self.notify.notified() => {}
            }
        }
    }

    fn fire_due(&self) {
        let now = Instant::now();
        loop {
            let due = {
                let mut heap = self.heap.lock();
                match heap.peek() {
                    Some(entry) if !entry.active.load(AtomicOrdering::Relaxed) => {
                        heap.pop();
                        continue;
                    }
                    Some(entry) if entry.deadline <= now => heap.pop(),
                    _ => None,
                }
            };
            match due {
                Some(entry) => (entry.callback)(),
                None => break,
            }
        }
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.heap.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn fires_after_delay() {
        let wheel = Arc::new(TimerWheel::new());
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        wheel.schedule(Duration::from_millis(5), move || {
            fired2.store(true, AtomicOrdering::SeqCst);
        });

        let shutdown = tokio_util::sync::CancellationToken::new();
        let runner = tokio::spawn(wheel.clone().run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.cancel();
        let _ = runner.await;

        assert!(fired.load(AtomicOrdering::SeqCst));
    }

    #[tokio::test]
    async fn cancelled_timer_does_not_fire() {
        let wheel = Arc::new(TimerWheel::new());
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let handle = wheel.schedule(Duration::from_millis(10), move || {
            fired2.store(true, AtomicOrdering::SeqCst);
        });
        handle.cancel();

        let shutdown = tokio_util::sync::CancellationToken::new();
        let runner = tokio::spawn(wheel.clone().run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.cancel();
        let _ = runner.await;

        assert!(!fired.load(AtomicOrdering::SeqCst));
    }

    #[test]
    fn earlier_deadline_wakes_loop() {
        let wheel = TimerWheel::new();
        wheel.schedule(Duration::from_secs(10), || {});
        assert_eq!(wheel.pending_count(), 1);
        wheel.schedule(Duration::from_millis(1), || {});
        assert_eq!(wheel.pending_count(), 2);
    }
}
