//! Deduplicating, rate-limited work queue
//!
//! Reimplements the classic controller work queue contract on tokio:
//!
//! - An item added while already waiting in the queue is dropped (dedup).
//! - An item added while a worker is processing it is re-queued only once the
//!   worker calls [`WorkQueue::done`], so two workers never observe the same
//!   item concurrently.
//! - [`WorkQueue::add_rate_limited`] re-adds an item after a per-item
//!   exponential back-off; [`WorkQueue::forget`] resets the back-off.
//! - [`WorkQueue::shut_down`] lets workers drain the backlog, then makes
//!   [`WorkQueue::get`] return `None`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

/// One unit of work for the transport controller
///
/// The queue carries two kinds of entries; the discriminator survives the
/// round trip through the queue so workers can dispatch on it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum WorkItem {
    /// Reconcile the Binding with this name
    Binding(String),
    /// Re-collect the properties of the destination whose inventory record has this name
    RecollectProperties(String),
}

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1000);

struct QueueState<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    failures: HashMap<T, u32>,
    shutting_down: bool,
}

impl<T> Default for QueueState<T> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            failures: HashMap::new(),
            shutting_down: false,
        }
    }
}

/// Rate-limited work queue with in-flight deduplication
pub struct WorkQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

impl<T> Default for WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + std::fmt::Debug + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + std::fmt::Debug + 'static,
{
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    /// Add an item for processing
    ///
    /// Duplicates of an item already waiting are dropped. If the item is
    /// currently being processed it is re-queued when that pass finishes.
    pub fn add(&self, item: T) {
        {
            let mut state = self.state.lock().expect("work queue mutex poisoned");
            if state.shutting_down {
                return;
            }
            if !state.dirty.insert(item.clone()) {
                return; // already waiting or already marked for a further pass
            }
            if state.processing.contains(&item) {
                return; // re-queued by done() once the current pass completes
            }
            state.queue.push_back(item);
        }
        self.notify.notify_one();
    }

    /// Re-add an item after its per-item exponential back-off delay
    pub fn add_rate_limited(self: &Arc<Self>, item: T) {
        let delay = {
            let mut state = self.state.lock().expect("work queue mutex poisoned");
            if state.shutting_down {
                return;
            }
            let failures = state.failures.entry(item.clone()).or_insert(0);
            *failures += 1;
            backoff_delay(*failures)
        };
        debug!(?item, ?delay, "re-queueing item after back-off");
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Clear the back-off history of an item after it was processed successfully
    /// (or is being dropped for good)
    pub fn forget(&self, item: &T) {
        let mut state = self.state.lock().expect("work queue mutex poisoned");
        state.failures.remove(item);
    }

    /// Mark the current pass over an item as finished
    ///
    /// If the item was re-added while it was being processed, it goes back on
    /// the queue now.
    pub fn done(&self, item: &T) {
        let requeued = {
            let mut state = self.state.lock().expect("work queue mutex poisoned");
            state.processing.remove(item);
            if state.dirty.contains(item) {
                state.queue.push_back(item.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Wait for the next item
    ///
    /// Returns `None` once the queue is shut down and the backlog is drained.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().expect("work queue mutex poisoned");
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
                if state.shutting_down {
                    drop(state);
                    // cascade the wake-up so every parked worker observes shutdown
                    self.notify.notify_one();
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Begin shutdown: no new items are accepted, workers drain the backlog
    pub fn shut_down(&self) {
        {
            let mut state = self.state.lock().expect("work queue mutex poisoned");
            state.shutting_down = true;
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Number of items waiting (excludes items being processed)
    pub fn len(&self) -> usize {
        self.state.lock().expect("work queue mutex poisoned").queue.len()
    }

    /// Returns true if no items are waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn backoff_delay(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(63);
    BASE_DELAY
        .checked_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX))
        .unwrap_or(MAX_DELAY)
        .min(MAX_DELAY)
}
