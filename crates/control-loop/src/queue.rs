//! Deduplicating, single-flight work queue.
//!
//! Items move through three states:
//! - *queued*: waiting in FIFO order for a worker; adding it again is a no-op
//! - *processing*: handed out by [`WorkQueue::get`], not yet passed to [`WorkQueue::done`]
//! - *pending*: added again while processing; queued once the running item is done
//!
//! An item is never handed to two workers at once, and every [`WorkQueue::add`]
//! is followed by at least one more run of that item.

use crate::backoff::{ExponentialBackoff, ItemBackoff};
use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::trace;

struct QueueState<T> {
    queue: VecDeque<T>,
    // Items waiting to run, queued or pending
    dirty: HashSet<T>,
    processing: HashSet<T>,
    backoff: ItemBackoff<T>,
    shutting_down: bool,
}

struct Shared<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

/// Work queue shared between event sources and workers.
///
/// Clones refer to the same queue.
pub struct WorkQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue").finish_non_exhaustive()
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + std::fmt::Debug + 'static,
{
    /// Create an empty queue retrying failed items with `backoff`.
    pub fn new(backoff: ExponentialBackoff) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    backoff: ItemBackoff::new(backoff),
                    shutting_down: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Add `item`, unless it is already waiting or the queue is shut down.
    pub fn add(&self, item: T) {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            trace!(?item, "Item is running, holding it as pending");
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.shared.notify.notify_one();
    }

    /// Wait for the next item. Returns `None` once the queue is shut down.
    ///
    /// The caller must pass the item to [`WorkQueue::done`] when finished.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
            }

            notified.await;
        }
    }

    /// Mark `item` as finished, queueing it again if it was added meanwhile.
    pub fn done(&self, item: &T) {
        let mut state = self.lock();
        state.processing.remove(item);
        if state.shutting_down || !state.dirty.contains(item) {
            return;
        }
        state.queue.push_back(item.clone());
        drop(state);
        self.shared.notify.notify_one();
    }

    /// Add `item` after `delay` has elapsed.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        if self.is_shutting_down() {
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Add `item` after its per-item backoff delay and return that delay.
    ///
    /// Each call without an intervening [`WorkQueue::forget`] doubles the delay.
    pub fn add_rate_limited(&self, item: T) -> Duration {
        let delay = self.lock().backoff.next_delay(&item);
        self.add_after(item, delay);
        delay
    }

    /// Reset the backoff of `item`.
    pub fn forget(&self, item: &T) {
        self.lock().backoff.forget(item);
    }

    /// Number of consecutive rate-limited requeues of `item`.
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.lock().backoff.failures(item)
    }

    /// Number of items waiting for a worker.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Returns true if no item is waiting for a worker.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting items, drop the waiting ones and wake every worker.
    ///
    /// Items currently processing are unaffected.
    pub fn shut_down(&self) {
        {
            let mut state = self.lock();
            state.shutting_down = true;
            state.queue.clear();
            state.dirty.clear();
        }
        self.shared.notify.notify_waiters();
    }

    /// Returns true once [`WorkQueue::shut_down`] has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}
