// Rate-limited work queue

//! De-duplicating work queue with per-key exponential backoff
//!
//! An item is either pending, being processed, or both (re-added while a
//! worker holds it). A pending item is queued at most once and an item is
//! never handed to two workers at the same time: re-adding an item that is
//! being processed parks it until [`WorkQueue::done`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

/// Delay before the first retry
pub const BASE_DELAY: Duration = Duration::from_millis(5);
/// Upper bound for the retry delay
pub const MAX_DELAY: Duration = Duration::from_secs(1000);

struct State<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    failures: HashMap<T, u32>,
    shutting_down: bool,
}

/// Work queue keyed by `T`, usually a `namespace/name` string
pub struct WorkQueue<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + 'static,
{
    /// Queue with the default 5ms to 1000s retry backoff
    pub fn new() -> Self {
        Self::with_backoff(BASE_DELAY, MAX_DELAY)
    }

    /// Queue whose retry delay starts at `base_delay` and doubles per
    /// failure up to `max_delay`
    pub fn with_backoff(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                failures: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            base_delay,
            max_delay,
        }
    }

    /// Queue an item unless it is already pending. Returns false after shutdown.
    pub async fn add(&self, item: T) -> bool {
        let mut state = self.state.lock().await;
        if state.shutting_down {
            return false;
        }
        if !state.dirty.insert(item.clone()) {
            return true;
        }
        if !state.processing.contains(&item) {
            state.queue.push_back(item);
            self.notify.notify_one();
        }
        true
    }

    /// Wait for the next item. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
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

    /// Mark an item as finished, re-queueing it if it was added meanwhile
    pub async fn done(&self, item: &T) {
        let mut state = self.state.lock().await;
        state.processing.remove(item);
        if !state.shutting_down && state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            self.notify.notify_one();
        }
    }

    /// Reset the failure count of an item
    pub async fn forget(&self, item: &T) {
        self.state.lock().await.failures.remove(item);
    }

    /// Number of rate-limited re-adds since the last [`forget`](Self::forget)
    pub async fn num_requeues(&self, item: &T) -> u32 {
        self.state
            .lock()
            .await
            .failures
            .get(item)
            .copied()
            .unwrap_or(0)
    }

    /// Re-add an item after its backoff delay
    pub async fn add_rate_limited(self: &Arc<Self>, item: T) {
        let delay = {
            let mut state = self.state.lock().await;
            if state.shutting_down {
                return;
            }
            let failures = state.failures.entry(item.clone()).or_insert(0);
            let delay = backoff_delay(self.base_delay, self.max_delay, *failures);
            *failures += 1;
            delay
        };

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item).await;
        });
    }

    /// Number of pending items
    pub async fn len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    /// True when nothing is pending
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// True once [`WorkQueue::shut_down`] was called
    pub async fn is_shutting_down(&self) -> bool {
        self.state.lock().await.shutting_down
    }

    /// Stop accepting items, drop pending ones and release waiting workers.
    /// Returns the number of dropped items.
    pub async fn shut_down(&self) -> usize {
        let dropped = {
            let mut state = self.state.lock().await;
            state.shutting_down = true;
            let dropped = state.queue.len();
            state.queue.clear();
            state.dirty.clear();
            dropped
        };
        self.notify.notify_waiters();
        dropped
    }
}

impl<T> Default for WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// `base * 2^failures`, capped at `max`
pub fn backoff_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    let factor = 1u32.checked_shl(failures).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}
