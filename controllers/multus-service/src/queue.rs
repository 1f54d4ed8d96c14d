//! Rate-limited work queue.
//!
//! Keys are handed out in FIFO order and deduplicated: a key that is already
//! waiting is not queued twice, and a key that is being processed is only
//! marked dirty and goes back on the queue once its worker calls `done`.
//! That gives at most one worker per key at any time while different keys are
//! processed in parallel.

use crate::backoff::RateLimiter;
use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug)]
struct QueueState<K> {
    queue: VecDeque<K>,
    /// Keys that need processing: queued, or re-added while in flight
    dirty: HashSet<K>,
    /// Keys currently held by a worker
    processing: HashSet<K>,
    shutting_down: bool,
}

/// Deduplicating work queue with rate-limited requeues
pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    limiter: Box<dyn RateLimiter<K>>,
}

impl<K> std::fmt::Debug for WorkQueue<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue").finish_non_exhaustive()
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static,
{
    pub fn new(limiter: Box<dyn RateLimiter<K>>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            limiter,
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks `item` as needing processing. Never blocks on I/O.
    pub fn add(&self, item: K) {
        {
            let mut state = self.lock();
            if state.shutting_down {
                debug!("Queue is shutting down, dropping {:?}", item);
                return;
            }
            if !state.dirty.insert(item.clone()) {
                return;
            }
            if state.processing.contains(&item) {
                return;
            }
            state.queue.push_back(item);
        }
        self.notify.notify_one();
    }

    /// Adds `item` once `delay` has passed.
    pub fn add_after(self: &Arc<Self>, item: K, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Adds `item` after the rate limiter says it may be retried.
    pub fn add_rate_limited(self: &Arc<Self>, item: K) {
        let delay = self.limiter.when(&item);
        debug!("Requeueing {:?} in {:?}", item, delay);
        self.add_after(item, delay);
    }

    /// Clears the retry history of `item`.
    pub fn forget(&self, item: &K) {
        self.limiter.forget(item);
    }

    /// How many times `item` has been requeued since it was last forgotten.
    pub fn num_requeues(&self, item: &K) -> u32 {
        self.limiter.num_requeues(item)
    }

    /// Waits for the next key. Returns `None` once the queue is shut down;
    /// keys still waiting at that point are abandoned.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before looking so an add in between is not missed
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

    /// Releases `item` after processing. If it was re-added meanwhile it is
    /// queued again.
    pub fn done(&self, item: &K) {
        let requeued = {
            let mut state = self.lock();
            state.processing.remove(item);
            if state.dirty.contains(item) && !state.shutting_down {
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

    /// Wraps `item` so that `done` is called when the guard is dropped,
    /// including when the worker panics.
    pub fn processing(&self, item: K) -> ProcessingGuard<'_, K> {
        ProcessingGuard { queue: self, item }
    }

    /// Number of keys waiting to be handed out.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops handing out keys and wakes every waiting worker.
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}

/// Key held by a worker; released back to the queue on drop
pub struct ProcessingGuard<'a, K>
where
    K: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static,
{
    queue: &'a WorkQueue<K>,
    item: K,
}

impl<K> ProcessingGuard<'_, K>
where
    K: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static,
{
    pub fn item(&self) -> &K {
        &self.item
    }
}

impl<K> Drop for ProcessingGuard<'_, K>
where
    K: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static,
{
    fn drop(&mut self) {
        self.queue.done(&self.item);
    }
}
