//! podtime work queue
//!
//! A deduplicating, rate-limited queue of keys shared by every worker:
//! - at most one pending entry per key (`add` coalesces),
//! - a key handed out by `get` is not handed out again until `done`,
//! - failed keys come back after a per-key backoff (`add_rate_limited`),
//! - `shut_down` releases every blocked `get` at once.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

mod ratelimit;

pub use ratelimit::{
    default_controller_rate_limiter, BucketRateLimiter, ItemExponentialFailureRateLimiter, MaxOfRateLimiter,
    RateLimiter,
};

/// Cloneable handle to a shared work queue.
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

struct Inner<K> {
    state: Mutex<State<K>>,
    notify: Notify,
}

struct State<K> {
    /// Ready keys in FIFO order.
    queue: VecDeque<K>,
    /// Keys that need processing (queued, or re-added while processing).
    dirty: FxHashSet<K>,
    /// Keys currently held by a worker.
    processing: FxHashSet<K>,
    /// Keys in backoff with their earliest ready time.
    waiting: FxHashMap<K, Instant>,
    limiter: Box<dyn RateLimiter<K>>,
    shutting_down: bool,
}

impl<K: Eq + Hash + Clone> State<K> {
    /// Returns true when a new ready entry was queued.
    fn insert(&mut self, key: K) -> bool {
        if self.dirty.contains(&key) {
            return false;
        }
        self.dirty.insert(key.clone());
        if self.processing.contains(&key) {
            return false;
        }
        self.queue.push_back(key);
        true
    }

    fn promote_ready(&mut self, now: Instant) {
        if self.waiting.is_empty() {
            return;
        }
        let mut ready: Vec<(K, Instant)> = self
            .waiting
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(k, at)| (k.clone(), *at))
            .collect();
        ready.sort_by_key(|(_, at)| *at);
        for (key, _) in ready {
            self.waiting.remove(&key);
            self.insert(key);
        }
    }

    fn next_deadline(&self) -> Option<Instant> { self.waiting.values().min().copied() }

    /// Keep the earliest ready time per key. Returns true if the deadline moved earlier.
    fn schedule(&mut self, key: K, at: Instant) -> bool {
        match self.waiting.get_mut(&key) {
            Some(existing) if *existing <= at => false,
            Some(existing) => {
                *existing = at;
                true
            }
            None => {
                self.waiting.insert(key, at);
                true
            }
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new(limiter: impl RateLimiter<K> + 'static) -> Self {
        let state = State {
            queue: VecDeque::new(),
            dirty: FxHashSet::default(),
            processing: FxHashSet::default(),
            waiting: FxHashMap::default(),
            limiter: Box::new(limiter),
            shutting_down: false,
        };
        Self { inner: Arc::new(Inner { state: Mutex::new(state), notify: Notify::new() }) }
    }

    /// Queue with [`default_controller_rate_limiter`].
    pub fn with_default_rate_limiter() -> Self { Self::new(default_controller_rate_limiter()) }

    fn lock(&self) -> MutexGuard<'_, State<K>> { self.inner.state.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Mark `key` as needing processing. No-op if already pending, waiting out a
    /// backoff, or after shutdown.
    pub fn add(&self, key: K) {
        let mut st = self.lock();
        if st.shutting_down || st.waiting.contains_key(&key) {
            return;
        }
        if st.insert(key) {
            metrics::counter!("workqueue_adds", 1u64);
            self.inner.notify.notify_one();
        }
    }

    /// Add `key` once `delay` has elapsed. Only the earliest pending deadline per key is kept.
    pub fn add_after(&self, key: K, delay: Duration) {
        let mut st = self.lock();
        if st.shutting_down {
            return;
        }
        self.schedule_locked(&mut st, key, delay);
    }

    /// Add `key` after the rate limiter's delay for it; counts one more retry.
    pub fn add_rate_limited(&self, key: K) {
        let mut st = self.lock();
        if st.shutting_down {
            return;
        }
        let delay = st.limiter.when(&key);
        metrics::counter!("workqueue_retries", 1u64);
        trace!(delay_ms = delay.as_millis() as u64, "rate limited requeue");
        self.schedule_locked(&mut st, key, delay);
    }

    fn schedule_locked(&self, st: &mut State<K>, key: K, delay: Duration) {
        if delay.is_zero() {
            if st.insert(key) {
                metrics::counter!("workqueue_adds", 1u64);
                self.inner.notify.notify_one();
            }
            return;
        }
        if st.schedule(key, Instant::now() + delay) {
            // sleeping getters must pick up the earlier deadline
            self.inner.notify.notify_waiters();
        }
    }

    /// Block until a key is ready. `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let deadline = {
                let mut st = self.lock();
                if st.shutting_down {
                    return None;
                }
                st.promote_ready(Instant::now());
                if let Some(key) = st.queue.pop_front() {
                    st.dirty.remove(&key);
                    st.processing.insert(key.clone());
                    if !st.queue.is_empty() {
                        self.inner.notify.notify_one();
                    }
                    return Some(key);
                }
                st.next_deadline()
            };
            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Finish the attempt for `key`. Must be called once per `get`.
    pub fn done(&self, key: &K) {
        let mut st = self.lock();
        st.processing.remove(key);
        if st.dirty.contains(key) && !st.shutting_down {
            st.queue.push_back(key.clone());
            self.inner.notify.notify_one();
        }
    }

    /// Reset retry state for `key` without touching queue membership.
    pub fn forget(&self, key: &K) { self.lock().limiter.forget(key); }

    pub fn num_requeues(&self, key: &K) -> u32 { self.lock().limiter.num_requeues(key) }

    /// Drop any pending or backoff entry for `key` and forget its retries.
    /// An attempt already in progress is left to finish. Returns true if an entry was dropped.
    pub fn remove(&self, key: &K) -> bool {
        let mut st = self.lock();
        let was_dirty = st.dirty.remove(key);
        let was_waiting = st.waiting.remove(key).is_some();
        if was_dirty {
            st.queue.retain(|k| k != key);
        }
        st.limiter.forget(key);
        was_dirty || was_waiting
    }

    /// Stop handing out keys: every blocked and future `get` returns `None`.
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool { self.lock().shutting_down }

    /// Keys ready to be handed out.
    pub fn len(&self) -> usize { self.lock().queue.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Keys waiting out a backoff.
    pub fn num_waiting(&self) -> usize { self.lock().waiting.len() }
}
