//! Keyed work queue: coalesces notifications per key, guarantees at most one
//! in-flight processing attempt per key, and supports delayed re-enqueue.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

/// Work queue keyed by object identity.
///
/// A queued key lives in the dirty set plus the ready queue; a key handed to
/// a worker moves to the processing set. `add` for an in-flight key only
/// marks it dirty, and `done` re-queues it, so a notification arriving during
/// processing is deferred rather than lost or double-delivered.
///
/// Delayed adds collapse per key to the earliest outstanding deadline: one
/// timer generation is live at a time, and a superseded timer fires as a
/// no-op. A direct `add` clears the pending timer, since the immediate
/// delivery satisfies the outstanding request.
#[derive(Clone, Default)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    notify: Notify,
}

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    dirty: FxHashSet<String>,
    processing: FxHashSet<String>,
    /// Pending delayed adds: key -> (live timer generation, deadline).
    pending: FxHashMap<String, (u64, Instant)>,
    next_gen: u64,
    shutting_down: bool,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `key` for processing. No-op if the key is already queued; if it
    /// is currently being processed it is re-queued when `done` is called.
    /// Ignored after shutdown.
    pub fn add(&self, key: &str) {
        let mut s = self.inner.state.lock();
        if s.shutting_down {
            return;
        }
        s.pending.remove(key);
        self.inner.add_locked(&mut s, key);
    }

    /// Queue `key` after `delay`. Multiple un-expired delayed adds for the
    /// same key collapse to the earliest deadline. Timers still pending at
    /// shutdown are abandoned.
    ///
    /// Must be called from within a tokio runtime.
    pub fn add_after(&self, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let deadline = Instant::now() + delay;
        let gen = {
            let mut s = self.inner.state.lock();
            if s.shutting_down {
                return;
            }
            if let Some((_, existing)) = s.pending.get(key) {
                if *existing <= deadline {
                    return;
                }
            }
            s.next_gen += 1;
            let gen = s.next_gen;
            s.pending.insert(key.to_string(), (gen, deadline));
            gen
        };
        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            inner.fire(&key, gen);
        });
    }

    /// Next key to process. Blocks until a key is ready or the queue shuts
    /// down. After shutdown the remaining queued keys drain, then `get`
    /// returns `None` immediately and forever.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register for wakeups before re-checking state, so an add or
            // shutdown racing with the check is not missed.
            notified.as_mut().enable();
            {
                let mut s = self.inner.state.lock();
                if let Some(key) = s.queue.pop_front() {
                    s.dirty.remove(&key);
                    s.processing.insert(key.clone());
                    if !s.queue.is_empty() {
                        // Permits do not stack; chain the wakeup.
                        self.inner.notify.notify_one();
                    }
                    metrics::gauge!("workqueue_depth", s.queue.len() as f64);
                    return Some(key);
                }
                if s.shutting_down {
                    self.inner.notify.notify_one();
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark processing of `key` finished. Re-queues the key if it was added
    /// again while in flight.
    pub fn done(&self, key: &str) {
        let mut s = self.inner.state.lock();
        s.processing.remove(key);
        if s.dirty.contains(key) {
            s.queue.push_back(key.to_string());
            metrics::counter!("workqueue_retained_total", 1u64);
            self.inner.notify.notify_one();
        }
    }

    /// Request shutdown: pending timers are abandoned, queued keys drain,
    /// and parked getters wake up.
    pub fn shut_down(&self) {
        let mut s = self.inner.state.lock();
        if s.shutting_down {
            return;
        }
        s.shutting_down = true;
        s.pending.clear();
        trace!(queued = s.queue.len(), "work queue shutting down");
        self.inner.notify.notify_waiters();
    }

    pub fn shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Inner {
    fn add_locked(&self, s: &mut State, key: &str) {
        if s.dirty.contains(key) {
            return;
        }
        s.dirty.insert(key.to_string());
        if s.processing.contains(key) {
            return;
        }
        s.queue.push_back(key.to_string());
        metrics::counter!("workqueue_adds_total", 1u64);
        metrics::gauge!("workqueue_depth", s.queue.len() as f64);
        self.notify.notify_one();
    }

    fn fire(&self, key: &str, gen: u64) {
        let mut s = self.state.lock();
        if s.shutting_down {
            return;
        }
        match s.pending.get(key) {
            Some((live, _)) if *live == gen => {
                s.pending.remove(key);
                self.add_locked(&mut s, key);
            }
            // Superseded by a newer timer or satisfied by a direct add.
            _ => {}
        }
    }
}
