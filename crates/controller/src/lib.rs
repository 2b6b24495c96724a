//! Per-kind controller: a worker pool pumping the keyed work queue and
//! invoking registered handlers in order.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rudder_core::{
    object_key, strip_trigger, EventSink, GvkId, Handler, KindSource, SourceEvent,
};
use rudder_queue::WorkQueue;

mod factory;
pub use factory::ControllerFactory;

/// Worker count used by bulk start and post-start self-start.
pub const DEFAULT_WORKERS: usize = 5;

const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Owns one work queue and one watch source for a single kind. Workers pop
/// keys, resolve the current object, and invoke every registered handler in
/// registration order. Cheap to clone; clones share one instance.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    gvk: GvkId,
    queue: WorkQueue,
    source: Arc<dyn KindSource>,
    handlers: RwLock<Vec<Registration>>,
    started: AtomicBool,
    failures: Mutex<FxHashMap<String, Failure>>,
}

#[derive(Clone)]
struct Registration {
    name: String,
    handler: Arc<dyn Handler>,
}

struct Failure {
    consecutive: u32,
    last_seen: Instant,
}

/// Feeds watch-source events into the controller's queue.
struct QueueSink {
    queue: WorkQueue,
}

impl EventSink for QueueSink {
    fn on_event(&self, event: &SourceEvent) {
        self.queue.add(event.key());
    }
}

impl Controller {
    /// Bind a new controller to `source`, subscribing its queue to the
    /// source's event stream. Not yet started.
    pub fn new(gvk: GvkId, source: Arc<dyn KindSource>) -> Self {
        let queue = WorkQueue::new();
        source.subscribe(Arc::new(QueueSink { queue: queue.clone() }));
        Self {
            inner: Arc::new(ControllerInner {
                gvk,
                queue,
                source,
                handlers: RwLock::new(Vec::new()),
                started: AtomicBool::new(false),
                failures: Mutex::new(FxHashMap::default()),
            }),
        }
    }

    pub fn gvk(&self) -> &GvkId {
        &self.inner.gvk
    }

    /// Attach a handler under `name`. Registrations are permanent and
    /// invoked in order. When the controller is already running, current
    /// objects are replayed so the new handler observes existing state.
    pub fn register_handler(&self, name: impl Into<String>, handler: Arc<dyn Handler>) {
        let name = name.into();
        debug!(gvk = %self.inner.gvk, handler = %name, "handler registered");
        self.inner.handlers.write().push(Registration { name, handler });
        if self.inner.started.load(Ordering::Acquire) {
            for key in self.inner.source.keys() {
                self.inner.queue.add(&key);
            }
        }
    }

    /// Spawn the worker pool. Idempotent: a second call never spawns a
    /// duplicate worker set. Workers drain and exit once `cancel` fires and
    /// the queue empties; in-flight handler invocations run to completion.
    pub fn start(&self, cancel: &CancellationToken, workers: usize) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(gvk = %self.inner.gvk, workers, "controller starting");
        {
            let queue = self.inner.queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                queue.shut_down();
            });
        }
        for worker in 0..workers {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                inner.worker_loop(worker).await;
            });
        }
    }

    /// Shut the queue down directly, letting workers drain and exit.
    pub fn stop(&self) {
        self.inner.queue.shut_down();
    }

    /// Queue a raw key, trigger prefix and all.
    pub fn enqueue_key(&self, key: &str) {
        self.inner.queue.add(key);
    }

    /// Queue an object by scope after `delay`.
    pub fn enqueue_after(&self, namespace: &str, name: &str, delay: Duration) {
        self.inner.queue.add_after(&object_key(namespace, name), delay);
    }

    /// Drop backoff bookkeeping for keys idle longer than `max_age`.
    pub fn purge_idle(&self, max_age: Duration) {
        self.inner.failures.lock().retain(|_, f| f.last_seen.elapsed() < max_age);
    }
}

impl ControllerInner {
    async fn worker_loop(&self, worker: usize) {
        while let Some(key) = self.queue.get().await {
            self.process(&key).await;
            self.queue.done(&key);
        }
        debug!(gvk = %self.gvk, worker, "worker exiting");
    }

    /// One dispatch: resolve the current object (trigger prefix stripped for
    /// the lookup only) and run the handler chain. Handler errors are logged
    /// and re-queue the key with bounded backoff; they never stop the chain
    /// or crash the worker.
    async fn process(&self, key: &str) {
        let mut obj = self.source.get(strip_trigger(key));
        let handlers: Vec<Registration> = self.handlers.read().clone();
        let mut failed = false;
        for reg in &handlers {
            match reg.handler.handle(&self.gvk, key, obj.clone()).await {
                Ok(Some(next)) => obj = Some(next),
                Ok(None) => {}
                Err(err) => {
                    failed = true;
                    metrics::counter!("handler_errors_total", 1u64);
                    warn!(gvk = %self.gvk, key, handler = %reg.name, error = %err, "handler failed");
                }
            }
        }
        if failed {
            let delay = self.next_backoff(key);
            metrics::counter!("handler_retries_total", 1u64);
            debug!(gvk = %self.gvk, key, delay_ms = delay.as_millis() as u64, "requeueing after failure");
            self.queue.add_after(key, delay);
        } else {
            self.failures.lock().remove(key);
        }
    }

    fn next_backoff(&self, key: &str) -> Duration {
        let mut failures = self.failures.lock();
        let entry = failures
            .entry(key.to_string())
            .or_insert(Failure { consecutive: 0, last_seen: Instant::now() });
        entry.consecutive = entry.consecutive.saturating_add(1);
        entry.last_seen = Instant::now();
        let exp = entry.consecutive.saturating_sub(1).min(16);
        BACKOFF_BASE.saturating_mul(1 << exp).min(BACKOFF_CAP)
    }
}
