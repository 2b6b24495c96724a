//! Rudder backend façade: the single entry point external callers use to
//! start the runtime, register watches, and request triggers. Composes the
//! controller factory, the shared cache, and the field indexer, and hides
//! their startup ordering.

#![forbid(unsafe_code)]

mod indexer;

pub use indexer::field_index_name;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use rudder_controller::{ControllerFactory, DEFAULT_WORKERS};
use rudder_core::{
    split_key, GvkId, Handler, KindSource, RudderError, RudderResult, Scheme, SourceCache,
    TRIGGER_PREFIX,
};

const PURGE_INTERVAL: Duration = Duration::from_secs(60);
const PURGE_MAX_AGE: Duration = Duration::from_secs(15 * 60);

/// Runtime entry point. `start` runs the cache-sync barrier; `watch`
/// registers indexers and handlers; `trigger` requests redelivery of a key.
pub struct Backend {
    factory: Arc<ControllerFactory>,
    scheme: Arc<Scheme>,
    cache: Arc<dyn SourceCache>,
    cancel: CancellationToken,
    started: AtomicBool,
    /// Kinds whose field capability has already been probed.
    indexed: Mutex<FxHashSet<GvkId>>,
}

impl Backend {
    pub fn new(scheme: Arc<Scheme>, cache: Arc<dyn SourceCache>) -> Self {
        let factory = Arc::new(ControllerFactory::new(scheme.clone(), cache.clone()));
        Self {
            factory,
            scheme,
            cache,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            indexed: Mutex::new(FxHashSet::default()),
        }
    }

    pub fn scheme(&self) -> &Arc<Scheme> {
        &self.scheme
    }

    /// Start every registered controller, then block until the shared cache
    /// reports an initial full listing for every registered kind. No handler
    /// observes a partially-populated cache. The one-time post-start purge
    /// task is spawned by exactly one successful call, even under races.
    pub async fn start(&self) -> RudderResult<()> {
        self.factory.start(&self.cancel, DEFAULT_WORKERS).await;
        self.cache.wait_for_sync(&self.cancel).await.map_err(|err| match err {
            RudderError::Canceled => {
                RudderError::CacheSync("canceled before caches synced".into())
            }
            other => other,
        })?;
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.spawn_purge();
        }
        info!("backend started");
        Ok(())
    }

    /// Register `handler` for `gvk` under `name`: field indexers first (so
    /// dispatch never races ahead of index availability), then the handler.
    /// After the backend has started, the kind's controller self-starts; a
    /// pre-start registration is started in bulk by `start`.
    pub async fn watch(
        &self,
        gvk: &GvkId,
        name: &str,
        handler: Arc<dyn Handler>,
    ) -> RudderResult<()> {
        let controller = self.factory.for_kind(gvk).await?;
        self.register_indexers(gvk).await?;
        controller.register_handler(format!("{name} {gvk}"), handler);
        if self.started.load(Ordering::Acquire) {
            controller.start(&self.cancel, DEFAULT_WORKERS);
        }
        Ok(())
    }

    /// Request redelivery of `key`. A delayed trigger is scheduled against
    /// the key's scope (no separator means cluster scope); an immediate one
    /// is tagged with the reserved prefix so consumers can tell synthetic
    /// triggers from watch-source notifications.
    pub async fn trigger(&self, gvk: &GvkId, key: &str, delay: Duration) -> RudderResult<()> {
        let controller = self.factory.for_kind(gvk).await?;
        if delay > Duration::ZERO {
            let (namespace, name) = split_key(key);
            controller.enqueue_after(namespace, name, delay);
        } else {
            controller.enqueue_key(&format!("{TRIGGER_PREFIX}{key}"));
        }
        Ok(())
    }

    /// Raw read access to the mirrored objects of `gvk`.
    pub async fn source_for(&self, gvk: &GvkId) -> RudderResult<Arc<dyn KindSource>> {
        self.cache.source_for(gvk).await
    }

    /// Kind identifier recorded on a raw object.
    pub fn gvk_for(&self, obj: &serde_json::Value) -> RudderResult<GvkId> {
        self.scheme.gvk_for(obj)
    }

    pub fn is_namespaced(&self, gvk: &GvkId) -> RudderResult<bool> {
        self.scheme.is_namespaced(gvk)
    }

    /// Cancel the lifecycle: queues shut down, workers drain and exit, and
    /// pending delayed triggers are abandoned. In-flight handler invocations
    /// run to completion.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    fn spawn_purge(&self) {
        let factory = Arc::clone(&self.factory);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PURGE_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => factory.purge_idle(PURGE_MAX_AGE).await,
                }
            }
            debug!("purge task stopped");
        });
    }
}
