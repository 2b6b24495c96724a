//! Lazy kind -> controller registry bound to the shared cache.

use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use rudder_core::{GvkId, RudderResult, Scheme, SourceCache};

use crate::Controller;

/// Maps kinds to their controllers, constructing each lazily on first
/// reference and binding it to the shared cache.
pub struct ControllerFactory {
    scheme: Arc<Scheme>,
    cache: Arc<dyn SourceCache>,
    controllers: Mutex<FxHashMap<GvkId, Controller>>,
}

impl ControllerFactory {
    pub fn new(scheme: Arc<Scheme>, cache: Arc<dyn SourceCache>) -> Self {
        Self { scheme, cache, controllers: Mutex::new(FxHashMap::default()) }
    }

    pub fn scheme(&self) -> &Arc<Scheme> {
        &self.scheme
    }

    pub fn cache(&self) -> &Arc<dyn SourceCache> {
        &self.cache
    }

    /// Controller for `gvk`, constructed on first reference. Construction
    /// failures (unknown kind, source errors) surface to the caller and are
    /// not retried here. Concurrent first callers converge on one instance.
    pub async fn for_kind(&self, gvk: &GvkId) -> RudderResult<Controller> {
        if let Some(existing) = self.controllers.lock().await.get(gvk) {
            return Ok(existing.clone());
        }
        // Validate the kind before constructing anything.
        self.scheme.lookup(gvk)?;
        let source = self.cache.source_for(gvk).await?;
        let mut controllers = self.controllers.lock().await;
        if let Some(existing) = controllers.get(gvk) {
            return Ok(existing.clone());
        }
        let controller = Controller::new(gvk.clone(), source);
        controllers.insert(gvk.clone(), controller.clone());
        Ok(controller)
    }

    /// Start every currently-registered controller. Valid with zero
    /// controllers; controllers registered later self-start through the
    /// façade.
    pub async fn start(&self, cancel: &CancellationToken, workers: usize) {
        let controllers: Vec<Controller> =
            self.controllers.lock().await.values().cloned().collect();
        info!(controllers = controllers.len(), workers, "starting controllers");
        for controller in &controllers {
            controller.start(cancel, workers);
        }
    }

    /// Sweep backoff bookkeeping across all controllers.
    pub async fn purge_idle(&self, max_age: Duration) {
        for controller in self.controllers.lock().await.values() {
            controller.purge_idle(max_age);
        }
    }
}
