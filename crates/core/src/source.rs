//! Watch-source capability: the informer-like surface the runtime consumes.
//! Implementations live elsewhere (in-memory store, kube adapter); the
//! runtime treats them as opaque thread-safe components.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use smallvec::SmallVec;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{GvkId, RudderResult, StoredObject};

/// A single change observed by a watch source.
#[derive(Debug, Clone)]
pub enum SourceEvent {
    Applied { key: String, obj: StoredObject },
    Deleted { key: String, obj: StoredObject },
}

impl SourceEvent {
    pub fn key(&self) -> &str {
        match self {
            SourceEvent::Applied { key, .. } | SourceEvent::Deleted { key, .. } => key,
        }
    }
}

/// Raw event subscriber. Callbacks run on the source's event path and must
/// not block.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: &SourceEvent);
}

/// Secondary index function: the scoped values an object contributes under
/// one index name. Two entries in the common namespaced case.
pub type IndexFn = Arc<dyn Fn(&Value) -> SmallVec<[String; 2]> + Send + Sync>;

/// Informer-like handle over the mirrored objects of one kind.
pub trait KindSource: Send + Sync {
    /// Current object for `key`, if mirrored.
    fn get(&self, key: &str) -> Option<StoredObject>;

    /// Keys of all currently mirrored objects.
    fn keys(&self) -> Vec<String>;

    /// Subscribe a raw event callback. Permanent for the source's lifetime.
    fn subscribe(&self, sink: Arc<dyn EventSink>);

    /// Register named secondary indexes. Re-registering an existing name is
    /// a no-op; new indexes are backfilled from current objects.
    fn add_indexers(&self, indexers: Vec<(String, IndexFn)>) -> RudderResult<()>;

    /// Objects whose entry under `index` matches `value` within `namespace`
    /// (empty namespace = global scope).
    fn by_index(&self, index: &str, namespace: &str, value: &str) -> Vec<StoredObject>;

    fn has_synced(&self) -> bool;

    /// Sync-completion signal; flips to `true` once the initial full listing
    /// has landed. Usable as a barrier.
    fn sync_signal(&self) -> watch::Receiver<bool>;
}

/// Multi-kind watch-source cache shared by all controllers.
#[async_trait]
pub trait SourceCache: Send + Sync {
    /// Handle for `gvk`, creating the underlying source on first use.
    async fn source_for(&self, gvk: &GvkId) -> RudderResult<Arc<dyn KindSource>>;

    /// Block until every registered kind has completed its initial listing,
    /// or fail when `cancel` fires first.
    async fn wait_for_sync(&self, cancel: &CancellationToken) -> RudderResult<()>;
}
