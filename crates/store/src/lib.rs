//! Rudder in-memory store: the mirrored-object map plus named secondary
//! indexes for one kind, and a lazy multi-kind registry implementing the
//! watch-source cache capability.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use rudder_core::{
    EventSink, GvkId, IndexFn, KindSource, RudderError, RudderResult, SourceCache, SourceEvent,
    StoredObject,
};

/// Mirror of one kind's objects. Writers are the owning watch feed (or a
/// test driving [`MemorySource::apply`]); all other components only read.
pub struct MemorySource {
    state: RwLock<SourceState>,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
    sync_tx: watch::Sender<bool>,
    sync_rx: watch::Receiver<bool>,
}

struct Index {
    func: IndexFn,
    /// Scoped index value -> sorted object keys.
    entries: FxHashMap<String, BTreeSet<String>>,
}

#[derive(Default)]
struct SourceState {
    objects: FxHashMap<String, StoredObject>,
    indexes: FxHashMap<String, Index>,
}

impl Default for MemorySource {
    fn default() -> Self {
        let (sync_tx, sync_rx) = watch::channel(false);
        Self {
            state: RwLock::new(SourceState::default()),
            sinks: RwLock::new(Vec::new()),
            sync_tx,
            sync_rx,
        }
    }
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one observed change: update the object map, rewrite index
    /// entries for the key, then notify subscribers.
    pub fn apply(&self, event: SourceEvent) {
        {
            let mut s = self.state.write();
            match &event {
                SourceEvent::Applied { key, obj } => s.upsert(key, obj.clone()),
                SourceEvent::Deleted { key, .. } => s.delete(key),
            }
        }
        self.notify(&event);
    }

    /// Swap in a full listing: objects absent from `objects` are deleted,
    /// every listed object is (re)applied. Relists redeliver; dedup is the
    /// queue's job.
    pub fn replace(&self, objects: Vec<(String, StoredObject)>) {
        let mut events = Vec::with_capacity(objects.len());
        {
            let mut s = self.state.write();
            let incoming: FxHashSet<&str> = objects.iter().map(|(k, _)| k.as_str()).collect();
            let stale: Vec<String> = s
                .objects
                .keys()
                .filter(|k| !incoming.contains(k.as_str()))
                .cloned()
                .collect();
            for key in stale {
                if let Some(obj) = s.objects.get(&key).cloned() {
                    s.delete(&key);
                    events.push(SourceEvent::Deleted { key, obj });
                }
            }
            for (key, obj) in objects {
                s.upsert(&key, obj.clone());
                events.push(SourceEvent::Applied { key, obj });
            }
        }
        for event in &events {
            self.notify(event);
        }
    }

    /// Fire the sync-completion signal. Idempotent.
    pub fn mark_synced(&self) {
        self.sync_tx.send_replace(true);
    }

    pub fn len(&self) -> usize {
        self.state.read().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn notify(&self, event: &SourceEvent) {
        for sink in self.sinks.read().iter() {
            sink.on_event(event);
        }
    }
}

impl SourceState {
    fn upsert(&mut self, key: &str, obj: StoredObject) {
        if let Some(old) = self.objects.get(key).cloned() {
            self.strip_entries(key, &old);
        }
        for index in self.indexes.values_mut() {
            for value in (index.func)(&obj) {
                index.entries.entry(value).or_default().insert(key.to_string());
            }
        }
        self.objects.insert(key.to_string(), obj);
    }

    fn delete(&mut self, key: &str) {
        if let Some(old) = self.objects.remove(key) {
            self.strip_entries(key, &old);
        }
    }

    fn strip_entries(&mut self, key: &str, obj: &StoredObject) {
        for index in self.indexes.values_mut() {
            for value in (index.func)(obj) {
                if let Some(keys) = index.entries.get_mut(&value) {
                    keys.remove(key);
                    if keys.is_empty() {
                        index.entries.remove(&value);
                    }
                }
            }
        }
    }
}

impl KindSource for MemorySource {
    fn get(&self, key: &str) -> Option<StoredObject> {
        self.state.read().objects.get(key).cloned()
    }

    fn keys(&self) -> Vec<String> {
        self.state.read().objects.keys().cloned().collect()
    }

    fn subscribe(&self, sink: Arc<dyn EventSink>) {
        self.sinks.write().push(sink);
    }

    fn add_indexers(&self, indexers: Vec<(String, IndexFn)>) -> RudderResult<()> {
        let mut s = self.state.write();
        for (name, func) in indexers {
            if name.is_empty() {
                return Err(RudderError::Index("empty index name".into()));
            }
            if s.indexes.contains_key(&name) {
                // Same kind registered twice; the first registration stands.
                continue;
            }
            let mut index = Index { func, entries: FxHashMap::default() };
            for (key, obj) in &s.objects {
                for value in (index.func)(obj) {
                    index.entries.entry(value).or_default().insert(key.clone());
                }
            }
            debug!(index = %name, backfilled = s.objects.len(), "index registered");
            s.indexes.insert(name, index);
        }
        Ok(())
    }

    fn by_index(&self, index: &str, namespace: &str, value: &str) -> Vec<StoredObject> {
        let scoped = rudder_core::object_key(namespace, value);
        let s = self.state.read();
        let Some(index) = s.indexes.get(index) else {
            return Vec::new();
        };
        let Some(keys) = index.entries.get(&scoped) else {
            return Vec::new();
        };
        keys.iter().filter_map(|k| s.objects.get(k).cloned()).collect()
    }

    fn has_synced(&self) -> bool {
        *self.sync_rx.borrow()
    }

    fn sync_signal(&self) -> watch::Receiver<bool> {
        self.sync_rx.clone()
    }
}

/// Lazy per-kind registry of [`MemorySource`]s. The shared cache used by
/// tests and by adapters that feed sources themselves.
#[derive(Default)]
pub struct MemoryCache {
    sources: Mutex<FxHashMap<GvkId, Arc<MemorySource>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Typed handle for `gvk`, created on first use. The concrete type is
    /// exposed so owners can feed events and fire sync signals.
    pub fn memory_source(&self, gvk: &GvkId) -> Arc<MemorySource> {
        self.sources
            .lock()
            .entry(gvk.clone())
            .or_insert_with(|| Arc::new(MemorySource::new()))
            .clone()
    }
}

#[async_trait]
impl SourceCache for MemoryCache {
    async fn source_for(&self, gvk: &GvkId) -> RudderResult<Arc<dyn KindSource>> {
        let source: Arc<dyn KindSource> = self.memory_source(gvk);
        Ok(source)
    }

    async fn wait_for_sync(&self, cancel: &CancellationToken) -> RudderResult<()> {
        let signals: Vec<watch::Receiver<bool>> =
            self.sources.lock().values().map(|s| s.sync_signal()).collect();
        wait_synced(signals, cancel).await
    }
}

/// Barrier over a set of sync signals: resolves once every signal reads
/// `true`, or fails when `cancel` fires first.
pub async fn wait_synced(
    signals: impl IntoIterator<Item = watch::Receiver<bool>>,
    cancel: &CancellationToken,
) -> RudderResult<()> {
    for mut rx in signals {
        while !*rx.borrow_and_update() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(RudderError::Canceled),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(RudderError::CacheSync("sync signal dropped".into()));
                    }
                }
            }
        }
    }
    Ok(())
}
