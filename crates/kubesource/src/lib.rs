//! Kubernetes-backed watch source: kube watchers feeding per-kind in-memory
//! stores, with discovery-based kind resolution.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject},
    discovery::Discovery,
    runtime::watcher::{self, Event},
    Client,
};
use rustc_hash::FxHashMap;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rudder_core::{
    object_key, GvkId, KindSource, RudderError, RudderResult, SourceCache, SourceEvent,
    StoredObject,
};
use rudder_store::{wait_synced, MemorySource};

/// Shared cache backed by a live cluster. Each kind gets a watcher task
/// pumping list+watch events into its [`MemorySource`]; the sync signal
/// fires once the initial listing has landed.
pub struct KubeCache {
    client: Client,
    sources: Mutex<FxHashMap<GvkId, Arc<MemorySource>>>,
    cancel: CancellationToken,
}

impl KubeCache {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            sources: Mutex::new(FxHashMap::default()),
            cancel: CancellationToken::new(),
        }
    }

    /// Connect using the default kubeconfig/in-cluster environment.
    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(Client::try_default().await?))
    }

    /// Stop all watcher tasks. Also happens on drop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for KubeCache {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl SourceCache for KubeCache {
    async fn source_for(&self, gvk: &GvkId) -> RudderResult<Arc<dyn KindSource>> {
        let mut sources = self.sources.lock().await;
        if let Some(source) = sources.get(gvk) {
            return Ok(source.clone() as Arc<dyn KindSource>);
        }
        let ar = find_api_resource(self.client.clone(), gvk).await?;
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        let source = Arc::new(MemorySource::new());
        tokio::spawn(pump(api, source.clone(), self.cancel.clone(), gvk.to_string()));
        sources.insert(gvk.clone(), source.clone());
        Ok(source as Arc<dyn KindSource>)
    }

    async fn wait_for_sync(&self, cancel: &CancellationToken) -> RudderResult<()> {
        let signals: Vec<watch::Receiver<bool>> =
            self.sources.lock().await.values().map(|s| s.sync_signal()).collect();
        wait_synced(signals, cancel).await
    }
}

/// Resolve a kind to its served ApiResource using kube Discovery. A kind the
/// cluster does not serve is an unknown-kind error; discovery failures are
/// internal.
async fn find_api_resource(client: Client, gvk: &GvkId) -> RudderResult<ApiResource> {
    let discovery = Discovery::new(client)
        .run()
        .await
        .map_err(|e| RudderError::Internal(e.to_string()))?;
    for group in discovery.groups() {
        for (ar, _caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                return Ok(ar.clone());
            }
        }
    }
    Err(RudderError::UnknownKind(gvk.clone()))
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn stored(obj: &DynamicObject) -> Result<(String, StoredObject)> {
    let name = obj
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| anyhow!("object missing metadata.name"))?;
    let namespace = obj.metadata.namespace.as_deref().unwrap_or("");
    let key = object_key(namespace, name);
    let mut raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut raw);
    Ok((key, Arc::new(raw)))
}

/// Pump one kind's list+watch stream into its store until the stream ends
/// or the cache shuts down.
async fn pump(
    api: Api<DynamicObject>,
    source: Arc<MemorySource>,
    cancel: CancellationToken,
    gvk: String,
) {
    let cfg = watcher::Config::default();
    let stream = watcher::watcher(api, cfg);
    futures::pin_mut!(stream);
    info!(gvk = %gvk, "watcher started");
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.try_next() => next,
        };
        match next {
            Ok(Some(Event::Applied(o))) => match stored(&o) {
                Ok((key, obj)) => source.apply(SourceEvent::Applied { key, obj }),
                Err(e) => warn!(gvk = %gvk, error = %e, "skipping malformed object"),
            },
            Ok(Some(Event::Deleted(o))) => match stored(&o) {
                Ok((key, obj)) => source.apply(SourceEvent::Deleted { key, obj }),
                Err(e) => warn!(gvk = %gvk, error = %e, "skipping malformed object"),
            },
            Ok(Some(Event::Restarted(list))) => {
                debug!(gvk = %gvk, count = list.len(), "watch restart");
                let mut objects = Vec::with_capacity(list.len());
                for o in &list {
                    match stored(o) {
                        Ok(pair) => objects.push(pair),
                        Err(e) => warn!(gvk = %gvk, error = %e, "skipping malformed object"),
                    }
                }
                source.replace(objects);
                source.mark_synced();
            }
            Ok(None) => {
                warn!(gvk = %gvk, "watcher stream ended");
                break;
            }
            Err(e) => {
                warn!(gvk = %gvk, error = %e, "watcher failed");
                break;
            }
        }
    }
}
