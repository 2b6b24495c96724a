#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

use rudder_backend::{field_index_name, Backend};
use rudder_core::{
    is_trigger, GvkId, Handler, HandlerResult, KindSource, KindSpec, PathFields, RudderError,
    Scheme, SourceEvent, StoredObject, TRIGGER_PREFIX,
};
use rudder_store::MemoryCache;

fn gvk() -> GvkId {
    GvkId::core("v1", "ConfigMap")
}

fn obj(ns: &str, name: &str, app: &str) -> StoredObject {
    Arc::new(serde_json::json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": name, "namespace": ns, "labels": { "app": app } },
        "spec": { "app": app },
    }))
}

fn applied(key: &str, obj: StoredObject) -> SourceEvent {
    SourceEvent::Applied { key: key.to_string(), obj }
}

struct Recorder {
    calls: mpsc::UnboundedSender<(String, bool)>,
}

#[async_trait]
impl Handler for Recorder {
    async fn handle(&self, _gvk: &GvkId, key: &str, obj: Option<StoredObject>) -> HandlerResult {
        let _ = self.calls.send((key.to_string(), obj.is_some()));
        Ok(None)
    }
}

fn fielded_spec() -> KindSpec {
    KindSpec::namespace_scoped()
        .with_fields(Arc::new(PathFields::new().with("app", "/spec/app")))
}

/// Backend over an in-memory cache with one registered kind.
fn backend_fixture(spec: KindSpec) -> (Arc<Backend>, Arc<MemoryCache>) {
    let scheme = Arc::new(Scheme::new());
    scheme.register(gvk(), spec);
    let cache = Arc::new(MemoryCache::new());
    (Arc::new(Backend::new(scheme, cache.clone())), cache)
}

#[tokio::test]
async fn start_blocks_until_every_kind_synced() {
    let scheme = Arc::new(Scheme::new());
    scheme.register(gvk(), KindSpec::namespace_scoped());
    scheme.register(GvkId::core("v1", "Secret"), KindSpec::namespace_scoped());
    let cache = Arc::new(MemoryCache::new());
    let backend = Arc::new(Backend::new(scheme, cache.clone()));

    let cm = cache.memory_source(&gvk());
    let secret = cache.memory_source(&GvkId::core("v1", "Secret"));

    let starter = {
        let backend = backend.clone();
        tokio::spawn(async move { backend.start().await })
    };

    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(!starter.is_finished());

    cm.mark_synced();
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(!starter.is_finished());

    secret.mark_synced();
    starter.await.expect("join").expect("start");
}

#[tokio::test]
async fn start_fails_when_canceled_before_sync() {
    let (backend, cache) = backend_fixture(KindSpec::namespace_scoped());
    let _never_synced = cache.memory_source(&gvk());

    let starter = {
        let backend = backend.clone();
        tokio::spawn(async move { backend.start().await })
    };
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    backend.stop();

    let err = starter.await.expect("join").expect_err("canceled start");
    assert!(matches!(err, RudderError::CacheSync(_)));
}

#[tokio::test]
async fn concurrent_starts_both_succeed() {
    let (backend, cache) = backend_fixture(KindSpec::namespace_scoped());
    cache.memory_source(&gvk()).mark_synced();

    let a = {
        let backend = backend.clone();
        tokio::spawn(async move { backend.start().await })
    };
    let b = {
        let backend = backend.clone();
        tokio::spawn(async move { backend.start().await })
    };
    a.await.expect("join").expect("start");
    b.await.expect("join").expect("start");
}

#[tokio::test]
async fn prestart_watch_dispatches_after_start() {
    let (backend, cache) = backend_fixture(KindSpec::namespace_scoped());
    let (tx, mut rx) = mpsc::unbounded_channel();
    backend
        .watch(&gvk(), "test", Arc::new(Recorder { calls: tx }))
        .await
        .expect("watch");

    let source = cache.memory_source(&gvk());
    source.apply(applied("ns/a", obj("ns", "a", "web")));
    source.mark_synced();

    // Not dispatched until the façade starts the controllers.
    assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());

    backend.start().await.expect("start");
    let (key, present) = timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("dispatch")
        .expect("open channel");
    assert_eq!(key, "ns/a");
    assert!(present);
    backend.stop();
}

#[tokio::test]
async fn poststart_watch_self_starts() {
    let (backend, cache) = backend_fixture(KindSpec::namespace_scoped());
    cache.memory_source(&gvk()).mark_synced();
    backend.start().await.expect("start");

    let (tx, mut rx) = mpsc::unbounded_channel();
    backend
        .watch(&gvk(), "late", Arc::new(Recorder { calls: tx }))
        .await
        .expect("watch");

    cache
        .memory_source(&gvk())
        .apply(applied("ns/a", obj("ns", "a", "web")));
    let (key, _) = timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("dispatch without explicit start")
        .expect("open channel");
    assert_eq!(key, "ns/a");
    backend.stop();
}

#[tokio::test]
async fn immediate_trigger_carries_reserved_prefix() {
    let (backend, cache) = backend_fixture(KindSpec::namespace_scoped());
    let (tx, mut rx) = mpsc::unbounded_channel();
    backend
        .watch(&gvk(), "test", Arc::new(Recorder { calls: tx }))
        .await
        .expect("watch");

    let source = cache.memory_source(&gvk());
    source.apply(applied("ns/a", obj("ns", "a", "web")));
    source.mark_synced();
    backend.start().await.expect("start");

    // Drain the natural watch-source delivery first.
    let (key, _) = rx.recv().await.expect("natural dispatch");
    assert_eq!(key, "ns/a");
    assert!(!is_trigger(&key));

    backend
        .trigger(&gvk(), "ns/a", Duration::ZERO)
        .await
        .expect("trigger");
    let (key, present) = timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("trigger dispatch")
        .expect("open channel");
    assert_eq!(key, format!("{TRIGGER_PREFIX}ns/a"));
    assert!(is_trigger(&key));
    // The cached object still resolves despite the prefixed key.
    assert!(present);
    backend.stop();
}

#[tokio::test(start_paused = true)]
async fn delayed_trigger_decomposes_key_and_honors_delay() {
    let (backend, cache) = backend_fixture(KindSpec::namespace_scoped());
    let (tx, mut rx) = mpsc::unbounded_channel();
    backend
        .watch(&gvk(), "test", Arc::new(Recorder { calls: tx }))
        .await
        .expect("watch");
    cache.memory_source(&gvk()).mark_synced();
    backend.start().await.expect("start");

    let started = Instant::now();
    backend
        .trigger(&gvk(), "ns/a", Duration::from_millis(200))
        .await
        .expect("trigger");

    let (key, present) = rx.recv().await.expect("delayed dispatch");
    assert!(started.elapsed() >= Duration::from_millis(200));
    // Rebuilt from the decomposed namespace/name, no prefix.
    assert_eq!(key, "ns/a");
    assert!(!is_trigger(&key));
    assert!(!present);
    backend.stop();
}

#[tokio::test]
async fn trigger_rejects_unknown_kinds() {
    let (backend, _cache) = backend_fixture(KindSpec::namespace_scoped());
    let missing = GvkId::core("v1", "Secret");
    assert!(matches!(
        backend.trigger(&missing, "ns/a", Duration::ZERO).await,
        Err(RudderError::UnknownKind(_))
    ));
}

#[tokio::test]
async fn watch_registers_dual_scope_field_indexes() {
    let (backend, cache) = backend_fixture(fielded_spec());
    let (tx, _rx) = mpsc::unbounded_channel();
    backend
        .watch(&gvk(), "test", Arc::new(Recorder { calls: tx.clone() }))
        .await
        .expect("watch");
    // A second registration for the same kind must be a no-op.
    backend
        .watch(&gvk(), "again", Arc::new(Recorder { calls: tx }))
        .await
        .expect("watch twice");

    let source = cache.memory_source(&gvk());
    source.apply(applied("ns/a", obj("ns", "a", "web")));
    source.apply(applied("other/b", obj("other", "b", "web")));

    let index = field_index_name("app");
    assert_eq!(index, "field:app");
    let handle = backend.source_for(&gvk()).await.expect("source");
    assert_eq!(handle.by_index(&index, "", "web").len(), 2);
    assert_eq!(handle.by_index(&index, "ns", "web").len(), 1);
    assert_eq!(handle.by_index(&index, "other", "web").len(), 1);
    assert!(handle.by_index(&index, "elsewhere", "web").is_empty());
}

#[tokio::test]
async fn unindexed_kinds_watch_without_indexes() {
    let (backend, cache) = backend_fixture(KindSpec::namespace_scoped());
    let (tx, _rx) = mpsc::unbounded_channel();
    backend
        .watch(&gvk(), "test", Arc::new(Recorder { calls: tx }))
        .await
        .expect("watch");

    let source = cache.memory_source(&gvk());
    source.apply(applied("ns/a", obj("ns", "a", "web")));
    let handle = backend.source_for(&gvk()).await.expect("source");
    assert!(handle.by_index(&field_index_name("app"), "", "web").is_empty());
}

#[tokio::test]
async fn scheme_delegates_resolve_objects() {
    let (backend, _cache) = backend_fixture(KindSpec::namespace_scoped());
    let raw = obj("ns", "a", "web");
    assert_eq!(backend.gvk_for(&raw).expect("derive"), gvk());
    assert!(backend.is_namespaced(&gvk()).expect("registered"));
    assert!(matches!(
        backend.is_namespaced(&GvkId::core("v1", "Secret")),
        Err(RudderError::UnknownKind(_))
    ));
}

#[tokio::test]
async fn watch_rejects_unknown_kinds() {
    let (backend, _cache) = backend_fixture(KindSpec::namespace_scoped());
    let (tx, _rx) = mpsc::unbounded_channel();
    assert!(matches!(
        backend
            .watch(&GvkId::core("v1", "Secret"), "test", Arc::new(Recorder { calls: tx }))
            .await,
        Err(RudderError::UnknownKind(_))
    ));
}
