//! End-to-end wiring over the in-memory cache: register a watch, feed
//! events, start the runtime, and trigger redeliveries.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::info;

use rudder_backend::Backend;
use rudder_core::{handler_fn, GvkId, KindSpec, PathFields, Scheme, SourceEvent};
use rudder_store::MemoryCache;

fn init_tracing() {
    let env = std::env::var("RUDDER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let scheme = Arc::new(Scheme::new());
    let gvk = GvkId::core("v1", "ConfigMap");
    scheme.register(
        gvk.clone(),
        KindSpec::namespace_scoped()
            .with_fields(Arc::new(PathFields::new().with("app", "/metadata/labels/app"))),
    );

    let cache = Arc::new(MemoryCache::new());
    let backend = Backend::new(scheme, cache.clone());

    backend
        .watch(
            &gvk,
            "log-objects",
            handler_fn(|gvk, key, obj| {
                async move {
                    info!(gvk = %gvk, key = %key, present = obj.is_some(), "reconcile");
                    Ok(None)
                }
                .boxed()
            }),
        )
        .await?;

    let source = cache.memory_source(&gvk);
    source.apply(SourceEvent::Applied {
        key: "default/site".into(),
        obj: Arc::new(serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "site", "namespace": "default", "labels": { "app": "site" } },
        })),
    });
    source.mark_synced();

    backend.start().await?;
    backend.trigger(&gvk, "default/site", Duration::ZERO).await?;
    backend.trigger(&gvk, "default/site", Duration::from_millis(200)).await?;

    tokio::time::sleep(Duration::from_millis(500)).await;
    backend.stop();
    Ok(())
}
