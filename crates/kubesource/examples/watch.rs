//! Watch a served kind on the current cluster and log reconcile calls.
//! Usage: `watch [gvk-key]`, e.g. `watch v1/ConfigMap`.

use std::str::FromStr;
use std::sync::Arc;

use futures::FutureExt;
use tracing::info;

use rudder_backend::Backend;
use rudder_core::{handler_fn, GvkId, KindSpec, Scheme};
use rudder_kubesource::KubeCache;

fn init_tracing() {
    let env = std::env::var("RUDDER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let key = std::env::args().nth(1).unwrap_or_else(|| "v1/ConfigMap".to_string());
    let gvk = GvkId::from_str(&key)?;

    let scheme = Arc::new(Scheme::new());
    scheme.register(gvk.clone(), KindSpec::namespace_scoped());

    let cache = Arc::new(KubeCache::try_default().await?);
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

    backend.start().await?;
    info!(gvk = %gvk, "synced; watching (ctrl-c to exit)");
    tokio::signal::ctrl_c().await?;
    backend.stop();
    cache.shutdown();
    Ok(())
}
