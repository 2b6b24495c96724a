//! Handler callback interface exposed to collaborators.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::{GvkId, StoredObject};

/// Outcome of one handler invocation: an optional replacement object fed to
/// the next handler in the chain. Errors are logged and retried with backoff
/// by the owning controller.
pub type HandlerResult = anyhow::Result<Option<StoredObject>>;

/// Reconcile callback invoked per dispatched key. Handlers must be
/// idempotent for a given (key, object) pair: redelivery can occur after
/// coalescing or restart.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, gvk: &GvkId, key: &str, obj: Option<StoredObject>) -> HandlerResult;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn(GvkId, String, Option<StoredObject>) -> BoxFuture<'static, HandlerResult> + Send + Sync,
{
    async fn handle(&self, gvk: &GvkId, key: &str, obj: Option<StoredObject>) -> HandlerResult {
        (self.0)(gvk.clone(), key.to_string(), obj).await
    }
}

/// Adapt a closure into a [`Handler`].
pub fn handler_fn<F>(f: F) -> Arc<dyn Handler>
where
    F: Fn(GvkId, String, Option<StoredObject>) -> BoxFuture<'static, HandlerResult>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnHandler(f))
}
