//! Rudder core types: kind identity, object keys, and the capability traits
//! the runtime consumes (scheme, watch source, handlers).

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod handler;
pub mod scheme;
pub mod source;

pub use handler::{handler_fn, Handler, HandlerResult};
pub use scheme::{Fields, KindSpec, PathFields, Scheme};
pub use source::{EventSink, IndexFn, KindSource, SourceCache, SourceEvent};

/// Reserved prefix marking a key as a synthetic trigger rather than a
/// watch-source notification.
pub const TRIGGER_PREFIX: &str = "_t ";

/// Last known copy of a mirrored object. Owned by the store; everything else
/// only reads it.
pub type StoredObject = Arc<Value>;

/// A served resource kind, uniquely named by group/version/kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct GvkId {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl GvkId {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    /// Kind in the core API group (empty group).
    pub fn core(version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self::new("", version, kind)
    }
}

impl fmt::Display for GvkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.kind)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

impl FromStr for GvkId {
    type Err = RudderError;

    /// Parse a gvk key, e.g. "v1/ConfigMap" or "cert-manager.io/v1/Certificate".
    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] => Ok(GvkId::core(*version, *kind)),
            [group, version, kind] => Ok(GvkId::new(*group, *version, *kind)),
            _ => Err(RudderError::Internal(format!(
                "invalid gvk key: {key} (expect v1/Kind or group/v1/Kind)"
            ))),
        }
    }
}

/// Build an object key from a namespace and name. Cluster-scoped objects
/// (empty namespace) are keyed by bare name.
pub fn object_key(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}/{name}")
    }
}

/// Split a key into (namespace, name). A key with no separator is
/// cluster-scoped.
pub fn split_key(key: &str) -> (&str, &str) {
    match key.split_once('/') {
        Some((ns, name)) => (ns, name),
        None => ("", key),
    }
}

/// True when `key` was enqueued by an immediate trigger.
pub fn is_trigger(key: &str) -> bool {
    key.starts_with(TRIGGER_PREFIX)
}

/// Remove the trigger prefix, if present, yielding the natural object key.
pub fn strip_trigger(key: &str) -> &str {
    key.strip_prefix(TRIGGER_PREFIX).unwrap_or(key)
}

/// Namespace recorded on a raw object, if any.
pub fn object_namespace(obj: &Value) -> Option<&str> {
    obj.pointer("/metadata/namespace").and_then(|v| v.as_str())
}

/// Name recorded on a raw object, if any.
pub fn object_name(obj: &Value) -> Option<&str> {
    obj.pointer("/metadata/name").and_then(|v| v.as_str())
}

/// Key identifying a raw object within its kind.
pub fn key_of(obj: &Value) -> Option<String> {
    let name = object_name(obj)?;
    Some(object_key(object_namespace(obj).unwrap_or(""), name))
}

/// Errors surfaced by the runtime's synchronous surface.
#[derive(Debug, thiserror::Error)]
pub enum RudderError {
    #[error("unknown kind: {0}")]
    UnknownKind(GvkId),
    #[error("cache sync: {0}")]
    CacheSync(String),
    #[error("index: {0}")]
    Index(String),
    #[error("canceled")]
    Canceled,
    #[error("internal: {0}")]
    Internal(String),
}

pub type RudderResult<T> = Result<T, RudderError>;
