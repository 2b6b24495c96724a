//! Object scheme: resolves kind identifiers to registered kind specs and
//! derives identifiers back from raw objects.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::{GvkId, RudderError, RudderResult};

/// Field-exposing capability. A kind may declare named fields whose current
/// string values are derived from the raw object; kinds without the
/// capability are simply not indexed.
pub trait Fields: Send + Sync {
    fn field_names(&self) -> Vec<String>;
    /// Current value of `field` on `obj`; empty when unset.
    fn get(&self, obj: &Value, field: &str) -> String;
}

/// [`Fields`] backed by JSON pointers, e.g. `("app", "/spec/appName")`.
#[derive(Default)]
pub struct PathFields {
    paths: Vec<(String, String)>,
}

impl PathFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, pointer: impl Into<String>) -> Self {
        self.paths.push((field.into(), pointer.into()));
        self
    }
}

impl Fields for PathFields {
    fn field_names(&self) -> Vec<String> {
        self.paths.iter().map(|(f, _)| f.clone()).collect()
    }

    fn get(&self, obj: &Value, field: &str) -> String {
        let Some((_, pointer)) = self.paths.iter().find(|(f, _)| f == field) else {
            return String::new();
        };
        match obj.pointer(pointer) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(v) => v.to_string(),
        }
    }
}

/// Per-kind registration: scope plus optional capabilities.
#[derive(Clone)]
pub struct KindSpec {
    pub namespaced: bool,
    pub fields: Option<Arc<dyn Fields>>,
}

impl KindSpec {
    pub fn cluster_scoped() -> Self {
        Self { namespaced: false, fields: None }
    }

    pub fn namespace_scoped() -> Self {
        Self { namespaced: true, fields: None }
    }

    pub fn with_fields(mut self, fields: Arc<dyn Fields>) -> Self {
        self.fields = Some(fields);
        self
    }
}

/// Registry of served kinds. Lookups for unregistered kinds are errors,
/// never silently ignored.
#[derive(Default)]
pub struct Scheme {
    kinds: RwLock<FxHashMap<GvkId, KindSpec>>,
}

impl Scheme {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, gvk: GvkId, spec: KindSpec) {
        self.kinds.write().insert(gvk, spec);
    }

    pub fn contains(&self, gvk: &GvkId) -> bool {
        self.kinds.read().contains_key(gvk)
    }

    pub fn lookup(&self, gvk: &GvkId) -> RudderResult<KindSpec> {
        self.kinds
            .read()
            .get(gvk)
            .cloned()
            .ok_or_else(|| RudderError::UnknownKind(gvk.clone()))
    }

    pub fn is_namespaced(&self, gvk: &GvkId) -> RudderResult<bool> {
        Ok(self.lookup(gvk)?.namespaced)
    }

    /// Derive the kind identifier recorded on a raw object
    /// (`apiVersion` + `kind`). The derived kind must be registered.
    pub fn gvk_for(&self, obj: &Value) -> RudderResult<GvkId> {
        let api_version = obj
            .get("apiVersion")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RudderError::Internal("object missing apiVersion".into()))?;
        let kind = obj
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RudderError::Internal("object missing kind".into()))?;
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g, v),
            None => ("", api_version),
        };
        let gvk = GvkId::new(group, version, kind);
        if self.contains(&gvk) {
            Ok(gvk)
        } else {
            Err(RudderError::UnknownKind(gvk))
        }
    }
}
