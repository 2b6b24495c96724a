//! Field indexer: derives secondary index functions from a kind's declared
//! fields and registers them with the shared cache before the kind's
//! controller begins dispatching.

use std::sync::Arc;

use smallvec::SmallVec;
use tracing::debug;

use rudder_core::{object_key, object_namespace, GvkId, IndexFn, RudderResult};

use crate::Backend;

/// Index registration name for a declared field.
pub fn field_index_name(field: &str) -> String {
    format!("field:{field}")
}

impl Backend {
    /// Register one index function per declared field of `gvk`. The field
    /// capability is probed once per kind and the outcome cached, so
    /// repeated watch registrations for the same kind are no-ops. Kinds
    /// without the capability are simply not indexed.
    pub(crate) async fn register_indexers(&self, gvk: &GvkId) -> RudderResult<()> {
        if self.indexed.lock().contains(gvk) {
            return Ok(());
        }
        let spec = self.scheme.lookup(gvk)?;
        let Some(fields) = spec.fields.clone() else {
            self.indexed.lock().insert(gvk.clone());
            return Ok(());
        };
        let source = self.cache.source_for(gvk).await?;
        let namespaced = spec.namespaced;
        let mut indexers: Vec<(String, IndexFn)> = Vec::new();
        for field in fields.field_names() {
            let getter = Arc::clone(&fields);
            let name = field.clone();
            let func: IndexFn = Arc::new(move |obj| {
                let mut values: SmallVec<[String; 2]> = SmallVec::new();
                let value = getter.get(obj, &name);
                if value.is_empty() {
                    return values;
                }
                // Global entry, plus a namespace-scoped one so lookups can
                // be expressed either way against the same index.
                values.push(object_key("", &value));
                if namespaced {
                    if let Some(ns) = object_namespace(obj) {
                        if !ns.is_empty() {
                            values.push(object_key(ns, &value));
                        }
                    }
                }
                values
            });
            indexers.push((field_index_name(&field), func));
        }
        debug!(gvk = %gvk, indexers = indexers.len(), "registering field indexers");
        source.add_indexers(indexers)?;
        self.indexed.lock().insert(gvk.clone());
        Ok(())
    }
}
