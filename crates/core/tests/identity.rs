#![forbid(unsafe_code)]

use std::str::FromStr;
use std::sync::Arc;

use rudder_core::{
    is_trigger, key_of, object_key, split_key, strip_trigger, Fields, GvkId, KindSpec,
    PathFields, RudderError, Scheme, TRIGGER_PREFIX,
};

#[test]
fn object_keys_encode_scope() {
    assert_eq!(object_key("", "a"), "a");
    assert_eq!(object_key("ns", "a"), "ns/a");
    assert_eq!(split_key("ns/a"), ("ns", "a"));
    assert_eq!(split_key("a"), ("", "a"));
}

#[test]
fn trigger_prefix_is_detectable_and_strippable() {
    let key = format!("{TRIGGER_PREFIX}ns/a");
    assert!(is_trigger(&key));
    assert!(!is_trigger("ns/a"));
    assert_eq!(strip_trigger(&key), "ns/a");
    assert_eq!(strip_trigger("ns/a"), "ns/a");
}

#[test]
fn gvk_display_and_parse() {
    let core = GvkId::core("v1", "ConfigMap");
    assert_eq!(core.to_string(), "v1/ConfigMap");
    let grouped = GvkId::new("cert-manager.io", "v1", "Certificate");
    assert_eq!(grouped.to_string(), "cert-manager.io/v1/Certificate");

    assert_eq!(GvkId::from_str("v1/ConfigMap").expect("parse"), core);
    assert_eq!(
        GvkId::from_str("cert-manager.io/v1/Certificate").expect("parse"),
        grouped
    );
    assert!(GvkId::from_str("justakind").is_err());
}

#[test]
fn scheme_lookup_and_unknown_kind() {
    let scheme = Scheme::new();
    let gvk = GvkId::core("v1", "ConfigMap");
    scheme.register(gvk.clone(), KindSpec::namespace_scoped());

    assert!(scheme.is_namespaced(&gvk).expect("registered"));
    let missing = GvkId::core("v1", "Secret");
    assert!(matches!(
        scheme.lookup(&missing),
        Err(RudderError::UnknownKind(k)) if k == missing
    ));
}

#[test]
fn scheme_derives_gvk_from_objects() {
    let scheme = Scheme::new();
    scheme.register(GvkId::core("v1", "ConfigMap"), KindSpec::namespace_scoped());
    scheme.register(
        GvkId::new("apps", "v1", "Deployment"),
        KindSpec::namespace_scoped(),
    );

    let cm = serde_json::json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": "a", "namespace": "ns" },
    });
    assert_eq!(scheme.gvk_for(&cm).expect("derive"), GvkId::core("v1", "ConfigMap"));
    assert_eq!(key_of(&cm).as_deref(), Some("ns/a"));

    let deploy = serde_json::json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": { "name": "d" },
    });
    assert_eq!(
        scheme.gvk_for(&deploy).expect("derive"),
        GvkId::new("apps", "v1", "Deployment")
    );

    let unregistered = serde_json::json!({ "apiVersion": "v1", "kind": "Secret" });
    assert!(matches!(
        scheme.gvk_for(&unregistered),
        Err(RudderError::UnknownKind(_))
    ));
    assert!(scheme.gvk_for(&serde_json::json!({ "kind": "ConfigMap" })).is_err());
}

#[test]
fn path_fields_render_scalars_as_strings() {
    let fields = Arc::new(
        PathFields::new()
            .with("app", "/metadata/labels/app")
            .with("replicas", "/spec/replicas"),
    );
    let obj = serde_json::json!({
        "metadata": { "labels": { "app": "web" } },
        "spec": { "replicas": 3 },
    });

    assert_eq!(fields.field_names(), ["app", "replicas"]);
    assert_eq!(fields.get(&obj, "app"), "web");
    assert_eq!(fields.get(&obj, "replicas"), "3");
    assert_eq!(fields.get(&obj, "missing"), "");
    assert_eq!(fields.get(&serde_json::json!({}), "app"), "");
}
