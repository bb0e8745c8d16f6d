//! Recognized labels, annotations and the shared field owner

/// Label/annotation prefix owned by this operator
pub const OPERATOR_PREFIX: &str = "manifest-operator.io";

/// Operator name, used as the `watched-by` value and the `managed-by` value
pub const OPERATOR_NAME: &str = "manifest-operator";

/// Owner partition for renderer sharing and remote-kubeconfig secret lookup
pub const CACHE_KEY: &str = "manifest-operator.io/cache-key";

/// Stamped on the embedded resource of a remote Manifest as `{ns}/{name}`
pub const OWNED_BY: &str = "manifest-operator.io/owned-by";

/// Stamped on the embedded resource of a remote Manifest
pub const WATCHED_BY: &str = "manifest-operator.io/watched-by";

/// Finalizer blocking Manifest deletion until workloads are removed
pub const MANIFEST_FINALIZER: &str = "manifest-operator.io/finalizer";

/// Annotation warning against manual edits of applied objects
pub const DISCLAIMER_ANNOTATION: &str = "manifest-operator.io/managed-by-disclaimer";

/// Label marking applied objects as managed by this operator
pub const MANAGED_BY: &str = "manifest-operator.io/managed-by";

/// Field owner identity for server-side apply
pub const FIELD_OWNER: &str = "manifest-operator";

/// Format an `owned-by` label value from a Manifest's namespace and name
pub fn owned_by_value(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}
