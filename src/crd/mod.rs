//! Custom Resource Definitions for the manifest operator
//!
//! This module contains the Manifest CRD and the types shared by its spec
//! and status.

mod manifest;
mod types;

pub use manifest::{Manifest, ManifestSpec, ManifestStatus};
pub use types::{
    ChartSource, ConditionStatus, ConditionType, CustomState, HelmChartSpec, ImageSpec,
    InstallEntry, InstallItem, KustomizeSpec, ManifestCondition, ManifestState, RefType,
};

use std::fmt;

use kube::ResourceExt;

/// Namespace/name pair identifying a namespaced object.
///
/// Also used as the key type of both renderer-cache levels: the owner level
/// keys on `{cache-key label, namespace}`, the resource level on the
/// Manifest's own `{name, namespace}`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    /// Namespace of the object
    pub namespace: String,
    /// Name of the object
    pub name: String,
}

impl ObjectKey {
    /// Create a key from name and namespace
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of the given Manifest
    pub fn from_manifest(manifest: &Manifest) -> Self {
        Self {
            namespace: manifest.namespace().unwrap_or_default(),
            name: manifest.name_any(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
