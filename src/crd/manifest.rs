//! Manifest Custom Resource Definition
//!
//! A Manifest describes a bundle of workloads to be installed on a target
//! cluster: a list of installs sourced from Helm charts, OCI-packaged charts
//! or kustomizations, optional pre-install CRDs, an optional configuration
//! layer and an optional embedded custom resource that is created on the
//! target and watched for state.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{CustomState, ImageSpec, InstallEntry, ManifestCondition, ManifestState};

/// Specification for a Manifest
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "manifest-operator.io",
    version = "v1alpha1",
    kind = "Manifest",
    plural = "manifests",
    shortname = "mfst",
    status = "ManifestStatus",
    namespaced,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ManifestSpec {
    /// OCI reference of a YAML configuration layer carrying per-install
    /// flags and value overrides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ImageSpec>,

    /// Installations to perform for this Manifest
    #[serde(default)]
    pub installs: Vec<InstallEntry>,

    /// OCI reference of a tar+gzip layer containing custom resource
    /// definitions to create before any install
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crds: Option<ImageSpec>,

    /// A single custom resource created on the target cluster after
    /// installation and watched for state updates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<serde_json::Value>,

    /// Desired states of custom resources checked by the custom state check
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_states: Vec<CustomState>,

    /// Install into a remote cluster resolved from the cache-key label
    /// instead of the cluster this operator runs in
    #[serde(default)]
    pub remote: bool,
}

/// Status for a Manifest
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestStatus {
    /// Current state of the Manifest lifecycle
    pub state: ManifestState,

    /// Per-install readiness conditions; the condition reason carries the
    /// install name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ManifestCondition>,

    /// Generation observed by the last status write
    #[serde(default)]
    pub observed_generation: i64,
}

impl Manifest {
    /// Current state, or `None` when the status subresource was never written
    pub fn state(&self) -> Option<ManifestState> {
        self.status.as_ref().map(|status| status.state)
    }

    /// True once the deletion timestamp is set
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}
