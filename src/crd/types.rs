//! Supporting types for the Manifest CRD

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// A single installation inside a Manifest
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstallEntry {
    /// Unique install name within the Manifest; doubles as the release name
    pub name: String,

    /// Raw source specification, decoded into a [`ChartSource`] by
    /// discriminant probing
    pub source: Value,
}

/// Discriminator for install source specifications
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RefType {
    /// Helm chart from a chart repository
    #[serde(rename = "helm-chart")]
    HelmChart,
    /// Packaged chart layer in an OCI registry
    #[serde(rename = "oci-ref")]
    OciRef,
    /// Local or remote kustomization
    #[serde(rename = "kustomize")]
    Kustomize,
}

/// OCI image layer address
///
/// Two ImageSpecs address the same artifact iff `repo`, `name`, `ref` and
/// `type` are all equal; the on-disk cache directory name is derived from
/// that identity.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    /// Image repository, e.g. `registry.example.com/components`
    #[serde(default)]
    pub repo: String,

    /// Image name within the repository
    #[serde(default)]
    pub name: String,

    /// Digest or tag of the layer
    #[serde(rename = "ref", default)]
    pub ref_: String,

    /// Source type discriminator
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<RefType>,

    /// Selects pull secrets in the Manifest namespace carrying registry
    /// credentials for this image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cred_secret_selector: Option<LabelSelector>,

    /// Allow plaintext HTTP towards the registry
    #[serde(default)]
    pub insecure: bool,
}

impl PartialEq for ImageSpec {
    fn eq(&self, other: &Self) -> bool {
        self.repo == other.repo
            && self.name == other.name
            && self.ref_ == other.ref_
            && self.type_ == other.type_
    }
}

impl Eq for ImageSpec {}

impl ImageSpec {
    /// Full image reference string understood by registries
    pub fn reference(&self) -> String {
        if self.ref_.starts_with("sha256:") {
            format!("{}/{}@{}", self.repo, self.name, self.ref_)
        } else {
            format!("{}/{}:{}", self.repo, self.name, self.ref_)
        }
    }
}

/// Helm chart source specification
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelmChartSpec {
    /// Helm repository URL
    #[serde(default)]
    pub url: String,

    /// Chart name within the repository
    #[serde(default)]
    pub chart_name: String,

    /// Source type discriminator
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<RefType>,
}

/// Kustomization source specification
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KustomizeSpec {
    /// Local kustomization directory
    #[serde(default)]
    pub path: String,

    /// Remote kustomization URL
    #[serde(default)]
    pub url: String,

    /// Source type discriminator
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<RefType>,
}

/// Decoded install source, dispatched on in the renderer factory
#[derive(Clone, Debug, PartialEq)]
pub enum ChartSource {
    /// Chart pulled from a Helm repository
    Helm(HelmChartSpec),
    /// Packaged chart pulled from an OCI registry
    Oci(ImageSpec),
    /// Local or remote kustomization
    Kustomize(KustomizeSpec),
}

impl ChartSource {
    /// Decode a raw install source.
    ///
    /// The `type` field decides when present; otherwise the set of present
    /// fields is probed: `chartName` means Helm, `repo`/`name`/`ref` means
    /// OCI, `path` or `url` means Kustomize. An undecidable source is a
    /// config error.
    pub fn from_raw(raw: &Value) -> Result<Self> {
        let source = raw
            .as_object()
            .ok_or_else(|| Error::config("install source is not an object"))?;

        let type_ = match source.get("type") {
            Some(value) if !value.is_null() => Some(
                serde_json::from_value::<RefType>(value.clone())
                    .map_err(|err| Error::config(format!("unsupported install source type: {err}")))?,
            ),
            _ => None,
        };

        let probed = type_.or_else(|| {
            if source.contains_key("chartName") {
                Some(RefType::HelmChart)
            } else if source.contains_key("repo")
                && source.contains_key("name")
                && source.contains_key("ref")
            {
                Some(RefType::OciRef)
            } else if source.contains_key("path") || source.contains_key("url") {
                Some(RefType::Kustomize)
            } else {
                None
            }
        });

        match probed {
            Some(RefType::HelmChart) => Ok(Self::Helm(decode(raw)?)),
            Some(RefType::OciRef) => Ok(Self::Oci(decode(raw)?)),
            Some(RefType::Kustomize) => Ok(Self::Kustomize(decode(raw)?)),
            None => Err(Error::config(
                "empty install source type and no recognizable source fields",
            )),
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(raw: &Value) -> Result<T> {
    serde_json::from_value(raw.clone())
        .map_err(|err| Error::config(format!("decoding install source failed: {err}")))
}

/// Desired state expectation for a custom resource on the target cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CustomState {
    /// API version of the custom resource
    pub api_version: String,

    /// Kind of the custom resource
    pub kind: String,

    /// Name of the custom resource
    pub name: String,

    /// Namespace of the custom resource
    pub namespace: String,

    /// Expected value of `.status.state`
    pub state: String,
}

/// Lifecycle states of a Manifest
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ManifestState {
    /// Installation is running or recovering from an error
    #[default]
    Processing,
    /// Deletion timestamp observed, workloads are being removed
    Deleting,
    /// All installs applied and ready
    Ready,
    /// Installation encountered an error
    Error,
}

impl std::fmt::Display for ManifestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self {
            Self::Processing => "Processing",
            Self::Deleting => "Deleting",
            Self::Ready => "Ready",
            Self::Error => "Error",
        };
        f.write_str(state)
    }
}

/// Condition type; only `Ready` is produced
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionType {
    /// Readiness of a single install
    #[default]
    Ready,
}

/// Condition status values
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Install applied and ready
    True,
    /// Install failed
    False,
    /// Install still processing
    #[default]
    Unknown,
}

/// Flags and overrides recorded on a per-install condition
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstallItem {
    /// Chart name of the install
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub chart_name: String,

    /// JSON-serialized client configuration flags
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_config: String,

    /// JSON-serialized value overrides
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub overrides: String,
}

/// Per-install readiness condition
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestCondition {
    /// Condition type
    #[serde(rename = "type")]
    pub type_: ConditionType,

    /// Condition status
    pub status: ConditionStatus,

    /// Human-readable message for the last transition
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Install name this condition tracks
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    /// Time of the last status transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,

    /// Install flags recorded with the condition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_item: Option<InstallItem>,
}

impl super::ManifestStatus {
    /// Upsert the Ready condition for one install, keyed by reason.
    ///
    /// An `install_item` is only recorded when it carries flags, so steady
    /// status rewrites do not churn empty payloads.
    pub fn set_ready_condition(
        &mut self,
        reason: &str,
        status: ConditionStatus,
        message: &str,
        install_item: Option<InstallItem>,
    ) {
        let item = install_item
            .filter(|item| !item.client_config.is_empty() || !item.overrides.is_empty());
        let condition = ManifestCondition {
            type_: ConditionType::Ready,
            status,
            message: message.to_string(),
            reason: reason.to_string(),
            last_transition_time: Some(Utc::now()),
            install_item: item,
        };

        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.type_ == ConditionType::Ready && c.reason == reason)
        {
            *existing = condition;
        } else {
            self.conditions.push(condition);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn source_type_field_decides() {
        let source = ChartSource::from_raw(&json!({
            "type": "helm-chart",
            "chartName": "nginx-ingress",
            "url": "https://helm.nginx.com/stable",
        }))
        .unwrap();
        assert!(matches!(source, ChartSource::Helm(_)));
    }

    #[test]
    fn discriminant_probing_without_type_field() {
        let helm = ChartSource::from_raw(&json!({"chartName": "redis"})).unwrap();
        assert!(matches!(helm, ChartSource::Helm(_)));

        let oci = ChartSource::from_raw(&json!({
            "repo": "registry.example.com/charts",
            "name": "redis",
            "ref": "v1.0.0",
        }))
        .unwrap();
        assert!(matches!(oci, ChartSource::Oci(_)));

        let kustomize =
            ChartSource::from_raw(&json!({"path": "./config/default"})).unwrap();
        assert!(matches!(kustomize, ChartSource::Kustomize(_)));
    }

    #[test]
    fn empty_source_is_a_config_error() {
        let err = ChartSource::from_raw(&json!({})).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn image_spec_equality_ignores_credentials() {
        let base = ImageSpec {
            repo: "registry.example.com/charts".to_string(),
            name: "redis".to_string(),
            ref_: "sha256:abcd".to_string(),
            type_: Some(RefType::OciRef),
            ..Default::default()
        };
        let with_creds = ImageSpec {
            cred_secret_selector: Some(LabelSelector::default()),
            insecure: true,
            ..base.clone()
        };
        assert_eq!(base, with_creds);

        let other_ref = ImageSpec {
            ref_: "sha256:ef01".to_string(),
            ..base.clone()
        };
        assert_ne!(base, other_ref);
    }

    #[test]
    fn image_reference_uses_digest_or_tag_form() {
        let digest = ImageSpec {
            repo: "r.example.com/c".to_string(),
            name: "redis".to_string(),
            ref_: "sha256:abcd".to_string(),
            ..Default::default()
        };
        assert_eq!(digest.reference(), "r.example.com/c/redis@sha256:abcd");

        let tag = ImageSpec {
            ref_: "v1.0.0".to_string(),
            ..digest
        };
        assert_eq!(tag.reference(), "r.example.com/c/redis:v1.0.0");
    }
}
