//! Post-install state checks
//!
//! After an install is applied the job's check runs against the target
//! cluster. The default check reports ready unconditionally; the custom
//! state check fetches the declared custom resources and compares their
//! `.status.state` against the declared expectations.

use kube::api::{Api, DynamicObject};
use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;
use kube::ResourceExt;
use tracing::debug;

use crate::cluster::ClusterInfo;
use crate::crd::CustomState;
use crate::error::{Error, Result};

/// State expected of the embedded resource when no explicit expectations
/// are declared
const DEFAULT_EXPECTED_STATE: &str = "Ready";

/// Readiness check selected per Manifest
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StateCheck {
    /// Always ready; applied resources speak for themselves
    #[default]
    Default,
    /// Compare declared custom resource states on the target cluster
    CustomState,
}

impl StateCheck {
    /// Run the check against the target cluster
    pub async fn run(
        &self,
        target: &ClusterInfo,
        custom_states: &[CustomState],
        resource: Option<&DynamicObject>,
    ) -> Result<bool> {
        match self {
            Self::Default => Ok(true),
            Self::CustomState => check_custom_states(target, custom_states, resource).await,
        }
    }
}

async fn check_custom_states(
    target: &ClusterInfo,
    custom_states: &[CustomState],
    resource: Option<&DynamicObject>,
) -> Result<bool> {
    let client = target.materialize()?;

    if custom_states.is_empty() {
        let Some(resource) = resource else {
            return Ok(true);
        };
        let Some(types) = resource.types.clone() else {
            return Ok(true);
        };
        let state = CustomState {
            api_version: types.api_version,
            kind: types.kind,
            name: resource.name_any(),
            namespace: resource.namespace().unwrap_or_else(|| "default".to_string()),
            state: DEFAULT_EXPECTED_STATE.to_string(),
        };
        return check_one(&client, &state).await;
    }

    for state in custom_states {
        if !check_one(&client, state).await? {
            return Ok(false);
        }
    }
    Ok(true)
}

async fn check_one(client: &kube::Client, expectation: &CustomState) -> Result<bool> {
    let (group, version) = match expectation.api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", expectation.api_version.as_str()),
    };
    let gvk = GroupVersionKind::gvk(group, version, &expectation.kind);
    let resource = ApiResource::from_gvk(&gvk);
    let api: Api<DynamicObject> =
        Api::namespaced_with(client.clone(), &expectation.namespace, &resource);

    let Some(found) = api.get_opt(&expectation.name).await? else {
        debug!(
            resource = %format!("{}/{}", expectation.namespace, expectation.name),
            "custom resource not found yet"
        );
        return Ok(false);
    };

    let actual = found.data["status"]["state"].as_str().ok_or_else(|| {
        Error::config(format!(
            "custom resource {}/{} has no status.state",
            expectation.namespace, expectation.name
        ))
    })?;
    Ok(actual == expectation.state)
}
