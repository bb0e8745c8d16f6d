//! Server-side apply engine
//!
//! Applies rendered objects concurrently with a shared field owner, checks
//! readiness and owner consistency, and removes objects on deletion. One
//! task per object; failures are aggregated so a single bad object never
//! hides the rest of the set.

use futures::future::join_all;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::core::GroupVersionKind;
use kube::discovery::{ApiResource, Discovery, Scope};
use kube::{Client, ResourceExt};
use tokio::sync::OnceCell;
use tracing::{debug, trace};

use crate::error::{Error, MultiError, Result};

/// Engine issuing apply, delete, readiness and consistency operations
/// against one target cluster
pub struct ApplyEngine {
    client: Client,
    discovery: OnceCell<Discovery>,
    field_owner: String,
}

impl ApplyEngine {
    /// Create an engine for the given cluster client
    pub fn new(client: Client, field_owner: impl Into<String>) -> Self {
        Self {
            client,
            discovery: OnceCell::new(),
            field_owner: field_owner.into(),
        }
    }

    /// Target cluster client
    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn discovery(&self) -> Result<&Discovery> {
        self.discovery
            .get_or_try_init(|| async {
                Discovery::new(self.client.clone())
                    .run()
                    .await
                    .map_err(Error::from)
            })
            .await
    }

    /// Resolve the API surface for an object: its resource, and the api
    /// handle honoring cluster/namespace scope. Discovery decides when it
    /// knows the kind; freshly created CRD kinds fall back to a derived
    /// resource.
    async fn api_for(&self, object: &DynamicObject) -> Result<Api<DynamicObject>> {
        let gvk = gvk_of(object)?;
        let resolved = self.discovery().await.ok().and_then(|d| {
            d.resolve_gvk(&gvk)
                .map(|(resource, capabilities)| (resource, capabilities.scope))
        });
        let (resource, scope) = match resolved {
            Some((resource, scope)) => (resource, scope),
            None => (ApiResource::from_gvk(&gvk), Scope::Namespaced),
        };

        Ok(match scope {
            Scope::Cluster => Api::all_with(self.client.clone(), &resource),
            Scope::Namespaced => {
                let namespace = object
                    .namespace()
                    .unwrap_or_else(|| "default".to_string());
                Api::namespaced_with(self.client.clone(), &namespace, &resource)
            }
        })
    }

    /// Server-side apply every object concurrently.
    ///
    /// All failures are collected into one aggregated error.
    pub async fn apply_all(&self, objects: &[DynamicObject]) -> Result<()> {
        trace!(resources = objects.len(), owner = %self.field_owner, "server-side apply");
        let results = join_all(objects.iter().map(|object| self.apply_one(object))).await;
        let failures: Vec<String> = results.into_iter().filter_map(|r| r.err()).collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(MultiError::new(failures).into())
        }
    }

    async fn apply_one(&self, object: &DynamicObject) -> std::result::Result<(), String> {
        let name = object.name_any();
        let api = self
            .api_for(object)
            .await
            .map_err(|err| format!("resolving api for {name} failed: {err}"))?;
        let params = PatchParams::apply(&self.field_owner).force();
        api.patch(&name, &params, &Patch::Apply(object))
            .await
            .map(|_| trace!(object = %name, "apply finished"))
            .map_err(|err| format!("patch for {name} failed: {err}"))
    }

    /// Best-effort concurrent delete; missing objects and missing kinds
    /// count as already deleted.
    pub async fn delete_all(&self, objects: &[DynamicObject]) -> Result<()> {
        let results = join_all(objects.iter().map(|object| self.delete_one(object))).await;
        let failures: Vec<String> = results.into_iter().filter_map(|r| r.err()).collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(MultiError::new(failures).into())
        }
    }

    async fn delete_one(&self, object: &DynamicObject) -> std::result::Result<(), String> {
        let name = object.name_any();
        let api = match self.api_for(object).await {
            Ok(api) => api,
            Err(_) => return Ok(()),
        };
        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(err) if is_not_found_kube(&err) => Ok(()),
            Err(err) => Err(format!("delete for {name} failed: {err}")),
        }
    }

    /// True once every object reports ready; returns false on the first
    /// not-ready resource.
    pub async fn is_ready(&self, objects: &[DynamicObject]) -> Result<bool> {
        for object in objects {
            let api = self.api_for(object).await?;
            let live = api.get_opt(&object.name_any()).await?;
            let ready = match &live {
                Some(live) => object_ready(live),
                None => false,
            };
            if !ready {
                debug!(object = %object.name_any(), "resource not ready");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// True while every object still exists and carries this engine's field
    /// owner in its managed fields.
    pub async fn is_consistent(&self, objects: &[DynamicObject]) -> Result<bool> {
        for object in objects {
            let api = self.api_for(object).await?;
            let Some(live) = api.get_opt(&object.name_any()).await? else {
                return Ok(false);
            };
            let owned = live
                .managed_fields()
                .iter()
                .any(|entry| entry.manager.as_deref() == Some(self.field_owner.as_str()));
            if !owned {
                debug!(object = %object.name_any(), "field owner lost");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Ensure CRDs exist: create missing ones, never update existing ones.
    /// With `create` false this is a pure existence check.
    pub async fn ensure_crds(&self, crds: &[DynamicObject], create: bool) -> Result<()> {
        self.ensure_objects(crds, create).await
    }

    /// Ensure custom resources exist; create-only, like CRDs
    pub async fn ensure_custom_resources(
        &self,
        resources: &[DynamicObject],
        create: bool,
    ) -> Result<()> {
        self.ensure_objects(resources, create).await
    }

    async fn ensure_objects(&self, objects: &[DynamicObject], create: bool) -> Result<()> {
        for object in objects {
            let api = self.api_for(object).await?;
            let name = object.name_any();
            match api.get_opt(&name).await? {
                Some(_) => {}
                None if create => {
                    api.create(&PostParams::default(), object).await?;
                    debug!(object = %name, "created");
                }
                None => {
                    return Err(Error::Kube(kube::Error::Api(not_found_response(&name))));
                }
            }
        }
        Ok(())
    }

    /// Remove custom resources. A kind that no longer has a registered CRD
    /// counts as removed; deletion of the CRD may have raced ahead.
    pub async fn remove_custom_resources(&self, resources: &[DynamicObject]) -> Result<bool> {
        for object in resources {
            let gvk = gvk_of(object)?;
            let known = self
                .discovery()
                .await
                .map(|d| d.resolve_gvk(&gvk).is_some())
                .unwrap_or(false);
            if !known {
                continue;
            }
            let api = self.api_for(object).await?;
            match api.delete(&object.name_any(), &DeleteParams::default()).await {
                Ok(_) => {}
                Err(err) if is_not_found_kube(&err) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(true)
    }

    /// Remove CRDs; absence is tolerated
    pub async fn remove_crds(&self, crds: &[DynamicObject]) -> Result<()> {
        self.delete_all(crds).await
    }

    /// Create a namespace if it does not exist yet
    pub async fn ensure_namespace(&self, namespace: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        if api.get_opt(namespace).await?.is_none() {
            let ns = Namespace {
                metadata: kube::api::ObjectMeta {
                    name: Some(namespace.to_string()),
                    labels: Some([("name".to_string(), namespace.to_string())].into()),
                    ..Default::default()
                },
                ..Default::default()
            };
            match api.create(&PostParams::default(), &ns).await {
                Ok(_) => {}
                Err(kube::Error::Api(response)) if response.code == 409 => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Delete a namespace; absence is tolerated
    pub async fn delete_namespace(&self, namespace: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.delete(namespace, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(err) if is_not_found_kube(&err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Fetch a live object by the identity of the given object
    pub async fn get_object(&self, object: &DynamicObject) -> Result<Option<DynamicObject>> {
        let api = self.api_for(object).await?;
        Ok(api.get_opt(&object.name_any()).await?)
    }
}

fn gvk_of(object: &DynamicObject) -> Result<GroupVersionKind> {
    let types = object
        .types
        .as_ref()
        .ok_or_else(|| Error::config(format!("object {} has no apiVersion/kind", object.name_any())))?;
    let (group, version) = match types.api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", types.api_version.as_str()),
    };
    Ok(GroupVersionKind::gvk(group, version, &types.kind))
}

fn not_found_response(name: &str) -> kube::core::ErrorResponse {
    kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{name} not found"),
        reason: "NotFound".to_string(),
        code: 404,
    }
}

fn is_not_found_kube(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

/// True when the error represents a missing object
pub fn is_not_found(err: &Error) -> bool {
    matches!(err, Error::Kube(inner) if is_not_found_kube(inner))
}

/// Readiness predicate over a live object.
///
/// Paused workloads count as ready; jobs are ready once complete; kinds
/// without a readiness notion are ready by existing.
pub fn object_ready(object: &DynamicObject) -> bool {
    let kind = object
        .types
        .as_ref()
        .map(|t| t.kind.as_str())
        .unwrap_or_default();
    let spec = &object.data["spec"];
    let status = &object.data["status"];
    let generation = object.metadata.generation.unwrap_or(0);
    let observed = status["observedGeneration"].as_i64().unwrap_or(generation);

    match kind {
        "Deployment" => {
            if spec["paused"].as_bool().unwrap_or(false) {
                return true;
            }
            let desired = spec["replicas"].as_i64().unwrap_or(1);
            observed >= generation
                && status["updatedReplicas"].as_i64().unwrap_or(0) >= desired
                && status["availableReplicas"].as_i64().unwrap_or(0) >= desired
        }
        "StatefulSet" => {
            let desired = spec["replicas"].as_i64().unwrap_or(1);
            observed >= generation && status["readyReplicas"].as_i64().unwrap_or(0) >= desired
        }
        "ReplicaSet" => {
            let desired = spec["replicas"].as_i64().unwrap_or(1);
            status["readyReplicas"].as_i64().unwrap_or(0) >= desired
        }
        "DaemonSet" => {
            let desired = status["desiredNumberScheduled"].as_i64().unwrap_or(0);
            observed >= generation && status["numberReady"].as_i64().unwrap_or(0) >= desired
        }
        "Job" => {
            let completions = spec["completions"].as_i64().unwrap_or(1);
            let complete = status["conditions"]
                .as_array()
                .map(|conditions| {
                    conditions.iter().any(|c| {
                        c["type"].as_str() == Some("Complete") && c["status"].as_str() == Some("True")
                    })
                })
                .unwrap_or(false);
            complete || status["succeeded"].as_i64().unwrap_or(0) >= completions
        }
        "Pod" => {
            let phase = status["phase"].as_str().unwrap_or_default();
            if phase == "Succeeded" {
                return true;
            }
            phase == "Running"
                && status["conditions"]
                    .as_array()
                    .map(|conditions| {
                        conditions.iter().any(|c| {
                            c["type"].as_str() == Some("Ready") && c["status"].as_str() == Some("True")
                        })
                    })
                    .unwrap_or(false)
        }
        "PersistentVolumeClaim" => status["phase"].as_str() == Some("Bound"),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(kind: &str, spec: serde_json::Value, status: serde_json::Value) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": kind,
            "metadata": { "name": "obj", "namespace": "default", "generation": 1 },
            "spec": spec,
            "status": status,
        }))
        .unwrap()
    }

    #[test]
    fn paused_deployment_is_ready() {
        let deploy = object("Deployment", json!({"paused": true, "replicas": 3}), json!({}));
        assert!(object_ready(&deploy));
    }

    #[test]
    fn deployment_readiness_tracks_available_replicas() {
        let not_ready = object(
            "Deployment",
            json!({"replicas": 2}),
            json!({"observedGeneration": 1, "updatedReplicas": 2, "availableReplicas": 1}),
        );
        assert!(!object_ready(&not_ready));

        let ready = object(
            "Deployment",
            json!({"replicas": 2}),
            json!({"observedGeneration": 1, "updatedReplicas": 2, "availableReplicas": 2}),
        );
        assert!(object_ready(&ready));
    }

    #[test]
    fn stale_deployment_status_is_not_ready() {
        let stale = object(
            "Deployment",
            json!({"replicas": 1}),
            json!({"observedGeneration": 0, "updatedReplicas": 1, "availableReplicas": 1}),
        );
        assert!(!object_ready(&stale));
    }

    #[test]
    fn job_completion_counts_as_ready() {
        let complete = object(
            "Job",
            json!({}),
            json!({"conditions": [{"type": "Complete", "status": "True"}]}),
        );
        assert!(object_ready(&complete));

        let running = object("Job", json!({}), json!({"active": 1}));
        assert!(!object_ready(&running));
    }

    #[test]
    fn kinds_without_readiness_are_ready_by_existing() {
        let config_map = object("ConfigMap", json!({}), json!({}));
        assert!(object_ready(&config_map));
    }

    #[test]
    fn missing_type_meta_is_a_config_error() {
        let object = DynamicObject {
            types: None,
            metadata: Default::default(),
            data: json!({}),
        };
        assert!(matches!(gvk_of(&object), Err(Error::Config(_))));
    }
}
