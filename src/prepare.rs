//! Prepare phase: parse a Manifest into install jobs
//!
//! Runs once per reconcile round, before any job is enqueued: pre-fetches
//! CRDs, resolves the target cluster, stamps watcher labels on the embedded
//! resource, decodes the configuration layer and materializes one
//! [`InstallJob`] per install.

use std::path::Path;
use std::sync::Arc;

use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::Value;
use tracing::debug;

use crate::artifact::auth::{keychain_for, Keychain};
use crate::artifact::ArtifactStore;
use crate::check::StateCheck;
use crate::cluster::{resolve_target, ClusterInfo, RestConfigGetter};
use crate::crd::{ChartSource, CustomState, ImageSpec, InstallEntry, Manifest, ObjectKey};
use crate::error::{Error, Result};
use crate::flags::ChartFlags;
use crate::labels;
use crate::render::{ChartInfo, RendererCache};

/// Per-process reconcile configuration threaded into the prepare phase
#[derive(Clone, Default)]
pub struct ReconcileFlags {
    /// Wait for applied resources to report ready
    pub check_ready_states: bool,
    /// Use the custom resource state check instead of the default
    pub custom_state_check: bool,
    /// Custom remote-cluster config getter installed at startup
    pub custom_rest_getter: Option<Arc<dyn RestConfigGetter>>,
}

/// Everything a worker needs to install or remove one install
#[derive(Clone)]
pub struct InstallJob {
    /// Target cluster connection
    pub cluster: ClusterInfo,
    /// Chart coordinates and flags
    pub chart: ChartInfo,
    /// CRDs created before the install, removed after uninstall
    pub crds: Vec<DynamicObject>,
    /// The owning Manifest, as a dynamic object, for transform inputs
    pub base_resource: DynamicObject,
    /// Custom resources created after the install
    pub custom_resources: Vec<DynamicObject>,
    /// State expectations evaluated by the custom check
    pub custom_states: Vec<CustomState>,
    /// Readiness check to run after apply
    pub check: StateCheck,
    /// Whether the pipeline polls resource readiness
    pub check_ready_states: bool,
}

impl InstallJob {
    /// Renderer-sharing key: the owner label paired with the namespace.
    /// Absent when the Manifest carries no cache-key label.
    pub fn owner_key(&self) -> Option<ObjectKey> {
        let owner = self.base_resource.labels().get(labels::CACHE_KEY).cloned()?;
        Some(ObjectKey::new(
            self.base_resource.namespace().unwrap_or_default(),
            owner,
        ))
    }

    /// Fingerprint key: the Manifest's own namespace and name
    pub fn resource_key(&self) -> ObjectKey {
        ObjectKey::new(
            self.base_resource.namespace().unwrap_or_default(),
            self.base_resource.name_any(),
        )
    }
}

/// Parse the Manifest into an ordered list of install jobs
pub async fn get_install_jobs(
    manifest: &Manifest,
    host: &ClusterInfo,
    host_client: &kube::Client,
    flags: &ReconcileFlags,
    cache: &RendererCache,
    store: &ArtifactStore,
) -> Result<Vec<InstallJob>> {
    let namespace = manifest.namespace().unwrap_or_default();

    let mut manifest = manifest.clone();
    insert_watcher_labels(&mut manifest);

    let crds = parse_crds(&manifest, &namespace, host_client, store).await?;
    let cluster = resolve_target(
        &manifest,
        host,
        host_client,
        cache,
        flags.custom_rest_getter.as_ref(),
    )
    .await?;

    let base_resource = to_dynamic(&manifest)?;
    let custom_resources = embedded_resource(&manifest)?;
    let configs = parse_configs(&manifest, &namespace, host_client, store).await?;

    let check = if flags.custom_state_check {
        StateCheck::CustomState
    } else {
        StateCheck::Default
    };

    let mut jobs = Vec::with_capacity(manifest.spec.installs.len());
    for install in &manifest.spec.installs {
        let mut chart =
            chart_info_for_install(install, &manifest, &namespace, host_client, store).await?;
        let (client_config, overrides) = config_for_install(&install.name, &configs)?;
        chart.release_name = install.name.clone();
        chart.flags = ChartFlags::parse(&client_config, &overrides)?;

        jobs.push(InstallJob {
            cluster: cluster.clone(),
            chart,
            crds: crds.clone(),
            base_resource: base_resource.clone(),
            custom_resources: custom_resources.clone(),
            custom_states: manifest.spec.custom_states.clone(),
            check,
            check_ready_states: flags.check_ready_states,
        });
    }
    Ok(jobs)
}

/// Stamp watcher labels onto the embedded resource of a remote Manifest
pub fn insert_watcher_labels(manifest: &mut Manifest) {
    if !manifest.spec.remote {
        return;
    }
    let namespace = manifest.namespace().unwrap_or_default();
    let name = manifest.name_any();
    let Some(resource) = manifest.spec.resource.as_mut() else {
        return;
    };
    if resource["kind"].as_str().unwrap_or_default().is_empty() {
        return;
    }

    let metadata = resource
        .as_object_mut()
        .and_then(|r| {
            r.entry("metadata")
                .or_insert_with(|| Value::Object(Default::default()))
                .as_object_mut()
        });
    let Some(metadata) = metadata else { return };
    let resource_labels = metadata
        .entry("labels")
        .or_insert_with(|| Value::Object(Default::default()));
    if let Some(resource_labels) = resource_labels.as_object_mut() {
        resource_labels.insert(
            labels::OWNED_BY.to_string(),
            Value::String(labels::owned_by_value(&namespace, &name)),
        );
        resource_labels.insert(
            labels::WATCHED_BY.to_string(),
            Value::String(labels::OPERATOR_NAME.to_string()),
        );
    }
}

async fn parse_crds(
    manifest: &Manifest,
    namespace: &str,
    host_client: &kube::Client,
    store: &ArtifactStore,
) -> Result<Vec<DynamicObject>> {
    let Some(spec) = &manifest.spec.crds else {
        return Ok(Vec::new());
    };
    if spec.type_.is_none() {
        return Ok(Vec::new());
    }
    let keychain = keychain_for(host_client, namespace, spec).await?;
    let path = store
        .extract_tar_gz(spec, &resolve_auth(&keychain, spec))
        .await?;
    crds_from_path(&path)
}

/// Collect CustomResourceDefinition documents from all YAML files under a
/// directory
pub fn crds_from_path(path: &Path) -> Result<Vec<DynamicObject>> {
    let mut crds = Vec::new();
    let mut pending = vec![path.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let entry_path = entry.path();
            if entry_path.is_dir() {
                pending.push(entry_path);
                continue;
            }
            let is_yaml = entry_path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e == "yaml" || e == "yml")
                .unwrap_or(false);
            if !is_yaml {
                continue;
            }
            let content = std::fs::read_to_string(&entry_path)?;
            for object in crate::transform::parse_manifest_objects(&content)? {
                let kind = object.types.as_ref().map(|t| t.kind.as_str());
                if kind == Some("CustomResourceDefinition") {
                    crds.push(object);
                }
            }
        }
    }
    Ok(crds)
}

async fn parse_configs(
    manifest: &Manifest,
    namespace: &str,
    host_client: &kube::Client,
    store: &ArtifactStore,
) -> Result<Vec<Value>> {
    let Some(spec) = &manifest.spec.config else {
        return Ok(Vec::new());
    };
    if spec.type_.is_none() {
        return Ok(Vec::new());
    }

    let keychain = keychain_for(host_client, namespace, spec).await?;
    let decoded = store
        .decode_yaml_layer(spec, &resolve_auth(&keychain, spec))
        .await?;

    // an empty layer decodes to null and means no configuration
    if decoded.is_null() {
        debug!(image = %spec.reference(), "configuration layer is empty");
        return Ok(Vec::new());
    }
    let object = decoded
        .as_object()
        .ok_or_else(|| Error::config("reading install .spec.config resulted in an error"))?;
    match object.get("configs") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(configs)) => Ok(configs.clone()),
        Some(_) => Err(Error::config(
            "reading chart config object of .spec.config resulted in an error",
        )),
    }
}

async fn chart_info_for_install(
    install: &InstallEntry,
    manifest: &Manifest,
    namespace: &str,
    host_client: &kube::Client,
    store: &ArtifactStore,
) -> Result<ChartInfo> {
    let key = ObjectKey::from_manifest(manifest);
    match ChartSource::from_raw(&install.source) {
        Ok(ChartSource::Helm(helm)) => Ok(ChartInfo {
            chart_name: format!("{}/{}", install.name, helm.chart_name),
            repo_name: install.name.clone(),
            url: helm.url,
            ..Default::default()
        }),
        Ok(ChartSource::Oci(image)) => {
            let keychain = keychain_for(host_client, namespace, &image).await?;
            let path = store
                .extract_tar_gz(&image, &resolve_auth(&keychain, &image))
                .await?;
            Ok(ChartInfo {
                chart_name: install.name.clone(),
                chart_path: path.to_string_lossy().into_owned(),
                ..Default::default()
            })
        }
        Ok(ChartSource::Kustomize(kustomize)) => Ok(ChartInfo {
            chart_name: install.name.clone(),
            chart_path: kustomize.path,
            url: kustomize.url,
            ..Default::default()
        }),
        Err(err) => Err(Error::config(format!(
            "install {} of Manifest {key}: {err}",
            install.name
        ))),
    }
}

/// Find the configuration strings for one install inside the decoded
/// configs list. An install without an entry gets empty flags.
fn config_for_install(install_name: &str, configs: &[Value]) -> Result<(String, String)> {
    for config in configs {
        let entry = config
            .as_object()
            .ok_or_else(|| Error::config("reading config object resulted in an error"))?;
        if entry.get("name").and_then(|n| n.as_str()) != Some(install_name) {
            continue;
        }
        let overrides = entry
            .get("overrides")
            .and_then(|o| o.as_str())
            .ok_or_else(|| Error::config("reading config object overrides resulted in an error"))?;
        let client_config = entry
            .get("clientConfig")
            .and_then(|c| c.as_str())
            .ok_or_else(|| Error::config("reading chart config resulted in an error"))?;
        return Ok((client_config.to_string(), overrides.to_string()));
    }
    Ok((String::new(), String::new()))
}

fn embedded_resource(manifest: &Manifest) -> Result<Vec<DynamicObject>> {
    let Some(resource) = &manifest.spec.resource else {
        return Ok(Vec::new());
    };
    if resource["kind"].as_str().unwrap_or_default().is_empty() {
        return Ok(Vec::new());
    }
    let object: DynamicObject = serde_json::from_value(resource.clone())
        .map_err(|err| Error::config(format!("embedded resource is invalid: {err}")))?;
    Ok(vec![object])
}

fn to_dynamic(manifest: &Manifest) -> Result<DynamicObject> {
    let value = serde_json::to_value(manifest)
        .map_err(|err| Error::serialization(format!("serializing Manifest failed: {err}")))?;
    serde_json::from_value(value)
        .map_err(|err| Error::serialization(format!("converting Manifest failed: {err}")))
}

fn resolve_auth(keychain: &Keychain, spec: &ImageSpec) -> oci_distribution::secrets::RegistryAuth {
    let registry = spec.repo.split('/').next().unwrap_or_default();
    keychain.resolve(registry)
}
