//! Install pipeline
//!
//! Drives one install job end to end: renderer acquisition through the
//! cache, manifest acquisition (pre-rendered file, cached render, fresh
//! render), apply or removal, readiness and the final state check.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::apply::{is_not_found, ApplyEngine};
use crate::error::Result;
use crate::labels;
use crate::prepare::InstallJob;
use crate::render::{Renderer, RendererCache, RendererFactory};
use crate::transform::{build_target_objects, default_transforms, ObjectTransform};

/// File name of a cached or pre-rendered manifest inside a chart path
const MANIFEST_FILE: &str = "manifest.yaml";

/// Runs install, uninstall and consistency operations for install jobs
pub struct InstallPipeline {
    cache: Arc<RendererCache>,
    factory: RendererFactory,
    transforms: Vec<ObjectTransform>,
}

impl InstallPipeline {
    /// Pipeline with the default post-render transforms
    pub fn new(cache: Arc<RendererCache>, factory: RendererFactory) -> Self {
        Self {
            cache,
            factory,
            transforms: default_transforms(),
        }
    }

    /// Pipeline with a custom transform chain
    pub fn with_transforms(
        cache: Arc<RendererCache>,
        factory: RendererFactory,
        transforms: Vec<ObjectTransform>,
    ) -> Self {
        Self {
            cache,
            factory,
            transforms,
        }
    }

    /// Install one job. Returns readiness: `false` means applied but still
    /// progressing.
    pub async fn install(&self, job: &InstallJob) -> Result<bool> {
        let renderer = self.renderer_for(job)?;
        let engine = self.target_engine(job, renderer.as_ref())?;

        engine.ensure_crds(&job.crds, true).await?;

        let manifest = self.manifest_for(renderer.as_ref(), job).await?;
        let objects = build_target_objects(&manifest, &self.transforms, &job.base_resource)?;
        renderer.apply(&objects).await?;

        if job.check_ready_states && !renderer.is_ready(&objects).await? {
            return Ok(false);
        }

        engine
            .ensure_custom_resources(&job.custom_resources, true)
            .await?;

        job.check
            .run(
                &renderer.cluster_info(),
                &job.custom_states,
                job.custom_resources.first(),
            )
            .await
    }

    /// Remove one job's workloads. Custom resources go first; a missing
    /// custom resource kind means the CRD is already gone and counts as
    /// removed.
    pub async fn uninstall(&self, job: &InstallJob) -> Result<bool> {
        let renderer = self.renderer_for(job)?;
        let engine = self.target_engine(job, renderer.as_ref())?;

        if !engine.remove_custom_resources(&job.custom_resources).await? {
            return Ok(false);
        }

        let manifest = self.manifest_for(renderer.as_ref(), job).await?;
        let objects = build_target_objects(&manifest, &self.transforms, &job.base_resource)?;
        renderer.delete(&objects).await?;

        engine.remove_crds(&job.crds).await?;

        job.check
            .run(
                &renderer.cluster_info(),
                &job.custom_states,
                job.custom_resources.first(),
            )
            .await
    }

    /// Verify a previously installed job is still in shape: CRDs and custom
    /// resources exist, every object keeps this operator as field owner and
    /// the state check holds.
    pub async fn consistency_check(&self, job: &InstallJob) -> Result<bool> {
        let renderer = self.renderer_for(job)?;
        let engine = self.target_engine(job, renderer.as_ref())?;

        match engine.ensure_crds(&job.crds, false).await {
            Ok(()) => {}
            Err(err) if is_not_found(&err) => return Ok(false),
            Err(err) => return Err(err),
        }
        match engine
            .ensure_custom_resources(&job.custom_resources, false)
            .await
        {
            Ok(()) => {}
            Err(err) if is_not_found(&err) => return Ok(false),
            Err(err) => return Err(err),
        }

        let manifest = self.manifest_for(renderer.as_ref(), job).await?;
        let objects = build_target_objects(&manifest, &self.transforms, &job.base_resource)?;
        if !renderer.is_consistent(&objects).await? {
            return Ok(false);
        }

        job.check
            .run(
                &renderer.cluster_info(),
                &job.custom_states,
                job.custom_resources.first(),
            )
            .await
    }

    /// Acquire the renderer for a job through the cache.
    ///
    /// The cached renderer is reused only while the job's flag fingerprint
    /// matches the one last seen for this Manifest; on a mismatch the
    /// renderer is re-initialized with the new flags and the owner entry is
    /// overwritten. Jobs without an owner key bypass the cache entirely.
    pub fn renderer_for(&self, job: &InstallJob) -> Result<Arc<dyn Renderer>> {
        let owner_key = job.owner_key();
        let fingerprint = job.chart.flags.fingerprint();

        if let Some(owner_key) = &owner_key {
            if self.cache.get_config(&job.resource_key()) == fingerprint {
                if let Some(renderer) = self.cache.get_renderer(owner_key) {
                    debug!(owner = %owner_key, "renderer cache hit");
                    return Ok(renderer);
                }
            }
        }

        let renderer = self.factory.create(&job.chart, &job.cluster)?;
        if let Some(owner_key) = owner_key {
            self.cache.set_renderer(owner_key, renderer.clone());
            self.cache.set_config(job.resource_key(), fingerprint);
        }
        Ok(renderer)
    }

    /// Engine for CRD and custom resource operations on the job's target
    fn target_engine(&self, job: &InstallJob, renderer: &dyn Renderer) -> Result<ApplyEngine> {
        let cluster = renderer.cluster_info();
        let client = match cluster.materialize() {
            Ok(client) => client,
            Err(_) => job.cluster.materialize()?,
        };
        Ok(ApplyEngine::new(client, labels::FIELD_OWNER))
    }

    /// Acquire the rendered manifest for a job.
    ///
    /// Order: a pre-rendered manifest directory at the chart path, then the
    /// cached render from an earlier run, then a fresh render. Fresh renders
    /// are persisted next to static chart paths; a persist refused by the
    /// filesystem only costs future render time and is tolerated.
    async fn manifest_for(&self, renderer: &dyn Renderer, job: &InstallJob) -> Result<String> {
        let chart_path = &job.chart.chart_path;
        if !chart_path.is_empty() {
            let path = Path::new(chart_path);
            if let Some(pre_rendered) = read_plain_manifest_dir(path)? {
                debug!(chart = %job.chart.chart_name, "using pre-rendered manifest");
                return Ok(pre_rendered);
            }
            match tokio::fs::read_to_string(manifest_file(path)).await {
                Ok(cached) => {
                    debug!(chart = %job.chart.chart_name, "using cached rendered manifest");
                    return Ok(cached);
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }

        let rendered = renderer.raw_render(&job.chart).await?;

        if !chart_path.is_empty() {
            let target = manifest_file(Path::new(chart_path));
            if let Err(err) = tokio::fs::write(&target, &rendered).await {
                if err.kind() == std::io::ErrorKind::PermissionDenied {
                    warn!(
                        chart = %job.chart.chart_name,
                        file = %target.display(),
                        "rendered manifest could not be cached, this will affect performance"
                    );
                } else {
                    return Err(err.into());
                }
            }
        }
        Ok(rendered)
    }
}

fn manifest_file(chart_path: &Path) -> PathBuf {
    chart_path.join(MANIFEST_FILE)
}

/// Read a directory of already rendered manifests.
///
/// Returns `None` when the directory is a chart or kustomization source
/// (which must be rendered) or contains no YAML. Unreadable directories and
/// files propagate their errors; a chart path must be accessible.
fn read_plain_manifest_dir(path: &Path) -> Result<Option<String>> {
    if !path.is_dir() {
        return Ok(None);
    }
    for marker in ["Chart.yaml", "kustomization.yaml", "kustomization.yml", "Kustomization"] {
        if path.join(marker).exists() {
            return Ok(None);
        }
    }

    let mut documents = Vec::new();
    let mut entries: Vec<_> = std::fs::read_dir(path)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|entry| entry.file_name());
    for entry in entries {
        let entry_path = entry.path();
        let is_yaml = entry_path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e == "yaml" || e == "yml")
            .unwrap_or(false);
        if !is_yaml || entry.file_name() == MANIFEST_FILE {
            continue;
        }
        documents.push(std::fs::read_to_string(&entry_path)?);
    }

    if documents.is_empty() {
        Ok(None)
    } else {
        Ok(Some(documents.join("\n---\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chart_sources_are_not_plain_manifest_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Chart.yaml"), "name: sample\n").unwrap();
        std::fs::write(dir.path().join("values.yaml"), "replicas: 1\n").unwrap();
        assert!(read_plain_manifest_dir(dir.path()).unwrap().is_none());
    }

    #[test]
    fn plain_yaml_dirs_are_concatenated() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.yaml"), "kind: ConfigMap\n").unwrap();
        std::fs::write(dir.path().join("b.yaml"), "kind: Secret\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored\n").unwrap();
        let combined = read_plain_manifest_dir(dir.path()).unwrap().unwrap();
        assert!(combined.contains("ConfigMap"));
        assert!(combined.contains("Secret"));
        assert!(!combined.contains("ignored"));
    }

    #[test]
    fn cached_manifest_file_is_excluded_from_the_slurp() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), "kind: Cached\n").unwrap();
        assert!(read_plain_manifest_dir(dir.path()).unwrap().is_none());
    }

    #[test]
    fn missing_directory_is_not_an_error() {
        assert!(read_plain_manifest_dir(Path::new("/does/not/exist"))
            .unwrap()
            .is_none());
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_directory_propagates_the_permission_error() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let inner = dir.path().join("kustomization-dir");
        std::fs::create_dir(&inner).unwrap();
        std::fs::write(inner.join("app.yaml"), "kind: ConfigMap\n").unwrap();
        std::fs::set_permissions(&inner, std::fs::Permissions::from_mode(0o444)).unwrap();

        // running as root bypasses permission bits; only assert otherwise
        if !nix_is_root() {
            let err = read_plain_manifest_dir(&inner).unwrap_err();
            assert!(err.to_string().contains("io error") || err.to_string().contains("denied"));
        }

        std::fs::set_permissions(&inner, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[cfg(unix)]
    fn nix_is_root() -> bool {
        std::process::Command::new("id")
            .arg("-u")
            .output()
            .map(|out| String::from_utf8_lossy(&out.stdout).trim() == "0")
            .unwrap_or(false)
    }
}
