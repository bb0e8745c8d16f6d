//! Rendering: the renderer interface, its cache and the factory
//!
//! A renderer turns a chart source plus flags into concrete cluster objects
//! and owns the connection to the cluster it applies them to. Renderers are
//! shared across Manifests with the same owner label through the
//! [`RendererCache`].

mod cache;
pub mod engine;
mod helm;
mod kustomize;

pub use cache::RendererCache;
pub use helm::{HelmFlags, HelmRenderer};
pub use kustomize::KustomizeRenderer;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::DynamicObject;

#[cfg(test)]
use mockall::automock;

use crate::apply::ApplyEngine;
use crate::cluster::ClusterInfo;
use crate::error::Result;
use crate::flags::ChartFlags;
use crate::labels;
use engine::{HelmCli, HelmEngine, KustomizeCli, KustomizeEngine};

/// Chart coordinates and flags of one install
#[derive(Clone, Debug, Default)]
pub struct ChartInfo {
    /// Chart name; `<install>/<chart>` for repo-sourced Helm charts
    pub chart_name: String,
    /// Local chart or kustomization directory, when the source is on disk
    pub chart_path: String,
    /// Local repository alias for repo-sourced Helm charts
    pub repo_name: String,
    /// Chart repository or remote kustomization URL
    pub url: String,
    /// Release name, equal to the install name
    pub release_name: String,
    /// Flags driving the renderer and chart values
    pub flags: ChartFlags,
}

/// Renderer family for a chart source
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChartKind {
    /// Helm chart, from a repository or an extracted layer
    Helm,
    /// Kustomization, local or remote
    Kustomize,
    /// Undecidable from the source; treated as Helm
    Unknown,
}

impl ChartKind {
    /// Decide the renderer family from chart coordinates, probing the chart
    /// directory when one is present
    pub fn detect(chart: &ChartInfo) -> Self {
        if !chart.repo_name.is_empty() && !chart.url.is_empty() {
            return Self::Helm;
        }
        if !chart.chart_path.is_empty() {
            let path = Path::new(&chart.chart_path);
            if path.join("Chart.yaml").exists() {
                return Self::Helm;
            }
            if path.join("kustomization.yaml").exists()
                || path.join("kustomization.yml").exists()
                || path.join("Kustomization").exists()
            {
                return Self::Kustomize;
            }
            return Self::Unknown;
        }
        if !chart.url.is_empty() {
            return Self::Kustomize;
        }
        Self::Unknown
    }
}

/// Turns chart sources into cluster objects and drives them on the target.
///
/// A renderer is initialized once per owner key and shared; it owns the
/// target cluster connection, which the reconciler queries back through
/// [`Renderer::cluster_info`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Connection of the cluster this renderer applies to
    fn cluster_info(&self) -> ClusterInfo;

    /// Render the chart into a multi-document manifest
    async fn raw_render(&self, chart: &ChartInfo) -> Result<String>;

    /// Apply rendered objects on the target
    async fn apply(&self, objects: &[DynamicObject]) -> Result<()>;

    /// Remove rendered objects from the target
    async fn delete(&self, objects: &[DynamicObject]) -> Result<()>;

    /// True once all objects report ready
    async fn is_ready(&self, objects: &[DynamicObject]) -> Result<bool>;

    /// True while all objects exist and keep this operator as field owner
    async fn is_consistent(&self, objects: &[DynamicObject]) -> Result<bool>;

    /// Poll readiness until it holds or the timeout elapses
    async fn wait_ready(&self, objects: &[DynamicObject], timeout: Duration) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_ready(objects).await? {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }
}

/// Chooses and initializes the renderer for a chart source
pub struct RendererFactory {
    helm: Arc<dyn HelmEngine>,
    kustomize: Arc<dyn KustomizeEngine>,
}

impl RendererFactory {
    /// Factory over the default CLI engines
    pub fn new() -> Self {
        Self {
            helm: Arc::new(HelmCli::new()),
            kustomize: Arc::new(KustomizeCli::new()),
        }
    }

    /// Factory over custom engines, used by tests
    pub fn with_engines(helm: Arc<dyn HelmEngine>, kustomize: Arc<dyn KustomizeEngine>) -> Self {
        Self { helm, kustomize }
    }

    /// Initialize a renderer for the chart against the target cluster.
    ///
    /// Materializes the cluster client so the returned renderer carries a
    /// complete [`ClusterInfo`].
    pub fn create(&self, chart: &ChartInfo, cluster: &ClusterInfo) -> Result<Arc<dyn Renderer>> {
        let client = cluster.materialize()?;
        let cluster = ClusterInfo {
            config: cluster.config.clone(),
            client: Some(client.clone()),
        };
        let apply = ApplyEngine::new(client, labels::FIELD_OWNER);

        Ok(match ChartKind::detect(chart) {
            ChartKind::Helm | ChartKind::Unknown => Arc::new(HelmRenderer::new(
                self.helm.clone(),
                apply,
                cluster,
                &chart.flags,
            )),
            ChartKind::Kustomize => Arc::new(KustomizeRenderer::new(
                self.kustomize.clone(),
                apply,
                cluster,
            )),
        })
    }
}

impl Default for RendererFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_coordinates_mean_helm() {
        let chart = ChartInfo {
            chart_name: "nginx/nginx-ingress".to_string(),
            repo_name: "nginx".to_string(),
            url: "https://helm.nginx.com/stable".to_string(),
            ..Default::default()
        };
        assert_eq!(ChartKind::detect(&chart), ChartKind::Helm);
    }

    #[test]
    fn bare_url_means_remote_kustomization() {
        let chart = ChartInfo {
            chart_name: "overlay".to_string(),
            url: "https://github.com/example/repo//config/default?ref=main".to_string(),
            ..Default::default()
        };
        assert_eq!(ChartKind::detect(&chart), ChartKind::Kustomize);
    }

    #[test]
    fn chart_directory_is_probed_for_markers() {
        let dir = tempfile::tempdir().unwrap();
        let chart = ChartInfo {
            chart_path: dir.path().to_string_lossy().into_owned(),
            ..Default::default()
        };
        assert_eq!(ChartKind::detect(&chart), ChartKind::Unknown);

        std::fs::write(dir.path().join("kustomization.yaml"), "resources: []\n").unwrap();
        assert_eq!(ChartKind::detect(&chart), ChartKind::Kustomize);

        std::fs::write(dir.path().join("Chart.yaml"), "name: sample\n").unwrap();
        assert_eq!(ChartKind::detect(&chart), ChartKind::Helm);
    }
}
