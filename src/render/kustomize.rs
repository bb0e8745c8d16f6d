//! Kustomize renderer

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::DynamicObject;

use crate::apply::ApplyEngine;
use crate::cluster::ClusterInfo;
use crate::error::{Error, Result};
use crate::render::engine::KustomizeEngine;
use crate::render::{ChartInfo, Renderer};

/// Renders kustomizations through the build engine and applies the result
/// with server-side apply
pub struct KustomizeRenderer {
    engine: Arc<dyn KustomizeEngine>,
    apply: ApplyEngine,
    cluster: ClusterInfo,
}

impl KustomizeRenderer {
    /// Create a renderer for the target cluster
    pub fn new(engine: Arc<dyn KustomizeEngine>, apply: ApplyEngine, cluster: ClusterInfo) -> Self {
        Self {
            engine,
            apply,
            cluster,
        }
    }
}

#[async_trait]
impl Renderer for KustomizeRenderer {
    fn cluster_info(&self) -> ClusterInfo {
        self.cluster.clone()
    }

    async fn raw_render(&self, chart: &ChartInfo) -> Result<String> {
        let target = if chart.chart_path.is_empty() {
            &chart.url
        } else {
            &chart.chart_path
        };
        if target.is_empty() {
            return Err(Error::config(format!(
                "kustomization {} has neither path nor url",
                chart.release_name
            )));
        }
        self.engine.build(target).await
    }

    async fn apply(&self, objects: &[DynamicObject]) -> Result<()> {
        self.apply.apply_all(objects).await
    }

    async fn delete(&self, objects: &[DynamicObject]) -> Result<()> {
        self.apply.delete_all(objects).await
    }

    async fn is_ready(&self, objects: &[DynamicObject]) -> Result<bool> {
        self.apply.is_ready(objects).await
    }

    async fn is_consistent(&self, objects: &[DynamicObject]) -> Result<bool> {
        self.apply.is_consistent(objects).await
    }
}
