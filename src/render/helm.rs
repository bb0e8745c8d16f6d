//! Helm renderer

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::DynamicObject;
use serde_json::Value;
use tracing::debug;

use crate::apply::ApplyEngine;
use crate::cluster::ClusterInfo;
use crate::error::Result;
use crate::flags::{format_strvals, ChartFlags, Flags};
use crate::render::engine::{HelmEngine, HelmTemplateRequest};
use crate::render::{ChartInfo, Renderer};

/// Recognized renderer options, read from the install's `configFlags`.
///
/// Unknown keys are ignored.
#[derive(Clone, Debug, PartialEq)]
pub struct HelmFlags {
    /// Create the target namespace before applying
    pub create_namespace: bool,
    /// Roll back on failure (reserved; template-driven applies never
    /// partially install)
    pub atomic: bool,
    /// Wait for resources to become ready after apply
    pub wait: bool,
    /// Additionally wait for jobs to complete
    pub wait_for_jobs: bool,
    /// Render without applying
    pub dry_run: bool,
    /// Render CRDs contained in the chart
    pub include_crds: bool,
    /// Wait timeout in seconds
    pub timeout: i64,
    /// Target namespace
    pub namespace: String,
    /// Release name override
    pub release_name: Option<String>,
}

impl Default for HelmFlags {
    fn default() -> Self {
        Self {
            create_namespace: false,
            atomic: false,
            wait: false,
            wait_for_jobs: false,
            dry_run: false,
            include_crds: true,
            timeout: 0,
            namespace: "default".to_string(),
            release_name: None,
        }
    }
}

impl HelmFlags {
    /// Read recognized options from a parsed flag map
    pub fn from_flags(flags: &Flags) -> Self {
        let mut parsed = Self::default();
        for (key, value) in flags {
            match (key.as_str(), value) {
                ("createNamespace", Value::Bool(b)) => parsed.create_namespace = *b,
                ("atomic", Value::Bool(b)) => parsed.atomic = *b,
                ("wait", Value::Bool(b)) => parsed.wait = *b,
                ("waitForJobs", Value::Bool(b)) => parsed.wait_for_jobs = *b,
                ("dryRun", Value::Bool(b)) => parsed.dry_run = *b,
                ("includeCRDs", Value::Bool(b)) => parsed.include_crds = *b,
                ("timeout", Value::Number(n)) => parsed.timeout = n.as_i64().unwrap_or(0),
                ("namespace", Value::String(s)) => parsed.namespace = s.clone(),
                ("releaseName", Value::String(s)) => parsed.release_name = Some(s.clone()),
                _ => debug!(flag = %key, "ignoring unrecognized renderer flag"),
            }
        }
        parsed
    }

    /// Wait timeout as a duration, when waiting is enabled
    pub fn wait_timeout(&self) -> Option<Duration> {
        if (self.wait || self.wait_for_jobs) && self.timeout > 0 {
            Some(Duration::from_secs(self.timeout as u64))
        } else {
            None
        }
    }
}

/// Renders Helm charts through the template engine and applies the result
/// with server-side apply
pub struct HelmRenderer {
    engine: Arc<dyn HelmEngine>,
    apply: ApplyEngine,
    cluster: ClusterInfo,
    flags: HelmFlags,
    set_values: Option<String>,
}

impl HelmRenderer {
    /// Create a renderer seeded with the install's flags
    pub fn new(
        engine: Arc<dyn HelmEngine>,
        apply: ApplyEngine,
        cluster: ClusterInfo,
        flags: &ChartFlags,
    ) -> Self {
        let set_values = if flags.set_flags.is_empty() {
            None
        } else {
            Some(format_strvals(&flags.set_flags))
        };
        Self {
            engine,
            apply,
            cluster,
            flags: HelmFlags::from_flags(&flags.config_flags),
            set_values,
        }
    }

    /// Renderer flags, for inspection in tests
    pub fn flags(&self) -> &HelmFlags {
        &self.flags
    }

    fn creates_namespace(&self) -> bool {
        self.flags.create_namespace && self.flags.namespace != "default"
    }
}

#[async_trait]
impl Renderer for HelmRenderer {
    fn cluster_info(&self) -> ClusterInfo {
        self.cluster.clone()
    }

    async fn raw_render(&self, chart: &ChartInfo) -> Result<String> {
        let request = HelmTemplateRequest {
            release_name: self
                .flags
                .release_name
                .clone()
                .unwrap_or_else(|| chart.release_name.clone()),
            chart: if chart.chart_path.is_empty() {
                chart.chart_name.clone()
            } else {
                chart.chart_path.clone()
            },
            repo_url: (!chart.url.is_empty()).then(|| chart.url.clone()),
            namespace: self.flags.namespace.clone(),
            include_crds: self.flags.include_crds,
            set_values: self.set_values.clone(),
        };
        self.engine.template(&request).await
    }

    async fn apply(&self, objects: &[DynamicObject]) -> Result<()> {
        if self.creates_namespace() {
            self.apply.ensure_namespace(&self.flags.namespace).await?;
        }
        self.apply.apply_all(objects).await?;
        if let Some(timeout) = self.flags.wait_timeout() {
            self.wait_ready(objects, timeout).await?;
        }
        Ok(())
    }

    async fn delete(&self, objects: &[DynamicObject]) -> Result<()> {
        self.apply.delete_all(objects).await?;
        if self.creates_namespace() {
            self.apply.delete_namespace(&self.flags.namespace).await?;
        }
        Ok(())
    }

    async fn is_ready(&self, objects: &[DynamicObject]) -> Result<bool> {
        self.apply.is_ready(objects).await
    }

    async fn is_consistent(&self, objects: &[DynamicObject]) -> Result<bool> {
        self.apply.is_consistent(objects).await
    }
}
