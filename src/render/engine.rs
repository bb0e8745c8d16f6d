//! External rendering engines
//!
//! Chart templating and kustomization building are delegated to the `helm`
//! and `kustomize` binaries behind narrow, mockable seams. The operator
//! never templates charts itself.

use async_trait::async_trait;
use tokio::process::Command;

#[cfg(test)]
use mockall::automock;

use crate::error::{Error, Result};

/// One `helm template` invocation
#[derive(Clone, Debug, Default)]
pub struct HelmTemplateRequest {
    /// Release name passed to the template
    pub release_name: String,
    /// Chart path, or `repo/name` coordinates when `repo_url` is set
    pub chart: String,
    /// Chart repository URL for repo-sourced charts
    pub repo_url: Option<String>,
    /// Target namespace rendered into the objects
    pub namespace: String,
    /// Render CRDs contained in the chart
    pub include_crds: bool,
    /// `--set` values in `key=value[,key=value]` form
    pub set_values: Option<String>,
}

/// Renders a Helm chart into a multi-document manifest
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HelmEngine: Send + Sync {
    /// Render the chart; returns the manifest stream on stdout
    async fn template(&self, request: &HelmTemplateRequest) -> Result<String>;
}

/// Builds a kustomization into a multi-document manifest
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KustomizeEngine: Send + Sync {
    /// Build the kustomization at a local path or remote URL
    async fn build(&self, target: &str) -> Result<String>;
}

/// `helm` binary invocation
pub struct HelmCli {
    binary: String,
}

impl HelmCli {
    /// Use the `helm` binary from PATH
    pub fn new() -> Self {
        Self {
            binary: "helm".to_string(),
        }
    }
}

impl Default for HelmCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HelmEngine for HelmCli {
    async fn template(&self, request: &HelmTemplateRequest) -> Result<String> {
        let mut command = Command::new(&self.binary);
        command.arg("template").arg(&request.release_name);

        match &request.repo_url {
            Some(url) => {
                // repo charts are addressed as `<release>/<chart>`; strip the
                // local repo alias when templating against --repo
                let chart = request
                    .chart
                    .rsplit('/')
                    .next()
                    .unwrap_or(&request.chart);
                command.arg(chart).arg("--repo").arg(url);
            }
            None => {
                command.arg(&request.chart);
            }
        }

        if !request.namespace.is_empty() {
            command.arg("--namespace").arg(&request.namespace);
        }
        if request.include_crds {
            command.arg("--include-crds");
        }
        if let Some(values) = &request.set_values {
            if !values.is_empty() {
                command.arg("--set").arg(values);
            }
        }

        run_render_command(command, "helm template").await
    }
}

/// `kustomize` binary invocation
pub struct KustomizeCli {
    binary: String,
}

impl KustomizeCli {
    /// Use the `kustomize` binary from PATH
    pub fn new() -> Self {
        Self {
            binary: "kustomize".to_string(),
        }
    }
}

impl Default for KustomizeCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KustomizeEngine for KustomizeCli {
    async fn build(&self, target: &str) -> Result<String> {
        let mut command = Command::new(&self.binary);
        command.arg("build").arg(target);
        run_render_command(command, "kustomize build").await
    }
}

async fn run_render_command(mut command: Command, name: &str) -> Result<String> {
    let output = command
        .output()
        .await
        .map_err(|err| Error::render(format!("running {name} failed: {err}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::render(format!(
            "{name} exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    String::from_utf8(output.stdout)
        .map_err(|err| Error::render(format!("{name} produced invalid UTF-8: {err}")))
}
