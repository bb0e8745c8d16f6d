//! Manifest reconciliation
//!
//! The reconciler drives each Manifest through
//! `Initial → Processing → Ready/Error → Deleting`. Processing and Deleting
//! rounds enqueue one operation per install onto the worker pool and spawn a
//! collector that reads exactly one response per install before writing the
//! round's end state. The finalizer falls only after a deleting round
//! aggregates cleanly.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::artifact::ArtifactStore;
use crate::cluster::ClusterInfo;
use crate::crd::{
    ConditionStatus, InstallItem, Manifest, ManifestState, ManifestStatus, ObjectKey,
};
use crate::error::{Error, Result};
use crate::labels;
use crate::pipeline::InstallPipeline;
use crate::prepare::{get_install_jobs, InstallJob, ReconcileFlags};
use crate::ratelimit::{randomize_by_ten_percent, RateLimiter, RequeueIntervals};
use crate::render::RendererCache;
use crate::workers::{InstallHandler, InstallResponse, Mode, OperationRequest};

/// Reason recorded on the kind-level condition of every status write
const MANIFEST_KIND: &str = "Manifest";

/// Kubernetes operations on Manifest objects.
///
/// A trait seam so reconciliation logic is testable against mocks while the
/// real client is used in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ManifestClient: Send + Sync {
    /// Fetch the latest version of a Manifest
    async fn get(&self, key: &ObjectKey) -> Result<Option<Manifest>>;

    /// Write the status subresource
    async fn patch_status(&self, key: &ObjectKey, status: &ManifestStatus) -> Result<()>;

    /// Replace the finalizer list
    async fn replace_finalizers(&self, key: &ObjectKey, finalizers: Vec<String>) -> Result<()>;
}

/// Real Manifest client
pub struct KubeManifestClient {
    client: Client,
}

impl KubeManifestClient {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Manifest> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ManifestClient for KubeManifestClient {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Manifest>> {
        Ok(self.api(&key.namespace).get_opt(&key.name).await?)
    }

    async fn patch_status(&self, key: &ObjectKey, status: &ManifestStatus) -> Result<()> {
        let patch = serde_json::json!({ "status": status });
        self.api(&key.namespace)
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn replace_finalizers(&self, key: &ObjectKey, finalizers: Vec<String>) -> Result<()> {
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        self.api(&key.namespace)
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Shared state of the reconciler
pub struct Context {
    /// Manifest API operations
    pub manifests: Arc<dyn ManifestClient>,
    /// Host cluster client, used for secrets and artifact auth
    pub client: Client,
    /// Host cluster connection
    pub host: ClusterInfo,
    /// Request channel into the worker pool
    pub job_tx: mpsc::Sender<OperationRequest>,
    /// Process-wide renderer cache
    pub cache: Arc<RendererCache>,
    /// Process-wide artifact store
    pub store: Arc<ArtifactStore>,
    /// Pipeline for inline consistency checks
    pub pipeline: Arc<InstallPipeline>,
    /// Reconcile configuration
    pub flags: ReconcileFlags,
    /// Base requeue intervals
    pub intervals: RequeueIntervals,
    /// Reconcile rate limiter driving the error policy
    pub limiter: Arc<RateLimiter>,
}

impl Context {
    /// Context over the real Manifest client
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Client,
        job_tx: mpsc::Sender<OperationRequest>,
        cache: Arc<RendererCache>,
        store: Arc<ArtifactStore>,
        pipeline: Arc<InstallPipeline>,
        flags: ReconcileFlags,
        intervals: RequeueIntervals,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            manifests: Arc::new(KubeManifestClient::new(client.clone())),
            host: ClusterInfo::host(client.clone()),
            client,
            job_tx,
            cache,
            store,
            pipeline,
            flags,
            intervals,
            limiter,
        }
    }
}

/// Reconcile one Manifest
#[instrument(skip(manifest, ctx), fields(manifest = %ObjectKey::from_manifest(&manifest)))]
pub async fn reconcile(manifest: Arc<Manifest>, ctx: Arc<Context>) -> Result<Action> {
    let key = ObjectKey::from_manifest(&manifest);
    debug!("reconciling manifest");

    // a deleting Manifest may only move into or within Deleting
    if manifest.is_deleting() && manifest.state() != Some(ManifestState::Deleting) {
        update_status(&ctx, &manifest, ManifestState::Deleting, "deletion timestamp set").await?;
        ctx.limiter.forget(&key.to_string());
        return Ok(Action::await_change());
    }

    // the finalizer precedes any state handling
    if !manifest
        .finalizers()
        .iter()
        .any(|f| f == labels::MANIFEST_FINALIZER)
    {
        let mut finalizers = manifest.finalizers().to_vec();
        finalizers.push(labels::MANIFEST_FINALIZER.to_string());
        ctx.manifests.replace_finalizers(&key, finalizers).await?;
        return Ok(Action::await_change());
    }

    let action = match manifest.state() {
        None => {
            update_status(&ctx, &manifest, ManifestState::Processing, "initial state").await?;
            Action::await_change()
        }
        Some(ManifestState::Processing) => {
            dispatch(&ctx, &manifest, Mode::Create).await?;
            Action::requeue(randomize_by_ten_percent(ctx.intervals.failure))
        }
        Some(ManifestState::Deleting) => {
            dispatch(&ctx, &manifest, Mode::Delete).await?;
            Action::await_change()
        }
        Some(ManifestState::Error) => {
            update_status(
                &ctx,
                &manifest,
                ManifestState::Processing,
                "observed generation change",
            )
            .await?;
            Action::requeue(randomize_by_ten_percent(ctx.intervals.failure))
        }
        Some(ManifestState::Ready) => {
            handle_ready(&ctx, &manifest).await?;
            Action::requeue(randomize_by_ten_percent(ctx.intervals.success))
        }
    };

    ctx.limiter.forget(&key.to_string());
    Ok(action)
}

/// Requeue policy for failed reconciles: exponential per Manifest, bounded
/// globally by the token bucket
pub fn error_policy(manifest: Arc<Manifest>, err: &Error, ctx: Arc<Context>) -> Action {
    let key = ObjectKey::from_manifest(&manifest);
    let delay = ctx.limiter.when(&key.to_string());
    warn!(manifest = %key, error = %err, ?delay, "reconcile failed");
    Action::requeue(delay)
}

/// Enqueue one operation per install and spawn the round's collector.
///
/// The collector is spawned before the prepare phase runs so a cancelled or
/// failed round leaves it to drain the closed channel and abort quietly.
async fn dispatch(ctx: &Arc<Context>, manifest: &Manifest, mode: Mode) -> Result<()> {
    let key = ObjectKey::from_manifest(manifest);
    let count = manifest.spec.installs.len();
    let (response_tx, response_rx) = mpsc::channel(count.max(1));

    tokio::spawn(collect_responses(
        ctx.manifests.clone(),
        count,
        response_rx,
        key.clone(),
    ));

    let jobs = match get_install_jobs(
        manifest,
        &ctx.host,
        &ctx.client,
        &ctx.flags,
        &ctx.cache,
        &ctx.store,
    )
    .await
    {
        Ok(jobs) => jobs,
        Err(err) => {
            // surfaced immediately; the next reconcile retries after the
            // failure interval
            update_status(ctx, manifest, ManifestState::Error, &err.to_string()).await?;
            return Err(err);
        }
    };

    info!(manifest = %key, installs = jobs.len(), ?mode, "enqueueing install jobs");
    for job in jobs {
        ctx.job_tx
            .send(OperationRequest {
                job,
                mode,
                response_tx: response_tx.clone(),
            })
            .await
            .map_err(|_| Error::WorkerPoolClosed)?;
    }
    Ok(())
}

/// Steady-state verification for Ready Manifests
async fn handle_ready(ctx: &Arc<Context>, manifest: &Manifest) -> Result<()> {
    let key = ObjectKey::from_manifest(manifest);
    let generation = manifest.metadata.generation.unwrap_or_default();
    let observed = manifest
        .status
        .as_ref()
        .map(|s| s.observed_generation)
        .unwrap_or_default();
    if generation != observed {
        info!(manifest = %key, "observed generation change");
        return update_status(
            ctx,
            manifest,
            ManifestState::Processing,
            "observed generation change",
        )
        .await;
    }

    debug!(manifest = %key, "checking consistent state");
    let jobs = get_install_jobs(
        manifest,
        &ctx.host,
        &ctx.client,
        &ctx.flags,
        &ctx.cache,
        &ctx.store,
    )
    .await?;

    for job in &jobs {
        match ctx.pipeline.consistency_check(job).await {
            Ok(true) => {}
            Ok(false) => {
                return update_status(ctx, manifest, ManifestState::Processing, "resources not ready")
                    .await;
            }
            Err(err) => {
                error!(manifest = %key, error = %err, "consistency check failed");
                return update_status(ctx, manifest, ManifestState::Error, &err.to_string()).await;
            }
        }
    }
    Ok(())
}

/// Read exactly `count` responses for one round, then write the end state.
///
/// `error_seen` dominates `processing`. A closed channel before all
/// responses arrived means the round was abandoned; nothing is written and
/// the next reconcile picks the Manifest up. For a cleanly finished
/// deleting round the finalizer is removed instead of a status write; a
/// failed finalizer removal escalates to the error state.
pub async fn collect_responses(
    manifests: Arc<dyn ManifestClient>,
    count: usize,
    mut responses_rx: mpsc::Receiver<InstallResponse>,
    key: ObjectKey,
) {
    let mut error_seen = false;
    let mut processing = false;
    let mut responses: Vec<InstallResponse> = Vec::with_capacity(count);

    for _ in 0..count {
        match responses_rx.recv().await {
            Some(response) => {
                if let Some(err) = &response.err {
                    error!(manifest = %key, install = %response.chart_name, error = %err, "install failed");
                    error_seen = true;
                } else if !response.ready {
                    info!(manifest = %key, install = %response.chart_name, "install still processing");
                    processing = true;
                }
                responses.push(response);
            }
            None => {
                warn!(manifest = %key, "response channel closed, aborting aggregation");
                return;
            }
        }
    }

    let latest = match manifests.get(&key).await {
        Ok(Some(manifest)) => manifest,
        Ok(None) => {
            debug!(manifest = %key, "manifest disappeared during aggregation");
            return;
        }
        Err(err) => {
            error!(manifest = %key, error = %err, "fetching manifest after aggregation failed");
            return;
        }
    };

    let mut status = latest.status.clone().unwrap_or_default();
    for response in &responses {
        let (condition_status, message) = if response.err.is_some() {
            (ConditionStatus::False, "installation error")
        } else if !response.ready {
            (ConditionStatus::Unknown, "installation processing")
        } else {
            (ConditionStatus::True, "installation successful")
        };
        let item = InstallItem {
            chart_name: response.chart_name.clone(),
            client_config: serde_json::to_string(&response.client_config).unwrap_or_default(),
            overrides: serde_json::to_string(&response.overrides).unwrap_or_default(),
        };
        status.set_ready_condition(&response.chart_name, condition_status, message, Some(item));
    }

    let deleting = latest.is_deleting();
    if !error_seen && deleting && !processing {
        let remaining: Vec<String> = latest
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != labels::MANIFEST_FINALIZER)
            .cloned()
            .collect();
        match manifests.replace_finalizers(&key, remaining).await {
            Ok(()) => {
                info!(manifest = %key, "finalizer removed");
                return;
            }
            Err(err) => {
                error!(manifest = %key, error = %err, "removing finalizer failed");
                error_seen = true;
            }
        }
    }

    let state = end_state(error_seen, processing, deleting);
    if let Err(err) = write_status(
        manifests.as_ref(),
        &latest,
        status,
        state,
        &format!("{MANIFEST_KIND} in {state} state"),
    )
    .await
    {
        error!(manifest = %key, error = %err, "status update after aggregation failed");
    }
}

/// End state of an aggregation round; errors dominate, deletion sticks
pub fn end_state(error_seen: bool, processing: bool, deleting: bool) -> ManifestState {
    if error_seen {
        ManifestState::Error
    } else if deleting {
        ManifestState::Deleting
    } else if processing {
        ManifestState::Processing
    } else {
        ManifestState::Ready
    }
}

async fn update_status(
    ctx: &Arc<Context>,
    manifest: &Manifest,
    state: ManifestState,
    message: &str,
) -> Result<()> {
    let status = manifest.status.clone().unwrap_or_default();
    write_status(ctx.manifests.as_ref(), manifest, status, state, message).await
}

/// Write the status with the kind-level condition; every write observes the
/// current generation
async fn write_status(
    manifests: &dyn ManifestClient,
    manifest: &Manifest,
    mut status: ManifestStatus,
    state: ManifestState,
    message: &str,
) -> Result<()> {
    let condition_status = match state {
        ManifestState::Ready => ConditionStatus::True,
        _ => ConditionStatus::False,
    };
    status.state = state;
    status.set_ready_condition(MANIFEST_KIND, condition_status, message, None);
    status.observed_generation = manifest.metadata.generation.unwrap_or_default();
    manifests
        .patch_status(&ObjectKey::from_manifest(manifest), &status)
        .await
}

/// Worker-pool handler running the install pipeline
pub struct PipelineHandler {
    pipeline: Arc<InstallPipeline>,
}

impl PipelineHandler {
    /// Wrap the pipeline
    pub fn new(pipeline: Arc<InstallPipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl InstallHandler for PipelineHandler {
    async fn handle(&self, job: &InstallJob, mode: Mode) -> InstallResponse {
        let result = match mode {
            Mode::Create => self.pipeline.install(job).await,
            Mode::Delete => self.pipeline.uninstall(job).await,
        };
        let (ready, err) = match result {
            Ok(ready) => (ready, None),
            Err(error) => (false, Some(error.to_string())),
        };
        InstallResponse {
            ready,
            chart_name: job.chart.release_name.clone(),
            key: job.resource_key(),
            err,
            client_config: job.chart.flags.config_flags.clone(),
            overrides: job.chart.flags.set_flags.clone(),
        }
    }
}
