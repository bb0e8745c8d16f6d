//! Manifest operator - installs workload bundles declared by Manifest resources

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Client, CustomResourceExt, ResourceExt};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use manifest_operator::artifact::{ArtifactStore, OciRegistryClient};
use manifest_operator::controller::{error_policy, reconcile, Context, PipelineHandler};
use manifest_operator::crd::Manifest;
use manifest_operator::labels;
use manifest_operator::listener;
use manifest_operator::pipeline::InstallPipeline;
use manifest_operator::prepare::ReconcileFlags;
use manifest_operator::ratelimit::{RateLimiter, RequeueIntervals};
use manifest_operator::render::{RendererCache, RendererFactory};
use manifest_operator::workers::WorkerPool;

/// Manifest operator - CRD-driven installation of workload bundles
#[derive(Parser, Debug)]
#[command(name = "manifest-operator", version, about, long_about = None)]
struct Cli {
    /// Generate the CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Upper bound on parallel reconciles
    #[arg(long, env = "MAX_CONCURRENT_RECONCILES", default_value = "1")]
    max_concurrent_reconciles: u16,

    /// Size of the install worker pool
    #[arg(long, env = "WORKERS_CONCURRENT_MANIFESTS", default_value = "4")]
    workers_concurrent_manifests: usize,

    /// Wait for applied resources to report ready
    #[arg(long, env = "CHECK_READY_STATES")]
    check_ready_states: bool,

    /// Check declared custom resource states instead of the default check
    #[arg(long, env = "CUSTOM_STATE_CHECK")]
    custom_state_check: bool,

    /// Allow plaintext OCI registry pulls
    #[arg(long, env = "INSECURE_REGISTRY")]
    insecure_registry: bool,

    /// Listen address for the external event listener
    #[arg(long, env = "LISTENER_ADDR", default_value = "0.0.0.0:8082")]
    listener_addr: SocketAddr,

    /// Requeue interval after successful rounds, in seconds
    #[arg(long, default_value = "20")]
    requeue_success_secs: u64,

    /// Requeue interval after failed rounds, in seconds
    #[arg(long, default_value = "10")]
    requeue_failure_secs: u64,

    /// Requeue interval while waiting on readiness, in seconds
    #[arg(long, default_value = "2")]
    requeue_waiting_secs: u64,

    /// Root directory of the on-disk artifact cache
    #[arg(long, env = "CACHE_DIR", default_value = "/var/cache/manifest-operator")]
    cache_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&Manifest::crd())
            .map_err(|e| anyhow::anyhow!("failed to serialize CRD: {e}"))?;
        println!("{crd}");
        return Ok(());
    }

    run_operator(cli).await
}

async fn run_operator(cli: Cli) -> anyhow::Result<()> {
    tracing::info!("manifest operator starting");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {e}"))?;

    tokio::fs::create_dir_all(&cli.cache_dir)
        .await
        .map_err(|e| anyhow::anyhow!("failed to create cache dir {}: {e}", cli.cache_dir.display()))?;

    // process-wide shared state, threaded explicitly from here
    let store = Arc::new(ArtifactStore::new(
        cli.cache_dir.clone(),
        Arc::new(OciRegistryClient::new()),
        cli.insecure_registry,
    ));
    let cache = Arc::new(RendererCache::new());
    let pipeline = Arc::new(InstallPipeline::new(cache.clone(), RendererFactory::new()));

    // install worker pool; its shutdown signal mirrors the controller's
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });
    let pool = WorkerPool::new(cli.workers_concurrent_manifests);
    tracing::info!(workers = pool.pool_size(), "starting install workers");
    let job_tx = pool.start(Arc::new(PipelineHandler::new(pipeline.clone())), shutdown_rx);

    // external event listener feeding the reconcile stream
    let (event_tx, event_rx) = mpsc::channel::<ObjectRef<Manifest>>(64);
    let listener_addr = cli.listener_addr;
    tokio::spawn(async move {
        if let Err(err) = listener::serve(listener_addr, event_tx).await {
            tracing::error!(error = %err, "event listener failed");
        }
    });

    let flags = ReconcileFlags {
        check_ready_states: cli.check_ready_states,
        custom_state_check: cli.custom_state_check,
        custom_rest_getter: None,
    };
    let intervals = RequeueIntervals {
        success: Duration::from_secs(cli.requeue_success_secs),
        failure: Duration::from_secs(cli.requeue_failure_secs),
        waiting: Duration::from_secs(cli.requeue_waiting_secs),
    };
    let ctx = Arc::new(Context::new(
        client.clone(),
        job_tx,
        cache,
        store,
        pipeline,
        flags,
        intervals,
        Arc::new(RateLimiter::default()),
    ));

    let manifests: Api<Manifest> = Api::all(client.clone());
    let secrets: Api<Secret> = Api::all(client);

    tracing::info!("starting Manifest controller");
    let controller = Controller::new(manifests, WatcherConfig::default())
        .with_config(ControllerConfig::default().concurrency(cli.max_concurrent_reconciles));

    // remote kubeconfig secrets requeue the Manifests sharing their owner key
    let manifest_reader = controller.store();
    controller
        .watches(secrets, WatcherConfig::default(), move |secret: Secret| {
            let name = secret.name_any();
            let namespace = secret.namespace().unwrap_or_default();
            manifest_reader
                .state()
                .into_iter()
                .filter(|manifest| {
                    manifest.spec.remote
                        && manifest.namespace().unwrap_or_default() == namespace
                        && manifest.labels().get(labels::CACHE_KEY) == Some(&name)
                })
                .map(|manifest| ObjectRef::from_obj(manifest.as_ref()))
                .collect::<Vec<_>>()
        })
        .reconcile_on(ReceiverStream::new(event_rx))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((manifest, action)) => {
                    tracing::debug!(manifest = %manifest, ?action, "reconciliation completed");
                }
                Err(err) => {
                    tracing::debug!(error = %err, "reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("manifest operator shutting down");
    Ok(())
}
