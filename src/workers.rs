//! Install worker pool
//!
//! A fixed number of workers consume operation requests from one shared
//! channel and run the install pipeline for each. The request channel has
//! no slack: producers block until a worker picks their request up. Each
//! request carries its own response channel, so responses of concurrent
//! reconcile rounds never mix.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::crd::ObjectKey;
use crate::flags::Flags;
use crate::prepare::InstallJob;

/// Operation a worker performs for a job
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Install or update the job's workloads
    Create,
    /// Remove the job's workloads
    Delete,
}

/// One unit of work handed to the pool
pub struct OperationRequest {
    /// The install job to process
    pub job: InstallJob,
    /// Create or delete
    pub mode: Mode,
    /// Per-reconcile response channel
    pub response_tx: mpsc::Sender<InstallResponse>,
}

/// Outcome of one install job
#[derive(Clone, Debug)]
pub struct InstallResponse {
    /// Readiness of the installed workloads
    pub ready: bool,
    /// Install name the response belongs to
    pub chart_name: String,
    /// Key of the owning Manifest
    pub key: ObjectKey,
    /// Failure message, if the job errored
    pub err: Option<String>,
    /// Parsed client configuration of the install
    pub client_config: Flags,
    /// Parsed value overrides of the install
    pub overrides: Flags,
}

/// Handles one job; implemented by the install pipeline wrapper
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InstallHandler: Send + Sync {
    /// Process the job and report its outcome
    async fn handle(&self, job: &InstallJob, mode: Mode) -> InstallResponse;
}

/// Fixed-size pool of install workers
pub struct WorkerPool {
    initial_size: usize,
    size: usize,
}

impl WorkerPool {
    /// Create a pool definition; the size is clamped to at least one worker
    pub fn new(workers_concurrent_manifests: usize) -> Self {
        let size = workers_concurrent_manifests.max(1);
        Self {
            initial_size: size,
            size,
        }
    }

    /// Current pool size
    pub fn pool_size(&self) -> usize {
        self.size
    }

    /// Resize the pool definition. Non-positive sizes fall back to the
    /// initial size so the pool can never be configured away entirely.
    pub fn set_pool_size(&mut self, new_size: i64) {
        if new_size > 0 {
            self.size = new_size as usize;
        } else {
            self.size = self.initial_size;
        }
    }

    /// Start the workers and hand back the shared request channel.
    ///
    /// Workers run until the shutdown signal flips or the channel closes.
    pub fn start(
        &self,
        handler: Arc<dyn InstallHandler>,
        shutdown: watch::Receiver<bool>,
    ) -> mpsc::Sender<OperationRequest> {
        let (tx, rx) = mpsc::channel::<OperationRequest>(1);
        let rx = Arc::new(Mutex::new(rx));

        for worker_id in 1..=self.size {
            let rx = rx.clone();
            let handler = handler.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                info!(worker = worker_id, "starting install worker");
                loop {
                    let request = tokio::select! {
                        _ = shutdown.changed() => None,
                        request = async { rx.lock().await.recv().await } => request,
                    };
                    let Some(request) = request else {
                        debug!(worker = worker_id, "install worker stopping");
                        return;
                    };
                    debug!(
                        worker = worker_id,
                        chart = %request.job.chart.chart_name,
                        "processing install job"
                    );
                    let response = handler.handle(&request.job, request.mode).await;
                    // the collector may have been cancelled; nothing to do then
                    let _ = request.response_tx.send(response).await;
                }
            });
        }
        tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::StateCheck;
    use crate::cluster::ClusterInfo;
    use crate::render::ChartInfo;
    use kube::api::DynamicObject;

    fn job(name: &str) -> InstallJob {
        InstallJob {
            cluster: ClusterInfo::default(),
            chart: ChartInfo {
                chart_name: name.to_string(),
                release_name: name.to_string(),
                ..Default::default()
            },
            crds: Vec::new(),
            base_resource: DynamicObject {
                types: None,
                metadata: Default::default(),
                data: serde_json::Value::Null,
            },
            custom_resources: Vec::new(),
            custom_states: Vec::new(),
            check: StateCheck::Default,
            check_ready_states: false,
        }
    }

    struct EchoHandler;

    #[async_trait]
    impl InstallHandler for EchoHandler {
        async fn handle(&self, job: &InstallJob, mode: Mode) -> InstallResponse {
            InstallResponse {
                ready: mode == Mode::Create,
                chart_name: job.chart.chart_name.clone(),
                key: ObjectKey::new("default", job.chart.chart_name.clone()),
                err: None,
                client_config: Flags::new(),
                overrides: Flags::new(),
            }
        }
    }

    #[test]
    fn pool_size_is_clamped_to_at_least_one() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.pool_size(), 1);
    }

    #[test]
    fn non_positive_resize_falls_back_to_initial_size() {
        let mut pool = WorkerPool::new(4);
        pool.set_pool_size(8);
        assert_eq!(pool.pool_size(), 8);
        pool.set_pool_size(0);
        assert_eq!(pool.pool_size(), 4);
        pool.set_pool_size(-3);
        assert_eq!(pool.pool_size(), 4);
    }

    #[tokio::test]
    async fn workers_route_responses_to_the_request_channel() {
        let pool = WorkerPool::new(2);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let tx = pool.start(Arc::new(EchoHandler), shutdown_rx);

        let (response_tx, mut response_rx) = mpsc::channel(2);
        for name in ["nginx", "redis"] {
            tx.send(OperationRequest {
                job: job(name),
                mode: Mode::Create,
                response_tx: response_tx.clone(),
            })
            .await
            .unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..2 {
            let response = response_rx.recv().await.unwrap();
            assert!(response.ready);
            seen.push(response.chart_name);
        }
        seen.sort();
        assert_eq!(seen, vec!["nginx", "redis"]);
    }

    #[tokio::test]
    async fn separate_rounds_use_separate_response_channels() {
        let pool = WorkerPool::new(1);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let tx = pool.start(Arc::new(EchoHandler), shutdown_rx);

        let (round_one_tx, mut round_one_rx) = mpsc::channel(1);
        let (round_two_tx, mut round_two_rx) = mpsc::channel(1);

        tx.send(OperationRequest {
            job: job("one"),
            mode: Mode::Create,
            response_tx: round_one_tx,
        })
        .await
        .unwrap();
        tx.send(OperationRequest {
            job: job("two"),
            mode: Mode::Delete,
            response_tx: round_two_tx,
        })
        .await
        .unwrap();

        assert_eq!(round_one_rx.recv().await.unwrap().chart_name, "one");
        let second = round_two_rx.recv().await.unwrap();
        assert_eq!(second.chart_name, "two");
        assert!(!second.ready);
    }

    #[tokio::test]
    async fn closing_the_request_channel_stops_the_workers() {
        let pool = WorkerPool::new(1);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let tx = pool.start(Arc::new(EchoHandler), shutdown_rx);
        drop(tx);
        // nothing to assert beyond not hanging; give the worker a tick
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}
