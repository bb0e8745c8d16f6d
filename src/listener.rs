//! HTTP event listener
//!
//! Accepts watch events from remote watchers and forwards the event's
//! object key verbatim into the controller's reconcile stream.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use kube::runtime::reflector::ObjectRef;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::crd::Manifest;

/// A watch event delivered by an external watcher
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchEvent {
    /// Namespace of the watched object
    pub namespace: String,
    /// Name of the watched object
    pub name: String,
}

/// Build the listener router forwarding events into `tx`
pub fn event_router(tx: mpsc::Sender<ObjectRef<Manifest>>) -> Router {
    Router::new()
        .route("/v1/manifests/event", post(handle_event))
        .with_state(tx)
}

/// Serve the listener until the process shuts down
pub async fn serve(
    addr: std::net::SocketAddr,
    tx: mpsc::Sender<ObjectRef<Manifest>>,
) -> std::io::Result<()> {
    info!(%addr, "event listener started");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, event_router(tx)).await
}

async fn handle_event(
    State(tx): State<mpsc::Sender<ObjectRef<Manifest>>>,
    Json(event): Json<WatchEvent>,
) -> StatusCode {
    debug!(namespace = %event.namespace, name = %event.name, "received watch event");
    let reference = ObjectRef::new(&event.name).within(&event.namespace);
    match tx.send(reference).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(err) => {
            error!(error = %err, "reconcile trigger channel closed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
