//! Inbound webhook adapter: an `axum::Router` with exactly one route besides
//! `/health`. Grounded on `swarm/callback.rs::build_router`'s shape (State
//! extractor, JSON handlers, graceful shutdown via a oneshot channel) minus
//! the event-buffer bookkeeping that file carried for its own purposes.

pub mod outbound;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use branchline_common::{Event, EventKind};
use serde::Deserialize;
use tokio::sync::oneshot;
use tower_http::cors::CorsLayer;

use crate::events::EventBus;

#[derive(Clone)]
struct ServerState {
    bus: Arc<EventBus>,
}

/// §6's inbound payload: `{branch, pipeline_branch, integration_branch}`,
/// plus the merge commit SHA most forges include in their own merge
/// webhook and that the `integration.pr.merged` handler needs to call
/// `ManifestManager::move_to_merge_history`.
#[derive(Debug, Deserialize)]
struct IntegrationMergedPayload {
    branch: String,
    pipeline_branch: String,
    integration_branch: String,
    #[serde(default)]
    commit_sha: Option<String>,
}

fn build_router(bus: Arc<EventBus>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/integration", post(integration_merged))
        .with_state(ServerState { bus })
        .layer(CorsLayer::permissive())
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn integration_merged(
    State(state): State<ServerState>,
    Json(payload): Json<IntegrationMergedPayload>,
) -> StatusCode {
    state
        .bus
        .publish(Event::new(
            EventKind::IntegrationPrMerged,
            &payload.branch,
            serde_json::json!({
                "branch": payload.branch,
                "pipeline_branch": payload.pipeline_branch,
                "integration_branch": payload.integration_branch,
                "commit_sha": payload.commit_sha,
            }),
        ))
        .await;
    StatusCode::OK
}

/// A running inbound webhook server, stoppable via [`InboundServer::shutdown`].
pub struct InboundServer {
    shutdown_tx: oneshot::Sender<()>,
    handle: tokio::task::JoinHandle<std::io::Result<()>>,
}

impl InboundServer {
    /// Bind and serve in the background; returns immediately.
    pub async fn spawn(addr: SocketAddr, bus: Arc<EventBus>) -> anyhow::Result<Self> {
        let router = build_router(bus);
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });
        Ok(Self { shutdown_tx, handle })
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.await;
    }
}
