use axum::extract::State;
use axum::{Json, Router, routing::get};
use log::info;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;

/// What the node is doing, served on `/status`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeStatus {
    pub node: String,
    pub phase: String,
    pub linked_clusters: Vec<u64>,
    pub error: Option<String>,
}

pub type SharedStatus = Arc<RwLock<NodeStatus>>;

pub fn new_status(node: impl Into<String>) -> SharedStatus {
    Arc::new(RwLock::new(NodeStatus {
        node: node.into(),
        phase: "starting".to_string(),
        ..NodeStatus::default()
    }))
}

/// Handler for health check endpoint
async fn health_handler() -> &'static str {
    "ok"
}

async fn status_handler(State(status): State<SharedStatus>) -> Json<NodeStatus> {
    Json(status.read().clone())
}

/// Start HTTP server for health check and node status
pub async fn start_http_server(
    addr: std::net::SocketAddr,
    status: SharedStatus,
    shutdown: Arc<Notify>,
) -> Result<tokio::task::JoinHandle<()>, std::io::Error> {
    let listener = TcpListener::bind(addr).await?;
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .with_state(status);
    info!("Starting HTTP server on {} (/health and /status)", addr);

    Ok(tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.notified().await;
            })
            .await
            .ok();
    }))
}
