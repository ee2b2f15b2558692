use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use log::info;
use tokio::sync::watch;

use crate::error::ClusterResult;
use crate::state::JobStateSnapshot;

/// The read-only status surface. It serves the snapshot published by the
/// coordinator after each event and never touches live state.
pub fn create_router(snapshot: watch::Receiver<JobStateSnapshot>) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/health", get(get_health))
        .with_state(snapshot)
}

async fn get_status(
    State(snapshot): State<watch::Receiver<JobStateSnapshot>>,
) -> Json<JobStateSnapshot> {
    Json(snapshot.borrow().clone())
}

async fn get_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

pub async fn serve(
    host: &str,
    port: u16,
    snapshot: watch::Receiver<JobStateSnapshot>,
) -> ClusterResult<()> {
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    info!("status server listening on {}", listener.local_addr()?);
    axum::serve(listener, create_router(snapshot)).await?;
    Ok(())
}
