//! HTTP status endpoint (§10) — exposes the running engine's connection
//! state, in-flight transfer count, and UDP crypto generation as JSON.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;

use vmnx_engine::EngineHandle;

#[derive(Serialize)]
struct StatusResponse {
    connected: bool,
    transfer_count: usize,
    crypto_generation: u64,
}

async fn handle_status(State(engine): State<EngineHandle>) -> Json<StatusResponse> {
    Json(StatusResponse {
        connected: engine.is_connected(),
        transfer_count: engine.transfers().len(),
        crypto_generation: engine.crypto_generation(),
    })
}

/// Serve `GET /status` on `127.0.0.1:<port>` until the process exits.
pub async fn serve(engine: EngineHandle, port: u16) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/status", get(handle_status))
        .with_state(engine);

    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    tracing::info!(port, "status endpoint listening");
    axum::serve(listener, app).await?;
    Ok(())
}
