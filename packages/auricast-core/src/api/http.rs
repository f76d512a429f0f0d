//! HTTP route handlers.
//!
//! All handlers are thin - they delegate to the reconciler and engine.

use std::net::SocketAddr;

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::{RouteError, RouteResult};
use crate::protocol_constants::{APP_NAME, SERVICE_ID};
use crate::reconciler::ApplyReport;
use crate::state::DesiredEngineState;
use crate::stats::EngineStats;

use super::AppState;

/// Builds the control router with CORS and request tracing.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/state", get(get_state).put(put_state))
        .route("/stats", get(get_stats))
        .route("/sinks/{sink_id}/webrtc/offer", post(webrtc_offer))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds the listener and serves the control API until the task is aborted.
pub async fn start_server(state: AppState, bind: SocketAddr) -> RouteResult<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|e| RouteError::Network(format!("control API bind {bind}: {e}")))?;
    tracing::info!("Control API listening on {bind}");
    axum::serve(listener, build_router(state))
        .await
        .map_err(|e| RouteError::Internal(e.to_string()))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "service": SERVICE_ID,
        "name": APP_NAME,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Returns the currently applied state (the reconciler's shadow).
async fn get_state(State(state): State<AppState>) -> Json<DesiredEngineState> {
    Json(state.reconciler.applied_state().await)
}

/// Applies a desired-state document and reports per-item outcomes.
async fn put_state(
    State(state): State<AppState>,
    Json(desired): Json<DesiredEngineState>,
) -> Result<Json<ApplyReport>, RouteError> {
    let report = state.reconciler.apply_state(desired).await?;
    Ok(Json(report))
}

async fn get_stats(State(state): State<AppState>) -> Json<EngineStats> {
    Json(state.engine.stats())
}

#[derive(Deserialize)]
struct OfferRequest {
    sdp: String,
}

#[derive(Serialize)]
struct AnswerResponse {
    sdp: String,
}

/// Feeds a remote WebRTC offer to a sink and returns the local answer.
async fn webrtc_offer(
    State(state): State<AppState>,
    Path(sink_id): Path<String>,
    Json(offer): Json<OfferRequest>,
) -> Result<Json<AnswerResponse>, RouteError> {
    let sdp = state.engine.handle_webrtc_offer(&sink_id, offer.sdp).await?;
    Ok(Json(AnswerResponse { sdp }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{AudioEngine, EngineConfig};
    use crate::reconciler::Reconciler;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    fn test_state() -> AppState {
        let engine = AudioEngine::new(EngineConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            scream_port: None,
            per_process_port: None,
            rtp_port: None,
            sap_enabled: false,
            ..EngineConfig::default()
        });
        engine.start().unwrap();
        let reconciler = Arc::new(Reconciler::new(Arc::clone(&engine)));
        AppState::new(engine, reconciler)
    }

    #[tokio::test]
    async fn serves_health_and_state() {
        let state = test_state();
        let engine = Arc::clone(&state.engine);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, build_router(state)).await.unwrap();
        });

        let health = reqwest_get(addr, "/health").await;
        assert!(health.contains("auricast"));

        let applied = reqwest_get(addr, "/state").await;
        assert!(applied.contains("sinks"));

        server.abort();
        engine.stop().await;
    }

    /// Minimal GET without pulling an HTTP client into dev-deps.
    async fn reqwest_get(addr: SocketAddr, path: &str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let mut body = String::new();
        stream.read_to_string(&mut body).await.unwrap();
        body
    }
}
