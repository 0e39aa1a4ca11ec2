//! HTTP surface of the agent: the `/exec` WebSocket endpoint and a health
//! probe.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::broker::{record_audit, Broker};
use crate::request::parse_request;

pub fn build_router(broker: Arc<Broker>) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/exec", get(exec))
        .with_state(broker)
        .layer(TraceLayer::new_for_http())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Validates the envelope and authorization before committing to the
/// upgrade; a request that fails either never touches a backend.
async fn exec(
    State(broker): State<Arc<Broker>>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let req = match parse_request(&headers) {
        Ok(req) => req,
        Err(err) => {
            tracing::warn!(error = %err, "request invalid");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    tracing::info!(request = %req.to_log_string(), "request info");

    if let Err(err) = broker.authorize(&req) {
        tracing::error!("{err}");
        return StatusCode::FORBIDDEN.into_response();
    }

    record_audit(&req);

    let Some(ws) = ws else {
        return StatusCode::UPGRADE_REQUIRED.into_response();
    };

    ws.on_upgrade(move |socket| broker.handle_socket(socket, req))
}
