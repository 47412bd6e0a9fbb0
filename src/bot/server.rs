//! Webhook HTTP endpoint.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use tower_http::trace::TraceLayer;

use super::event::PullRequestEvent;
use super::pipeline::{DispatchOutcome, Orchestrator};
use super::signature::{self, SIGNATURE_HEADER};
use crate::errors::WebhookError;

pub const EVENT_HEADER: &str = "x-github-event";
pub const DELIVERY_HEADER: &str = "x-github-delivery";

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub webhook_secret: String,
}

pub type SharedState = Arc<AppState>;

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::BadSignature | WebhookError::MissingHeader(SIGNATURE_HEADER) => StatusCode::UNAUTHORIZED,
            WebhookError::MissingHeader(_) | WebhookError::Payload(_) => StatusCode::BAD_REQUEST,
        };
        (status, Json(json!({"error": self.to_string()}))).into_response()
    }
}

pub fn build_router(state: SharedState, webhook_path: &str) -> Router {
    Router::new()
        .route(webhook_path, post(handle_webhook))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn handle_webhook(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, WebhookError> {
    signature::verify(&state.webhook_secret, &body, header(&headers, SIGNATURE_HEADER))?;

    let kind = header(&headers, EVENT_HEADER).ok_or(WebhookError::MissingHeader(EVENT_HEADER))?;
    let delivery = header(&headers, DELIVERY_HEADER).unwrap_or("-");
    tracing::debug!(event = kind, delivery, "webhook received");

    match kind {
        "ping" => return Ok((StatusCode::OK, Json(json!({"status": "pong"}))).into_response()),
        "pull_request" => {}
        other => {
            tracing::debug!(event = other, "unsubscribed event");
            return Ok(ignored());
        }
    }

    let event = PullRequestEvent::from_payload(&body)?;
    match state.orchestrator.dispatch(event) {
        DispatchOutcome::Ignored(_) => Ok(ignored()),
        DispatchOutcome::Spawned { run_id, .. } => {
            tracing::info!(%run_id, delivery, "run accepted");
            Ok((
                StatusCode::ACCEPTED,
                Json(json!({"status": "accepted", "run_id": run_id})),
            )
                .into_response())
        }
    }
}

fn ignored() -> Response {
    (StatusCode::OK, Json(json!({"status": "ignored"}))).into_response()
}

/// Bind and serve until Ctrl+C.
pub async fn start_server(state: SharedState, port: u16, webhook_path: &str) -> Result<()> {
    let app = build_router(state, webhook_path);

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, webhook_path, "webporizer listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
