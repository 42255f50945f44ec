//! The two endpoints in scope: `POST /messages` and the health/readiness
//! pair. Everything else — routing policy, request validation schemas,
//! the WebSocket surface — is explicitly out of scope here.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use wavelet_authz::{AuthzMiddleware, Principal, RequestContext};
use wavelet_errors::Error;

use crate::breaker_registry::CircuitBreakerRegistry;
use crate::message_service::MessageService;
use crate::shutdown::Shutdown;

pub struct AppState {
    pub message_service: MessageService,
    pub authz: AuthzMiddleware,
    pub shutdown: Shutdown,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub metrics_handle: PrometheusHandle,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/messages", post(send_message))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn readyz(State(state): State<Arc<AppState>>) -> StatusCode {
    if state.shutdown.is_ready() && !state.breakers.any_open() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn metrics(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    #[serde(rename = "conversationId")]
    pub conversation_id: uuid::Uuid,
    pub ciphertext: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// The caller authenticates upstream (JWT verification is an external
/// collaborator); a verified [`Principal`] is expected as a request
/// extension by the time this handler runs.
async fn send_message(
    State(state): State<Arc<AppState>>,
    axum::Extension(principal): axum::Extension<Principal>,
    Json(body): Json<SendMessageRequest>,
) -> Result<Response, Error> {
    let ctx = RequestContext {
        route: "POST /messages".to_string(),
        principal: Some(principal.clone()),
        conversation_id: Some(body.conversation_id.to_string()),
        target_user_id: None,
        requires_admin: false,
        is_public: false,
    };
    state.authz.authorize(&ctx).await?;

    let message_id = uuid::Uuid::new_v4();
    let occurred_at = chrono::Utc::now();

    let record = serde_json::json!({
        "id": message_id.to_string(),
        "conversationId": body.conversation_id,
        "senderId": principal.user_id,
        "ciphertext": body.ciphertext,
        "metadata": body.metadata,
        "occurredAt": occurred_at.to_rfc3339(),
    });

    let outbox_payload = serde_json::json!({
        "messageId": message_id,
        "conversationId": body.conversation_id,
        "data": {
            "messageId": message_id,
            "conversationId": body.conversation_id,
            "ciphertext": body.ciphertext,
            "metadata": body.metadata,
            "occurredAt": occurred_at.to_rfc3339(),
        },
    });

    let stored = state
        .message_service
        .send(body.conversation_id, message_id, record, outbox_payload)
        .await?;

    Ok((StatusCode::ACCEPTED, Json(stored)).into_response())
}
