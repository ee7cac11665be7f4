//! Backend webhook endpoint.

use crate::services::{notify::NotifyEvent, orchestrator::Orchestrator};
use axum::{body::Bytes, extract::State, http::StatusCode, response::IntoResponse};

/// `POST /api/notify`
///
/// Always answers `200 OK` before doing any work, so a slow or failing
/// reconciliation never makes the backend redeliver. The event is processed
/// on a detached task.
pub async fn notify(
    State(orchestrator): State<Orchestrator>,
    body: Bytes,
) -> impl IntoResponse {
    match serde_json::from_slice::<NotifyEvent>(&body) {
        Ok(event) => {
            tokio::spawn(async move {
                if let Err(err) = orchestrator.handle_notification(&event).await {
                    tracing::error!(error = %err, key = %event.key, "notification handling failed");
                }
            });
        }
        Err(err) => tracing::info!(error = %err, "notification payload not actionable"),
    }
    (StatusCode::OK, "OK")
}
