//! Producer boundary: business logic (message CRUD, file uploads, work-item
//! updates) publishes an event here after its own persistence succeeds.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;

use crate::collab::AudienceDescriptor;
use crate::error::ApiError;
use crate::gateway::events::{EventType, NotificationEvent};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/publish", post(publish))
}

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    pub event_type: EventType,
    pub message: String,
    #[serde(default)]
    pub work_item_id: Option<String>,
    #[serde(default)]
    pub origin_user_id: Option<String>,
    #[serde(default)]
    pub urgent: bool,
    pub audience: AudienceDescriptor,
}

// ---------------------------------------------------------------------------
// POST /api/v1/publish
// ---------------------------------------------------------------------------

async fn publish(
    State(state): State<AppState>,
    Json(request): Json<PublishRequest>,
) -> Result<StatusCode, ApiError> {
    if request.message.is_empty() {
        return Err(ApiError::bad_request("message must not be empty"));
    }

    let event = NotificationEvent {
        work_item_id: request.work_item_id,
        origin_user_id: request.origin_user_id,
        urgent: request.urgent,
        ..NotificationEvent::new(request.event_type, request.message)
    };
    tracing::debug!(event_id = %event.id, "event accepted at the publish boundary");

    state.router.publish(event, &request.audience).await;
    Ok(StatusCode::ACCEPTED)
}
