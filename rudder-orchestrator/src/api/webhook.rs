//! GitHub Webhook Handler
//!
//! Deliveries are acknowledged as soon as they parse; the jobs they start
//! run in background tasks owned by the dispatcher.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
};
use rudder_core::domain::event::TriggerEvent;

use crate::api::AppState;
use crate::api::error::{ApiError, ApiResult};

/// Header carrying the webhook event type
pub const EVENT_HEADER: &str = "x-github-event";

/// POST /github
pub async fn receive_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let event_type = headers
        .get(EVENT_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("missing X-GitHub-Event header".to_string()))?;

    let event = TriggerEvent::from_webhook(event_type, &body)
        .map_err(|e| ApiError::BadRequest(format!("invalid {} payload: {}", event_type, e)))?;

    match event {
        Some(event) => {
            let started = state.dispatcher.dispatch(event);
            tracing::debug!("{} event dispatched to {} consumer(s)", event_type, started.len());
        }
        None => tracing::debug!("Ignoring {} event", event_type),
    }

    Ok(StatusCode::ACCEPTED)
}
