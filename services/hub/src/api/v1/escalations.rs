//! Fleet-wide restart authorization.

use axum::{
    extract::{rejection::JsonRejection, State},
    routing::post,
    Json, Router,
};
use chrono::Utc;
use fleet_events::{EscalationDecision, EscalationRequest};

use crate::api::error::ApiError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/escalations", post(request_escalation))
}

async fn request_escalation(
    State(state): State<AppState>,
    payload: Result<Json<EscalationRequest>, JsonRejection>,
) -> Result<Json<EscalationDecision>, ApiError> {
    let Json(request) = payload?;
    if request.origin_host.trim().is_empty() {
        return Err(ApiError::bad_request(
            "missing_origin",
            "escalation request has no origin host",
        ));
    }
    Ok(Json(state.hub().decide_escalation(&request, Utc::now())))
}
