//! Aggregate fleet health.

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use fleet_events::{AggregateHealth, HubAlert};

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(aggregate_health))
        .route("/alerts", get(list_alerts))
}

/// Latest status of every agent, per-host link state and open alerts.
async fn aggregate_health(State(state): State<AppState>) -> Json<AggregateHealth> {
    Json(state.hub().aggregate(Utc::now()))
}

async fn list_alerts(State(state): State<AppState>) -> Json<Vec<HubAlert>> {
    Json(state.hub().alerts(Utc::now()))
}
