//! Record ingestion from edge hubs.
//!
//! Edges POST batches of hub records. The answer lists every record Central
//! now owns, split into newly accepted and already-seen ids; an edge treats
//! both as acknowledged.

use axum::{
    extract::{rejection::JsonRejection, State},
    routing::post,
    Json, Router,
};
use chrono::Utc;
use fleet_events::{BatchAck, RecordBatch};

use crate::api::error::ApiError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/records", post(ingest_records))
}

async fn ingest_records(
    State(state): State<AppState>,
    payload: Result<Json<RecordBatch>, JsonRejection>,
) -> Result<Json<BatchAck>, ApiError> {
    let Json(batch) = payload?;
    let ack = state.hub().ingest(batch, Utc::now())?;
    Ok(Json(ack))
}
