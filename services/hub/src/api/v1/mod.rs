//! API v1 routes.

mod escalations;
mod health;
mod records;

use axum::Router;

use crate::state::AppState;

/// Create API v1 routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .merge(records::routes())
        .merge(health::routes())
        .merge(escalations::routes())
}
