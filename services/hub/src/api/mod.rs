//! HTTP API handlers and routing.

pub mod error;
mod health;
mod v1;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create the main API router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::routes())
        .nest("/v1", v1::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use rstest::rstest;
    use tower::ServiceExt;

    use super::*;
    use crate::central::CentralHub;

    fn app() -> Router {
        create_router(AppState::new(Arc::new(CentralHub::default())))
    }

    #[rstest]
    #[case("/healthz")]
    #[case("/v1/health")]
    #[case("/v1/alerts")]
    #[tokio::test]
    async fn test_read_routes(#[case] uri: &str) {
        let response = app()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_records_requires_post() {
        let response = app()
            .oneshot(Request::builder().uri("/v1/records").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
