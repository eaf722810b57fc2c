//! Application state shared across request handlers.

use std::sync::Arc;

use crate::central::CentralHub;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    hub: Arc<CentralHub>,
}

impl AppState {
    pub fn new(hub: Arc<CentralHub>) -> Self {
        Self {
            inner: Arc::new(AppStateInner { hub }),
        }
    }

    /// The aggregation core.
    pub fn hub(&self) -> &Arc<CentralHub> {
        &self.inner.hub
    }
}
