//! boxpick library - box-id prediction service
//!
//! Accepts CSV uploads describing items packed into shipping boxes, runs a
//! pre-trained classifier over the canonical feature columns, and returns
//! the uploaded table enriched with a predicted box identifier.

pub mod api;
pub mod config;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod schema;
pub mod table;

pub use crate::error::{ApiError, ApiResult};
pub use crate::model::ModelHandle;

use axum::extract::DefaultBodyLimit;
use axum::Router;
use tower_http::trace::TraceLayer;

/// Uploads above this size are rejected by the framework before reaching
/// the handler. Generous compared to any realistic packing sheet.
const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// Lazily loaded, process-wide model handle
    pub model: ModelHandle,
}

impl AppState {
    /// Create new application state
    pub fn new(model: ModelHandle) -> Self {
        Self { model }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::ui_routes())
        .merge(api::health_routes())
        .merge(api::predict_routes())
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
