//! UI serving routes
//!
//! Serves the static HTML upload form.

use axum::{response::Html, routing::get, Router};

use crate::AppState;

const INDEX_HTML: &str = include_str!("../ui/index.html");

/// GET /
///
/// Serves the upload form page
pub async fn serve_index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// Build UI routes
pub fn ui_routes() -> Router<AppState> {
    Router::new().route("/", get(serve_index))
}
