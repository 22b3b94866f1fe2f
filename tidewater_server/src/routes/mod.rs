use axum::Router;
use axum::routing::{get, post};

pub mod health;
pub mod metrics;
pub mod refresh;

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> Router {
    Router::new()
        .route("/refresh/trigger", post(refresh::trigger))
        .route("/refresh/metrics", get(metrics::get_metrics))
}
