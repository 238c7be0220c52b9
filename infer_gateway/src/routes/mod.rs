mod health;
mod infer;
mod metrics;

use crate::server::SharedState;
use axum::{
    routing::{get, post},
    Router,
};

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health::healthcheck))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/v1/models", get(infer::list_models))
        .route("/v1/models/{model}/infer", post(infer::infer))
}
