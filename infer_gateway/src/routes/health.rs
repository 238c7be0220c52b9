use crate::server::SharedState;
use axum::{extract::State, response::Json};
use serde::Serialize;

#[derive(Serialize)]
pub struct Health {
    status: &'static str,
    variants: usize,
}

/// Liveness only; backend readiness is settled before the server starts.
pub async fn healthcheck(State(state): State<SharedState>) -> Json<Health> {
    Json(Health {
        status: "Available",
        variants: state.gateway.variants().len(),
    })
}
