//! HTTP handlers.

pub mod sandbox_runs;
pub mod volume_files;
pub mod volumes;

use crate::error::ApiResult;
use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use cistern_metadata::MetadataStore;
use serde::Serialize;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// GET /health - liveness/readiness probe.
///
/// Intentionally unauthenticated for load balancers and orchestration
/// probes; returns only non-sensitive information.
pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    state.metadata.health_check().await?;

    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    }))
}
