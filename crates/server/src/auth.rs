//! Team resolution middleware.
//!
//! Authentication itself lives in the API gateway in front of this service;
//! the gateway resolves the caller to a team and forwards the team id in a
//! trusted header. Requests without one are unauthenticated.

use crate::error::ApiError;
use axum::body::Body;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

/// Header carrying the authenticated team id.
pub const TEAM_HEADER: &str = "x-team-id";

/// The authenticated team, inserted as a request extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Team {
    pub id: Uuid,
}

/// Require a team on every request.
pub async fn team_middleware(mut req: Request<Body>, next: Next) -> Response {
    let team_id = req
        .headers()
        .get(TEAM_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| Uuid::parse_str(value).ok());

    match team_id {
        Some(id) => {
            req.extensions_mut().insert(Team { id });
            next.run(req).await
        }
        None => ApiError::Unauthorized("missing or invalid team".to_string()).into_response(),
    }
}
