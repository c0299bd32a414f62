//! Sandbox-run ledger listing.

use crate::auth::Team;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Extension, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use cistern_core::MAX_LIST_LIMIT;
use cistern_metadata::{SandboxRunRepo, SandboxRunRow};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Response header carrying the cursor for the next page.
pub const NEXT_TOKEN_HEADER: &str = "x-next-token";

/// Sandbox-run API representation.
#[derive(Debug, Serialize)]
pub struct SandboxRunResponse {
    pub sandbox_id: String,
    pub template_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_id: Option<String>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub ended_at: Option<OffsetDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_mount_path: Option<String>,
}

fn to_response(row: SandboxRunRow) -> SandboxRunResponse {
    SandboxRunResponse {
        sandbox_id: row.sandbox_id,
        template_id: row.template_id,
        build_id: row.build_id,
        status: row.status,
        end_reason: row.end_reason,
        created_at: row.created_at,
        ended_at: row.ended_at,
        volume_id: row.volume_id,
        volume_mount_path: row.volume_mount_path,
    }
}

#[derive(Debug, Deserialize)]
pub struct ListRunsParams {
    pub limit: Option<i64>,
    /// Comma-separated status filter.
    pub status: Option<String>,
    #[serde(rename = "nextToken")]
    pub next_token: Option<String>,
}

/// GET /v2/sandbox-runs - team-scoped cursor listing, newest first.
///
/// The cursor is the `created_at` of the last returned row, echoed back via
/// the `nextToken` query parameter; the next cursor rides the
/// `x-next-token` response header.
pub async fn list_sandbox_runs(
    State(state): State<AppState>,
    Extension(team): Extension<Team>,
    Query(params): Query<ListRunsParams>,
) -> ApiResult<Response> {
    let limit = params
        .limit
        .filter(|l| *l > 0 && *l <= MAX_LIST_LIMIT)
        .unwrap_or(MAX_LIST_LIMIT);

    let cursor = match params.next_token.as_deref() {
        Some(token) if !token.is_empty() => OffsetDateTime::parse(token, &Rfc3339)
            .map_err(|_| ApiError::BadRequest("invalid next token".to_string()))?,
        _ => OffsetDateTime::now_utc(),
    };

    let status: Vec<String> = params
        .status
        .as_deref()
        .unwrap_or("")
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect();

    // Fetch one extra row to learn whether more pages follow.
    let mut rows = state
        .metadata
        .list_sandbox_runs(team.id, &status, cursor, limit + 1)
        .await?;

    let has_more = rows.len() as i64 > limit;
    if has_more {
        rows.truncate(limit as usize);
    }

    let mut headers = HeaderMap::new();
    if has_more {
        if let Some(last) = rows.last() {
            if let Ok(cursor) = last.created_at.format(&Rfc3339) {
                if let Ok(value) = cursor.parse() {
                    headers.insert(NEXT_TOKEN_HEADER, value);
                }
            }
        }
    }

    let runs: Vec<SandboxRunResponse> = rows.into_iter().map(to_response).collect();
    Ok((headers, Json(runs)).into_response())
}
