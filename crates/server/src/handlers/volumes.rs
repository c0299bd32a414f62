//! Volume lifecycle endpoints.

use crate::auth::Team;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Extension, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use cistern_core::events::{self, VolumeEvent};
use cistern_core::{MAX_LIST_LIMIT, VolumeId, validate_volume_name, volume};
use cistern_metadata::{VolumeRepo, VolumeRow};
use cistern_storage::layout;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Request body for volume creation.
#[derive(Debug, Deserialize)]
pub struct CreateVolumeRequest {
    #[serde(default)]
    pub name: String,
}

/// Volume API representation.
#[derive(Debug, Serialize)]
pub struct VolumeResponse {
    pub volume_id: String,
    pub name: String,
    pub status: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_size_bytes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_file_count: Option<i64>,
}

fn to_response(row: VolumeRow) -> VolumeResponse {
    VolumeResponse {
        volume_id: row.id,
        name: row.name,
        status: row.status,
        created_at: row.created_at,
        updated_at: row.updated_at,
        total_size_bytes: row.total_size_bytes,
        total_file_count: row.total_file_count,
    }
}

/// Publish a lifecycle event on a detached task with its own context, so
/// the caller's response never waits on the delivery bus.
fn publish_event(state: &AppState, event: VolumeEvent) {
    if let Some(delivery) = state.events.clone() {
        let key = event
            .sandbox_team_id
            .map(|id| id.to_string())
            .unwrap_or_default();
        tokio::spawn(async move {
            if let Err(e) = delivery.publish(&key, &event).await {
                tracing::error!(
                    event_type = %event.event_type,
                    volume_id = %event.volume_id,
                    error = %e,
                    "Failed to publish volume event"
                );
            }
        });
    }
}

/// POST /volumes - create a volume, idempotent by name.
pub async fn create_volume(
    State(state): State<AppState>,
    Extension(team): Extension<Team>,
    Json(req): Json<CreateVolumeRequest>,
) -> ApiResult<Response> {
    if req.name.is_empty() {
        return Err(ApiError::BadRequest("name is required".to_string()));
    }
    validate_volume_name(&req.name).map_err(|_| {
        ApiError::BadRequest(
            "name must be lowercase alphanumeric with hyphens (1-63 chars)".to_string(),
        )
    })?;

    // Idempotent: an existing volume with this name is returned as-is.
    if let Some(existing) = state.metadata.get_volume_by_name(team.id, &req.name).await? {
        return Ok((StatusCode::OK, Json(to_response(existing))).into_response());
    }

    let volume_id = VolumeId::generate();
    let secret = seal_volume_secret(&state)?;
    let now = OffsetDateTime::now_utc();
    let row = VolumeRow {
        id: volume_id.as_str().to_string(),
        team_id: team.id,
        name: req.name.clone(),
        status: "creating".to_string(),
        total_size_bytes: None,
        total_file_count: None,
        secret_encrypted: Some(secret),
        created_at: now,
        updated_at: now,
    };

    match state.metadata.create_volume(&row).await {
        Ok(()) => {}
        Err(cistern_metadata::MetadataError::AlreadyExists(_)) => {
            // Lost a create race; the winner's volume is the answer.
            let existing = state
                .metadata
                .get_volume_by_name(team.id, &req.name)
                .await?
                .ok_or_else(|| ApiError::Internal("volume create race left no row".to_string()))?;
            return Ok((StatusCode::OK, Json(to_response(existing))).into_response());
        }
        Err(e) => return Err(e.into()),
    }

    if let Err(e) = layout::init_volume_layout(state.storage.as_ref(), &volume_id).await {
        tracing::error!(
            volume_id = %volume_id,
            error = %e,
            "Failed to initialize volume layout"
        );
        // Park the row in deleting; the reaper purges it.
        let _ = state
            .metadata
            .update_volume_status(volume_id.as_str(), "deleting")
            .await;
        return Err(ApiError::Internal(
            "failed to initialize volume storage".to_string(),
        ));
    }

    let row = state
        .metadata
        .update_volume_status(volume_id.as_str(), "available")
        .await?
        .ok_or_else(|| ApiError::Internal("volume row vanished during create".to_string()))?;

    publish_event(
        &state,
        VolumeEvent::new(events::VOLUME_CREATED, volume_id.as_str())
            .with_volume_name(&req.name)
            .with_team(team.id),
    );
    tracing::info!(
        volume_id = %volume_id,
        volume_name = %req.name,
        team_id = %team.id,
        "Volume created"
    );

    Ok((StatusCode::CREATED, Json(to_response(row))).into_response())
}

/// Query parameters for volume listing.
#[derive(Debug, Deserialize)]
pub struct ListVolumesParams {
    pub limit: Option<i64>,
}

/// GET /volumes - list the team's volumes, newest first.
pub async fn list_volumes(
    State(state): State<AppState>,
    Extension(team): Extension<Team>,
    Query(params): Query<ListVolumesParams>,
) -> ApiResult<Json<Vec<VolumeResponse>>> {
    let limit = params
        .limit
        .filter(|l| *l > 0 && *l <= MAX_LIST_LIMIT)
        .unwrap_or(MAX_LIST_LIMIT);

    let rows = state.metadata.list_volumes(team.id, None, limit).await?;
    Ok(Json(rows.into_iter().map(to_response).collect()))
}

/// GET /volumes/{id_or_name} - get a volume by id or name.
pub async fn get_volume(
    State(state): State<AppState>,
    Extension(team): Extension<Team>,
    Path(id_or_name): Path<String>,
) -> ApiResult<Json<VolumeResponse>> {
    let row = resolve_volume(&state, team.id, &id_or_name).await?;
    Ok(Json(to_response(row)))
}

/// DELETE /volumes/{id_or_name} - delete a volume.
pub async fn delete_volume(
    State(state): State<AppState>,
    Extension(team): Extension<Team>,
    Path(id_or_name): Path<String>,
) -> ApiResult<StatusCode> {
    let row = resolve_volume(&state, team.id, &id_or_name).await?;
    let volume_id = VolumeId::parse(&row.id)
        .map_err(|_| ApiError::Internal(format!("stored volume id is malformed: {}", row.id)))?;

    publish_event(
        &state,
        VolumeEvent::new(events::VOLUME_DELETED, &row.id)
            .with_volume_name(&row.name)
            .with_team(team.id),
    );
    tracing::info!(
        volume_id = %row.id,
        volume_name = %row.name,
        team_id = %team.id,
        "Volume deletion started"
    );

    state
        .metadata
        .update_volume_status(&row.id, "deleting")
        .await?;

    // Best effort: object-store failures must not fail the delete.
    match layout::destroy_volume_layout(state.storage.as_ref(), &volume_id).await {
        Ok(deleted) => {
            tracing::debug!(volume_id = %row.id, objects = deleted, "Destroyed volume layout");
        }
        Err(e) => {
            tracing::warn!(volume_id = %row.id, error = %e, "Failed to destroy volume layout");
        }
    }

    state.metadata.delete_volume(&row.id).await?;

    Ok(StatusCode::NO_CONTENT)
}

/// Resolve an id-or-name argument to a volume row, hiding cross-team rows.
pub async fn resolve_volume(
    state: &AppState,
    team_id: Uuid,
    id_or_name: &str,
) -> ApiResult<VolumeRow> {
    let not_found = || ApiError::NotFound("volume not found".to_string());

    if volume::is_volume_id(id_or_name) {
        let row = state
            .metadata
            .get_volume(id_or_name)
            .await?
            .ok_or_else(not_found)?;
        // Hide existence from other teams.
        if row.team_id != team_id {
            return Err(not_found());
        }
        return Ok(row);
    }

    state
        .metadata
        .get_volume_by_name(team_id, id_or_name)
        .await?
        .ok_or_else(not_found)
}

fn seal_volume_secret(state: &AppState) -> ApiResult<Vec<u8>> {
    let password = cistern_crypto::generate_password();
    match &state.encryptor {
        Some(encryptor) => Ok(encryptor.encrypt(password.as_bytes())?),
        None => {
            tracing::warn!("Storing volume secret in plaintext - encryption not configured");
            Ok(password.into_bytes())
        }
    }
}
