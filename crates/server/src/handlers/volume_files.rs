//! Out-of-band file operations against a volume.
//!
//! These endpoints serve volumes with no live sandbox by going through the
//! volume filesystem pool. Fresh volumes answer 503 until their first mount
//! initializes the metadata snapshot.

use crate::auth::Team;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::body::Body;
use axum::extract::{Extension, Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use cistern_core::{DEFAULT_FILE_LIST_LIMIT, MAX_FILE_LIST_LIMIT, VolumeId, volume};
use cistern_metadata::{VolumeRepo, VolumeRow};
use cistern_volumefs::{Client, FileKind};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio_util::io::StreamReader;
use uuid::Uuid;

/// File entry representation.
#[derive(Debug, Serialize)]
pub struct FileInfo {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub modified_at: OffsetDateTime,
}

/// Response for file listings.
#[derive(Debug, Serialize)]
pub struct FileListResponse {
    pub files: Vec<FileInfo>,
    #[serde(rename = "nextToken", skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
}

/// Response for uploads.
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub path: String,
    pub size: i64,
}

#[derive(Debug, Deserialize)]
pub struct ListFilesParams {
    pub path: Option<String>,
    pub limit: Option<usize>,
    #[serde(rename = "nextToken")]
    pub next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FilePathParams {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct DeleteFileParams {
    pub path: String,
    pub recursive: Option<bool>,
}

/// GET /volumes/{volume_id}/files - paginated directory listing.
pub async fn list_files(
    State(state): State<AppState>,
    Extension(team): Extension<Team>,
    Path(volume_id): Path<String>,
    Query(params): Query<ListFilesParams>,
) -> ApiResult<Json<FileListResponse>> {
    let client = volume_client(&state, team.id, &volume_id).await?;
    let path = clean_path(params.path.as_deref().unwrap_or("/"))?;

    let limit = params
        .limit
        .filter(|l| *l > 0)
        .unwrap_or(DEFAULT_FILE_LIST_LIMIT)
        .min(MAX_FILE_LIST_LIMIT);
    let offset = match params.next_token.as_deref() {
        Some(token) if !token.is_empty() => decode_next_token(token)?,
        _ => 0,
    };

    let listing = client.list_dir(&path, limit, offset).await?;

    let files = listing
        .entries
        .into_iter()
        .map(|entry| FileInfo {
            name: entry.name,
            path: entry.path,
            kind: entry.kind.as_str(),
            size: (entry.kind == FileKind::File).then_some(entry.size),
            modified_at: entry.modified_at,
        })
        .collect();

    let next_token = listing.has_more.then(|| encode_next_token(offset + limit));

    Ok(Json(FileListResponse { files, next_token }))
}

/// GET /volumes/{volume_id}/files/download - stream file content.
pub async fn download_file(
    State(state): State<AppState>,
    Extension(team): Extension<Team>,
    Path(volume_id): Path<String>,
    Query(params): Query<FilePathParams>,
) -> ApiResult<Response> {
    let client = volume_client(&state, team.id, &volume_id).await?;
    let path = clean_path(&params.path)?;

    let (stream, size) = client.download(&path).await?;
    let file_name = path.rsplit('/').next().unwrap_or("file").to_string();

    let body = Body::from_stream(stream.map_err(std::io::Error::other));
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, size.to_string())
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{file_name}\""),
        )
        .body(body)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(response)
}

/// PUT /volumes/{volume_id}/files/upload - write file content.
///
/// The body is the raw content; `Content-Length` is required. An empty body
/// creates an empty file.
pub async fn upload_file(
    State(state): State<AppState>,
    Extension(team): Extension<Team>,
    Path(volume_id): Path<String>,
    Query(params): Query<FilePathParams>,
    headers: HeaderMap,
    body: Body,
) -> ApiResult<Response> {
    if !headers.contains_key(header::CONTENT_LENGTH) {
        return Ok((StatusCode::LENGTH_REQUIRED, "Content-Length is required").into_response());
    }

    let client = volume_client(&state, team.id, &volume_id).await?;
    let path = clean_path(&params.path)?;

    let reader = StreamReader::new(body.into_data_stream().map_err(std::io::Error::other));
    let written = client.upload(&path, reader).await?;

    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            path,
            size: written,
        }),
    )
        .into_response())
}

/// DELETE /volumes/{volume_id}/files - delete a file or directory.
///
/// Missing paths are already deleted; recursive removes the whole tree.
pub async fn delete_file(
    State(state): State<AppState>,
    Extension(team): Extension<Team>,
    Path(volume_id): Path<String>,
    Query(params): Query<DeleteFileParams>,
) -> ApiResult<StatusCode> {
    let client = volume_client(&state, team.id, &volume_id).await?;
    let path = clean_path(&params.path)?;

    client
        .delete(&path, params.recursive.unwrap_or(false))
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

/// Resolve the volume (by id only, team-checked) and fetch its pooled
/// filesystem client.
async fn volume_client(
    state: &AppState,
    team_id: Uuid,
    volume_id: &str,
) -> ApiResult<Arc<Client>> {
    let row = resolve_volume_by_id(state, team_id, volume_id).await?;

    let pool = state.fs_pool.as_ref().ok_or_else(|| {
        ApiError::ServiceUnavailable("volume file operations not available".to_string())
    })?;

    let volume_id = VolumeId::parse(&row.id)
        .map_err(|_| ApiError::Internal(format!("stored volume id is malformed: {}", row.id)))?;
    Ok(pool.get(&volume_id).await?)
}

async fn resolve_volume_by_id(
    state: &AppState,
    team_id: Uuid,
    volume_id: &str,
) -> ApiResult<VolumeRow> {
    let not_found = || ApiError::NotFound("volume not found".to_string());

    if !volume::is_volume_id(volume_id) {
        return Err(not_found());
    }

    let row = state
        .metadata
        .get_volume(volume_id)
        .await?
        .ok_or_else(not_found)?;
    if row.team_id != team_id {
        // Hide existence from other teams.
        return Err(not_found());
    }
    Ok(row)
}

/// Validate and normalize a request path: absolute, no traversal, no
/// trailing slash (except the root), collapsed separators.
fn clean_path(path: &str) -> ApiResult<String> {
    if !path.starts_with('/') {
        return Err(ApiError::BadRequest("path must be absolute".to_string()));
    }

    let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    if components.iter().any(|c| *c == "." || *c == "..") {
        return Err(ApiError::BadRequest(
            "path must be canonical (no '.' or '..')".to_string(),
        ));
    }

    if components.is_empty() {
        Ok("/".to_string())
    } else {
        Ok(format!("/{}", components.join("/")))
    }
}

fn encode_next_token(offset: usize) -> String {
    BASE64.encode(format!("offset:{offset}"))
}

fn decode_next_token(token: &str) -> ApiResult<usize> {
    let invalid = || ApiError::BadRequest("invalid next token".to_string());

    let decoded = BASE64.decode(token).map_err(|_| invalid())?;
    let decoded = String::from_utf8(decoded).map_err(|_| invalid())?;
    let offset = decoded.strip_prefix("offset:").ok_or_else(invalid)?;
    offset.parse::<usize>().map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_token_roundtrip() {
        let token = encode_next_token(100);
        assert_eq!(decode_next_token(&token).unwrap(), 100);
    }

    #[test]
    fn next_token_rejects_garbage() {
        for token in ["", "!!!", "b2Zmc2V0", &BASE64.encode("offset:-3"), &BASE64.encode("page:3")] {
            assert!(decode_next_token(token).is_err(), "expected invalid: {token}");
        }
    }

    #[test]
    fn clean_path_normalizes() {
        assert_eq!(clean_path("/").unwrap(), "/");
        assert_eq!(clean_path("/a/b/").unwrap(), "/a/b");
        assert_eq!(clean_path("//a//b").unwrap(), "/a/b");
        assert!(clean_path("relative").is_err());
        assert!(clean_path("/a/../b").is_err());
    }
}
