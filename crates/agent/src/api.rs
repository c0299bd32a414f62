//! In-VM HTTP API: graceful shutdown.
//!
//! The filesystem holds a large write buffer; terminating the VM without an
//! unmount drops buffered writes. The orchestrator calls `POST /shutdown`
//! before tearing the VM down.

use crate::mount::{MountConfig, MountRegistry, Mounter};
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use std::sync::Arc;
use std::time::Duration;

/// Budget for the whole unmount during shutdown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Header relaying a refreshed in-VM access token.
pub const ACCESS_TOKEN_HEADER: &str = "x-access-token";

/// State behind the shutdown endpoint.
#[derive(Clone)]
pub struct ShutdownState {
    pub config: MountConfig,
    pub registry: Arc<MountRegistry>,
}

/// Router exposing `POST /shutdown`.
pub fn shutdown_router(state: ShutdownState) -> Router {
    Router::new()
        .route("/shutdown", post(post_shutdown))
        .with_state(state)
}

async fn post_shutdown(State(state): State<ShutdownState>, headers: HeaderMap) -> Response {
    tracing::info!(
        volume_id = %state.config.volume_id,
        mount_path = %state.config.mount_path.display(),
        "Shutdown requested"
    );

    // A relayed token keeps the daemon's final flush authorized even when
    // the original token is close to expiry.
    if let Some(token) = headers.get(ACCESS_TOKEN_HEADER).and_then(|v| v.to_str().ok()) {
        if let Err(e) = tokio::fs::write(&state.config.token_file, token).await {
            tracing::warn!(error = %e, "Failed to refresh access token file");
        }
    }

    let mounter = Mounter::new(state.config.clone(), state.registry.clone());
    let result = tokio::time::timeout(SHUTDOWN_TIMEOUT, mounter.unmount()).await;

    match result {
        Ok(Ok(())) => {
            tracing::info!(volume_id = %state.config.volume_id, "Volume unmounted for shutdown");
            (
                StatusCode::NO_CONTENT,
                [(header::CACHE_CONTROL, "no-store")],
            )
                .into_response()
        }
        Ok(Err(e)) => {
            tracing::error!(
                volume_id = %state.config.volume_id,
                error = %e,
                "Failed to unmount volume for shutdown"
            );
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
        Err(_) => {
            tracing::error!(
                volume_id = %state.config.volume_id,
                timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
                "Shutdown unmount exceeded its budget"
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "unmount timed out".to_string(),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::ToolPaths;
    use axum::body::Body;
    use axum::http::Request;
    use cistern_core::VolumeId;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use tower::ServiceExt;

    async fn write_script(path: &Path, body: &str) {
        tokio::fs::write(path, body).await.unwrap();
        let mut perms = tokio::fs::metadata(path).await.unwrap().permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(path, perms).await.unwrap();
    }

    async fn state(temp: &Path, umount_exit: i32) -> ShutdownState {
        let fs_binary = temp.join("juicefs");
        write_script(&fs_binary, &format!("#!/bin/sh\nexit {umount_exit}\n")).await;
        let sqlite3_binary = temp.join("sqlite3");
        write_script(&sqlite3_binary, "#!/bin/sh\nexit 0\n").await;
        let replicator_binary = temp.join("litestream");
        write_script(&replicator_binary, "#!/bin/sh\nexit 0\n").await;

        let mut config = MountConfig::new(
            VolumeId::parse("vol_shutdown").unwrap(),
            temp.join("mnt"),
            "bucket".to_string(),
            "token".to_string(),
        );
        config.token_file = temp.join("gcs-token");
        config.meta_db = temp.join("meta.db");
        config.replicator_config = temp.join("litestream.yml");
        config.tools = ToolPaths {
            fs_binary,
            replicator_binary,
            sqlite3_binary,
        };

        ShutdownState {
            config,
            registry: Arc::new(MountRegistry::new()),
        }
    }

    #[tokio::test]
    async fn shutdown_unmounts_and_returns_204() {
        let temp = tempfile::tempdir().unwrap();
        let state = state(temp.path(), 0).await;
        let router = shutdown_router(state);

        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/shutdown")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn shutdown_reports_unmount_failure() {
        let temp = tempfile::tempdir().unwrap();
        let state = state(temp.path(), 1).await;
        let router = shutdown_router(state);

        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/shutdown")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn relayed_token_is_written_before_unmount() {
        let temp = tempfile::tempdir().unwrap();
        let state = state(temp.path(), 0).await;
        let token_file = state.config.token_file.clone();
        let router = shutdown_router(state);

        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/shutdown")
                    .header(ACCESS_TOKEN_HEADER, "fresh-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let token = tokio::fs::read_to_string(&token_file).await.unwrap();
        assert_eq!(token, "fresh-token");
    }
}
