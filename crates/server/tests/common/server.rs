//! Server test utilities.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use cistern_core::VolumeId;
use cistern_core::config::{AppConfig, MetadataConfig, StorageConfig};
use cistern_metadata::{MetadataStore, SqliteStore};
use cistern_server::auth::TEAM_HEADER;
use cistern_server::{AppState, create_router};
use cistern_storage::{FilesystemBackend, ObjectStore, layout};
use cistern_volumefs::engine::FsEngine;
use cistern_volumefs::{ClientOptions, Pool};
use serde_json::Value;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    pub team_id: Uuid,
    replicas_dir: PathBuf,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    /// Create a test server without the out-of-band filesystem.
    pub async fn new() -> Self {
        Self::build(false, |_| {}).await
    }

    /// Create a test server with the out-of-band filesystem pool backed by
    /// a stub replication tool.
    pub async fn with_volume_fs() -> Self {
        Self::build(true, |_| {}).await
    }

    /// Create a test server with custom config modifications.
    pub async fn with_config<F>(volume_fs: bool, modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        Self::build(volume_fs, modifier).await
    }

    async fn build<F>(volume_fs: bool, modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");

        let storage_path = temp_dir.path().join("storage");
        let storage: Arc<dyn ObjectStore> = Arc::new(
            FilesystemBackend::new(&storage_path)
                .await
                .expect("Failed to create storage backend"),
        );

        let db_path = temp_dir.path().join("metadata.db");
        let metadata: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(&db_path)
                .await
                .expect("Failed to create metadata store"),
        );

        let replicas_dir = temp_dir.path().join("replicas");
        std::fs::create_dir_all(&replicas_dir).expect("Failed to create replicas directory");

        let fs_pool = if volume_fs {
            let replicator = write_replicator_stub(temp_dir.path(), &replicas_dir);
            Some(Arc::new(Pool::new(
                storage.clone(),
                ClientOptions {
                    replicator_binary: replicator,
                    work_dir: temp_dir.path().join("fs-work"),
                    bucket: "local".to_string(),
                },
                Duration::from_secs(300),
            )))
        } else {
            None
        };

        let mut config = AppConfig::for_testing();
        config.storage = StorageConfig::Filesystem {
            path: storage_path,
        };
        config.metadata = MetadataConfig::Sqlite { path: db_path };
        modifier(&mut config);

        let state = AppState::new(config, storage, metadata, None, None, fs_pool);
        let router = create_router(state.clone());

        Self {
            router,
            state,
            team_id: Uuid::new_v4(),
            replicas_dir,
            _temp_dir: temp_dir,
        }
    }

    /// Get access to the underlying metadata store.
    pub fn metadata(&self) -> Arc<dyn MetadataStore> {
        self.state.metadata.clone()
    }

    /// Simulate a first mount having initialized the volume's metadata
    /// snapshot, so out-of-band file operations become available.
    pub async fn initialize_volume(&self, volume_id: &str) {
        let volume_id = VolumeId::parse(volume_id).expect("invalid volume id");
        let replica_db = self.replicas_dir.join(format!("{volume_id}.db"));
        FsEngine::format(
            &replica_db,
            &volume_id.fs_name(),
            "gs",
            &layout::data_url("local", &volume_id),
        )
        .await
        .expect("Failed to format volume replica");
    }
}

/// Stub replication tool honoring the restore / replicate-once CLI
/// contract against a local replicas directory.
fn write_replicator_stub(dir: &std::path::Path, replicas_dir: &std::path::Path) -> PathBuf {
    let script = format!(
        r#"#!/bin/sh
case "$1" in
  restore)
    vol=$(basename "$5"); vol="${{vol%-meta}}"
    [ -f "{replicas}/$vol.db" ] && cp "{replicas}/$vol.db" "$4"
    exit 0
    ;;
  replicate)
    cfg="$4"
    db=$(awk '/path:/ {{print $NF}}' "$cfg")
    url=$(awk '/url:/ {{print $NF}}' "$cfg")
    vol=$(basename "$url"); vol="${{vol%-meta}}"
    cp "$db" "{replicas}/$vol.db"
    exit 0
    ;;
esac
exit 1
"#,
        replicas = replicas_dir.display(),
    );

    let path = dir.join("replicator");
    std::fs::write(&path, script).expect("Failed to write replicator stub");
    let mut perms = std::fs::metadata(&path)
        .expect("Failed to stat replicator stub")
        .permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("Failed to chmod replicator stub");
    path
}

/// Make a JSON request as a team member, returning status and parsed body.
#[allow(dead_code)]
pub async fn json_request(
    server: &TestServer,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    json_request_as(server, method, uri, body, Some(server.team_id)).await
}

/// Make a JSON request with an explicit (or absent) team.
#[allow(dead_code)]
pub async fn json_request_as(
    server: &TestServer,
    method: &str,
    uri: &str,
    body: Option<Value>,
    team: Option<Uuid>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);

    if let Some(team) = team {
        builder = builder.header(TEAM_HEADER, team.to_string());
    }

    let body = match body {
        Some(v) => {
            builder = builder.header("Content-Type", "application/json");
            Body::from(serde_json::to_vec(&v).unwrap())
        }
        None => Body::empty(),
    };

    let request = builder.body(body).unwrap();
    let response = server.router.clone().oneshot(request).await.unwrap();

    let status = response.status();
    let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();

    let json: Value = if body_bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body_bytes).unwrap_or(Value::Null)
    };

    (status, json)
}

/// Upload raw content to a volume file.
#[allow(dead_code)]
pub async fn upload(
    server: &TestServer,
    volume_id: &str,
    path: &str,
    content: &[u8],
) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("PUT")
        .uri(format!("/volumes/{volume_id}/files/upload?path={path}"))
        .header(TEAM_HEADER, server.team_id.to_string())
        .header("Content-Type", "application/octet-stream")
        .header("Content-Length", content.len().to_string())
        .body(Body::from(content.to_vec()))
        .unwrap();

    let response = server.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&body_bytes).unwrap_or(Value::Null);
    (status, json)
}

/// Download a volume file, returning status and raw bytes.
#[allow(dead_code)]
pub async fn download(server: &TestServer, volume_id: &str, path: &str) -> (StatusCode, Vec<u8>) {
    let request = Request::builder()
        .method("GET")
        .uri(format!("/volumes/{volume_id}/files/download?path={path}"))
        .header(TEAM_HEADER, server.team_id.to_string())
        .body(Body::empty())
        .unwrap();

    let response = server.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body_bytes.to_vec())
}
