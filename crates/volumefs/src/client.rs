//! Per-volume out-of-band filesystem client.

use crate::engine::{FsEngine, ListDirResult};
use crate::error::{FsError, FsResult};
use crate::tools::{self, RestoreOutcome, SYNC_INTERVAL};
use cistern_core::VolumeId;
use cistern_storage::{ByteStream, ObjectStore, layout};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Options shared by every client a pool opens.
#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// Replication tool binary (restore and one-shot sync).
    pub replicator_binary: PathBuf,
    /// Directory under which per-volume state lives.
    pub work_dir: PathBuf,
    /// Bucket the volume's prefixes live in.
    pub bucket: String,
}

/// File-operation client for a single volume.
///
/// Reads are shared and writes exclusive under one RW-lock; the snapshot
/// sync-back happens inside the write section, which makes the snapshot
/// observed by the next sync monotonic within this client. Across clients
/// and live mounts the volume converges last-writer-wins at snapshot
/// granularity.
pub struct Client {
    volume_id: VolumeId,
    dir: PathBuf,
    config_path: PathBuf,
    replicator_binary: PathBuf,
    engine: FsEngine,
    /// Write-locked for mutations; the boolean is the closed flag.
    state: RwLock<bool>,
}

impl Client {
    /// Open a client for a volume: restore the metadata snapshot into a
    /// per-volume directory and start an embedded filesystem session
    /// against it.
    ///
    /// Fresh volumes (no replica yet) fail with `VolumeNotInitialized`;
    /// their first mount initializes the metadata.
    pub async fn open(
        volume_id: &VolumeId,
        store: Arc<dyn ObjectStore>,
        options: &ClientOptions,
    ) -> FsResult<Self> {
        let dir = options.work_dir.join(volume_id.as_str());
        tokio::fs::create_dir_all(&dir).await?;

        let meta_db = dir.join("meta.db");
        let replica_url = layout::meta_replica_url(&options.bucket, volume_id);

        let outcome =
            tools::restore_meta_db(&options.replicator_binary, &meta_db, &replica_url).await?;
        if outcome == RestoreOutcome::FreshVolume {
            let _ = tokio::fs::remove_dir_all(&dir).await;
            return Err(FsError::VolumeNotInitialized(volume_id.to_string()));
        }

        let engine = FsEngine::open(
            &meta_db,
            store,
            layout::data_prefix(volume_id),
            dir.join("cache"),
        )
        .await?;

        tracing::info!(
            volume_id = %volume_id,
            name = %engine.volume_format().name,
            "Opened volume filesystem client"
        );

        let config_path = dir.join("replicator.yml");
        tools::write_replicator_config(&config_path, &meta_db, &replica_url, SYNC_INTERVAL)
            .await?;

        Ok(Self {
            volume_id: volume_id.clone(),
            dir,
            config_path,
            replicator_binary: options.replicator_binary.clone(),
            engine,
            state: RwLock::new(false),
        })
    }

    /// The volume this client serves.
    pub fn volume_id(&self) -> &VolumeId {
        &self.volume_id
    }

    /// List a directory page.
    pub async fn list_dir(&self, path: &str, limit: usize, offset: usize) -> FsResult<ListDirResult> {
        let closed = self.state.read().await;
        if *closed {
            return Err(FsError::Closed);
        }
        self.engine.list_dir(path, limit, offset).await
    }

    /// Stream a file's content; returns the stream and size.
    pub async fn download(&self, path: &str) -> FsResult<(ByteStream, i64)> {
        let closed = self.state.read().await;
        if *closed {
            return Err(FsError::Closed);
        }
        self.engine.download(path).await
    }

    /// Write a file and push the mutated snapshot back.
    pub async fn upload<R>(&self, path: &str, content: R) -> FsResult<i64>
    where
        R: tokio::io::AsyncRead + Unpin + Send,
    {
        let closed = self.state.write().await;
        if *closed {
            return Err(FsError::Closed);
        }
        let written = self.engine.upload(path, content).await?;
        self.sync_back("upload", path).await;
        Ok(written)
    }

    /// Delete a path and push the mutated snapshot back. Missing paths are
    /// already deleted.
    pub async fn delete(&self, path: &str, recursive: bool) -> FsResult<()> {
        let closed = self.state.write().await;
        if *closed {
            return Err(FsError::Closed);
        }
        self.engine.remove(path, recursive).await?;
        self.sync_back("delete", path).await;
        Ok(())
    }

    /// Close the client: final sync, shut the metadata session, drop the
    /// per-volume directory.
    pub async fn close(&self) {
        let mut closed = self.state.write().await;
        if *closed {
            return;
        }
        *closed = true;

        self.sync_back("close", "/").await;
        self.engine.close().await;

        if let Err(e) = tokio::fs::remove_dir_all(&self.dir).await {
            tracing::warn!(
                volume_id = %self.volume_id,
                error = %e,
                "Failed to remove client work directory"
            );
        }
    }

    /// Push the metadata snapshot to `{vol}-meta/` in one-shot mode.
    ///
    /// Failures are warnings, never user-visible errors: the replication
    /// daemon of a future mount still converges the snapshot.
    async fn sync_back(&self, operation: &str, path: &str) {
        // Flush the WAL into the main database file so the one-shot sync
        // captures the complete snapshot.
        if let Err(e) = self.engine.checkpoint().await {
            tracing::warn!(
                volume_id = %self.volume_id,
                error = %e,
                "WAL checkpoint before sync failed"
            );
        }

        match tools::sync_once(&self.replicator_binary, &self.config_path).await {
            Ok(()) => {
                tracing::debug!(
                    volume_id = %self.volume_id,
                    operation = operation,
                    path = path,
                    "Synced metadata snapshot"
                );
            }
            Err(FsError::SubprocessTimeout { seconds, .. }) => {
                tracing::warn!(
                    volume_id = %self.volume_id,
                    operation = operation,
                    timeout_secs = seconds,
                    "Metadata sync timed out, snapshot may be incomplete"
                );
            }
            Err(e) => {
                tracing::warn!(
                    volume_id = %self.volume_id,
                    operation = operation,
                    error = %e,
                    "Metadata sync failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::FsEngine;
    use cistern_storage::FilesystemBackend;
    use futures::StreamExt;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    /// Write a stub replication tool that "restores" by copying a replica
    /// file into place and "replicates" by copying the database out to the
    /// replica file.
    async fn write_stub(dir: &Path, replica_db: &Path, meta_db: &Path) -> PathBuf {
        let script = format!(
            r#"#!/bin/sh
case "$1" in
  restore)
    [ -f "{replica}" ] && cp "{replica}" "$4"
    exit 0
    ;;
  replicate)
    cp "{meta}" "{replica}"
    exit 0
    ;;
esac
exit 1
"#,
            replica = replica_db.display(),
            meta = meta_db.display(),
        );
        let path = dir.join("replicator");
        tokio::fs::write(&path, script).await.unwrap();
        let mut perms = tokio::fs::metadata(&path).await.unwrap().permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(&path, perms).await.unwrap();
        path
    }

    struct Fixture {
        _temp: tempfile::TempDir,
        store: Arc<dyn ObjectStore>,
        options: ClientOptions,
        volume_id: VolumeId,
        replica_db: PathBuf,
    }

    async fn fixture() -> Fixture {
        let temp = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(
            FilesystemBackend::new(temp.path().join("store"))
                .await
                .unwrap(),
        );
        let volume_id = VolumeId::parse("vol_client").unwrap();
        let work_dir = temp.path().join("work");
        let replica_db = temp.path().join("replica-meta.db");
        let meta_db = work_dir.join(volume_id.as_str()).join("meta.db");

        let binary = write_stub(temp.path(), &replica_db, &meta_db).await;
        let options = ClientOptions {
            replicator_binary: binary,
            work_dir,
            bucket: "bucket".to_string(),
        };

        Fixture {
            _temp: temp,
            store,
            options,
            volume_id,
            replica_db,
        }
    }

    async fn read_all(stream: ByteStream) -> Vec<u8> {
        let mut stream = stream;
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn fresh_volume_is_not_initialized() {
        let fx = fixture().await;

        let result = Client::open(&fx.volume_id, fx.store.clone(), &fx.options).await;
        assert!(matches!(result, Err(FsError::VolumeNotInitialized(_))));
        // The work directory was cleaned up.
        assert!(!fx.options.work_dir.join(fx.volume_id.as_str()).exists());
    }

    #[tokio::test]
    async fn writes_survive_reopen() {
        let fx = fixture().await;

        // Simulate the first mount having formatted the volume.
        FsEngine::format(&fx.replica_db, "vol-client", "gs", "gs://bucket/vol_client")
            .await
            .unwrap();

        let client = Client::open(&fx.volume_id, fx.store.clone(), &fx.options)
            .await
            .unwrap();
        let written = client.upload("/notes.txt", &b"durable"[..]).await.unwrap();
        assert_eq!(written, 7);
        client.close().await;

        // A completely fresh client restores the pushed snapshot and sees
        // the write.
        let reopened = Client::open(&fx.volume_id, fx.store.clone(), &fx.options)
            .await
            .unwrap();
        let (stream, size) = reopened.download("/notes.txt").await.unwrap();
        assert_eq!(size, 7);
        assert_eq!(read_all(stream).await, b"durable");
        reopened.close().await;
    }

    #[tokio::test]
    async fn delete_then_reopen_shows_removal() {
        let fx = fixture().await;
        FsEngine::format(&fx.replica_db, "vol-client", "gs", "gs://bucket/vol_client")
            .await
            .unwrap();

        let client = Client::open(&fx.volume_id, fx.store.clone(), &fx.options)
            .await
            .unwrap();
        client.upload("/rmdir/a.txt", &b"a"[..]).await.unwrap();
        client.upload("/rmdir/s/b.txt", &b"b"[..]).await.unwrap();
        client.delete("/rmdir", true).await.unwrap();
        client.close().await;

        let reopened = Client::open(&fx.volume_id, fx.store.clone(), &fx.options)
            .await
            .unwrap();
        assert!(matches!(
            reopened.list_dir("/rmdir", 10, 0).await,
            Err(FsError::NotFound(_))
        ));
        reopened.close().await;
    }

    #[tokio::test]
    async fn closed_client_rejects_operations() {
        let fx = fixture().await;
        FsEngine::format(&fx.replica_db, "vol-client", "gs", "gs://bucket/vol_client")
            .await
            .unwrap();

        let client = Client::open(&fx.volume_id, fx.store.clone(), &fx.options)
            .await
            .unwrap();
        client.close().await;
        // Double close is a no-op.
        client.close().await;

        assert!(matches!(
            client.list_dir("/", 10, 0).await,
            Err(FsError::Closed)
        ));
        assert!(matches!(
            client.upload("/x", &b"x"[..]).await,
            Err(FsError::Closed)
        ));
    }
}
