//! Replication-tool invocations for the out-of-band client.
//!
//! The replication tool is an external binary with a fixed CLI contract:
//!
//! - `restore -if-replica-exists -o <metaDB> <replicaURL>` exits 0 both when
//!   a replica was restored and when none exists; the presence of `<metaDB>`
//!   afterwards distinguishes the two.
//! - `replicate -once -config <yml>` syncs the local database to its replica
//!   once and exits.

use crate::error::{FsError, FsResult};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Ceiling for a restore invocation.
pub const RESTORE_TIMEOUT: Duration = Duration::from_secs(120);

/// Ceiling for a one-shot sync. Overruns are warnings, not errors: the tool
/// may already have pushed the snapshot when the deadline fires.
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// Sync interval written into one-shot replication configs.
pub const SYNC_INTERVAL: &str = "100ms";

/// Result of a restore attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// A replica existed and the metadata DB was written.
    Restored,
    /// No replica exists; the volume is fresh.
    FreshVolume,
}

/// Restore the metadata DB from its replica, if one exists.
pub async fn restore_meta_db(
    binary: &Path,
    meta_db: &Path,
    replica_url: &str,
) -> FsResult<RestoreOutcome> {
    // Drop any leftover DB from a previous attempt so existence afterwards
    // is meaningful.
    match tokio::fs::remove_file(meta_db).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let output = run_with_timeout(
        "restore",
        Command::new(binary)
            .arg("restore")
            .arg("-if-replica-exists")
            .arg("-o")
            .arg(meta_db)
            .arg(replica_url),
        RESTORE_TIMEOUT,
    )
    .await?;

    if !output.status.success() {
        return Err(FsError::Subprocess {
            tool: "restore",
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    if tokio::fs::try_exists(meta_db).await? {
        Ok(RestoreOutcome::Restored)
    } else {
        Ok(RestoreOutcome::FreshVolume)
    }
}

/// Write a replication config declaring one replica for the metadata DB.
pub async fn write_replicator_config(
    config_path: &Path,
    meta_db: &Path,
    replica_url: &str,
    sync_interval: &str,
) -> FsResult<()> {
    let config = format!(
        "dbs:\n  - path: {}\n    replicas:\n      - url: {}\n        sync-interval: {}\n",
        meta_db.display(),
        replica_url,
        sync_interval
    );
    tokio::fs::write(config_path, config).await?;
    Ok(())
}

/// Push the metadata DB to its replica once.
///
/// A deadline overrun is reported as `SubprocessTimeout`; callers downgrade
/// it to a warning because the sync may have completed before the kill.
pub async fn sync_once(binary: &Path, config_path: &Path) -> FsResult<()> {
    let output = run_with_timeout(
        "replicate",
        Command::new(binary)
            .arg("replicate")
            .arg("-once")
            .arg("-config")
            .arg(config_path),
        SYNC_TIMEOUT,
    )
    .await?;

    if !output.status.success() {
        return Err(FsError::Subprocess {
            tool: "replicate",
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    Ok(())
}

async fn run_with_timeout(
    tool: &'static str,
    command: &mut Command,
    ceiling: Duration,
) -> FsResult<std::process::Output> {
    let child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    match tokio::time::timeout(ceiling, child.wait_with_output()).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(FsError::SubprocessTimeout {
            tool,
            seconds: ceiling.as_secs(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    async fn write_stub(dir: &Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("replicator");
        tokio::fs::write(&path, format!("#!/bin/sh\n{body}\n"))
            .await
            .unwrap();
        let mut perms = tokio::fs::metadata(&path).await.unwrap().permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(&path, perms).await.unwrap();
        path
    }

    #[tokio::test]
    async fn restore_distinguishes_fresh_from_restored() {
        let temp = tempfile::tempdir().unwrap();
        let meta_db = temp.path().join("meta.db");

        // Stub that restores nothing: exit 0, no output file.
        let noop = write_stub(temp.path(), "exit 0").await;
        let outcome = restore_meta_db(&noop, &meta_db, "gs://b/vol_x-meta")
            .await
            .unwrap();
        assert_eq!(outcome, RestoreOutcome::FreshVolume);

        // Stub that writes the -o argument ($4).
        let writes = write_stub(temp.path(), "touch \"$4\"").await;
        let outcome = restore_meta_db(&writes, &meta_db, "gs://b/vol_x-meta")
            .await
            .unwrap();
        assert_eq!(outcome, RestoreOutcome::Restored);
    }

    #[tokio::test]
    async fn restore_clears_stale_db_first() {
        let temp = tempfile::tempdir().unwrap();
        let meta_db = temp.path().join("meta.db");
        tokio::fs::write(&meta_db, b"stale").await.unwrap();

        let noop = write_stub(temp.path(), "exit 0").await;
        let outcome = restore_meta_db(&noop, &meta_db, "gs://b/vol_x-meta")
            .await
            .unwrap();
        assert_eq!(outcome, RestoreOutcome::FreshVolume);
        assert!(!meta_db.exists());
    }

    #[tokio::test]
    async fn restore_surfaces_nonzero_exit() {
        let temp = tempfile::tempdir().unwrap();
        let meta_db = temp.path().join("meta.db");

        let failing = write_stub(temp.path(), "echo boom >&2; exit 3").await;
        let err = restore_meta_db(&failing, &meta_db, "gs://b/vol_x-meta")
            .await
            .unwrap_err();
        match err {
            FsError::Subprocess { tool, stderr, .. } => {
                assert_eq!(tool, "restore");
                assert!(stderr.contains("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn config_contains_db_and_replica() {
        let temp = tempfile::tempdir().unwrap();
        let config = temp.path().join("replicator.yml");
        write_replicator_config(
            &config,
            Path::new("/tmp/meta.db"),
            "gs://bucket/vol_x-meta",
            SYNC_INTERVAL,
        )
        .await
        .unwrap();

        let content = tokio::fs::read_to_string(&config).await.unwrap();
        assert!(content.contains("path: /tmp/meta.db"));
        assert!(content.contains("url: gs://bucket/vol_x-meta"));
        assert!(content.contains("sync-interval: 100ms"));
    }

    #[tokio::test]
    async fn sync_once_passes_flags() {
        let temp = tempfile::tempdir().unwrap();
        let config = temp.path().join("replicator.yml");
        tokio::fs::write(&config, "dbs: []\n").await.unwrap();

        // Stub that fails unless called as `replicate -once -config <path>`.
        let marker = temp.path().join("ran");
        let stub = write_stub(
            temp.path(),
            &format!(
                "[ \"$1\" = replicate ] || exit 1\n[ \"$2\" = -once ] || exit 1\n[ \"$3\" = -config ] || exit 1\ntouch {}",
                marker.display()
            ),
        )
        .await;

        sync_once(&stub, &config).await.unwrap();
        assert!(marker.exists());
    }
}
