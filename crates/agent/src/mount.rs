//! Volume mount pipeline for the in-VM agent.
//!
//! `Mount` turns a freshly booted VM into a live FUSE mount in five stages:
//! write the access token, restore the metadata DB from its replica, format
//! the volume if no replica existed, flip the journal out of WAL mode,
//! start the replication daemon, then mount. `Unmount` runs the reverse and
//! must not lose writes: the filesystem holds a large write buffer that
//! only a real unmount flushes.

use crate::error::{AgentError, AgentResult, MountStage};
use cistern_core::VolumeId;
use cistern_storage::layout;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::{Child, Command};

/// Ceiling for restore, format, mount and umount invocations.
pub const MOUNT_TIMEOUT: Duration = Duration::from_secs(120);

/// Ceiling for journal-mode and checkpoint statements.
pub const SQLITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period for the replication daemon between SIGTERM and SIGKILL.
pub const DAEMON_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Sync interval for the live replication daemon.
const DAEMON_SYNC_INTERVAL: &str = "1s";

/// Env var pointing the replication tool at the token file.
const REPLICATOR_TOKEN_ENV: &str = "LITESTREAM_GCS_TOKEN_FILE";

/// Env var pointing the filesystem tool at the token file.
const FS_TOKEN_ENV: &str = "JFS_GCS_TOKEN_FILE";

/// Paths of the external tools the pipeline drives.
#[derive(Clone, Debug)]
pub struct ToolPaths {
    /// FUSE filesystem binary (`format` / `mount` / `umount`).
    pub fs_binary: PathBuf,
    /// Replication tool binary (`restore` / `replicate`).
    pub replicator_binary: PathBuf,
    /// SQLite CLI for journal-mode and checkpoint statements.
    pub sqlite3_binary: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            fs_binary: PathBuf::from("/usr/local/bin/juicefs"),
            replicator_binary: PathBuf::from("/usr/local/bin/litestream"),
            sqlite3_binary: PathBuf::from("/usr/bin/sqlite3"),
        }
    }
}

/// Configuration of one mount session.
#[derive(Clone, Debug)]
pub struct MountConfig {
    pub volume_id: VolumeId,
    pub mount_path: PathBuf,
    pub bucket: String,
    pub access_token: String,
    /// Token file readable only by the agent.
    pub token_file: PathBuf,
    /// Local metadata DB path.
    pub meta_db: PathBuf,
    /// Replication daemon config path.
    pub replicator_config: PathBuf,
    pub tools: ToolPaths,
    /// SIGTERM-to-SIGKILL grace for the replication daemon.
    pub daemon_shutdown_timeout: Duration,
}

impl MountConfig {
    /// Config with the standard in-VM paths.
    pub fn new(volume_id: VolumeId, mount_path: PathBuf, bucket: String, access_token: String) -> Self {
        Self {
            volume_id,
            mount_path,
            bucket,
            access_token,
            token_file: PathBuf::from("/tmp/gcs-token"),
            meta_db: PathBuf::from("/tmp/meta.db"),
            replicator_config: PathBuf::from("/tmp/litestream.yml"),
            tools: ToolPaths::default(),
            daemon_shutdown_timeout: DAEMON_SHUTDOWN_TIMEOUT,
        }
    }
}

struct ActiveMount {
    volume_id: String,
    daemon: Child,
}

/// Process-wide slot for the active mount session.
///
/// `Unmount` is reached through a factory that builds a fresh [`Mounter`],
/// so the daemon handle from the original `Mount` call must be reachable
/// from here. At most one session exists per VM; the slot is cleared on
/// successful unmount.
#[derive(Default)]
pub struct MountRegistry {
    inner: Mutex<Option<ActiveMount>>,
}

impl MountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a mount session is active.
    pub fn is_mounted(&self) -> bool {
        self.inner.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }

    fn store(&self, active: ActiveMount) -> Result<(), ActiveMount> {
        let mut slot = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_some() {
            return Err(active);
        }
        *slot = Some(active);
        Ok(())
    }

    fn take(&self) -> Option<ActiveMount> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

/// Drives the mount pipeline for one volume.
pub struct Mounter {
    config: MountConfig,
    registry: std::sync::Arc<MountRegistry>,
}

impl Mounter {
    pub fn new(config: MountConfig, registry: std::sync::Arc<MountRegistry>) -> Self {
        Self { config, registry }
    }

    /// The configured mount path.
    pub fn mount_path(&self) -> &std::path::Path {
        &self.config.mount_path
    }

    /// Run the mount pipeline to completion.
    ///
    /// Any stage failure kills a spawned replication daemon, leaves no
    /// orphan FUSE mount, and reports the failing stage.
    pub async fn mount(&self) -> AgentResult<()> {
        let volume_id = &self.config.volume_id;
        tracing::info!(
            volume_id = %volume_id,
            mount_path = %self.config.mount_path.display(),
            "Volume mount started"
        );

        if self.registry.is_mounted() {
            return Err(AgentError::AlreadyMounted);
        }

        self.write_token_file().await?;

        tokio::fs::create_dir_all(&self.config.mount_path)
            .await
            .map_err(|e| {
                AgentError::stage(MountStage::Restore, format!("create mount directory: {e}"))
            })?;

        self.restore_meta_db().await?;

        if !tokio::fs::try_exists(&self.config.meta_db).await? {
            tracing::info!(volume_id = %volume_id, "No existing replica, formatting new volume");
            self.format_volume().await?;
        }

        self.convert_journal_mode().await?;

        let daemon = self.start_replication().await?;

        if let Err(e) = self.mount_fuse().await {
            self.stop_daemon(daemon).await.ok();
            return Err(e);
        }

        if let Err(e) = self.verify_mount().await {
            self.unmount_fuse().await.ok();
            self.stop_daemon(daemon).await.ok();
            return Err(e);
        }

        let active = ActiveMount {
            volume_id: volume_id.to_string(),
            daemon,
        };
        if let Err(active) = self.registry.store(active) {
            // Lost a race against another mount; back out completely.
            self.unmount_fuse().await.ok();
            self.stop_daemon(active.daemon).await.ok();
            return Err(AgentError::AlreadyMounted);
        }

        tracing::info!(
            volume_id = %volume_id,
            mount_path = %self.config.mount_path.display(),
            "Volume mount completed"
        );
        Ok(())
    }

    /// Unmount the volume without losing writes: umount flushes the FUSE
    /// write buffer, the checkpoint folds the WAL into the main DB file,
    /// and the daemon gets a grace period to push its final sync.
    pub async fn unmount(&self) -> AgentResult<()> {
        self.unmount_fuse().await?;

        if let Err(e) = self.checkpoint_wal().await {
            // The daemon still replicates the main DB file.
            tracing::warn!(
                volume_id = %self.config.volume_id,
                error = %e,
                "WAL checkpoint failed during unmount"
            );
        }

        if let Some(active) = self.registry.take() {
            tracing::info!(
                volume_id = %active.volume_id,
                "Stopping replication daemon"
            );
            self.stop_daemon(active.daemon).await?;
        }

        tracing::info!(volume_id = %self.config.volume_id, "Volume unmounted");
        Ok(())
    }

    async fn write_token_file(&self) -> AgentResult<()> {
        use std::os::unix::fs::PermissionsExt;

        tokio::fs::write(&self.config.token_file, &self.config.access_token)
            .await
            .map_err(|e| AgentError::stage(MountStage::WriteToken, e.to_string()))?;
        tokio::fs::set_permissions(
            &self.config.token_file,
            std::fs::Permissions::from_mode(0o600),
        )
        .await
        .map_err(|e| AgentError::stage(MountStage::WriteToken, e.to_string()))?;
        Ok(())
    }

    async fn restore_meta_db(&self) -> AgentResult<()> {
        let replica_url = layout::meta_replica_url(&self.config.bucket, &self.config.volume_id);

        let mut cmd = Command::new(&self.config.tools.replicator_binary);
        cmd.arg("restore")
            .arg("-if-replica-exists")
            .arg("-o")
            .arg(&self.config.meta_db)
            .arg(&replica_url)
            .env(REPLICATOR_TOKEN_ENV, &self.config.token_file);

        self.run_tool(MountStage::Restore, cmd, MOUNT_TIMEOUT).await?;
        Ok(())
    }

    async fn format_volume(&self) -> AgentResult<()> {
        let data_url = layout::data_url(&self.config.bucket, &self.config.volume_id);
        let meta_url = format!("sqlite3://{}", self.config.meta_db.display());
        // The filesystem only allows alphanumerics and hyphens in volume
        // names.
        let volume_name = self.config.volume_id.fs_name();

        let mut cmd = Command::new(&self.config.tools.fs_binary);
        cmd.arg("format")
            .arg("--storage=gs")
            .arg(format!("--bucket={data_url}"))
            .arg("--no-update")
            .arg(&meta_url)
            .arg(&volume_name)
            .env(FS_TOKEN_ENV, &self.config.token_file);

        self.run_tool(MountStage::Format, cmd, MOUNT_TIMEOUT).await?;
        Ok(())
    }

    /// The mounted filesystem does not tolerate WAL mode, and the restore
    /// leaves the DB in WAL. Idempotent; skipped when no DB exists.
    async fn convert_journal_mode(&self) -> AgentResult<()> {
        if !tokio::fs::try_exists(&self.config.meta_db).await? {
            tracing::debug!(
                volume_id = %self.config.volume_id,
                "Skipping journal conversion (no metadata DB)"
            );
            return Ok(());
        }

        let mut cmd = Command::new(&self.config.tools.sqlite3_binary);
        cmd.arg(&self.config.meta_db)
            .arg("PRAGMA journal_mode=DELETE;");

        self.run_tool(MountStage::JournalMode, cmd, SQLITE_TIMEOUT)
            .await?;
        Ok(())
    }

    async fn start_replication(&self) -> AgentResult<Child> {
        let replica_url = layout::meta_replica_url(&self.config.bucket, &self.config.volume_id);
        let config = format!(
            "dbs:\n  - path: {}\n    replicas:\n      - url: {}\n        sync-interval: {}\n",
            self.config.meta_db.display(),
            replica_url,
            DAEMON_SYNC_INTERVAL
        );
        tokio::fs::write(&self.config.replicator_config, config)
            .await
            .map_err(|e| AgentError::stage(MountStage::StartReplication, e.to_string()))?;

        let child = Command::new(&self.config.tools.replicator_binary)
            .arg("replicate")
            .arg("-config")
            .arg(&self.config.replicator_config)
            .env(REPLICATOR_TOKEN_ENV, &self.config.token_file)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| AgentError::stage(MountStage::StartReplication, e.to_string()))?;

        tracing::info!(
            volume_id = %self.config.volume_id,
            pid = child.id().unwrap_or(0),
            "Replication daemon started"
        );
        Ok(child)
    }

    async fn mount_fuse(&self) -> AgentResult<()> {
        let meta_url = format!("sqlite3://{}", self.config.meta_db.display());

        let mut cmd = Command::new(&self.config.tools.fs_binary);
        cmd.arg("mount")
            .arg("--no-usage-report")
            .arg("--no-bgjob")
            .arg("-d")
            .arg("-o")
            .arg("allow_other")
            .arg(&meta_url)
            .arg(&self.config.mount_path)
            .env(FS_TOKEN_ENV, &self.config.token_file);

        self.run_tool(MountStage::Mount, cmd, MOUNT_TIMEOUT).await?;
        Ok(())
    }

    /// A readable mount directory proves the mount works, even when empty.
    async fn verify_mount(&self) -> AgentResult<()> {
        tokio::fs::read_dir(&self.config.mount_path)
            .await
            .map_err(|e| AgentError::stage(MountStage::Verify, e.to_string()))?;
        Ok(())
    }

    async fn unmount_fuse(&self) -> AgentResult<()> {
        let mut cmd = Command::new(&self.config.tools.fs_binary);
        cmd.arg("umount").arg(&self.config.mount_path);

        self.run_tool(MountStage::Unmount, cmd, MOUNT_TIMEOUT).await?;
        Ok(())
    }

    async fn checkpoint_wal(&self) -> AgentResult<()> {
        if !tokio::fs::try_exists(&self.config.meta_db).await? {
            return Ok(());
        }

        let mut cmd = Command::new(&self.config.tools.sqlite3_binary);
        cmd.arg(&self.config.meta_db)
            .arg("PRAGMA wal_checkpoint(TRUNCATE);");

        self.run_tool(MountStage::Checkpoint, cmd, SQLITE_TIMEOUT)
            .await?;
        Ok(())
    }

    /// SIGTERM the daemon, give it the grace period to flush, SIGKILL on
    /// overrun.
    async fn stop_daemon(&self, mut daemon: Child) -> AgentResult<()> {
        if let Some(pid) = daemon.id() {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                // The process may already have exited.
                tracing::debug!(pid = pid, error = %e, "SIGTERM to replication daemon failed");
            }
        }

        match tokio::time::timeout(self.config.daemon_shutdown_timeout, daemon.wait()).await {
            Ok(Ok(_status)) => {
                tracing::info!(
                    volume_id = %self.config.volume_id,
                    "Replication daemon stopped gracefully"
                );
                Ok(())
            }
            Ok(Err(e)) => Err(AgentError::stage(MountStage::StopReplication, e.to_string())),
            Err(_) => {
                tracing::warn!(
                    volume_id = %self.config.volume_id,
                    "Replication daemon did not stop in time, killing"
                );
                daemon
                    .kill()
                    .await
                    .map_err(|e| AgentError::stage(MountStage::StopReplication, e.to_string()))?;
                Ok(())
            }
        }
    }

    async fn run_tool(
        &self,
        stage: MountStage,
        mut cmd: Command,
        ceiling: Duration,
    ) -> AgentResult<std::process::Output> {
        let child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::stage(stage, format!("spawn: {e}")))?;

        let output = match tokio::time::timeout(ceiling, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(AgentError::stage(stage, e.to_string())),
            Err(_) => {
                return Err(AgentError::stage(
                    stage,
                    format!("timed out after {}s", ceiling.as_secs()),
                ));
            }
        };

        if !output.status.success() {
            return Err(AgentError::stage(
                stage,
                format!(
                    "{}: {}{}",
                    output.status,
                    String::from_utf8_lossy(&output.stdout),
                    String::from_utf8_lossy(&output.stderr)
                ),
            ));
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::sync::Arc;

    struct StubOptions {
        restore_creates_db: bool,
        mount_exit: i32,
        daemon_ignores_term: bool,
    }

    impl Default for StubOptions {
        fn default() -> Self {
            Self {
                restore_creates_db: false,
                mount_exit: 0,
                daemon_ignores_term: false,
            }
        }
    }

    async fn write_script(path: &Path, body: &str) {
        tokio::fs::write(path, body).await.unwrap();
        let mut perms = tokio::fs::metadata(path).await.unwrap().permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(path, perms).await.unwrap();
    }

    struct Fixture {
        _temp: tempfile::TempDir,
        config: MountConfig,
        registry: Arc<MountRegistry>,
        call_log: PathBuf,
        term_marker: PathBuf,
    }

    async fn fixture(opts: StubOptions) -> Fixture {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path();
        let call_log = dir.join("calls.log");
        let term_marker = dir.join("daemon-terminated");

        let fs_binary = dir.join("juicefs");
        write_script(
            &fs_binary,
            &format!(
                r#"#!/bin/sh
echo "juicefs $1" >> "{log}"
case "$1" in
  format)
    db="${{5#sqlite3://}}"
    touch "$db"
    exit 0
    ;;
  mount)
    exit {mount_exit}
    ;;
  umount)
    exit 0
    ;;
esac
exit 0
"#,
                log = call_log.display(),
                mount_exit = opts.mount_exit,
            ),
        )
        .await;

        let restore_body = if opts.restore_creates_db {
            "touch \"$4\""
        } else {
            ":"
        };
        let term_action = if opts.daemon_ignores_term {
            "trap '' TERM".to_string()
        } else {
            format!("trap 'touch \"{}\"; exit 0' TERM", term_marker.display())
        };
        let replicator_binary = dir.join("litestream");
        write_script(
            &replicator_binary,
            &format!(
                r#"#!/bin/sh
echo "litestream $1 token=$LITESTREAM_GCS_TOKEN_FILE" >> "{log}"
case "$1" in
  restore)
    {restore_body}
    exit 0
    ;;
  replicate)
    {term_action}
    sleep 30 &
    wait $!
    exit 0
    ;;
esac
exit 1
"#,
                log = call_log.display(),
            ),
        )
        .await;

        let sqlite3_binary = dir.join("sqlite3");
        write_script(
            &sqlite3_binary,
            &format!(
                "#!/bin/sh\necho \"sqlite3 $2\" >> \"{}\"\nexit 0\n",
                call_log.display()
            ),
        )
        .await;

        let mut config = MountConfig::new(
            VolumeId::parse("vol_mnt1").unwrap(),
            dir.join("mnt/workspace/data"),
            "sandbox-vols".to_string(),
            "token-abc".to_string(),
        );
        config.token_file = dir.join("gcs-token");
        config.meta_db = dir.join("meta.db");
        config.replicator_config = dir.join("litestream.yml");
        config.tools = ToolPaths {
            fs_binary,
            replicator_binary,
            sqlite3_binary,
        };
        config.daemon_shutdown_timeout = Duration::from_millis(500);

        Fixture {
            _temp: temp,
            config,
            registry: Arc::new(MountRegistry::new()),
            call_log,
            term_marker,
        }
    }

    async fn log_lines(fx: &Fixture) -> Vec<String> {
        match tokio::fs::read_to_string(&fx.call_log).await {
            Ok(content) => content.lines().map(|l| l.to_string()).collect(),
            Err(_) => Vec::new(),
        }
    }

    #[tokio::test]
    async fn fresh_volume_runs_full_pipeline() {
        let fx = fixture(StubOptions::default()).await;
        let mounter = Mounter::new(fx.config.clone(), fx.registry.clone());

        mounter.mount().await.unwrap();
        assert!(fx.registry.is_mounted());

        let lines = log_lines(&fx).await;
        assert!(lines.iter().any(|l| l.starts_with("litestream restore")));
        assert!(lines.iter().any(|l| l == "juicefs format"));
        assert!(lines.iter().any(|l| l.contains("journal_mode=DELETE")));
        assert!(lines.iter().any(|l| l.starts_with("litestream replicate")));
        assert!(lines.iter().any(|l| l == "juicefs mount"));

        // The token file is written before the tools run, agent-readable
        // only, and handed to them through the environment.
        let token = tokio::fs::read_to_string(&fx.config.token_file).await.unwrap();
        assert_eq!(token, "token-abc");
        let mode = tokio::fs::metadata(&fx.config.token_file)
            .await
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(
            lines
                .iter()
                .any(|l| l.contains(&format!("token={}", fx.config.token_file.display())))
        );

        // Graceful unmount: umount, checkpoint, daemon terminated, slot
        // cleared.
        let unmounter = Mounter::new(fx.config.clone(), fx.registry.clone());
        unmounter.unmount().await.unwrap();
        assert!(!fx.registry.is_mounted());

        let lines = log_lines(&fx).await;
        assert!(lines.iter().any(|l| l == "juicefs umount"));
        assert!(lines.iter().any(|l| l.contains("wal_checkpoint(TRUNCATE)")));
        assert!(fx.term_marker.exists());
    }

    #[tokio::test]
    async fn restored_volume_skips_format() {
        let fx = fixture(StubOptions {
            restore_creates_db: true,
            ..Default::default()
        })
        .await;
        let mounter = Mounter::new(fx.config.clone(), fx.registry.clone());

        mounter.mount().await.unwrap();

        let lines = log_lines(&fx).await;
        assert!(!lines.iter().any(|l| l == "juicefs format"));
        assert!(lines.iter().any(|l| l.contains("journal_mode=DELETE")));

        Mounter::new(fx.config.clone(), fx.registry.clone())
            .unmount()
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn mount_failure_stops_daemon_and_reports_stage() {
        let fx = fixture(StubOptions {
            mount_exit: 1,
            ..Default::default()
        })
        .await;
        let mounter = Mounter::new(fx.config.clone(), fx.registry.clone());

        let err = mounter.mount().await.unwrap_err();
        match err {
            AgentError::Stage { stage, .. } => assert_eq!(stage, MountStage::Mount),
            other => panic!("unexpected error: {other}"),
        }

        assert!(!fx.registry.is_mounted());
        assert!(fx.term_marker.exists());
    }

    #[tokio::test]
    async fn second_mount_is_rejected() {
        let fx = fixture(StubOptions::default()).await;
        let mounter = Mounter::new(fx.config.clone(), fx.registry.clone());
        mounter.mount().await.unwrap();

        let second = Mounter::new(fx.config.clone(), fx.registry.clone());
        assert!(matches!(
            second.mount().await,
            Err(AgentError::AlreadyMounted)
        ));

        Mounter::new(fx.config.clone(), fx.registry.clone())
            .unmount()
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stubborn_daemon_is_killed_after_grace() {
        let fx = fixture(StubOptions {
            daemon_ignores_term: true,
            ..Default::default()
        })
        .await;
        let mounter = Mounter::new(fx.config.clone(), fx.registry.clone());
        mounter.mount().await.unwrap();

        // The daemon ignores SIGTERM; unmount must still succeed by
        // escalating to SIGKILL after the grace period.
        Mounter::new(fx.config.clone(), fx.registry.clone())
            .unmount()
            .await
            .unwrap();
        assert!(!fx.registry.is_mounted());
        assert!(!fx.term_marker.exists());
    }
}
