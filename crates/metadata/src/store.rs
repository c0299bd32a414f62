//! Metadata store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::models::{NewSandboxRun, SandboxRunRow, VolumeRow};
use crate::repos::{SandboxRunRepo, VolumeRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, QueryBuilder, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

/// SQLite schema (embedded).
const SQLITE_SCHEMA: &str = include_str!("sqlite_schema.sql");

/// Split an embedded schema into executable statements.
pub(crate) fn schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: VolumeRepo + SandboxRunRepo + Send + Sync {
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based metadata store, for tests and single-node deployments.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Create a new SQLite store and run migrations.
    pub async fn new(path: impl AsRef<Path>) -> MetadataResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            // Prevent transient "database is locked" errors under concurrent access.
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // SQLite permits limited write concurrency; a single connection
            // avoids persistent "database is locked" failures.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        for statement in schema_statements(SQLITE_SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl VolumeRepo for SqliteStore {
    async fn create_volume(&self, volume: &VolumeRow) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO volumes (id, team_id, name, status, total_size_bytes, total_file_count,
                                 secret_encrypted, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&volume.id)
        .bind(volume.team_id)
        .bind(&volume.name)
        .bind(&volume.status)
        .bind(volume.total_size_bytes)
        .bind(volume.total_file_count)
        .bind(&volume.secret_encrypted)
        .bind(volume.created_at)
        .bind(volume.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| MetadataError::from_unique(e, &format!("volume {}", volume.name)))?;
        Ok(())
    }

    async fn get_volume(&self, id: &str) -> MetadataResult<Option<VolumeRow>> {
        let row = sqlx::query_as::<_, VolumeRow>("SELECT * FROM volumes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn get_volume_by_name(
        &self,
        team_id: Uuid,
        name: &str,
    ) -> MetadataResult<Option<VolumeRow>> {
        let row = sqlx::query_as::<_, VolumeRow>(
            "SELECT * FROM volumes WHERE team_id = ? AND name = ? AND status != 'deleting'",
        )
        .bind(team_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_volumes(
        &self,
        team_id: Uuid,
        status: Option<&str>,
        limit: i64,
    ) -> MetadataResult<Vec<VolumeRow>> {
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, VolumeRow>(
                    "SELECT * FROM volumes WHERE team_id = ? AND status = ? \
                     ORDER BY created_at DESC LIMIT ?",
                )
                .bind(team_id)
                .bind(status)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, VolumeRow>(
                    "SELECT * FROM volumes WHERE team_id = ? ORDER BY created_at DESC LIMIT ?",
                )
                .bind(team_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows)
    }

    async fn update_volume_status(
        &self,
        id: &str,
        status: &str,
    ) -> MetadataResult<Option<VolumeRow>> {
        let row = sqlx::query_as::<_, VolumeRow>(
            "UPDATE volumes SET status = ?, updated_at = ? WHERE id = ? RETURNING *",
        )
        .bind(status)
        .bind(OffsetDateTime::now_utc())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn delete_volume(&self, id: &str) -> MetadataResult<()> {
        sqlx::query("DELETE FROM volumes WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SandboxRunRepo for SqliteStore {
    async fn create_sandbox_run(&self, run: &NewSandboxRun) -> MetadataResult<()> {
        let now = OffsetDateTime::now_utc();
        sqlx::query(
            r#"
            INSERT INTO sandbox_runs (sandbox_id, team_id, template_id, build_id, status,
                                      metadata, volume_id, volume_mount_path,
                                      created_at, updated_at, timeout_at)
            VALUES (?, ?, ?, ?, 'running', ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.sandbox_id)
        .bind(run.team_id)
        .bind(&run.template_id)
        .bind(&run.build_id)
        .bind(&run.metadata)
        .bind(&run.volume_id)
        .bind(&run.volume_mount_path)
        .bind(now)
        .bind(now)
        .bind(run.timeout_at)
        .execute(&self.pool)
        .await
        .map_err(|e| MetadataError::from_unique(e, &format!("sandbox run {}", run.sandbox_id)))?;
        Ok(())
    }

    async fn update_sandbox_run_status(
        &self,
        sandbox_id: &str,
        status: &str,
    ) -> MetadataResult<u64> {
        let result =
            sqlx::query("UPDATE sandbox_runs SET status = ?, updated_at = ? WHERE sandbox_id = ?")
                .bind(status)
                .bind(OffsetDateTime::now_utc())
                .bind(sandbox_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn end_sandbox_run(&self, sandbox_id: &str, end_reason: &str) -> MetadataResult<u64> {
        let now = OffsetDateTime::now_utc();
        let result = sqlx::query(
            "UPDATE sandbox_runs SET status = 'stopped', end_reason = ?, ended_at = ?, \
             updated_at = ? WHERE sandbox_id = ?",
        )
        .bind(end_reason)
        .bind(now)
        .bind(now)
        .bind(sandbox_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn get_sandbox_run(&self, sandbox_id: &str) -> MetadataResult<Option<SandboxRunRow>> {
        let row =
            sqlx::query_as::<_, SandboxRunRow>("SELECT * FROM sandbox_runs WHERE sandbox_id = ?")
                .bind(sandbox_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row)
    }

    async fn list_sandbox_runs(
        &self,
        team_id: Uuid,
        status: &[String],
        cursor: OffsetDateTime,
        limit: i64,
    ) -> MetadataResult<Vec<SandboxRunRow>> {
        let mut qb =
            QueryBuilder::<Sqlite>::new("SELECT * FROM sandbox_runs WHERE team_id = ");
        qb.push_bind(team_id);
        qb.push(" AND created_at < ");
        qb.push_bind(cursor);
        if !status.is_empty() {
            qb.push(" AND status IN (");
            let mut separated = qb.separated(", ");
            for s in status {
                separated.push_bind(s);
            }
            qb.push(")");
        }
        qb.push(" ORDER BY created_at DESC LIMIT ");
        qb.push_bind(limit);

        let rows = qb
            .build_query_as::<SandboxRunRow>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, SqliteStore) {
        let temp = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(temp.path().join("metadata.db"))
            .await
            .unwrap();
        (temp, store)
    }

    fn volume(team_id: Uuid, name: &str, status: &str) -> VolumeRow {
        let now = OffsetDateTime::now_utc();
        VolumeRow {
            id: format!("vol_{}", Uuid::new_v4().simple()),
            team_id,
            name: name.to_string(),
            status: status.to_string(),
            total_size_bytes: None,
            total_file_count: None,
            secret_encrypted: Some(b"sealed".to_vec()),
            created_at: now,
            updated_at: now,
        }
    }

    fn run(team_id: Uuid, sandbox_id: &str) -> NewSandboxRun {
        NewSandboxRun {
            sandbox_id: sandbox_id.to_string(),
            team_id,
            template_id: "tmpl-base".to_string(),
            build_id: None,
            metadata: None,
            volume_id: None,
            volume_mount_path: None,
            timeout_at: None,
        }
    }

    #[tokio::test]
    async fn volume_crud_roundtrip() {
        let (_temp, store) = store().await;
        let team = Uuid::new_v4();
        let vol = volume(team, "data", "creating");

        store.create_volume(&vol).await.unwrap();

        let fetched = store.get_volume(&vol.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "data");
        assert_eq!(fetched.team_id, team);
        assert_eq!(fetched.secret_encrypted.as_deref(), Some(&b"sealed"[..]));

        let updated = store
            .update_volume_status(&vol.id, "available")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, "available");
        assert!(updated.updated_at >= fetched.updated_at);

        store.delete_volume(&vol.id).await.unwrap();
        assert!(store.get_volume(&vol.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_name_rejected_until_deleting() {
        let (_temp, store) = store().await;
        let team = Uuid::new_v4();

        let first = volume(team, "data", "available");
        store.create_volume(&first).await.unwrap();

        let dup = volume(team, "data", "creating");
        assert!(matches!(
            store.create_volume(&dup).await,
            Err(MetadataError::AlreadyExists(_))
        ));

        // A different team can reuse the name.
        let other_team = volume(Uuid::new_v4(), "data", "available");
        store.create_volume(&other_team).await.unwrap();

        // Once the original is deleting, the name is free again.
        store
            .update_volume_status(&first.id, "deleting")
            .await
            .unwrap();
        let replacement = volume(team, "data", "creating");
        store.create_volume(&replacement).await.unwrap();
    }

    #[tokio::test]
    async fn name_lookup_hides_deleting_volumes() {
        let (_temp, store) = store().await;
        let team = Uuid::new_v4();
        let vol = volume(team, "data", "deleting");
        store.create_volume(&vol).await.unwrap();

        assert!(
            store
                .get_volume_by_name(team, "data")
                .await
                .unwrap()
                .is_none()
        );
        // By-id lookup still sees the row (the reaper needs it).
        assert!(store.get_volume(&vol.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn list_volumes_is_team_scoped_and_ordered() {
        let (_temp, store) = store().await;
        let team = Uuid::new_v4();

        for name in ["one", "two", "three"] {
            store.create_volume(&volume(team, name, "available")).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        store
            .create_volume(&volume(Uuid::new_v4(), "other", "available"))
            .await
            .unwrap();

        let rows = store.list_volumes(team, None, 100).await.unwrap();
        let names: Vec<_> = rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["three", "two", "one"]);

        let limited = store.list_volumes(team, None, 2).await.unwrap();
        assert_eq!(limited.len(), 2);

        let available = store
            .list_volumes(team, Some("available"), 100)
            .await
            .unwrap();
        assert_eq!(available.len(), 3);
    }

    #[tokio::test]
    async fn sandbox_run_lifecycle() {
        let (_temp, store) = store().await;
        let team = Uuid::new_v4();

        store.create_sandbox_run(&run(team, "sbx1")).await.unwrap();

        // Redelivered insert is a unique violation.
        assert!(matches!(
            store.create_sandbox_run(&run(team, "sbx1")).await,
            Err(MetadataError::AlreadyExists(_))
        ));

        assert_eq!(
            store
                .update_sandbox_run_status("sbx1", "paused")
                .await
                .unwrap(),
            1
        );
        assert_eq!(store.end_sandbox_run("sbx1", "timeout").await.unwrap(), 1);

        let row = store.get_sandbox_run("sbx1").await.unwrap().unwrap();
        assert_eq!(row.status, "stopped");
        assert_eq!(row.end_reason.as_deref(), Some("timeout"));
        assert!(row.ended_at.is_some());

        // Updates against unknown runs affect zero rows instead of failing.
        assert_eq!(
            store
                .update_sandbox_run_status("missing", "paused")
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn sandbox_run_listing_paginates_by_cursor() {
        let (_temp, store) = store().await;
        let team = Uuid::new_v4();

        for i in 0..5 {
            store
                .create_sandbox_run(&run(team, &format!("sbx{i}")))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        store.end_sandbox_run("sbx0", "killed").await.unwrap();

        let now = OffsetDateTime::now_utc();
        let page = store.list_sandbox_runs(team, &[], now, 3).await.unwrap();
        assert_eq!(page.len(), 3);
        assert_eq!(page[0].sandbox_id, "sbx4");

        let cursor = page.last().unwrap().created_at;
        let rest = store.list_sandbox_runs(team, &[], cursor, 10).await.unwrap();
        let ids: Vec<_> = rest.iter().map(|r| r.sandbox_id.as_str()).collect();
        assert_eq!(ids, vec!["sbx1", "sbx0"]);

        let stopped = store
            .list_sandbox_runs(team, &["stopped".to_string()], now, 10)
            .await
            .unwrap();
        assert_eq!(stopped.len(), 1);
        assert_eq!(stopped[0].sandbox_id, "sbx0");
    }
}
