//! PostgreSQL-based metadata store implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::models::{NewSandboxRun, SandboxRunRow, VolumeRow};
use crate::repos::{SandboxRunRepo, VolumeRepo};
use crate::store::{MetadataStore, schema_statements};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Pool, Postgres, QueryBuilder};
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// PostgreSQL schema (embedded).
const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

/// PostgreSQL-based metadata store.
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    /// Create a new PostgreSQL store from a connection URL and run
    /// migrations.
    pub async fn new(url: &str, max_connections: u32) -> MetadataResult<Self> {
        let opts = PgConnectOptions::from_str(url)?;

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for PostgresStore {
    async fn migrate(&self) -> MetadataResult<()> {
        for statement in schema_statements(POSTGRES_SCHEMA) {
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
impl VolumeRepo for PostgresStore {
    async fn create_volume(&self, volume: &VolumeRow) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO volumes (id, team_id, name, status, total_size_bytes, total_file_count,
                                 secret_encrypted, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
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
        let row = sqlx::query_as::<_, VolumeRow>("SELECT * FROM volumes WHERE id = $1")
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
            "SELECT * FROM volumes WHERE team_id = $1 AND name = $2 AND status != 'deleting'",
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
                    "SELECT * FROM volumes WHERE team_id = $1 AND status = $2 \
                     ORDER BY created_at DESC LIMIT $3",
                )
                .bind(team_id)
                .bind(status)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, VolumeRow>(
                    "SELECT * FROM volumes WHERE team_id = $1 ORDER BY created_at DESC LIMIT $2",
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
            "UPDATE volumes SET status = $1, updated_at = $2 WHERE id = $3 RETURNING *",
        )
        .bind(status)
        .bind(OffsetDateTime::now_utc())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn delete_volume(&self, id: &str) -> MetadataResult<()> {
        sqlx::query("DELETE FROM volumes WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SandboxRunRepo for PostgresStore {
    async fn create_sandbox_run(&self, run: &NewSandboxRun) -> MetadataResult<()> {
        let now = OffsetDateTime::now_utc();
        sqlx::query(
            r#"
            INSERT INTO sandbox_runs (sandbox_id, team_id, template_id, build_id, status,
                                      metadata, volume_id, volume_mount_path,
                                      created_at, updated_at, timeout_at)
            VALUES ($1, $2, $3, $4, 'running', $5, $6, $7, $8, $9, $10)
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
        let result = sqlx::query(
            "UPDATE sandbox_runs SET status = $1, updated_at = $2 WHERE sandbox_id = $3",
        )
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
            "UPDATE sandbox_runs SET status = 'stopped', end_reason = $1, ended_at = $2, \
             updated_at = $3 WHERE sandbox_id = $4",
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
            sqlx::query_as::<_, SandboxRunRow>("SELECT * FROM sandbox_runs WHERE sandbox_id = $1")
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
            QueryBuilder::<Postgres>::new("SELECT * FROM sandbox_runs WHERE team_id = ");
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
