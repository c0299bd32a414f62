//! Sandbox-run ledger repository trait.

use crate::error::MetadataResult;
use crate::models::{NewSandboxRun, SandboxRunRow};
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for the sandbox-run ledger.
///
/// Write operations are shaped for an at-least-once consumer: inserts
/// surface duplicates as `AlreadyExists` so redelivery can be treated as
/// success, and updates report affected-row counts instead of failing on
/// missing rows.
#[async_trait]
pub trait SandboxRunRepo: Send + Sync {
    /// Insert a run with `status = 'running'`.
    async fn create_sandbox_run(&self, run: &NewSandboxRun) -> MetadataResult<()>;

    /// Set a run's status. Returns the number of rows updated.
    async fn update_sandbox_run_status(
        &self,
        sandbox_id: &str,
        status: &str,
    ) -> MetadataResult<u64>;

    /// Mark a run stopped with the given end reason and `ended_at = now`.
    /// Returns the number of rows updated.
    async fn end_sandbox_run(&self, sandbox_id: &str, end_reason: &str) -> MetadataResult<u64>;

    /// Get a single run.
    async fn get_sandbox_run(&self, sandbox_id: &str) -> MetadataResult<Option<SandboxRunRow>>;

    /// List a team's runs created strictly before `cursor`, newest first,
    /// optionally filtered by status.
    async fn list_sandbox_runs(
        &self,
        team_id: Uuid,
        status: &[String],
        cursor: OffsetDateTime,
        limit: i64,
    ) -> MetadataResult<Vec<SandboxRunRow>>;
}
