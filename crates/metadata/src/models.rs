//! Database models mapping to the metadata schema.

use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// Volume record.
///
/// One row per `(team_id, name)` among non-deleting volumes; `team_id` is
/// immutable for the lifetime of the row.
#[derive(Debug, Clone, FromRow)]
pub struct VolumeRow {
    pub id: String,
    pub team_id: Uuid,
    pub name: String,
    pub status: String,
    pub total_size_bytes: Option<i64>,
    pub total_file_count: Option<i64>,
    /// Per-volume secret, sealed by the configured encryptor.
    pub secret_encrypted: Option<Vec<u8>>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Sandbox-run ledger record, projected from the lifecycle event stream.
///
/// `end_reason` and `ended_at` are set exactly when `status` is `stopped`;
/// `created_at` is written once at insert and never mutated.
#[derive(Debug, Clone, FromRow)]
pub struct SandboxRunRow {
    pub sandbox_id: String,
    pub team_id: Uuid,
    pub template_id: String,
    pub build_id: Option<String>,
    pub status: String,
    pub end_reason: Option<String>,
    pub metadata: Option<String>,
    pub volume_id: Option<String>,
    pub volume_mount_path: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub ended_at: Option<OffsetDateTime>,
    pub timeout_at: Option<OffsetDateTime>,
}

/// Fields the consumer supplies when inserting a run.
#[derive(Debug, Clone)]
pub struct NewSandboxRun {
    pub sandbox_id: String,
    pub team_id: Uuid,
    pub template_id: String,
    pub build_id: Option<String>,
    pub metadata: Option<String>,
    pub volume_id: Option<String>,
    pub volume_mount_path: Option<String>,
    pub timeout_at: Option<OffsetDateTime>,
}
