//! Volume repository trait.

use crate::error::MetadataResult;
use crate::models::VolumeRow;
use async_trait::async_trait;
use uuid::Uuid;

/// Repository for the volume registry.
#[async_trait]
pub trait VolumeRepo: Send + Sync {
    /// Insert a new volume row.
    ///
    /// Returns `AlreadyExists` when another non-deleting volume holds the
    /// same `(team_id, name)`.
    async fn create_volume(&self, volume: &VolumeRow) -> MetadataResult<()>;

    /// Get a volume by id, regardless of team. Callers hide cross-team rows.
    async fn get_volume(&self, id: &str) -> MetadataResult<Option<VolumeRow>>;

    /// Get a team's volume by name. Never returns `deleting` rows.
    async fn get_volume_by_name(
        &self,
        team_id: Uuid,
        name: &str,
    ) -> MetadataResult<Option<VolumeRow>>;

    /// List a team's volumes, newest first.
    async fn list_volumes(
        &self,
        team_id: Uuid,
        status: Option<&str>,
        limit: i64,
    ) -> MetadataResult<Vec<VolumeRow>>;

    /// Update a volume's status, returning the updated row.
    async fn update_volume_status(
        &self,
        id: &str,
        status: &str,
    ) -> MetadataResult<Option<VolumeRow>>;

    /// Delete a volume row.
    async fn delete_volume(&self, id: &str) -> MetadataResult<()>;
}
