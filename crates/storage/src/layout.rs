//! Object-store layout for volumes.
//!
//! For bucket `B` and volume `V`: data lives under `B/V/…`, metadata
//! snapshots under `B/V-meta/…`. Creation writes a zero-byte `.keep` marker
//! in each prefix so that "empty" is distinguishable from "missing".

use crate::error::StorageResult;
use crate::traits::ObjectStore;
use bytes::Bytes;
use cistern_core::VolumeId;

/// Marker object name written into each prefix at creation.
pub const MARKER_NAME: &str = ".keep";

/// Data prefix for a volume: `{vol}/`.
pub fn data_prefix(volume_id: &VolumeId) -> String {
    format!("{volume_id}/")
}

/// Metadata prefix for a volume: `{vol}-meta/`.
pub fn meta_prefix(volume_id: &VolumeId) -> String {
    format!("{volume_id}-meta/")
}

/// Object-store URL of the volume's data prefix, as handed to the FORMAT
/// tool.
pub fn data_url(bucket: &str, volume_id: &VolumeId) -> String {
    format!("gs://{bucket}/{volume_id}")
}

/// Object-store URL of the volume's metadata replica, as handed to the
/// replication tool.
pub fn meta_replica_url(bucket: &str, volume_id: &VolumeId) -> String {
    format!("gs://{bucket}/{volume_id}-meta")
}

/// Initialize the object-store layout for a fresh volume.
pub async fn init_volume_layout(
    store: &dyn ObjectStore,
    volume_id: &VolumeId,
) -> StorageResult<()> {
    for prefix in [data_prefix(volume_id), meta_prefix(volume_id)] {
        store
            .put(&format!("{prefix}{MARKER_NAME}"), Bytes::new())
            .await?;
    }
    Ok(())
}

/// Remove both prefixes of a volume, returning how many objects were
/// deleted.
///
/// Individual object deletions are best-effort; only a failed listing is an
/// error. Callers treat even that as non-fatal on the delete path.
pub async fn destroy_volume_layout(
    store: &dyn ObjectStore,
    volume_id: &VolumeId,
) -> StorageResult<usize> {
    let mut deleted = 0;
    for prefix in [data_prefix(volume_id), meta_prefix(volume_id)] {
        for key in store.list(&prefix).await? {
            match store.delete(&key).await {
                Ok(()) => deleted += 1,
                Err(e) => {
                    tracing::warn!(
                        volume_id = %volume_id,
                        key = %key,
                        error = %e,
                        "Failed to delete volume object"
                    );
                }
            }
        }
    }
    Ok(deleted)
}
