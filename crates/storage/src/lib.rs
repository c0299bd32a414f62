//! Object-store abstraction and volume layout.
//!
//! Every volume owns two sibling prefixes in one bucket: `{vol}/` for data
//! chunks and `{vol}-meta/` for metadata snapshots pushed by the replication
//! tool. The [`layout`] module owns that naming; backends only move bytes.

pub mod backends;
pub mod error;
pub mod layout;
pub mod traits;

pub use backends::filesystem::FilesystemBackend;
pub use backends::s3::S3Backend;
pub use error::{StorageError, StorageResult};
pub use traits::{ByteStream, ObjectMeta, ObjectStore};

use cistern_core::config::StorageConfig;
use std::sync::Arc;

/// Build an object store from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn ObjectStore>> {
    match config {
        StorageConfig::Filesystem { path } => {
            Ok(Arc::new(FilesystemBackend::new(path).await?) as Arc<dyn ObjectStore>)
        }
        StorageConfig::S3 {
            bucket,
            endpoint,
            region,
            access_key_id,
            secret_access_key,
            force_path_style,
        } => Ok(Arc::new(
            S3Backend::new(
                bucket,
                endpoint.clone(),
                region.clone(),
                access_key_id.clone(),
                secret_access_key.clone(),
                *force_path_style,
            )
            .await?,
        ) as Arc<dyn ObjectStore>),
    }
}
