//! Persistent volume registry and sandbox-run ledger.
//!
//! Tenant isolation is enforced at the query layer: name lookups and
//! listings are team-scoped, while by-id lookups return the row and leave
//! hiding cross-team rows to the service layer (which answers "not found").

pub mod error;
pub mod models;
pub mod postgres;
pub mod repos;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use models::{SandboxRunRow, VolumeRow};
pub use postgres::PostgresStore;
pub use repos::{SandboxRunRepo, VolumeRepo};
pub use store::{MetadataStore, SqliteStore};

use cistern_core::config::MetadataConfig;
use std::sync::Arc;

/// Build a metadata store from configuration. Runs migrations.
pub async fn from_config(config: &MetadataConfig) -> MetadataResult<Arc<dyn MetadataStore>> {
    match config {
        MetadataConfig::Sqlite { path } => {
            Ok(Arc::new(SqliteStore::new(path).await?) as Arc<dyn MetadataStore>)
        }
        MetadataConfig::Postgres {
            url,
            max_connections,
        } => Ok(Arc::new(PostgresStore::new(url, *max_connections).await?) as Arc<dyn MetadataStore>),
    }
}
