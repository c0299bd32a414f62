//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage (testing and single-node deployments).
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
    /// S3-compatible object storage.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Optional endpoint URL (for MinIO, GCS interop, etc.).
        endpoint: Option<String>,
        /// Region.
        region: Option<String>,
        /// Access key ID. Falls back to the ambient credential chain if unset.
        access_key_id: Option<String>,
        /// Secret access key. Falls back to the ambient credential chain if unset.
        secret_access_key: Option<String>,
        /// Force path-style URLs. Required for MinIO; AWS S3 wants false.
        #[serde(default)]
        force_path_style: bool,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/storage"),
        }
    }
}

impl StorageConfig {
    /// The bucket name volumes live in. Filesystem backends use a fixed
    /// placeholder so replica URLs stay well-formed.
    pub fn bucket(&self) -> &str {
        match self {
            Self::Filesystem { .. } => "local",
            Self::S3 { bucket, .. } => bucket,
        }
    }

    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::S3 {
                access_key_id,
                secret_access_key,
                ..
            } => match (access_key_id.as_ref(), secret_access_key.as_ref()) {
                (Some(_), Some(_)) | (None, None) => Ok(()),
                _ => Err(
                    "s3 config requires both access_key_id and secret_access_key when either is set"
                        .to_string(),
                ),
            },
            _ => Ok(()),
        }
    }
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database (testing and small deployments).
    Sqlite {
        /// Database file path.
        path: PathBuf,
    },
    /// PostgreSQL database.
    Postgres {
        /// Connection URL.
        url: String,
        /// Maximum connections in the pool.
        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
}

fn default_max_connections() -> u32 {
    10
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/metadata.db"),
        }
    }
}

/// Out-of-band volume filesystem configuration.
///
/// When absent, the file API responds 503.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VolumeFsConfig {
    /// Path to the replication tool binary (restore + one-shot sync).
    #[serde(default = "default_replicator_binary")]
    pub replicator_binary: PathBuf,
    /// Working directory for per-volume temp state.
    #[serde(default = "default_fs_work_dir")]
    pub work_dir: PathBuf,
    /// Seconds of idleness after which pooled clients are closed.
    #[serde(default = "default_fs_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

fn default_replicator_binary() -> PathBuf {
    PathBuf::from("/usr/local/bin/litestream")
}

fn default_fs_work_dir() -> PathBuf {
    PathBuf::from("/tmp/cistern-fs")
}

fn default_fs_idle_timeout_secs() -> u64 {
    300
}

impl Default for VolumeFsConfig {
    fn default() -> Self {
        Self {
            replicator_binary: default_replicator_binary(),
            work_dir: default_fs_work_dir(),
            idle_timeout_secs: default_fs_idle_timeout_secs(),
        }
    }
}

/// Secret encryption configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Base64-encoded 256-bit key.
    pub key: String,
}

/// Event delivery / stream configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Redis connection URL for the event bus.
    pub redis_url: String,
    /// Stream the sandbox lifecycle events are published to.
    #[serde(default = "default_sandbox_stream")]
    pub sandbox_stream: String,
    /// Stream volume lifecycle events are published to.
    #[serde(default = "default_volume_stream")]
    pub volume_stream: String,
}

fn default_sandbox_stream() -> String {
    "sandbox-events".to_string()
}

fn default_volume_stream() -> String {
    "volume-events".to_string()
}

/// Sandbox-run consumer configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Whether the consumer runs in this process.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Consumer group name (process-wide).
    #[serde(default = "default_consumer_group")]
    pub group: String,
}

fn default_true() -> bool {
    true
}

fn default_consumer_group() -> String {
    "api-sandbox-runs".to_string()
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            group: default_consumer_group(),
        }
    }
}

/// Per-endpoint token-bucket parameters.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct EndpointLimit {
    /// Requests allowed per minute per key.
    pub requests_per_minute: u32,
    /// Maximum burst above the steady rate.
    pub burst: u32,
}

/// Rate limiting configuration for the file API.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_list_limit")]
    pub list: EndpointLimit,
    #[serde(default = "default_upload_limit")]
    pub upload: EndpointLimit,
    #[serde(default = "default_download_limit")]
    pub download: EndpointLimit,
    #[serde(default = "default_delete_limit")]
    pub delete: EndpointLimit,
}

fn default_list_limit() -> EndpointLimit {
    EndpointLimit {
        requests_per_minute: 100,
        burst: 20,
    }
}

fn default_upload_limit() -> EndpointLimit {
    EndpointLimit {
        requests_per_minute: 60,
        burst: 10,
    }
}

fn default_download_limit() -> EndpointLimit {
    EndpointLimit {
        requests_per_minute: 60,
        burst: 10,
    }
}

fn default_delete_limit() -> EndpointLimit {
    EndpointLimit {
        requests_per_minute: 30,
        burst: 5,
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            list: default_list_limit(),
            upload: default_upload_limit(),
            download: default_download_limit(),
            delete: default_delete_limit(),
        }
    }
}

impl RateLimitConfig {
    /// Validate rate limit configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if !self.enabled {
            return Ok(());
        }
        for (name, limit) in [
            ("list", &self.list),
            ("upload", &self.upload),
            ("download", &self.download),
            ("delete", &self.delete),
        ] {
            if limit.requests_per_minute == 0 || limit.burst == 0 {
                return Err(format!(
                    "rate_limit.{name} requires non-zero requests_per_minute and burst"
                ));
            }
        }
        Ok(())
    }
}

/// Complete control-plane configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    /// Out-of-band file-operation support (optional).
    pub volume_fs: Option<VolumeFsConfig>,
    /// Secret encryption (optional; plaintext fallback logs a warning).
    pub encryption: Option<EncryptionConfig>,
    /// Event bus (optional; events are dropped when unset).
    pub events: Option<EventsConfig>,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl AppConfig {
    /// Create a test configuration with sensible defaults.
    ///
    /// **For testing only.** Filesystem storage, SQLite metadata, no event
    /// bus, no encryption.
    pub fn for_testing() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            metadata: MetadataConfig::default(),
            volume_fs: None,
            encryption: None,
            events: None,
            consumer: ConsumerConfig {
                enabled: false,
                ..Default::default()
            },
            rate_limit: RateLimitConfig::default(),
        }
    }

    /// Validate the full configuration, returning the first error.
    pub fn validate(&self) -> Result<(), String> {
        self.storage.validate()?;
        self.rate_limit.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_deserialize_from_empty_table() {
        let config: AppConfig = serde_json::from_str("{}").unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.bind, "127.0.0.1:8080");
        assert_eq!(config.rate_limit.delete.requests_per_minute, 30);
        assert!(config.volume_fs.is_none());
    }

    #[test]
    fn rate_limit_rejects_zero_burst() {
        let mut config = AppConfig::for_testing();
        config.rate_limit.upload.burst = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn storage_config_requires_complete_credentials() {
        let config = StorageConfig::S3 {
            bucket: "bucket".to_string(),
            endpoint: None,
            region: None,
            access_key_id: Some("access".to_string()),
            secret_access_key: None,
            force_path_style: false,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn bucket_falls_back_for_filesystem() {
        assert_eq!(StorageConfig::default().bucket(), "local");
    }
}
