//! Application state shared across handlers.

use crate::ratelimit::EndpointRateLimiter;
use axum::http::Method;
use cistern_core::config::AppConfig;
use cistern_core::events::EventDelivery;
use cistern_crypto::Encryptor;
use cistern_metadata::MetadataStore;
use cistern_storage::ObjectStore;
use cistern_volumefs::Pool;
use std::sync::Arc;

/// Per-endpoint rate limiters for the file API.
#[derive(Clone)]
pub struct FileApiLimiters {
    pub list: Arc<EndpointRateLimiter>,
    pub upload: Arc<EndpointRateLimiter>,
    pub download: Arc<EndpointRateLimiter>,
    pub delete: Arc<EndpointRateLimiter>,
}

impl FileApiLimiters {
    /// Build the limiters from configuration.
    ///
    /// List and delete share the `/volumes/{id}/files` route, so those two
    /// limiters are method-restricted.
    pub fn from_config(config: &cistern_core::config::RateLimitConfig) -> Self {
        Self {
            list: EndpointRateLimiter::for_methods(config.list, config.enabled, &[Method::GET]),
            upload: EndpointRateLimiter::new(config.upload, config.enabled),
            download: EndpointRateLimiter::new(config.download, config.enabled),
            delete: EndpointRateLimiter::for_methods(
                config.delete,
                config.enabled,
                &[Method::DELETE],
            ),
        }
    }

    /// All limiters, for the cleanup sweep.
    pub fn all(&self) -> Vec<Arc<EndpointRateLimiter>> {
        vec![
            self.list.clone(),
            self.upload.clone(),
            self.download.clone(),
            self.delete.clone(),
        ]
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Object storage backend.
    pub storage: Arc<dyn ObjectStore>,
    /// Volume registry and run ledger.
    pub metadata: Arc<dyn MetadataStore>,
    /// Secret encryptor (optional; plaintext fallback logs a warning).
    pub encryptor: Option<Arc<Encryptor>>,
    /// Event delivery bus (optional; events are dropped when unset).
    pub events: Option<Arc<dyn EventDelivery>>,
    /// Out-of-band filesystem pool (optional; file API answers 503 when
    /// unset).
    pub fs_pool: Option<Arc<Pool>>,
    /// File API rate limiters.
    pub limiters: FileApiLimiters,
}

impl AppState {
    /// Create application state, failing fast on invalid configuration.
    ///
    /// # Panics
    ///
    /// Panics when configuration validation fails.
    pub fn new(
        config: AppConfig,
        storage: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
        encryptor: Option<Encryptor>,
        events: Option<Arc<dyn EventDelivery>>,
        fs_pool: Option<Arc<Pool>>,
    ) -> Self {
        if let Err(error) = config.validate() {
            panic!("Invalid configuration: {error}");
        }

        let limiters = FileApiLimiters::from_config(&config.rate_limit);

        Self {
            config: Arc::new(config),
            storage,
            metadata,
            encryptor: encryptor.map(Arc::new),
            events,
            fs_pool,
            limiters,
        }
    }

    /// The bucket volumes live in.
    pub fn bucket(&self) -> &str {
        self.config.storage.bucket()
    }
}
