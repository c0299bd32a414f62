//! Cistern control-plane server binary.

use anyhow::{Context, Result};
use cistern_core::config::AppConfig;
use cistern_core::events::EventDelivery;
use cistern_crypto::Encryptor;
use cistern_server::consumer::Consumer;
use cistern_server::events::{RedisEventDelivery, RedisEventStream};
use cistern_server::ratelimit::{SWEEP_INTERVAL, spawn_cleanup_task};
use cistern_server::{AppState, create_router};
use cistern_volumefs::{ClientOptions, Pool};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Cistern - persistent volumes for sandbox microVMs.
#[derive(Parser, Debug)]
#[command(name = "cisternd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "CISTERN_CONFIG",
        default_value = "config/server.toml"
    )]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Cistern v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration: optional file, overridable by CISTERN_ env vars.
    let config_path = std::path::Path::new(&args.config);
    let mut figment = Figment::new();
    if config_path.exists() {
        tracing::info!(config_path = %args.config, "Loading configuration from file");
        figment = figment.merge(Toml::file(&args.config));
    } else {
        tracing::debug!("No config file found at {}", args.config);
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("CISTERN_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    // Initialize storage and verify connectivity before accepting requests,
    // so the server never reports healthy with unreachable storage.
    let storage = cistern_storage::from_config(&config.storage)
        .await
        .context("failed to initialize storage")?;
    storage
        .health_check()
        .await
        .context("storage health check failed")?;
    tracing::info!(backend = storage.backend_name(), "Storage backend initialized");

    let metadata = cistern_metadata::from_config(&config.metadata)
        .await
        .context("failed to initialize metadata store")?;
    tracing::info!("Metadata store initialized");

    let encryptor = match &config.encryption {
        Some(encryption) => Some(
            Encryptor::new(&encryption.key).context("failed to construct secret encryptor")?,
        ),
        None => {
            tracing::warn!("No encryption key configured, volume secrets are stored in plaintext");
            None
        }
    };

    let events: Option<Arc<dyn EventDelivery>> = match &config.events {
        Some(events_config) => {
            let delivery =
                RedisEventDelivery::connect(&events_config.redis_url, &events_config.volume_stream)
                    .await
                    .context("failed to connect event delivery bus")?;
            tracing::info!(stream = %events_config.volume_stream, "Event delivery bus connected");
            Some(Arc::new(delivery))
        }
        None => None,
    };

    let fs_pool = match &config.volume_fs {
        Some(fs_config) => {
            let pool = Arc::new(Pool::new(
                storage.clone(),
                ClientOptions {
                    replicator_binary: fs_config.replicator_binary.clone(),
                    work_dir: fs_config.work_dir.clone(),
                    bucket: config.storage.bucket().to_string(),
                },
                Duration::from_secs(fs_config.idle_timeout_secs),
            ));
            let _eviction = pool.spawn_eviction();
            tracing::info!("Volume filesystem pool initialized");
            Some(pool)
        }
        None => {
            tracing::warn!("Volume filesystem not configured, file API will answer 503");
            None
        }
    };

    // Project the sandbox lifecycle stream onto the run ledger.
    if config.consumer.enabled {
        match &config.events {
            Some(events_config) => {
                let stream = RedisEventStream::connect(
                    &events_config.redis_url,
                    &events_config.sandbox_stream,
                    &config.consumer.group,
                )
                .await
                .context("failed to connect sandbox event stream")?;
                let consumer = Consumer::new(Arc::new(stream), metadata.clone());
                tokio::spawn(async move {
                    consumer.run(std::future::pending::<()>()).await;
                });
                tracing::info!(group = %config.consumer.group, "Sandbox runs consumer spawned");
            }
            None => {
                tracing::warn!("Consumer enabled but no event bus configured, skipping");
            }
        }
    }

    let state = AppState::new(config.clone(), storage, metadata, encryptor, events, fs_pool);

    spawn_cleanup_task(state.limiters.all(), SWEEP_INTERVAL);

    let app = create_router(state);
    let addr: SocketAddr = config.server.bind.parse().context("invalid bind address")?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
