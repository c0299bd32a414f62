//! Cistern in-VM agent binary.
//!
//! Boots inside a sandbox microVM with a volume attached: starts the
//! object-store access proxy in the VM's network namespace, runs the mount
//! pipeline, then serves the shutdown API until the orchestrator tears the
//! VM down.

use anyhow::{Context, Result};
use cistern_agent::api::{ShutdownState, shutdown_router};
use cistern_agent::mount::{MountConfig, MountRegistry, Mounter};
use cistern_agent::proxy::{FileTokenProvider, Proxy, ProxyConfig};
use cistern_core::VolumeId;
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Cistern volume mount agent.
#[derive(Parser, Debug)]
#[command(name = "cistern-agentd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Volume to mount (vol_…).
    #[arg(long, env = "CISTERN_VOLUME_ID")]
    volume_id: String,

    /// Mount path inside the VM.
    #[arg(long, env = "CISTERN_MOUNT_PATH")]
    mount_path: String,

    /// Bucket holding the volume's prefixes.
    #[arg(long, env = "CISTERN_BUCKET")]
    bucket: String,

    /// Downscoped object-store access token.
    #[arg(long, env = "CISTERN_ACCESS_TOKEN", hide_env_values = true)]
    access_token: String,

    /// Shutdown API bind address.
    #[arg(long, env = "CISTERN_API_BIND", default_value = "0.0.0.0:49982")]
    api_bind: String,

    /// Access proxy bind address inside the netns.
    #[arg(long, env = "CISTERN_PROXY_BIND", default_value = "0.0.0.0:5017")]
    proxy_bind: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let volume_id = VolumeId::parse(&args.volume_id).context("invalid volume id")?;
    cistern_core::validate_mount_path(&args.mount_path).context("invalid mount path")?;

    tracing::info!(
        volume_id = %volume_id,
        mount_path = %args.mount_path,
        "Cistern agent v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    let config = MountConfig::new(
        volume_id.clone(),
        args.mount_path.clone().into(),
        args.bucket.clone(),
        args.access_token.clone(),
    );
    let registry = Arc::new(MountRegistry::new());

    // The proxy must be reachable before the mount pipeline runs the
    // filesystem tools.
    let proxy = Proxy::new(
        ProxyConfig::new(volume_id.as_str(), &args.bucket),
        Arc::new(FileTokenProvider::new(config.token_file.clone())),
    )?;
    let proxy_listener = tokio::net::TcpListener::bind(&args.proxy_bind)
        .await
        .with_context(|| format!("failed to bind proxy to {}", args.proxy_bind))?;
    let (proxy_shutdown_tx, proxy_shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let proxy_task = tokio::spawn(async move {
        proxy
            .run(proxy_listener, async {
                let _ = proxy_shutdown_rx.await;
            })
            .await
    });

    let mounter = Mounter::new(config.clone(), registry.clone());
    mounter.mount().await.context("mount pipeline failed")?;

    let api = shutdown_router(ShutdownState {
        config: config.clone(),
        registry: registry.clone(),
    });
    let api_listener = tokio::net::TcpListener::bind(&args.api_bind)
        .await
        .with_context(|| format!("failed to bind API to {}", args.api_bind))?;
    tracing::info!(addr = %api_listener.local_addr()?, "Agent API listening");

    axum::serve(api_listener, api)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    // Best-effort teardown when the process is asked to exit without a
    // shutdown call.
    if registry.is_mounted() {
        let mounter = Mounter::new(config, registry);
        if let Err(e) = mounter.unmount().await {
            tracing::error!(error = %e, "Final unmount failed");
        }
    }

    let _ = proxy_shutdown_tx.send(());
    let _ = proxy_task.await;

    Ok(())
}
