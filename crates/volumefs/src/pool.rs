//! Client pool: at most one filesystem client per volume.

use crate::client::{Client, ClientOptions};
use crate::error::FsResult;
use cistern_core::VolumeId;
use cistern_storage::ObjectStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Default idle timeout after which pooled clients are closed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Interval between eviction sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct PooledClient {
    client: Arc<Client>,
    last_used: Instant,
}

/// Pool of per-volume clients, keyed by volume id.
///
/// Clients are cached and reused to avoid re-restoring the metadata
/// snapshot on every request; a background sweep closes idle ones.
pub struct Pool {
    store: Arc<dyn ObjectStore>,
    options: ClientOptions,
    clients: Mutex<HashMap<String, PooledClient>>,
    idle_timeout: Duration,
}

impl Pool {
    /// Create a pool.
    pub fn new(store: Arc<dyn ObjectStore>, options: ClientOptions, idle_timeout: Duration) -> Self {
        Self {
            store,
            options,
            clients: Mutex::new(HashMap::new()),
            idle_timeout,
        }
    }

    /// Get the client for a volume, opening one on miss.
    pub async fn get(&self, volume_id: &VolumeId) -> FsResult<Arc<Client>> {
        let mut clients = self.clients.lock().await;

        if let Some(pooled) = clients.get_mut(volume_id.as_str()) {
            pooled.last_used = Instant::now();
            return Ok(pooled.client.clone());
        }

        let client = Arc::new(Client::open(volume_id, self.store.clone(), &self.options).await?);
        clients.insert(
            volume_id.as_str().to_string(),
            PooledClient {
                client: client.clone(),
                last_used: Instant::now(),
            },
        );

        Ok(client)
    }

    /// Close clients idle longer than the pool's timeout. Returns how many
    /// were evicted.
    pub async fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let mut evicted = Vec::new();
        {
            let mut clients = self.clients.lock().await;
            let stale: Vec<String> = clients
                .iter()
                .filter(|(_, pooled)| now.duration_since(pooled.last_used) > self.idle_timeout)
                .map(|(id, _)| id.clone())
                .collect();
            for id in stale {
                if let Some(pooled) = clients.remove(&id) {
                    evicted.push(pooled.client);
                }
            }
        }

        let count = evicted.len();
        for client in evicted {
            client.close().await;
        }
        count
    }

    /// Close every pooled client.
    pub async fn close_all(&self) {
        let drained: Vec<Arc<Client>> = {
            let mut clients = self.clients.lock().await;
            clients.drain().map(|(_, pooled)| pooled.client).collect()
        };
        for client in drained {
            client.close().await;
        }
    }

    /// Spawn the background eviction sweep.
    pub fn spawn_eviction(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let evicted = pool.evict_idle().await;
                if evicted > 0 {
                    tracing::debug!(evicted = evicted, "Evicted idle volume filesystem clients");
                }
            }
        })
    }
}
