//! On-disk chunk cache for the embedded filesystem.

use bytes::Bytes;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;

/// Write buffer ceiling: bounds memory staged for outgoing chunks.
pub const WRITE_BUFFER_BYTES: usize = 300 * 1024 * 1024;

/// Default on-disk cache capacity.
pub const CACHE_CAPACITY_BYTES: u64 = 1024 * 1024 * 1024;

/// Fraction of the capacity kept free after eviction.
const FREE_RATIO: f64 = 0.10;

struct CacheState {
    entries: HashMap<String, Entry>,
    total: u64,
    seq: u64,
}

struct Entry {
    size: u64,
    last_used: u64,
}

/// Disk-backed read cache for data chunks, least-recently-used eviction.
pub struct ChunkCache {
    dir: PathBuf,
    capacity: u64,
    state: Mutex<CacheState>,
}

impl ChunkCache {
    /// Create a cache rooted at `dir` with the given capacity in bytes.
    pub fn new(dir: PathBuf, capacity: u64) -> Self {
        Self {
            dir,
            capacity,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                total: 0,
                seq: 0,
            }),
        }
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(key.replace('/', "_"))
    }

    /// Fetch a chunk if cached.
    pub async fn get(&self, key: &str) -> Option<Bytes> {
        {
            let mut state = self.state.lock().await;
            if !state.entries.contains_key(key) {
                return None;
            }
            state.seq += 1;
            let seq = state.seq;
            if let Some(entry) = state.entries.get_mut(key) {
                entry.last_used = seq;
            }
        }

        match tokio::fs::read(self.entry_path(key)).await {
            Ok(data) => Some(Bytes::from(data)),
            Err(_) => {
                // The file vanished underneath us; forget the entry.
                let mut state = self.state.lock().await;
                if let Some(entry) = state.entries.remove(key) {
                    state.total = state.total.saturating_sub(entry.size);
                }
                None
            }
        }
    }

    /// Insert a chunk, evicting least-recently-used entries to keep 10% of
    /// the capacity free.
    pub async fn put(&self, key: &str, data: &Bytes) {
        let size = data.len() as u64;
        if size > self.capacity {
            return;
        }

        if tokio::fs::create_dir_all(&self.dir).await.is_err() {
            return;
        }
        let path = self.entry_path(key);
        if tokio::fs::write(&path, data).await.is_err() {
            return;
        }

        let mut evict = Vec::new();
        {
            let mut state = self.state.lock().await;
            state.seq += 1;
            let seq = state.seq;
            if let Some(previous) = state.entries.insert(key.to_string(), Entry { size, last_used: seq }) {
                state.total = state.total.saturating_sub(previous.size);
            }
            state.total += size;

            let high_water = (self.capacity as f64 * (1.0 - FREE_RATIO)) as u64;
            while state.total > high_water {
                let victim = state
                    .entries
                    .iter()
                    .filter(|(k, _)| k.as_str() != key)
                    .min_by_key(|(_, e)| e.last_used)
                    .map(|(k, _)| k.clone());
                match victim {
                    Some(victim) => {
                        if let Some(entry) = state.entries.remove(&victim) {
                            state.total = state.total.saturating_sub(entry.size);
                        }
                        evict.push(victim);
                    }
                    None => break,
                }
            }
        }

        for victim in evict {
            let _ = tokio::fs::remove_file(self.entry_path(&victim)).await;
        }
    }

    /// Drop a chunk from the cache.
    pub async fn remove(&self, key: &str) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.entries.remove(key) {
            state.total = state.total.saturating_sub(entry.size);
        }
        drop(state);
        let _ = tokio::fs::remove_file(self.entry_path(key)).await;
    }

    /// Total bytes currently cached.
    pub async fn total_bytes(&self) -> u64 {
        self.state.lock().await.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_returns_cached_content() {
        let temp = tempfile::tempdir().unwrap();
        let cache = ChunkCache::new(temp.path().join("cache"), 1024);

        assert!(cache.get("vol_a/chunks/c1").await.is_none());
        cache.put("vol_a/chunks/c1", &Bytes::from_static(b"abc")).await;
        assert_eq!(
            cache.get("vol_a/chunks/c1").await.unwrap(),
            Bytes::from_static(b"abc")
        );
    }

    #[tokio::test]
    async fn eviction_keeps_headroom() {
        let temp = tempfile::tempdir().unwrap();
        let cache = ChunkCache::new(temp.path().join("cache"), 100);

        // Fill past the 90-byte high-water mark.
        for i in 0..4 {
            cache
                .put(&format!("chunk-{i}"), &Bytes::from(vec![0u8; 30]))
                .await;
        }

        assert!(cache.total_bytes().await <= 90);
        // The most recent insert is never its own victim.
        assert!(cache.get("chunk-3").await.is_some());
        // The oldest is gone.
        assert!(cache.get("chunk-0").await.is_none());
    }

    #[tokio::test]
    async fn oversized_entries_are_skipped() {
        let temp = tempfile::tempdir().unwrap();
        let cache = ChunkCache::new(temp.path().join("cache"), 10);
        cache.put("big", &Bytes::from(vec![0u8; 64])).await;
        assert!(cache.get("big").await.is_none());
        assert_eq!(cache.total_bytes().await, 0);
    }

    #[tokio::test]
    async fn remove_forgets_entry() {
        let temp = tempfile::tempdir().unwrap();
        let cache = ChunkCache::new(temp.path().join("cache"), 1024);
        cache.put("k", &Bytes::from_static(b"v")).await;
        cache.remove("k").await;
        assert!(cache.get("k").await.is_none());
        assert_eq!(cache.total_bytes().await, 0);
    }
}
