//! Per-endpoint rate limiting for the file API.
//!
//! Each endpoint group carries its own token bucket per key. The key is the
//! authenticated team when present, the client IP otherwise. Buckets are
//! created lazily and evicted after ten minutes of idleness by a five-minute
//! sweep, which bounds memory without a rebuild dance.

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use cistern_core::config::EndpointLimit;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Idle time after which a key's bucket is evicted.
pub const BUCKET_TTL: Duration = Duration::from_secs(600);

/// Interval between eviction sweeps.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

struct Bucket {
    limiter: DefaultDirectRateLimiter,
    last_access: Instant,
}

/// Token-bucket rate limiter for one endpoint group.
pub struct EndpointRateLimiter {
    quota: Quota,
    buckets: DashMap<String, Bucket>,
    /// When set, only these methods are enforced; others pass through.
    methods: Option<Vec<Method>>,
    enabled: bool,
}

impl EndpointRateLimiter {
    /// Create a limiter from endpoint configuration.
    pub fn new(limit: EndpointLimit, enabled: bool) -> Arc<Self> {
        let per_minute =
            NonZeroU32::new(limit.requests_per_minute).unwrap_or(NonZeroU32::new(60).unwrap());
        let burst = NonZeroU32::new(limit.burst).unwrap_or(NonZeroU32::new(1).unwrap());
        Arc::new(Self {
            quota: Quota::per_minute(per_minute).allow_burst(burst),
            buckets: DashMap::new(),
            methods: None,
            enabled,
        })
    }

    /// Variant restricting enforcement to a subset of HTTP methods.
    pub fn for_methods(limit: EndpointLimit, enabled: bool, methods: &[Method]) -> Arc<Self> {
        let mut limiter = Self::new(limit, enabled);
        Arc::get_mut(&mut limiter)
            .expect("fresh Arc has one owner")
            .methods = Some(methods.to_vec());
        limiter
    }

    /// Whether this limiter applies to the given method.
    pub fn applies_to(&self, method: &Method) -> bool {
        match &self.methods {
            Some(methods) => methods.contains(method),
            None => true,
        }
    }

    /// Check and consume one token for a key.
    pub fn allow(&self, key: &str) -> bool {
        if !self.enabled {
            return true;
        }

        match self.buckets.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let bucket = entry.get_mut();
                bucket.last_access = Instant::now();
                bucket.limiter.check().is_ok()
            }
            Entry::Vacant(entry) => {
                let bucket = entry.insert(Bucket {
                    limiter: RateLimiter::direct(self.quota),
                    last_access: Instant::now(),
                });
                bucket.limiter.check().is_ok()
            }
        }
    }

    /// Evict buckets idle longer than [`BUCKET_TTL`]. Returns the count.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let stale: Vec<String> = self
            .buckets
            .iter()
            .filter(|entry| now.duration_since(entry.value().last_access) > BUCKET_TTL)
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for key in stale {
            if self
                .buckets
                .remove_if(&key, |_, bucket| {
                    now.duration_since(bucket.last_access) > BUCKET_TTL
                })
                .is_some()
            {
                evicted += 1;
            }
        }
        evicted
    }

    /// Current number of tracked keys.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

/// Extract the rate-limit key: team id preferred, client IP fallback.
fn limit_key(req: &Request<Body>) -> String {
    if let Some(team) = req.extensions().get::<crate::auth::Team>() {
        return format!("team:{}", team.id);
    }
    if let Some(connect_info) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        return format!("ip:{}", connect_info.0.ip());
    }
    "unknown".to_string()
}

/// Rate limiting middleware for one endpoint group.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<EndpointRateLimiter>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if !limiter.applies_to(req.method()) {
        return next.run(req).await;
    }

    let key = limit_key(&req);
    if limiter.allow(&key) {
        next.run(req).await
    } else {
        (
            StatusCode::TOO_MANY_REQUESTS,
            axum::Json(serde_json::json!({
                "message": "Rate limit exceeded. Please try again later."
            })),
        )
            .into_response()
    }
}

/// Spawn the periodic bucket eviction sweep for a set of limiters.
pub fn spawn_cleanup_task(
    limiters: Vec<Arc<EndpointRateLimiter>>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let evicted: usize = limiters.iter().map(|l| l.cleanup()).sum();
            if evicted > 0 {
                tracing::debug!(evicted = evicted, "Evicted idle rate-limit buckets");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limit(per_minute: u32, burst: u32) -> EndpointLimit {
        EndpointLimit {
            requests_per_minute: per_minute,
            burst,
        }
    }

    #[test]
    fn burst_is_enforced_per_key() {
        let limiter = EndpointRateLimiter::new(limit(60, 3), true);

        for _ in 0..3 {
            assert!(limiter.allow("team:a"));
        }
        assert!(!limiter.allow("team:a"));

        // A different key has its own bucket.
        assert!(limiter.allow("team:b"));
    }

    #[test]
    fn disabled_limiter_always_allows() {
        let limiter = EndpointRateLimiter::new(limit(60, 1), false);
        for _ in 0..100 {
            assert!(limiter.allow("team:a"));
        }
        assert_eq!(limiter.bucket_count(), 0);
    }

    #[test]
    fn method_restriction() {
        let limiter = EndpointRateLimiter::for_methods(limit(60, 1), true, &[Method::DELETE]);
        assert!(limiter.applies_to(&Method::DELETE));
        assert!(!limiter.applies_to(&Method::GET));
    }

    #[test]
    fn cleanup_evicts_only_stale_buckets() {
        let limiter = EndpointRateLimiter::new(limit(60, 5), true);
        limiter.allow("team:a");
        assert_eq!(limiter.bucket_count(), 1);

        // Nothing is older than the TTL yet.
        assert_eq!(limiter.cleanup(), 0);
        assert_eq!(limiter.bucket_count(), 1);
    }
}
