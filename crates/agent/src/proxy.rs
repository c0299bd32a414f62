//! Object-store access proxy for one volume.
//!
//! Runs on a plain TCP port inside the VM's network namespace. Every
//! request is checked for prefix containment: the object name, taken from
//! the path (`/storage/v1/b/{bucket}/o/{object}`) or the `name`/`prefix`
//! query parameters, must start with `{volume_id}/`. Allowed requests are
//! forwarded to the object-store endpoint over TLS 1.2+ with a bearer token
//! injected. The filesystem tools inside the VM only ever see this proxy,
//! never a credential.

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use percent_encoding::percent_decode_str;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Default port the proxy listens on inside the sandbox netns.
pub const DEFAULT_PORT: u16 = 5017;

/// Ceiling for draining in-flight requests at shutdown.
pub const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

const DEFAULT_UPSTREAM: &str = "https://storage.googleapis.com";

/// Supplies the bearer token injected into forwarded requests.
#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
    async fn access_token(&self) -> std::io::Result<String>;
}

/// Token provider backed by the agent's token file, so a token relayed
/// through the shutdown endpoint takes effect immediately.
pub struct FileTokenProvider {
    path: PathBuf,
}

impl FileTokenProvider {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl TokenProvider for FileTokenProvider {
    async fn access_token(&self) -> std::io::Result<String> {
        let token = tokio::fs::read_to_string(&self.path).await?;
        Ok(token.trim().to_string())
    }
}

/// Proxy configuration.
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    /// Volume whose data prefix this proxy serves.
    pub volume_id: String,
    /// Bucket name, for allowing bucket-scoped requests.
    pub bucket: String,
    /// Upstream object-store endpoint.
    pub upstream: String,
}

impl ProxyConfig {
    pub fn new(volume_id: &str, bucket: &str) -> Self {
        Self {
            volume_id: volume_id.to_string(),
            bucket: bucket.to_string(),
            upstream: DEFAULT_UPSTREAM.to_string(),
        }
    }
}

struct ProxyState {
    config: ProxyConfig,
    tokens: Arc<dyn TokenProvider>,
    client: reqwest::Client,
    upstream_host: String,
}

/// The in-netns reverse proxy.
pub struct Proxy {
    state: Arc<ProxyState>,
}

impl Proxy {
    /// Create a proxy. Fails when the upstream URL is invalid.
    pub fn new(config: ProxyConfig, tokens: Arc<dyn TokenProvider>) -> anyhow::Result<Self> {
        let upstream_host = reqwest::Url::parse(&config.upstream)?
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("upstream URL has no host"))?
            .to_string();

        let client = reqwest::Client::builder()
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            state: Arc::new(ProxyState {
                config,
                tokens,
                client,
                upstream_host,
            }),
        })
    }

    /// The axum router handling every method and path.
    pub fn router(&self) -> Router {
        Router::new()
            .fallback(forward)
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown` resolves, then drain in-flight requests with
    /// a 5 second ceiling.
    pub async fn run<F>(&self, listener: tokio::net::TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tracing::info!(
            addr = %listener.local_addr()?,
            volume_id = %self.state.config.volume_id,
            bucket = %self.state.config.bucket,
            "Object-store proxy started"
        );

        let (drain_tx, drain_rx) = tokio::sync::oneshot::channel::<()>();
        let router = self.router();
        let mut server = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = drain_rx.await;
                })
                .await
        });

        tokio::select! {
            result = &mut server => return Ok(result??),
            () = shutdown => {}
        }

        let _ = drain_tx.send(());
        match tokio::time::timeout(SHUTDOWN_DRAIN, &mut server).await {
            Ok(result) => result??,
            Err(_) => {
                tracing::warn!("Proxy drain exceeded ceiling, aborting in-flight requests");
                server.abort();
            }
        }
        Ok(())
    }
}

async fn forward(State(state): State<Arc<ProxyState>>, req: Request<Body>) -> Response {
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();

    if !is_path_allowed(&state.config, &path, &query) {
        tracing::warn!(
            path = %path,
            volume_id = %state.config.volume_id,
            "Proxy rejected request outside volume prefix"
        );
        return (
            StatusCode::FORBIDDEN,
            "Forbidden: path not allowed for this volume",
        )
            .into_response();
    }

    let token = match state.tokens.access_token().await {
        Ok(token) => token,
        Err(e) => {
            tracing::error!(error = %e, "Proxy failed to load access token");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response();
        }
    };

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| path.clone());
    let url = format!("{}{}", state.config.upstream, path_and_query);

    let method = match reqwest::Method::from_bytes(req.method().as_str().as_bytes()) {
        Ok(method) => method,
        Err(_) => return StatusCode::METHOD_NOT_ALLOWED.into_response(),
    };

    let mut upstream_req = state.client.request(method, &url);
    for (name, value) in req.headers() {
        if name == axum::http::header::HOST || name == axum::http::header::AUTHORIZATION {
            continue;
        }
        upstream_req = upstream_req.header(name.as_str(), value.as_bytes());
    }
    upstream_req = upstream_req
        .header("Host", &state.upstream_host)
        .bearer_auth(token)
        .body(reqwest::Body::wrap_stream(
            req.into_body().into_data_stream(),
        ));

    let upstream_resp = match upstream_req.send().await {
        Ok(resp) => resp,
        Err(e) => {
            tracing::error!(error = %e, url = %url, "Proxy upstream request failed");
            return (StatusCode::BAD_GATEWAY, "Upstream unavailable").into_response();
        }
    };

    let status =
        StatusCode::from_u16(upstream_resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = Response::builder().status(status);
    if let Some(headers) = response.headers_mut() {
        for (name, value) in upstream_resp.headers() {
            if let (Ok(name), Ok(value)) = (
                axum::http::HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                headers.insert(name, value);
            }
        }
    }

    response
        .body(Body::from_stream(upstream_resp.bytes_stream()))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

/// Whether a request stays inside the volume's data prefix.
///
/// The object-store JSON API uses:
/// - `GET  /storage/v1/b/{bucket}/o/{object}?alt=media` (reads, deletes)
/// - `POST /upload/storage/v1/b/{bucket}/o?name={object}` (uploads)
/// - `GET  /storage/v1/b/{bucket}/o?prefix={prefix}` (listings)
///
/// Bucket-scoped requests with neither an object nor a prefix are allowed.
fn is_path_allowed(config: &ProxyConfig, path: &str, query: &str) -> bool {
    let volume_prefix = format!("{}/", config.volume_id);

    if !query.is_empty() {
        for pair in query.split('&') {
            let (key, value) = match pair.split_once('=') {
                Some((key, value)) => (key, value),
                None => continue,
            };
            if key != "name" && key != "prefix" {
                continue;
            }
            let decoded = percent_decode_str(&value.replace('+', " "))
                .decode_utf8_lossy()
                .into_owned();
            if decoded.is_empty() {
                continue;
            }
            return decoded.starts_with(&volume_prefix);
        }
    }

    if let Some((_, object)) = path.split_once("/o/") {
        let decoded = percent_decode_str(object).decode_utf8_lossy();
        return decoded.starts_with(&volume_prefix);
    }

    // Bucket-level operations without an object name.
    path.contains(&format!("/b/{}", config.bucket)) && !path.contains("/o/") && query.is_empty()
}
