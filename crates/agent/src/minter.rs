//! Downscoped object-store token minting.
//!
//! Before a sandbox boots, the orchestrator mints a short-lived token whose
//! effective scope is exactly the two prefixes of one volume, and ships it
//! into the VM. The downscoping happens through an OAuth2 token exchange
//! with a credential access boundary attached.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;

/// Minimum remaining lifetime a minted token must carry.
pub const MIN_TOKEN_LIFETIME: Duration = Duration::from_secs(600);

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const STS_TOKEN_URL: &str = "https://sts.googleapis.com/v1/token";
const IAM_CREDENTIALS_BASE: &str = "https://iamcredentials.googleapis.com";

const STORAGE_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.full_control";

/// Token minting errors.
#[derive(Debug, Error)]
pub enum MintError {
    /// The metadata server, IAM credentials API or STS endpoint failed.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The exchange endpoint refused the access boundary.
    #[error("scope rejected: {0}")]
    ScopeRejected(String),

    /// The minted token expires too soon to be shipped into a VM.
    #[error("token lifetime {expires_in}s is below the {}s minimum", MIN_TOKEN_LIFETIME.as_secs())]
    TokenTooShortLived { expires_in: i64 },

    #[error("unexpected response: {0}")]
    Decode(String),
}

/// A downscoped bearer token with its absolute expiry.
#[derive(Clone, Debug)]
pub struct DownscopedToken {
    pub access_token: String,
    pub expires_in: i64,
    pub expires_at: OffsetDateTime,
}

/// Mints tokens scoped to one volume's prefixes in one bucket.
///
/// The caller is responsible for re-minting before `expires_at` minus a
/// safety margin.
pub struct TokenMinter {
    bucket: String,
    impersonate_service_account: Option<String>,
    http: reqwest::Client,
    metadata_token_url: String,
    sts_token_url: String,
    iam_credentials_base: String,
}

impl TokenMinter {
    /// Create a minter for the given bucket. When `impersonate` is set, the
    /// base credential is first exchanged for an access token of that
    /// service account.
    pub fn new(bucket: &str, impersonate: Option<String>) -> Self {
        Self {
            bucket: bucket.to_string(),
            impersonate_service_account: impersonate,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            metadata_token_url: METADATA_TOKEN_URL.to_string(),
            sts_token_url: STS_TOKEN_URL.to_string(),
            iam_credentials_base: IAM_CREDENTIALS_BASE.to_string(),
        }
    }

    /// Override the upstream endpoints (tests, private STS deployments).
    pub fn with_endpoints(
        mut self,
        metadata_token_url: String,
        sts_token_url: String,
        iam_credentials_base: String,
    ) -> Self {
        self.metadata_token_url = metadata_token_url;
        self.sts_token_url = sts_token_url;
        self.iam_credentials_base = iam_credentials_base;
        self
    }

    /// Mint a token whose scope is the `{vol}/` and `{vol}-meta/` prefixes
    /// of the configured bucket.
    pub async fn mint(&self, volume_id: &str) -> Result<DownscopedToken, MintError> {
        let base_token = self.base_token().await?;
        let boundary = access_boundary_for_volume(&self.bucket, volume_id);
        self.exchange(&base_token, &boundary).await
    }

    async fn base_token(&self) -> Result<String, MintError> {
        match &self.impersonate_service_account {
            Some(account) => self.impersonated_token(account).await,
            None => self.metadata_token().await,
        }
    }

    async fn metadata_token(&self) -> Result<String, MintError> {
        #[derive(Deserialize)]
        struct MetadataToken {
            access_token: String,
        }

        let response = self
            .http
            .get(&self.metadata_token_url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| MintError::UpstreamUnavailable(format!("metadata server: {e}")))?;

        if !response.status().is_success() {
            return Err(MintError::UpstreamUnavailable(format!(
                "metadata server returned {}",
                response.status()
            )));
        }

        let token: MetadataToken = response
            .json()
            .await
            .map_err(|e| MintError::Decode(e.to_string()))?;
        Ok(token.access_token)
    }

    /// Requires `iam.serviceAccountTokenCreator` on the target account.
    async fn impersonated_token(&self, account: &str) -> Result<String, MintError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct GenerateAccessTokenRequest<'a> {
            scope: [&'a str; 1],
            lifetime: &'a str,
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct GenerateAccessTokenResponse {
            access_token: String,
        }

        let caller_token = self.metadata_token().await?;
        let url = format!(
            "{}/v1/projects/-/serviceAccounts/{}:generateAccessToken",
            self.iam_credentials_base, account
        );

        let response = self
            .http
            .post(&url)
            .bearer_auth(caller_token)
            .json(&GenerateAccessTokenRequest {
                scope: [STORAGE_SCOPE],
                lifetime: "3600s",
            })
            .send()
            .await
            .map_err(|e| MintError::UpstreamUnavailable(format!("impersonation: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(MintError::UpstreamUnavailable(format!(
                "impersonation failed with {status}: {body}"
            )));
        }

        let token: GenerateAccessTokenResponse = response
            .json()
            .await
            .map_err(|e| MintError::Decode(e.to_string()))?;
        Ok(token.access_token)
    }

    async fn exchange(
        &self,
        base_token: &str,
        boundary: &CredentialAccessBoundary,
    ) -> Result<DownscopedToken, MintError> {
        #[derive(Deserialize)]
        struct StsResponse {
            access_token: String,
            expires_in: i64,
        }

        let options = serde_json::to_string(boundary).map_err(|e| MintError::Decode(e.to_string()))?;
        let form = [
            (
                "grant_type",
                "urn:ietf:params:oauth:grant-type:token-exchange",
            ),
            (
                "subject_token_type",
                "urn:ietf:params:oauth:token-type:access_token",
            ),
            (
                "requested_token_type",
                "urn:ietf:params:oauth:token-type:access_token",
            ),
            ("subject_token", base_token),
            ("options", options.as_str()),
        ];

        let response = self
            .http
            .post(&self.sts_token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| MintError::UpstreamUnavailable(format!("sts: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status.is_client_error() {
                return Err(MintError::ScopeRejected(format!("{status}: {body}")));
            }
            return Err(MintError::UpstreamUnavailable(format!("{status}: {body}")));
        }

        let sts: StsResponse = response
            .json()
            .await
            .map_err(|e| MintError::Decode(e.to_string()))?;

        if sts.expires_in < MIN_TOKEN_LIFETIME.as_secs() as i64 {
            return Err(MintError::TokenTooShortLived {
                expires_in: sts.expires_in,
            });
        }

        Ok(DownscopedToken {
            access_token: sts.access_token,
            expires_in: sts.expires_in,
            expires_at: OffsetDateTime::now_utc() + Duration::from_secs(sts.expires_in as u64),
        })
    }
}

/// The access boundary scoping a token to one volume's prefixes.
pub fn access_boundary_for_volume(bucket: &str, volume_id: &str) -> CredentialAccessBoundary {
    let bucket_resource = format!("//storage.googleapis.com/projects/_/buckets/{bucket}");
    let expression = format!(
        "resource.name.startsWith('projects/_/buckets/{bucket}/objects/{volume_id}/') || \
         resource.name.startsWith('projects/_/buckets/{bucket}/objects/{volume_id}-meta/') || \
         api.getAttribute('storage.googleapis.com/objectListPrefix', '').startsWith('{volume_id}/') || \
         api.getAttribute('storage.googleapis.com/objectListPrefix', '').startsWith('{volume_id}-meta/')"
    );

    CredentialAccessBoundary {
        access_boundary: AccessBoundary {
            access_boundary_rules: vec![AccessBoundaryRule {
                available_permissions: vec!["inRole:roles/storage.objectAdmin".to_string()],
                available_resource: bucket_resource,
                availability_condition: Some(AvailabilityCondition {
                    title: Some("Volume isolation".to_string()),
                    expression,
                }),
            }],
        },
    }
}

/// Scope restrictions attached to a token exchange.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialAccessBoundary {
    pub access_boundary: AccessBoundary,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessBoundary {
    pub access_boundary_rules: Vec<AccessBoundaryRule>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessBoundaryRule {
    pub available_permissions: Vec<String>,
    pub available_resource: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub availability_condition: Option<AvailabilityCondition>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityCondition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub expression: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::Form;
    use axum::routing::{get, post};
    use std::collections::HashMap;

    #[test]
    fn boundary_restricts_both_prefixes() {
        let boundary = access_boundary_for_volume("sandbox-vols", "vol_abc");
        let json = serde_json::to_value(&boundary).unwrap();

        let rule = &json["accessBoundary"]["accessBoundaryRules"][0];
        assert_eq!(
            rule["availablePermissions"][0],
            "inRole:roles/storage.objectAdmin"
        );
        assert_eq!(
            rule["availableResource"],
            "//storage.googleapis.com/projects/_/buckets/sandbox-vols"
        );

        let expr = rule["availabilityCondition"]["expression"].as_str().unwrap();
        assert!(expr.contains("objects/vol_abc/'"));
        assert!(expr.contains("objects/vol_abc-meta/'"));
        assert!(expr.contains("objectListPrefix"));
        assert!(expr.contains(".startsWith('vol_abc/')"));
        assert!(expr.contains(".startsWith('vol_abc-meta/')"));
    }

    /// Local stand-ins for the metadata server and STS endpoint.
    async fn fake_upstreams(expires_in: i64) -> (String, String) {
        let app = Router::new()
            .route(
                "/computeMetadata/v1/instance/service-accounts/default/token",
                get(|| async {
                    axum::Json(serde_json::json!({
                        "access_token": "base-token",
                        "expires_in": 3600,
                        "token_type": "Bearer",
                    }))
                }),
            )
            .route(
                "/v1/token",
                post(move |Form(form): Form<HashMap<String, String>>| async move {
                    // Refuse exchanges without a boundary, like the real
                    // endpoint.
                    let options = form.get("options").cloned().unwrap_or_default();
                    if !options.contains("accessBoundaryRules") {
                        return (
                            axum::http::StatusCode::BAD_REQUEST,
                            axum::Json(serde_json::json!({"error": "invalid_request"})),
                        );
                    }
                    (
                        axum::http::StatusCode::OK,
                        axum::Json(serde_json::json!({
                            "access_token": "downscoped-token",
                            "issued_token_type": "urn:ietf:params:oauth:token-type:access_token",
                            "token_type": "Bearer",
                            "expires_in": expires_in,
                        })),
                    )
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (
            format!("http://{addr}/computeMetadata/v1/instance/service-accounts/default/token"),
            format!("http://{addr}/v1/token"),
        )
    }

    #[tokio::test]
    async fn mint_exchanges_base_token() {
        let (metadata_url, sts_url) = fake_upstreams(3600).await;
        let minter = TokenMinter::new("sandbox-vols", None).with_endpoints(
            metadata_url,
            sts_url,
            "http://unused".to_string(),
        );

        let token = minter.mint("vol_abc").await.unwrap();
        assert_eq!(token.access_token, "downscoped-token");
        assert_eq!(token.expires_in, 3600);
        assert!(token.expires_at > OffsetDateTime::now_utc());
    }

    #[tokio::test]
    async fn mint_rejects_short_lived_tokens() {
        let (metadata_url, sts_url) = fake_upstreams(120).await;
        let minter = TokenMinter::new("sandbox-vols", None).with_endpoints(
            metadata_url,
            sts_url,
            "http://unused".to_string(),
        );

        assert!(matches!(
            minter.mint("vol_abc").await,
            Err(MintError::TokenTooShortLived { expires_in: 120 })
        ));
    }

    #[tokio::test]
    async fn mint_reports_unreachable_metadata_server() {
        let minter = TokenMinter::new("sandbox-vols", None).with_endpoints(
            // Nothing listens here.
            "http://127.0.0.1:1/token".to_string(),
            "http://127.0.0.1:1/v1/token".to_string(),
            "http://127.0.0.1:1".to_string(),
        );

        assert!(matches!(
            minter.mint("vol_abc").await,
            Err(MintError::UpstreamUnavailable(_))
        ));
    }
}
