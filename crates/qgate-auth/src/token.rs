//! Bearer token helpers and Azure AD client-credentials exchange.
//!
//! [`decode_expiry`] reads a JWT `exp` claim without validating the signature;
//! the backend validates the token, the gateway only needs its lifetime.
//!
//! [`CachingTokenIssuer`] keeps exchanged tokens until shortly before they
//! expire. Connection descriptors embed the token, so reusing it is what lets
//! repeated service-principal logins hit the same pooled sessions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{AuthError, AuthResult};

/// Exchanges a service-principal secret for an access token.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn exchange(&self, client_id: &str, secret: &str, tenant_id: &str) -> AuthResult<String>;
}

#[derive(Deserialize)]
struct ExpiryClaim {
    exp: i64,
}

/// Read the `exp` claim of a JWT.
pub fn decode_expiry(token: &str) -> AuthResult<DateTime<Utc>> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| AuthError::MalformedToken("expected three dot-separated segments".into()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| AuthError::MalformedToken(format!("payload is not base64url: {e}")))?;
    let claim: ExpiryClaim = serde_json::from_slice(&bytes)
        .map_err(|e| AuthError::MalformedToken(format!("missing exp claim: {e}")))?;
    DateTime::from_timestamp(claim.exp, 0)
        .ok_or_else(|| AuthError::MalformedToken(format!("exp {} out of range", claim.exp)))
}

// ── Azure AD ────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: Option<String>,
    error_description: Option<String>,
}

/// Client-credentials grant against `{authority}/{tenant}/oauth2/token`.
#[derive(Clone, Debug)]
pub struct AadTokenIssuer {
    client: reqwest::Client,
    authority: String,
    resource: String,
}

impl AadTokenIssuer {
    pub fn new(authority: &str, resource: &str) -> AuthResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AuthError::TokenExchange(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            authority: authority.trim_end_matches('/').to_string(),
            resource: resource.to_string(),
        })
    }

    fn token_url(&self, tenant_id: &str) -> String {
        format!("{}/{}/oauth2/token", self.authority, tenant_id)
    }
}

#[async_trait]
impl TokenIssuer for AadTokenIssuer {
    async fn exchange(&self, client_id: &str, secret: &str, tenant_id: &str) -> AuthResult<String> {
        let url = self.token_url(tenant_id);
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", client_id),
            ("client_secret", secret),
            ("resource", self.resource.as_str()),
        ];

        let response = self
            .client
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(|e| AuthError::TokenExchange(format!("request to {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response
                .json::<TokenErrorResponse>()
                .await
                .ok()
                .and_then(|body| body.error_description.or(body.error))
                .unwrap_or_else(|| "no error description".to_string());
            warn!(%status, client_id, tenant_id, "token exchange rejected");
            return Err(AuthError::TokenExchange(format!("{status}: {detail}")));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::TokenExchange(format!("unexpected token response: {e}")))?;
        debug!(client_id, tenant_id, "token exchange succeeded");
        Ok(body.access_token)
    }
}

// ── Caching ─────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct CacheKey {
    tenant_id: String,
    client_id: String,
    secret_digest: String,
}

impl CacheKey {
    fn new(client_id: &str, secret: &str, tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            client_id: client_id.to_string(),
            secret_digest: hex::encode(Sha256::digest(secret.as_bytes())),
        }
    }
}

struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Wraps another issuer and reuses its tokens until `refresh_margin` before expiry.
///
/// Tokens whose expiry cannot be decoded are not cached.
pub struct CachingTokenIssuer {
    inner: Arc<dyn TokenIssuer>,
    refresh_margin: chrono::Duration,
    cache: Mutex<HashMap<CacheKey, CachedToken>>,
}

impl CachingTokenIssuer {
    pub fn new(inner: Arc<dyn TokenIssuer>) -> Self {
        Self::with_refresh_margin(inner, Duration::from_secs(60))
    }

    pub fn with_refresh_margin(inner: Arc<dyn TokenIssuer>, refresh_margin: Duration) -> Self {
        Self {
            inner,
            refresh_margin: chrono::Duration::from_std(refresh_margin)
                .unwrap_or_else(|_| chrono::Duration::seconds(60)),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Number of tokens currently held.
    pub async fn len(&self) -> usize {
        self.cache.lock().await.len()
    }
}

#[async_trait]
impl TokenIssuer for CachingTokenIssuer {
    async fn exchange(&self, client_id: &str, secret: &str, tenant_id: &str) -> AuthResult<String> {
        let key = CacheKey::new(client_id, secret, tenant_id);
        let now = Utc::now();

        {
            let mut cache = self.cache.lock().await;
            match cache.get(&key) {
                Some(cached) if now < cached.expires_at - self.refresh_margin => {
                    debug!(client_id, tenant_id, "reusing cached token");
                    return Ok(cached.token.clone());
                }
                Some(_) => {
                    cache.remove(&key);
                }
                None => {}
            }
        }

        let token = self.inner.exchange(client_id, secret, tenant_id).await?;
        match decode_expiry(&token) {
            Ok(expires_at) => {
                self.cache.lock().await.insert(
                    key,
                    CachedToken {
                        token: token.clone(),
                        expires_at,
                    },
                );
            }
            Err(e) => debug!(client_id, error = %e, "not caching token without readable expiry"),
        }
        Ok(token)
    }
}

/// Build an unsigned JWT carrying `exp`, for tests.
#[cfg(test)]
pub(crate) fn unsigned_jwt(exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{exp},"upn":"alice@contoso.com"}}"#));
    format!("{header}.{payload}.sig")
}
