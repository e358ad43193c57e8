//! Bearer credential acquisition.
//!
//! The token service is a collaborator: it takes a subject/secret pair and
//! returns an access token. [`HttpCredentialProvider`] caches the token and
//! re-authenticates shortly before it expires.

use crate::config::AuthConfig;
use crate::error::AuthError;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A bearer token and the instant it stops being valid.
#[derive(Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// True when the token expires within `skew` of `now`.
    pub fn is_expiring(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        let skew = ChronoDuration::from_std(skew).unwrap_or_else(|_| ChronoDuration::zero());
        self.expires_at - skew <= now
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Return a token valid for at least the provider's refresh skew.
    async fn token(&self) -> Result<AccessToken, AuthError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthRequest<'a> {
    subject: &'a str,
    secret: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthResponse {
    access_token: Option<String>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    expires_in: Option<u64>,
}

impl AuthResponse {
    fn into_token(self, now: DateTime<Utc>, default_ttl: Duration) -> Result<AccessToken, AuthError> {
        let token = self
            .access_token
            .filter(|token| !token.is_empty())
            .ok_or(AuthError::MissingToken)?;

        let expires_at = match (self.expires_at, self.expires_in) {
            (Some(at), _) => at,
            (None, Some(secs)) => now + ChronoDuration::seconds(secs as i64),
            (None, None) => {
                now + ChronoDuration::from_std(default_ttl)
                    .unwrap_or_else(|_| ChronoDuration::seconds(3000))
            }
        };

        Ok(AccessToken { token, expires_at })
    }
}

/// Posts `{subject, secret}` to the token endpoint and caches the result.
pub struct HttpCredentialProvider {
    http: reqwest::Client,
    config: AuthConfig,
    cached: Mutex<Option<AccessToken>>,
}

impl HttpCredentialProvider {
    pub fn new(config: AuthConfig, request_timeout: Duration) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("booking-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            config,
            cached: Mutex::new(None),
        })
    }

    async fn authenticate(&self) -> Result<AccessToken, AuthError> {
        log::info!("authenticating against {}", self.config.auth_url);

        let payload = AuthRequest {
            subject: &self.config.subject,
            secret: &self.config.secret,
        };

        let response = self
            .http
            .post(&self.config.auth_url)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            log::error!("authentication rejected with status {}", status);
            return Err(AuthError::Rejected { status, body });
        }

        let body = response.bytes().await?;
        let parsed: AuthResponse = serde_json::from_slice(&body)?;
        let token = parsed.into_token(Utc::now(), self.config.default_token_ttl)?;

        log::info!("authentication successful, token valid until {}", token.expires_at);
        Ok(token)
    }
}

#[async_trait]
impl CredentialProvider for HttpCredentialProvider {
    async fn token(&self) -> Result<AccessToken, AuthError> {
        let cached = self.cached.lock().clone();
        if let Some(token) = cached {
            if !token.is_expiring(Utc::now(), self.config.refresh_skew) {
                return Ok(token);
            }
        }

        // Concurrent refreshes are possible here; the last one wins the cache.
        let fresh = self.authenticate().await?;
        *self.cached.lock() = Some(fresh.clone());
        Ok(fresh)
    }
}
