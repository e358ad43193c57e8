//! Authenticated access to the remote REST API.

use crate::auth::CredentialProvider;
use crate::config::HttpConfig;
use crate::error::FetchError;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// GET/POST against the remote API. Any non-2xx status is a [`FetchError`].
#[async_trait]
pub trait ResourceClient: Send + Sync {
    async fn get(&self, url: &str) -> Result<Value, FetchError>;

    async fn post(&self, url: &str, payload: &Value) -> Result<Value, FetchError>;
}

/// `reqwest`-backed client attaching a bearer token to every request.
///
/// A single semaphore bounds the number of requests in flight across the
/// whole run, regardless of how many records are being enriched at once.
pub struct HttpResourceClient {
    http: reqwest::Client,
    credentials: Arc<dyn CredentialProvider>,
    permits: Arc<Semaphore>,
    request_timeout: Duration,
}

impl HttpResourceClient {
    pub fn new(
        config: &HttpConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(concat!("booking-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            credentials,
            permits: Arc::new(Semaphore::new(config.max_in_flight)),
            request_timeout: config.request_timeout,
        })
    }

    async fn send(
        &self,
        url: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<Value, FetchError> {
        let token = self.credentials.token().await?;

        // Acquisition only fails once the semaphore is closed on shutdown.
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| FetchError::Cancelled {
                url: url.to_string(),
            })?;

        log::debug!("requesting {}", url);
        let response = request
            .bearer_auth(&token.token)
            .send()
            .await
            .map_err(|err| self.classify(url, err))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::status(url, status, body));
        }

        let body = response.bytes().await.map_err(|err| self.classify(url, err))?;
        serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
            url: url.to_string(),
            source,
        })
    }

    /// Refuse new requests; requests already holding a permit finish normally.
    pub fn close(&self) {
        self.permits.close();
    }

    fn classify(&self, url: &str, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
                after: self.request_timeout,
            }
        } else {
            FetchError::Http {
                url: url.to_string(),
                source: err,
            }
        }
    }
}

#[async_trait]
impl ResourceClient for HttpResourceClient {
    async fn get(&self, url: &str) -> Result<Value, FetchError> {
        self.send(url, self.http.get(url)).await
    }

    async fn post(&self, url: &str, payload: &Value) -> Result<Value, FetchError> {
        self.send(url, self.http.post(url).json(payload)).await
    }
}
