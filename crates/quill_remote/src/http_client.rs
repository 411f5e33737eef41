//! HTTP client used by the remote store.

use std::time::Duration;

use thiserror::Error;

/// Error type for building a remote client or store.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Failed to build the underlying HTTP client.
    #[error("Failed to build HTTP client: {0}")]
    Build(#[from] reqwest::Error),

    /// Base URL could not be parsed or cannot carry paths.
    #[error("Invalid base URL `{url}`: {reason}")]
    InvalidBaseUrl { url: String, reason: String },
}

/// Default timeout for HTTP requests.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default `User-Agent` header.
pub const DEFAULT_USER_AGENT: &str = concat!("quill/", env!("CARGO_PKG_VERSION"));

/// Thin wrapper around a configured [`reqwest::Client`].
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: reqwest::Client,
    timeout: Duration,
}

/// Builder for [`HttpClient`].
#[derive(Debug)]
pub struct HttpClientBuilder {
    timeout: Duration,
    user_agent: String,
}

impl HttpClient {
    /// Create a new builder for HttpClient.
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder {
            timeout: DEFAULT_TIMEOUT,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn inner(&self) -> &reqwest::Client {
        &self.inner
    }
}

impl HttpClientBuilder {
    /// Set timeout for HTTP requests.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the `User-Agent` header sent with every request.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Build the HttpClient.
    pub fn build(self) -> Result<HttpClient, ClientError> {
        let inner = reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(self.user_agent)
            .build()?;
        Ok(HttpClient {
            inner,
            timeout: self.timeout,
        })
    }
}
