//! Connection settings for the REST remote.

use std::time::Duration;

use reqwest::Url;

use crate::HttpError;

/// Where the posts server listens and how hard to try reaching it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRemoteConfig {
    /// Server root; posts live under `<base_url>/posts`.
    pub base_url: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Retries after the first attempt, for transient failures only.
    pub max_retries: u32,
    /// Wait before the first retry. Later waits grow exponentially.
    pub initial_backoff: Duration,
    /// Upper bound for a single wait between retries.
    pub max_backoff: Duration,
}

impl Default for HttpRemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3500".to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl HttpRemoteConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_timeouts(mut self, connect: Duration, request: Duration) -> Self {
        self.connect_timeout = connect;
        self.request_timeout = request;
        self
    }

    #[must_use]
    pub fn with_retries(mut self, max_retries: u32, initial_backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.initial_backoff = initial_backoff;
        self
    }

    /// Parse the base URL, normalized to end in a slash so joins append.
    pub fn parsed_base_url(&self) -> Result<Url, HttpError> {
        let mut raw = self.base_url.trim().to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let url = Url::parse(&raw).map_err(|e| HttpError::InvalidUrl(format!("{}: {e}", self.base_url)))?;
        if url.cannot_be_a_base() || !matches!(url.scheme(), "http" | "https") {
            return Err(HttpError::InvalidUrl(self.base_url.clone()));
        }
        Ok(url)
    }
}
