//! Single-attempt HTTP fetches against the remote archive.
//!
//! Retrying is deliberately not done here; callers wrap fetches in a
//! [`crate::RetryPolicy`] so the policy can be tuned and tested on its own.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use argosync_core::RemoteError;
use bytes::Bytes;
use reqwest::StatusCode;
use tokio::sync::Semaphore;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Per-request bound, counted from when a connection slot is held.
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// The remote rejects accounts holding more connections than this.
    pub max_connections: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            max_connections: 4,
        }
    }
}

/// Map a non-success status to the remote error taxonomy.
pub fn classify_status(status: StatusCode, url: &str) -> RemoteError {
    let path = url.to_string();
    let detail = format!("http status {}", status.as_u16());
    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
            RemoteError::Busy { path, detail }
        }
        StatusCode::NOT_FOUND | StatusCode::GONE => RemoteError::NotFound { path },
        s if s.is_server_error() || s == StatusCode::REQUEST_TIMEOUT => {
            RemoteError::Unavailable { path, detail }
        }
        _ => RemoteError::Protocol { path, detail },
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error, url: &str) -> RemoteError {
    let path = url.to_string();
    let detail = err.to_string();
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RemoteError::Unavailable { path, detail }
    } else {
        RemoteError::Protocol { path, detail }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    connections: Arc<Semaphore>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.max_connections.max(1));

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            connections: Arc::new(Semaphore::new(config.max_connections.max(1))),
        })
    }

    /// Fetch `url` once, holding one of the remote's connection slots for the
    /// duration of the request and body download. Waiting for the slot is not
    /// bounded by the client timeout.
    pub async fn get_bytes(&self, url: &str) -> Result<Bytes, RemoteError> {
        let _slot = self
            .connections
            .acquire()
            .await
            .map_err(|_| RemoteError::Unavailable {
                path: url.to_string(),
                detail: "connection pool closed".to_string(),
            })?;

        debug!(url, "http get");
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e, url))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(classify_status(status, url));
        }
        resp.bytes()
            .await
            .map_err(|e| classify_reqwest_error(&e, url))
    }

    pub async fn get_text(&self, url: &str) -> Result<String, RemoteError> {
        let bytes = self.get_bytes(url).await?;
        String::from_utf8(bytes.to_vec()).map_err(|e| RemoteError::Protocol {
            path: url.to_string(),
            detail: format!("response is not utf-8: {e}"),
        })
    }
}
