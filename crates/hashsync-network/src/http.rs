//! HTTP blob fetcher with range resume

use crate::fetcher::{BlobFetcher, FetchResponse};
use async_trait::async_trait;
use futures::StreamExt;
use hashsync_types::{Error, Result, TimeoutConfig};
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use tracing::debug;

/// [`BlobFetcher`] over HTTP(S)
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    read_timeout_secs: u64,
}

impl HttpFetcher {
    /// Build a client with the given timeouts and user agent
    pub fn new(timeouts: &TimeoutConfig, user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeouts.connect())
            .read_timeout(timeouts.read())
            .user_agent(user_agent)
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            read_timeout_secs: timeouts.read_secs,
        })
    }

    /// Fetch a small text document, such as a manifest
    pub async fn fetch_text(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| classify(&e, self.read_timeout_secs))?;
        let response = check_status(url, response)?;
        response
            .text()
            .await
            .map_err(|e| classify(&e, self.read_timeout_secs))
    }

    async fn send(&self, url: &str, offset: u64) -> Result<reqwest::Response> {
        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }
        request
            .send()
            .await
            .map_err(|e| classify(&e, self.read_timeout_secs))
    }
}

#[async_trait]
impl BlobFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, offset: u64) -> Result<FetchResponse> {
        let mut response = self.send(url, offset).await?;

        // The partial blob is longer than what the server has: start over.
        if offset > 0 && response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            debug!("Range {}- not satisfiable for {}, restarting", offset, url);
            response = self.send(url, 0).await?;
        }

        let response = check_status(url, response)?;
        let start = if response.status() == StatusCode::PARTIAL_CONTENT {
            response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|value| value.to_str().ok())
                .and_then(content_range_start)
                .ok_or_else(|| {
                    Error::network(format!("Missing or malformed Content-Range from {}", url))
                })?
        } else {
            0
        };

        if start != offset {
            debug!("Server answered {} from byte {} instead of {}", url, start, offset);
        }

        let seconds = self.read_timeout_secs;
        let body = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| classify(&e, seconds)))
            .boxed();

        Ok(FetchResponse::new(start, body))
    }
}

fn check_status(url: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if is_transient_status(status) {
        Err(Error::network(format!("{} -> HTTP {}", url, status)))
    } else {
        Err(Error::RemoteRejected {
            url: url.to_string(),
            status: status.as_u16(),
        })
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

fn classify(error: &reqwest::Error, read_timeout_secs: u64) -> Error {
    if error.is_timeout() {
        Error::Timeout {
            seconds: read_timeout_secs,
        }
    } else if error.is_builder() {
        Error::manifest(format!("Invalid download URL: {}", error))
    } else {
        Error::network(error.to_string())
    }
}

/// First byte position of a `Content-Range: bytes START-END/TOTAL` value
fn content_range_start(value: &str) -> Option<u64> {
    let range = value.trim().strip_prefix("bytes")?.trim_start();
    let (start, _) = range.split_once('-')?;
    start.trim().parse().ok()
}
