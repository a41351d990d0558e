//! The seam between the transfer orchestrator and the transport

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use hashsync_types::Result;

/// Streamed body of one blob request
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Answer to a (possibly ranged) blob request
pub struct FetchResponse {
    /// Offset of the first byte in `body`
    ///
    /// Equal to the requested offset when the transport honoured the range,
    /// `0` when it sent the whole blob instead.
    pub start: u64,
    /// Remaining bytes of the blob
    pub body: ByteStream,
}

impl FetchResponse {
    /// Response starting at `start`
    pub fn new(start: u64, body: ByteStream) -> Self {
        Self { start, body }
    }
}

impl std::fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchResponse")
            .field("start", &self.start)
            .finish_non_exhaustive()
    }
}

/// Source of blob content
///
/// Implementations report transient failures (timeouts, resets, overloaded
/// servers) as [`hashsync_types::Error::Network`] or
/// [`hashsync_types::Error::Timeout`] so the orchestrator retries them, and
/// everything else with a non-retryable variant.
#[async_trait]
pub trait BlobFetcher: Send + Sync {
    /// Request the blob at `url`, starting at byte `offset`
    async fn fetch(&self, url: &str, offset: u64) -> Result<FetchResponse>;
}
