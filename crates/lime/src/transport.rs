//! The one primitive the session core needs from the outside world: post a
//! binary body to the key server and get the answer back.
//!
//! Implementations know nothing about the protocol. The embedding
//! application wires its HTTP stack here; tests plug an in-process server.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X3dhResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl X3dhResponse {
    pub fn ok(body: Vec<u8>) -> Self {
        Self { status: 200, body }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Request to {url} failed: {reason}")]
    Failed { url: String, reason: String },

    #[error("No answer from {url} within {secs}s")]
    Timeout { url: String, secs: u64 },
}

#[async_trait]
pub trait X3dhTransport: Send + Sync {
    /// POST `body` to `url` on behalf of local device `from`.
    async fn post(
        &self,
        url: &str,
        from: &str,
        body: Vec<u8>,
    ) -> Result<X3dhResponse, TransportError>;
}

/// Run one request, failing it when the transport takes longer than `timeout`.
pub(crate) async fn post_with_timeout(
    transport: &dyn X3dhTransport,
    url: &str,
    from: &str,
    body: Vec<u8>,
    timeout: Duration,
) -> Result<X3dhResponse, TransportError> {
    match tokio::time::timeout(timeout, transport.post(url, from, body)).await {
        Ok(res) => res,
        Err(_) => Err(TransportError::Timeout { url: url.to_owned(), secs: timeout.as_secs() }),
    }
}
