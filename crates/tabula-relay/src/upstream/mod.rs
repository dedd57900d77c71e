//! Inference service access.
//!
//! The relay only needs two things from the service: open a streaming
//! generation for a prompt, and tell whether it is reachable. Both sit behind
//! the [`Upstream`] trait so the relay can be driven by a scripted source in
//! tests.

mod ollama;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

pub use ollama::{GenerateRequest, OllamaClient};

/// Raw body of a streaming generation. Dropping it aborts the request.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, UpstreamError>> + Send>>;

/// A text-generation service producing an NDJSON token stream.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Start a streaming generation. Resolves once the service has answered
    /// with a success status.
    async fn open(&self, prompt: String) -> Result<ByteStream, UpstreamError>;

    /// Cheap reachability check.
    async fn health(&self) -> Result<(), UpstreamError>;
}

/// Upstream errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    #[error("Upstream unreachable: {0}")]
    Connect(String),

    #[error("Upstream returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Upstream transport error: {0}")]
    Transport(String),

    #[error("Upstream did not respond within {0:?}")]
    Timeout(Duration),
}
