//! The pluggable completion backend seam.
//!
//! The core never talks to a model provider directly; it hands a fully
//! rendered prompt to whatever implements [`CompletionBackend`] and gets raw
//! text back. Parsing, retries and timeouts live in the gateway.

use async_trait::async_trait;
use thiserror::Error;

/// One completion call: rendered prompts plus sampling temperature
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    /// Role framing for the call
    pub system: String,
    /// The rendered template
    pub user: String,
    /// Sampling temperature
    pub temperature: f32,
}

/// Failure reported by a completion backend
#[derive(Debug, Error)]
#[error("{message}")]
pub struct BackendError {
    /// Provider-reported reason
    pub message: String,
}

impl BackendError {
    /// Wrap a provider failure
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Opaque text-completion capability
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Produce raw completion text for the request
    async fn complete(&self, request: CompletionRequest) -> Result<String, BackendError>;
}
