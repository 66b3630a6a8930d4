//! Gateway error types.

use std::time::Duration;

use crate::templates::Template;

/// Errors surfaced by gateway completions
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The backend itself failed (transport, auth, provider outage)
    #[error("completion backend failed: {0}")]
    Backend(String),

    /// The completion did not return within the configured budget
    #[error("completion timed out after {timeout:?}")]
    Timeout {
        /// Budget that elapsed
        timeout: Duration,
    },

    /// The model replied, retried once, and still failed to parse
    #[error("malformed {template} completion: {reason}")]
    Malformed {
        /// Template whose output could not be parsed
        template: Template,
        /// What was wrong with the reply
        reason: String,
    },
}

impl GatewayError {
    /// True when the reply parsed but violated the expected shape
    #[must_use]
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed { .. })
    }

    /// True when the budget elapsed before a reply arrived
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
