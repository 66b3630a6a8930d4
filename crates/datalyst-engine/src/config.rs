//! Engine configuration: every layer's tuning in one deserializable tree.

use serde::{Deserialize, Serialize};

use datalyst_gateway::GatewayConfig;
use datalyst_sandbox::SandboxConfig;
use datalyst_session::SessionConfig;
use datalyst_stream::StreamConfig;

use crate::error::EngineError;
use crate::machine::RetryPolicy;

/// Event stream section of the engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Seconds a closed run's buffer survives after its last subscriber
    pub retention_secs: u64,
    /// Upper bound on retained closed runs
    pub max_closed_runs: u64,
}

impl StreamSettings {
    /// Build the stream crate's config from this section
    #[must_use]
    pub fn to_stream_config(&self) -> StreamConfig {
        StreamConfig::new()
            .with_retention(std::time::Duration::from_secs(self.retention_secs))
            .with_max_closed_runs(self.max_closed_runs)
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            retention_secs: 300,
            max_closed_runs: 1_024,
        }
    }
}

/// Full engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Retry bounds for the step and chart loops
    pub retry: RetryPolicy,
    /// Completion gateway tuning
    pub gateway: GatewayConfig,
    /// Session store tuning
    pub session: SessionConfig,
    /// Interpreter sandbox tuning
    pub sandbox: SandboxConfig,
    /// Event stream tuning
    pub stream: StreamSettings,
}

impl EngineConfig {
    /// Default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document; absent keys keep their defaults
    pub fn from_toml_str(text: &str) -> Result<Self, EngineError> {
        toml::from_str(text).map_err(|err| EngineError::Config {
            reason: err.to_string(),
        })
    }
}
