//! LLM gateway for the analysis workflow.
//!
//! Wraps a pluggable [`CompletionBackend`] with:
//!
//! - Five built-in prompt [`templates`], one per workflow phase
//! - Markdown-fence stripping and strict JSON parsing
//! - Exactly one format-reminder retry per call before giving up
//! - A completion timeout applied uniformly to every call
//!
//! Every public method is typed: callers hand in a context struct and get the
//! parsed result back, never raw model text.
//!
//! # Example
//!
//! ```rust,ignore
//! use datalyst_gateway::{Gateway, GatewayConfig, PlanContext};
//!
//! let gateway = Gateway::new(backend, GatewayConfig::default());
//! let steps = gateway
//!     .plan(&PlanContext {
//!         query: "average fuel use per driver".into(),
//!         history: Vec::new(),
//!         profile: profile_json,
//!     })
//!     .await?;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod backend;
pub mod error;
pub mod extract;
pub mod templates;
pub mod types;

pub use backend::{BackendError, CompletionBackend, CompletionRequest};
pub use error::GatewayError;
pub use templates::Template;
pub use types::{
    ChartContext, CodeContext, DiagnosisContext, ErrorDiagnosis, GeneratedCode, HistoryTurn,
    PlanContext, SummaryContext,
};

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::extract::parse_json;
use crate::templates::STRICT_FORMAT_REMINDER;
use crate::types::ChartCode;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Gateway tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Sampling temperature for every completion
    pub temperature: f32,
    /// Per-completion budget in seconds
    pub completion_timeout_secs: u64,
    /// How many prior exchanges the planner prompt carries
    pub history_window: usize,
    /// Per-result character cap before prompt embedding
    pub max_result_chars: usize,
}

impl GatewayConfig {
    /// Default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With a custom sampling temperature
    #[inline]
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// With a custom per-completion budget
    #[inline]
    #[must_use]
    pub fn with_completion_timeout_secs(mut self, secs: u64) -> Self {
        self.completion_timeout_secs = secs;
        self
    }

    /// With a custom history window
    #[inline]
    #[must_use]
    pub fn with_history_window(mut self, window: usize) -> Self {
        self.history_window = window;
        self
    }

    /// With a custom per-result character cap
    #[inline]
    #[must_use]
    pub fn with_max_result_chars(mut self, chars: usize) -> Self {
        self.max_result_chars = chars;
        self
    }

    /// Per-completion budget as a [`Duration`]
    #[inline]
    #[must_use]
    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(self.completion_timeout_secs)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            completion_timeout_secs: 60,
            history_window: 6,
            max_result_chars: 2_000,
        }
    }
}

/// Typed front door to the completion backend
pub struct Gateway {
    backend: Arc<dyn CompletionBackend>,
    config: GatewayConfig,
}

impl Gateway {
    /// Build a gateway over the given backend
    #[must_use]
    pub fn new(backend: Arc<dyn CompletionBackend>, config: GatewayConfig) -> Self {
        Self { backend, config }
    }

    /// Current configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Break a question into ordered, executable plan steps.
    ///
    /// An empty or non-array reply counts as malformed and consumes the
    /// single retry before the call fails.
    pub async fn plan(&self, ctx: &PlanContext) -> Result<Vec<String>, GatewayError> {
        let user = templates::render_planner(ctx, &self.config);
        self.complete_parsed(Template::Planner, user, |text| {
            let raw: Vec<String> = parse_json(text)?;
            let steps: Vec<String> = raw
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if steps.is_empty() {
                return Err("plan contained no steps".to_string());
            }
            Ok(steps)
        })
        .await
    }

    /// Produce one `{thought, code}` pass for the current step
    pub async fn generate_code(&self, ctx: &CodeContext) -> Result<GeneratedCode, GatewayError> {
        let user = templates::render_code_generator(ctx, &self.config);
        self.complete_parsed(Template::CodeGenerator, user, |text| {
            let generated: GeneratedCode = parse_json(text)?;
            if generated.code.trim().is_empty() {
                return Err("generated code was empty".to_string());
            }
            Ok(generated)
        })
        .await
    }

    /// Diagnose a failed attempt and prescribe the next one
    pub async fn diagnose(&self, ctx: &DiagnosisContext) -> Result<ErrorDiagnosis, GatewayError> {
        let user = templates::render_error_analyzer(ctx, &self.config);
        self.complete_parsed(Template::ErrorAnalyzer, user, |text| {
            let diagnosis: ErrorDiagnosis = parse_json(text)?;
            Ok(diagnosis)
        })
        .await
    }

    /// Produce visualization code for the final result
    pub async fn chart_code(&self, ctx: &ChartContext) -> Result<String, GatewayError> {
        let user = templates::render_chart_generator(ctx, &self.config);
        self.complete_parsed(Template::ChartGenerator, user, |text| {
            let chart: ChartCode = parse_json(text)?;
            if chart.code.trim().is_empty() {
                return Err("chart code was empty".to_string());
            }
            Ok(chart.code)
        })
        .await
    }

    /// Synthesize the closing natural-language answer
    pub async fn summarize(&self, ctx: &SummaryContext) -> Result<String, GatewayError> {
        let user = templates::render_final_responder(ctx, &self.config);
        self.complete_parsed(Template::FinalResponder, user, |text| {
            let answer = text.trim();
            if answer.is_empty() {
                return Err("summary was empty".to_string());
            }
            Ok(answer.to_string())
        })
        .await
    }

    /// One completion with the template's system prompt and the shared budget
    async fn complete_raw(&self, template: Template, user: String) -> Result<String, GatewayError> {
        let request = CompletionRequest {
            system: template.system_prompt().to_string(),
            user,
            temperature: self.config.temperature,
        };
        let budget = self.config.completion_timeout();
        debug!(template = %template, "requesting completion");
        match tokio::time::timeout(budget, self.backend.complete(request)).await {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(err)) => Err(GatewayError::Backend(err.to_string())),
            Err(_) => Err(GatewayError::Timeout { timeout: budget }),
        }
    }

    /// Complete, parse, and on a malformed reply retry exactly once with a
    /// format reminder appended. Backend and timeout errors are never retried
    /// here; the caller decides what those mean for the run.
    async fn complete_parsed<T, F>(
        &self,
        template: Template,
        user: String,
        parse: F,
    ) -> Result<T, GatewayError>
    where
        F: Fn(&str) -> Result<T, String>,
    {
        let first = self.complete_raw(template, user.clone()).await?;
        match parse(&first) {
            Ok(value) => Ok(value),
            Err(reason) => {
                warn!(template = %template, %reason, "malformed completion, retrying once");
                let reminded = format!("{user}\n\n{STRICT_FORMAT_REMINDER}");
                let second = self.complete_raw(template, reminded).await?;
                parse(&second).map_err(|reason| GatewayError::Malformed { template, reason })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockCompletionBackend;
    use serde_json::json;

    #[tokio::test]
    async fn calls_carry_the_template_role_and_configured_temperature() {
        let mut backend = MockCompletionBackend::new();
        backend
            .expect_complete()
            .withf(|req| {
                req.system == Template::FinalResponder.system_prompt()
                    && (req.temperature - 0.7).abs() < f32::EPSILON
            })
            .times(1)
            .returning(|_| Ok("Fuel use is flat across the fleet.".to_string()));

        let gateway = Gateway::new(
            Arc::new(backend),
            GatewayConfig::default().with_temperature(0.7),
        );
        let answer = gateway
            .summarize(&SummaryContext {
                query: "fuel trend".to_string(),
                final_table: json!([]),
                chart_available: false,
            })
            .await
            .unwrap();

        assert_eq!(answer, "Fuel use is flat across the fleet.");
    }
}
