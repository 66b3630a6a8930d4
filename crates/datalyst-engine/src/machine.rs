//! The workflow state machine, as data.
//!
//! [`advance`] is a pure function from `(phase, signal)` to the next phase;
//! the driver owns all side effects and feeds outcomes back in as signals.
//! Keeping the transition table free of I/O makes the retry accounting and
//! the terminal guarantees directly testable.
//!
//! Retry accounting: `attempt` on [`Phase::Executing`] counts diagnoses taken
//! for the current step. A failure that would push the count past
//! [`RetryPolicy::max_step_retries`] fails the run without another diagnosis,
//! so a policy of 3 allows four attempts in total. Chart phases use the same
//! scheme with their own bound, but exhaustion falls back to answering
//! without a chart instead of failing the run.

use serde::{Deserialize, Serialize};

/// What a recovery loop is retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryScope {
    /// A plan step, by zero-based index
    Step {
        /// Index of the step being retried
        index: usize,
    },
    /// The chart stage
    Chart,
}

/// Where a run currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for the plan
    Planning,
    /// Generating and executing code for one step
    Executing {
        /// Zero-based plan step
        step: usize,
        /// Diagnoses already taken for this step
        attempt: usize,
    },
    /// A step succeeded; deciding whether more remain
    Checking {
        /// The step that just succeeded
        step: usize,
    },
    /// Diagnosing a failure before the next attempt
    ErrorAnalysis {
        /// What is being retried
        scope: RetryScope,
        /// Diagnoses taken including this one
        attempt: usize,
    },
    /// Generating chart code for the final result
    ChartGenerating {
        /// Diagnoses already taken for the chart
        attempt: usize,
    },
    /// Executing generated chart code
    ChartExecuting {
        /// Diagnoses already taken for the chart
        attempt: usize,
    },
    /// Synthesizing the final answer
    Responding {
        /// Whether a chart made it into the result
        chart: bool,
    },
    /// Terminal: answered
    Done,
    /// Terminal: gave up
    Failed,
}

impl Phase {
    /// True for [`Phase::Done`] and [`Phase::Failed`]
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Short name for tracing fields
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Executing { .. } => "executing",
            Self::Checking { .. } => "checking",
            Self::ErrorAnalysis { .. } => "error_analysis",
            Self::ChartGenerating { .. } => "chart_generating",
            Self::ChartExecuting { .. } => "chart_executing",
            Self::Responding { .. } => "responding",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

/// Outcome of the side effect a phase asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// The planner produced this many steps
    PlanReady {
        /// Step count, may be zero
        steps: usize,
    },
    /// The planner failed outright
    PlanRejected,
    /// The current step's code ran cleanly
    AttemptSucceeded,
    /// The current step's code failed or timed out
    AttemptFailed,
    /// The step cursor moved past the succeeded step
    CursorAdvanced {
        /// Whether further steps remain
        remaining: bool,
    },
    /// A diagnosis is available for the next attempt
    DiagnosisReady,
    /// Chart code was generated
    ChartCodeReady,
    /// Chart code generation failed
    ChartCodeFailed,
    /// Chart code ran and produced a chart
    ChartSucceeded,
    /// Chart code ran and failed
    ChartFailed,
    /// The final answer is ready
    SummaryReady,
    /// Answer synthesis failed
    SummaryFailed,
    /// Cancel was requested at a safe boundary
    Cancelled,
    /// An unrecoverable failure outside the retry loops
    Fatal,
}

/// Retry bounds for the two recovery loops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Diagnoses allowed per plan step before the run fails
    pub max_step_retries: usize,
    /// Diagnoses allowed for the chart before it is skipped
    pub chart_retries: usize,
}

impl RetryPolicy {
    /// Default policy
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With a custom per-step bound
    #[inline]
    #[must_use]
    pub fn with_max_step_retries(mut self, retries: usize) -> Self {
        self.max_step_retries = retries;
        self
    }

    /// With a custom chart bound
    #[inline]
    #[must_use]
    pub fn with_chart_retries(mut self, retries: usize) -> Self {
        self.chart_retries = retries;
        self
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_step_retries: 3,
            chart_retries: 1,
        }
    }
}

/// A signal arrived in a phase that cannot consume it
#[derive(Debug, Clone, thiserror::Error)]
#[error("signal {signal:?} is not valid in phase {phase:?}")]
pub struct TransitionError {
    /// The phase the machine was in
    pub phase: Phase,
    /// The signal that did not apply
    pub signal: Signal,
}

/// Apply one signal to one phase.
///
/// Terminal phases accept no signals. `Cancelled` and `Fatal` fail the run
/// from any non-terminal phase.
pub fn advance(phase: Phase, signal: Signal, policy: RetryPolicy) -> Result<Phase, TransitionError> {
    if !phase.is_terminal() && matches!(signal, Signal::Cancelled | Signal::Fatal) {
        return Ok(Phase::Failed);
    }

    let next = match (phase, signal) {
        (Phase::Planning, Signal::PlanReady { steps }) => {
            if steps == 0 {
                Phase::Failed
            } else {
                Phase::Executing { step: 0, attempt: 0 }
            }
        }
        (Phase::Planning, Signal::PlanRejected) => Phase::Failed,

        (Phase::Executing { step, .. }, Signal::AttemptSucceeded) => Phase::Checking { step },
        (Phase::Executing { step, attempt }, Signal::AttemptFailed) => {
            if attempt + 1 > policy.max_step_retries {
                Phase::Failed
            } else {
                Phase::ErrorAnalysis {
                    scope: RetryScope::Step { index: step },
                    attempt: attempt + 1,
                }
            }
        }

        (Phase::Checking { step }, Signal::CursorAdvanced { remaining: true }) => Phase::Executing {
            step: step + 1,
            attempt: 0,
        },
        (Phase::Checking { .. }, Signal::CursorAdvanced { remaining: false }) => {
            Phase::ChartGenerating { attempt: 0 }
        }

        (
            Phase::ErrorAnalysis {
                scope: RetryScope::Step { index },
                attempt,
            },
            Signal::DiagnosisReady,
        ) => Phase::Executing {
            step: index,
            attempt,
        },
        (
            Phase::ErrorAnalysis {
                scope: RetryScope::Chart,
                attempt,
            },
            Signal::DiagnosisReady,
        ) => Phase::ChartGenerating { attempt },

        (Phase::ChartGenerating { attempt }, Signal::ChartCodeReady) => {
            Phase::ChartExecuting { attempt }
        }
        (Phase::ChartGenerating { attempt }, Signal::ChartCodeFailed)
        | (Phase::ChartExecuting { attempt }, Signal::ChartFailed) => {
            if attempt + 1 > policy.chart_retries {
                Phase::Responding { chart: false }
            } else {
                Phase::ErrorAnalysis {
                    scope: RetryScope::Chart,
                    attempt: attempt + 1,
                }
            }
        }
        (Phase::ChartExecuting { .. }, Signal::ChartSucceeded) => Phase::Responding { chart: true },

        (Phase::Responding { .. }, Signal::SummaryReady) => Phase::Done,
        (Phase::Responding { .. }, Signal::SummaryFailed) => Phase::Failed,

        (phase, signal) => return Err(TransitionError { phase, signal }),
    };
    Ok(next)
}
