//! The run driver: owns every side effect of one run.
//!
//! The driver walks the [`machine`](crate::machine) by performing the side
//! effect each phase asks for and feeding the outcome back as a signal. All
//! events a client sees are emitted here, always before the corresponding
//! transition, so a replayed stream tells the same story the machine walked.
//!
//! Cancellation is honored at the top of each iteration; an in-flight
//! completion or execution is allowed to finish first.

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexSet;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use datalyst_gateway::{
    ChartContext, CodeContext, DiagnosisContext, ErrorDiagnosis, Gateway, HistoryTurn, PlanContext,
    SummaryContext,
};
use datalyst_sandbox::ExecutionOutput;
use datalyst_session::{RunGuard, SessionStore};
use datalyst_stream::{Event, EventHub};

use crate::error::EngineError;
use crate::machine::{advance, Phase, RetryPolicy, RetryScope, Signal};

const LOG_EXCERPT_CHARS: usize = 400;

static ASSIGNMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*([A-Za-z_][A-Za-z0-9_]*)\s*=(?:[^=]|$)").expect("assignment pattern")
});

/// Names bound by top-level assignments in a code block
fn scrape_assignments(code: &str) -> Vec<String> {
    ASSIGNMENT
        .captures_iter(code)
        .map(|cap| cap[1].to_string())
        .collect()
}

/// Char-boundary-safe excerpt for prompts and log messages
fn excerpt(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let clipped: String = text.chars().take(max_chars).collect();
    format!("{clipped}...")
}

#[derive(Clone)]
struct FailedAttempt {
    code: String,
    stderr: String,
}

/// Everything a run accumulates while it walks the machine
struct RunState {
    plan: Vec<String>,
    completed: Vec<String>,
    variables: IndexSet<String>,
    results: Vec<String>,
    last_table: Option<Value>,
    chart_code: Option<String>,
    last_failure: Option<FailedAttempt>,
    last_diagnosis: Option<ErrorDiagnosis>,
}

impl RunState {
    fn new(frame_variable: &str) -> Self {
        let mut variables = IndexSet::new();
        variables.insert(frame_variable.to_string());
        Self {
            plan: Vec::new(),
            completed: Vec::new(),
            variables,
            results: Vec::new(),
            last_table: None,
            chart_code: None,
            last_failure: None,
            last_diagnosis: None,
        }
    }

    fn variables(&self) -> Vec<String> {
        self.variables.iter().cloned().collect()
    }

    fn absorb_success(&mut self, code: &str, output: &ExecutionOutput, max_chars: usize) {
        for name in scrape_assignments(code) {
            self.variables.insert(name);
        }
        let stdout = output.stdout.trim();
        if !stdout.is_empty() {
            self.results.push(excerpt(stdout, max_chars));
        }
    }
}

/// Drives one run from planning to its terminal event
pub(crate) struct RunDriver {
    gateway: Arc<Gateway>,
    hub: Arc<EventHub>,
    store: Arc<SessionStore>,
    policy: RetryPolicy,
    execute_timeout: Duration,
    max_result_chars: usize,
    query: String,
    guard: RunGuard,
}

impl RunDriver {
    pub(crate) fn new(
        gateway: Arc<Gateway>,
        hub: Arc<EventHub>,
        store: Arc<SessionStore>,
        policy: RetryPolicy,
        execute_timeout: Duration,
        max_result_chars: usize,
        query: String,
        guard: RunGuard,
    ) -> Self {
        Self {
            gateway,
            hub,
            store,
            policy,
            execute_timeout,
            max_result_chars,
            query,
            guard,
        }
    }

    /// Walk the machine to a terminal phase, then seal the event stream
    pub(crate) async fn run(self) {
        let run_id = self.guard.run_id();
        let session_id = self.guard.session_id();
        info!(%run_id, %session_id, "run started");

        let mut state = RunState::new(&self.store.config().frame_variable);
        let mut phase = Phase::Planning;

        while !phase.is_terminal() {
            self.guard.entry().touch();

            let signal = if self.guard.is_cancelled() {
                self.emit(Event::fatal_error("analysis cancelled"));
                Signal::Cancelled
            } else {
                match phase {
                    Phase::Planning => self.do_planning(&mut state).await,
                    Phase::Executing { step, attempt } => {
                        self.do_executing(&mut state, step, attempt).await
                    }
                    Phase::Checking { step } => Self::do_checking(&state, step),
                    Phase::ErrorAnalysis { scope, .. } => {
                        self.do_error_analysis(&mut state, scope).await
                    }
                    Phase::ChartGenerating { .. } => self.do_chart_generating(&mut state).await,
                    Phase::ChartExecuting { .. } => self.do_chart_executing(&mut state).await,
                    Phase::Responding { chart } => self.do_responding(&state, chart).await,
                    Phase::Done | Phase::Failed => break,
                }
            };

            phase = match advance(phase, signal, self.policy) {
                Ok(next) => next,
                Err(err) => {
                    error!(%run_id, %err, "workflow transition rejected");
                    self.emit(Event::fatal_error("internal error: invalid workflow transition"));
                    Phase::Failed
                }
            };
            debug!(%run_id, phase = phase.name(), "phase advanced");
        }

        if let Err(err) = self.hub.complete(run_id).await {
            warn!(%run_id, %err, "sealing run stream");
        }
        info!(%run_id, outcome = phase.name(), "run finished");
    }

    async fn do_planning(&self, state: &mut RunState) -> Signal {
        self.emit(Event::log("Planning analysis steps"));
        let entry = self.guard.entry();
        let history: Vec<HistoryTurn> = entry
            .history()
            .into_iter()
            .map(|exchange| HistoryTurn {
                query: exchange.query,
                answer: exchange.answer,
            })
            .collect();
        let ctx = PlanContext {
            query: self.query.clone(),
            history,
            profile: entry.profile().to_value(),
        };
        match self.gateway.plan(&ctx).await {
            Ok(steps) => {
                self.emit(Event::plan("Execution plan ready", &steps));
                state.plan = steps;
                Signal::PlanReady {
                    steps: state.plan.len(),
                }
            }
            Err(err) => {
                let err = EngineError::Planning {
                    reason: err.to_string(),
                };
                self.emit(Event::fatal_error(err.to_string()));
                Signal::PlanRejected
            }
        }
    }

    async fn do_executing(&self, state: &mut RunState, step: usize, attempt: usize) -> Signal {
        let instruction = state.plan.get(step).cloned().unwrap_or_default();
        let ctx = CodeContext {
            profile: self.guard.entry().profile().to_value(),
            plan: state.plan.clone(),
            step_index: step,
            instruction: instruction.clone(),
            completed_steps: state.completed.clone(),
            variables: state.variables(),
            results: state.results.clone(),
            guidance: state.last_diagnosis.clone(),
        };
        let generated = match self.gateway.generate_code(&ctx).await {
            Ok(generated) => generated,
            // A bad completion is a failed attempt, not a dead run; the
            // recovery loop gets to ask for better code.
            Err(err) => {
                let stderr = format!("code generation failed: {err}");
                self.emit(Event::error(stderr.clone(), Some(step)));
                state.last_failure = Some(FailedAttempt {
                    code: String::new(),
                    stderr,
                });
                self.note_exhaustion(state, step, attempt);
                return Signal::AttemptFailed;
            }
        };
        self.emit(Event::thought(generated.thought.clone(), step));
        self.emit(Event::code(generated.code.clone(), Some(step)));

        let execution = self
            .guard
            .environment()
            .execute(&generated.code, self.execute_timeout)
            .await;
        match execution {
            Ok(output) if output.succeeded() => {
                state.absorb_success(&generated.code, &output, self.max_result_chars);
                match output.table().map(serde_json::to_value) {
                    Some(Ok(value)) => {
                        state.last_table = Some(value.clone());
                        self.emit(Event::table(value, Some(step)));
                    }
                    Some(Err(err)) => {
                        warn!(%err, "table artifact did not serialize");
                        self.emit(Event::log(format!("Step {} complete", step + 1)));
                    }
                    None => {
                        self.emit(Event::log(format!(
                            "Step {} complete: {}",
                            step + 1,
                            excerpt(output.stdout.trim(), LOG_EXCERPT_CHARS)
                        )));
                    }
                }
                state.completed.push(instruction);
                state.last_diagnosis = None;
                state.last_failure = None;
                Signal::AttemptSucceeded
            }
            Ok(output) => {
                let stderr = output.stderr.trim().to_string();
                self.emit(Event::error(
                    excerpt(&stderr, self.max_result_chars),
                    Some(step),
                ));
                state.last_failure = Some(FailedAttempt {
                    code: generated.code,
                    stderr,
                });
                self.note_exhaustion(state, step, attempt);
                Signal::AttemptFailed
            }
            Err(err) if err.is_timeout() => {
                let stderr = err.to_string();
                self.emit(Event::error(stderr.clone(), Some(step)));
                state.last_failure = Some(FailedAttempt {
                    code: generated.code,
                    stderr,
                });
                self.note_exhaustion(state, step, attempt);
                Signal::AttemptFailed
            }
            Err(err) => {
                self.emit(Event::fatal_error(err.to_string()));
                self.schedule_close();
                Signal::Fatal
            }
        }
    }

    fn do_checking(state: &RunState, step: usize) -> Signal {
        Signal::CursorAdvanced {
            remaining: step + 1 < state.plan.len(),
        }
    }

    async fn do_error_analysis(&self, state: &mut RunState, scope: RetryScope) -> Signal {
        let Some(failure) = state.last_failure.clone() else {
            self.emit(Event::fatal_error("internal error: nothing to diagnose"));
            return Signal::Fatal;
        };
        let instruction = match scope {
            RetryScope::Step { index } => state.plan.get(index).cloned().unwrap_or_default(),
            RetryScope::Chart => "build the final chart".to_string(),
        };
        let ctx = DiagnosisContext {
            instruction,
            code: failure.code,
            stderr: failure.stderr.clone(),
            variables: state.variables(),
            results: state.results.clone(),
            profile: self.guard.entry().profile().to_value(),
        };
        match self.gateway.diagnose(&ctx).await {
            Ok(diagnosis) => {
                self.emit(Event::log(format!("Diagnosis: {}", diagnosis.diagnosis)));
                state.last_diagnosis = Some(diagnosis);
            }
            Err(err) => {
                // The retry still happens; the code generator gets the raw
                // error instead of a proper diagnosis.
                warn!(%err, "diagnosis unavailable");
                self.emit(Event::log("Diagnosis unavailable; retrying with the raw error"));
                state.last_diagnosis = Some(ErrorDiagnosis {
                    diagnosis: format!(
                        "the previous attempt failed: {}",
                        excerpt(&failure.stderr, LOG_EXCERPT_CHARS)
                    ),
                    suggestion: "rewrite the code to avoid the error above".to_string(),
                });
            }
        }
        Signal::DiagnosisReady
    }

    async fn do_chart_generating(&self, state: &mut RunState) -> Signal {
        self.emit(Event::log("Generating a chart for the final result"));
        let ctx = ChartContext {
            query: self.query.clone(),
            variables: state.variables(),
            results: state.results.clone(),
            final_table: state.last_table.clone().unwrap_or(Value::Null),
            guidance: state.last_diagnosis.take(),
        };
        match self.gateway.chart_code(&ctx).await {
            Ok(code) => {
                self.emit(Event::code(code.clone(), None));
                state.chart_code = Some(code);
                Signal::ChartCodeReady
            }
            Err(err) => {
                self.emit(Event::log(format!("Chart generation failed: {err}")));
                state.last_failure = Some(FailedAttempt {
                    code: String::new(),
                    stderr: err.to_string(),
                });
                Signal::ChartCodeFailed
            }
        }
    }

    async fn do_chart_executing(&self, state: &mut RunState) -> Signal {
        let Some(code) = state.chart_code.clone() else {
            self.emit(Event::fatal_error("internal error: no chart code to execute"));
            return Signal::Fatal;
        };
        let execution = self
            .guard
            .environment()
            .execute(&code, self.execute_timeout)
            .await;
        match execution {
            Ok(output) if output.succeeded() => {
                if let Some(spec) = output.chart() {
                    self.emit(Event::chart(spec.clone()));
                    return Signal::ChartSucceeded;
                }
                let stdout = output.stdout.trim();
                if !stdout.is_empty() {
                    self.emit(Event::chart(json!({ "html": stdout })));
                    return Signal::ChartSucceeded;
                }
                self.emit(Event::log("Chart code produced no output"));
                state.last_failure = Some(FailedAttempt {
                    code,
                    stderr: "chart code produced no output".to_string(),
                });
                Signal::ChartFailed
            }
            Ok(output) => {
                let stderr = output.stderr.trim().to_string();
                self.emit(Event::log(format!(
                    "Chart attempt failed: {}",
                    excerpt(&stderr, LOG_EXCERPT_CHARS)
                )));
                state.last_failure = Some(FailedAttempt { code, stderr });
                Signal::ChartFailed
            }
            Err(err) if err.is_timeout() => {
                let stderr = err.to_string();
                self.emit(Event::log(format!("Chart attempt failed: {stderr}")));
                state.last_failure = Some(FailedAttempt { code, stderr });
                Signal::ChartFailed
            }
            Err(err) => {
                self.emit(Event::fatal_error(err.to_string()));
                self.schedule_close();
                Signal::Fatal
            }
        }
    }

    async fn do_responding(&self, state: &RunState, chart: bool) -> Signal {
        let ctx = SummaryContext {
            query: self.query.clone(),
            final_table: state.last_table.clone().unwrap_or(Value::Null),
            chart_available: chart,
        };
        match self.gateway.summarize(&ctx).await {
            Ok(answer) => {
                self.emit(Event::final_response(answer.clone()));
                self.store
                    .record_exchange(self.guard.session_id(), &self.query, &answer);
                Signal::SummaryReady
            }
            Err(err) => {
                self.emit(Event::fatal_error(format!("answer synthesis failed: {err}")));
                Signal::SummaryFailed
            }
        }
    }

    /// The terminal event for a step that just burned its last retry
    fn note_exhaustion(&self, state: &RunState, step: usize, attempt: usize) {
        if attempt + 1 <= self.policy.max_step_retries {
            return;
        }
        let diagnosis = state
            .last_diagnosis
            .as_ref()
            .map(|d| d.diagnosis.clone())
            .or_else(|| {
                state
                    .last_failure
                    .as_ref()
                    .map(|f| excerpt(&f.stderr, LOG_EXCERPT_CHARS))
            })
            .unwrap_or_else(|| "no diagnosis available".to_string());
        let err = EngineError::StepExhausted {
            step: step + 1,
            instruction: state.plan.get(step).cloned().unwrap_or_default(),
            diagnosis,
        };
        self.emit(Event::fatal_error(err.to_string()));
    }

    /// Tear the session down once this run has released its slot.
    ///
    /// Close waits on the run slot we are still holding, so it must happen
    /// on its own task rather than inline.
    fn schedule_close(&self) {
        let session_id = self.guard.session_id();
        warn!(%session_id, "closing session after environment loss");
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(err) = store.close(session_id).await {
                warn!(%session_id, %err, "session close after environment loss");
            }
        });
    }

    fn emit(&self, event: Event) {
        if let Err(err) = self.hub.publish(self.guard.run_id(), event) {
            warn!(run_id = %self.guard.run_id(), %err, "publishing event");
        }
    }
}
