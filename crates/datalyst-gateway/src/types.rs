//! Prompt contexts and the schema-validated results they produce.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One prior query/answer pair, oldest first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryTurn {
    /// What the user asked
    pub query: String,
    /// What the system answered
    pub answer: String,
}

/// Context for plan creation
#[derive(Debug, Clone)]
pub struct PlanContext {
    /// The user's question
    pub query: String,
    /// Prior exchanges, oldest first; the gateway windows these
    pub history: Vec<HistoryTurn>,
    /// Dataset profile as JSON (name, row count, columns)
    pub profile: Value,
}

/// Context for one code-generation attempt
#[derive(Debug, Clone)]
pub struct CodeContext {
    /// Dataset profile as JSON
    pub profile: Value,
    /// The full ordered plan
    pub plan: Vec<String>,
    /// Zero-based index of the current step
    pub step_index: usize,
    /// The current step's instruction
    pub instruction: String,
    /// Narration of already-completed steps
    pub completed_steps: Vec<String>,
    /// Variables known live in the environment
    pub variables: Vec<String>,
    /// Stdout excerpts of prior successful executions
    pub results: Vec<String>,
    /// Diagnosis and fix guidance from a failed prior attempt
    pub guidance: Option<ErrorDiagnosis>,
}

/// Context for failure analysis
#[derive(Debug, Clone)]
pub struct DiagnosisContext {
    /// The instruction the failed code was trying to satisfy
    pub instruction: String,
    /// The code block that failed
    pub code: String,
    /// Captured stderr
    pub stderr: String,
    /// Variables known live in the environment
    pub variables: Vec<String>,
    /// Stdout excerpts of prior successful executions
    pub results: Vec<String>,
    /// Dataset profile as JSON
    pub profile: Value,
}

/// Context for chart-code generation
#[derive(Debug, Clone)]
pub struct ChartContext {
    /// The user's original question
    pub query: String,
    /// Variables known live in the environment
    pub variables: Vec<String>,
    /// Stdout excerpts of prior successful executions
    pub results: Vec<String>,
    /// The final tabular result as JSON
    pub final_table: Value,
    /// Diagnosis and fix guidance from a failed prior chart attempt
    pub guidance: Option<ErrorDiagnosis>,
}

/// Context for answer synthesis
#[derive(Debug, Clone)]
pub struct SummaryContext {
    /// The user's original question
    pub query: String,
    /// The final tabular result as JSON
    pub final_table: Value,
    /// Whether a chart was produced
    pub chart_available: bool,
}

/// A single reasoning pass: prose plus one code block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedCode {
    /// The model's reasoning about the step
    pub thought: String,
    /// The code to execute
    pub code: String,
}

/// Failure analysis: what broke and how to fix it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDiagnosis {
    /// What went wrong
    pub diagnosis: String,
    /// How the next attempt should differ
    pub suggestion: String,
}

/// Chart-generation reply shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartCode {
    /// The visualization code to execute
    pub code: String,
}
