//! Execution results and the artifacts an attempt may produce.
//!
//! Classification is deliberate and simple: a non-empty stderr marks the
//! attempt failed, even when stdout or artifacts are partially populated.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// MIME tag for tabular result samples
pub const TABLE_MIME: &str = "application/vnd.datalyst.table+json";

/// MIME tag for serialized chart figures
pub const CHART_MIME: &str = "application/vnd.plotly.v1+json";

/// Tabular result sample attached to a successful step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableData {
    /// Column names in display order
    pub columns: Vec<String>,
    /// Row-major cell values
    pub rows: Vec<Vec<Value>>,
    /// Total rows in the underlying result (rows above may be a sample)
    pub row_count: usize,
}

/// Structured side output of one execution
#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    /// Tabular result sample
    Table(TableData),
    /// Serialized chart object
    Chart(Value),
    /// Anything else the interpreter chose to surface, keyed by MIME
    Raw {
        /// Interpreter-supplied MIME tag
        mime: String,
        /// Raw display payload
        data: Value,
    },
}

impl Artifact {
    /// Build an artifact from an interpreter display bundle
    #[must_use]
    pub fn from_mime(mime: &str, data: Value) -> Self {
        match mime {
            TABLE_MIME => match serde_json::from_value::<TableData>(data.clone()) {
                Ok(table) => Self::Table(table),
                Err(_) => Self::Raw {
                    mime: mime.to_string(),
                    data,
                },
            },
            CHART_MIME => Self::Chart(data),
            _ => Self::Raw {
                mime: mime.to_string(),
                data,
            },
        }
    }

    /// MIME tag of this artifact
    #[must_use]
    pub fn mime(&self) -> &str {
        match self {
            Self::Table(_) => TABLE_MIME,
            Self::Chart(_) => CHART_MIME,
            Self::Raw { mime, .. } => mime,
        }
    }
}

/// Outcome classification of one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Clean stderr
    Succeeded,
    /// Non-empty stderr
    Failed,
}

/// Captured output of one code execution
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutput {
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error; empty on success
    pub stderr: String,
    /// Structured side outputs in production order
    pub artifacts: Vec<Artifact>,
}

impl ExecutionOutput {
    /// Output with stdout only
    #[must_use]
    pub fn from_stdout(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    /// Output with stderr only
    #[must_use]
    pub fn from_stderr(stderr: impl Into<String>) -> Self {
        Self {
            stderr: stderr.into(),
            ..Self::default()
        }
    }

    /// With an extra artifact
    #[must_use]
    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    /// Classify this attempt
    #[must_use]
    pub fn outcome(&self) -> AttemptOutcome {
        if self.stderr.trim().is_empty() {
            AttemptOutcome::Succeeded
        } else {
            AttemptOutcome::Failed
        }
    }

    /// Whether the attempt succeeded
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.outcome() == AttemptOutcome::Succeeded
    }

    /// First tabular artifact, if any
    #[must_use]
    pub fn table(&self) -> Option<&TableData> {
        self.artifacts.iter().find_map(|a| match a {
            Artifact::Table(table) => Some(table),
            _ => None,
        })
    }

    /// First chart artifact, if any
    #[must_use]
    pub fn chart(&self) -> Option<&Value> {
        self.artifacts.iter().find_map(|a| match a {
            Artifact::Chart(spec) => Some(spec),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn empty_stderr_classifies_as_success() {
        let output = ExecutionOutput::from_stdout("42\n");
        assert_eq!(output.outcome(), AttemptOutcome::Succeeded);
        assert!(output.succeeded());
    }

    #[test]
    fn whitespace_only_stderr_still_succeeds() {
        let output = ExecutionOutput {
            stdout: "fine".into(),
            stderr: "  \n".into(),
            artifacts: Vec::new(),
        };
        assert!(output.succeeded());
    }

    #[test]
    fn stderr_fails_even_with_partial_stdout() {
        let output = ExecutionOutput {
            stdout: "partial".into(),
            stderr: "KeyError: 'drver'".into(),
            artifacts: Vec::new(),
        };
        assert_eq!(output.outcome(), AttemptOutcome::Failed);
    }

    #[test]
    fn mime_dispatch_builds_typed_artifacts() {
        let table = Artifact::from_mime(
            TABLE_MIME,
            json!({"columns": ["driver"], "rows": [["a"]], "row_count": 1}),
        );
        assert!(matches!(table, Artifact::Table(_)));

        let chart = Artifact::from_mime(CHART_MIME, json!({"data": [], "layout": {}}));
        assert!(matches!(chart, Artifact::Chart(_)));

        let other = Artifact::from_mime("text/html", json!("<b>x</b>"));
        assert_eq!(other.mime(), "text/html");
    }

    #[test]
    fn malformed_table_bundle_degrades_to_raw() {
        let artifact = Artifact::from_mime(TABLE_MIME, json!({"not": "a table"}));
        assert!(matches!(artifact, Artifact::Raw { .. }));
    }

    #[test]
    fn accessors_pick_the_first_matching_artifact() {
        let output = ExecutionOutput::from_stdout("")
            .with_artifact(Artifact::from_mime("text/plain", json!("x")))
            .with_artifact(Artifact::from_mime(
                TABLE_MIME,
                json!({"columns": ["a"], "rows": [[1]], "row_count": 1}),
            ));

        assert_eq!(output.table().map(|t| t.row_count), Some(1));
        assert!(output.chart().is_none());
    }
}
