//! Wire-level event model for a run's reasoning trace.
//!
//! Every message a subscriber sees is one [`Event`] with the shape
//! `{type, payload, timestamp, step_index?}`. The payload schema depends on
//! the kind: free text for `thought`/`code`/`final_response`, small JSON
//! objects for the rest.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// Unique run identifier (UUID v4, matches session-facing opaque ids)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate new run ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind tag carried on the wire as `type`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Model reasoning prose for the current step
    Thought,
    /// A generated code block (analysis step or chart)
    Code,
    /// Progress narration; the plan announcement rides a log event
    Log,
    /// A failed attempt, or the terminal failure when `fatal` is set
    Error,
    /// Tabular result sample for a completed step
    Table,
    /// Serialized chart object produced by chart execution
    Chart,
    /// The single closing answer of a successful run
    FinalResponse,
}

impl EventKind {
    /// Wire string for this kind
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Thought => "thought",
            Self::Code => "code",
            Self::Log => "log",
            Self::Error => "error",
            Self::Table => "table",
            Self::Chart => "chart",
            Self::FinalResponse => "final_response",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One streamed message of a run's trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Kind tag, serialized as `type`
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Kind-specific payload
    pub payload: Value,
    /// Emission time (UTC)
    pub timestamp: DateTime<Utc>,
    /// Zero-based plan step this message belongs to, when applicable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
}

impl Event {
    fn tagged(kind: EventKind, payload: Value, step_index: Option<usize>) -> Self {
        Self {
            kind,
            payload,
            timestamp: Utc::now(),
            step_index,
        }
    }

    /// Reasoning prose for a step attempt
    #[must_use]
    pub fn thought(text: impl Into<String>, step_index: usize) -> Self {
        Self::tagged(EventKind::Thought, Value::String(text.into()), Some(step_index))
    }

    /// Generated code block; chart code carries no step index
    #[must_use]
    pub fn code(code: impl Into<String>, step_index: Option<usize>) -> Self {
        Self::tagged(EventKind::Code, Value::String(code.into()), step_index)
    }

    /// Progress narration
    #[must_use]
    pub fn log(message: impl Into<String>) -> Self {
        Self::tagged(EventKind::Log, json!({ "message": message.into() }), None)
    }

    /// Plan announcement: narration plus the ordered step instructions
    #[must_use]
    pub fn plan(message: impl Into<String>, steps: &[String]) -> Self {
        Self::tagged(
            EventKind::Log,
            json!({ "message": message.into(), "steps": steps }),
            None,
        )
    }

    /// Recoverable attempt failure
    #[must_use]
    pub fn error(message: impl Into<String>, step_index: Option<usize>) -> Self {
        Self::tagged(EventKind::Error, json!({ "message": message.into() }), step_index)
    }

    /// Terminal failure; closes the stream
    #[must_use]
    pub fn fatal_error(message: impl Into<String>) -> Self {
        Self::tagged(
            EventKind::Error,
            json!({ "message": message.into(), "fatal": true }),
            None,
        )
    }

    /// Tabular result sample (payload already shaped `{columns, rows, row_count}`)
    #[must_use]
    pub fn table(table: Value, step_index: Option<usize>) -> Self {
        Self::tagged(EventKind::Table, table, step_index)
    }

    /// Serialized chart object
    #[must_use]
    pub fn chart(spec: Value) -> Self {
        Self::tagged(EventKind::Chart, spec, None)
    }

    /// The single closing answer; closes the stream
    #[must_use]
    pub fn final_response(answer: impl Into<String>) -> Self {
        Self::tagged(EventKind::FinalResponse, Value::String(answer.into()), None)
    }

    /// Whether this event ends the stream (`final_response` or fatal `error`)
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        match self.kind {
            EventKind::FinalResponse => true,
            EventKind::Error => self
                .payload
                .get("fatal")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn wire_shape_uses_type_tag_and_omits_absent_step_index() {
        let event = Event::final_response("done");
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["type"], "final_response");
        assert_eq!(value["payload"], "done");
        assert!(value.get("step_index").is_none());
        assert!(value.get("timestamp").is_some());
    }

    #[test]
    fn step_scoped_events_carry_their_index() {
        let event = Event::thought("look at column x", 2);
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["type"], "thought");
        assert_eq!(value["step_index"], 2);
    }

    #[test]
    fn plan_rides_a_log_event_with_steps() {
        let steps = vec!["load".to_string(), "aggregate".to_string()];
        let event = Event::plan("plan ready", &steps);

        assert_eq!(event.kind, EventKind::Log);
        assert_eq!(event.payload["steps"][1], "aggregate");
        assert!(!event.is_terminal());
    }

    #[test]
    fn terminal_detection_distinguishes_fatal_errors() {
        assert!(Event::fatal_error("boom").is_terminal());
        assert!(!Event::error("step failed", Some(1)).is_terminal());
        assert!(Event::final_response("ok").is_terminal());
    }

    #[test]
    fn events_round_trip_through_json() {
        let original = Event::table(json!({"columns": ["a"], "rows": [[1]], "row_count": 1}), Some(0));
        let text = serde_json::to_string(&original).unwrap();
        let back: Event = serde_json::from_str(&text).unwrap();

        assert_eq!(original, back);
    }
}
