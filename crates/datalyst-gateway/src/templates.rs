//! Built-in prompt templates and their rendering.
//!
//! Five templates drive the whole workflow: plan creation, per-step code
//! generation, failure analysis, chart generation and answer synthesis.
//! Rendering is plain placeholder substitution; history windowing and result
//! truncation happen here so prompts stay bounded.

use serde_json::Value;

use crate::types::{ChartContext, CodeContext, DiagnosisContext, PlanContext, SummaryContext};
use crate::GatewayConfig;

/// Identifies one of the built-in prompt templates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Template {
    /// Break a question into ordered analysis steps
    Planner,
    /// Produce one `{thought, code}` pass for the current step
    CodeGenerator,
    /// Diagnose a failed attempt
    ErrorAnalyzer,
    /// Produce one visualization code block
    ChartGenerator,
    /// Synthesize the closing answer
    FinalResponder,
}

impl Template {
    /// Stable identifier for logs and errors
    #[must_use]
    pub fn id(self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::CodeGenerator => "code_generator",
            Self::ErrorAnalyzer => "error_analyzer",
            Self::ChartGenerator => "chart_generator",
            Self::FinalResponder => "final_responder",
        }
    }

    /// Role framing sent as the system prompt
    #[must_use]
    pub fn system_prompt(self) -> &'static str {
        match self {
            Self::Planner => {
                "You are a senior data strategist who turns business questions into precise, ordered analysis plans."
            }
            Self::CodeGenerator => {
                "You are a senior data scientist writing clean pandas code inside a stateful interpreter, one step at a time."
            }
            Self::ErrorAnalyzer => {
                "You are an expert debugger who reads tracebacks calmly and prescribes concrete fixes."
            }
            Self::ChartGenerator => {
                "You are a visualization expert who renders interactive charts for web frontends."
            }
            Self::FinalResponder => {
                "You are an articulate analyst who explains findings simply and directly."
            }
        }
    }
}

impl std::fmt::Display for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

pub(crate) const STRICT_FORMAT_REMINDER: &str =
    "Reminder: reply with ONLY the exact format requested above. No prose, no explanation, no surrounding text.";

const PLANNER_TEMPLATE: &str = "\
Break the user's question about a tabular dataset into a short, ordered list \
of imperative analysis steps.

Rules:
- The dataset is already loaded as a DataFrame named `df`; never include loading steps.
- Do not write code, and do not include chart or visualization steps; a separate agent charts the final result.
- Group related operations into substantial steps; one or two steps usually suffice.
- Use column names exactly as they appear in the dataset profile, including case.
- Reply with ONLY a JSON array of strings.

User query:
{query}

Conversation so far:
{history}

Dataset profile:
```json
{profile}
```
";

const CODE_TEMPLATE: &str = "\
Write the code for the current goal only. First reason, then reply with a \
single JSON object of the form {\"thought\": \"...\", \"code\": \"...\"}.

Rules:
- The dataset is already loaded as `df`; never read files.
- Address ONLY the current goal, not later plan steps.
- Do not create charts or visualizations here.
- Assign any new DataFrame to a new variable (df_filtered, df_grouped, ...).
- Use column names exactly as they appear in the dataset profile, including case.
- End the code with a print of the result so the system can observe it.

Dataset profile:
```json
{profile}
```

Overall plan:
{plan}

Current goal (step {step_number}):
\"{instruction}\"

Completed steps:
{completed}

Available variables in the environment:
{variables}

Previous results:
{results}

Fix guidance from the last failed attempt:
{guidance}
";

const ERROR_TEMPLATE: &str = "\
The code below failed. Explain what went wrong and how the next attempt \
should differ. Reply with a single JSON object of the form \
{\"diagnosis\": \"...\", \"suggestion\": \"...\"}.

Rules:
- Be specific: name the column, variable or expression at fault.
- The suggestion must tell the code writer exactly what to change.

Goal being attempted:
\"{instruction}\"

Failed code:
```python
{code}
```

Error output:
```
{stderr}
```

Available variables in the environment:
{variables}

Previous results:
{results}

Dataset profile (check column names and types here):
```json
{profile}
```
";

const CHART_TEMPLATE: &str = "\
Choose the most effective chart for the final result and write the code that \
builds it. Reply with a single JSON object of the form {\"code\": \"...\"}.

Rules:
- Use the variables already present in the environment; check the list below for the right DataFrame name.
- Build one plotly figure named `fig`, convert it with `fig.to_html(include_plotlyjs='cdn')` and print the full HTML string.
- Never call `fig.show()` or try to render the figure.

User's original question:
\"{query}\"

Available variables in the environment:
{variables}

Previous results:
{results}

Final data (JSON, for reference):
```json
{final_table}
```

Fix guidance from the last failed attempt:
{guidance}
";

const SUMMARY_TEMPLATE: &str = "\
Review the user's question and the final result, then write a concise, \
conversational answer.

Rules:
- Address the question directly and explain what the data shows.
- Mention the chart only if one is available.
- Reply with ONLY the answer text, no JSON and no markdown fences.

User's original question:
\"{query}\"

Final data:
```json
{final_table}
```

Chart available:
{chart_available}
";

fn profile_json(profile: &Value) -> String {
    serde_json::to_string_pretty(profile).unwrap_or_else(|_| "{}".to_string())
}

fn value_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

/// Truncate on a char boundary, marking the cut
fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let clipped: String = text.chars().take(max_chars).collect();
    format!("{clipped}... [truncated]")
}

fn format_history(history: &[crate::types::HistoryTurn], window: usize) -> String {
    if history.is_empty() {
        return "(no prior conversation)".to_string();
    }
    let start = history.len().saturating_sub(window);
    history[start..]
        .iter()
        .map(|turn| format!("User: {}\nAssistant: {}", turn.query, turn.answer))
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_numbered(items: &[String]) -> String {
    if items.is_empty() {
        return "(none)".to_string();
    }
    items
        .iter()
        .enumerate()
        .map(|(i, item)| format!("{}. {item}", i + 1))
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_variables(variables: &[String]) -> String {
    if variables.is_empty() {
        "(none)".to_string()
    } else {
        variables.join(", ")
    }
}

fn format_results(results: &[String], max_chars: usize) -> String {
    if results.is_empty() {
        return "(none)".to_string();
    }
    results
        .iter()
        .map(|r| clip(r, max_chars))
        .collect::<Vec<_>>()
        .join("\n---\n")
}

/// Render the plan-creation prompt
#[must_use]
pub fn render_planner(ctx: &PlanContext, config: &GatewayConfig) -> String {
    PLANNER_TEMPLATE
        .replace("{query}", &ctx.query)
        .replace("{history}", &format_history(&ctx.history, config.history_window))
        .replace("{profile}", &profile_json(&ctx.profile))
}

/// Render the code-generation prompt for one attempt
#[must_use]
pub fn render_code_generator(ctx: &CodeContext, config: &GatewayConfig) -> String {
    let guidance = match &ctx.guidance {
        Some(g) => format!("Diagnosis: {}\nSuggestion: {}", g.diagnosis, g.suggestion),
        None => "(no previous errors)".to_string(),
    };
    CODE_TEMPLATE
        .replace("{profile}", &profile_json(&ctx.profile))
        .replace("{plan}", &format_numbered(&ctx.plan))
        .replace("{step_number}", &(ctx.step_index + 1).to_string())
        .replace("{instruction}", &ctx.instruction)
        .replace("{completed}", &format_numbered(&ctx.completed_steps))
        .replace("{variables}", &format_variables(&ctx.variables))
        .replace("{results}", &format_results(&ctx.results, config.max_result_chars))
        .replace("{guidance}", &guidance)
}

/// Render the failure-analysis prompt
#[must_use]
pub fn render_error_analyzer(ctx: &DiagnosisContext, config: &GatewayConfig) -> String {
    ERROR_TEMPLATE
        .replace("{instruction}", &ctx.instruction)
        .replace("{code}", &ctx.code)
        .replace("{stderr}", &clip(&ctx.stderr, config.max_result_chars))
        .replace("{variables}", &format_variables(&ctx.variables))
        .replace("{results}", &format_results(&ctx.results, config.max_result_chars))
        .replace("{profile}", &profile_json(&ctx.profile))
}

/// Render the chart-generation prompt
#[must_use]
pub fn render_chart_generator(ctx: &ChartContext, config: &GatewayConfig) -> String {
    let guidance = match &ctx.guidance {
        Some(g) => format!("Diagnosis: {}\nSuggestion: {}", g.diagnosis, g.suggestion),
        None => "(no previous errors)".to_string(),
    };
    CHART_TEMPLATE
        .replace("{query}", &ctx.query)
        .replace("{variables}", &format_variables(&ctx.variables))
        .replace("{results}", &format_results(&ctx.results, config.max_result_chars))
        .replace("{final_table}", &value_json(&ctx.final_table))
        .replace("{guidance}", &guidance)
}

/// Render the answer-synthesis prompt
#[must_use]
pub fn render_final_responder(ctx: &SummaryContext, _config: &GatewayConfig) -> String {
    SUMMARY_TEMPLATE
        .replace("{query}", &ctx.query)
        .replace("{final_table}", &value_json(&ctx.final_table))
        .replace("{chart_available}", if ctx.chart_available { "yes" } else { "no" })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HistoryTurn;
    use serde_json::json;

    fn turns(n: usize) -> Vec<HistoryTurn> {
        (0..n)
            .map(|i| HistoryTurn {
                query: format!("q{i}"),
                answer: format!("a{i}"),
            })
            .collect()
    }

    #[test]
    fn planner_prompt_carries_query_and_profile() {
        let ctx = PlanContext {
            query: "top 5 drivers by fuel use".to_string(),
            history: Vec::new(),
            profile: json!({"columns": [{"name": "Driver"}]}),
        };
        let prompt = render_planner(&ctx, &GatewayConfig::default());

        assert!(prompt.contains("top 5 drivers by fuel use"));
        assert!(prompt.contains("\"Driver\""));
        assert!(prompt.contains("(no prior conversation)"));
    }

    #[test]
    fn history_is_windowed_to_the_most_recent_turns() {
        let config = GatewayConfig::default().with_history_window(2);
        let rendered = format_history(&turns(5), config.history_window);

        assert!(!rendered.contains("q0"));
        assert!(!rendered.contains("q2"));
        assert!(rendered.contains("q3"));
        assert!(rendered.contains("q4"));
    }

    #[test]
    fn results_are_clipped_at_a_char_boundary() {
        let long = "é".repeat(50);
        let clipped = clip(&long, 10);

        assert!(clipped.starts_with(&"é".repeat(10)));
        assert!(clipped.ends_with("[truncated]"));
    }

    #[test]
    fn code_prompt_numbers_the_current_step_from_one() {
        let ctx = CodeContext {
            profile: json!({}),
            plan: vec!["first".into(), "second".into()],
            step_index: 1,
            instruction: "second".to_string(),
            completed_steps: vec!["first".into()],
            variables: vec!["df".into()],
            results: Vec::new(),
            guidance: None,
        };
        let prompt = render_code_generator(&ctx, &GatewayConfig::default());

        assert!(prompt.contains("step 2"));
        assert!(prompt.contains("1. first\n2. second"));
        assert!(prompt.contains("(no previous errors)"));
    }

    #[test]
    fn chart_prompt_carries_guidance_on_a_retry() {
        let ctx = ChartContext {
            query: "fuel use per driver".to_string(),
            variables: vec!["df".into(), "df_grouped".into()],
            results: Vec::new(),
            final_table: json!([{"driver": "a", "total": 3}]),
            guidance: Some(crate::types::ErrorDiagnosis {
                diagnosis: "column 'missing' does not exist".to_string(),
                suggestion: "plot the 'total' column instead".to_string(),
            }),
        };
        let prompt = render_chart_generator(&ctx, &GatewayConfig::default());

        assert!(prompt.contains("column 'missing' does not exist"));
        assert!(prompt.contains("plot the 'total' column instead"));

        let fresh = ChartContext { guidance: None, ..ctx };
        let prompt = render_chart_generator(&fresh, &GatewayConfig::default());
        assert!(prompt.contains("(no previous errors)"));
    }

    #[test]
    fn error_prompt_embeds_code_and_stderr() {
        let ctx = DiagnosisContext {
            instruction: "group rows".to_string(),
            code: "df.groupby('drver')".to_string(),
            stderr: "KeyError: 'drver'".to_string(),
            variables: vec!["df".into()],
            results: Vec::new(),
            profile: json!({}),
        };
        let prompt = render_error_analyzer(&ctx, &GatewayConfig::default());

        assert!(prompt.contains("df.groupby('drver')"));
        assert!(prompt.contains("KeyError"));
    }
}
