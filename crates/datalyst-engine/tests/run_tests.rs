//! End-to-end run scenarios over scripted backends and environments:
//! the happy path, failure recovery, retry exhaustion, chart degradation,
//! cancellation, run exclusivity and environment loss.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::Notify;

use datalyst_engine::{EngineConfig, EngineError, Orchestrator, QueryRequest};
use datalyst_gateway::{BackendError, CompletionBackend, CompletionRequest, HistoryTurn};
use datalyst_sandbox::SandboxError;
use datalyst_stream::{Event, EventKind, RunId};
use datalyst_test_utils::{
    chart_output, chart_reply, code_reply, diagnosis_reply, plan_reply, stderr_output,
    stdout_output, table_output, MemorySnapshots, ScriptedBackend, ScriptedEnvironment,
    ScriptedLauncher, StaticCatalog,
};

fn engine_with(
    backend: Arc<dyn CompletionBackend>,
    launcher: Arc<ScriptedLauncher>,
) -> Orchestrator {
    let catalog = StaticCatalog::new().with_sample("fleet").with_sample("orders");
    Orchestrator::new(
        backend,
        Arc::new(catalog),
        Arc::new(MemorySnapshots::new()),
        launcher,
        EngineConfig::new(),
    )
}

async fn collect(engine: &Orchestrator, run_id: RunId) -> Vec<Arc<Event>> {
    let stream = engine.subscribe(run_id).await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), stream.collect::<Vec<_>>())
        .await
        .expect("run did not finish")
}

fn kinds(events: &[Arc<Event>]) -> Vec<EventKind> {
    events.iter().map(|e| e.kind).collect()
}

fn count(events: &[Arc<Event>], kind: EventKind) -> usize {
    events.iter().filter(|e| e.kind == kind).count()
}

fn final_answer(events: &[Arc<Event>]) -> Option<String> {
    events
        .iter()
        .find(|e| e.kind == EventKind::FinalResponse)
        .and_then(|e| e.payload.as_str().map(str::to_string))
}

#[tokio::test]
async fn happy_path_streams_the_full_trace_in_order() {
    let backend = ScriptedBackend::from_texts(vec![
        plan_reply(&["filter rows with fuel", "sum fuel per driver"]),
        code_reply("filter first", "df_f = df[df['Fuel'] > 0]\nprint(df_f)"),
        code_reply("now aggregate", "total = df_f['Fuel'].sum()\nprint(total)"),
        chart_reply("fig = px.bar(df_f)\nchart_html = fig.to_html(include_plotlyjs='cdn')\nprint(chart_html)"),
        "Driver A used the most fuel.".to_string(),
    ]);
    let env = ScriptedEnvironment::new(vec![
        Ok(stdout_output("(1200, 2)")),
        Ok(table_output(&["Driver", "Fuel"], 3)),
        Ok(stdout_output("4200.0")),
        Ok(chart_output(json!({"data": [], "layout": {}}))),
    ]);
    let engine = engine_with(backend, ScriptedLauncher::single(env));

    let accepted = engine
        .submit(QueryRequest::new("fleet", "who used the most fuel"))
        .await
        .unwrap();
    let events = collect(&engine, accepted.run_id).await;

    assert_eq!(
        kinds(&events),
        vec![
            EventKind::Log,   // planning narration
            EventKind::Log,   // plan announcement
            EventKind::Thought,
            EventKind::Code,
            EventKind::Table,
            EventKind::Thought,
            EventKind::Code,
            EventKind::Log,   // step 2 result narration
            EventKind::Log,   // chart narration
            EventKind::Code,  // chart code
            EventKind::Chart,
            EventKind::FinalResponse,
        ]
    );
    assert_eq!(events[1].payload["steps"][1], "sum fuel per driver");
    assert_eq!(events[2].step_index, Some(0));
    assert_eq!(events[4].payload["row_count"], 3);
    assert_eq!(events[9].step_index, None, "chart code has no step index");
    assert!(events.last().unwrap().is_terminal());
    assert_eq!(
        final_answer(&events).as_deref(),
        Some("Driver A used the most fuel.")
    );

    // The exchange landed in the session history.
    let entry = engine.store().get(accepted.session_id).unwrap();
    assert_eq!(entry.history().len(), 1);
    assert_eq!(entry.history()[0].answer, "Driver A used the most fuel.");
}

#[tokio::test]
async fn failed_attempts_are_diagnosed_and_retried() {
    // Three-step plan; step 2 fails twice (a typo, then a timeout) and
    // succeeds on its third attempt.
    let backend = ScriptedBackend::from_texts(vec![
        plan_reply(&[
            "filter rows with fuel",
            "sum fuel per driver",
            "rank the top 5 drivers",
        ]),
        code_reply("filter first", "df_f = df[df['Fuel'] > 0]\nprint(df_f)"),
        code_reply("first try", "per_driver = df_f.groupby('drver')['Fuel'].sum()\nprint(per_driver)"),
        diagnosis_reply("column 'drver' does not exist", "use 'Driver' with a capital D"),
        code_reply("second try", "per_driver = df_f.groupby('Driver')['Fuel'].sum()\nprint(per_driver)"),
        diagnosis_reply("the call timed out", "operate on fewer rows"),
        code_reply("third try", "per_driver = df_f.head(500).groupby('Driver')['Fuel'].sum()\nprint(per_driver)"),
        code_reply("rank them", "top5 = per_driver.nlargest(5)\nprint(top5)"),
        chart_reply("fig = px.bar(top5)\nprint(fig.to_html(include_plotlyjs='cdn'))"),
        "Recovered and answered.".to_string(),
    ]);
    let env = ScriptedEnvironment::new(vec![
        Ok(stdout_output("(1200, 2)")),
        Ok(stdout_output("(830, 2)")),
        Ok(stderr_output("KeyError: 'drver'")),
        Err(SandboxError::Timeout {
            timeout: Duration::from_secs(30),
        }),
        Ok(stdout_output("Driver A    4200.0")),
        Ok(table_output(&["Driver", "Fuel"], 5)),
        Ok(chart_output(json!({"data": []}))),
    ]);
    let engine = engine_with(backend.clone(), ScriptedLauncher::single(env));

    let accepted = engine
        .submit(QueryRequest::new(
            "fleet",
            "top 5 drivers by average fuel consumption per kilometer",
        ))
        .await
        .unwrap();
    let events = collect(&engine, accepted.run_id).await;

    let errors: Vec<&Arc<Event>> = events.iter().filter(|e| e.kind == EventKind::Error).collect();
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|e| !e.is_terminal()));
    assert!(errors.iter().all(|e| e.step_index == Some(1)));
    assert!(errors[0].payload["message"].as_str().unwrap().contains("KeyError"));
    assert!(errors[1].payload["message"].as_str().unwrap().contains("timed out"));

    // One reasoning pass per attempt: 1 + 3 + 1.
    assert_eq!(count(&events, EventKind::Thought), 5);
    assert_eq!(final_answer(&events).as_deref(), Some("Recovered and answered."));

    // The retry prompts carried each diagnosis forward.
    let requests = backend.requests();
    assert!(requests[4].user.contains("use 'Driver' with a capital D"));
    assert!(requests[6].user.contains("operate on fewer rows"));
}

#[tokio::test]
async fn exhausting_the_retry_budget_fails_with_the_last_diagnosis() {
    let backend = ScriptedBackend::from_texts(vec![
        plan_reply(&["sum fuel"]),
        code_reply("t1", "print(df['fuel'])"),
        diagnosis_reply("diagnosis one", "fix one"),
        code_reply("t2", "print(df['fuel'])"),
        diagnosis_reply("diagnosis two", "fix two"),
        code_reply("t3", "print(df['fuel'])"),
        diagnosis_reply("diagnosis three", "fix three"),
        code_reply("t4", "print(df['fuel'])"),
    ]);
    let env = ScriptedEnvironment::new(vec![
        Ok(stdout_output("(1200, 2)")),
        Ok(stderr_output("KeyError: a")),
        Ok(stderr_output("KeyError: b")),
        Ok(stderr_output("KeyError: c")),
        Ok(stderr_output("KeyError: d")),
    ]);
    let engine = engine_with(backend, ScriptedLauncher::single(env));

    let accepted = engine
        .submit(QueryRequest::new("fleet", "total fuel"))
        .await
        .unwrap();
    let events = collect(&engine, accepted.run_id).await;

    // Four failed attempts, then the terminal failure.
    assert_eq!(count(&events, EventKind::Error), 5);
    let last = events.last().unwrap();
    assert!(last.is_terminal());
    let message = last.payload["message"].as_str().unwrap();
    assert!(message.contains("diagnosis three"), "{message}");
    assert!(final_answer(&events).is_none());

    // A failed run records no exchange but keeps the session alive.
    let entry = engine.store().get(accepted.session_id).unwrap();
    assert!(entry.history().is_empty());
}

#[tokio::test]
async fn unusable_code_completions_are_recovered_like_failed_attempts() {
    let backend = ScriptedBackend::from_texts(vec![
        plan_reply(&["sum fuel"]),
        // Both the first reply and its format-reminder retry are unusable.
        "I would rather describe the code than write it.".to_string(),
        "Still prose, sorry.".to_string(),
        diagnosis_reply("the generator returned prose", "reply with the JSON object"),
        code_reply("take two", "total = df['Fuel'].sum()\nprint(total)"),
        chart_reply("fig = px.bar(df)\nprint(fig.to_html())"),
        "Recovered from a bad completion.".to_string(),
    ]);
    let env = ScriptedEnvironment::new(vec![
        Ok(stdout_output("(1200, 2)")),
        Ok(table_output(&["Driver", "Fuel"], 2)),
        Ok(chart_output(json!({"data": []}))),
    ]);
    let engine = engine_with(backend, ScriptedLauncher::single(env));

    let accepted = engine
        .submit(QueryRequest::new("fleet", "total fuel"))
        .await
        .unwrap();
    let events = collect(&engine, accepted.run_id).await;

    let errors: Vec<&Arc<Event>> = events.iter().filter(|e| e.kind == EventKind::Error).collect();
    assert_eq!(errors.len(), 1);
    assert!(!errors[0].is_terminal());
    assert!(errors[0].payload["message"]
        .as_str()
        .unwrap()
        .contains("code generation failed"));
    assert_eq!(
        final_answer(&events).as_deref(),
        Some("Recovered from a bad completion.")
    );
}

#[tokio::test]
async fn chart_failures_degrade_to_an_answer_without_a_chart() {
    let backend = ScriptedBackend::from_texts(vec![
        plan_reply(&["sum fuel"]),
        code_reply("aggregate", "total = df['Fuel'].sum()\nprint(total)"),
        chart_reply("fig = px.bar(missing)\nprint(fig.to_html())"),
        diagnosis_reply("missing is undefined", "use total instead"),
        chart_reply("fig = px.bar(total)\nprint(fig.to_html())"),
        "The answer, sans chart.".to_string(),
    ]);
    let env = ScriptedEnvironment::new(vec![
        Ok(stdout_output("(1200, 2)")),
        Ok(table_output(&["Driver", "Fuel"], 2)),
        Ok(stderr_output("NameError: name 'missing' is not defined")),
        Ok(stderr_output("TypeError: bar() takes a frame")),
    ]);
    let engine = engine_with(backend.clone(), ScriptedLauncher::single(env));

    let accepted = engine
        .submit(QueryRequest::new("fleet", "total fuel"))
        .await
        .unwrap();
    let events = collect(&engine, accepted.run_id).await;

    assert_eq!(count(&events, EventKind::Chart), 0);
    // Chart failures surface as narration, never as error events.
    assert_eq!(count(&events, EventKind::Error), 0);
    assert_eq!(final_answer(&events).as_deref(), Some("The answer, sans chart."));

    // The regenerated chart prompt carries the diagnosis; the first does not.
    let requests = backend.requests();
    assert!(requests[2].user.contains("(no previous errors)"));
    assert!(requests[4].user.contains("missing is undefined"));
    assert!(requests[4].user.contains("use total instead"));

    // The responder was told no chart is available.
    let summary_prompt = &requests.last().unwrap().user;
    assert!(summary_prompt.contains("Chart available:\nno"));
}

/// Wraps a scripted backend and parks one call until released, so tests can
/// act while a run is provably mid-flight.
struct GatedBackend {
    inner: Arc<ScriptedBackend>,
    gate: Notify,
    gate_at: usize,
    calls: AtomicUsize,
}

impl GatedBackend {
    fn new(inner: Arc<ScriptedBackend>, gate_at: usize) -> Arc<Self> {
        Arc::new(Self {
            inner,
            gate: Notify::new(),
            gate_at,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn release(&self) {
        self.gate.notify_one();
    }
}

#[async_trait]
impl CompletionBackend for GatedBackend {
    async fn complete(&self, request: CompletionRequest) -> Result<String, BackendError> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        if index == self.gate_at {
            self.gate.notified().await;
        }
        self.inner.complete(request).await
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn cancel_stops_the_run_at_the_next_boundary() {
    let scripted = ScriptedBackend::from_texts(vec![
        plan_reply(&["sum fuel"]),
        code_reply("aggregate", "total = df['Fuel'].sum()\nprint(total)"),
    ]);
    let backend = GatedBackend::new(scripted, 1); // park code generation
    let env = ScriptedEnvironment::new(vec![
        Ok(stdout_output("(1200, 2)")),
        Ok(stdout_output("4200.0")),
    ]);
    let engine = engine_with(backend.clone(), ScriptedLauncher::single(env));

    let accepted = engine
        .submit(QueryRequest::new("fleet", "total fuel"))
        .await
        .unwrap();

    // Wait until the run is inside the gated completion, then cancel.
    let probe = backend.clone();
    wait_for(move || probe.calls() == 2).await;
    assert!(engine.cancel(accepted.run_id));
    backend.release();

    let events = collect(&engine, accepted.run_id).await;
    let last = events.last().unwrap();
    assert!(last.is_terminal());
    assert_eq!(last.payload["message"], "analysis cancelled");
    assert!(final_answer(&events).is_none());

    // Once the run is gone, cancel has nothing to signal.
    wait_for(|| !engine.cancel(accepted.run_id)).await;
}

#[tokio::test]
async fn a_busy_session_rejects_a_second_run_then_frees_up() {
    let scripted = ScriptedBackend::from_texts(vec![plan_reply(&["sum fuel"])]);
    let backend = GatedBackend::new(scripted, 0); // park planning
    let env = ScriptedEnvironment::new(vec![Ok(stdout_output("(1200, 2)"))]);
    let engine = engine_with(backend.clone(), ScriptedLauncher::single(env));

    let accepted = engine
        .submit(QueryRequest::new("fleet", "total fuel"))
        .await
        .unwrap();

    let err = engine
        .submit(QueryRequest::new("fleet", "another question").with_session(accepted.session_id))
        .await
        .unwrap_err();
    assert!(err.is_run_in_progress());
    assert!(matches!(err, EngineError::Session(_)));

    // Let the first run finish (cancelled at its next boundary).
    assert!(engine.cancel(accepted.run_id));
    backend.release();
    collect(&engine, accepted.run_id).await;

    let mut reopened = None;
    for _ in 0..500 {
        match engine
            .submit(
                QueryRequest::new("fleet", "another question").with_session(accepted.session_id),
            )
            .await
        {
            Ok(second) => {
                reopened = Some(second);
                break;
            }
            Err(err) if err.is_run_in_progress() => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(err) => panic!("unexpected error: {err}"),
        }
    }
    let reopened = reopened.expect("session slot never freed");
    assert_eq!(reopened.session_id, accepted.session_id);
    assert_ne!(reopened.run_id, accepted.run_id);
}

#[tokio::test]
async fn environment_loss_fails_the_run_and_closes_the_session() {
    let backend = ScriptedBackend::from_texts(vec![
        plan_reply(&["sum fuel"]),
        code_reply("aggregate", "total = df['Fuel'].sum()\nprint(total)"),
    ]);
    let env = ScriptedEnvironment::new(vec![
        Ok(stdout_output("(1200, 2)")),
        Err(SandboxError::EnvironmentLost {
            reason: "interpreter exited".to_string(),
        }),
    ]);
    let engine = engine_with(backend, ScriptedLauncher::single(env.clone()));

    let accepted = engine
        .submit(QueryRequest::new("fleet", "total fuel"))
        .await
        .unwrap();
    let events = collect(&engine, accepted.run_id).await;

    let last = events.last().unwrap();
    assert!(last.is_terminal());
    assert!(last.payload["message"]
        .as_str()
        .unwrap()
        .contains("environment lost"));

    // The corrupted session is torn down in the background.
    wait_for(|| engine.store().get(accepted.session_id).is_none()).await;
    assert_eq!(env.shutdowns(), 1);
}

/// Routes completions to one of two scripts by a marker word in the prompt,
/// so two concurrent runs cannot steal each other's replies.
struct RoutingBackend {
    routes: Vec<(&'static str, Arc<ScriptedBackend>)>,
}

#[async_trait]
impl CompletionBackend for RoutingBackend {
    async fn complete(&self, request: CompletionRequest) -> Result<String, BackendError> {
        for (marker, backend) in &self.routes {
            if request.user.contains(marker) {
                return backend.complete(request).await;
            }
        }
        Err(BackendError::new("no route for prompt"))
    }
}

#[tokio::test]
async fn concurrent_sessions_run_independently() {
    let alpha = ScriptedBackend::from_texts(vec![
        plan_reply(&["alpha: sum fuel"]),
        code_reply("alpha thinks", "total = df['Fuel'].sum()\nprint(total)"),
        chart_reply("fig = px.bar(df)\nprint(fig.to_html())"),
        "answer alpha".to_string(),
    ]);
    let beta = ScriptedBackend::from_texts(vec![
        plan_reply(&["beta: count orders"]),
        code_reply("beta thinks", "n = len(df)\nprint(n)"),
        chart_reply("fig = px.bar(df)\nprint(fig.to_html())"),
        "answer beta".to_string(),
    ]);
    let backend = Arc::new(RoutingBackend {
        routes: vec![("alpha", alpha), ("beta", beta)],
    });
    let launcher = ScriptedLauncher::new(vec![
        ScriptedEnvironment::new(vec![
            Ok(stdout_output("(1200, 2)")),
            Ok(table_output(&["Driver", "Fuel"], 2)),
            Ok(chart_output(json!({"data": []}))),
        ]),
        ScriptedEnvironment::new(vec![
            Ok(stdout_output("(1200, 2)")),
            Ok(table_output(&["Driver", "Fuel"], 2)),
            Ok(chart_output(json!({"data": []}))),
        ]),
    ]);
    let engine = Arc::new(engine_with(backend, launcher));

    let a = engine
        .submit(QueryRequest::new("fleet", "alpha question"))
        .await
        .unwrap();
    let b = engine
        .submit(QueryRequest::new("orders", "beta question"))
        .await
        .unwrap();
    assert_ne!(a.session_id, b.session_id);

    let (events_a, events_b) =
        tokio::join!(collect(&engine, a.run_id), collect(&engine, b.run_id));

    assert_eq!(final_answer(&events_a).as_deref(), Some("answer alpha"));
    assert_eq!(final_answer(&events_b).as_deref(), Some("answer beta"));
    assert_eq!(engine.list_sessions().len(), 2);
}

#[tokio::test]
async fn completed_runs_replay_identically_and_verify() {
    let backend = ScriptedBackend::from_texts(vec![
        plan_reply(&["sum fuel"]),
        code_reply("aggregate", "total = df['Fuel'].sum()\nprint(total)"),
        chart_reply("fig = px.bar(df)\nprint(fig.to_html())"),
        "Replayable answer.".to_string(),
    ]);
    let env = ScriptedEnvironment::new(vec![
        Ok(stdout_output("(1200, 2)")),
        Ok(table_output(&["Driver", "Fuel"], 1)),
        Ok(chart_output(json!({"data": []}))),
    ]);
    let engine = engine_with(backend, ScriptedLauncher::single(env));

    let accepted = engine
        .submit(QueryRequest::new("fleet", "total fuel"))
        .await
        .unwrap();
    let live = collect(&engine, accepted.run_id).await;

    let replay_one = collect(&engine, accepted.run_id).await;
    let replay_two = collect(&engine, accepted.run_id).await;

    assert_eq!(live, replay_one);
    assert_eq!(replay_one, replay_two);
    engine.verify_run_integrity(accepted.run_id).await.unwrap();
}

#[tokio::test]
async fn submitted_history_seeds_only_fresh_sessions() {
    let backend = ScriptedBackend::from_texts(vec![
        // run 1 (fresh session, seeded history)
        plan_reply(&["sum fuel"]),
        code_reply("aggregate", "total = df['Fuel'].sum()\nprint(total)"),
        chart_reply("fig = px.bar(df)\nprint(fig.to_html())"),
        "first answer".to_string(),
        // run 2 (reused session, client history must be ignored)
        plan_reply(&["count rows"]),
        code_reply("count", "n = len(df)\nprint(n)"),
        chart_reply("fig = px.bar(df)\nprint(fig.to_html())"),
        "second answer".to_string(),
    ]);
    let env = ScriptedEnvironment::new(vec![
        Ok(stdout_output("(1200, 2)")),
        Ok(table_output(&["Driver", "Fuel"], 1)),
        Ok(chart_output(json!({"data": []}))),
        Ok(table_output(&["Driver", "Fuel"], 1)),
        Ok(chart_output(json!({"data": []}))),
    ]);
    let engine = engine_with(backend.clone(), ScriptedLauncher::single(env));

    let seeded = vec![HistoryTurn {
        query: "what columns exist".to_string(),
        answer: "Driver and Fuel".to_string(),
    }];
    let first = engine
        .submit(QueryRequest::new("fleet", "total fuel").with_history(seeded))
        .await
        .unwrap();
    collect(&engine, first.run_id).await;

    let planner_prompt = &backend.requests()[0].user;
    assert!(planner_prompt.contains("User: what columns exist"));
    assert!(planner_prompt.contains("Assistant: Driver and Fuel"));

    let ignored = vec![HistoryTurn {
        query: "should not appear".to_string(),
        answer: "ever".to_string(),
    }];
    let second = engine
        .submit(
            QueryRequest::new("fleet", "how many rows")
                .with_session(first.session_id)
                .with_history(ignored),
        )
        .await
        .unwrap();
    assert_eq!(second.session_id, first.session_id);
    collect(&engine, second.run_id).await;

    let second_planner = &backend.requests()[4].user;
    assert!(second_planner.contains("User: total fuel"));
    assert!(second_planner.contains("Assistant: first answer"));
    assert!(!second_planner.contains("should not appear"));
}
