//! End-to-End Orchestration Tests
//!
//! Whole plans run through the orchestrator against mock handlers, checking
//! phase ordering, admission limits, failure recovery and the shape of the
//! event stream. Timing-sensitive cases run on paused tokio time.

use serde_json::json;
use std::time::Duration;
use tessera::{
    EventKind, ExecutionError, FallbackPolicy, HandlerError, OrchestratorConfig,
    OrchestratorError, Plan, PlanError, RetryPolicy, Step, StepError, StepOutcome,
};
use tessera_testing::{
    ConcurrencyProbe, MockHandler, TestHarness, assert_well_ordered, count_by_name, phase_layout,
};
use tokio::time::Instant;

/// A(100ms, search) and B(150ms, recommend) feed C(merge).
#[tokio::test(start_paused = true)]
async fn test_two_phase_plan_waits_for_slowest_dependency() {
    let search = MockHandler::new()
        .with_delay(Duration::from_millis(100))
        .with_data(json!({"hits": 3}));
    let recommend = MockHandler::new()
        .with_delay(Duration::from_millis(150))
        .with_data(json!({"items": ["x"]}));
    let merge = MockHandler::new();
    let harness = TestHarness::builder()
        .handler("search", search.clone())
        .handler("recommend", recommend.clone())
        .handler("merge", merge.clone())
        .build()
        .unwrap();

    let plan = Plan::builder()
        .step(Step::builder("a", "search"))
        .step(Step::builder("b", "recommend"))
        .step(Step::builder("c", "merge").depends_on(["a", "b"]))
        .build()
        .unwrap();

    let started = Instant::now();
    let run = harness.run(plan).await.unwrap();

    assert!(run.outcome.is_success());
    assert_well_ordered(&run.events);
    assert_eq!(
        phase_layout(&run.events),
        vec![vec!["a".to_string(), "b".to_string()], vec!["c".to_string()]]
    );

    let c_started = merge.started_at("c").unwrap();
    assert!(c_started - started >= Duration::from_millis(150));
    // A and B ran concurrently rather than back to back.
    assert!(c_started - started < Duration::from_millis(250));

    let upstream = &merge.calls()[0].upstream;
    assert_eq!(upstream.len(), 2);
    assert_eq!(run.outcome.snapshot.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_ceiling_holds_under_load() {
    let probe = ConcurrencyProbe::new();
    let search = MockHandler::new()
        .with_delay(Duration::from_millis(100))
        .with_probe(probe.clone());
    let harness = TestHarness::builder()
        .handler_with("search", "primary", 0, 2, search.clone())
        .build()
        .unwrap();

    let plan = (1..=5)
        .fold(Plan::builder(), |plan, i| {
            plan.step(Step::builder(format!("s{i}"), "search"))
        })
        .build()
        .unwrap();

    let run = harness.run(plan).await.unwrap();

    assert!(run.outcome.is_success());
    assert_eq!(search.call_count(), 5);
    assert_eq!(probe.max(), 2);
    // Five 100ms steps two at a time need three rounds.
    assert!(run.elapsed >= Duration::from_millis(300));

    let metrics = harness
        .orchestrator()
        .queue_metrics(&tessera::CapabilityName::new_unchecked("search"));
    assert_eq!(metrics.total_admitted, 5);
    assert_eq!(metrics.running, 0);
}

#[tokio::test]
async fn test_cycle_rejected_without_admissions() {
    let search = MockHandler::new();
    let harness = TestHarness::builder()
        .handler("search", search.clone())
        .build()
        .unwrap();

    let plan = Plan::builder()
        .step(Step::builder("a", "search").depends_on(["c"]))
        .step(Step::builder("b", "search").depends_on(["a"]))
        .step(Step::builder("c", "search").depends_on(["b"]))
        .step(Step::builder("free", "search"))
        .build()
        .unwrap();

    let err = harness.run(plan).await.unwrap_err();
    match err {
        OrchestratorError::Plan(PlanError::DependencyCycle { steps }) => {
            let names: Vec<_> = steps.iter().map(|s| s.as_str()).collect();
            assert_eq!(names, vec!["a", "b", "c"]);
        }
        other => panic!("expected a cycle, got {other:?}"),
    }
    assert_eq!(search.call_count(), 0);
    assert_eq!(
        harness.orchestrator().global_queue_metrics().total_admitted,
        0
    );
}

#[tokio::test]
async fn test_unknown_capability_rejected() {
    let harness = TestHarness::builder()
        .handler("search", MockHandler::new())
        .build()
        .unwrap();
    let plan = Plan::builder()
        .step(Step::builder("a", "translate"))
        .build()
        .unwrap();

    let err = harness.run(plan).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Plan(PlanError::CapabilityNotFound { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_retry_then_success_counts_attempts() {
    let search = MockHandler::new().failing_times(2);
    let harness = TestHarness::builder()
        .handler("search", search.clone())
        .build()
        .unwrap();
    let plan = Plan::builder()
        .step(
            Step::builder("a", "search")
                .retry(RetryPolicy::new(2, Duration::from_millis(50), 2.0)),
        )
        .build()
        .unwrap();

    let run = harness.run(plan).await.unwrap();

    assert!(run.outcome.is_success());
    assert_eq!(run.outcome.summary.step("a").unwrap().attempts, 3);
    assert!(run.elapsed >= Duration::from_millis(150));
    let attempts: Vec<u32> = search.calls().iter().map(|c| c.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_fall_back_to_alternate_handler() {
    let primary = MockHandler::new().always_failing();
    let backup = MockHandler::new().with_records(vec![("doc", json!("from backup"), 0.4)]);
    let harness = TestHarness::builder()
        .handler_with("search", "primary", 10, usize::MAX, primary.clone())
        .handler_with("search", "backup", 0, usize::MAX, backup.clone())
        .build()
        .unwrap();
    let plan = Plan::builder()
        .step(
            Step::builder("a", "search")
                .retry(RetryPolicy::new(1, Duration::from_millis(10), 1.0)),
        )
        .build()
        .unwrap();

    let run = harness.run(plan).await.unwrap();

    assert!(run.outcome.is_success());
    assert_eq!(primary.call_count(), 2);
    assert_eq!(backup.call_count(), 1);
    let summary = run.outcome.summary.step("a").unwrap();
    assert_eq!(summary.attempts, 3);
    assert_eq!(summary.handler_id.as_ref().unwrap().as_str(), "backup");
    assert_eq!(run.outcome.snapshot[0].payload, json!("from backup"));
}

#[tokio::test(start_paused = true)]
async fn test_never_succeeding_step_fails_plan() {
    let primary = MockHandler::new()
        .always_failing()
        .with_failure(HandlerError::invalid_input("bad query"));
    let downstream = MockHandler::new();
    let harness = TestHarness::builder()
        .handler("search", primary.clone())
        .handler("merge", downstream.clone())
        .build()
        .unwrap();
    let plan = Plan::builder()
        .step(
            Step::builder("a", "search")
                .retry(RetryPolicy::new(2, Duration::from_millis(10), 2.0)),
        )
        .step(Step::builder("b", "merge").depends_on(["a"]))
        .fallback(FallbackPolicy::None)
        .build()
        .unwrap();

    let run = harness.run(plan).await.unwrap();

    assert_well_ordered(&run.events);
    assert_eq!(primary.call_count(), 3);
    assert!(!downstream.was_called_for("b"));
    match &run.outcome.error {
        Some(ExecutionError::RequiredStepFailed { step, source }) => {
            assert_eq!(step.as_str(), "a");
            assert!(matches!(
                source,
                StepError::HandlerFailed {
                    source: HandlerError::InvalidInput { .. },
                    ..
                }
            ));
        }
        other => panic!("expected a required step failure, got {other:?}"),
    }
    assert!(run.outcome.clone().into_result().is_err());
    assert_eq!(
        run.outcome.summary.step("b").unwrap().outcome,
        StepOutcome::Skipped
    );
    assert!(matches!(
        run.terminal().unwrap().kind,
        EventKind::Error { phase: Some(0), .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_optional_failure_degrades_but_completes() {
    let search = MockHandler::new();
    let flaky = MockHandler::new().always_failing();
    let harness = TestHarness::builder()
        .handler("search", search)
        .handler("recommend", flaky)
        .build()
        .unwrap();
    let plan = Plan::builder()
        .step(Step::builder("a", "search"))
        .step(
            Step::builder("b", "recommend")
                .optional()
                .retry(RetryPolicy::none()),
        )
        .build()
        .unwrap();

    let run = harness.run(plan).await.unwrap();

    assert!(run.outcome.is_success());
    assert!(run.outcome.degraded);
    assert_eq!(run.outcome.outcome_label(), "degraded");
    assert_eq!(run.outcome.failures.len(), 1);
    assert!(!run.outcome.failures[0].required);
    assert!(matches!(
        run.terminal().unwrap().kind,
        EventKind::Complete { degraded: true, .. }
    ));

    let records = run.outcome.into_result().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].key, "a");
}

#[tokio::test(start_paused = true)]
async fn test_plan_timeout_terminates_in_flight_steps() {
    let slow = MockHandler::new().with_delay(Duration::from_secs(10));
    let harness = TestHarness::builder()
        .handler("search", slow)
        .build()
        .unwrap();
    let plan = Plan::builder()
        .step(Step::builder("a", "search").timeout(Duration::from_secs(60)))
        .step(Step::builder("b", "search").depends_on(["a"]))
        .timeout(Duration::from_millis(500))
        .build()
        .unwrap();

    let run = harness.run(plan).await.unwrap();

    assert_well_ordered(&run.events);
    assert_eq!(
        run.outcome.error,
        Some(ExecutionError::PlanTimeout { timeout_ms: 500 })
    );
    assert_eq!(run.outcome.outcome_label(), "timeout");
    assert!(run.elapsed < Duration::from_secs(1));
    assert!(run.events.iter().any(|e| matches!(
        &e.kind,
        EventKind::StepError { step_id, error: StepError::Terminated { .. }, .. }
            if step_id.as_str() == "a"
    )));
    assert_eq!(
        run.outcome.summary.step("a").unwrap().outcome,
        StepOutcome::Terminated
    );
    assert_eq!(
        run.outcome.summary.step("b").unwrap().outcome,
        StepOutcome::Skipped
    );
}

#[tokio::test(start_paused = true)]
async fn test_step_timeout_is_retried() {
    let slow = MockHandler::new().with_delay(Duration::from_secs(5));
    let harness = TestHarness::builder()
        .handler("search", slow.clone())
        .build()
        .unwrap();
    let plan = Plan::builder()
        .step(
            Step::builder("a", "search")
                .timeout(Duration::from_millis(100))
                .retry(RetryPolicy::new(1, Duration::from_millis(10), 1.0))
                .optional(),
        )
        .build()
        .unwrap();

    let run = harness.run(plan).await.unwrap();

    assert_eq!(slow.call_count(), 2);
    assert!(run.outcome.degraded);
    assert!(matches!(
        run.outcome.failures[0].error,
        StepError::StepTimeout {
            timeout_ms: 100,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_admission_timeout_fails_waiting_step() {
    let config = OrchestratorConfig::builder()
        .admission_timeout(Duration::from_millis(50))
        .build()
        .unwrap();
    let slow = MockHandler::new().with_delay(Duration::from_secs(1));
    let harness = TestHarness::builder()
        .config(config)
        .handler_with("search", "primary", 0, 1, slow)
        .build()
        .unwrap();
    let plan = Plan::builder()
        .step(Step::builder("a", "search").optional().retry(RetryPolicy::none()))
        .step(Step::builder("b", "search").optional().retry(RetryPolicy::none()))
        .build()
        .unwrap();

    let run = harness.run(plan).await.unwrap();

    assert!(run.outcome.degraded);
    assert_eq!(run.outcome.failures.len(), 1);
    assert!(matches!(
        run.outcome.failures[0].error,
        StepError::AdmissionTimeout { waited_ms, .. } if waited_ms >= 50
    ));
    assert_eq!(count_by_name(&run.events)["step_complete"], 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_between_phases() {
    let search = MockHandler::new().with_delay(Duration::from_millis(100));
    let merge = MockHandler::new();
    let harness = TestHarness::builder()
        .handler("search", search)
        .handler("merge", merge.clone())
        .build()
        .unwrap();
    let plan = Plan::builder()
        .step(Step::builder("a", "search"))
        .step(Step::builder("b", "merge").depends_on(["a"]))
        .build()
        .unwrap();

    let handle = harness.orchestrator().submit(plan).unwrap();
    let cancel = handle.cancellation();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });
    let (events, outcome) = handle.collect_all().await.unwrap();

    assert_well_ordered(&events);
    assert_eq!(outcome.error, Some(ExecutionError::PlanCancelled));
    assert_eq!(merge.call_count(), 0);
    // The in-flight phase drained; its record survives.
    assert_eq!(outcome.snapshot.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_progress_events_are_streamed_in_order() {
    let search = MockHandler::new()
        .with_delay(Duration::from_millis(40))
        .with_progress();
    let harness = TestHarness::builder()
        .handler("search", search)
        .build()
        .unwrap();
    let plan = Plan::builder()
        .step(Step::builder("a", "search"))
        .build()
        .unwrap();

    let run = harness.run(plan).await.unwrap();

    assert_well_ordered(&run.events);
    assert_eq!(
        run.names(),
        vec![
            "metadata",
            "phase_start",
            "step_start",
            "step_progress",
            "step_progress",
            "step_complete",
            "phase_complete",
            "complete",
        ]
    );
    assert!(run.position("step_start", "a") < run.position("step_complete", "a"));
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_records_merge_across_sources() {
    let search = MockHandler::new().with_records(vec![
        ("doc-1", json!({"title": "first"}), 0.8),
        ("doc-2", json!({"title": "second"}), 0.5),
    ]);
    let recommend = MockHandler::new().with_records(vec![("doc-1", json!({"title": "dup"}), 0.4)]);
    let harness = TestHarness::builder()
        .handler("search", search)
        .handler("recommend", recommend)
        .build()
        .unwrap();
    let plan = Plan::builder()
        .step(Step::builder("a", "search"))
        .step(Step::builder("b", "recommend").depends_on(["a"]))
        .build()
        .unwrap();

    let run = harness.run(plan).await.unwrap();
    let snapshot = run.outcome.snapshot;

    assert_eq!(snapshot.len(), 2);
    let doc1 = snapshot.iter().find(|r| r.key == "doc-1").unwrap();
    assert_eq!(doc1.sources.len(), 2);
    assert_eq!(doc1.payload, json!({"title": "first"}));
    assert!((doc1.score - 0.6).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn test_unhealthy_primary_is_bypassed() {
    let primary = MockHandler::new();
    let backup = MockHandler::new();
    let harness = TestHarness::builder()
        .handler_with("search", "primary", 10, usize::MAX, primary.clone())
        .handler_with("search", "backup", 0, usize::MAX, backup.clone())
        .build()
        .unwrap();

    primary.set_healthy(false);
    let report = harness.orchestrator().probe_health().await;
    assert_eq!(report.unhealthy, 1);

    let plan = Plan::builder()
        .step(Step::builder("a", "search"))
        .build()
        .unwrap();
    let run = harness.run(plan).await.unwrap();

    assert!(run.outcome.is_success());
    assert_eq!(primary.call_count(), 0);
    assert_eq!(backup.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_events_serialize_with_snake_case_tags() {
    let harness = TestHarness::builder()
        .handler("search", MockHandler::new())
        .build()
        .unwrap();
    let plan = Plan::builder()
        .step(Step::builder("a", "search"))
        .build()
        .unwrap();

    let run = harness.run(plan).await.unwrap();
    let wire: Vec<serde_json::Value> = run
        .events
        .iter()
        .map(|e| serde_json::to_value(e).unwrap())
        .collect();

    assert_eq!(wire[0]["type"], "metadata");
    assert_eq!(wire[0]["step_count"], 1);
    assert_eq!(wire[2]["type"], "step_start");
    assert_eq!(wire[2]["step_id"], "a");
    assert_eq!(wire.last().unwrap()["type"], "complete");
    assert!(wire.iter().all(|e| e["plan_id"] == wire[0]["plan_id"]));
}
