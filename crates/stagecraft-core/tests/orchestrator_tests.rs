use pretty_assertions::assert_eq;
use serde_json::json;
use stagecraft_core::prelude::*;
use stagecraft_core::{BuildError, Clock, PhaseOutput, RunOutcome, RunQuery, Store};
use stagecraft_kernel::TopologyError;
use stagecraft_test_utils::*;
use std::sync::Arc;

fn orchestrator(registry: Registry) -> Orchestrator {
    Orchestrator::new(Arc::new(registry), Arc::new(TelemetryLedger::new())).unwrap()
}

#[tokio::test]
async fn single_mode_threads_payload_through_every_stage() {
    init_test_tracing();
    let orchestrator = orchestrator(three_stage_registry());

    let output = orchestrator
        .run(RunRequest::single(tid("T"), json!({"value": 1})))
        .await
        .unwrap();

    assert_eq!(
        stage_trace(&output.events),
        vec![
            "started:ingest",
            "completed:ingest",
            "started:analyze",
            "completed:analyze",
            "started:resolve",
            "completed:resolve",
        ]
    );
    assert!(output.events[0].is_run_marker());
    assert_eq!(
        output.payload(),
        Some(&json!({"value": 17, "trail": ["A", "B", "C"]}))
    );
    assert_eq!(output.diagnostics.stage_count, 3);
    assert_eq!(output.diagnostics.plugins_run, 3);
    assert_eq!(orchestrator.state(), RunState::Completed);
}

#[tokio::test]
async fn identical_runs_have_identical_stage_sequences() {
    let orchestrator = orchestrator(three_stage_registry());
    let first = orchestrator
        .run(RunRequest::single(tid("T"), json!({"value": 5})))
        .await
        .unwrap();
    let second = orchestrator
        .run(RunRequest::single(tid("T"), json!({"value": 5})))
        .await
        .unwrap();

    assert_ne!(first.run_id(), second.run_id());
    assert_eq!(stage_trace(&first.events), stage_trace(&second.events));
    assert_eq!(first.payload(), second.payload());
}

#[tokio::test]
async fn cancel_before_start_returns_only_run_marker() {
    let orchestrator = orchestrator(three_stage_registry());
    let token = CancellationToken::new();
    token.cancel();

    let err = orchestrator
        .run(RunRequest::single(tid("T"), json!({"value": 1})).with_cancel(token))
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(err.events.len(), 1);
    assert!(err.events[0].is_run_marker());
    assert_eq!(orchestrator.state(), RunState::Errored);
    assert!(orchestrator.ledger().snapshot(&tid("T")).top5.is_empty());
}

#[tokio::test]
async fn cancellation_is_observed_between_stages() {
    let token = CancellationToken::new();
    let mut registry = Registry::new();
    registry
        .register(cancelling_plugin("A", "ingest", &[], token.clone()))
        .unwrap();
    registry
        .register(passthrough_plugin("B", "analyze", &["A"]))
        .unwrap();
    let orchestrator = orchestrator(registry);

    let err = orchestrator
        .run(RunRequest::single(tid("T"), json!({})).with_cancel(token))
        .await
        .unwrap_err();

    // the cancelling plugin still runs to completion
    assert_eq!(
        stage_trace(&err.events),
        vec!["started:ingest", "completed:ingest"]
    );
    assert!(matches!(
        err.error,
        RunError::Cancelled { before: Some(ref s) } if s == &stage("analyze")
    ));
}

#[tokio::test]
async fn plugin_failure_stops_later_stages() {
    let mut registry = Registry::new();
    registry
        .register(step_plugin("A", "ingest", &[], |v| v + 1))
        .unwrap();
    registry
        .register(failing_plugin("B", "analyze", &["A"], "analyzer exploded"))
        .unwrap();
    registry
        .register(passthrough_plugin("C", "resolve", &["B"]))
        .unwrap();
    let orchestrator = orchestrator(registry);

    let err = orchestrator
        .run(RunRequest::single(tid("T"), json!({"value": 1})))
        .await
        .unwrap_err();

    assert_eq!(err.failed_plugin(), Some((&stage("analyze"), &pid("B"))));
    assert_eq!(
        stage_trace(&err.events),
        vec![
            "started:ingest",
            "completed:ingest",
            "started:analyze",
            "failed:analyze",
        ]
    );
    let failed = err.events.last().unwrap();
    assert_eq!(failed.detail.as_deref(), Some("analyzer exploded"));
    assert!(err.to_string().contains("analyzer exploded"));

    let snapshot = orchestrator.ledger().snapshot(&tid("T"));
    assert_eq!(snapshot.route_count("single/failed"), 1);
    assert_eq!(snapshot.stage_count(&stage("resolve")), 0);
    assert_eq!(orchestrator.state(), RunState::Errored);
}

#[tokio::test]
async fn canary_skips_stages_without_eligible_plugin() {
    let orchestrator = orchestrator(three_stage_registry());

    let output = orchestrator
        .run(RunRequest::canary(
            tid("T"),
            json!({"value": 1}),
            [pid("A"), pid("C")],
        ))
        .await
        .unwrap();

    assert_eq!(
        stage_trace(&output.events),
        vec![
            "started:ingest",
            "completed:ingest",
            "skipped:analyze",
            "started:resolve",
            "completed:resolve",
        ]
    );
    assert_eq!(
        output.payload(),
        Some(&json!({"value": -1, "trail": ["A", "C"]}))
    );
    assert_eq!(output.diagnostics.skipped, 1);
    assert_eq!(
        orchestrator
            .ledger()
            .snapshot(&tid("T"))
            .route_count("canary/skipped"),
        1
    );
}

#[tokio::test]
async fn canary_picks_first_eligible_plugin_of_stage() {
    let mut registry = Registry::new();
    registry
        .register(step_plugin("stable", "ingest", &[], |v| v + 1))
        .unwrap();
    registry
        .register(step_plugin("candidate", "ingest", &[], |v| v + 100))
        .unwrap();
    let orchestrator = orchestrator(registry);

    let single = orchestrator
        .run(RunRequest::single(tid("T"), json!({"value": 0})))
        .await
        .unwrap();
    assert_eq!(single.payload().unwrap()["value"], json!(1));

    let canary = orchestrator
        .run(RunRequest::canary(tid("T"), json!({"value": 0}), [pid("candidate")]))
        .await
        .unwrap();
    assert_eq!(canary.payload().unwrap()["value"], json!(100));
}

#[tokio::test]
async fn multi_mode_runs_independent_signals() {
    let mut registry = Registry::new();
    registry
        .register(step_plugin("L", "left", &[], |v| v + 1))
        .unwrap();
    registry
        .register(step_plugin("R", "right", &[], |v| v * 10))
        .unwrap();
    let orchestrator = orchestrator(registry);

    let output = orchestrator
        .run(RunRequest::multi(
            tid("T"),
            vec![
                Signal::new(stage("left"), json!({"value": 1})),
                Signal::new(stage("right"), json!({"value": 2})),
            ],
        ))
        .await
        .unwrap();

    let mut signals = output.signals().to_vec();
    assert_eq!(signals.len(), 2);
    signals.sort_by_key(|s| s.index);
    assert_eq!(signals[0].payload["value"], json!(2));
    assert_eq!(signals[0].plugins, vec![pid("L")]);
    assert_eq!(signals[1].payload["value"], json!(20));
    assert_eq!(signals[1].plugins, vec![pid("R")]);
    assert!(output.payload().is_none());
}

#[tokio::test]
async fn multi_mode_interleaves_signals_on_one_task() {
    let mut registry = Registry::new();
    registry.register(yielding_plugin("slow-a", "a", 3)).unwrap();
    registry.register(yielding_plugin("slow-b", "b", 3)).unwrap();
    let orchestrator = orchestrator(registry);

    let output = orchestrator
        .run(RunRequest::multi(
            tid("T"),
            vec![
                Signal::new(stage("a"), json!({})),
                Signal::new(stage("b"), json!({})),
            ],
        ))
        .await
        .unwrap();

    let kinds: Vec<EventKind> = output.stage_events().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::Started,
            EventKind::Started,
            EventKind::Completed,
            EventKind::Completed,
        ]
    );
    assert!(output.events.windows(2).all(|w| w[0].at <= w[1].at));
}

#[tokio::test]
async fn multi_mode_failure_halts_pending_plugins() {
    let mut registry = Registry::new();
    registry.register(yielding_plugin("Y", "slow", 3)).unwrap();
    registry
        .register(passthrough_plugin("Z", "slow", &[]))
        .unwrap();
    registry
        .register(failing_plugin("F", "bad", &[], "bad signal"))
        .unwrap();
    let orchestrator = orchestrator(registry);

    let err = orchestrator
        .run(RunRequest::multi(
            tid("T"),
            vec![
                Signal::new(stage("slow"), json!({})),
                Signal::new(stage("bad"), json!({})),
            ],
        ))
        .await
        .unwrap_err();

    assert_eq!(err.failed_plugin(), Some((&stage("bad"), &pid("F"))));
    assert!(err
        .events
        .iter()
        .all(|e| e.plugin_id.as_ref() != Some(&pid("Z"))));
}

#[tokio::test]
async fn multi_signal_without_plugins_is_skipped() {
    let orchestrator = orchestrator(three_stage_registry());

    let output = orchestrator
        .run(RunRequest::multi(
            tid("T"),
            vec![Signal::new(stage("unknown"), json!({"value": 9}))],
        ))
        .await
        .unwrap();

    assert_eq!(stage_trace(&output.events), vec!["skipped:unknown"]);
    assert_eq!(output.signals()[0].payload, json!({"value": 9}));
    assert!(output.signals()[0].plugins.is_empty());
}

#[tokio::test]
async fn multi_mode_cancel_before_start_returns_only_run_marker() {
    let orchestrator = orchestrator(three_stage_registry());
    let token = CancellationToken::new();
    token.cancel();
    let signals = vec![
        Signal::new(stage("ingest"), json!({"value": 1})),
        Signal::new(stage("analyze"), json!({"value": 2})),
    ];

    let err = orchestrator
        .run(RunRequest::multi(tid("T"), signals).with_cancel(token))
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(err.events.len(), 1);
    assert!(err.events[0].is_run_marker());
    assert_eq!(orchestrator.state(), RunState::Errored);
}

#[tokio::test]
async fn mismatched_input_is_rejected() {
    let orchestrator = orchestrator(three_stage_registry());

    let err = orchestrator
        .run(RunRequest::new(
            tid("T"),
            RunInput::Payload(json!({})),
            RunMode::Multi,
        ))
        .await
        .unwrap_err();

    assert!(matches!(err.error, RunError::InvalidInput { mode: "multi", .. }));
    assert_eq!(err.events.len(), 1);
}

#[tokio::test]
async fn streaming_delivers_each_phase_in_order() {
    let orchestrator = orchestrator(three_stage_registry());
    let (tx, mut rx) = orchestrator.phase_channel();

    let (result, phases) = tokio::join!(
        orchestrator.run_streaming(RunRequest::single(tid("T"), json!({"value": 1})), tx),
        async {
            let mut phases: Vec<PhaseOutput> = Vec::new();
            while let Some(phase) = rx.recv().await {
                phases.push(phase);
            }
            phases
        }
    );

    let output = result.unwrap();
    let stages: Vec<&str> = phases.iter().map(|p| p.stage.as_str()).collect();
    assert_eq!(stages, vec!["ingest", "analyze", "resolve"]);
    assert!(phases.iter().all(|p| p.run_id == output.run_id()));
    assert_eq!(phases.last().map(|p| &p.payload), output.payload());
    assert_eq!(phases[0].payload["value"], json!(2));
}

#[tokio::test]
async fn streaming_survives_dropped_receiver() {
    let orchestrator = orchestrator(three_stage_registry());
    let (tx, rx) = orchestrator.phase_channel();
    drop(rx);

    let output = orchestrator
        .run_streaming(RunRequest::single(tid("T"), json!({"value": 1})), tx)
        .await
        .unwrap();
    assert_eq!(output.payload().unwrap()["value"], json!(17));
}

#[tokio::test]
async fn leases_are_held_during_run_and_released_after() {
    let ledger = Arc::new(TelemetryLedger::new());
    let observed = Arc::clone(&ledger);
    let mut registry = Registry::new();
    registry
        .register(FnPlugin::sync(
            PluginManifest::new(pid("probe"), stage("ingest")),
            move |input| {
                anyhow::ensure!(observed.active_leases() == 1, "ledger not leased");
                Ok(input)
            },
        ))
        .unwrap();
    let registry = Arc::new(registry);
    let orchestrator = Orchestrator::new(Arc::clone(&registry), Arc::clone(&ledger)).unwrap();

    orchestrator
        .run(RunRequest::single(tid("T"), json!({})))
        .await
        .unwrap();
    assert_eq!(ledger.active_leases(), 0);
    assert_eq!(registry.active_leases(), 0);
}

#[tokio::test]
async fn leases_are_released_when_run_future_is_dropped() {
    let ledger = Arc::new(TelemetryLedger::new());
    let mut registry = Registry::new();
    registry
        .register(FnPlugin::new(
            PluginManifest::new(pid("stuck"), stage("ingest")),
            |_ctx, _input| std::future::pending::<anyhow::Result<Payload>>(),
        ))
        .unwrap();
    let registry = Arc::new(registry);
    let orchestrator = Orchestrator::new(Arc::clone(&registry), Arc::clone(&ledger)).unwrap();

    let timed_out = tokio::time::timeout(
        std::time::Duration::from_millis(20),
        orchestrator.run(RunRequest::single(tid("T"), json!({}))),
    )
    .await;

    assert!(timed_out.is_err());
    assert_eq!(registry.active_leases(), 0);
    assert_eq!(ledger.active_leases(), 0);
    assert_eq!(orchestrator.state(), RunState::Errored);
}

#[tokio::test]
async fn finished_runs_are_saved_to_store() {
    let store = Arc::new(MemoryStore::new());
    let orchestrator = Orchestrator::builder(
        Arc::new(three_stage_registry()),
        Arc::new(TelemetryLedger::new()),
    )
    .store(store.clone())
    .build()
    .unwrap();

    let ok = orchestrator
        .run(RunRequest::single(tid("T"), json!({"value": 1})))
        .await
        .unwrap();
    let token = CancellationToken::new();
    token.cancel();
    let err = orchestrator
        .run(RunRequest::single(tid("T"), json!({"value": 1})).with_cancel(token))
        .await
        .unwrap_err();

    assert_eq!(store.len(), 2);
    let saved = store.get(ok.run_id()).await.unwrap().unwrap();
    assert_eq!(saved.outcome, RunOutcome::Completed);
    assert_eq!(saved.events, ok.events);
    assert_eq!(saved.stage_count, 3);

    let errored = store.list(RunQuery::new().completed(false)).await.unwrap();
    assert_eq!(errored.len(), 1);
    assert_eq!(errored[0].context.run_id, err.run_id);
}

#[tokio::test]
async fn offline_store_does_not_fail_run() {
    let store = Arc::new(MemoryStore::new());
    store.set_offline(true);
    let orchestrator = Orchestrator::builder(
        Arc::new(three_stage_registry()),
        Arc::new(TelemetryLedger::new()),
    )
    .store(store.clone())
    .build()
    .unwrap();

    assert!(orchestrator
        .run(RunRequest::single(tid("T"), json!({"value": 1})))
        .await
        .is_ok());
    assert!(store.is_empty());
}

#[tokio::test]
async fn publisher_receives_events_tagged_with_run() {
    let publisher = Arc::new(RecordingPublisher::rejecting());
    let orchestrator = Orchestrator::builder(
        Arc::new(three_stage_registry()),
        Arc::new(TelemetryLedger::new()),
    )
    .publisher(publisher.clone())
    .build()
    .unwrap();

    let output = orchestrator
        .run(RunRequest::single(tid("T"), json!({"value": 1})))
        .await
        .unwrap();

    let received = publisher.received();
    assert_eq!(received.len(), output.events.len());
    assert!(received.iter().all(|e| e.run_id == output.run_id()));
    let events: Vec<LifecycleEvent> = received.into_iter().map(|e| e.event).collect();
    assert_eq!(events, output.events);
}

#[tokio::test]
async fn manual_clock_stamps_context_and_events() {
    let clock = Arc::new(ManualClock::default());
    let start = clock.now();
    let orchestrator = Orchestrator::builder(
        Arc::new(three_stage_registry()),
        Arc::new(TelemetryLedger::new()),
    )
    .clock(clock.clone())
    .build()
    .unwrap();

    let output = orchestrator
        .run(RunRequest::single(tid("T"), json!({"value": 1})))
        .await
        .unwrap();

    assert_eq!(output.context.started_at, start);
    assert!(output.events.iter().all(|e| e.at == start));
    let metric = orchestrator
        .ledger()
        .metric(&tid("T"), &stage("ingest"), "single/completed")
        .unwrap();
    assert_eq!(metric.last_seen, start);
}

#[tokio::test]
async fn windowed_snapshot_sees_only_later_runs() {
    let clock = Arc::new(ManualClock::default());
    let start = clock.now();
    let orchestrator = Orchestrator::builder(
        Arc::new(three_stage_registry()),
        Arc::new(TelemetryLedger::new()),
    )
    .clock(clock.clone())
    .build()
    .unwrap();

    orchestrator
        .run(RunRequest::single(tid("T"), json!({"value": 1})))
        .await
        .unwrap();
    clock.advance(chrono::Duration::hours(1));
    orchestrator
        .run(RunRequest::canary(tid("T"), json!({"value": 1}), [pid("A")]))
        .await
        .unwrap();

    let ledger = orchestrator.ledger();
    let full = ledger.snapshot(&tid("T"));
    assert!(full.route_count("single/completed") > 0);

    let window = ledger.snapshot_since(&tid("T"), start + chrono::Duration::minutes(30));
    assert!(window.total > 0);
    assert!(window.total < full.total);
    assert!(window.by_route.keys().all(|route| route.starts_with("canary/")));
}

#[tokio::test]
async fn disabled_publishing_sends_nothing() {
    let publisher = Arc::new(RecordingPublisher::new());
    let orchestrator = Orchestrator::builder(
        Arc::new(three_stage_registry()),
        Arc::new(TelemetryLedger::new()),
    )
    .publisher(publisher.clone())
    .config(EngineConfig::default().with_publish_events(false))
    .build()
    .unwrap();

    orchestrator
        .run(RunRequest::single(tid("T"), json!({"value": 1})))
        .await
        .unwrap();

    assert!(publisher.received().is_empty());
}

#[tokio::test]
async fn ledger_accumulates_across_runs_and_tenants() {
    let orchestrator = orchestrator(three_stage_registry());
    let (a, b, c) = tokio::join!(
        orchestrator.run(RunRequest::single(tid("acme"), json!({"value": 1}))),
        orchestrator.run(RunRequest::single(tid("acme"), json!({"value": 2}))),
        orchestrator.run(RunRequest::single(tid("globex"), json!({"value": 3}))),
    );
    assert!(a.is_ok() && b.is_ok() && c.is_ok());

    let acme = orchestrator.ledger().snapshot(&tid("acme"));
    assert_eq!(acme.stage_count(&stage("ingest")), 4);
    assert_eq!(acme.total, acme.by_stage.values().sum::<u64>());
    assert_eq!(acme.total, 12);
    assert_eq!(orchestrator.ledger().snapshot(&tid("globex")).total, 6);
}

#[tokio::test]
async fn disposed_ledger_does_not_fail_runs() {
    let orchestrator = orchestrator(three_stage_registry());
    assert!(orchestrator.ledger().dispose());

    let output = orchestrator
        .run(RunRequest::single(tid("T"), json!({"value": 1})))
        .await
        .unwrap();
    assert_eq!(output.events.len(), 7);
    assert_eq!(orchestrator.ledger().snapshot(&tid("T")).total, 0);
}

#[test]
fn cyclic_edges_fail_the_build_unless_allowed() {
    let mut registry = Registry::new();
    registry.register(passthrough_plugin("A", "ingest", &[])).unwrap();
    registry.register(passthrough_plugin("B", "analyze", &[])).unwrap();
    let registry = Arc::new(registry);
    let edges = [
        Edge::new(stage("ingest"), stage("analyze")),
        Edge::new(stage("analyze"), stage("ingest")),
    ];

    let err = Orchestrator::builder(Arc::clone(&registry), Arc::new(TelemetryLedger::new()))
        .edges(edges.clone())
        .build()
        .unwrap_err();
    assert!(matches!(
        err,
        BuildError::Topology(TopologyError::CycleDetected { .. })
    ));

    let orchestrator = Orchestrator::builder(registry, Arc::new(TelemetryLedger::new()))
        .edges(edges)
        .config(EngineConfig::new().with_allow_cycles(true))
        .build()
        .unwrap();
    assert!(orchestrator.plan().diagnostics.has_cycle);
    assert!(orchestrator.list_stages().len() < 2);
}

#[test]
fn list_stages_follows_plan_order() {
    let orchestrator = orchestrator(three_stage_registry());
    assert_eq!(
        orchestrator.list_stages(),
        &[stage("ingest"), stage("analyze"), stage("resolve")]
    );
    assert_eq!(orchestrator.state(), RunState::Idle);
}
