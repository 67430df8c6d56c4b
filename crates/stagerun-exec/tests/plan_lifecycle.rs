use std::sync::Arc;

use stagerun_core::error::StagerunError;
use stagerun_core::event::EventBus;
use stagerun_core::metrics::MetricStore;
use stagerun_core::traits::Unit;
use stagerun_core::types::{DataContext, ExecContext, LifecycleCall, PlanEvent, SplitPoints, Status};
use stagerun_exec::Plan;
use stagerun_test_utils::{CallLog, Outcome, ScriptedSource, ScriptedUnit};

fn store(bundle: &str) -> Arc<MetricStore> {
    Arc::new(MetricStore::new(bundle))
}

async fn execute(plan: &mut Plan, bundle: &str) -> stagerun_core::Result<()> {
    plan.execute(&ExecContext::new(), bundle, DataContext::empty(), store(bundle))
        .await
}

#[tokio::test]
async fn test_single_root_runs_phases_in_order() {
    let log = CallLog::new();
    let units: Vec<Arc<dyn Unit>> = vec![Arc::new(ScriptedUnit::root("r", &log))];
    let mut plan = Plan::new("p1", units).unwrap();

    execute(&mut plan, "b1").await.unwrap();

    assert_eq!(
        log.entries(),
        vec!["r:Up", "r:StartBundle", "r:Drive", "r:FinishBundle"]
    );
    assert_eq!(plan.status(), Status::Up);
}

#[tokio::test]
async fn test_bring_up_happens_once_across_bundles() {
    let log = CallLog::new();
    let units: Vec<Arc<dyn Unit>> = vec![
        Arc::new(ScriptedUnit::new("leaf", &log)),
        Arc::new(ScriptedUnit::root("r", &log)),
    ];
    let mut plan = Plan::new("p1", units).unwrap();

    for bundle in ["b1", "b2", "b3"] {
        execute(&mut plan, bundle).await.unwrap();
        assert_eq!(plan.status(), Status::Up);
    }

    assert_eq!(log.count("leaf", LifecycleCall::Up), 1);
    assert_eq!(log.count("r", LifecycleCall::Up), 1);
    assert_eq!(log.count("r", LifecycleCall::StartBundle), 3);
    assert_eq!(log.count("r", LifecycleCall::Drive), 3);
    assert_eq!(log.count("r", LifecycleCall::FinishBundle), 3);
    // Non-root units never see bundle phases.
    assert_eq!(log.count("leaf", LifecycleCall::Drive), 0);
}

#[tokio::test]
async fn test_each_phase_covers_all_roots_before_next_phase() {
    let log = CallLog::new();
    let units: Vec<Arc<dyn Unit>> = vec![
        Arc::new(ScriptedUnit::root("a", &log)),
        Arc::new(ScriptedUnit::root("b", &log)),
    ];
    let mut plan = Plan::new("p1", units).unwrap();
    execute(&mut plan, "b1").await.unwrap();

    assert_eq!(
        log.entries(),
        vec![
            "a:Up",
            "b:Up",
            "a:StartBundle",
            "b:StartBundle",
            "a:Drive",
            "b:Drive",
            "a:FinishBundle",
            "b:FinishBundle",
        ]
    );
}

#[tokio::test]
async fn test_bring_up_failure_breaks_plan() {
    let log = CallLog::new();
    let units: Vec<Arc<dyn Unit>> = vec![
        Arc::new(ScriptedUnit::root("first", &log)),
        Arc::new(ScriptedUnit::new("second", &log).fail_on(LifecycleCall::Up, "boom")),
        Arc::new(ScriptedUnit::new("third", &log)),
    ];
    let mut plan = Plan::new("p1", units).unwrap();

    let err = execute(&mut plan, "b1").await.unwrap_err();
    assert!(err.to_string().contains("boom"));
    assert_eq!(plan.status(), Status::Broken);
    // Remaining units are not brought up and no phase runs.
    assert_eq!(log.entries(), vec!["first:Up", "second:Up"]);

    log.clear();
    let err = execute(&mut plan, "b2").await.unwrap_err();
    match err {
        StagerunError::InvalidStatus { plan: id, status } => {
            assert_eq!(id.as_str(), "p1");
            assert_eq!(status, Status::Broken);
        }
        other => panic!("expected InvalidStatus, got {:?}", other),
    }
    assert!(log.is_empty());
}

#[tokio::test]
async fn test_unavailable_bring_up_is_reported() {
    let log = CallLog::new();
    let units: Vec<Arc<dyn Unit>> = vec![Arc::new(
        ScriptedUnit::root("r", &log)
            .with_outcome(LifecycleCall::Up, Outcome::Unavailable("no slots".into())),
    )];
    let mut plan = Plan::new("p1", units).unwrap();

    match execute(&mut plan, "b1").await.unwrap_err() {
        StagerunError::Lifecycle { call, unit, source } => {
            assert_eq!(call, LifecycleCall::Up);
            assert_eq!(unit, "r");
            assert!(matches!(*source, StagerunError::Unavailable(_)));
        }
        other => panic!("expected Lifecycle, got {:?}", other),
    }
}

#[tokio::test]
async fn test_phase_failure_skips_later_roots_and_phases() {
    let log = CallLog::new();
    let units: Vec<Arc<dyn Unit>> = vec![
        Arc::new(ScriptedUnit::root("a", &log)),
        Arc::new(ScriptedUnit::root("b", &log).fail_on(LifecycleCall::Drive, "stage error")),
        Arc::new(ScriptedUnit::root("c", &log)),
    ];
    let mut plan = Plan::new("p1", units).unwrap();

    let err = execute(&mut plan, "b1").await.unwrap_err();
    assert!(err.to_string().contains("stage error"));
    assert_eq!(plan.status(), Status::Broken);

    assert_eq!(log.units_called(LifecycleCall::StartBundle), vec!["a", "b", "c"]);
    assert_eq!(log.units_called(LifecycleCall::Drive), vec!["a", "b"]);
    assert!(log.units_called(LifecycleCall::FinishBundle).is_empty());
}

#[tokio::test]
async fn test_start_bundle_failure_on_first_root() {
    let log = CallLog::new();
    let units: Vec<Arc<dyn Unit>> = vec![
        Arc::new(ScriptedUnit::root("a", &log).fail_on(LifecycleCall::StartBundle, "bad id")),
        Arc::new(ScriptedUnit::root("b", &log)),
    ];
    let mut plan = Plan::new("p1", units).unwrap();

    assert!(execute(&mut plan, "b1").await.is_err());
    assert_eq!(log.units_called(LifecycleCall::StartBundle), vec!["a"]);
    assert!(log.units_called(LifecycleCall::Drive).is_empty());
}

#[tokio::test]
async fn test_panicking_finish_is_contained() {
    let log = CallLog::new();
    let units: Vec<Arc<dyn Unit>> = vec![Arc::new(
        ScriptedUnit::root("sink", &log).panic_on(LifecycleCall::FinishBundle, "index out of range"),
    )];
    let mut plan = Plan::new("p1", units).unwrap();

    let err = execute(&mut plan, "b1").await.unwrap_err();
    assert!(err.is_panic());
    assert!(err.to_string().contains("index out of range"));
    assert_eq!(plan.status(), Status::Broken);

    // The plan can still be torn down.
    plan.down(&ExecContext::new()).await.unwrap();
    assert_eq!(plan.status(), Status::Down);
}

#[tokio::test]
async fn test_panicking_bring_up_is_contained() {
    let log = CallLog::new();
    let units: Vec<Arc<dyn Unit>> = vec![Arc::new(
        ScriptedUnit::root("r", &log).panic_on(LifecycleCall::Up, "driver missing"),
    )];
    let mut plan = Plan::new("p1", units).unwrap();

    let err = execute(&mut plan, "b1").await.unwrap_err();
    assert!(err.is_panic());
    assert_eq!(plan.status(), Status::Broken);
}

#[tokio::test]
async fn test_execute_after_down_is_invalid() {
    let log = CallLog::new();
    let units: Vec<Arc<dyn Unit>> = vec![Arc::new(ScriptedUnit::root("r", &log))];
    let mut plan = Plan::new("p1", units).unwrap();

    execute(&mut plan, "b1").await.unwrap();
    plan.down(&ExecContext::new()).await.unwrap();
    log.clear();

    let err = execute(&mut plan, "b2").await.unwrap_err();
    assert!(matches!(
        err,
        StagerunError::InvalidStatus {
            status: Status::Down,
            ..
        }
    ));
    assert!(log.is_empty());
}

#[tokio::test]
async fn test_down_is_idempotent() {
    let log = CallLog::new();
    let units: Vec<Arc<dyn Unit>> = vec![
        Arc::new(ScriptedUnit::root("a", &log)),
        Arc::new(ScriptedUnit::new("b", &log)),
    ];
    let mut plan = Plan::new("p1", units).unwrap();

    plan.down(&ExecContext::new()).await.unwrap();
    assert_eq!(log.units_called(LifecycleCall::Down), vec!["a", "b"]);

    plan.down(&ExecContext::new()).await.unwrap();
    assert_eq!(log.units_called(LifecycleCall::Down).len(), 2);
}

#[tokio::test]
async fn test_down_without_bring_up_tears_down_every_unit() {
    let log = CallLog::new();
    let units: Vec<Arc<dyn Unit>> = vec![
        Arc::new(ScriptedUnit::root("a", &log)),
        Arc::new(ScriptedUnit::new("b", &log)),
    ];
    let mut plan = Plan::new("p1", units).unwrap();

    plan.down(&ExecContext::new()).await.unwrap();
    assert_eq!(plan.status(), Status::Down);
    assert_eq!(log.count("a", LifecycleCall::Up), 0);
    assert_eq!(log.count("b", LifecycleCall::Down), 1);
}

#[tokio::test]
async fn test_down_single_failure_is_wrapped_with_plan_id() {
    let log = CallLog::new();
    let units: Vec<Arc<dyn Unit>> = vec![
        Arc::new(ScriptedUnit::root("a", &log).fail_on(LifecycleCall::Down, "leaked handle")),
        Arc::new(ScriptedUnit::new("b", &log)),
    ];
    let mut plan = Plan::new("p7", units).unwrap();

    let err = plan.down(&ExecContext::new()).await.unwrap_err();
    match &err {
        StagerunError::Teardown { plan, source } => {
            assert_eq!(plan.as_str(), "p7");
            assert!(source.to_string().contains("leaked handle"));
        }
        other => panic!("expected Teardown, got {:?}", other),
    }
    // No early stop: the second unit was still torn down.
    assert_eq!(log.units_called(LifecycleCall::Down), vec!["a", "b"]);
    assert_eq!(plan.status(), Status::Down);
}

#[tokio::test]
async fn test_down_multiple_failures_are_enumerated() {
    let log = CallLog::new();
    let units: Vec<Arc<dyn Unit>> = vec![
        Arc::new(ScriptedUnit::root("a", &log).fail_on(LifecycleCall::Down, "first failure")),
        Arc::new(ScriptedUnit::new("b", &log)),
        Arc::new(ScriptedUnit::new("c", &log).panic_on(LifecycleCall::Down, "second failure")),
    ];
    let mut plan = Plan::new("p7", units).unwrap();

    let err = plan.down(&ExecContext::new()).await.unwrap_err();
    match &err {
        StagerunError::TeardownMany { plan, errors } => {
            assert_eq!(plan.as_str(), "p7");
            assert_eq!(errors.len(), 2);
        }
        other => panic!("expected TeardownMany, got {:?}", other),
    }
    let msg = err.to_string();
    assert!(msg.contains("p7"));
    assert!(msg.contains("first failure"));
    assert!(msg.contains("second failure"));
}

#[tokio::test]
async fn test_split_without_source_fails() {
    let log = CallLog::new();
    let units: Vec<Arc<dyn Unit>> = vec![Arc::new(ScriptedUnit::root("r", &log))];
    let plan = Plan::new("p1", units).unwrap();

    for points in [SplitPoints::new(vec![], 0.0), SplitPoints::new(vec![10, 20], 0.5)] {
        let err = plan.split(&points).unwrap_err();
        assert!(matches!(err, StagerunError::SourceNotInitialized { .. }));
        assert!(err.to_string().contains("source not initialized"));
    }
}

#[tokio::test]
async fn test_split_delegates_to_source() {
    let log = CallLog::new();
    let source = Arc::new(ScriptedSource::new("read", "Read", &log).with_split(|splits, frac| {
        assert_eq!(splits, [10, 20]);
        assert_eq!(frac, 0.5);
        Ok(15)
    }));
    let units: Vec<Arc<dyn Unit>> = vec![source.clone()];
    let plan = Plan::new("p1", units).unwrap();

    assert_eq!(plan.split(&SplitPoints::new(vec![10, 20], 0.5)).unwrap(), 15);
    assert_eq!(source.split_requests(), vec![(vec![10, 20], 0.5)]);
}

#[tokio::test]
async fn test_split_failure_is_returned_unchanged() {
    let log = CallLog::new();
    let units: Vec<Arc<dyn Unit>> = vec![Arc::new(ScriptedSource::new("read", "Read", &log))];
    let plan = Plan::new("p1", units).unwrap();

    let err = plan.split(&SplitPoints::new(vec![3], 0.1)).unwrap_err();
    match err {
        StagerunError::SplitRejected(msg) => assert_eq!(msg, "scripted source rejects [3]"),
        other => panic!("expected SplitRejected, got {:?}", other),
    }
}

#[tokio::test]
async fn test_panicking_split_is_contained() {
    let log = CallLog::new();
    let source = Arc::new(
        ScriptedSource::new("read", "Read", &log).panic_on(LifecycleCall::Split, "cursor corrupted"),
    );
    let units: Vec<Arc<dyn Unit>> = vec![source.clone()];
    let plan = Plan::new("p1", units).unwrap();

    let err = plan.split(&SplitPoints::new(vec![4], 0.5)).unwrap_err();
    assert!(err.is_panic());
    match err {
        StagerunError::Panicked { call, unit, message } => {
            assert_eq!(call, LifecycleCall::Split);
            assert_eq!(unit, "read");
            assert_eq!(message, "cursor corrupted");
        }
        other => panic!("expected Panicked, got {:?}", other),
    }
    assert_eq!(source.split_requests().len(), 1);

    // The handle goes through the same boundary.
    let handle = plan.source_handle().unwrap();
    assert!(handle.split(&SplitPoints::new(vec![4], 0.5)).unwrap_err().is_panic());
    assert_eq!(plan.status(), Status::Initializing);
}

#[tokio::test]
async fn test_metrics_skip_panicking_progress() {
    let log = CallLog::new();
    let units: Vec<Arc<dyn Unit>> = vec![
        Arc::new(
            ScriptedSource::new("read", "Read", &log)
                .panic_on(LifecycleCall::Progress, "progress unavailable"),
        ),
        Arc::new(ScriptedUnit::root("count", &log).with_stage("Count").with_counter("seen", 2)),
    ];
    let mut plan = Plan::new("p1", units).unwrap();
    execute(&mut plan, "b1").await.unwrap();

    let handle = plan.source_handle().unwrap();
    assert!(handle.progress().unwrap_err().is_panic());

    let snapshot = plan.metrics();
    assert!(snapshot
        .stage("Read")
        .map_or(true, |read| read.processed_elements.is_none()));
    let count = snapshot.stage("Count").unwrap();
    assert_eq!(
        count.user_metric("seen").unwrap().data,
        stagerun_exec::MetricData::Counter { value: 2 }
    );
}

#[tokio::test]
async fn test_metrics_empty_plan() {
    let log = CallLog::new();
    let units: Vec<Arc<dyn Unit>> = vec![Arc::new(ScriptedUnit::root("r", &log))];
    let mut plan = Plan::new("p1", units).unwrap();

    assert!(plan.metrics().is_empty());
    execute(&mut plan, "b1").await.unwrap();
    assert!(plan.metrics().is_empty());
}

#[tokio::test]
async fn test_metrics_combine_progress_and_user_metrics() {
    let log = CallLog::new();
    let source = Arc::new(ScriptedSource::new("read", "Read", &log));
    let units: Vec<Arc<dyn Unit>> = vec![
        source.clone(),
        Arc::new(ScriptedUnit::root("count", &log).with_stage("Count").with_counter("seen", 3)),
    ];
    let mut plan = Plan::new("p1", units).unwrap();
    assert_eq!(plan.source_stage_id(), Some("Read"));

    execute(&mut plan, "b1").await.unwrap();
    source.set_count(42);

    let snapshot = plan.metrics();
    let read = snapshot.stage("Read").unwrap();
    let counts = &read.processed_elements.as_ref().unwrap().output_element_counts;
    assert_eq!(counts.get("out"), Some(&42));

    let count = snapshot.stage("Count").unwrap();
    assert!(count.processed_elements.is_none());
    assert_eq!(count.user.len(), 1);
    assert_eq!(count.user[0].name.name, "seen");
}

#[tokio::test]
async fn test_metrics_reflect_most_recent_bundle() {
    let log = CallLog::new();
    let units: Vec<Arc<dyn Unit>> = vec![Arc::new(
        ScriptedUnit::root("count", &log).with_stage("Count").with_counter("seen", 1),
    )];
    let mut plan = Plan::new("p1", units).unwrap();

    execute(&mut plan, "b1").await.unwrap();
    execute(&mut plan, "b2").await.unwrap();

    assert_eq!(plan.metrics_store().unwrap().bundle_id(), "b2");
    let snapshot = plan.metrics();
    let seen = snapshot.stage("Count").unwrap().user_metric("seen").unwrap();
    assert_eq!(seen.data, stagerun_exec::MetricData::Counter { value: 1 });
}

#[tokio::test]
async fn test_events_follow_lifecycle() {
    let log = CallLog::new();
    let bus = Arc::new(EventBus::new(64));
    let mut rx = bus.subscribe();
    let units: Vec<Arc<dyn Unit>> = vec![
        Arc::new(ScriptedUnit::root("r", &log).fail_on(LifecycleCall::Drive, "bad input")),
    ];
    let mut plan = Plan::new("p1", units).unwrap().with_event_bus(bus);

    assert!(execute(&mut plan, "b1").await.is_err());

    let mut transitions = Vec::new();
    let mut failed_call = None;
    while let Ok(event) = rx.try_recv() {
        match event {
            PlanEvent::StatusChanged { to, .. } => transitions.push(to),
            PlanEvent::UnitFailed { unit, call, .. } => {
                assert_eq!(unit, "r");
                failed_call = Some(call);
            }
            PlanEvent::BundleCompleted { .. } => panic!("bundle must not complete"),
        }
    }
    assert_eq!(transitions, vec![Status::Up, Status::Active, Status::Broken]);
    assert_eq!(failed_call, Some(LifecycleCall::Drive));
}
