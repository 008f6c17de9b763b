//! Step ordering, failure isolation and event buffering of the pipeline executor.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use cob_core::error::CobError;
use cob_core::events::{EventEmitter, InMemoryEventSink};
use cob_core::locking::{LockManager, LockPolicy};
use cob_core::models::{ExecutionMap, ExecutionMapRegistry, Loan, LockOwner};
use cob_core::orchestration::{PipelineExecutor, PipelineOutcome, RunContext};
use cob_core::steps::BusinessStepRegistry;
use common::{date, execution_log, steps_for, ExecutionLog, RecordingStep, JOB};

struct Fixture {
    executor: PipelineExecutor<Loan>,
    locks: Arc<LockManager>,
    sink: Arc<InMemoryEventSink>,
    log: ExecutionLog,
}

/// One emitting recording step per `(order, name)` map entry
fn fixture(entries: &[(u32, &str)], failing: &[(&str, i64)], bulk_mode: bool) -> Fixture {
    let log = execution_log();
    let mut steps = BusinessStepRegistry::new();
    for (_, name) in entries {
        let failing_ids = failing
            .iter()
            .filter(|(step, _)| step == name)
            .map(|(_, id)| *id);
        steps.register(Arc::new(
            RecordingStep::new(name, &log).failing_for(failing_ids).emitting(),
        ));
    }

    let map = ExecutionMap::from_entries(JOB, entries.iter().map(|(o, n)| (*o, n.to_string())))
        .unwrap();
    let mut maps = ExecutionMapRegistry::new();
    maps.register(map);

    let locks = Arc::new(LockManager::in_memory(LockPolicy::default()));
    let sink = Arc::new(InMemoryEventSink::new());
    let executor = PipelineExecutor::new(
        Arc::new(steps),
        Arc::new(maps),
        Arc::clone(&locks),
        EventEmitter::new(sink.clone(), bulk_mode),
    );

    Fixture {
        executor,
        locks,
        sink,
        log,
    }
}

fn job_context() -> RunContext {
    RunContext::for_job(JOB, date(2023, 6, 30))
}

#[tokio::test]
async fn test_steps_run_in_ascending_order_regardless_of_registration() {
    let fx = fixture(&[(30, "C"), (10, "A"), (20, "B")], &[], true);
    let pipeline = fx.executor.resolve(JOB).unwrap();
    assert_eq!(pipeline.step_names(), vec!["A", "B", "C"]);

    let outcome = fx
        .executor
        .execute(&pipeline, Loan::new(1), &job_context(), LockOwner::Scheduled, &BTreeSet::new())
        .await
        .unwrap();

    let PipelineOutcome::Completed { entity, steps_run, events } = outcome else {
        panic!("pipeline should complete");
    };
    assert_eq!(steps_run, 3);
    assert_eq!(entity.days_overdue, 3);
    assert_eq!(entity.last_closed_business_date, Some(date(2023, 6, 30)));
    assert_eq!(steps_for(&fx.log, 1), vec!["A", "B", "C"]);

    // bulk mode holds events until the caller flushes
    assert!(fx.sink.is_empty());
    assert_eq!(events.flush().await.unwrap(), 3);
    assert_eq!(fx.sink.events_for(1).len(), 3);
}

#[tokio::test]
async fn test_failure_stops_pipeline_and_records_one_error_lock() {
    let fx = fixture(&[(1, "A"), (2, "B"), (3, "C")], &[("B", 5)], true);
    let pipeline = fx.executor.resolve(JOB).unwrap();
    fx.locks
        .try_acquire(5, LockOwner::Scheduled, Some(date(2023, 6, 30)))
        .await
        .unwrap();

    let outcome = fx
        .executor
        .execute(&pipeline, Loan::new(5), &job_context(), LockOwner::Scheduled, &BTreeSet::new())
        .await
        .unwrap();

    match outcome {
        PipelineOutcome::Failed { step, order, message } => {
            assert_eq!(step, "B");
            assert_eq!(order, 2);
            assert!(message.contains("Business step B failed for entity 5"));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(steps_for(&fx.log, 5), vec!["A", "B"]);
    assert!(fx.sink.is_empty(), "events of a failed entity are discarded");

    let failed = fx.locks.list_failed_locks().await.unwrap();
    assert_eq!(failed.len(), 1);
    let lock = &failed[0];
    assert_eq!(lock.entity_id, 5);
    assert_eq!(lock.owner, LockOwner::Scheduled);

    let detail: serde_json::Value =
        serde_json::from_str(lock.error_detail.as_deref().unwrap()).unwrap();
    assert_eq!(detail["step"], "B");
    assert_eq!(detail["order"], 2);
    assert_eq!(detail["business_date"], "2023-06-30");
}

#[tokio::test]
async fn test_completed_steps_are_not_rerun() {
    let fx = fixture(&[(1, "A"), (2, "B"), (3, "C")], &[], true);
    let pipeline = fx.executor.resolve(JOB).unwrap();
    let completed: BTreeSet<String> = ["A".to_string()].into_iter().collect();

    let outcome = fx
        .executor
        .execute(&pipeline, Loan::new(2), &job_context(), LockOwner::Inline, &completed)
        .await
        .unwrap();

    assert!(outcome.is_completed());
    assert_eq!(steps_for(&fx.log, 2), vec!["B", "C"]);
}

#[tokio::test]
async fn test_immediate_mode_publishes_as_steps_emit() {
    let fx = fixture(&[(1, "A"), (2, "B")], &[("B", 8)], false);
    let pipeline = fx.executor.resolve(JOB).unwrap();

    let outcome = fx
        .executor
        .execute(&pipeline, Loan::new(8), &job_context(), LockOwner::Scheduled, &BTreeSet::new())
        .await
        .unwrap();

    assert!(!outcome.is_completed());
    // both steps emitted before B failed; nothing was held back
    assert_eq!(fx.sink.events_for(8).len(), 2);
}

#[tokio::test]
async fn test_resolving_map_with_unregistered_step_fails() {
    let log = execution_log();
    let steps = BusinessStepRegistry::new().with_step(RecordingStep::new("A", &log));
    let mut maps = ExecutionMapRegistry::new();
    maps.register(ExecutionMap::from_entries(JOB, [(1, "A"), (2, "MISSING")]).unwrap());

    let executor = PipelineExecutor::new(
        Arc::new(steps),
        Arc::new(maps),
        Arc::new(LockManager::in_memory(LockPolicy::default())),
        EventEmitter::new(Arc::new(InMemoryEventSink::new()), true),
    );

    assert!(matches!(
        executor.resolve(JOB),
        Err(CobError::UnknownStep { ref step, .. }) if step == "MISSING"
    ));
    assert!(executor.validate_all().is_err());
    assert!(matches!(executor.resolve("NOPE"), Err(CobError::UnknownJob(_))));
}

#[test]
fn test_duplicate_sequence_keys_are_rejected() {
    let err = ExecutionMap::from_entries(JOB, [(1, "A"), (1, "B")]).unwrap_err();
    assert!(matches!(err, CobError::DuplicateStepOrder { order: 1, .. }));
}
