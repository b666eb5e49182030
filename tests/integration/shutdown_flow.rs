//! Graceful shutdown tests.
//!
//! These tests verify that shutdown waits for in-flight work within its
//! timeout, escalates when the timeout passes, and never admits new work
//! once draining has begun.

use std::time::{Duration, Instant};

use conductor::core::task::TaskId;
use conductor::orchestration::{
    DispatchEvent, ShutdownConfig, ShutdownOutcome, ShutdownPhase, TaskOutcome,
};

use crate::fixtures::{fast_dispatch_config, independent_tasks, test_task, Behavior, Harness, WAIT};

/// Test: Interrupt mid-execution waits for the in-flight task
/// Given one task in flight and a shutdown timeout of 2s
/// When shutdown is requested and the task finishes 300ms later
/// Then run returns after the task completes, cleanly, well before the timeout
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_interrupt_waits_for_in_flight_task() {
    let shutdown = ShutdownConfig {
        drain_timeout: Duration::from_secs(2),
        kill_grace: Duration::from_millis(100),
    };
    let mut harness = Harness::with_config(vec![test_task("busy")], fast_dispatch_config(1), shutdown);
    harness.backend.set("busy", Behavior::Gated);
    let run = harness.start();
    assert_eq!(harness.next_admitted().await, TaskId::from("busy"));

    let requested_at = Instant::now();
    harness.coordinator.request_shutdown("interrupt");

    let backend = std::sync::Arc::clone(&harness.backend);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        backend.open("busy");
    });

    let report = tokio::time::timeout(WAIT, run).await.unwrap().unwrap().unwrap();
    let elapsed = requested_at.elapsed();
    assert!(elapsed >= Duration::from_millis(300), "exited before the task finished");
    assert!(elapsed < Duration::from_secs(2));
    assert_eq!(report.outcome, ShutdownOutcome::Clean);
    assert!(report.abandoned_operations.is_empty());
    assert!(harness.source.reports_for("busy")[0].is_success());
    assert_eq!(harness.coordinator.phase(), ShutdownPhase::Stopped);
}

/// Test: Interrupt with a task that outlives the timeout
/// Given one task in flight that only stops when cancelled and a timeout T
/// When shutdown is requested
/// Then run returns after T, not before, with a forced outcome
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_timeout_forces_exit() {
    let timeout = Duration::from_millis(300);
    let shutdown = ShutdownConfig {
        drain_timeout: timeout,
        kill_grace: Duration::from_millis(100),
    };
    let mut harness = Harness::with_config(vec![test_task("hang")], fast_dispatch_config(1), shutdown);
    harness.backend.set("hang", Behavior::Hang);
    let run = harness.start();
    assert_eq!(harness.next_admitted().await, TaskId::from("hang"));

    let requested_at = Instant::now();
    harness.coordinator.request_shutdown("interrupt");
    let report = tokio::time::timeout(WAIT, run).await.unwrap().unwrap().unwrap();
    let elapsed = requested_at.elapsed();

    assert!(elapsed >= timeout, "exited before the shutdown timeout");
    assert!(elapsed < Duration::from_secs(3));
    assert_eq!(report.outcome, ShutdownOutcome::Forced);
    assert_eq!(report.outcome.exit_code(), 3);

    // the cancelled execution still reports
    tokio::time::sleep(Duration::from_millis(100)).await;
    match &harness.source.reports_for("hang")[..] {
        [TaskOutcome::Failed { .. }] => {}
        other => panic!("unexpected reports: {:?}", other),
    }
}

/// Test: No admission once draining
/// Given queued tasks and free capacity
/// When shutdown is requested before dispatch begins
/// Then nothing is admitted and the shutdown is clean
#[tokio::test]
async fn test_no_admission_after_shutdown_requested() {
    let mut harness = Harness::new(4, independent_tasks(3));
    harness.dispatcher.discover_once().await.unwrap();
    harness.coordinator.request_shutdown("before start");

    let run = harness.start();
    let report = tokio::time::timeout(WAIT, run).await.unwrap().unwrap().unwrap();

    assert!(report.outcome.is_clean());
    assert!(harness.backend.started().is_empty());
    assert_eq!(harness.dispatcher.queue().lock().await.size(), 3);

    let mut events = Vec::new();
    while let Ok(event) = harness.events.try_recv() {
        events.push(event);
    }
    assert!(!events
        .iter()
        .any(|e| matches!(e, DispatchEvent::Admitted { .. })));
}

/// Test: Shutdown event sequence and cleanup callbacks
#[tokio::test]
async fn test_shutdown_emits_events_and_marks_source_stopped() {
    let mut harness = Harness::new(1, vec![test_task("only")]);
    let run = harness.start();
    harness.wait_finished(1).await;

    let report = harness.stop(run).await;
    assert!(report.outcome.is_clean());
    assert!(harness.source.is_stopped());

    assert_eq!(harness.next_event().await, DispatchEvent::ShutdownRequested);
    assert_eq!(
        harness.next_event().await,
        DispatchEvent::ShutdownComplete {
            outcome: ShutdownOutcome::Clean
        }
    );
}

/// Test: Loops stop taking work while an execution drains
/// Given capacity 2 with one gated task running
/// When shutdown is requested and a new task appears
/// Then the new task is never admitted
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_new_work_ignored_while_draining() {
    let mut harness = Harness::new(2, vec![test_task("running")]);
    harness.backend.set("running", Behavior::Gated);
    let run = harness.start();
    assert_eq!(harness.next_admitted().await, TaskId::from("running"));

    harness.coordinator.request_shutdown("interrupt");
    harness.source.push(test_task("latecomer"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    harness.backend.open("running");

    let report = tokio::time::timeout(WAIT, run).await.unwrap().unwrap().unwrap();
    assert!(report.outcome.is_clean());
    assert!(!harness
        .backend
        .started()
        .contains(&TaskId::from("latecomer")));
}
