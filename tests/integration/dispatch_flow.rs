//! End-to-end dispatch tests.
//!
//! These tests run the real dispatcher loops against fake collaborators
//! and verify capacity, failure isolation and reporting.

use std::time::Duration;

use conductor::core::task::TaskId;
use conductor::orchestration::{DispatchEvent, TaskOutcome};

use crate::fixtures::{
    due_in, fast_dispatch_config, fast_shutdown_config, independent_tasks, test_task, Behavior,
    Harness, WAIT,
};

/// Test: Capacity bounds concurrent execution
/// Given capacity 2 and 3 tasks ready at once
/// When the dispatcher runs
/// Then exactly 2 start, and the 3rd starts only after a slot is released
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_capacity_two_with_three_ready_tasks() {
    let mut harness = Harness::new(2, independent_tasks(3));
    for i in 0..3 {
        harness.backend.set(&format!("task-{}", i), Behavior::Gated);
    }
    let run = harness.start();

    let first = harness.next_admitted().await;
    let second = harness.next_admitted().await;
    assert_eq!(first, TaskId::from("task-0"));
    assert_eq!(second, TaskId::from("task-1"));

    // give the third every chance to sneak in
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(harness.dispatcher.pool().active_count(), 2);
    let running = harness.backend.running();
    assert_eq!(running.len(), 2);
    assert!(!running.contains(&TaskId::from("task-2")));
    assert!(!harness.backend.started().contains(&TaskId::from("task-2")));

    harness.backend.open("task-0");
    let third = harness.next_admitted().await;
    assert_eq!(third, TaskId::from("task-2"));
    assert!(harness.source.reports_for("task-0")[0].is_success());

    harness.backend.open("task-1");
    harness.backend.open("task-2");
    harness.wait_finished(3).await;

    let report = harness.stop(run).await;
    assert!(report.outcome.is_clean());
    assert_eq!(harness.backend.max_running(), 2);
}

/// Test: Backend error is isolated
/// Given a failing task ranked first and two healthy tasks
/// When the dispatcher runs with capacity 1
/// Then the failure is reported once, the slot is freed, and the others run
#[tokio::test]
async fn test_backend_error_reported_once_and_dispatch_continues() {
    let tasks = vec![due_in("bad", -3), test_task("good-1"), test_task("good-2")];
    let mut harness = Harness::new(1, tasks);
    harness
        .backend
        .set("bad", Behavior::Error("backend exploded".to_string()));
    let run = harness.start();

    let finished = harness.wait_finished(3).await;
    assert!(matches!(
        &finished[0],
        DispatchEvent::Failed { task_id, error } if task_id.as_str() == "bad" && error.contains("backend exploded")
    ));

    let bad_reports = harness.source.reports_for("bad");
    assert_eq!(bad_reports.len(), 1);
    assert!(!bad_reports[0].is_success());
    assert!(harness.source.reports_for("good-1")[0].is_success());
    assert!(harness.source.reports_for("good-2")[0].is_success());

    let report = harness.stop(run).await;
    assert!(report.outcome.is_clean());
    assert_eq!(harness.dispatcher.pool().active_count(), 0);
    assert_eq!(harness.source.reports_for("bad").len(), 1);
    assert_eq!(harness.source.reports().len(), 3);
}

/// Test: Backend panic is isolated
/// Given a task whose backend call panics
/// When it is dispatched
/// Then a failure is reported and the next task still runs
#[tokio::test]
async fn test_backend_panic_reported_as_failure() {
    let tasks = vec![due_in("boom", -1), test_task("after")];
    let mut harness = Harness::new(1, tasks);
    harness.backend.set("boom", Behavior::Panic);
    let run = harness.start();

    harness.wait_finished(2).await;
    match &harness.source.reports_for("boom")[..] {
        [TaskOutcome::Failed { error }] => assert!(error.contains("panicked")),
        other => panic!("unexpected reports: {:?}", other),
    }
    assert!(harness.source.reports_for("after")[0].is_success());

    harness.stop(run).await;
}

/// Test: Non-zero exit is a failure outcome
#[tokio::test]
async fn test_nonzero_exit_reported_as_failure() {
    let mut harness = Harness::new(1, vec![test_task("exit")]);
    harness.backend.set("exit", Behavior::ExitCode(4));
    let run = harness.start();

    harness.wait_finished(1).await;
    assert_eq!(
        harness.source.reports_for("exit"),
        vec![TaskOutcome::failed("exit code 4: failed")]
    );
    harness.stop(run).await;
}

/// Test: Execution timeout
/// Given a backend that never returns
/// When the execution timeout elapses
/// Then the task is reported failed and its slot is released
#[tokio::test]
async fn test_execution_timeout_frees_slot() {
    let mut config = fast_dispatch_config(1);
    config.execution_timeout = Duration::from_millis(100);
    let mut harness =
        Harness::with_config(vec![test_task("slow"), test_task("next")], config, fast_shutdown_config());
    harness.backend.set("slow", Behavior::Stuck);
    let run = harness.start();

    harness.wait_finished(2).await;
    match &harness.source.reports_for("slow")[..] {
        [TaskOutcome::Failed { error }] => assert!(error.contains("timed out")),
        other => panic!("unexpected reports: {:?}", other),
    }
    assert!(harness.source.reports_for("next")[0].is_success());
    harness.stop(run).await;
}

/// Test: Reporting failure does not leak the slot
#[tokio::test]
async fn test_report_failure_is_swallowed() {
    let mut harness = Harness::new(1, vec![test_task("a"), test_task("b")]);
    harness.source.fail_reports(true);
    let run = harness.start();

    harness.wait_finished(2).await;
    let report = harness.stop(run).await;
    assert!(report.outcome.is_clean());
    assert_eq!(harness.dispatcher.pool().active_count(), 0);
}

/// Test: Workspaces are acquired and released per task
#[tokio::test]
async fn test_workspace_released_for_every_task() {
    let mut harness = Harness::new(2, independent_tasks(4));
    harness.backend.set("task-2", Behavior::Error("nope".to_string()));
    let run = harness.start();

    harness.wait_finished(4).await;
    harness.stop(run).await;

    assert_eq!(harness.provisioner.acquired(), 4);
    assert_eq!(harness.provisioner.released(), 4);
    for dir in harness.backend.working_dirs() {
        assert!(!dir.exists(), "{} should have been removed", dir.display());
    }
}

/// Test: Workspace release survives a crashing report
/// Given a source whose report handler panics
/// When a task finishes
/// Then its slot and its workspace are both released
#[tokio::test]
async fn test_workspace_released_when_reporting_panics() {
    let mut harness = Harness::new(1, vec![test_task("crashy")]);
    harness.source.panic_on_report(true);
    let run = harness.start();

    harness.wait_finished(1).await;
    let released = tokio::time::timeout(WAIT, async {
        while harness.provisioner.released() < 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(released.is_ok(), "workspace was never released");
    assert_eq!(harness.provisioner.acquired(), 1);

    let report = harness.stop(run).await;
    assert!(report.outcome.is_clean());
    assert_eq!(harness.dispatcher.pool().active_count(), 0);
    for dir in harness.backend.working_dirs() {
        assert!(!dir.exists(), "{} should have been removed", dir.display());
    }
}

/// Test: Discovery self-heals
/// Given a source that fails its first fetches
/// When the dispatcher runs
/// Then discovery keeps retrying and the task is eventually executed
#[tokio::test]
async fn test_discovery_recovers_from_source_errors() {
    let mut harness = Harness::new(1, vec![test_task("eventually")]);
    harness.source.fail_next_fetches(3);
    let run = harness.start();

    let admitted = harness.next_admitted().await;
    assert_eq!(admitted, TaskId::from("eventually"));
    assert!(harness.source.fetch_count() >= 4);

    harness.wait_finished(1).await;
    harness.stop(run).await;
}

/// Test: Tasks are marked started before execution
#[tokio::test]
async fn test_mark_started_called_on_admission() {
    let mut harness = Harness::new(1, vec![test_task("a")]);
    let run = harness.start();
    harness.wait_finished(1).await;
    harness.stop(run).await;
    assert_eq!(harness.source.started(), vec![TaskId::from("a")]);
}

/// Test: Tasks added after startup are picked up by later discovery cycles
#[tokio::test]
async fn test_late_task_is_discovered() {
    let mut harness = Harness::new(1, vec![]);
    let run = harness.start();

    tokio::time::sleep(Duration::from_millis(60)).await;
    harness.source.push(test_task("late"));
    assert_eq!(harness.next_admitted().await, TaskId::from("late"));

    harness.wait_finished(1).await;
    harness.stop(run).await;
}
