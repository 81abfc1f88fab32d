//! Scenario tests for the admission engine and group-key scheduler, driven
//! through the message router over the in-memory store and bus.

mod common;

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use common::{TestHarness, WAIT_TIMEOUT, wait_for};
use flowgate::{
    CANCELLED_BY_CONCURRENCY_LIMIT, ControllerError, DecodeError, LimitStrategy, Message,
    MessageBus, Queue, StepRunStatus, WorkflowRunStatus,
};

fn payload_uuid(message: &Message, field: &str) -> Uuid {
    serde_json::from_value(message.payload[field].clone()).expect("uuid payload field")
}

#[tokio::test]
async fn run_without_concurrency_releases_jobs_directly() {
    let harness = TestHarness::new();
    let version_id = harness.seed_version(None);
    let run = harness.seed_run(version_id, WorkflowRunStatus::Queued, None, 3, Utc::now());

    harness
        .handle(harness.workflow_run_queued(run.id))
        .await
        .expect("handle workflow-run-queued");

    let released = harness.bus.drain(Queue::JobProcessing);
    assert_eq!(released.len(), 3);

    let expected: HashSet<Uuid> = run.job_runs.iter().map(|job_run| job_run.id).collect();
    for message in &released {
        assert_eq!(message.id, "job-run-queued");
        assert!(expected.contains(&payload_uuid(message, "job_run_id")));
    }
}

#[tokio::test]
async fn round_robin_release_pops_one_batch_across_keys() {
    let harness = TestHarness::new();
    let version_id = harness.seed_version(Some((2, LimitStrategy::GroupRoundRobin)));

    let base = Utc::now();
    let mut a_runs = Vec::new();
    let mut b_runs = Vec::new();
    for i in 0..3 {
        a_runs.push(harness.seed_run(
            version_id,
            WorkflowRunStatus::Queued,
            Some("a"),
            1,
            base + chrono::Duration::seconds(i),
        ));
        b_runs.push(harness.seed_run(
            version_id,
            WorkflowRunStatus::Queued,
            Some("b"),
            1,
            base + chrono::Duration::seconds(10 + i),
        ));
    }

    // An unrelated run terminating frees capacity.
    let finished = harness.seed_run(
        version_id,
        WorkflowRunStatus::Running,
        Some("c"),
        0,
        base,
    );
    harness
        .handle(harness.workflow_run_finished(finished.id))
        .await
        .expect("handle workflow-run-finished");

    let running: Vec<WorkflowRunStatus> = [&a_runs[0], &b_runs[0]]
        .iter()
        .map(|run| harness.workflow_run(run.id).status)
        .collect();
    assert_eq!(running, vec![WorkflowRunStatus::Running; 2]);

    for run in a_runs.iter().skip(1).chain(b_runs.iter().skip(1)) {
        assert_eq!(harness.workflow_run(run.id).status, WorkflowRunStatus::Queued);
    }

    let released = harness.bus.drain(Queue::JobProcessing);
    let released_jobs: HashSet<Uuid> = released
        .iter()
        .map(|message| payload_uuid(message, "job_run_id"))
        .collect();
    let expected: HashSet<Uuid> = [&a_runs[0], &b_runs[0]]
        .iter()
        .flat_map(|run| run.job_runs.iter().map(|job_run| job_run.id))
        .collect();
    assert_eq!(released_jobs, expected);
}

#[tokio::test]
async fn cancel_in_progress_preempts_oldest_running_only() {
    let harness = TestHarness::new();
    let version_id = harness.seed_version(Some((1, LimitStrategy::CancelInProgress)));

    let base = Utc::now();
    let older = harness.seed_run(version_id, WorkflowRunStatus::Running, Some("G"), 0, base);
    let newer = harness.seed_run(
        version_id,
        WorkflowRunStatus::Running,
        Some("G"),
        0,
        base + chrono::Duration::seconds(1),
    );
    let older_steps = [
        harness.seed_running_step(&older),
        harness.seed_running_step(&older),
    ];
    let newer_step = harness.seed_running_step(&newer);

    let mut queued = harness.seed_run(
        version_id,
        WorkflowRunStatus::Queued,
        None,
        2,
        base + chrono::Duration::seconds(2),
    );
    let ticker_id = Uuid::new_v4();
    let mut group_key_run = harness.seed_group_key_run(&mut queued, StepRunStatus::Running);
    group_key_run.ticker_id = Some(ticker_id);
    harness.update_group_key_run_raw(group_key_run.clone());

    harness
        .handle(harness.group_key_run_finished(group_key_run.id, "G"))
        .await
        .expect("handle get-group-key-run-finished");

    let stored = harness
        .store
        .group_key_run(group_key_run.id)
        .expect("group key run");
    assert_eq!(stored.status, StepRunStatus::Succeeded);
    assert_eq!(stored.output.as_deref(), Some("G"));

    let job_queue = harness.bus.drain(Queue::JobProcessing);

    let cancelled: HashSet<Uuid> = job_queue
        .iter()
        .filter(|message| message.id == "step-run-cancelled")
        .map(|message| {
            assert_eq!(
                message.payload["cancelled_reason"].as_str(),
                Some(CANCELLED_BY_CONCURRENCY_LIMIT)
            );
            payload_uuid(message, "step_run_id")
        })
        .collect();
    let expected_cancelled: HashSet<Uuid> =
        older_steps.iter().map(|step_run| step_run.id).collect();
    assert_eq!(cancelled, expected_cancelled);
    assert!(!cancelled.contains(&newer_step.id));

    let released: HashSet<Uuid> = job_queue
        .iter()
        .filter(|message| message.id == "job-run-queued")
        .map(|message| payload_uuid(message, "job_run_id"))
        .collect();
    let expected_released: HashSet<Uuid> =
        queued.job_runs.iter().map(|job_run| job_run.id).collect();
    assert_eq!(released, expected_released);

    let ticker_messages = harness.bus.drain(Queue::Ticker(ticker_id));
    assert_eq!(ticker_messages.len(), 1);
    assert_eq!(ticker_messages[0].id, "cancel-get-group-key-run-timeout");
}

#[tokio::test]
async fn duplicate_finish_is_a_noop_on_the_store() {
    let harness = TestHarness::new();
    let version_id = harness.seed_version(Some((1, LimitStrategy::GroupRoundRobin)));
    let mut run = harness.seed_run(version_id, WorkflowRunStatus::Queued, None, 1, Utc::now());
    let ticker_id = Uuid::new_v4();
    let mut group_key_run = harness.seed_group_key_run(&mut run, StepRunStatus::Running);
    group_key_run.ticker_id = Some(ticker_id);
    harness.update_group_key_run_raw(group_key_run.clone());

    harness
        .handle(harness.group_key_run_finished(group_key_run.id, "G"))
        .await
        .expect("first delivery");
    let first = harness
        .store
        .group_key_run(group_key_run.id)
        .expect("group key run");

    harness
        .handle(harness.group_key_run_finished(group_key_run.id, "H"))
        .await
        .expect("duplicate delivery");
    let second = harness
        .store
        .group_key_run(group_key_run.id)
        .expect("group key run");

    assert_eq!(second.status, StepRunStatus::Succeeded);
    assert_eq!(second.output.as_deref(), Some("G"));
    assert_eq!(second.finished_at, first.finished_at);

    // At least one timeout cancellation; duplicates are fine downstream.
    let ticker_messages = harness.bus.drain(Queue::Ticker(ticker_id));
    assert!(!ticker_messages.is_empty());
    for message in &ticker_messages {
        assert_eq!(message.id, "cancel-get-group-key-run-timeout");
    }
}

#[tokio::test]
async fn failed_group_key_run_records_error_and_leaves_run_queued() {
    let harness = TestHarness::new();
    let version_id = harness.seed_version(Some((1, LimitStrategy::CancelInProgress)));
    let mut run = harness.seed_run(version_id, WorkflowRunStatus::Queued, None, 1, Utc::now());
    let ticker_id = Uuid::new_v4();
    let mut group_key_run = harness.seed_group_key_run(&mut run, StepRunStatus::Running);
    group_key_run.ticker_id = Some(ticker_id);
    harness.update_group_key_run_raw(group_key_run.clone());

    harness
        .handle(harness.group_key_run_failed(group_key_run.id, "expression raised"))
        .await
        .expect("handle get-group-key-run-failed");

    let stored = harness
        .store
        .group_key_run(group_key_run.id)
        .expect("group key run");
    assert_eq!(stored.status, StepRunStatus::Failed);
    assert_eq!(stored.error.as_deref(), Some("expression raised"));
    assert!(stored.finished_at.is_some());

    // The owning run is not advanced; its fate is upstream policy.
    assert_eq!(harness.workflow_run(run.id).status, WorkflowRunStatus::Queued);
    assert!(harness.bus.drain(Queue::JobProcessing).is_empty());

    let ticker_messages = harness.bus.drain(Queue::Ticker(ticker_id));
    assert_eq!(ticker_messages.len(), 1);
    assert_eq!(ticker_messages[0].id, "cancel-get-group-key-run-timeout");
}

#[tokio::test]
async fn started_marks_group_key_run_running() {
    let harness = TestHarness::new();
    let version_id = harness.seed_version(Some((1, LimitStrategy::CancelInProgress)));
    let mut run = harness.seed_run(version_id, WorkflowRunStatus::Queued, None, 0, Utc::now());
    let group_key_run = harness.seed_group_key_run(&mut run, StepRunStatus::Assigned);

    harness
        .handle(harness.group_key_run_started(group_key_run.id))
        .await
        .expect("handle get-group-key-run-started");

    let stored = harness
        .store
        .group_key_run(group_key_run.id)
        .expect("group key run");
    assert_eq!(stored.status, StepRunStatus::Running);
    assert!(stored.started_at.is_some());
}

#[tokio::test]
async fn unknown_task_is_a_permanent_error() {
    let harness = TestHarness::new();
    let message = Message::new(
        "mystery-task",
        json!({}),
        json!({ "tenant_id": harness.tenant_id }),
    );

    let err = harness.handle(message).await.expect_err("unknown task");
    assert!(matches!(
        err,
        ControllerError::Decode(DecodeError::UnknownTask(_))
    ));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn end_to_end_resolution_through_the_bus() {
    let harness = TestHarness::new();
    let version_id = harness.seed_version(Some((1, LimitStrategy::CancelInProgress)));
    let worker = harness.seed_worker(version_id, true);
    let ticker_id = harness.seed_ticker();
    let mut run = harness.seed_run(version_id, WorkflowRunStatus::Queued, None, 2, Utc::now());
    let group_key_run = harness.seed_group_key_run(&mut run, StepRunStatus::Pending);

    let handle = harness.controller.start().await.expect("start");

    harness
        .bus
        .publish(Queue::WorkflowProcessing, harness.workflow_run_queued(run.id))
        .await
        .expect("publish");

    wait_for("worker assignment", || async {
        harness
            .store
            .group_key_run(group_key_run.id)
            .is_some_and(|stored| stored.status == StepRunStatus::Assigned)
    })
    .await;

    // The dispatcher send trails the store assignment.
    let mut dispatched = Vec::new();
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while dispatched.is_empty() {
        dispatched.extend(harness.bus.drain(Queue::Dispatcher(worker.dispatcher_id)));
        assert!(
            tokio::time::Instant::now() <= deadline,
            "timed out waiting for dispatcher message"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(dispatched.len(), 1);
    assert_eq!(dispatched[0].id, "group-key-action-assigned");
    assert_eq!(payload_uuid(&dispatched[0], "worker_id"), worker.id);

    let scheduled = harness.bus.drain(Queue::Ticker(ticker_id));
    assert!(
        scheduled
            .iter()
            .any(|message| message.id == "schedule-get-group-key-run-timeout")
    );

    harness
        .bus
        .publish(
            Queue::WorkflowProcessing,
            harness.group_key_run_started(group_key_run.id),
        )
        .await
        .expect("publish started");
    harness
        .bus
        .publish(
            Queue::WorkflowProcessing,
            harness.group_key_run_finished(group_key_run.id, "G"),
        )
        .await
        .expect("publish finished");

    // The run's own jobs come out on the job processing queue.
    let mut released = Vec::new();
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while released.len() < 2 {
        released.extend(harness.bus.drain(Queue::JobProcessing));
        assert!(
            tokio::time::Instant::now() <= deadline,
            "timed out waiting for released jobs"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let released_jobs: HashSet<Uuid> = released
        .iter()
        .map(|message| payload_uuid(message, "job_run_id"))
        .collect();
    let expected: HashSet<Uuid> = run.job_runs.iter().map(|job_run| job_run.id).collect();
    assert_eq!(released_jobs, expected);

    handle.shutdown().await.expect("shutdown");
}
