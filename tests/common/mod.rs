//! Shared harness for controller scenario tests: an in-memory store and bus
//! seeded the way the upstream intake service would.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use flowgate::store::{group_key_action_id, StepRunFilter};
use flowgate::{
    ConcurrencyPolicy, ControllerConfig, ControllerResult, GroupKeyRun, GroupKeyRunId,
    LimitStrategy, MemoryBus, MemoryStore, Message, StepRun, StepRunStatus, Tenant, Ticker,
    Worker, WorkflowController, WorkflowRun, WorkflowRunId, WorkflowRunStatus, WorkflowVersion,
    WorkflowVersionId,
};

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestHarness {
    pub store: MemoryStore,
    pub bus: MemoryBus,
    pub controller: Arc<WorkflowController>,
    pub tenant_id: Uuid,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(ControllerConfig::default())
    }

    /// Harness with fast reconciler ticks for loop-driven tests.
    pub fn with_fast_reconciler() -> Self {
        Self::with_config(ControllerConfig {
            reconcile_interval: Duration::from_millis(25),
            requeue_backoff: Duration::from_millis(25),
            ..ControllerConfig::default()
        })
    }

    pub fn with_config(config: ControllerConfig) -> Self {
        let store = MemoryStore::new();
        let bus = MemoryBus::new();
        let tenant_id = Uuid::new_v4();
        store.insert_tenant(Tenant { id: tenant_id });

        let controller = WorkflowController::new(
            Arc::new(store.clone()),
            Arc::new(bus.clone()),
            config,
        );

        Self {
            store,
            bus,
            controller,
            tenant_id,
        }
    }

    // ------------------------------------------------------------------
    // Seeding
    // ------------------------------------------------------------------

    pub fn seed_version(&self, concurrency: Option<(i32, LimitStrategy)>) -> WorkflowVersionId {
        let id = WorkflowVersionId::new();
        self.store.insert_workflow_version(WorkflowVersion {
            id,
            tenant_id: self.tenant_id,
            concurrency: concurrency.map(|(max_runs, limit_strategy)| ConcurrencyPolicy {
                workflow_version_id: id,
                max_runs,
                limit_strategy,
            }),
        });
        id
    }

    pub fn seed_run(
        &self,
        version_id: WorkflowVersionId,
        status: WorkflowRunStatus,
        group_key: Option<&str>,
        job_count: usize,
        created_at: DateTime<Utc>,
    ) -> WorkflowRun {
        let mut run = MemoryStore::seed_workflow_run(
            self.tenant_id,
            version_id,
            created_at,
            group_key,
            job_count,
        );
        run.status = status;
        self.store.insert_workflow_run(run.clone());
        run
    }

    /// Attach a group-key run to a workflow run and persist both sides of
    /// the link.
    pub fn seed_group_key_run(&self, run: &mut WorkflowRun, status: StepRunStatus) -> GroupKeyRun {
        let mut group_key_run = MemoryStore::seed_group_key_run(run);
        group_key_run.status = status;
        run.group_key_run_id = Some(group_key_run.id);
        self.store.insert_workflow_run(run.clone());
        self.store.insert_group_key_run(group_key_run.clone());
        group_key_run
    }

    pub fn update_group_key_run_raw(&self, group_key_run: GroupKeyRun) {
        self.store.insert_group_key_run(group_key_run);
    }

    pub fn seed_worker(&self, version_id: WorkflowVersionId, is_active: bool) -> Worker {
        let worker = Worker {
            id: Uuid::new_v4(),
            tenant_id: self.tenant_id,
            dispatcher_id: Uuid::new_v4(),
            is_active,
            actions: vec![group_key_action_id(version_id)],
        };
        self.store.insert_worker(worker.clone());
        worker
    }

    pub fn seed_ticker(&self) -> Uuid {
        let id = Uuid::new_v4();
        self.store.insert_ticker(Ticker {
            id,
            is_active: true,
        });
        id
    }

    pub fn seed_running_step(&self, run: &WorkflowRun) -> StepRun {
        let step_run = StepRun {
            id: Uuid::new_v4(),
            tenant_id: self.tenant_id,
            job_run_id: Uuid::new_v4(),
            workflow_run_id: run.id,
            status: StepRunStatus::Running,
        };
        self.store.insert_step_run(step_run.clone());
        step_run
    }

    // ------------------------------------------------------------------
    // Driving
    // ------------------------------------------------------------------

    /// Dispatch a message straight through the router.
    pub async fn handle(&self, message: Message) -> ControllerResult<()> {
        let cancel = CancellationToken::new();
        self.controller.handle_message(&cancel, &message).await
    }

    pub fn workflow_run_queued(&self, workflow_run_id: WorkflowRunId) -> Message {
        Message::new(
            "workflow-run-queued",
            json!({ "workflow_run_id": workflow_run_id }),
            json!({ "tenant_id": self.tenant_id }),
        )
    }

    pub fn workflow_run_finished(&self, workflow_run_id: WorkflowRunId) -> Message {
        Message::new(
            "workflow-run-finished",
            json!({ "workflow_run_id": workflow_run_id }),
            json!({ "tenant_id": self.tenant_id }),
        )
    }

    pub fn group_key_run_started(&self, id: GroupKeyRunId) -> Message {
        Message::new(
            "get-group-key-run-started",
            json!({
                "get_group_key_run_id": id,
                "started_at": Utc::now().to_rfc3339(),
            }),
            json!({ "tenant_id": self.tenant_id }),
        )
    }

    pub fn group_key_run_finished(&self, id: GroupKeyRunId, group_key: &str) -> Message {
        Message::new(
            "get-group-key-run-finished",
            json!({
                "get_group_key_run_id": id,
                "finished_at": Utc::now().to_rfc3339(),
                "group_key": group_key,
            }),
            json!({ "tenant_id": self.tenant_id }),
        )
    }

    pub fn group_key_run_failed(&self, id: GroupKeyRunId, error: &str) -> Message {
        Message::new(
            "get-group-key-run-failed",
            json!({
                "get_group_key_run_id": id,
                "failed_at": Utc::now().to_rfc3339(),
                "error": error,
            }),
            json!({ "tenant_id": self.tenant_id }),
        )
    }

    // ------------------------------------------------------------------
    // Assertions
    // ------------------------------------------------------------------

    pub fn workflow_run(&self, id: WorkflowRunId) -> WorkflowRun {
        self.store.workflow_run(id).expect("workflow run")
    }

    pub async fn running_steps(&self, run: &WorkflowRun) -> Vec<StepRun> {
        flowgate::store::StepRunStore::list_step_runs(
            &self.store,
            self.tenant_id,
            &StepRunFilter {
                workflow_run_id: Some(run.id),
                status: Some(StepRunStatus::Running),
            },
        )
        .await
        .expect("list step runs")
    }
}

/// Poll until `check` returns true or the timeout elapses.
pub async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
