//! Admission engine: applies the concurrency limit strategy when a group key
//! resolves or a workflow run terminates.
//!
//! The RUNNING/QUEUED snapshots here are not linearizable with concurrent
//! terminations; the next `workflow-run-finished` re-invokes release, which
//! is what keeps the running count bounded over time.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use super::WorkflowController;
use crate::bus::Queue;
use crate::error::{ControllerError, ControllerResult};
use crate::fanout::TaskGroup;
use crate::messages::{WorkflowRunFinishedPayload, step_run_cancelled_message};
use crate::store::{
    ConcurrencyPolicy, LimitStrategy, OrderDirection, StepRunFilter, StepRunStatus,
    WorkflowRunFilter, WorkflowRunId, WorkflowRunStatus, WorkflowVersion,
};

/// Reason recorded on step runs pre-empted by CANCEL_IN_PROGRESS.
pub const CANCELLED_BY_CONCURRENCY_LIMIT: &str = "CANCELLED_BY_CONCURRENCY_LIMIT";

impl WorkflowController {
    /// A workflow run terminated. Under GROUP_ROUND_ROBIN that frees
    /// capacity, so the next batch is released; other strategies need no
    /// action here.
    pub(crate) async fn handle_workflow_run_finished(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        tenant_id: Uuid,
        payload: WorkflowRunFinishedPayload,
    ) -> ControllerResult<()> {
        let workflow_run = self
            .store
            .get_workflow_run(tenant_id, payload.workflow_run_id)
            .await?;
        let version = self
            .store
            .get_workflow_version(tenant_id, workflow_run.workflow_version_id)
            .await?;

        info!(workflow_run_id = %workflow_run.id, "finishing workflow run");

        if let Some(policy) = &version.concurrency {
            match policy.limit_strategy {
                LimitStrategy::GroupRoundRobin => {
                    self.queue_by_group_round_robin(cancel, tenant_id, policy).await?;
                }
                LimitStrategy::CancelInProgress => {}
            }
        }

        Ok(())
    }

    /// Apply the version's limit strategy for a freshly resolved group key.
    pub(crate) async fn release_for_group_key(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        tenant_id: Uuid,
        version: &WorkflowVersion,
        group_key: &str,
    ) -> ControllerResult<()> {
        let Some(policy) = &version.concurrency else {
            return Ok(());
        };

        match policy.limit_strategy {
            LimitStrategy::CancelInProgress => {
                self.queue_by_cancel_in_progress(tenant_id, policy, group_key)
                    .await
            }
            LimitStrategy::GroupRoundRobin => {
                self.queue_by_group_round_robin(cancel, tenant_id, policy).await
            }
        }
    }

    /// Newest-wins admission: pre-empt one running run per queued run
    /// (oldest running first), then release up to `max_runs` queued runs.
    pub(crate) async fn queue_by_cancel_in_progress(
        self: &Arc<Self>,
        tenant_id: Uuid,
        policy: &ConcurrencyPolicy,
        group_key: &str,
    ) -> ControllerResult<()> {
        info!(group_key, "handling queue with strategy CANCEL_IN_PROGRESS");

        let running = self
            .store
            .list_workflow_runs(
                tenant_id,
                &WorkflowRunFilter {
                    workflow_version_id: Some(policy.workflow_version_id),
                    group_key: Some(group_key.to_string()),
                    status: Some(WorkflowRunStatus::Running),
                    order: Some(OrderDirection::Asc),
                    limit: None,
                },
            )
            .await?;

        let queued = self
            .store
            .list_workflow_runs(
                tenant_id,
                &WorkflowRunFilter {
                    workflow_version_id: Some(policy.workflow_version_id),
                    group_key: Some(group_key.to_string()),
                    status: Some(WorkflowRunStatus::Queued),
                    order: Some(OrderDirection::Asc),
                    limit: Some(i64::from(policy.max_runs.max(0))),
                },
            )
            .await?;

        let max_to_queue = queued.len().min(policy.max_runs.max(0) as usize);

        // Make room: one pre-emption per queued run, oldest running first.
        let mut cancel_group = TaskGroup::new();
        for run in running.iter().take(queued.len()) {
            let controller = Arc::clone(self);
            let workflow_run_id = run.id;
            cancel_group
                .spawn(async move { controller.cancel_workflow_run(tenant_id, workflow_run_id).await });
        }
        cancel_group.wait().await?;

        let mut release_group = TaskGroup::new();
        for run in queued.iter().take(max_to_queue) {
            let controller = Arc::clone(self);
            let workflow_run_id = run.id;
            release_group.spawn(async move {
                controller.release_workflow_run(tenant_id, workflow_run_id).await
            });
        }
        release_group.wait().await
    }

    /// Fair admission across group keys: the store pops the next batch in
    /// round-robin order, this side just releases it.
    pub(crate) async fn queue_by_group_round_robin(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        tenant_id: Uuid,
        policy: &ConcurrencyPolicy,
    ) -> ControllerResult<()> {
        if cancel.is_cancelled() {
            return Err(ControllerError::Shutdown);
        }

        info!(
            workflow_version_id = %policy.workflow_version_id,
            "handling queue with strategy GROUP_ROUND_ROBIN"
        );

        let popped = self
            .store
            .pop_workflow_runs_round_robin(tenant_id, policy.workflow_version_id, policy.max_runs)
            .await?;

        let mut group = TaskGroup::new();
        for workflow_run_id in popped {
            let controller = Arc::clone(self);
            group.spawn(async move {
                info!(workflow_run_id = %workflow_run_id, "popped workflow run");
                controller.release_workflow_run(tenant_id, workflow_run_id).await
            });
        }
        group.wait().await
    }

    async fn release_workflow_run(
        &self,
        tenant_id: Uuid,
        workflow_run_id: WorkflowRunId,
    ) -> ControllerResult<()> {
        let workflow_run = self
            .store
            .get_workflow_run(tenant_id, workflow_run_id)
            .await?;
        self.queue_workflow_run_jobs(&workflow_run).await
    }

    /// Pre-empt a running workflow run by notifying the step controller for
    /// each of its running step runs. Workflow-run status propagation is the
    /// step controller's responsibility.
    pub(crate) async fn cancel_workflow_run(
        &self,
        tenant_id: Uuid,
        workflow_run_id: WorkflowRunId,
    ) -> ControllerResult<()> {
        let step_runs = self
            .store
            .list_step_runs(
                tenant_id,
                &StepRunFilter {
                    workflow_run_id: Some(workflow_run_id),
                    status: Some(StepRunStatus::Running),
                },
            )
            .await?;

        let mut group = TaskGroup::new();
        for step_run in step_runs {
            let bus = Arc::clone(&self.bus);
            let message =
                step_run_cancelled_message(tenant_id, step_run.id, CANCELLED_BY_CONCURRENCY_LIMIT);
            group.spawn(async move {
                bus.publish(Queue::JobProcessing, message)
                    .await
                    .map_err(ControllerError::from)
            });
        }
        group.wait().await
    }
}
