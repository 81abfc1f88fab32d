//! Group-key scheduler: the state machine that carries a group-key run from
//! PENDING to a terminal state.
//!
//! Assignment, timeout scheduling and dispatch are not one transaction; the
//! reconciler repairs any gap (send failure, worker death) on its next tick.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::WorkflowController;
use crate::bus::Queue;
use crate::error::{ControllerError, ControllerResult};
use crate::fanout::TaskGroup;
use crate::messages::{
    GroupKeyRunFailedPayload, GroupKeyRunFinishedPayload, GroupKeyRunStartedPayload,
    WorkflowRunQueuedPayload, cancel_group_key_run_timeout_message,
    group_key_action_assigned_message, job_run_queued_message, parse_rfc3339,
    schedule_group_key_run_timeout_message,
};
use crate::store::{GroupKeyRun, GroupKeyRunPatch, StepRunStatus, StoreError, WorkflowRun};

impl WorkflowController {
    /// Admit a freshly queued workflow run: release its jobs directly, or
    /// enter the group-key state machine when the version carries a
    /// concurrency policy.
    pub(crate) async fn handle_workflow_run_queued(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        tenant_id: Uuid,
        payload: WorkflowRunQueuedPayload,
    ) -> ControllerResult<()> {
        let workflow_run = self
            .store
            .get_workflow_run(tenant_id, payload.workflow_run_id)
            .await?;
        let version = self
            .store
            .get_workflow_version(tenant_id, workflow_run.workflow_version_id)
            .await?;

        info!(workflow_run_id = %workflow_run.id, "starting workflow run");

        if version.concurrency.is_some() {
            info!(workflow_run_id = %workflow_run.id, "workflow run has concurrency settings");

            let group_key_run_id = workflow_run.group_key_run_id.ok_or_else(|| {
                StoreError::NotFound(format!(
                    "group key run for workflow run {}",
                    workflow_run.id
                ))
            })?;
            let group_key_run = self
                .store
                .get_group_key_run(tenant_id, group_key_run_id)
                .await?;

            return self.schedule_group_key_run(cancel, &group_key_run).await;
        }

        self.queue_workflow_run_jobs(&workflow_run).await
    }

    /// Release a workflow run by publishing one message per job run.
    pub(crate) async fn queue_workflow_run_jobs(
        &self,
        workflow_run: &WorkflowRun,
    ) -> ControllerResult<()> {
        let mut group = TaskGroup::new();
        for job_run in &workflow_run.job_runs {
            let bus = Arc::clone(&self.bus);
            let message = job_run_queued_message(workflow_run.tenant_id, job_run);
            group.spawn(async move {
                bus.publish(Queue::JobProcessing, message)
                    .await
                    .map_err(ControllerError::from)
            });
        }
        group.wait().await
    }

    /// Move a group-key run through assignment and emit the dispatcher and
    /// ticker messages. "No worker available" is success from here; the
    /// reconciler retries the run.
    pub(crate) async fn schedule_group_key_run(
        &self,
        cancel: &CancellationToken,
        group_key_run: &GroupKeyRun,
    ) -> ControllerResult<()> {
        if cancel.is_cancelled() {
            return Err(ControllerError::Shutdown);
        }

        let tenant_id = group_key_run.tenant_id;
        let id = group_key_run.id;

        self.store
            .update_group_key_run(
                tenant_id,
                id,
                &GroupKeyRunPatch {
                    status: Some(StepRunStatus::PendingAssignment),
                    ..Default::default()
                },
            )
            .await?;

        let assignment = match self
            .store
            .assign_group_key_run_to_worker(tenant_id, id)
            .await
        {
            Ok(assignment) => assignment,
            Err(StoreError::NoWorkerAvailable) => {
                debug!(group_key_run_id = %id, "no worker available for group key run, requeueing");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let ticker_id = self
            .store
            .assign_group_key_run_to_ticker(tenant_id, id)
            .await?;

        let timeout = chrono::Duration::from_std(self.config.default_step_run_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let timeout_at = Utc::now() + timeout;

        self.bus
            .publish(
                Queue::Ticker(ticker_id),
                schedule_group_key_run_timeout_message(
                    tenant_id,
                    group_key_run.workflow_run_id,
                    id,
                    timeout_at,
                ),
            )
            .await?;

        self.bus
            .publish(
                Queue::Dispatcher(assignment.dispatcher_id),
                group_key_action_assigned_message(
                    tenant_id,
                    group_key_run.workflow_run_id,
                    assignment.worker_id,
                    assignment.dispatcher_id,
                ),
            )
            .await?;

        Ok(())
    }

    /// The worker began computing the key.
    pub(crate) async fn handle_group_key_run_started(
        &self,
        tenant_id: Uuid,
        payload: GroupKeyRunStartedPayload,
    ) -> ControllerResult<()> {
        let started_at = parse_rfc3339("started_at", &payload.started_at)?;

        self.store
            .update_group_key_run(
                tenant_id,
                payload.get_group_key_run_id,
                &GroupKeyRunPatch {
                    started_at: Some(started_at),
                    status: Some(StepRunStatus::Running),
                    ..Default::default()
                },
            )
            .await?;

        Ok(())
    }

    /// The worker resolved the key: terminalize the run, then in parallel
    /// release admitted runs for that key and cancel the pending timeout.
    pub(crate) async fn handle_group_key_run_finished(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        tenant_id: Uuid,
        payload: GroupKeyRunFinishedPayload,
    ) -> ControllerResult<()> {
        let finished_at = parse_rfc3339("finished_at", &payload.finished_at)?;

        let group_key_run = self
            .store
            .update_group_key_run(
                tenant_id,
                payload.get_group_key_run_id,
                &GroupKeyRunPatch {
                    finished_at: Some(finished_at),
                    status: Some(StepRunStatus::Succeeded),
                    output: Some(payload.group_key.clone()),
                    ..Default::default()
                },
            )
            .await?;

        let mut group = TaskGroup::new();

        {
            let controller = Arc::clone(self);
            let cancel = cancel.clone();
            let group_key = payload.group_key.clone();
            let version_id = group_key_run.workflow_version_id;
            group.spawn(async move {
                let version = controller
                    .store
                    .get_workflow_version(tenant_id, version_id)
                    .await?;
                controller
                    .release_for_group_key(&cancel, tenant_id, &version, &group_key)
                    .await
            });
        }

        {
            let bus = Arc::clone(&self.bus);
            let run = group_key_run.clone();
            group.spawn(async move {
                match run.ticker_id {
                    Some(ticker_id) => bus
                        .publish(
                            Queue::Ticker(ticker_id),
                            cancel_group_key_run_timeout_message(&run),
                        )
                        .await
                        .map_err(ControllerError::from),
                    None => {
                        warn!(
                            group_key_run_id = %run.id,
                            "group key run finished without a ticker, skipping timeout cancel"
                        );
                        Ok(())
                    }
                }
            });
        }

        group.wait().await
    }

    /// The worker failed to resolve the key. The owning workflow run is not
    /// advanced; whether it is cancelled or retried is upstream policy.
    pub(crate) async fn handle_group_key_run_failed(
        &self,
        tenant_id: Uuid,
        payload: GroupKeyRunFailedPayload,
    ) -> ControllerResult<()> {
        let failed_at = parse_rfc3339("failed_at", &payload.failed_at)?;

        let group_key_run = self
            .store
            .update_group_key_run(
                tenant_id,
                payload.get_group_key_run_id,
                &GroupKeyRunPatch {
                    finished_at: Some(failed_at),
                    error: Some(payload.error.clone()),
                    status: Some(StepRunStatus::Failed),
                    ..Default::default()
                },
            )
            .await?;

        match group_key_run.ticker_id {
            Some(ticker_id) => {
                self.bus
                    .publish(
                        Queue::Ticker(ticker_id),
                        cancel_group_key_run_timeout_message(&group_key_run),
                    )
                    .await?;
            }
            None => {
                warn!(
                    group_key_run_id = %group_key_run.id,
                    "group key run failed without a ticker, skipping timeout cancel"
                );
            }
        }

        Ok(())
    }
}
