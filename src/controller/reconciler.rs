//! Reconciliation loops.
//!
//! Two periodic jobs recover group-key runs after partial failure:
//! - **requeue**: runs stuck before assignment (no eligible worker, lost
//!   dispatch) are rescheduled, or cancelled once past their scheduling
//!   deadline
//! - **reassign**: runs assigned to a worker that went inactive are reset to
//!   PENDING_ASSIGNMENT and rescheduled
//!
//! Every tick fans out one subtask per tenant. Tenant failures are logged
//! and never abort sibling tenants or later ticks. A tick of one job never
//! overlaps itself; the two jobs run independently.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::WorkflowController;
use crate::error::ControllerResult;
use crate::fanout::TaskGroup;
use crate::store::{GroupKeyRun, GroupKeyRunPatch, StepRunStatus};

/// Reason recorded on group-key runs cancelled past their scheduling
/// deadline.
pub const SCHEDULING_TIMED_OUT: &str = "SCHEDULING_TIMED_OUT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReconcileJob {
    Requeue,
    Reassign,
}

impl ReconcileJob {
    fn name(&self) -> &'static str {
        match self {
            Self::Requeue => "requeue",
            Self::Reassign => "reassign",
        }
    }
}

impl WorkflowController {
    /// Requeue loop. Runs until the token is cancelled; an in-flight tick
    /// drains before the loop exits.
    pub(crate) async fn run_group_key_run_requeue(self: Arc<Self>, cancel: CancellationToken) {
        self.run_reconcile_loop(cancel, ReconcileJob::Requeue).await;
    }

    /// Reassign loop.
    pub(crate) async fn run_group_key_run_reassign(self: Arc<Self>, cancel: CancellationToken) {
        self.run_reconcile_loop(cancel, ReconcileJob::Reassign).await;
    }

    async fn run_reconcile_loop(self: Arc<Self>, cancel: CancellationToken, job: ReconcileJob) {
        info!(
            job = job.name(),
            interval_ms = self.config.reconcile_interval.as_millis(),
            "reconciler loop started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(job = job.name(), "reconciler loop shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.reconcile_interval) => {
                    self.reconcile_tick(&cancel, job).await;
                }
            }
        }
    }

    /// One sweep across all tenants. Best-effort: per-tenant errors are
    /// logged, the tick itself never fails.
    async fn reconcile_tick(self: &Arc<Self>, cancel: &CancellationToken, job: ReconcileJob) {
        debug!(job = job.name(), "checking group key runs");

        let tenants = match self.store.list_tenants().await {
            Ok(tenants) => tenants,
            Err(err) => {
                metrics::counter!("flowgate_reconciler_errors_total").increment(1);
                error!(job = job.name(), error = ?err, "could not list tenants");
                return;
            }
        };

        let mut handles = Vec::new();
        for tenant in tenants {
            if cancel.is_cancelled() {
                break;
            }
            let controller = Arc::clone(self);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let outcome = controller.reconcile_tenant(&cancel, job, tenant.id).await;
                (tenant.id, outcome)
            }));
        }

        for joined in futures::future::join_all(handles).await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((tenant_id, Err(err))) => {
                    metrics::counter!("flowgate_reconciler_errors_total").increment(1);
                    error!(
                        job = job.name(),
                        tenant_id = %tenant_id,
                        error = ?err,
                        "reconcile failed for tenant"
                    );
                }
                Err(err) => {
                    error!(job = job.name(), error = ?err, "reconcile subtask died");
                }
            }
        }
    }

    async fn reconcile_tenant(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        job: ReconcileJob,
        tenant_id: Uuid,
    ) -> ControllerResult<()> {
        let group_key_runs = match job {
            ReconcileJob::Requeue => {
                self.store.list_group_key_runs_to_requeue(tenant_id).await?
            }
            ReconcileJob::Reassign => {
                self.store.list_group_key_runs_to_reassign(tenant_id).await?
            }
        };

        if group_key_runs.is_empty() {
            return Ok(());
        }

        debug!(
            job = job.name(),
            tenant_id = %tenant_id,
            count = group_key_runs.len(),
            "reconciling group key runs"
        );

        let mut group = TaskGroup::new();
        for group_key_run in group_key_runs {
            if cancel.is_cancelled() {
                break;
            }
            let controller = Arc::clone(self);
            let cancel = cancel.clone();
            match job {
                ReconcileJob::Requeue => group.spawn(async move {
                    controller.requeue_group_key_run(&cancel, group_key_run).await
                }),
                ReconcileJob::Reassign => group.spawn(async move {
                    controller.reassign_group_key_run(&cancel, group_key_run).await
                }),
            }
        }
        group.wait().await
    }

    /// Cancel a run past its scheduling deadline, otherwise push its retry
    /// time out and re-enter scheduling.
    async fn requeue_group_key_run(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        group_key_run: GroupKeyRun,
    ) -> ControllerResult<()> {
        let tenant_id = group_key_run.tenant_id;
        let id = group_key_run.id;

        debug!(group_key_run_id = %id, "requeueing group key run");

        let now = Utc::now();
        let timed_out = group_key_run
            .schedule_timeout_at
            .is_some_and(|deadline| deadline < now);

        if timed_out {
            self.store
                .update_group_key_run(
                    tenant_id,
                    id,
                    &GroupKeyRunPatch {
                        cancelled_at: Some(now),
                        cancelled_reason: Some(SCHEDULING_TIMED_OUT.to_string()),
                        status: Some(StepRunStatus::Cancelled),
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(());
        }

        let requeue_after = now
            + chrono::Duration::from_std(self.config.requeue_backoff)
                .unwrap_or_else(|_| chrono::Duration::seconds(5));

        let updated = self
            .store
            .update_group_key_run(
                tenant_id,
                id,
                &GroupKeyRunPatch {
                    requeue_after: Some(requeue_after),
                    ..Default::default()
                },
            )
            .await?;

        self.schedule_group_key_run(cancel, &updated).await
    }

    /// Pull a run off a dead worker and re-enter scheduling.
    async fn reassign_group_key_run(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        group_key_run: GroupKeyRun,
    ) -> ControllerResult<()> {
        let tenant_id = group_key_run.tenant_id;
        let id = group_key_run.id;

        debug!(group_key_run_id = %id, "reassigning group key run");

        let requeue_after = Utc::now()
            + chrono::Duration::from_std(self.config.requeue_backoff)
                .unwrap_or_else(|_| chrono::Duration::seconds(5));

        let updated = self
            .store
            .update_group_key_run(
                tenant_id,
                id,
                &GroupKeyRunPatch {
                    requeue_after: Some(requeue_after),
                    status: Some(StepRunStatus::PendingAssignment),
                    ..Default::default()
                },
            )
            .await?;

        self.schedule_group_key_run(cancel, &updated).await
    }
}
