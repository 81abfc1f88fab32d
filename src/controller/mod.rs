//! Workflow concurrency controller.
//!
//! The controller consumes the workflow processing queue, drives group-key
//! resolution for runs under a concurrency policy, admits queued runs when
//! capacity frees up, and runs the two reconciliation loops that recover from
//! worker and scheduler failure.
//!
//! One instance owns one subscription. All state lives in the store; the
//! controller itself is immutable after [`WorkflowController::start`].

mod admission;
mod reconciler;
mod scheduler;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::bus::{MessageBus, Queue};
use crate::config::{Config, RECONCILE_INTERVAL, REQUEUE_BACKOFF};
use crate::error::{ControllerError, ControllerResult};
use crate::messages::{Message, WorkflowTask};
use crate::store::Store;

pub use admission::CANCELLED_BY_CONCURRENCY_LIMIT;
pub use reconciler::SCHEDULING_TIMED_OUT;

/// Tunables for one controller instance.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Schedule timeout applied to a freshly assigned group-key run.
    pub default_step_run_timeout: Duration,
    /// Cadence of the requeue and reassign loops.
    pub reconcile_interval: Duration,
    /// Backoff written to a group-key run before the reconciler retries it.
    pub requeue_backoff: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            default_step_run_timeout: Duration::from_secs(60),
            reconcile_interval: RECONCILE_INTERVAL,
            requeue_backoff: REQUEUE_BACKOFF,
        }
    }
}

impl From<&Config> for ControllerConfig {
    fn from(config: &Config) -> Self {
        Self {
            default_step_run_timeout: config.default_step_run_timeout,
            ..Self::default()
        }
    }
}

/// The controller. Construct with [`WorkflowController::new`], then
/// [`start`](WorkflowController::start) it.
pub struct WorkflowController {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) bus: Arc<dyn MessageBus>,
    pub(crate) config: ControllerConfig,
}

impl WorkflowController {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<dyn MessageBus>,
        config: ControllerConfig,
    ) -> Arc<Self> {
        Arc::new(Self { store, bus, config })
    }

    /// Register the reconciler loops, subscribe to the workflow processing
    /// queue and start consuming. Returns the handle that owns shutdown.
    pub async fn start(self: &Arc<Self>) -> ControllerResult<ControllerHandle> {
        info!("starting workflow concurrency controller");

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let mut receiver = self.bus.subscribe(Queue::WorkflowProcessing).await?;

        let requeue = tokio::spawn(
            Arc::clone(self).run_group_key_run_requeue(cancel.clone()),
        );
        let reassign = tokio::spawn(
            Arc::clone(self).run_group_key_run_reassign(cancel.clone()),
        );

        let consumer = {
            let controller = Arc::clone(self);
            let cancel = cancel.clone();
            let tracker = tracker.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        message = receiver.recv() => {
                            let Some(message) = message else { break };
                            let controller = Arc::clone(&controller);
                            let cancel = cancel.clone();
                            tracker.spawn(async move {
                                controller.process_delivery(&cancel, message).await;
                            });
                        }
                    }
                }
            })
        };

        Ok(ControllerHandle {
            cancel,
            tracker,
            consumer,
            reconcilers: vec![requeue, reassign],
        })
    }

    async fn process_delivery(self: Arc<Self>, cancel: &CancellationToken, message: Message) {
        match self.handle_message(cancel, &message).await {
            Ok(()) => {
                metrics::counter!("flowgate_tasks_processed_total").increment(1);
            }
            Err(err) if err.is_retryable() && message.retries > 0 => {
                metrics::counter!("flowgate_task_retries_total").increment(1);
                warn!(
                    task = %message.id,
                    retries_left = message.retries - 1,
                    error = ?err,
                    "workflow task failed, redelivering"
                );
                let mut retry = message;
                retry.retries -= 1;
                if let Err(publish_err) = self.bus.publish(Queue::WorkflowProcessing, retry).await
                {
                    error!(error = ?publish_err, "could not redeliver workflow task");
                }
            }
            Err(err) => {
                metrics::counter!("flowgate_task_errors_total").increment(1);
                error!(task = %message.id, error = ?err, "could not handle workflow task");
            }
        }
    }

    /// Decode a delivery and dispatch it to its handler. The match is
    /// exhaustive over the closed task set; unknown ids fail in decode.
    pub async fn handle_message(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        message: &Message,
    ) -> ControllerResult<()> {
        if cancel.is_cancelled() {
            return Err(ControllerError::Shutdown);
        }

        let (metadata, task) = WorkflowTask::decode(message)?;
        let tenant_id = metadata.tenant_id;

        match task {
            WorkflowTask::WorkflowRunQueued(payload) => {
                self.handle_workflow_run_queued(cancel, tenant_id, payload).await
            }
            WorkflowTask::GroupKeyRunStarted(payload) => {
                self.handle_group_key_run_started(tenant_id, payload).await
            }
            WorkflowTask::GroupKeyRunFinished(payload) => {
                self.handle_group_key_run_finished(cancel, tenant_id, payload).await
            }
            WorkflowTask::GroupKeyRunFailed(payload) => {
                self.handle_group_key_run_failed(tenant_id, payload).await
            }
            WorkflowTask::WorkflowRunFinished(payload) => {
                self.handle_workflow_run_finished(cancel, tenant_id, payload).await
            }
        }
    }
}

/// Owns the running controller. Dropping it without calling
/// [`shutdown`](ControllerHandle::shutdown) leaves the background tasks
/// running detached.
pub struct ControllerHandle {
    cancel: CancellationToken,
    tracker: TaskTracker,
    consumer: JoinHandle<()>,
    reconcilers: Vec<JoinHandle<()>>,
}

impl ControllerHandle {
    /// Cancellation token shared with every handler and loop.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the controller: cancel the root context, stop consuming, wait for
    /// in-flight handlers to drain, then stop the reconciler loops. All four
    /// steps always run; the first error is reported.
    pub async fn shutdown(self) -> ControllerResult<()> {
        info!("shutting down workflow concurrency controller");

        self.cancel.cancel();

        let mut result = Ok(());

        if let Err(err) = self.consumer.await {
            result = Err(ControllerError::Panicked(format!("consumer task: {err}")));
        }

        self.tracker.close();
        self.tracker.wait().await;

        for handle in self.reconcilers {
            if let Err(err) = handle.await {
                if result.is_ok() {
                    result =
                        Err(ControllerError::Panicked(format!("reconciler task: {err}")));
                }
            }
        }

        result
    }
}
