//! Flowgate - the workflow concurrency controller of a task-orchestration
//! engine.
//!
//! When a workflow version declares a concurrency policy, this controller
//! makes sure no more than `max_runs` instances run at once per group key,
//! and decides which queued run advances next. The key components are:
//!
//! ## Controller
//!
//! - [`WorkflowController`]: consumes the workflow processing queue, drives
//!   the group-key scheduler and the admission engine, runs the requeue and
//!   reassign reconciliation loops
//! - [`ControllerHandle`]: owns graceful shutdown (cancel, unsubscribe,
//!   drain, stop loops)
//!
//! ## Seams
//!
//! - [`store`]: entity types and the store traits, with in-memory and
//!   Postgres implementations
//! - [`bus`]: queue addressing and the message bus trait, with an in-memory
//!   implementation
//! - [`messages`]: the typed message contracts consumed and produced on the
//!   bus

pub mod bus;
pub mod config;
pub mod error;
pub mod fanout;
pub mod messages;
pub mod observability;
pub mod store;

mod controller;

// Configuration
pub use config::{Config, DEFAULT_STEP_RUN_TIMEOUT, RECONCILE_INTERVAL, REQUEUE_BACKOFF};

// Controller
pub use controller::{
    CANCELLED_BY_CONCURRENCY_LIMIT, ControllerConfig, ControllerHandle, SCHEDULING_TIMED_OUT,
    WorkflowController,
};

// Errors
pub use error::{ControllerError, ControllerResult};

// Messages
pub use messages::{DEFAULT_TASK_RETRIES, DecodeError, Message, TaskMetadata, WorkflowTask};

// Bus
pub use bus::{BusError, MemoryBus, MessageBus, Queue};

// Store
pub use store::{
    ConcurrencyPolicy, GroupKeyRun, GroupKeyRunId, GroupKeyRunPatch, JobRun, LimitStrategy,
    MemoryStore, PgStore, StepRun, StepRunStatus, Store, StoreError, Tenant, Ticker, Worker,
    WorkflowRun, WorkflowRunId, WorkflowRunStatus, WorkflowVersion, WorkflowVersionId,
};
