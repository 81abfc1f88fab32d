//! Store layer for the workflow concurrency controller.
//!
//! The store is the single source of truth for workflow runs, group-key runs,
//! workers, tickers and tenants. The controller never caches mutable state;
//! everything goes through the traits defined here.
//!
//! Two implementations ship with the crate:
//! - `memory`: `Arc<Mutex<…>>` state for tests and local runs
//! - `postgres`: the production implementation over `sqlx`

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use postgres::PgStore;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowRunId(pub Uuid);

impl WorkflowRunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkflowRunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowRunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a group-key run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupKeyRunId(pub Uuid);

impl GroupKeyRunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for GroupKeyRunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for GroupKeyRunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a workflow version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowVersionId(pub Uuid);

impl WorkflowVersionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkflowVersionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowVersionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Action id a worker must advertise to resolve group keys for a workflow
/// version. Worker eligibility in `assign_group_key_run_to_worker` joins on
/// this string.
pub fn group_key_action_id(workflow_version_id: WorkflowVersionId) -> String {
    format!("get-group-key:{workflow_version_id}")
}

// ============================================================================
// Status Enums
// ============================================================================

/// Status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowRunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl WorkflowRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(Self::Queued),
            "RUNNING" => Some(Self::Running),
            "SUCCEEDED" => Some(Self::Succeeded),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Status of a step run. Group-key runs share this state machine: a group-key
/// run is the step-like sub-execution that resolves the concurrency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepRunStatus {
    Pending,
    PendingAssignment,
    Assigned,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl StepRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::PendingAssignment => "PENDING_ASSIGNMENT",
            Self::Assigned => "ASSIGNED",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "PENDING_ASSIGNMENT" => Some(Self::PendingAssignment),
            "ASSIGNED" => Some(Self::Assigned),
            "RUNNING" => Some(Self::Running),
            "SUCCEEDED" => Some(Self::Succeeded),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// Concurrency limit strategy declared on a workflow version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitStrategy {
    CancelInProgress,
    GroupRoundRobin,
}

impl LimitStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CancelInProgress => "CANCEL_IN_PROGRESS",
            Self::GroupRoundRobin => "GROUP_ROUND_ROBIN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CANCEL_IN_PROGRESS" => Some(Self::CancelInProgress),
            "GROUP_ROUND_ROBIN" => Some(Self::GroupRoundRobin),
            _ => None,
        }
    }
}

/// Ordering direction for list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderDirection {
    Asc,
    Desc,
}

// ============================================================================
// Model Structs
// ============================================================================

/// A tenant. Scopes every other entity; every store call takes a tenant id.
#[derive(Debug, Clone)]
pub struct Tenant {
    pub id: Uuid,
}

/// Concurrency policy attached to a workflow version.
#[derive(Debug, Clone)]
pub struct ConcurrencyPolicy {
    pub workflow_version_id: WorkflowVersionId,
    /// Maximum simultaneously running instances per group key.
    pub max_runs: i32,
    pub limit_strategy: LimitStrategy,
}

/// A workflow version with its optional concurrency policy.
#[derive(Debug, Clone)]
pub struct WorkflowVersion {
    pub id: WorkflowVersionId,
    pub tenant_id: Uuid,
    pub concurrency: Option<ConcurrencyPolicy>,
}

/// A job run belonging to a workflow run. Released job runs are published one
/// message each on the job processing queue.
#[derive(Debug, Clone)]
pub struct JobRun {
    pub id: Uuid,
    pub job_id: Uuid,
    pub tenant_id: Uuid,
}

/// One invocation of a workflow version.
#[derive(Debug, Clone)]
pub struct WorkflowRun {
    pub id: WorkflowRunId,
    pub tenant_id: Uuid,
    pub workflow_version_id: WorkflowVersionId,
    pub status: WorkflowRunStatus,
    pub created_at: DateTime<Utc>,
    /// Resolved concurrency group key, once the group-key run has succeeded.
    pub group_key: Option<String>,
    /// Present exactly when the workflow version has a concurrency policy.
    pub group_key_run_id: Option<GroupKeyRunId>,
    pub job_runs: Vec<JobRun>,
}

/// The sub-execution that resolves a workflow run's concurrency group key.
#[derive(Debug, Clone)]
pub struct GroupKeyRun {
    pub id: GroupKeyRunId,
    pub tenant_id: Uuid,
    pub workflow_run_id: WorkflowRunId,
    pub workflow_version_id: WorkflowVersionId,
    pub status: StepRunStatus,
    pub worker_id: Option<Uuid>,
    pub dispatcher_id: Option<Uuid>,
    pub ticker_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// The resolved group key string.
    pub output: Option<String>,
    pub error: Option<String>,
    pub requeue_after: Option<DateTime<Utc>>,
    pub schedule_timeout_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancelled_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A step run within a job run. The controller only ever lists these to
/// pre-empt the running ones.
#[derive(Debug, Clone)]
pub struct StepRun {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub job_run_id: Uuid,
    pub workflow_run_id: WorkflowRunId,
    pub status: StepRunStatus,
}

/// A remote worker able to execute actions. Heartbeats are maintained by an
/// external service; the controller only reads the active flag.
#[derive(Debug, Clone)]
pub struct Worker {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub dispatcher_id: Uuid,
    pub is_active: bool,
    pub actions: Vec<String>,
}

/// A ticker instance responsible for honoring scheduled timeout tasks.
#[derive(Debug, Clone)]
pub struct Ticker {
    pub id: Uuid,
    pub is_active: bool,
}

/// Result of assigning a group-key run to a worker.
#[derive(Debug, Clone, Copy)]
pub struct WorkerAssignment {
    pub worker_id: Uuid,
    pub dispatcher_id: Uuid,
}

// ============================================================================
// Patches & Filters
// ============================================================================

/// Partial update for a group-key run. Each field is "set if present": an
/// absent field leaves the column untouched, it does not clear it.
#[derive(Debug, Clone, Default)]
pub struct GroupKeyRunPatch {
    pub status: Option<StepRunStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancelled_reason: Option<String>,
    pub requeue_after: Option<DateTime<Utc>>,
}

/// Filter for listing workflow runs. Ordering is by creation time with a
/// stable id tie-break.
#[derive(Debug, Clone, Default)]
pub struct WorkflowRunFilter {
    pub workflow_version_id: Option<WorkflowVersionId>,
    pub group_key: Option<String>,
    pub status: Option<WorkflowRunStatus>,
    pub order: Option<OrderDirection>,
    pub limit: Option<i64>,
}

/// Filter for listing step runs.
#[derive(Debug, Clone, Default)]
pub struct StepRunFilter {
    pub workflow_run_id: Option<WorkflowRunId>,
    pub status: Option<StepRunStatus>,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// No active worker advertises the group-key action. Not an error from
    /// the scheduler's point of view; the reconciler retries.
    #[error("no worker available")]
    NoWorkerAvailable,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// Whether the bus should redeliver the message that hit this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::Database(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

// ============================================================================
// Traits
// ============================================================================

#[async_trait]
pub trait WorkflowRunStore: Send + Sync {
    async fn get_workflow_run(
        &self,
        tenant_id: Uuid,
        id: WorkflowRunId,
    ) -> StoreResult<WorkflowRun>;

    /// List runs matching the filter. Listings may omit `job_runs`; release
    /// paths fetch by id first.
    async fn list_workflow_runs(
        &self,
        tenant_id: Uuid,
        filter: &WorkflowRunFilter,
    ) -> StoreResult<Vec<WorkflowRun>>;

    /// Atomically select the next batch of QUEUED runs in round-robin order
    /// over group keys, mark them RUNNING, and return their ids. At most
    /// `max_runs` runs total per call.
    async fn pop_workflow_runs_round_robin(
        &self,
        tenant_id: Uuid,
        workflow_version_id: WorkflowVersionId,
        max_runs: i32,
    ) -> StoreResult<Vec<WorkflowRunId>>;
}

#[async_trait]
pub trait GroupKeyRunStore: Send + Sync {
    async fn get_group_key_run(
        &self,
        tenant_id: Uuid,
        id: GroupKeyRunId,
    ) -> StoreResult<GroupKeyRun>;

    /// Apply a partial update and return the updated row. A run already in a
    /// terminal state is left untouched and returned as-is, which makes
    /// duplicate terminal-state deliveries no-ops. Setting `output` also
    /// stamps the resolved key onto the owning workflow run.
    async fn update_group_key_run(
        &self,
        tenant_id: Uuid,
        id: GroupKeyRunId,
        patch: &GroupKeyRunPatch,
    ) -> StoreResult<GroupKeyRun>;

    /// Atomically pick an active worker advertising the run's group-key
    /// action, record the assignment and move the run to ASSIGNED. Fails with
    /// [`StoreError::NoWorkerAvailable`] when no worker qualifies.
    async fn assign_group_key_run_to_worker(
        &self,
        tenant_id: Uuid,
        id: GroupKeyRunId,
    ) -> StoreResult<WorkerAssignment>;

    /// Assign an active ticker to the run and return its id.
    async fn assign_group_key_run_to_ticker(
        &self,
        tenant_id: Uuid,
        id: GroupKeyRunId,
    ) -> StoreResult<Uuid>;

    /// PENDING / PENDING_ASSIGNMENT runs that are due for another scheduling
    /// attempt: their requeue time has passed, or they were never scheduled
    /// at all (no worker and no requeue time).
    async fn list_group_key_runs_to_requeue(
        &self,
        tenant_id: Uuid,
    ) -> StoreResult<Vec<GroupKeyRun>>;

    /// ASSIGNED / RUNNING runs whose assigned worker is inactive or gone.
    async fn list_group_key_runs_to_reassign(
        &self,
        tenant_id: Uuid,
    ) -> StoreResult<Vec<GroupKeyRun>>;
}

#[async_trait]
pub trait StepRunStore: Send + Sync {
    async fn list_step_runs(
        &self,
        tenant_id: Uuid,
        filter: &StepRunFilter,
    ) -> StoreResult<Vec<StepRun>>;
}

#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn list_tenants(&self) -> StoreResult<Vec<Tenant>>;
}

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn get_workflow_version(
        &self,
        tenant_id: Uuid,
        id: WorkflowVersionId,
    ) -> StoreResult<WorkflowVersion>;
}

/// The full store surface the controller is constructed with. Pass it by
/// reference into the controller; never via ambient state.
pub trait Store:
    WorkflowRunStore + GroupKeyRunStore + StepRunStore + TenantStore + WorkflowStore
{
}

impl<T> Store for T where
    T: WorkflowRunStore + GroupKeyRunStore + StepRunStore + TenantStore + WorkflowStore
{
}

// ============================================================================
// Tests
// ============================================================================
