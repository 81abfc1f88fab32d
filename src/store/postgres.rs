//! Postgres store.
//!
//! Runtime-bound queries over a shared pool. Worker assignment takes the
//! worker row with SKIP LOCKED so concurrent schedulers never hand the same
//! capacity out twice; the round-robin pop is a single windowed
//! select-and-update.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Row};
use uuid::Uuid;

use super::{
    ConcurrencyPolicy, GroupKeyRun, GroupKeyRunId, GroupKeyRunPatch, GroupKeyRunStore, JobRun,
    LimitStrategy, OrderDirection, StepRun, StepRunFilter, StepRunStatus, StepRunStore,
    StoreError, StoreResult, Tenant, TenantStore, WorkerAssignment, WorkflowRun,
    WorkflowRunFilter, WorkflowRunId, WorkflowRunStatus, WorkflowRunStore, WorkflowStore,
    WorkflowVersion, WorkflowVersionId,
};

/// Store backed by a Postgres pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and run migrations.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        Self::connect_with_pool_size(database_url, 10).await
    }

    /// Connect with a custom pool size.
    pub async fn connect_with_pool_size(
        database_url: &str,
        max_connections: u32,
    ) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|err| StoreError::Conflict(format!("migration failed: {err}")))?;

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// Row types
// ============================================================================

#[derive(FromRow)]
struct WorkflowRunRow {
    id: Uuid,
    tenant_id: Uuid,
    workflow_version_id: Uuid,
    status: String,
    concurrency_group_key: Option<String>,
    group_key_run_id: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl WorkflowRunRow {
    fn into_run(self, job_runs: Vec<JobRun>) -> StoreResult<WorkflowRun> {
        Ok(WorkflowRun {
            id: WorkflowRunId(self.id),
            tenant_id: self.tenant_id,
            workflow_version_id: WorkflowVersionId(self.workflow_version_id),
            status: parse_workflow_run_status(&self.status)?,
            created_at: self.created_at,
            group_key: self.concurrency_group_key,
            group_key_run_id: self.group_key_run_id.map(GroupKeyRunId),
            job_runs,
        })
    }
}

#[derive(FromRow)]
struct GroupKeyRunRow {
    id: Uuid,
    tenant_id: Uuid,
    workflow_run_id: Uuid,
    workflow_version_id: Uuid,
    status: String,
    worker_id: Option<Uuid>,
    dispatcher_id: Option<Uuid>,
    ticker_id: Option<Uuid>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    output: Option<String>,
    error: Option<String>,
    requeue_after: Option<DateTime<Utc>>,
    schedule_timeout_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    cancelled_reason: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<GroupKeyRunRow> for GroupKeyRun {
    type Error = StoreError;

    fn try_from(row: GroupKeyRunRow) -> StoreResult<Self> {
        Ok(GroupKeyRun {
            id: GroupKeyRunId(row.id),
            tenant_id: row.tenant_id,
            workflow_run_id: WorkflowRunId(row.workflow_run_id),
            workflow_version_id: WorkflowVersionId(row.workflow_version_id),
            status: parse_step_run_status(&row.status)?,
            worker_id: row.worker_id,
            dispatcher_id: row.dispatcher_id,
            ticker_id: row.ticker_id,
            started_at: row.started_at,
            finished_at: row.finished_at,
            output: row.output,
            error: row.error,
            requeue_after: row.requeue_after,
            schedule_timeout_at: row.schedule_timeout_at,
            cancelled_at: row.cancelled_at,
            cancelled_reason: row.cancelled_reason,
            created_at: row.created_at,
        })
    }
}

fn parse_workflow_run_status(s: &str) -> StoreResult<WorkflowRunStatus> {
    WorkflowRunStatus::parse(s)
        .ok_or_else(|| StoreError::Conflict(format!("invalid workflow run status: {s}")))
}

fn parse_step_run_status(s: &str) -> StoreResult<StepRunStatus> {
    StepRunStatus::parse(s)
        .ok_or_else(|| StoreError::Conflict(format!("invalid step run status: {s}")))
}

const WORKFLOW_RUN_COLUMNS: &str = r#"
    r.id, r.tenant_id, r.workflow_version_id, r.status, r.concurrency_group_key,
    (SELECT g.id FROM group_key_runs g WHERE g.workflow_run_id = r.id) AS group_key_run_id,
    r.created_at
"#;

const GROUP_KEY_RUN_COLUMNS: &str = r#"
    id, tenant_id, workflow_run_id, workflow_version_id, status, worker_id,
    dispatcher_id, ticker_id, started_at, finished_at, output, error,
    requeue_after, schedule_timeout_at, cancelled_at, cancelled_reason, created_at
"#;

impl PgStore {
    async fn job_runs_for(&self, workflow_run_id: Uuid) -> StoreResult<Vec<JobRun>> {
        let rows = sqlx::query(
            "SELECT id, job_id, tenant_id FROM job_runs WHERE workflow_run_id = $1 ORDER BY id",
        )
        .bind(workflow_run_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| JobRun {
                id: row.get("id"),
                job_id: row.get("job_id"),
                tenant_id: row.get("tenant_id"),
            })
            .collect())
    }

    async fn fetch_group_key_run(
        &self,
        tenant_id: Uuid,
        id: GroupKeyRunId,
    ) -> StoreResult<Option<GroupKeyRun>> {
        let query = format!(
            "SELECT {GROUP_KEY_RUN_COLUMNS} FROM group_key_runs WHERE tenant_id = $1 AND id = $2"
        );
        let row = sqlx::query_as::<_, GroupKeyRunRow>(&query)
            .bind(tenant_id)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(GroupKeyRun::try_from).transpose()
    }
}

#[async_trait]
impl WorkflowRunStore for PgStore {
    async fn get_workflow_run(
        &self,
        tenant_id: Uuid,
        id: WorkflowRunId,
    ) -> StoreResult<WorkflowRun> {
        let query = format!(
            "SELECT {WORKFLOW_RUN_COLUMNS} FROM workflow_runs r WHERE r.tenant_id = $1 AND r.id = $2"
        );
        let row = sqlx::query_as::<_, WorkflowRunRow>(&query)
            .bind(tenant_id)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("workflow run {id}")))?;

        let job_runs = self.job_runs_for(row.id).await?;
        row.into_run(job_runs)
    }

    async fn list_workflow_runs(
        &self,
        tenant_id: Uuid,
        filter: &WorkflowRunFilter,
    ) -> StoreResult<Vec<WorkflowRun>> {
        let direction = match filter.order {
            Some(OrderDirection::Desc) => "DESC",
            _ => "ASC",
        };
        let query = format!(
            r#"
            SELECT {WORKFLOW_RUN_COLUMNS}
            FROM workflow_runs r
            WHERE r.tenant_id = $1
              AND ($2::uuid IS NULL OR r.workflow_version_id = $2)
              AND ($3::text IS NULL OR r.concurrency_group_key = $3)
              AND ($4::text IS NULL OR r.status = $4)
            ORDER BY r.created_at {direction}, r.id {direction}
            LIMIT $5
            "#
        );

        let rows = sqlx::query_as::<_, WorkflowRunRow>(&query)
            .bind(tenant_id)
            .bind(filter.workflow_version_id.map(|v| v.0))
            .bind(filter.group_key.as_deref())
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.limit)
            .fetch_all(&self.pool)
            .await?;

        // Listings carry no job runs; release paths re-fetch by id.
        rows.into_iter().map(|row| row.into_run(Vec::new())).collect()
    }

    async fn pop_workflow_runs_round_robin(
        &self,
        tenant_id: Uuid,
        workflow_version_id: WorkflowVersionId,
        max_runs: i32,
    ) -> StoreResult<Vec<WorkflowRunId>> {
        let rows = sqlx::query(
            r#"
            WITH eligible AS (
                SELECT id, created_at,
                       ROW_NUMBER() OVER (
                           PARTITION BY concurrency_group_key
                           ORDER BY created_at, id
                       ) AS turn
                FROM workflow_runs
                WHERE tenant_id = $1
                  AND workflow_version_id = $2
                  AND status = 'QUEUED'
                  AND concurrency_group_key IS NOT NULL
            ), picked AS (
                SELECT id FROM eligible ORDER BY turn, created_at, id LIMIT $3
            )
            UPDATE workflow_runs r
            SET status = 'RUNNING'
            FROM picked
            WHERE r.id = picked.id
            RETURNING r.id
            "#,
        )
        .bind(tenant_id)
        .bind(workflow_version_id.0)
        .bind(i64::from(max_runs.max(0)))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| WorkflowRunId(row.get("id")))
            .collect())
    }
}

#[async_trait]
impl GroupKeyRunStore for PgStore {
    async fn get_group_key_run(
        &self,
        tenant_id: Uuid,
        id: GroupKeyRunId,
    ) -> StoreResult<GroupKeyRun> {
        self.fetch_group_key_run(tenant_id, id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("group key run {id}")))
    }

    async fn update_group_key_run(
        &self,
        tenant_id: Uuid,
        id: GroupKeyRunId,
        patch: &GroupKeyRunPatch,
    ) -> StoreResult<GroupKeyRun> {
        let query = format!(
            r#"
            UPDATE group_key_runs SET
                status = COALESCE($3, status),
                started_at = COALESCE($4, started_at),
                finished_at = COALESCE($5, finished_at),
                output = COALESCE($6, output),
                error = COALESCE($7, error),
                cancelled_at = COALESCE($8, cancelled_at),
                cancelled_reason = COALESCE($9, cancelled_reason),
                requeue_after = COALESCE($10, requeue_after)
            WHERE tenant_id = $1 AND id = $2
              AND status NOT IN ('SUCCEEDED', 'FAILED', 'CANCELLED')
            RETURNING {GROUP_KEY_RUN_COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, GroupKeyRunRow>(&query)
            .bind(tenant_id)
            .bind(id.0)
            .bind(patch.status.map(|s| s.as_str()))
            .bind(patch.started_at)
            .bind(patch.finished_at)
            .bind(patch.output.as_deref())
            .bind(patch.error.as_deref())
            .bind(patch.cancelled_at)
            .bind(patch.cancelled_reason.as_deref())
            .bind(patch.requeue_after)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                // Stamp a resolved key onto the owning workflow run so
                // admission listings see it.
                if let Some(output) = patch.output.as_deref() {
                    sqlx::query(
                        "UPDATE workflow_runs SET concurrency_group_key = $2 WHERE id = $1",
                    )
                    .bind(row.workflow_run_id)
                    .bind(output)
                    .execute(&self.pool)
                    .await?;
                }
                row.try_into()
            }
            // Either already terminal (no-op) or gone.
            None => self
                .fetch_group_key_run(tenant_id, id)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("group key run {id}"))),
        }
    }

    async fn assign_group_key_run_to_worker(
        &self,
        tenant_id: Uuid,
        id: GroupKeyRunId,
    ) -> StoreResult<WorkerAssignment> {
        let row = sqlx::query(
            r#"
            WITH selected AS (
                SELECT w.id AS worker_id, w.dispatcher_id
                FROM workers w
                JOIN worker_actions wa ON wa.worker_id = w.id
                JOIN group_key_runs g ON g.id = $2 AND g.tenant_id = $1
                WHERE w.tenant_id = $1
                  AND w.is_active
                  AND wa.action_id = 'get-group-key:' || g.workflow_version_id::text
                ORDER BY w.id
                LIMIT 1
                FOR UPDATE OF w SKIP LOCKED
            )
            UPDATE group_key_runs g
            SET worker_id = selected.worker_id,
                dispatcher_id = selected.dispatcher_id,
                status = 'ASSIGNED'
            FROM selected
            WHERE g.tenant_id = $1 AND g.id = $2
            RETURNING selected.worker_id, selected.dispatcher_id
            "#,
        )
        .bind(tenant_id)
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(WorkerAssignment {
                worker_id: row.get("worker_id"),
                dispatcher_id: row.get("dispatcher_id"),
            }),
            None => {
                // Distinguish a missing run from missing capacity.
                if self.fetch_group_key_run(tenant_id, id).await?.is_some() {
                    Err(StoreError::NoWorkerAvailable)
                } else {
                    Err(StoreError::NotFound(format!("group key run {id}")))
                }
            }
        }
    }

    async fn assign_group_key_run_to_ticker(
        &self,
        tenant_id: Uuid,
        id: GroupKeyRunId,
    ) -> StoreResult<Uuid> {
        let row = sqlx::query(
            r#"
            WITH selected AS (
                SELECT id FROM tickers WHERE is_active ORDER BY id LIMIT 1
            )
            UPDATE group_key_runs g
            SET ticker_id = selected.id
            FROM selected
            WHERE g.tenant_id = $1 AND g.id = $2
            RETURNING selected.id AS ticker_id
            "#,
        )
        .bind(tenant_id)
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row.get("ticker_id")),
            None => {
                if self.fetch_group_key_run(tenant_id, id).await?.is_some() {
                    Err(StoreError::NotFound("no active ticker".to_string()))
                } else {
                    Err(StoreError::NotFound(format!("group key run {id}")))
                }
            }
        }
    }

    async fn list_group_key_runs_to_requeue(
        &self,
        tenant_id: Uuid,
    ) -> StoreResult<Vec<GroupKeyRun>> {
        let query = format!(
            r#"
            SELECT {GROUP_KEY_RUN_COLUMNS}
            FROM group_key_runs
            WHERE tenant_id = $1
              AND status IN ('PENDING', 'PENDING_ASSIGNMENT')
              AND (
                  (requeue_after IS NOT NULL AND requeue_after <= NOW())
                  OR (requeue_after IS NULL AND worker_id IS NULL)
              )
            ORDER BY created_at
            LIMIT 1000
            "#
        );
        let rows = sqlx::query_as::<_, GroupKeyRunRow>(&query)
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(GroupKeyRun::try_from).collect()
    }

    async fn list_group_key_runs_to_reassign(
        &self,
        tenant_id: Uuid,
    ) -> StoreResult<Vec<GroupKeyRun>> {
        let query = format!(
            r#"
            SELECT {GROUP_KEY_RUN_COLUMNS}
            FROM (
                SELECT g.*
                FROM group_key_runs g
                LEFT JOIN workers w ON w.id = g.worker_id
                WHERE g.tenant_id = $1
                  AND g.status IN ('ASSIGNED', 'RUNNING')
                  AND g.worker_id IS NOT NULL
                  AND (w.id IS NULL OR NOT w.is_active)
            ) AS group_key_runs
            ORDER BY created_at
            LIMIT 1000
            "#
        );
        let rows = sqlx::query_as::<_, GroupKeyRunRow>(&query)
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(GroupKeyRun::try_from).collect()
    }
}

#[async_trait]
impl StepRunStore for PgStore {
    async fn list_step_runs(
        &self,
        tenant_id: Uuid,
        filter: &StepRunFilter,
    ) -> StoreResult<Vec<StepRun>> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, job_run_id, workflow_run_id, status
            FROM step_runs
            WHERE tenant_id = $1
              AND ($2::uuid IS NULL OR workflow_run_id = $2)
              AND ($3::text IS NULL OR status = $3)
            ORDER BY id
            "#,
        )
        .bind(tenant_id)
        .bind(filter.workflow_run_id.map(|id| id.0))
        .bind(filter.status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(StepRun {
                    id: row.get("id"),
                    tenant_id: row.get("tenant_id"),
                    job_run_id: row.get("job_run_id"),
                    workflow_run_id: WorkflowRunId(row.get("workflow_run_id")),
                    status: parse_step_run_status(row.get("status"))?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl TenantStore for PgStore {
    async fn list_tenants(&self) -> StoreResult<Vec<Tenant>> {
        let rows = sqlx::query("SELECT id FROM tenants ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| Tenant { id: row.get("id") })
            .collect())
    }
}

#[async_trait]
impl WorkflowStore for PgStore {
    async fn get_workflow_version(
        &self,
        tenant_id: Uuid,
        id: WorkflowVersionId,
    ) -> StoreResult<WorkflowVersion> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, concurrency_max_runs, concurrency_limit_strategy
            FROM workflow_versions
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("workflow version {id}")))?;

        let max_runs: Option<i32> = row.get("concurrency_max_runs");
        let strategy: Option<String> = row.get("concurrency_limit_strategy");
        let concurrency = match (max_runs, strategy) {
            (Some(max_runs), Some(strategy)) => Some(ConcurrencyPolicy {
                workflow_version_id: id,
                max_runs,
                limit_strategy: LimitStrategy::parse(&strategy).ok_or_else(|| {
                    StoreError::Conflict(format!("invalid limit strategy: {strategy}"))
                })?,
            }),
            _ => None,
        };

        Ok(WorkflowVersion {
            id,
            tenant_id,
            concurrency,
        })
    }
}
