//! In-memory store for tests and local runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{
    GroupKeyRun, GroupKeyRunId, GroupKeyRunPatch, GroupKeyRunStore, JobRun, OrderDirection,
    StepRun, StepRunFilter, StepRunStatus, StepRunStore, StoreError, StoreResult, Tenant,
    TenantStore, Ticker, Worker, WorkerAssignment, WorkflowRun, WorkflowRunFilter, WorkflowRunId,
    WorkflowRunStatus, WorkflowRunStore, WorkflowStore, WorkflowVersion, WorkflowVersionId,
    group_key_action_id,
};

#[derive(Default)]
struct State {
    tenants: Vec<Tenant>,
    workflow_versions: HashMap<WorkflowVersionId, WorkflowVersion>,
    workflow_runs: HashMap<WorkflowRunId, WorkflowRun>,
    group_key_runs: HashMap<GroupKeyRunId, GroupKeyRun>,
    step_runs: HashMap<Uuid, StepRun>,
    workers: HashMap<Uuid, Worker>,
    tickers: HashMap<Uuid, Ticker>,
}

/// Store that keeps everything behind one mutex. Seed helpers cover what the
/// upstream intake service would normally create.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("store state poisoned")
    }

    // ------------------------------------------------------------------
    // Seed helpers
    // ------------------------------------------------------------------

    pub fn insert_tenant(&self, tenant: Tenant) {
        self.lock().tenants.push(tenant);
    }

    pub fn insert_workflow_version(&self, version: WorkflowVersion) {
        self.lock().workflow_versions.insert(version.id, version);
    }

    pub fn insert_workflow_run(&self, run: WorkflowRun) {
        self.lock().workflow_runs.insert(run.id, run);
    }

    pub fn insert_group_key_run(&self, run: GroupKeyRun) {
        self.lock().group_key_runs.insert(run.id, run);
    }

    pub fn insert_step_run(&self, step_run: StepRun) {
        self.lock().step_runs.insert(step_run.id, step_run);
    }

    pub fn insert_worker(&self, worker: Worker) {
        self.lock().workers.insert(worker.id, worker);
    }

    pub fn insert_ticker(&self, ticker: Ticker) {
        self.lock().tickers.insert(ticker.id, ticker);
    }

    /// Flip a worker's active flag, as the external heartbeat service would.
    pub fn set_worker_active(&self, worker_id: Uuid, is_active: bool) {
        if let Some(worker) = self.lock().workers.get_mut(&worker_id) {
            worker.is_active = is_active;
        }
    }

    // ------------------------------------------------------------------
    // Inspection helpers
    // ------------------------------------------------------------------

    pub fn group_key_run(&self, id: GroupKeyRunId) -> Option<GroupKeyRun> {
        self.lock().group_key_runs.get(&id).cloned()
    }

    pub fn workflow_run(&self, id: WorkflowRunId) -> Option<WorkflowRun> {
        self.lock().workflow_runs.get(&id).cloned()
    }
}

#[async_trait]
impl WorkflowRunStore for MemoryStore {
    async fn get_workflow_run(
        &self,
        tenant_id: Uuid,
        id: WorkflowRunId,
    ) -> StoreResult<WorkflowRun> {
        let state = self.lock();
        state
            .workflow_runs
            .get(&id)
            .filter(|run| run.tenant_id == tenant_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("workflow run {id}")))
    }

    async fn list_workflow_runs(
        &self,
        tenant_id: Uuid,
        filter: &WorkflowRunFilter,
    ) -> StoreResult<Vec<WorkflowRun>> {
        let state = self.lock();
        let mut runs: Vec<WorkflowRun> = state
            .workflow_runs
            .values()
            .filter(|run| run.tenant_id == tenant_id)
            .filter(|run| {
                filter
                    .workflow_version_id
                    .is_none_or(|v| run.workflow_version_id == v)
            })
            .filter(|run| {
                filter
                    .group_key
                    .as_deref()
                    .is_none_or(|key| run.group_key.as_deref() == Some(key))
            })
            .filter(|run| filter.status.is_none_or(|s| run.status == s))
            .cloned()
            .collect();

        runs.sort_by(|a, b| {
            let ord = a.created_at.cmp(&b.created_at).then(a.id.0.cmp(&b.id.0));
            match filter.order {
                Some(OrderDirection::Desc) => ord.reverse(),
                _ => ord,
            }
        });

        if let Some(limit) = filter.limit {
            runs.truncate(limit.max(0) as usize);
        }

        Ok(runs)
    }

    async fn pop_workflow_runs_round_robin(
        &self,
        tenant_id: Uuid,
        workflow_version_id: WorkflowVersionId,
        max_runs: i32,
    ) -> StoreResult<Vec<WorkflowRunId>> {
        let mut state = self.lock();

        // Rank queued runs inside each group key by age, then interleave the
        // per-key ranks so every key gets its turn.
        let mut by_key: HashMap<String, Vec<(chrono::DateTime<Utc>, WorkflowRunId)>> =
            HashMap::new();
        for run in state.workflow_runs.values() {
            if run.tenant_id != tenant_id
                || run.workflow_version_id != workflow_version_id
                || run.status != WorkflowRunStatus::Queued
            {
                continue;
            }
            let Some(key) = run.group_key.clone() else {
                continue;
            };
            by_key.entry(key).or_default().push((run.created_at, run.id));
        }

        let mut ranked: Vec<(usize, chrono::DateTime<Utc>, WorkflowRunId)> = Vec::new();
        for runs in by_key.values_mut() {
            runs.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.0.cmp(&b.1.0)));
            for (rank, (created_at, id)) in runs.iter().enumerate() {
                ranked.push((rank, *created_at, *id));
            }
        }
        ranked.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)).then(a.2.0.cmp(&b.2.0)));

        let mut popped = Vec::new();
        for (_, _, id) in ranked.into_iter().take(max_runs.max(0) as usize) {
            if let Some(run) = state.workflow_runs.get_mut(&id) {
                run.status = WorkflowRunStatus::Running;
                popped.push(id);
            }
        }

        Ok(popped)
    }
}

#[async_trait]
impl GroupKeyRunStore for MemoryStore {
    async fn get_group_key_run(
        &self,
        tenant_id: Uuid,
        id: GroupKeyRunId,
    ) -> StoreResult<GroupKeyRun> {
        let state = self.lock();
        state
            .group_key_runs
            .get(&id)
            .filter(|run| run.tenant_id == tenant_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("group key run {id}")))
    }

    async fn update_group_key_run(
        &self,
        tenant_id: Uuid,
        id: GroupKeyRunId,
        patch: &GroupKeyRunPatch,
    ) -> StoreResult<GroupKeyRun> {
        let mut state = self.lock();
        let run = state
            .group_key_runs
            .get_mut(&id)
            .filter(|run| run.tenant_id == tenant_id)
            .ok_or_else(|| StoreError::NotFound(format!("group key run {id}")))?;

        // Duplicate terminal deliveries are no-ops.
        if run.status.is_terminal() {
            return Ok(run.clone());
        }

        if let Some(status) = patch.status {
            run.status = status;
        }
        if let Some(started_at) = patch.started_at {
            run.started_at = Some(started_at);
        }
        if let Some(finished_at) = patch.finished_at {
            run.finished_at = Some(finished_at);
        }
        if let Some(output) = &patch.output {
            run.output = Some(output.clone());
        }
        if let Some(error) = &patch.error {
            run.error = Some(error.clone());
        }
        if let Some(cancelled_at) = patch.cancelled_at {
            run.cancelled_at = Some(cancelled_at);
        }
        if let Some(cancelled_reason) = &patch.cancelled_reason {
            run.cancelled_reason = Some(cancelled_reason.clone());
        }
        if let Some(requeue_after) = patch.requeue_after {
            run.requeue_after = Some(requeue_after);
        }

        let updated = run.clone();

        // A resolved key is stamped onto the owning workflow run so admission
        // listings see it.
        if patch.output.is_some() {
            if let Some(workflow_run) = state.workflow_runs.get_mut(&updated.workflow_run_id) {
                workflow_run.group_key = patch.output.clone();
            }
        }

        Ok(updated)
    }

    async fn assign_group_key_run_to_worker(
        &self,
        tenant_id: Uuid,
        id: GroupKeyRunId,
    ) -> StoreResult<WorkerAssignment> {
        let mut state = self.lock();
        let run = state
            .group_key_runs
            .get(&id)
            .filter(|run| run.tenant_id == tenant_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("group key run {id}")))?;

        let action = group_key_action_id(run.workflow_version_id);
        let mut candidates: Vec<&Worker> = state
            .workers
            .values()
            .filter(|worker| {
                worker.tenant_id == tenant_id
                    && worker.is_active
                    && worker.actions.iter().any(|a| a == &action)
            })
            .collect();
        candidates.sort_by_key(|worker| worker.id);

        let Some(worker) = candidates.first() else {
            return Err(StoreError::NoWorkerAvailable);
        };
        let assignment = WorkerAssignment {
            worker_id: worker.id,
            dispatcher_id: worker.dispatcher_id,
        };

        let run = state
            .group_key_runs
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("group key run {id}")))?;
        run.worker_id = Some(assignment.worker_id);
        run.dispatcher_id = Some(assignment.dispatcher_id);
        run.status = StepRunStatus::Assigned;

        Ok(assignment)
    }

    async fn assign_group_key_run_to_ticker(
        &self,
        tenant_id: Uuid,
        id: GroupKeyRunId,
    ) -> StoreResult<Uuid> {
        let mut state = self.lock();

        let mut tickers: Vec<Uuid> = state
            .tickers
            .values()
            .filter(|ticker| ticker.is_active)
            .map(|ticker| ticker.id)
            .collect();
        tickers.sort();
        let ticker_id = tickers
            .first()
            .copied()
            .ok_or_else(|| StoreError::NotFound("no active ticker".to_string()))?;

        let run = state
            .group_key_runs
            .get_mut(&id)
            .filter(|run| run.tenant_id == tenant_id)
            .ok_or_else(|| StoreError::NotFound(format!("group key run {id}")))?;
        run.ticker_id = Some(ticker_id);

        Ok(ticker_id)
    }

    async fn list_group_key_runs_to_requeue(
        &self,
        tenant_id: Uuid,
    ) -> StoreResult<Vec<GroupKeyRun>> {
        let now = Utc::now();
        let state = self.lock();
        Ok(state
            .group_key_runs
            .values()
            .filter(|run| run.tenant_id == tenant_id)
            .filter(|run| {
                matches!(
                    run.status,
                    StepRunStatus::Pending | StepRunStatus::PendingAssignment
                )
            })
            .filter(|run| match run.requeue_after {
                Some(due) => due <= now,
                None => run.worker_id.is_none(),
            })
            .cloned()
            .collect())
    }

    async fn list_group_key_runs_to_reassign(
        &self,
        tenant_id: Uuid,
    ) -> StoreResult<Vec<GroupKeyRun>> {
        let state = self.lock();
        Ok(state
            .group_key_runs
            .values()
            .filter(|run| run.tenant_id == tenant_id)
            .filter(|run| {
                matches!(
                    run.status,
                    StepRunStatus::Assigned | StepRunStatus::Running
                )
            })
            .filter(|run| match run.worker_id {
                Some(worker_id) => state
                    .workers
                    .get(&worker_id)
                    .is_none_or(|worker| !worker.is_active),
                None => false,
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl StepRunStore for MemoryStore {
    async fn list_step_runs(
        &self,
        tenant_id: Uuid,
        filter: &StepRunFilter,
    ) -> StoreResult<Vec<StepRun>> {
        let state = self.lock();
        let mut step_runs: Vec<StepRun> = state
            .step_runs
            .values()
            .filter(|step| step.tenant_id == tenant_id)
            .filter(|step| {
                filter
                    .workflow_run_id
                    .is_none_or(|id| step.workflow_run_id == id)
            })
            .filter(|step| filter.status.is_none_or(|s| step.status == s))
            .cloned()
            .collect();
        step_runs.sort_by_key(|step| step.id);
        Ok(step_runs)
    }
}

#[async_trait]
impl TenantStore for MemoryStore {
    async fn list_tenants(&self) -> StoreResult<Vec<Tenant>> {
        Ok(self.lock().tenants.clone())
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn get_workflow_version(
        &self,
        tenant_id: Uuid,
        id: WorkflowVersionId,
    ) -> StoreResult<WorkflowVersion> {
        let state = self.lock();
        state
            .workflow_versions
            .get(&id)
            .filter(|version| version.tenant_id == tenant_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("workflow version {id}")))
    }
}

// Seed value constructors shared by unit and integration tests.
impl MemoryStore {
    /// A queued workflow run with `job_count` job runs attached.
    pub fn seed_workflow_run(
        tenant_id: Uuid,
        workflow_version_id: WorkflowVersionId,
        created_at: chrono::DateTime<Utc>,
        group_key: Option<&str>,
        job_count: usize,
    ) -> WorkflowRun {
        let id = WorkflowRunId::new();
        WorkflowRun {
            id,
            tenant_id,
            workflow_version_id,
            status: WorkflowRunStatus::Queued,
            created_at,
            group_key: group_key.map(str::to_string),
            group_key_run_id: None,
            job_runs: (0..job_count)
                .map(|_| JobRun {
                    id: Uuid::new_v4(),
                    job_id: Uuid::new_v4(),
                    tenant_id,
                })
                .collect(),
        }
    }

    /// A fresh group-key run in PENDING for the given workflow run.
    pub fn seed_group_key_run(run: &WorkflowRun) -> GroupKeyRun {
        GroupKeyRun {
            id: GroupKeyRunId::new(),
            tenant_id: run.tenant_id,
            workflow_run_id: run.id,
            workflow_version_id: run.workflow_version_id,
            status: StepRunStatus::Pending,
            worker_id: None,
            dispatcher_id: None,
            ticker_id: None,
            started_at: None,
            finished_at: None,
            output: None,
            error: None,
            requeue_after: None,
            schedule_timeout_at: None,
            cancelled_at: None,
            cancelled_reason: None,
            created_at: run.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use proptest::prelude::*;

    use super::*;
    use crate::store::{ConcurrencyPolicy, LimitStrategy};

    fn seed_version(store: &MemoryStore, tenant_id: Uuid) -> WorkflowVersionId {
        let id = WorkflowVersionId::new();
        store.insert_workflow_version(WorkflowVersion {
            id,
            tenant_id,
            concurrency: Some(ConcurrencyPolicy {
                workflow_version_id: id,
                max_runs: 2,
                limit_strategy: LimitStrategy::GroupRoundRobin,
            }),
        });
        id
    }

    #[tokio::test]
    async fn round_robin_pop_interleaves_keys() {
        let store = MemoryStore::new();
        let tenant_id = Uuid::new_v4();
        let version_id = seed_version(&store, tenant_id);

        let base = Utc::now();
        let mut ids_by_key: HashMap<&str, Vec<WorkflowRunId>> = HashMap::new();
        for (offset, key) in [(0, "a"), (1, "a"), (2, "a"), (3, "b"), (4, "b"), (5, "b")] {
            let run = MemoryStore::seed_workflow_run(
                tenant_id,
                version_id,
                base + Duration::seconds(offset),
                Some(key),
                1,
            );
            ids_by_key.entry(key).or_default().push(run.id);
            store.insert_workflow_run(run);
        }

        let popped = store
            .pop_workflow_runs_round_robin(tenant_id, version_id, 2)
            .await
            .expect("pop");

        assert_eq!(popped, vec![ids_by_key["a"][0], ids_by_key["b"][0]]);
        for id in &popped {
            assert_eq!(
                store.workflow_run(*id).expect("run").status,
                WorkflowRunStatus::Running
            );
        }
    }

    #[tokio::test]
    async fn terminal_update_is_noop() {
        let store = MemoryStore::new();
        let tenant_id = Uuid::new_v4();
        let version_id = seed_version(&store, tenant_id);
        let run = MemoryStore::seed_workflow_run(tenant_id, version_id, Utc::now(), None, 0);
        let mut gkr = MemoryStore::seed_group_key_run(&run);
        gkr.status = StepRunStatus::Succeeded;
        gkr.output = Some("key-a".to_string());
        let gkr_id = gkr.id;
        store.insert_group_key_run(gkr);

        let updated = store
            .update_group_key_run(
                tenant_id,
                gkr_id,
                &GroupKeyRunPatch {
                    status: Some(StepRunStatus::Cancelled),
                    cancelled_reason: Some("SCHEDULING_TIMED_OUT".to_string()),
                    ..Default::default()
                },
            )
            .await
            .expect("update");

        assert_eq!(updated.status, StepRunStatus::Succeeded);
        assert_eq!(updated.output.as_deref(), Some("key-a"));
        assert!(updated.cancelled_reason.is_none());
    }

    #[tokio::test]
    async fn assignment_picks_capable_active_worker() {
        let store = MemoryStore::new();
        let tenant_id = Uuid::new_v4();
        let version_id = seed_version(&store, tenant_id);
        let run = MemoryStore::seed_workflow_run(tenant_id, version_id, Utc::now(), None, 0);
        let gkr = MemoryStore::seed_group_key_run(&run);
        let gkr_id = gkr.id;
        store.insert_workflow_run(run);
        store.insert_group_key_run(gkr);

        // Inactive-but-capable and active-but-incapable workers never match.
        store.insert_worker(Worker {
            id: Uuid::new_v4(),
            tenant_id,
            dispatcher_id: Uuid::new_v4(),
            is_active: false,
            actions: vec![group_key_action_id(version_id)],
        });
        store.insert_worker(Worker {
            id: Uuid::new_v4(),
            tenant_id,
            dispatcher_id: Uuid::new_v4(),
            is_active: true,
            actions: vec!["unrelated-action".to_string()],
        });
        assert!(matches!(
            store
                .assign_group_key_run_to_worker(tenant_id, gkr_id)
                .await,
            Err(StoreError::NoWorkerAvailable)
        ));

        let worker_id = Uuid::new_v4();
        store.insert_worker(Worker {
            id: worker_id,
            tenant_id,
            dispatcher_id: Uuid::new_v4(),
            is_active: true,
            actions: vec![group_key_action_id(version_id)],
        });

        let assignment = store
            .assign_group_key_run_to_worker(tenant_id, gkr_id)
            .await
            .expect("assignment");
        assert_eq!(assignment.worker_id, worker_id);

        let updated = store.group_key_run(gkr_id).expect("gkr");
        assert_eq!(updated.status, StepRunStatus::Assigned);
        assert_eq!(updated.worker_id, Some(worker_id));
    }

    proptest! {
        // With K keys each holding at least max_runs queued runs, repeated
        // pops of max_runs release exactly max_runs per key over the first
        // K batches.
        #[test]
        fn round_robin_is_fair(key_count in 1usize..5, max_runs in 1i32..4) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .build()
                .expect("runtime");
            rt.block_on(async move {
                let store = MemoryStore::new();
                let tenant_id = Uuid::new_v4();
                let version_id = seed_version(&store, tenant_id);

                let base = Utc::now();
                let keys: Vec<String> = (0..key_count).map(|k| format!("key-{k}")).collect();
                for (i, key) in keys.iter().enumerate() {
                    for j in 0..max_runs {
                        let run = MemoryStore::seed_workflow_run(
                            tenant_id,
                            version_id,
                            base + Duration::seconds((i as i64) * 10 + j as i64),
                            Some(key.as_str()),
                            0,
                        );
                        store.insert_workflow_run(run);
                    }
                }

                let mut per_key: HashMap<String, usize> = HashMap::new();
                for _ in 0..key_count {
                    let popped = store
                        .pop_workflow_runs_round_robin(tenant_id, version_id, max_runs)
                        .await
                        .expect("pop");
                    for id in popped {
                        let run = store.workflow_run(id).expect("run");
                        *per_key.entry(run.group_key.expect("key")).or_default() += 1;
                    }
                }

                for key in &keys {
                    prop_assert_eq!(per_key.get(key).copied().unwrap_or(0), max_runs as usize);
                }
                Ok(())
            })?;
        }
    }
}
