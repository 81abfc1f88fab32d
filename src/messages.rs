//! Message contracts for the workflow processing queue.
//!
//! Every message is an envelope of `{id, payload, metadata, retries}` where
//! payload and metadata are opaque JSON maps. Consumed messages decode into
//! the closed [`WorkflowTask`] enum; an unrecognized id is a dedicated
//! [`DecodeError::UnknownTask`] variant rather than a default match arm, so
//! handler dispatch stays exhaustive at compile time.
//!
//! Timestamps on the wire are RFC 3339 UTC strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use uuid::Uuid;

use crate::store::{GroupKeyRun, GroupKeyRunId, JobRun, WorkflowRunId};

/// Default redelivery budget for produced messages.
pub const DEFAULT_TASK_RETRIES: u32 = 3;

// ============================================================================
// Envelope
// ============================================================================

/// A message as carried by the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub payload: Value,
    pub metadata: Value,
    pub retries: u32,
}

impl Message {
    pub fn new(id: impl Into<String>, payload: Value, metadata: Value) -> Self {
        Self {
            id: id.into(),
            payload,
            metadata,
            retries: DEFAULT_TASK_RETRIES,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// A message that cannot be decoded is malformed and is never retried.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("could not decode {task} payload: {source}")]
    Payload {
        task: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("could not decode task metadata: {0}")]
    Metadata(#[source] serde_json::Error),

    #[error("could not parse {field}: {source}")]
    Timestamp {
        field: &'static str,
        #[source]
        source: chrono::ParseError,
    },
}

/// Parse an RFC 3339 wire timestamp into a UTC instant.
pub fn parse_rfc3339(field: &'static str, value: &str) -> Result<DateTime<Utc>, DecodeError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|source| DecodeError::Timestamp { field, source })
}

// ============================================================================
// Consumed tasks
// ============================================================================

/// Metadata common to every task. `tenant_id` is mandatory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub tenant_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRunQueuedPayload {
    pub workflow_run_id: WorkflowRunId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupKeyRunStartedPayload {
    pub get_group_key_run_id: GroupKeyRunId,
    pub started_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupKeyRunFinishedPayload {
    pub get_group_key_run_id: GroupKeyRunId,
    pub finished_at: String,
    pub group_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupKeyRunFailedPayload {
    pub get_group_key_run_id: GroupKeyRunId,
    pub failed_at: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRunFinishedPayload {
    pub workflow_run_id: WorkflowRunId,
}

/// The closed set of tasks consumed on the workflow processing queue.
#[derive(Debug, Clone)]
pub enum WorkflowTask {
    WorkflowRunQueued(WorkflowRunQueuedPayload),
    GroupKeyRunStarted(GroupKeyRunStartedPayload),
    GroupKeyRunFinished(GroupKeyRunFinishedPayload),
    GroupKeyRunFailed(GroupKeyRunFailedPayload),
    WorkflowRunFinished(WorkflowRunFinishedPayload),
}

impl WorkflowTask {
    /// Decode a bus message into its typed task and metadata.
    pub fn decode(message: &Message) -> Result<(TaskMetadata, Self), DecodeError> {
        let metadata: TaskMetadata =
            serde_json::from_value(message.metadata.clone()).map_err(DecodeError::Metadata)?;

        let task = match message.id.as_str() {
            "workflow-run-queued" => {
                Self::WorkflowRunQueued(decode_payload("workflow-run-queued", &message.payload)?)
            }
            "get-group-key-run-started" => Self::GroupKeyRunStarted(decode_payload(
                "get-group-key-run-started",
                &message.payload,
            )?),
            "get-group-key-run-finished" => Self::GroupKeyRunFinished(decode_payload(
                "get-group-key-run-finished",
                &message.payload,
            )?),
            "get-group-key-run-failed" => Self::GroupKeyRunFailed(decode_payload(
                "get-group-key-run-failed",
                &message.payload,
            )?),
            "workflow-run-finished" => Self::WorkflowRunFinished(decode_payload(
                "workflow-run-finished",
                &message.payload,
            )?),
            other => return Err(DecodeError::UnknownTask(other.to_string())),
        };

        Ok((metadata, task))
    }
}

fn decode_payload<T: serde::de::DeserializeOwned>(
    task: &'static str,
    payload: &Value,
) -> Result<T, DecodeError> {
    serde_json::from_value(payload.clone()).map_err(|source| DecodeError::Payload { task, source })
}

// ============================================================================
// Produced messages
// ============================================================================

/// Release message for a single job run.
pub fn job_run_queued_message(tenant_id: Uuid, job_run: &JobRun) -> Message {
    Message::new(
        "job-run-queued",
        json!({ "job_run_id": job_run.id }),
        json!({ "tenant_id": tenant_id, "job_id": job_run.job_id }),
    )
}

/// Dispatch message telling the selected worker to compute the group key.
pub fn group_key_action_assigned_message(
    tenant_id: Uuid,
    workflow_run_id: WorkflowRunId,
    worker_id: Uuid,
    dispatcher_id: Uuid,
) -> Message {
    Message::new(
        "group-key-action-assigned",
        json!({ "workflow_run_id": workflow_run_id, "worker_id": worker_id }),
        json!({ "tenant_id": tenant_id, "dispatcher_id": dispatcher_id }),
    )
}

/// Ticker message scheduling the group-key resolution timeout.
pub fn schedule_group_key_run_timeout_message(
    tenant_id: Uuid,
    workflow_run_id: WorkflowRunId,
    get_group_key_run_id: GroupKeyRunId,
    timeout_at: DateTime<Utc>,
) -> Message {
    Message::new(
        "schedule-get-group-key-run-timeout",
        json!({
            "get_group_key_run_id": get_group_key_run_id,
            "workflow_run_id": workflow_run_id,
            "timeout_at": timeout_at.to_rfc3339(),
        }),
        json!({ "tenant_id": tenant_id }),
    )
}

/// Ticker message cancelling a previously scheduled timeout.
pub fn cancel_group_key_run_timeout_message(group_key_run: &GroupKeyRun) -> Message {
    Message::new(
        "cancel-get-group-key-run-timeout",
        json!({ "get_group_key_run_id": group_key_run.id }),
        json!({ "tenant_id": group_key_run.tenant_id }),
    )
}

/// Pre-emption notice for a running step run.
pub fn step_run_cancelled_message(tenant_id: Uuid, step_run_id: Uuid, reason: &str) -> Message {
    Message::new(
        "step-run-cancelled",
        json!({ "step_run_id": step_run_id, "cancelled_reason": reason }),
        json!({ "tenant_id": tenant_id }),
    )
}

// ============================================================================
// Tests
// ============================================================================
