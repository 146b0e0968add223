//! Durable records shared between schedulers and workers.

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Identifier of a running workflow execution, owned by the external engine.
pub type InstanceId = i64;
/// Ledger-assigned identifier of an [`ActionRecord`].
pub type ActionId = i64;
/// Ledger-assigned identifier of an [`ActionResultRecord`].
pub type ActionResultId = i64;

/// Queue lifecycle of an action, driven by external workers.
///
/// The scheduler creates records as `Queued` and reacts to `Done`; the
/// intermediate transitions belong to the worker fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Queued,
    Scheduled,
    InProgress,
    Done,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Queued => "queued",
            ActionStatus::Scheduled => "scheduled",
            ActionStatus::InProgress => "in_progress",
            ActionStatus::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(ActionStatus::Queued),
            "scheduled" => Some(ActionStatus::Scheduled),
            "in_progress" => Some(ActionStatus::InProgress),
            "done" => Some(ActionStatus::Done),
            _ => None,
        }
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of one queued unit of work.
///
/// At most one record exists per `(instance_id, state)` pair; the ledger
/// enforces this with a uniqueness constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub id: ActionId,
    pub workflow_name: String,
    pub instance_id: InstanceId,
    /// Opaque token naming where in the workflow this action belongs.
    pub state: String,
    pub registry_id: String,
    pub input_body: Option<String>,
    pub status: ActionStatus,
    /// Set exactly once when a worker finalizes the action; immutable after.
    pub final_result_id: Option<ActionResultId>,
    pub retry_backoff_seconds: i64,
    pub retry_backoff_factor: f64,
    pub retry_jitter: f64,
    pub retry_max_attempts: Option<i64>,
    pub retry_current_attempt: i64,
}

impl ActionRecord {
    /// Whether the worker may make another attempt under the stored policy.
    pub fn retry_allowed(&self) -> bool {
        match self.retry_max_attempts {
            None => true,
            Some(max) => self.retry_current_attempt < max,
        }
    }
}

/// Insert payload for a new action; the ledger assigns the id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewActionRecord {
    pub workflow_name: String,
    pub instance_id: InstanceId,
    pub state: String,
    pub registry_id: String,
    pub input_body: Option<String>,
    pub status: ActionStatus,
    pub retry_backoff_seconds: i64,
    pub retry_backoff_factor: f64,
    pub retry_jitter: f64,
    pub retry_max_attempts: Option<i64>,
}

impl NewActionRecord {
    /// A freshly queued action carrying the given retry policy.
    pub fn queued(
        workflow_name: impl Into<String>,
        instance_id: InstanceId,
        state: impl Into<String>,
        registry_id: impl Into<String>,
        input_body: Option<String>,
        retry: &RetryPolicy,
    ) -> Self {
        Self {
            workflow_name: workflow_name.into(),
            instance_id,
            state: state.into(),
            registry_id: registry_id.into(),
            input_body,
            status: ActionStatus::Queued,
            retry_backoff_seconds: i64::from(retry.backoff_seconds()),
            retry_backoff_factor: retry.backoff_factor(),
            retry_jitter: retry.jitter(),
            retry_max_attempts: retry.max_attempts().map(i64::from),
        }
    }
}

/// Durable record of an action's outcome: a success body or an exception.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResultRecord {
    pub id: ActionResultId,
    pub action_id: ActionId,
    pub result_body: Option<String>,
    pub exception: Option<String>,
    pub exception_stack: Option<String>,
}

/// Insert payload for an action result, written by a worker on completion.
#[derive(Debug, Clone, PartialEq)]
pub struct NewActionResult {
    pub result_body: Option<String>,
    pub exception: Option<String>,
    pub exception_stack: Option<String>,
}

impl NewActionResult {
    pub fn success(result_body: impl Into<String>) -> Self {
        Self {
            result_body: Some(result_body.into()),
            exception: None,
            exception_stack: None,
        }
    }

    /// A success carrying no body (actions whose type has no output).
    pub fn empty_success() -> Self {
        Self {
            result_body: None,
            exception: None,
            exception_stack: None,
        }
    }

    pub fn failure(exception: impl Into<String>, exception_stack: Option<String>) -> Self {
        Self {
            result_body: None,
            exception: Some(exception.into()),
            exception_stack,
        }
    }
}
