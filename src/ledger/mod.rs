//! Durable storage abstraction for action records and their results.
//!
//! The ledger is the only shared mutable resource between scheduler
//! processes and worker fleets; all cross-process coordination flows through
//! it. Implementations must make reads snapshot-consistent (no partial
//! writes visible) and deliver status notifications at-least-once.

use async_trait::async_trait;

use crate::models::{
    ActionId, ActionRecord, ActionResultId, ActionResultRecord, ActionStatus, InstanceId, NewActionRecord,
    NewActionResult,
};

mod error;
/// In-memory ledger for tests and single-process setups.
pub mod in_memory;
/// SQLite-backed ledger for durable multi-process deployments.
pub mod sqlite;

pub use error::LedgerError;

/// Infinite feed of ids for records that transitioned into a target status.
///
/// Delivery is at-least-once: duplicates across processes and across
/// subscribe calls are expected, and consumers must treat redelivery of an
/// already-handled id as a no-op. The feed never ends; transient storage
/// errors are absorbed internally with logged backoff.
#[async_trait]
pub trait NotificationFeed: Send {
    async fn next(&mut self) -> ActionId;
}

/// Durable CRUD plus status notifications for action records.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Insert a new action record, assigning its id.
    ///
    /// A second insert for an `(instance_id, state)` pair already present
    /// fails with a conflict-classified [`LedgerError`].
    async fn insert_action(&self, new: NewActionRecord) -> Result<ActionRecord, LedgerError>;

    /// Snapshot-consistent read of one action record.
    async fn action(&self, id: ActionId) -> Result<Option<ActionRecord>, LedgerError>;

    /// Snapshot-consistent read of one result record.
    async fn result(&self, id: ActionResultId) -> Result<Option<ActionResultRecord>, LedgerError>;

    /// First action record for the given dedup key, if any.
    async fn find_by_instance_and_state(
        &self,
        instance_id: InstanceId,
        state: &str,
    ) -> Result<Option<ActionRecord>, LedgerError>;

    /// First result recorded for the given action, if any.
    async fn find_result_for_action(&self, action_id: ActionId) -> Result<Option<ActionResultRecord>, LedgerError>;

    /// All action records belonging to a workflow instance.
    async fn actions_for_instance(&self, instance_id: InstanceId) -> Result<Vec<ActionRecord>, LedgerError>;

    /// Worker lifecycle transition. Fails for unknown ids.
    async fn set_status(&self, id: ActionId, status: ActionStatus) -> Result<(), LedgerError>;

    /// Finalize an action: store its result, point `final_result_id` at it,
    /// and mark the record `Done`, atomically.
    ///
    /// Fails permanently if the action is unknown or already finalized.
    async fn complete_action(&self, id: ActionId, result: NewActionResult) -> Result<ActionResultRecord, LedgerError>;

    /// Subscribe to records transitioning into `status`.
    ///
    /// Each call returns a fresh, restartable feed; records already in the
    /// target status at subscribe time are replayed so late subscribers
    /// cannot miss completed work.
    async fn subscribe(&self, status: ActionStatus) -> Box<dyn NotificationFeed>;
}

/// Retry a ledger operation with exponential backoff while it reports
/// transient errors. Permanent errors and exhausted attempts propagate.
pub(crate) async fn with_retry<T, F, Fut>(operation_tag: &str, operation: F) -> Result<T, LedgerError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, LedgerError>>,
{
    let mut attempts: u32 = 0;
    let max_attempts: u32 = 5;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempts < max_attempts => {
                let backoff_ms = 10u64.saturating_mul(1 << attempts);
                tracing::warn!(attempts, backoff_ms, error = %e, "{operation_tag} failed; retrying");
                tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                attempts += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
