#![allow(clippy::unwrap_used)]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use duract::ledger::LedgerError;
use duract::{
    ActionCall, ActionId, ActionRecord, ActionResultId, ActionResultRecord, ActionStatus, InstanceId, Ledger,
    NewActionRecord, NewActionResult, NotificationFeed, RetryPolicy, TaskManager,
};

use common::{TALLY_ID, Tally, in_memory_ledger, tally_registry};

fn tally_call() -> ActionCall {
    ActionCall::new(TALLY_ID)
}

/// Repeated sequential calls for one (instance, state) pair attach to the
/// same action record; no duplicate rows appear.
#[tokio::test]
async fn sequential_queue_work_is_deduplicated() {
    let ledger = in_memory_ledger();
    let manager = TaskManager::new(Arc::clone(&ledger), tally_registry());

    let h1 = manager
        .queue_work(tally_call(), "step_a", 1, "demo", &RetryPolicy::default())
        .await
        .unwrap();
    let h2 = manager
        .queue_work(tally_call(), "step_a", 1, "demo", &RetryPolicy::default())
        .await
        .unwrap();

    assert_eq!(h1.action_id(), h2.action_id());
    assert_eq!(ledger.actions_for_instance(1).await.unwrap().len(), 1);

    // Different state or instance queues separately.
    let h3 = manager
        .queue_work(tally_call(), "step_b", 1, "demo", &RetryPolicy::default())
        .await
        .unwrap();
    let h4 = manager
        .queue_work(tally_call(), "step_a", 2, "demo", &RetryPolicy::default())
        .await
        .unwrap();
    assert_ne!(h3.action_id(), h1.action_id());
    assert_ne!(h4.action_id(), h1.action_id());
}

/// A stored result at queue time yields an already-resolved handle with no
/// suspension and no local registration.
#[tokio::test]
async fn existing_result_resolves_immediately() {
    let ledger = in_memory_ledger();
    let manager = TaskManager::new(Arc::clone(&ledger), tally_registry());

    let first = manager
        .queue_work(tally_call(), "step_a", 1, "demo", &RetryPolicy::default())
        .await
        .unwrap();
    ledger
        .complete_action(first.action_id(), NewActionResult::success(r#"{"value":42}"#))
        .await
        .unwrap();

    // Fresh manager: nothing registered locally, as after a process restart.
    let restarted = TaskManager::new(Arc::clone(&ledger), tally_registry());
    let handle = restarted
        .queue_work(tally_call(), "step_a", 1, "demo", &RetryPolicy::default())
        .await
        .unwrap();

    assert!(handle.is_pre_resolved());
    assert_eq!(restarted.pending_waits().await, 0);
    let tally: Tally = handle.wait().await.unwrap().unwrap().into_typed().unwrap();
    assert_eq!(tally, Tally { value: 42 });
}

/// A second registration for the same action supersedes the first handle;
/// the superseded waiter observes abandonment instead of hanging.
#[tokio::test]
async fn requeue_supersedes_previous_handle() {
    let ledger = in_memory_ledger();
    let manager = TaskManager::new(Arc::clone(&ledger), tally_registry());

    let h1 = manager
        .queue_work(tally_call(), "step_a", 1, "demo", &RetryPolicy::default())
        .await
        .unwrap();
    let h2 = manager
        .queue_work(tally_call(), "step_a", 1, "demo", &RetryPolicy::default())
        .await
        .unwrap();
    assert_eq!(h1.action_id(), h2.action_id());
    assert_eq!(manager.pending_waits().await, 1);

    assert_eq!(h1.wait().await, Err(duract::ActionFailure::Abandoned));
}

/// Ledger wrapper that reports a missing record for the first N dedup
/// lookups, simulating another scheduler inserting between the lookup and
/// the insert.
struct RacingLedger {
    inner: Arc<dyn Ledger>,
    blind_finds: AtomicUsize,
}

#[async_trait]
impl Ledger for RacingLedger {
    async fn insert_action(&self, new: NewActionRecord) -> Result<ActionRecord, LedgerError> {
        self.inner.insert_action(new).await
    }

    async fn action(&self, id: ActionId) -> Result<Option<ActionRecord>, LedgerError> {
        self.inner.action(id).await
    }

    async fn result(&self, id: ActionResultId) -> Result<Option<ActionResultRecord>, LedgerError> {
        self.inner.result(id).await
    }

    async fn find_by_instance_and_state(
        &self,
        instance_id: InstanceId,
        state: &str,
    ) -> Result<Option<ActionRecord>, LedgerError> {
        if self
            .blind_finds
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Ok(None);
        }
        self.inner.find_by_instance_and_state(instance_id, state).await
    }

    async fn find_result_for_action(&self, action_id: ActionId) -> Result<Option<ActionResultRecord>, LedgerError> {
        self.inner.find_result_for_action(action_id).await
    }

    async fn actions_for_instance(&self, instance_id: InstanceId) -> Result<Vec<ActionRecord>, LedgerError> {
        self.inner.actions_for_instance(instance_id).await
    }

    async fn set_status(&self, id: ActionId, status: ActionStatus) -> Result<(), LedgerError> {
        self.inner.set_status(id, status).await
    }

    async fn complete_action(&self, id: ActionId, result: NewActionResult) -> Result<ActionResultRecord, LedgerError> {
        self.inner.complete_action(id, result).await
    }

    async fn subscribe(&self, status: ActionStatus) -> Box<dyn NotificationFeed> {
        self.inner.subscribe(status).await
    }
}

/// Losing the insert race adopts the winner's record instead of failing or
/// duplicating.
#[tokio::test]
async fn insert_conflict_adopts_winning_record() {
    let inner = in_memory_ledger();

    // The "other scheduler" already inserted for this key.
    let winner = inner
        .insert_action(NewActionRecord::queued(
            "demo",
            1,
            "step_a",
            TALLY_ID,
            None,
            &RetryPolicy::default(),
        ))
        .await
        .unwrap();

    let racing = Arc::new(RacingLedger {
        inner: Arc::clone(&inner),
        blind_finds: AtomicUsize::new(1),
    });
    let manager = TaskManager::new(racing as Arc<dyn Ledger>, tally_registry());

    let handle = manager
        .queue_work(tally_call(), "step_a", 1, "demo", &RetryPolicy::default())
        .await
        .unwrap();

    assert_eq!(handle.action_id(), winner.id);
    assert_eq!(inner.actions_for_instance(1).await.unwrap().len(), 1);
}

/// The inserted record carries the retry policy fields for workers to read.
#[tokio::test]
async fn queued_record_carries_retry_policy() {
    let ledger = in_memory_ledger();
    let manager = TaskManager::new(Arc::clone(&ledger), tally_registry());

    let retry = RetryPolicy::new(5, 3.0, 0.2).unwrap().with_max_attempts(4);
    let handle = manager
        .queue_work(
            tally_call().with_input(&serde_json::json!({"month": 7})).unwrap(),
            "step_a",
            9,
            "billing",
            &retry,
        )
        .await
        .unwrap();

    let record = ledger.action(handle.action_id()).await.unwrap().unwrap();
    assert_eq!(record.workflow_name, "billing");
    assert_eq!(record.instance_id, 9);
    assert_eq!(record.state, "step_a");
    assert_eq!(record.registry_id, TALLY_ID);
    assert_eq!(record.input_body.as_deref(), Some(r#"{"month":7}"#));
    assert_eq!(record.status, ActionStatus::Queued);
    assert_eq!(record.retry_backoff_seconds, 5);
    assert_eq!(record.retry_backoff_factor, 3.0);
    assert_eq!(record.retry_jitter, 0.2);
    assert_eq!(record.retry_max_attempts, Some(4));
    assert_eq!(record.retry_current_attempt, 0);
}
