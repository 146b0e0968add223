use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, broadcast};
use tracing::warn;

use super::{Ledger, LedgerError, NotificationFeed};
use crate::models::{
    ActionId, ActionRecord, ActionResultId, ActionResultRecord, ActionStatus, InstanceId, NewActionRecord,
    NewActionResult,
};

const CHANNEL_CAP: usize = 1024;

#[derive(Default)]
struct Inner {
    actions: HashMap<ActionId, ActionRecord>,
    results: HashMap<ActionResultId, ActionResultRecord>,
    by_key: HashMap<(InstanceId, String), ActionId>,
    next_action_id: ActionId,
    next_result_id: ActionResultId,
}

impl Inner {
    fn ids_with_status(&self, status: ActionStatus) -> VecDeque<ActionId> {
        let mut ids: Vec<ActionId> = self
            .actions
            .values()
            .filter(|a| a.status == status)
            .map(|a| a.id)
            .collect();
        ids.sort_unstable();
        ids.into()
    }
}

/// In-memory ledger backed by mutex-guarded maps and a broadcast channel.
pub struct InMemoryLedger {
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<(ActionStatus, ActionId)>,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAP);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            events,
        }
    }
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn notify(&self, status: ActionStatus, id: ActionId) {
        // No receivers is fine; feeds replay from state on subscribe.
        let _ = self.events.send((status, id));
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn insert_action(&self, new: NewActionRecord) -> Result<ActionRecord, LedgerError> {
        let mut g = self.inner.lock().await;
        let key = (new.instance_id, new.state.clone());
        if g.by_key.contains_key(&key) {
            return Err(LedgerError::conflict(
                "insert_action",
                format!("action already exists for instance {} state {:?}", new.instance_id, new.state),
            ));
        }
        g.next_action_id += 1;
        let record = ActionRecord {
            id: g.next_action_id,
            workflow_name: new.workflow_name,
            instance_id: new.instance_id,
            state: new.state,
            registry_id: new.registry_id,
            input_body: new.input_body,
            status: new.status,
            final_result_id: None,
            retry_backoff_seconds: new.retry_backoff_seconds,
            retry_backoff_factor: new.retry_backoff_factor,
            retry_jitter: new.retry_jitter,
            retry_max_attempts: new.retry_max_attempts,
            retry_current_attempt: 0,
        };
        g.by_key.insert(key, record.id);
        g.actions.insert(record.id, record.clone());
        drop(g);
        self.notify(record.status, record.id);
        Ok(record)
    }

    async fn action(&self, id: ActionId) -> Result<Option<ActionRecord>, LedgerError> {
        Ok(self.inner.lock().await.actions.get(&id).cloned())
    }

    async fn result(&self, id: ActionResultId) -> Result<Option<ActionResultRecord>, LedgerError> {
        Ok(self.inner.lock().await.results.get(&id).cloned())
    }

    async fn find_by_instance_and_state(
        &self,
        instance_id: InstanceId,
        state: &str,
    ) -> Result<Option<ActionRecord>, LedgerError> {
        let g = self.inner.lock().await;
        Ok(g.by_key
            .get(&(instance_id, state.to_string()))
            .and_then(|id| g.actions.get(id))
            .cloned())
    }

    async fn find_result_for_action(&self, action_id: ActionId) -> Result<Option<ActionResultRecord>, LedgerError> {
        let g = self.inner.lock().await;
        let mut matches: Vec<&ActionResultRecord> =
            g.results.values().filter(|r| r.action_id == action_id).collect();
        matches.sort_by_key(|r| r.id);
        Ok(matches.first().map(|r| (*r).clone()))
    }

    async fn actions_for_instance(&self, instance_id: InstanceId) -> Result<Vec<ActionRecord>, LedgerError> {
        let g = self.inner.lock().await;
        let mut records: Vec<ActionRecord> = g
            .actions
            .values()
            .filter(|a| a.instance_id == instance_id)
            .cloned()
            .collect();
        records.sort_by_key(|a| a.id);
        Ok(records)
    }

    async fn set_status(&self, id: ActionId, status: ActionStatus) -> Result<(), LedgerError> {
        let mut g = self.inner.lock().await;
        let record = g
            .actions
            .get_mut(&id)
            .ok_or_else(|| LedgerError::permanent("set_status", format!("unknown action: {id}")))?;
        record.status = status;
        drop(g);
        self.notify(status, id);
        Ok(())
    }

    async fn complete_action(&self, id: ActionId, result: NewActionResult) -> Result<ActionResultRecord, LedgerError> {
        let mut g = self.inner.lock().await;
        let record = g
            .actions
            .get(&id)
            .ok_or_else(|| LedgerError::permanent("complete_action", format!("unknown action: {id}")))?;
        if let Some(existing) = record.final_result_id {
            return Err(LedgerError::permanent(
                "complete_action",
                format!("action {id} already finalized with result {existing}"),
            ));
        }
        g.next_result_id += 1;
        let stored = ActionResultRecord {
            id: g.next_result_id,
            action_id: id,
            result_body: result.result_body,
            exception: result.exception,
            exception_stack: result.exception_stack,
        };
        g.results.insert(stored.id, stored.clone());
        if let Some(record) = g.actions.get_mut(&id) {
            record.final_result_id = Some(stored.id);
            record.status = ActionStatus::Done;
        }
        drop(g);
        self.notify(ActionStatus::Done, id);
        Ok(stored)
    }

    async fn subscribe(&self, status: ActionStatus) -> Box<dyn NotificationFeed> {
        // Subscribe before the snapshot so a transition between the two is
        // delivered twice rather than not at all.
        let rx = self.events.subscribe();
        let backlog = self.inner.lock().await.ids_with_status(status);
        Box::new(InMemoryFeed {
            target: status,
            rx,
            backlog,
            inner: Arc::clone(&self.inner),
        })
    }
}

struct InMemoryFeed {
    target: ActionStatus,
    rx: broadcast::Receiver<(ActionStatus, ActionId)>,
    backlog: VecDeque<ActionId>,
    inner: Arc<Mutex<Inner>>,
}

#[async_trait]
impl NotificationFeed for InMemoryFeed {
    async fn next(&mut self) -> ActionId {
        loop {
            if let Some(id) = self.backlog.pop_front() {
                return id;
            }
            match self.rx.recv().await {
                Ok((status, id)) if status == self.target => return id,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Dropped notifications; rescan state so nothing is lost.
                    warn!(skipped, "notification feed lagged; rescanning ledger state");
                    self.backlog = self.inner.lock().await.ids_with_status(self.target);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    // Ledger dropped; no further transitions can happen.
                    std::future::pending::<()>().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;

    fn queued(instance_id: InstanceId, state: &str) -> NewActionRecord {
        NewActionRecord::queued("wf", instance_id, state, "reg.id", None, &RetryPolicy::default())
    }

    #[tokio::test]
    async fn insert_assigns_ids_and_enforces_uniqueness() {
        let ledger = InMemoryLedger::new();
        let first = ledger.insert_action(queued(1, "step_a")).await.unwrap();
        assert!(first.id > 0);

        let err = ledger.insert_action(queued(1, "step_a")).await.unwrap_err();
        assert!(err.is_conflict());

        // Different state is a different key.
        let second = ledger.insert_action(queued(1, "step_b")).await.unwrap();
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn complete_action_finalizes_once() {
        let ledger = InMemoryLedger::new();
        let action = ledger.insert_action(queued(1, "step_a")).await.unwrap();

        let stored = ledger
            .complete_action(action.id, NewActionResult::success(r#"{"ok":true}"#))
            .await
            .unwrap();
        let reread = ledger.action(action.id).await.unwrap().unwrap();
        assert_eq!(reread.status, ActionStatus::Done);
        assert_eq!(reread.final_result_id, Some(stored.id));

        let err = ledger
            .complete_action(action.id, NewActionResult::success("{}"))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn subscribe_replays_and_streams() {
        let ledger = InMemoryLedger::new();
        let done_before = ledger.insert_action(queued(1, "step_a")).await.unwrap();
        ledger
            .complete_action(done_before.id, NewActionResult::empty_success())
            .await
            .unwrap();

        let mut feed = ledger.subscribe(ActionStatus::Done).await;
        assert_eq!(feed.next().await, done_before.id);

        let done_after = ledger.insert_action(queued(1, "step_b")).await.unwrap();
        ledger
            .complete_action(done_after.id, NewActionResult::empty_success())
            .await
            .unwrap();
        assert_eq!(feed.next().await, done_after.id);
    }
}
