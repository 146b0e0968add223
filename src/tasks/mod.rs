//! Per-process scheduling of durable actions.
//!
//! A [`TaskManager`] submits actions into the shared ledger, deduplicating
//! re-entrant calls on the `(instance_id, state)` key, and parks each caller
//! on a [`WaitHandle`]. A background drain loop subscribed to `Done`
//! transitions resolves the handles this process still holds; notifications
//! for ids with no local registration are dropped without touching the
//! ledger, since only the process holding the handle can wake its caller.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::ActionCall;
use crate::codec::CodecError;
use crate::ledger::{Ledger, LedgerError, with_retry};
use crate::models::{ActionId, ActionResultRecord, ActionStatus, InstanceId, NewActionRecord};
use crate::registry::ActionRegistry;
use crate::retry::RetryPolicy;

mod wait;

pub use wait::{ActionFailure, WaitHandle};
use wait::TaskOutcome;

/// Errors raised by [`TaskManager`] bookkeeping.
///
/// Remote action failures are not errors here; they travel as data and
/// surface through [`WaitHandle::wait`].
#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// The ledger accepted a write but its effects are not readable.
    #[error("storage invariant violated: {0}")]
    StorageInvariant(String),

    /// A stored result body does not decode under the registered codec.
    #[error("failed to decode result for action {action_id} (registry id {registry_id:?}): {source}")]
    Decode {
        action_id: ActionId,
        registry_id: String,
        #[source]
        source: CodecError,
    },

    /// A codec is registered for the action type but the final result
    /// carries no body to decode.
    #[error("action {action_id} has an output codec registered for {registry_id:?} but its result carries no body")]
    MissingResultBody { action_id: ActionId, registry_id: String },
}

/// Per-process orchestrator for queueing and awaiting durable actions.
pub struct TaskManager {
    ledger: Arc<dyn Ledger>,
    registry: ActionRegistry,
    /// Local waiters keyed by action id; lost on crash, by design never
    /// persisted.
    wait_signals: Mutex<HashMap<ActionId, oneshot::Sender<TaskOutcome>>>,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskManager {
    /// Create a manager without background tasks; callers drive
    /// [`delegate_done_actions`](Self::delegate_done_actions) themselves.
    pub fn new(ledger: Arc<dyn Ledger>, registry: ActionRegistry) -> Arc<Self> {
        Arc::new(Self {
            ledger,
            registry,
            wait_signals: Mutex::new(HashMap::new()),
            joins: Mutex::new(Vec::new()),
        })
    }

    /// Create a manager and spawn its drain loop for the process lifetime.
    pub async fn start(ledger: Arc<dyn Ledger>, registry: ActionRegistry) -> Arc<Self> {
        // Install a default subscriber if none set (ok to call many times)
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
            .try_init();

        let manager = Self::new(ledger, registry);
        let drain = {
            let m = Arc::clone(&manager);
            tokio::spawn(async move { m.delegate_done_actions().await })
        };
        manager.joins.lock().await.push(drain);
        manager
    }

    /// Queue one unit of work for the given workflow position, returning a
    /// handle the caller suspends on.
    ///
    /// Idempotent on `(instance_id, state)`: a repeat call attaches to the
    /// existing action record instead of inserting a second one, and a call
    /// racing another scheduler adopts whichever record won the insert. If
    /// the action already has a stored result the returned handle is
    /// resolved before it is returned and nothing is registered locally.
    pub async fn queue_work(
        &self,
        call: ActionCall,
        state: &str,
        instance_id: InstanceId,
        queue_name: &str,
        retry: &RetryPolicy,
    ) -> Result<WaitHandle, TaskError> {
        let ActionCall { registry_id, input_body } = call;
        let record = match self.ledger.find_by_instance_and_state(instance_id, state).await? {
            Some(existing) => existing,
            None => {
                let new = NewActionRecord::queued(queue_name, instance_id, state, registry_id, input_body, retry);
                match self.ledger.insert_action(new).await {
                    Ok(created) => created,
                    Err(e) if e.is_conflict() => {
                        debug!(instance_id, state, "insert raced another scheduler; adopting the stored record");
                        self.ledger
                            .find_by_instance_and_state(instance_id, state)
                            .await?
                            .ok_or_else(|| {
                                TaskError::StorageInvariant(format!(
                                    "insert conflict for instance {instance_id} state {state:?} but no record is readable"
                                ))
                            })?
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };
        if record.id == 0 {
            return Err(TaskError::StorageInvariant(format!(
                "action for instance {instance_id} state {state:?} has no id"
            )));
        }

        if let Some(result) = self.ledger.find_result_for_action(record.id).await? {
            debug!(action_id = record.id, "found existing result, returning immediately");
            let outcome = self.resolve_outcome(record.id, &record.registry_id, &result)?;
            return Ok(WaitHandle::resolved(record.id, outcome));
        }

        let (tx, rx) = oneshot::channel();
        if self.wait_signals.lock().await.insert(record.id, tx).is_some() {
            debug!(action_id = record.id, "superseding previously registered wait handle");
        }

        // A worker may have finalized the action between the lookup above
        // and the registration; the drain loop would have skipped that
        // notification as unregistered, so re-check before parking.
        if let Some(result) = self.ledger.find_result_for_action(record.id).await? {
            if let Some(tx) = self.wait_signals.lock().await.remove(&record.id) {
                let outcome = self.resolve_outcome(record.id, &record.registry_id, &result)?;
                let _ = tx.send(outcome);
            }
        }

        Ok(WaitHandle::new(record.id, rx))
    }

    /// Drain `Done` notifications into locally registered wait handles.
    ///
    /// Runs once per process for the process lifetime, usually via
    /// [`start`](Self::start). Errors are isolated per notification so one
    /// bad record cannot stall delivery for the rest.
    pub async fn delegate_done_actions(&self) {
        let mut feed = self.ledger.subscribe(ActionStatus::Done).await;
        loop {
            let action_id = feed.next().await;
            if let Err(e) = self.delegate_one(action_id).await {
                error!(action_id, error = %e, "failed to deliver completed action");
            }
        }
    }

    async fn delegate_one(&self, action_id: ActionId) -> Result<(), TaskError> {
        // Nothing waiting locally: skip without the ledger roundtrips.
        if !self.wait_signals.lock().await.contains_key(&action_id) {
            return Ok(());
        }

        let Some(record) = with_retry("load done action", || self.ledger.action(action_id)).await? else {
            warn!(action_id, "done notification for a record the ledger cannot read");
            return Ok(());
        };
        let Some(final_result_id) = record.final_result_id else {
            warn!(action_id, "action is done but has no final result, skipping");
            return Ok(());
        };
        let Some(result) = with_retry("load final result", || self.ledger.result(final_result_id)).await? else {
            return Err(TaskError::StorageInvariant(format!(
                "final result {final_result_id} for action {action_id} is missing"
            )));
        };

        let outcome = self.resolve_outcome(action_id, &record.registry_id, &result)?;
        if let Some(tx) = self.wait_signals.lock().await.remove(&action_id) {
            if tx.send(outcome).is_err() {
                debug!(action_id, "waiter dropped before resolution");
            }
        }
        Ok(())
    }

    /// Turn a stored result into the outcome a waiter observes.
    ///
    /// An exception resolves as a failure. Otherwise: codec and body
    /// present decodes; no codec resolves to an absent value; a codec with
    /// no body is a fatal inconsistency and never resolves silently.
    fn resolve_outcome(
        &self,
        action_id: ActionId,
        registry_id: &str,
        result: &ActionResultRecord,
    ) -> Result<TaskOutcome, TaskError> {
        if let Some(exception) = &result.exception {
            debug!(action_id, "resolving wait with remote failure");
            return Ok(Err(ActionFailure::Remote {
                message: exception.clone(),
                stack: result.exception_stack.clone(),
            }));
        }

        match (self.registry.output_codec(registry_id), result.result_body.as_deref()) {
            (Some(codec), Some(body)) => match codec.decode(body) {
                Ok(value) => Ok(Ok(Some(value))),
                Err(source) => Err(TaskError::Decode {
                    action_id,
                    registry_id: registry_id.to_string(),
                    source,
                }),
            },
            (None, _) => Ok(Ok(None)),
            (Some(_), None) => Err(TaskError::MissingResultBody {
                action_id,
                registry_id: registry_id.to_string(),
            }),
        }
    }

    /// Number of unresolved local wait registrations.
    pub async fn pending_waits(&self) -> usize {
        self.wait_signals.lock().await.len()
    }

    /// Abort background tasks.
    pub async fn shutdown(&self) {
        let mut joins = self.joins.lock().await;
        for j in joins.drain(..) {
            j.abort();
        }
    }
}
