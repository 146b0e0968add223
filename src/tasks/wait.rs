//! Process-local park/wake primitive for suspended callers.

use thiserror::Error;
use tokio::sync::oneshot;

use crate::codec::OutputValue;
use crate::models::ActionId;

/// Failure delivered through a [`WaitHandle`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionFailure {
    /// The remote worker recorded an exception for this action.
    #[error("action failed with error: {message}{}", .stack.as_deref().map(|s| format!(" {s}")).unwrap_or_default())]
    Remote { message: String, stack: Option<String> },
    /// The registration was dropped or replaced before a result arrived.
    #[error("wait handle abandoned before the action completed")]
    Abandoned,
}

pub(crate) type TaskOutcome = Result<Option<OutputValue>, ActionFailure>;

/// Resolve-once handle a caller awaits for an action's outcome.
///
/// Never persisted; owned by exactly one caller within the process that
/// created it. Resolves to a decoded value, an absent value when the action
/// type has no registered output codec, or an [`ActionFailure`].
pub struct WaitHandle {
    action_id: ActionId,
    rx: oneshot::Receiver<TaskOutcome>,
    pre_resolved: bool,
}

impl WaitHandle {
    pub(crate) fn new(action_id: ActionId, rx: oneshot::Receiver<TaskOutcome>) -> Self {
        Self {
            action_id,
            rx,
            pre_resolved: false,
        }
    }

    /// A handle carrying an outcome that was already stored when the work
    /// was queued; awaiting it never suspends.
    pub(crate) fn resolved(action_id: ActionId, outcome: TaskOutcome) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(outcome);
        Self {
            action_id,
            rx,
            pre_resolved: true,
        }
    }

    /// Id of the durable action record this handle is waiting on.
    pub fn action_id(&self) -> ActionId {
        self.action_id
    }

    /// Whether the outcome was already stored when the handle was created.
    pub fn is_pre_resolved(&self) -> bool {
        self.pre_resolved
    }

    /// Suspend until the action's outcome is delivered.
    pub async fn wait(self) -> Result<Option<OutputValue>, ActionFailure> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(ActionFailure::Abandoned),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pre_resolved_handle_returns_without_suspending() {
        let handle = WaitHandle::resolved(7, Ok(None));
        assert!(handle.is_pre_resolved());
        assert_eq!(handle.action_id(), 7);
        assert_eq!(handle.wait().await, Ok(None));
    }

    #[tokio::test]
    async fn dropped_sender_reports_abandonment() {
        let (tx, rx) = oneshot::channel();
        let handle = WaitHandle::new(3, rx);
        drop(tx);
        assert_eq!(handle.wait().await, Err(ActionFailure::Abandoned));
    }

    #[test]
    fn remote_failure_text_carries_message_and_stack() {
        let failure = ActionFailure::Remote {
            message: "boom".into(),
            stack: Some("trace...".into()),
        };
        let text = failure.to_string();
        assert!(text.contains("boom"));
        assert!(text.contains("trace..."));

        let bare = ActionFailure::Remote {
            message: "boom".into(),
            stack: None,
        };
        assert_eq!(bare.to_string(), "action failed with error: boom");
    }
}
