//! Durable action scheduling over a shared ledger.
//!
//! A workflow process delegates units of work ("actions") to out-of-process
//! workers and resumes when the result lands in durable storage. The crate
//! guarantees at-most-one action record per `(workflow instance, logical
//! state)` pair and wakes exactly the process still waiting on it.
//!
//! Components:
//! - [`retry::RetryPolicy`]: backoff configuration carried by each action,
//!   interpreted only by workers.
//! - [`registry::ActionRegistry`]: static map from an action type id to its
//!   output codec.
//! - [`ledger::Ledger`]: durable records plus at-least-once status
//!   notifications; [`ledger::in_memory::InMemoryLedger`] and
//!   [`ledger::sqlite::SqliteLedger`] implementations.
//! - [`tasks::TaskManager`]: per-process dedup, submission, and the
//!   background drain loop resolving [`tasks::WaitHandle`]s.
//!
//! ```no_run
//! use duract::{ActionCall, ActionRegistry, RetryPolicy, TaskManager};
//! use duract::ledger::sqlite::SqliteLedger;
//! use std::sync::Arc;
//!
//! # #[derive(serde::Serialize, serde::Deserialize)]
//! # struct Report { total: i64 }
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let ledger = Arc::new(SqliteLedger::new("sqlite:daemon.db", None).await?);
//! let registry = ActionRegistry::builder().register::<Report>("billing.tally").build();
//! let manager = TaskManager::start(ledger, registry).await;
//!
//! let call = ActionCall::new("billing.tally").with_input(&serde_json::json!({"month": 7}))?;
//! let handle = manager
//!     .queue_work(call, "tally_step", 42, "billing", &RetryPolicy::default())
//!     .await?;
//! let report: Report = handle.wait().await?.expect("codec registered").into_typed()?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod ledger;
pub mod models;
pub mod registry;
pub mod retry;
pub mod tasks;

use serde::Serialize;

pub use codec::{CodecError, JsonCodec, OutputCodec, OutputValue};
pub use ledger::{Ledger, LedgerError, NotificationFeed};
pub use models::{
    ActionId, ActionRecord, ActionResultId, ActionResultRecord, ActionStatus, InstanceId, NewActionRecord,
    NewActionResult,
};
pub use registry::ActionRegistry;
pub use retry::{RetryPolicy, RetryPolicyError};
pub use tasks::{ActionFailure, TaskError, TaskManager, WaitHandle};

/// Typed action descriptor handed to [`TaskManager::queue_work`].
///
/// Produced by the workflow layer when it reaches a step that delegates
/// work; carries the registry id of the action type and the serialized
/// input, nothing else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionCall {
    pub registry_id: String,
    pub input_body: Option<String>,
}

impl ActionCall {
    /// A call with no input payload.
    pub fn new(registry_id: impl Into<String>) -> Self {
        Self {
            registry_id: registry_id.into(),
            input_body: None,
        }
    }

    /// Attach a JSON-serialized input payload.
    pub fn with_input<T: Serialize>(mut self, input: &T) -> Result<Self, CodecError> {
        self.input_body = Some(codec::encode(input)?);
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_call_serializes_input() {
        let call = ActionCall::new("demo.add")
            .with_input(&serde_json::json!({"a": 1}))
            .unwrap();
        assert_eq!(call.registry_id, "demo.add");
        assert_eq!(call.input_body.as_deref(), Some(r#"{"a":1}"#));

        let bare = ActionCall::new("demo.ping");
        assert_eq!(bare.input_body, None);
    }
}
