#![allow(dead_code)]

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use duract::ledger::in_memory::InMemoryLedger;
use duract::ledger::sqlite::SqliteLedger;
use duract::{ActionRegistry, Ledger};

/// Output type used by most tests.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct Tally {
    pub value: i64,
}

pub const TALLY_ID: &str = "demo.tally";

/// Registry with a single JSON codec for [`Tally`].
pub fn tally_registry() -> ActionRegistry {
    ActionRegistry::builder().register::<Tally>(TALLY_ID).build()
}

pub fn in_memory_ledger() -> Arc<dyn Ledger> {
    Arc::new(InMemoryLedger::new())
}

pub async fn create_sqlite_ledger_disk() -> (Arc<dyn Ledger>, TempDir) {
    let td = tempfile::tempdir().unwrap();
    let db_path = td.path().join("test.db");
    std::fs::File::create(&db_path).unwrap();
    let db_url = format!("sqlite:{}", db_path.display());
    let ledger = Arc::new(SqliteLedger::new(&db_url, None).await.unwrap()) as Arc<dyn Ledger>;
    (ledger, td)
}
