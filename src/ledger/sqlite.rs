use std::collections::{HashMap, VecDeque};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::warn;

use super::{Ledger, LedgerError, NotificationFeed};
use crate::models::{
    ActionId, ActionRecord, ActionResultId, ActionResultRecord, ActionStatus, InstanceId, NewActionRecord,
    NewActionResult,
};

/// Configuration options for [`SqliteLedger`].
#[derive(Debug, Clone)]
pub struct SqliteLedgerOptions {
    /// Interval between polls of the notification feed when idle.
    pub poll_interval: Duration,
}

impl Default for SqliteLedgerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
        }
    }
}

/// SQLite-backed ledger with a uniqueness constraint on the dedup key.
///
/// WAL journaling for file databases gives concurrent schedulers and
/// workers non-blocking reads; the unique index on `(instance_id, state)`
/// closes the lookup-then-insert race at the storage layer.
pub struct SqliteLedger {
    pool: SqlitePool,
    options: SqliteLedgerOptions,
}

impl SqliteLedger {
    /// Open (and if needed initialize) a ledger at the given SQLite URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or schema initialization fails.
    pub async fn new(database_url: &str, options: Option<SqliteLedgerOptions>) -> Result<Self, sqlx::Error> {
        let is_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if is_memory {
                        sqlx::query("PRAGMA journal_mode = MEMORY").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = OFF").execute(&mut *conn).await?;
                    } else {
                        sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = NORMAL").execute(&mut *conn).await?;
                    }
                    sqlx::query("PRAGMA busy_timeout = 60000").execute(&mut *conn).await?;
                    sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await?;

        Self::create_schema(&pool).await?;

        Ok(Self {
            pool,
            options: options.unwrap_or_default(),
        })
    }

    /// Shared-cache in-memory ledger, mainly for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or schema initialization fails.
    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        // Shared cache so every pooled connection sees the same database.
        Self::new("sqlite::memory:?cache=shared", None).await
    }

    async fn create_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS actions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                workflow_name TEXT NOT NULL,
                instance_id INTEGER NOT NULL,
                state TEXT NOT NULL,
                registry_id TEXT NOT NULL,
                input_body TEXT,
                status TEXT NOT NULL DEFAULT 'queued',
                final_result_id INTEGER,
                retry_backoff_seconds INTEGER NOT NULL DEFAULT 1,
                retry_backoff_factor REAL NOT NULL DEFAULT 1.0,
                retry_jitter REAL NOT NULL DEFAULT 0.0,
                retry_max_attempts INTEGER,
                retry_current_attempt INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        // Dedup invariant: at most one action per (instance_id, state).
        sqlx::query(
            r#"CREATE UNIQUE INDEX IF NOT EXISTS idx_actions_instance_state ON actions(instance_id, state)"#,
        )
        .execute(pool)
        .await?;

        // Serves the status-transition polling feed.
        sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_actions_status_updated ON actions(status, updated_at)"#)
            .execute(pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS action_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                action_id INTEGER NOT NULL REFERENCES actions(id),
                result_body TEXT,
                exception TEXT,
                exception_stack TEXT,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_action_results_action ON action_results(action_id)"#)
            .execute(pool)
            .await?;

        Ok(())
    }

    fn now_millis() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }

    /// Convert an sqlx error into a classified [`LedgerError`].
    fn sqlx_to_ledger_error(operation: &str, e: sqlx::Error) -> LedgerError {
        let message = e.to_string();

        if message.contains("UNIQUE constraint") || message.contains("PRIMARY KEY") {
            return LedgerError::conflict(operation, format!("constraint violation: {message}"));
        }
        if message.contains("database is locked") || message.contains("SQLITE_BUSY") {
            return LedgerError::retryable(operation, format!("database locked: {message}"));
        }
        if message.contains("connection") || message.contains("timeout") {
            return LedgerError::retryable(operation, format!("connection error: {message}"));
        }
        // Conservative default: assume transient.
        LedgerError::retryable(operation, message)
    }

    fn action_from_row(operation: &str, row: &SqliteRow) -> Result<ActionRecord, LedgerError> {
        let get = |e: sqlx::Error| LedgerError::permanent(operation, format!("malformed action row: {e}"));
        let status_text: String = row.try_get("status").map_err(get)?;
        let status = ActionStatus::parse(&status_text)
            .ok_or_else(|| LedgerError::permanent(operation, format!("unknown action status: {status_text}")))?;
        Ok(ActionRecord {
            id: row.try_get("id").map_err(get)?,
            workflow_name: row.try_get("workflow_name").map_err(get)?,
            instance_id: row.try_get("instance_id").map_err(get)?,
            state: row.try_get("state").map_err(get)?,
            registry_id: row.try_get("registry_id").map_err(get)?,
            input_body: row.try_get("input_body").map_err(get)?,
            status,
            final_result_id: row.try_get("final_result_id").map_err(get)?,
            retry_backoff_seconds: row.try_get("retry_backoff_seconds").map_err(get)?,
            retry_backoff_factor: row.try_get("retry_backoff_factor").map_err(get)?,
            retry_jitter: row.try_get("retry_jitter").map_err(get)?,
            retry_max_attempts: row.try_get("retry_max_attempts").map_err(get)?,
            retry_current_attempt: row.try_get("retry_current_attempt").map_err(get)?,
        })
    }

    fn result_from_row(operation: &str, row: &SqliteRow) -> Result<ActionResultRecord, LedgerError> {
        let get = |e: sqlx::Error| LedgerError::permanent(operation, format!("malformed result row: {e}"));
        Ok(ActionResultRecord {
            id: row.try_get("id").map_err(get)?,
            action_id: row.try_get("action_id").map_err(get)?,
            result_body: row.try_get("result_body").map_err(get)?,
            exception: row.try_get("exception").map_err(get)?,
            exception_stack: row.try_get("exception_stack").map_err(get)?,
        })
    }
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn insert_action(&self, new: NewActionRecord) -> Result<ActionRecord, LedgerError> {
        let now = Self::now_millis();
        let res = sqlx::query(
            r#"
            INSERT INTO actions (
                workflow_name, instance_id, state, registry_id, input_body, status,
                retry_backoff_seconds, retry_backoff_factor, retry_jitter,
                retry_max_attempts, retry_current_attempt, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(&new.workflow_name)
        .bind(new.instance_id)
        .bind(&new.state)
        .bind(&new.registry_id)
        .bind(&new.input_body)
        .bind(new.status.as_str())
        .bind(new.retry_backoff_seconds)
        .bind(new.retry_backoff_factor)
        .bind(new.retry_jitter)
        .bind(new.retry_max_attempts)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_ledger_error("insert_action", e))?;

        let id = res.last_insert_rowid();
        if id == 0 {
            return Err(LedgerError::permanent("insert_action", "insert yielded no row id"));
        }
        self.action(id)
            .await?
            .ok_or_else(|| LedgerError::permanent("insert_action", format!("inserted action {id} is not readable")))
    }

    async fn action(&self, id: ActionId) -> Result<Option<ActionRecord>, LedgerError> {
        let row = sqlx::query("SELECT * FROM actions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_ledger_error("action", e))?;
        row.as_ref().map(|r| Self::action_from_row("action", r)).transpose()
    }

    async fn result(&self, id: ActionResultId) -> Result<Option<ActionResultRecord>, LedgerError> {
        let row = sqlx::query("SELECT * FROM action_results WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_ledger_error("result", e))?;
        row.as_ref().map(|r| Self::result_from_row("result", r)).transpose()
    }

    async fn find_by_instance_and_state(
        &self,
        instance_id: InstanceId,
        state: &str,
    ) -> Result<Option<ActionRecord>, LedgerError> {
        let row = sqlx::query("SELECT * FROM actions WHERE instance_id = ? AND state = ? ORDER BY id LIMIT 1")
            .bind(instance_id)
            .bind(state)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_ledger_error("find_by_instance_and_state", e))?;
        row.as_ref()
            .map(|r| Self::action_from_row("find_by_instance_and_state", r))
            .transpose()
    }

    async fn find_result_for_action(&self, action_id: ActionId) -> Result<Option<ActionResultRecord>, LedgerError> {
        let row = sqlx::query("SELECT * FROM action_results WHERE action_id = ? ORDER BY id LIMIT 1")
            .bind(action_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_ledger_error("find_result_for_action", e))?;
        row.as_ref()
            .map(|r| Self::result_from_row("find_result_for_action", r))
            .transpose()
    }

    async fn actions_for_instance(&self, instance_id: InstanceId) -> Result<Vec<ActionRecord>, LedgerError> {
        let rows = sqlx::query("SELECT * FROM actions WHERE instance_id = ? ORDER BY id")
            .bind(instance_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_ledger_error("actions_for_instance", e))?;
        rows.iter()
            .map(|r| Self::action_from_row("actions_for_instance", r))
            .collect()
    }

    async fn set_status(&self, id: ActionId, status: ActionStatus) -> Result<(), LedgerError> {
        let res = sqlx::query("UPDATE actions SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Self::now_millis())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_ledger_error("set_status", e))?;
        if res.rows_affected() == 0 {
            return Err(LedgerError::permanent("set_status", format!("unknown action: {id}")));
        }
        Ok(())
    }

    async fn complete_action(&self, id: ActionId, result: NewActionResult) -> Result<ActionResultRecord, LedgerError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_ledger_error("complete_action", e))?;

        let row = sqlx::query("SELECT final_result_id FROM actions WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_ledger_error("complete_action", e))?;
        let current: Option<ActionResultId> = match row {
            None => return Err(LedgerError::permanent("complete_action", format!("unknown action: {id}"))),
            Some(r) => r
                .try_get("final_result_id")
                .map_err(|e| LedgerError::permanent("complete_action", format!("malformed action row: {e}")))?,
        };
        if let Some(existing) = current {
            return Err(LedgerError::permanent(
                "complete_action",
                format!("action {id} already finalized with result {existing}"),
            ));
        }

        let now = Self::now_millis();
        let res = sqlx::query(
            "INSERT INTO action_results (action_id, result_body, exception, exception_stack, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(&result.result_body)
        .bind(&result.exception)
        .bind(&result.exception_stack)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_ledger_error("complete_action", e))?;
        let result_id = res.last_insert_rowid();

        sqlx::query("UPDATE actions SET final_result_id = ?, status = 'done', updated_at = ? WHERE id = ?")
            .bind(result_id)
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_ledger_error("complete_action", e))?;

        tx.commit()
            .await
            .map_err(|e| Self::sqlx_to_ledger_error("complete_action", e))?;

        Ok(ActionResultRecord {
            id: result_id,
            action_id: id,
            result_body: result.result_body,
            exception: result.exception,
            exception_stack: result.exception_stack,
        })
    }

    async fn subscribe(&self, status: ActionStatus) -> Box<dyn NotificationFeed> {
        Box::new(SqlitePollFeed {
            pool: self.pool.clone(),
            status,
            seen: HashMap::new(),
            pending: VecDeque::new(),
            poll_interval: self.options.poll_interval,
        })
    }
}

/// Polling notification feed over the `actions` table.
///
/// Every poll scans the target status and delivers ids not yet seen at
/// their current `updated_at`; a record re-entering the status after a
/// later write is delivered again. Restartable by construction: a fresh
/// feed replays everything currently in the status.
struct SqlitePollFeed {
    pool: SqlitePool,
    status: ActionStatus,
    seen: HashMap<ActionId, i64>,
    pending: VecDeque<ActionId>,
    poll_interval: Duration,
}

#[async_trait]
impl NotificationFeed for SqlitePollFeed {
    async fn next(&mut self) -> ActionId {
        loop {
            if let Some(id) = self.pending.pop_front() {
                return id;
            }
            match sqlx::query("SELECT id, updated_at FROM actions WHERE status = ? ORDER BY updated_at, id")
                .bind(self.status.as_str())
                .fetch_all(&self.pool)
                .await
            {
                Ok(rows) => {
                    for row in rows {
                        let (Ok(id), Ok(updated_at)) =
                            (row.try_get::<i64, _>("id"), row.try_get::<i64, _>("updated_at"))
                        else {
                            continue;
                        };
                        let fresh = match self.seen.get(&id) {
                            Some(&prev) => updated_at > prev,
                            None => true,
                        };
                        if fresh {
                            self.seen.insert(id, updated_at);
                            self.pending.push_back(id);
                        }
                    }
                }
                Err(e) => {
                    warn!(status = %self.status, error = %e, "status poll failed; backing off");
                }
            }
            if self.pending.is_empty() {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
    }
}
