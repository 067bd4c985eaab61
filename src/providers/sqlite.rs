use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use super::{dedupe_completions, OrchestrationItem, Provider, ProviderError, WorkItem};
use crate::{now_ms, Event};

/// SQLite-backed provider.
///
/// Every mutating operation runs in a single transaction, so an ack either
/// commits the history delta together with its outgoing messages or not at all.
/// The pool holds one connection; SQLite serializes writers anyway and a single
/// connection keeps `sqlite::memory:` databases coherent.
pub struct SqliteProvider {
    pool: SqlitePool,
}

impl SqliteProvider {
    /// Convert sqlx error to ProviderError with appropriate retry classification
    fn sqlx_to_provider_error(operation: &str, e: sqlx::Error) -> ProviderError {
        let error_msg = e.to_string();

        if error_msg.contains("database is locked") || error_msg.contains("SQLITE_BUSY") {
            return ProviderError::retryable(operation, format!("Database locked: {error_msg}"));
        }

        if error_msg.contains("UNIQUE constraint") || error_msg.contains("PRIMARY KEY") {
            return ProviderError::permanent(operation, format!("Constraint violation: {error_msg}"));
        }

        if error_msg.contains("connection") || error_msg.contains("timeout") {
            return ProviderError::retryable(operation, format!("Connection error: {error_msg}"));
        }

        // Unknown errors are treated as transient
        ProviderError::retryable(operation, error_msg)
    }

    /// Open (creating if needed) a SQLite store.
    ///
    /// # Arguments
    /// * `database_url` - SQLite connection string (e.g., "sqlite:data.db" or "sqlite::memory:")
    ///
    /// # Errors
    ///
    /// Returns an error if database connection or schema initialization fails.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let is_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
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
                    Ok(())
                })
            })
            .connect_with(options)
            .await?;

        Self::create_schema(&pool).await?;
        debug!(target: "duratask::providers::sqlite", url = %database_url, "SQLite provider ready");
        Ok(Self { pool })
    }

    /// Private in-memory database, mostly for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if database connection or schema initialization fails.
    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        Self::new("sqlite::memory:").await
    }

    async fn create_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                instance_id TEXT PRIMARY KEY,
                orchestration_name TEXT NOT NULL,
                input TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS history (
                instance_id TEXT NOT NULL,
                event_id INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                event_data TEXT NOT NULL,
                PRIMARY KEY (instance_id, event_id)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orchestrator_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id TEXT NOT NULL,
                work_item TEXT NOT NULL,
                visible_at INTEGER NOT NULL,
                lock_token TEXT,
                locked_until INTEGER
            )
            "#,
        )
        .execute(pool)
        .await?;

        // Instance-level locks so only one dispatcher replays an instance at a time
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instance_locks (
                instance_id TEXT PRIMARY KEY,
                lock_token TEXT NOT NULL,
                locked_until INTEGER NOT NULL,
                locked_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        for table in ["worker_queue", "timer_queue"] {
            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    work_item TEXT NOT NULL,
                    visible_at INTEGER NOT NULL,
                    lock_token TEXT,
                    locked_until INTEGER
                )
                "#
            ))
            .execute(pool)
            .await?;
        }

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_orch_visible ON orchestrator_queue(visible_at, lock_token)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_orch_instance ON orchestrator_queue(instance_id)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_timer_visible ON timer_queue(visible_at)")
            .execute(pool)
            .await?;

        Ok(())
    }

    fn generate_lock_token() -> String {
        format!("lock_{}", uuid::Uuid::new_v4())
    }

    fn now_millis() -> i64 {
        now_ms().min(i64::MAX as u64) as i64
    }

    fn timestamp_after(duration: Duration) -> i64 {
        let ms = duration.as_millis().min(i64::MAX as u128) as i64;
        Self::now_millis().saturating_add(ms)
    }

    fn encode_item(operation: &str, item: &WorkItem) -> Result<String, ProviderError> {
        serde_json::to_string(item).map_err(|e| ProviderError::permanent(operation, format!("Serialization error: {e}")))
    }

    fn decode_item(operation: &str, raw: &str) -> Result<WorkItem, ProviderError> {
        serde_json::from_str(raw).map_err(|e| ProviderError::permanent(operation, format!("Deserialization error: {e}")))
    }

    async fn begin(&self, operation: &str) -> Result<Transaction<'static, Sqlite>, ProviderError> {
        self.pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error(operation, e))
    }

    async fn instance_exists(
        tx: &mut Transaction<'_, Sqlite>,
        operation: &str,
        instance: &str,
    ) -> Result<bool, ProviderError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM instances WHERE instance_id = ?")
            .bind(instance)
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
        Ok(count > 0)
    }

    async fn read_history_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        operation: &str,
        instance: &str,
    ) -> Result<Vec<Event>, ProviderError> {
        let rows = sqlx::query("SELECT event_data FROM history WHERE instance_id = ? ORDER BY event_id")
            .bind(instance)
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
        rows.into_iter()
            .map(|row| {
                let data: String = row
                    .try_get("event_data")
                    .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
                serde_json::from_str::<Event>(&data)
                    .map_err(|e| ProviderError::permanent(operation, format!("Failed to deserialize event: {e}")))
            })
            .collect()
    }

    async fn append_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        operation: &str,
        instance: &str,
        events: Vec<Event>,
    ) -> Result<(), ProviderError> {
        let existing = Self::read_history_in_tx(tx, operation, instance).await?;
        let kept = dedupe_completions(&existing, events);
        let mut event_id = existing.len() as i64;
        for event in kept {
            event_id += 1;
            let data = serde_json::to_string(&event)
                .map_err(|e| ProviderError::permanent(operation, format!("Failed to serialize event: {e}")))?;
            sqlx::query("INSERT INTO history (instance_id, event_id, event_type, event_data) VALUES (?, ?, ?, ?)")
                .bind(instance)
                .bind(event_id)
                .bind(event.kind_name())
                .bind(data)
                .execute(&mut **tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
        }
        Ok(())
    }

    async fn enqueue_orchestrator_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        operation: &str,
        item: &WorkItem,
    ) -> Result<(), ProviderError> {
        let raw = Self::encode_item(operation, item)?;
        sqlx::query("INSERT INTO orchestrator_queue (instance_id, work_item, visible_at) VALUES (?, ?, ?)")
            .bind(item.instance())
            .bind(raw)
            .bind(Self::now_millis())
            .execute(&mut **tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
        Ok(())
    }

    /// Insert into worker_queue or timer_queue. Timer messages become visible at their fire time.
    async fn enqueue_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        table: &str,
        operation: &str,
        item: &WorkItem,
    ) -> Result<(), ProviderError> {
        let visible_at = item
            .fire_at_ms()
            .map(|ms| ms.min(i64::MAX as u64) as i64)
            .unwrap_or_else(Self::now_millis);
        sqlx::query(&format!("INSERT INTO {table} (work_item, visible_at) VALUES (?, ?)"))
            .bind(Self::encode_item(operation, item)?)
            .bind(visible_at)
            .execute(&mut **tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
        Ok(())
    }

    /// Peek-lock the oldest visible message in `table` (worker_queue or timer_queue).
    async fn fetch_from_queue(
        &self,
        table: &str,
        operation: &str,
        lock_for: Duration,
    ) -> Result<Option<(WorkItem, String)>, ProviderError> {
        let mut tx = self.begin(operation).await?;
        let now = Self::now_millis();
        let row = sqlx::query(&format!(
            "SELECT id, work_item FROM {table}
             WHERE visible_at <= ?1 AND (lock_token IS NULL OR locked_until <= ?1)
             ORDER BY visible_at, id LIMIT 1"
        ))
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;

        let Some(row) = row else {
            tx.rollback().await.ok();
            return Ok(None);
        };
        let id: i64 = row.try_get("id").map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
        let raw: String = row
            .try_get("work_item")
            .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
        let item = Self::decode_item(operation, &raw)?;

        let token = Self::generate_lock_token();
        sqlx::query(&format!("UPDATE {table} SET lock_token = ?, locked_until = ? WHERE id = ?"))
            .bind(&token)
            .bind(Self::timestamp_after(lock_for))
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
        tx.commit()
            .await
            .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
        Ok(Some((item, token)))
    }

    /// Delete the locked message from `table` and enqueue `next` for the orchestrator.
    async fn ack_queue_item(&self, table: &str, operation: &str, token: &str, next: WorkItem) -> Result<(), ProviderError> {
        let mut tx = self.begin(operation).await?;
        let deleted = sqlx::query(&format!("DELETE FROM {table} WHERE lock_token = ?"))
            .bind(token)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(operation, e))?
            .rows_affected();
        if deleted == 0 {
            tx.rollback().await.ok();
            return Err(ProviderError::permanent(operation, "lock token expired or unknown"));
        }
        Self::enqueue_orchestrator_in_tx(&mut tx, operation, &next).await?;
        tx.commit()
            .await
            .map_err(|e| Self::sqlx_to_provider_error(operation, e))
    }

    /// Unlock the message held by `token` in `table`; it becomes visible after `delay`.
    async fn release_queue_item(
        &self,
        table: &str,
        operation: &str,
        token: &str,
        delay: Option<Duration>,
    ) -> Result<(), ProviderError> {
        sqlx::query(&format!(
            "UPDATE {table} SET lock_token = NULL, locked_until = NULL, visible_at = ? WHERE lock_token = ?"
        ))
        .bind(Self::timestamp_after(delay.unwrap_or_default()))
        .bind(token)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
        Ok(())
    }

    /// Number of messages per queue: (orchestrator, worker, timer).
    pub async fn queue_depths(&self) -> Result<(usize, usize, usize), ProviderError> {
        let mut depths = [0usize; 3];
        for (slot, table) in ["orchestrator_queue", "worker_queue", "timer_queue"].iter().enumerate() {
            let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(&self.pool)
                .await
                .map_err(|e| Self::sqlx_to_provider_error("queue_depths", e))?;
            depths[slot] = count as usize;
        }
        Ok((depths[0], depths[1], depths[2]))
    }
}

#[async_trait]
impl Provider for SqliteProvider {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn create_instance(&self, instance: &str, orchestration: &str, input: &str) -> Result<(), ProviderError> {
        let op = "create_instance";
        let mut tx = self.begin(op).await?;
        if Self::instance_exists(&mut tx, op, instance).await? {
            tx.rollback().await.ok();
            return Err(ProviderError::already_exists(op, instance));
        }
        let now = Self::now_millis();
        sqlx::query("INSERT INTO instances (instance_id, orchestration_name, input, created_at) VALUES (?, ?, ?, ?)")
            .bind(instance)
            .bind(orchestration)
            .bind(input)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        let started = Event::OrchestrationStarted {
            name: orchestration.to_string(),
            input: input.to_string(),
            timestamp_ms: now as u64,
        };
        Self::append_in_tx(&mut tx, op, instance, vec![started]).await?;
        Self::enqueue_orchestrator_in_tx(
            &mut tx,
            op,
            &WorkItem::StartOrchestration {
                instance: instance.to_string(),
                orchestration: orchestration.to_string(),
                input: input.to_string(),
            },
        )
        .await?;
        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        debug!(target: "duratask::providers::sqlite", instance_id = %instance, orchestration_name = %orchestration, "Instance created");
        Ok(())
    }

    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let op = "read";
        let mut tx = self.begin(op).await?;
        if !Self::instance_exists(&mut tx, op, instance).await? {
            tx.rollback().await.ok();
            return Err(ProviderError::instance_not_found(op, instance));
        }
        let history = Self::read_history_in_tx(&mut tx, op, instance).await?;
        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        Ok(history)
    }

    async fn append(&self, instance: &str, events: Vec<Event>) -> Result<(), ProviderError> {
        let op = "append";
        let mut tx = self.begin(op).await?;
        if !Self::instance_exists(&mut tx, op, instance).await? {
            tx.rollback().await.ok();
            return Err(ProviderError::instance_not_found(op, instance));
        }
        Self::append_in_tx(&mut tx, op, instance, events).await?;
        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(op, e))
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        sqlx::query_scalar("SELECT instance_id FROM instances ORDER BY instance_id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("list_instances", e))
    }

    async fn enqueue_orchestrator_work(&self, item: WorkItem) -> Result<(), ProviderError> {
        let op = "enqueue_orchestrator_work";
        let mut tx = self.begin(op).await?;
        Self::enqueue_orchestrator_in_tx(&mut tx, op, &item).await?;
        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(op, e))
    }

    async fn fetch_orchestration_item(&self, lock_for: Duration) -> Result<Option<OrchestrationItem>, ProviderError> {
        let op = "fetch_orchestration_item";
        let mut tx = self.begin(op).await?;
        let now = Self::now_millis();

        // Find an instance that has visible messages AND is not locked (or lock expired)
        let row = sqlx::query(
            r#"
            SELECT q.instance_id
            FROM orchestrator_queue q
            LEFT JOIN instance_locks il ON q.instance_id = il.instance_id
            WHERE q.visible_at <= ?1
              AND (q.lock_token IS NULL OR q.locked_until <= ?1)
              AND (il.instance_id IS NULL OR il.locked_until <= ?1)
            ORDER BY q.id
            LIMIT 1
            "#,
        )
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(op, e))?;

        let Some(row) = row else {
            tx.rollback().await.ok();
            return Ok(None);
        };
        let instance: String = row
            .try_get("instance_id")
            .map_err(|e| ProviderError::permanent(op, format!("Failed to get instance_id: {e}")))?;

        let lock_token = Self::generate_lock_token();
        let locked_until = Self::timestamp_after(lock_for);
        let affected = sqlx::query(
            r#"
            INSERT INTO instance_locks (instance_id, lock_token, locked_until, locked_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(instance_id) DO UPDATE
            SET lock_token = ?2, locked_until = ?3, locked_at = ?4
            WHERE locked_until <= ?4
            "#,
        )
        .bind(&instance)
        .bind(&lock_token)
        .bind(locked_until)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(op, e))?
        .rows_affected();
        if affected == 0 {
            debug!(target: "duratask::providers::sqlite", instance_id = %instance, "Instance already locked");
            tx.rollback().await.ok();
            return Ok(None);
        }

        // Mark every visible message so the ack deletes exactly what this turn saw
        sqlx::query(
            r#"
            UPDATE orchestrator_queue SET lock_token = ?1, locked_until = ?2
            WHERE instance_id = ?3 AND visible_at <= ?4
              AND (lock_token IS NULL OR locked_until <= ?4)
            "#,
        )
        .bind(&lock_token)
        .bind(locked_until)
        .bind(&instance)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(op, e))?;

        let rows = sqlx::query("SELECT work_item FROM orchestrator_queue WHERE lock_token = ? ORDER BY id")
            .bind(&lock_token)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let raw: String = row
                .try_get("work_item")
                .map_err(|e| Self::sqlx_to_provider_error(op, e))?;
            messages.push(Self::decode_item(op, &raw)?);
        }

        let history = Self::read_history_in_tx(&mut tx, op, &instance).await?;
        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        debug!(
            target: "duratask::providers::sqlite",
            instance_id = %instance,
            message_count = messages.len(),
            history_len = history.len(),
            "Locked orchestration item"
        );
        Ok(Some(OrchestrationItem {
            instance,
            history,
            messages,
            lock_token,
        }))
    }

    async fn ack_orchestration_item(
        &self,
        lock_token: &str,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        timer_items: Vec<WorkItem>,
    ) -> Result<(), ProviderError> {
        let op = "ack_orchestration_item";
        let mut tx = self.begin(op).await?;
        let instance: Option<String> =
            sqlx::query_scalar("SELECT instance_id FROM instance_locks WHERE lock_token = ? AND locked_until > ?")
                .bind(lock_token)
                .bind(Self::now_millis())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        let Some(instance) = instance else {
            tx.rollback().await.ok();
            return Err(ProviderError::permanent(op, "lock token expired or unknown"));
        };

        if !history_delta.is_empty() {
            Self::append_in_tx(&mut tx, op, &instance, history_delta).await?;
        }

        sqlx::query("DELETE FROM orchestrator_queue WHERE lock_token = ?")
            .bind(lock_token)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(op, e))?;

        for item in &worker_items {
            Self::enqueue_in_tx(&mut tx, "worker_queue", op, item).await?;
        }
        for item in &timer_items {
            Self::enqueue_in_tx(&mut tx, "timer_queue", op, item).await?;
        }

        sqlx::query("DELETE FROM instance_locks WHERE instance_id = ? AND lock_token = ?")
            .bind(&instance)
            .bind(lock_token)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(op, e))?;

        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        debug!(
            target: "duratask::providers::sqlite",
            instance_id = %instance,
            worker_items = worker_items.len(),
            timer_items = timer_items.len(),
            "Acked orchestration item"
        );
        Ok(())
    }

    async fn abandon_orchestration_item(&self, lock_token: &str, delay: Option<Duration>) -> Result<(), ProviderError> {
        let op = "abandon_orchestration_item";
        let mut tx = self.begin(op).await?;
        let visible_at = Self::timestamp_after(delay.unwrap_or_default());
        sqlx::query(
            "UPDATE orchestrator_queue SET lock_token = NULL, locked_until = NULL, visible_at = ? WHERE lock_token = ?",
        )
        .bind(visible_at)
        .bind(lock_token)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        sqlx::query("DELETE FROM instance_locks WHERE lock_token = ?")
            .bind(lock_token)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(op, e))
    }

    async fn enqueue_worker_work(&self, item: WorkItem) -> Result<(), ProviderError> {
        let op = "enqueue_worker_work";
        let mut tx = self.begin(op).await?;
        Self::enqueue_in_tx(&mut tx, "worker_queue", op, &item).await?;
        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(op, e))
    }

    async fn fetch_work_item(&self, lock_for: Duration) -> Result<Option<(WorkItem, String)>, ProviderError> {
        self.fetch_from_queue("worker_queue", "fetch_work_item", lock_for).await
    }

    async fn ack_work_item(&self, token: &str, completion: WorkItem) -> Result<(), ProviderError> {
        self.ack_queue_item("worker_queue", "ack_work_item", token, completion)
            .await
    }

    async fn abandon_work_item(&self, token: &str, delay: Option<Duration>) -> Result<(), ProviderError> {
        self.release_queue_item("worker_queue", "abandon_work_item", token, delay)
            .await
    }

    async fn enqueue_timer_work(&self, item: WorkItem) -> Result<(), ProviderError> {
        let op = "enqueue_timer_work";
        let mut tx = self.begin(op).await?;
        Self::enqueue_in_tx(&mut tx, "timer_queue", op, &item).await?;
        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(op, e))
    }

    async fn fetch_timer_item(&self, lock_for: Duration) -> Result<Option<(WorkItem, String)>, ProviderError> {
        self.fetch_from_queue("timer_queue", "fetch_timer_item", lock_for).await
    }

    async fn ack_timer_item(&self, token: &str, fired: WorkItem) -> Result<(), ProviderError> {
        self.ack_queue_item("timer_queue", "ack_timer_item", token, fired).await
    }

    async fn abandon_timer_item(&self, token: &str, delay: Option<Duration>) -> Result<(), ProviderError> {
        self.release_queue_item("timer_queue", "abandon_timer_item", token, delay)
            .await
    }
}
