use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqlitePoolOptions};
use tracing::debug;

use super::{
    ExecutionMetadata, HistoryStore, InstanceRecord, InstanceStatus, LeasedItem, Provider, ProviderError, QueueKind,
    WorkItem, WorkQueue, check_append,
};
use crate::Event;

/// SQLite-backed provider with transactional commits.
///
/// History rows are keyed by `(instance_id, seq)`, so the database itself
/// rejects two writers racing for the same sequence number. Queue rows carry
/// their lease (`lock_token`, `locked_until`) and `attempt_count`; a lease
/// that runs out makes the row visible again.
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

        // Two writers raced for the same history slot.
        if error_msg.contains("UNIQUE constraint") || error_msg.contains("PRIMARY KEY") {
            return ProviderError::conflict(operation, format!("Constraint violation: {error_msg}"));
        }

        if error_msg.contains("connection") || error_msg.contains("timeout") {
            return ProviderError::retryable(operation, format!("Connection error: {error_msg}"));
        }

        ProviderError::permanent(operation, error_msg)
    }

    /// Create a provider from a connection string such as
    /// `sqlite:durafan.db?mode=rwc` or `sqlite::memory:`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or schema creation fails.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let is_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let mut options = SqlitePoolOptions::new()
            .max_connections(if is_memory { 1 } else { 5 })
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if !is_memory {
                        sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = NORMAL").execute(&mut *conn).await?;
                    }
                    sqlx::query("PRAGMA busy_timeout = 60000").execute(&mut *conn).await?;
                    Ok(())
                })
            });
        if is_memory {
            // A private in-memory database lives exactly as long as its one connection.
            options = options.min_connections(1).idle_timeout(None).max_lifetime(None);
        }
        let pool = options.connect(database_url).await?;
        Self::create_schema(&pool).await?;
        debug!(target: "durafan::providers::sqlite", url = %database_url, "sqlite provider ready");
        Ok(Self { pool })
    }

    /// Private in-memory database, handy for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or schema creation fails.
    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        Self::new("sqlite::memory:").await
    }

    async fn create_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                instance_id TEXT PRIMARY KEY,
                orchestration TEXT NOT NULL,
                input TEXT NOT NULL,
                status TEXT NOT NULL,
                output TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS history (
                instance_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                event_data TEXT NOT NULL,
                PRIMARY KEY (instance_id, seq)
            )
            "#,
        )
        .execute(pool)
        .await?;

        for table in [Self::table(QueueKind::Orchestrator), Self::table(QueueKind::Worker)] {
            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    instance_id TEXT NOT NULL,
                    work_item TEXT NOT NULL,
                    visible_at INTEGER NOT NULL,
                    lock_token TEXT,
                    locked_until INTEGER,
                    attempt_count INTEGER NOT NULL DEFAULT 0
                )
                "#
            ))
            .execute(pool)
            .await?;
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_visible ON {table}(visible_at, lock_token)"
            ))
            .execute(pool)
            .await?;
        }

        Ok(())
    }

    fn table(kind: QueueKind) -> &'static str {
        match kind {
            QueueKind::Orchestrator => "orchestrator_queue",
            QueueKind::Worker => "worker_queue",
        }
    }

    fn generate_lock_token() -> String {
        format!("lock_{}", uuid::Uuid::new_v4())
    }

    fn now_millis() -> i64 {
        Utc::now().timestamp_millis()
    }

    fn timestamp_after(duration: Duration) -> i64 {
        let ms = duration.as_millis().min(i64::MAX as u128) as i64;
        Self::now_millis().saturating_add(ms)
    }

    fn parse_time(operation: &str, raw: &str) -> Result<DateTime<Utc>, ProviderError> {
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| ProviderError::permanent(operation, format!("bad timestamp '{raw}': {e}")))
    }

    async fn read_history(
        conn: &mut SqliteConnection,
        operation: &str,
        instance: &str,
    ) -> Result<Vec<Event>, ProviderError> {
        let rows = sqlx::query("SELECT event_data FROM history WHERE instance_id = ? ORDER BY seq")
            .bind(instance)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
        rows.iter()
            .map(|row| {
                let data: String = row
                    .try_get("event_data")
                    .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
                serde_json::from_str::<Event>(&data)
                    .map_err(|e| ProviderError::permanent(operation, format!("corrupt event: {e}")))
            })
            .collect()
    }

    async fn insert_events(
        conn: &mut SqliteConnection,
        operation: &str,
        instance: &str,
        first_seq: u64,
        events: &[Event],
    ) -> Result<(), ProviderError> {
        for (offset, event) in events.iter().enumerate() {
            let data = serde_json::to_string(event)
                .map_err(|e| ProviderError::permanent(operation, format!("Serialization error: {e}")))?;
            sqlx::query("INSERT INTO history (instance_id, seq, event_type, event_data) VALUES (?, ?, ?, ?)")
                .bind(instance)
                .bind((first_seq + offset as u64) as i64)
                .bind(event.kind_name())
                .bind(data)
                .execute(&mut *conn)
                .await
                .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
        }
        Ok(())
    }

    async fn insert_work_item(
        conn: &mut SqliteConnection,
        operation: &str,
        item: &WorkItem,
    ) -> Result<(), ProviderError> {
        let work_item = serde_json::to_string(item)
            .map_err(|e| ProviderError::permanent(operation, format!("Serialization error: {e}")))?;
        let now = Self::now_millis();
        let kind = item.queue();
        let table = Self::table(kind);
        debug!(target: "durafan::providers::sqlite", instance = %item.instance(), ?item, "enqueue");

        let sql = match kind {
            // A visible, unleased trigger for the same instance already covers this one.
            QueueKind::Orchestrator => format!(
                "INSERT INTO {table} (instance_id, work_item, visible_at) \
                 SELECT ?1, ?2, ?3 WHERE NOT EXISTS \
                 (SELECT 1 FROM {table} WHERE instance_id = ?1 AND lock_token IS NULL AND visible_at <= ?3)"
            ),
            QueueKind::Worker => format!("INSERT INTO {table} (instance_id, work_item, visible_at) VALUES (?1, ?2, ?3)"),
        };
        sqlx::query(&sql)
            .bind(item.instance())
            .bind(work_item)
            .bind(now)
            .execute(&mut *conn)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
        Ok(())
    }

    async fn load_record(
        conn: &mut SqliteConnection,
        operation: &str,
        instance: &str,
    ) -> Result<Option<InstanceRecord>, ProviderError> {
        let row = sqlx::query(
            "SELECT instance_id, orchestration, input, status, output, created_at, updated_at \
             FROM instances WHERE instance_id = ?",
        )
        .bind(instance)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let get = |col: &str| -> Result<String, ProviderError> {
            row.try_get::<String, _>(col)
                .map_err(|e| Self::sqlx_to_provider_error(operation, e))
        };
        let status_raw = get("status")?;
        let status = InstanceStatus::parse(&status_raw)
            .ok_or_else(|| ProviderError::permanent(operation, format!("unknown status '{status_raw}'")))?;
        let output: Option<String> = row
            .try_get("output")
            .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
        Ok(Some(InstanceRecord {
            instance_id: get("instance_id")?,
            orchestration: get("orchestration")?,
            input: get("input")?,
            status,
            output,
            created_at: Self::parse_time(operation, &get("created_at")?)?,
            updated_at: Self::parse_time(operation, &get("updated_at")?)?,
        }))
    }
}

#[async_trait::async_trait]
impl HistoryStore for SqliteProvider {
    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("read", e))?;
        Self::read_history(&mut conn, "read", instance).await
    }

    async fn append(&self, instance: &str, expected_seq: u64, events: Vec<Event>) -> Result<u64, ProviderError> {
        self.commit(instance, expected_seq, events, Vec::new(), ExecutionMetadata::default())
            .await
    }

    async fn create_instance(&self, record: InstanceRecord, initial: Vec<Event>) -> Result<(), ProviderError> {
        self.start_instance(record, initial, Vec::new()).await
    }

    async fn instance(&self, instance: &str) -> Result<Option<InstanceRecord>, ProviderError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("instance", e))?;
        Self::load_record(&mut conn, "instance", instance).await
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        sqlx::query_scalar::<_, String>("SELECT instance_id FROM instances ORDER BY instance_id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("list_instances", e))
    }
}

#[async_trait::async_trait]
impl WorkQueue for SqliteProvider {
    async fn enqueue(&self, item: WorkItem) -> Result<(), ProviderError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("enqueue", e))?;
        Self::insert_work_item(&mut conn, "enqueue", &item).await
    }

    async fn dequeue(&self, kind: QueueKind, lease: Duration) -> Result<Option<LeasedItem>, ProviderError> {
        let table = Self::table(kind);
        let lock_token = Self::generate_lock_token();
        let now = Self::now_millis();
        // Single statement, so two workers can never lease the same row.
        let row = sqlx::query(&format!(
            "UPDATE {table} SET lock_token = ?1, locked_until = ?2, attempt_count = attempt_count + 1 \
             WHERE id = (SELECT id FROM {table} \
                         WHERE visible_at <= ?3 AND (lock_token IS NULL OR locked_until <= ?3) \
                         ORDER BY id LIMIT 1) \
             RETURNING work_item, attempt_count"
        ))
        .bind(&lock_token)
        .bind(Self::timestamp_after(lease))
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("dequeue", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let raw: String = row
            .try_get("work_item")
            .map_err(|e| Self::sqlx_to_provider_error("dequeue", e))?;
        let attempts: i64 = row
            .try_get("attempt_count")
            .map_err(|e| Self::sqlx_to_provider_error("dequeue", e))?;
        let item: WorkItem = serde_json::from_str(&raw)
            .map_err(|e| ProviderError::permanent("dequeue", format!("corrupt work item: {e}")))?;
        Ok(Some(LeasedItem {
            item,
            lock_token,
            attempt_count: u32::try_from(attempts).unwrap_or(u32::MAX),
        }))
    }

    async fn ack(&self, kind: QueueKind, lock_token: &str) -> Result<(), ProviderError> {
        let table = Self::table(kind);
        let result = sqlx::query(&format!("DELETE FROM {table} WHERE lock_token = ? AND locked_until > ?"))
            .bind(lock_token)
            .bind(Self::now_millis())
            .execute(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("ack", e))?;
        if result.rows_affected() == 0 {
            return Err(ProviderError::not_found(
                "ack",
                format!("no live {} lease for token {lock_token}", kind.as_str()),
            ));
        }
        Ok(())
    }

    async fn abandon(&self, kind: QueueKind, lock_token: &str, delay: Option<Duration>) -> Result<(), ProviderError> {
        let table = Self::table(kind);
        let result = sqlx::query(&format!(
            "UPDATE {table} SET lock_token = NULL, locked_until = NULL, visible_at = ? \
             WHERE lock_token = ? AND locked_until > ?"
        ))
        .bind(Self::timestamp_after(delay.unwrap_or_default()))
        .bind(lock_token)
        .bind(Self::now_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("abandon", e))?;
        if result.rows_affected() == 0 {
            return Err(ProviderError::not_found("abandon", format!("no live lease for token {lock_token}")));
        }
        Ok(())
    }

    async fn renew_lease(&self, kind: QueueKind, lock_token: &str, extend_for: Duration) -> Result<(), ProviderError> {
        let table = Self::table(kind);
        let result = sqlx::query(&format!(
            "UPDATE {table} SET locked_until = ? WHERE lock_token = ? AND locked_until > ?"
        ))
        .bind(Self::timestamp_after(extend_for))
        .bind(lock_token)
        .bind(Self::now_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("renew_lease", e))?;
        if result.rows_affected() == 0 {
            return Err(ProviderError::not_found(
                "renew_lease",
                format!("no live lease for token {lock_token}"),
            ));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Provider for SqliteProvider {
    async fn start_instance(
        &self,
        record: InstanceRecord,
        initial: Vec<Event>,
        work_items: Vec<WorkItem>,
    ) -> Result<(), ProviderError> {
        let op = "start_instance";
        check_append(op, &record.instance_id, &[], 0, &initial)?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error(op, e))?;

        let inserted = sqlx::query(
            "INSERT INTO instances (instance_id, orchestration, input, status, output, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) ON CONFLICT(instance_id) DO NOTHING",
        )
        .bind(&record.instance_id)
        .bind(&record.orchestration)
        .bind(&record.input)
        .bind(record.status.as_str())
        .bind(&record.output)
        .bind(record.created_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        if inserted.rows_affected() == 0 {
            return Err(ProviderError::already_exists(
                op,
                format!("instance {} already exists", record.instance_id),
            ));
        }

        Self::insert_events(&mut tx, op, &record.instance_id, 0, &initial).await?;
        for item in &work_items {
            Self::insert_work_item(&mut tx, op, item).await?;
        }
        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        Ok(())
    }

    async fn commit(
        &self,
        instance: &str,
        expected_seq: u64,
        events: Vec<Event>,
        work_items: Vec<WorkItem>,
        metadata: ExecutionMetadata,
    ) -> Result<u64, ProviderError> {
        let op = "commit";
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error(op, e))?;

        // Take the write lock before reading so the sequence check cannot go stale.
        let touched = sqlx::query("UPDATE instances SET updated_at = updated_at WHERE instance_id = ?")
            .bind(instance)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        if touched.rows_affected() == 0 {
            return Err(ProviderError::not_found(op, format!("instance {instance} not found")));
        }

        let existing = Self::read_history(&mut tx, op, instance).await?;
        check_append(op, instance, &existing, expected_seq, &events)?;
        Self::insert_events(&mut tx, op, instance, expected_seq, &events).await?;
        for item in &work_items {
            Self::insert_work_item(&mut tx, op, item).await?;
        }

        if metadata.status.is_some() {
            let mut record = Self::load_record(&mut tx, op, instance)
                .await?
                .ok_or_else(|| ProviderError::not_found(op, format!("instance {instance} not found")))?;
            if record.apply(&metadata) {
                sqlx::query("UPDATE instances SET status = ?, output = ?, updated_at = ? WHERE instance_id = ?")
                    .bind(record.status.as_str())
                    .bind(&record.output)
                    .bind(record.updated_at.to_rfc3339())
                    .bind(instance)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| Self::sqlx_to_provider_error(op, e))?;
            }
        }

        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(op, e))?;
        Ok(expected_seq + events.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started() -> Event {
        Event::OrchestratorStarted {
            name: "O".to_string(),
            input: "in".to_string(),
        }
    }

    #[tokio::test]
    async fn test_history_roundtrip_and_conflict() {
        let store = SqliteProvider::new_in_memory().await.unwrap();
        store
            .start_instance(InstanceRecord::new("i", "O", "in"), vec![started()], vec![])
            .await
            .unwrap();
        let sched = Event::ActivityScheduled {
            task_id: 0,
            name: "A".to_string(),
            input: "x".to_string(),
        };
        assert_eq!(store.append("i", 1, vec![sched.clone()]).await.unwrap(), 2);
        let err = store
            .append(
                "i",
                1,
                vec![Event::ActivityCompleted {
                    task_id: 0,
                    result: "r".to_string(),
                }],
            )
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.read("i").await.unwrap(), vec![started(), sched]);
    }

    #[tokio::test]
    async fn test_duplicate_instance_rejected() {
        let store = SqliteProvider::new_in_memory().await.unwrap();
        store
            .start_instance(InstanceRecord::new("dup", "O", ""), vec![started()], vec![])
            .await
            .unwrap();
        let err = store
            .start_instance(InstanceRecord::new("dup", "O", ""), vec![started()], vec![])
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::providers::ProviderErrorKind::AlreadyExists);
        assert_eq!(store.list_instances().await.unwrap(), vec!["dup".to_string()]);
    }

    #[tokio::test]
    async fn test_commit_updates_status_projection() {
        let store = SqliteProvider::new_in_memory().await.unwrap();
        store
            .start_instance(InstanceRecord::new("s", "O", "in"), vec![started()], vec![])
            .await
            .unwrap();
        store
            .commit(
                "s",
                1,
                vec![Event::OrchestratorCompleted {
                    output: "done".to_string(),
                }],
                vec![],
                ExecutionMetadata::finished(InstanceStatus::Completed, "done"),
            )
            .await
            .unwrap();
        let record = store.instance("s").await.unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Completed);
        assert_eq!(record.output.as_deref(), Some("done"));
        assert_eq!(record.input, "in");
        assert!(store.instance("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_queue_lease_lifecycle() {
        let store = SqliteProvider::new_in_memory().await.unwrap();
        let item = WorkItem::ActivityExecute {
            instance: "i".to_string(),
            task_id: 3,
            name: "A".to_string(),
            input: "payload".to_string(),
        };
        store.enqueue(item.clone()).await.unwrap();

        let first = store
            .dequeue(QueueKind::Worker, Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.item, item);
        assert_eq!(first.attempt_count, 1);
        assert!(
            store
                .dequeue(QueueKind::Worker, Duration::from_secs(5))
                .await
                .unwrap()
                .is_none()
        );

        tokio::time::sleep(Duration::from_millis(80)).await;
        let second = store
            .dequeue(QueueKind::Worker, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.attempt_count, 2);
        assert!(store.ack(QueueKind::Worker, &first.lock_token).await.is_err());
        store
            .renew_lease(QueueKind::Worker, &second.lock_token, Duration::from_secs(5))
            .await
            .unwrap();
        store.ack(QueueKind::Worker, &second.lock_token).await.unwrap();
        assert!(
            store
                .dequeue(QueueKind::Worker, Duration::from_secs(5))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("store.db").display());
        {
            let store = SqliteProvider::new(&url).await.unwrap();
            store
                .start_instance(
                    InstanceRecord::new("p", "O", "in"),
                    vec![started()],
                    vec![WorkItem::OrchestratorTrigger {
                        instance: "p".to_string(),
                    }],
                )
                .await
                .unwrap();
        }
        let reopened = SqliteProvider::new(&url).await.unwrap();
        assert_eq!(reopened.read("p").await.unwrap(), vec![started()]);
        let leased = reopened
            .dequeue(QueueKind::Orchestrator, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leased.item.instance(), "p");
    }
}
