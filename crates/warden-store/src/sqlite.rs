//! SQLite-backed persistence for errors, alerts, dead letters, health, and metrics.
//! Survives restarts; several processes may poll the same file (WAL mode).

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use warden_core::error::{Result, WardenError};
use warden_core::traits::Store;
use warden_core::types::{
    AlertRecord, DeadLetter, DeadLetterError, DeadLetterFilter, DeadLetterStats,
    DeadLetterStatus, ErrorRecord, HealthRecord, MetricsSnapshot,
};

const DEAD_LETTER_COLUMNS: &str = "id, agent, operation, payload, error, retry_count, max_retries, next_retry, status, created_at, updated_at";

/// SQLite persistence store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database file.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(|e| db_err("DB open", e))?;

        // WAL lets a CLI read while an agent process writes
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        tracing::debug!("💾 SQLite store opened at {}", path.display());
        Ok(store)
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| db_err("DB open", e))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| WardenError::Database(format!("Lock: {e}")))
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS agent_errors (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent TEXT NOT NULL,
                error_type TEXT NOT NULL,
                error_code TEXT,
                message TEXT NOT NULL,
                severity TEXT NOT NULL,
                context TEXT NOT NULL DEFAULT '{}',  -- JSON object
                stack TEXT,
                timestamp TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS agent_alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent TEXT NOT NULL,
                alert_type TEXT NOT NULL,
                severity TEXT NOT NULL,
                message TEXT NOT NULL,
                context TEXT NOT NULL DEFAULT '{}',
                timestamp TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS dead_letter_queue (
                id TEXT PRIMARY KEY,
                agent TEXT NOT NULL,
                operation TEXT NOT NULL,
                payload TEXT NOT NULL,           -- opaque JSON
                error TEXT NOT NULL,             -- JSON: {message, stack, code}
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL,
                next_retry TEXT,
                status TEXT NOT NULL DEFAULT 'pending',  -- pending, retrying, failed, resolved
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_dlq_due ON dead_letter_queue (status, next_retry);

            CREATE TABLE IF NOT EXISTS agent_health (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent TEXT NOT NULL,
                status TEXT NOT NULL,            -- healthy, degraded, unhealthy
                details TEXT NOT NULL DEFAULT '{}',
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_health_agent ON agent_health (agent, timestamp);

            CREATE TABLE IF NOT EXISTS agent_metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent TEXT NOT NULL,
                success_count INTEGER NOT NULL,
                error_count INTEGER NOT NULL,
                warning_count INTEGER NOT NULL,
                processing_time_ms INTEGER NOT NULL,
                memory_usage_mb REAL NOT NULL,
                custom TEXT NOT NULL DEFAULT '{}',
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_metrics_agent ON agent_metrics (agent, timestamp);
            ",
        )
        .map_err(|e| db_err("Migration", e))?;
        Ok(())
    }
}

#[async_trait]
impl Store for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn ping(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0))
            .map_err(|e| db_err("Ping", e))?;
        Ok(())
    }

    // ─── Errors & Alerts ──────────────────────────────────

    async fn insert_error(&self, record: &ErrorRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO agent_errors (agent, error_type, error_code, message, severity, context, stack, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.agent,
                record.error_type.as_str(),
                record.error_code,
                record.message,
                record.severity.as_str(),
                record.context.to_string(),
                record.stack,
                ts(record.timestamp),
            ],
        )
        .map_err(|e| db_err("Insert error", e))?;
        Ok(())
    }

    async fn insert_alert(&self, record: &AlertRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO agent_alerts (agent, alert_type, severity, message, context, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.agent,
                record.alert_type,
                record.severity.as_str(),
                record.message,
                record.context.to_string(),
                ts(record.timestamp),
            ],
        )
        .map_err(|e| db_err("Insert alert", e))?;
        Ok(())
    }

    async fn list_errors(&self, agent: Option<&str>, limit: usize) -> Result<Vec<ErrorRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT agent, error_type, error_code, message, severity, context, stack, timestamp
                 FROM agent_errors WHERE (?1 IS NULL OR agent = ?1)
                 ORDER BY id DESC LIMIT ?2",
            )
            .map_err(|e| db_err("List errors", e))?;
        let rows = stmt
            .query_map(params![agent, sql_limit(limit)], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })
            .map_err(|e| db_err("List errors", e))?;

        let mut out = Vec::new();
        for row in rows {
            let (agent, kind, code, message, severity, context, stack, at) =
                row.map_err(|e| db_err("Read error row", e))?;
            out.push(ErrorRecord {
                agent,
                error_type: kind.parse()?,
                error_code: code,
                message,
                severity: severity.parse()?,
                context: serde_json::from_str(&context)?,
                stack,
                timestamp: parse_ts(&at)?,
            });
        }
        Ok(out)
    }

    async fn list_alerts(&self, agent: Option<&str>, limit: usize) -> Result<Vec<AlertRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT agent, alert_type, severity, message, context, timestamp
                 FROM agent_alerts WHERE (?1 IS NULL OR agent = ?1)
                 ORDER BY id DESC LIMIT ?2",
            )
            .map_err(|e| db_err("List alerts", e))?;
        let rows = stmt
            .query_map(params![agent, sql_limit(limit)], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .map_err(|e| db_err("List alerts", e))?;

        let mut out = Vec::new();
        for row in rows {
            let (agent, alert_type, severity, message, context, at) =
                row.map_err(|e| db_err("Read alert row", e))?;
            out.push(AlertRecord {
                agent,
                alert_type,
                severity: severity.parse()?,
                message,
                context: serde_json::from_str(&context)?,
                timestamp: parse_ts(&at)?,
            });
        }
        Ok(out)
    }

    // ─── Dead Letters ─────────────────────────────────────

    async fn insert_dead_letter(&self, entry: &DeadLetter) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO dead_letter_queue ({DEAD_LETTER_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            params![
                entry.id,
                entry.agent,
                entry.operation,
                entry.payload.to_string(),
                serde_json::to_string(&entry.error)?,
                entry.retry_count,
                entry.max_retries,
                entry.next_retry.map(ts),
                entry.status.as_str(),
                ts(entry.created_at),
                ts(entry.updated_at),
            ],
        )
        .map_err(|e| db_err("Insert dead letter", e))?;
        Ok(())
    }

    async fn update_dead_letter(&self, entry: &DeadLetter) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE dead_letter_queue
                 SET error = ?2, retry_count = ?3, max_retries = ?4, next_retry = ?5, status = ?6, updated_at = ?7
                 WHERE id = ?1",
                params![
                    entry.id,
                    serde_json::to_string(&entry.error)?,
                    entry.retry_count,
                    entry.max_retries,
                    entry.next_retry.map(ts),
                    entry.status.as_str(),
                    ts(entry.updated_at),
                ],
            )
            .map_err(|e| db_err("Update dead letter", e))?;
        if changed == 0 {
            return Err(WardenError::DeadLetterNotFound(entry.id.clone()));
        }
        Ok(())
    }

    async fn get_dead_letter(&self, id: &str) -> Result<Option<DeadLetter>> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                &format!("SELECT {DEAD_LETTER_COLUMNS} FROM dead_letter_queue WHERE id = ?1"),
                params![id],
                raw_dead_letter,
            )
            .optional()
            .map_err(|e| db_err("Get dead letter", e))?;
        raw.map(RawDeadLetter::into_entry).transpose()
    }

    async fn due_dead_letters(
        &self,
        agents: &[String],
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeadLetter>> {
        if agents.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = (0..agents.len())
            .map(|i| format!("?{}", i + 3))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letter_queue
             WHERE status IN ('pending', 'retrying')
               AND next_retry IS NOT NULL AND next_retry <= ?1
               AND agent IN ({placeholders})
             ORDER BY next_retry ASC LIMIT ?2"
        );

        let mut bind: Vec<rusqlite::types::Value> = vec![
            rusqlite::types::Value::Text(ts(now)),
            rusqlite::types::Value::Integer(sql_limit(limit)),
        ];
        bind.extend(agents.iter().cloned().map(rusqlite::types::Value::Text));

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql).map_err(|e| db_err("Due dead letters", e))?;
        let rows = stmt
            .query_map(params_from_iter(bind), raw_dead_letter)
            .map_err(|e| db_err("Due dead letters", e))?;
        collect_dead_letters(rows)
    }

    async fn list_dead_letters(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetter>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letter_queue
                 WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR agent = ?2)
                 ORDER BY created_at DESC LIMIT ?3"
            ))
            .map_err(|e| db_err("List dead letters", e))?;
        let rows = stmt
            .query_map(
                params![
                    filter.status.map(|s| s.as_str()),
                    filter.agent,
                    sql_limit(filter.limit),
                ],
                raw_dead_letter,
            )
            .map_err(|e| db_err("List dead letters", e))?;
        collect_dead_letters(rows)
    }

    async fn reset_stale_dead_letters(
        &self,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let conn = self.lock()?;
        let n = conn
            .execute(
                "UPDATE dead_letter_queue SET status = 'pending', updated_at = ?2
                 WHERE status = 'retrying' AND updated_at <= ?1",
                params![ts(older_than), ts(now)],
            )
            .map_err(|e| db_err("Reset stale dead letters", e))?;
        Ok(n)
    }

    async fn delete_dead_letters(
        &self,
        status: DeadLetterStatus,
        older_than: DateTime<Utc>,
    ) -> Result<usize> {
        let conn = self.lock()?;
        let n = conn
            .execute(
                "DELETE FROM dead_letter_queue WHERE status = ?1 AND updated_at < ?2",
                params![status.as_str(), ts(older_than)],
            )
            .map_err(|e| db_err("Delete dead letters", e))?;
        Ok(n)
    }

    async fn dead_letter_stats(&self) -> Result<DeadLetterStats> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM dead_letter_queue GROUP BY status")
            .map_err(|e| db_err("Dead letter stats", e))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(|e| db_err("Dead letter stats", e))?;

        let mut stats = DeadLetterStats::default();
        for row in rows {
            let (status, count) = row.map_err(|e| db_err("Dead letter stats", e))?;
            stats.add(status.parse()?, count.max(0) as u64);
        }
        Ok(stats)
    }

    // ─── Health & Metrics ─────────────────────────────────

    async fn insert_health(&self, record: &HealthRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO agent_health (agent, status, details, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![
                record.agent,
                record.status.as_str(),
                record.details.to_string(),
                ts(record.timestamp),
            ],
        )
        .map_err(|e| db_err("Insert health", e))?;
        Ok(())
    }

    async fn latest_health(&self, agent: &str) -> Result<Option<HealthRecord>> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                "SELECT agent, status, details, timestamp FROM agent_health
                 WHERE agent = ?1 ORDER BY timestamp DESC, id DESC LIMIT 1",
                params![agent],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| db_err("Latest health", e))?;

        match raw {
            Some((agent, status, details, at)) => Ok(Some(HealthRecord {
                agent,
                status: status.parse()?,
                details: serde_json::from_str(&details)?,
                timestamp: parse_ts(&at)?,
            })),
            None => Ok(None),
        }
    }

    async fn insert_metrics(&self, snapshot: &MetricsSnapshot) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO agent_metrics
             (agent, success_count, error_count, warning_count, processing_time_ms, memory_usage_mb, custom, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                snapshot.agent,
                to_sql_int(snapshot.success_count),
                to_sql_int(snapshot.error_count),
                to_sql_int(snapshot.warning_count),
                to_sql_int(snapshot.processing_time_ms),
                snapshot.memory_usage_mb,
                serde_json::to_string(&snapshot.custom)?,
                ts(snapshot.timestamp),
            ],
        )
        .map_err(|e| db_err("Insert metrics", e))?;
        Ok(())
    }

    async fn latest_metrics(&self, agent: &str) -> Result<Option<MetricsSnapshot>> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                "SELECT agent, success_count, error_count, warning_count, processing_time_ms,
                        memory_usage_mb, custom, timestamp
                 FROM agent_metrics WHERE agent = ?1 ORDER BY timestamp DESC, id DESC LIMIT 1",
                params![agent],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, f64>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| db_err("Latest metrics", e))?;

        match raw {
            Some((agent, success, errors, warnings, processing, memory, custom, at)) => {
                Ok(Some(MetricsSnapshot {
                    agent,
                    success_count: success.max(0) as u64,
                    error_count: errors.max(0) as u64,
                    warning_count: warnings.max(0) as u64,
                    processing_time_ms: processing.max(0) as u64,
                    memory_usage_mb: memory,
                    custom: serde_json::from_str(&custom)?,
                    timestamp: parse_ts(&at)?,
                }))
            }
            None => Ok(None),
        }
    }
}

// ─── Row mapping ──────────────────────────────────────────

/// Dead-letter columns as stored, before parsing.
struct RawDeadLetter {
    id: String,
    agent: String,
    operation: String,
    payload: String,
    error: String,
    retry_count: u32,
    max_retries: u32,
    next_retry: Option<String>,
    status: String,
    created_at: String,
    updated_at: String,
}

impl RawDeadLetter {
    fn into_entry(self) -> Result<DeadLetter> {
        let error: DeadLetterError = serde_json::from_str(&self.error)?;
        Ok(DeadLetter {
            id: self.id,
            agent: self.agent,
            operation: self.operation,
            payload: serde_json::from_str(&self.payload)?,
            error,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            next_retry: self.next_retry.as_deref().map(parse_ts).transpose()?,
            status: self.status.parse()?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

fn raw_dead_letter(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawDeadLetter> {
    Ok(RawDeadLetter {
        id: row.get(0)?,
        agent: row.get(1)?,
        operation: row.get(2)?,
        payload: row.get(3)?,
        error: row.get(4)?,
        retry_count: row.get(5)?,
        max_retries: row.get(6)?,
        next_retry: row.get(7)?,
        status: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn collect_dead_letters(
    rows: impl Iterator<Item = rusqlite::Result<RawDeadLetter>>,
) -> Result<Vec<DeadLetter>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| db_err("Read dead letter row", e))?.into_entry()?);
    }
    Ok(out)
}

/// Fixed-width UTC timestamp so TEXT comparison matches time order.
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| WardenError::Database(format!("Bad timestamp '{s}': {e}")))
}

/// SQLite treats a negative LIMIT as unlimited.
fn sql_limit(limit: usize) -> i64 {
    if limit == 0 {
        -1
    } else {
        i64::try_from(limit).unwrap_or(i64::MAX)
    }
}

fn to_sql_int(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn db_err(what: &str, e: impl std::fmt::Display) -> WardenError {
    WardenError::Database(format!("{what}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use warden_core::types::{AgentError, HealthStatus};

    fn entry(agent: &str, next_retry: DateTime<Utc>, now: DateTime<Utc>) -> DeadLetter {
        DeadLetter::new(
            agent,
            "score_message",
            serde_json::json!({"message_id": 42}),
            DeadLetterError::from(&AgentError::database("database timeout")),
            3,
            next_retry,
            now,
        )
    }

    #[tokio::test]
    async fn test_open_and_migrate() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("warden.db")).unwrap();
        store.ping().await.unwrap();
        assert_eq!(store.dead_letter_stats().await.unwrap().total(), 0);

        // Reopening runs migrations again without error
        drop(store);
        SqliteStore::open(&dir.path().join("warden.db")).unwrap();
    }

    #[tokio::test]
    async fn test_dead_letter_insert_get_update() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        let mut e = entry("scorer", now, now);
        store.insert_dead_letter(&e).await.unwrap();

        let loaded = store.get_dead_letter(&e.id).await.unwrap().unwrap();
        assert_eq!(loaded.payload["message_id"], 42);
        assert_eq!(loaded.error.message, "database timeout");
        assert_eq!(loaded.status, DeadLetterStatus::Pending);

        e.status = DeadLetterStatus::Resolved;
        e.retry_count = 2;
        store.update_dead_letter(&e).await.unwrap();
        let loaded = store.get_dead_letter(&e.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, DeadLetterStatus::Resolved);
        assert_eq!(loaded.retry_count, 2);
    }

    #[tokio::test]
    async fn test_update_unknown_id_fails() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        let e = entry("scorer", now, now);
        let err = store.update_dead_letter(&e).await.unwrap_err();
        assert!(matches!(err, WardenError::DeadLetterNotFound(_)));
    }

    #[tokio::test]
    async fn test_due_orders_by_next_retry_and_filters() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        let later = entry("scorer", now - Duration::seconds(10), now);
        let earlier = entry("scorer", now - Duration::seconds(60), now);
        let future = entry("scorer", now + Duration::seconds(60), now);
        let other_agent = entry("onboarding", now - Duration::seconds(30), now);
        let mut done = entry("scorer", now - Duration::seconds(90), now);
        done.status = DeadLetterStatus::Failed;
        for e in [&later, &earlier, &future, &other_agent, &done] {
            store.insert_dead_letter(e).await.unwrap();
        }

        let due = store
            .due_dead_letters(&["scorer".to_string()], now, 10)
            .await
            .unwrap();
        let ids: Vec<_> = due.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec![earlier.id.as_str(), later.id.as_str()]);

        let due = store
            .due_dead_letters(&["scorer".to_string(), "onboarding".to_string()], now, 2)
            .await
            .unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[1].id, other_agent.id);

        assert!(store.due_dead_letters(&[], now, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reset_stale_and_purge() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        let mut stuck = entry("scorer", now, now - Duration::minutes(30));
        stuck.status = DeadLetterStatus::Retrying;
        let mut fresh = entry("scorer", now, now);
        fresh.status = DeadLetterStatus::Retrying;
        let mut resolved = entry("scorer", now, now - Duration::days(10));
        resolved.status = DeadLetterStatus::Resolved;
        for e in [&stuck, &fresh, &resolved] {
            store.insert_dead_letter(e).await.unwrap();
        }

        let reset = store
            .reset_stale_dead_letters(now - Duration::minutes(5), now)
            .await
            .unwrap();
        assert_eq!(reset, 1);
        let stats = store.dead_letter_stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.retrying, 1);

        let purged = store
            .delete_dead_letters(DeadLetterStatus::Resolved, now - Duration::days(7))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(store.dead_letter_stats().await.unwrap().total(), 2);
    }

    #[tokio::test]
    async fn test_errors_alerts_health_metrics() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        let err = AgentError::database("database timeout");
        store
            .insert_error(&ErrorRecord::from_error("scorer", &err, "tick", now))
            .await
            .unwrap();
        store
            .insert_alert(&AlertRecord {
                agent: "scorer".into(),
                alert_type: "error_escalation".into(),
                severity: err.severity,
                message: err.message.clone(),
                context: serde_json::json!({}),
                timestamp: now,
            })
            .await
            .unwrap();
        assert_eq!(store.list_errors(Some("scorer"), 10).await.unwrap().len(), 1);
        assert_eq!(store.list_alerts(None, 0).await.unwrap().len(), 1);
        assert!(store.list_errors(Some("other"), 10).await.unwrap().is_empty());

        for (offset, status) in [(60, HealthStatus::Healthy), (0, HealthStatus::Unhealthy)] {
            store
                .insert_health(&HealthRecord {
                    agent: "scorer".into(),
                    status,
                    details: serde_json::json!({"error_count": 10}),
                    timestamp: now - Duration::seconds(offset),
                })
                .await
                .unwrap();
        }
        let latest = store.latest_health("scorer").await.unwrap().unwrap();
        assert_eq!(latest.status, HealthStatus::Unhealthy);
        assert!(store.latest_health("nobody").await.unwrap().is_none());

        store
            .insert_metrics(&MetricsSnapshot {
                agent: "scorer".into(),
                success_count: 5,
                error_count: 10,
                warning_count: 1,
                processing_time_ms: 1234,
                memory_usage_mb: 12.5,
                custom: Default::default(),
                timestamp: now,
            })
            .await
            .unwrap();
        let m = store.latest_metrics("scorer").await.unwrap().unwrap();
        assert_eq!(m.error_count, 10);
        assert_eq!(m.processing_time_ms, 1234);
    }
}
