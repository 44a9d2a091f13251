//! In-process store. Nothing survives a restart.
//!
//! Can be switched "offline" to simulate an unreachable persistence layer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use warden_core::error::{Result, WardenError};
use warden_core::traits::Store;
use warden_core::types::{
    AlertRecord, DeadLetter, DeadLetterFilter, DeadLetterStats, DeadLetterStatus, ErrorRecord,
    HealthRecord, MetricsSnapshot,
};

#[derive(Default)]
struct Tables {
    errors: Vec<ErrorRecord>,
    alerts: Vec<AlertRecord>,
    dead_letters: Vec<DeadLetter>,
    health: Vec<HealthRecord>,
    metrics: Vec<MetricsSnapshot>,
}

/// Memory-backed store.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// When offline, every operation fails with a database error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(WardenError::Database("memory store is offline".into()));
        }
        self.tables
            .lock()
            .map_err(|e| WardenError::Database(format!("Lock: {e}")))
    }

    /// Number of rows per table: (errors, alerts, dead letters, health, metrics).
    pub fn row_counts(&self) -> (usize, usize, usize, usize, usize) {
        let t = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        (
            t.errors.len(),
            t.alerts.len(),
            t.dead_letters.len(),
            t.health.len(),
            t.metrics.len(),
        )
    }
}

fn newest_first<T: Clone>(rows: &[T], keep: impl Fn(&T) -> bool, limit: usize) -> Vec<T> {
    let iter = rows.iter().rev().filter(|r| keep(r)).cloned();
    if limit == 0 {
        iter.collect()
    } else {
        iter.take(limit).collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn ping(&self) -> Result<()> {
        self.tables().map(|_| ())
    }

    async fn insert_error(&self, record: &ErrorRecord) -> Result<()> {
        self.tables()?.errors.push(record.clone());
        Ok(())
    }

    async fn insert_alert(&self, record: &AlertRecord) -> Result<()> {
        self.tables()?.alerts.push(record.clone());
        Ok(())
    }

    async fn list_errors(&self, agent: Option<&str>, limit: usize) -> Result<Vec<ErrorRecord>> {
        let t = self.tables()?;
        Ok(newest_first(
            &t.errors,
            |r| agent.is_none_or(|a| r.agent == a),
            limit,
        ))
    }

    async fn list_alerts(&self, agent: Option<&str>, limit: usize) -> Result<Vec<AlertRecord>> {
        let t = self.tables()?;
        Ok(newest_first(
            &t.alerts,
            |r| agent.is_none_or(|a| r.agent == a),
            limit,
        ))
    }

    async fn insert_dead_letter(&self, entry: &DeadLetter) -> Result<()> {
        let mut t = self.tables()?;
        if t.dead_letters.iter().any(|e| e.id == entry.id) {
            return Err(WardenError::Database(format!(
                "duplicate dead letter id {}",
                entry.id
            )));
        }
        t.dead_letters.push(entry.clone());
        Ok(())
    }

    async fn update_dead_letter(&self, entry: &DeadLetter) -> Result<()> {
        let mut t = self.tables()?;
        let slot = t
            .dead_letters
            .iter_mut()
            .find(|e| e.id == entry.id)
            .ok_or_else(|| WardenError::DeadLetterNotFound(entry.id.clone()))?;
        slot.error = entry.error.clone();
        slot.retry_count = entry.retry_count;
        slot.max_retries = entry.max_retries;
        slot.next_retry = entry.next_retry;
        slot.status = entry.status;
        slot.updated_at = entry.updated_at;
        Ok(())
    }

    async fn get_dead_letter(&self, id: &str) -> Result<Option<DeadLetter>> {
        let t = self.tables()?;
        Ok(t.dead_letters.iter().find(|e| e.id == id).cloned())
    }

    async fn due_dead_letters(
        &self,
        agents: &[String],
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeadLetter>> {
        let t = self.tables()?;
        let mut due: Vec<DeadLetter> = t
            .dead_letters
            .iter()
            .filter(|e| agents.iter().any(|a| *a == e.agent) && e.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|e| e.next_retry);
        if limit > 0 {
            due.truncate(limit);
        }
        Ok(due)
    }

    async fn list_dead_letters(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetter>> {
        let t = self.tables()?;
        let mut rows: Vec<DeadLetter> = t
            .dead_letters
            .iter()
            .filter(|e| filter.status.is_none_or(|s| e.status == s))
            .filter(|e| filter.agent.as_ref().is_none_or(|a| e.agent == *a))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if filter.limit > 0 {
            rows.truncate(filter.limit);
        }
        Ok(rows)
    }

    async fn reset_stale_dead_letters(
        &self,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut t = self.tables()?;
        let mut n = 0;
        for e in t
            .dead_letters
            .iter_mut()
            .filter(|e| e.status == DeadLetterStatus::Retrying && e.updated_at <= older_than)
        {
            e.status = DeadLetterStatus::Pending;
            e.updated_at = now;
            n += 1;
        }
        Ok(n)
    }

    async fn delete_dead_letters(
        &self,
        status: DeadLetterStatus,
        older_than: DateTime<Utc>,
    ) -> Result<usize> {
        let mut t = self.tables()?;
        let before = t.dead_letters.len();
        t.dead_letters
            .retain(|e| !(e.status == status && e.updated_at < older_than));
        Ok(before - t.dead_letters.len())
    }

    async fn dead_letter_stats(&self) -> Result<DeadLetterStats> {
        let t = self.tables()?;
        let mut stats = DeadLetterStats::default();
        for e in &t.dead_letters {
            stats.add(e.status, 1);
        }
        Ok(stats)
    }

    async fn insert_health(&self, record: &HealthRecord) -> Result<()> {
        self.tables()?.health.push(record.clone());
        Ok(())
    }

    async fn latest_health(&self, agent: &str) -> Result<Option<HealthRecord>> {
        let t = self.tables()?;
        Ok(t.health
            .iter()
            .filter(|h| h.agent == agent)
            .max_by_key(|h| h.timestamp)
            .cloned())
    }

    async fn insert_metrics(&self, snapshot: &MetricsSnapshot) -> Result<()> {
        self.tables()?.metrics.push(snapshot.clone());
        Ok(())
    }

    async fn latest_metrics(&self, agent: &str) -> Result<Option<MetricsSnapshot>> {
        let t = self.tables()?;
        Ok(t.metrics
            .iter()
            .filter(|m| m.agent == agent)
            .max_by_key(|m| m.timestamp)
            .cloned())
    }
}
