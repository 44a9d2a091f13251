//! Persistence contract.
//!
//! The framework only needs insert, update-by-id, filtered/ordered/limited
//! select, and delete-by-filter against its tables:
//! `agent_errors`, `agent_alerts`, `dead_letter_queue`, `agent_health`,
//! `agent_metrics`. Each operation below maps to one of those.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{
    AlertRecord, DeadLetter, DeadLetterFilter, DeadLetterStats, DeadLetterStatus, ErrorRecord,
    HealthRecord, MetricsSnapshot,
};

#[async_trait]
pub trait Store: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Cheap reachability probe used by health checks.
    async fn ping(&self) -> Result<()>;

    // ─── agent_errors / agent_alerts ─────────────────────

    async fn insert_error(&self, record: &ErrorRecord) -> Result<()>;

    async fn insert_alert(&self, record: &AlertRecord) -> Result<()>;

    /// Newest first.
    async fn list_errors(&self, agent: Option<&str>, limit: usize) -> Result<Vec<ErrorRecord>>;

    /// Newest first.
    async fn list_alerts(&self, agent: Option<&str>, limit: usize) -> Result<Vec<AlertRecord>>;

    // ─── dead_letter_queue ───────────────────────────────

    async fn insert_dead_letter(&self, entry: &DeadLetter) -> Result<()>;

    /// Overwrite the mutable columns of an existing entry.
    /// Fails with `DeadLetterNotFound` if the id is unknown.
    async fn update_dead_letter(&self, entry: &DeadLetter) -> Result<()>;

    async fn get_dead_letter(&self, id: &str) -> Result<Option<DeadLetter>>;

    /// Entries of the given agents with status pending/retrying and
    /// `next_retry <= now`, ordered by `next_retry` ascending.
    async fn due_dead_letters(
        &self,
        agents: &[String],
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeadLetter>>;

    /// Newest first.
    async fn list_dead_letters(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetter>>;

    /// Move `retrying` entries last touched at or before `older_than` back to
    /// `pending`. Returns how many were reset.
    async fn reset_stale_dead_letters(
        &self,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize>;

    /// Delete entries with `status` last touched before `older_than`.
    async fn delete_dead_letters(
        &self,
        status: DeadLetterStatus,
        older_than: DateTime<Utc>,
    ) -> Result<usize>;

    async fn dead_letter_stats(&self) -> Result<DeadLetterStats>;

    // ─── agent_health / agent_metrics ────────────────────

    async fn insert_health(&self, record: &HealthRecord) -> Result<()>;

    async fn latest_health(&self, agent: &str) -> Result<Option<HealthRecord>>;

    async fn insert_metrics(&self, snapshot: &MetricsSnapshot) -> Result<()>;

    async fn latest_metrics(&self, agent: &str) -> Result<Option<MetricsSnapshot>>;
}
