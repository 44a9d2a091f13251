//! Durable dead-letter queue.
//!
//! Operations that exhausted in-process retry are parked in the store and
//! replayed later by a poll loop. Delivery is at-least-once: an entry left in
//! `retrying` by a crash is swept back to `pending` after `stale_after`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use warden_core::backoff::capped_exponential;
use warden_core::clock::{Clock, SystemClock, to_chrono};
use warden_core::config::DeadLetterConfig;
use warden_core::error::{Result, WardenError};
use warden_core::events::{AgentEvent, EventBus};
use warden_core::traits::Store;
use warden_core::types::{
    AgentError, DeadLetter, DeadLetterFilter, DeadLetterStats, DeadLetterStatus,
};

use crate::classifier::classify;
use crate::escalation::ErrorHandler;

/// Re-executes a dead-lettered operation for one agent.
///
/// Returning `Ok` resolves the entry; an error counts as a failed replay.
#[async_trait]
pub trait ReplayHandler: Send + Sync {
    async fn replay(&self, operation: &str, payload: &serde_json::Value) -> anyhow::Result<()>;
}

/// Scheduling parameters for the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub processing_interval: Duration,
    pub batch_size: usize,
    pub stale_after: Duration,
}

impl DeadLetterPolicy {
    pub fn from_config(config: &DeadLetterConfig) -> Self {
        Self {
            max_retries: config.max_retries.max(1),
            initial_delay: config.initial_retry_delay(),
            max_delay: config.max_retry_delay(),
            processing_interval: config.processing_interval(),
            batch_size: config.batch_size,
            stale_after: config.stale_after(),
        }
    }

    /// Delay before the next replay once `retry_count` replays have failed.
    pub fn next_delay(&self, retry_count: u32) -> Duration {
        capped_exponential(self.initial_delay, self.max_delay, retry_count)
    }
}

impl Default for DeadLetterPolicy {
    fn default() -> Self {
        Self::from_config(&DeadLetterConfig::default())
    }
}

/// Outcome of one poll pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessReport {
    pub reset_stale: usize,
    pub attempted: usize,
    pub resolved: usize,
    pub rescheduled: usize,
    pub failed: usize,
}

impl ProcessReport {
    pub fn is_idle(&self) -> bool {
        self.reset_stale == 0 && self.attempted == 0
    }
}

/// Clears the processing flag when a pass ends, however it ends.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct DeadLetterQueue {
    store: Arc<dyn Store>,
    policy: DeadLetterPolicy,
    clock: Arc<dyn Clock>,
    events: EventBus,
    handlers: RwLock<HashMap<String, Arc<dyn ReplayHandler>>>,
    processing: AtomicBool,
    errors: Option<Arc<ErrorHandler>>,
}

impl DeadLetterQueue {
    pub fn new(store: Arc<dyn Store>, policy: DeadLetterPolicy, events: EventBus) -> Self {
        Self {
            store,
            policy,
            clock: Arc::new(SystemClock),
            events,
            handlers: RwLock::new(HashMap::new()),
            processing: AtomicBool::new(false),
            errors: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Terminal failures and poll errors are reported through this handler.
    pub fn with_error_handler(mut self, handler: Arc<ErrorHandler>) -> Self {
        self.errors = Some(handler);
        self
    }

    pub fn policy(&self) -> &DeadLetterPolicy {
        &self.policy
    }

    /// Register the replay consumer for `agent`, replacing any previous one.
    pub fn register_handler(&self, agent: &str, handler: Arc<dyn ReplayHandler>) {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        if handlers.insert(agent.to_string(), handler).is_some() {
            tracing::warn!("⚠️ Replay handler for '{agent}' replaced");
        } else {
            tracing::debug!("📬 Replay handler registered for '{agent}'");
        }
    }

    pub fn unregister_handler(&self, agent: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(agent)
            .is_some()
    }

    /// Agents whose entries the poll loop will drain, sorted.
    pub fn registered_agents(&self) -> Vec<String> {
        let mut agents: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        agents.sort();
        agents
    }

    fn handler_for(&self, agent: &str) -> Option<Arc<dyn ReplayHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(agent)
            .cloned()
    }

    /// Park a failed operation. Best-effort: if the store rejects the write
    /// the entry is lost and only the log line remains.
    pub async fn enqueue(
        &self,
        agent: &str,
        operation: &str,
        payload: serde_json::Value,
        error: &AgentError,
    ) -> Option<String> {
        let now = self.clock.now();
        let entry = DeadLetter::new(
            agent,
            operation,
            payload,
            error.into(),
            self.policy.max_retries,
            now + to_chrono(self.policy.initial_delay),
            now,
        );
        match self.store.insert_dead_letter(&entry).await {
            Ok(()) => {
                tracing::info!(
                    agent, id = %entry.id,
                    "📮 [{agent}] '{operation}' dead-lettered, first replay in {:?}",
                    self.policy.initial_delay
                );
                Some(entry.id)
            }
            Err(e) => {
                tracing::error!(
                    agent,
                    "🚨 [{agent}] dead letter for '{operation}' LOST, store rejected it: {e}"
                );
                None
            }
        }
    }

    /// One poll pass: sweep stale entries, then replay what is due.
    ///
    /// Overlapping passes are skipped, not queued.
    pub async fn process_due(&self) -> Result<ProcessReport> {
        if self.processing.swap(true, Ordering::SeqCst) {
            tracing::debug!("⏭️ Dead-letter pass already running, skipping");
            return Ok(ProcessReport::default());
        }
        let _pass = PassGuard(&self.processing);
        let mut report = ProcessReport::default();

        let now = self.clock.now();
        report.reset_stale = self
            .store
            .reset_stale_dead_letters(now - to_chrono(self.policy.stale_after), now)
            .await?;
        if report.reset_stale > 0 {
            tracing::warn!("🧹 Reset {} stale dead letter(s) to pending", report.reset_stale);
        }

        let agents = self.registered_agents();
        if agents.is_empty() {
            return Ok(report);
        }
        let due = self
            .store
            .due_dead_letters(&agents, now, self.policy.batch_size)
            .await?;

        for entry in due {
            let id = entry.id.clone();
            if let Err(e) = self.replay_entry(entry, &mut report).await {
                tracing::error!(id = %id, "❌ Dead letter {id} could not be updated: {e}");
            }
        }
        Ok(report)
    }

    async fn replay_entry(&self, mut entry: DeadLetter, report: &mut ProcessReport) -> Result<()> {
        // Handler may have gone away since the query.
        let Some(handler) = self.handler_for(&entry.agent) else {
            return Ok(());
        };

        entry.status = DeadLetterStatus::Retrying;
        entry.updated_at = self.clock.now();
        self.store.update_dead_letter(&entry).await?;
        report.attempted += 1;

        self.events.publish(AgentEvent::Replay {
            agent: entry.agent.clone(),
            operation: entry.operation.clone(),
            payload: entry.payload.clone(),
        });

        let outcome = run_isolated(handler, &entry).await;
        let now = self.clock.now();
        entry.updated_at = now;

        let mut terminal_error = None;
        match outcome {
            Ok(()) => {
                entry.status = DeadLetterStatus::Resolved;
                report.resolved += 1;
                tracing::info!(
                    agent = %entry.agent, id = %entry.id,
                    "✅ [{}] replay of '{}' succeeded", entry.agent, entry.operation
                );
            }
            Err(e) => {
                let classified = classify(&e);
                let requeued_from = entry.error.requeued_from.take();
                entry.error = (&classified).into();
                entry.error.requeued_from = requeued_from;
                entry.retry_count = (entry.retry_count + 1).min(entry.max_retries);
                if entry.retry_count >= entry.max_retries {
                    entry.status = DeadLetterStatus::Failed;
                    entry.next_retry = None;
                    report.failed += 1;
                    tracing::error!(
                        agent = %entry.agent, id = %entry.id,
                        "💀 [{}] replay of '{}' failed permanently after {} attempt(s): {e:#}",
                        entry.agent, entry.operation, entry.retry_count
                    );
                    terminal_error = Some(classified);
                } else {
                    let delay = self.policy.next_delay(entry.retry_count);
                    entry.status = DeadLetterStatus::Pending;
                    entry.next_retry = Some(now + to_chrono(delay));
                    report.rescheduled += 1;
                    tracing::warn!(
                        agent = %entry.agent, id = %entry.id,
                        "🔁 [{}] replay of '{}' failed ({}/{}), next in {delay:?}: {e:#}",
                        entry.agent, entry.operation, entry.retry_count, entry.max_retries
                    );
                }
            }
        }
        self.store.update_dead_letter(&entry).await?;

        if let (Some(error), Some(handler)) = (terminal_error, &self.errors) {
            let error = error.with_context("dead_letter_id", entry.id.clone());
            handler
                .report(&entry.agent, error, &format!("{} (dead letter failed)", entry.operation))
                .await;
        }
        Ok(())
    }

    /// Give a `failed` entry another round of replays.
    ///
    /// The failed row is kept as-is; a fresh pending copy, due now, records
    /// its id in `error.requeued_from`.
    pub async fn requeue(&self, id: &str) -> Result<DeadLetter> {
        let failed = self
            .store
            .get_dead_letter(id)
            .await?
            .ok_or_else(|| WardenError::DeadLetterNotFound(id.to_string()))?;
        if failed.status != DeadLetterStatus::Failed {
            return Err(WardenError::Other(format!(
                "dead letter {id} is {}, only failed entries can be requeued",
                failed.status
            )));
        }
        let copies = self
            .store
            .list_dead_letters(&DeadLetterFilter {
                agent: Some(failed.agent.clone()),
                ..Default::default()
            })
            .await?;
        if let Some(open) = copies
            .iter()
            .find(|e| !e.status.is_terminal() && e.error.requeued_from.as_deref() == Some(id))
        {
            return Err(WardenError::Other(format!(
                "dead letter {id} is already requeued as {}",
                open.id
            )));
        }

        let now = self.clock.now();
        let mut error = failed.error.clone();
        error.requeued_from = Some(failed.id.clone());
        let entry = DeadLetter::new(
            &failed.agent,
            &failed.operation,
            failed.payload.clone(),
            error,
            self.policy.max_retries,
            now,
            now,
        );
        self.store.insert_dead_letter(&entry).await?;
        tracing::info!(id, new_id = %entry.id, "♻️ Dead letter {id} requeued as {}", entry.id);
        Ok(entry)
    }

    /// Delete terminal entries last touched before `older_than`.
    pub async fn purge(&self, status: DeadLetterStatus, older_than: DateTime<Utc>) -> Result<usize> {
        if !status.is_terminal() {
            return Err(WardenError::Other(format!(
                "refusing to purge {status} dead letters, only resolved or failed"
            )));
        }
        let n = self.store.delete_dead_letters(status, older_than).await?;
        tracing::info!("🗑️ Purged {n} {status} dead letter(s)");
        Ok(n)
    }

    pub async fn stats(&self) -> Result<DeadLetterStats> {
        self.store.dead_letter_stats().await
    }

    pub async fn list(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetter>> {
        self.store.list_dead_letters(filter).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<DeadLetter>> {
        self.store.get_dead_letter(id).await
    }

    /// Spawn the poll loop. It runs until `cancel` fires.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tracing::info!(
                "📮 Dead-letter poll loop started (every {:?})",
                queue.policy.processing_interval
            );
            let mut interval = tokio::time::interval(queue.policy.processing_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => queue.tick().await,
                }
            }
            tracing::info!("📮 Dead-letter poll loop stopped");
        })
    }

    async fn tick(&self) {
        match self.process_due().await {
            Ok(report) if !report.is_idle() => tracing::info!(
                "📮 Dead-letter pass: {} replayed, {} resolved, {} rescheduled, {} failed, {} stale reset",
                report.attempted, report.resolved, report.rescheduled, report.failed, report.reset_stale
            ),
            Ok(_) => {}
            Err(e) => match &self.errors {
                Some(handler) => {
                    handler
                        .handle("dead_letter_queue", &anyhow::Error::new(e), "dead letter poll")
                        .await;
                }
                None => tracing::error!("❌ Dead-letter pass failed: {e}"),
            },
        }
    }
}

/// Run one replay on its own task so a panicking handler fails the entry
/// instead of taking the poll loop down.
async fn run_isolated(handler: Arc<dyn ReplayHandler>, entry: &DeadLetter) -> anyhow::Result<()> {
    let (operation, payload) = (entry.operation.clone(), entry.payload.clone());
    match tokio::spawn(async move { handler.replay(&operation, &payload).await }).await {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => {
            let panic = e.into_panic();
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            tracing::error!(
                agent = %entry.agent, id = %entry.id,
                "💥 [{}] replay handler panicked on '{}': {msg}", entry.agent, entry.operation
            );
            Err(anyhow::anyhow!("replay handler panicked: {msg}"))
        }
        Err(e) => Err(anyhow::anyhow!("replay task cancelled: {e}")),
    }
}
