//! In-process retry with capped exponential backoff.
//!
//! Each `with_retry` call owns its key for its whole lifetime. The key is
//! registered through a guard, so it is released on success, on terminal
//! failure, and also when the future is dropped or the operation panics.

use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use warden_core::backoff::capped_exponential;
use warden_core::config::RetryConfig;
use warden_core::error::WardenError;

use crate::classifier::classify;
use crate::escalation::ErrorHandler;

/// Backoff parameters for one executor.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub backoff: Duration,
    pub max_backoff: Duration,
    /// Uniform ± fraction applied to each delay. `None` = deterministic.
    pub jitter: Option<f64>,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            backoff: config.backoff(),
            max_backoff: config.max_backoff(),
            jitter: config.jitter.then_some(config.jitter_ratio),
        }
    }

    /// `min(backoff * 2^(attempt-1), max_backoff)`, without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        capped_exponential(self.backoff, self.max_backoff, attempt.saturating_sub(1))
    }

    /// Delay actually slept after `attempt` fails.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.delay_for(attempt);
        match self.jitter {
            Some(ratio) if ratio > 0.0 => {
                let ratio = ratio.min(1.0);
                let f: f64 = rand::thread_rng().gen_range(-ratio..=ratio);
                base.mul_f64(1.0 + f)
            }
            _ => base,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Bookkeeping for one in-flight `with_retry` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOperation {
    pub key: String,
    pub attempts: u32,
    pub max_attempts: u32,
    pub context: String,
}

/// Cumulative executor counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryStats {
    /// Backoff sleeps taken.
    pub retried: u64,
    /// Calls that succeeded after at least one failure.
    pub recovered: u64,
    /// Calls that failed on their last attempt.
    pub exhausted: u64,
    /// Calls stopped early by the retry predicate.
    pub rejected: u64,
}

#[derive(Default)]
struct Counters {
    retried: AtomicU64,
    recovered: AtomicU64,
    exhausted: AtomicU64,
    rejected: AtomicU64,
}

type InFlight = Mutex<HashMap<String, RetryOperation>>;

fn lock(map: &InFlight) -> MutexGuard<'_, HashMap<String, RetryOperation>> {
    map.lock().unwrap_or_else(|e| e.into_inner())
}

/// Holds a key in the in-flight registry until dropped.
struct KeyGuard<'a> {
    map: &'a InFlight,
    key: String,
}

impl KeyGuard<'_> {
    fn next_attempt(&self) -> u32 {
        let mut map = lock(self.map);
        match map.get_mut(&self.key) {
            Some(op) => {
                op.attempts += 1;
                op.attempts
            }
            None => 1,
        }
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        lock(self.map).remove(&self.key);
    }
}

/// Per-agent retry executor.
pub struct RetryExecutor {
    agent: String,
    policy: RetryPolicy,
    handler: Arc<ErrorHandler>,
    in_flight: InFlight,
    counters: Counters,
    owner_stopped: AtomicBool,
}

impl RetryExecutor {
    pub fn new(agent: &str, policy: RetryPolicy, handler: Arc<ErrorHandler>) -> Self {
        Self {
            agent: agent.to_string(),
            policy,
            handler,
            in_flight: Mutex::new(HashMap::new()),
            counters: Counters::default(),
            owner_stopped: AtomicBool::new(false),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn register(&self, key: &str, context: &str) -> Result<KeyGuard<'_>, WardenError> {
        let mut map = lock(&self.in_flight);
        if map.contains_key(key) {
            return Err(WardenError::RetryKeyInFlight(key.to_string()));
        }
        map.insert(
            key.to_string(),
            RetryOperation {
                key: key.to_string(),
                attempts: 0,
                max_attempts: self.policy.max_attempts,
                context: context.to_string(),
            },
        );
        Ok(KeyGuard {
            map: &self.in_flight,
            key: key.to_string(),
        })
    }

    /// Run `op` until it succeeds, the retry predicate rejects the failure,
    /// or `max_attempts` is reached. The last error is returned unchanged;
    /// dead-lettering is up to the caller.
    pub async fn with_retry<T, F, Fut>(&self, key: &str, context: &str, mut op: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let guard = self.register(key, context)?;
        let agent = self.agent.as_str();

        loop {
            let attempt = guard.next_attempt();
            let err = match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        self.counters.recovered.fetch_add(1, Ordering::Relaxed);
                        tracing::info!(agent, key, attempt, "✅ [{agent}] {context} recovered on attempt {attempt}");
                    }
                    self.note_late_completion(key);
                    return Ok(value);
                }
                Err(e) => e,
            };

            let classified = classify(&err);
            if attempt >= self.policy.max_attempts {
                self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
                self.handler
                    .report(agent, classified, &format!("{context} (final retry)"))
                    .await;
                self.note_late_completion(key);
                return Err(err);
            }
            if !self.handler.policy().should_retry(&classified) {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                self.handler
                    .report(agent, classified, &format!("{context} (non-retryable)"))
                    .await;
                self.note_late_completion(key);
                return Err(err);
            }

            let delay = self.policy.jittered_delay(attempt);
            self.counters.retried.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                agent, key, attempt,
                "🔁 [{agent}] {context} failed (attempt {attempt}/{}), retrying in {delay:?}: {err:#}",
                self.policy.max_attempts
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Snapshot of in-flight operations, sorted by key.
    pub fn in_flight(&self) -> Vec<RetryOperation> {
        let mut ops: Vec<RetryOperation> = lock(&self.in_flight).values().cloned().collect();
        ops.sort_by(|a, b| a.key.cmp(&b.key));
        ops
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        lock(&self.in_flight).contains_key(key)
    }

    pub fn stats(&self) -> RetryStats {
        RetryStats {
            retried: self.counters.retried.load(Ordering::Relaxed),
            recovered: self.counters.recovered.load(Ordering::Relaxed),
            exhausted: self.counters.exhausted.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    /// Called by the owning agent on stop. In-flight calls keep running.
    pub fn set_owner_stopped(&self, stopped: bool) {
        self.owner_stopped.store(stopped, Ordering::SeqCst);
    }

    fn note_late_completion(&self, key: &str) {
        if self.owner_stopped.load(Ordering::SeqCst) {
            tracing::warn!(
                agent = %self.agent, key,
                "⏳ [{}] operation '{key}' completed after the agent stopped", self.agent
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use warden_core::events::EventBus;
    use warden_core::traits::Store;
    use warden_core::types::AgentError;
    use warden_store::MemoryStore;

    use crate::escalation::EscalationPolicy;

    fn executor(store: Arc<MemoryStore>) -> RetryExecutor {
        let handler = Arc::new(ErrorHandler::new(
            store,
            EscalationPolicy::default(),
            EventBus::default(),
        ));
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(1_000),
            max_backoff: Duration::from_millis(30_000),
            jitter: None,
        };
        RetryExecutor::new("scorer", policy, handler)
    }

    #[test]
    fn test_delay_formula() {
        let policy = RetryPolicy {
            max_attempts: 10,
            backoff: Duration::from_millis(1_000),
            max_backoff: Duration::from_millis(5_000),
            jitter: None,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4_000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(5_000));
        for attempt in 1..10 {
            assert!(policy.delay_for(attempt + 1) >= policy.delay_for(attempt));
        }
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(1_000),
            max_backoff: Duration::from_millis(30_000),
            jitter: Some(0.2),
        };
        for _ in 0..200 {
            let d = policy.jittered_delay(2);
            assert!(d >= Duration::from_millis(1_600) && d <= Duration::from_millis(2_400), "{d:?}");
        }
    }

    #[test]
    fn test_from_config() {
        let mut config = RetryConfig::default();
        assert_eq!(RetryPolicy::from_config(&config).jitter, None);
        config.jitter = true;
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.jitter, Some(0.2));
        assert_eq!(policy.max_attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_backoff() {
        let store = Arc::new(MemoryStore::new());
        let exec = executor(store.clone());
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();

        let value = exec
            .with_retry("job-1", "score_message", || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        anyhow::bail!("connection reset")
                    }
                    Ok(n)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 3);
        assert!(start.elapsed() >= Duration::from_millis(3_000));
        assert!(!exec.is_in_flight("job-1"));
        assert_eq!(exec.stats().recovered, 1);
        assert_eq!(exec.stats().retried, 2);
        // Intermediate failures are not persisted.
        assert!(store.list_errors(None, 0).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_final_retry() {
        let store = Arc::new(MemoryStore::new());
        let exec = executor(store.clone());
        let calls = AtomicU32::new(0);

        let err = exec
            .with_retry("job-1", "score_message", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(anyhow::anyhow!("database timeout")) }
            })
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "database timeout");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(exec.stats().exhausted, 1);
        let errors = store.list_errors(Some("scorer"), 0).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].context["operation"], "score_message (final retry)");
        assert!(!exec.is_in_flight("job-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_stops_immediately() {
        let store = Arc::new(MemoryStore::new());
        let exec = executor(store.clone());
        let calls = AtomicU32::new(0);

        let result = exec
            .with_retry("job-1", "parse", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(anyhow::Error::new(AgentError::validation("bad score"))) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(exec.stats().rejected, 1);
        let errors = store.list_errors(None, 0).await.unwrap();
        assert_eq!(errors[0].context["operation"], "parse (non-retryable)");
    }

    #[tokio::test]
    async fn test_duplicate_key_rejected_while_in_flight() {
        let exec = executor(Arc::new(MemoryStore::new()));
        let guard = exec.register("A", "ctx").unwrap();
        assert!(matches!(
            exec.register("A", "ctx"),
            Err(WardenError::RetryKeyInFlight(k)) if k == "A"
        ));
        let err = exec
            .with_retry("A", "ctx", || async { Ok(()) })
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<WardenError>().is_some());

        drop(guard);
        assert!(!exec.is_in_flight("A"));
        exec.with_retry("A", "ctx", || async { Ok(()) }).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_released_when_future_dropped() {
        let exec = executor(Arc::new(MemoryStore::new()));
        let pending = exec.with_retry("slow", "ctx", || async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        });
        let timed_out = tokio::time::timeout(Duration::from_secs(1), pending).await;
        assert!(timed_out.is_err());
        assert!(!exec.is_in_flight("slow"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_keys_do_not_share_attempts() {
        let exec = executor(Arc::new(MemoryStore::new()));
        let exec = &exec;
        let b_seen = Mutex::new(Vec::new());
        let b_calls = AtomicU32::new(0);

        // A fails every time: attempts at t=0s, 1s, 3s.
        let a = exec.with_retry("A", "op-a", || async {
            Err::<(), _>(anyhow::anyhow!("socket hang up"))
        });

        // B fails at t=0s, its second attempt runs until t=6s and fails, third succeeds.
        let b = exec.with_retry("B", "op-b", || {
            let n = b_calls.fetch_add(1, Ordering::SeqCst) + 1;
            let b_seen = &b_seen;
            async move {
                let attempts = exec
                    .in_flight()
                    .into_iter()
                    .find(|op| op.key == "B")
                    .map(|op| op.attempts);
                b_seen.lock().unwrap().push(attempts);
                match n {
                    1 => anyhow::bail!("socket hang up"),
                    2 => {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        assert!(!exec.is_in_flight("A"));
                        anyhow::bail!("socket hang up")
                    }
                    _ => Ok(n),
                }
            }
        });

        let (a, b) = tokio::join!(a, b);
        assert!(a.is_err());
        assert_eq!(b.unwrap(), 3);
        assert_eq!(*b_seen.lock().unwrap(), vec![Some(1), Some(2), Some(3)]);
        assert!(exec.in_flight().is_empty());
    }
}
