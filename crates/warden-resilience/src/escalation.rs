//! Escalation policy and the shared error handler.
//!
//! One `ErrorHandler` is constructed at process start and handed to every
//! agent. It classifies, logs, persists, alerts, and publishes; it never fails
//! the caller (persistence problems are logged instead).

use std::sync::Arc;

use warden_core::clock::{Clock, SystemClock};
use warden_core::events::{AgentEvent, EventBus};
use warden_core::traits::Store;
use warden_core::types::{AgentError, AlertRecord, ErrorKind, ErrorRecord, Severity};

use crate::classifier::classify;

/// Decides whether a classified error should retry locally.
pub type RetryPredicate = Arc<dyn Fn(&AgentError) -> bool + Send + Sync>;

/// Validation and configuration failures won't fix themselves.
pub fn default_should_retry(error: &AgentError) -> bool {
    !matches!(error.kind, ErrorKind::Validation | ErrorKind::Configuration)
}

/// What to do with a classified error.
#[derive(Clone)]
pub struct EscalationPolicy {
    alert_at: Severity,
    fatal_at: Option<Severity>,
    retry: RetryPredicate,
}

impl EscalationPolicy {
    pub fn new() -> Self {
        Self {
            alert_at: Severity::High,
            fatal_at: Some(Severity::Critical),
            retry: Arc::new(default_should_retry),
        }
    }

    /// Replace the retry predicate.
    pub fn with_retry_predicate<F>(mut self, f: F) -> Self
    where
        F: Fn(&AgentError) -> bool + Send + Sync + 'static,
    {
        self.retry = Arc::new(f);
        self
    }

    /// Severity at or above which the owning agent moves to `error`.
    /// `None` means nothing is fatal.
    pub fn with_fatal_threshold(mut self, threshold: Option<Severity>) -> Self {
        self.fatal_at = threshold;
        self
    }

    /// True for high and critical errors.
    pub fn should_alert(&self, error: &AgentError) -> bool {
        error.severity >= self.alert_at
    }

    pub fn should_retry(&self, error: &AgentError) -> bool {
        (self.retry)(error)
    }

    pub fn is_fatal(&self, error: &AgentError) -> bool {
        self.fatal_at.is_some_and(|t| error.severity >= t)
    }
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EscalationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscalationPolicy")
            .field("alert_at", &self.alert_at)
            .field("fatal_at", &self.fatal_at)
            .finish_non_exhaustive()
    }
}

/// Shared error handler.
pub struct ErrorHandler {
    store: Arc<dyn Store>,
    policy: EscalationPolicy,
    events: EventBus,
    clock: Arc<dyn Clock>,
}

impl ErrorHandler {
    pub fn new(store: Arc<dyn Store>, policy: EscalationPolicy, events: EventBus) -> Self {
        Self {
            store,
            policy,
            events,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn policy(&self) -> &EscalationPolicy {
        &self.policy
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Classify a raw failure and report it.
    pub async fn handle(&self, agent: &str, raw: &anyhow::Error, context: &str) -> AgentError {
        self.report(agent, classify(raw), context).await
    }

    /// Report an already-classified error: log, persist, alert, publish.
    pub async fn report(&self, agent: &str, error: AgentError, context: &str) -> AgentError {
        match error.severity {
            Severity::Low => tracing::debug!(
                agent, kind = %error.kind, "ℹ️ [{agent}] {context}: {}", error.message
            ),
            Severity::Medium => tracing::warn!(
                agent, kind = %error.kind, "⚠️ [{agent}] {context}: {}", error.message
            ),
            Severity::High | Severity::Critical => tracing::error!(
                agent, kind = %error.kind, severity = %error.severity,
                "❌ [{agent}] {context}: {}", error.message
            ),
        }

        let now = self.clock.now();
        let record = ErrorRecord::from_error(agent, &error, context, now);
        if let Err(e) = self.store.insert_error(&record).await {
            tracing::error!("⚠️ Failed to persist error record for '{agent}': {e}");
        }

        if self.policy.should_alert(&error) {
            let alert = AlertRecord {
                agent: agent.to_string(),
                alert_type: if error.severity == Severity::Critical {
                    "critical_error".into()
                } else {
                    "error_escalation".into()
                },
                severity: error.severity,
                message: error.message.clone(),
                context: serde_json::json!({
                    "operation": context,
                    "error_type": error.kind.as_str(),
                    "error_code": error.code,
                }),
                timestamp: now,
            };
            if let Err(e) = self.store.insert_alert(&alert).await {
                tracing::error!("⚠️ Failed to persist alert for '{agent}': {e}");
            }
        }

        self.events.publish(AgentEvent::Error {
            agent: agent.to_string(),
            error: error.clone(),
            context: context.to_string(),
        });
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_store::MemoryStore;

    fn handler(store: Arc<MemoryStore>) -> ErrorHandler {
        ErrorHandler::new(store, EscalationPolicy::default(), EventBus::default())
    }

    #[test]
    fn test_default_policy() {
        let policy = EscalationPolicy::default();
        assert!(policy.should_alert(&AgentError::database("x")));
        assert!(!policy.should_alert(&AgentError::unknown("x")));
        assert!(policy.should_alert(&AgentError::unknown("x").with_severity(Severity::Critical)));

        assert!(!policy.should_retry(&AgentError::validation("x")));
        assert!(!policy.should_retry(&AgentError::configuration("x")));
        assert!(policy.should_retry(&AgentError::database("x")));
        assert!(policy.should_retry(&AgentError::unknown("x")));

        assert!(!policy.is_fatal(&AgentError::database("x")));
        assert!(policy.is_fatal(&AgentError::database("x").with_severity(Severity::Critical)));
        let lenient = EscalationPolicy::default().with_fatal_threshold(None);
        assert!(!lenient.is_fatal(&AgentError::unknown("x").with_severity(Severity::Critical)));
    }

    #[test]
    fn test_custom_retry_predicate() {
        let policy = EscalationPolicy::default().with_retry_predicate(|e| e.kind == ErrorKind::Database);
        assert!(policy.should_retry(&AgentError::database("x")));
        assert!(!policy.should_retry(&AgentError::unknown("x")));
    }

    #[tokio::test]
    async fn test_high_severity_persists_error_and_alert() {
        let store = Arc::new(MemoryStore::new());
        let handler = handler(store.clone());
        let mut events = handler.events().subscribe();

        let err = handler
            .handle("scorer", &anyhow::anyhow!("database timeout"), "score_message")
            .await;
        assert_eq!(err.kind, ErrorKind::Database);

        let alerts = store.list_alerts(Some("scorer"), 10).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, "error_escalation");
        assert_eq!(store.list_errors(Some("scorer"), 10).await.unwrap().len(), 1);

        match events.recv().await.unwrap() {
            AgentEvent::Error { agent, context, .. } => {
                assert_eq!(agent, "scorer");
                assert_eq!(context, "score_message");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_medium_severity_has_no_alert() {
        let store = Arc::new(MemoryStore::new());
        let handler = handler(store.clone());
        handler
            .handle("scorer", &anyhow::anyhow!("socket hang up"), "fetch")
            .await;
        assert_eq!(store.list_errors(None, 0).await.unwrap().len(), 1);
        assert!(store.list_alerts(None, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_does_not_propagate() {
        let store = Arc::new(MemoryStore::new());
        store.set_offline(true);
        let handler = handler(store.clone());
        let err = handler
            .handle("scorer", &anyhow::anyhow!("database timeout"), "tick")
            .await;
        assert_eq!(err.kind, ErrorKind::Database);
    }
}
