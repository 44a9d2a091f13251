//! Data model shared across the framework.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::WardenError;

// ─── Error taxonomy ───────────────────────────────────────

/// Error category assigned by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Database,
    Configuration,
    BusinessLogic,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Database => "database",
            ErrorKind::Configuration => "configuration",
            ErrorKind::BusinessLogic => "business_logic",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Severity used when an error of this kind is constructed without one.
    pub fn default_severity(&self) -> Severity {
        match self {
            ErrorKind::Validation => Severity::Low,
            ErrorKind::Database | ErrorKind::Configuration | ErrorKind::BusinessLogic => {
                Severity::High
            }
            ErrorKind::Unknown => Severity::Medium,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "validation" => Ok(ErrorKind::Validation),
            "database" => Ok(ErrorKind::Database),
            "configuration" => Ok(ErrorKind::Configuration),
            "business_logic" => Ok(ErrorKind::BusinessLogic),
            "unknown" => Ok(ErrorKind::Unknown),
            other => Err(WardenError::UnknownVariant {
                kind: "error kind",
                value: other.to_string(),
            }),
        }
    }
}

/// Error severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(WardenError::UnknownVariant {
                kind: "severity",
                value: other.to_string(),
            }),
        }
    }
}

/// A classified failure.
///
/// Workers that know exactly what went wrong return one of these directly
/// (wrapped in `anyhow::Error`); the classifier passes it through untouched.
/// Builder methods consume `self`, so a constructed value is never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct AgentError {
    pub message: String,
    pub kind: ErrorKind,
    pub severity: Severity,
    #[serde(default)]
    pub context: BTreeMap<String, serde_json::Value>,
    /// Machine-readable code, if the source provided one.
    #[serde(default)]
    pub code: Option<String>,
    /// Debug rendering of the original error chain.
    #[serde(default)]
    pub original: Option<String>,
}

impl AgentError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind,
            severity: kind.default_severity(),
            context: BTreeMap::new(),
            code: None,
            original: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Database, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn business_logic(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BusinessLogic, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_original(mut self, original: impl Into<String>) -> Self {
        self.original = Some(original.into());
        self
    }
}

/// Row in `agent_errors`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub agent: String,
    pub error_type: ErrorKind,
    pub error_code: Option<String>,
    pub message: String,
    pub severity: Severity,
    pub context: serde_json::Value,
    pub stack: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn from_error(agent: &str, error: &AgentError, context: &str, at: DateTime<Utc>) -> Self {
        let mut ctx = serde_json::Map::new();
        ctx.insert("operation".into(), context.into());
        for (k, v) in &error.context {
            ctx.insert(k.clone(), v.clone());
        }
        Self {
            agent: agent.to_string(),
            error_type: error.kind,
            error_code: error.code.clone(),
            message: error.message.clone(),
            severity: error.severity,
            context: serde_json::Value::Object(ctx),
            stack: error.original.clone(),
            timestamp: at,
        }
    }
}

/// Row in `agent_alerts`. Written only for escalated errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub agent: String,
    pub alert_type: String,
    pub severity: Severity,
    pub message: String,
    pub context: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

// ─── Dead letters ─────────────────────────────────────────

/// Dead-letter lifecycle. `Resolved` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterStatus {
    Pending,
    Retrying,
    Failed,
    Resolved,
}

impl DeadLetterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterStatus::Pending => "pending",
            DeadLetterStatus::Retrying => "retrying",
            DeadLetterStatus::Failed => "failed",
            DeadLetterStatus::Resolved => "resolved",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DeadLetterStatus::Failed | DeadLetterStatus::Resolved)
    }
}

impl std::fmt::Display for DeadLetterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeadLetterStatus {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeadLetterStatus::Pending),
            "retrying" => Ok(DeadLetterStatus::Retrying),
            "failed" => Ok(DeadLetterStatus::Failed),
            "resolved" => Ok(DeadLetterStatus::Resolved),
            other => Err(WardenError::UnknownVariant {
                kind: "dead letter status",
                value: other.to_string(),
            }),
        }
    }
}

/// Error payload stored with a dead letter.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeadLetterError {
    pub message: String,
    #[serde(default)]
    pub stack: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    /// Id of the failed entry this one was requeued from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requeued_from: Option<String>,
}

impl From<&AgentError> for DeadLetterError {
    fn from(err: &AgentError) -> Self {
        Self {
            message: err.message.clone(),
            stack: err.original.clone(),
            code: err.code.clone(),
            requeued_from: None,
        }
    }
}

/// An operation parked for asynchronous replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: String,
    pub agent: String,
    pub operation: String,
    pub payload: serde_json::Value,
    pub error: DeadLetterError,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry: Option<DateTime<Utc>>,
    pub status: DeadLetterStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeadLetter {
    /// New pending entry, first replay due at `next_retry`.
    pub fn new(
        agent: &str,
        operation: &str,
        payload: serde_json::Value,
        error: DeadLetterError,
        max_retries: u32,
        next_retry: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent: agent.to_string(),
            operation: operation.to_string(),
            payload,
            error,
            retry_count: 0,
            max_retries,
            next_retry: Some(next_retry),
            status: DeadLetterStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the poll loop should pick this entry up at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && self.next_retry.is_some_and(|at| at <= now)
    }
}

/// Filter for dead-letter listings.
#[derive(Debug, Clone, Default)]
pub struct DeadLetterFilter {
    pub status: Option<DeadLetterStatus>,
    pub agent: Option<String>,
    /// 0 = no limit.
    pub limit: usize,
}

/// Entry count per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterStats {
    pub pending: u64,
    pub retrying: u64,
    pub failed: u64,
    pub resolved: u64,
}

impl DeadLetterStats {
    pub fn total(&self) -> u64 {
        self.pending + self.retrying + self.failed + self.resolved
    }

    pub fn add(&mut self, status: DeadLetterStatus, n: u64) {
        match status {
            DeadLetterStatus::Pending => self.pending += n,
            DeadLetterStatus::Retrying => self.retrying += n,
            DeadLetterStatus::Failed => self.failed += n,
            DeadLetterStatus::Resolved => self.resolved += n,
        }
    }
}

// ─── Health & metrics ─────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HealthStatus {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(HealthStatus::Healthy),
            "degraded" => Ok(HealthStatus::Degraded),
            "unhealthy" => Ok(HealthStatus::Unhealthy),
            other => Err(WardenError::UnknownVariant {
                kind: "health status",
                value: other.to_string(),
            }),
        }
    }
}

/// Row in `agent_health`. Appended on every check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub agent: String,
    pub status: HealthStatus,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Row in `agent_metrics`. Counters are cumulative since process start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub agent: String,
    pub success_count: u64,
    pub error_count: u64,
    pub warning_count: u64,
    pub processing_time_ms: u64,
    pub memory_usage_mb: f64,
    /// Worker-specific gauges.
    #[serde(default)]
    pub custom: BTreeMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

// ─── Lifecycle ────────────────────────────────────────────

/// Agent lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Initializing,
    Ready,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Idle => "idle",
            AgentState::Initializing => "initializing",
            AgentState::Ready => "ready",
            AgentState::Running => "running",
            AgentState::Stopping => "stopping",
            AgentState::Stopped => "stopped",
            AgentState::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentState::Stopped | AgentState::Error)
    }

    /// Forward edges of the lifecycle. Any non-terminal state may also move to `Error`.
    pub fn can_transition_to(&self, next: AgentState) -> bool {
        if next == AgentState::Error {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (AgentState::Idle, AgentState::Initializing)
                | (AgentState::Initializing, AgentState::Ready)
                | (AgentState::Ready, AgentState::Running)
                | (AgentState::Idle, AgentState::Stopping)
                | (AgentState::Ready, AgentState::Stopping)
                | (AgentState::Running, AgentState::Stopping)
                | (AgentState::Stopping, AgentState::Stopped)
        )
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_default_severity() {
        assert_eq!(AgentError::validation("bad").severity, Severity::Low);
        assert_eq!(AgentError::database("down").severity, Severity::High);
        assert_eq!(AgentError::configuration("missing").severity, Severity::High);
        assert_eq!(AgentError::business_logic("nope").severity, Severity::High);
        assert_eq!(AgentError::unknown("?").severity, Severity::Medium);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in [
            DeadLetterStatus::Pending,
            DeadLetterStatus::Retrying,
            DeadLetterStatus::Failed,
            DeadLetterStatus::Resolved,
        ] {
            assert_eq!(status.as_str().parse::<DeadLetterStatus>().unwrap(), status);
        }
        assert!("exploded".parse::<DeadLetterStatus>().is_err());
    }

    #[test]
    fn test_error_record_merges_context() {
        let err = AgentError::database("timeout")
            .with_context("table", "scores")
            .with_code("ETIMEDOUT");
        let rec = ErrorRecord::from_error("scorer", &err, "score_message", Utc::now());
        assert_eq!(rec.context["operation"], "score_message");
        assert_eq!(rec.context["table"], "scores");
        assert_eq!(rec.error_code.as_deref(), Some("ETIMEDOUT"));
    }

    #[test]
    fn test_dead_letter_due() {
        let now = Utc::now();
        let mut entry = DeadLetter::new(
            "scorer",
            "score",
            serde_json::json!({"id": 1}),
            DeadLetterError::default(),
            3,
            now + chrono::Duration::seconds(60),
            now,
        );
        assert!(!entry.is_due(now));
        assert!(entry.is_due(now + chrono::Duration::seconds(60)));
        entry.status = DeadLetterStatus::Resolved;
        assert!(!entry.is_due(now + chrono::Duration::seconds(120)));
    }

    #[test]
    fn test_lifecycle_edges() {
        assert!(AgentState::Idle.can_transition_to(AgentState::Initializing));
        assert!(AgentState::Running.can_transition_to(AgentState::Stopping));
        assert!(AgentState::Stopping.can_transition_to(AgentState::Error));
        assert!(!AgentState::Stopped.can_transition_to(AgentState::Running));
        assert!(!AgentState::Error.can_transition_to(AgentState::Error));
        assert!(!AgentState::Stopped.can_transition_to(AgentState::Error));
        assert!(!AgentState::Idle.can_transition_to(AgentState::Running));
    }
}
