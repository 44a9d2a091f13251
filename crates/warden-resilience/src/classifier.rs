//! Heuristic error classification.
//!
//! Errors that already carry an [`AgentError`] anywhere in their chain pass
//! through unchanged. Everything else is matched on message substrings in a
//! fixed priority order; the first rule that matches wins.

use warden_core::types::{AgentError, ErrorKind, Severity};

/// (needles, kind, severity), checked top to bottom.
const RULES: &[(&[&str], ErrorKind, Severity)] = &[
    (&["database", "sql"], ErrorKind::Database, Severity::High),
    (&["validation", "invalid"], ErrorKind::Validation, Severity::Medium),
    (&["config"], ErrorKind::Configuration, Severity::High),
];

/// Classify a raw failure.
pub fn classify(raw: &anyhow::Error) -> AgentError {
    if let Some(typed) = raw.chain().find_map(|e| e.downcast_ref::<AgentError>()) {
        return typed.clone();
    }
    classify_message(&format!("{raw:#}")).with_original(format!("{raw:?}"))
}

/// Classify from a message alone. Matching is case-insensitive.
pub fn classify_message(message: &str) -> AgentError {
    let lower = message.to_lowercase();
    let (kind, severity) = RULES
        .iter()
        .find(|(needles, _, _)| needles.iter().any(|n| lower.contains(n)))
        .map(|(_, kind, severity)| (*kind, *severity))
        .unwrap_or((ErrorKind::Unknown, Severity::Medium));
    AgentError::new(kind, message).with_severity(severity)
}
