//! # Warden Agent
//! The lifecycle controller every long-running worker runs under.
//!
//! ## States
//! ```text
//! idle → initializing → ready → running → stopping → stopped
//!   any non-terminal state ──(init failure / fatal error)──→ error
//! ```
//!
//! A worker implements [`Worker`]; [`Agent`] drives it: initialization,
//! health and metrics timers, command dispatch through the shared error
//! handler, and replay of its dead-lettered operations.

pub mod health;
pub mod lifecycle;

pub use health::{HealthCheck, HealthThresholds, MetricsCollector, TickGuard, memory_usage_mb};
pub use lifecycle::{Agent, AgentContext, AgentServices, Worker};
