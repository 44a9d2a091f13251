//! # Warden Resilience
//!
//! Failure handling shared by every agent.
//!
//! ## Flow
//! ```text
//! operation fails
//!   └── ErrorHandler (classify → log → persist error → alert if high/critical → event)
//!         └── RetryExecutor: retryable? back off and try again, up to max attempts
//!               └── exhausted → DeadLetterQueue::enqueue
//!                     └── poll loop replays via ReplayHandler
//!                           ├── ok   → resolved
//!                           └── err  → pending (capped backoff) or failed at max_retries
//! ```

pub mod classifier;
pub mod dlq;
pub mod escalation;
pub mod retry;

pub use classifier::{classify, classify_message};
pub use dlq::{DeadLetterPolicy, DeadLetterQueue, ProcessReport, ReplayHandler};
pub use escalation::{ErrorHandler, EscalationPolicy};
pub use retry::{RetryExecutor, RetryOperation, RetryPolicy, RetryStats};
