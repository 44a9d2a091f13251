//! # Warden Core
//!
//! Shared building blocks for the warden agent supervision framework:
//! - **Data model**: classified errors, dead letters, health and metrics rows
//! - **Traits**: the persistence contract every store backend implements
//! - **Config**: TOML configuration with per-field defaults
//! - **Clock / events**: injectable time source and the in-process event bus

pub mod backoff;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod traits;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::WardenConfig;
pub use error::{Result, WardenError};
pub use events::{AgentEvent, EventBus};
pub use traits::Store;
pub use types::*;
