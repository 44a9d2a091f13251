//! # Warden Store
//!
//! Persistence backends implementing [`warden_core::Store`]:
//! - [`SqliteStore`]: durable, shared by independent processes polling the same file
//! - [`MemoryStore`]: process-local, for tests and ephemeral runs

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
