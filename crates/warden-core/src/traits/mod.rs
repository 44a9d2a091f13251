//! Trait seams implemented outside this crate.

pub mod store;

pub use store::Store;
