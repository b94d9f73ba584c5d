//! # polyglot-memory
//!
//! SQLite-backed per-server configuration for Polyglot.

mod store;

pub use store::PrefStore;
