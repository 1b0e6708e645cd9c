//! Local storage for Tally.
//!
//! The sync engine never talks to a database directly. It works against the
//! [`LocalStore`] trait, which the host application implements over its real
//! persistence layer.
//!
//! # Contents
//!
//! - [`LocalStore`]: list and upsert projects and records
//! - [`MemoryStore`]: a thread-safe in-memory implementation with JSON
//!   snapshot load/save, used by tests and the command-line peer

mod error;
mod memory;
mod store;

pub use error::{StoreError, StoreResult};
pub use memory::{MemoryStore, StoreSnapshot};
pub use store::LocalStore;
