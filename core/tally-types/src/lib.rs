//! Core type definitions for Tally.
//!
//! This crate defines the small types every other crate
//! agrees on:
//! - Project, record and peer identifiers (UUID v7)
//! - Millisecond wall-clock timestamps used for last-writer comparisons
//!
//! Entity shapes (projects, records) live in `tally-model`.

mod ids;
mod timestamp;

pub use ids::{PeerId, ProjectId, RecordId};
pub use timestamp::Timestamp;

