//! Entity model for Tally.
//!
//! Defines the two entity kinds that every store holds and that sync
//! exchanges between devices:
//! - [`Project`]: a named container with a start date and completion flag
//! - [`Record`]: a dated entry inside a project (quantity, revenue, comment,
//!   flags, plus free-form extension fields)
//! - [`Versioned`]: the contract sync uses to compare local and remote copies
//!
//! Entities serialize with camelCase keys; that JSON is the wire format of a
//! sync payload.

mod project;
mod record;
mod versioned;

pub use project::Project;
pub use record::Record;
pub use versioned::Versioned;
