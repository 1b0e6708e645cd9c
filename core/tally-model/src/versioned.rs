use crate::{Project, Record};
use tally_types::Timestamp;

/// What sync needs to know about an entity to compare two copies of it.
///
/// Both entity kinds implement it; conflict detection and the import path are
/// written once against this trait.
pub trait Versioned {
    /// Stable identifier, rendered as a string for reporting.
    fn entity_id(&self) -> String;

    /// Human-readable label shown next to a conflict.
    fn label(&self) -> String;

    /// Last modification time.
    fn updated_at(&self) -> Timestamp;

    /// Whether the local copy refuses remote overwrites.
    fn is_locked(&self) -> bool {
        false
    }
}

impl Versioned for Project {
    fn entity_id(&self) -> String {
        self.id.to_string()
    }

    fn label(&self) -> String {
        self.title.clone()
    }

    fn updated_at(&self) -> Timestamp {
        self.updated_at
    }
}

impl Versioned for Record {
    fn entity_id(&self) -> String {
        self.id.to_string()
    }

    fn label(&self) -> String {
        match &self.comment {
            Some(comment) if !comment.is_empty() => format!("{} ({comment})", self.date),
            _ => format!("{} {} {}", self.date, self.quantity, self.unit),
        }
    }

    fn updated_at(&self) -> Timestamp {
        self.updated_at
    }

    fn is_locked(&self) -> bool {
        self.is_locked
    }
}
