use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tally_types::{ProjectId, Timestamp};

/// A project groups records, typically one season or one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: ProjectId,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub is_completed: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Project {
    /// Creates a new, open project stamped with the current time.
    pub fn new(title: impl Into<String>) -> Self {
        let now = Timestamp::now();
        Self {
            id: ProjectId::new(),
            title: title.into(),
            start_date: None,
            is_completed: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the start date.
    #[must_use]
    pub fn with_start_date(mut self, date: NaiveDate) -> Self {
        self.start_date = Some(date);
        self
    }

    /// Overrides both timestamps. Mostly useful for fixtures and imports.
    #[must_use]
    pub fn with_timestamps(mut self, created_at: Timestamp, updated_at: Timestamp) -> Self {
        self.created_at = created_at;
        self.updated_at = updated_at;
        self
    }

    /// Marks the project as modified now.
    pub fn touch(&mut self) {
        self.updated_at = Timestamp::now().max(self.updated_at.plus_millis(1));
    }
}
