use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tally_types::{ProjectId, RecordId, Timestamp};

/// A dated entry inside a project.
///
/// `is_locked` is local bookkeeping (a record that was invoiced or exported)
/// and is never overwritten by incoming sync data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: RecordId,
    pub project_id: ProjectId,
    pub date: NaiveDate,
    pub quantity: f64,
    #[serde(default)]
    pub unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revenue: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default)]
    pub is_estimate: bool,
    #[serde(default)]
    pub is_locked: bool,
    /// Extension fields added by newer app versions. Kept verbatim.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Record {
    /// Creates a new record stamped with the current time.
    pub fn new(project_id: ProjectId, date: NaiveDate, quantity: f64, unit: impl Into<String>) -> Self {
        let now = Timestamp::now();
        Self {
            id: RecordId::new(),
            project_id,
            date,
            quantity,
            unit: unit.into(),
            revenue: None,
            comment: None,
            is_estimate: false,
            is_locked: false,
            extra: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn with_revenue(mut self, revenue: f64) -> Self {
        self.revenue = Some(revenue);
        self
    }

    #[must_use]
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn locked(mut self) -> Self {
        self.is_locked = true;
        self
    }

    /// Overrides both timestamps. Mostly useful for fixtures and imports.
    #[must_use]
    pub fn with_timestamps(mut self, created_at: Timestamp, updated_at: Timestamp) -> Self {
        self.created_at = created_at;
        self.updated_at = updated_at;
        self
    }

    /// Extract a string extension field.
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(|v| v.as_str())
    }

    /// Extract a numeric extension field.
    pub fn extra_number(&self, key: &str) -> Option<f64> {
        self.extra.get(key).and_then(|v| v.as_f64())
    }

    /// Marks the record as modified now.
    pub fn touch(&mut self) {
        self.updated_at = Timestamp::now().max(self.updated_at.plus_millis(1));
    }
}
