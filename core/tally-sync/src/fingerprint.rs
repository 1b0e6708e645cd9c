//! Content fingerprints for records.
//!
//! Two records describe the same real-world entry when their business
//! fields match, even if they were created independently on two devices and
//! carry different ids. The fingerprint covers exactly those fields.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use tally_model::Record;

/// Computes the fingerprint of a record.
///
/// SHA-256 over a canonical JSON object of the business fields. Keys are
/// sorted (`BTreeMap`), extension fields included. The id, both timestamps
/// and the local lock flag are left out.
pub fn fingerprint(record: &Record) -> String {
    let mut canonical: BTreeMap<String, Value> = BTreeMap::new();
    canonical.insert("projectId".into(), record.project_id.to_string().into());
    canonical.insert("date".into(), record.date.to_string().into());
    canonical.insert("quantity".into(), record.quantity.into());
    canonical.insert("unit".into(), record.unit.as_str().into());
    canonical.insert("revenue".into(), record.revenue.into());
    canonical.insert("comment".into(), record.comment.as_deref().unwrap_or_default().into());
    canonical.insert("isEstimate".into(), record.is_estimate.into());
    for (key, value) in &record.extra {
        canonical.insert(format!("x:{key}"), canonical_value(value));
    }

    let text = sorted_object(canonical).to_string();
    hex::encode(Sha256::digest(text.as_bytes()))
}

fn sorted_object(entries: BTreeMap<String, Value>) -> Value {
    Value::Object(entries.into_iter().collect::<Map<String, Value>>())
}

/// Sorts object keys recursively so nested extension values hash the same
/// regardless of how the peer ordered them.
fn canonical_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => sorted_object(
            map.iter()
                .map(|(k, v)| (k.clone(), canonical_value(v)))
                .collect(),
        ),
        Value::Array(items) => items.iter().map(canonical_value).collect(),
        other => other.clone(),
    }
}

/// Set of known fingerprints, grown while a batch is imported.
#[derive(Debug, Clone, Default)]
pub struct FingerprintIndex {
    known: HashSet<String>,
}

impl FingerprintIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Indexes an existing set of records.
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a Record>) -> Self {
        Self {
            known: records.into_iter().map(fingerprint).collect(),
        }
    }

    pub fn contains(&self, record: &Record) -> bool {
        self.known.contains(&fingerprint(record))
    }

    /// Adds a record's fingerprint. Returns false if it was already known.
    pub fn insert(&mut self, record: &Record) -> bool {
        self.known.insert(fingerprint(record))
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }
}
