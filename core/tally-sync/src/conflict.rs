//! Conflict detection and resolution.
//!
//! Conflicts are decided on `updated_at` alone. There is no field-level
//! merge: an entity is either imported whole or left alone.

use crate::protocol::SyncMetadata;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use tally_model::{Project, Versioned};
use tally_types::{ProjectId, Timestamp};

/// How a local copy relates to the incoming one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    NewerLocal,
    NewerRemote,
    /// Same `updated_at` on both sides; the copies may still differ.
    BothModified,
}

impl ConflictKind {
    /// Classifies by comparing modification times.
    pub fn classify(local: Timestamp, remote: Timestamp) -> Self {
        match local.cmp(&remote) {
            Ordering::Greater => Self::NewerLocal,
            Ordering::Less => Self::NewerRemote,
            Ordering::Equal => Self::BothModified,
        }
    }
}

/// User-chosen rule for entities that exist on both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    KeepLocal,
    KeepRemote,
    #[default]
    KeepNewer,
}

/// Outcome of resolving one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Not present locally; imported as new.
    ImportNew,
    /// Present locally; replaced by the incoming copy.
    Replace,
    /// Present locally; the local copy stays.
    KeepLocal,
}

impl Resolution {
    pub fn imports(&self) -> bool {
        !matches!(self, Self::KeepLocal)
    }
}

impl ConflictPolicy {
    /// Decides whether the incoming copy wins.
    ///
    /// `keep_newer` requires the remote copy to be strictly newer, so equal
    /// timestamps keep the local copy.
    pub fn resolve(&self, local: Option<Timestamp>, remote: Timestamp) -> Resolution {
        let Some(local) = local else {
            return Resolution::ImportNew;
        };
        let replace = match self {
            Self::KeepLocal => false,
            Self::KeepRemote => true,
            Self::KeepNewer => remote.is_after(&local),
        };
        if replace {
            Resolution::Replace
        } else {
            Resolution::KeepLocal
        }
    }

    /// Resolves a record-level conflict. A locked local record always stays.
    pub fn resolve_entity<T: Versioned>(&self, local: Option<&T>, remote: &T) -> Resolution {
        match local {
            Some(existing) if existing.is_locked() => Resolution::KeepLocal,
            _ => self.resolve(local.map(Versioned::updated_at), remote.updated_at()),
        }
    }
}

/// A project present on both devices, shown to the user before they pick
/// a policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictInfo {
    #[serde(rename = "type")]
    pub kind: ConflictKind,
    pub local_version: Timestamp,
    pub remote_version: Timestamp,
    pub entity_id: String,
    pub entity_label: String,
}

/// Compares local projects against the peer's metadata.
///
/// Returns one entry per project that exists on both sides, in the order of
/// the remote metadata. Remote-only projects are not conflicts.
pub fn detect_conflicts(local: &[Project], remote: &SyncMetadata) -> Vec<ConflictInfo> {
    let by_id: HashMap<ProjectId, &Project> = local.iter().map(|p| (p.id, p)).collect();
    remote
        .projects
        .iter()
        .filter_map(|summary| {
            let existing = by_id.get(&summary.id)?;
            Some(ConflictInfo {
                kind: ConflictKind::classify(existing.updated_at, summary.updated_at),
                local_version: existing.updated_at,
                remote_version: summary.updated_at,
                entity_id: summary.id.to_string(),
                entity_label: existing.title.clone(),
            })
        })
        .collect()
}
