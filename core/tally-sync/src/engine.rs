//! Sync engine - message production without I/O.
//!
//! The engine turns the local store into protocol messages (metadata,
//! payloads) and decides whether an incoming request can be served. It never
//! touches the network; the orchestrator owns all I/O and calls into the
//! engine from blocking worker threads.

use crate::conflict::{ConflictInfo, detect_conflicts};
use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::protocol::{
    Direction, ProjectSummary, RejectMessage, SyncDataPayload, SyncMetadata, SyncSelection,
};
use std::collections::BTreeSet;
use tally_store::LocalStore;
use tally_types::{PeerId, ProjectId};
use tracing::debug;

/// Who this device is. Handed in at construction, never looked up globally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub peer_id: PeerId,
    pub label: String,
}

impl DeviceIdentity {
    pub fn new(peer_id: PeerId, label: impl Into<String>) -> Self {
        Self {
            peer_id,
            label: label.into(),
        }
    }
}

/// Produces protocol messages from local state.
#[derive(Debug, Clone)]
pub struct SyncEngine {
    identity: DeviceIdentity,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(identity: DeviceIdentity, config: SyncConfig) -> Self {
        Self { identity, config }
    }

    /// Returns our peer ID.
    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    // ── Message producers ────────────────────────────────────────

    /// Snapshot of what this device holds.
    pub fn metadata(&self, store: &dyn LocalStore) -> SyncResult<SyncMetadata> {
        let mut summaries = Vec::new();
        for project in store.list_projects()? {
            let records = store.list_records(&project.id)?.len();
            summaries.push(ProjectSummary::from_project(&project, records));
        }
        summaries.sort_by(|a, b| a.title.cmp(&b.title).then(a.id.cmp(&b.id)));
        debug!("Built metadata for {} projects", summaries.len());
        Ok(SyncMetadata::new(
            self.identity.peer_id,
            self.identity.label.clone(),
            summaries,
        ))
    }

    /// The selected projects this device owns, with all their records.
    /// Selected ids unknown locally are skipped.
    pub fn payload(
        &self,
        store: &dyn LocalStore,
        project_ids: &BTreeSet<ProjectId>,
    ) -> SyncResult<SyncDataPayload> {
        let mut payload = SyncDataPayload::default();
        for project in store.list_projects()? {
            if !project_ids.contains(&project.id) {
                continue;
            }
            payload.records.extend(store.list_records(&project.id)?);
            payload.projects.push(project);
        }
        payload.projects.sort_by_key(|p| p.id);
        debug!(
            "Built payload: {} projects, {} records",
            payload.projects.len(),
            payload.records.len()
        );
        Ok(payload)
    }

    /// Conflicts between local projects and the peer's metadata.
    pub fn conflicts(
        &self,
        store: &dyn LocalStore,
        remote: &SyncMetadata,
    ) -> SyncResult<Vec<ConflictInfo>> {
        Ok(detect_conflicts(&store.list_projects()?, remote))
    }

    // ── Request handling ─────────────────────────────────────────

    /// Decides whether an incoming selection can be served.
    ///
    /// A `receive` request must only name projects this device holds. A
    /// `bidirectional` request may also name projects the requester
    /// advertised in its metadata. A `send` request carries the requester's
    /// own projects and is not checked.
    pub fn review_request(
        &self,
        store: &dyn LocalStore,
        selection: &SyncSelection,
        requester: Option<&SyncMetadata>,
    ) -> SyncResult<Result<(), RejectMessage>> {
        if selection.project_ids.is_empty() {
            return Ok(Err(RejectMessage {
                reason: "no projects selected".into(),
            }));
        }
        if selection.direction == Direction::Send {
            return Ok(Ok(()));
        }

        let mut known: BTreeSet<ProjectId> =
            store.list_projects()?.into_iter().map(|p| p.id).collect();
        if selection.direction == Direction::Bidirectional {
            if let Some(meta) = requester {
                known.extend(meta.projects.iter().map(|p| p.id));
            }
        }
        let missing = selection.project_ids.difference(&known).count();
        if missing > 0 {
            return Ok(Err(RejectMessage {
                reason: format!("{missing} selected project(s) not found on this device"),
            }));
        }
        Ok(Ok(()))
    }
}
