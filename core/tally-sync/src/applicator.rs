//! Payload applicator - merges a received payload into the local store.
//!
//! Projects are applied first, then records. Every entity goes through the
//! conflict policy; records without a local twin additionally go through
//! the fingerprint index so content duplicates are skipped.

use crate::conflict::{ConflictPolicy, Resolution};
use crate::fingerprint::FingerprintIndex;
use crate::protocol::SyncDataPayload;
use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tally_model::Record;
use tally_store::LocalStore;
use tally_types::{ProjectId, RecordId};
use tracing::{debug, info, warn};

/// Outcome of one import, also the final result of a sync run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub success: bool,
    pub projects_imported: usize,
    pub records_imported: usize,
    pub projects_skipped: usize,
    pub records_skipped: usize,
    pub message: String,
}

impl ImportSummary {
    /// Result reported by a device that only sent data.
    pub fn sent(projects: usize, records: usize) -> Self {
        Self {
            success: true,
            message: format!("Sent {projects} projects and {records} records"),
            ..Self::default()
        }
    }

    /// Adds another summary's counts to this one.
    pub fn absorb(&mut self, other: &ImportSummary) {
        self.projects_imported += other.projects_imported;
        self.records_imported += other.records_imported;
        self.projects_skipped += other.projects_skipped;
        self.records_skipped += other.records_skipped;
    }

    fn describe(&self) -> String {
        format!(
            "Imported {} projects and {} records ({} projects, {} records skipped)",
            self.projects_imported,
            self.records_imported,
            self.projects_skipped,
            self.records_skipped
        )
    }
}

/// Applies received payloads using one conflict policy.
#[derive(Debug, Clone, Copy)]
pub struct PayloadApplicator {
    policy: ConflictPolicy,
}

impl PayloadApplicator {
    pub fn new(policy: ConflictPolicy) -> Self {
        Self { policy }
    }

    /// Applies a payload. Never fails as a whole: a store error stops the
    /// import and is reported through `success`/`message`, with counts for
    /// what was applied before it.
    pub fn apply(&self, store: &dyn LocalStore, payload: &SyncDataPayload) -> ImportSummary {
        let mut summary = ImportSummary::default();
        match self.apply_into(store, payload, &mut summary) {
            Ok(()) => {
                summary.success = true;
                summary.message = summary.describe();
                info!("[SYNC] {}", summary.message);
            }
            Err(e) => {
                summary.success = false;
                summary.message = format!("Import stopped: {e}. {}", summary.describe());
                warn!("[SYNC] {}", summary.message);
            }
        }
        summary
    }

    fn apply_into(
        &self,
        store: &dyn LocalStore,
        payload: &SyncDataPayload,
        summary: &mut ImportSummary,
    ) -> SyncResult<()> {
        let local_projects: HashMap<ProjectId, _> = store
            .list_projects()?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();

        for project in &payload.projects {
            let resolution = self.policy.resolve_entity(local_projects.get(&project.id), project);
            if resolution.imports() {
                store.upsert_project(project)?;
                summary.projects_imported += 1;
                debug!("Project {} {:?}", project.id, resolution);
            } else {
                summary.projects_skipped += 1;
            }
        }

        let touched: BTreeSet<ProjectId> = payload.records.iter().map(|r| r.project_id).collect();
        let mut local_records: HashMap<RecordId, Record> = HashMap::new();
        for project_id in &touched {
            for record in store.list_records(project_id)? {
                local_records.insert(record.id, record);
            }
        }
        let mut index = FingerprintIndex::from_records(local_records.values());

        for record in &payload.records {
            let resolution = match local_records.get(&record.id) {
                Some(existing) => self.policy.resolve_entity(Some(existing), record),
                None if index.contains(record) => {
                    debug!("Record {} duplicates local content", record.id);
                    Resolution::KeepLocal
                }
                None => Resolution::ImportNew,
            };
            if !resolution.imports() {
                summary.records_skipped += 1;
                continue;
            }

            match store.upsert_record(record) {
                Ok(()) => {
                    summary.records_imported += 1;
                    index.insert(record);
                    local_records.insert(record.id, record.clone());
                }
                Err(e) => match SyncError::from(e) {
                    SyncError::LockedRecord(id) => {
                        warn!("Skipping locked record {id}");
                        summary.records_skipped += 1;
                    }
                    other => return Err(other),
                },
            }
        }
        Ok(())
    }
}
