//! In-memory [`LocalStore`] backed by `RwLock`ed maps.

use crate::{LocalStore, StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::RwLock;
use tally_model::{Project, Record};
use tally_types::{ProjectId, RecordId};
use tracing::debug;

/// Serializable image of a whole store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    #[serde(default)]
    pub projects: Vec<Project>,
    #[serde(default)]
    pub records: Vec<Record>,
}

#[derive(Default)]
struct Tables {
    projects: HashMap<ProjectId, Project>,
    records: BTreeMap<RecordId, Record>,
}

/// Thread-safe store that keeps everything in memory.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store pre-populated from a snapshot.
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let mut tables = Tables::default();
        for project in snapshot.projects {
            tables.projects.insert(project.id, project);
        }
        for record in snapshot.records {
            tables.records.insert(record.id, record);
        }
        Self {
            tables: RwLock::new(tables),
        }
    }

    /// Loads a store from a JSON snapshot file.
    pub fn load(path: &Path) -> StoreResult<Self> {
        let bytes = std::fs::read(path)?;
        let snapshot: StoreSnapshot = serde_json::from_slice(&bytes)?;
        debug!(
            "Loaded {} projects / {} records from {}",
            snapshot.projects.len(),
            snapshot.records.len(),
            path.display()
        );
        Ok(Self::from_snapshot(snapshot))
    }

    /// Loads a store from `path`, or returns an empty store when the file
    /// does not exist yet.
    pub fn load_or_default(path: &Path) -> StoreResult<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::new())
        }
    }

    /// Copies the current contents into a snapshot. Projects are ordered by
    /// id so saved files diff cleanly.
    pub fn snapshot(&self) -> StoreResult<StoreSnapshot> {
        let tables = self.tables.read().map_err(|_| StoreError::Poisoned)?;
        let mut projects: Vec<Project> = tables.projects.values().cloned().collect();
        projects.sort_by_key(|p| p.id);
        let records = tables.records.values().cloned().collect();
        Ok(StoreSnapshot { projects, records })
    }

    /// Writes the current contents to a JSON snapshot file.
    pub fn save(&self, path: &Path) -> StoreResult<()> {
        let snapshot = self.snapshot()?;
        let json = serde_json::to_vec_pretty(&snapshot)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Looks up a single record by id.
    pub fn get_record(&self, id: &RecordId) -> StoreResult<Option<Record>> {
        let tables = self.tables.read().map_err(|_| StoreError::Poisoned)?;
        Ok(tables.records.get(id).cloned())
    }

    /// Looks up a single project by id.
    pub fn get_project(&self, id: &ProjectId) -> StoreResult<Option<Project>> {
        let tables = self.tables.read().map_err(|_| StoreError::Poisoned)?;
        Ok(tables.projects.get(id).cloned())
    }
}

impl LocalStore for MemoryStore {
    fn list_projects(&self) -> StoreResult<Vec<Project>> {
        let tables = self.tables.read().map_err(|_| StoreError::Poisoned)?;
        Ok(tables.projects.values().cloned().collect())
    }

    fn list_records(&self, project_id: &ProjectId) -> StoreResult<Vec<Record>> {
        let tables = self.tables.read().map_err(|_| StoreError::Poisoned)?;
        Ok(tables
            .records
            .values()
            .filter(|r| &r.project_id == project_id)
            .cloned()
            .collect())
    }

    fn upsert_project(&self, project: &Project) -> StoreResult<()> {
        let mut tables = self.tables.write().map_err(|_| StoreError::Poisoned)?;
        tables.projects.insert(project.id, project.clone());
        Ok(())
    }

    fn upsert_record(&self, record: &Record) -> StoreResult<()> {
        let mut tables = self.tables.write().map_err(|_| StoreError::Poisoned)?;
        if let Some(existing) = tables.records.get(&record.id) {
            if existing.is_locked {
                return Err(StoreError::Locked(record.id.to_string()));
            }
        }
        tables.records.insert(record.id, record.clone());
        Ok(())
    }

    fn record_count(&self) -> StoreResult<usize> {
        let tables = self.tables.read().map_err(|_| StoreError::Poisoned)?;
        Ok(tables.records.len())
    }
}
