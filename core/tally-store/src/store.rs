use crate::StoreResult;
use tally_model::{Project, Record};
use tally_types::ProjectId;

/// The persistence contract the sync engine depends on.
///
/// Implementations must be safe to share across threads; sync calls them
/// from blocking worker threads.
pub trait LocalStore: Send + Sync {
    /// All projects, in no particular order.
    fn list_projects(&self) -> StoreResult<Vec<Project>>;

    /// All records of one project. An unknown project yields an empty list.
    fn list_records(&self, project_id: &ProjectId) -> StoreResult<Vec<Record>>;

    /// Inserts or replaces a project by id.
    fn upsert_project(&self, project: &Project) -> StoreResult<()>;

    /// Inserts or replaces a record by id.
    ///
    /// Fails with [`StoreError::Locked`](crate::StoreError::Locked) when a
    /// stored record with the same id is locked.
    fn upsert_record(&self, record: &Record) -> StoreResult<()>;

    /// Total number of records across all projects.
    fn record_count(&self) -> StoreResult<usize> {
        let mut total = 0;
        for project in self.list_projects()? {
            total += self.list_records(&project.id)?.len();
        }
        Ok(total)
    }
}
