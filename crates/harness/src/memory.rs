use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use loanrec_core::{
    ApplicationDraft, ApplicationId, ApplicationStatus, FieldUpdates, HistoryEntry,
    LoanApplicationRecord, Progress, UserId,
};
use loanrec_storage::{DocumentStore, LifecycleChange, StorageError};

use crate::lock;

#[derive(Default)]
struct Tables {
    records: HashMap<ApplicationId, LoanApplicationRecord>,
    /// Creation order, for listings.
    order: Vec<ApplicationId>,
}

/// In-memory `DocumentStore` with the same observable semantics as the
/// SQLite store.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronous peek at a stored record.
    pub fn record(&self, id: ApplicationId) -> Option<LoanApplicationRecord> {
        lock(&self.tables).records.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.tables).records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_record<R>(
        &self,
        id: ApplicationId,
        f: impl FnOnce(&mut LoanApplicationRecord) -> Result<R, StorageError>,
    ) -> Result<R, StorageError> {
        let mut tables = lock(&self.tables);
        let record = tables
            .records
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        f(record)
    }

    fn list(&self, matches: impl Fn(&LoanApplicationRecord) -> bool) -> Vec<LoanApplicationRecord> {
        let tables = lock(&self.tables);
        tables
            .order
            .iter()
            .filter_map(|id| tables.records.get(id))
            .filter(|record| !record.deleted && matches(record))
            .cloned()
            .collect()
    }
}

/// Every write gets a strictly later `updated_at` than the one before.
fn touch(record: &mut LoanApplicationRecord) -> DateTime<Utc> {
    let now = Utc::now();
    record.updated_at = if now > record.updated_at {
        now
    } else {
        record.updated_at + chrono::Duration::nanoseconds(1)
    };
    record.updated_at
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn create(&self, draft: &ApplicationDraft) -> Result<LoanApplicationRecord, StorageError> {
        let now = Utc::now();
        let record = LoanApplicationRecord {
            id: ApplicationId::new(),
            owner_id: draft.owner_id.clone(),
            broker_id: draft.broker_id.clone(),
            assigned_workforce_id: None,
            loan_program: draft.loan_program.clone(),
            loan_category: draft.loan_category,
            status: ApplicationStatus::Draft,
            deleted: false,
            sections: draft.sections.clone(),
            progress: draft.progress.clone(),
            history: vec![draft.created_entry.clone()],
            created_at: now,
            updated_at: now,
        };
        let mut tables = lock(&self.tables);
        tables.order.push(record.id);
        tables.records.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: ApplicationId) -> Result<Option<LoanApplicationRecord>, StorageError> {
        Ok(self.record(id))
    }

    async fn patch(
        &self,
        id: ApplicationId,
        updates: &FieldUpdates,
    ) -> Result<DateTime<Utc>, StorageError> {
        self.with_record(id, |record| {
            let mut sections = record.sections.clone();
            updates.apply_to(&mut sections)?;
            record.sections = sections;
            Ok(touch(record))
        })
    }

    async fn set_progress(&self, id: ApplicationId, progress: &Progress) -> Result<(), StorageError> {
        self.with_record(id, |record| {
            record.progress = progress.clone();
            Ok(())
        })
    }

    async fn append_history(&self, id: ApplicationId, entry: &HistoryEntry) -> Result<(), StorageError> {
        self.with_record(id, |record| {
            record.append_history(entry.clone());
            Ok(())
        })
    }

    async fn set_lifecycle(
        &self,
        id: ApplicationId,
        change: &LifecycleChange,
        entry: &HistoryEntry,
    ) -> Result<DateTime<Utc>, StorageError> {
        self.with_record(id, |record| {
            record.status = change.status;
            if let Some(assignee) = &change.assigned_workforce_id {
                record.assigned_workforce_id = Some(assignee.clone());
            }
            record.append_history(entry.clone());
            Ok(touch(record))
        })
    }

    async fn soft_delete(
        &self,
        id: ApplicationId,
        entry: &HistoryEntry,
    ) -> Result<DateTime<Utc>, StorageError> {
        self.with_record(id, |record| {
            record.deleted = true;
            record.append_history(entry.clone());
            Ok(touch(record))
        })
    }

    async fn restore(
        &self,
        id: ApplicationId,
        entry: &HistoryEntry,
    ) -> Result<DateTime<Utc>, StorageError> {
        self.with_record(id, |record| {
            record.deleted = false;
            record.append_history(entry.clone());
            Ok(touch(record))
        })
    }

    async fn list_by_owner(&self, owner: &UserId) -> Result<Vec<LoanApplicationRecord>, StorageError> {
        Ok(self.list(|record| &record.owner_id == owner))
    }

    async fn list_by_broker(&self, broker: &UserId) -> Result<Vec<LoanApplicationRecord>, StorageError> {
        Ok(self.list(|record| &record.broker_id == broker))
    }

    async fn list_by_assignee(
        &self,
        workforce: &UserId,
    ) -> Result<Vec<LoanApplicationRecord>, StorageError> {
        Ok(self.list(|record| record.assigned_workforce_id.as_ref() == Some(workforce)))
    }
}
