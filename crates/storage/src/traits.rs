use async_trait::async_trait;
use chrono::{DateTime, Utc};

use loanrec_core::{
    ApplicationDraft, ApplicationId, ApplicationStatus, FieldUpdates, HistoryEntry,
    LoanApplicationRecord, Progress, UserId,
};

use crate::error::StorageError;

/// Status and assignee written together by a lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleChange {
    pub status: ApplicationStatus,
    /// `None` leaves the current assignee untouched.
    pub assigned_workforce_id: Option<UserId>,
}

/// Key-addressed document database holding one record per application.
///
/// Every write that carries a [`HistoryEntry`] appends it in the same atomic
/// step as the change it describes. No method edits or removes history.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn create(&self, draft: &ApplicationDraft) -> Result<LoanApplicationRecord, StorageError>;

    async fn get(&self, id: ApplicationId) -> Result<Option<LoanApplicationRecord>, StorageError>;

    /// Apply path writes to the section containers in order. Returns the new
    /// `updated_at`.
    async fn patch(
        &self,
        id: ApplicationId,
        updates: &FieldUpdates,
    ) -> Result<DateTime<Utc>, StorageError>;

    async fn set_progress(&self, id: ApplicationId, progress: &Progress) -> Result<(), StorageError>;

    async fn append_history(&self, id: ApplicationId, entry: &HistoryEntry) -> Result<(), StorageError>;

    async fn set_lifecycle(
        &self,
        id: ApplicationId,
        change: &LifecycleChange,
        entry: &HistoryEntry,
    ) -> Result<DateTime<Utc>, StorageError>;

    async fn soft_delete(
        &self,
        id: ApplicationId,
        entry: &HistoryEntry,
    ) -> Result<DateTime<Utc>, StorageError>;

    async fn restore(
        &self,
        id: ApplicationId,
        entry: &HistoryEntry,
    ) -> Result<DateTime<Utc>, StorageError>;

    /// Live (not soft-deleted) records owned by `owner`, oldest first.
    async fn list_by_owner(&self, owner: &UserId) -> Result<Vec<LoanApplicationRecord>, StorageError>;

    async fn list_by_broker(&self, broker: &UserId) -> Result<Vec<LoanApplicationRecord>, StorageError>;

    async fn list_by_assignee(
        &self,
        workforce: &UserId,
    ) -> Result<Vec<LoanApplicationRecord>, StorageError>;
}
