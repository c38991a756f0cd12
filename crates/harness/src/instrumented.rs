use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use loanrec_core::{
    ApplicationDraft, ApplicationId, FieldUpdates, HistoryEntry, LoanApplicationRecord, Progress,
    UserId,
};
use loanrec_storage::{DocumentStore, LifecycleChange, StorageError};

use crate::lock;

/// Store failure to inject into `patch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    PermissionDenied,
    Unavailable,
}

impl Failure {
    fn to_error(self) -> StorageError {
        match self {
            Self::PermissionDenied => StorageError::PermissionDenied("injected: write not allowed".into()),
            Self::Unavailable => StorageError::Unavailable("injected: store offline".into()),
        }
    }
}

/// Wraps a store, counting calls, recording every `patch` batch and failing
/// patches on demand.
pub struct InstrumentedStore<S> {
    inner: S,
    calls: Mutex<BTreeMap<&'static str, usize>>,
    patches: Mutex<Vec<(ApplicationId, FieldUpdates)>>,
    one_shot: Mutex<VecDeque<Failure>>,
    persistent: Mutex<Option<Failure>>,
    patch_latency: Mutex<Option<Duration>>,
}

impl<S: DocumentStore> InstrumentedStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            calls: Mutex::new(BTreeMap::new()),
            patches: Mutex::new(Vec::new()),
            one_shot: Mutex::new(VecDeque::new()),
            persistent: Mutex::new(None),
            patch_latency: Mutex::new(None),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Fail the next `patch` call only.
    pub fn fail_next_patch(&self, failure: Failure) {
        lock(&self.one_shot).push_back(failure);
    }

    /// Fail every `patch` until cleared with `None`.
    pub fn fail_patches(&self, failure: Option<Failure>) {
        *lock(&self.persistent) = failure;
    }

    /// Make each `patch` take `latency` (on tokio's clock) before applying.
    pub fn set_patch_latency(&self, latency: Option<Duration>) {
        *lock(&self.patch_latency) = latency;
    }

    pub fn calls(&self, op: &str) -> usize {
        lock(&self.calls).get(op).copied().unwrap_or(0)
    }

    /// Successful and failed patch attempts alike.
    pub fn patch_count(&self) -> usize {
        self.calls("patch")
    }

    /// Batches the inner store accepted, in order.
    pub fn patches(&self) -> Vec<(ApplicationId, FieldUpdates)> {
        lock(&self.patches).clone()
    }

    pub fn last_patch(&self) -> Option<FieldUpdates> {
        lock(&self.patches).last().map(|(_, updates)| updates.clone())
    }

    fn count(&self, op: &'static str) {
        *lock(&self.calls).entry(op).or_insert(0) += 1;
    }

    fn injected(&self) -> Option<Failure> {
        lock(&self.one_shot)
            .pop_front()
            .or_else(|| *lock(&self.persistent))
    }
}

#[async_trait]
impl<S: DocumentStore> DocumentStore for InstrumentedStore<S> {
    async fn create(&self, draft: &ApplicationDraft) -> Result<LoanApplicationRecord, StorageError> {
        self.count("create");
        self.inner.create(draft).await
    }

    async fn get(&self, id: ApplicationId) -> Result<Option<LoanApplicationRecord>, StorageError> {
        self.count("get");
        self.inner.get(id).await
    }

    async fn patch(
        &self,
        id: ApplicationId,
        updates: &FieldUpdates,
    ) -> Result<DateTime<Utc>, StorageError> {
        self.count("patch");
        let latency = *lock(&self.patch_latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(failure) = self.injected() {
            return Err(failure.to_error());
        }
        let at = self.inner.patch(id, updates).await?;
        lock(&self.patches).push((id, updates.clone()));
        Ok(at)
    }

    async fn set_progress(&self, id: ApplicationId, progress: &Progress) -> Result<(), StorageError> {
        self.count("set_progress");
        self.inner.set_progress(id, progress).await
    }

    async fn append_history(&self, id: ApplicationId, entry: &HistoryEntry) -> Result<(), StorageError> {
        self.count("append_history");
        self.inner.append_history(id, entry).await
    }

    async fn set_lifecycle(
        &self,
        id: ApplicationId,
        change: &LifecycleChange,
        entry: &HistoryEntry,
    ) -> Result<DateTime<Utc>, StorageError> {
        self.count("set_lifecycle");
        self.inner.set_lifecycle(id, change, entry).await
    }

    async fn soft_delete(
        &self,
        id: ApplicationId,
        entry: &HistoryEntry,
    ) -> Result<DateTime<Utc>, StorageError> {
        self.count("soft_delete");
        self.inner.soft_delete(id, entry).await
    }

    async fn restore(
        &self,
        id: ApplicationId,
        entry: &HistoryEntry,
    ) -> Result<DateTime<Utc>, StorageError> {
        self.count("restore");
        self.inner.restore(id, entry).await
    }

    async fn list_by_owner(&self, owner: &UserId) -> Result<Vec<LoanApplicationRecord>, StorageError> {
        self.count("list_by_owner");
        self.inner.list_by_owner(owner).await
    }

    async fn list_by_broker(&self, broker: &UserId) -> Result<Vec<LoanApplicationRecord>, StorageError> {
        self.count("list_by_broker");
        self.inner.list_by_broker(broker).await
    }

    async fn list_by_assignee(
        &self,
        workforce: &UserId,
    ) -> Result<Vec<LoanApplicationRecord>, StorageError> {
        self.count("list_by_assignee");
        self.inner.list_by_assignee(workforce).await
    }
}
