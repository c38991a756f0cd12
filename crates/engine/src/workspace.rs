use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use loanrec_core::{ApplicationId, CoreError, LoanApplicationRecord};

/// Optimistic in-memory copies of records being edited. Field edits land
/// here before the store sees them.
#[derive(Default)]
pub(crate) struct Workspace {
    records: Mutex<HashMap<ApplicationId, LoanApplicationRecord>>,
}

impl Workspace {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ApplicationId, LoanApplicationRecord>> {
        // Mutations below never leave a record half-written.
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn get(&self, id: ApplicationId) -> Option<LoanApplicationRecord> {
        self.lock().get(&id).cloned()
    }

    /// Keep an existing copy; otherwise store `record`. Returns the copy in use.
    pub(crate) fn adopt(&self, record: LoanApplicationRecord) -> LoanApplicationRecord {
        self.lock().entry(record.id).or_insert(record).clone()
    }

    pub(crate) fn insert(&self, record: LoanApplicationRecord) {
        self.lock().insert(record.id, record);
    }

    /// Apply `f` to a scratch clone and commit it only if `f` succeeds.
    pub(crate) fn try_update<F>(&self, id: ApplicationId, f: F) -> Result<bool, CoreError>
    where
        F: FnOnce(&mut LoanApplicationRecord) -> Result<(), CoreError>,
    {
        let mut records = self.lock();
        let Some(current) = records.get_mut(&id) else {
            return Ok(false);
        };
        let mut next = current.clone();
        f(&mut next)?;
        *current = next;
        Ok(true)
    }

    pub(crate) fn update<F>(&self, id: ApplicationId, f: F)
    where
        F: FnOnce(&mut LoanApplicationRecord),
    {
        if let Some(record) = self.lock().get_mut(&id) {
            f(record);
        }
    }

    pub(crate) fn ids(&self) -> Vec<ApplicationId> {
        self.lock().keys().copied().collect()
    }

    pub(crate) fn remove(&self, id: ApplicationId) -> Option<LoanApplicationRecord> {
        self.lock().remove(&id)
    }
}
