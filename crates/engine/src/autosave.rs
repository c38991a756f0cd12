//! Debounced persistence of field edits.
//!
//! Each record gets one slot holding the pending batch and at most one timer.
//! Every new edit restarts the timer; when it fires, everything accumulated
//! since the last successful flush goes to the store as a single `patch`.
//! Flushes of the same record never overlap: the batch is taken when a flush
//! starts, so edits arriving meanwhile form the next batch.
//!
//! A batch the store refuses for lack of permission blocks the timer for that
//! record. Only an explicit flush retries it; `discard` drops it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use loanrec_core::{ApplicationId, CoreError, FieldUpdates, LoanApplicationRecord, UserId};
use loanrec_storage::DocumentStore;

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveStatus {
    #[default]
    Idle,
    Pending,
    Saving,
    Saved,
    Failed,
}

impl SaveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Pending => "pending",
            Self::Saving => "saving",
            Self::Saved => "saved",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SaveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was pending.
    Clean,
    /// The batch left the persisted content as it was; no store call made.
    Unchanged,
    Persisted { paths: usize },
}

/// Hook run after a batch reaches the store, while the record's flush lock
/// is still held.
#[async_trait]
pub trait FlushObserver: Send + Sync {
    /// `record` is the new persisted snapshot. Implementations may amend it
    /// with derived state they have themselves persisted.
    async fn persisted(
        &self,
        record: &mut LoanApplicationRecord,
        batch: &FieldUpdates,
        performed_by: &UserId,
    ) -> Result<(), EngineError>;
}

struct PendingBatch {
    updates: FieldUpdates,
    performed_by: UserId,
}

impl PendingBatch {
    fn absorb(&mut self, newer: PendingBatch) {
        self.updates.merge(newer.updates);
        self.performed_by = newer.performed_by;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Timer,
    Caller,
}

#[derive(Default)]
struct SlotState {
    pending: Option<PendingBatch>,
    timer: Option<JoinHandle<()>>,
    generation: u64,
    /// Last content known to be in the store.
    persisted: Option<LoanApplicationRecord>,
    status: SaveStatus,
    last_error: Option<String>,
    blocked: bool,
}

impl SlotState {
    fn settle(&mut self) {
        self.status = if self.pending.is_some() {
            SaveStatus::Pending
        } else {
            SaveStatus::Saved
        };
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[derive(Default)]
struct Slot {
    state: Mutex<SlotState>,
    flushing: tokio::sync::Mutex<()>,
}

impl Slot {
    fn state(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct SchedulerInner {
    store: Arc<dyn DocumentStore>,
    delay: Duration,
    observer: Option<Arc<dyn FlushObserver>>,
    slots: Mutex<HashMap<ApplicationId, Arc<Slot>>>,
}

#[derive(Clone)]
pub struct AutoSaveScheduler {
    inner: Arc<SchedulerInner>,
}

impl AutoSaveScheduler {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        delay: Duration,
        observer: Option<Arc<dyn FlushObserver>>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                delay,
                observer,
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn delay(&self) -> Duration {
        self.inner.delay
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<ApplicationId, Arc<Slot>>> {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn slot(&self, id: ApplicationId) -> Arc<Slot> {
        self.slots().entry(id).or_default().clone()
    }

    fn existing(&self, id: ApplicationId) -> Option<Arc<Slot>> {
        self.slots().get(&id).cloned()
    }

    /// Seed the persisted snapshot so the first flush needs no store read.
    pub fn prime(&self, record: &LoanApplicationRecord) {
        let slot = self.slot(record.id);
        let mut state = slot.state();
        if state.persisted.is_none() {
            state.persisted = Some(record.clone());
        }
    }

    /// Amend the persisted snapshot after a write made outside a flush.
    pub fn amend_snapshot<F>(&self, id: ApplicationId, f: F)
    where
        F: FnOnce(&mut LoanApplicationRecord),
    {
        let Some(slot) = self.existing(id) else {
            return;
        };
        let mut state = slot.state();
        if let Some(snapshot) = state.persisted.as_mut() {
            f(snapshot);
        }
    }

    /// Queue `updates` and restart the record's debounce window.
    pub fn schedule(&self, id: ApplicationId, updates: FieldUpdates, performed_by: &UserId) {
        if updates.is_empty() {
            return;
        }
        let slot = self.slot(id);
        let mut state = slot.state();
        let batch = PendingBatch {
            updates,
            performed_by: performed_by.clone(),
        };
        match state.pending.as_mut() {
            Some(pending) => pending.absorb(batch),
            None => state.pending = Some(batch),
        }

        if state.blocked {
            debug!(application = %id, "autosave blocked, edit kept in memory only");
            return;
        }

        state.cancel_timer();
        state.generation += 1;
        if state.status != SaveStatus::Saving {
            state.status = SaveStatus::Pending;
        }

        let generation = state.generation;
        let scheduler = self.clone();
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(scheduler.inner.delay).await;
            scheduler.fire(id, generation).await;
        }));
    }

    async fn fire(&self, id: ApplicationId, generation: u64) {
        let Some(slot) = self.existing(id) else {
            return;
        };
        {
            let mut state = slot.state();
            if state.generation != generation {
                return;
            }
            // Detach before flushing so a later `schedule` cannot abort us
            // halfway through a store write.
            state.timer = None;
        }
        match self.flush_slot(id, &slot, Trigger::Timer).await {
            Ok(_) => {}
            Err(e) if e.is_permission_denied() => {}
            Err(e) => warn!(application = %id, error = %e, "autosave flush failed"),
        }
    }

    /// Persist whatever is pending for `id` now, retrying a blocked batch.
    pub async fn flush(&self, id: ApplicationId) -> Result<FlushOutcome, EngineError> {
        match self.existing(id) {
            Some(slot) => self.flush_slot(id, &slot, Trigger::Caller).await,
            None => Ok(FlushOutcome::Clean),
        }
    }

    /// Queue `updates` and persist them without waiting for the timer.
    pub async fn flush_now(
        &self,
        id: ApplicationId,
        updates: FieldUpdates,
        performed_by: &UserId,
    ) -> Result<FlushOutcome, EngineError> {
        {
            let slot = self.slot(id);
            let mut state = slot.state();
            let batch = PendingBatch {
                updates,
                performed_by: performed_by.clone(),
            };
            match state.pending.as_mut() {
                Some(pending) => pending.absorb(batch),
                None => state.pending = Some(batch),
            }
        }
        self.flush(id).await
    }

    async fn flush_slot(
        &self,
        id: ApplicationId,
        slot: &Arc<Slot>,
        trigger: Trigger,
    ) -> Result<FlushOutcome, EngineError> {
        let _serial = slot.flushing.lock().await;

        let (batch, snapshot) = {
            let mut state = slot.state();
            if state.blocked {
                if trigger == Trigger::Timer {
                    let reason = state
                        .last_error
                        .clone()
                        .unwrap_or_else(|| format!("autosave blocked for {id}"));
                    return Err(EngineError::PermissionDenied(reason));
                }
                debug!(application = %id, "retrying batch the store refused earlier");
                state.blocked = false;
            }
            let Some(batch) = state.pending.take() else {
                return Ok(FlushOutcome::Clean);
            };
            state.cancel_timer();
            state.status = SaveStatus::Saving;
            (batch, state.persisted.clone())
        };

        let base = match snapshot {
            Some(record) => record,
            None => match self.inner.store.get(id).await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    let err = EngineError::ApplicationNotFound(id);
                    return Err(self.fail(id, slot, batch, err));
                }
                Err(e) => return Err(self.fail(id, slot, batch, e.into())),
            },
        };

        let mut next = match apply_batch(&base, &batch.updates) {
            Ok(Some(next)) => next,
            Ok(None) => {
                // The snapshot may predate writes from elsewhere; only skip
                // when the store still holds exactly what it describes.
                let current = match self.inner.store.get(id).await {
                    Ok(Some(record)) => record,
                    Ok(None) => {
                        let err = EngineError::ApplicationNotFound(id);
                        return Err(self.fail(id, slot, batch, err));
                    }
                    Err(e) => return Err(self.fail(id, slot, batch, e.into())),
                };
                if current.updated_at == base.updated_at {
                    debug!(application = %id, "batch leaves content unchanged, skipping write");
                    let mut state = slot.state();
                    state.persisted = Some(current);
                    state.last_error = None;
                    state.settle();
                    return Ok(FlushOutcome::Unchanged);
                }
                debug!(application = %id, "store changed since last flush, rebasing batch");
                match apply_batch(&current, &batch.updates) {
                    Ok(Some(next)) => next,
                    Ok(None) => {
                        let mut state = slot.state();
                        state.persisted = Some(current);
                        state.last_error = None;
                        state.settle();
                        return Ok(FlushOutcome::Unchanged);
                    }
                    Err(e) => return Err(self.fail(id, slot, batch, e.into())),
                }
            }
            Err(e) => return Err(self.fail(id, slot, batch, e.into())),
        };

        match self.inner.store.patch(id, &batch.updates).await {
            Ok(at) => next.updated_at = at,
            Err(e) => return Err(self.fail(id, slot, batch, e.into())),
        }
        let paths = batch.updates.len();
        debug!(application = %id, path_count = paths, "batch persisted");

        let observed = match &self.inner.observer {
            Some(observer) => {
                observer
                    .persisted(&mut next, &batch.updates, &batch.performed_by)
                    .await
            }
            None => Ok(()),
        };

        let mut state = slot.state();
        state.persisted = Some(next);
        state.settle();
        match observed {
            Ok(()) => {
                state.last_error = None;
                Ok(FlushOutcome::Persisted { paths })
            }
            Err(e) => {
                warn!(application = %id, error = %e, "post-save refresh failed");
                state.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Put a failed batch back underneath anything queued since, and record
    /// the failure. Permission failures block the slot.
    fn fail(
        &self,
        id: ApplicationId,
        slot: &Slot,
        batch: PendingBatch,
        err: EngineError,
    ) -> EngineError {
        let mut state = slot.state();
        let mut restored = batch;
        if let Some(newer) = state.pending.take() {
            restored.absorb(newer);
        }
        state.pending = Some(restored);
        state.status = SaveStatus::Failed;
        state.last_error = Some(err.to_string());
        if err.is_permission_denied() {
            state.blocked = true;
            state.cancel_timer();
            warn!(application = %id, error = %err, "autosave blocked after permission failure");
        } else {
            debug!(application = %id, error = %err, "flush failed, batch kept for retry");
        }
        err
    }

    pub fn has_unsaved_changes(&self, id: ApplicationId) -> bool {
        let Some(slot) = self.existing(id) else {
            return false;
        };
        let state = slot.state();
        state.pending.is_some() || state.status == SaveStatus::Saving
    }

    pub fn save_status(&self, id: ApplicationId) -> SaveStatus {
        let Some(slot) = self.existing(id) else {
            return SaveStatus::Idle;
        };
        let status = slot.state().status;
        status
    }

    pub fn last_error(&self, id: ApplicationId) -> Option<String> {
        let slot = self.existing(id)?;
        let error = slot.state().last_error.clone();
        error
    }

    pub fn is_blocked(&self, id: ApplicationId) -> bool {
        let Some(slot) = self.existing(id) else {
            return false;
        };
        let blocked = slot.state().blocked;
        blocked
    }

    /// Drop whatever is pending for `id` and lift a block. Returns whether a
    /// batch was thrown away. The slot is forgotten, so the next edit starts
    /// from a fresh snapshot.
    pub async fn discard(&self, id: ApplicationId) -> bool {
        let Some(slot) = self.existing(id) else {
            return false;
        };
        let _serial = slot.flushing.lock().await;
        let dropped = {
            let mut state = slot.state();
            state.cancel_timer();
            state.blocked = false;
            state.pending.take()
        };
        self.slots().remove(&id);
        match &dropped {
            Some(batch) => warn!(
                application = %id,
                path_count = batch.updates.len(),
                "pending edits discarded"
            ),
            None => debug!(application = %id, "nothing pending to discard"),
        }
        dropped.is_some()
    }

    /// Flush and forget the slot. On failure the slot and its batch stay.
    pub async fn release(&self, id: ApplicationId) -> Result<(), EngineError> {
        loop {
            self.flush(id).await?;
            if self.retire(id) {
                return Ok(());
            }
        }
    }

    /// Drop the slot if nothing arrived since the last flush.
    fn retire(&self, id: ApplicationId) -> bool {
        let mut slots = self.slots();
        let idle = match slots.get(&id) {
            None => return true,
            Some(slot) => {
                let mut state = slot.state();
                let idle = state.pending.is_none();
                if idle {
                    state.cancel_timer();
                }
                idle
            }
        };
        if idle {
            slots.remove(&id);
            debug!(application = %id, "autosave slot released");
        }
        idle
    }
}

/// `base` with `updates` applied, or `None` when that changes no content.
fn apply_batch(
    base: &LoanApplicationRecord,
    updates: &FieldUpdates,
) -> Result<Option<LoanApplicationRecord>, CoreError> {
    let mut next = base.clone();
    next.apply(updates)?;
    if next.content_digest()? == base.content_digest()? {
        Ok(None)
    } else {
        Ok(Some(next))
    }
}
