pub mod access;
pub mod autosave;
pub mod config;
pub mod error;
mod refresh;
pub mod service;
pub mod session;
mod workspace;

pub use access::{AccessPolicy, Action, AllowAll, ListScope, RolePolicy, Subject};
pub use autosave::{AutoSaveScheduler, FlushObserver, FlushOutcome, SaveStatus};
pub use config::EngineConfig;
pub use error::{EngineError, ErrorKind};
pub use service::RecordService;
pub use session::EditSession;

use std::sync::Arc;

use tracing::{debug, info, warn};

use loanrec_core::{
    ApplicationDraft, ApplicationId, ApplicationStatus, CallerIdentity, CoreError, FieldMap,
    FieldUpdates, FieldValue, HistoryAction, HistoryEntry, LifecycleAction, LifecycleState,
    LoanApplicationRecord, ManifestRegistry, Progress, SessionId, TransitionPolicy, UserId,
    progress,
};
use loanrec_storage::{DocumentStore, LifecycleChange, SqliteStorage};

use crate::refresh::ProgressRefresher;
use crate::workspace::Workspace;

/// Everything needed to open a new application.
#[derive(Debug, Clone)]
pub struct NewApplication {
    pub owner_id: UserId,
    pub broker_id: UserId,
    pub loan_program: String,
    pub initial: FieldUpdates,
}

impl NewApplication {
    pub fn new(owner_id: UserId, broker_id: UserId, loan_program: impl Into<String>) -> Self {
        Self {
            owner_id,
            broker_id,
            loan_program: loan_program.into(),
            initial: FieldUpdates::new(),
        }
    }

    pub fn with_initial(mut self, initial: FieldUpdates) -> Self {
        self.initial = initial;
        self
    }
}

struct EngineInner {
    store: Arc<dyn DocumentStore>,
    registry: Arc<ManifestRegistry>,
    access: Arc<dyn AccessPolicy>,
    transitions: TransitionPolicy,
    scheduler: AutoSaveScheduler,
    workspace: Arc<Workspace>,
    refresher: Arc<ProgressRefresher>,
}

/// Front door to application records. Cheap to clone; clones share the
/// working copies and the auto-save scheduler.
#[derive(Clone)]
pub struct RecordEngine {
    inner: Arc<EngineInner>,
}

impl RecordEngine {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        registry: ManifestRegistry,
        config: &EngineConfig,
    ) -> Self {
        Self::with_access_policy(store, registry, config, Arc::new(AllowAll))
    }

    pub fn with_access_policy(
        store: Arc<dyn DocumentStore>,
        registry: ManifestRegistry,
        config: &EngineConfig,
        access: Arc<dyn AccessPolicy>,
    ) -> Self {
        let registry = Arc::new(registry);
        let workspace = Arc::new(Workspace::new());
        let refresher = Arc::new(ProgressRefresher::new(
            store.clone(),
            registry.clone(),
            workspace.clone(),
            config.autosave.summary_history,
        ));
        let scheduler = AutoSaveScheduler::new(
            store.clone(),
            config.autosave.delay(),
            Some(refresher.clone() as Arc<dyn FlushObserver>),
        );
        Self {
            inner: Arc::new(EngineInner {
                store,
                registry,
                access,
                transitions: config.lifecycle.policy,
                scheduler,
                workspace,
                refresher,
            }),
        }
    }

    /// SQLite store and manifests as named by `config`, with the role table.
    pub fn open(config: &EngineConfig) -> Result<Self, EngineError> {
        let store = if config.storage.path == ":memory:" {
            SqliteStorage::open_in_memory()?
        } else {
            SqliteStorage::open(&config.storage.path)?
        };
        let registry = config.manifest_registry()?;
        info!(
            storage = %config.storage.path,
            programs = registry.program_names().count(),
            policy = ?config.lifecycle.policy,
            "record engine opened"
        );
        Ok(Self::with_access_policy(
            Arc::new(store),
            registry,
            config,
            Arc::new(RolePolicy),
        ))
    }

    pub fn registry(&self) -> &ManifestRegistry {
        &self.inner.registry
    }

    pub fn scheduler(&self) -> &AutoSaveScheduler {
        &self.inner.scheduler
    }

    fn authorize(
        &self,
        caller: &CallerIdentity,
        action: Action,
        subject: Subject<'_>,
    ) -> Result<(), EngineError> {
        if self.inner.access.allows(caller, action, subject) {
            Ok(())
        } else {
            debug!(%caller, %action, %subject, "access denied");
            Err(EngineError::PermissionDenied(format!(
                "{caller} may not {action} {subject}"
            )))
        }
    }

    async fn stored(&self, id: ApplicationId) -> Result<LoanApplicationRecord, EngineError> {
        self.inner
            .store
            .get(id)
            .await?
            .ok_or(EngineError::ApplicationNotFound(id))
    }

    /// Working copy when loaded, stored record otherwise. Nothing is adopted.
    async fn current(&self, id: ApplicationId) -> Result<LoanApplicationRecord, EngineError> {
        match self.inner.workspace.get(id) {
            Some(record) => Ok(record),
            None => self.stored(id).await,
        }
    }

    /// Working copy, loading it from the store on first use.
    async fn working_copy(&self, id: ApplicationId) -> Result<LoanApplicationRecord, EngineError> {
        if let Some(record) = self.inner.workspace.get(id) {
            return Ok(record);
        }
        let record = self.stored(id).await?;
        self.inner.scheduler.prime(&record);
        Ok(self.inner.workspace.adopt(record))
    }

    // =========================================================================
    // Creation and reads
    // =========================================================================

    pub async fn create_application(
        &self,
        caller: &CallerIdentity,
        request: NewApplication,
    ) -> Result<ApplicationId, EngineError> {
        self.authorize(
            caller,
            Action::Create,
            Subject::NewApplication {
                owner_id: &request.owner_id,
                broker_id: &request.broker_id,
            },
        )?;

        let manifest = self.inner.registry.get(&request.loan_program)?;
        for (path, value) in request.initial.iter() {
            manifest.validate_write(path, value)?;
        }
        let mut sections = FieldMap::new();
        request.initial.apply_to(&mut sections)?;

        let draft = ApplicationDraft {
            progress: progress::compute_sections(&sections, manifest),
            created_entry: HistoryEntry::new(
                HistoryAction::Created,
                format!("Application created for {}", request.loan_program),
                &caller.user_id,
            ),
            loan_category: manifest.category,
            owner_id: request.owner_id,
            broker_id: request.broker_id,
            loan_program: request.loan_program,
            sections,
        };

        let record = self.inner.store.create(&draft).await?;
        info!(
            application = %record.id,
            program = %record.loan_program,
            owner = %record.owner_id,
            "application created"
        );
        let id = record.id;
        self.inner.scheduler.prime(&record);
        self.inner.workspace.insert(record);
        Ok(id)
    }

    /// The working copy when one is loaded (reflecting unsaved edits), the
    /// stored record otherwise.
    pub async fn get_application(
        &self,
        caller: &CallerIdentity,
        id: ApplicationId,
    ) -> Result<LoanApplicationRecord, EngineError> {
        let record = self.current(id).await?;
        self.authorize(caller, Action::Read, Subject::Record(&record))?;
        Ok(record)
    }

    // =========================================================================
    // Field edits
    // =========================================================================

    pub async fn update_field(
        &self,
        caller: &CallerIdentity,
        id: ApplicationId,
        path: &str,
        value: impl Into<FieldValue>,
    ) -> Result<(), EngineError> {
        let updates = FieldUpdates::parse([(path, value.into())])?;
        self.update_fields(caller, id, updates).await
    }

    /// Apply `updates` to the working copy right away and queue them for the
    /// next auto-save.
    pub async fn update_fields(
        &self,
        caller: &CallerIdentity,
        id: ApplicationId,
        updates: FieldUpdates,
    ) -> Result<(), EngineError> {
        if updates.is_empty() {
            return Ok(());
        }
        let record = self.working_copy(id).await?;
        self.authorize(caller, Action::Edit, Subject::Record(&record))?;
        check_editable(&record)?;

        let manifest = self.inner.registry.get(&record.loan_program)?;
        for (path, value) in updates.iter() {
            manifest.validate_write(path, value)?;
        }

        let found = self.inner.workspace.try_update(id, |copy| {
            check_editable(copy)?;
            copy.apply(&updates)
        })?;
        if !found {
            // Copy was released meanwhile; re-adopt it with the edit applied.
            let mut copy = record;
            copy.apply(&updates)?;
            self.inner.workspace.adopt(copy);
        }

        debug!(application = %id, path_count = updates.len(), "fields updated in memory");
        self.inner.scheduler.schedule(id, updates, &caller.user_id);
        Ok(())
    }

    /// Persist pending edits now instead of waiting for the debounce window.
    pub async fn flush(
        &self,
        caller: &CallerIdentity,
        id: ApplicationId,
    ) -> Result<FlushOutcome, EngineError> {
        let record = self.current(id).await?;
        self.authorize(caller, Action::Edit, Subject::Record(&record))?;
        self.inner.scheduler.flush(id).await
    }

    /// Throw away edits not yet persisted and drop the working copy, so the
    /// next read comes from the store. Returns whether anything was pending.
    pub async fn discard_changes(
        &self,
        caller: &CallerIdentity,
        id: ApplicationId,
    ) -> Result<bool, EngineError> {
        let record = self.current(id).await?;
        self.authorize(caller, Action::Edit, Subject::Record(&record))?;
        let dropped = self.inner.scheduler.discard(id).await;
        self.inner.workspace.remove(id);
        info!(application = %id, %caller, dropped, "unsaved changes discarded");
        Ok(dropped)
    }

    pub fn has_unsaved_changes(&self, id: ApplicationId) -> bool {
        self.inner.scheduler.has_unsaved_changes(id)
    }

    pub fn save_status(&self, id: ApplicationId) -> SaveStatus {
        self.inner.scheduler.save_status(id)
    }

    pub fn last_save_error(&self, id: ApplicationId) -> Option<String> {
        self.inner.scheduler.last_error(id)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub async fn submit(
        &self,
        caller: &CallerIdentity,
        id: ApplicationId,
    ) -> Result<LoanApplicationRecord, EngineError> {
        self.transition(caller, id, LifecycleAction::Submit, None).await
    }

    pub async fn assign(
        &self,
        caller: &CallerIdentity,
        id: ApplicationId,
        workforce_id: UserId,
    ) -> Result<LoanApplicationRecord, EngineError> {
        self.transition(caller, id, LifecycleAction::Assign, Some(workforce_id))
            .await
    }

    pub async fn set_status(
        &self,
        caller: &CallerIdentity,
        id: ApplicationId,
        status: ApplicationStatus,
    ) -> Result<LoanApplicationRecord, EngineError> {
        self.transition(caller, id, LifecycleAction::ChangeStatus(status), None)
            .await
    }

    pub async fn delete(
        &self,
        caller: &CallerIdentity,
        id: ApplicationId,
    ) -> Result<LoanApplicationRecord, EngineError> {
        self.transition(caller, id, LifecycleAction::Delete, None).await
    }

    pub async fn restore(
        &self,
        caller: &CallerIdentity,
        id: ApplicationId,
    ) -> Result<LoanApplicationRecord, EngineError> {
        self.transition(caller, id, LifecycleAction::Restore, None).await
    }

    async fn transition(
        &self,
        caller: &CallerIdentity,
        id: ApplicationId,
        action: LifecycleAction,
        assignee: Option<UserId>,
    ) -> Result<LoanApplicationRecord, EngineError> {
        let access = match action {
            LifecycleAction::Submit => Action::Submit,
            LifecycleAction::Assign => Action::Assign,
            LifecycleAction::ChangeStatus(_) => Action::ChangeStatus,
            LifecycleAction::Delete => Action::Delete,
            LifecycleAction::Restore => Action::Restore,
        };
        let current = self.current(id).await?;
        self.authorize(caller, access, Subject::Record(&current))?;

        // Edits the store refuses stay pending; they do not hold up the
        // transition.
        match self.inner.scheduler.flush(id).await {
            Ok(_) => {}
            Err(e) if e.is_permission_denied() => {
                warn!(application = %id, error = %e, "pending edits refused, transition proceeds without them");
            }
            Err(e) => return Err(e),
        }

        let mut record = self.stored(id).await?;

        let next = LifecycleState::new(record.status, record.deleted)
            .apply(action, self.inner.transitions)?;
        let entry = history_entry(&record, action, assignee.as_ref(), &caller.user_id);

        let store = &self.inner.store;
        let updated_at = match action {
            LifecycleAction::Delete => store.soft_delete(id, &entry).await?,
            LifecycleAction::Restore => store.restore(id, &entry).await?,
            _ => {
                let change = LifecycleChange {
                    status: next.status,
                    assigned_workforce_id: assignee.clone(),
                };
                store.set_lifecycle(id, &change, &entry).await?
            }
        };

        let from = record.status;
        record.status = next.status;
        record.deleted = next.deleted;
        if assignee.is_some() {
            record.assigned_workforce_id = assignee.clone();
        }
        record.updated_at = updated_at;
        record.append_history(entry.clone());

        let settle = |copy: &mut LoanApplicationRecord| {
            copy.status = next.status;
            copy.deleted = next.deleted;
            if let Some(assignee) = &assignee {
                copy.assigned_workforce_id = Some(assignee.clone());
            }
            copy.updated_at = updated_at;
            copy.append_history(entry.clone());
        };
        self.inner.workspace.update(id, settle);
        self.inner.scheduler.amend_snapshot(id, settle);

        info!(
            application = %id,
            action = %action.name(),
            from = %from,
            status = %next.status,
            deleted = next.deleted,
            "lifecycle transition"
        );
        Ok(record)
    }

    // =========================================================================
    // Progress and history
    // =========================================================================

    /// Flush, then recompute progress from persisted content and return it.
    pub async fn calculate_progress(
        &self,
        caller: &CallerIdentity,
        id: ApplicationId,
    ) -> Result<Progress, EngineError> {
        let record = self.current(id).await?;
        self.authorize(caller, Action::Read, Subject::Record(&record))?;

        self.inner.scheduler.flush(id).await?;
        let mut record = self.stored(id).await?;
        let before = record.history.len();
        self.inner
            .refresher
            .refresh(&mut record, &caller.user_id, Vec::new())
            .await?;

        let progress = record.progress.clone();
        let added = record.history[before..].to_vec();
        self.inner.scheduler.amend_snapshot(id, |snapshot| {
            snapshot.progress = progress;
            for entry in added {
                snapshot.append_history(entry);
            }
        });
        Ok(record.progress)
    }

    /// Low-level append for flows outside ordinary field edits.
    pub async fn add_history_entry(
        &self,
        caller: &CallerIdentity,
        id: ApplicationId,
        action: HistoryAction,
        description: impl Into<String>,
        details: Option<FieldValue>,
    ) -> Result<HistoryEntry, EngineError> {
        let record = self.stored(id).await?;
        self.authorize(caller, Action::AppendHistory, Subject::Record(&record))?;

        let mut entry = HistoryEntry::new(action, description, &caller.user_id);
        entry.details = details;
        self.inner.store.append_history(id, &entry).await?;

        let appended = entry.clone();
        self.inner
            .workspace
            .update(id, |copy| copy.append_history(appended));
        debug!(application = %id, action = %entry.action, "history entry added");
        Ok(entry)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn list_by_owner(
        &self,
        caller: &CallerIdentity,
        owner_id: &UserId,
    ) -> Result<Vec<LoanApplicationRecord>, EngineError> {
        self.authorize_listing(caller, ListScope::Owner, owner_id)?;
        Ok(self.inner.store.list_by_owner(owner_id).await?)
    }

    pub async fn list_by_broker(
        &self,
        caller: &CallerIdentity,
        broker_id: &UserId,
    ) -> Result<Vec<LoanApplicationRecord>, EngineError> {
        self.authorize_listing(caller, ListScope::Broker, broker_id)?;
        Ok(self.inner.store.list_by_broker(broker_id).await?)
    }

    pub async fn list_by_assignee(
        &self,
        caller: &CallerIdentity,
        workforce_id: &UserId,
    ) -> Result<Vec<LoanApplicationRecord>, EngineError> {
        self.authorize_listing(caller, ListScope::Assignee, workforce_id)?;
        Ok(self.inner.store.list_by_assignee(workforce_id).await?)
    }

    fn authorize_listing(
        &self,
        caller: &CallerIdentity,
        scope: ListScope,
        user_id: &UserId,
    ) -> Result<(), EngineError> {
        self.authorize(caller, Action::List, Subject::Listing { scope, user_id })
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Open a scoped editing session. Pending edits are flushed when the
    /// session closes or is dropped.
    pub async fn open_session(
        &self,
        caller: &CallerIdentity,
        id: ApplicationId,
    ) -> Result<EditSession, EngineError> {
        let record = self.working_copy(id).await?;
        self.authorize(caller, Action::Edit, Subject::Record(&record))?;
        let session = EditSession::new(self.clone(), caller.clone(), id, SessionId::new());
        debug!(application = %id, session = %session.id(), %caller, "edit session opened");
        Ok(session)
    }

    /// Flush pending edits and drop the working copy. The copy is kept if the
    /// flush fails.
    pub async fn release(
        &self,
        caller: &CallerIdentity,
        id: ApplicationId,
    ) -> Result<(), EngineError> {
        self.inner.scheduler.release(id).await?;
        self.inner.workspace.remove(id);
        debug!(application = %id, %caller, "working copy released");
        Ok(())
    }

    /// Flush and release every working copy. Edits the store refuses for lack
    /// of permission are discarded; copies failing for other reasons stay
    /// loaded. The first error is returned after all were attempted.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let mut first_error = None;
        for id in self.inner.workspace.ids() {
            match self.inner.scheduler.release(id).await {
                Ok(()) => {
                    self.inner.workspace.remove(id);
                }
                Err(e) if e.is_permission_denied() => {
                    warn!(application = %id, error = %e, "store refused pending edits at shutdown");
                    self.inner.scheduler.discard(id).await;
                    self.inner.workspace.remove(id);
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    warn!(application = %id, error = %e, "pending edits not persisted at shutdown");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn check_editable(record: &LoanApplicationRecord) -> Result<(), CoreError> {
    if record.deleted {
        return Err(CoreError::InvalidTransition {
            from: format!("{} (deleted)", record.status),
            action: "edit".into(),
        });
    }
    Ok(())
}

fn history_entry(
    record: &LoanApplicationRecord,
    action: LifecycleAction,
    assignee: Option<&UserId>,
    performed_by: &UserId,
) -> HistoryEntry {
    match action {
        LifecycleAction::Submit => {
            HistoryEntry::new(HistoryAction::Submitted, "Application submitted", performed_by)
        }
        LifecycleAction::Assign => {
            let description = match assignee {
                Some(workforce) => format!("Assigned to {workforce}"),
                None => "Assigned".to_string(),
            };
            let entry = HistoryEntry::new(HistoryAction::Assigned, description, performed_by);
            match assignee {
                Some(workforce) => entry.with_details(FieldValue::from(workforce.as_str())),
                None => entry,
            }
        }
        LifecycleAction::ChangeStatus(target) => {
            let details = FieldMap::from([
                ("from".to_string(), FieldValue::from(record.status.as_str())),
                ("to".to_string(), FieldValue::from(target.as_str())),
            ]);
            HistoryEntry::new(
                HistoryAction::StatusChanged,
                format!("Status changed from {} to {target}", record.status),
                performed_by,
            )
            .with_details(FieldValue::Map(details))
        }
        LifecycleAction::Delete => {
            HistoryEntry::new(HistoryAction::Deleted, "Application deleted", performed_by)
        }
        LifecycleAction::Restore => {
            HistoryEntry::new(HistoryAction::Restored, "Application restored", performed_by)
        }
    }
}
