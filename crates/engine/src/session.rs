use tokio::runtime::Handle;
use tracing::{debug, warn};

use loanrec_core::{
    ApplicationId, CallerIdentity, FieldUpdates, FieldValue, LoanApplicationRecord, SessionId,
};

use crate::autosave::{FlushOutcome, SaveStatus};
use crate::error::EngineError;
use crate::RecordEngine;

/// Scoped editing handle for one application.
///
/// `close` flushes pending edits and releases the working copy. A session
/// dropped without `close` (early return, `?`, panic unwinding) spawns the
/// same flush on the current tokio runtime.
pub struct EditSession {
    engine: RecordEngine,
    caller: CallerIdentity,
    application_id: ApplicationId,
    id: SessionId,
    open: bool,
}

impl EditSession {
    pub(crate) fn new(
        engine: RecordEngine,
        caller: CallerIdentity,
        application_id: ApplicationId,
        id: SessionId,
    ) -> Self {
        Self {
            engine,
            caller,
            application_id,
            id,
            open: true,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn application_id(&self) -> ApplicationId {
        self.application_id
    }

    pub fn caller(&self) -> &CallerIdentity {
        &self.caller
    }

    pub async fn record(&self) -> Result<LoanApplicationRecord, EngineError> {
        self.engine
            .get_application(&self.caller, self.application_id)
            .await
    }

    pub async fn update_field(
        &self,
        path: &str,
        value: impl Into<FieldValue>,
    ) -> Result<(), EngineError> {
        self.engine
            .update_field(&self.caller, self.application_id, path, value)
            .await
    }

    pub async fn update_fields(&self, updates: FieldUpdates) -> Result<(), EngineError> {
        self.engine
            .update_fields(&self.caller, self.application_id, updates)
            .await
    }

    pub async fn flush(&self) -> Result<FlushOutcome, EngineError> {
        self.engine.flush(&self.caller, self.application_id).await
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.engine.has_unsaved_changes(self.application_id)
    }

    pub fn save_status(&self) -> SaveStatus {
        self.engine.save_status(self.application_id)
    }

    pub async fn close(mut self) -> Result<(), EngineError> {
        self.open = false;
        debug!(session = %self.id, application = %self.application_id, "edit session closed");
        self.engine.release(&self.caller, self.application_id).await
    }
}

impl Drop for EditSession {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        let engine = self.engine.clone();
        let caller = self.caller.clone();
        let application_id = self.application_id;
        let session = self.id;
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = engine.release(&caller, application_id).await {
                        warn!(
                            %session,
                            application = %application_id,
                            error = %e,
                            "flush on session drop failed"
                        );
                    }
                });
            }
            Err(_) => {
                warn!(
                    %session,
                    application = %application_id,
                    "session dropped outside a runtime, pending edits not flushed"
                );
            }
        }
    }
}
