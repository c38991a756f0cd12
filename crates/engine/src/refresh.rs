use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use loanrec_core::{
    FieldUpdates, FieldValue, HistoryAction, HistoryEntry, LoanApplicationRecord, ManifestRegistry,
    UserId, progress,
};
use loanrec_storage::DocumentStore;

use crate::autosave::FlushObserver;
use crate::error::EngineError;
use crate::workspace::Workspace;

/// Keeps derived progress in step with persisted content and records the
/// significant moments (a section becoming complete) in history.
pub(crate) struct ProgressRefresher {
    store: Arc<dyn DocumentStore>,
    registry: Arc<ManifestRegistry>,
    workspace: Arc<Workspace>,
    summary_history: bool,
}

impl ProgressRefresher {
    pub(crate) fn new(
        store: Arc<dyn DocumentStore>,
        registry: Arc<ManifestRegistry>,
        workspace: Arc<Workspace>,
        summary_history: bool,
    ) -> Self {
        Self {
            store,
            registry,
            workspace,
            summary_history,
        }
    }

    /// Recompute progress for `record` (persisted state), write it back if it
    /// moved, and append one entry per newly completed section. `record` and
    /// the workspace copy are amended only after the store accepted each write.
    pub(crate) async fn refresh(
        &self,
        record: &mut LoanApplicationRecord,
        performed_by: &UserId,
        mut extra: Vec<HistoryEntry>,
    ) -> Result<(), EngineError> {
        let manifest = self.registry.get(&record.loan_program)?;
        let before = record.progress.clone();
        let after = progress::compute(record, manifest);

        let mut entries = Vec::new();
        if after != before {
            self.store.set_progress(record.id, &after).await?;
            debug!(
                application = %record.id,
                overall = after.overall_progress,
                "progress refreshed"
            );
            for section in after.newly_completed(&before) {
                info!(application = %record.id, %section, "section completed");
                entries.push(
                    HistoryEntry::new(
                        HistoryAction::SectionCompleted,
                        format!("Section {section} completed"),
                        performed_by,
                    )
                    .with_details(FieldValue::Text(section.as_str().to_string())),
                );
            }
            record.progress = after;
        }
        entries.append(&mut extra);

        let mut appended = Vec::with_capacity(entries.len());
        let mut failure = None;
        for entry in entries {
            match self.store.append_history(record.id, &entry).await {
                Ok(()) => appended.push(entry),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        for entry in &appended {
            record.append_history(entry.clone());
        }

        let latest = record.progress.clone();
        let updated_at = record.updated_at;
        self.workspace.update(record.id, |copy| {
            copy.progress = latest;
            copy.updated_at = copy.updated_at.max(updated_at);
            for entry in appended {
                copy.append_history(entry);
            }
        });

        match failure {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl FlushObserver for ProgressRefresher {
    async fn persisted(
        &self,
        record: &mut LoanApplicationRecord,
        batch: &FieldUpdates,
        performed_by: &UserId,
    ) -> Result<(), EngineError> {
        let mut extra = Vec::new();
        if self.summary_history {
            let paths = batch
                .paths()
                .map(|p| FieldValue::Text(p.as_str().to_string()))
                .collect();
            extra.push(
                HistoryEntry::new(
                    HistoryAction::FieldsUpdated,
                    format!("{} field(s) updated", batch.len()),
                    performed_by,
                )
                .with_details(FieldValue::List(paths)),
            );
        }
        self.refresh(record, performed_by, extra).await
    }
}
