//! JSON request/response boundary over [`RecordEngine`].
//!
//! Requests are objects tagged by `op`. Every response is either
//! `{"ok": true, "result": ...}` or
//! `{"ok": false, "error": {"kind": ..., "message": ...}}`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use loanrec_core::{
    ApplicationId, ApplicationStatus, CallerIdentity, CoreError, FieldPath, FieldUpdates,
    FieldValue, HistoryAction, HistoryEntry, LoanApplicationRecord, LoanCategory, Progress, Role,
    Section, UserId,
};

use crate::error::{EngineError, ErrorKind};
use crate::{FlushOutcome, NewApplication, RecordEngine};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Caller {
    pub user_id: UserId,
    pub role: Role,
}

impl From<Caller> for CallerIdentity {
    fn from(caller: Caller) -> Self {
        CallerIdentity::new(caller.user_id, caller.role)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathValue {
    pub path: String,
    pub value: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Request {
    CreateApplication {
        caller: Caller,
        owner_id: UserId,
        broker_id: UserId,
        loan_program: String,
        #[serde(default)]
        initial_data: Vec<PathValue>,
    },
    GetApplication {
        caller: Caller,
        application_id: ApplicationId,
    },
    UpdateField {
        caller: Caller,
        application_id: ApplicationId,
        path: String,
        value: Value,
    },
    UpdateFields {
        caller: Caller,
        application_id: ApplicationId,
        updates: Vec<PathValue>,
    },
    Flush {
        caller: Caller,
        application_id: ApplicationId,
    },
    DiscardChanges {
        caller: Caller,
        application_id: ApplicationId,
    },
    Submit {
        caller: Caller,
        application_id: ApplicationId,
    },
    Assign {
        caller: Caller,
        application_id: ApplicationId,
        workforce_id: UserId,
    },
    SetStatus {
        caller: Caller,
        application_id: ApplicationId,
        status: ApplicationStatus,
    },
    Delete {
        caller: Caller,
        application_id: ApplicationId,
    },
    Restore {
        caller: Caller,
        application_id: ApplicationId,
    },
    CalculateProgress {
        caller: Caller,
        application_id: ApplicationId,
    },
    AddHistoryEntry {
        caller: Caller,
        application_id: ApplicationId,
        action: HistoryAction,
        description: String,
        #[serde(default)]
        details: Option<Value>,
    },
    ListByOwner {
        caller: Caller,
        owner_id: UserId,
    },
    ListByBroker {
        caller: Caller,
        broker_id: UserId,
    },
    ListByAssignee {
        caller: Caller,
        workforce_id: UserId,
    },
}

impl Request {
    pub fn op(&self) -> &'static str {
        match self {
            Self::CreateApplication { .. } => "create_application",
            Self::GetApplication { .. } => "get_application",
            Self::UpdateField { .. } => "update_field",
            Self::UpdateFields { .. } => "update_fields",
            Self::Flush { .. } => "flush",
            Self::DiscardChanges { .. } => "discard_changes",
            Self::Submit { .. } => "submit",
            Self::Assign { .. } => "assign",
            Self::SetStatus { .. } => "set_status",
            Self::Delete { .. } => "delete",
            Self::Restore { .. } => "restore",
            Self::CalculateProgress { .. } => "calculate_progress",
            Self::AddHistoryEntry { .. } => "add_history_entry",
            Self::ListByOwner { .. } => "list_by_owner",
            Self::ListByBroker { .. } => "list_by_broker",
            Self::ListByAssignee { .. } => "list_by_assignee",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn success(result: Value) -> Self {
        Self {
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(ErrorBody {
                kind,
                message: message.into(),
            }),
        }
    }
}

impl From<&EngineError> for Response {
    fn from(err: &EngineError) -> Self {
        Self::failure(err.kind(), err.to_string())
    }
}

// ============================================================================
// Views
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressView {
    #[serde(flatten)]
    pub sections: BTreeMap<Section, bool>,
    pub overall_progress: u8,
}

impl From<&Progress> for ProgressView {
    fn from(progress: &Progress) -> Self {
        Self {
            sections: progress.sections.clone(),
            overall_progress: progress.overall_progress,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryView {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub description: String,
    pub performed_by: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl From<&HistoryEntry> for HistoryView {
    fn from(entry: &HistoryEntry) -> Self {
        Self {
            timestamp: entry.timestamp,
            action: entry.action.as_str().to_string(),
            description: entry.description.clone(),
            performed_by: entry.performed_by.clone(),
            details: entry.details.as_ref().map(FieldValue::to_json),
        }
    }
}

/// Record as seen by service callers: section containers sit at the top level
/// next to the record's own attributes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordView {
    pub id: ApplicationId,
    pub owner_id: UserId,
    pub broker_id: UserId,
    pub assigned_workforce_id: Option<UserId>,
    pub loan_program: String,
    pub loan_category: LoanCategory,
    pub status: ApplicationStatus,
    pub deleted: bool,
    #[serde(flatten)]
    pub sections: serde_json::Map<String, Value>,
    pub progress: ProgressView,
    pub history: Vec<HistoryView>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&LoanApplicationRecord> for RecordView {
    fn from(record: &LoanApplicationRecord) -> Self {
        Self {
            id: record.id,
            owner_id: record.owner_id.clone(),
            broker_id: record.broker_id.clone(),
            assigned_workforce_id: record.assigned_workforce_id.clone(),
            loan_program: record.loan_program.clone(),
            loan_category: record.loan_category,
            status: record.status,
            deleted: record.deleted,
            sections: record
                .sections
                .iter()
                .map(|(name, value)| (name.clone(), value.to_json()))
                .collect(),
            progress: ProgressView::from(&record.progress),
            history: record.history.iter().map(HistoryView::from).collect(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

fn render<T: Serialize>(value: &T) -> Result<Value, EngineError> {
    serde_json::to_value(value).map_err(|e| CoreError::Serialization(e.to_string()).into())
}

fn render_records(records: &[LoanApplicationRecord]) -> Result<Value, EngineError> {
    let views: Vec<RecordView> = records.iter().map(RecordView::from).collect();
    render(&views)
}

fn field_updates(pairs: Vec<PathValue>) -> Result<FieldUpdates, EngineError> {
    let mut updates = FieldUpdates::new();
    for PathValue { path, value } in pairs {
        updates.insert(FieldPath::parse(&path)?, FieldValue::from(value));
    }
    Ok(updates)
}

// ============================================================================
// Service
// ============================================================================

#[derive(Clone)]
pub struct RecordService {
    engine: RecordEngine,
}

impl RecordService {
    pub fn new(engine: RecordEngine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &RecordEngine {
        &self.engine
    }

    /// Decode one JSON request, run it, and encode the response.
    pub async fn handle_json(&self, line: &str) -> String {
        let response = match serde_json::from_str::<Request>(line) {
            Ok(request) => self.handle(request).await,
            Err(e) => Response::failure(ErrorKind::ValidationError, format!("malformed request: {e}")),
        };
        serde_json::to_string(&response).unwrap_or_else(|e| {
            json!({
                "ok": false,
                "error": {"kind": ErrorKind::StoreUnavailable.as_str(), "message": e.to_string()},
            })
            .to_string()
        })
    }

    pub async fn handle(&self, request: Request) -> Response {
        let op = request.op();
        match self.dispatch(request).await {
            Ok(result) => Response::success(result),
            Err(e) => {
                debug!(op, kind = e.kind().as_str(), error = %e, "request failed");
                Response::from(&e)
            }
        }
    }

    async fn dispatch(&self, request: Request) -> Result<Value, EngineError> {
        let engine = &self.engine;
        match request {
            Request::CreateApplication {
                caller,
                owner_id,
                broker_id,
                loan_program,
                initial_data,
            } => {
                let request = NewApplication::new(owner_id, broker_id, loan_program)
                    .with_initial(field_updates(initial_data)?);
                let id = engine.create_application(&caller.into(), request).await?;
                Ok(json!({ "applicationId": id }))
            }
            Request::GetApplication {
                caller,
                application_id,
            } => {
                let record = engine.get_application(&caller.into(), application_id).await?;
                render(&RecordView::from(&record))
            }
            Request::UpdateField {
                caller,
                application_id,
                path,
                value,
            } => {
                engine
                    .update_field(&caller.into(), application_id, &path, FieldValue::from(value))
                    .await?;
                Ok(json!({ "saveStatus": engine.save_status(application_id) }))
            }
            Request::UpdateFields {
                caller,
                application_id,
                updates,
            } => {
                engine
                    .update_fields(&caller.into(), application_id, field_updates(updates)?)
                    .await?;
                Ok(json!({ "saveStatus": engine.save_status(application_id) }))
            }
            Request::Flush {
                caller,
                application_id,
            } => {
                let outcome = engine.flush(&caller.into(), application_id).await?;
                let persisted = match outcome {
                    FlushOutcome::Persisted { paths } => paths,
                    _ => 0,
                };
                Ok(json!({
                    "persistedPaths": persisted,
                    "saveStatus": engine.save_status(application_id),
                }))
            }
            Request::DiscardChanges {
                caller,
                application_id,
            } => {
                let dropped = engine
                    .discard_changes(&caller.into(), application_id)
                    .await?;
                Ok(json!({ "discarded": dropped }))
            }
            Request::Submit {
                caller,
                application_id,
            } => {
                let record = engine.submit(&caller.into(), application_id).await?;
                render(&RecordView::from(&record))
            }
            Request::Assign {
                caller,
                application_id,
                workforce_id,
            } => {
                let record = engine
                    .assign(&caller.into(), application_id, workforce_id)
                    .await?;
                render(&RecordView::from(&record))
            }
            Request::SetStatus {
                caller,
                application_id,
                status,
            } => {
                let record = engine
                    .set_status(&caller.into(), application_id, status)
                    .await?;
                render(&RecordView::from(&record))
            }
            Request::Delete {
                caller,
                application_id,
            } => {
                let record = engine.delete(&caller.into(), application_id).await?;
                render(&RecordView::from(&record))
            }
            Request::Restore {
                caller,
                application_id,
            } => {
                let record = engine.restore(&caller.into(), application_id).await?;
                render(&RecordView::from(&record))
            }
            Request::CalculateProgress {
                caller,
                application_id,
            } => {
                let progress = engine
                    .calculate_progress(&caller.into(), application_id)
                    .await?;
                render(&ProgressView::from(&progress))
            }
            Request::AddHistoryEntry {
                caller,
                application_id,
                action,
                description,
                details,
            } => {
                let entry = engine
                    .add_history_entry(
                        &caller.into(),
                        application_id,
                        action,
                        description,
                        details.map(FieldValue::from),
                    )
                    .await?;
                render(&HistoryView::from(&entry))
            }
            Request::ListByOwner { caller, owner_id } => {
                let records = engine.list_by_owner(&caller.into(), &owner_id).await?;
                render_records(&records)
            }
            Request::ListByBroker { caller, broker_id } => {
                let records = engine.list_by_broker(&caller.into(), &broker_id).await?;
                render_records(&records)
            }
            Request::ListByAssignee {
                caller,
                workforce_id,
            } => {
                let records = engine
                    .list_by_assignee(&caller.into(), &workforce_id)
                    .await?;
                render_records(&records)
            }
        }
    }
}
