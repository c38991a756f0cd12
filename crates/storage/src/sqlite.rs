use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use loanrec_core::{
    ApplicationDraft, ApplicationId, ApplicationStatus, FieldMap, FieldUpdates, FieldValue,
    HistoryAction, HistoryEntry, LoanApplicationRecord, LoanCategory, Progress, UserId,
};

use crate::error::StorageError;
use crate::traits::{DocumentStore, LifecycleChange};

/// Convert Vec<u8> to fixed-size array with proper error handling.
fn to_array<const N: usize>(v: Vec<u8>, label: &str) -> Result<[u8; N], StorageError> {
    v.try_into()
        .map_err(|_| StorageError::Serialization(format!("invalid {label} length")))
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    rmp_serde::to_vec(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8], label: &str) -> Result<T, StorageError> {
    rmp_serde::from_slice(bytes).map_err(|e| StorageError::Serialization(format!("{label}: {e}")))
}

fn timestamp(at: DateTime<Utc>) -> String {
    // Fixed-width so that text ordering matches chronological ordering.
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::Serialization(format!("invalid timestamp {raw}: {e}")))
}

/// Map SQLite failure codes onto the storage error taxonomy.
fn classify(err: StorageError) -> StorageError {
    let StorageError::Sqlite(rusqlite::Error::SqliteFailure(failure, message)) = &err else {
        return err;
    };
    let code = failure.code;
    let detail = message.clone().unwrap_or_else(|| failure.to_string());
    match code {
        rusqlite::ErrorCode::PermissionDenied
        | rusqlite::ErrorCode::ReadOnly
        | rusqlite::ErrorCode::AuthorizationForStatementDenied => {
            StorageError::PermissionDenied(detail)
        }
        rusqlite::ErrorCode::DatabaseBusy
        | rusqlite::ErrorCode::DatabaseLocked
        | rusqlite::ErrorCode::CannotOpen
        | rusqlite::ErrorCode::SystemIoFailure
        | rusqlite::ErrorCode::DiskFull => StorageError::Unavailable(detail),
        _ => err,
    }
}

/// SQLite-backed document store. The connection lives behind a mutex and every
/// call runs on tokio's blocking pool.
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn)?;
        Ok(Self::wrap(conn))
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self::wrap(conn))
    }

    fn wrap(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    async fn call<F, R>(&self, f: F) -> Result<R, StorageError>
    where
        F: FnOnce(&mut Connection) -> Result<R, StorageError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| StorageError::Unavailable(format!("connection lock poisoned: {e}")))?;
            f(&mut guard).map_err(classify)
        })
        .await
        .map_err(|e| StorageError::Unavailable(format!("storage task failed: {e}")))?
    }
}

const RECORD_COLUMNS: &str = "application_id, owner_id, broker_id, assigned_workforce_id, loan_program, loan_category, status, deleted, sections, progress, created_at, updated_at";

struct RecordRow {
    id: Vec<u8>,
    owner_id: String,
    broker_id: String,
    assigned_workforce_id: Option<String>,
    loan_program: String,
    loan_category: String,
    status: String,
    deleted: bool,
    sections: Vec<u8>,
    progress: Vec<u8>,
    created_at: String,
    updated_at: String,
}

impl RecordRow {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            broker_id: row.get(2)?,
            assigned_workforce_id: row.get(3)?,
            loan_program: row.get(4)?,
            loan_category: row.get(5)?,
            status: row.get(6)?,
            deleted: row.get(7)?,
            sections: row.get(8)?,
            progress: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_record(self, history: Vec<HistoryEntry>) -> Result<LoanApplicationRecord, StorageError> {
        Ok(LoanApplicationRecord {
            id: ApplicationId::from_bytes(to_array::<16>(self.id, "application_id")?),
            owner_id: UserId::new(self.owner_id)?,
            broker_id: UserId::new(self.broker_id)?,
            assigned_workforce_id: self.assigned_workforce_id.map(UserId::new).transpose()?,
            loan_program: self.loan_program,
            loan_category: LoanCategory::parse(&self.loan_category)?,
            status: ApplicationStatus::parse(&self.status)?,
            deleted: self.deleted,
            sections: decode::<FieldMap>(&self.sections, "sections")?,
            progress: decode::<Progress>(&self.progress, "progress")?,
            history,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

fn load_history(conn: &Connection, id: ApplicationId) -> Result<Vec<HistoryEntry>, StorageError> {
    let mut stmt = conn.prepare(
        "SELECT recorded_at, action, description, performed_by, details FROM history WHERE application_id = ?1 ORDER BY rowid",
    )?;
    let rows = stmt
        .query_map(rusqlite::params![id.as_bytes().as_slice()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<Vec<u8>>>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(recorded_at, action, description, performed_by, details)| {
            Ok(HistoryEntry {
                timestamp: parse_timestamp(&recorded_at)?,
                action: HistoryAction::parse(&action)?,
                description,
                performed_by: UserId::new(performed_by)?,
                details: details
                    .map(|bytes| {
                        FieldValue::from_msgpack(&bytes)
                            .map_err(|e| StorageError::Serialization(e.to_string()))
                    })
                    .transpose()?,
            })
        })
        .collect()
}

fn load_record(
    conn: &Connection,
    id: ApplicationId,
) -> Result<Option<LoanApplicationRecord>, StorageError> {
    let row = conn
        .query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM applications WHERE application_id = ?1"),
            rusqlite::params![id.as_bytes().as_slice()],
            RecordRow::from_row,
        )
        .optional()?;
    match row {
        Some(row) => {
            let history = load_history(conn, id)?;
            Ok(Some(row.into_record(history)?))
        }
        None => Ok(None),
    }
}

fn list_where(
    conn: &Connection,
    column: &str,
    user: &UserId,
) -> Result<Vec<LoanApplicationRecord>, StorageError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RECORD_COLUMNS} FROM applications WHERE {column} = ?1 AND deleted = 0 ORDER BY created_at, application_id"
    ))?;
    let rows = stmt
        .query_map(rusqlite::params![user.as_str()], RecordRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let id = ApplicationId::from_bytes(to_array::<16>(row.id.clone(), "application_id")?);
        let history = load_history(conn, id)?;
        records.push(row.into_record(history)?);
    }
    Ok(records)
}

fn insert_history(
    tx: &Transaction,
    id: ApplicationId,
    entry: &HistoryEntry,
) -> Result<(), StorageError> {
    let details = entry
        .details
        .as_ref()
        .map(|d| d.to_msgpack().map_err(|e| StorageError::Serialization(e.to_string())))
        .transpose()?;
    tx.execute(
        "INSERT INTO history (application_id, recorded_at, action, description, performed_by, details) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            id.as_bytes().as_slice(),
            timestamp(entry.timestamp),
            entry.action.as_str(),
            entry.description,
            entry.performed_by.as_str(),
            details,
        ],
    )?;
    Ok(())
}

fn load_sections(tx: &Transaction, id: ApplicationId) -> Result<FieldMap, StorageError> {
    let bytes: Option<Vec<u8>> = tx
        .query_row(
            "SELECT sections FROM applications WHERE application_id = ?1",
            rusqlite::params![id.as_bytes().as_slice()],
            |row| row.get(0),
        )
        .optional()?;
    let bytes = bytes.ok_or_else(|| StorageError::NotFound(id.to_string()))?;
    decode(&bytes, "sections")
}

/// Bump `updated_at` strictly past its previous value and fail with
/// `NotFound` when no row matched.
fn touch(
    tx: &Transaction,
    id: ApplicationId,
    set: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<DateTime<Utc>, StorageError> {
    let id_bytes = id.as_bytes().to_vec();
    let previous: Option<String> = tx
        .query_row(
            "SELECT updated_at FROM applications WHERE application_id = ?1",
            rusqlite::params![id_bytes],
            |row| row.get(0),
        )
        .optional()?;
    let previous = previous.ok_or_else(|| StorageError::NotFound(id.to_string()))?;
    let previous = parse_timestamp(&previous)?;
    let mut now = Utc::now();
    if now <= previous {
        now = previous + chrono::Duration::nanoseconds(1);
    }
    let now_text = timestamp(now);
    let mut all: Vec<&dyn rusqlite::ToSql> = params.to_vec();
    all.push(&now_text);
    all.push(&id_bytes);
    let n = params.len();
    let sql = format!(
        "UPDATE applications SET {set}, updated_at = ?{} WHERE application_id = ?{}",
        n + 1,
        n + 2
    );
    let changed = tx.execute(&sql, all.as_slice())?;
    if changed == 0 {
        return Err(StorageError::NotFound(id.to_string()));
    }
    Ok(now)
}

#[async_trait]
impl DocumentStore for SqliteStorage {
    async fn create(&self, draft: &ApplicationDraft) -> Result<LoanApplicationRecord, StorageError> {
        let draft = draft.clone();
        self.call(move |conn| {
            let id = ApplicationId::new();
            let now = Utc::now();
            let tx = conn.transaction()?;
            tx.execute(
                &format!("INSERT INTO applications ({RECORD_COLUMNS}) VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?6, 0, ?7, ?8, ?9, ?9)"),
                rusqlite::params![
                    id.as_bytes().as_slice(),
                    draft.owner_id.as_str(),
                    draft.broker_id.as_str(),
                    draft.loan_program,
                    draft.loan_category.as_str(),
                    ApplicationStatus::Draft.as_str(),
                    encode(&draft.sections)?,
                    encode(&draft.progress)?,
                    timestamp(now),
                ],
            )?;
            insert_history(&tx, id, &draft.created_entry)?;
            tx.commit()?;
            debug!(application = %id, program = %draft.loan_program, "application row created");

            load_record(conn, id)?.ok_or_else(|| StorageError::NotFound(id.to_string()))
        })
        .await
    }

    async fn get(&self, id: ApplicationId) -> Result<Option<LoanApplicationRecord>, StorageError> {
        self.call(move |conn| load_record(conn, id)).await
    }

    async fn patch(
        &self,
        id: ApplicationId,
        updates: &FieldUpdates,
    ) -> Result<DateTime<Utc>, StorageError> {
        let updates = updates.clone();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let mut sections = load_sections(&tx, id)?;
            updates.apply_to(&mut sections)?;
            let bytes = encode(&sections)?;
            let at = touch(&tx, id, "sections = ?1", &[&bytes])?;
            tx.commit()?;
            debug!(application = %id, fields = updates.len(), "sections patched");
            Ok(at)
        })
        .await
    }

    async fn set_progress(&self, id: ApplicationId, progress: &Progress) -> Result<(), StorageError> {
        let bytes = encode(progress)?;
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE applications SET progress = ?1 WHERE application_id = ?2",
                rusqlite::params![bytes, id.as_bytes().as_slice()],
            )?;
            if changed == 0 {
                return Err(StorageError::NotFound(id.to_string()));
            }
            Ok(())
        })
        .await
    }

    async fn append_history(&self, id: ApplicationId, entry: &HistoryEntry) -> Result<(), StorageError> {
        let entry = entry.clone();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM applications WHERE application_id = ?1)",
                rusqlite::params![id.as_bytes().as_slice()],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(StorageError::NotFound(id.to_string()));
            }
            insert_history(&tx, id, &entry)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn set_lifecycle(
        &self,
        id: ApplicationId,
        change: &LifecycleChange,
        entry: &HistoryEntry,
    ) -> Result<DateTime<Utc>, StorageError> {
        let change = change.clone();
        let entry = entry.clone();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let status = change.status.as_str();
            let at = match &change.assigned_workforce_id {
                Some(assignee) => touch(
                    &tx,
                    id,
                    "status = ?1, assigned_workforce_id = ?2",
                    &[&status, &assignee.as_str()],
                )?,
                None => touch(&tx, id, "status = ?1", &[&status])?,
            };
            insert_history(&tx, id, &entry)?;
            tx.commit()?;
            debug!(application = %id, status, "lifecycle updated");
            Ok(at)
        })
        .await
    }

    async fn soft_delete(
        &self,
        id: ApplicationId,
        entry: &HistoryEntry,
    ) -> Result<DateTime<Utc>, StorageError> {
        let entry = entry.clone();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let at = touch(&tx, id, "deleted = ?1", &[&true])?;
            insert_history(&tx, id, &entry)?;
            tx.commit()?;
            Ok(at)
        })
        .await
    }

    async fn restore(
        &self,
        id: ApplicationId,
        entry: &HistoryEntry,
    ) -> Result<DateTime<Utc>, StorageError> {
        let entry = entry.clone();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let at = touch(&tx, id, "deleted = ?1", &[&false])?;
            insert_history(&tx, id, &entry)?;
            tx.commit()?;
            Ok(at)
        })
        .await
    }

    async fn list_by_owner(&self, owner: &UserId) -> Result<Vec<LoanApplicationRecord>, StorageError> {
        let owner = owner.clone();
        self.call(move |conn| list_where(conn, "owner_id", &owner)).await
    }

    async fn list_by_broker(&self, broker: &UserId) -> Result<Vec<LoanApplicationRecord>, StorageError> {
        let broker = broker.clone();
        self.call(move |conn| list_where(conn, "broker_id", &broker)).await
    }

    async fn list_by_assignee(
        &self,
        workforce: &UserId,
    ) -> Result<Vec<LoanApplicationRecord>, StorageError> {
        let workforce = workforce.clone();
        self.call(move |conn| list_where(conn, "assigned_workforce_id", &workforce))
            .await
    }
}
