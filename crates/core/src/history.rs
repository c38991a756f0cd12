use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::field_value::FieldValue;
use crate::ids::UserId;
use crate::record::LoanApplicationRecord;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum HistoryAction {
    Created,
    Submitted,
    Assigned,
    StatusChanged,
    Deleted,
    Restored,
    SectionCompleted,
    FieldsUpdated,
    /// Recorded by flows outside ordinary field edits, e.g. report generation.
    Other(String),
}

impl HistoryAction {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Created => "created",
            Self::Submitted => "submitted",
            Self::Assigned => "assigned",
            Self::StatusChanged => "status_changed",
            Self::Deleted => "deleted",
            Self::Restored => "restored",
            Self::SectionCompleted => "section_completed",
            Self::FieldsUpdated => "fields_updated",
            Self::Other(name) => name,
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let action = match s {
            "created" => Self::Created,
            "submitted" => Self::Submitted,
            "assigned" => Self::Assigned,
            "status_changed" => Self::StatusChanged,
            "deleted" => Self::Deleted,
            "restored" => Self::Restored,
            "section_completed" => Self::SectionCompleted,
            "fields_updated" => Self::FieldsUpdated,
            "" => return Err(CoreError::InvalidData("history action must not be empty".into())),
            other => Self::Other(other.to_string()),
        };
        Ok(action)
    }
}

impl TryFrom<String> for HistoryAction {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<HistoryAction> for String {
    fn from(action: HistoryAction) -> Self {
        action.as_str().to_string()
    }
}

impl fmt::Display for HistoryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub action: HistoryAction,
    pub description: String,
    pub performed_by: UserId,
    pub details: Option<FieldValue>,
}

impl HistoryEntry {
    pub fn new(action: HistoryAction, description: impl Into<String>, performed_by: &UserId) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            description: description.into(),
            performed_by: performed_by.clone(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: FieldValue) -> Self {
        self.details = Some(details);
        self
    }
}

impl LoanApplicationRecord {
    /// The only way entries reach a record's history. There is no
    /// counterpart for editing or removing an entry.
    pub fn append_history(&mut self, entry: HistoryEntry) {
        self.history.push(entry);
    }
}

/// True when `after` extends `before` without altering any existing entry.
pub fn is_append_only(before: &[HistoryEntry], after: &[HistoryEntry]) -> bool {
    after.len() >= before.len() && after[..before.len()] == *before
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> UserId {
        UserId::new("u-1").unwrap()
    }

    #[test]
    fn action_strings_roundtrip() {
        for action in [
            HistoryAction::Created,
            HistoryAction::Submitted,
            HistoryAction::Assigned,
            HistoryAction::StatusChanged,
            HistoryAction::Deleted,
            HistoryAction::Restored,
            HistoryAction::SectionCompleted,
            HistoryAction::FieldsUpdated,
            HistoryAction::Other("report_generated".into()),
        ] {
            assert_eq!(HistoryAction::parse(action.as_str()).unwrap(), action);
        }
        assert!(HistoryAction::parse("").is_err());
    }

    #[test]
    fn append_only_detects_rewrites() {
        let first = HistoryEntry::new(HistoryAction::Created, "created", &user());
        let second = HistoryEntry::new(HistoryAction::Submitted, "submitted", &user());

        let before = vec![first.clone()];
        let appended = vec![first.clone(), second.clone()];
        assert!(is_append_only(&before, &appended));

        let mut rewritten = first.clone();
        rewritten.description = "edited".into();
        assert!(!is_append_only(&before, &[rewritten, second]));
        assert!(!is_append_only(&appended, &before));
    }
}
