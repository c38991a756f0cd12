use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::field_value::{FieldMap, FieldValue};
use crate::history::HistoryEntry;
use crate::ids::{ApplicationId, UserId};
use crate::lifecycle::ApplicationStatus;
use crate::path::{self, FieldPath};
use crate::progress::Progress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Section {
    BorrowerInfo,
    BusinessInfo,
    FinancialInfo,
    LoanDetails,
    PropertyInfo,
    EmploymentInfo,
    Documents,
}

impl Section {
    pub const ALL: [Section; 7] = [
        Section::BorrowerInfo,
        Section::BusinessInfo,
        Section::FinancialInfo,
        Section::LoanDetails,
        Section::PropertyInfo,
        Section::EmploymentInfo,
        Section::Documents,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BorrowerInfo => "borrowerInfo",
            Self::BusinessInfo => "businessInfo",
            Self::FinancialInfo => "financialInfo",
            Self::LoanDetails => "loanDetails",
            Self::PropertyInfo => "propertyInfo",
            Self::EmploymentInfo => "employmentInfo",
            Self::Documents => "documents",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|section| section.as_str() == s)
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoanCategory {
    Residential,
    Commercial,
    Business,
}

impl LoanCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Residential => "residential",
            Self::Commercial => "commercial",
            Self::Business => "business",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "residential" => Ok(Self::Residential),
            "commercial" => Ok(Self::Commercial),
            "business" => Ok(Self::Business),
            _ => Err(CoreError::InvalidData(format!("unknown loan category: {s}"))),
        }
    }
}

/// Ordered batch of path writes. Re-inserting a path drops the earlier entry
/// and appends the new one, so applying the batch in order is equivalent to
/// replaying the original calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldUpdates(Vec<(FieldPath, FieldValue)>);

impl FieldUpdates {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn single(path: FieldPath, value: FieldValue) -> Self {
        Self(vec![(path, value)])
    }

    /// Parse raw `(path, value)` pairs, failing on the first malformed path.
    pub fn parse<'a, I>(pairs: I) -> Result<Self, CoreError>
    where
        I: IntoIterator<Item = (&'a str, FieldValue)>,
    {
        let mut updates = Self::new();
        for (raw, value) in pairs {
            updates.insert(FieldPath::parse(raw)?, value);
        }
        Ok(updates)
    }

    pub fn insert(&mut self, path: FieldPath, value: FieldValue) {
        self.0.retain(|(existing, _)| existing != &path);
        self.0.push((path, value));
    }

    /// Layer `newer` on top of `self`; entries of `newer` win.
    pub fn merge(&mut self, newer: FieldUpdates) {
        for (path, value) in newer.0 {
            self.insert(path, value);
        }
    }

    pub fn get(&self, path: &FieldPath) -> Option<&FieldValue> {
        self.0.iter().find(|(p, _)| p == path).map(|(_, v)| v)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FieldPath, &FieldValue)> {
        self.0.iter().map(|(p, v)| (p, v))
    }

    pub fn paths(&self) -> impl Iterator<Item = &FieldPath> {
        self.0.iter().map(|(p, _)| p)
    }

    pub fn apply_to(&self, root: &mut FieldMap) -> Result<(), CoreError> {
        for (path, value) in &self.0 {
            path::write(root, path, value.clone())?;
        }
        Ok(())
    }
}

impl FromIterator<(FieldPath, FieldValue)> for FieldUpdates {
    fn from_iter<T: IntoIterator<Item = (FieldPath, FieldValue)>>(iter: T) -> Self {
        let mut updates = Self::new();
        for (path, value) in iter {
            updates.insert(path, value);
        }
        updates
    }
}

impl IntoIterator for FieldUpdates {
    type Item = (FieldPath, FieldValue);
    type IntoIter = std::vec::IntoIter<(FieldPath, FieldValue)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Everything a store needs to materialize a new application. The store
/// assigns the id and timestamps.
#[derive(Debug, Clone)]
pub struct ApplicationDraft {
    pub owner_id: UserId,
    pub broker_id: UserId,
    pub loan_program: String,
    pub loan_category: LoanCategory,
    pub sections: FieldMap,
    pub progress: Progress,
    pub created_entry: HistoryEntry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanApplicationRecord {
    pub id: ApplicationId,
    pub owner_id: UserId,
    pub broker_id: UserId,
    pub assigned_workforce_id: Option<UserId>,
    pub loan_program: String,
    pub loan_category: LoanCategory,
    pub status: ApplicationStatus,
    pub deleted: bool,
    pub sections: FieldMap,
    pub progress: Progress,
    pub history: Vec<HistoryEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LoanApplicationRecord {
    pub fn read(&self, path: &FieldPath) -> Option<&FieldValue> {
        path::read(&self.sections, path)
    }

    pub fn write(&mut self, path: &FieldPath, value: FieldValue) -> Result<(), CoreError> {
        path::write(&mut self.sections, path, value)
    }

    /// Non-mutating form of [`write`](Self::write).
    pub fn with_field(&self, path: &FieldPath, value: FieldValue) -> Result<Self, CoreError> {
        let mut next = self.clone();
        next.write(path, value)?;
        Ok(next)
    }

    pub fn apply(&mut self, updates: &FieldUpdates) -> Result<(), CoreError> {
        updates.apply_to(&mut self.sections)
    }

    pub fn section(&self, section: Section) -> Option<&FieldMap> {
        self.sections.get(section.as_str()).and_then(FieldValue::as_map)
    }

    /// Digest of the section containers only; equal digests mean equal
    /// editable content regardless of derived fields.
    pub fn content_digest(&self) -> Result<blake3::Hash, CoreError> {
        let bytes =
            rmp_serde::to_vec(&self.sections).map_err(|e| CoreError::Serialization(e.to_string()))?;
        Ok(blake3::hash(&bytes))
    }
}
