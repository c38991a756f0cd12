//! Per-program field manifests.
//!
//! A manifest is data, not code: it names the sections a program tracks for
//! progress and the fields its intake pages fill, with their expected kinds.
//! Writes are checked against it before they reach the in-memory record.
//!
//! ```toml
//! [[program]]
//! name = "Residential NOO - DSCR"
//! category = "residential"
//! tracked_sections = ["borrowerInfo", "propertyInfo"]
//!
//! [[program.field]]
//! path = "propertyInfo.propertyAddress"
//! kind = "text"
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::field_value::FieldValue;
use crate::path::{FieldPath, read_segments};
use crate::record::{LoanCategory, Section};

const BUILTIN_MANIFESTS: &str = include_str!("../manifests/programs.toml");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Text,
    Integer,
    /// Integer or float.
    Number,
    Boolean,
    Timestamp,
    List,
    Map,
    Any,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Timestamp => "timestamp",
            Self::List => "list",
            Self::Map => "map",
            Self::Any => "any",
        }
    }

    /// `Null` is accepted by every kind; it clears the field.
    pub fn accepts(&self, value: &FieldValue) -> bool {
        match (self, value) {
            (_, FieldValue::Null) | (Self::Any, _) => true,
            (Self::Text, FieldValue::Text(_)) => true,
            (Self::Integer, FieldValue::Integer(_)) => true,
            (Self::Number, FieldValue::Integer(_) | FieldValue::Float(_)) => true,
            (Self::Boolean, FieldValue::Boolean(_)) => true,
            (Self::Timestamp, FieldValue::Timestamp(_) | FieldValue::Integer(_)) => true,
            (Self::List, FieldValue::List(_)) => true,
            (Self::Map, FieldValue::Map(_)) => true,
            _ => false,
        }
    }

    fn allows_children(&self) -> bool {
        matches!(self, Self::Map | Self::Any)
    }
}

fn default_true() -> bool {
    true
}

fn all_sections() -> Vec<Section> {
    Section::ALL.to_vec()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub path: FieldPath,
    pub kind: FieldKind,
    #[serde(default = "default_true")]
    pub required: bool,
}

impl FieldSpec {
    fn mismatch(&self, found: &FieldValue) -> CoreError {
        CoreError::TypeMismatch {
            path: self.path.to_string(),
            expected: self.kind.as_str(),
            found: found.type_name(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramManifest {
    pub name: String,
    pub category: LoanCategory,
    #[serde(default = "all_sections")]
    pub tracked_sections: Vec<Section>,
    #[serde(default, rename = "field")]
    pub fields: Vec<FieldSpec>,
}

impl ProgramManifest {
    pub fn validate(&self) -> Result<(), CoreError> {
        let invalid = |msg: String| CoreError::InvalidManifest(format!("{}: {msg}", self.name));

        if self.name.trim().is_empty() {
            return Err(CoreError::InvalidManifest("program name must not be empty".into()));
        }
        if self.tracked_sections.is_empty() {
            return Err(invalid("no tracked sections".into()));
        }
        let tracked: BTreeSet<Section> = self.tracked_sections.iter().copied().collect();
        if tracked.len() != self.tracked_sections.len() {
            return Err(invalid("duplicate tracked section".into()));
        }

        let mut seen = BTreeSet::new();
        for spec in &self.fields {
            if spec.path.is_section_root() {
                return Err(invalid(format!("field {} names a whole section", spec.path)));
            }
            if !tracked.contains(&spec.path.section()) {
                return Err(invalid(format!(
                    "field {} belongs to untracked section {}",
                    spec.path,
                    spec.path.section()
                )));
            }
            if !seen.insert(spec.path.clone()) {
                return Err(invalid(format!("duplicate field {}", spec.path)));
            }
        }
        for outer in &self.fields {
            for inner in &self.fields {
                if outer.path != inner.path
                    && outer.path.is_prefix_of(&inner.path)
                    && !outer.kind.allows_children()
                {
                    return Err(invalid(format!(
                        "field {} nests under {} which is declared {}",
                        inner.path,
                        outer.path,
                        outer.kind.as_str()
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn is_tracked(&self, section: Section) -> bool {
        self.tracked_sections.contains(&section)
    }

    pub fn field(&self, path: &FieldPath) -> Option<&FieldSpec> {
        self.fields.iter().find(|spec| &spec.path == path)
    }

    pub fn required_fields(&self, section: Section) -> impl Iterator<Item = &FieldSpec> {
        self.fields
            .iter()
            .filter(move |spec| spec.required && spec.path.section() == section)
    }

    /// Check a single write against the declared fields it touches: the
    /// field itself, any declared field nested inside a written map, and any
    /// declared leaf the write would turn into a container.
    pub fn validate_write(&self, path: &FieldPath, value: &FieldValue) -> Result<(), CoreError> {
        for spec in &self.fields {
            if &spec.path == path {
                if !spec.kind.accepts(value) {
                    return Err(spec.mismatch(value));
                }
            } else if path.is_prefix_of(&spec.path) {
                match value {
                    FieldValue::Map(map) => {
                        let nested = spec.path.strip_prefix(path).unwrap_or_default();
                        if let Some(inner) = read_segments(map, nested)
                            && !spec.kind.accepts(inner)
                        {
                            return Err(spec.mismatch(inner));
                        }
                    }
                    FieldValue::Null => {}
                    other => {
                        return Err(CoreError::TypeMismatch {
                            path: path.to_string(),
                            expected: "map",
                            found: other.type_name(),
                        });
                    }
                }
            } else if spec.path.is_prefix_of(path) && !spec.kind.allows_children() {
                return Err(CoreError::TypeMismatch {
                    path: spec.path.to_string(),
                    expected: spec.kind.as_str(),
                    found: "map",
                });
            }
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct ManifestFile {
    #[serde(default, rename = "program")]
    programs: Vec<ProgramManifest>,
}

/// Lookup table from program name to manifest.
#[derive(Debug, Clone)]
pub struct ManifestRegistry {
    programs: BTreeMap<String, ProgramManifest>,
}

impl ManifestRegistry {
    /// Manifests shipped with the crate.
    pub fn builtin() -> Result<Self, CoreError> {
        Self::from_toml_str(BUILTIN_MANIFESTS)
    }

    pub fn from_toml_str(source: &str) -> Result<Self, CoreError> {
        let file: ManifestFile =
            toml::from_str(source).map_err(|e| CoreError::InvalidManifest(e.to_string()))?;
        Self::from_programs(file.programs)
    }

    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            CoreError::InvalidManifest(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&source)
    }

    pub fn from_programs(programs: Vec<ProgramManifest>) -> Result<Self, CoreError> {
        let mut map = BTreeMap::new();
        for program in programs {
            program.validate()?;
            let name = program.name.clone();
            if map.insert(name.clone(), program).is_some() {
                return Err(CoreError::InvalidManifest(format!("duplicate program {name}")));
            }
        }
        if map.is_empty() {
            return Err(CoreError::InvalidManifest("no programs defined".into()));
        }
        Ok(Self { programs: map })
    }

    pub fn get(&self, program: &str) -> Result<&ProgramManifest, CoreError> {
        self.programs
            .get(program)
            .ok_or_else(|| CoreError::UnknownProgram(program.to_string()))
    }

    pub fn program_names(&self) -> impl Iterator<Item = &str> {
        self.programs.keys().map(String::as_str)
    }

    pub fn programs(&self) -> impl Iterator<Item = &ProgramManifest> {
        self.programs.values()
    }
}
