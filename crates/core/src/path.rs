//! Dotted field paths and the resolver that reads and writes them against a
//! record's section containers.
//!
//! A path such as `propertyInfo.propertyAddress` always starts with a section
//! name. Only maps are containers: writing through a segment that holds any
//! other value (lists included) replaces that value with a fresh map, and
//! reading through it yields nothing.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::field_value::{FieldMap, FieldValue};
use crate::record::Section;

pub const MAX_PATH_DEPTH: usize = 16;

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldPath {
    raw: String,
    section: Section,
}

impl FieldPath {
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        if raw.is_empty() {
            return Err(CoreError::invalid_path(raw, "path is empty"));
        }
        let mut depth = 0;
        for segment in raw.split('.') {
            depth += 1;
            if segment.is_empty() {
                return Err(CoreError::invalid_path(raw, "empty segment"));
            }
            if !segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                return Err(CoreError::invalid_path(
                    raw,
                    format!("segment '{segment}' contains unsupported characters"),
                ));
            }
        }
        if depth > MAX_PATH_DEPTH {
            return Err(CoreError::invalid_path(
                raw,
                format!("deeper than {MAX_PATH_DEPTH} segments"),
            ));
        }

        let head = raw.split('.').next().unwrap_or_default();
        let section = Section::parse(head).ok_or_else(|| {
            CoreError::invalid_path(raw, format!("'{head}' is not a writable section"))
        })?;

        Ok(Self {
            raw: raw.to_string(),
            section,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn section(&self) -> Section {
        self.section
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.raw.split('.')
    }

    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// True when the path names a whole section container.
    pub fn is_section_root(&self) -> bool {
        !self.raw.contains('.')
    }

    /// Segment-wise prefix test: `a.b` is a prefix of `a.b.c` but not of `a.bc`.
    pub fn is_prefix_of(&self, other: &FieldPath) -> bool {
        other.raw == self.raw
            || (other.raw.starts_with(&self.raw)
                && other.raw.as_bytes().get(self.raw.len()) == Some(&b'.'))
    }

    /// Segments of `self` below `prefix`, or `None` if `prefix` does not
    /// contain this path.
    pub fn strip_prefix<'a>(&'a self, prefix: &FieldPath) -> Option<Vec<&'a str>> {
        if !prefix.is_prefix_of(self) {
            return None;
        }
        Some(self.segments().skip(prefix.depth()).collect())
    }
}

impl TryFrom<String> for FieldPath {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<FieldPath> for String {
    fn from(path: FieldPath) -> Self {
        path.raw
    }
}

impl fmt::Debug for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FieldPath({})", self.raw)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Read the value at `path`. Missing intermediates yield `None`.
pub fn read<'a>(root: &'a FieldMap, path: &FieldPath) -> Option<&'a FieldValue> {
    read_segments(root, path.segments())
}

pub(crate) fn read_segments<'a, 's>(
    root: &'a FieldMap,
    segments: impl IntoIterator<Item = &'s str>,
) -> Option<&'a FieldValue> {
    let mut segments = segments.into_iter();
    let mut current = root.get(segments.next()?)?;
    for segment in segments {
        current = current.as_map()?.get(segment)?;
    }
    Some(current)
}

/// Write `value` at `path`, creating missing intermediate maps and
/// overwriting non-map intermediates.
pub fn write(root: &mut FieldMap, path: &FieldPath, value: FieldValue) -> Result<(), CoreError> {
    if path.is_section_root() && !value.is_container() {
        return Err(CoreError::TypeMismatch {
            path: path.to_string(),
            expected: "map",
            found: value.type_name(),
        });
    }

    let segments: Vec<&str> = path.segments().collect();
    let Some((leaf, parents)) = segments.split_last() else {
        return Err(CoreError::invalid_path(path.as_str(), "path is empty"));
    };

    let mut current = root;
    for segment in parents {
        let slot = current
            .entry((*segment).to_string())
            .or_insert_with(|| FieldValue::Map(FieldMap::new()));
        current = ensure_map(slot);
    }
    current.insert((*leaf).to_string(), value);
    Ok(())
}

fn ensure_map(slot: &mut FieldValue) -> &mut FieldMap {
    if !slot.is_container() {
        *slot = FieldValue::Map(FieldMap::new());
    }
    match slot {
        FieldValue::Map(map) => map,
        _ => unreachable!("slot was just replaced by a map"),
    }
}
