use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::field_value::FieldMap;
use crate::manifest::ProgramManifest;
use crate::path;
use crate::record::{LoanApplicationRecord, Section};

/// Derived completion state. Only [`compute`] produces non-default values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub sections: BTreeMap<Section, bool>,
    pub overall_progress: u8,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            sections: Section::ALL.into_iter().map(|s| (s, false)).collect(),
            overall_progress: 0,
        }
    }
}

impl Progress {
    pub fn is_complete(&self, section: Section) -> bool {
        self.sections.get(&section).copied().unwrap_or(false)
    }

    /// Sections complete here that were not complete in `before`.
    pub fn newly_completed(&self, before: &Progress) -> Vec<Section> {
        Section::ALL
            .into_iter()
            .filter(|s| self.is_complete(*s) && !before.is_complete(*s))
            .collect()
    }
}

/// Derive progress from section containers alone.
pub fn compute_sections(sections: &FieldMap, manifest: &ProgramManifest) -> Progress {
    let mut flags = BTreeMap::new();
    let mut complete = 0usize;

    for section in Section::ALL {
        let done = manifest.is_tracked(section) && section_complete(sections, section, manifest);
        if done {
            complete += 1;
        }
        flags.insert(section, done);
    }

    let tracked = manifest.tracked_sections.len();
    let overall_progress = if tracked == 0 {
        0
    } else {
        (complete * 100 / tracked) as u8
    };

    Progress {
        sections: flags,
        overall_progress,
    }
}

pub fn compute(record: &LoanApplicationRecord, manifest: &ProgramManifest) -> Progress {
    compute_sections(&record.sections, manifest)
}

fn section_complete(sections: &FieldMap, section: Section, manifest: &ProgramManifest) -> bool {
    let mut required = manifest.required_fields(section).peekable();
    if required.peek().is_none() {
        return sections
            .get(section.as_str())
            .is_some_and(|container| container.is_present());
    }
    required.all(|spec| path::read(sections, &spec.path).is_some_and(|v| v.is_present()))
}
