use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use timetable_core::SchoolId;

/// Solver input: a school's data as opaque named text files.
///
/// `revision` is 0 for the loaded input and increases with every enhancer adjustment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dataset {
    pub school_id: SchoolId,
    pub revision: u32,
    pub files: BTreeMap<String, String>,
}

impl Dataset {
    pub fn new(school_id: SchoolId) -> Self {
        Self {
            school_id,
            revision: 0,
            files: BTreeMap::new(),
        }
    }

    pub fn with_file(mut self, name: impl Into<String>, contents: impl Into<String>) -> Self {
        self.files.insert(name.into(), contents.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.files.values().map(String::len).sum()
    }

    /// Copy of this dataset at the next revision, for enhancers to modify.
    pub fn next_revision(&self) -> Self {
        Self {
            school_id: self.school_id.clone(),
            revision: self.revision + 1,
            files: self.files.clone(),
        }
    }
}

/// Solver output: named schedule files (master schedule, assignments, violations).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleArtifact {
    pub files: BTreeMap<String, String>,
}

impl ScheduleArtifact {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, name: impl Into<String>, contents: impl Into<String>) -> Self {
        self.files.insert(name.into(), contents.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
