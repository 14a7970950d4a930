//! References to persisted output files.

use serde::{Deserialize, Serialize};

/// Well-known schedule output file names.
pub mod names {
    pub const MASTER_SCHEDULE: &str = "master_schedule.csv";
    pub const STUDENT_ASSIGNMENTS: &str = "student_assignments.csv";
    pub const TEACHER_ASSIGNMENTS: &str = "teacher_assignments.csv";
    pub const CONSTRAINT_VIOLATIONS: &str = "constraint_violations.csv";
}

/// A persisted, opaque blob with a name and a retrievable location.
///
/// The core never interprets artifact contents; format is owned by the solver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRef {
    pub name: String,
    /// Backend-specific location (`mem://...`, `file://...`).
    pub location: String,
    pub size_bytes: u64,
}

impl ArtifactRef {
    pub fn new(name: impl Into<String>, location: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            name: name.into(),
            location: location.into(),
            size_bytes,
        }
    }
}
