//! Loading a school's input dataset.
//!
//! The orchestrator treats input files as opaque text; only the solver interprets them.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use tokio::sync::RwLock;
use tracing::{debug, instrument};

use timetable_core::SchoolId;
use timetable_engine::Dataset;

#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    /// No input exists for the school; retrying will not help.
    #[error("no input data for school {0}")]
    NotFound(SchoolId),
    #[error("dataset io error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait::async_trait]
pub trait DatasetLoader: Send + Sync + 'static {
    async fn load(&self, school_id: &SchoolId) -> Result<Dataset, DatasetError>;
}

/// Reads every regular file below `<root>/<schoolId>/`.
///
/// File names in the dataset are paths relative to the school directory, using `/`
/// separators (`students/Student_Info.csv`).
#[derive(Debug, Clone)]
pub struct DirectoryDatasetLoader {
    root: PathBuf,
}

impl DirectoryDatasetLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait::async_trait]
impl DatasetLoader for DirectoryDatasetLoader {
    #[instrument(skip(self), fields(school_id = %school_id), err)]
    async fn load(&self, school_id: &SchoolId) -> Result<Dataset, DatasetError> {
        // SchoolId::parse rejects separators and "..", so this stays under root.
        let base = self.root.join(school_id.as_str());
        if !tokio::fs::try_exists(&base).await? {
            return Err(DatasetError::NotFound(school_id.clone()));
        }

        let mut dataset = Dataset::new(school_id.clone());
        let mut pending = vec![base.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file() {
                    let Ok(relative) = path.strip_prefix(&base) else {
                        continue;
                    };
                    let name = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    let contents = tokio::fs::read_to_string(&path).await?;
                    dataset.files.insert(name, contents);
                }
            }
        }

        debug!(files = dataset.files.len(), bytes = dataset.total_bytes(), "dataset loaded");
        Ok(dataset)
    }
}

/// Generates a small deterministic dataset for any school. Used with the simulated
/// backend when no dataset directory is configured.
#[derive(Debug, Clone)]
pub struct SyntheticDatasetLoader {
    pub students: usize,
    pub sections: usize,
}

impl Default for SyntheticDatasetLoader {
    fn default() -> Self {
        Self {
            students: 40,
            sections: 8,
        }
    }
}

#[async_trait::async_trait]
impl DatasetLoader for SyntheticDatasetLoader {
    async fn load(&self, school_id: &SchoolId) -> Result<Dataset, DatasetError> {
        let mut students = String::from("Student ID,Grade Level\n");
        let mut preferences = String::from("Student ID,Preferred Sections\n");
        for s in 0..self.students {
            students.push_str(&format!("ST{s:04},{}\n", 9 + s % 4));
            let first = s % self.sections.max(1);
            let second = (s + 3) % self.sections.max(1);
            preferences.push_str(&format!("ST{s:04},SEC{first:03};SEC{second:03}\n"));
        }

        let mut sections = String::from("Section ID,Course ID,Teacher Assigned,# of Seats Available\n");
        for c in 0..self.sections {
            sections.push_str(&format!("SEC{c:03},C{},T{:02},{}\n", c / 2, c % 5, 25 + c % 10));
        }

        let teachers = (0..5)
            .map(|t| format!("T{t:02},Department {}\n", t % 3))
            .fold(String::from("Teacher ID,Department\n"), |acc, row| acc + &row);

        Ok(Dataset::new(school_id.clone())
            .with_file("students/Student_Info.csv", students)
            .with_file("students/Student_Preference_Info.csv", preferences)
            .with_file("sections/Sections_Information.csv", sections)
            .with_file("teachers/Teacher_Info.csv", teachers)
            .with_file("teachers/Teacher_unavailability.csv", "Teacher ID,Unavailable Periods\n")
            .with_file("schedule/Period.csv", "period_name\nR1\nR2\nR3\nR4\nG1\nG2\nG3\nG4\n"))
    }
}

/// Datasets registered in memory, for tests.
#[derive(Debug, Default)]
pub struct InMemoryDatasetLoader {
    datasets: RwLock<HashMap<SchoolId, BTreeMap<String, String>>>,
}

impl InMemoryDatasetLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, school_id: SchoolId, files: BTreeMap<String, String>) {
        self.datasets.write().await.insert(school_id, files);
    }
}

#[async_trait::async_trait]
impl DatasetLoader for InMemoryDatasetLoader {
    async fn load(&self, school_id: &SchoolId) -> Result<Dataset, DatasetError> {
        let datasets = self.datasets.read().await;
        let files = datasets
            .get(school_id)
            .ok_or_else(|| DatasetError::NotFound(school_id.clone()))?;
        let mut dataset = Dataset::new(school_id.clone());
        dataset.files = files.clone();
        Ok(dataset)
    }
}
