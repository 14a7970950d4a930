use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::dataset::{Dataset, ScheduleArtifact};

/// Result of a single solver pass.
///
/// **Sign convention:** `objective` is higher-is-better everywhere in this system.
/// Solvers that minimize a cost must negate it before returning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Solution {
    pub objective: f64,
    pub schedule: ScheduleArtifact,
    /// Free-form solver metadata (gap, runtime, satisfaction rate...).
    pub metadata: JsonValue,
}

impl Solution {
    pub fn new(objective: f64, schedule: ScheduleArtifact) -> Self {
        Self {
            objective,
            schedule,
            metadata: JsonValue::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SolverError {
    /// No feasible schedule exists for the input. Retrying cannot help.
    #[error("infeasible: {0}")]
    Infeasible(String),

    #[error("solver timed out after {0:?}")]
    Timeout(Duration),

    /// I/O failure, crashed process, unavailable service.
    #[error("transient solver failure: {0}")]
    Transient(String),
}

impl SolverError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SolverError::Infeasible(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SolverError::Infeasible(_) => "INFEASIBLE",
            SolverError::Timeout(_) => "TIMEOUT",
            SolverError::Transient(_) => "TRANSIENT",
        }
    }
}

/// The constraint solver boundary.
///
/// Implementations must be deterministic for a given dataset and must return within
/// roughly `time_limit`; the orchestrator never calls `solve` concurrently for the
/// same job.
#[async_trait::async_trait]
pub trait Solver: Send + Sync + 'static {
    /// Short name for logs.
    fn name(&self) -> &str;

    async fn solve(&self, dataset: &Dataset, time_limit: Duration) -> Result<Solution, SolverError>;
}
