use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dataset::{Dataset, ScheduleArtifact};

/// Outcome of a refinement pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Enhancement {
    /// A modified dataset worth re-solving.
    Adjusted { dataset: Dataset },
    /// No beneficial adjustment was found.
    NoOp,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EnhancerError {
    #[error("transient enhancer failure: {0}")]
    Transient(String),
}

/// The heuristic refinement boundary.
///
/// Receives the current best schedule together with the dataset it was solved from,
/// and proposes an adjusted dataset (e.g. rebalanced section capacities).
#[async_trait::async_trait]
pub trait Enhancer: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn enhance(
        &self,
        schedule: &ScheduleArtifact,
        dataset: &Dataset,
    ) -> Result<Enhancement, EnhancerError>;
}
