//! `timetable-core`: job model for the schedule optimization orchestrator.
//!
//! This crate contains **pure domain** types (no infrastructure concerns): identifiers,
//! optimization parameters, and the job lifecycle state machine.

pub mod artifact;
pub mod error;
pub mod id;
pub mod job;
pub mod params;

pub use artifact::ArtifactRef;
pub use error::{DomainError, DomainResult};
pub use id::{JobId, MessageId, SchoolId};
pub use job::{
    AttemptStart, Checkpoint, Job, JobFailure, JobState, JobStatus, RunSummary, StopReason,
    pass_progress,
};
pub use params::{OptimizationParameters, OptimizationType, ParameterOverrides, relative_improvement};
