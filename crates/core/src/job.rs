//! Optimization job record and its lifecycle.
//!
//! The lifecycle is `QUEUED -> RUNNING -> {SUCCEEDED | FAILED}`. Each state carries
//! only the fields that are valid for it, so e.g. an error message cannot exist on a
//! running job and result artifacts cannot exist on a failed one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactRef;
use crate::error::{DomainError, DomainResult};
use crate::id::{JobId, SchoolId};
use crate::params::OptimizationParameters;

/// Externally visible job status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    /// Position in the lifecycle; never decreases for a given job.
    pub fn rank(&self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Running => 1,
            JobStatus::Succeeded | JobStatus::Failed => 2,
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "QUEUED" => Ok(JobStatus::Queued),
            "RUNNING" => Ok(JobStatus::Running),
            "SUCCEEDED" => Ok(JobStatus::Succeeded),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(DomainError::validation(format!("unknown job status '{other}'"))),
        }
    }
}

/// Why the refinement loop stopped.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// `maxIterations == 1`: only Pass 0 runs.
    SinglePass,
    /// No enhancer configured, or the pipeline does not use one.
    EnhancerUnavailable,
    /// Relative improvement fell below the threshold.
    Converged,
    /// The last allowed pass completed.
    IterationLimit,
    /// The whole-job wall-clock budget ran out.
    TimeBudgetExhausted,
    /// The enhancer found no beneficial adjustment.
    EnhancerNoOp,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::SinglePass => "single_pass",
            StopReason::EnhancerUnavailable => "enhancer_unavailable",
            StopReason::Converged => "converged",
            StopReason::IterationLimit => "iteration_limit",
            StopReason::TimeBudgetExhausted => "time_budget_exhausted",
            StopReason::EnhancerNoOp => "enhancer_no_op",
        }
    }
}

/// Durable record of the best schedule seen so far in a run.
///
/// A redelivered job resumes from here instead of starting over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// 1-based pass number that produced the best schedule.
    pub pass: u32,
    pub objective: f64,
    pub schedule: Vec<ArtifactRef>,
    /// Adjusted dataset the best schedule was solved from; `None` means the loaded
    /// input dataset.
    pub dataset: Option<ArtifactRef>,
}

/// Summary attached to a succeeded job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub best_objective: f64,
    pub best_pass: u32,
    pub passes: u32,
    pub stop_reason: StopReason,
    pub runtime_seconds: f64,
}

/// Terminal failure classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobFailure {
    /// The solver proved no feasible schedule exists. Never retried.
    Infeasible { message: String },
    /// Delivery was attempted more times than the queue allows.
    PoisonJob {
        attempts: u32,
        last_error: Option<String>,
    },
    /// Operator-requested stop.
    Cancelled { reason: Option<String> },
    /// An adapter returned output the orchestrator cannot use.
    Internal { message: String },
}

impl JobFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            JobFailure::Infeasible { .. } => "infeasible",
            JobFailure::PoisonJob { .. } => "poison_job",
            JobFailure::Cancelled { .. } => "cancelled",
            JobFailure::Internal { .. } => "internal",
        }
    }

    /// Human-readable error message for clients.
    pub fn message(&self) -> String {
        match self {
            JobFailure::Infeasible { message } => {
                format!("no feasible schedule exists (not retryable): {message}")
            }
            JobFailure::PoisonJob {
                attempts,
                last_error: Some(err),
            } => format!(
                "gave up after {attempts} delivery attempt(s); routed to dead-letter for operator review; last error: {err}"
            ),
            JobFailure::PoisonJob {
                attempts,
                last_error: None,
            } => format!(
                "gave up after {attempts} delivery attempt(s); routed to dead-letter for operator review"
            ),
            JobFailure::Cancelled { reason: Some(reason) } => format!("cancelled by operator: {reason}"),
            JobFailure::Cancelled { reason: None } => "cancelled by operator".to_string(),
            JobFailure::Internal { message } => format!("internal error: {message}"),
        }
    }
}

/// Lifecycle state with per-state fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    #[serde(rename_all = "camelCase")]
    Running {
        started_at: DateTime<Utc>,
        progress: u8,
        /// Delivery attempt currently (or last) executing this job.
        attempt: u32,
        /// Most recent transient failure; a redelivery is pending.
        last_error: Option<String>,
        checkpoint: Option<Checkpoint>,
        stop_reason: Option<StopReason>,
    },
    #[serde(rename_all = "camelCase")]
    Succeeded {
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        artifacts: Vec<ArtifactRef>,
        summary: RunSummary,
    },
    #[serde(rename_all = "camelCase")]
    Failed {
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        progress: u8,
        error: JobFailure,
    },
}

impl JobState {
    pub fn status(&self) -> JobStatus {
        match self {
            JobState::Queued => JobStatus::Queued,
            JobState::Running { .. } => JobStatus::Running,
            JobState::Succeeded { .. } => JobStatus::Succeeded,
            JobState::Failed { .. } => JobStatus::Failed,
        }
    }
}

/// Whether `begin_attempt` started a fresh run or picked up an interrupted one.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AttemptStart {
    Started,
    Resumed { completed_passes: u32 },
}

/// An optimization job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub school_id: SchoolId,
    pub name: String,
    pub parameters: OptimizationParameters,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    attempts: u32,
    objective_history: Vec<f64>,
    state: JobState,
}

/// Progress reported once `completed` of `max` passes are durably recorded.
pub fn pass_progress(completed: u32, max: u32) -> u8 {
    if max == 0 {
        return 95;
    }
    let pct = 10 + (85 * u64::from(completed.min(max))) / u64::from(max);
    pct.min(95) as u8
}

impl Job {
    /// Create a new job in `QUEUED`.
    pub fn new(
        school_id: SchoolId,
        name: Option<String>,
        parameters: OptimizationParameters,
        now: DateTime<Utc>,
    ) -> Self {
        let id = JobId::new();
        let name = name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("Job {id}"));
        Self {
            id,
            school_id,
            name,
            parameters,
            created_at: now,
            updated_at: now,
            attempts: 0,
            objective_history: Vec::new(),
            state: JobState::Queued,
        }
    }

    pub fn state(&self) -> &JobState {
        &self.state
    }

    pub fn status(&self) -> JobStatus {
        self.state.status()
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn objective_history(&self) -> &[f64] {
        &self.objective_history
    }

    /// Completed solver passes; always equal to the objective history length.
    pub fn iteration_count(&self) -> u32 {
        self.objective_history.len() as u32
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn progress(&self) -> u8 {
        match &self.state {
            JobState::Queued => 0,
            JobState::Running { progress, .. } => *progress,
            JobState::Succeeded { .. } => 100,
            JobState::Failed { progress, .. } => *progress,
        }
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        match &self.state {
            JobState::Queued => None,
            JobState::Running { started_at, .. }
            | JobState::Succeeded { started_at, .. }
            | JobState::Failed { started_at, .. } => Some(*started_at),
        }
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        match &self.state {
            JobState::Succeeded { completed_at, .. } | JobState::Failed { completed_at, .. } => {
                Some(*completed_at)
            }
            _ => None,
        }
    }

    /// Present only when the job has failed.
    pub fn error_message(&self) -> Option<String> {
        match &self.state {
            JobState::Failed { error, .. } => Some(error.message()),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&JobFailure> {
        match &self.state {
            JobState::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Empty unless the job has succeeded.
    pub fn result_artifacts(&self) -> &[ArtifactRef] {
        match &self.state {
            JobState::Succeeded { artifacts, .. } => artifacts,
            _ => &[],
        }
    }

    pub fn summary(&self) -> Option<&RunSummary> {
        match &self.state {
            JobState::Succeeded { summary, .. } => Some(summary),
            _ => None,
        }
    }

    pub fn last_error(&self) -> Option<&str> {
        match &self.state {
            JobState::Running { last_error, .. } => last_error.as_deref(),
            _ => None,
        }
    }

    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        match &self.state {
            JobState::Running { checkpoint, .. } => checkpoint.as_ref(),
            _ => None,
        }
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        match &self.state {
            JobState::Running { stop_reason, .. } => *stop_reason,
            JobState::Succeeded { summary, .. } => Some(summary.stop_reason),
            _ => None,
        }
    }

    /// Begin executing delivery attempt `attempt`.
    ///
    /// `QUEUED` becomes `RUNNING` (setting `startedAt`); an already running job is
    /// resumed from its recorded passes. Terminal jobs are rejected.
    pub fn begin_attempt(&mut self, attempt: u32, now: DateTime<Utc>) -> DomainResult<AttemptStart> {
        let completed_passes = self.objective_history.len() as u32;
        let outcome = match &mut self.state {
            state @ JobState::Queued => {
                *state = JobState::Running {
                    started_at: now,
                    progress: 0,
                    attempt,
                    last_error: None,
                    checkpoint: None,
                    stop_reason: None,
                };
                AttemptStart::Started
            }
            JobState::Running { attempt: current, .. } => {
                *current = attempt;
                AttemptStart::Resumed { completed_passes }
            }
            JobState::Succeeded { .. } => {
                return Err(DomainError::illegal_transition("SUCCEEDED", "RUNNING"));
            }
            JobState::Failed { .. } => {
                return Err(DomainError::illegal_transition("FAILED", "RUNNING"));
            }
        };
        self.attempts = self.attempts.max(attempt);
        self.updated_at = now;
        Ok(outcome)
    }

    /// Raise advisory progress; lower values are ignored.
    pub fn advance_progress(&mut self, value: u8, now: DateTime<Utc>) -> DomainResult<()> {
        let JobState::Running { progress, .. } = &mut self.state else {
            return Err(self.not_running("advance progress"));
        };
        *progress = (*progress).max(value.min(99));
        self.updated_at = now;
        Ok(())
    }

    /// Append a completed pass objective. Returns the 1-based pass number.
    pub fn record_pass(&mut self, objective: f64, now: DateTime<Utc>) -> DomainResult<u32> {
        if !matches!(self.state, JobState::Running { .. }) {
            return Err(self.not_running("record a pass"));
        }
        if !objective.is_finite() {
            return Err(DomainError::invariant(format!(
                "objective must be finite, got {objective}"
            )));
        }
        self.objective_history.push(objective);
        let pass = self.iteration_count();
        let max = self.parameters.max_iterations;
        self.advance_progress(pass_progress(pass, max), now)?;
        Ok(pass)
    }

    pub fn set_checkpoint(&mut self, value: Checkpoint, now: DateTime<Utc>) -> DomainResult<()> {
        let JobState::Running { checkpoint, .. } = &mut self.state else {
            return Err(self.not_running("set a checkpoint"));
        };
        *checkpoint = Some(value);
        self.updated_at = now;
        Ok(())
    }

    pub fn set_stop_reason(&mut self, reason: StopReason, now: DateTime<Utc>) -> DomainResult<()> {
        let JobState::Running { stop_reason, .. } = &mut self.state else {
            return Err(self.not_running("set a stop reason"));
        };
        *stop_reason = Some(reason);
        self.updated_at = now;
        Ok(())
    }

    /// Note a transient failure; the job stays `RUNNING` awaiting redelivery.
    pub fn record_transient_failure(
        &mut self,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        let JobState::Running { last_error, .. } = &mut self.state else {
            return Err(self.not_running("record a transient failure"));
        };
        *last_error = Some(error.into());
        self.updated_at = now;
        Ok(())
    }

    /// `RUNNING -> SUCCEEDED`. Requires at least one result artifact.
    pub fn succeed(
        &mut self,
        artifacts: Vec<ArtifactRef>,
        summary: RunSummary,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        let JobState::Running { started_at, .. } = &self.state else {
            return Err(DomainError::illegal_transition(self.status().as_str(), "SUCCEEDED"));
        };
        if artifacts.is_empty() {
            return Err(DomainError::invariant(
                "a succeeded job must carry at least one result artifact",
            ));
        }
        self.state = JobState::Succeeded {
            started_at: *started_at,
            completed_at: now,
            artifacts,
            summary,
        };
        self.updated_at = now;
        Ok(())
    }

    /// `RUNNING -> FAILED`.
    pub fn fail(&mut self, error: JobFailure, now: DateTime<Utc>) -> DomainResult<()> {
        let JobState::Running {
            started_at,
            progress,
            ..
        } = &self.state
        else {
            return Err(DomainError::illegal_transition(self.status().as_str(), "FAILED"));
        };
        self.state = JobState::Failed {
            started_at: *started_at,
            completed_at: now,
            progress: *progress,
            error,
        };
        self.updated_at = now;
        Ok(())
    }

    fn not_running(&self, action: &str) -> DomainError {
        DomainError::invariant(format!(
            "cannot {action} while job is {}",
            self.status().as_str()
        ))
    }
}
