//! Read path: job state rendered as a polling-friendly view.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use timetable_core::{
    ArtifactRef, Job, JobId, JobStatus, OptimizationParameters, RunSummary, SchoolId,
};

use super::store::{JobFilter, JobRecordStore, JobStats, JobStoreError};

/// Client-facing projection of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub id: JobId,
    pub name: String,
    pub school_id: SchoolId,
    pub status: JobStatus,
    pub message: String,
    pub progress: u8,
    pub iteration_count: u32,
    pub objective_history: Vec<f64>,
    pub attempts: u32,
    pub parameters: OptimizationParameters,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<ArtifactRef>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<RunSummary>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl JobStatusView {
    pub fn from_job(job: &Job) -> Self {
        let results = match job.status() {
            JobStatus::Succeeded => Some(job.result_artifacts().to_vec()),
            _ => None,
        };
        Self {
            id: job.id,
            name: job.name.clone(),
            school_id: job.school_id.clone(),
            status: job.status(),
            message: render_message(job),
            progress: job.progress(),
            iteration_count: job.iteration_count(),
            objective_history: job.objective_history().to_vec(),
            attempts: job.attempts(),
            parameters: job.parameters.clone(),
            error_message: job.error_message(),
            last_error: job.last_error().map(str::to_string),
            results,
            summary: job.summary().cloned(),
            created_at: job.created_at,
            started_at: job.started_at(),
            completed_at: job.completed_at(),
            updated_at: job.updated_at,
        }
    }

    /// Nothing about this job will change any more.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Human-readable status line.
pub fn render_message(job: &Job) -> String {
    match job.status() {
        JobStatus::Queued => "Job is queued and waiting for a worker".to_string(),
        JobStatus::Running => {
            let mut message = format!(
                "Optimization in progress: {} of up to {} pass(es) complete",
                job.iteration_count(),
                job.parameters.max_iterations
            );
            if let Some(err) = job.last_error() {
                message.push_str(&format!("; retrying after error: {err}"));
            }
            message
        }
        JobStatus::Succeeded => match job.summary() {
            Some(summary) => format!(
                "Optimization completed after {} pass(es); best objective {:.4} from pass {} ({})",
                summary.passes,
                summary.best_objective,
                summary.best_pass,
                summary.stop_reason.as_str()
            ),
            None => "Optimization completed".to_string(),
        },
        JobStatus::Failed => job
            .error_message()
            .unwrap_or_else(|| "Optimization failed".to_string()),
    }
}

/// Result files of a succeeded job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResultsView {
    pub job_id: JobId,
    pub school_id: SchoolId,
    pub artifacts: Vec<ArtifactRef>,
    pub summary: Option<RunSummary>,
    pub objective_history: Vec<f64>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {job_id} has not succeeded (status {status})")]
    NotCompleted { job_id: JobId, status: JobStatus },
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

#[derive(Clone)]
pub struct StatusService {
    store: Arc<dyn JobRecordStore>,
}

impl StatusService {
    pub fn new(store: Arc<dyn JobRecordStore>) -> Self {
        Self { store }
    }

    pub async fn get_status(&self, job_id: JobId) -> Result<JobStatusView, StatusError> {
        let job = self.load(job_id).await?;
        Ok(JobStatusView::from_job(&job))
    }

    /// Fails with `NotCompleted` unless the job has succeeded.
    pub async fn get_results(&self, job_id: JobId) -> Result<JobResultsView, StatusError> {
        let job = self.load(job_id).await?;
        if job.status() != JobStatus::Succeeded {
            return Err(StatusError::NotCompleted {
                job_id,
                status: job.status(),
            });
        }
        Ok(JobResultsView {
            job_id,
            school_id: job.school_id.clone(),
            artifacts: job.result_artifacts().to_vec(),
            summary: job.summary().cloned(),
            objective_history: job.objective_history().to_vec(),
            completed_at: job.completed_at(),
        })
    }

    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<JobStatusView>, StatusError> {
        let jobs = self.store.list(filter).await?;
        Ok(jobs.iter().map(JobStatusView::from_job).collect())
    }

    pub async fn stats(&self) -> Result<JobStats, StatusError> {
        Ok(self.store.stats().await?)
    }

    async fn load(&self, job_id: JobId) -> Result<Job, StatusError> {
        self.store
            .get(job_id)
            .await?
            .ok_or(StatusError::NotFound(job_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::ClaimOutcome;
    use std::time::Duration;
    use timetable_core::{JobFailure, StopReason};

    fn new_job() -> Job {
        Job::new(
            SchoolId::parse("s1").unwrap(),
            Some("Fall term".into()),
            OptimizationParameters::default(),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn queued_job_view() {
        let store = InMemoryJobStore::arc();
        let job = new_job();
        let id = job.id;
        store.insert(job).await.unwrap();

        let service = StatusService::new(store);
        let view = service.get_status(id).await.unwrap();
        assert_eq!(view.status, JobStatus::Queued);
        assert_eq!(view.progress, 0);
        assert_eq!(view.iteration_count, 0);
        assert!(view.results.is_none());
        assert!(view.error_message.is_none());
        assert!(!view.is_terminal());

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["status"], "QUEUED");
        assert_eq!(json["schoolId"], "s1");
        assert!(json.get("errorMessage").is_none());
    }

    #[tokio::test]
    async fn results_of_unfinished_job_conflict() {
        let store = InMemoryJobStore::arc();
        let job = new_job();
        let id = job.id;
        store.insert(job).await.unwrap();

        let service = StatusService::new(store);
        assert!(matches!(
            service.get_results(id).await,
            Err(StatusError::NotCompleted { status: JobStatus::Queued, .. })
        ));
        assert!(matches!(
            service.get_status(JobId::new()).await,
            Err(StatusError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn failed_job_exposes_error_message() {
        let store = InMemoryJobStore::arc();
        let job = new_job();
        let id = job.id;
        store.insert(job).await.unwrap();

        let ClaimOutcome::Acquired { mut job, lease } =
            store.claim(id, "w", Duration::from_secs(5)).await.unwrap()
        else {
            panic!("expected lease");
        };
        job.begin_attempt(1, Utc::now()).unwrap();
        job.fail(
            JobFailure::Infeasible {
                message: "not enough seats".into(),
            },
            Utc::now(),
        )
        .unwrap();
        store.save(&job, &lease).await.unwrap();

        let view = StatusService::new(store).get_status(id).await.unwrap();
        assert_eq!(view.status, JobStatus::Failed);
        assert!(view.is_terminal());
        assert!(view.message.contains("not enough seats"));
        assert_eq!(view.error_message, Some(view.message.clone()));
    }

    #[test]
    fn running_message_mentions_retry() {
        let mut job = new_job();
        job.begin_attempt(1, Utc::now()).unwrap();
        job.record_pass(12.0, Utc::now()).unwrap();
        job.record_transient_failure("solver crashed", Utc::now()).unwrap();
        job.set_stop_reason(StopReason::Converged, Utc::now()).unwrap();

        let message = render_message(&job);
        assert!(message.contains("1 of up to 3"));
        assert!(message.contains("solver crashed"));
    }
}
