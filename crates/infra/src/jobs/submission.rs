//! Write path: accepting, cancelling and redriving jobs.

use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, instrument, warn};

use timetable_core::{
    DomainError, Job, JobId, JobStatus, MessageId, OptimizationParameters, OptimizationType,
    ParameterOverrides, SchoolId,
};

use super::queue::{QueueError, WorkQueue};
use super::store::{JobFilter, JobRecordStore, JobStoreError};
use super::types::CancelRequest;

/// A submission before validation.
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub school_id: String,
    pub optimization_type: Option<String>,
    pub name: Option<String>,
    pub parameters: ParameterOverrides,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmittedJob {
    pub job_id: JobId,
    pub message_id: MessageId,
    pub status: JobStatus,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("invalid submission: {0}")]
    Invalid(#[from] DomainError),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("dead-letter message not found: {0}")]
    MessageNotFound(MessageId),
    #[error("job {job_id} is already {status}")]
    AlreadyTerminal { job_id: JobId, status: JobStatus },
    #[error(transparent)]
    Store(JobStoreError),
    #[error(transparent)]
    Queue(QueueError),
}

impl From<JobStoreError> for SubmitError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound(id) => SubmitError::NotFound(id),
            other => SubmitError::Store(other),
        }
    }
}

impl From<QueueError> for SubmitError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::MessageNotFound(id) => SubmitError::MessageNotFound(id),
            other => SubmitError::Queue(other),
        }
    }
}

#[derive(Clone)]
pub struct SubmissionService {
    store: Arc<dyn JobRecordStore>,
    queue: Arc<dyn WorkQueue>,
}

impl SubmissionService {
    pub fn new(store: Arc<dyn JobRecordStore>, queue: Arc<dyn WorkQueue>) -> Self {
        Self { store, queue }
    }

    /// Validate, persist as `QUEUED`, then enqueue a work message.
    ///
    /// If enqueueing fails the record is removed again, so a client never sees a job
    /// that no worker will pick up.
    #[instrument(skip(self, request), fields(school_id = %request.school_id))]
    pub async fn submit(&self, request: NewJob) -> Result<SubmittedJob, SubmitError> {
        let school_id = SchoolId::parse(request.school_id)?;
        let optimization_type = match request.optimization_type.as_deref() {
            None => OptimizationType::default(),
            Some(raw) => OptimizationType::from_str(raw)?,
        };
        let parameters = OptimizationParameters::from_overrides(optimization_type, &request.parameters)?;

        let job = Job::new(school_id, request.name, parameters, Utc::now());
        let job_id = job.id;
        self.store.insert(job).await?;

        let message_id = match self.queue.enqueue(job_id).await {
            Ok(id) => id,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "enqueue failed; withdrawing job");
                if let Err(remove_err) = self.store.remove(job_id).await {
                    warn!(job_id = %job_id, error = %remove_err, "failed to withdraw job");
                }
                return Err(e.into());
            }
        };

        info!(job_id = %job_id, message_id = %message_id, "job submitted");
        Ok(SubmittedJob {
            job_id,
            message_id,
            status: JobStatus::Queued,
        })
    }

    /// Ask the worker holding `job_id` to stop at its next pass boundary.
    ///
    /// Repeated requests return the first one.
    #[instrument(skip(self))]
    pub async fn cancel(
        &self,
        job_id: JobId,
        reason: Option<String>,
    ) -> Result<CancelRequest, SubmitError> {
        match self.store.request_cancel(job_id, reason).await {
            Ok(request) => {
                info!(job_id = %job_id, "cancellation requested");
                Ok(request)
            }
            Err(JobStoreError::Conflict(_)) => Err(self.terminal_error(job_id).await),
            Err(e) => Err(e.into()),
        }
    }

    /// Put a dead-lettered message back on the queue. Terminal jobs are refused.
    #[instrument(skip(self))]
    pub async fn redrive(&self, message_id: MessageId) -> Result<MessageId, SubmitError> {
        let entry = self
            .queue
            .dead_letters(usize::MAX)
            .await?
            .into_iter()
            .find(|e| e.message_id == message_id)
            .ok_or(SubmitError::MessageNotFound(message_id))?;

        let job = self
            .store
            .get(entry.job_id)
            .await?
            .ok_or(SubmitError::NotFound(entry.job_id))?;
        if job.is_terminal() {
            return Err(SubmitError::AlreadyTerminal {
                job_id: job.id,
                status: job.status(),
            });
        }

        let new_id = self.queue.redrive(message_id).await?;
        info!(job_id = %job.id, message_id = %new_id, "dead-letter redriven");
        Ok(new_id)
    }

    /// Enqueue every job that has not finished yet.
    ///
    /// Used at startup when the store outlives the queue. Enqueue deduplicates, so jobs
    /// that still have a live message are not doubled.
    pub async fn requeue_unfinished(&self) -> Result<usize, SubmitError> {
        const PAGE: usize = 100;
        let mut requeued = 0;
        for status in [JobStatus::Queued, JobStatus::Running] {
            let mut offset = 0;
            loop {
                let page = self
                    .store
                    .list(&JobFilter {
                        status: Some(status),
                        school_id: None,
                        limit: PAGE,
                        offset,
                    })
                    .await?;
                for job in &page {
                    self.queue.enqueue(job.id).await?;
                    requeued += 1;
                }
                if page.len() < PAGE {
                    break;
                }
                offset += PAGE;
            }
        }
        if requeued > 0 {
            info!(requeued, "requeued unfinished jobs");
        }
        Ok(requeued)
    }

    async fn terminal_error(&self, job_id: JobId) -> SubmitError {
        match self.store.get(job_id).await {
            Ok(Some(job)) => SubmitError::AlreadyTerminal {
                job_id,
                status: job.status(),
            },
            Ok(None) => SubmitError::NotFound(job_id),
            Err(e) => e.into(),
        }
    }
}
