//! Job record storage.
//!
//! The store is the source of truth for job state. Writes go through a lease so that
//! exactly one worker mutates a job at a time; reads return consistent snapshots.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

use timetable_core::{Job, JobId, JobStatus, SchoolId};

use super::types::{CancelRequest, ClaimOutcome, Lease};

/// Job store abstraction.
#[async_trait::async_trait]
pub trait JobRecordStore: Send + Sync + 'static {
    /// Persist a newly submitted job.
    async fn insert(&self, job: Job) -> Result<(), JobStoreError>;

    /// Snapshot of a job.
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Take the execution lease for `ttl`, unless the job is terminal or another
    /// live lease exists.
    async fn claim(&self, job_id: JobId, owner: &str, ttl: Duration)
    -> Result<ClaimOutcome, JobStoreError>;

    /// Extend a held lease. Fails with `LeaseLost` once another worker has claimed.
    async fn renew_lease(&self, lease: &Lease, ttl: Duration) -> Result<(), JobStoreError>;

    /// Give up a lease. Releasing a lease that is no longer held is a no-op.
    async fn release_lease(&self, lease: &Lease) -> Result<(), JobStoreError>;

    /// Write the job under `lease`. Status may only move forward.
    async fn save(&self, job: &Job, lease: &Lease) -> Result<(), JobStoreError>;

    /// Flag a non-terminal job for cancellation at its next pass boundary.
    async fn request_cancel(
        &self,
        job_id: JobId,
        reason: Option<String>,
    ) -> Result<CancelRequest, JobStoreError>;

    async fn cancel_requested(&self, job_id: JobId) -> Result<Option<CancelRequest>, JobStoreError>;

    /// Newest first.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError>;

    async fn stats(&self) -> Result<JobStats, JobStoreError>;

    /// Delete a job that was never accepted (its enqueue failed).
    async fn remove(&self, job_id: JobId) -> Result<(), JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("lease on job {0} is no longer held")]
    LeaseLost(JobId),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Listing filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub school_id: Option<SchoolId>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            status: None,
            school_id: None,
            limit: 50,
            offset: 0,
        }
    }
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| job.status() == s)
            && self.school_id.as_ref().is_none_or(|s| &job.school_id == s)
    }
}

/// Job counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub queued: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus) {
        self.add(status, 1);
    }

    pub fn add(&mut self, status: JobStatus, count: usize) {
        match status {
            JobStatus::Queued => self.queued += count,
            JobStatus::Running => self.running += count,
            JobStatus::Succeeded => self.succeeded += count,
            JobStatus::Failed => self.failed += count,
        }
    }

    pub fn total(&self) -> usize {
        self.queued + self.running + self.succeeded + self.failed
    }
}

/// Rejects writes that would move a job's status backwards or out of a terminal state.
pub(crate) fn check_forward(stored: &Job, next: &Job) -> Result<(), JobStoreError> {
    if stored.is_terminal() {
        return Err(JobStoreError::Conflict(format!(
            "job {} is already {}",
            stored.id,
            stored.status()
        )));
    }
    if next.status().rank() < stored.status().rank() {
        return Err(JobStoreError::Conflict(format!(
            "job {} cannot move from {} back to {}",
            stored.id,
            stored.status(),
            next.status()
        )));
    }
    Ok(())
}

#[derive(Debug)]
struct LeaseSlot {
    lease: Lease,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    leases: HashMap<JobId, LeaseSlot>,
    cancels: HashMap<JobId, CancelRequest>,
}

impl Inner {
    fn holds(&self, lease: &Lease) -> bool {
        self.leases
            .get(&lease.job_id)
            .is_some_and(|slot| slot.lease.token == lease.token)
    }
}

/// In-memory job store for tests/dev.
///
/// Lease expiry follows `tokio::time`, so tests can drive it with paused time.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: Mutex<Inner>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait::async_trait]
impl JobRecordStore for InMemoryJobStore {
    async fn insert(&self, job: Job) -> Result<(), JobStoreError> {
        let mut inner = self.inner.lock().await;
        if inner.jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        inner.jobs.insert(job.id, job);
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.inner.lock().await.jobs.get(&job_id).cloned())
    }

    async fn claim(
        &self,
        job_id: JobId,
        owner: &str,
        ttl: Duration,
    ) -> Result<ClaimOutcome, JobStoreError> {
        let mut inner = self.inner.lock().await;
        let Some(job) = inner.jobs.get(&job_id).cloned() else {
            return Ok(ClaimOutcome::NotFound);
        };
        if job.is_terminal() {
            return Ok(ClaimOutcome::Terminal(job));
        }

        let now = Instant::now();
        if let Some(slot) = inner.leases.get(&job_id) {
            if slot.expires_at > now {
                return Ok(ClaimOutcome::Held {
                    owner: slot.lease.owner.clone(),
                    remaining: slot.expires_at - now,
                });
            }
        }

        let lease = Lease::new(job_id, owner);
        inner.leases.insert(
            job_id,
            LeaseSlot {
                lease: lease.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(ClaimOutcome::Acquired { job, lease })
    }

    async fn renew_lease(&self, lease: &Lease, ttl: Duration) -> Result<(), JobStoreError> {
        let mut inner = self.inner.lock().await;
        match inner.leases.get_mut(&lease.job_id) {
            Some(slot) if slot.lease.token == lease.token => {
                slot.expires_at = Instant::now() + ttl;
                Ok(())
            }
            _ => Err(JobStoreError::LeaseLost(lease.job_id)),
        }
    }

    async fn release_lease(&self, lease: &Lease) -> Result<(), JobStoreError> {
        let mut inner = self.inner.lock().await;
        if inner.holds(lease) {
            inner.leases.remove(&lease.job_id);
        }
        Ok(())
    }

    async fn save(&self, job: &Job, lease: &Lease) -> Result<(), JobStoreError> {
        let mut inner = self.inner.lock().await;
        if lease.job_id != job.id || !inner.holds(lease) {
            return Err(JobStoreError::LeaseLost(job.id));
        }
        let stored = inner
            .jobs
            .get(&job.id)
            .ok_or(JobStoreError::NotFound(job.id))?;
        check_forward(stored, job)?;
        inner.jobs.insert(job.id, job.clone());
        if job.is_terminal() {
            inner.cancels.remove(&job.id);
        }
        Ok(())
    }

    async fn request_cancel(
        &self,
        job_id: JobId,
        reason: Option<String>,
    ) -> Result<CancelRequest, JobStoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner.jobs.get(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if job.is_terminal() {
            return Err(JobStoreError::Conflict(format!(
                "job {job_id} is already {}",
                job.status()
            )));
        }
        let request = inner
            .cancels
            .entry(job_id)
            .or_insert_with(|| CancelRequest {
                requested_at: Utc::now(),
                reason,
            })
            .clone();
        Ok(request)
    }

    async fn cancel_requested(&self, job_id: JobId) -> Result<Option<CancelRequest>, JobStoreError> {
        Ok(self.inner.lock().await.cancels.get(&job_id).cloned())
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        let inner = self.inner.lock().await;
        let mut result: Vec<_> = inner
            .jobs
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();

        result.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(result
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit)
            .collect())
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let inner = self.inner.lock().await;
        let mut stats = JobStats::default();
        for job in inner.jobs.values() {
            stats.record(job.status());
        }
        Ok(stats)
    }

    async fn remove(&self, job_id: JobId) -> Result<(), JobStoreError> {
        let mut inner = self.inner.lock().await;
        inner.jobs.remove(&job_id);
        inner.leases.remove(&job_id);
        inner.cancels.remove(&job_id);
        Ok(())
    }
}
