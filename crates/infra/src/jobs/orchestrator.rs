//! The job state machine: claim, run the refinement pipeline, settle the message.
//!
//! ## Delivery handling
//!
//! | Claim outcome                   | Action                                          |
//! |---------------------------------|-------------------------------------------------|
//! | job missing / terminal          | ack (duplicate or orphan delivery)              |
//! | lease held by a live worker     | release with the lease's remaining time         |
//! | acquired                        | run the pipeline under a heartbeat              |
//! | receive count over the limit    | mark `FAILED` (poison job), dead-letter         |
//!
//! ## Pipeline
//!
//! Pass 1 solves the loaded dataset. For `hybrid` jobs with an enhancer configured,
//! each further pass asks the enhancer to adjust the dataset behind the best schedule
//! seen so far and re-solves it, until the improvement falls under the threshold, the
//! iteration limit or the wall-clock budget is reached, or the enhancer has nothing to
//! offer. Every pass is durably recorded (objective, artifacts, checkpoint) before the
//! next one starts, so a redelivered job resumes where it stopped.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use timetable_core::{
    ArtifactRef, AttemptStart, Checkpoint, DomainError, Job, JobFailure, JobStatus, RunSummary,
    StopReason, relative_improvement,
};
use timetable_engine::{
    Dataset, Enhancement, EnhancerError, Engines, ScheduleArtifact, Solution, SolverError,
};

use super::queue::{QueueError, WorkQueue};
use super::store::{JobRecordStore, JobStoreError};
use super::types::{ClaimOutcome, Delivery, Lease, RetryPolicy};
use crate::artifacts::{ArtifactError, ArtifactStore};
use crate::datasets::{DatasetError, DatasetLoader};

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How long a claim holds the job lease without renewal.
    pub lease_ttl: Duration,
    /// Heartbeat period; defaults to a third of the queue visibility timeout.
    pub heartbeat_interval: Option<Duration>,
    /// Backoff for redelivery after a transient failure.
    pub retry_policy: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(120),
            heartbeat_interval: None,
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// What happened to a delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Succeeded,
    /// Terminal failure; the message was acknowledged.
    Failed,
    /// Transient failure; the message was released for redelivery.
    Retrying { delay: Duration },
    /// Poison job; the message was moved to the dead-letter queue.
    DeadLettered,
    /// Duplicate or orphan delivery, acknowledged without work.
    Skipped,
    /// Another worker holds the lease; the message was released.
    Deferred { delay: Duration },
    /// The lease was lost mid-run; the message was left to expire.
    Abandoned,
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Why a run stopped before producing a result.
#[derive(Debug)]
enum PipelineError {
    Infeasible(String),
    Cancelled(Option<String>),
    /// Adapter output or stored state the run cannot use.
    Internal(String),
    /// Worth retrying on a later delivery.
    Transient(String),
    /// Another worker owns the job now (or it was finished elsewhere).
    LeaseLost,
}

impl From<JobStoreError> for PipelineError {
    fn from(e: JobStoreError) -> Self {
        match e {
            JobStoreError::LeaseLost(_) | JobStoreError::Conflict(_) | JobStoreError::NotFound(_) => {
                PipelineError::LeaseLost
            }
            JobStoreError::AlreadyExists(_) | JobStoreError::Storage(_) => {
                PipelineError::Transient(e.to_string())
            }
        }
    }
}

impl From<DomainError> for PipelineError {
    fn from(e: DomainError) -> Self {
        PipelineError::Internal(e.to_string())
    }
}

impl From<ArtifactError> for PipelineError {
    fn from(e: ArtifactError) -> Self {
        match e {
            ArtifactError::Io(_) => PipelineError::Transient(e.to_string()),
            ArtifactError::InvalidKey(_) | ArtifactError::NotFound(_) => {
                PipelineError::Internal(e.to_string())
            }
        }
    }
}

impl From<DatasetError> for PipelineError {
    fn from(e: DatasetError) -> Self {
        match e {
            DatasetError::NotFound(_) => PipelineError::Internal(e.to_string()),
            DatasetError::Io(_) => PipelineError::Transient(e.to_string()),
        }
    }
}

impl From<SolverError> for PipelineError {
    fn from(e: SolverError) -> Self {
        match e {
            SolverError::Infeasible(msg) => PipelineError::Infeasible(msg),
            SolverError::Timeout(_) | SolverError::Transient(_) => {
                PipelineError::Transient(e.to_string())
            }
        }
    }
}

impl From<EnhancerError> for PipelineError {
    fn from(e: EnhancerError) -> Self {
        PipelineError::Transient(e.to_string())
    }
}

/// State of one claimed execution.
struct Run {
    job: Job,
    lease: Lease,
    lease_lost: CancellationToken,
    /// `None` when the budget reaches past what `Instant` can represent.
    deadline: Option<Instant>,
}

/// Best schedule seen so far, with the dataset it was solved from.
struct Best {
    pass: u32,
    objective: f64,
    schedule: ScheduleArtifact,
    dataset: Dataset,
}

/// Renews queue visibility and the job lease until stopped.
/// Renewal task for one run. Dropping it, including during unwinding, stops the task.
struct Heartbeat {
    stop: DropGuard,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    async fn stop(self) {
        let Heartbeat { stop, handle } = self;
        drop(stop);
        let _ = handle.await;
    }
}

/// Terminal transitions require `RUNNING`; a job that never started is started first.
fn ensure_running(job: &mut Job, attempt: u32) -> Result<(), DomainError> {
    if job.status() == JobStatus::Queued {
        job.begin_attempt(attempt, Utc::now())?;
    }
    Ok(())
}

fn pass_key(run: &Run, pass: u32, name: &str) -> String {
    format!("jobs/{}/pass-{pass}/{name}", run.job.id)
}

pub struct Orchestrator {
    store: Arc<dyn JobRecordStore>,
    queue: Arc<dyn WorkQueue>,
    datasets: Arc<dyn DatasetLoader>,
    artifacts: Arc<dyn ArtifactStore>,
    engines: Engines,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn JobRecordStore>,
        queue: Arc<dyn WorkQueue>,
        datasets: Arc<dyn DatasetLoader>,
        artifacts: Arc<dyn ArtifactStore>,
        engines: Engines,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            queue,
            datasets,
            artifacts,
            engines,
            config,
        }
    }

    pub fn queue(&self) -> &Arc<dyn WorkQueue> {
        &self.queue
    }

    fn heartbeat_interval(&self) -> Duration {
        self.config
            .heartbeat_interval
            .unwrap_or_else(|| self.queue.visibility_timeout() / 3)
            .max(Duration::from_millis(10))
    }

    /// Handle one delivery end to end.
    ///
    /// Errors are store or queue failures while settling the message; the message is
    /// then left to reappear after its visibility timeout.
    pub async fn process(
        &self,
        delivery: &Delivery,
        worker: &str,
    ) -> Result<Disposition, OrchestratorError> {
        let job_id = delivery.job_id;

        if delivery.receive_count > self.queue.max_receive_count() {
            return self.poison(delivery, worker, None).await;
        }

        let (job, lease) = match self
            .store
            .claim(job_id, worker, self.config.lease_ttl)
            .await?
        {
            ClaimOutcome::Acquired { job, lease } => (job, lease),
            ClaimOutcome::Terminal(job) => {
                debug!(job_id = %job_id, status = %job.status(), "duplicate delivery of finished job");
                self.queue.ack(delivery).await?;
                return Ok(Disposition::Skipped);
            }
            ClaimOutcome::NotFound => {
                warn!(job_id = %job_id, message_id = %delivery.message_id, "delivery for unknown job");
                self.queue.ack(delivery).await?;
                return Ok(Disposition::Skipped);
            }
            ClaimOutcome::Held { owner, remaining } => {
                let delay = remaining.min(self.config.lease_ttl);
                debug!(job_id = %job_id, owner = %owner, ?delay, "job leased elsewhere; deferring");
                self.queue.release(delivery, delay).await?;
                return Ok(Disposition::Deferred { delay });
            }
        };

        let heartbeat_lost = CancellationToken::new();
        let heartbeat = self.spawn_heartbeat(delivery.clone(), lease.clone(), heartbeat_lost.clone());

        let mut run = Run {
            job,
            lease,
            lease_lost: heartbeat_lost,
            deadline: None,
        };
        let outcome = self.execute(&mut run, delivery).await;
        heartbeat.stop().await;

        self.settle(run, delivery, worker, outcome).await
    }

    /// Act on the pipeline's outcome.
    async fn settle(
        &self,
        mut run: Run,
        delivery: &Delivery,
        worker: &str,
        outcome: Result<(), PipelineError>,
    ) -> Result<Disposition, OrchestratorError> {
        let job_id = run.job.id;
        let failure = match outcome {
            Ok(()) => {
                self.queue.ack(delivery).await?;
                self.store.release_lease(&run.lease).await?;
                return Ok(Disposition::Succeeded);
            }
            Err(PipelineError::LeaseLost) => {
                warn!(job_id = %job_id, worker = %worker, "lease lost; abandoning run");
                return Ok(Disposition::Abandoned);
            }
            Err(PipelineError::Transient(message)) => {
                return self.retry_later(run, delivery, worker, message).await;
            }
            Err(PipelineError::Infeasible(message)) => JobFailure::Infeasible { message },
            Err(PipelineError::Cancelled(reason)) => JobFailure::Cancelled { reason },
            Err(PipelineError::Internal(message)) => JobFailure::Internal { message },
        };

        warn!(job_id = %job_id, kind = failure.kind(), error = %failure.message(), "job failed");
        ensure_running(&mut run.job, delivery.receive_count)?;
        run.job.fail(failure, Utc::now())?;
        self.store.save(&run.job, &run.lease).await?;
        self.queue.ack(delivery).await?;
        self.store.release_lease(&run.lease).await?;
        Ok(Disposition::Failed)
    }

    /// Record a transient failure and hand the message back with backoff, or give up
    /// when this was the last allowed delivery.
    async fn retry_later(
        &self,
        mut run: Run,
        delivery: &Delivery,
        worker: &str,
        message: String,
    ) -> Result<Disposition, OrchestratorError> {
        let job_id = run.job.id;
        ensure_running(&mut run.job, delivery.receive_count)?;
        run.job.record_transient_failure(message.clone(), Utc::now())?;

        if delivery.receive_count >= self.queue.max_receive_count() {
            self.store.save(&run.job, &run.lease).await?;
            self.store.release_lease(&run.lease).await?;
            return self.poison(delivery, worker, Some(message)).await;
        }

        let delay = self
            .config
            .retry_policy
            .delay_for_attempt(delivery.receive_count);
        warn!(
            job_id = %job_id,
            attempt = delivery.receive_count,
            ?delay,
            error = %message,
            "transient failure; will retry"
        );
        self.store.save(&run.job, &run.lease).await?;
        self.store.release_lease(&run.lease).await?;
        self.queue.release(delivery, delay).await?;
        Ok(Disposition::Retrying { delay })
    }

    /// Fail a job that exhausted its deliveries and dead-letter the message.
    async fn poison(
        &self,
        delivery: &Delivery,
        worker: &str,
        last_error: Option<String>,
    ) -> Result<Disposition, OrchestratorError> {
        let job_id = delivery.job_id;
        let reason = format!(
            "exceeded max receive count ({}) after {} deliveries",
            self.queue.max_receive_count(),
            delivery.receive_count
        );

        match self
            .store
            .claim(job_id, worker, self.config.lease_ttl)
            .await?
        {
            ClaimOutcome::Acquired { mut job, lease } => {
                let attempts = job.attempts();
                ensure_running(&mut job, attempts)?;
                let last_error = last_error.or_else(|| job.last_error().map(str::to_string));
                job.fail(
                    JobFailure::PoisonJob {
                        attempts: job.attempts(),
                        last_error,
                    },
                    Utc::now(),
                )?;
                self.store.save(&job, &lease).await?;
                self.store.release_lease(&lease).await?;
                error!(job_id = %job_id, receive_count = delivery.receive_count, "poison job");
            }
            ClaimOutcome::Terminal(_) => {
                self.queue.ack(delivery).await?;
                return Ok(Disposition::Skipped);
            }
            ClaimOutcome::Held { remaining, .. } => {
                let delay = remaining.min(self.config.lease_ttl);
                self.queue.release(delivery, delay).await?;
                return Ok(Disposition::Deferred { delay });
            }
            ClaimOutcome::NotFound => {}
        }

        self.queue.dead_letter(delivery, reason).await?;
        Ok(Disposition::DeadLettered)
    }

    fn spawn_heartbeat(&self, delivery: Delivery, lease: Lease, lost: CancellationToken) -> Heartbeat {
        let stop = CancellationToken::new();
        let period = self.heartbeat_interval();
        let ttl = self.config.lease_ttl;
        let visibility = self.queue.visibility_timeout();
        let queue = Arc::clone(&self.queue);
        let store = Arc::clone(&self.store);
        let stopped = stop.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stopped.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = queue.extend_visibility(&delivery, visibility).await {
                            warn!(job_id = %delivery.job_id, error = %e, "failed to extend visibility");
                        }
                        match store.renew_lease(&lease, ttl).await {
                            Ok(()) => debug!(job_id = %lease.job_id, "heartbeat"),
                            Err(JobStoreError::LeaseLost(_)) => {
                                warn!(job_id = %lease.job_id, "lease lost during heartbeat");
                                lost.cancel();
                                break;
                            }
                            Err(e) => warn!(job_id = %lease.job_id, error = %e, "failed to renew lease"),
                        }
                    }
                }
            }
        });

        Heartbeat {
            stop: stop.drop_guard(),
            handle,
        }
    }

    /// Cancellation and lease checks between passes.
    async fn boundary(&self, run: &Run) -> Result<(), PipelineError> {
        if run.lease_lost.is_cancelled() {
            return Err(PipelineError::LeaseLost);
        }
        if let Some(request) = self.store.cancel_requested(run.job.id).await? {
            info!(job_id = %run.job.id, "cancellation requested");
            return Err(PipelineError::Cancelled(request.reason));
        }
        Ok(())
    }

    async fn save(&self, run: &Run) -> Result<(), PipelineError> {
        self.store.save(&run.job, &run.lease).await?;
        Ok(())
    }

    async fn execute(&self, run: &mut Run, delivery: &Delivery) -> Result<(), PipelineError> {
        self.boundary(run).await?;

        let now = Utc::now();
        let start = run.job.begin_attempt(delivery.receive_count, now)?;
        let elapsed = run
            .job
            .started_at()
            .and_then(|s| (now - s).to_std().ok())
            .unwrap_or_default();
        run.deadline = Instant::now()
            .checked_add(run.job.parameters.time_budget().saturating_sub(elapsed));
        self.save(run).await?;

        info!(
            job_id = %run.job.id,
            school_id = %run.job.school_id,
            attempt = delivery.receive_count,
            resumed = matches!(start, AttemptStart::Resumed { .. }),
            "job started"
        );

        let stop_reason = match run.job.stop_reason() {
            // Every pass already ran; only publishing the result is left.
            Some(reason) => reason,
            None => {
                let reason = self.refine(run, start).await?;
                run.job.set_stop_reason(reason, Utc::now())?;
                self.save(run).await?;
                reason
            }
        };

        self.boundary(run).await?;
        self.finalize(run, stop_reason).await
    }

    /// Run passes until a stop condition holds.
    async fn refine(&self, run: &mut Run, start: AttemptStart) -> Result<StopReason, PipelineError> {
        let params = run.job.parameters.clone();
        let max = params.max_iterations;

        let (mut best, mut previous) = match start {
            AttemptStart::Resumed { completed_passes } if completed_passes > 0 => {
                let best = self.restore_best(run).await?;
                let previous = run
                    .job
                    .objective_history()
                    .last()
                    .copied()
                    .unwrap_or(best.objective);
                (best, previous)
            }
            _ => {
                let dataset = self.datasets.load(&run.job.school_id).await?;
                run.job.advance_progress(5, Utc::now())?;
                self.save(run).await?;

                let solution = self.solve(run, &dataset).await?;
                let first = self.record_pass(run, solution, dataset, None).await?;
                let objective = first.objective;
                (first, objective)
            }
        };

        if max <= 1 {
            return Ok(StopReason::SinglePass);
        }
        let enhancer = match (&self.engines.enhancer, params.optimization_type.uses_enhancer()) {
            (Some(enhancer), true) => Arc::clone(enhancer),
            _ => return Ok(StopReason::EnhancerUnavailable),
        };

        let first = run.job.iteration_count() + 1;
        for pass in first..=max {
            self.boundary(run).await?;
            if run.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                info!(job_id = %run.job.id, pass, "time budget exhausted");
                return Ok(StopReason::TimeBudgetExhausted);
            }

            let dataset = match enhancer.enhance(&best.schedule, &best.dataset).await? {
                Enhancement::NoOp => {
                    info!(job_id = %run.job.id, pass, "enhancer found no adjustment");
                    return Ok(StopReason::EnhancerNoOp);
                }
                Enhancement::Adjusted { dataset } => dataset,
            };

            let solution = self.solve(run, &dataset).await?;
            let candidate = self
                .record_pass(run, solution, dataset, Some(best.objective))
                .await?;
            let objective = candidate.objective;
            if objective > best.objective {
                best = candidate;
                debug!(job_id = %run.job.id, best_pass = best.pass, objective, "new best schedule");
            }

            let improvement = relative_improvement(previous, objective);
            previous = objective;
            debug!(job_id = %run.job.id, pass, objective, improvement, "pass recorded");

            if params.improvement_threshold > 0.0 && improvement.abs() < params.improvement_threshold {
                info!(job_id = %run.job.id, pass, improvement, "converged");
                return Ok(StopReason::Converged);
            }
        }

        Ok(StopReason::IterationLimit)
    }

    async fn solve(&self, run: &Run, dataset: &Dataset) -> Result<Solution, PipelineError> {
        let time_limit = run.job.parameters.time_limit();
        let solution = self.engines.solver.solve(dataset, time_limit).await?;
        if !solution.objective.is_finite() {
            return Err(PipelineError::Internal(format!(
                "solver returned a non-finite objective ({})",
                solution.objective
            )));
        }
        if solution.schedule.is_empty() {
            return Err(PipelineError::Internal(
                "solver returned an empty schedule".to_string(),
            ));
        }
        Ok(solution)
    }

    /// Persist a pass; the checkpoint moves to it only when it beats `best_objective`.
    async fn record_pass(
        &self,
        run: &mut Run,
        solution: Solution,
        dataset: Dataset,
        best_objective: Option<f64>,
    ) -> Result<Best, PipelineError> {
        let pass = run.job.iteration_count() + 1;

        let mut schedule_refs = Vec::with_capacity(solution.schedule.files.len());
        for (name, contents) in &solution.schedule.files {
            schedule_refs.push(self.artifacts.put(&pass_key(run, pass, name), contents).await?);
        }
        let dataset_ref = if dataset.revision > 0 {
            let json = serde_json::to_string(&dataset)
                .map_err(|e| PipelineError::Internal(format!("dataset not serializable: {e}")))?;
            Some(self.artifacts.put(&pass_key(run, pass, "dataset.json"), &json).await?)
        } else {
            None
        };

        let now = Utc::now();
        let recorded = run.job.record_pass(solution.objective, now)?;
        info!(job_id = %run.job.id, pass = recorded, objective = solution.objective, "pass complete");

        if best_objective.is_none_or(|b| solution.objective > b) {
            run.job.set_checkpoint(
                Checkpoint {
                    pass: recorded,
                    objective: solution.objective,
                    schedule: schedule_refs,
                    dataset: dataset_ref,
                },
                now,
            )?;
        }

        self.save(run).await?;
        Ok(Best {
            pass: recorded,
            objective: solution.objective,
            schedule: solution.schedule,
            dataset,
        })
    }

    /// Rebuild the best schedule and its dataset from the checkpoint.
    async fn restore_best(&self, run: &Run) -> Result<Best, PipelineError> {
        let checkpoint = run
            .job
            .checkpoint()
            .cloned()
            .ok_or_else(|| PipelineError::Internal("recorded passes without a checkpoint".into()))?;

        let mut schedule = ScheduleArtifact::new();
        for artifact in &checkpoint.schedule {
            let contents = self.artifacts.get(&artifact.location).await?;
            schedule.files.insert(artifact.name.clone(), contents);
        }
        let dataset = match &checkpoint.dataset {
            Some(artifact) => {
                let json = self.artifacts.get(&artifact.location).await?;
                serde_json::from_str(&json)
                    .map_err(|e| PipelineError::Internal(format!("corrupt dataset checkpoint: {e}")))?
            }
            None => self.datasets.load(&run.job.school_id).await?,
        };

        info!(job_id = %run.job.id, best_pass = checkpoint.pass, "resuming from checkpoint");
        Ok(Best {
            pass: checkpoint.pass,
            objective: checkpoint.objective,
            schedule,
            dataset,
        })
    }

    /// Publish the best schedule as the job's result and mark it `SUCCEEDED`.
    async fn finalize(&self, run: &mut Run, stop_reason: StopReason) -> Result<(), PipelineError> {
        let checkpoint = run
            .job
            .checkpoint()
            .cloned()
            .ok_or_else(|| PipelineError::Internal("no schedule was recorded".into()))?;

        let mut results: Vec<ArtifactRef> = Vec::with_capacity(checkpoint.schedule.len() + 1);
        for artifact in &checkpoint.schedule {
            let contents = self.artifacts.get(&artifact.location).await?;
            let key = format!("job-results/{}/{}", run.job.id, artifact.name);
            results.push(self.artifacts.put(&key, &contents).await?);
        }

        let now = Utc::now();
        let runtime_seconds = run
            .job
            .started_at()
            .map(|s| (now - s).num_milliseconds().max(0) as f64 / 1000.0)
            .unwrap_or_default();
        let summary = RunSummary {
            best_objective: checkpoint.objective,
            best_pass: checkpoint.pass,
            passes: run.job.iteration_count(),
            stop_reason,
            runtime_seconds,
        };
        let summary_json = serde_json::json!({
            "jobId": run.job.id,
            "schoolId": run.job.school_id,
            "objectiveHistory": run.job.objective_history(),
            "summary": &summary,
        });
        let key = format!("job-results/{}/summary.json", run.job.id);
        results.push(self.artifacts.put(&key, &summary_json.to_string()).await?);

        run.job.succeed(results, summary, now)?;
        self.save(run).await?;
        info!(
            job_id = %run.job.id,
            passes = run.job.iteration_count(),
            best_objective = checkpoint.objective,
            stop_reason = stop_reason.as_str(),
            "job succeeded"
        );
        Ok(())
    }
}
