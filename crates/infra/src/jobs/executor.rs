//! Worker pool: N tasks pulling deliveries and handing them to the orchestrator.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::orchestrator::{Disposition, Orchestrator};

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Idle time between polls of an empty queue
    pub poll_interval: Duration,
    /// Number of concurrent workers
    pub workers: usize,
    /// Name for logging and lease ownership
    pub name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            workers: 2,
            name: "optimizer".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorStats {
    pub workers: usize,
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_retried: u64,
    pub jobs_dead_lettered: u64,
    pub deliveries_skipped: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

#[derive(Debug)]
struct Counters {
    started: Instant,
    workers: usize,
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    skipped: AtomicU64,
    running: AtomicUsize,
}

impl Counters {
    fn new(workers: usize) -> Self {
        Self {
            started: Instant::now(),
            workers,
            processed: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            running: AtomicUsize::new(0),
        }
    }

    fn record(&self, disposition: &Disposition) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let counter = match disposition {
            Disposition::Succeeded => &self.succeeded,
            Disposition::Failed => &self.failed,
            Disposition::Retrying { .. } => &self.retried,
            Disposition::DeadLettered => &self.dead_lettered,
            Disposition::Skipped | Disposition::Deferred { .. } | Disposition::Abandoned => {
                &self.skipped
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ExecutorStats {
        ExecutorStats {
            workers: self.workers,
            jobs_processed: self.processed.load(Ordering::Relaxed),
            jobs_succeeded: self.succeeded.load(Ordering::Relaxed),
            jobs_failed: self.failed.load(Ordering::Relaxed),
            jobs_retried: self.retried.load(Ordering::Relaxed),
            jobs_dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            deliveries_skipped: self.skipped.load(Ordering::Relaxed),
            current_running: self.running.load(Ordering::Relaxed),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: CancellationToken,
    joins: Vec<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl WorkerPoolHandle {
    /// Stop taking new deliveries and wait for in-flight jobs to settle.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for join in self.joins {
            let _ = join.await;
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        self.counters.snapshot()
    }

    /// Cloneable read-only view of the statistics.
    pub fn stats_reader(&self) -> StatsReader {
        StatsReader(Arc::clone(&self.counters))
    }
}

#[derive(Debug, Clone)]
pub struct StatsReader(Arc<Counters>);

impl StatsReader {
    pub fn snapshot(&self) -> ExecutorStats {
        self.0.snapshot()
    }
}

/// Spawns the worker tasks.
pub struct WorkerPool;

impl WorkerPool {
    pub fn spawn(orchestrator: Arc<Orchestrator>, config: WorkerPoolConfig) -> WorkerPoolHandle {
        let shutdown = CancellationToken::new();
        let workers = config.workers.max(1);
        let counters = Arc::new(Counters::new(workers));

        let joins = (0..workers)
            .map(|i| {
                let worker = format!("{}-{}-{i}", config.name, std::process::id());
                tokio::spawn(worker_loop(
                    Arc::clone(&orchestrator),
                    worker,
                    config.poll_interval,
                    shutdown.clone(),
                    Arc::clone(&counters),
                ))
            })
            .collect();

        info!(pool = %config.name, workers, "worker pool started");
        WorkerPoolHandle {
            shutdown,
            joins,
            counters,
        }
    }
}

async fn worker_loop(
    orchestrator: Arc<Orchestrator>,
    worker: String,
    poll_interval: Duration,
    shutdown: CancellationToken,
    counters: Arc<Counters>,
) {
    debug!(worker = %worker, "worker started");

    while !shutdown.is_cancelled() {
        let delivery = match orchestrator.queue().receive().await {
            Ok(Some(delivery)) => delivery,
            Ok(None) => {
                idle(&shutdown, poll_interval).await;
                continue;
            }
            Err(e) => {
                error!(worker = %worker, error = %e, "failed to receive");
                idle(&shutdown, poll_interval).await;
                continue;
            }
        };

        debug!(
            worker = %worker,
            job_id = %delivery.job_id,
            receive_count = delivery.receive_count,
            "received delivery"
        );
        counters.running.fetch_add(1, Ordering::Relaxed);
        let result = orchestrator.process(&delivery, &worker).await;
        counters.running.fetch_sub(1, Ordering::Relaxed);

        match result {
            Ok(disposition) => {
                debug!(worker = %worker, job_id = %delivery.job_id, ?disposition, "delivery settled");
                counters.record(&disposition);
            }
            Err(e) => {
                // The message reappears once its visibility timeout lapses.
                error!(worker = %worker, job_id = %delivery.job_id, error = %e, "failed to settle delivery");
            }
        }
    }

    debug!(worker = %worker, "worker stopped");
}

async fn idle(shutdown: &CancellationToken, poll_interval: Duration) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(poll_interval) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::InMemoryArtifactStore;
    use crate::datasets::SyntheticDatasetLoader;
    use crate::jobs::orchestrator::OrchestratorConfig;
    use crate::jobs::queue::{InMemoryWorkQueue, QueueConfig, WorkQueue};
    use crate::jobs::store::{InMemoryJobStore, JobFilter, JobRecordStore};
    use crate::jobs::submission::{NewJob, SubmissionService};
    use crate::jobs::types::RetryPolicy;
    use timetable_core::JobStatus;
    use timetable_engine::{Engines, ScriptedSolver};

    fn pool_fixture(
        solver: Arc<ScriptedSolver>,
    ) -> (Arc<InMemoryJobStore>, SubmissionService, Arc<Orchestrator>) {
        pool_fixture_with(solver, QueueConfig::default(), OrchestratorConfig::default().lease_ttl)
    }

    fn pool_fixture_with(
        solver: Arc<ScriptedSolver>,
        queue_config: QueueConfig,
        lease_ttl: Duration,
    ) -> (Arc<InMemoryJobStore>, SubmissionService, Arc<Orchestrator>) {
        let store = InMemoryJobStore::arc();
        let queue = Arc::new(InMemoryWorkQueue::new(queue_config));
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            queue.clone(),
            Arc::new(SyntheticDatasetLoader::default()),
            Arc::new(InMemoryArtifactStore::new()),
            Engines::new(solver),
            OrchestratorConfig {
                lease_ttl,
                heartbeat_interval: None,
                retry_policy: RetryPolicy::fixed(Duration::ZERO),
            },
        ));
        let submissions = SubmissionService::new(store.clone(), queue);
        (store, submissions, orchestrator)
    }

    async fn wait_for(reader: &StatsReader, done: impl Fn(&ExecutorStats) -> bool) {
        while !done(&reader.snapshot()) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pool_runs_jobs_concurrently_up_to_worker_count() {
        let solver = Arc::new(
            ScriptedSolver::objectives([])
                .then_repeat(10.0)
                .with_latency(Duration::from_secs(5)),
        );
        let (store, submissions, orchestrator) = pool_fixture(solver.clone());
        for i in 0..5 {
            submissions
                .submit(NewJob {
                    school_id: format!("school-{i}"),
                    ..Default::default()
                })
                .await
                .unwrap();
        }

        let pool = WorkerPool::spawn(
            orchestrator,
            WorkerPoolConfig::default()
                .with_workers(2)
                .with_poll_interval(Duration::from_millis(50)),
        );
        let reader = pool.stats_reader();
        wait_for(&reader, |s| s.jobs_succeeded == 5).await;
        pool.shutdown().await;

        let stats = reader.snapshot();
        assert_eq!(stats.workers, 2);
        assert_eq!(stats.jobs_processed, 5);
        assert_eq!(stats.current_running, 0);
        assert_eq!(solver.calls(), 5);
        assert_eq!(solver.peak_concurrency(), 2);

        let jobs = store.list(&JobFilter::default()).await.unwrap();
        assert!(jobs.iter().all(|j| j.status() == JobStatus::Succeeded));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_in_flight_job() {
        let solver = Arc::new(
            ScriptedSolver::objectives([7.0]).with_latency(Duration::from_secs(30)),
        );
        let (store, submissions, orchestrator) = pool_fixture(solver);
        let job_id = submissions
            .submit(NewJob {
                school_id: "s1".into(),
                ..Default::default()
            })
            .await
            .unwrap()
            .job_id;

        let pool = WorkerPool::spawn(orchestrator, WorkerPoolConfig::default().with_workers(1));
        let reader = pool.stats_reader();
        wait_for(&reader, |s| s.current_running == 1).await;
        pool.shutdown().await;

        let job = store.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status(), JobStatus::Succeeded);
        assert_eq!(reader.snapshot().jobs_succeeded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_keeps_long_solve_exclusive_across_idle_workers() {
        let solver = Arc::new(
            ScriptedSolver::objectives([42.0]).with_latency(Duration::from_secs(20)),
        );
        let (store, submissions, orchestrator) = pool_fixture_with(
            solver.clone(),
            QueueConfig {
                visibility_timeout: Duration::from_secs(3),
                max_receive_count: 3,
            },
            Duration::from_secs(3),
        );
        let job_id = submissions
            .submit(NewJob {
                school_id: "s1".into(),
                ..Default::default()
            })
            .await
            .unwrap()
            .job_id;

        let pool = WorkerPool::spawn(
            orchestrator,
            WorkerPoolConfig::default()
                .with_workers(3)
                .with_poll_interval(Duration::from_millis(50)),
        );
        let reader = pool.stats_reader();
        wait_for(&reader, |s| s.jobs_succeeded == 1).await;
        pool.shutdown().await;

        assert_eq!(solver.calls(), 1);
        assert_eq!(solver.peak_concurrency(), 1);
        let job = store.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status(), JobStatus::Succeeded);
        assert_eq!(job.attempts(), 1);
        assert_eq!(reader.snapshot().jobs_dead_lettered, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_pool_shuts_down_promptly() {
        let solver = Arc::new(ScriptedSolver::objectives([]));
        let (_store, _submissions, orchestrator) = pool_fixture(solver);
        let queue = Arc::clone(orchestrator.queue());

        let pool = WorkerPool::spawn(orchestrator, WorkerPoolConfig::default().with_workers(3));
        tokio::time::sleep(Duration::from_secs(2)).await;
        pool.shutdown().await;

        assert!(queue.receive().await.unwrap().is_none());
    }
}
