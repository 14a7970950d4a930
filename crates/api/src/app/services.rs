//! Service wiring: configuration in, ready-to-use stores, queue and orchestrator out.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;

use timetable_engine::Engines;
use timetable_infra::adapters::{ProcessEnhancer, ProcessSolver};
use timetable_infra::jobs::{
    ExecutorStats, InMemoryJobStore, InMemoryWorkQueue, JobRecordStore, Orchestrator,
    OrchestratorConfig, PostgresJobStore, QueueConfig, StatsReader, StatusPoller, StatusService,
    SubmissionService, WorkQueue,
};
use timetable_infra::{
    AppConfig, ArtifactStore, Backend, DatasetLoader, DirectoryArtifactStore,
    DirectoryDatasetLoader, InMemoryArtifactStore, SyntheticDatasetLoader,
};

/// Wall-clock limit for one external enhancer call.
const ENHANCER_TIMEOUT: Duration = Duration::from_secs(120);

/// Everything the HTTP handlers need.
pub struct AppServices {
    pub submissions: SubmissionService,
    pub status: StatusService,
    pub poller: StatusPoller,
    pub queue: Arc<dyn WorkQueue>,
    worker_stats: Option<StatsReader>,
    shutdown: CancellationToken,
}

impl AppServices {
    pub fn new(
        store: Arc<dyn JobRecordStore>,
        queue: Arc<dyn WorkQueue>,
        status_poll_interval: Duration,
    ) -> Self {
        let status = StatusService::new(Arc::clone(&store));
        Self {
            submissions: SubmissionService::new(store, Arc::clone(&queue)),
            poller: StatusPoller::new(status.clone(), status_poll_interval),
            status,
            queue,
            worker_stats: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_worker_stats(mut self, reader: StatsReader) -> Self {
        self.worker_stats = Some(reader);
        self
    }

    pub fn worker_stats(&self) -> Option<ExecutorStats> {
        self.worker_stats.as_ref().map(StatsReader::snapshot)
    }

    /// Cancelled on server shutdown; long-lived responses stop with it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

/// Build the services and the orchestrator the worker pool will drive.
pub async fn build_services(config: &AppConfig) -> anyhow::Result<(AppServices, Arc<Orchestrator>)> {
    let store: Arc<dyn JobRecordStore> = match &config.database_url {
        Some(url) => Arc::new(
            PostgresJobStore::connect(url)
                .await
                .context("failed to open the job store")?,
        ),
        None => InMemoryJobStore::arc(),
    };
    let queue: Arc<dyn WorkQueue> = Arc::new(InMemoryWorkQueue::new(QueueConfig {
        visibility_timeout: config.visibility_timeout,
        max_receive_count: config.max_receive_count,
    }));
    let datasets: Arc<dyn DatasetLoader> = match &config.dataset_dir {
        Some(dir) => Arc::new(DirectoryDatasetLoader::new(dir)),
        None => Arc::new(SyntheticDatasetLoader::default()),
    };
    let artifacts: Arc<dyn ArtifactStore> = match &config.artifact_dir {
        Some(dir) => Arc::new(DirectoryArtifactStore::new(dir)),
        None => Arc::new(InMemoryArtifactStore::new()),
    };

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&store),
        Arc::clone(&queue),
        datasets,
        artifacts,
        build_engines(config),
        OrchestratorConfig {
            lease_ttl: config.visibility_timeout,
            heartbeat_interval: None,
            retry_policy: config.retry_policy.clone(),
        },
    ));

    let services = AppServices::new(store, queue, config.status_poll_interval);
    if config.database_url.is_some() {
        // The queue is in-process; jobs persisted by an earlier run need new messages.
        services
            .submissions
            .requeue_unfinished()
            .await
            .context("failed to requeue unfinished jobs")?;
    }

    Ok((services, orchestrator))
}

/// Resolve the configured backend into solver/enhancer adapters.
pub fn build_engines(config: &AppConfig) -> Engines {
    let mut engines = match &config.backend {
        Backend::Simulated => Engines::simulated(),
        Backend::Process { solver, enhancer } => {
            let engines = Engines::new(Arc::new(ProcessSolver::new(solver.clone())));
            match enhancer {
                Some(command) => engines.with_enhancer(Arc::new(ProcessEnhancer::new(
                    command.clone(),
                    ENHANCER_TIMEOUT,
                ))),
                None => engines,
            }
        }
    };
    if !config.enhancer_enabled {
        engines.enhancer = None;
    }

    info!(
        solver = engines.solver.name(),
        enhancer = engines.enhancer.as_ref().map(|e| e.name()).unwrap_or("none"),
        "engines configured"
    );
    engines
}
