//! End-to-end runs of the orchestrator against in-memory backends and scripted engines.

use std::sync::Arc;
use std::time::Duration;

use timetable_core::{
    JobFailure, JobId, JobStatus, OptimizationType, ParameterOverrides, StopReason,
    artifact::names,
};
use timetable_engine::{EnhanceStep, Engines, ScriptedEnhancer, ScriptedSolver, SolverError};
use timetable_infra::jobs::{
    ClaimOutcome, Disposition, InMemoryJobStore, InMemoryWorkQueue, JobRecordStore, NewJob,
    Orchestrator, OrchestratorConfig, QueueConfig, RetryPolicy, SubmissionService, WorkQueue,
};
use timetable_infra::{
    ArtifactStore, DatasetLoader, InMemoryArtifactStore, InMemoryDatasetLoader,
    SyntheticDatasetLoader,
};

struct Harness {
    store: Arc<InMemoryJobStore>,
    queue: Arc<InMemoryWorkQueue>,
    artifacts: Arc<InMemoryArtifactStore>,
    submissions: SubmissionService,
    orchestrator: Orchestrator,
}

fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        lease_ttl: Duration::from_secs(60),
        heartbeat_interval: None,
        retry_policy: RetryPolicy::fixed(Duration::ZERO),
    }
}

fn harness_with(
    engines: Engines,
    datasets: Arc<dyn DatasetLoader>,
    config: OrchestratorConfig,
) -> Harness {
    let store = InMemoryJobStore::arc();
    let queue = Arc::new(InMemoryWorkQueue::new(QueueConfig {
        visibility_timeout: Duration::from_secs(120),
        max_receive_count: 3,
    }));
    let artifacts = Arc::new(InMemoryArtifactStore::new());
    let orchestrator = Orchestrator::new(
        store.clone(),
        queue.clone(),
        datasets,
        artifacts.clone(),
        engines,
        config,
    );
    Harness {
        submissions: SubmissionService::new(store.clone(), queue.clone()),
        store,
        queue,
        artifacts,
        orchestrator,
    }
}

fn harness(engines: Engines) -> Harness {
    harness_with(engines, Arc::new(SyntheticDatasetLoader::default()), config())
}

fn engines(solver: &Arc<ScriptedSolver>, enhancer: &Arc<ScriptedEnhancer>) -> Engines {
    Engines::new(solver.clone()).with_enhancer(enhancer.clone())
}

fn hybrid(max_iterations: u32, threshold: f64) -> ParameterOverrides {
    ParameterOverrides {
        max_iterations: Some(max_iterations),
        improvement_threshold: Some(threshold),
        ..Default::default()
    }
}

impl Harness {
    async fn submit(&self, optimization_type: OptimizationType, parameters: ParameterOverrides) -> JobId {
        self.submissions
            .submit(NewJob {
                school_id: "lincoln-high".into(),
                optimization_type: Some(optimization_type.as_str().into()),
                name: None,
                parameters,
            })
            .await
            .unwrap()
            .job_id
    }

    async fn deliver(&self) -> Disposition {
        let delivery = self
            .queue
            .receive()
            .await
            .unwrap()
            .expect("a visible message");
        self.orchestrator.process(&delivery, "worker-1").await.unwrap()
    }

    async fn job(&self, id: JobId) -> timetable_core::Job {
        self.store.get(id).await.unwrap().unwrap()
    }
}

#[tokio::test(start_paused = true)]
async fn converges_when_improvement_falls_below_threshold() {
    let solver = Arc::new(ScriptedSolver::objectives([100.0, 101.0]));
    let enhancer = Arc::new(ScriptedEnhancer::always_adjust());
    let h = harness(engines(&solver, &enhancer));
    let id = h.submit(OptimizationType::Hybrid, hybrid(3, 0.02)).await;

    assert_eq!(h.deliver().await, Disposition::Succeeded);

    let job = h.job(id).await;
    assert_eq!(job.status(), JobStatus::Succeeded);
    assert_eq!(job.iteration_count(), 2);
    assert_eq!(job.objective_history(), &[100.0, 101.0]);
    assert_eq!(job.progress(), 100);
    let summary = job.summary().unwrap();
    assert_eq!(summary.stop_reason, StopReason::Converged);
    assert_eq!(summary.best_objective, 101.0);
    assert_eq!(summary.best_pass, 2);

    assert_eq!(solver.calls(), 2);
    assert_eq!(solver.revisions(), vec![0, 1]);
    assert_eq!(enhancer.calls(), 1);
    assert!(h.queue.receive().await.unwrap().is_none());
    assert_eq!(h.queue.stats().await.unwrap().in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn infeasible_fails_without_redelivery() {
    let solver = Arc::new(ScriptedSolver::new([Err(SolverError::Infeasible(
        "course C7 has no teacher".into(),
    ))]));
    let enhancer = Arc::new(ScriptedEnhancer::always_adjust());
    let h = harness(engines(&solver, &enhancer));
    let id = h.submit(OptimizationType::Hybrid, hybrid(3, 0.02)).await;

    assert_eq!(h.deliver().await, Disposition::Failed);

    let job = h.job(id).await;
    assert_eq!(job.status(), JobStatus::Failed);
    assert!(matches!(job.failure(), Some(JobFailure::Infeasible { .. })));
    assert!(job.error_message().unwrap().contains("course C7 has no teacher"));
    assert_eq!(job.iteration_count(), 0);
    assert!(job.result_artifacts().is_empty());

    tokio::time::advance(Duration::from_secs(600)).await;
    assert!(h.queue.receive().await.unwrap().is_none());
    assert_eq!(solver.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_dead_letter_after_max_deliveries() {
    let solver = Arc::new(ScriptedSolver::new([
        Err(SolverError::Transient("solver crashed".into())),
        Err(SolverError::Timeout(Duration::from_secs(300))),
        Err(SolverError::Transient("solver crashed again".into())),
    ]));
    let enhancer = Arc::new(ScriptedEnhancer::always_adjust());
    let h = harness(engines(&solver, &enhancer));
    let id = h.submit(OptimizationType::Hybrid, hybrid(3, 0.02)).await;

    assert!(matches!(h.deliver().await, Disposition::Retrying { .. }));
    let job = h.job(id).await;
    assert_eq!(job.status(), JobStatus::Running);
    assert_eq!(job.last_error(), Some("transient solver failure: solver crashed"));

    assert!(matches!(h.deliver().await, Disposition::Retrying { .. }));
    assert_eq!(h.deliver().await, Disposition::DeadLettered);

    let job = h.job(id).await;
    assert_eq!(job.status(), JobStatus::Failed);
    let Some(JobFailure::PoisonJob { attempts, last_error }) = job.failure() else {
        panic!("expected poison job failure, got {:?}", job.failure());
    };
    assert_eq!(*attempts, 3);
    assert!(last_error.as_deref().unwrap().contains("solver crashed again"));

    tokio::time::advance(Duration::from_secs(600)).await;
    assert!(h.queue.receive().await.unwrap().is_none());
    assert_eq!(solver.calls(), 3);

    let dead = h.queue.dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].job_id, id);
    assert_eq!(dead[0].receive_count, 3);
}

#[tokio::test(start_paused = true)]
async fn enhancer_noop_stops_after_first_pass() {
    let solver = Arc::new(ScriptedSolver::objectives([100.0]));
    let enhancer = Arc::new(ScriptedEnhancer::new([EnhanceStep::NoOp]));
    let h = harness(engines(&solver, &enhancer));
    let id = h.submit(OptimizationType::Hybrid, hybrid(3, 0.02)).await;

    assert_eq!(h.deliver().await, Disposition::Succeeded);

    let job = h.job(id).await;
    assert_eq!(job.iteration_count(), 1);
    assert_eq!(job.summary().unwrap().stop_reason, StopReason::EnhancerNoOp);
    assert_eq!(solver.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn single_iteration_runs_one_pass() {
    let solver = Arc::new(ScriptedSolver::objectives([42.0]).then_repeat(50.0));
    let enhancer = Arc::new(ScriptedEnhancer::always_adjust());
    let h = harness(engines(&solver, &enhancer));
    let id = h.submit(OptimizationType::Hybrid, hybrid(1, 0.02)).await;

    assert_eq!(h.deliver().await, Disposition::Succeeded);

    let job = h.job(id).await;
    assert_eq!(job.objective_history(), &[42.0]);
    assert_eq!(job.summary().unwrap().stop_reason, StopReason::SinglePass);
    assert_eq!(enhancer.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn milp_soft_jobs_never_call_the_enhancer() {
    let solver = Arc::new(ScriptedSolver::objectives([10.0]).then_repeat(20.0));
    let enhancer = Arc::new(ScriptedEnhancer::always_adjust());
    let h = harness(engines(&solver, &enhancer));
    let id = h.submit(OptimizationType::MilpSoft, hybrid(3, 0.02)).await;

    assert_eq!(h.deliver().await, Disposition::Succeeded);

    let job = h.job(id).await;
    assert_eq!(job.iteration_count(), 1);
    assert_eq!(job.summary().unwrap().stop_reason, StopReason::EnhancerUnavailable);
    assert_eq!(enhancer.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn non_positive_threshold_runs_to_iteration_limit() {
    let solver = Arc::new(ScriptedSolver::objectives([]).then_repeat(100.0));
    let enhancer = Arc::new(ScriptedEnhancer::always_adjust());
    let h = harness(engines(&solver, &enhancer));
    let id = h.submit(OptimizationType::Hybrid, hybrid(4, 0.0)).await;

    assert_eq!(h.deliver().await, Disposition::Succeeded);

    let job = h.job(id).await;
    assert_eq!(job.iteration_count(), 4);
    assert_eq!(job.summary().unwrap().stop_reason, StopReason::IterationLimit);
    assert_eq!(solver.revisions(), vec![0, 1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn publishes_best_schedule_not_the_last_one() {
    let solver = Arc::new(ScriptedSolver::objectives([100.0, 90.0]));
    let enhancer = Arc::new(ScriptedEnhancer::always_adjust());
    let h = harness(engines(&solver, &enhancer));
    let id = h.submit(OptimizationType::Hybrid, hybrid(2, 0.0)).await;

    assert_eq!(h.deliver().await, Disposition::Succeeded);

    let job = h.job(id).await;
    assert_eq!(job.objective_history(), &[100.0, 90.0]);
    let summary = job.summary().unwrap();
    assert_eq!(summary.best_pass, 1);
    assert_eq!(summary.best_objective, 100.0);

    let master = job
        .result_artifacts()
        .iter()
        .find(|a| a.name == names::MASTER_SCHEDULE)
        .unwrap();
    assert!(master.location.contains(&format!("job-results/{id}/")));
    let contents = h.artifacts.get(&master.location).await.unwrap();
    assert_eq!(contents, "revision,objective\n0,100\n");
    assert!(job.result_artifacts().iter().any(|a| a.name == "summary.json"));
}

#[tokio::test(start_paused = true)]
async fn redelivery_resumes_from_last_recorded_pass() {
    let solver = Arc::new(ScriptedSolver::new([
        Ok(100.0),
        Err(SolverError::Transient("connection reset".into())),
        Ok(110.0),
        Ok(111.0),
    ]));
    let enhancer = Arc::new(ScriptedEnhancer::always_adjust());
    let h = harness(engines(&solver, &enhancer));
    let id = h.submit(OptimizationType::Hybrid, hybrid(5, 0.02)).await;

    assert!(matches!(h.deliver().await, Disposition::Retrying { .. }));
    let job = h.job(id).await;
    assert_eq!(job.objective_history(), &[100.0]);
    assert_eq!(job.checkpoint().unwrap().pass, 1);

    assert_eq!(h.deliver().await, Disposition::Succeeded);

    let job = h.job(id).await;
    assert_eq!(job.objective_history(), &[100.0, 110.0, 111.0]);
    assert_eq!(job.attempts(), 2);
    assert_eq!(job.summary().unwrap().stop_reason, StopReason::Converged);
    // Pass 1 is not solved again on the second delivery.
    assert_eq!(solver.revisions(), vec![0, 1, 1, 2]);
}

#[tokio::test(start_paused = true)]
async fn duplicate_delivery_of_finished_job_is_acknowledged() {
    let solver = Arc::new(ScriptedSolver::objectives([]).then_repeat(1.0));
    let enhancer = Arc::new(ScriptedEnhancer::new([]));
    let h = harness(engines(&solver, &enhancer));
    let id = h.submit(OptimizationType::MilpSoft, ParameterOverrides::default()).await;

    assert_eq!(h.deliver().await, Disposition::Succeeded);
    let before = h.job(id).await;

    h.queue.enqueue(id).await.unwrap();
    assert_eq!(h.deliver().await, Disposition::Skipped);

    assert_eq!(h.job(id).await, before);
    assert_eq!(solver.calls(), 1);
    assert!(h.queue.receive().await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn held_lease_defers_delivery() {
    let solver = Arc::new(ScriptedSolver::objectives([]).then_repeat(1.0));
    let enhancer = Arc::new(ScriptedEnhancer::new([]));
    let h = harness(engines(&solver, &enhancer));
    let id = h.submit(OptimizationType::MilpSoft, ParameterOverrides::default()).await;

    let ClaimOutcome::Acquired { .. } = h
        .store
        .claim(id, "other-worker", Duration::from_secs(30))
        .await
        .unwrap()
    else {
        panic!("expected lease");
    };

    let Disposition::Deferred { delay } = h.deliver().await else {
        panic!("expected deferral");
    };
    assert_eq!(delay, Duration::from_secs(30));
    assert_eq!(solver.calls(), 0);

    tokio::time::advance(Duration::from_secs(31)).await;
    assert_eq!(h.deliver().await, Disposition::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn cancellation_fails_job_at_next_boundary() {
    let solver = Arc::new(ScriptedSolver::objectives([]).then_repeat(1.0));
    let enhancer = Arc::new(ScriptedEnhancer::always_adjust());
    let h = harness(engines(&solver, &enhancer));
    let id = h.submit(OptimizationType::Hybrid, hybrid(3, 0.0)).await;

    h.submissions
        .cancel(id, Some("wrong term".into()))
        .await
        .unwrap();
    assert_eq!(h.deliver().await, Disposition::Failed);

    let job = h.job(id).await;
    assert_eq!(job.status(), JobStatus::Failed);
    assert_eq!(
        job.failure(),
        Some(&JobFailure::Cancelled {
            reason: Some("wrong term".into())
        })
    );
    assert_eq!(solver.calls(), 0);
    assert!(h.queue.receive().await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn cancellation_during_run_keeps_recorded_passes() {
    let solver = Arc::new(
        ScriptedSolver::objectives([])
            .then_repeat(1.0)
            .with_latency(Duration::from_secs(10)),
    );
    let enhancer = Arc::new(ScriptedEnhancer::always_adjust());
    let h = harness(engines(&solver, &enhancer));
    let id = h.submit(OptimizationType::Hybrid, hybrid(5, 0.0)).await;

    let submissions = h.submissions.clone();
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(15)).await;
        submissions.cancel(id, None).await.unwrap();
    });

    assert_eq!(h.deliver().await, Disposition::Failed);
    canceller.await.unwrap();

    let job = h.job(id).await;
    assert!(matches!(job.failure(), Some(JobFailure::Cancelled { reason: None })));
    assert_eq!(job.iteration_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn non_finite_objective_is_an_internal_failure() {
    let solver = Arc::new(ScriptedSolver::objectives([f64::NAN]));
    let enhancer = Arc::new(ScriptedEnhancer::new([]));
    let h = harness(engines(&solver, &enhancer));
    let id = h.submit(OptimizationType::MilpSoft, ParameterOverrides::default()).await;

    assert_eq!(h.deliver().await, Disposition::Failed);

    let job = h.job(id).await;
    assert!(matches!(job.failure(), Some(JobFailure::Internal { .. })));
    assert_eq!(job.iteration_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn missing_dataset_fails_without_retry() {
    let solver = Arc::new(ScriptedSolver::objectives([]).then_repeat(1.0));
    let enhancer = Arc::new(ScriptedEnhancer::new([]));
    let h = harness_with(
        engines(&solver, &enhancer),
        Arc::new(InMemoryDatasetLoader::new()),
        config(),
    );
    let id = h.submit(OptimizationType::MilpSoft, ParameterOverrides::default()).await;

    assert_eq!(h.deliver().await, Disposition::Failed);
    let job = h.job(id).await;
    assert!(job.error_message().unwrap().contains("no input data"));
    assert_eq!(solver.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn exhausted_time_budget_stops_refinement() {
    let solver = Arc::new(
        ScriptedSolver::objectives([])
            .then_repeat(100.0)
            .with_latency(Duration::from_secs(40)),
    );
    let enhancer = Arc::new(ScriptedEnhancer::always_adjust());
    let h = harness(engines(&solver, &enhancer));
    let id = h
        .submit(
            OptimizationType::Hybrid,
            ParameterOverrides {
                max_iterations: Some(10),
                improvement_threshold: Some(0.0),
                time_budget_seconds: Some(100),
                ..Default::default()
            },
        )
        .await;

    assert_eq!(h.deliver().await, Disposition::Succeeded);

    let job = h.job(id).await;
    assert_eq!(job.iteration_count(), 3);
    assert_eq!(
        job.summary().unwrap().stop_reason,
        StopReason::TimeBudgetExhausted
    );
}

#[tokio::test(start_paused = true)]
async fn unbounded_time_budget_runs_to_iteration_limit() {
    for parameters in [
        ParameterOverrides {
            max_iterations: Some(3),
            improvement_threshold: Some(0.0),
            time_budget_seconds: Some(u64::MAX),
            ..Default::default()
        },
        // Default budget is timeLimit * maxIterations, which saturates here.
        ParameterOverrides {
            max_iterations: Some(3),
            improvement_threshold: Some(0.0),
            time_limit_seconds: Some(u64::MAX / 2),
            ..Default::default()
        },
    ] {
        let solver = Arc::new(ScriptedSolver::objectives([]).then_repeat(50.0));
        let enhancer = Arc::new(ScriptedEnhancer::always_adjust());
        let h = harness(engines(&solver, &enhancer));
        let id = h.submit(OptimizationType::Hybrid, parameters).await;

        assert_eq!(h.deliver().await, Disposition::Succeeded);

        let job = h.job(id).await;
        assert_eq!(job.status(), JobStatus::Succeeded);
        assert_eq!(job.iteration_count(), 3);
        assert_eq!(
            job.summary().unwrap().stop_reason,
            StopReason::IterationLimit
        );
        assert_eq!(h.queue.stats().await.unwrap().in_flight, 0);
    }
}

#[tokio::test(start_paused = true)]
async fn lost_lease_abandons_run_without_ack() {
    let solver = Arc::new(
        ScriptedSolver::objectives([])
            .then_repeat(1.0)
            .with_latency(Duration::from_secs(5)),
    );
    let enhancer = Arc::new(ScriptedEnhancer::new([]));
    let h = harness_with(
        engines(&solver, &enhancer),
        Arc::new(SyntheticDatasetLoader::default()),
        OrchestratorConfig {
            lease_ttl: Duration::from_secs(1),
            heartbeat_interval: Some(Duration::from_secs(60)),
            retry_policy: RetryPolicy::fixed(Duration::ZERO),
        },
    );
    let id = h.submit(OptimizationType::MilpSoft, ParameterOverrides::default()).await;

    let store = h.store.clone();
    let intruder = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        store.claim(id, "intruder", Duration::from_secs(60)).await.unwrap()
    });

    assert_eq!(h.deliver().await, Disposition::Abandoned);
    assert!(matches!(intruder.await.unwrap(), ClaimOutcome::Acquired { .. }));

    let job = h.job(id).await;
    assert_eq!(job.status(), JobStatus::Running);
    assert_eq!(job.iteration_count(), 0);
    assert_eq!(h.queue.stats().await.unwrap().in_flight, 1);
}
