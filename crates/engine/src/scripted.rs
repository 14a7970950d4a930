//! Backends that replay a fixed script of outcomes.
//!
//! These exist for tests of the orchestration loop: each call pops the next scripted
//! outcome and records what it was called with.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use timetable_core::artifact::names;

use crate::dataset::{Dataset, ScheduleArtifact};
use crate::enhancer::{Enhancement, Enhancer, EnhancerError};
use crate::solver::{Solution, Solver, SolverError};

/// Tracks how many calls are executing at once.
#[derive(Debug, Default)]
struct Concurrency {
    current: AtomicU32,
    peak: AtomicU32,
}

impl Concurrency {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
pub struct ScriptedSolver {
    script: Mutex<VecDeque<Result<f64, SolverError>>>,
    fallback: Option<f64>,
    latency: Duration,
    revisions: Mutex<Vec<u32>>,
    concurrency: Concurrency,
}

impl ScriptedSolver {
    pub fn new(script: impl IntoIterator<Item = Result<f64, SolverError>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Objectives returned in order.
    pub fn objectives(objectives: impl IntoIterator<Item = f64>) -> Self {
        Self::new(objectives.into_iter().map(Ok))
    }

    /// Objective returned once the script runs out.
    pub fn then_repeat(mut self, objective: f64) -> Self {
        self.fallback = Some(objective);
        self
    }

    /// Simulated time spent inside each call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> usize {
        self.revisions.lock().map(|r| r.len()).unwrap_or_default()
    }

    /// Dataset revisions passed to each call, in order.
    pub fn revisions(&self) -> Vec<u32> {
        self.revisions.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Highest number of overlapping calls observed.
    pub fn peak_concurrency(&self) -> u32 {
        self.concurrency.peak.load(Ordering::SeqCst)
    }

    fn next_outcome(&self) -> Result<f64, SolverError> {
        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match (scripted, self.fallback) {
            (Some(outcome), _) => outcome,
            (None, Some(objective)) => Ok(objective),
            (None, None) => Err(SolverError::Transient("script exhausted".to_string())),
        }
    }
}

#[async_trait::async_trait]
impl Solver for ScriptedSolver {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn solve(&self, dataset: &Dataset, _time_limit: Duration) -> Result<Solution, SolverError> {
        self.concurrency.enter();
        if let Ok(mut revisions) = self.revisions.lock() {
            revisions.push(dataset.revision);
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let outcome = self.next_outcome();
        self.concurrency.exit();

        let objective = outcome?;
        let schedule = ScheduleArtifact::new()
            .with_file(
                names::MASTER_SCHEDULE,
                format!("revision,objective\n{},{objective}\n", dataset.revision),
            )
            .with_file(names::STUDENT_ASSIGNMENTS, "student,section\n");
        Ok(Solution::new(objective, schedule))
    }
}

/// Scripted enhancer step.
#[derive(Debug, Clone, PartialEq)]
pub enum EnhanceStep {
    Adjust,
    NoOp,
    Fail(String),
}

#[derive(Debug)]
pub struct ScriptedEnhancer {
    script: Mutex<VecDeque<EnhanceStep>>,
    fallback: EnhanceStep,
    calls: AtomicU32,
}

impl ScriptedEnhancer {
    pub fn new(script: impl IntoIterator<Item = EnhanceStep>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback: EnhanceStep::NoOp,
            calls: AtomicU32::new(0),
        }
    }

    /// Adjusts on every call.
    pub fn always_adjust() -> Self {
        Self::new([]).then(EnhanceStep::Adjust)
    }

    pub fn then(mut self, step: EnhanceStep) -> Self {
        self.fallback = step;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Enhancer for ScriptedEnhancer {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn enhance(
        &self,
        _schedule: &ScheduleArtifact,
        dataset: &Dataset,
    ) -> Result<Enhancement, EnhancerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .script
            .lock()
            .ok()
            .and_then(|mut s| s.pop_front())
            .unwrap_or_else(|| self.fallback.clone());

        match step {
            EnhanceStep::Adjust => Ok(Enhancement::Adjusted {
                dataset: dataset.next_revision(),
            }),
            EnhanceStep::NoOp => Ok(Enhancement::NoOp),
            EnhanceStep::Fail(message) => Err(EnhancerError::Transient(message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use timetable_core::SchoolId;

    fn dataset() -> Dataset {
        Dataset::new(SchoolId::parse("s1").unwrap()).with_file("a.csv", "x")
    }

    #[tokio::test]
    async fn replays_script_then_fallback() {
        let solver = ScriptedSolver::new([Ok(1.0), Err(SolverError::Infeasible("no".into()))])
            .then_repeat(5.0);

        assert_eq!(solver.solve(&dataset(), Duration::ZERO).await.unwrap().objective, 1.0);
        assert!(matches!(
            solver.solve(&dataset(), Duration::ZERO).await,
            Err(SolverError::Infeasible(_))
        ));
        assert_eq!(solver.solve(&dataset(), Duration::ZERO).await.unwrap().objective, 5.0);
        assert_eq!(solver.calls(), 3);
        assert_eq!(solver.peak_concurrency(), 1);
    }

    #[tokio::test]
    async fn exhausted_script_is_transient() {
        let solver = ScriptedSolver::objectives([]);
        let err = solver.solve(&dataset(), Duration::ZERO).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn enhancer_steps_in_order() {
        let enhancer = ScriptedEnhancer::new([EnhanceStep::Adjust, EnhanceStep::Fail("down".into())]);
        let schedule = ScheduleArtifact::new();

        assert!(matches!(
            enhancer.enhance(&schedule, &dataset()).await,
            Ok(Enhancement::Adjusted { .. })
        ));
        assert!(enhancer.enhance(&schedule, &dataset()).await.is_err());
        assert_eq!(enhancer.enhance(&schedule, &dataset()).await, Ok(Enhancement::NoOp));
        assert_eq!(enhancer.calls(), 3);
    }
}
