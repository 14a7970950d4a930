//! Deterministic in-process backends.
//!
//! Used by the default `BACKEND=simulated` configuration and by black-box tests. The
//! simulated objective converges geometrically towards a ceiling as the dataset
//! revision grows, so the iterative loop observes shrinking improvements.

use std::time::Duration;

use serde_json::json;

use timetable_core::artifact::names;

use crate::dataset::{Dataset, ScheduleArtifact};
use crate::enhancer::{Enhancement, Enhancer, EnhancerError};
use crate::solver::{Solution, Solver, SolverError};

#[derive(Debug, Clone)]
pub struct SimulatedSolver {
    pub base_objective: f64,
    pub ceiling: f64,
    /// Fraction of the remaining gap left after each revision, in `(0, 1)`.
    pub decay: f64,
    /// Artificial work per pass, capped by the time limit.
    pub work: Duration,
}

impl Default for SimulatedSolver {
    fn default() -> Self {
        Self {
            base_objective: 100.0,
            ceiling: 120.0,
            decay: 0.5,
            work: Duration::ZERO,
        }
    }
}

impl SimulatedSolver {
    pub fn with_work(mut self, work: Duration) -> Self {
        self.work = work;
        self
    }

    pub fn objective_for(&self, revision: u32) -> f64 {
        let gap = self.ceiling - self.base_objective;
        self.ceiling - gap * self.decay.powi(revision as i32)
    }

    fn render(&self, dataset: &Dataset) -> ScheduleArtifact {
        let mut master = String::from("section,period,room\n");
        let mut students = String::from("student,section\n");
        for (idx, name) in dataset.files.keys().enumerate() {
            let section = name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(name);
            master.push_str(&format!("{section},{},R{}\n", idx % 8 + 1, 100 + idx));
            students.push_str(&format!("S{idx:04},{section}\n"));
        }

        ScheduleArtifact::new()
            .with_file(names::MASTER_SCHEDULE, master)
            .with_file(names::STUDENT_ASSIGNMENTS, students)
            .with_file(
                names::CONSTRAINT_VIOLATIONS,
                format!("constraint,count\nsoft_preference,{}\n", 10 / (dataset.revision + 1)),
            )
    }
}

#[async_trait::async_trait]
impl Solver for SimulatedSolver {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn solve(&self, dataset: &Dataset, time_limit: Duration) -> Result<Solution, SolverError> {
        if dataset.is_empty() {
            return Err(SolverError::Infeasible(format!(
                "school {} has no input data",
                dataset.school_id
            )));
        }
        if !self.work.is_zero() {
            tokio::time::sleep(self.work.min(time_limit)).await;
        }

        let objective = self.objective_for(dataset.revision);
        Ok(Solution::new(objective, self.render(dataset)).with_metadata(json!({
            "revision": dataset.revision,
            "satisfactionRate": objective / self.ceiling,
        })))
    }
}

/// Adjusts the dataset for a fixed number of rounds, then reports `NoOp`.
#[derive(Debug, Clone)]
pub struct SimulatedEnhancer {
    pub max_rounds: u32,
}

impl Default for SimulatedEnhancer {
    fn default() -> Self {
        Self { max_rounds: 8 }
    }
}

#[async_trait::async_trait]
impl Enhancer for SimulatedEnhancer {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn enhance(
        &self,
        _schedule: &ScheduleArtifact,
        dataset: &Dataset,
    ) -> Result<Enhancement, EnhancerError> {
        if dataset.revision >= self.max_rounds {
            return Ok(Enhancement::NoOp);
        }
        let next = dataset.next_revision();
        let round = next.revision;
        Ok(Enhancement::Adjusted {
            dataset: next.with_file(
                "capacity_adjustments.csv",
                format!("round,capacity_delta\n{round},1\n"),
            ),
        })
    }
}
