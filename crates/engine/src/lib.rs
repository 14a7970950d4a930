//! `timetable-engine`
//!
//! **Responsibility:** the optimization backend boundary.
//!
//! This crate knows nothing about jobs, queues or leases:
//! - `Solver` turns a dataset into a scored schedule.
//! - `Enhancer` proposes an adjusted dataset given the current best schedule.
//! - Backends here are in-process; subprocess adapters live in `timetable-infra`.

pub mod dataset;
pub mod enhancer;
pub mod scripted;
pub mod simulated;
pub mod solver;

use std::sync::Arc;

pub use dataset::{Dataset, ScheduleArtifact};
pub use enhancer::{Enhancement, Enhancer, EnhancerError};
pub use scripted::{EnhanceStep, ScriptedEnhancer, ScriptedSolver};
pub use simulated::{SimulatedEnhancer, SimulatedSolver};
pub use solver::{Solution, Solver, SolverError};

/// The backends a worker runs jobs against.
///
/// `enhancer` is `None` when refinement is disabled; hybrid jobs then stop after the
/// initial pass.
#[derive(Clone)]
pub struct Engines {
    pub solver: Arc<dyn Solver>,
    pub enhancer: Option<Arc<dyn Enhancer>>,
}

impl Engines {
    pub fn new(solver: Arc<dyn Solver>) -> Self {
        Self {
            solver,
            enhancer: None,
        }
    }

    pub fn with_enhancer(mut self, enhancer: Arc<dyn Enhancer>) -> Self {
        self.enhancer = Some(enhancer);
        self
    }

    pub fn simulated() -> Self {
        Self::new(Arc::new(SimulatedSolver::default()))
            .with_enhancer(Arc::new(SimulatedEnhancer::default()))
    }
}

impl std::fmt::Debug for Engines {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engines")
            .field("solver", &self.solver.name())
            .field("enhancer", &self.enhancer.as_ref().map(|e| e.name()))
            .finish()
    }
}
