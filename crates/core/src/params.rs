//! Optimization parameters attached to a job at submission time.

use core::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Which pipeline a job runs.
///
/// - `MilpSoft`: a single solver pass (soft-constraint MILP).
/// - `Hybrid`: solver pass followed by enhancer/solver refinement rounds.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationType {
    MilpSoft,
    Hybrid,
}

impl OptimizationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizationType::MilpSoft => "milp_soft",
            OptimizationType::Hybrid => "hybrid",
        }
    }

    /// Whether this pipeline includes enhancer refinement rounds.
    pub fn uses_enhancer(&self) -> bool {
        matches!(self, OptimizationType::Hybrid)
    }
}

impl Default for OptimizationType {
    fn default() -> Self {
        Self::MilpSoft
    }
}

impl core::fmt::Display for OptimizationType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OptimizationType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "milp_soft" => Ok(Self::MilpSoft),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(DomainError::validation(format!(
                "unrecognized optimizationType '{other}' (expected one of: milp_soft, hybrid)"
            ))),
        }
    }
}

/// Validated optimization parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationParameters {
    pub optimization_type: OptimizationType,
    /// Solver time budget for a single pass.
    pub time_limit_seconds: u64,
    /// Maximum number of solver passes, Pass 0 included.
    pub max_iterations: u32,
    /// Relative improvement below which the refinement loop is considered converged.
    /// Values `<= 0` disable convergence (the loop runs to `max_iterations`).
    pub improvement_threshold: f64,
    /// Wall-clock budget for the whole run.
    pub time_budget_seconds: u64,
}

impl OptimizationParameters {
    pub const DEFAULT_TIME_LIMIT_SECONDS: u64 = 300;
    pub const DEFAULT_MAX_ITERATIONS: u32 = 3;
    pub const DEFAULT_IMPROVEMENT_THRESHOLD: f64 = 0.02;
    pub const MAX_ITERATIONS_CAP: u32 = 100;

    pub fn time_limit(&self) -> Duration {
        Duration::from_secs(self.time_limit_seconds)
    }

    pub fn time_budget(&self) -> Duration {
        Duration::from_secs(self.time_budget_seconds)
    }

    /// Build parameters from optional submission overrides, applying defaults and
    /// range checks.
    pub fn from_overrides(
        optimization_type: OptimizationType,
        overrides: &ParameterOverrides,
    ) -> DomainResult<Self> {
        let time_limit_seconds = overrides
            .time_limit_seconds
            .unwrap_or(Self::DEFAULT_TIME_LIMIT_SECONDS);
        if time_limit_seconds == 0 {
            return Err(DomainError::validation("timeLimitSeconds must be > 0"));
        }

        let max_iterations = overrides
            .max_iterations
            .unwrap_or(Self::DEFAULT_MAX_ITERATIONS);
        if max_iterations == 0 {
            return Err(DomainError::validation("maxIterations must be >= 1"));
        }
        if max_iterations > Self::MAX_ITERATIONS_CAP {
            return Err(DomainError::validation(format!(
                "maxIterations must be <= {}",
                Self::MAX_ITERATIONS_CAP
            )));
        }

        let improvement_threshold = overrides
            .improvement_threshold
            .unwrap_or(Self::DEFAULT_IMPROVEMENT_THRESHOLD);
        if !improvement_threshold.is_finite() || improvement_threshold >= 1.0 {
            return Err(DomainError::validation(
                "improvementThreshold must be a finite number below 1",
            ));
        }

        let time_budget_seconds = match overrides.time_budget_seconds {
            Some(0) => return Err(DomainError::validation("timeBudgetSeconds must be > 0")),
            Some(secs) => secs,
            None => time_limit_seconds.saturating_mul(u64::from(max_iterations)),
        };

        Ok(Self {
            optimization_type,
            time_limit_seconds,
            max_iterations,
            improvement_threshold,
            time_budget_seconds,
        })
    }
}

impl Default for OptimizationParameters {
    fn default() -> Self {
        Self {
            optimization_type: OptimizationType::default(),
            time_limit_seconds: Self::DEFAULT_TIME_LIMIT_SECONDS,
            max_iterations: Self::DEFAULT_MAX_ITERATIONS,
            improvement_threshold: Self::DEFAULT_IMPROVEMENT_THRESHOLD,
            time_budget_seconds: Self::DEFAULT_TIME_LIMIT_SECONDS
                * u64::from(Self::DEFAULT_MAX_ITERATIONS),
        }
    }
}

/// Raw, optional parameter values as supplied by a client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterOverrides {
    pub time_limit_seconds: Option<u64>,
    pub max_iterations: Option<u32>,
    pub improvement_threshold: Option<f64>,
    pub time_budget_seconds: Option<u64>,
}

/// Relative change between two consecutive objectives (higher is better).
///
/// A previous objective of zero yields `0.0`.
pub fn relative_improvement(previous: f64, current: f64) -> f64 {
    if previous == 0.0 {
        return 0.0;
    }
    (current - previous) / previous.abs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_types_case_insensitively() {
        assert_eq!("milp_soft".parse::<OptimizationType>().unwrap(), OptimizationType::MilpSoft);
        assert_eq!(" HYBRID ".parse::<OptimizationType>().unwrap(), OptimizationType::Hybrid);
        assert!(matches!(
            "greedy".parse::<OptimizationType>(),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn defaults_apply_when_overrides_are_absent() {
        let p = OptimizationParameters::from_overrides(
            OptimizationType::Hybrid,
            &ParameterOverrides::default(),
        )
        .unwrap();
        assert_eq!(p.max_iterations, 3);
        assert_eq!(p.improvement_threshold, 0.02);
        assert_eq!(p.time_limit_seconds, 300);
        assert_eq!(p.time_budget_seconds, 900);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let bad = [
            ParameterOverrides { time_limit_seconds: Some(0), ..Default::default() },
            ParameterOverrides { max_iterations: Some(0), ..Default::default() },
            ParameterOverrides { improvement_threshold: Some(1.0), ..Default::default() },
            ParameterOverrides { improvement_threshold: Some(f64::NAN), ..Default::default() },
            ParameterOverrides { time_budget_seconds: Some(0), ..Default::default() },
        ];
        for overrides in bad {
            assert!(
                OptimizationParameters::from_overrides(OptimizationType::Hybrid, &overrides).is_err(),
                "{overrides:?} should be rejected"
            );
        }
    }

    #[test]
    fn non_positive_threshold_is_accepted() {
        let p = OptimizationParameters::from_overrides(
            OptimizationType::Hybrid,
            &ParameterOverrides { improvement_threshold: Some(0.0), ..Default::default() },
        )
        .unwrap();
        assert_eq!(p.improvement_threshold, 0.0);
    }

    #[test]
    fn relative_improvement_uses_absolute_previous() {
        assert!((relative_improvement(100.0, 101.0) - 0.01).abs() < 1e-12);
        assert!((relative_improvement(-100.0, -90.0) - 0.10).abs() < 1e-12);
        assert_eq!(relative_improvement(0.0, 50.0), 0.0);
    }
}
