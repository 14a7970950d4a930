use serde::{Deserialize, Serialize};

use timetable_core::{JobStatus, ParameterOverrides, SchoolId};
use timetable_infra::jobs::{ExecutorStats, JobFilter, JobStats, NewJob, QueueStats};

use crate::app::errors;

/// Largest page a listing returns.
pub const MAX_PAGE_SIZE: usize = 200;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJobRequest {
    pub school_id: Option<String>,
    pub optimization_type: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub parameters: ParameterOverrides,
}

impl From<SubmitJobRequest> for NewJob {
    fn from(body: SubmitJobRequest) -> Self {
        NewJob {
            school_id: body.school_id.unwrap_or_default(),
            optimization_type: body.optimization_type,
            name: body.name,
            parameters: body.parameters,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelJobRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub school_id: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl ListJobsQuery {
    pub fn into_filter(self) -> Result<JobFilter, axum::response::Response> {
        let status = self
            .status
            .map(|raw| raw.parse::<JobStatus>())
            .transpose()
            .map_err(|e| errors::bad_request("invalid_status", e.to_string()))?;
        let school_id = self
            .school_id
            .map(SchoolId::parse)
            .transpose()
            .map_err(|e| errors::bad_request("invalid_school_id", e.to_string()))?;
        let defaults = JobFilter::default();
        Ok(JobFilter {
            status,
            school_id,
            limit: self.limit.unwrap_or(defaults.limit).clamp(1, MAX_PAGE_SIZE),
            offset: self.offset.unwrap_or(0),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct DeadLettersQuery {
    pub limit: Option<usize>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub jobs: JobStats,
    pub queue: QueueStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<ExecutorStats>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_request_accepts_camel_case_parameters() {
        let body: SubmitJobRequest = serde_json::from_value(serde_json::json!({
            "schoolId": "lincoln-high",
            "optimizationType": "milp_soft",
            "parameters": { "maxIterations": 2, "improvementThreshold": 0.05 }
        }))
        .unwrap();
        let job: NewJob = body.into();
        assert_eq!(job.school_id, "lincoln-high");
        assert_eq!(job.optimization_type.as_deref(), Some("milp_soft"));
        assert_eq!(job.parameters.max_iterations, Some(2));
        assert_eq!(job.parameters.time_limit_seconds, None);
    }

    #[test]
    fn list_query_caps_page_size() {
        let filter = ListJobsQuery {
            status: Some("running".into()),
            limit: Some(10_000),
            ..Default::default()
        }
        .into_filter()
        .unwrap();
        assert_eq!(filter.status, Some(JobStatus::Running));
        assert_eq!(filter.limit, MAX_PAGE_SIZE);
    }

    #[test]
    fn list_query_rejects_unknown_status() {
        let query = ListJobsQuery {
            status: Some("paused".into()),
            ..Default::default()
        };
        assert!(query.into_filter().is_err());
    }
}
