//! Optimization job execution: storage, queueing, orchestration and status.
//!
//! ## Components
//!
//! - `JobRecordStore`: job records plus per-job leases and cancellation flags
//! - `WorkQueue`: at-least-once delivery with visibility timeout and dead letters
//! - `Orchestrator`: runs one delivery through the refinement pipeline
//! - `WorkerPool`: concurrent workers feeding the orchestrator
//! - `SubmissionService` / `StatusService`: the write and read paths for clients
//! - `StatusPoller`: scheduled status polling until a terminal state

pub mod executor;
pub mod orchestrator;
pub mod poller;
pub mod postgres;
pub mod queue;
pub mod status;
pub mod store;
pub mod submission;
pub mod types;

pub use executor::{ExecutorStats, StatsReader, WorkerPool, WorkerPoolConfig, WorkerPoolHandle};
pub use orchestrator::{Disposition, Orchestrator, OrchestratorConfig, OrchestratorError};
pub use poller::{DEV_POLL_INTERVAL, PRODUCTION_POLL_INTERVAL, StatusPoller};
pub use postgres::PostgresJobStore;
pub use queue::{InMemoryWorkQueue, QueueConfig, QueueError, QueueStats, WorkQueue};
pub use status::{JobResultsView, JobStatusView, StatusError, StatusService, render_message};
pub use store::{InMemoryJobStore, JobFilter, JobRecordStore, JobStats, JobStoreError};
pub use submission::{NewJob, SubmissionService, SubmitError, SubmittedJob};
pub use types::{
    BackoffStrategy, CancelRequest, ClaimOutcome, DeadLetterEntry, Delivery, Lease, Receipt,
    RetryPolicy,
};
