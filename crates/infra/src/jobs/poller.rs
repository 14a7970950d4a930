//! Scheduled status polling with an explicit stop condition.
//!
//! A poller re-reads a job's status view on a fixed interval and publishes it whenever
//! it changes. It stops after publishing a terminal view, when the job disappears,
//! when its cancellation token fires, or when the receiver is dropped.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use timetable_core::JobId;

use super::status::{JobStatusView, StatusError, StatusService};

/// Poll interval for production clients.
pub const PRODUCTION_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Poll interval for local development.
pub const DEV_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct StatusPoller {
    status: StatusService,
    interval: Duration,
}

impl StatusPoller {
    pub fn new(status: StatusService, interval: Duration) -> Self {
        Self { status, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start polling `job_id`. Views arrive on the returned receiver.
    pub fn spawn(
        &self,
        job_id: JobId,
        cancel: CancellationToken,
    ) -> (mpsc::Receiver<JobStatusView>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(8);
        let status = self.status.clone();
        let period = self.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            let mut last: Option<JobStatusView> = None;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(job_id = %job_id, "status poller cancelled");
                        break;
                    }
                    _ = tx.closed() => break,
                    _ = ticker.tick() => {
                        let view = match status.get_status(job_id).await {
                            Ok(view) => view,
                            Err(StatusError::NotFound(_)) => break,
                            Err(e) => {
                                warn!(job_id = %job_id, error = %e, "status poll failed");
                                continue;
                            }
                        };
                        if last.as_ref() == Some(&view) {
                            continue;
                        }
                        let terminal = view.is_terminal();
                        if tx.send(view.clone()).await.is_err() {
                            break;
                        }
                        if terminal {
                            debug!(job_id = %job_id, "status poller reached terminal state");
                            break;
                        }
                        last = Some(view);
                    }
                }
            }
        });

        (rx, handle)
    }
}
