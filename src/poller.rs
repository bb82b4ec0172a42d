//! Fixed-interval status polling for an uploaded wine list.
//!
//! One request is in flight at a time: the wait for the next request only
//! starts after the previous response has been handled. The loop ends on
//! `complete`, `error`, the first failed status check, or cancellation.
//! Dropping the [`PollHandle`] cancels the loop.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, instrument, warn};

use crate::api::WineListApi;
use crate::error::ApiError;
use crate::model::{JobStatus, WineListJob};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The backend reported `complete` or `error`.
    Finished(WineListJob),
    /// A status check itself failed; the job is marked `error`.
    Failed {
        job: WineListJob,
        redirect: Option<&'static str>,
    },
    Cancelled(WineListJob),
}

impl PollOutcome {
    pub fn job(&self) -> &WineListJob {
        match self {
            PollOutcome::Finished(job) | PollOutcome::Cancelled(job) => job,
            PollOutcome::Failed { job, .. } => job,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, PollOutcome::Finished(job) if job.status == JobStatus::Complete)
    }
}

/// Receives job changes from the poll loop.
pub trait PollObserver: Send + Sync + 'static {
    fn on_status(&self, job: &WineListJob);

    fn on_finish(&self, _outcome: &PollOutcome) {}
}

impl PollObserver for () {
    fn on_status(&self, _job: &WineListJob) {}
}

pub struct StatusPoller<A: ?Sized> {
    api: Arc<A>,
    interval: Duration,
}

impl<A: WineListApi + ?Sized + 'static> StatusPoller<A> {
    pub fn new(api: Arc<A>, interval: Duration) -> Self {
        Self { api, interval }
    }

    /// Start polling in the background.
    pub fn spawn(&self, job: WineListJob, observer: Arc<dyn PollObserver>) -> PollHandle {
        let token = CancellationToken::new();
        let api = self.api.clone();
        let interval = self.interval;
        let task_token = token.clone();
        let snapshot = job.clone();
        let task_observer = observer.clone();
        let join = tokio::spawn(async move {
            poll_until_terminal(
                api.as_ref(),
                job,
                interval,
                &task_token,
                task_observer.as_ref(),
            )
            .await
        });
        PollHandle {
            guard: token.clone().drop_guard(),
            token,
            join,
            snapshot,
            observer,
        }
    }
}

/// Owns a running poll loop. Dropping it cancels the loop.
pub struct PollHandle {
    token: CancellationToken,
    guard: DropGuard,
    join: JoinHandle<PollOutcome>,
    snapshot: WineListJob,
    observer: Arc<dyn PollObserver>,
}

impl PollHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for the loop to end. Dropping this future cancels the loop too.
    /// If the loop task dies, the observer still gets a `Failed` outcome.
    pub async fn wait(self) -> PollOutcome {
        let PollHandle {
            guard,
            join,
            mut snapshot,
            observer,
            ..
        } = self;
        let outcome = join.await;
        guard.disarm();
        match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(?err, "poll task did not complete");
                snapshot.status = JobStatus::Error;
                snapshot.error_message = Some("Polling stopped unexpectedly".to_string());
                let outcome = PollOutcome::Failed {
                    job: snapshot,
                    redirect: None,
                };
                observer.on_status(outcome.job());
                observer.on_finish(&outcome);
                outcome
            }
        }
    }
}

/// The poll loop. Every request, the first included, goes out one full
/// interval after the previous step finished.
#[instrument(skip_all, fields(job_id = %job.id))]
pub async fn poll_until_terminal<A: WineListApi + ?Sized>(
    api: &A,
    mut job: WineListJob,
    interval: Duration,
    cancel: &CancellationToken,
    observer: &dyn PollObserver,
) -> PollOutcome {
    let outcome = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break PollOutcome::Cancelled(job),
            _ = tokio::time::sleep(interval) => {}
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break PollOutcome::Cancelled(job),
            res = api.wine_list_status(job.id) => res,
        };

        match result {
            Ok(report) => {
                debug!(status = %report.status, "status poll");
                let previous = job.status;
                job.apply(&report);
                if job.status != previous {
                    info!(from = %previous, to = %job.status, "job status changed");
                }
                observer.on_status(&job);
                if job.status.is_terminal() {
                    break PollOutcome::Finished(job);
                }
            }
            Err(err) => {
                warn!(?err, "status check failed; stopping");
                let redirect = err.redirect();
                job.status = JobStatus::Error;
                job.error_message = Some(status_failure_message(&err));
                observer.on_status(&job);
                break PollOutcome::Failed { job, redirect };
            }
        }
    };

    if let PollOutcome::Cancelled(_) = &outcome {
        info!("polling cancelled");
    }
    observer.on_finish(&outcome);
    outcome
}

fn status_failure_message(err: &ApiError) -> String {
    match err {
        ApiError::LoginRequired { .. } => err.user_message(),
        _ => format!("Failed to check status: {}", err.user_message()),
    }
}
