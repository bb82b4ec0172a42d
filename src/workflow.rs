//! Upload → poll workflow with its state published on a watch channel.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::api::WineListApi;
use crate::error::ApiResult;
use crate::model::{JobStatus, WineListJob};
use crate::poller::{PollHandle, PollObserver, PollOutcome, StatusPoller};
use crate::upload::{ProgressSink, UploadRequest};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadState {
    Idle,
    Uploading { percent: u8 },
    Processing,
    Parsing,
    Complete,
    Error { message: String },
    Cancelled,
}

impl UploadState {
    pub fn from_job(job: &WineListJob) -> Self {
        match job.status {
            JobStatus::Uploading => UploadState::Uploading { percent: 100 },
            JobStatus::Processing => UploadState::Processing,
            JobStatus::Parsing => UploadState::Parsing,
            JobStatus::Complete => UploadState::Complete,
            JobStatus::Error => UploadState::Error {
                message: job
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "Failed to process wine list".to_string()),
            },
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadState::Complete | UploadState::Error { .. } | UploadState::Cancelled
        )
    }

    /// Whether a cancel action makes sense in this state.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, UploadState::Processing | UploadState::Parsing)
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadState::Idle => f.write_str(""),
            UploadState::Uploading { percent } => write!(f, "Uploading... {}%", percent),
            UploadState::Processing => f.write_str("Processing..."),
            UploadState::Parsing => f.write_str("Parsing..."),
            UploadState::Complete => f.write_str("Complete!"),
            UploadState::Error { .. } => f.write_str("Error"),
            UploadState::Cancelled => f.write_str("Cancelled"),
        }
    }
}

struct StatePublisher {
    tx: Arc<watch::Sender<UploadState>>,
}

impl PollObserver for StatePublisher {
    fn on_status(&self, job: &WineListJob) {
        self.tx.send_replace(UploadState::from_job(job));
    }

    fn on_finish(&self, outcome: &PollOutcome) {
        if let PollOutcome::Cancelled(_) = outcome {
            self.tx.send_replace(UploadState::Cancelled);
        }
    }
}

pub struct UploadWorkflow<A: ?Sized> {
    api: Arc<A>,
    poll_interval: Duration,
    state: Arc<watch::Sender<UploadState>>,
}

impl<A: WineListApi + ?Sized + 'static> UploadWorkflow<A> {
    pub fn new(api: Arc<A>, poll_interval: Duration) -> Self {
        let (tx, _rx) = watch::channel(UploadState::Idle);
        Self {
            api,
            poll_interval,
            state: Arc::new(tx),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<UploadState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> UploadState {
        self.state.borrow().clone()
    }

    /// Upload the file and start polling. Errors before the job exists
    /// (selection, I/O, HTTP) leave the state at `Error` and are returned.
    #[instrument(skip_all, fields(file = %request.path.display()))]
    pub async fn start(&self, request: &UploadRequest) -> ApiResult<PollHandle> {
        if let Err(err) = request.validate() {
            self.fail(err.user_message());
            return Err(err);
        }

        self.state.send_replace(UploadState::Uploading { percent: 0 });
        let tx = self.state.clone();
        let progress: ProgressSink = Arc::new(move |percent| {
            tx.send_if_modified(|state| match state {
                UploadState::Uploading { percent: current } if *current < percent => {
                    *current = percent;
                    true
                }
                _ => false,
            });
        });

        let response = match self.api.upload_wine_list(request, progress).await {
            Ok(response) => response,
            Err(err) => {
                warn!(?err, "upload failed");
                self.fail(format!("Failed to upload file: {}", err.user_message()));
                return Err(err);
            }
        };

        let job = WineListJob::new(response.id, request.filename(), JobStatus::Processing);
        info!(job_id = %job.id, "upload accepted; polling for status");
        self.state.send_replace(UploadState::Processing);

        let observer = Arc::new(StatePublisher {
            tx: self.state.clone(),
        });
        let poller = StatusPoller::new(self.api.clone(), self.poll_interval);
        Ok(poller.spawn(job, observer))
    }

    /// Upload, then wait for the job to reach a terminal state.
    pub async fn run(&self, request: &UploadRequest) -> ApiResult<PollOutcome> {
        let handle = self.start(request).await?;
        Ok(handle.wait().await)
    }

    fn fail(&self, message: String) {
        self.state.send_replace(UploadState::Error { message });
    }
}
