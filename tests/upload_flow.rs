use async_trait::async_trait;
use reqwest::StatusCode;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use winelist_admin::model::{JobStatus, StatusReport, UploadResponse, WineListJob};
use winelist_admin::poller::{poll_until_terminal, PollObserver, PollOutcome, StatusPoller};
use winelist_admin::upload::{ProgressSink, UploadRequest};
use winelist_admin::workflow::{UploadState, UploadWorkflow};
use winelist_admin::{ApiError, ApiResult, WineListApi};

const TICK: Duration = Duration::from_millis(5);

fn report(status: &str) -> ApiResult<StatusReport> {
    Ok(StatusReport {
        status: status.into(),
        error: None,
    })
}

#[derive(Clone, Default)]
struct RecordingApi {
    upload_result: Arc<Mutex<Option<ApiResult<UploadResponse>>>>,
    statuses: Arc<Mutex<VecDeque<ApiResult<StatusReport>>>>,
    status_delay: Option<Duration>,
    panic_on_status: bool,
    request_starts: Arc<Mutex<Vec<Instant>>>,
    response_ends: Arc<Mutex<Vec<Instant>>>,
    uploads: Arc<AtomicUsize>,
    status_calls: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl RecordingApi {
    fn with_statuses(statuses: Vec<ApiResult<StatusReport>>) -> Self {
        Self {
            statuses: Arc::new(Mutex::new(VecDeque::from(statuses))),
            ..Default::default()
        }
    }

    fn with_upload(self, result: ApiResult<UploadResponse>) -> Self {
        *self.upload_result.lock().unwrap() = Some(result);
        self
    }

    fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    fn uploads(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WineListApi for RecordingApi {
    async fn upload_wine_list(
        &self,
        _request: &UploadRequest,
        progress: ProgressSink,
    ) -> ApiResult<UploadResponse> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        let result = self.upload_result.lock().unwrap().take().unwrap_or_else(|| {
            Ok(UploadResponse {
                id: Uuid::new_v4(),
                status: Some("uploaded".into()),
                upload_url: None,
            })
        });
        if result.is_ok() {
            progress(40);
            progress(100);
        }
        result
    }

    async fn wine_list_status(&self, _id: Uuid) -> ApiResult<StatusReport> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.request_starts.lock().unwrap().push(Instant::now());
        if self.panic_on_status {
            panic!("status handler crashed");
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.status_delay {
            tokio::time::sleep(delay).await;
        }
        let next = self
            .statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| report("processing"));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.response_ends.lock().unwrap().push(Instant::now());
        next
    }
}

#[derive(Default)]
struct RecordingObserver {
    seen: Mutex<Vec<JobStatus>>,
    finished: AtomicUsize,
}

impl PollObserver for RecordingObserver {
    fn on_status(&self, job: &WineListJob) {
        self.seen.lock().unwrap().push(job.status);
    }

    fn on_finish(&self, _outcome: &PollOutcome) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

fn new_job() -> WineListJob {
    WineListJob::new(Uuid::new_v4(), "list.pdf", JobStatus::Processing)
}

#[tokio::test]
async fn polling_stops_after_complete() {
    let api = Arc::new(RecordingApi::with_statuses(vec![
        report("processing"),
        report("parsing"),
        report("complete"),
    ]));
    let observer = Arc::new(RecordingObserver::default());
    let handle = StatusPoller::new(api.clone(), TICK).spawn(new_job(), observer.clone());

    let outcome = handle.wait().await;
    assert!(outcome.is_success());
    assert_eq!(api.status_calls(), 3);
    assert_eq!(
        *observer.seen.lock().unwrap(),
        vec![JobStatus::Processing, JobStatus::Parsing, JobStatus::Complete]
    );
    assert_eq!(observer.finished.load(Ordering::SeqCst), 1);

    tokio::time::sleep(TICK * 10).await;
    assert_eq!(api.status_calls(), 3);
}

#[tokio::test]
async fn polling_stops_after_backend_error() {
    let api = Arc::new(RecordingApi::with_statuses(vec![
        report("processing"),
        Ok(StatusReport {
            status: "error".into(),
            error: Some("Could not read page 2".into()),
        }),
        report("complete"),
    ]));
    let handle = StatusPoller::new(api.clone(), TICK).spawn(new_job(), Arc::new(()));

    let outcome = handle.wait().await;
    match &outcome {
        PollOutcome::Finished(job) => {
            assert_eq!(job.status, JobStatus::Error);
            assert_eq!(job.error_message.as_deref(), Some("Could not read page 2"));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    tokio::time::sleep(TICK * 10).await;
    assert_eq!(api.status_calls(), 2);
}

#[tokio::test]
async fn failed_status_check_ends_flow_without_retry() {
    let api = Arc::new(RecordingApi::with_statuses(vec![
        report("processing"),
        Err(ApiError::Status {
            status: StatusCode::BAD_GATEWAY,
            message: "upstream down".into(),
        }),
    ]));
    let outcome = StatusPoller::new(api.clone(), TICK)
        .spawn(new_job(), Arc::new(()))
        .wait()
        .await;

    match outcome {
        PollOutcome::Failed { job, redirect } => {
            assert_eq!(job.status, JobStatus::Error);
            assert_eq!(
                job.error_message.as_deref(),
                Some("Failed to check status: upstream down")
            );
            assert_eq!(redirect, None);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    tokio::time::sleep(TICK * 10).await;
    assert_eq!(api.status_calls(), 2);
}

#[tokio::test]
async fn unauthorized_status_check_redirects_to_login() {
    let api = Arc::new(RecordingApi::with_statuses(vec![Err(
        ApiError::login_required(),
    )]));
    let outcome = StatusPoller::new(api, TICK)
        .spawn(new_job(), Arc::new(()))
        .wait()
        .await;
    assert!(matches!(
        outcome,
        PollOutcome::Failed {
            redirect: Some("/login"),
            ..
        }
    ));
}

#[tokio::test]
async fn cancel_stops_further_requests() {
    let api = Arc::new(RecordingApi::default());
    let handle = StatusPoller::new(api.clone(), TICK).spawn(new_job(), Arc::new(()));

    tokio::time::sleep(TICK * 6).await;
    handle.cancel();
    let outcome = handle.wait().await;
    assert!(matches!(outcome, PollOutcome::Cancelled(_)));

    let calls = api.status_calls();
    tokio::time::sleep(TICK * 10).await;
    assert_eq!(api.status_calls(), calls);
}

#[tokio::test]
async fn dropping_the_handle_stops_polling() {
    let api = Arc::new(RecordingApi::default());
    let handle = StatusPoller::new(api.clone(), TICK).spawn(new_job(), Arc::new(()));

    tokio::time::sleep(TICK * 4).await;
    drop(handle);
    tokio::time::sleep(TICK * 2).await;

    let calls = api.status_calls();
    tokio::time::sleep(TICK * 10).await;
    assert_eq!(api.status_calls(), calls);
}

#[tokio::test]
async fn slow_responses_never_overlap() {
    let api = RecordingApi {
        status_delay: Some(TICK * 4),
        ..RecordingApi::with_statuses(vec![
            report("processing"),
            report("processing"),
            report("parsing"),
            report("complete"),
        ])
    };
    let token = CancellationToken::new();
    let outcome = poll_until_terminal(&api, new_job(), TICK, &token, &()).await;

    assert!(outcome.is_success());
    assert_eq!(api.status_calls(), 4);
    assert_eq!(api.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn slow_response_is_followed_by_a_full_interval() {
    let interval = Duration::from_millis(20);
    let api = RecordingApi {
        status_delay: Some(Duration::from_millis(30)),
        ..RecordingApi::with_statuses(vec![
            report("processing"),
            report("parsing"),
            report("complete"),
        ])
    };
    let token = CancellationToken::new();
    let outcome = poll_until_terminal(&api, new_job(), interval, &token, &()).await;
    assert!(outcome.is_success());

    let starts = api.request_starts.lock().unwrap().clone();
    let ends = api.response_ends.lock().unwrap().clone();
    assert_eq!(starts.len(), 3);
    for (end, next_start) in ends.iter().zip(starts.iter().skip(1)) {
        let gap = next_start.duration_since(*end);
        assert!(gap >= interval, "next request after only {:?}", gap);
    }
}

#[tokio::test]
async fn crashed_poll_task_still_ends_in_error_state() {
    let api = Arc::new(RecordingApi {
        panic_on_status: true,
        ..RecordingApi::default()
    });
    let workflow = UploadWorkflow::new(api.clone(), TICK);
    let mut rx = workflow.subscribe();

    let handle = workflow
        .start(&UploadRequest::new("list.pdf", Some(Uuid::new_v4())))
        .await
        .unwrap();
    let outcome = handle.wait().await;

    match &outcome {
        PollOutcome::Failed { job, redirect } => {
            assert_eq!(job.status, JobStatus::Error);
            assert_eq!(job.error_message.as_deref(), Some("Polling stopped unexpectedly"));
            assert_eq!(*redirect, None);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    let state = rx.borrow_and_update().clone();
    assert!(state.is_terminal());
    assert_eq!(
        state,
        UploadState::Error {
            message: "Polling stopped unexpectedly".into()
        }
    );
}

#[tokio::test]
async fn cancelled_before_first_tick_makes_no_requests() {
    let api = RecordingApi::default();
    let token = CancellationToken::new();
    token.cancel();
    let outcome = poll_until_terminal(&api, new_job(), TICK, &token, &()).await;
    assert!(matches!(outcome, PollOutcome::Cancelled(_)));
    assert_eq!(api.status_calls(), 0);
}

#[tokio::test]
async fn workflow_reaches_complete() {
    let api = Arc::new(RecordingApi::with_statuses(vec![
        report("uploaded"),
        report("parsing"),
        report("parsed"),
    ]));
    let workflow = UploadWorkflow::new(api.clone(), TICK);
    let rx = workflow.subscribe();

    let outcome = workflow
        .run(&UploadRequest::new("list.pdf", Some(Uuid::new_v4())))
        .await
        .unwrap();

    assert!(outcome.is_success());
    assert_eq!(outcome.job().filename, "list.pdf");
    assert_eq!(workflow.state(), UploadState::Complete);
    assert_eq!(*rx.borrow(), UploadState::Complete);
    assert_eq!(api.uploads(), 1);
    assert_eq!(api.status_calls(), 3);
}

#[tokio::test]
async fn workflow_without_restaurant_shows_guidance() {
    let api = Arc::new(RecordingApi::default());
    let workflow = UploadWorkflow::new(api.clone(), TICK);

    let err = workflow
        .start(&UploadRequest::new("list.pdf", None))
        .await
        .err()
        .expect("upload must be blocked");
    assert_eq!(err.user_message(), "Please select a restaurant first.");
    assert_eq!(
        workflow.state(),
        UploadState::Error {
            message: "Please select a restaurant first.".into()
        }
    );
    assert_eq!(api.uploads(), 0);
    assert_eq!(api.status_calls(), 0);
}

#[tokio::test]
async fn workflow_upload_failure_lands_in_error_without_polling() {
    let api = Arc::new(RecordingApi::default().with_upload(Err(ApiError::Status {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        message: "storage unavailable".into(),
    })));
    let workflow = UploadWorkflow::new(api.clone(), TICK);

    assert!(workflow
        .start(&UploadRequest::new("list.png", Some(Uuid::new_v4())))
        .await
        .is_err());
    assert_eq!(
        workflow.state(),
        UploadState::Error {
            message: "Failed to upload file: storage unavailable".into()
        }
    );
    tokio::time::sleep(TICK * 5).await;
    assert_eq!(api.status_calls(), 0);
}

#[tokio::test]
async fn workflow_cancel_publishes_cancelled() {
    let api = Arc::new(RecordingApi::default());
    let workflow = UploadWorkflow::new(api.clone(), TICK);

    let handle = workflow
        .start(&UploadRequest::new("list.jpg", Some(Uuid::new_v4())))
        .await
        .unwrap();
    tokio::time::sleep(TICK * 3).await;
    assert!(workflow.state().is_cancellable());

    handle.cancel();
    let outcome = handle.wait().await;
    assert!(matches!(outcome, PollOutcome::Cancelled(_)));
    assert_eq!(workflow.state(), UploadState::Cancelled);
}
