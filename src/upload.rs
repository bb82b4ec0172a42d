//! Wine-list upload: selection checks, multipart body, byte-level progress.
use chrono::NaiveDate;
use futures::TryStreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Method};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio_util::io::ReaderStream;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::api::ApiClient;
use crate::error::{ApiError, ApiResult, SELECT_RESTAURANT_FIRST};
use crate::model::UploadResponse;

const CHUNK_SIZE: usize = 64 * 1024;

/// Receives upload percentages (0..=100), never decreasing.
pub type ProgressSink = Arc<dyn Fn(u8) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub path: PathBuf,
    pub restaurant_id: Option<Uuid>,
    pub parsed_date: Option<NaiveDate>,
}

/// An upload that passed the selection checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidUpload<'a> {
    pub path: &'a Path,
    pub restaurant_id: Uuid,
    pub filename: String,
    pub content_type: &'static str,
}

impl UploadRequest {
    pub fn new(path: impl Into<PathBuf>, restaurant_id: Option<Uuid>) -> Self {
        Self {
            path: path.into(),
            restaurant_id,
            parsed_date: None,
        }
    }

    pub fn with_parsed_date(mut self, date: NaiveDate) -> Self {
        self.parsed_date = Some(date);
        self
    }

    pub fn filename(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Restaurant first, then file type; nothing touches disk or network here.
    pub fn validate(&self) -> ApiResult<ValidUpload<'_>> {
        let restaurant_id = self
            .restaurant_id
            .ok_or_else(|| ApiError::validation(SELECT_RESTAURANT_FIRST))?;
        let content_type = content_type(&self.path).ok_or_else(|| {
            ApiError::validation("Unsupported file type. Supported formats: PDF, JPG, JPEG, PNG")
        })?;
        let filename = self.filename();
        if filename.is_empty() {
            return Err(ApiError::validation("Please choose a file to upload."));
        }
        Ok(ValidUpload {
            path: &self.path,
            restaurant_id,
            filename,
            content_type,
        })
    }
}

/// MIME type for the accepted wine-list formats.
pub fn content_type(path: &Path) -> Option<&'static str> {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|s| s.to_ascii_lowercase())
    {
        Some(ext) if ext == "pdf" => Some("application/pdf"),
        Some(ext) if ext == "jpg" || ext == "jpeg" => Some("image/jpeg"),
        Some(ext) if ext == "png" => Some("image/png"),
        _ => None,
    }
}

/// Rounded percentage of `sent` over `total`; an empty body counts as done.
pub fn percent(sent: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let sent = sent.min(total) as u128;
    let total = total as u128;
    ((sent * 100 + total / 2) / total) as u8
}

/// Counts bytes handed to the HTTP stack and forwards percentage changes.
pub struct ProgressTracker {
    total: u64,
    sent: AtomicU64,
    last: AtomicU8,
    sink: ProgressSink,
}

impl ProgressTracker {
    pub fn new(total: u64, sink: ProgressSink) -> Self {
        Self {
            total,
            sent: AtomicU64::new(0),
            last: AtomicU8::new(0),
            sink,
        }
    }

    pub fn advance(&self, bytes: usize) {
        let sent = self.sent.fetch_add(bytes as u64, Ordering::SeqCst) + bytes as u64;
        self.emit(percent(sent, self.total));
    }

    /// Called once the server accepted the body, so 100 is always reported.
    pub fn finish(&self) {
        self.emit(100);
    }

    fn emit(&self, pct: u8) {
        let prev = self.last.fetch_max(pct, Ordering::SeqCst);
        if pct > prev {
            (self.sink)(pct);
        }
    }
}

/// Multipart form whose file part is read from disk in chunks as it is sent.
pub fn build_form(
    upload: &ValidUpload<'_>,
    parsed_date: Option<NaiveDate>,
    file: File,
    len: u64,
    tracker: Arc<ProgressTracker>,
) -> ApiResult<Form> {
    let chunks = ReaderStream::with_capacity(file, CHUNK_SIZE)
        .inspect_ok(move |chunk| tracker.advance(chunk.len()));
    let body = Body::wrap_stream(chunks);

    let part = Part::stream_with_length(body, len)
        .file_name(upload.filename.clone())
        .mime_str(upload.content_type)?;

    let mut form = Form::new()
        .part("file", part)
        .text("restaurant_id", upload.restaurant_id.to_string());
    if let Some(date) = parsed_date {
        form = form.text("parsed_date", date.format("%Y-%m-%d").to_string());
    }
    Ok(form)
}

/// Single multipart POST to `wine-lists/upload`. Never retried.
#[instrument(skip_all, fields(file = %request.path.display()))]
pub async fn submit(
    client: &ApiClient,
    request: &UploadRequest,
    progress: ProgressSink,
) -> ApiResult<UploadResponse> {
    let upload = request.validate()?;
    let builder = client.request(Method::POST, "wine-lists/upload")?;

    let size = fs::metadata(upload.path).await?.len();
    let file = File::open(upload.path).await?;
    let tracker = Arc::new(ProgressTracker::new(size, progress));
    let form = build_form(&upload, request.parsed_date, file, size, tracker.clone())?;

    info!(
        filename = %upload.filename,
        restaurant_id = %upload.restaurant_id,
        bytes = size,
        "uploading wine list"
    );
    let response: UploadResponse = client.send(builder.multipart(form)).await?;
    tracker.finish();
    info!(id = %response.id, status = ?response.status, "wine list accepted");
    Ok(response)
}
