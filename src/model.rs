use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use tracing::warn;
use uuid::Uuid;

/// Lifecycle of an uploaded wine list as seen by the admin client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Uploading,
    Processing,
    Parsing,
    Complete,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Uploading => "uploading",
            JobStatus::Processing => "processing",
            JobStatus::Parsing => "parsing",
            JobStatus::Complete => "complete",
            JobStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Error)
    }

    /// Fold a backend status string into a job status.
    ///
    /// The backend reports file lifecycle values (`uploaded`, `parsed`,
    /// `finalized`, ...) next to the job values; unknown values keep the
    /// job in `processing` so polling carries on.
    pub fn from_wire(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "uploading" => JobStatus::Uploading,
            "uploaded" | "processing" => JobStatus::Processing,
            "parsing" => JobStatus::Parsing,
            "parsed" | "refined" | "finalized" | "complete" | "completed" => JobStatus::Complete,
            "error" | "failed" => JobStatus::Error,
            other => {
                warn!(status = other, "unknown job status from backend");
                JobStatus::Processing
            }
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A wine list submitted for processing. Only poll results change it after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WineListJob {
    pub id: Uuid,
    pub filename: String,
    pub status: JobStatus,
    pub uploaded_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

impl WineListJob {
    pub fn new(id: Uuid, filename: impl Into<String>, status: JobStatus) -> Self {
        Self {
            id,
            filename: filename.into(),
            status,
            uploaded_at: Utc::now(),
            error_message: None,
        }
    }

    /// Apply a status poll. Terminal jobs are frozen.
    pub fn apply(&mut self, report: &StatusReport) {
        if self.status.is_terminal() {
            return;
        }
        self.status = report.job_status();
        if self.status == JobStatus::Error {
            self.error_message = Some(
                report
                    .error
                    .clone()
                    .unwrap_or_else(|| "Failed to process wine list".to_string()),
            );
        }
    }
}

/// Body of `POST wine-lists/upload`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct UploadResponse {
    #[serde(alias = "file_id")]
    pub id: Uuid,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub upload_url: Option<String>,
}

/// Body of `GET wine-lists/{id}/status`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct StatusReport {
    pub status: String,
    #[serde(default)]
    pub error: Option<String>,
}

impl StatusReport {
    pub fn job_status(&self) -> JobStatus {
        JobStatus::from_wire(&self.status)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WineListFile {
    pub id: Uuid,
    pub restaurant_id: Uuid,
    pub filename: String,
    #[serde(default)]
    pub file_url: Option<String>,
    #[serde(default)]
    pub uploaded_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub parsed_date: Option<NaiveDateTime>,
    pub status: String,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Restaurant {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub contact_email: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub date_created: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestaurantForm {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    RestaurantAdmin,
    Staff,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Admin => "admin",
            UserRole::RestaurantAdmin => "restaurant_admin",
            UserRole::Staff => "staff",
        }
    }
}

impl std::str::FromStr for UserRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(UserRole::Admin),
            "restaurant_admin" => Ok(UserRole::RestaurantAdmin),
            "staff" => Ok(UserRole::Staff),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    pub role: UserRole,
    #[serde(default)]
    pub restaurant_id: Option<Uuid>,
    #[serde(default)]
    pub date_joined: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewUser {
    pub email: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub role: UserRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restaurant_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<UserRole>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restaurant_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ruleset {
    pub id: Uuid,
    pub restaurant_id: Uuid,
    pub rules_json: Map<String, Value>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub date_created: Option<NaiveDateTime>,
    #[serde(default)]
    pub last_updated: Option<NaiveDateTime>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WineEntryStatus {
    Auto,
    UserEdited,
    Confirmed,
    Rejected,
}

impl WineEntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WineEntryStatus::Auto => "auto",
            WineEntryStatus::UserEdited => "user_edited",
            WineEntryStatus::Confirmed => "confirmed",
            WineEntryStatus::Rejected => "rejected",
        }
    }
}

impl std::str::FromStr for WineEntryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(WineEntryStatus::Auto),
            "user_edited" => Ok(WineEntryStatus::UserEdited),
            "confirmed" => Ok(WineEntryStatus::Confirmed),
            "rejected" => Ok(WineEntryStatus::Rejected),
            other => Err(format!("unknown entry status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WineEntry {
    pub id: Uuid,
    pub wine_list_file_id: Uuid,
    pub restaurant_id: Uuid,
    #[serde(default)]
    pub producer: Option<String>,
    #[serde(default)]
    pub cuvee: Option<String>,
    #[serde(default, rename = "type")]
    pub wine_type: Option<String>,
    #[serde(default)]
    pub vintage: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub bottle_size: Option<String>,
    #[serde(default)]
    pub grape_variety: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub subregion: Option<String>,
    #[serde(default)]
    pub row_confidence: Option<f64>,
    #[serde(default)]
    pub field_confidence: Option<Value>,
    #[serde(default)]
    pub section_header: Option<String>,
    #[serde(default)]
    pub subheader: Option<String>,
    #[serde(default)]
    pub raw_text: Option<String>,
    pub status: WineEntryStatus,
    #[serde(default)]
    pub last_modified: Option<NaiveDateTime>,
}

/// Partial update for a wine entry; unset fields are left alone server-side.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WineEntryUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub producer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cuvee: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub wine_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vintage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bottle_size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grape_variety: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subregion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<WineEntryStatus>,
}

impl WineEntryUpdate {
    pub fn is_empty(&self) -> bool {
        *self == WineEntryUpdate::default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BulkEntryUpdate {
    pub id: Uuid,
    #[serde(flatten)]
    pub fields: WineEntryUpdate,
}

/// Body of `GET me`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Me {
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub email: Option<String>,
    pub role: UserRole,
}

impl Me {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }
}

/// Profile returned alongside tokens by `auth/login` and `auth/register`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionUser {
    pub id: Uuid,
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    pub role: UserRole,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LoginResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub user: SessionUser,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RegisterResponse {
    pub token: String,
    pub user: SessionUser,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Detail {
    pub detail: String,
}
