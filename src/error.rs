use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

pub const LOGIN_PATH: &str = "/login";
pub const SEARCH_PATH: &str = "/search";

/// Message shown when an upload is attempted without a restaurant.
pub const SELECT_RESTAURANT_FIRST: &str = "Please select a restaurant first.";

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    /// 401 from the backend, or no stored token at all.
    #[error("authentication required (redirect: {redirect})")]
    LoginRequired { redirect: &'static str },
    /// Authenticated, but the role is not allowed on admin pages.
    #[error("admin role required (redirect: {redirect})")]
    Forbidden { redirect: &'static str },
    #[error("server returned {status}: {message}")]
    Status { status: StatusCode, message: String },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Validation(String),
}

impl ApiError {
    pub fn login_required() -> Self {
        ApiError::LoginRequired {
            redirect: LOGIN_PATH,
        }
    }

    pub fn forbidden() -> Self {
        ApiError::Forbidden {
            redirect: SEARCH_PATH,
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        ApiError::Validation(msg.into())
    }

    /// Where a caller should send the user after this error, if anywhere.
    pub fn redirect(&self) -> Option<&'static str> {
        match self {
            ApiError::LoginRequired { redirect } | ApiError::Forbidden { redirect } => {
                Some(redirect)
            }
            _ => None,
        }
    }

    /// Short human-readable text for inline display.
    pub fn user_message(&self) -> String {
        match self {
            ApiError::LoginRequired { .. } => "Session expired, please log in again".to_string(),
            ApiError::Forbidden { .. } => "You do not have access to this page".to_string(),
            ApiError::Status { message, .. } => message.clone(),
            ApiError::Transport(err) if err.is_timeout() => "Request timed out".to_string(),
            ApiError::Transport(_) => "Could not reach the server".to_string(),
            ApiError::Decode(_) => "Unexpected response from the server".to_string(),
            ApiError::Io(err) => err.to_string(),
            ApiError::Validation(msg) => msg.clone(),
        }
    }

    /// Build a status error from a non-success response body.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        if status == StatusCode::UNAUTHORIZED {
            return ApiError::login_required();
        }
        ApiError::Status {
            status,
            message: error_message(status, body),
        }
    }
}

#[derive(Deserialize)]
struct DetailBody {
    detail: serde_json::Value,
}

/// Extract FastAPI's `{"detail": ...}` text, else fall back to the raw body.
fn error_message(status: StatusCode, body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<DetailBody>(body) {
        return match parsed.detail {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        trimmed.to_string()
    }
}
