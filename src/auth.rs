//! Credentials login, the on-disk session, token refresh and role gating.
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use jsonwebtoken::{decode, DecodingKey, Validation};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use crate::api::ApiClient;
use crate::error::{ApiError, ApiResult};
use crate::model::{Me, NewUser, SessionUser};

/// Refresh this long before the access token expires.
pub const REFRESH_MARGIN_SECS: i64 = 5 * 60;

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid email regex"));

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub user: SessionUser,
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    exp: Option<i64>,
}

/// Read `exp` from a JWT without verifying it; the backend does that.
pub fn token_expiry(token: &str) -> Option<DateTime<Utc>> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.required_spec_claims.clear();
    let data = decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation).ok()?;
    Utc.timestamp_opt(data.claims.exp?, 0).single()
}

impl Session {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        token_expiry(&self.access_token)
    }

    /// True when the access token is inside the refresh margin. Tokens
    /// without a readable `exp` are used as-is.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at() {
            Some(exp) => now >= exp - ChronoDuration::seconds(REFRESH_MARGIN_SECS),
            None => false,
        }
    }
}

/// Session persisted as JSON under the data dir.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> ApiResult<Option<Session>> {
        match fs::read_to_string(&self.path).await {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(session) => Ok(Some(session)),
                Err(err) => {
                    warn!(?err, path = %self.path.display(), "discarding unreadable session file");
                    Ok(None)
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn save(&self, session: &Session) -> ApiResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let body = serde_json::to_string_pretty(session)?;

        // Tokens inside: owner read/write only.
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options.open(&self.path).await?;
        #[cfg(unix)]
        file.set_permissions(std::fs::Permissions::from_mode(0o600)).await?;
        file.write_all(body.as_bytes()).await?;
        file.flush().await?;
        debug!(path = %self.path.display(), "session saved");
        Ok(())
    }

    pub async fn clear(&self) -> ApiResult<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[instrument(skip(client, password))]
pub async fn login(client: &ApiClient, email: &str, password: &str) -> ApiResult<Session> {
    if email.trim().is_empty() || password.is_empty() {
        return Err(ApiError::validation("Email and password are required."));
    }
    let res = client.login(email.trim(), password).await.map_err(|err| match err {
        ApiError::LoginRequired { .. } => ApiError::validation("Invalid credentials"),
        other => other,
    })?;
    info!(user = %res.user.email, role = res.user.role.as_str(), "logged in");
    Ok(Session {
        access_token: res.access_token,
        refresh_token: Some(res.refresh_token),
        user: res.user,
    })
}

#[instrument(skip(client, password))]
pub async fn register(
    client: &ApiClient,
    email: &str,
    password: &str,
    name: &str,
    restaurant_id: Option<uuid::Uuid>,
) -> ApiResult<Session> {
    validate_email(email)?;
    if password.is_empty() || name.trim().is_empty() {
        return Err(ApiError::validation("Name and password are required."));
    }
    let res = client
        .register(email.trim(), password, name.trim(), restaurant_id)
        .await?;
    Ok(Session {
        access_token: res.token,
        refresh_token: None,
        user: res.user,
    })
}

/// Load the stored session and refresh it if it is about to expire.
/// A missing session or a failed refresh means the user must log in again.
pub async fn active_session(client: &ApiClient, store: &SessionStore) -> ApiResult<Session> {
    let mut session = store.load().await?.ok_or_else(ApiError::login_required)?;
    if session.needs_refresh(Utc::now()) {
        let refresh_token = match session.refresh_token.as_deref() {
            Some(token) => token.to_string(),
            None => {
                store.clear().await?;
                return Err(ApiError::login_required());
            }
        };
        match client.refresh(&refresh_token).await {
            Ok(pair) => {
                info!("access token refreshed");
                session.access_token = pair.access_token;
                session.refresh_token = Some(pair.refresh_token);
                store.save(&session).await?;
            }
            Err(err) => {
                warn!(?err, "token refresh failed");
                store.clear().await?;
                return Err(ApiError::login_required());
            }
        }
    }
    Ok(session)
}

/// Admin pages check the live role first; anyone else goes to search.
pub async fn require_admin(client: &ApiClient) -> ApiResult<Me> {
    let me = client.me().await?;
    if !me.is_admin() {
        info!(role = me.role.as_str(), "non-admin refused");
        return Err(ApiError::forbidden());
    }
    Ok(me)
}

pub fn validate_email(email: &str) -> ApiResult<()> {
    if email.trim().is_empty() {
        return Err(ApiError::validation("Email is required."));
    }
    if !EMAIL_RE.is_match(email.trim()) {
        return Err(ApiError::validation("Please enter a valid email address."));
    }
    Ok(())
}

pub fn validate_new_user(user: &NewUser) -> ApiResult<()> {
    validate_email(&user.email)?;
    if user.password.is_empty() {
        return Err(ApiError::validation("Password is required."));
    }
    Ok(())
}
