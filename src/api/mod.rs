//! Typed client for the wine-list backend REST API.
//!
//! Authenticated calls are built by `ApiClient::request`, which attaches
//! the bearer token, and executed by `ApiClient::send`, which logs the
//! exchange (never the token) and maps a 401 from any endpoint to
//! [`ApiError::LoginRequired`].

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::model::{
    BulkEntryUpdate, Detail, LoginResponse, Me, NewUser, RegisterResponse, Restaurant,
    RestaurantForm, Ruleset, StatusReport, TokenPair, UploadResponse, User, UserUpdate,
    WineEntry, WineEntryUpdate, WineListFile,
};
use crate::upload::{ProgressSink, UploadRequest};

#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: Url,
    token: Option<String>,
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .field("authenticated", &self.token.is_some())
            .finish_non_exhaustive()
    }
}

/// The two calls the upload workflow depends on.
#[async_trait]
pub trait WineListApi: Send + Sync {
    async fn upload_wine_list(
        &self,
        request: &UploadRequest,
        progress: ProgressSink,
    ) -> ApiResult<UploadResponse>;

    async fn wine_list_status(&self, id: Uuid) -> ApiResult<StatusReport>;
}

impl ApiClient {
    pub fn new(base_url: Url, timeout: Duration) -> ApiResult<Self> {
        let http = Client::builder()
            .user_agent(concat!("winelist-admin/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .no_proxy()
            .build()?;
        Ok(Self {
            http,
            base_url,
            token: None,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> ApiResult<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|err| ApiError::validation(format!("invalid API path '{}': {}", path, err)))
    }

    /// Attach `Authorization: Bearer`. No token means the user must log in.
    fn authorized(&self, builder: RequestBuilder) -> ApiResult<RequestBuilder> {
        match self.token.as_deref() {
            Some(token) if !token.is_empty() => Ok(builder.bearer_auth(token)),
            _ => {
                warn!("no authentication token found");
                Err(ApiError::login_required())
            }
        }
    }

    /// Authenticated request against `path` under the base URL.
    pub(crate) fn request(&self, method: Method, path: &str) -> ApiResult<RequestBuilder> {
        self.authorized(self.http.request(method, self.endpoint(path)?))
    }

    /// Execute a request and decode the JSON response body.
    pub(crate) async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> ApiResult<T> {
        let request = builder.build()?;
        let method = request.method().clone();
        let url = request.url().clone();
        debug!(%method, %url, "sending api request");

        let res = self.http.execute(request).await.map_err(|err| {
            warn!(%method, %url, ?err, "api request failed");
            ApiError::Transport(err)
        })?;

        let status = res.status();
        let body = res.text().await?;
        debug!(%method, %url, %status, bytes = body.len(), "api response");

        if status == StatusCode::UNAUTHORIZED {
            info!(%url, "backend rejected credentials; login required");
            return Err(ApiError::login_required());
        }
        if !status.is_success() {
            warn!(%method, %url, %status, body = %body, "api error response");
            return Err(ApiError::from_status(status, &body));
        }

        let text = if body.trim().is_empty() { "null" } else { body.as_str() };
        Ok(serde_json::from_str(text)?)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> ApiResult<T> {
        self.send(self.request(Method::GET, path)?).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> ApiResult<T> {
        self.send(self.request(Method::POST, path)?.json(body)).await
    }

    async fn put<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> ApiResult<T> {
        self.send(self.request(Method::PUT, path)?.json(body)).await
    }

    async fn delete(&self, path: &str) -> ApiResult<()> {
        let _: Value = self.send(self.request(Method::DELETE, path)?).await?;
        Ok(())
    }

    // --- auth (no bearer token) ---

    pub async fn login(&self, email: &str, password: &str) -> ApiResult<LoginResponse> {
        let builder = self
            .http
            .post(self.endpoint("auth/login")?)
            .json(&json!({ "email": email, "password": password }));
        self.send(builder).await
    }

    pub async fn register(
        &self,
        email: &str,
        password: &str,
        name: &str,
        restaurant_id: Option<Uuid>,
    ) -> ApiResult<RegisterResponse> {
        let mut body = Map::new();
        body.insert("email".into(), json!(email));
        body.insert("password".into(), json!(password));
        body.insert("name".into(), json!(name));
        if let Some(id) = restaurant_id {
            body.insert("restaurant_id".into(), json!(id));
        }
        let builder = self
            .http
            .post(self.endpoint("auth/register")?)
            .json(&Value::Object(body));
        self.send(builder).await
    }

    pub async fn refresh(&self, refresh_token: &str) -> ApiResult<TokenPair> {
        let builder = self
            .http
            .post(self.endpoint("auth/refresh")?)
            .json(&json!({ "refresh_token": refresh_token }));
        self.send(builder).await
    }

    pub async fn me(&self) -> ApiResult<Me> {
        self.get("me").await
    }

    // --- restaurants ---

    pub async fn list_restaurants(&self) -> ApiResult<Vec<Restaurant>> {
        self.get("restaurants").await
    }

    pub async fn get_restaurant(&self, id: Uuid) -> ApiResult<Restaurant> {
        self.get(&format!("restaurants/{}", id)).await
    }

    pub async fn create_restaurant(&self, form: &RestaurantForm) -> ApiResult<Restaurant> {
        let name = form.name.as_deref().map(str::trim).unwrap_or_default();
        if name.is_empty() {
            return Err(ApiError::validation("Restaurant name is required."));
        }
        self.post("restaurants", form).await
    }

    pub async fn update_restaurant(&self, id: Uuid, form: &RestaurantForm) -> ApiResult<Restaurant> {
        if matches!(form.name.as_deref(), Some(n) if n.trim().is_empty()) {
            return Err(ApiError::validation("Restaurant name is required."));
        }
        self.put(&format!("restaurants/{}", id), form).await
    }

    pub async fn delete_restaurant(&self, id: Uuid) -> ApiResult<()> {
        self.delete(&format!("restaurants/{}", id)).await
    }

    // --- wine list files ---

    pub async fn list_wine_lists(&self, restaurant_id: Uuid) -> ApiResult<Vec<WineListFile>> {
        self.get(&format!("restaurants/{}/wine-lists", restaurant_id))
            .await
    }

    pub async fn get_wine_list(&self, id: Uuid) -> ApiResult<WineListFile> {
        self.get(&format!("wine-lists/{}", id)).await
    }

    pub async fn delete_wine_list(&self, id: Uuid) -> ApiResult<()> {
        self.delete(&format!("wine-lists/{}", id)).await
    }

    pub async fn status(&self, id: Uuid) -> ApiResult<StatusReport> {
        self.get(&format!("wine-lists/{}/status", id)).await
    }

    // --- users ---

    pub async fn list_users(&self) -> ApiResult<Vec<User>> {
        self.get("users").await
    }

    pub async fn create_user(&self, user: &NewUser) -> ApiResult<User> {
        crate::auth::validate_new_user(user)?;
        self.post("users", user).await
    }

    pub async fn update_user(&self, id: Uuid, update: &UserUpdate) -> ApiResult<User> {
        self.put(&format!("users/{}", id), update).await
    }

    pub async fn delete_user(&self, id: Uuid) -> ApiResult<()> {
        self.delete(&format!("users/{}", id)).await
    }

    // --- rulesets ---

    pub async fn get_ruleset(&self, restaurant_id: Uuid) -> ApiResult<Ruleset> {
        self.get(&format!("restaurants/{}/ruleset", restaurant_id))
            .await
    }

    /// Replace the ruleset. The rules must be a JSON object.
    pub async fn update_ruleset(&self, restaurant_id: Uuid, rules: &Value) -> ApiResult<Ruleset> {
        if !rules.is_object() {
            return Err(ApiError::validation("Rules must be a JSON object."));
        }
        self.put(
            &format!("restaurants/{}/ruleset", restaurant_id),
            &json!({ "rules_json": rules }),
        )
        .await
    }

    pub async fn train_ruleset(&self, restaurant_id: Uuid) -> ApiResult<String> {
        let detail: Detail = self
            .post(
                &format!("restaurants/{}/ruleset/train", restaurant_id),
                &json!({}),
            )
            .await?;
        Ok(detail.detail)
    }

    // --- wine entries ---

    pub async fn list_wine_entries(&self, file_id: Uuid) -> ApiResult<Vec<WineEntry>> {
        self.get(&format!("wine-entries/{}", file_id)).await
    }

    pub async fn update_wine_entry(
        &self,
        entry_id: Uuid,
        update: &WineEntryUpdate,
    ) -> ApiResult<WineEntry> {
        if update.is_empty() {
            return Err(ApiError::validation("Nothing to update."));
        }
        self.put(&format!("wine-entries/{}", entry_id), update)
            .await
    }

    pub async fn bulk_update_wine_entries(
        &self,
        updates: &[BulkEntryUpdate],
    ) -> ApiResult<Vec<WineEntry>> {
        #[derive(serde::Deserialize)]
        struct Updated {
            updated: Vec<WineEntry>,
        }
        let res: Updated = self.put("wine-entries/bulk", updates).await?;
        Ok(res.updated)
    }

    pub async fn reject_wine_entry(&self, entry_id: Uuid) -> ApiResult<()> {
        let _: Value = self
            .post(&format!("wine-entries/{}/reject", entry_id), &json!({}))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl WineListApi for ApiClient {
    async fn upload_wine_list(
        &self,
        request: &UploadRequest,
        progress: ProgressSink,
    ) -> ApiResult<UploadResponse> {
        crate::upload::submit(self, request, progress).await
    }

    async fn wine_list_status(&self, id: Uuid) -> ApiResult<StatusReport> {
        ApiClient::status(self, id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ApiClient {
        let base = Url::parse("http://127.0.0.1:8000/api/").unwrap();
        ApiClient::new(base, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn request_sets_bearer_and_keeps_api_prefix() {
        let client = client().with_token("token");
        let body = json!({ "name": "Chez Nous" });
        let request = client
            .request(Method::POST, "/restaurants")
            .unwrap()
            .json(&body)
            .build()
            .unwrap();
        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.url().path(), "/api/restaurants");
        let headers = request.headers();
        assert_eq!(
            headers
                .get("Authorization")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "Bearer token"
        );
        assert_eq!(
            headers
                .get("Content-Type")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "application/json"
        );
    }

    #[test]
    fn missing_token_requires_login() {
        let err = client()
            .request(Method::GET, "restaurants")
            .unwrap_err();
        assert_eq!(err.redirect(), Some("/login"));

        let err = client()
            .with_token("")
            .request(Method::GET, "users")
            .unwrap_err();
        assert!(matches!(err, ApiError::LoginRequired { .. }));
    }

    #[test]
    fn debug_output_hides_token() {
        let rendered = format!("{:?}", client().with_token("s3cret"));
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("authenticated: true"));
    }
}
