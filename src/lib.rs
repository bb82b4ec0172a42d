pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod model;
pub mod poller;
pub mod upload;
pub mod workflow;

pub use api::{ApiClient, WineListApi};
pub use error::{ApiError, ApiResult};
