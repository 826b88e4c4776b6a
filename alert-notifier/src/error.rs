use alert_common::store::StoreError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Enumeration of errors that prevent the notifier from starting or keep it from serving.
#[derive(Error, Debug)]
pub enum NotifierError {
    #[error("failed to initialize alert storage: {0}")]
    StoreError(#[from] StoreError),
    #[error("failed to install metrics recorder: {0}")]
    MetricsError(String),
    #[error("failed to bind {bind}: {error}")]
    BindError {
        bind: String,
        error: std::io::Error,
    },
    #[error("http server failed: {0}")]
    ServeError(std::io::Error),
}

/// Enumeration of errors returned by the HTTP handlers.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Database error: {0}")]
    Database(#[from] StoreError),
    #[error("No blacklisted persons available")]
    NoBlacklistedPersons,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self, "request failed");

        let body = Json(json!({ "error": self.to_string() }));

        (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
    }
}
