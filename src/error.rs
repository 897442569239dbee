use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;

use crate::config::ConfigError;
use crate::repo::RepoError;

pub type AppResult<T> = Result<T, AppError>;

/// One entry of a JSON:API `errors` document.
#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub status: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("not found")] NotFound,
    #[error("route not found")] RouteNotFound,
    #[error("conflict")] Conflict,
    #[error("bad request: {0}")] BadRequest(String),
    #[error("validation failed: {0}")] Validation(String),
    #[error("unauthorized")] Unauthorized,
    #[error("permission denied")] PermissionDenied,
    #[error("invalid confirmation token")] InvalidConfirmationToken,
    #[error("service unavailable")] Unavailable,
    #[error("internal error: {0}")] Internal(String),
}

impl From<RepoError> for AppError {
    fn from(e: RepoError) -> Self {
        match e {
            RepoError::NotFound => AppError::NotFound,
            RepoError::Conflict => AppError::Conflict,
            RepoError::Internal(msg) => AppError::Internal(msg),
        }
    }
}

impl From<ConfigError> for AppError {
    fn from(e: ConfigError) -> Self {
        AppError::Internal(e.to_string())
    }
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound | AppError::RouteNotFound => StatusCode::NOT_FOUND,
            AppError::Conflict => StatusCode::CONFLICT,
            AppError::BadRequest(_) | AppError::InvalidConfirmationToken => StatusCode::BAD_REQUEST,
            AppError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::PermissionDenied => StatusCode::FORBIDDEN,
            AppError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::NotFound | AppError::RouteNotFound => "not_found",
            AppError::Conflict => "conflict",
            AppError::BadRequest(_) => "bad_request",
            AppError::Validation(_) => "validation_error",
            AppError::Unauthorized => "not_authenticated",
            AppError::PermissionDenied => "permission_denied",
            AppError::InvalidConfirmationToken => "invalid_confirmation_token",
            AppError::Unavailable => "service_unavailable",
            AppError::Internal(_) => "unknown",
        }
    }

    pub fn body(&self, debug: bool) -> ApiErrorBody {
        let detail = match self {
            AppError::BadRequest(msg) | AppError::Validation(msg) => Some(msg.clone()),
            AppError::Internal(_) if !debug => None,
            _ if debug => Some(self.to_string()),
            _ => None,
        };
        ApiErrorBody { status: self.status().as_u16().to_string(), code: self.code().into(), detail }
    }

    /// JSON:API error document response.
    pub fn to_json_response(&self, debug: bool) -> HttpResponse {
        HttpResponse::build(self.status()).json(serde_json::json!({ "errors": [self.body(debug)] }))
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.status()
    }

    fn error_response(&self) -> HttpResponse {
        self.to_json_response(false)
    }
}
