use crate::pipeline::PipelineError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use roster_runner::RunnerError;
use roster_store::StoreError;
use serde_json::json;

/// Error returned by HTTP handlers: `{"status":"error","code":..,"message":..}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", message)
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_params", message)
    }

    pub fn internal() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", "internal error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "status": "error",
            "code": self.code,
            "message": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DuplicateExternalId(id) => Self::new(
                StatusCode::CONFLICT,
                "duplicate_external_id",
                format!("employee id {id} is already registered"),
            ),
            StoreError::IdentityNotFound(id) => Self::new(
                StatusCode::NOT_FOUND,
                "identity_not_found",
                format!("identity {id} not found"),
            ),
            other => {
                tracing::error!(error = %other, "store failure");
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", "database unavailable")
            }
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::InvalidEmbedding(inner) => Self::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "invalid_embedding",
                format!("invalid embedding: {inner}"),
            ),
            PipelineError::CacheUnavailable(inner) => {
                tracing::error!(error = %inner, "cooldown cache unavailable");
                Self::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "cache_unavailable",
                    "attendance cache temporarily unavailable",
                )
            }
            PipelineError::DuplicateFace { .. } => Self::new(
                StatusCode::CONFLICT,
                "duplicate_face",
                "face is already registered",
            ),
            PipelineError::Store(inner) => inner.into(),
            PipelineError::DanglingIdentity(id) => {
                tracing::error!(identity_id = id, "matched identity missing from store");
                Self::internal()
            }
        }
    }
}

impl From<RunnerError> for ApiError {
    fn from(e: RunnerError) -> Self {
        match e {
            RunnerError::ScriptNotFound(id) => Self::new(
                StatusCode::NOT_FOUND,
                "script_not_found",
                format!("unknown script '{id}'"),
            ),
            RunnerError::InvalidParams(msg) => Self::invalid_params(msg),
        }
    }
}
