use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Failures from the inference backend. The orchestrator branches on the
/// kind, so these stay structured instead of collapsing into anyhow.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum InferenceError {
    #[error("inference call exceeded its deadline")]
    Timeout,

    #[error("inference backend unreachable: {0}")]
    BackendUnreachable(String),

    #[error("model '{0}' not found on the backend")]
    ModelMissing(String),

    #[error("backend error {status}: {message}")]
    Backend { status: u16, message: String },
}

impl InferenceError {
    /// Stable wire-level kind string used in `failed` events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::BackendUnreachable(_) => "backend_unreachable",
            Self::ModelMissing(_) => "model_missing",
            Self::Backend { .. } => "backend_error",
        }
    }

    /// Only unreachable-before-first-delta is ever retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendUnreachable(_))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("trace '{0}' already exists")]
    Duplicate(String),

    #[error("trace '{0}' not found")]
    NotFound(String),

    #[error("invalid record: {0}")]
    Invalid(String),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors surfaced on non-stream HTTP paths, mapped onto the status table
/// the API documents. In-stream failures travel as `failed` events instead.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Duplicate(String),

    #[error("service at capacity, retry in {retry_after_secs}s")]
    Busy { retry_after_secs: u64 },

    #[error("backend error: {0}")]
    Backend(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Duplicate(_) => StatusCode::CONFLICT,
            Self::Busy { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Backend(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Duplicate(_) => "duplicate",
            Self::Busy { .. } => "busy",
            Self::Backend(_) => "backend",
            Self::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(serde_json::json!({
            "error": self.reason(),
            "message": self.to_string(),
        }));
        let mut response = (status, body).into_response();
        if let Self::Busy { retry_after_secs } = self {
            if let Ok(value) = retry_after_secs.to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate(id) => Self::Duplicate(format!("trace '{id}' already exists")),
            StoreError::NotFound(id) => Self::NotFound(format!("trace '{id}' not found")),
            StoreError::Invalid(msg) => Self::Validation(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<InferenceError> for ApiError {
    fn from(err: InferenceError) -> Self {
        Self::Backend(err.to_string())
    }
}
