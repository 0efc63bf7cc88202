use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;

/// Main error type for the control plane. Every variant maps 1:1 onto a
/// `snake_kind` from the error taxonomy (§7) via [`CoreError::kind`].
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Circuit breaker open: {0}")]
    BreakerOpen(String),

    /// Invalid FSM transition attempted; this is a programming error and
    /// must be logged at `error!` without mutating state (§4.4, §7).
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Component failure: {component} - {reason}")]
    ComponentFailure { component: String, reason: String },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// The stable error `kind` surfaced in the JSON envelope (§7 taxonomy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BadRequest,
    ValidationError,
    Conflict,
    Unauthorized,
    InvalidCredentials,
    InvalidToken,
    Forbidden,
    NotFound,
    QuotaExceeded,
    CapacityExceeded,
    InternalError,
    ServiceUnavailable,
    BreakerOpen,
}

impl ErrorKind {
    fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::InvalidCredentials => "invalid_credentials",
            ErrorKind::InvalidToken => "invalid_token",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not_found",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::CapacityExceeded => "capacity_exceeded",
            ErrorKind::InternalError => "internal_error",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::BreakerOpen => "breaker_open",
        }
    }
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::BadRequest(_) => ErrorKind::BadRequest,
            CoreError::Validation(_) => ErrorKind::ValidationError,
            CoreError::Conflict(_) => ErrorKind::Conflict,
            CoreError::Unauthorized(_) => ErrorKind::Unauthorized,
            CoreError::InvalidCredentials => ErrorKind::InvalidCredentials,
            CoreError::InvalidToken(_) => ErrorKind::InvalidToken,
            CoreError::Forbidden(_) => ErrorKind::Forbidden,
            CoreError::NotFound(_) => ErrorKind::NotFound,
            CoreError::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            CoreError::CapacityExceeded(_) => ErrorKind::CapacityExceeded,
            CoreError::ServiceUnavailable(_) => ErrorKind::ServiceUnavailable,
            CoreError::BreakerOpen(_) => ErrorKind::BreakerOpen,
            CoreError::Database(_)
            | CoreError::Migration(_)
            | CoreError::Config(_)
            | CoreError::Http(_)
            | CoreError::Cache(_)
            | CoreError::Json(_)
            | CoreError::InvalidStateTransition { .. }
            | CoreError::ComponentFailure { .. }
            | CoreError::Internal(_)
            | CoreError::Other(_) => ErrorKind::InternalError,
        }
    }

    fn status_code(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::BadRequest | ErrorKind::ValidationError => StatusCode::BAD_REQUEST,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Unauthorized | ErrorKind::InvalidCredentials | ErrorKind::InvalidToken => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::CapacityExceeded | ErrorKind::ServiceUnavailable | ErrorKind::BreakerOpen => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ErrorKind::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The transient subset of Store failures (§7): connection loss, pool
    /// exhaustion, a worker crash. These are retried by
    /// [`retry_transient`] rather than surfaced straight to the HTTP edge;
    /// everything else (constraint violations, bad rows) is a durable
    /// failure and propagates immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoreError::Database(sqlx::Error::Io(_))
                | CoreError::Database(sqlx::Error::PoolTimedOut)
                | CoreError::Database(sqlx::Error::PoolClosed)
                | CoreError::Database(sqlx::Error::WorkerCrashed)
        )
    }
}

/// Retries `op` on a transient Store failure (§7: "Store transient errors
/// are retried at most twice inside the handler with jittered backoff, then
/// surfaced as `service_unavailable`"). Non-transient errors (constraint
/// violations, not-found, validation) pass through on the first attempt
/// untouched. Backoff is a short jittered delay so concurrent retries from
/// different requests don't lockstep against the same blip.
pub async fn retry_transient<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    use rand::Rng;

    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < 2 => {
                attempt += 1;
                let jitter_ms = rand::thread_rng().gen_range(0..30);
                let backoff_ms = 20u64 * attempt as u64 + jitter_ms;
                tracing::warn!(attempt, backoff_ms, error = %err, "store: transient error, retrying with backoff");
                tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
            }
            Err(err) if err.is_transient() => {
                tracing::error!(error = %err, "store: transient error exhausted retries, surfacing as service_unavailable");
                return Err(CoreError::ServiceUnavailable("store temporarily unavailable".to_string()));
            }
            Err(err) => return Err(err),
        }
    }
}

/// The stable JSON error envelope (§6, §7): `{error, message, details?, requestId?, timestamp}`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "requestId")]
    pub request_id: Option<String>,
    pub timestamp: chrono::DateTime<Utc>,
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let kind = self.kind();

        if matches!(kind, ErrorKind::InternalError) {
            tracing::error!(error = %self, "internal error surfaced to HTTP edge");
        } else {
            tracing::warn!(error = %self, kind = kind.as_str(), "request rejected");
        }

        let body = ErrorBody {
            error: kind.as_str(),
            message: self.to_string(),
            details: None,
            request_id: None,
            timestamp: Utc::now(),
        };
        (status, Json(body)).into_response()
    }
}

/// Result type alias for CoreError
pub type Result<T> = std::result::Result<T, CoreError>;
