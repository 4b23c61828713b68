//! The error taxonomy the HTTP surface maps to status codes.
//!
//! Component code returns `AppError` so handlers never have to pattern-match
//! on a message string the way the donor crate's tests did
//! (`.to_string().contains("not found")`); everything downstream of a
//! component call gets a closed set of kinds it can switch on.

use http::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unauthenticated")]
    Unauthenticated,

    #[error("session exited")]
    SessionExited,

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("corrupt data: {0}")]
    Corrupt(String),

    #[error("fatal error: {0}")]
    Fatal(String),
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        Self::Corrupt(e.to_string())
    }
}

/// The machine-readable code that accompanies the HTTP JSON error body.
impl AppError {
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::AlreadyExists(_) => StatusCode::CONFLICT,
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::SessionExited => StatusCode::BAD_REQUEST,
            Self::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            Self::IoError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Corrupt(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::AlreadyExists(_) => "already_exists",
            Self::InvalidInput(_) => "invalid_input",
            Self::Unauthenticated => "unauthenticated",
            Self::SessionExited => "session_exited",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::IoError(_) => "io_error",
            Self::Corrupt(_) => "corrupt",
            Self::Fatal(_) => "fatal",
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
