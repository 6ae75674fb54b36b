//! Error taxonomy shared by every component of the core.
//!
//! Handlers return [`ApiError`]; the request router turns it into a status code and the
//! uniform `{error, message}` JSON body. `ScopeViolation` is an internal invariant breach
//! and is reported to callers as a generic `InternalError`.

use thiserror::Error;

/// Result alias for core operations.
pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("cross-tenant violation: {0}")]
    CrossTenantViolation(String),

    #[error("scope violation: {0}")]
    ScopeViolation(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("upstream timeout: {0}")]
    UpstreamTimeout(String),

    #[error("upstream error: {0}")]
    UpstreamError(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),
}

/// Client-visible error kind. `InternalError` stands in for `ScopeViolation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unauthenticated,
    Unauthorized,
    CrossTenantViolation,
    InternalError,
    InvalidRequest,
    NotFound,
    UpstreamTimeout,
    UpstreamError,
    DeadlineExceeded,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "Unauthenticated",
            Self::Unauthorized => "Unauthorized",
            Self::CrossTenantViolation => "CrossTenantViolation",
            Self::InternalError => "InternalError",
            Self::InvalidRequest => "InvalidRequest",
            Self::NotFound => "NotFound",
            Self::UpstreamTimeout => "UpstreamTimeout",
            Self::UpstreamError => "UpstreamError",
            Self::DeadlineExceeded => "DeadlineExceeded",
        }
    }

    /// Stable HTTP status for this kind.
    pub fn status(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::Unauthenticated => 401,
            Self::Unauthorized | Self::CrossTenantViolation => 403,
            Self::NotFound => 404,
            Self::InternalError => 500,
            Self::UpstreamError => 502,
            Self::UpstreamTimeout | Self::DeadlineExceeded => 504,
        }
    }
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unauthenticated(_) => ErrorKind::Unauthenticated,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::CrossTenantViolation(_) => ErrorKind::CrossTenantViolation,
            Self::ScopeViolation(_) => ErrorKind::InternalError,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::UpstreamTimeout(_) => ErrorKind::UpstreamTimeout,
            Self::UpstreamError(_) => ErrorKind::UpstreamError,
            Self::DeadlineExceeded(_) => ErrorKind::DeadlineExceeded,
        }
    }

    /// Only collaborator failures are worth a retry from the caller's side.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UpstreamTimeout(_) | Self::UpstreamError(_))
    }

    /// Message safe to hand back to the caller.
    pub fn public_message(&self) -> String {
        match self {
            Self::ScopeViolation(_) => "internal error".to_string(),
            Self::Unauthenticated(m)
            | Self::Unauthorized(m)
            | Self::CrossTenantViolation(m)
            | Self::InvalidRequest(m)
            | Self::NotFound(m)
            | Self::UpstreamTimeout(m)
            | Self::UpstreamError(m)
            | Self::DeadlineExceeded(m) => m.clone(),
        }
    }
}

impl From<rusqlite::Error> for ApiError {
    fn from(err: rusqlite::Error) -> Self {
        ApiError::UpstreamError(format!("relational store: {}", err))
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::UpstreamTimeout(format!("collaborator request timed out: {}", err))
        } else {
            ApiError::UpstreamError(format!("collaborator request: {}", err))
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::InvalidRequest(format!("malformed JSON: {}", err))
    }
}
