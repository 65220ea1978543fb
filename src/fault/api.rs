//! Domain-specific faults raised by the CivitAI REST API wrapper.

use std::time::Duration;

use thiserror::Error;

use super::kind::{Fault, FaultKind, kind_for_status};

/// Errors reported by the CivitAI API layer.
///
/// The HTTP wrapper itself lives outside this crate; it maps responses into
/// these variants so the retry machinery can reason about them.
#[derive(Debug, Error)]
pub enum CivitaiApiError {
    /// HTTP 429 from the API.
    #[error("rate limited by CivitAI API")]
    RateLimited {
        /// Server-provided Retry-After delay, if any.
        retry_after: Option<Duration>,
    },

    /// HTTP 401, missing or invalid API token.
    #[error("authentication failed: {message}")]
    Authentication { message: String },

    /// HTTP 403, token valid but not allowed.
    #[error("access denied: {message}")]
    Authorization { message: String },

    /// HTTP 404, resource does not exist.
    #[error("not found: {resource}")]
    NotFound { resource: String },

    /// Any other non-success response.
    #[error("CivitAI API returned HTTP {status}: {message}")]
    Status { status: u16, message: String },
}

impl CivitaiApiError {
    /// Maps an HTTP status and response body onto an API error.
    ///
    /// `retry_after` is only kept for 429 responses.
    #[must_use]
    pub fn from_status(status: u16, message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let message = message.into();
        match status {
            429 => Self::RateLimited { retry_after },
            401 => Self::Authentication { message },
            403 => Self::Authorization { message },
            404 | 410 => Self::NotFound { resource: message },
            _ => Self::Status { status, message },
        }
    }

    /// Returns the HTTP status associated with this error.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::RateLimited { .. } => 429,
            Self::Authentication { .. } => 401,
            Self::Authorization { .. } => 403,
            Self::NotFound { .. } => 404,
            Self::Status { status, .. } => *status,
        }
    }
}

impl Fault for CivitaiApiError {
    fn kind(&self) -> FaultKind {
        match self {
            Self::RateLimited { .. } => FaultKind::RateLimited,
            Self::Authentication { .. } => FaultKind::Unauthenticated,
            Self::Authorization { .. } => FaultKind::Forbidden,
            Self::NotFound { .. } => FaultKind::NotFound,
            // Validation-style statuses (400/422) still count as API faults
            // here: the API rejected the request, the caller's types were fine.
            Self::Status { status, .. } => match kind_for_status(*status) {
                FaultKind::InvalidValue | FaultKind::Other => FaultKind::Api,
                kind => kind,
            },
        }
    }

    fn fault_name(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "RateLimitError",
            Self::Authentication { .. } => "AuthenticationError",
            Self::Authorization { .. } => "AuthorizationError",
            Self::NotFound { .. } => "NotFoundError",
            Self::Status { .. } => "ApiError",
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}
