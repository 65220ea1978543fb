//! Error types for file transfers.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use super::TaskHandle;
use crate::fault::{Fault, FaultKind, kind_for_status};

/// Errors raised by a [`TransferClient`](super::TransferClient).
///
/// Variants carry the URL or path they concern, so there are no `From`
/// conversions from the underlying errors.
#[derive(Debug, Error)]
pub enum TransferError {
    /// DNS failure, refused or reset connection, broken body stream.
    #[error("connection error downloading {url}: {message}")]
    Connection { url: String, message: String },

    #[error("timeout downloading {url}")]
    Timeout { url: String },

    /// Non-success response other than an auth challenge.
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        url: String,
        status: u16,
        /// Parsed Retry-After header, if the server sent one.
        retry_after: Option<Duration>,
    },

    /// 401, 403 or 407 from the server.
    #[error("[AUTH] authentication required (HTTP {status}) downloading {url}\n  Suggestion: {}", auth_suggestion(*.status))]
    AuthRequired { url: String, status: u16 },

    #[error("IO error writing to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid URL: {url}")]
    InvalidUrl { url: String },

    /// Received size differs from the announced content length.
    #[error("integrity check failed for {path}: expected {expected_bytes} bytes, got {actual_bytes}")]
    Integrity {
        path: PathBuf,
        expected_bytes: u64,
        actual_bytes: u64,
    },

    /// SHA-256 of the finished file differs from the published hash.
    #[error("hash mismatch for {path}: expected {expected}, got {actual}")]
    HashMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("transfer {task} was cancelled")]
    Cancelled { task: TaskHandle },

    #[error("unknown transfer task {task}")]
    UnknownTask { task: TaskHandle },

    /// The transfer task ended without producing a result.
    #[error("transfer {task} aborted: {message}")]
    Aborted { task: TaskHandle, message: String },
}

fn auth_suggestion(status: u16) -> &'static str {
    if status == 407 {
        "Configure your HTTP proxy settings or check proxy credentials."
    } else {
        "Set a CivitAI API token in the [transfer] config section."
    }
}

impl TransferError {
    pub fn connection(url: impl Into<String>, message: impl ToString) -> Self {
        Self::Connection {
            url: url.into(),
            message: message.to_string(),
        }
    }

    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    pub fn http_status(url: impl Into<String>, status: u16, retry_after: Option<Duration>) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    pub fn auth_required(url: impl Into<String>, status: u16) -> Self {
        Self::AuthRequired {
            url: url.into(),
            status,
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    pub fn integrity(path: impl Into<PathBuf>, expected_bytes: u64, actual_bytes: u64) -> Self {
        Self::Integrity {
            path: path.into(),
            expected_bytes,
            actual_bytes,
        }
    }

    /// Maps a reqwest send or body error, separating timeouts.
    pub(crate) fn from_reqwest(url: &str, error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::timeout(url)
        } else {
            Self::connection(url, error)
        }
    }
}

impl Fault for TransferError {
    fn kind(&self) -> FaultKind {
        match self {
            Self::Connection { .. } | Self::Integrity { .. } => FaultKind::Connection,
            Self::Timeout { .. } => FaultKind::Timeout,
            Self::HttpStatus { status, .. } => kind_for_status(*status),
            Self::AuthRequired { status: 403, .. } => FaultKind::Forbidden,
            Self::AuthRequired { .. } => FaultKind::Unauthenticated,
            Self::Io { source, .. } => Fault::kind(source),
            Self::InvalidUrl { .. } | Self::HashMismatch { .. } => FaultKind::InvalidValue,
            Self::Cancelled { .. } => FaultKind::Cancelled,
            Self::UnknownTask { .. } | Self::Aborted { .. } => FaultKind::Other,
        }
    }

    fn fault_name(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "ConnectionError",
            Self::Timeout { .. } => "TimeoutError",
            Self::HttpStatus { .. } => "HttpStatusError",
            Self::AuthRequired { .. } => "AuthRequiredError",
            Self::Io { .. } => "IoError",
            Self::InvalidUrl { .. } => "InvalidUrlError",
            Self::Integrity { .. } => "IntegrityError",
            Self::HashMismatch { .. } => "HashMismatchError",
            Self::Cancelled { .. } => "CancelledError",
            Self::UnknownTask { .. } => "UnknownTaskError",
            Self::Aborted { .. } => "AbortedError",
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::HttpStatus { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
