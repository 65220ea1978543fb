//! Type tags for raised faults and the [`Fault`] capability trait.
//!
//! Classification never inspects concrete error types directly. Instead every
//! error that takes part in retry decisions implements [`Fault`] and reports a
//! [`FaultKind`] tag. The classifier's rule table matches on those tags.

use std::io::ErrorKind;
use std::time::Duration;

/// Type tag describing what kind of failure a fault represents.
///
/// Domain-specific API kinds come first, generic runtime kinds after. The
/// order mirrors the default classification order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// The remote API asked us to slow down (HTTP 429).
    RateLimited,
    /// Credentials missing or rejected (HTTP 401).
    Unauthenticated,
    /// Credentials valid but access denied (HTTP 403).
    Forbidden,
    /// Requested resource does not exist (HTTP 404/410).
    NotFound,
    /// Any other API-level failure (5xx, unexpected status).
    Api,
    /// Connection refused, reset, DNS failure and similar.
    Connection,
    /// The operation did not finish in time.
    Timeout,
    /// Local permission problem (file system, OS).
    PermissionDenied,
    /// A value failed validation or could not be parsed.
    InvalidValue,
    /// A value had the wrong shape or type.
    TypeMismatch,
    /// Local I/O failure (disk full, broken file handle).
    Io,
    /// Allocation failure.
    OutOfMemory,
    /// The owner of the operation called it off.
    Cancelled,
    /// Anything that fits none of the above.
    Other,
}

/// An error that can be classified by the [`FaultClassifier`](super::FaultClassifier).
///
/// Implementors are plain error types; the trait only adds the metadata the
/// retry machinery needs. `Send + Sync + 'static` lets a classified fault be
/// observed from callbacks on any thread.
pub trait Fault: std::error::Error + Send + Sync + 'static {
    /// Returns the type tag used for classification.
    fn kind(&self) -> FaultKind;

    /// Returns a short, stable name for this fault, used in error patterns
    /// and job error descriptions.
    fn fault_name(&self) -> &'static str {
        short_type_name(std::any::type_name::<Self>())
    }

    /// Server-mandated delay before the next attempt, if the fault carries one.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Strips the module path from a fully qualified type name.
fn short_type_name(full: &'static str) -> &'static str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

impl Fault for std::io::Error {
    fn kind(&self) -> FaultKind {
        match self.kind() {
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::AddrNotAvailable => FaultKind::Connection,
            ErrorKind::TimedOut => FaultKind::Timeout,
            ErrorKind::PermissionDenied => FaultKind::PermissionDenied,
            ErrorKind::InvalidInput | ErrorKind::InvalidData => FaultKind::InvalidValue,
            ErrorKind::OutOfMemory => FaultKind::OutOfMemory,
            _ => FaultKind::Io,
        }
    }

    fn fault_name(&self) -> &'static str {
        "IoError"
    }
}

impl Fault for reqwest::Error {
    fn kind(&self) -> FaultKind {
        if self.is_timeout() {
            return FaultKind::Timeout;
        }
        if let Some(status) = self.status() {
            return kind_for_status(status.as_u16());
        }
        if self.is_connect() || self.is_request() || self.is_body() {
            FaultKind::Connection
        } else if self.is_decode() || self.is_builder() {
            FaultKind::InvalidValue
        } else {
            FaultKind::Other
        }
    }

    fn fault_name(&self) -> &'static str {
        "HttpError"
    }
}

impl Fault for serde_json::Error {
    fn kind(&self) -> FaultKind {
        if self.is_io() {
            FaultKind::Io
        } else {
            FaultKind::InvalidValue
        }
    }

    fn fault_name(&self) -> &'static str {
        "JsonError"
    }
}

/// Maps an HTTP status code to a fault kind.
///
/// Explicit match arms are kept for documentation purposes, even though some
/// return the same value.
#[must_use]
#[allow(clippy::match_same_arms)]
pub fn kind_for_status(status: u16) -> FaultKind {
    match status {
        400 => FaultKind::InvalidValue,
        401 => FaultKind::Unauthenticated,
        403 => FaultKind::Forbidden,
        404 => FaultKind::NotFound,
        408 => FaultKind::Timeout,
        410 => FaultKind::NotFound,
        422 => FaultKind::InvalidValue,
        429 => FaultKind::RateLimited,
        500..=599 => FaultKind::Api,
        400..=499 => FaultKind::Api,
        _ => FaultKind::Other,
    }
}
