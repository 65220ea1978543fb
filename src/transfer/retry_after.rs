//! Retry-After header parsing.

use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

/// Longest Retry-After honored (1 hour).
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Parses a Retry-After value given as delta-seconds or an HTTP-date.
///
/// Values beyond [`MAX_RETRY_AFTER`] are capped. Negative numbers, dates in
/// the past and unparseable input yield `None`.
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        let Ok(seconds) = u64::try_from(seconds) else {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        };
        return Some(cap(Duration::from_secs(seconds)));
    }

    match httpdate::parse_http_date(header_value) {
        Ok(when) => match when.duration_since(SystemTime::now()) {
            Ok(wait) => Some(cap(wait)),
            Err(_) => {
                debug!(header_value, "Retry-After date is in the past, ignoring");
                None
            }
        },
        Err(_) => {
            debug!(header_value, "unparseable Retry-After value");
            None
        }
    }
}

fn cap(wait: Duration) -> Duration {
    if wait > MAX_RETRY_AFTER {
        warn!(
            requested_secs = wait.as_secs(),
            max_secs = MAX_RETRY_AFTER.as_secs(),
            "Retry-After exceeds maximum, capping"
        );
        MAX_RETRY_AFTER
    } else {
        wait
    }
}
