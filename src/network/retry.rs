//! Response classification and retry delays.

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use std::time::Duration;

/// Why a send attempt is being retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    Network,
    TooManyRequests,
    ServerError,
}

/// Outcome of one send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Success,
    Recoverable {
        reason: RetryReason,
        retry_after: Duration,
    },
    /// The batch is dropped without retrying.
    NonRecoverable(String),
}

/// 5xx and 429 are retried; any other non-2xx is final.
pub fn classify_status(
    status: StatusCode,
    retry_after_header: Option<&str>,
    backoff: Duration,
) -> Option<SendOutcome> {
    if status.is_success() {
        return Some(SendOutcome::Success);
    }
    let reason = if status == StatusCode::TOO_MANY_REQUESTS {
        RetryReason::TooManyRequests
    } else if status.is_server_error() {
        RetryReason::ServerError
    } else {
        return None;
    };
    Some(SendOutcome::Recoverable {
        reason,
        retry_after: retry_after_duration(backoff, retry_after_header, Utc::now()),
    })
}

/// Delay requested by a `Retry-After` header.
///
/// The header may be an HTTP date or a number of seconds. A date in the past
/// yields zero; a missing or unparseable header yields `default`.
pub fn retry_after_duration(
    default: Duration,
    header: Option<&str>,
    now: DateTime<Utc>,
) -> Duration {
    let Some(value) = header.map(str::trim).filter(|v| !v.is_empty()) else {
        return default;
    };
    if let Ok(at) = DateTime::parse_from_rfc2822(value) {
        return (at.with_timezone(&Utc) - now)
            .to_std()
            .unwrap_or(Duration::ZERO);
    }
    match value.parse::<u64>() {
        Ok(seconds) => Duration::from_secs(seconds),
        Err(_) => default,
    }
}

/// First line of an error body, capped at `limit` bytes.
pub fn first_line(body: &[u8], limit: usize) -> String {
    let body = &body[..body.len().min(limit)];
    let line = body.split(|b| *b == b'\n').next().unwrap_or_default();
    String::from_utf8_lossy(line).trim_end_matches('\r').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_classification() {
        let backoff = Duration::from_millis(100);
        assert_eq!(
            classify_status(StatusCode::OK, None, backoff),
            Some(SendOutcome::Success)
        );
        assert_eq!(
            classify_status(StatusCode::NO_CONTENT, None, backoff),
            Some(SendOutcome::Success)
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, None, backoff),
            Some(SendOutcome::Recoverable {
                reason: RetryReason::TooManyRequests,
                retry_after: backoff,
            })
        );
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, None, backoff),
            Some(SendOutcome::Recoverable {
                reason: RetryReason::ServerError,
                ..
            })
        ));
        assert_eq!(classify_status(StatusCode::BAD_REQUEST, None, backoff), None);
        assert_eq!(classify_status(StatusCode::NOT_FOUND, None, backoff), None);
    }

    #[test]
    fn test_retry_after_seconds() {
        let now = Utc::now();
        let d = retry_after_duration(Duration::from_secs(1), Some("5"), now);
        assert_eq!(d, Duration::from_secs(5));
    }

    #[test]
    fn test_retry_after_http_date() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let d = retry_after_duration(
            Duration::from_secs(1),
            Some("Mon, 01 Jan 2024 12:00:30 GMT"),
            now,
        );
        assert_eq!(d, Duration::from_secs(30));

        let past = retry_after_duration(
            Duration::from_secs(1),
            Some("Mon, 01 Jan 2024 11:00:00 GMT"),
            now,
        );
        assert_eq!(past, Duration::ZERO);
    }

    #[test]
    fn test_retry_after_fallback() {
        let default = Duration::from_millis(250);
        let now = Utc::now();
        assert_eq!(retry_after_duration(default, None, now), default);
        assert_eq!(retry_after_duration(default, Some(""), now), default);
        assert_eq!(retry_after_duration(default, Some("soon"), now), default);
    }

    #[test]
    fn test_first_line() {
        assert_eq!(first_line(b"bad labels\nmore detail", 1000), "bad labels");
        assert_eq!(first_line(b"line\r\n", 1000), "line");
        assert_eq!(first_line(b"abcdef", 3), "abc");
        assert_eq!(first_line(b"", 1000), "");
    }
}
