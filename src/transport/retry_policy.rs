use std::time::{Duration, SystemTime};

use http::header::RETRY_AFTER;

const RETRY_BACKOFF_BASE_MS: u64 = 100;
const RETRY_BACKOFF_MAX_MS: u64 = 1_000;
const RETRY_AFTER_MAX_SECS: u64 = 30;
const RETRY_TRANSPORT_FAST_SECOND_MS: u64 = 10;

/// When and how long to wait before re-sending an upstream request.
///
/// Retries only happen before any response byte reaches the client; a
/// stream that fails midway is never replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `attempt + 1` after a retriable status, or
    /// `None` when the status is final or retries are exhausted.
    #[must_use]
    pub fn after_status(
        &self,
        status: http::StatusCode,
        headers: &http::HeaderMap,
        attempt: u32,
    ) -> Option<Duration> {
        (attempt < self.max_attempts && should_retry_upstream_status(status))
            .then(|| retry_delay(headers, attempt))
    }

    /// Delay before retry number `attempt + 1` after a transport error.
    #[must_use]
    pub fn after_transport_error(&self, message: &str, attempt: u32) -> Option<Duration> {
        (attempt < self.max_attempts && should_retry_transport_message(message))
            .then(|| retry_transport_delay(message, attempt))
    }
}

#[inline]
fn should_retry_upstream_status(status: http::StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 503 | 529)
}

#[inline]
fn should_retry_transport_message(message: &str) -> bool {
    const NEEDLES: [&[u8]; 9] = [
        b"timed out",
        b"timeout",
        b"connection reset",
        b"connection aborted",
        b"broken pipe",
        b"connection refused",
        b"error sending request",
        b"unexpected eof",
        b"stream closed",
    ];
    let haystack = message.as_bytes();
    NEEDLES
        .iter()
        .any(|needle| contains_ascii_case_insensitive(haystack, needle))
}

/// Resets and aborted connections usually succeed on an immediate retry.
#[inline]
fn retry_transport_delay(message: &str, attempt: u32) -> Duration {
    const FAST_RETRY_NEEDLES: [&[u8]; 4] = [
        b"connection reset",
        b"connection aborted",
        b"broken pipe",
        b"unexpected eof",
    ];
    let haystack = message.as_bytes();
    let fast = FAST_RETRY_NEEDLES
        .iter()
        .any(|needle| contains_ascii_case_insensitive(haystack, needle));
    match (fast, attempt) {
        (true, 0) => Duration::ZERO,
        (true, _) => Duration::from_millis(RETRY_TRANSPORT_FAST_SECOND_MS),
        (false, _) => retry_backoff_delay(attempt),
    }
}

#[inline]
fn contains_ascii_case_insensitive(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    haystack.len() >= needle.len()
        && haystack
            .windows(needle.len())
            .any(|window| window.eq_ignore_ascii_case(needle))
}

#[inline]
fn retry_backoff_delay(attempt: u32) -> Duration {
    let multiplier = 1_u64 << attempt.min(10);
    Duration::from_millis(
        RETRY_BACKOFF_BASE_MS
            .saturating_mul(multiplier)
            .min(RETRY_BACKOFF_MAX_MS),
    )
}

#[inline]
fn retry_delay(headers: &http::HeaderMap, attempt: u32) -> Duration {
    parse_retry_after_delay(headers).unwrap_or_else(|| retry_backoff_delay(attempt))
}

/// `Retry-After` as delta-seconds or an HTTP date, capped at 30 seconds.
fn parse_retry_after_delay(headers: &http::HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(Duration::from_secs(seconds.min(RETRY_AFTER_MAX_SECS)));
    }

    let target = httpdate::parse_http_date(raw).ok()?;
    let delay = target.duration_since(SystemTime::now()).unwrap_or_default();
    Some(delay.min(Duration::from_secs(RETRY_AFTER_MAX_SECS)))
}
