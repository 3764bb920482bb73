use std::time::{Duration, SystemTime};

use http::header::RETRY_AFTER;

pub(crate) const RETRY_BACKOFF_BASE_MS: u64 = 100;
pub(crate) const RETRY_BACKOFF_MAX_MS: u64 = 1_000;
pub(crate) const RETRY_AFTER_MAX_SECS: u64 = 300;

#[inline]
pub(crate) fn retry_backoff_delay(attempt: u32) -> Duration {
    let shift = attempt.min(10);
    let multiplier = 1_u64 << shift;
    Duration::from_millis(
        RETRY_BACKOFF_BASE_MS
            .saturating_mul(multiplier)
            .min(RETRY_BACKOFF_MAX_MS),
    )
}

/// Parse a `Retry-After` header into milliseconds, accepting both the
/// delta-seconds and HTTP-date forms, capped at five minutes.
#[inline]
pub(crate) fn parse_retry_after_ms(headers: &http::HeaderMap) -> Option<u64> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(seconds.min(RETRY_AFTER_MAX_SECS) * 1_000);
    }

    let target = httpdate::parse_http_date(raw).ok()?;
    let delay = target.duration_since(SystemTime::now()).unwrap_or_default();
    Some(
        u64::try_from(delay.as_millis())
            .unwrap_or(u64::MAX)
            .min(RETRY_AFTER_MAX_SECS * 1_000),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(retry_backoff_delay(0), Duration::from_millis(100));
        assert_eq!(retry_backoff_delay(1), Duration::from_millis(200));
        assert_eq!(retry_backoff_delay(2), Duration::from_millis(400));
        assert_eq!(retry_backoff_delay(10), Duration::from_millis(1_000));
        assert_eq!(retry_backoff_delay(u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        let mut headers = http::HeaderMap::new();
        headers.insert(RETRY_AFTER, http::HeaderValue::from_static("5"));
        assert_eq!(parse_retry_after_ms(&headers), Some(5_000));
    }

    #[test]
    fn test_parse_retry_after_capped() {
        let mut headers = http::HeaderMap::new();
        headers.insert(RETRY_AFTER, http::HeaderValue::from_static("86400"));
        assert_eq!(parse_retry_after_ms(&headers), Some(300_000));
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        let target = SystemTime::now() + Duration::from_secs(2);
        let mut headers = http::HeaderMap::new();
        headers.insert(
            RETRY_AFTER,
            http::HeaderValue::from_str(&httpdate::fmt_http_date(target)).unwrap(),
        );
        let parsed = parse_retry_after_ms(&headers).unwrap();
        assert!(parsed <= RETRY_AFTER_MAX_SECS * 1_000);
    }

    #[test]
    fn test_parse_retry_after_invalid() {
        let mut headers = http::HeaderMap::new();
        headers.insert(RETRY_AFTER, http::HeaderValue::from_static("not-a-delay"));
        assert!(parse_retry_after_ms(&headers).is_none());
    }
}
