//! Timestamp helpers for the database layer.
//!
//! Every timestamp column is an `INTEGER` holding Unix epoch milliseconds (UTC).

use chrono::{DateTime, TimeZone, Utc};
use std::time::Duration;

/// Current time as Unix epoch milliseconds (UTC).
#[inline]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Epoch milliseconds `after` from now, saturating on overflow.
#[inline]
pub fn ms_from_now(after: Duration) -> i64 {
    let delta = i64::try_from(after.as_millis()).unwrap_or(i64::MAX);
    now_ms().saturating_add(delta)
}

/// Epoch milliseconds `before` now, saturating on underflow.
#[inline]
pub fn ms_before_now(before: Duration) -> i64 {
    let delta = i64::try_from(before.as_millis()).unwrap_or(i64::MAX);
    now_ms().saturating_sub(delta)
}

/// Convert Unix epoch milliseconds to `DateTime<Utc>`.
///
/// Out-of-range values fall back to the nearest representable instant.
pub fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    match Utc.timestamp_millis_opt(ms) {
        chrono::LocalResult::Single(dt) => dt,
        chrono::LocalResult::Ambiguous(dt, _) => dt,
        chrono::LocalResult::None if ms.is_negative() => DateTime::<Utc>::MIN_UTC,
        chrono::LocalResult::None => DateTime::<Utc>::MAX_UTC,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ms_from_now_is_in_future() {
        let before = now_ms();
        let later = ms_from_now(Duration::from_secs(30));
        assert!(later >= before + 30_000);
    }

    #[test]
    fn test_ms_before_now_is_in_past() {
        let now = now_ms();
        assert!(ms_before_now(Duration::from_secs(1)) <= now - 1_000);
    }

    #[test]
    fn test_ms_to_datetime_roundtrip() {
        let ms = 1_700_000_000_123;
        assert_eq!(ms_to_datetime(ms).timestamp_millis(), ms);
    }
}
