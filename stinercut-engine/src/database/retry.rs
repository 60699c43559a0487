//! Retry helper for SQLite write contention.
//!
//! Several worker processes may share one database file; writes that lose the
//! race for the write lock surface as `SQLITE_BUSY`/`SQLITE_LOCKED` and are
//! retried here with jittered exponential backoff.

use rand::random;
use std::borrow::Cow;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use crate::{Error, Result};

const BUSY_MAX_RETRIES: u32 = 12;
const BUSY_BASE_DELAY_MS: u64 = 10;
const BUSY_MAX_DELAY_MS: u64 = 2000;

fn message_is_busy(msg: &str) -> bool {
    let msg = msg.to_ascii_lowercase();
    msg.contains("database is locked") || msg.contains("database is busy")
}

pub(crate) fn is_busy(err: &Error) -> bool {
    let Error::DatabaseSqlx(sqlx_err) = err else {
        return false;
    };

    match sqlx_err {
        sqlx::Error::Database(db_err) => {
            // 5 = SQLITE_BUSY, 6 = SQLITE_LOCKED
            let code = db_err.code().map(Cow::into_owned);
            matches!(code.as_deref(), Some("5") | Some("6")) || message_is_busy(db_err.message())
        }
        other => message_is_busy(&other.to_string()),
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp_ms = BUSY_BASE_DELAY_MS.saturating_mul(1u64 << attempt.min(16));
    let capped_ms = exp_ms.min(BUSY_MAX_DELAY_MS);
    let jitter_ms = random::<u64>() % (capped_ms / 4 + 1);
    Duration::from_millis((capped_ms + jitter_ms).min(BUSY_MAX_DELAY_MS))
}

/// Run `op`, retrying while it fails with a busy/locked error.
pub async fn retry_on_busy<T, F, Fut>(op_name: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_busy(&err) && attempt < BUSY_MAX_RETRIES => {
                let delay = backoff_delay(attempt);
                debug!(
                    op = op_name,
                    attempt = attempt + 1,
                    max = BUSY_MAX_RETRIES,
                    "SQLite busy, retrying in {:?}",
                    delay
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_is_capped() {
        for attempt in 0..20 {
            assert!(backoff_delay(attempt) <= Duration::from_millis(BUSY_MAX_DELAY_MS));
        }
    }

    #[test]
    fn test_non_database_errors_are_not_busy() {
        assert!(!is_busy(&Error::validation("nope")));
        assert!(is_busy(&Error::DatabaseSqlx(sqlx::Error::Protocol(
            "database is locked".to_string()
        ))));
    }

    #[tokio::test]
    async fn test_retry_stops_on_non_busy_error() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_on_busy("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::validation("bad input")) }
        })
        .await;

        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_recovers_after_busy() {
        let calls = AtomicU32::new(0);
        let result = retry_on_busy("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::DatabaseSqlx(sqlx::Error::Protocol(
                        "database is busy".to_string(),
                    )))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 2);
    }
}
