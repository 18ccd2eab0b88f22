//! Retry with exponential backoff for page fetches

use std::time::Duration;

use serde::Deserialize;

use crate::cancel::CancelToken;
use crate::error::SourceError;

/// Retry budget and backoff bounds for one page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per page, including the first
    pub max_attempts: u32,
    #[serde(rename = "base_delay_ms", with = "millis")]
    pub base_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "millis")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Policy with `max_attempts` and no sleeping between attempts.
    pub const fn no_delay(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay after failed attempt `attempt` (1-based): base * 2^(attempt-1), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Retry a fallible page request with exponential backoff.
///
/// `attempt_fn` receives the 1-based attempt number. Retryable errors are
/// logged and retried until `max_attempts` is reached; the final failure is
/// wrapped in [`SourceError::RetriesExhausted`]. Non-retryable errors return
/// immediately, unwrapped. A cancelled `cancel` token cuts the backoff sleep
/// short and returns the pending failure as exhausted.
///
/// Returns the value together with the number of attempts it took.
pub fn retry_with_backoff<T>(
    label: &str,
    policy: &RetryPolicy,
    cancel: Option<&CancelToken>,
    mut attempt_fn: impl FnMut(u32) -> Result<T, SourceError>,
) -> Result<(T, u32), SourceError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1u32;
    loop {
        match attempt_fn(attempt) {
            Ok(v) => return Ok((v, attempt)),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = policy.backoff(attempt);
                log::warn!(
                    "{label}: attempt {attempt}/{max_attempts} failed: {e}, retrying in {delay:?}"
                );
                let slept = match cancel {
                    Some(token) => token.sleep(delay),
                    None => {
                        std::thread::sleep(delay);
                        true
                    }
                };
                if !slept {
                    log::warn!("{label}: cancelled while waiting to retry");
                    return Err(SourceError::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                attempt += 1;
            }
            Err(e) if e.is_retryable() => {
                log::error!("{label}: failed permanently: {e}");
                return Err(SourceError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(e),
                });
            }
            Err(e) => {
                log::error!("{label}: {e}");
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transient() -> SourceError {
        SourceError::Http {
            status: Some(503),
            message: "unavailable".into(),
        }
    }

    #[test]
    fn backoff_exponential() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
    }

    #[test]
    fn backoff_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(10), Duration::from_secs(30));
        assert_eq!(policy.backoff(64), Duration::from_secs(30));
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let policy = RetryPolicy::no_delay(3);
        let (v, attempts) = retry_with_backoff("t", &policy, None, |n| {
            if n < 3 {
                Err(transient())
            } else {
                Ok(n)
            }
        })
        .unwrap();
        assert_eq!(v, 3);
        assert_eq!(attempts, 3);
    }

    #[test]
    fn exhaustion_wraps_last_error() {
        let policy = RetryPolicy::no_delay(2);
        let mut calls = 0;
        let err = retry_with_backoff("t", &policy, None, |_| -> Result<(), _> {
            calls += 1;
            Err(transient())
        })
        .unwrap_err();
        assert_eq!(calls, 2);
        assert!(matches!(
            err,
            SourceError::RetriesExhausted { attempts: 2, .. }
        ));
    }

    #[test]
    fn permanent_error_not_retried() {
        let policy = RetryPolicy::no_delay(5);
        let mut calls = 0;
        let err = retry_with_backoff("t", &policy, None, |_| -> Result<(), _> {
            calls += 1;
            Err(SourceError::Http {
                status: Some(404),
                message: "missing".into(),
            })
        })
        .unwrap_err();
        assert_eq!(calls, 1);
        assert!(matches!(err, SourceError::Http { status: Some(404), .. }));
    }

    #[test]
    fn cancel_interrupts_backoff() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
        };
        let cancel = CancelToken::new();
        let mut calls = 0;
        let started = std::time::Instant::now();
        let err = retry_with_backoff("t", &policy, Some(&cancel), |_| -> Result<(), _> {
            calls += 1;
            cancel.cancel();
            Err(transient())
        })
        .unwrap_err();
        assert_eq!(calls, 1);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(
            err,
            SourceError::RetriesExhausted { attempts: 1, .. }
        ));
    }

    #[test]
    fn deserializes_millis() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"max_attempts": 5, "base_delay_ms": 250}"#).unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_millis(250));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
    }
}
