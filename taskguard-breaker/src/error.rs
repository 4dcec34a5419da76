//! Error types for the taskguard-breaker crate.

use std::time::Duration;

/// A call was rejected because the breaker for its key is not accepting calls.
///
/// Returned before any attempt is made, so callers can tell "rejected before
/// trying" apart from "tried and failed".
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("circuit '{key}' is open ({consecutive_failures} consecutive failures, retry in {retry_after:?})")]
pub struct BreakerOpen {
    /// The guarded key that rejected the call.
    pub key: String,
    /// Consecutive failures recorded when the call was rejected.
    pub consecutive_failures: u32,
    /// Time left until a trial call may be admitted. Zero while a half-open
    /// trial is already in flight.
    pub retry_after: Duration,
}

/// Outcome of a guarded [`CircuitBreaker::call`](crate::CircuitBreaker::call).
#[derive(Debug, thiserror::Error)]
pub enum CallError<E> {
    /// The breaker rejected the call; the guarded function was not invoked.
    #[error(transparent)]
    Open(#[from] BreakerOpen),

    /// The call exceeded the breaker's call timeout and was counted as a failure.
    #[error("call exceeded breaker timeout of {0:?}")]
    TimedOut(Duration),

    /// The guarded function itself failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> CallError<E> {
    /// Returns `true` when the guarded function never ran.
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Open(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_breaker_open() {
        let err = BreakerOpen {
            key: "sync".into(),
            consecutive_failures: 3,
            retry_after: Duration::from_secs(2),
        };
        assert_eq!(
            err.to_string(),
            "circuit 'sync' is open (3 consecutive failures, retry in 2s)"
        );
    }

    #[test]
    fn display_timed_out() {
        let err: CallError<std::io::Error> = CallError::TimedOut(Duration::from_millis(250));
        assert_eq!(err.to_string(), "call exceeded breaker timeout of 250ms");
        assert!(!err.is_rejected());
    }

    #[test]
    fn open_converts_into_call_error() {
        let open = BreakerOpen {
            key: "k".into(),
            consecutive_failures: 1,
            retry_after: Duration::ZERO,
        };
        let err: CallError<String> = open.into();
        assert!(err.is_rejected());
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<BreakerOpen>();
        assert_send_sync::<CallError<std::io::Error>>();
    }
}
