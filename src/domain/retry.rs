//! Bounded retry of units-of-work that lost a serialization race.

use std::thread;
use std::time::Duration;

use super::error::LedgerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            backoff: Duration::from_millis(10),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        RetryPolicy {
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }

    /// Runs `op`, repeating it on `ConcurrencyConflict` with linear backoff.
    ///
    /// Any other error is returned immediately. Once attempts are exhausted the
    /// conflict is surfaced carrying the number of attempts made.
    pub fn run<T>(
        &self,
        operation: &str,
        mut op: impl FnMut() -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Err(LedgerError::ConcurrencyConflict { .. }) if attempt < max_attempts => {
                    tracing::warn!(operation, attempt, "unit-of-work conflicted, retrying");
                    if !self.backoff.is_zero() {
                        thread::sleep(self.backoff * attempt);
                    }
                    attempt += 1;
                }
                Err(LedgerError::ConcurrencyConflict { .. }) => {
                    tracing::warn!(operation, attempts = attempt, "giving up after conflicts");
                    return Err(LedgerError::ConcurrencyConflict { attempts: attempt });
                }
                other => return other,
            }
        }
    }
}
