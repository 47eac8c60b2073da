//! Bounded retry with exponential backoff, applied at the fetch boundary.

use std::future::Future;
use std::time::{Duration, Instant};

use argosync_core::{RemoteError, RetryDisposition};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    /// Base delay after a connection-limit rejection.
    pub base_delay: Duration,
    /// Base delay after a timeout or refused connection.
    pub unavailable_base_delay: Duration,
    pub max_delay: Duration,
    /// Per-attempt bound. `None` leaves it to the fetcher, which starts its
    /// clock only once it holds a connection slot.
    pub attempt_timeout: Option<Duration>,
    /// Wall-clock allowance shared by every fetch of one entity.
    pub total_budget: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            unavailable_base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            attempt_timeout: Some(Duration::from_secs(60)),
            total_budget: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryBudget {
    started: Instant,
    total: Duration,
}

impl RetryBudget {
    pub fn new(total: Duration) -> Self {
        Self {
            started: Instant::now(),
            total,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.total.saturating_sub(self.started.elapsed())
    }

    fn allows(&self, delay: Duration) -> bool {
        self.started.elapsed() + delay < self.total
    }
}

#[derive(Debug, Clone)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: usize,
}

#[derive(Debug, Clone, Error)]
pub enum RetryError {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: usize, last: RemoteError },
    #[error("retry budget exhausted after {attempts} attempts: {last}")]
    BudgetExceeded { attempts: usize, last: RemoteError },
    #[error("{error}")]
    Permanent { attempts: usize, error: RemoteError },
}

impl RetryError {
    pub fn attempts(&self) -> usize {
        match self {
            RetryError::Exhausted { attempts, .. }
            | RetryError::BudgetExceeded { attempts, .. }
            | RetryError::Permanent { attempts, .. } => *attempts,
        }
    }

    pub fn last_error(&self) -> &RemoteError {
        match self {
            RetryError::Exhausted { last, .. } | RetryError::BudgetExceeded { last, .. } => last,
            RetryError::Permanent { error, .. } => error,
        }
    }

    /// True when the underlying failures were transient and only the retry
    /// allowance ran out.
    pub fn is_transient_exhaustion(&self) -> bool {
        !matches!(self, RetryError::Permanent { .. })
    }
}

impl RetryPolicy {
    pub fn budget(&self) -> RetryBudget {
        RetryBudget::new(self.total_budget)
    }

    pub fn delay_for_attempt(&self, disposition: RetryDisposition, attempt_index: usize) -> Duration {
        let base = match disposition {
            RetryDisposition::RetryableWithLongerBackoff => self.unavailable_base_delay,
            _ => self.base_delay,
        };
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        base.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently, or the attempt count or
    /// `budget` is used up. Each attempt is bounded by `attempt_timeout`, if
    /// set, and always by what is left of `budget`.
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        budget: &RetryBudget,
        mut op: F,
    ) -> Result<Retried<T>, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempts = 0usize;

        loop {
            let remaining = budget.remaining();
            if remaining.is_zero() {
                return Err(RetryError::BudgetExceeded {
                    attempts,
                    last: RemoteError::Unavailable {
                        path: label.to_string(),
                        detail: "retry budget spent before attempt".to_string(),
                    },
                });
            }

            attempts += 1;
            let timeout = self.attempt_timeout.map_or(remaining, |t| t.min(remaining));
            let result = match tokio::time::timeout(timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(RemoteError::Unavailable {
                    path: label.to_string(),
                    detail: format!("attempt timed out after {timeout:?}"),
                }),
            };

            let err = match result {
                Ok(value) => return Ok(Retried { value, attempts }),
                Err(err) => err,
            };

            let disposition = err.disposition();
            if disposition == RetryDisposition::NonRetryable {
                return Err(RetryError::Permanent {
                    attempts,
                    error: err,
                });
            }
            if attempts >= max_attempts {
                return Err(RetryError::Exhausted {
                    attempts,
                    last: err,
                });
            }

            let delay = self.delay_for_attempt(disposition, attempts - 1);
            if !budget.allows(delay) {
                return Err(RetryError::BudgetExceeded {
                    attempts,
                    last: err,
                });
            }
            debug!(label, attempts, ?delay, error = %err, "transient remote failure, backing off");
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_policy(max_attempts: usize) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            unavailable_base_delay: Duration::from_millis(2),
            max_delay: Duration::from_millis(5),
            attempt_timeout: Some(Duration::from_millis(200)),
            total_budget: Duration::from_secs(5),
        }
    }

    fn busy() -> RemoteError {
        RemoteError::Busy {
            path: "x".into(),
            detail: "421 too many connections".into(),
        }
    }

    #[test]
    fn backoff_is_exponential_capped_and_longer_when_unavailable() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            unavailable_base_delay: Duration::from_millis(300),
            max_delay: Duration::from_millis(700),
            ..Default::default()
        };

        let busy = RetryDisposition::Retryable;
        assert_eq!(policy.delay_for_attempt(busy, 0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(busy, 1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(busy, 3), Duration::from_millis(700));
        assert_eq!(policy.delay_for_attempt(busy, 40), Duration::from_millis(700));

        let down = RetryDisposition::RetryableWithLongerBackoff;
        assert_eq!(policy.delay_for_attempt(down, 0), Duration::from_millis(300));
        assert_eq!(policy.delay_for_attempt(down, 1), Duration::from_millis(600));
    }

    #[tokio::test]
    async fn succeeds_after_fewer_busy_failures_than_the_limit() {
        let policy = fast_policy(4);
        let calls = &AtomicUsize::new(0);
        let out = policy
            .run("f", &policy.budget(), move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(busy())
                } else {
                    Ok("payload")
                }
            })
            .await
            .expect("eventually succeeds");
        assert_eq!(out.value, "payload");
        assert_eq!(out.attempts, 4);
    }

    #[tokio::test]
    async fn always_busy_exhausts_after_max_attempts() {
        let policy = fast_policy(3);
        let calls = &AtomicUsize::new(0);
        let err = policy
            .run("f", &policy.budget(), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(busy())
            })
            .await
            .expect_err("exhausted");
        assert!(matches!(err, RetryError::Exhausted { attempts: 3, .. }));
        assert!(err.is_transient_exhaustion());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let policy = fast_policy(5);
        let calls = &AtomicUsize::new(0);
        let err = policy
            .run("f", &policy.budget(), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(RemoteError::NotFound { path: "f".into() })
            })
            .await
            .expect_err("permanent");
        assert!(matches!(err, RetryError::Permanent { attempts: 1, .. }));
        assert!(!err.is_transient_exhaustion());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_attempts_time_out_and_count_as_unavailable() {
        let policy = RetryPolicy {
            attempt_timeout: Some(Duration::from_millis(20)),
            ..fast_policy(2)
        };
        let err = policy
            .run("slow", &policy.budget(), || async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Ok::<_, RemoteError>(())
            })
            .await
            .expect_err("times out");
        assert!(matches!(
            err.last_error(),
            RemoteError::Unavailable { .. }
        ));
        assert_eq!(err.attempts(), 2);
    }

    #[tokio::test]
    async fn elapsed_budget_stops_retries_early() {
        let policy = RetryPolicy {
            max_attempts: 50,
            base_delay: Duration::from_millis(40),
            max_delay: Duration::from_millis(40),
            total_budget: Duration::from_millis(100),
            ..fast_policy(50)
        };
        let calls = &AtomicUsize::new(0);
        let err = policy
            .run("f", &policy.budget(), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(busy())
            })
            .await
            .expect_err("budget");
        assert!(matches!(err, RetryError::BudgetExceeded { .. }));
        assert!(calls.load(Ordering::SeqCst) < 50);
    }
}
