//! Bounded "wait until ready" polling

use std::future::Future;

use tokio::time::sleep;

use crate::core::RetryPolicy;

/// Result of a single probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<T> {
    /// The condition holds; stop polling
    Ready(T),
    /// Not yet; poll again after the interval
    Retry,
    /// Give up immediately (e.g. the process being waited on has died)
    Abort(T),
}

/// How a wait ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    Ready { value: T, attempts: u32 },
    Aborted { value: T, attempts: u32 },
    TimedOut { attempts: u32 },
}

impl<T> WaitOutcome<T> {
    pub fn attempts(&self) -> u32 {
        match self {
            WaitOutcome::Ready { attempts, .. }
            | WaitOutcome::Aborted { attempts, .. }
            | WaitOutcome::TimedOut { attempts } => *attempts,
        }
    }
}

/// Run `probe` up to `policy.attempts` times, sleeping `policy.interval`
/// between attempts (not after the last one).
pub async fn wait_until<T, F, Fut>(policy: &RetryPolicy, mut probe: F) -> WaitOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    for attempt in 1..=policy.attempts {
        match probe(attempt).await {
            Attempt::Ready(value) => {
                return WaitOutcome::Ready {
                    value,
                    attempts: attempt,
                }
            }
            Attempt::Abort(value) => {
                return WaitOutcome::Aborted {
                    value,
                    attempts: attempt,
                }
            }
            Attempt::Retry => {
                if attempt < policy.attempts {
                    sleep(policy.interval).await;
                }
            }
        }
    }

    WaitOutcome::TimedOut {
        attempts: policy.attempts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_ready_on_third_attempt() {
        let outcome = wait_until(&fast_policy(10), |n| async move {
            if n == 3 {
                Attempt::Ready("up")
            } else {
                Attempt::Retry
            }
        })
        .await;
        assert_eq!(outcome, WaitOutcome::Ready { value: "up", attempts: 3 });
    }

    #[tokio::test]
    async fn test_times_out_after_all_attempts() {
        let mut calls = 0;
        let outcome: WaitOutcome<()> = wait_until(&fast_policy(4), |_| {
            calls += 1;
            async { Attempt::Retry }
        })
        .await;
        assert_eq!(outcome, WaitOutcome::TimedOut { attempts: 4 });
        assert_eq!(calls, 4);
    }

    #[tokio::test]
    async fn test_abort_stops_immediately() {
        let outcome = wait_until(&fast_policy(10), |n| async move {
            if n == 2 {
                Attempt::Abort(n)
            } else {
                Attempt::Retry
            }
        })
        .await;
        assert_eq!(outcome, WaitOutcome::Aborted { value: 2, attempts: 2 });
    }

    #[tokio::test]
    async fn test_sleeps_between_attempts_only() {
        let policy = RetryPolicy::new(3, Duration::from_millis(40));
        let start = Instant::now();
        let outcome: WaitOutcome<()> = wait_until(&policy, |_| async { Attempt::Retry }).await;
        let elapsed = start.elapsed();
        assert_eq!(outcome.attempts(), 3);
        // two pauses, not three
        assert!(elapsed >= Duration::from_millis(80));
        assert!(elapsed < Duration::from_millis(120) + Duration::from_millis(400));
    }
}
