// src/core/retry.rs

//! Attempt / classify / back off / retry.
//!
//! Every provider call and the notifier go through [`retry`]. An attempt yields one of
//! three things: a successful [`RetryOutcome`], an unsuccessful one, or no outcome at
//! all (`None`). The last two are retried identically. Errors returned by the
//! operation are swallowed on intermediate attempts and surface only when the final
//! attempt fails.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Upper bound for a single backoff delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Classification of a single attempt that produced a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome<T> {
    /// Stop retrying and hand the value to the caller.
    Success(T),
    /// Retry. The value, if any, is what the caller receives when attempts run out.
    Failure(Option<T>),
}

impl<T> RetryOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, RetryOutcome::Success(_))
    }

    fn into_value(self) -> Option<T> {
        match self {
            RetryOutcome::Success(value) => Some(value),
            RetryOutcome::Failure(value) => value,
        }
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("retry cancelled")]
    Cancelled,
    #[error("final attempt failed: {0}")]
    Operation(E),
}

/// Attempt budget, cancellation and log context for one call to [`retry`].
///
/// `max_attempts` counts retries after the first try, so the operation runs at most
/// `max_attempts + 1` times.
#[derive(Clone, Copy)]
pub struct RetryPolicy<'a> {
    pub max_attempts: usize,
    pub label: &'static str,
    pub cancellation: Option<&'a CancellationToken>,
    pub scanner: Option<&'a str>,
    pub domain: Option<&'a str>,
}

impl<'a> RetryPolicy<'a> {
    /// `max_attempts` has a minimum of 1; smaller values are raised to it.
    pub fn new(label: &'static str, max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            label,
            cancellation: None,
            scanner: None,
            domain: None,
        }
    }

    pub fn with_cancellation(mut self, token: &'a CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Scanner and domain attached to every log line of this retry.
    pub fn with_context(mut self, scanner: &'a str, domain: &'a str) -> Self {
        self.scanner = Some(scanner);
        self.domain = Some(domain);
        self
    }

    fn total_attempts(&self) -> usize {
        self.max_attempts + 1
    }
}

/// Runs `operation` until it reports success or the attempt budget is spent.
///
/// # Arguments
/// * `policy` - Attempt budget, log label and optional cancellation token.
/// * `operation` - Called with the 1-based attempt number.
///
/// # Returns
/// * `Ok(Some(value))` on success.
/// * `Ok(last)` when attempts ran out without success; `last` is the value carried by
///   the final unsuccessful outcome, usually `None`.
/// * `Err(RetryError::Operation)` when the final attempt returned an error.
/// * `Err(RetryError::Cancelled)` when the token fired before, during or between
///   attempts. An attempt still running when the token fires is dropped.
pub async fn retry<'a, T, E, F, Fut>(
    policy: RetryPolicy<'a>,
    mut operation: F,
) -> Result<Option<T>, RetryError<E>>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<Option<RetryOutcome<T>>, E>>,
    E: Display,
{
    let total = policy.total_attempts();
    let mut last = None;

    for attempt in 1..=total {
        if policy.cancellation.is_some_and(|token| token.is_cancelled()) {
            return Err(RetryError::Cancelled);
        }

        let attempted = match policy.cancellation {
            Some(token) => tokio::select! {
                _ = token.cancelled() => {
                    debug!(phase = policy.label, scanner = policy.scanner, domain = policy.domain, attempt, "Attempt cancelled.");
                    return Err(RetryError::Cancelled);
                }
                result = operation(attempt) => result,
            },
            None => operation(attempt).await,
        };

        match attempted {
            Ok(Some(RetryOutcome::Success(value))) => return Ok(Some(value)),
            Ok(Some(outcome)) => {
                debug!(phase = policy.label, scanner = policy.scanner, domain = policy.domain, attempt, "Attempt unsuccessful.");
                last = outcome.into_value();
            }
            Ok(None) => {
                debug!(phase = policy.label, scanner = policy.scanner, domain = policy.domain, attempt, "Attempt produced no outcome.");
                last = None;
            }
            Err(err) if attempt < total => {
                warn!(
                    phase = policy.label,
                    scanner = policy.scanner,
                    domain = policy.domain,
                    attempt,
                    error = %err,
                    "Attempt failed; retrying."
                );
                last = None;
            }
            Err(err) => {
                warn!(
                    phase = policy.label,
                    scanner = policy.scanner,
                    domain = policy.domain,
                    attempt,
                    error = %err,
                    "Final attempt failed."
                );
                return Err(RetryError::Operation(err));
            }
        }

        if attempt < total {
            let delay = backoff_delay(attempt);
            debug!(
                phase = policy.label,
                domain = policy.domain,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Backing off before next attempt."
            );
            sleep_with_cancellation(delay, policy.cancellation).await?;
        }
    }

    debug!(phase = policy.label, domain = policy.domain, attempts = total, "Retry budget exhausted.");
    Ok(last)
}

/// Delay inserted after attempt `attempt` (1-based): the sum of `i²` for
/// `i = 1..=attempt + 2`, capped at [`MAX_BACKOFF`].
pub fn backoff_delay(attempt: usize) -> Duration {
    let cap = MAX_BACKOFF.as_secs();
    let terms = attempt.saturating_add(2) as u64;
    let mut total = 0u64;
    for i in 1..=terms {
        total = total.saturating_add(i * i);
        if total >= cap {
            return MAX_BACKOFF;
        }
    }
    Duration::from_secs(total)
}

/// Sleeps for `delay`, returning early with `Cancelled` if the token fires.
pub(crate) async fn sleep_with_cancellation<E>(
    delay: Duration,
    cancellation: Option<&CancellationToken>,
) -> Result<(), RetryError<E>> {
    match cancellation {
        Some(token) => tokio::select! {
            _ = token.cancelled() => Err(RetryError::Cancelled),
            _ = sleep(delay) => Ok(()),
        },
        None => {
            sleep(delay).await;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    #[derive(Debug)]
    struct Boom;

    impl Display for Boom {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("boom")
        }
    }

    #[test]
    fn backoff_is_monotonic_and_capped() {
        assert_eq!(backoff_delay(1), Duration::from_secs(14));
        assert_eq!(backoff_delay(2), MAX_BACKOFF);
        let mut previous = Duration::ZERO;
        for attempt in 1..64 {
            let delay = backoff_delay(attempt);
            assert!(delay >= previous);
            assert!(delay <= MAX_BACKOFF);
            previous = delay;
        }
        assert_eq!(backoff_delay(usize::MAX), MAX_BACKOFF);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_third_call_after_two_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let started = Instant::now();

        let result: Result<Option<&str>, RetryError<Boom>> =
            retry(RetryPolicy::new("test", 3), |_| {
                let calls = calls.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Ok(Some(RetryOutcome::Failure(None)))
                    } else {
                        Ok(Some(RetryOutcome::Success("done")))
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), Some("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(14 + 30));
        assert!(elapsed < Duration::from_secs(14 + 30 + 1));
    }

    #[tokio::test(start_paused = true)]
    async fn error_propagates_only_after_final_attempt() {
        let calls = Arc::new(AtomicUsize::new(0));

        let result: Result<Option<()>, RetryError<Boom>> =
            retry(RetryPolicy::new("test", 2), |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Boom)
                }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Operation(Boom))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn absent_outcomes_exhaust_to_none() {
        let calls = Arc::new(AtomicUsize::new(0));

        let result: Result<Option<u32>, RetryError<Boom>> =
            retry(RetryPolicy::new("test", 3), |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                }
            })
            .await;

        assert_eq!(result.unwrap(), None);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_returns_last_failure_value() {
        let result: Result<Option<u32>, RetryError<Boom>> =
            retry(RetryPolicy::new("test", 1), |attempt| async move {
                Ok(Some(RetryOutcome::Failure(Some(attempt as u32))))
            })
            .await;

        assert_eq!(result.unwrap(), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn errors_then_absent_on_last_attempt_yields_none() {
        let result: Result<Option<String>, RetryError<Boom>> =
            retry(RetryPolicy::new("test", 3), |attempt| async move {
                if attempt < 4 { Err(Boom) } else { Ok(None) }
            })
            .await;

        assert_eq!(result.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn first_success_makes_no_further_calls() {
        let calls = Arc::new(AtomicUsize::new(0));
        let started = Instant::now();

        let result: Result<Option<u8>, RetryError<Boom>> =
            retry(RetryPolicy::new("test", 5), |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Some(RetryOutcome::Success(7)))
                }
            })
            .await;

        assert_eq!(result.unwrap(), Some(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });
        let started = Instant::now();

        let result: Result<Option<()>, RetryError<Boom>> =
            retry(RetryPolicy::new("test", 3).with_cancellation(&token), |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Some(RetryOutcome::Failure(None)))
                }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < backoff_delay(1));
    }
    #[tokio::test(start_paused = true)]
    async fn cancellation_drops_an_attempt_that_never_finishes() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            canceller.cancel();
        });
        let started = Instant::now();

        let result: Result<Option<()>, RetryError<Boom>> = retry(
            RetryPolicy::new("test", 3)
                .with_cancellation(&token)
                .with_context("Hanging", "slow.example"),
            |_| std::future::pending(),
        )
        .await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
        assert_eq!(started.elapsed(), Duration::from_secs(60));
    }

    #[test]
    fn context_is_attached_to_the_policy() {
        let policy = RetryPolicy::new("poll", 0).with_context("VirusTotal", "a.example");
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.scanner, Some("VirusTotal"));
        assert_eq!(policy.domain, Some("a.example"));
    }
}
