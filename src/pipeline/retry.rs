//! Retry controller shared by every scrape attempt.
//!
//! Delay before the retry that follows failed attempt `n` (0-based) is
//! `uniform(base_min, base_max) + n * uniform(step_min, step_max)`.

use crate::core::error::ScrapeError;
use backoff::backoff::Backoff;
use rand::distr::{Distribution, Uniform};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_min: Duration,
    pub base_max: Duration,
    pub step_min: Duration,
    pub step_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_min: Duration::from_secs(3),
            base_max: Duration::from_secs(8),
            step_min: Duration::from_secs(1),
            step_max: Duration::from_secs(3),
        }
    }
}

impl RetryPolicy {
    /// Same retry budget, zero back-off.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_min: Duration::ZERO,
            base_max: Duration::ZERO,
            step_min: Duration::ZERO,
            step_max: Duration::ZERO,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Randomized delay after failed attempt `attempt` (0-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        sample_between(self.base_min, self.base_max)
            + sample_between(self.step_min, self.step_max) * attempt
    }

    pub fn backoff(&self) -> JitteredBackoff {
        JitteredBackoff {
            policy: self.clone(),
            retries: 0,
        }
    }
}

pub(crate) fn sample_between(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    match Uniform::new_inclusive(min.as_secs_f64(), max.as_secs_f64()) {
        Ok(dist) => Duration::from_secs_f64(dist.sample(&mut rand::rng())),
        Err(_) => min,
    }
}

/// `backoff` adapter: yields one delay per allowed retry, then `None`.
#[derive(Debug, Clone)]
pub struct JitteredBackoff {
    policy: RetryPolicy,
    retries: u32,
}

impl Backoff for JitteredBackoff {
    fn next_backoff(&mut self) -> Option<Duration> {
        if self.retries >= self.policy.max_retries {
            return None;
        }
        let delay = self.policy.delay_after(self.retries);
        self.retries += 1;
        Some(delay)
    }

    fn reset(&mut self) {
        self.retries = 0;
    }
}

/// What the caller should do after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Back-off elapsed; start the next attempt.
    Retry,
    /// Terminal error or budget exhausted.
    GiveUp,
    /// Cancellation observed; no further attempt may start.
    Cancelled,
}

/// Per-task attempt bookkeeping.
///
/// ```ignore
/// let mut retry = RetryController::new(&policy, &cancel);
/// while let Some(attempt) = retry.begin_attempt() {
///     match try_once(attempt).await {
///         Ok(v) => return Ok(v),
///         Err(e) => match retry.after_failure(&e).await { RetryDecision::Retry => continue, _ => break },
///     }
/// }
/// ```
pub struct RetryController<'a> {
    backoff: JitteredBackoff,
    cancel: &'a CancellationToken,
    max_attempts: u32,
    attempts: u32,
}

impl<'a> RetryController<'a> {
    pub fn new(policy: &RetryPolicy, cancel: &'a CancellationToken) -> Self {
        Self {
            backoff: policy.backoff(),
            cancel,
            max_attempts: policy.max_attempts(),
            attempts: 0,
        }
    }

    /// Start the next attempt; returns its 0-based index, or `None` when the
    /// budget is spent or the run was cancelled.
    pub fn begin_attempt(&mut self) -> Option<u32> {
        if self.cancel.is_cancelled() || self.attempts >= self.max_attempts {
            return None;
        }
        let attempt = self.attempts;
        self.attempts += 1;
        Some(attempt)
    }

    /// Decide on a failed attempt; sleeps the back-off (interruptibly) on `Retry`.
    pub async fn after_failure(&mut self, error: &ScrapeError) -> RetryDecision {
        if self.cancel.is_cancelled() {
            return RetryDecision::Cancelled;
        }
        if !error.is_retryable() {
            return RetryDecision::GiveUp;
        }
        let Some(delay) = self.backoff.next_backoff() else {
            return RetryDecision::GiveUp;
        };
        debug!("retrying in {:.1}s after: {}", delay.as_secs_f64(), error);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => RetryDecision::Cancelled,
            _ = tokio::time::sleep(delay) => RetryDecision::Retry,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn retries_used(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_stay_within_bounds() {
        let policy = RetryPolicy::default();
        for attempt in 0..3u32 {
            for _ in 0..50 {
                let d = policy.delay_after(attempt);
                assert!(d >= Duration::from_secs(3) + Duration::from_secs(1) * attempt);
                assert!(d <= Duration::from_secs(8) + Duration::from_secs(3) * attempt);
            }
        }
    }

    #[test]
    fn backoff_yields_exactly_max_retries_delays() {
        let mut b = RetryPolicy::immediate(2).backoff();
        assert_eq!(b.next_backoff(), Some(Duration::ZERO));
        assert_eq!(b.next_backoff(), Some(Duration::ZERO));
        assert_eq!(b.next_backoff(), None);
        b.reset();
        assert!(b.next_backoff().is_some());
    }

    #[tokio::test]
    async fn attempts_never_exceed_budget() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::immediate(2);
        let mut retry = RetryController::new(&policy, &cancel);
        let err = ScrapeError::Transport("reset".into());
        let mut seen = Vec::new();
        while let Some(attempt) = retry.begin_attempt() {
            seen.push(attempt);
            if retry.after_failure(&err).await != RetryDecision::Retry {
                break;
            }
        }
        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(retry.retries_used(), 2);
    }

    #[tokio::test]
    async fn terminal_errors_are_not_retried() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::immediate(3);
        let mut retry = RetryController::new(&policy, &cancel);
        assert_eq!(retry.begin_attempt(), Some(0));
        let decision = retry.after_failure(&ScrapeError::Session("gone".into())).await;
        assert_eq!(decision, RetryDecision::GiveUp);
        assert_eq!(retry.retries_used(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_sleep_is_interrupted_by_cancel() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::default();
        let mut retry = RetryController::new(&policy, &cancel);
        retry.begin_attempt();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = tokio::time::Instant::now();
        let decision = retry.after_failure(&ScrapeError::NoData).await;
        assert_eq!(decision, RetryDecision::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(retry.begin_attempt(), None);
    }
}
