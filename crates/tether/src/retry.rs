// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bounded retries with exponential backoff and jitter.

use std::any::type_name;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use recoverable::{Recovery, RecoveryKind};
use tick::Clock;
use tracing::Level;

use crate::config::RetryConfig;
use crate::error::{Classification, ConfigError, Error};
use crate::rnd::Rnd;

type Classify<E> = Arc<dyn Fn(&E) -> Classification + Send + Sync>;
type Observer = Arc<dyn Fn(&RetryAttempt) + Send + Sync>;

/// Retries an asynchronous operation while it fails with transient errors.
///
/// Attempt `0` is the first, unconditional call. After a transient failure of
/// attempt `n` the policy waits `min(base_delay * multiplier^n, max_delay)`, or a
/// uniformly random duration in `[0, that]` when jitter is enabled, and tries again
/// until `max_attempts` calls were made. The last error is returned unchanged.
/// Failures classified as [`Classification::Terminal`] or [`Classification::Excluded`]
/// are returned right away.
///
/// The policy is cheap to clone; clones share their [`RetryStats`].
///
/// # Examples
///
/// ```
/// use tether::{Error, RetryConfig, RetryPolicy};
/// use tick::Clock;
///
/// # async fn example(clock: Clock) -> Result<(), Error> {
/// let retry = RetryPolicy::new(RetryConfig::default(), clock)?;
/// let value = retry.execute(|| async { Ok::<_, Error>(42) }).await?;
/// assert_eq!(value, 42);
/// # Ok(())
/// # }
/// ```
pub struct RetryPolicy<E = Error> {
    config: RetryConfig,
    clock: Clock,
    classify: Classify<E>,
    label: fn(&E) -> &'static str,
    rnd: Rnd,
    on_retry: Option<Observer>,
    stats: Arc<Counters>,
}

impl RetryPolicy<Error> {
    /// Creates a policy for the crate's [`Error`], retrying the kinds listed in
    /// [`RetryConfig::retryable`].
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when `config` is out of bounds.
    pub fn new(config: RetryConfig, clock: Clock) -> Result<Self, ConfigError> {
        let retryable = config.retryable.clone();

        Self::with_classifier(config, clock, move |error: &Error| {
            let kind = error.kind();
            if kind.is_retryable() && retryable.contains(&kind) {
                Classification::Transient
            } else {
                Classification::Terminal
            }
        })
        .map(|policy| policy.with_label(|error| error.kind().as_str()))
    }
}

impl<E: Recovery + 'static> RetryPolicy<E> {
    /// Creates a policy that retries errors whose recovery kind is [`RecoveryKind::Retry`].
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when `config` is out of bounds.
    pub fn from_recovery(config: RetryConfig, clock: Clock) -> Result<Self, ConfigError> {
        Self::with_classifier(config, clock, |error: &E| match error.recovery().kind() {
            RecoveryKind::Retry => Classification::Transient,
            _ => Classification::Terminal,
        })
    }
}

impl<E> RetryPolicy<E> {
    /// Creates a policy that classifies failures with `classify`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when `config` is out of bounds.
    pub fn with_classifier(
        config: RetryConfig,
        clock: Clock,
        classify: impl Fn(&E) -> Classification + Send + Sync + 'static,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            config,
            clock,
            classify: Arc::new(classify),
            label: |_| type_name::<E>(),
            rnd: Rnd::default(),
            on_retry: None,
            stats: Arc::default(),
        })
    }

    /// Registers an observer that is invoked before every backoff wait.
    #[must_use]
    pub fn on_retry(mut self, observer: impl Fn(&RetryAttempt) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(observer));
        self
    }

    fn with_label(mut self, label: fn(&E) -> &'static str) -> Self {
        self.label = label;
        self
    }

    #[cfg(test)]
    pub(crate) fn with_rnd(mut self, rnd: Rnd) -> Self {
        self.rnd = rnd;
        self
    }

    /// The configuration the policy was built from.
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// The backoff before the retry that follows a failure of `attempt`, without jitter.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let max = self.config.max_delay;
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);

        #[expect(clippy::cast_precision_loss, reason = "delays are far below 2^52 nanoseconds")]
        let (scaled, ceiling) = (
            self.config.base_delay.as_nanos() as f64 * self.config.multiplier.powi(exponent),
            max.as_nanos() as f64,
        );

        if !scaled.is_finite() || scaled >= ceiling {
            return max;
        }

        #[expect(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            reason = "scaled is non-negative and below max_delay"
        )]
        let nanos = scaled as u64;

        Duration::from_nanos(nanos).min(max)
    }

    /// Runs `operation` until it succeeds, fails permanently or attempts run out.
    ///
    /// # Errors
    ///
    /// Returns the error of the last attempt.
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.stats.executions.fetch_add(1, Ordering::Relaxed);
        let mut attempt = 0_u32;

        loop {
            self.stats.attempts.fetch_add(1, Ordering::Relaxed);

            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if (self.classify)(&error) != Classification::Transient {
                return Err(error);
            }

            let failure = (self.label)(&error);
            let next = attempt.saturating_add(1);

            if next >= self.config.max_attempts {
                self.stats.exhausted.fetch_add(1, Ordering::Relaxed);

                tracing::event!(
                    name: "tether.retry.exhausted",
                    Level::WARN,
                    retry.attempts = next,
                    retry.failure = failure,
                );

                return Err(error);
            }

            let delay = self.jittered(self.backoff(attempt));
            let record = RetryAttempt { attempt, delay, failure };

            self.stats.retries.fetch_add(1, Ordering::Relaxed);
            self.stats
                .total_delay_nanos
                .fetch_add(u64::try_from(delay.as_nanos()).unwrap_or(u64::MAX), Ordering::Relaxed);

            tracing::event!(
                name: "tether.retry",
                Level::INFO,
                retry.attempt = attempt,
                retry.delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                retry.failure = failure,
            );

            if let Some(observer) = &self.on_retry {
                observer(&record);
            }

            self.clock.delay(delay).await;
            attempt = next;
        }
    }

    /// A snapshot of the cumulative counters.
    #[must_use]
    pub fn stats(&self) -> RetryStats {
        RetryStats {
            executions: self.stats.executions.load(Ordering::Relaxed),
            attempts: self.stats.attempts.load(Ordering::Relaxed),
            retries: self.stats.retries.load(Ordering::Relaxed),
            exhausted: self.stats.exhausted.load(Ordering::Relaxed),
            total_delay: Duration::from_nanos(self.stats.total_delay_nanos.load(Ordering::Relaxed)),
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.config.jitter {
            self.rnd.jitter(delay)
        } else {
            delay
        }
    }
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            clock: self.clock.clone(),
            classify: Arc::clone(&self.classify),
            label: self.label,
            rnd: self.rnd,
            on_retry: self.on_retry.clone(),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<E> fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .field("rnd", &self.rnd)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// A single retry decision, handed to the [`RetryPolicy::on_retry`] observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct RetryAttempt {
    /// Zero-based index of the attempt that failed.
    pub attempt: u32,
    /// How long the policy waits before the next attempt.
    pub delay: Duration,
    /// The [`ErrorKind`][crate::ErrorKind] name, or the type name for foreign errors.
    pub failure: &'static str,
}

/// Cumulative retry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct RetryStats {
    /// Calls to [`RetryPolicy::execute`].
    pub executions: u64,
    /// Invocations of the wrapped operation, first attempts included.
    pub attempts: u64,
    /// Attempts that were followed by a backoff.
    pub retries: u64,
    /// Executions that ran out of attempts.
    pub exhausted: u64,
    /// Sum of all backoff waits.
    pub total_delay: Duration,
}

#[derive(Debug, Default)]
struct Counters {
    executions: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    exhausted: AtomicU64,
    total_delay_nanos: AtomicU64,
}
