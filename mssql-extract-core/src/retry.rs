//! Retry wrapper for database round trips.
//!
//! Errors are classified by [`DbErrorKind`] against an allow-list. Retryable
//! errors back off exponentially until the attempt cap. A login/handshake
//! timeout is retried on a separate path bounded by wall-clock time instead of
//! attempts, since a server that is still starting up or failing over can take
//! minutes to accept logins.

use crate::error::{DbErrorKind, ExtractorError, Result};
use futures::future::BoxFuture;
use regex::Regex;
use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::time::Instant;

static HANDSHAKE_TIMEOUT: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)(login timeout expired|handshake.*(timed out|timeout)|timeout.*handshake)").ok()
});

/// Whether an error is the handshake timeout that gets deadline-based retries.
pub fn is_handshake_timeout(error: &ExtractorError) -> bool {
    HANDSHAKE_TIMEOUT
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(&error.detailed_message()))
}

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Retries after the initial attempt
    pub max_retries: u32,
    /// Delay before the first retry; doubled on every further retry
    pub base_interval: Duration,
    /// Upper bound for a single delay
    pub max_interval: Duration,
    /// Wall-clock budget for handshake timeouts
    pub handshake_deadline: Duration,
    /// Error kinds retried on the regular path
    pub retryable_kinds: Vec<DbErrorKind>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            handshake_deadline: Duration::from_secs(15 * 60),
            retryable_kinds: vec![
                DbErrorKind::Transport,
                DbErrorKind::Protocol,
                DbErrorKind::Transient,
            ],
        }
    }
}

impl RetryConfig {
    /// Set max retries (builder pattern)
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set base and maximum delay (builder pattern)
    pub fn with_intervals(mut self, base: Duration, max: Duration) -> Self {
        self.base_interval = base;
        self.max_interval = max;
        self
    }

    /// Set the handshake timeout budget (builder pattern)
    pub fn with_handshake_deadline(mut self, deadline: Duration) -> Self {
        self.handshake_deadline = deadline;
        self
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(31));
        self.base_interval
            .saturating_mul(factor)
            .min(self.max_interval)
    }
}

/// Progress of one retried call.
#[derive(Debug, Clone)]
pub struct RetryState {
    /// Attempts made so far, including the one in flight
    pub attempt: u32,
    pub started_at: Instant,
    /// Message of the most recent failure
    pub last_error: Option<String>,
}

impl RetryState {
    fn new() -> Self {
        Self {
            attempt: 0,
            started_at: Instant::now(),
            last_error: None,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Applies a [`RetryConfig`] to async operations.
#[derive(Debug, Clone, Default)]
pub struct RetryProxy {
    config: RetryConfig,
}

impl RetryProxy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Same policy with a different attempt cap.
    pub fn with_max_retries(&self, max_retries: u32) -> Self {
        Self::new(self.config.clone().with_max_retries(max_retries))
    }

    /// Runs `operation` against `target`, retrying per policy.
    ///
    /// The target is handed to every attempt, so an operation can use a
    /// connection that a previous attempt replaced.
    ///
    /// # Errors
    /// Returns the first non-retryable error, or the last error once the
    /// attempt cap or handshake deadline is exhausted
    pub async fn call<T, R, F>(&self, target: &mut T, mut operation: F) -> Result<R>
    where
        T: ?Sized + Send,
        F: for<'a> FnMut(&'a mut T) -> BoxFuture<'a, Result<R>>,
    {
        let mut state = RetryState::new();
        loop {
            state.attempt += 1;
            match operation(target).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    let delay = self.on_failure(&mut state, error)?;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Runs an operation that needs no mutable target.
    ///
    /// # Errors
    /// Same as [`RetryProxy::call`]
    pub async fn run<R, F, Fut>(&self, mut operation: F) -> Result<R>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let mut state = RetryState::new();
        loop {
            state.attempt += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    let delay = self.on_failure(&mut state, error)?;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Records a failure and decides whether to retry.
    fn on_failure(&self, state: &mut RetryState, error: ExtractorError) -> Result<Duration> {
        let Some(delay) = self.next_delay(&error, state) else {
            if state.attempt > 1 {
                tracing::warn!(
                    attempts = state.attempt,
                    elapsed_ms = state.elapsed().as_millis(),
                    "Giving up after repeated failures"
                );
            }
            return Err(error);
        };

        let message = error.detailed_message();
        tracing::warn!(
            attempt = state.attempt,
            delay_ms = delay.as_millis(),
            error = %message,
            "Retryable database error"
        );
        state.last_error = Some(message);
        Ok(delay)
    }

    /// Delay before the next attempt, or `None` to give up.
    pub fn next_delay(&self, error: &ExtractorError, state: &RetryState) -> Option<Duration> {
        let delay = self.config.delay_for_attempt(state.attempt);

        if is_handshake_timeout(error) {
            return (state.elapsed() < self.config.handshake_deadline).then_some(delay);
        }

        let retryable = error
            .db_kind()
            .is_some_and(|kind| self.config.retryable_kinds.contains(&kind));
        (retryable && state.attempt <= self.config.max_retries).then_some(delay)
    }
}
