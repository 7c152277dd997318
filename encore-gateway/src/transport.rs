//! Retrying transport.
//!
//! Bounds each outbound attempt with a hard deadline, classifies failures as
//! transient or fatal, and retries transient ones with exponential backoff.
//! Caller cancellation is checked before and raced against every attempt
//! and backoff sleep; it is never retried and surfaces as
//! `TransportError::Cancelled`, never as a network failure.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use encore_core::{TransportConfig, TransportError};
use tokio_util::sync::CancellationToken;

// ============================================================================
// POLICY
// ============================================================================

/// Timeout and backoff settings for one logical call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Deadline for a single attempt.
    pub attempt_timeout: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`,
    /// capped at `max_delay`.
    pub fn next_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Total attempts including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }
}

impl From<&TransportConfig> for RetryPolicy {
    fn from(config: &TransportConfig) -> Self {
        Self {
            attempt_timeout: config.attempt_timeout,
            max_retries: config.max_retries,
            base_delay: config.base_delay,
            max_delay: config.max_delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&TransportConfig::default())
    }
}

// ============================================================================
// SLEEPER
// ============================================================================

/// Backoff sleep, injectable so tests can observe the delays.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, delay: Duration);
}

/// Sleeps on the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

// ============================================================================
// ATTEMPTS
// ============================================================================

/// Why a single attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptFailure {
    /// The deadline fired before the response arrived.
    TimedOut,
    /// Reset, aborted mid-stream, or another recoverable network fault.
    Transient(String),
    /// Not worth repeating.
    Fatal(String),
}

impl AttemptFailure {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, AttemptFailure::Fatal(_))
    }
}

/// Run `attempt` until it succeeds, fails fatally, exhausts the retry
/// budget, or `cancel` fires. Each attempt as a whole is bounded by
/// `policy.attempt_timeout`.
///
/// `attempt` receives the 1-based attempt number.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    cancel: &CancellationToken,
    mut attempt: F,
) -> Result<T, TransportError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, AttemptFailure>>,
{
    let deadline = policy.attempt_timeout;
    retry_attempts(policy, sleeper, cancel, |number| {
        let pending = attempt(number);
        async move {
            tokio::time::timeout(deadline, pending)
                .await
                .unwrap_or_else(|_elapsed| Err(AttemptFailure::TimedOut))
        }
    })
    .await
}

/// The retry loop without a deadline of its own. Attempts bound whichever
/// part of their work needs one, see [`head_deadline`].
pub async fn retry_attempts<T, F, Fut>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    cancel: &CancellationToken,
    mut attempt: F,
) -> Result<T, TransportError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, AttemptFailure>>,
{
    let max_attempts = policy.max_attempts();
    let mut number = 1u32;

    loop {
        if cancel.is_cancelled() {
            tracing::debug!(attempt = number, "Call cancelled before attempt");
            return Err(TransportError::Cancelled);
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(attempt = number, "Call cancelled during attempt");
                return Err(TransportError::Cancelled);
            }
            outcome = attempt(number) => outcome,
        };

        let failure = match outcome {
            Ok(value) => return Ok(value),
            Err(AttemptFailure::Fatal(reason)) => {
                tracing::debug!(attempt = number, %reason, "Call failed, not retryable");
                return Err(TransportError::Fatal { reason });
            }
            Err(failure) => failure,
        };

        if number >= max_attempts {
            tracing::warn!(attempts = number, failure = ?failure, "Retries exhausted");
            return Err(match failure {
                AttemptFailure::TimedOut => TransportError::TimedOut { attempts: number },
                AttemptFailure::Transient(reason) | AttemptFailure::Fatal(reason) => {
                    TransportError::Network {
                        attempts: number,
                        reason,
                    }
                }
            });
        }

        let delay = policy.next_delay(number);
        tracing::debug!(
            attempt = number,
            delay_ms = delay.as_millis() as u64,
            failure = ?failure,
            "Retrying after transient failure"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(attempt = number, "Call cancelled during backoff");
                return Err(TransportError::Cancelled);
            }
            _ = sleeper.sleep(delay) => {}
        }

        number += 1;
    }
}

// ============================================================================
// CLASSIFICATION
// ============================================================================

/// Bound the wait for a response head. The body is read afterwards,
/// outside this deadline.
pub async fn head_deadline<T, Fut>(deadline: Duration, head: Fut) -> Result<T, AttemptFailure>
where
    Fut: Future<Output = Result<T, reqwest::Error>>,
{
    match tokio::time::timeout(deadline, head).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => Err(classify(&e)),
        Err(_elapsed) => Err(AttemptFailure::TimedOut),
    }
}

/// Classify a reqwest failure.
///
/// Timeouts, connect failures, body read failures and resets are transient;
/// builder, redirect and decode problems are fatal.
pub fn classify(error: &reqwest::Error) -> AttemptFailure {
    if error.is_timeout() {
        return AttemptFailure::TimedOut;
    }
    if error.is_builder() || error.is_redirect() || error.is_decode() {
        return AttemptFailure::Fatal(error.to_string());
    }
    if error.is_connect() || error.is_body() || error.is_request() || has_transient_cause(error) {
        return AttemptFailure::Transient(error.to_string());
    }
    AttemptFailure::Fatal(error.to_string())
}

fn has_transient_cause(error: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = Some(error);
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ) {
                return true;
            }
        }
        if is_transient_message(&err.to_string()) {
            return true;
        }
        source = err.source();
    }
    false
}

/// Messages that indicate the peer dropped the connection mid-exchange.
pub fn is_transient_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    ["connection reset", "connection closed", "terminated", "incomplete message", "broken pipe"]
        .iter()
        .any(|needle| message.contains(needle))
}
