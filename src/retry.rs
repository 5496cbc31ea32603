//! Keyed retry manager with exponential backoff, jitter and a circuit breaker.
//!
//! Every fallible mailbox operation runs under a key (`imap:<department>`).
//! Consecutive failures under the same key grow the delay until
//! `max_retries` is reached, at which point the key is blocked until it is
//! explicitly reset.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::constants::{
    DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_BASE_DELAY_MS, DEFAULT_JITTER_FACTOR, DEFAULT_MAX_DELAY_MS,
    DEFAULT_MAX_RETRIES, RETRYABLE_ERROR_CODES,
};

/// Errors that can be classified by a short machine-readable code.
///
/// The code is matched against the retryable allow-list by substring, so a
/// bare message works as well as a structured code.
pub trait ErrorCode {
    fn code(&self) -> Cow<'_, str>;
}

impl ErrorCode for &str {
    fn code(&self) -> Cow<'_, str> {
        Cow::Borrowed(*self)
    }
}

impl ErrorCode for String {
    fn code(&self) -> Cow<'_, str> {
        Cow::Borrowed(self.as_str())
    }
}

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Consecutive failures before a key is blocked
    pub max_retries: u32,
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Upper bound for the computed delay (before jitter)
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Fraction of the delay added as random jitter
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            ..Self::default()
        }
    }

    /// Disable jitter, mostly useful for deterministic tests.
    pub fn without_jitter(mut self) -> Self {
        self.jitter_factor = 0.0;
        self
    }
}

/// One recorded failure.
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub delay: Duration,
    pub recorded_at: DateTime<Utc>,
    pub error: Option<String>,
    at: Instant,
}

#[derive(Debug, Default)]
struct RetryState {
    attempts: Vec<RetryAttempt>,
    next_retry_at: Option<Instant>,
    blocked: bool,
    consecutive_failures: u32,
}

/// Serializable view of one key's retry state.
#[derive(Debug, Clone, Serialize)]
pub struct RetryStats {
    pub key: String,
    pub total_attempts: usize,
    pub consecutive_failures: u32,
    pub blocked: bool,
    pub next_retry_in_ms: Option<u64>,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub average_delay_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// The error is not on the retryable allow-list; nothing was recorded.
    #[error("{0}")]
    Permanent(E),
    #[error("operation {key} failed after {attempts} attempts; last error: {last}")]
    Exhausted { key: String, attempts: u32, last: E },
    #[error("operation {key} is blocked after repeated failures")]
    Blocked { key: String },
}

impl<E> RetryError<E> {
    /// The underlying operation error, if one was produced.
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Permanent(e) | RetryError::Exhausted { last: e, .. } => Some(e),
            RetryError::Blocked { .. } => None,
        }
    }
}

pub struct RetryManager {
    config: RetryConfig,
    states: Mutex<HashMap<String, RetryState>>,
}

impl fmt::Debug for RetryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for RetryManager {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryManager {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    fn states(&self) -> std::sync::MutexGuard<'_, HashMap<String, RetryState>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether an error's code matches the retryable allow-list.
    pub fn is_retryable<E: ErrorCode + ?Sized>(&self, error: &E) -> bool {
        let code = error.code();
        RETRYABLE_ERROR_CODES
            .iter()
            .any(|retryable| code.contains(retryable))
    }

    /// Backoff delay for the `attempt`-th failure (1-based), without jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let base_ms = self.config.base_delay.as_millis() as f64;
        let max_ms = self.config.max_delay.as_millis() as f64;
        let raw = base_ms * self.config.backoff_multiplier.powi(exponent);
        let capped = if raw.is_finite() { raw.min(max_ms) } else { max_ms };
        Duration::from_millis(capped as u64)
    }

    fn with_jitter(&self, delay: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return delay;
        }
        let fraction = match getrandom::u64() {
            Ok(r) => r as f64 / u64::MAX as f64,
            Err(_) => 0.0,
        };
        let jitter_ms = delay.as_millis() as f64 * self.config.jitter_factor * fraction;
        delay + Duration::from_millis(jitter_ms as u64)
    }

    pub fn can_retry(&self, key: &str) -> bool {
        let states = self.states();
        let Some(state) = states.get(key) else {
            return true;
        };
        if state.blocked || state.consecutive_failures >= self.config.max_retries {
            return false;
        }
        match state.next_retry_at {
            Some(at) => Instant::now() >= at,
            None => true,
        }
    }

    pub fn is_blocked(&self, key: &str) -> bool {
        self.states().get(key).is_some_and(|s| s.blocked)
    }

    /// Record the outcome of one attempt.
    ///
    /// `None` means success and clears the key. On failure the attempt is
    /// appended with its computed (jittered) delay, which is returned.
    pub fn record_attempt(&self, key: &str, error: Option<&str>) -> Option<Duration> {
        let mut states = self.states();

        let Some(error) = error else {
            states.remove(key);
            return None;
        };

        let state = states.entry(key.to_string()).or_default();
        let attempt = state.attempts.len() as u32 + 1;
        let delay = self.with_jitter(self.delay_for_attempt(attempt));
        let now = Instant::now();

        state.attempts.push(RetryAttempt {
            attempt,
            delay,
            recorded_at: Utc::now(),
            error: Some(error.to_string()),
            at: now,
        });
        state.consecutive_failures += 1;
        state.next_retry_at = Some(now + delay);

        if state.consecutive_failures >= self.config.max_retries && !state.blocked {
            state.blocked = true;
            tracing::warn!(
                "Retry key {} blocked after {} consecutive failures",
                key,
                state.consecutive_failures
            );
        }

        Some(delay)
    }

    /// Remaining wait before the key may be retried, if any.
    pub fn time_until_next_retry(&self, key: &str) -> Option<Duration> {
        let states = self.states();
        let at = states.get(key)?.next_retry_at?;
        let remaining = at.saturating_duration_since(Instant::now());
        (!remaining.is_zero()).then_some(remaining)
    }

    /// Clear the key, lifting a blocked circuit.
    pub fn reset_retry_state(&self, key: &str) {
        if self.states().remove(key).is_some() {
            tracing::info!("Retry state reset for {}", key);
        }
    }

    /// Remove the key without logging.
    pub fn clear_retry_state(&self, key: &str) {
        self.states().remove(key);
    }

    pub fn attempt_history(&self, key: &str) -> Vec<RetryAttempt> {
        self.states()
            .get(key)
            .map(|s| s.attempts.clone())
            .unwrap_or_default()
    }

    pub fn key_stats(&self, key: &str) -> Option<RetryStats> {
        let states = self.states();
        states.get(key).map(|state| stats_for(key, state))
    }

    /// Stats for every tracked key, sorted by key.
    pub fn stats(&self) -> Vec<RetryStats> {
        let states = self.states();
        let mut all: Vec<RetryStats> = states
            .iter()
            .map(|(key, state)| stats_for(key, state))
            .collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    /// Drop keys whose most recent attempt is at least `max_age` old.
    /// Blocked keys are kept; only a reset lifts them. Returns the number
    /// of keys removed.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let mut states = self.states();
        let before = states.len();
        states.retain(|_, state| {
            state.blocked
                || state
                    .attempts
                    .last()
                    .is_some_and(|last| last.at.elapsed() < max_age)
        });
        let removed = before - states.len();
        if removed > 0 {
            tracing::debug!("Retry cleanup removed {} stale keys", removed);
        }
        removed
    }

    /// Run `operation` under `key` until it succeeds, fails permanently, or
    /// the key's circuit opens.
    ///
    /// Errors off the allow-list are returned immediately without touching
    /// the key's history. The sleep between attempts yields to the runtime.
    pub async fn execute_with_retry<F, Fut, T, E>(
        &self,
        key: &str,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ErrorCode + fmt::Display,
    {
        loop {
            if self.is_blocked(key) {
                return Err(RetryError::Blocked {
                    key: key.to_string(),
                });
            }
            if let Some(wait) = self.time_until_next_retry(key) {
                tokio::time::sleep(wait).await;
            }

            match operation().await {
                Ok(value) => {
                    self.record_attempt(key, None);
                    return Ok(value);
                }
                Err(e) if !self.is_retryable(&e) => {
                    return Err(RetryError::Permanent(e));
                }
                Err(e) => {
                    let message = e.to_string();
                    let delay = self
                        .record_attempt(key, Some(&message))
                        .unwrap_or(self.config.base_delay);
                    let failures = self
                        .key_stats(key)
                        .map(|s| s.consecutive_failures)
                        .unwrap_or(0);

                    if self.is_blocked(key) {
                        return Err(RetryError::Exhausted {
                            key: key.to_string(),
                            attempts: failures,
                            last: e,
                        });
                    }

                    tracing::warn!(
                        "Operation {} failed (attempt {}/{}): {}. Retrying in {:?}...",
                        key,
                        failures,
                        self.config.max_retries,
                        message,
                        delay
                    );

                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

fn stats_for(key: &str, state: &RetryState) -> RetryStats {
    let total_delay: u128 = state.attempts.iter().map(|a| a.delay.as_millis()).sum();
    let average_delay_ms = if state.attempts.is_empty() {
        0
    } else {
        (total_delay / state.attempts.len() as u128) as u64
    };
    let last = state.attempts.last();

    RetryStats {
        key: key.to_string(),
        total_attempts: state.attempts.len(),
        consecutive_failures: state.consecutive_failures,
        blocked: state.blocked,
        next_retry_in_ms: state
            .next_retry_at
            .map(|at| at.saturating_duration_since(Instant::now()).as_millis() as u64)
            .filter(|ms| *ms > 0),
        last_error: last.and_then(|a| a.error.clone()),
        last_attempt_at: last.map(|a| a.recorded_at),
        average_delay_ms,
    }
}
