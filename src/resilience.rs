// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry and backoff for backing store connections.
//!
//! - [`RetryConfig`]: attempt budget and exponential backoff parameters
//! - [`Backoff`]: stateful delay sequence driven by a `RetryConfig`
//!
//! The Redis transport uses [`RetryConfig::startup`] for its initial connect,
//! so a wrong URL is reported within seconds, and [`RetryConfig::reconnect`]
//! for re-establishing pub/sub subscriptions, which never gives up.

use std::time::Duration;

/// Connection retry behaviour.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries allowed after the first attempt. `usize::MAX` retries forever.
    pub max_attempts: usize,

    /// Delay before the second attempt.
    pub initial_delay: Duration,

    /// Ceiling for exponential backoff.
    pub max_delay: Duration,

    /// Delay multiplier applied after each failed attempt.
    pub backoff_factor: f64,

    /// Timeout for each individual connection attempt.
    pub connection_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Bounded retry for the first connection of a server process.
    ///
    /// ```text
    /// Attempt  Delay
    /// -------  -----
    /// 1        250ms
    /// 2        500ms
    /// 3        1s
    /// ...
    /// 8        10s (cap), then give up
    /// ```
    pub fn startup() -> Self {
        Self {
            max_attempts: 8,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(5),
        }
    }

    /// Unbounded retry for subscriptions that must survive a Redis restart.
    pub fn reconnect() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(10),
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_millis(500),
        }
    }

    /// Delay to wait after the given (1-indexed) failed attempt.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt <= 1 {
            return std::cmp::min(self.initial_delay, self.max_delay);
        }

        let exponent = (attempt - 1).min(i32::MAX as usize) as i32;
        let delay_secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs)
    }

    /// Start a fresh backoff sequence.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            config: self.clone(),
            attempt: 0,
        }
    }
}

/// Iterates the delays of a [`RetryConfig`], stopping once the attempt budget
/// is spent.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    attempt: usize,
}

impl Backoff {
    /// Number of failures recorded so far.
    pub fn attempts(&self) -> usize {
        self.attempt
    }

    /// Forget previous failures (call after a success).
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_attempts {
            return None;
        }
        self.attempt += 1;
        Some(self.config.delay_for_attempt(self.attempt))
    }
}
