// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker protecting the backing store.
//!
//! Flush cycles run every few seconds for every repository. When the store is
//! down, each cycle would otherwise fire one failing write per dirty entity.
//! The breaker trips after a run of failures and rejects calls until the
//! recovery timeout passes; a rejected write is handled exactly like a failed
//! one (the entity stays dirty and the next cycle retries).
//!
//! Uses the `recloser` crate.
//!
//! # States
//!
//! - **Closed**: Normal operation, calls pass through
//! - **Open**: Store unhealthy, calls fail fast
//! - **HalfOpen**: Probing whether the store recovered

use crate::error::SyncError;
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Error type for circuit-protected operations.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The breaker is open and the call was not attempted.
    #[error("circuit breaker open, request rejected")]
    Rejected,

    /// The underlying operation failed.
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> CircuitError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, CircuitError::Rejected)
    }
}

impl CircuitError<SyncError> {
    /// Flatten into the crate error, naming the breaker on rejection.
    pub fn into_sync_error(self, circuit: &str) -> SyncError {
        match self {
            CircuitError::Rejected => SyncError::CircuitOpen(circuit.to_string()),
            CircuitError::Inner(e) => e,
        }
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Calls observed in the closed state before the error rate is evaluated.
    pub window: u32,
    /// Failure ratio (0.0 - 1.0) over the window that trips the breaker.
    pub error_rate: f32,
    /// Successful probes in half-open required to close again.
    pub probe_calls: u32,
    /// How long the breaker stays open before probing.
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            window: 10,
            error_rate: 0.5,
            probe_calls: 2,
            recovery_timeout: Duration::from_secs(15),
        }
    }
}

impl CircuitConfig {
    /// Trips quickly; used for store writes issued by flush cycles.
    #[must_use]
    pub fn for_writes() -> Self {
        Self {
            window: 5,
            error_rate: 0.6,
            probe_calls: 2,
            recovery_timeout: Duration::from_secs(10),
        }
    }

    /// Tolerant; bootstrap loads are rare and worth attempting.
    #[must_use]
    pub fn for_reads() -> Self {
        Self {
            window: 20,
            error_rate: 0.8,
            probe_calls: 1,
            recovery_timeout: Duration::from_secs(5),
        }
    }
}

/// A named circuit breaker with call counters.
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,

    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(config.error_rate.clamp(0.0, 1.0))
            .closed_len(config.window.max(1) as usize)
            .half_open_len(config.probe_calls.max(1) as usize)
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute an async operation through the breaker.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        match self.inner.call(f()).await {
            Ok(result) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                Ok(result)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                warn!(circuit = %self.name, "Circuit breaker rejected call (open)");
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.name, "Circuit call failed");
                Err(CircuitError::Inner(e))
            }
        }
    }

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Rough open/closed signal from the counters (for health output).
    #[must_use]
    pub fn is_likely_open(&self) -> bool {
        self.rejections() > 0 && self.rejections() > self.successes()
    }
}

/// Breakers for the two directions of backing store traffic.
pub struct StoreCircuit {
    /// hash_set / hash_delete issued by flush cycles
    pub writes: CircuitBreaker,
    /// hash_get_all issued by bootstrap loads
    pub reads: CircuitBreaker,
}

impl StoreCircuit {
    /// Breakers named after the storage key they protect.
    pub fn new(storage_key: &str) -> Self {
        Self::with_configs(storage_key, CircuitConfig::for_writes(), CircuitConfig::for_reads())
    }

    pub fn with_configs(storage_key: &str, writes: CircuitConfig, reads: CircuitConfig) -> Self {
        Self {
            writes: CircuitBreaker::new(format!("{}_writes", storage_key), writes),
            reads: CircuitBreaker::new(format!("{}_reads", storage_key), reads),
        }
    }

    pub fn any_open(&self) -> bool {
        self.writes.is_likely_open() || self.reads.is_likely_open()
    }
}
