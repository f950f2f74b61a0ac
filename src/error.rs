// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the synchronization core.
//!
//! Errors are categorized by their source (Redis, serialization, wire frames,
//! request timeouts) and carry enough context to be logged on their own.
//! Most of them never reach callers: the flush, broadcast and dispatch paths
//! log and drop on failure. They surface from constructors
//! ([`Repository::open`](crate::Repository::open)), from explicit calls such
//! as [`Repository::flush_now`](crate::Repository::flush_now), and from
//! [`RequestChannel::request`](crate::RequestChannel::request).
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Redis` | Yes | Network errors, timeouts, connection failures |
//! | `Store` | Yes | Non-Redis backing store failure |
//! | `CircuitOpen` | Yes | Store circuit breaker rejected the call |
//! | `RequestTimeout` | Yes | No response before the deadline |
//! | `Config` | No | Configuration invalid |
//! | `Serialization` | No | Payload could not be encoded/decoded |
//! | `Frame` | No | Malformed wire frame |
//! | `InvalidState` | No | Lifecycle state machine violation |
//! | `Shutdown` | No | Component is shutting down |

use thiserror::Error;

/// Result type alias for synchronization operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can occur in the synchronization core.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Redis connection or command error.
    #[error("Redis error ({operation}): {message}")]
    Redis {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// Backing store failure from a non-Redis transport.
    #[error("Store error ({operation}): {message}")]
    Store { operation: String, message: String },

    /// Invalid or missing configuration.
    ///
    /// Not retryable - fix the configuration and reopen.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A payload could not be serialized or deserialized.
    ///
    /// Not retryable - the data is malformed or schema-incompatible.
    #[error("Serialization error ({context}): {message}")]
    Serialization { context: String, message: String },

    /// A wire frame could not be decoded.
    #[error("Frame error: {0}")]
    Frame(String),

    /// A correlated request was swept before any response arrived.
    #[error("Request {correlation_id} timed out after {waited_ms}ms")]
    RequestTimeout {
        correlation_id: uuid::Uuid,
        waited_ms: u64,
    },

    /// The store circuit breaker is open and rejected the call.
    #[error("Circuit open: {0}")]
    CircuitOpen(String),

    /// Lifecycle state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,
}

impl SyncError {
    /// Create a Redis error from a redis::RedisError
    pub fn redis(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a Redis error without source
    pub fn redis_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a store error for non-Redis transports
    pub fn store(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Wrap a serde_json error with the context it occurred in
    pub fn serialization(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Serialization {
            context: context.into(),
            message: source.to_string(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Redis { .. } => true,
            Self::Store { .. } => true,
            Self::CircuitOpen(_) => true,
            Self::RequestTimeout { .. } => true,
            Self::Config(_) => false,
            Self::Serialization { .. } => false,
            Self::Frame(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
        }
    }
}

impl From<redis::RedisError> for SyncError {
    fn from(e: redis::RedisError) -> Self {
        Self::redis("unknown", e)
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization("unknown", e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_redis() {
        let err = SyncError::redis_msg("HSET", "connection reset");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("HSET"));
    }

    #[test]
    fn test_is_retryable_store() {
        let err = SyncError::store("hash_set", "injected failure");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("hash_set"));
    }

    #[test]
    fn test_request_timeout_formatting() {
        let id = uuid::Uuid::new_v4();
        let err = SyncError::RequestTimeout {
            correlation_id: id,
            waited_ms: 5000,
        };
        assert!(err.is_retryable());
        let msg = err.to_string();
        assert!(msg.contains(&id.to_string()));
        assert!(msg.contains("5000ms"));
    }

    #[test]
    fn test_not_retryable_config() {
        let err = SyncError::Config("storage_key must not be empty".to_string());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_serialization_from_serde() {
        let bad = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err = SyncError::serialization("boosts:p1", bad);
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("boosts:p1"));
    }

    #[test]
    fn test_not_retryable_frame() {
        let err = SyncError::Frame("truncated origin".to_string());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_retryable_invalid_state() {
        let err = SyncError::InvalidState {
            expected: "Created".to_string(),
            actual: "Stopped".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Created"));
        assert!(err.to_string().contains("Stopped"));
    }

    #[test]
    fn test_not_retryable_shutdown() {
        assert!(!SyncError::Shutdown.is_retryable());
    }

    #[test]
    fn test_every_kind_matches_the_table() {
        let cases = [
            (SyncError::redis_msg("GET", "reset"), true),
            (SyncError::store("hash_get", "down"), true),
            (SyncError::CircuitOpen("boosts:writes".to_string()), true),
            (SyncError::RequestTimeout { correlation_id: uuid::Uuid::nil(), waited_ms: 5000 }, true),
            (SyncError::Config("bad".to_string()), false),
            (SyncError::Serialization { context: "c".to_string(), message: "m".to_string() }, false),
            (SyncError::Frame("short".to_string()), false),
            (SyncError::InvalidState { expected: "a".to_string(), actual: "b".to_string() }, false),
            (SyncError::Shutdown, false),
        ];
        for (err, retryable) in cases {
            assert_eq!(err.is_retryable(), retryable, "{err}");
        }
    }

    #[test]
    fn test_redis_error_formatting() {
        let err = SyncError::Redis {
            operation: "PUBLISH".to_string(),
            message: "timeout".to_string(),
            source: None,
        };
        let msg = err.to_string();
        assert!(msg.contains("Redis error"));
        assert!(msg.contains("PUBLISH"));
        assert!(msg.contains("timeout"));
    }
}
