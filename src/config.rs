// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the synchronization core.
//!
//! All configuration is static for the lifetime of the component it
//! configures. It can be constructed programmatically or deserialized from
//! JSON; durations are human-readable strings (`"5s"`, `"250ms"`) and fall
//! back to their documented default when unparseable.
//!
//! # Configuration Structure
//!
//! ```text
//! NodeConfig
//! ├── server_id: String            # This process's identity
//! ├── redis: RedisConfig           # Backing store connection
//! ├── requests: RequestConfig      # Correlated request timeouts
//! └── commands: CommandConfig      # Deferred command dispatch
//!
//! RepositoryConfig                 # One per replicated entity type
//! RequestChannelConfig             # One per request/response pair
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "server_id": "lobby-1",
//!   "redis": { "url": "redis://127.0.0.1:6379", "key_prefix": "net:" },
//!   "requests": { "timeout": "5s", "sweep_interval": "1s" },
//!   "commands": { "channel": "crossync:commands", "target_timeout": "5000ms" }
//! }
//! ```

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn parse_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

// ═══════════════════════════════════════════════════════════════════════════════
// NodeConfig: one per process
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to [`SyncNode::new()`](crate::SyncNode::new).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Stable identity of this process.
    /// Used for broadcast self-suppression and command scope filtering.
    pub server_id: String,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub requests: RequestConfig,

    #[serde(default)]
    pub commands: CommandConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            server_id: "local.dev.server".to_string(),
            redis: RedisConfig::default(),
            requests: RequestConfig::default(),
            commands: CommandConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Create a minimal config for testing.
    pub fn for_testing(server_id: &str) -> Self {
        Self {
            server_id: server_id.to_string(),
            ..Default::default()
        }
    }

    /// Reject configurations that cannot identify this process.
    pub fn validate(&self) -> Result<()> {
        if self.server_id.trim().is_empty() {
            return Err(SyncError::Config("server_id must not be empty".to_string()));
        }
        self.commands.validate()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RedisConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Redis connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Example: `"redis://cache.internal:6379"`
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Prefix prepended to every hash bucket and channel name.
    /// Lets several networks share one Redis.
    #[serde(default)]
    pub key_prefix: String,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: String::new(),
        }
    }
}

impl RedisConfig {
    /// Apply the key prefix to a bucket or channel name.
    pub fn namespaced(&self, name: &str) -> String {
        format!("{}{}", self.key_prefix, name)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RepositoryConfig: one per replicated entity type
// ═══════════════════════════════════════════════════════════════════════════════

/// Settings for a single replicated repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Hash bucket holding one field per entity id.
    pub storage_key: String,

    /// Broadcast topic carrying serialized entity updates.
    pub update_channel: String,

    /// Read the whole bucket into memory on open.
    #[serde(default = "default_true")]
    pub load_all_on_start: bool,

    /// How often dirty entities are flushed (e.g. `"5s"`).
    #[serde(default = "default_flush_interval")]
    pub flush_interval: String,
}

fn default_true() -> bool {
    true
}

fn default_flush_interval() -> String {
    "5s".to_string()
}

impl RepositoryConfig {
    pub fn new(storage_key: impl Into<String>, update_channel: impl Into<String>) -> Self {
        Self {
            storage_key: storage_key.into(),
            update_channel: update_channel.into(),
            load_all_on_start: true,
            flush_interval: default_flush_interval(),
        }
    }

    /// Set the flush interval from a Duration.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = humantime::format_duration(interval).to_string();
        self
    }

    pub fn with_load_all(mut self, load_all_on_start: bool) -> Self {
        self.load_all_on_start = load_all_on_start;
        self
    }

    /// Parse the flush interval, falling back to 5 seconds.
    pub fn flush_interval_duration(&self) -> Duration {
        let interval = parse_or(&self.flush_interval, Duration::from_secs(5));
        if interval.is_zero() {
            Duration::from_secs(5)
        } else {
            interval
        }
    }

    /// Fail fast on a config that cannot address the store or the channel.
    pub fn validate(&self) -> Result<()> {
        if self.storage_key.trim().is_empty() {
            return Err(SyncError::Config("storage_key must not be empty".to_string()));
        }
        if self.update_channel.trim().is_empty() {
            return Err(SyncError::Config("update_channel must not be empty".to_string()));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Request/response
// ═══════════════════════════════════════════════════════════════════════════════

/// Timeouts shared by every request channel on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    /// Pending requests older than this are swept and fail with a timeout.
    #[serde(default = "default_request_timeout")]
    pub timeout: String,

    /// How often the pending map is swept.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: String,
}

fn default_request_timeout() -> String {
    "5s".to_string()
}

fn default_sweep_interval() -> String {
    "1s".to_string()
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout: default_request_timeout(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

impl RequestConfig {
    pub fn timeout_duration(&self) -> Duration {
        parse_or(&self.timeout, Duration::from_secs(5))
    }

    pub fn sweep_interval_duration(&self) -> Duration {
        let interval = parse_or(&self.sweep_interval, Duration::from_secs(1));
        if interval.is_zero() {
            Duration::from_secs(1)
        } else {
            interval
        }
    }
}

/// Channel pair for one request/response protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestChannelConfig {
    pub request_channel: String,
    pub response_channel: String,
}

impl RequestChannelConfig {
    pub fn new(request_channel: impl Into<String>, response_channel: impl Into<String>) -> Self {
        Self {
            request_channel: request_channel.into(),
            response_channel: response_channel.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.request_channel.trim().is_empty() || self.response_channel.trim().is_empty() {
            return Err(SyncError::Config(
                "request and response channels must not be empty".to_string(),
            ));
        }
        if self.request_channel == self.response_channel {
            return Err(SyncError::Config(format!(
                "request and response channels must differ (both are {:?})",
                self.request_channel
            )));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CommandConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Deferred command dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    #[serde(default = "default_command_channel")]
    pub channel: String,

    /// How long a player-targeted command waits for its target to appear.
    #[serde(default = "default_target_timeout")]
    pub target_timeout: String,

    /// Resolution loop period (one server tick).
    #[serde(default = "default_tick_interval")]
    pub tick_interval: String,
}

fn default_command_channel() -> String {
    "crossync:commands".to_string()
}

fn default_target_timeout() -> String {
    "5000ms".to_string()
}

fn default_tick_interval() -> String {
    "50ms".to_string()
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            channel: default_command_channel(),
            target_timeout: default_target_timeout(),
            tick_interval: default_tick_interval(),
        }
    }
}

impl CommandConfig {
    pub fn target_timeout_duration(&self) -> Duration {
        parse_or(&self.target_timeout, Duration::from_millis(5000))
    }

    pub fn tick_interval_duration(&self) -> Duration {
        let tick = parse_or(&self.tick_interval, Duration::from_millis(50));
        if tick.is_zero() {
            Duration::from_millis(50)
        } else {
            tick
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.channel.trim().is_empty() {
            return Err(SyncError::Config("command channel must not be empty".to_string()));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
