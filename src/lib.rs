//! # crossync
//!
//! Cross-process state synchronization for fleets of game servers sharing one
//! Redis.
//!
//! ## Architecture
//!
//! Each server process runs a [`SyncNode`]. Nodes never talk to each other
//! directly; everything goes through a shared pub/sub + hash store:
//!
//! ```text
//! ┌──────────── server a ────────────┐        ┌──────────── server b ────────────┐
//! │ Repository<T>  RequestChannel    │        │ Repository<T>  RequestChannel    │
//! │ CommandDispatcher                │        │ CommandDispatcher                │
//! │        │ Transport               │        │        │ Transport               │
//! └────────┼─────────────────────────┘        └────────┼─────────────────────────┘
//!          ▼                                           ▼
//!   ┌───────────────────────────────────────────────────────────────┐
//!   │ Redis: HSET/HGET/HGETALL/HDEL buckets, PUBLISH/SUBSCRIBE chans │
//!   └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Three Patterns
//!
//! 1. **Replicated repository** ([`Repository`]): entities are loaded on
//!    start, dirty ones are flushed on an interval and broadcast, remote
//!    broadcasts are merged (our own are suppressed)
//! 2. **Correlated request/response** ([`RequestChannel`]): ask every
//!    server, take the first answer, fail with a timeout after 5 seconds
//! 3. **Deferred command dispatch** ([`CommandDispatcher`]): run a command
//!    on the right servers, waiting up to 5 seconds for a player to arrive
//!
//! ## Usage
//!
//! ```rust,no_run
//! use crossync::boost::{Boost, CurrencyType, PlayerBoosts};
//! use crossync::{NodeConfig, RepositoryConfig, SyncNode};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> crossync::Result<()> {
//!     let node = SyncNode::connect_redis(NodeConfig::for_testing("survival-1")).await?;
//!     node.start()?;
//!
//!     let boosts = node
//!         .open_repository::<PlayerBoosts>(RepositoryConfig::new("boosts", "boosts:update"))
//!         .await?;
//!     boosts.get("069a79f4-44e9-4726-a5be-fca90e38aaf5").update(|b| {
//!         b.add_boost(Boost::new(CurrencyType::Money, 1.0).expiring_in(Duration::from_secs(3600)))
//!     });
//!
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod boost;
pub mod circuit_breaker;
pub mod command;
pub mod config;
pub mod coordinator;
pub mod entity;
pub mod error;
pub mod metrics;
pub mod repository;
pub mod request;
pub mod resilience;
pub mod transport;

// Re-exports for convenience
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, StoreCircuit};
pub use command::{
    CommandDispatcher, CommandEnvelope, CommandHost, CommandOutcome, DispatchScope, ResolvedTarget, SenderKind,
    TargetSelector,
};
pub use config::{CommandConfig, NodeConfig, RedisConfig, RepositoryConfig, RequestChannelConfig, RequestConfig};
pub use coordinator::{ComponentHealth, HealthCheck, NodeState, SyncNode};
pub use entity::{Entity, EntityCell};
pub use error::{Result, SyncError};
pub use repository::{BroadcastOutcome, FlushReport, Repository, RepositoryStats};
pub use request::{responder_fn, Payload, RequestChannel, Responder, ResponderFn};
pub use resilience::RetryConfig;
pub use transport::{MemoryBus, MemoryTransport, RedisTransport, SharedTransport, Transport};
