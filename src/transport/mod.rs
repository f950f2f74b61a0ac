// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The backing transport: pub/sub channels plus a namespaced hash store.
//!
//! The synchronization core never talks to Redis directly; it consumes the
//! [`Transport`] trait. Two implementations ship with the crate:
//!
//! - [`RedisTransport`]: production transport over Redis `PUBLISH`/`SUBSCRIBE`
//!   and `HSET`/`HGET`/`HGETALL`/`HDEL`
//! - [`MemoryTransport`]: in-process transport where every handle connected to
//!   the same [`MemoryBus`] behaves like a separate server sharing one store
//!
//! # Delivery Semantics
//!
//! Delivery is best-effort, at-least-once per subscriber and unordered
//! across channels. Every subscriber receives every message, including the
//! publisher itself: each [`Message`] carries the publisher's `origin` so the
//! consumer can suppress its own traffic.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> crossync::Result<()> {
//! use crossync::transport::{MemoryBus, Transport};
//!
//! let bus = MemoryBus::new();
//! let lobby = bus.connect("lobby-1");
//! let survival = bus.connect("survival-1");
//!
//! let mut sub = survival.subscribe("ranks:update").await?;
//! lobby.publish("ranks:update", b"{}".to_vec()).await?;
//!
//! let msg = sub.next().await.expect("bus open");
//! assert_eq!(msg.origin, "lobby-1");
//! # Ok(())
//! # }
//! ```

mod frame;
mod memory;
mod redis_pubsub;

pub use frame::{decode_frame, encode_frame, MAX_ORIGIN_LEN};
pub use memory::{MemoryBus, MemoryTransport};
pub use redis_pubsub::RedisTransport;

use crate::error::Result;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Type alias for boxed transport futures (keeps the trait object-safe).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Shared handle to a transport, as held by repositories and channels.
pub type SharedTransport = Arc<dyn Transport>;

/// A message delivered on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Channel name as passed to `subscribe` (without any key prefix).
    pub channel: String,
    /// `server_id` of the publishing process.
    pub origin: String,
    pub payload: Vec<u8>,
}

/// Receiving end of a channel subscription.
///
/// Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, rx: mpsc::UnboundedReceiver<Message>) -> Self {
        Self {
            channel: channel.into(),
            rx,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wait for the next message. `None` once the transport side is gone.
    pub async fn next(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

/// Publish/subscribe plus hash store, as consumed by the synchronization core.
///
/// Implementations must be cheap to share (`Arc<dyn Transport>`) and safe to
/// call concurrently. Self-suppression is the consumer's responsibility; a
/// transport delivers to every subscriber, the publisher included.
pub trait Transport: Send + Sync + 'static {
    /// Stable identity of this process, stamped on every published message.
    fn server_id(&self) -> &str;

    /// Publish a payload on a channel.
    fn publish(&self, channel: &str, payload: Vec<u8>) -> BoxFuture<'_, ()>;

    /// Subscribe to a channel. Messages published after this resolves are
    /// delivered to the returned subscription.
    fn subscribe(&self, channel: &str) -> BoxFuture<'_, Subscription>;

    /// Set one field of a hash bucket.
    fn hash_set(&self, bucket: &str, field: &str, value: Vec<u8>) -> BoxFuture<'_, ()>;

    /// Read one field of a hash bucket.
    fn hash_get(&self, bucket: &str, field: &str) -> BoxFuture<'_, Option<Vec<u8>>>;

    /// Read every field of a hash bucket.
    fn hash_get_all(&self, bucket: &str) -> BoxFuture<'_, HashMap<String, Vec<u8>>>;

    /// Delete one field of a hash bucket. Returns whether it existed.
    fn hash_delete(&self, bucket: &str, field: &str) -> BoxFuture<'_, bool>;
}
