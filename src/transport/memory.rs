// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process transport.
//!
//! A [`MemoryBus`] stands in for the shared Redis; every
//! [`MemoryTransport`] connected to it stands in for one server process.
//! Used for single-process deployments and for multi-process tests.
//!
//! The bus records write/delete/publish counts and can be told to fail
//! store reads or writes, which is how flush retry behaviour is tested.

use super::{BoxFuture, Message, Subscription, Transport};
use crate::error::SyncError;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

#[derive(Default)]
struct BusInner {
    hashes: DashMap<String, HashMap<String, Vec<u8>>>,
    channels: DashMap<String, Vec<mpsc::UnboundedSender<Message>>>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    writes: AtomicUsize,
    deletes: AtomicUsize,
    publishes: AtomicUsize,
}

/// Shared in-memory store and channel hub.
///
/// Cloning is cheap and yields a handle to the same bus.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<BusInner>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new "process" with the given identity.
    pub fn connect(&self, server_id: impl Into<String>) -> MemoryTransport {
        MemoryTransport {
            server_id: server_id.into(),
            bus: self.clone(),
        }
    }

    /// Make every subsequent `hash_set`/`hash_delete` fail.
    pub fn fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `hash_get`/`hash_get_all` fail.
    pub fn fail_reads(&self, fail: bool) {
        self.inner.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Successful `hash_set` calls so far.
    pub fn write_count(&self) -> usize {
        self.inner.writes.load(Ordering::SeqCst)
    }

    /// Successful `hash_delete` calls so far.
    pub fn delete_count(&self) -> usize {
        self.inner.deletes.load(Ordering::SeqCst)
    }

    /// `publish` calls so far.
    pub fn publish_count(&self) -> usize {
        self.inner.publishes.load(Ordering::SeqCst)
    }

    /// Read a stored field without going through a transport.
    pub fn stored(&self, bucket: &str, field: &str) -> Option<Vec<u8>> {
        self.inner
            .hashes
            .get(bucket)
            .and_then(|hash| hash.get(field).cloned())
    }

    /// Number of fields in a bucket.
    pub fn bucket_len(&self, bucket: &str) -> usize {
        self.inner.hashes.get(bucket).map(|hash| hash.len()).unwrap_or(0)
    }

    /// Seed a raw field (bypasses fault injection and counters).
    pub fn seed(&self, bucket: &str, field: &str, value: impl Into<Vec<u8>>) {
        self.inner
            .hashes
            .entry(bucket.to_string())
            .or_default()
            .insert(field.to_string(), value.into());
    }

    /// Deliver a message as if `origin` had published it.
    pub fn deliver(&self, channel: &str, origin: &str, payload: Vec<u8>) -> usize {
        let message = Message {
            channel: channel.to_string(),
            origin: origin.to_string(),
            payload,
        };
        self.inner.publishes.fetch_add(1, Ordering::SeqCst);

        let Some(mut subscribers) = self.inner.channels.get_mut(channel) else {
            return 0;
        };
        subscribers.retain(|tx| tx.send(message.clone()).is_ok());
        subscribers.len()
    }

    /// Live subscriptions on a channel.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .channels
            .get(channel)
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

/// One process attached to a [`MemoryBus`].
#[derive(Clone)]
pub struct MemoryTransport {
    server_id: String,
    bus: MemoryBus,
}

impl MemoryTransport {
    pub fn bus(&self) -> &MemoryBus {
        &self.bus
    }
}

impl Transport for MemoryTransport {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    fn publish(&self, channel: &str, payload: Vec<u8>) -> BoxFuture<'_, ()> {
        let delivered = self.bus.deliver(channel, &self.server_id, payload);
        trace!(channel = %channel, delivered, "memory publish");
        Box::pin(async { Ok(()) })
    }

    fn subscribe(&self, channel: &str) -> BoxFuture<'_, Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.bus
            .inner
            .channels
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        let subscription = Subscription::new(channel, rx);
        Box::pin(async move { Ok(subscription) })
    }

    fn hash_set(&self, bucket: &str, field: &str, value: Vec<u8>) -> BoxFuture<'_, ()> {
        let result = if self.bus.inner.fail_writes.load(Ordering::SeqCst) {
            Err(SyncError::store("hash_set", "injected write failure"))
        } else {
            self.bus.seed(bucket, field, value);
            self.bus.inner.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        };
        Box::pin(async move { result })
    }

    fn hash_get(&self, bucket: &str, field: &str) -> BoxFuture<'_, Option<Vec<u8>>> {
        let result = if self.bus.inner.fail_reads.load(Ordering::SeqCst) {
            Err(SyncError::store("hash_get", "injected read failure"))
        } else {
            Ok(self.bus.stored(bucket, field))
        };
        Box::pin(async move { result })
    }

    fn hash_get_all(&self, bucket: &str) -> BoxFuture<'_, HashMap<String, Vec<u8>>> {
        let result = if self.bus.inner.fail_reads.load(Ordering::SeqCst) {
            Err(SyncError::store("hash_get_all", "injected read failure"))
        } else {
            Ok(self
                .bus
                .inner
                .hashes
                .get(bucket)
                .map(|hash| hash.value().clone())
                .unwrap_or_default())
        };
        Box::pin(async move { result })
    }

    fn hash_delete(&self, bucket: &str, field: &str) -> BoxFuture<'_, bool> {
        let result = if self.bus.inner.fail_writes.load(Ordering::SeqCst) {
            Err(SyncError::store("hash_delete", "injected write failure"))
        } else {
            let existed = self
                .bus
                .inner
                .hashes
                .get_mut(bucket)
                .map(|mut hash| hash.remove(field).is_some())
                .unwrap_or(false);
            self.bus.inner.deletes.fetch_add(1, Ordering::SeqCst);
            Ok(existed)
        };
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber_including_self() {
        let bus = MemoryBus::new();
        let a = bus.connect("a");
        let b = bus.connect("b");

        let mut sub_a = a.subscribe("updates").await.unwrap();
        let mut sub_b = b.subscribe("updates").await.unwrap();

        a.publish("updates", b"hello".to_vec()).await.unwrap();

        let got_a = sub_a.next().await.unwrap();
        let got_b = sub_b.next().await.unwrap();
        assert_eq!(got_a.origin, "a");
        assert_eq!(got_b.origin, "a");
        assert_eq!(got_b.payload, b"hello".to_vec());
        assert_eq!(got_b.channel, "updates");
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let bus = MemoryBus::new();
        let a = bus.connect("a");
        let mut sub = a.subscribe("one").await.unwrap();

        a.publish("two", b"x".to_vec()).await.unwrap();
        a.publish("one", b"y".to_vec()).await.unwrap();

        assert_eq!(sub.next().await.unwrap().payload, b"y".to_vec());
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let bus = MemoryBus::new();
        let a = bus.connect("a");
        let sub = a.subscribe("updates").await.unwrap();
        assert_eq!(bus.subscriber_count("updates"), 1);

        drop(sub);
        assert_eq!(bus.deliver("updates", "a", vec![]), 0);
        assert_eq!(bus.subscriber_count("updates"), 0);
    }

    #[tokio::test]
    async fn test_hash_operations_share_one_store() {
        let bus = MemoryBus::new();
        let a = bus.connect("a");
        let b = bus.connect("b");

        a.hash_set("ranks", "p1", b"admin".to_vec()).await.unwrap();
        assert_eq!(b.hash_get("ranks", "p1").await.unwrap(), Some(b"admin".to_vec()));
        assert_eq!(b.hash_get_all("ranks").await.unwrap().len(), 1);

        assert!(b.hash_delete("ranks", "p1").await.unwrap());
        assert!(!a.hash_delete("ranks", "p1").await.unwrap());
        assert_eq!(a.hash_get("ranks", "p1").await.unwrap(), None);
        assert_eq!(bus.write_count(), 1);
        assert_eq!(bus.delete_count(), 2);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let bus = MemoryBus::new();
        let a = bus.connect("a");

        bus.fail_writes(true);
        assert!(a.hash_set("ranks", "p1", vec![1]).await.is_err());
        assert!(a.hash_delete("ranks", "p1").await.is_err());
        assert_eq!(bus.write_count(), 0);

        bus.fail_writes(false);
        bus.fail_reads(true);
        assert!(a.hash_set("ranks", "p1", vec![1]).await.is_ok());
        assert!(a.hash_get_all("ranks").await.is_err());
        assert!(a.hash_get("ranks", "p1").await.is_err());
    }

    #[tokio::test]
    async fn test_get_all_missing_bucket_is_empty() {
        let bus = MemoryBus::new();
        let a = bus.connect("a");
        assert!(a.hash_get_all("nothing").await.unwrap().is_empty());
    }
}
