// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Inbound update handling.
//!
//! Every process publishes its flushed entities on the update channel and
//! every process (itself included) receives them. A message is:
//!
//! - **suppressed** when its origin is this process: our own write is
//!   already in memory, and re-merging it could roll back a mutation made
//!   after the flush
//! - **rejected** when the payload does not decode; the sender never
//!   redelivers, so it is logged and dropped
//! - **applied** otherwise, by merging into `get(id)`. The merged entity is
//!   not marked dirty: the data is already durable at its origin, and
//!   writing it back would loop the update around the network.
//!
//! A merge that leaves the entity removable is the origin announcing a
//! purge. The local copy is dropped unless it has unflushed changes of its
//! own, in which case our next flush settles it.

use super::Repository;
use crate::entity::{decode, Entity};
use crate::metrics;
use crate::transport::Subscription;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

/// What happened to one inbound broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastOutcome {
    Applied,
    Suppressed,
    Rejected,
}

impl BroadcastOutcome {
    fn as_str(self) -> &'static str {
        match self {
            BroadcastOutcome::Applied => "applied",
            BroadcastOutcome::Suppressed => "suppressed",
            BroadcastOutcome::Rejected => "rejected",
        }
    }
}

impl<T: Entity> Repository<T> {
    /// Handle one update received on the update channel.
    pub fn apply_broadcast(&self, origin: &str, payload: &[u8]) -> BroadcastOutcome {
        let outcome = self.classify_and_apply(origin, payload);

        let counter = match outcome {
            BroadcastOutcome::Applied => &self.counters.applied,
            BroadcastOutcome::Suppressed => &self.counters.suppressed,
            BroadcastOutcome::Rejected => &self.counters.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::record_broadcast(&self.config.update_channel, outcome.as_str());
        outcome
    }

    fn classify_and_apply(&self, origin: &str, payload: &[u8]) -> BroadcastOutcome {
        if origin == self.transport.server_id() {
            trace!("Suppressing own broadcast");
            return BroadcastOutcome::Suppressed;
        }

        let remote: T = match decode(payload, &self.config.update_channel) {
            Ok(remote) => remote,
            Err(e) => {
                warn!(origin = %origin, error = %e, "Dropping undecodable broadcast");
                return BroadcastOutcome::Rejected;
            }
        };

        let id = remote.id().to_string();
        let cell = self.get(&id);
        cell.merge(remote);
        if cell.is_removable() {
            let dropped = self
                .entities
                .remove_if(&id, |_, current| Arc::ptr_eq(current, &cell) && !current.is_dirty())
                .is_some();
            debug!(id = %id, origin = %origin, dropped, "Merged remote removal");
        } else {
            debug!(id = %id, origin = %origin, "Merged remote update");
        }
        BroadcastOutcome::Applied
    }
}

/// Broadcast listener task. Exits on shutdown, when the subscription closes,
/// or once the repository is dropped.
pub(super) async fn run_listener<T: Entity>(
    repo: Weak<Repository<T>>,
    mut subscription: Subscription,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!(channel = %subscription.channel(), "Broadcast listener started");

    loop {
        tokio::select! {
            message = subscription.next() => {
                let Some(message) = message else {
                    warn!(channel = %subscription.channel(), "Update subscription closed");
                    break;
                };
                let Some(repo) = repo.upgrade() else { break };
                repo.apply_broadcast(&message.origin, &message.payload);
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    debug!("Broadcast listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boost::{Boost, CurrencyType, PlayerBoosts};
    use crate::config::RepositoryConfig;
    use crate::transport::MemoryBus;
    use std::time::Duration;

    async fn open(bus: &MemoryBus, server: &str) -> Arc<Repository<PlayerBoosts>> {
        Repository::open(
            RepositoryConfig::new("boosts", "boosts:update").with_flush_interval(Duration::from_secs(60)),
            Arc::new(bus.connect(server)),
        )
        .await
        .unwrap()
    }

    fn payload(id: &str, value: f64) -> Vec<u8> {
        let mut boosts = PlayerBoosts::new(id);
        boosts.add_boost(Boost::new(CurrencyType::Money, value).expiring_in(Duration::from_secs(60)));
        serde_json::to_vec(&boosts).unwrap()
    }

    #[tokio::test]
    async fn test_remote_update_is_merged_clean() {
        let bus = MemoryBus::new();
        let repo = open(&bus, "b").await;

        let outcome = repo.apply_broadcast("a", &payload("p1", 1.0));

        assert_eq!(outcome, BroadcastOutcome::Applied);
        let cell = repo.get("p1");
        assert!(!cell.is_dirty());
        assert_eq!(cell.access(|b| b.boost("miner", CurrencyType::Money, 1.0)), 2.0);
    }

    #[tokio::test]
    async fn test_remote_removal_drops_clean_copy() {
        let bus = MemoryBus::new();
        let repo = open(&bus, "b").await;
        repo.apply_broadcast("a", &payload("p1", 1.0));
        assert!(repo.contains("p1"));

        let cleared = serde_json::to_vec(&PlayerBoosts::new("p1")).unwrap();
        let outcome = repo.apply_broadcast("a", &cleared);

        assert_eq!(outcome, BroadcastOutcome::Applied);
        assert!(!repo.contains("p1"));
        assert_eq!(repo.get("p1").access(|b| b.boost("miner", CurrencyType::Money, 1.0)), 1.0);
    }

    #[tokio::test]
    async fn test_remote_removal_keeps_dirty_copy() {
        let bus = MemoryBus::new();
        let repo = open(&bus, "b").await;
        let cell = repo.get("p1");
        cell.update(|b| b.add_boost(Boost::new(CurrencyType::Exp, 0.5).expiring_in(Duration::from_secs(60))));

        let cleared = serde_json::to_vec(&PlayerBoosts::new("p1")).unwrap();
        repo.apply_broadcast("a", &cleared);

        assert!(repo.contains("p1"));
        assert!(cell.is_dirty());
    }

    #[tokio::test]
    async fn test_own_update_is_suppressed() {
        let bus = MemoryBus::new();
        let repo = open(&bus, "a").await;
        let cell = repo.get("p1");
        cell.access(|b| b.boost("miner", CurrencyType::Money, 1.0));

        let outcome = repo.apply_broadcast("a", &payload("p1", 9.0));

        assert_eq!(outcome, BroadcastOutcome::Suppressed);
        assert!(cell.read(|b| b.cache_is_warm("miner", CurrencyType::Money)));
        assert!(cell.read(|b| b.boosts().is_empty()));
        assert_eq!(repo.stats().broadcasts_suppressed, 1);
    }

    #[tokio::test]
    async fn test_garbage_is_rejected() {
        let bus = MemoryBus::new();
        let repo = open(&bus, "b").await;

        assert_eq!(repo.apply_broadcast("a", b"\x00\x01"), BroadcastOutcome::Rejected);
        assert!(repo.is_empty());
        assert_eq!(repo.stats().broadcasts_rejected, 1);
    }

    #[tokio::test]
    async fn test_listener_applies_published_updates() {
        let bus = MemoryBus::new();
        let repo = open(&bus, "b").await;

        bus.deliver("boosts:update", "a", payload("p1", 1.0));

        for _ in 0..50 {
            if repo.contains("p1") {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(repo.stats().broadcasts_applied, 1);
    }
}
