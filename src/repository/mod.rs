// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replicated repository engine.
//!
//! A [`Repository`] owns the in-memory copies of one entity type and keeps
//! them in step with the backing store and with every other process:
//!
//! ```text
//!            get()/update()                      update channel
//!   caller ───────────────► EntityCell ◄────────── merge (remote origin)
//!                               │                        ▲
//!                   flush cycle │ dirty?                 │
//!                               ▼                        │
//!                 ┌─ removable ─► HDEL + drop from memory │
//!                 └─ otherwise ─► HSET ─► PUBLISH ────────┘
//! ```
//!
//! - **Bootstrap**: on open, every field of the storage bucket is decoded
//!   into memory; undecodable records are logged and skipped
//! - **Flush**: a periodic task persists dirty entities (see [`flush`])
//! - **Broadcast**: a listener merges updates published by other
//!   processes and suppresses our own (see [`broadcast`])
//!
//! Persistence is eventual and at-least-once: a failed write leaves the
//! entity dirty and the next cycle retries it.

mod broadcast;
mod flush;

pub use broadcast::BroadcastOutcome;
pub use flush::FlushReport;

use crate::circuit_breaker::StoreCircuit;
use crate::config::RepositoryConfig;
use crate::entity::{decode, Entity, EntityCell};
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::transport::SharedTransport;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

/// How long `close()`/`restart()` wait for a periodic task to stop.
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Counters {
    flush_cycles: AtomicU64,
    written: AtomicU64,
    purged: AtomicU64,
    failed_writes: AtomicU64,
    applied: AtomicU64,
    suppressed: AtomicU64,
    rejected: AtomicU64,
    loaded: AtomicU64,
    load_skipped: AtomicU64,
}

/// Point-in-time view of a repository, for health output and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositoryStats {
    pub entities: usize,
    pub dirty: usize,
    pub flush_cycles: u64,
    pub written: u64,
    pub purged: u64,
    pub failed_writes: u64,
    pub broadcasts_applied: u64,
    pub broadcasts_suppressed: u64,
    pub broadcasts_rejected: u64,
    pub loaded: u64,
    pub load_skipped: u64,
}

/// Handles of one generation of periodic tasks.
struct TaskSet {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl TaskSet {
    async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            let abort = handle.abort_handle();
            match tokio::time::timeout(TASK_STOP_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => warn!(error = %e, "Repository task panicked"),
                Err(_) => {
                    warn!("Repository task did not stop in time, aborting");
                    abort.abort();
                }
            }
        }
    }
}

/// A replicated collection of `T`, keyed by entity id.
///
/// Constructed with [`Repository::open`], which returns an `Arc` because the
/// periodic tasks hold weak references back to it.
pub struct Repository<T: Entity> {
    config: RepositoryConfig,
    transport: SharedTransport,
    entities: DashMap<String, Arc<EntityCell<T>>>,
    circuit: StoreCircuit,
    tasks: Mutex<Option<TaskSet>>,
    closed: AtomicBool,
    counters: Counters,
}

impl<T: Entity> Repository<T> {
    /// Validate, optionally load everything from the store, subscribe to the
    /// update channel and start the flush scheduler.
    pub async fn open(config: RepositoryConfig, transport: SharedTransport) -> Result<Arc<Self>> {
        config.validate()?;

        let repo = Arc::new(Self {
            circuit: StoreCircuit::new(&config.storage_key),
            config,
            transport,
            entities: DashMap::new(),
            tasks: Mutex::new(None),
            closed: AtomicBool::new(false),
            counters: Counters::default(),
        });

        if repo.config.load_all_on_start {
            repo.load_all().await;
        }

        repo.start_tasks().await?;

        info!(
            storage_key = %repo.config.storage_key,
            update_channel = %repo.config.update_channel,
            entities = repo.len(),
            flush_interval_ms = repo.config.flush_interval_duration().as_millis() as u64,
            "Repository open"
        );
        Ok(repo)
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn storage_key(&self) -> &str {
        &self.config.storage_key
    }

    pub fn circuit(&self) -> &StoreCircuit {
        &self.circuit
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The entity for `id`, constructing an empty default if none exists.
    pub fn get(&self, id: &str) -> Arc<EntityCell<T>> {
        if let Some(cell) = self.entities.get(id) {
            return Arc::clone(cell.value());
        }
        let cell = self
            .entities
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(EntityCell::fresh(id)));
        Arc::clone(cell.value())
    }

    /// Mark an entity dirty after mutating it outside [`EntityCell::update`].
    pub fn mark_dirty(&self, id: &str) {
        self.get(id).mark_dirty();
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entities.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.entities.iter().map(|e| e.key().clone()).collect()
    }

    /// Drop the in-memory copy only. The stored record is untouched and any
    /// unflushed change is lost.
    pub fn remove_local(&self, id: &str) -> Option<Arc<EntityCell<T>>> {
        self.entities.remove(id).map(|(_, cell)| cell)
    }

    /// Re-read one record from the store and merge it into memory.
    ///
    /// Returns `Ok(None)` when the store has no record for `id`.
    pub async fn refresh(&self, id: &str) -> Result<Option<Arc<EntityCell<T>>>> {
        let key = self.config.storage_key.as_str();
        let bytes = self
            .circuit
            .reads
            .call(|| self.transport.hash_get(key, id))
            .await
            .map_err(|e| e.into_sync_error(self.circuit.reads.name()))?;

        let Some(bytes) = bytes else {
            return Ok(None);
        };
        let remote: T = decode(&bytes, id)?;
        if remote.id() != id {
            return Err(SyncError::Serialization {
                context: id.to_string(),
                message: format!("stored record carries id {:?}", remote.id()),
            });
        }
        let cell = self.get(id);
        cell.merge(remote);
        Ok(Some(cell))
    }

    pub fn stats(&self) -> RepositoryStats {
        let dirty = self.entities.iter().filter(|e| e.value().is_dirty()).count();
        let c = &self.counters;
        RepositoryStats {
            entities: self.entities.len(),
            dirty,
            flush_cycles: c.flush_cycles.load(Ordering::Relaxed),
            written: c.written.load(Ordering::Relaxed),
            purged: c.purged.load(Ordering::Relaxed),
            failed_writes: c.failed_writes.load(Ordering::Relaxed),
            broadcasts_applied: c.applied.load(Ordering::Relaxed),
            broadcasts_suppressed: c.suppressed.load(Ordering::Relaxed),
            broadcasts_rejected: c.rejected.load(Ordering::Relaxed),
            loaded: c.loaded.load(Ordering::Relaxed),
            load_skipped: c.load_skipped.load(Ordering::Relaxed),
        }
    }

    /// Read the whole storage bucket into memory.
    ///
    /// A failed read is logged and leaves the repository empty; individual
    /// records that fail to decode are skipped.
    async fn load_all(&self) {
        let key = self.config.storage_key.as_str();
        let fields = match self.circuit.reads.call(|| self.transport.hash_get_all(key)).await {
            Ok(fields) => fields,
            Err(e) => {
                let e = e.into_sync_error(self.circuit.reads.name());
                warn!(storage_key = %key, error = %e, "Bootstrap load failed, starting empty");
                return;
            }
        };

        let mut loaded = 0usize;
        let mut skipped = 0usize;
        for (field, bytes) in fields {
            match decode::<T>(&bytes, &field) {
                Ok(entity) if entity.id() == field => {
                    self.entities.insert(field, Arc::new(EntityCell::clean(entity)));
                    loaded += 1;
                }
                Ok(entity) => {
                    warn!(storage_key = %key, field = %field, id = %entity.id(), "Stored record id does not match its field, skipping");
                    skipped += 1;
                }
                Err(e) => {
                    warn!(storage_key = %key, field = %field, error = %e, "Skipping undecodable record");
                    skipped += 1;
                }
            }
        }

        self.counters.loaded.fetch_add(loaded as u64, Ordering::Relaxed);
        self.counters.load_skipped.fetch_add(skipped as u64, Ordering::Relaxed);
        metrics::record_load(key, loaded, skipped);
        metrics::set_repository_size(key, self.entities.len());
        debug!(storage_key = %key, loaded, skipped, "Bootstrap load complete");
    }

    /// Subscribe and spawn the flush and broadcast tasks, replacing any
    /// previous generation.
    async fn start_tasks(self: &Arc<Self>) -> Result<()> {
        if self.is_closed() {
            return Err(SyncError::Shutdown);
        }

        let previous = self.tasks.lock().take();
        if let Some(previous) = previous {
            previous.stop().await;
        }

        let subscription = self.transport.subscribe(&self.config.update_channel).await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let span = info_span!("repository", storage_key = %self.config.storage_key);
        let flush = tokio::spawn(
            flush::run_flush_loop(
                Arc::downgrade(self),
                self.config.flush_interval_duration(),
                shutdown_rx.clone(),
            )
            .instrument(span.clone()),
        );
        let listener = tokio::spawn(
            broadcast::run_listener(Arc::downgrade(self), subscription, shutdown_rx).instrument(span),
        );

        let displaced = self.tasks.lock().replace(TaskSet {
            shutdown_tx,
            handles: vec![flush, listener],
        });
        // Two concurrent restarts: the loser's tasks are stopped here.
        if let Some(displaced) = displaced {
            displaced.stop().await;
        }
        Ok(())
    }

    /// Cancel the periodic tasks and start a fresh set.
    ///
    /// Safe to call repeatedly; there is never more than one flush scheduler
    /// or listener per repository.
    pub async fn restart(self: &Arc<Self>) -> Result<()> {
        info!(storage_key = %self.config.storage_key, "Restarting repository tasks");
        self.start_tasks().await
    }

    /// Stop the periodic tasks and run a final flush.
    pub async fn close(&self) -> FlushReport {
        if self.closed.swap(true, Ordering::SeqCst) {
            return FlushReport::default();
        }

        let tasks = self.tasks.lock().take();
        if let Some(tasks) = tasks {
            tasks.stop().await;
        }

        let report = self.flush_now().await;
        info!(
            storage_key = %self.config.storage_key,
            written = report.written,
            purged = report.purged,
            failed = report.failed,
            "Repository closed"
        );
        report
    }
}

impl<T: Entity> std::fmt::Debug for Repository<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("storage_key", &self.config.storage_key)
            .field("update_channel", &self.config.update_channel)
            .field("entities", &self.entities.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boost::{Boost, CurrencyType, PlayerBoosts};
    use crate::transport::MemoryBus;

    fn config() -> RepositoryConfig {
        RepositoryConfig::new("boosts", "boosts:update").with_flush_interval(Duration::from_secs(60))
    }

    async fn open_on(bus: &MemoryBus, server: &str) -> Arc<Repository<PlayerBoosts>> {
        Repository::open(config(), Arc::new(bus.connect(server))).await.unwrap()
    }

    fn active_boost() -> Boost {
        Boost::new(CurrencyType::Money, 1.0).expiring_in(Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_open_rejects_empty_storage_key() {
        let bus = MemoryBus::new();
        let err = Repository::<PlayerBoosts>::open(
            RepositoryConfig::new("", "boosts:update"),
            Arc::new(bus.connect("a")),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[tokio::test]
    async fn test_open_rejects_empty_update_channel() {
        let bus = MemoryBus::new();
        let err = Repository::<PlayerBoosts>::open(RepositoryConfig::new("boosts", " "), Arc::new(bus.connect("a")))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("update_channel"));
    }

    #[tokio::test]
    async fn test_get_creates_clean_default_once() {
        let bus = MemoryBus::new();
        let repo = open_on(&bus, "a").await;

        let first = repo.get("p1");
        let second = repo.get("p1");
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!first.is_dirty());
        assert_eq!(repo.len(), 1);
        assert!(repo.contains("p1"));
    }

    #[tokio::test]
    async fn test_load_all_skips_bad_records() {
        let bus = MemoryBus::new();
        let mut good = PlayerBoosts::new("p1");
        good.add_boost(active_boost());
        bus.seed("boosts", "p1", serde_json::to_vec(&good).unwrap());
        bus.seed("boosts", "p2", b"{not json".to_vec());
        bus.seed("boosts", "p3", br#"{"id":"someone-else","boosts":[]}"#.to_vec());

        let repo = open_on(&bus, "a").await;

        assert_eq!(repo.ids(), vec!["p1".to_string()]);
        let stats = repo.stats();
        assert_eq!(stats.loaded, 1);
        assert_eq!(stats.load_skipped, 2);
        assert_eq!(repo.get("p1").read(|b| b.boosts().len()), 1);
    }

    #[tokio::test]
    async fn test_load_all_disabled() {
        let bus = MemoryBus::new();
        bus.seed("boosts", "p1", br#"{"id":"p1","boosts":[]}"#.to_vec());

        let repo = Repository::<PlayerBoosts>::open(config().with_load_all(false), Arc::new(bus.connect("a")))
            .await
            .unwrap();
        assert!(repo.is_empty());
    }

    #[tokio::test]
    async fn test_load_failure_is_not_fatal() {
        let bus = MemoryBus::new();
        bus.fail_reads(true);
        let repo = open_on(&bus, "a").await;
        assert!(repo.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_merges_stored_record() {
        let bus = MemoryBus::new();
        let repo = open_on(&bus, "a").await;
        assert!(repo.refresh("p1").await.unwrap().is_none());

        let mut stored = PlayerBoosts::new("p1");
        stored.add_boost(active_boost());
        bus.seed("boosts", "p1", serde_json::to_vec(&stored).unwrap());

        let cell = repo.refresh("p1").await.unwrap().unwrap();
        assert_eq!(cell.access(|b| b.boost("miner", CurrencyType::Money, 1.0)), 2.0);
        assert!(!cell.is_dirty());
    }

    #[tokio::test]
    async fn test_remove_local_keeps_store() {
        let bus = MemoryBus::new();
        let repo = open_on(&bus, "a").await;
        repo.get("p1").update(|b| b.add_boost(active_boost()));
        repo.flush_now().await;

        assert!(repo.remove_local("p1").is_some());
        assert!(!repo.contains("p1"));
        assert!(bus.stored("boosts", "p1").is_some());
    }

    #[tokio::test]
    async fn test_close_flushes_and_is_idempotent() {
        let bus = MemoryBus::new();
        let repo = open_on(&bus, "a").await;
        repo.get("p1").update(|b| b.add_boost(active_boost()));

        let report = repo.close().await;
        assert_eq!(report.written, 1);
        assert!(repo.is_closed());
        assert_eq!(bus.subscriber_count("boosts:update"), 0);

        assert_eq!(repo.close().await, FlushReport::default());
        assert!(matches!(repo.restart().await, Err(SyncError::Shutdown)));
    }

    #[tokio::test]
    async fn test_restart_keeps_a_single_listener() {
        let bus = MemoryBus::new();
        let repo = open_on(&bus, "a").await;

        repo.restart().await.unwrap();
        repo.restart().await.unwrap();

        assert_eq!(bus.subscriber_count("boosts:update"), 1);
    }

    #[tokio::test]
    async fn test_mark_dirty() {
        let bus = MemoryBus::new();
        let repo = open_on(&bus, "a").await;
        repo.mark_dirty("p1");
        assert_eq!(repo.stats().dirty, 1);
    }
}
