// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Flush cycle: persist dirty entities, purge removable ones.
//!
//! For every entity in memory:
//!
//! | State                 | Action                                          |
//! |-----------------------|-------------------------------------------------|
//! | clean                 | nothing (no redundant writes)                   |
//! | dirty, removable      | `HDEL`, drop from memory, `PUBLISH` final state |
//! | dirty                 | `HSET`, clear dirty, `PUBLISH` on update chan   |
//!
//! Store calls go through the repository's write circuit breaker. A failed
//! or rejected write leaves the entity dirty for the next cycle. A failed
//! publish is only logged: the record is durable, and the other processes
//! catch up on their next load or on the next change.
//!
//! A purge publishes the removable state so other processes drop their
//! copies too (see [`broadcast`](super::broadcast)).
//!
//! The map is snapshotted into a `Vec` of cell handles before any store call,
//! so no map guard is held across an await.

use super::Repository;
use crate::circuit_breaker::CircuitError;
use crate::entity::{Entity, EntityCell, FlushSnapshot};
use crate::metrics;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Outcome of one flush cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Entities written to the store.
    pub written: usize,
    /// Removable entities deleted from the store and from memory.
    pub purged: usize,
    /// Dirty entities left dirty for the next cycle.
    pub failed: usize,
    /// Clean entities left untouched.
    pub skipped: usize,
}

impl FlushReport {
    pub fn is_empty(&self) -> bool {
        self.written == 0 && self.purged == 0 && self.failed == 0
    }
}

impl<T: Entity> Repository<T> {
    /// Run one flush cycle now.
    pub async fn flush_now(&self) -> FlushReport {
        let start = Instant::now();
        let cells: Vec<Arc<EntityCell<T>>> = self.entities.iter().map(|e| Arc::clone(e.value())).collect();

        let mut report = FlushReport::default();
        for cell in cells {
            match cell.flush_snapshot() {
                None => report.skipped += 1,
                Some(Ok(FlushSnapshot::Remove { revision, payload })) => {
                    self.purge(&cell, revision, payload, &mut report).await
                }
                Some(Ok(FlushSnapshot::Write { revision, payload })) => {
                    self.write_back(&cell, revision, payload, &mut report).await
                }
                Some(Err(e)) => {
                    warn!(id = %cell.id(), error = %e, "Cannot serialize entity, leaving dirty");
                    report.failed += 1;
                }
            }
        }

        let key = self.config.storage_key.as_str();
        let c = &self.counters;
        c.flush_cycles.fetch_add(1, Ordering::Relaxed);
        c.written.fetch_add(report.written as u64, Ordering::Relaxed);
        c.purged.fetch_add(report.purged as u64, Ordering::Relaxed);
        c.failed_writes.fetch_add(report.failed as u64, Ordering::Relaxed);
        metrics::record_flush_cycle(key, report.written, report.purged, report.failed, start.elapsed());
        metrics::set_repository_size(key, self.entities.len());

        if report.failed > 0 {
            warn!(
                storage_key = %key,
                written = report.written,
                purged = report.purged,
                failed = report.failed,
                "Flush cycle left entities dirty"
            );
        } else if !report.is_empty() {
            debug!(storage_key = %key, written = report.written, purged = report.purged, "Flush cycle complete");
        }
        report
    }

    async fn write_back(&self, cell: &EntityCell<T>, revision: u64, payload: Vec<u8>, report: &mut FlushReport) {
        let key = self.config.storage_key.as_str();
        let id = cell.id();

        let write = self
            .circuit
            .writes
            .call(|| self.transport.hash_set(key, id, payload.clone()))
            .await;

        match write {
            Ok(()) => {
                report.written += 1;
                if !cell.clear_dirty_if(revision) {
                    trace!(id = %id, "Entity changed during write, stays dirty");
                }
                if let Err(e) = self.transport.publish(&self.config.update_channel, payload).await {
                    warn!(id = %id, channel = %self.config.update_channel, error = %e, "Failed to broadcast update");
                }
            }
            Err(CircuitError::Rejected) => {
                debug!(id = %id, "Write rejected by open circuit, retrying next cycle");
                report.failed += 1;
            }
            Err(CircuitError::Inner(e)) => {
                warn!(id = %id, error = %e, "Store write failed, retrying next cycle");
                report.failed += 1;
            }
        }
    }

    async fn purge(&self, cell: &Arc<EntityCell<T>>, revision: u64, payload: Vec<u8>, report: &mut FlushReport) {
        let key = self.config.storage_key.as_str();
        let id = cell.id();

        let delete = self.circuit.writes.call(|| self.transport.hash_delete(key, id)).await;

        match delete {
            Ok(_) => {
                let removed = self
                    .entities
                    .remove_if(id, |_, current| Arc::ptr_eq(current, cell) && cell.purgeable_at(revision))
                    .is_some();
                if removed {
                    report.purged += 1;
                    if let Err(e) = self.transport.publish(&self.config.update_channel, payload).await {
                        warn!(id = %id, channel = %self.config.update_channel, error = %e, "Failed to broadcast removal");
                    }
                } else {
                    // Revived while the delete was in flight; the next cycle
                    // writes it back.
                    trace!(id = %id, "Entity changed during purge, kept");
                }
            }
            Err(e) => {
                let e = e.into_sync_error(self.circuit.writes.name());
                warn!(id = %id, error = %e, "Store delete failed, retrying next cycle");
                report.failed += 1;
            }
        }
    }
}

/// Periodic flush task. Exits on shutdown or once the repository is dropped.
pub(super) async fn run_flush_loop<T: Entity>(
    repo: Weak<Repository<T>>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(period_ms = period.as_millis() as u64, "Flush task started");

    let mut timer = tokio::time::interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = timer.tick() => {
                let Some(repo) = repo.upgrade() else { break };
                repo.flush_now().await;
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    debug!("Flush task stopped");
}
