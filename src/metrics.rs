// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics through the `metrics` facade for:
//! - Repository flush cycles and bootstrap loads
//! - Broadcast handling (applied, self-suppressed, rejected)
//! - Correlated requests (sent, resolved, timed out)
//! - Deferred commands (dispatched, executed, dropped, ignored)
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `crossync_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track durations in seconds
//!
//! Nothing is recorded unless the host installs a recorder.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// ─────────────────────────────────────────────────────────────────────────────
// Repository
// ─────────────────────────────────────────────────────────────────────────────

/// Record the outcome of one flush cycle.
pub fn record_flush_cycle(storage_key: &str, written: usize, purged: usize, failed: usize, duration: Duration) {
    let key = storage_key.to_string();
    counter!("crossync_flush_cycles_total", "storage_key" => key.clone()).increment(1);
    counter!("crossync_entities_written_total", "storage_key" => key.clone()).increment(written as u64);
    counter!("crossync_entities_purged_total", "storage_key" => key.clone()).increment(purged as u64);
    if failed > 0 {
        counter!("crossync_flush_failures_total", "storage_key" => key.clone()).increment(failed as u64);
    }
    histogram!("crossync_flush_duration_seconds", "storage_key" => key).record(duration.as_secs_f64());
}

/// Record the in-memory entity count of a repository.
pub fn set_repository_size(storage_key: &str, size: usize) {
    gauge!("crossync_repository_entities", "storage_key" => storage_key.to_string()).set(size as f64);
}

/// Record a bootstrap load.
pub fn record_load(storage_key: &str, loaded: usize, skipped: usize) {
    let key = storage_key.to_string();
    counter!("crossync_entities_loaded_total", "storage_key" => key.clone()).increment(loaded as u64);
    if skipped > 0 {
        counter!("crossync_entities_load_skipped_total", "storage_key" => key).increment(skipped as u64);
    }
}

/// Record how an inbound broadcast was handled.
///
/// `outcome` is one of `applied`, `suppressed`, `rejected`.
pub fn record_broadcast(channel: &str, outcome: &'static str) {
    counter!("crossync_broadcasts_total", "channel" => channel.to_string(), "outcome" => outcome).increment(1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Request/response
// ─────────────────────────────────────────────────────────────────────────────

pub fn record_request_sent(channel: &str) {
    counter!("crossync_requests_sent_total", "channel" => channel.to_string()).increment(1);
}

/// Record a request resolved by a response, with its round-trip time.
pub fn record_request_resolved(channel: &str, round_trip: Duration) {
    counter!("crossync_requests_resolved_total", "channel" => channel.to_string()).increment(1);
    histogram!("crossync_request_round_trip_seconds", "channel" => channel.to_string())
        .record(round_trip.as_secs_f64());
}

pub fn record_requests_timed_out(channel: &str, count: usize) {
    counter!("crossync_requests_timed_out_total", "channel" => channel.to_string()).increment(count as u64);
}

pub fn record_request_answered(channel: &str) {
    counter!("crossync_requests_answered_total", "channel" => channel.to_string()).increment(1);
}

pub fn set_pending_requests(channel: &str, pending: usize) {
    gauge!("crossync_requests_pending", "channel" => channel.to_string()).set(pending as f64);
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

pub fn record_command_dispatched() {
    counter!("crossync_commands_dispatched_total").increment(1);
}

/// `outcome` is one of `executed`, `dropped`, `ignored`, `queued`.
pub fn record_command(outcome: &'static str) {
    counter!("crossync_commands_total", "outcome" => outcome).increment(1);
}

pub fn set_awaiting_commands(count: usize) {
    gauge!("crossync_commands_awaiting").set(count as f64);
}

// ─────────────────────────────────────────────────────────────────────────────
// Transport / lifecycle
// ─────────────────────────────────────────────────────────────────────────────

/// Record a Redis subscription (re)connect.
pub fn record_subscription_connect(channel: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("crossync_subscription_connects_total", "channel" => channel.to_string(), "status" => status)
        .increment(1);
}

pub fn record_dropped_frame(channel: &str) {
    counter!("crossync_dropped_frames_total", "channel" => channel.to_string()).increment(1);
}

/// Record the node lifecycle state.
pub fn set_node_state(state: &str) {
    for candidate in ["Created", "Running", "ShuttingDown", "Stopped"] {
        let value = if candidate == state { 1.0 } else { 0.0 };
        gauge!("crossync_node_state", "state" => candidate).set(value);
    }
}
