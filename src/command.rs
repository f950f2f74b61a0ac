// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cross-server command dispatch with deferred execution.
//!
//! A command is published once on the command channel and every server
//! decides for itself whether it applies:
//!
//! ```text
//! dispatch() ──► PUBLISH commands {command, sender, target, scope}
//!                      │
//!      ┌───────────────┼───────────────┐
//!      ▼               ▼               ▼
//!   server a        server b        server c
//!   scope.admits? ── no ──► ignored
//!      │ yes
//!      ├── target = Console ──► execute now
//!      └── target = player  ──► awaiting ──(each tick)──► resolved? ──► execute
//!                                              │
//!                                              └── older than target_timeout ──► log + drop
//! ```
//!
//! Delivery is fire-and-forget with a bounded best effort: a command whose
//! target never shows up is dropped and logged, and the dispatcher is never
//! told.
//!
//! The game server itself sits behind [`CommandHost`]; this module never
//! touches players or the console directly.

use crate::config::CommandConfig;
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::transport::{SharedTransport, Subscription};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

/// Who a command is aimed at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum TargetSelector {
    /// Run from the console, immediately, on every admitted server.
    Console,
    /// A player by (case-insensitive) name.
    Name(String),
    Uuid(Uuid),
}

impl TargetSelector {
    pub fn is_console(&self) -> bool {
        matches!(self, TargetSelector::Console)
    }
}

impl std::fmt::Display for TargetSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetSelector::Console => write!(f, "console"),
            TargetSelector::Name(name) => write!(f, "{}", name),
            TargetSelector::Uuid(uuid) => write!(f, "{}", uuid),
        }
    }
}

/// Whose authority the command runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderKind {
    /// The console runs it (once the target is present, for player targets).
    Console,
    /// The target player runs it.
    Player,
}

/// Which servers act on a command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchScope {
    /// Allow-list of server ids; `None` means every server.
    #[serde(default)]
    pub servers: Option<Vec<String>>,
    /// Skip the server that dispatched it.
    #[serde(default)]
    pub exclude_origin: bool,
}

impl DispatchScope {
    pub fn everywhere() -> Self {
        Self::default()
    }

    pub fn only<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            servers: Some(servers.into_iter().map(Into::into).collect()),
            exclude_origin: false,
        }
    }

    pub fn everywhere_but_origin() -> Self {
        Self {
            servers: None,
            exclude_origin: true,
        }
    }

    pub fn excluding_origin(mut self) -> Self {
        self.exclude_origin = true;
        self
    }

    /// Whether server `self_id` should act on a command sent by `origin`.
    pub fn admits(&self, self_id: &str, origin: &str) -> bool {
        if self.exclude_origin && self_id == origin {
            return false;
        }
        match &self.servers {
            None => true,
            Some(servers) => servers.iter().any(|s| s == self_id),
        }
    }
}

/// Wire form of a dispatched command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub command: String,
    pub sender: SenderKind,
    pub target: TargetSelector,
    #[serde(default)]
    pub scope: DispatchScope,
}

impl CommandEnvelope {
    /// Console command on every server.
    pub fn console(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            sender: SenderKind::Console,
            target: TargetSelector::Console,
            scope: DispatchScope::everywhere(),
        }
    }

    /// Console command run once `target` is on the server.
    pub fn for_player(target: TargetSelector, command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            sender: SenderKind::Console,
            target,
            scope: DispatchScope::everywhere(),
        }
    }

    /// Command performed by `target` itself.
    pub fn as_player(target: TargetSelector, command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            sender: SenderKind::Player,
            target,
            scope: DispatchScope::everywhere(),
        }
    }

    pub fn scoped(mut self, scope: DispatchScope) -> Self {
        self.scope = scope;
        self
    }
}

/// A player the host found on this server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub uuid: Uuid,
    pub name: String,
}

/// The game server, as seen by the dispatcher.
///
/// Calls are made from the resolution task and must not block for long.
pub trait CommandHost: Send + Sync + 'static {
    /// Find a currently connected player.
    fn resolve(&self, selector: &TargetSelector) -> Option<ResolvedTarget>;

    fn execute_console(&self, command: &str);

    /// Run a command for a connected player, with `sender`'s authority.
    fn execute_for(&self, target: &ResolvedTarget, sender: SenderKind, command: &str);
}

/// What a server did with a received command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Ignored,
    Executed,
    Queued,
}

#[derive(Debug, Clone)]
struct AwaitingCommand {
    command: String,
    sender: SenderKind,
    target: TargetSelector,
    origin: String,
    created: Instant,
    timeout: Duration,
}

struct TaskSet {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

/// Publishes commands and runs the ones addressed to this server.
pub struct CommandDispatcher {
    config: CommandConfig,
    target_timeout: Duration,
    transport: SharedTransport,
    host: Arc<dyn CommandHost>,
    awaiting: DashMap<u64, AwaitingCommand>,
    next_id: AtomicU64,
    executed: AtomicU64,
    dropped: AtomicU64,
    ignored: AtomicU64,
    tasks: Mutex<Option<TaskSet>>,
    closed: AtomicBool,
}

impl CommandDispatcher {
    pub async fn open(
        config: CommandConfig,
        transport: SharedTransport,
        host: Arc<dyn CommandHost>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let dispatcher = Arc::new(Self {
            target_timeout: config.target_timeout_duration(),
            config,
            transport,
            host,
            awaiting: DashMap::new(),
            next_id: AtomicU64::new(0),
            executed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            ignored: AtomicU64::new(0),
            tasks: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        dispatcher.start_tasks().await?;

        info!(
            channel = %dispatcher.config.channel,
            target_timeout_ms = dispatcher.target_timeout.as_millis() as u64,
            "Command dispatcher open"
        );
        Ok(dispatcher)
    }

    pub fn server_id(&self) -> &str {
        self.transport.server_id()
    }

    /// Publish a console-sent command.
    pub async fn dispatch(&self, command: impl Into<String>, target: TargetSelector, scope: DispatchScope) -> Result<()> {
        self.send(CommandEnvelope::for_player(target, command).scoped(scope)).await
    }

    /// Publish a fully specified envelope.
    pub async fn send(&self, envelope: CommandEnvelope) -> Result<()> {
        if self.is_closed() {
            return Err(SyncError::Shutdown);
        }
        let payload = serde_json::to_vec(&envelope).map_err(|e| SyncError::serialization(&self.config.channel, e))?;
        self.transport.publish(&self.config.channel, payload).await?;
        metrics::record_command_dispatched();
        debug!(command = %envelope.command, target = %envelope.target, "Command dispatched");
        Ok(())
    }

    /// Act on a command received from `origin`. A closed dispatcher ignores
    /// everything.
    pub fn handle_envelope(&self, envelope: CommandEnvelope, origin: &str) -> CommandOutcome {
        if self.is_closed() {
            trace!(command = %envelope.command, origin = %origin, "Dispatcher closed, ignoring command");
            return self.ignore();
        }
        if !envelope.scope.admits(self.server_id(), origin) {
            trace!(command = %envelope.command, origin = %origin, "Command not for this server");
            return self.ignore();
        }

        if envelope.target.is_console() {
            self.host.execute_console(&envelope.command);
            self.executed.fetch_add(1, Ordering::Relaxed);
            metrics::record_command("executed");
            debug!(command = %envelope.command, origin = %origin, "Executed console command");
            return CommandOutcome::Executed;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.awaiting.insert(
            id,
            AwaitingCommand {
                command: envelope.command,
                sender: envelope.sender,
                target: envelope.target,
                origin: origin.to_string(),
                created: Instant::now(),
                timeout: self.target_timeout,
            },
        );
        // close() may have cleared the map since the check above.
        if self.is_closed() {
            self.awaiting.remove(&id);
            return self.ignore();
        }
        metrics::record_command("queued");
        metrics::set_awaiting_commands(self.awaiting.len());
        CommandOutcome::Queued
    }

    /// One pass of the resolution loop: run commands whose target is here,
    /// drop the ones that waited too long. Returns `(executed, dropped)`.
    pub fn resolve_awaiting(&self) -> (usize, usize) {
        let now = Instant::now();
        let waiting: Vec<(u64, TargetSelector, Instant, Duration)> = self
            .awaiting
            .iter()
            .map(|e| (*e.key(), e.target.clone(), e.created, e.timeout))
            .collect();
        if waiting.is_empty() {
            return (0, 0);
        }

        let mut executed = 0;
        let mut dropped = 0;
        for (id, selector, created, timeout) in waiting {
            if let Some(target) = self.host.resolve(&selector) {
                if let Some((_, entry)) = self.awaiting.remove(&id) {
                    self.host.execute_for(&target, entry.sender, &entry.command);
                    executed += 1;
                    metrics::record_command("executed");
                    debug!(command = %entry.command, player = %target.name, "Executed deferred command");
                }
            } else if now.duration_since(created) >= timeout {
                if let Some((_, entry)) = self.awaiting.remove(&id) {
                    dropped += 1;
                    metrics::record_command("dropped");
                    warn!(
                        command = %entry.command,
                        target = %entry.target,
                        origin = %entry.origin,
                        waited_ms = now.duration_since(entry.created).as_millis() as u64,
                        "Command target never appeared, dropping command"
                    );
                }
            }
        }

        self.executed.fetch_add(executed as u64, Ordering::Relaxed);
        self.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
        if executed + dropped > 0 {
            metrics::set_awaiting_commands(self.awaiting.len());
        }
        (executed, dropped)
    }

    pub fn awaiting_count(&self) -> usize {
        self.awaiting.len()
    }

    pub fn executed_count(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn ignored_count(&self) -> u64 {
        self.ignored.load(Ordering::Relaxed)
    }

    async fn start_tasks(self: &Arc<Self>) -> Result<()> {
        if self.is_closed() {
            return Err(SyncError::Shutdown);
        }

        let previous = self.tasks.lock().take();
        if let Some(previous) = previous {
            stop_tasks(previous).await;
        }

        let subscription = self.transport.subscribe(&self.config.channel).await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let span = info_span!("commands", channel = %self.config.channel);

        let listener = tokio::spawn(
            run_listener(Arc::downgrade(self), subscription, shutdown_rx.clone()).instrument(span.clone()),
        );
        let resolver = tokio::spawn(
            run_resolution_loop(Arc::downgrade(self), self.config.tick_interval_duration(), shutdown_rx)
                .instrument(span),
        );

        let displaced = self.tasks.lock().replace(TaskSet {
            shutdown_tx,
            handles: vec![listener, resolver],
        });
        if let Some(displaced) = displaced {
            stop_tasks(displaced).await;
        }
        Ok(())
    }

    /// Cancel and re-spawn the listener and resolution loop.
    pub async fn restart(self: &Arc<Self>) -> Result<()> {
        info!(channel = %self.config.channel, "Restarting command dispatcher");
        self.start_tasks().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ignore(&self) -> CommandOutcome {
        self.ignored.fetch_add(1, Ordering::Relaxed);
        metrics::record_command("ignored");
        CommandOutcome::Ignored
    }

    /// Stop listening and discard awaiting commands.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let tasks = self.tasks.lock().take();
        if let Some(tasks) = tasks {
            stop_tasks(tasks).await;
        }

        let discarded = self.awaiting.len();
        self.awaiting.clear();
        metrics::set_awaiting_commands(0);
        if discarded > 0 {
            warn!(discarded, "Discarded awaiting commands on close");
        }
        info!(channel = %self.config.channel, "Command dispatcher closed");
    }
}

async fn stop_tasks(tasks: TaskSet) {
    let _ = tasks.shutdown_tx.send(true);
    for handle in tasks.handles {
        if let Err(e) = handle.await {
            if !e.is_cancelled() {
                warn!(error = %e, "Command task panicked");
            }
        }
    }
}

async fn run_listener(
    dispatcher: Weak<CommandDispatcher>,
    mut subscription: Subscription,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            message = subscription.next() => {
                let Some(message) = message else {
                    warn!("Command subscription closed");
                    break;
                };
                let Some(dispatcher) = dispatcher.upgrade() else { break };
                match serde_json::from_slice::<CommandEnvelope>(&message.payload) {
                    Ok(envelope) => {
                        dispatcher.handle_envelope(envelope, &message.origin);
                    }
                    Err(e) => warn!(origin = %message.origin, error = %e, "Dropping undecodable command"),
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

async fn run_resolution_loop(
    dispatcher: Weak<CommandDispatcher>,
    tick: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut timer = tokio::time::interval(tick);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = timer.tick() => {
                let Some(dispatcher) = dispatcher.upgrade() else { break };
                dispatcher.resolve_awaiting();
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryBus;

    #[derive(Default)]
    struct Host {
        online: Mutex<Vec<ResolvedTarget>>,
        console: Mutex<Vec<String>>,
        player: Mutex<Vec<(String, SenderKind, String)>>,
    }

    impl Host {
        fn join(&self, name: &str) {
            self.online.lock().push(ResolvedTarget {
                uuid: Uuid::new_v4(),
                name: name.to_string(),
            });
        }
    }

    impl CommandHost for Host {
        fn resolve(&self, selector: &TargetSelector) -> Option<ResolvedTarget> {
            self.online
                .lock()
                .iter()
                .find(|p| match selector {
                    TargetSelector::Console => false,
                    TargetSelector::Name(name) => p.name.eq_ignore_ascii_case(name),
                    TargetSelector::Uuid(uuid) => p.uuid == *uuid,
                })
                .cloned()
        }

        fn execute_console(&self, command: &str) {
            self.console.lock().push(command.to_string());
        }

        fn execute_for(&self, target: &ResolvedTarget, sender: SenderKind, command: &str) {
            self.player.lock().push((target.name.clone(), sender, command.to_string()));
        }
    }

    async fn open(bus: &MemoryBus, server: &str) -> (Arc<CommandDispatcher>, Arc<Host>) {
        let host = Arc::new(Host::default());
        // Ticks are driven by hand in these tests.
        let config = CommandConfig {
            tick_interval: "1h".to_string(),
            ..CommandConfig::default()
        };
        let dispatcher = CommandDispatcher::open(config, Arc::new(bus.connect(server)), host.clone())
            .await
            .unwrap();
        (dispatcher, host)
    }

    #[test]
    fn test_scope_admits() {
        assert!(DispatchScope::everywhere().admits("a", "a"));
        assert!(!DispatchScope::everywhere_but_origin().admits("a", "a"));
        assert!(DispatchScope::everywhere_but_origin().admits("b", "a"));

        let only_b = DispatchScope::only(["b"]).excluding_origin();
        assert!(!only_b.admits("a", "a"));
        assert!(only_b.admits("b", "a"));
        assert!(!only_b.admits("c", "a"));
        assert!(!DispatchScope::only(["b"]).excluding_origin().admits("b", "b"));
    }

    #[test]
    fn test_envelope_wire_form() {
        let envelope = CommandEnvelope::as_player(TargetSelector::Name("Steve".into()), "spawn")
            .scoped(DispatchScope::only(["survival"]));
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "command": "spawn",
                "sender": "player",
                "target": { "type": "name", "value": "Steve" },
                "scope": { "servers": ["survival"], "exclude_origin": false }
            })
        );
        let console: CommandEnvelope =
            serde_json::from_str(r#"{"command":"say hi","sender":"console","target":{"type":"console"}}"#).unwrap();
        assert_eq!(console, CommandEnvelope::console("say hi"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_console_command_runs_immediately() {
        let bus = MemoryBus::new();
        let (dispatcher, host) = open(&bus, "a").await;

        let outcome = dispatcher.handle_envelope(CommandEnvelope::console("save-all"), "b");

        assert_eq!(outcome, CommandOutcome::Executed);
        assert_eq!(*host.console.lock(), vec!["save-all".to_string()]);
        assert_eq!(dispatcher.awaiting_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_player_command_waits_for_target() {
        let bus = MemoryBus::new();
        let (dispatcher, host) = open(&bus, "a").await;

        let outcome = dispatcher.handle_envelope(
            CommandEnvelope::as_player(TargetSelector::Name("Steve".into()), "spawn"),
            "b",
        );
        assert_eq!(outcome, CommandOutcome::Queued);
        assert_eq!(dispatcher.resolve_awaiting(), (0, 0));

        tokio::time::advance(Duration::from_secs(2)).await;
        host.join("steve");
        assert_eq!(dispatcher.resolve_awaiting(), (1, 0));
        assert_eq!(
            *host.player.lock(),
            vec![("steve".to_string(), SenderKind::Player, "spawn".to_string())]
        );
        assert_eq!(dispatcher.awaiting_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolved_command_is_dropped_after_timeout() {
        let bus = MemoryBus::new();
        let (dispatcher, host) = open(&bus, "a").await;

        dispatcher.handle_envelope(CommandEnvelope::for_player(TargetSelector::Name("Ghost".into()), "kit starter"), "a");

        tokio::time::advance(Duration::from_millis(4_999)).await;
        assert_eq!(dispatcher.resolve_awaiting(), (0, 0));
        assert_eq!(dispatcher.awaiting_count(), 1);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(dispatcher.resolve_awaiting(), (0, 1));
        assert_eq!(dispatcher.awaiting_count(), 0);
        assert_eq!(dispatcher.dropped_count(), 1);
        assert!(host.player.lock().is_empty());
        assert!(host.console.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_round_trip_through_channel() {
        let bus = MemoryBus::new();
        let (a, host_a) = open(&bus, "a").await;
        let (_b, host_b) = open(&bus, "b").await;

        a.send(CommandEnvelope::console("broadcast hello").scoped(DispatchScope::everywhere_but_origin()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(host_a.console.lock().is_empty());
        assert_eq!(*host_b.console.lock(), vec!["broadcast hello".to_string()]);
        assert_eq!(a.ignored_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_discards_awaiting() {
        let bus = MemoryBus::new();
        let (dispatcher, _host) = open(&bus, "a").await;
        dispatcher.handle_envelope(CommandEnvelope::for_player(TargetSelector::Name("Ghost".into()), "x"), "a");

        dispatcher.close().await;

        assert_eq!(dispatcher.awaiting_count(), 0);
        assert_eq!(bus.subscriber_count("crossync:commands"), 0);
        assert!(matches!(dispatcher.send(CommandEnvelope::console("x")).await, Err(SyncError::Shutdown)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_dispatcher_ignores_envelopes() {
        let bus = MemoryBus::new();
        let (dispatcher, host) = open(&bus, "a").await;
        dispatcher.close().await;

        let player = dispatcher.handle_envelope(CommandEnvelope::for_player(TargetSelector::Name("Steve".into()), "spawn"), "b");
        let console = dispatcher.handle_envelope(CommandEnvelope::console("save-all"), "b");

        assert_eq!(player, CommandOutcome::Ignored);
        assert_eq!(console, CommandOutcome::Ignored);
        assert_eq!(dispatcher.awaiting_count(), 0);
        assert_eq!(dispatcher.ignored_count(), 2);
        assert!(host.console.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_keeps_a_single_listener() {
        let bus = MemoryBus::new();
        let (dispatcher, _host) = open(&bus, "a").await;
        dispatcher.restart().await.unwrap();
        assert_eq!(bus.subscriber_count("crossync:commands"), 1);
    }
}
