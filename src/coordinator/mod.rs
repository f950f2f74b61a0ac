// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Node coordinator.
//!
//! A [`SyncNode`] is the explicitly constructed root of one server process's
//! synchronization core. It owns the transport and node configuration, and
//! tracks everything opened through it:
//! - Replicated repositories via [`crate::repository::Repository`]
//! - Request/response protocols via [`crate::request::RequestChannel`]
//! - The command dispatcher via [`crate::command::CommandDispatcher`]
//!
//! Nothing is process-global: two nodes in one process (as in tests) are
//! fully isolated unless they share a [`MemoryBus`](crate::transport::MemoryBus).
//!
//! # Lifecycle
//!
//! 1. `new()` / `connect_redis()`: validate config, attach transport
//! 2. `start()`: allow components to be opened
//! 3. `open_*()`: each component subscribes and spawns its periodic tasks
//! 4. `shutdown()`: close components in reverse order (repositories flush)

mod types;

pub use types::{ComponentHealth, HealthCheck, NodeState};

use crate::command::{CommandDispatcher, CommandHost};
use crate::config::{NodeConfig, RepositoryConfig, RequestChannelConfig};
use crate::entity::Entity;
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::repository::Repository;
use crate::request::{Payload, RequestChannel, Responder};
use crate::transport::{RedisTransport, SharedTransport};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Something opened through the node that must be restarted and closed
/// with it.
trait Component: Send + Sync {
    fn health(&self) -> ComponentHealth;
    fn restart(&self) -> BoxFuture<'_, Result<()>>;
    fn close(&self) -> BoxFuture<'_, ()>;
}

struct RepositoryComponent<T: Entity>(Arc<Repository<T>>);

impl<T: Entity> Component for RepositoryComponent<T> {
    fn health(&self) -> ComponentHealth {
        let stats = self.0.stats();
        ComponentHealth {
            name: self.0.storage_key().to_string(),
            kind: "repository",
            backlog: stats.entities,
            unflushed: stats.dirty,
            circuit_open: self.0.circuit().any_open(),
        }
    }

    fn restart(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.0.restart())
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.0.close().await;
        })
    }
}

struct RequestComponent<Req, Resp>(Arc<RequestChannel<Req, Resp>>);

impl<Req: Payload, Resp: Payload> Component for RequestComponent<Req, Resp> {
    fn health(&self) -> ComponentHealth {
        ComponentHealth {
            name: self.0.name().to_string(),
            kind: "request_channel",
            backlog: self.0.pending_count(),
            unflushed: 0,
            circuit_open: false,
        }
    }

    fn restart(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.0.close())
    }
}

struct CommandComponent(Arc<CommandDispatcher>);

impl Component for CommandComponent {
    fn health(&self) -> ComponentHealth {
        ComponentHealth {
            name: "commands".to_string(),
            kind: "commands",
            backlog: self.0.awaiting_count(),
            unflushed: 0,
            circuit_open: false,
        }
    }

    fn restart(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.0.restart())
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.0.close())
    }
}

/// The synchronization core of one server process.
pub struct SyncNode {
    config: NodeConfig,

    transport: SharedTransport,

    /// Node state (broadcast to watchers)
    state_tx: watch::Sender<NodeState>,
    state_rx: watch::Receiver<NodeState>,

    /// Opened components, in opening order
    components: Mutex<Vec<Arc<dyn Component>>>,

    commands: Mutex<Option<Arc<CommandDispatcher>>>,

    /// Claimed by the first `open_commands` before it awaits
    commands_claimed: AtomicBool,
}

impl SyncNode {
    /// Attach a node to an existing transport.
    ///
    /// `config.server_id` must match the transport's identity, since it is
    /// what self-suppression and command scoping compare against.
    pub fn new(config: NodeConfig, transport: SharedTransport) -> Result<Self> {
        config.validate()?;
        if config.server_id != transport.server_id() {
            return Err(SyncError::Config(format!(
                "server_id {:?} does not match transport identity {:?}",
                config.server_id,
                transport.server_id()
            )));
        }

        let (state_tx, state_rx) = watch::channel(NodeState::Created);
        Ok(Self {
            config,
            transport,
            state_tx,
            state_rx,
            components: Mutex::new(Vec::new()),
            commands: Mutex::new(None),
            commands_claimed: AtomicBool::new(false),
        })
    }

    /// Connect to Redis with the startup retry policy and attach a node.
    pub async fn connect_redis(config: NodeConfig) -> Result<Self> {
        config.validate()?;
        let transport = RedisTransport::connect(config.server_id.clone(), config.redis.clone()).await?;
        Self::new(config, Arc::new(transport))
    }

    pub fn server_id(&self) -> &str {
        &self.config.server_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn transport(&self) -> &SharedTransport {
        &self.transport
    }

    /// Get current node state.
    pub fn state(&self) -> NodeState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<NodeState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), NodeState::Running)
    }

    fn set_state(&self, state: NodeState) {
        let _ = self.state_tx.send(state);
        metrics::set_node_state(state.as_str());
    }

    fn require_running(&self) -> Result<()> {
        match self.state() {
            NodeState::Running => Ok(()),
            NodeState::ShuttingDown | NodeState::Stopped => Err(SyncError::Shutdown),
            other => Err(SyncError::InvalidState {
                expected: "Running".to_string(),
                actual: other.to_string(),
            }),
        }
    }

    /// Allow components to be opened.
    pub fn start(&self) -> Result<()> {
        if self.state() != NodeState::Created {
            return Err(SyncError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }
        self.set_state(NodeState::Running);
        info!(server_id = %self.config.server_id, "Sync node running");
        Ok(())
    }

    /// Record a freshly opened component for restart and shutdown.
    ///
    /// The state is read under the components lock, which `shutdown()` takes
    /// only after leaving `Running`. A component that finished opening after
    /// that point is closed here and the open fails.
    async fn track(&self, component: Arc<dyn Component>) -> Result<()> {
        let rejected = {
            let mut components = self.components.lock();
            if self.is_running() {
                components.push(Arc::clone(&component));
                None
            } else {
                Some(component)
            }
        };

        match rejected {
            None => Ok(()),
            Some(component) => {
                let name = component.health().name;
                warn!(component = %name, state = %self.state(), "Node stopped while component was opening, closing it");
                component.close().await;
                Err(SyncError::Shutdown)
            }
        }
    }

    /// Open a replicated repository and track it for shutdown.
    pub async fn open_repository<T: Entity>(&self, config: RepositoryConfig) -> Result<Arc<Repository<T>>> {
        self.require_running()?;
        let repository = Repository::open(config, Arc::clone(&self.transport)).await?;
        self.track(Arc::new(RepositoryComponent(Arc::clone(&repository))))
            .await?;
        Ok(repository)
    }

    /// Open a request/response protocol using the node's timeouts.
    pub async fn open_request_channel<Req: Payload, Resp: Payload>(
        &self,
        config: RequestChannelConfig,
        responder: Option<Arc<dyn Responder<Req, Resp>>>,
    ) -> Result<Arc<RequestChannel<Req, Resp>>> {
        self.require_running()?;
        let channel =
            RequestChannel::open(config, &self.config.requests, Arc::clone(&self.transport), responder).await?;
        self.track(Arc::new(RequestComponent(Arc::clone(&channel)))).await?;
        Ok(channel)
    }

    /// Open the node's command dispatcher. There is at most one per node.
    pub async fn open_commands(&self, host: Arc<dyn CommandHost>) -> Result<Arc<CommandDispatcher>> {
        self.require_running()?;
        if self.commands_claimed.swap(true, Ordering::SeqCst) {
            return Err(SyncError::InvalidState {
                expected: "no command dispatcher".to_string(),
                actual: "command dispatcher already open".to_string(),
            });
        }

        let dispatcher =
            match CommandDispatcher::open(self.config.commands.clone(), Arc::clone(&self.transport), host).await {
                Ok(dispatcher) => dispatcher,
                Err(e) => {
                    self.commands_claimed.store(false, Ordering::SeqCst);
                    return Err(e);
                }
            };
        *self.commands.lock() = Some(Arc::clone(&dispatcher));
        if let Err(e) = self.track(Arc::new(CommandComponent(Arc::clone(&dispatcher)))).await {
            self.commands.lock().take();
            return Err(e);
        }
        Ok(dispatcher)
    }

    pub fn commands(&self) -> Option<Arc<CommandDispatcher>> {
        self.commands.lock().clone()
    }

    /// Cancel and re-spawn every component's periodic tasks (after a reload).
    pub async fn restart(&self) -> Result<()> {
        self.require_running()?;
        let components: Vec<_> = self.components.lock().clone();
        for component in &components {
            component.restart().await?;
        }
        info!(components = components.len(), "Sync node tasks restarted");
        Ok(())
    }

    /// Get health status for monitoring endpoints.
    ///
    /// **Performance**: no network I/O; everything comes from counters and
    /// in-memory maps.
    pub fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let components: Vec<ComponentHealth> = self.components.lock().iter().map(|c| c.health()).collect();

        let ready = state == NodeState::Running;
        let healthy = ready && !components.iter().any(|c| c.circuit_open);

        HealthCheck {
            server_id: self.config.server_id.clone(),
            state,
            ready,
            healthy,
            components,
        }
    }

    /// Shut the node down gracefully.
    ///
    /// Shutdown sequence:
    /// 1. Refuse new components
    /// 2. Close components newest first (repositories run a final flush,
    ///    request channels fail outstanding requests)
    pub async fn shutdown(&self) {
        if matches!(self.state(), NodeState::ShuttingDown | NodeState::Stopped) {
            return;
        }
        info!(server_id = %self.config.server_id, "Shutting down sync node");
        self.set_state(NodeState::ShuttingDown);

        let components: Vec<_> = std::mem::take(&mut *self.components.lock());
        for component in components.iter().rev() {
            let name = component.health().name;
            component.close().await;
            debug!(component = %name, "Component closed");
        }
        if self.commands.lock().take().is_some() {
            debug!("Command dispatcher released");
        }

        self.set_state(NodeState::Stopped);
        info!(server_id = %self.config.server_id, "Sync node stopped");
    }
}

impl Drop for SyncNode {
    fn drop(&mut self) {
        if !self.components.get_mut().is_empty() {
            warn!(server_id = %self.config.server_id, "Sync node dropped without shutdown; unflushed changes may be lost");
        }
    }
}
