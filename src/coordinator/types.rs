//! Node state and health types.
//!
//! # State Transitions
//!
//! ```text
//!              start()                 shutdown()
//! Created ──────────────→ Running ──────────────→ ShuttingDown
//!    │                                                  │
//!    │ shutdown()                                       │ (components closed)
//!    ↓                                                  ↓
//! Stopped ←─────────────────────────────────────────────┘
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: Initial state after `SyncNode::new()`. Transport connected, nothing opened.
//! - **Running**: Repositories, request channels and the command dispatcher may be opened.
//! - **ShuttingDown**: `shutdown()` called. Components are closing (final flushes run here).
//! - **Stopped**: Every component closed. Safe to drop.

/// State of a synchronization node.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Node created but not started.
    ///
    /// Call [`start()`](super::SyncNode::start) before opening components.
    Created,

    /// Running; components can be opened and are live.
    Running,

    /// Shutting down gracefully.
    ///
    /// Periodic tasks are stopping and repositories run their last flush.
    ShuttingDown,

    /// Stopped.
    Stopped,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Created => "Created",
            NodeState::Running => "Running",
            NodeState::ShuttingDown => "ShuttingDown",
            NodeState::Stopped => "Stopped",
        }
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health of one opened component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentHealth {
    /// Storage key, request channel, or command channel.
    pub name: String,

    /// `"repository"`, `"request_channel"` or `"commands"`.
    pub kind: &'static str,

    /// Entities held, requests pending, or commands awaiting.
    pub backlog: usize,

    /// Dirty entities not yet persisted (repositories only).
    pub unflushed: usize,

    /// The store circuit breaker looks open (repositories only).
    pub circuit_open: bool,
}

/// Health snapshot returned by [`SyncNode::health_check()`](super::SyncNode::health_check).
///
/// Collected from in-memory state only; no network I/O.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub server_id: String,

    pub state: NodeState,

    /// Running and accepting work.
    pub ready: bool,

    /// Ready and no store circuit is open.
    pub healthy: bool,

    pub components: Vec<ComponentHealth>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_state_display() {
        assert_eq!(NodeState::Created.to_string(), "Created");
        assert_eq!(NodeState::Running.to_string(), "Running");
        assert_eq!(NodeState::ShuttingDown.to_string(), "ShuttingDown");
        assert_eq!(NodeState::Stopped.to_string(), "Stopped");
    }

    #[test]
    fn test_node_state_equality() {
        assert_eq!(NodeState::Created, NodeState::Created);
        assert_ne!(NodeState::Created, NodeState::Running);
    }

    #[test]
    fn test_node_state_copy() {
        let state = NodeState::Stopped;
        let copied: NodeState = state;
        assert_eq!(state, copied);
    }
}
