//! Recording CommandHost for testing.
//!
//! Stands in for a game server: players can join and leave, and every
//! console or player command it is asked to run is recorded for assertions.

use crossync::{CommandHost, ResolvedTarget, SenderKind, TargetSelector};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;
use uuid::Uuid;

/// A recorded player command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerCall {
    pub player: String,
    pub sender: SenderKind,
    pub command: String,
}

/// Mock game server that records every command it runs.
///
/// # Example
/// ```rust,ignore
/// let host = MockHost::new();
/// host.join("Notch");
///
/// // Use in tests...
///
/// assert_eq!(host.console_commands(), vec!["say hi"]);
/// ```
#[derive(Default)]
pub struct MockHost {
    online: Mutex<Vec<ResolvedTarget>>,
    console: Mutex<Vec<String>>,
    player: Mutex<Vec<PlayerCall>>,
}

impl MockHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Put a player online. Returns their uuid.
    pub fn join(&self, name: &str) -> Uuid {
        let uuid = Uuid::new_v4();
        self.online.lock().push(ResolvedTarget {
            uuid,
            name: name.to_string(),
        });
        uuid
    }

    pub fn leave(&self, name: &str) {
        self.online.lock().retain(|p| p.name != name);
    }

    pub fn console_commands(&self) -> Vec<String> {
        self.console.lock().clone()
    }

    pub fn player_commands(&self) -> Vec<PlayerCall> {
        self.player.lock().clone()
    }

    /// Commands run in any form.
    pub fn total_executed(&self) -> usize {
        self.console.lock().len() + self.player.lock().len()
    }
}

impl CommandHost for MockHost {
    fn resolve(&self, selector: &TargetSelector) -> Option<ResolvedTarget> {
        let online = self.online.lock();
        match selector {
            TargetSelector::Console => None,
            TargetSelector::Name(name) => online.iter().find(|p| p.name.eq_ignore_ascii_case(name)).cloned(),
            TargetSelector::Uuid(uuid) => online.iter().find(|p| p.uuid == *uuid).cloned(),
        }
    }

    fn execute_console(&self, command: &str) {
        self.console.lock().push(command.to_string());
    }

    fn execute_for(&self, target: &ResolvedTarget, sender: SenderKind, command: &str) {
        self.player.lock().push(PlayerCall {
            player: target.name.clone(),
            sender,
            command: command.to_string(),
        });
    }
}

/// Log sink shared between a test and a `tracing_subscriber::fmt` layer.
#[derive(Clone, Default)]
pub struct CapturedLogs {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl CapturedLogs {
    /// Install a subscriber writing into the returned sink for the current
    /// thread. Keep the guard alive for the duration of the test.
    pub fn install() -> (Self, tracing::subscriber::DefaultGuard) {
        let logs = Self::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        (logs, guard)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buf.lock()).into_owned()
    }

    /// Captured lines containing `needle`.
    pub fn lines_with(&self, needle: &str) -> Vec<String> {
        self.contents()
            .lines()
            .filter(|line| line.contains(needle))
            .map(str::to_string)
            .collect()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.buf.lock().extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
