use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of the supervised server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    /// No process; initial and clean terminal state
    Stopped,
    /// Process spawned, waiting for the start line
    Starting,
    /// Start line seen, waiting for the server to register
    WaitingRegistration,
    /// Registered and reachable
    Running,
    /// Shutdown instruction sent, waiting for the process to exit
    Stopping,
    /// Process exited unexpectedly or never came up
    Crashed,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::Stopped => "stopped",
            ServerState::Starting => "starting",
            ServerState::WaitingRegistration => "waiting_registration",
            ServerState::Running => "running",
            ServerState::Stopping => "stopping",
            ServerState::Crashed => "crashed",
        }
    }

    /// True while a server process is expected to be alive.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ServerState::Starting
                | ServerState::WaitingRegistration
                | ServerState::Running
                | ServerState::Stopping
        )
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs that drive the lifecycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Supervisor-issued start (operator command or restart policy)
    Start,
    /// A `start` line was classified
    StartDetected,
    /// A `registered` line was classified
    RegisteredDetected,
    /// Operator-issued graceful shutdown
    Shutdown,
    /// Global termination: graceful shutdown from any live state
    Halt,
    /// The process exited (after a shutdown request or not)
    Exited,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Start => "start",
            Trigger::StartDetected => "start_detected",
            Trigger::RegisteredDetected => "registered_detected",
            Trigger::Shutdown => "shutdown",
            Trigger::Halt => "halt",
            Trigger::Exited => "exited",
        }
    }
}

/// A completed state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ServerState,
    pub to: ServerState,
    pub trigger: Trigger,
}

/// The lifecycle state machine.
///
/// Holds exactly one [`ServerState`] and only moves along these edges:
///
/// ```text
/// Stopped | Crashed                     --Start-------------->  Starting
/// Starting                              --StartDetected------>  WaitingRegistration
/// WaitingRegistration                   --RegisteredDetected->  Running
/// Running                               --Shutdown----------->  Stopping
/// Starting | WaitingRegistration | Running --Halt------------>  Stopping
/// Stopping                              --Exited------------->  Stopped
/// Starting | WaitingRegistration | Running --Exited---------->  Crashed
/// ```
///
/// Anything else is rejected with [`Error::InvalidState`] and leaves the
/// state untouched.
#[derive(Debug)]
pub struct Lifecycle {
    state: ServerState,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: ServerState::Stopped,
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Target state for `trigger` from the current state, if the edge exists.
    pub fn target(&self, trigger: Trigger) -> Option<ServerState> {
        use ServerState::*;

        match (self.state, trigger) {
            (Stopped | Crashed, Trigger::Start) => Some(Starting),
            (Starting, Trigger::StartDetected) => Some(WaitingRegistration),
            (WaitingRegistration, Trigger::RegisteredDetected) => Some(Running),
            (Running, Trigger::Shutdown) => Some(Stopping),
            (Starting | WaitingRegistration | Running, Trigger::Halt) => Some(Stopping),
            (Stopping, Trigger::Exited) => Some(Stopped),
            (Starting | WaitingRegistration | Running, Trigger::Exited) => Some(Crashed),
            _ => None,
        }
    }

    /// Apply `trigger`, returning the transition taken.
    pub fn apply(&mut self, trigger: Trigger) -> Result<Transition> {
        let to = self.target(trigger).ok_or_else(|| Error::InvalidState {
            command: trigger.as_str().to_string(),
            state: self.state,
        })?;

        let transition = Transition {
            from: self.state,
            to,
            trigger,
        };
        tracing::debug!(from = %transition.from, to = %to, trigger = trigger.as_str(), "State transition");
        self.state = to;
        Ok(transition)
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
