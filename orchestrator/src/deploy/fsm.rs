//! Finite State Machine for cluster bootstrap

use serde::{Deserialize, Serialize};

/// Bootstrap state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapState {
    /// Nodes are up, nothing configured yet
    Pending,

    /// First node initialized
    Initialized,

    /// Every other node added to the first one
    Joined,

    /// Rebalance requested
    Rebalancing,

    /// No background task running
    Ready,

    /// Bootstrap failed
    Failed,
}

/// Bootstrap event
#[derive(Debug, Clone)]
pub enum BootstrapEvent {
    /// First node configured
    FirstNodeInitialized,

    /// Remaining nodes added
    NodesJoined,

    /// Rebalance started
    RebalanceStarted,

    /// Background tasks drained
    TasksDrained,

    /// A step failed
    Failed(String),
}

/// Linear bootstrap FSM. States only move forward; any failure is final.
#[derive(Debug, Clone)]
pub struct BootstrapFsm {
    state: BootstrapState,
    error: Option<String>,
}

impl BootstrapFsm {
    /// Create a new FSM in pending state
    pub fn new() -> Self {
        Self {
            state: BootstrapState::Pending,
            error: None,
        }
    }

    /// Get current state
    pub fn state(&self) -> BootstrapState {
        self.state
    }

    /// Get error message if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, BootstrapState::Ready | BootstrapState::Failed)
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: BootstrapEvent) -> Result<BootstrapState, String> {
        let new_state = match (&self.state, &event) {
            (BootstrapState::Pending, BootstrapEvent::FirstNodeInitialized) => {
                BootstrapState::Initialized
            }
            (BootstrapState::Initialized, BootstrapEvent::NodesJoined) => BootstrapState::Joined,
            (BootstrapState::Joined, BootstrapEvent::RebalanceStarted) => {
                BootstrapState::Rebalancing
            }
            (BootstrapState::Rebalancing, BootstrapEvent::TasksDrained) => BootstrapState::Ready,

            (state, BootstrapEvent::Failed(err)) if !matches!(state, BootstrapState::Ready | BootstrapState::Failed) => {
                self.error = Some(err.clone());
                BootstrapState::Failed
            }

            // Invalid transitions
            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        self.state = new_state;
        Ok(new_state)
    }
}

impl Default for BootstrapFsm {
    fn default() -> Self {
        Self::new()
    }
}
