//! Appliance Lifecycle State Machine
//!
//! Defines the valid connection lifecycle transitions of an appliance:
//! `Unconnected -> Connecting -> Connected -> Disconnecting -> Unconnected`.

use serde::{Deserialize, Serialize};

/// Connection lifecycle state of an appliance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApplianceState {
    #[default]
    Unconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ApplianceState {
    /// Commands may only be sent in this state
    pub fn accepts_commands(&self) -> bool {
        *self == ApplianceState::Connected
    }
}

/// Events that can trigger state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// `connect` was called
    ConnectRequested,
    /// Shell session opened
    ConnectSucceeded,
    /// `before_connect` hook or transport failure
    ConnectFailed,
    /// `disconnect` was called
    DisconnectRequested,
    /// Session closed
    DisconnectCompleted,
}

/// Result of a state transition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Transition was valid and state changed
    Moved(ApplianceState),
    /// Transition was invalid from current state
    Invalid {
        from: ApplianceState,
        event: LifecycleEvent,
    },
}

/// The lifecycle state machine for one appliance instance
#[derive(Debug, Default)]
pub struct LifecycleStateMachine {
    current_state: ApplianceState,
}

impl LifecycleStateMachine {
    /// Create a new state machine in Unconnected state
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current state
    pub fn state(&self) -> ApplianceState {
        self.current_state
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: LifecycleEvent) -> Transition {
        match self.next_state(event) {
            Some(state) => {
                self.current_state = state;
                Transition::Moved(state)
            }
            None => Transition::Invalid {
                from: self.current_state,
                event,
            },
        }
    }

    fn next_state(&self, event: LifecycleEvent) -> Option<ApplianceState> {
        use ApplianceState::*;
        use LifecycleEvent::*;

        match (self.current_state, event) {
            (Unconnected, ConnectRequested) => Some(Connecting),
            (Connecting, ConnectSucceeded) => Some(Connected),
            (Connecting, ConnectFailed) => Some(Unconnected),

            (Connected, DisconnectRequested) => Some(Disconnecting),
            // A half-open connect is torn down through the same path
            (Connecting, DisconnectRequested) => Some(Disconnecting),
            (Disconnecting, DisconnectCompleted) => Some(Unconnected),

            _ => None,
        }
    }
}
