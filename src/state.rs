// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Connection state machine.

use thiserror::Error;
use tracing::debug;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Doing nothing.
    None,
    /// Accepting incoming connections.
    Listening,
    /// Initiating an outgoing connection.
    Connecting,
    /// Connected to a remote device.
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::None => "NONE",
            ConnectionState::Listening => "LISTENING",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
        }
    }

    /// Whether `next` may follow this state.
    ///
    /// Stopping and connecting are legal from anywhere. Listening is only
    /// entered while idle, and a socket only becomes connected out of
    /// listening or connecting.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        match next {
            ConnectionState::None | ConnectionState::Connecting => true,
            ConnectionState::Listening => {
                matches!(self, ConnectionState::None | ConnectionState::Listening)
            }
            ConnectionState::Connected => {
                matches!(self, ConnectionState::Listening | ConnectionState::Connecting)
            }
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid state transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// Tracks the current state and rejects illegal transitions.
#[derive(Debug)]
pub struct StateMachine {
    state: ConnectionState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            state: ConnectionState::None,
        }
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Move to `next`, returning the previous state.
    pub fn transition(
        &mut self,
        next: ConnectionState,
    ) -> Result<ConnectionState, InvalidTransition> {
        let from = self.state;
        if !from.can_transition_to(next) {
            return Err(InvalidTransition { from, to: next });
        }
        debug!("setState() {} -> {}", from, next);
        self.state = next;
        Ok(from)
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.state == ConnectionState::Connecting
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_lifecycle() {
        let mut machine = StateMachine::new();
        assert_eq!(machine.state(), ConnectionState::None);

        machine.transition(ConnectionState::Connecting).unwrap();
        assert!(machine.is_connecting());
        assert!(!machine.is_connected());

        machine.transition(ConnectionState::Connected).unwrap();
        assert!(machine.is_connected());
        assert!(!machine.is_connecting());

        assert_eq!(
            machine.transition(ConnectionState::None).unwrap(),
            ConnectionState::Connected
        );
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut machine = StateMachine::new();
        machine.transition(ConnectionState::None).unwrap();
        machine.transition(ConnectionState::None).unwrap();
        assert_eq!(machine.state(), ConnectionState::None);
    }

    #[test]
    fn test_connect_legal_from_any_state() {
        for from in [
            ConnectionState::None,
            ConnectionState::Listening,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ] {
            assert!(from.can_transition_to(ConnectionState::Connecting));
        }
    }

    #[test]
    fn test_listening_only_from_idle() {
        assert!(ConnectionState::None.can_transition_to(ConnectionState::Listening));
        assert!(!ConnectionState::Connecting.can_transition_to(ConnectionState::Listening));
        assert!(!ConnectionState::Connected.can_transition_to(ConnectionState::Listening));
    }

    #[test]
    fn test_connected_requires_pending_socket() {
        let mut machine = StateMachine::new();
        let err = machine.transition(ConnectionState::Connected).unwrap_err();
        assert_eq!(err.from, ConnectionState::None);
        assert_eq!(machine.state(), ConnectionState::None);

        machine.transition(ConnectionState::Listening).unwrap();
        machine.transition(ConnectionState::Connected).unwrap();
        assert!(machine
            .transition(ConnectionState::Connected)
            .is_err());
    }
}
