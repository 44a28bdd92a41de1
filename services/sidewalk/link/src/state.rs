//! Link state machine transitions.

use serde::Serialize;

use crate::LinkError;

/// Connection state of the BLE link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LinkState {
    /// Idle
    Disconnected,
    /// Beacon on air, waiting for a central
    Advertising,
    /// Connection being set up
    Connecting,
    /// Data PDUs may flow
    Connected,
    /// Teardown requested, waiting for the radio
    Disconnecting,
}

/// Inputs driving the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkInput {
    /// Application enabled advertising
    StartAdvertising,
    /// Application disabled advertising
    StopAdvertising,
    /// Radio started a connection attempt
    ConnectInitiated,
    /// Radio reported the link up
    Connected,
    /// Radio reported the link down
    Disconnected,
    /// Application asked for teardown
    DisconnectRequested,
    /// No traffic within the inactivity timeout
    InactivityTimeout,
}

impl LinkInput {
    fn name(self) -> &'static str {
        match self {
            LinkInput::StartAdvertising => "start_advertising",
            LinkInput::StopAdvertising => "stop_advertising",
            LinkInput::ConnectInitiated => "connect_initiated",
            LinkInput::Connected => "connected",
            LinkInput::Disconnected => "disconnected",
            LinkInput::DisconnectRequested => "disconnect_requested",
            LinkInput::InactivityTimeout => "inactivity_timeout",
        }
    }
}

impl LinkState {
    /// State reached from `self` on `input`
    pub fn next(self, input: LinkInput) -> Result<LinkState, LinkError> {
        use LinkInput as I;
        use LinkState as S;

        match (self, input) {
            (S::Disconnected, I::StartAdvertising) => Ok(S::Advertising),
            (S::Advertising, I::StopAdvertising) => Ok(S::Disconnected),
            (S::Disconnected | S::Advertising, I::ConnectInitiated) => Ok(S::Connecting),
            (S::Advertising | S::Connecting, I::Connected) => Ok(S::Connected),
            (S::Connecting | S::Connected | S::Disconnecting, I::Disconnected) => {
                Ok(S::Disconnected)
            }
            (S::Connected, I::DisconnectRequested | I::InactivityTimeout) => Ok(S::Disconnecting),
            (from, input) => Err(LinkError::InvalidState {
                from,
                event: input.name(),
            }),
        }
    }

    /// Whether data PDUs may be sent
    pub fn is_connected(self) -> bool {
        self == LinkState::Connected
    }
}
