// Copyright (c) Tetherline.
// Licensed under the MIT License.

//! Connection lifecycle states and transitions.

use std::fmt;

/// Part of the lifecycle a connection is currently in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// No channel and no attempt in progress
    Disconnected,
    /// Initial connect attempt in progress
    Connecting,
    /// Channel established and CONNACK accepted
    Connected,
    /// Channel lost unexpectedly; attempts to re-establish are scheduled
    Reconnecting,
    /// User-requested disconnect in progress
    Disconnecting,
}

impl ConnectionState {
    /// Configuration may only change while no handshake or teardown is in
    /// flight.
    pub(crate) fn allows_config_mutation(self) -> bool {
        matches!(self, Self::Disconnected | Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Disconnecting => "disconnecting",
        };
        write!(f, "{name}")
    }
}

/// What the worker must do after the channel goes away, decided by the state
/// observed once the lock is held.
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum ShutdownOutcome {
    /// Unexpected loss while connected: begin reconnect attempts
    BeginReconnect,
    /// An attempt failed while already reconnecting: re-arm the backoff timer
    ContinueReconnect,
    /// User-requested disconnect (or teardown) completed
    FinalizeDisconnect,
    /// The initial connect attempt failed
    ConnectFailed,
}

/// Apply the channel-shutdown transition for the observed state.
pub(crate) fn on_channel_shutdown(state: &mut ConnectionState) -> ShutdownOutcome {
    match *state {
        ConnectionState::Connected => {
            *state = ConnectionState::Reconnecting;
            ShutdownOutcome::BeginReconnect
        }
        ConnectionState::Reconnecting => ShutdownOutcome::ContinueReconnect,
        ConnectionState::Disconnecting => {
            *state = ConnectionState::Disconnected;
            ShutdownOutcome::FinalizeDisconnect
        }
        ConnectionState::Connecting => {
            *state = ConnectionState::Disconnected;
            ShutdownOutcome::ConnectFailed
        }
        // Nothing was up; treat as an already-final teardown
        ConnectionState::Disconnected => ShutdownOutcome::FinalizeDisconnect,
    }
}
