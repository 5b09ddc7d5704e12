//! Connector state machine.
//!
//! [`transition`] is a pure function; the supervisor task is the only caller
//! and therefore the only writer of the current state.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    ConnectedPrimary,
    DegradedFallback,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    /// Whether sends should start at the primary transport.
    pub fn primary_usable(&self) -> bool {
        matches!(self, ConnectionState::ConnectedPrimary)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::ConnectedPrimary => "connected_primary",
            ConnectionState::DegradedFallback => "degraded_fallback",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    Start,
    HandshakeSucceeded,
    HandshakeFailed,
    /// `missed_heartbeats` consecutive heartbeats failed on the primary.
    HeartbeatsMissed,
    PrimarySendFailed,
    ProbeDue,
    ProbeSucceeded,
    ProbeFailed,
    Drain,
}

/// Next state for `event`, or `None` if the event does not apply.
pub fn transition(current: ConnectionState, event: StateEvent) -> Option<ConnectionState> {
    use ConnectionState::*;
    use StateEvent::*;

    match (current, event) {
        (Closed, _) => None,
        (_, Drain) => Some(Closed),
        (Disconnected, Start) => Some(Connecting),
        (Connecting, HandshakeSucceeded) => Some(ConnectedPrimary),
        (Connecting, HandshakeFailed) => Some(DegradedFallback),
        (ConnectedPrimary, HeartbeatsMissed | PrimarySendFailed) => Some(DegradedFallback),
        (DegradedFallback, ProbeDue) => Some(Reconnecting),
        (Reconnecting, ProbeSucceeded) => Some(ConnectedPrimary),
        (Reconnecting, ProbeFailed) => Some(DegradedFallback),
        _ => None,
    }
}
