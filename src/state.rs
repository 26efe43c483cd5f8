// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection State
//!
//! States and lifecycle notifications published by the connection supervisor.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Recovering -> Connected
//!      ^              |             |             |
//!      +--------------+-------------+-------------+  (failure, recovery disabled, shutdown)
//! ```

use std::fmt;

/// Current state of the supervised broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection. Initial state, and terminal state after shutdown.
    #[default]
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// A live session is available.
    Connected,
    /// The connection was lost and is being re-established at a fixed interval.
    Recovering,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Recovering => "Recovering",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle notifications, broadcast to every subscriber of the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// The initial connection succeeded and session `session` is live.
    Connected { session: u64 },
    /// The connection was lost without being asked to close.
    ConnectionLost { reason: String },
    /// Automatic recovery started.
    RecoveryStarted,
    /// Recovery succeeded; every broker-side declaration must be redone on `session`.
    Recovered { session: u64, attempts: u32 },
    /// The connection was lost and automatic recovery is disabled.
    Disconnected { reason: String },
    /// The supervisor was shut down.
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connected_is_connected() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
        assert!(!ConnectionState::Recovering.is_connected());
        assert!(!ConnectionState::Disconnected.is_connected());
    }

    #[test]
    fn displays_state_name() {
        assert_eq!(ConnectionState::Recovering.to_string(), "Recovering");
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }
}
