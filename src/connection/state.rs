use std::fmt;

/// Lifecycle of the relay connection.
///
/// ```text
/// Disconnected -> Connecting -> Connected -> Authenticated
///                     ^                          |
///                     |                          v
///                Reconnecting <------------- Draining
/// ```
///
/// Any live state may drop to `Disconnected` or `Reconnecting`; `Closed` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticated,
    Draining,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, next) {
            (Closed, _) => false,
            (_, Closed) | (_, Disconnected) => true,
            (Disconnected, Connecting) => true,
            (Connecting, Connected) | (Connecting, Reconnecting) => true,
            (Connected, Authenticated) | (Connected, Reconnecting) => true,
            (Authenticated, Draining) | (Authenticated, Reconnecting) => true,
            (Draining, Reconnecting) | (Draining, Connecting) => true,
            (Reconnecting, Connecting) => true,
            _ => false,
        }
    }

    /// States in which a send should wait for the next authenticated
    /// connection rather than fail.
    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::Connected
                | ConnectionState::Draining
                | ConnectionState::Reconnecting
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Authenticated => "authenticated",
            ConnectionState::Draining => "draining",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}
