use std::fmt::Display;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::info;

/// The state of the serial link to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No link. Commands fail with [`crate::error::Error::LinkDown`].
    Disconnected,

    /// Trying to open the link.
    Connecting,

    /// The link is open and commands are sent to the device.
    Connected,
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// A state transition, with the time it happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    /// The state entered.
    pub state: ConnectionState,

    /// When the state was entered.
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Publishes connection state.
///
/// The current state can be read at any time,
/// and every actual change is broadcast to subscribers.
/// Setting the same state twice does not broadcast twice.
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    current: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<StatusEvent>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStatus {
    /// Starts out [`ConnectionState::Disconnected`].
    pub fn new() -> Self {
        let (current, _) = watch::channel(ConnectionState::Disconnected);
        let (transitions, _) = broadcast::channel(64);

        Self {
            current,
            transitions,
        }
    }

    /// The current state.
    pub fn get(&self) -> ConnectionState {
        *self.current.borrow()
    }

    /// Enter a state.
    /// Returns `true` if this was a change, in which case it was broadcast.
    pub fn set(&self, state: ConnectionState) -> bool {
        let changed = self.current.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });

        if changed {
            info!(%state, "Connection state changed");

            // No subscribers is fine.
            let _ = self.transitions.send(StatusEvent {
                state,
                timestamp: chrono::Utc::now(),
            });
        }

        changed
    }

    /// Receive every state change from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.transitions.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_disconnected() {
        assert_eq!(ConnectionStatus::new().get(), ConnectionState::Disconnected);
    }

    #[test]
    fn only_changes_are_broadcast() {
        let status = ConnectionStatus::new();
        let mut rx = status.subscribe();

        assert!(!status.set(ConnectionState::Disconnected));
        assert!(status.set(ConnectionState::Connecting));
        assert!(status.set(ConnectionState::Connected));
        assert!(!status.set(ConnectionState::Connected));
        assert!(status.set(ConnectionState::Disconnected));

        let seen = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|event| event.state)
            .collect::<Vec<_>>();

        assert_eq!(
            seen,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected
            ]
        );
    }
}
