// # Connection State Machine
//
// One state per descriptor. Transitions are the only legal mutation; an
// illegal transition is a programming error surfaced as INVARIANT_VIOLATED
// rather than silently absorbed. Every transition emits `connection.state`.
//
// ```text
// DISCONNECTED -> CONNECTING -> CONNECTED
// CONNECTED -> DEGRADED (probe failure, retries in flight)
// DEGRADED -> CONNECTED (probe recovery)
// DEGRADED -> ERROR (retries exhausted)
// CONNECTED/DEGRADED -> DISCONNECTING -> DISCONNECTED
// any -> ERROR (fatal driver error)
// ERROR -> CONNECTING (supervised reconnect)
// ```

use crate::concurrent::{topics, EventBus};
use crate::error::{DbError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
    Disconnecting,
    Error,
}

impl ConnectionState {
    pub fn is_usable(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Degraded)
    }

    fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        // Fatal driver errors can strike from anywhere.
        if next == Error {
            return true;
        }
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Degraded)
                | (Degraded, Connected)
                | (Connected, Disconnecting)
                | (Degraded, Disconnecting)
                | (Disconnecting, Disconnected)
                | (Error, Connecting)
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Degraded => "DEGRADED",
            ConnectionState::Disconnecting => "DISCONNECTING",
            ConnectionState::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Per-descriptor state holder. Shared between the pool and its probes.
pub struct ConnectionStateMachine {
    descriptor_name: String,
    state: RwLock<ConnectionState>,
    bus: Option<Arc<EventBus>>,
}

impl ConnectionStateMachine {
    pub fn new(descriptor_name: &str, bus: Option<Arc<EventBus>>) -> Self {
        Self {
            descriptor_name: descriptor_name.to_string(),
            state: RwLock::new(ConnectionState::Disconnected),
            bus,
        }
    }

    pub fn current(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Apply a transition, emitting `connection.state` on success.
    pub fn transition(&self, next: ConnectionState) -> Result<()> {
        let previous = {
            let mut state = self.state.write();
            let previous = *state;
            if previous == next {
                return Ok(());
            }
            if !previous.can_transition_to(next) {
                return Err(DbError::InvalidTransition {
                    from: previous.to_string(),
                    to: next.to_string(),
                });
            }
            *state = next;
            previous
        };

        tracing::debug!(
            connection = %self.descriptor_name,
            from = %previous,
            to = %next,
            "connection state change"
        );
        if let Some(bus) = &self.bus {
            bus.emit(
                topics::CONNECTION_STATE,
                "pool",
                serde_json::json!({
                    "connection": self.descriptor_name,
                    "from": previous.to_string(),
                    "to": next.to_string(),
                }),
            );
        }
        Ok(())
    }

    /// Record a fatal error with its redacted message on `connection.error`.
    pub fn fail(&self, message: &str) {
        let _ = self.transition(ConnectionState::Error);
        if let Some(bus) = &self.bus {
            bus.emit(
                topics::CONNECTION_ERROR,
                "pool",
                serde_json::json!({
                    "connection": self.descriptor_name,
                    "error": message,
                }),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_is_legal() {
        let fsm = ConnectionStateMachine::new("c1", None);
        fsm.transition(ConnectionState::Connecting).unwrap();
        fsm.transition(ConnectionState::Connected).unwrap();
        fsm.transition(ConnectionState::Degraded).unwrap();
        fsm.transition(ConnectionState::Connected).unwrap();
        fsm.transition(ConnectionState::Disconnecting).unwrap();
        fsm.transition(ConnectionState::Disconnected).unwrap();
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let fsm = ConnectionStateMachine::new("c1", None);
        let err = fsm.transition(ConnectionState::Connected).unwrap_err();
        assert_eq!(err.code(), "INVALID_TRANSITION");
        assert_eq!(fsm.current(), ConnectionState::Disconnected);
    }

    #[test]
    fn error_is_reachable_from_anywhere_and_recoverable() {
        let fsm = ConnectionStateMachine::new("c1", None);
        fsm.transition(ConnectionState::Connecting).unwrap();
        fsm.transition(ConnectionState::Connected).unwrap();
        fsm.transition(ConnectionState::Error).unwrap();
        fsm.transition(ConnectionState::Connecting).unwrap();
        fsm.transition(ConnectionState::Connected).unwrap();
    }

    #[tokio::test]
    async fn transitions_emit_events() {
        let bus = Arc::new(EventBus::new());
        let (_id, mut rx) = bus.subscribe_channel("connection.*");
        let fsm = ConnectionStateMachine::new("c1", Some(Arc::clone(&bus)));
        fsm.transition(ConnectionState::Connecting).unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, topics::CONNECTION_STATE);
        assert_eq!(msg.payload["connection"], "c1");
        assert_eq!(msg.payload["to"], "CONNECTING");
    }
}
