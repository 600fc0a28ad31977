//! Event types for the Ensemble event system
//!
//! Provides the shared event definitions and the `EventBus` used by the
//! player and any attached control frontends.
//!
//! # Architecture
//!
//! Ensemble uses hybrid communication:
//! - **EventBus** (`tokio::broadcast`): one-to-many status broadcasting
//! - **Command channels** (`tokio::mpsc`): request → single handler
//!
//! Events are broadcast via the EventBus and can be serialized for
//! transmission to remote clients.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Player state
///
/// Process-wide; transitions happen only on the player thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerState {
    Stopped,
    Paused,
    Playing,
}

impl std::fmt::Display for PlayerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlayerState::Stopped => write!(f, "stopped"),
            PlayerState::Paused => write!(f, "paused"),
            PlayerState::Playing => write!(f, "playing"),
        }
    }
}

/// Repeat mode for the play queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatMode {
    Off,
    Song,
    All,
}

/// Ensemble player events
///
/// Broadcast on every status edge so frontends can refresh their view.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PlayerEvent {
    /// Player status edge
    ///
    /// Emitted once per state transition and once per now-playing change
    /// (track advance re-emits Playing). Frontends treat this as a "poll
    /// me" notification and fetch full status separately.
    StatusUpdate {
        /// State after the edge
        state: PlayerState,
        /// When the edge occurred
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A remote output device appeared or changed in the registry
    DeviceChanged {
        /// Device identifier
        device_id: u64,
        /// When the registry changed
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

/// Broadcast bus for [`PlayerEvent`]
///
/// Thin wrapper over `tokio::sync::broadcast` so emitters do not have to
/// care whether anyone is listening.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PlayerEvent>,
    capacity: usize,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to the event stream
    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, failing if there are no subscribers
    pub fn emit(&self, event: PlayerEvent) -> Result<usize, broadcast::error::SendError<PlayerEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring the no-subscribers case
    pub fn emit_lossy(&self, event: PlayerEvent) {
        let _ = self.tx.send(event);
    }

    /// Number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eventbus_new() {
        let bus = EventBus::new(64);
        assert_eq!(bus.capacity(), 64);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_eventbus_emit_no_subscribers() {
        let bus = EventBus::new(16);
        let event = PlayerEvent::StatusUpdate {
            state: PlayerState::Playing,
            timestamp: chrono::Utc::now(),
        };

        assert!(bus.emit(event.clone()).is_err());

        // Lossy emission must not fail
        bus.emit_lossy(event);
    }

    #[tokio::test]
    async fn test_eventbus_emit_with_subscriber() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit_lossy(PlayerEvent::StatusUpdate {
            state: PlayerState::Paused,
            timestamp: chrono::Utc::now(),
        });

        match rx.recv().await.unwrap() {
            PlayerEvent::StatusUpdate { state, .. } => assert_eq!(state, PlayerState::Paused),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_player_state_roundtrip() {
        let json = serde_json::to_string(&PlayerState::Playing).unwrap();
        assert_eq!(json, "\"playing\"");
    }
}
