//! Network Events
//!
//! Everything the network layer tells gameplay about, delivered through a
//! [`NetHandler`] passed into each tick.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::network::records::PeerRecord;
use crate::protocol::{GameState, InputType, NetId, Position};

/// Why a peer went away.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectCause {
    /// Remote closed the socket or it failed.
    Closed,
    /// Missed too many liveness probes.
    Unresponsive,
    /// Local shutdown.
    Shutdown,
}

/// Event raised by the host or client during a tick.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NetEvent {
    /// Client admitted by the host.
    Connected { net_id: NetId },

    /// Client could not reach the host.
    ConnectionFailed { reason: String },

    /// Host was full and refused the client.
    Rejected,

    /// Host closed the connection.
    HostClosed,

    /// Host admitted a peer.
    PeerConnected { net_id: NetId },

    /// Peer asked for simulation broadcasts.
    PeerReady { net_id: NetId },

    /// Peer removed from the host.
    PeerDisconnected { net_id: NetId, cause: DisconnectCause },

    /// New player record (create its actor).
    PlayerSpawned { record: PeerRecord },

    /// Existing player record refreshed by a `Synchronize`.
    PlayerSynchronized { record: PeerRecord },

    /// Player's actor must be destroyed. Raised before the record is removed.
    ActorDestroyed { record: PeerRecord },

    /// Player input to apply.
    Input { net_id: NetId, input: InputType },

    /// Game flow changed.
    GameStateChanged { state: GameState },

    /// Obstacle spawned on a path.
    BubbleSpawned { path_type: i32 },

    /// Bullet destroyed a bubble; `score` is the shooter's new score.
    BulletCollision { net_id: NetId, bullet_id: u32, bubble_id: u32, score: i32 },

    /// Bubble hit a ship; `lives` is what remains.
    ShipCollision { net_id: NetId, bubble_id: u32, lives: i32 },

    /// Ship respawned.
    Respawned { net_id: NetId, position: Position },

    /// Authoritative position received.
    PositionCorrected { net_id: NetId, position: Position },

    /// A peer voted to start.
    StartVote { net_id: NetId, votes: usize, needed: usize },
}

/// Receiver of [`NetEvent`]s.
pub trait NetHandler {
    /// Handle one event.
    fn on_event(&mut self, event: NetEvent);
}

impl NetHandler for Vec<NetEvent> {
    fn on_event(&mut self, event: NetEvent) {
        self.push(event);
    }
}

impl NetHandler for mpsc::UnboundedSender<NetEvent> {
    fn on_event(&mut self, event: NetEvent) {
        if self.send(event).is_err() {
            tracing::trace!("event receiver dropped");
        }
    }
}
