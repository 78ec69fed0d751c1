//! Protocol Messages
//!
//! Typed model of every message carried between the host and its peers.
//! The byte layout lives in [`crate::protocol::codec`]; this module only
//! describes what a message *means*.

use serde::{Serialize, Deserialize};

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Host-assigned connection identifier.
///
/// Monotonically increasing and never reused while the host runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NetId(pub i32);

impl std::fmt::Display for NetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "net#{}", self.0)
    }
}

/// In-game player slot (1..=4).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GameId(pub i32);

impl GameId {
    /// Lowest valid slot.
    pub const FIRST: GameId = GameId(1);
    /// Highest valid slot.
    pub const LAST: GameId = GameId(4);

    /// Zero-based index into per-slot tables (spawn points).
    pub fn slot_index(self) -> Option<usize> {
        if (Self::FIRST.0..=Self::LAST.0).contains(&self.0) {
            Some((self.0 - 1) as usize)
        } else {
            None
        }
    }
}

impl std::fmt::Display for GameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "player{}", self.0)
    }
}

/// 2D world position (32-bit floats on the wire).
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// X coordinate.
    pub x: f32,
    /// Y coordinate.
    pub y: f32,
}

impl Position {
    /// Create a position.
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

// =============================================================================
// ENUMERATED FIELDS
// =============================================================================

/// Declares a wire enum backed by an `i32` discriminant.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($(#[$vmeta:meta])* $variant:ident = $value:expr),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[repr(i32)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $value),+
        }

        impl $name {
            /// All variants in discriminant order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Wire discriminant.
            pub const fn to_wire(self) -> i32 {
                self as i32
            }

            /// Parse a wire discriminant.
            pub fn from_wire(value: i32) -> Option<Self> {
                match value {
                    $(v if v == $value => Some($name::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

wire_enum! {
    /// Message kind token (first header field).
    MessageKind {
        /// Host -> peer: connection admitted, carries the assigned netId.
        SuccessfulConnection = 0,
        /// Host -> peer: peer limit reached, connection will be closed.
        ClientLimitReached = 1,
        /// Peer -> host: request (synchronize, spawn, start, respawn).
        RequestToServer = 2,
        /// Host -> peer: bulk Peer Record snapshot.
        Synchronize = 3,
        /// Host -> peer: a single newly spawned peer.
        SpawnPlayer = 4,
        /// Peer -> host: ready for simulation broadcasts.
        ReadyToUpdate = 5,
        /// Both ways: liveness probe and its reply.
        Ping = 6,
        /// Both ways: player input.
        Input = 7,
        /// Host -> peer: game state change.
        GameState = 8,
        /// Host -> peer: obstacle spawn.
        SpawnBubble = 9,
        /// Host -> peer: bullet or ship collision.
        Collision = 10,
        /// Host -> peer: ship respawn.
        Respawn = 11,
        /// Host -> peer: authoritative position correction.
        PlayerPosition = 12,
    }
}

wire_enum! {
    /// What a peer asks the host to do.
    RequestType {
        /// Send me the full Peer Record table.
        Synchronize = 0,
        /// Spawn my ship.
        Spawn = 1,
        /// I vote to start the game.
        StartGame = 2,
        /// Respawn my ship.
        Respawn = 3,
    }
}

wire_enum! {
    /// Player input action.
    InputType {
        /// Move up.
        Up = 0,
        /// Move down.
        Down = 1,
        /// Move left.
        Left = 2,
        /// Move right.
        Right = 3,
        /// Fire a bullet.
        Shoot = 4,
    }
}

impl InputType {
    /// True for the four movement directions.
    pub fn is_movement(self) -> bool {
        !matches!(self, InputType::Shoot)
    }
}

wire_enum! {
    /// Collision discriminant inside a `Collision` payload.
    CollisionType {
        /// A bubble hit a ship.
        Ship = 0,
        /// A bullet hit a bubble.
        Bullet = 1,
    }
}

wire_enum! {
    /// Game flow state.
    GameState {
        /// No state yet.
        None = 0,
        /// Everyone voted to start.
        StartGame = 1,
        /// Stage transition.
        ChangeStage = 2,
        /// Playing.
        Game = 3,
        /// Nobody has lives left.
        GameOver = 4,
    }
}

// =============================================================================
// PAYLOADS
// =============================================================================

/// One Peer Record as carried by `Synchronize` and `SpawnPlayer`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerSnapshot {
    /// Connection id.
    pub net_id: NetId,
    /// Player slot.
    pub game_id: GameId,
    /// Current position.
    pub position: Position,
    /// Current score.
    pub score: i32,
    /// Lives remaining.
    pub lives: i32,
}

/// Collision details.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Collision {
    /// A bullet fired by the peer destroyed a bubble.
    Bullet {
        /// Bullet identifier (peer-local).
        bullet_id: u32,
        /// Bubble identifier.
        bubble_id: u32,
    },
    /// A bubble hit the peer's ship.
    Ship {
        /// Bubble identifier.
        bubble_id: u32,
        /// Lives left after the hit.
        lives_remaining: i32,
    },
}

impl Collision {
    /// Wire discriminant for this collision.
    pub fn collision_type(&self) -> CollisionType {
        match self {
            Collision::Bullet { .. } => CollisionType::Bullet,
            Collision::Ship { .. } => CollisionType::Ship,
        }
    }
}

// =============================================================================
// MESSAGE
// =============================================================================

/// A decoded protocol message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Connection admitted.
    SuccessfulConnection {
        /// Assigned id.
        net_id: NetId,
    },

    /// Connection refused, the host is full.
    ClientLimitReached,

    /// Peer request.
    RequestToServer {
        /// Requesting peer.
        net_id: NetId,
        /// What is requested.
        request: RequestType,
    },

    /// Full Peer Record table.
    Synchronize {
        /// All known peers.
        peers: Vec<PeerSnapshot>,
    },

    /// A single new peer.
    SpawnPlayer(PeerSnapshot),

    /// Peer is ready for broadcasts.
    ReadyToUpdate {
        /// Ready peer.
        net_id: NetId,
    },

    /// Liveness probe / reply.
    Ping {
        /// Probed peer.
        net_id: NetId,
    },

    /// Player input.
    Input {
        /// Acting peer.
        net_id: NetId,
        /// Action.
        input: InputType,
    },

    /// Game state change.
    GameState {
        /// New state.
        state: GameState,
    },

    /// Spawn an obstacle on a path.
    SpawnBubble {
        /// Path index chosen by the host.
        path_type: i32,
    },

    /// Collision outcome.
    Collision {
        /// Involved peer.
        net_id: NetId,
        /// What collided.
        collision: Collision,
    },

    /// Ship respawn.
    Respawn {
        /// Respawned peer.
        net_id: NetId,
        /// Respawn point.
        position: Position,
    },

    /// Authoritative position.
    PlayerPosition {
        /// Moved peer.
        net_id: NetId,
        /// New position.
        position: Position,
    },
}

impl Message {
    /// Kind token for this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::SuccessfulConnection { .. } => MessageKind::SuccessfulConnection,
            Message::ClientLimitReached => MessageKind::ClientLimitReached,
            Message::RequestToServer { .. } => MessageKind::RequestToServer,
            Message::Synchronize { .. } => MessageKind::Synchronize,
            Message::SpawnPlayer(_) => MessageKind::SpawnPlayer,
            Message::ReadyToUpdate { .. } => MessageKind::ReadyToUpdate,
            Message::Ping { .. } => MessageKind::Ping,
            Message::Input { .. } => MessageKind::Input,
            Message::GameState { .. } => MessageKind::GameState,
            Message::SpawnBubble { .. } => MessageKind::SpawnBubble,
            Message::Collision { .. } => MessageKind::Collision,
            Message::Respawn { .. } => MessageKind::Respawn,
            Message::PlayerPosition { .. } => MessageKind::PlayerPosition,
        }
    }

    /// Serialize to JSON (for logs and debugging tools).
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
