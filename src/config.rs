//! Network Configuration
//!
//! Settings shared by the host and the client. Loaded from a JSON file,
//! then overridden from `ARENA_*` environment variables.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::{Position, BATCH_HEADER_SIZE, HEADER_SIZE, SYNC_ENTRY_SIZE};

/// Highest peer limit the game supports (one per player slot).
pub const MAX_PEERS: usize = 4;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Peer limit outside 1..=4.
    #[error("peer limit {0} out of range 1..={MAX_PEERS}")]
    PeerLimit(usize),

    /// Buffer cannot hold a batch header plus the largest fixed message.
    #[error("buffer size {size} too small, need at least {minimum}")]
    BufferTooSmall {
        /// Configured size.
        size: usize,
        /// Smallest usable size.
        minimum: usize,
    },

    /// Address is not an IP literal.
    #[error("invalid address {0:?}")]
    Address(String),

    /// Environment override could not be parsed.
    #[error("invalid value {value:?} for {var}")]
    Env {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
    },

    /// A timer is zero or the tick rate is zero.
    #[error("{0} must be non-zero")]
    Zero(&'static str),

    /// Config file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid JSON.
    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
}

/// Order in which pending packages are dispatched on a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOrder {
    /// First published, first dispatched.
    #[default]
    Arrival,
    /// Pool slot order regardless of arrival.
    PoolSlot,
}

/// Network settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Host address (client dials it, host binds it).
    pub address: String,
    /// Port the client connects to.
    pub connect_port: u16,
    /// Port the host listens on. Zero picks an ephemeral port.
    pub listen_port: u16,
    /// Maximum admitted peers.
    pub peer_limit: usize,
    /// Listen backlog.
    pub listen_backlog: u32,
    /// Fixed send/receive buffer size in bytes.
    pub buffer_size: usize,
    /// Packages allocated up front.
    pub initial_packages: usize,
    /// Simulation tick rate (Hz).
    pub tick_rate: u32,
    /// Time between liveness probes.
    #[serde(with = "secs")]
    pub ping_interval: Duration,
    /// How long a probe waits for replies.
    #[serde(with = "secs")]
    pub probe_window: Duration,
    /// Missed windows before a peer is dropped.
    pub max_strikes: u32,
    /// Time between periodic `Synchronize` broadcasts.
    #[serde(with = "secs")]
    pub sync_interval: Duration,
    /// Start position per gameId (index 0 is gameId 1).
    pub spawn_points: [Position; MAX_PEERS],
    /// Lives a freshly spawned player starts with.
    pub initial_lives: i32,
    /// Score a freshly spawned player starts with.
    pub initial_score: i32,
    /// Package dispatch order.
    pub dispatch_order: DispatchOrder,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            connect_port: 1025,
            listen_port: 1025,
            peer_limit: 1,
            listen_backlog: 100,
            buffer_size: 1024,
            initial_packages: 40,
            tick_rate: crate::TICK_RATE,
            ping_interval: Duration::from_secs(5),
            probe_window: Duration::from_secs(30),
            max_strikes: 3,
            sync_interval: Duration::from_secs(15),
            spawn_points: [
                Position::new(-6.0, -3.0),
                Position::new(-2.0, -3.0),
                Position::new(2.0, -3.0),
                Position::new(6.0, -3.0),
            ],
            initial_lives: 3,
            initial_score: 0,
            dispatch_order: DispatchOrder::Arrival,
        }
    }
}

/// Smallest buffer able to carry one batch with the largest fixed message,
/// or a `Synchronize` of a full table.
pub fn minimum_buffer_size() -> usize {
    let full_sync = HEADER_SIZE + 4 + SYNC_ENTRY_SIZE * MAX_PEERS;
    BATCH_HEADER_SIZE + full_sync
}

fn env_parse<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Env { var, value }),
        Err(_) => Ok(None),
    }
}

impl NetConfig {
    /// Defaults overridden from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env()
    }

    /// Load a JSON file (missing fields take defaults), then apply env overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.with_env()
    }

    /// Apply `ARENA_*` overrides and validate.
    pub fn with_env(mut self) -> Result<Self, ConfigError> {
        if let Ok(address) = std::env::var("ARENA_ADDRESS") {
            self.address = address;
        }
        if let Some(port) = env_parse("ARENA_PORT")? {
            self.connect_port = port;
        }
        if let Some(port) = env_parse("ARENA_LISTEN_PORT")? {
            self.listen_port = port;
        }
        if let Some(limit) = env_parse("ARENA_PEER_LIMIT")? {
            self.peer_limit = limit;
        }
        if let Some(size) = env_parse("ARENA_BUFFER_SIZE")? {
            self.buffer_size = size;
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject settings the network layer cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_PEERS).contains(&self.peer_limit) {
            return Err(ConfigError::PeerLimit(self.peer_limit));
        }
        let minimum = minimum_buffer_size();
        if self.buffer_size < minimum {
            return Err(ConfigError::BufferTooSmall { size: self.buffer_size, minimum });
        }
        self.ip()?;
        if self.tick_rate == 0 {
            return Err(ConfigError::Zero("tick_rate"));
        }
        if self.ping_interval.is_zero() {
            return Err(ConfigError::Zero("ping_interval"));
        }
        if self.probe_window.is_zero() {
            return Err(ConfigError::Zero("probe_window"));
        }
        if self.sync_interval.is_zero() {
            return Err(ConfigError::Zero("sync_interval"));
        }
        if self.max_strikes == 0 {
            return Err(ConfigError::Zero("max_strikes"));
        }
        Ok(())
    }

    fn ip(&self) -> Result<IpAddr, ConfigError> {
        self.address.parse().map_err(|_| ConfigError::Address(self.address.clone()))
    }

    /// Address the host binds.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        Ok(SocketAddr::new(self.ip()?, self.listen_port))
    }

    /// Address the client dials.
    pub fn connect_addr(&self) -> Result<SocketAddr, ConfigError> {
        Ok(SocketAddr::new(self.ip()?, self.connect_port))
    }

    /// Tick period derived from `tick_rate`.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate.max(1) as f64)
    }
}

/// Durations as fractional seconds in config files.
mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
