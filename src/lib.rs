//! # Arena Net
//!
//! Authoritative TCP network layer for a small real-time arena game: one
//! host, up to four peers, one persistent connection per peer.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         ARENA NET                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  protocol/         - Wire format (pure)                      │
//! │  ├── message.rs    - Typed messages and wire enums           │
//! │  └── codec.rs      - Fixed-header frame encode/decode        │
//! │                                                              │
//! │  network/          - Transport and dispatch                  │
//! │  ├── pool.rs       - Reusable receive packages               │
//! │  ├── session.rs    - One TCP connection + outbound queue     │
//! │  ├── records.rs    - Peer Records (slot, score, lives)       │
//! │  ├── registry.rs   - Host sessions, ready subset, teardown   │
//! │  ├── liveness.rs   - Ping / strike monitor                   │
//! │  ├── dispatcher.rs - Package drain + handler tables          │
//! │  ├── events.rs     - NetEvent / NetHandler                   │
//! │  ├── host.rs       - Authoritative host                      │
//! │  └── client.rs     - Client                                  │
//! │                                                              │
//! │  config.rs         - NetConfig (JSON + ARENA_* env)          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Threading
//!
//! Reader, writer and accept tasks run on tokio. They only hand data to the
//! tick through the package pool and a completion channel, so every Peer
//! Record and session flag is mutated from one place: `tick`.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod network;
pub mod protocol;

// Re-export commonly used types
pub use config::{ConfigError, DispatchOrder, NetConfig};
pub use network::{Client, DisconnectCause, Host, NetEvent, NetHandler, TransportError};
pub use protocol::{GameId, GameState, InputType, Message, NetId, Position};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default simulation tick rate (Hz)
pub const TICK_RATE: u32 = 60;
