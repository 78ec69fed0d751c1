//! Network Layer
//!
//! TCP transport, session bookkeeping and message dispatch for one host and
//! up to four peers. Socket I/O runs on tokio tasks; all state changes
//! happen on the caller's tick.

pub mod client;
pub mod dispatcher;
pub mod events;
pub mod host;
pub mod liveness;
pub mod pool;
pub mod records;
pub mod registry;
pub mod session;

pub use client::Client;
pub use events::{DisconnectCause, NetEvent, NetHandler};
pub use host::Host;
pub use liveness::LivenessMonitor;
pub use pool::{PackageId, PackagePool, PackageState, PoolError};
pub use records::{PeerRecord, PeerTable};
pub use registry::SessionRegistry;
pub use session::{OutboundQueue, PeerSession, TransportError, TransportEvent};
