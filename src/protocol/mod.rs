//! Wire Protocol
//!
//! Typed messages and their fixed-header binary encoding.
//! This layer is **pure** - no sockets, no state.

pub mod codec;
pub mod message;

pub use codec::{
    declared_size, decode_batch, decode_message, encode, encode_batch, encode_into, encoded_len, payload_size,
    BatchDecoder, FrameError, BATCH_HEADER_SIZE, HEADER_SIZE, SYNC_ENTRY_SIZE,
};
pub use message::{
    Collision, CollisionType, GameId, GameState, InputType, Message, MessageKind, NetId,
    PeerSnapshot, Position, RequestType,
};
