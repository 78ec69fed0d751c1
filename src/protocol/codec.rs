//! Frame Codec
//!
//! Pure encode/decode between [`Message`] and the fixed-header binary layout.
//!
//! ```text
//! frame batch:  | count: i32 | message | message | ... |
//! message:      | kind: i32 | payload_size: i32 | payload (payload_size bytes) |
//! ```
//!
//! All integers and floats are little-endian, fixed width, unpadded. Every
//! kind has exactly one legal payload size (`Synchronize` derives it from its
//! leading peer count), so a header that disagrees with the table is rejected
//! instead of being trusted.
//!
//! `Synchronize` is the one kind whose size field does not cover the whole
//! body: it declares only the peer entries (`24 * count`), and the 4-byte
//! count that precedes them is implied.

use crate::protocol::message::{
    Collision, CollisionType, GameId, GameState, InputType, Message, MessageKind, NetId,
    PeerSnapshot, Position, RequestType,
};

/// Message header: kind + payload size.
pub const HEADER_SIZE: usize = 8;

/// Frame batch header: message count.
pub const BATCH_HEADER_SIZE: usize = 4;

/// Leading peer count inside a `Synchronize` payload.
pub const SYNC_COUNT_SIZE: usize = 4;

/// One peer entry inside `Synchronize` (and the whole `SpawnPlayer` payload).
pub const SYNC_ENTRY_SIZE: usize = 24;

/// Codec errors. All of them are protocol errors: the rest of the batch is
/// unusable because the format has no resync marker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// Declared payload size does not match the kind's table entry.
    #[error("malformed frame: {kind:?} declared {declared} payload bytes, expected {expected}")]
    MalformedFrame {
        /// Message kind.
        kind: MessageKind,
        /// Size found in the header.
        declared: i32,
        /// Size required by the table.
        expected: i64,
    },

    /// Kind token not present in the table.
    #[error("unknown message kind {0}")]
    UnknownKind(i32),

    /// An enumerated payload field holds an unknown value.
    #[error("invalid {field} value {value}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// Raw value.
        value: i32,
    },

    /// Not enough bytes left for the declared content.
    #[error("truncated frame: needed {needed} bytes, {available} available")]
    Truncated {
        /// Bytes required.
        needed: usize,
        /// Bytes present.
        available: usize,
    },

    /// Negative message or peer count.
    #[error("negative count {0}")]
    NegativeCount(i32),

    /// Encoded batch would not fit the fixed send buffer.
    #[error("batch of {size} bytes exceeds buffer capacity {capacity}")]
    BatchOverflow {
        /// Bytes required.
        size: usize,
        /// Buffer capacity.
        capacity: usize,
    },
}

impl MessageKind {
    /// Fixed payload size for this kind, `None` for `Synchronize` whose body
    /// is `SYNC_COUNT_SIZE + SYNC_ENTRY_SIZE * peer_count`.
    pub const fn fixed_payload_size(self) -> Option<usize> {
        match self {
            MessageKind::SuccessfulConnection => Some(4),
            MessageKind::ClientLimitReached => Some(0),
            MessageKind::RequestToServer => Some(8),
            MessageKind::Synchronize => None,
            MessageKind::SpawnPlayer => Some(SYNC_ENTRY_SIZE),
            MessageKind::ReadyToUpdate => Some(4),
            MessageKind::Ping => Some(4),
            MessageKind::Input => Some(8),
            MessageKind::GameState => Some(4),
            MessageKind::SpawnBubble => Some(4),
            MessageKind::Collision => Some(16),
            MessageKind::Respawn => Some(12),
            MessageKind::PlayerPosition => Some(12),
        }
    }
}

/// Body bytes of a `Synchronize` carrying `peer_count` entries.
pub const fn sync_payload_size(peer_count: usize) -> usize {
    SYNC_COUNT_SIZE + SYNC_ENTRY_SIZE * peer_count
}

/// Size field a `Synchronize` with `peer_count` entries declares. The
/// leading count is not included.
pub const fn sync_declared_size(peer_count: usize) -> usize {
    SYNC_ENTRY_SIZE * peer_count
}

/// Body bytes that follow the header of `msg`.
pub fn payload_size(msg: &Message) -> usize {
    match msg {
        Message::Synchronize { peers } => sync_payload_size(peers.len()),
        other => other.kind().fixed_payload_size().unwrap_or(0),
    }
}

/// Value written to the header's size field for `msg`.
pub fn declared_size(msg: &Message) -> usize {
    match msg {
        Message::Synchronize { peers } => sync_declared_size(peers.len()),
        other => payload_size(other),
    }
}

/// Total encoded length (header + payload).
pub fn encoded_len(msg: &Message) -> usize {
    HEADER_SIZE + payload_size(msg)
}

// =============================================================================
// ENCODING
// =============================================================================

fn put_i32(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_f32(out: &mut Vec<u8>, value: f32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_position(out: &mut Vec<u8>, position: Position) {
    put_f32(out, position.x);
    put_f32(out, position.y);
}

fn put_snapshot(out: &mut Vec<u8>, peer: &PeerSnapshot) {
    put_i32(out, peer.net_id.0);
    put_i32(out, peer.game_id.0);
    put_position(out, peer.position);
    put_i32(out, peer.score);
    put_i32(out, peer.lives);
}

/// Append the encoding of `msg` to `out`.
pub fn encode_into(msg: &Message, out: &mut Vec<u8>) {
    let start = out.len();
    out.reserve(encoded_len(msg));
    put_i32(out, msg.kind().to_wire());
    put_i32(out, declared_size(msg) as i32);

    match msg {
        Message::SuccessfulConnection { net_id } => put_i32(out, net_id.0),
        Message::ClientLimitReached => {}
        Message::RequestToServer { net_id, request } => {
            put_i32(out, net_id.0);
            put_i32(out, request.to_wire());
        }
        Message::Synchronize { peers } => {
            put_i32(out, peers.len() as i32);
            for peer in peers {
                put_snapshot(out, peer);
            }
        }
        Message::SpawnPlayer(peer) => put_snapshot(out, peer),
        Message::ReadyToUpdate { net_id } | Message::Ping { net_id } => put_i32(out, net_id.0),
        Message::Input { net_id, input } => {
            put_i32(out, net_id.0);
            put_i32(out, input.to_wire());
        }
        Message::GameState { state } => put_i32(out, state.to_wire()),
        Message::SpawnBubble { path_type } => put_i32(out, *path_type),
        Message::Collision { net_id, collision } => {
            put_i32(out, net_id.0);
            put_i32(out, collision.collision_type().to_wire());
            match *collision {
                Collision::Bullet { bullet_id, bubble_id } => {
                    put_u32(out, bullet_id);
                    put_u32(out, bubble_id);
                }
                Collision::Ship { bubble_id, lives_remaining } => {
                    put_u32(out, bubble_id);
                    put_i32(out, lives_remaining);
                }
            }
        }
        Message::Respawn { net_id, position } | Message::PlayerPosition { net_id, position } => {
            put_i32(out, net_id.0);
            put_position(out, *position);
        }
    }

    debug_assert_eq!(out.len() - start, encoded_len(msg));
}

/// Encode `msg` into a fresh buffer.
pub fn encode(msg: &Message) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded_len(msg));
    encode_into(msg, &mut out);
    out
}

/// Write a frame batch (count + already-encoded messages) into `out`, which
/// is cleared first and zero-padded to `capacity` bytes.
pub fn encode_batch<'a, I>(messages: I, capacity: usize, out: &mut Vec<u8>) -> Result<usize, FrameError>
where
    I: IntoIterator<Item = &'a [u8]>,
    I::IntoIter: ExactSizeIterator,
{
    let messages = messages.into_iter();
    out.clear();
    put_i32(out, messages.len() as i32);
    for encoded in messages {
        out.extend_from_slice(encoded);
    }

    let used = out.len();
    if used > capacity {
        return Err(FrameError::BatchOverflow { size: used, capacity });
    }
    out.resize(capacity, 0);
    Ok(used)
}

// =============================================================================
// DECODING
// =============================================================================

/// Bounds-checked little-endian cursor.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take4(&mut self) -> Result<[u8; 4], FrameError> {
        let available = self.buf.len() - self.pos;
        if available < 4 {
            return Err(FrameError::Truncated { needed: 4, available });
        }
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(bytes)
    }

    fn i32(&mut self) -> Result<i32, FrameError> {
        self.take4().map(i32::from_le_bytes)
    }

    fn u32(&mut self) -> Result<u32, FrameError> {
        self.take4().map(u32::from_le_bytes)
    }

    fn f32(&mut self) -> Result<f32, FrameError> {
        self.take4().map(f32::from_le_bytes)
    }

    fn net_id(&mut self) -> Result<NetId, FrameError> {
        self.i32().map(NetId)
    }

    fn position(&mut self) -> Result<Position, FrameError> {
        Ok(Position::new(self.f32()?, self.f32()?))
    }

    fn snapshot(&mut self) -> Result<PeerSnapshot, FrameError> {
        Ok(PeerSnapshot {
            net_id: self.net_id()?,
            game_id: GameId(self.i32()?),
            position: self.position()?,
            score: self.i32()?,
            lives: self.i32()?,
        })
    }

    fn field<T>(&mut self, field: &'static str, parse: fn(i32) -> Option<T>) -> Result<T, FrameError> {
        let value = self.i32()?;
        parse(value).ok_or(FrameError::InvalidField { field, value })
    }
}

/// Check the declared size against the table and return the body length.
fn checked_payload_size(kind: MessageKind, declared: i32, payload: &[u8]) -> Result<usize, FrameError> {
    let (expected, body) = match kind.fixed_payload_size() {
        Some(size) => (size as i64, size as i64),
        None => {
            // Synchronize: size follows from the leading peer count.
            let count = Reader::new(payload).i32()?;
            if count < 0 {
                return Err(FrameError::NegativeCount(count));
            }
            let entries = SYNC_ENTRY_SIZE as i64 * count as i64;
            (entries, SYNC_COUNT_SIZE as i64 + entries)
        }
    };

    if declared as i64 != expected {
        return Err(FrameError::MalformedFrame { kind, declared, expected });
    }
    if (payload.len() as i64) < body {
        return Err(FrameError::Truncated { needed: body as usize, available: payload.len() });
    }
    Ok(body as usize)
}

fn decode_payload(kind: MessageKind, payload: &[u8]) -> Result<Message, FrameError> {
    let mut r = Reader::new(payload);
    let msg = match kind {
        MessageKind::SuccessfulConnection => Message::SuccessfulConnection { net_id: r.net_id()? },
        MessageKind::ClientLimitReached => Message::ClientLimitReached,
        MessageKind::RequestToServer => Message::RequestToServer {
            net_id: r.net_id()?,
            request: r.field("request_type", RequestType::from_wire)?,
        },
        MessageKind::Synchronize => {
            let count = r.i32()? as usize;
            let mut peers = Vec::with_capacity(count);
            for _ in 0..count {
                peers.push(r.snapshot()?);
            }
            Message::Synchronize { peers }
        }
        MessageKind::SpawnPlayer => Message::SpawnPlayer(r.snapshot()?),
        MessageKind::ReadyToUpdate => Message::ReadyToUpdate { net_id: r.net_id()? },
        MessageKind::Ping => Message::Ping { net_id: r.net_id()? },
        MessageKind::Input => Message::Input {
            net_id: r.net_id()?,
            input: r.field("input_type", InputType::from_wire)?,
        },
        MessageKind::GameState => Message::GameState { state: r.field("game_state", GameState::from_wire)? },
        MessageKind::SpawnBubble => Message::SpawnBubble { path_type: r.i32()? },
        MessageKind::Collision => {
            let net_id = r.net_id()?;
            let collision = match r.field("collision_type", CollisionType::from_wire)? {
                CollisionType::Bullet => Collision::Bullet { bullet_id: r.u32()?, bubble_id: r.u32()? },
                CollisionType::Ship => Collision::Ship { bubble_id: r.u32()?, lives_remaining: r.i32()? },
            };
            Message::Collision { net_id, collision }
        }
        MessageKind::Respawn => Message::Respawn { net_id: r.net_id()?, position: r.position()? },
        MessageKind::PlayerPosition => Message::PlayerPosition { net_id: r.net_id()?, position: r.position()? },
    };
    Ok(msg)
}

/// Decode one message from the front of `buf`.
///
/// Returns the message and the number of bytes consumed.
pub fn decode_message(buf: &[u8]) -> Result<(Message, usize), FrameError> {
    let mut header = Reader::new(buf);
    let raw_kind = header.i32()?;
    let declared = header.i32()?;
    let kind = MessageKind::from_wire(raw_kind).ok_or(FrameError::UnknownKind(raw_kind))?;

    let payload = &buf[HEADER_SIZE..];
    let size = checked_payload_size(kind, declared, payload)?;
    let msg = decode_payload(kind, &payload[..size])?;
    Ok((msg, HEADER_SIZE + size))
}

/// Iterator over the messages of one frame batch.
///
/// Yields at most one error, after which it is exhausted: the bytes after a
/// bad header cannot be trusted.
pub struct BatchDecoder<'a> {
    buf: &'a [u8],
    offset: usize,
    remaining: usize,
    pending_error: Option<FrameError>,
}

impl<'a> BatchDecoder<'a> {
    /// Messages the batch header promised and that have not been yielded.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Byte offset of the next undecoded message.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl<'a> Iterator for BatchDecoder<'a> {
    type Item = Result<Message, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = self.pending_error.take() {
            self.remaining = 0;
            return Some(Err(err));
        }
        if self.remaining == 0 {
            return None;
        }

        match decode_message(&self.buf[self.offset..]) {
            Ok((msg, used)) => {
                self.offset += used;
                self.remaining -= 1;
                Some(Ok(msg))
            }
            Err(err) => {
                self.remaining = 0;
                Some(Err(err))
            }
        }
    }
}

/// Start decoding a frame batch.
pub fn decode_batch(buf: &[u8]) -> BatchDecoder<'_> {
    let mut decoder = BatchDecoder { buf, offset: 0, remaining: 0, pending_error: None };
    match Reader::new(buf).i32() {
        Ok(count) if count < 0 => decoder.pending_error = Some(FrameError::NegativeCount(count)),
        Ok(count) => {
            decoder.offset = BATCH_HEADER_SIZE;
            decoder.remaining = count as usize;
        }
        Err(err) => decoder.pending_error = Some(err),
    }
    decoder
}
