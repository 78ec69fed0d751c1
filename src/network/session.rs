//! Peer Session
//!
//! One TCP connection, split into a reader task and a writer task.
//!
//! - The reader fills one fixed-size buffer per batch and hands it to the
//!   [`PackagePool`]; the tick picks it up from there.
//! - The writer owns the socket's write half and sends one batch at a time,
//!   so at most one write is in flight. Emptied buffers come back to the
//!   session for reuse.
//! - Both tasks report the end of the connection as a [`TransportEvent`].
//! - [`PeerSession::close`] aborts both tasks, dropping unsent batches, so a
//!   peer that stopped reading cannot hold the socket open.
//!   [`PeerSession::close_after_flush`] lets the writer drain for at most
//!   [`CLOSE_LINGER`] first.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::network::pool::PackagePool;
use crate::protocol::{encode, encode_batch, FrameError, Message, NetId, BATCH_HEADER_SIZE};

/// Longest a lingering close waits for queued batches to be written.
pub const CLOSE_LINGER: Duration = Duration::from_secs(5);

/// Socket-level failures.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Listener could not be set up.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Cause.
        #[source]
        source: std::io::Error,
    },

    /// Client could not reach the host.
    #[error("failed to connect to {addr}: {source}")]
    ConnectionFailed {
        /// Host address.
        addr: SocketAddr,
        /// Cause.
        #[source]
        source: std::io::Error,
    },

    /// One accept attempt failed; the listener keeps running.
    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),

    /// Settings rejected before touching the network.
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

/// Completions delivered from socket tasks to the tick.
#[derive(Debug)]
pub enum TransportEvent {
    /// Listener accepted a connection (host only).
    Accepted(TcpStream, SocketAddr),
    /// The remote side closed or the socket failed.
    Closed(NetId),
}

/// Pending serialized messages of one session.
///
/// `queued_bytes` always equals the sum of the queued message lengths and
/// never exceeds `capacity` (the send buffer minus its batch header).
#[derive(Debug)]
pub struct OutboundQueue {
    messages: Vec<Vec<u8>>,
    queued_bytes: usize,
    capacity: usize,
}

impl OutboundQueue {
    /// Queue for a send buffer of `buffer_size` bytes.
    pub fn new(buffer_size: usize) -> Self {
        Self {
            messages: Vec::new(),
            queued_bytes: 0,
            capacity: buffer_size.saturating_sub(BATCH_HEADER_SIZE),
        }
    }

    /// Bytes available for messages in one batch.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sum of queued message lengths.
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// True if `len` more bytes fit without a flush.
    pub fn fits(&self, len: usize) -> bool {
        self.queued_bytes + len <= self.capacity
    }

    fn push(&mut self, encoded: Vec<u8>) {
        self.queued_bytes += encoded.len();
        self.messages.push(encoded);
    }

    fn clear(&mut self) {
        self.messages.clear();
        self.queued_bytes = 0;
    }
}

/// One connected endpoint.
#[derive(Debug)]
pub struct PeerSession {
    net_id: NetId,
    addr: Option<SocketAddr>,
    buffer_size: usize,
    queue: OutboundQueue,
    outbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
    recycled: mpsc::UnboundedReceiver<Vec<u8>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    active: bool,
    strikes: u32,
}

impl PeerSession {
    /// Take over `stream` and start its reader and writer tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        net_id: NetId,
        stream: TcpStream,
        buffer_size: usize,
        pool: Arc<PackagePool>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        let addr = stream.peer_addr().ok();
        if let Err(err) = stream.set_nodelay(true) {
            debug!(%net_id, error = %err, "set_nodelay failed");
        }
        let (read_half, write_half) = stream.into_split();

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (recycle_tx, recycle_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_loop(net_id, read_half, buffer_size, pool, events));
        let writer = tokio::spawn(write_loop(net_id, write_half, outbound_rx, recycle_tx));

        Self {
            net_id,
            addr,
            buffer_size,
            queue: OutboundQueue::new(buffer_size),
            outbound: Some(outbound_tx),
            recycled: recycle_rx,
            reader: Some(reader),
            writer: Some(writer),
            active: true,
            strikes: 0,
        }
    }

    /// Session without a socket: flushed batches go to the returned receiver.
    pub fn detached(net_id: NetId, buffer_size: usize) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (_, recycle_rx) = mpsc::unbounded_channel();
        let session = Self {
            net_id,
            addr: None,
            buffer_size,
            queue: OutboundQueue::new(buffer_size),
            outbound: Some(outbound_tx),
            recycled: recycle_rx,
            reader: None,
            writer: None,
            active: true,
            strikes: 0,
        };
        (session, outbound_rx)
    }

    /// Connection id.
    pub fn net_id(&self) -> NetId {
        self.net_id
    }

    /// Remote address, if socket-backed.
    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    /// Pending outbound messages.
    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    /// Replied to the current liveness probe.
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub(crate) fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    /// Missed probe windows.
    pub fn strikes(&self) -> u32 {
        self.strikes
    }

    pub(crate) fn add_strike(&mut self) -> u32 {
        self.strikes += 1;
        self.strikes
    }

    pub(crate) fn reset_strikes(&mut self) {
        self.strikes = 0;
    }

    /// True until [`close`](Self::close) is called.
    pub fn is_open(&self) -> bool {
        self.outbound.is_some()
    }

    /// Serialize `msg` into the outbound queue, flushing first if it would
    /// not fit alongside what is already queued.
    pub fn enqueue(&mut self, msg: &Message) -> Result<(), FrameError> {
        let encoded = encode(msg);
        if encoded.len() > self.queue.capacity() {
            return Err(FrameError::BatchOverflow {
                size: BATCH_HEADER_SIZE + encoded.len(),
                capacity: self.buffer_size,
            });
        }
        if !self.queue.fits(encoded.len()) {
            trace!(net_id = %self.net_id, queued = self.queue.queued_bytes(), "queue full, flushing early");
            self.flush()?;
        }
        self.queue.push(encoded);
        Ok(())
    }

    /// Package the queue into one batch and hand it to the writer.
    ///
    /// Returns the number of messages sent.
    pub fn flush(&mut self) -> Result<usize, FrameError> {
        if self.queue.is_empty() {
            return Ok(0);
        }
        let count = self.queue.len();
        let mut buf = self.recycled.try_recv().unwrap_or_else(|_| Vec::with_capacity(self.buffer_size));
        let used = encode_batch(self.queue.messages.iter().map(Vec::as_slice), self.buffer_size, &mut buf);
        self.queue.clear();
        let used = used?;

        #[cfg(feature = "debug-tracing")]
        trace!(net_id = %self.net_id, batch = %hex::encode(&buf[..used]), "flush");
        #[cfg(not(feature = "debug-tracing"))]
        trace!(net_id = %self.net_id, count, bytes = used, "flush");

        match &self.outbound {
            Some(tx) if tx.send(buf).is_ok() => {}
            _ => debug!(net_id = %self.net_id, count, "flush on closed session dropped"),
        }
        Ok(count)
    }

    /// Tear the connection down now. Queued and in-flight batches are
    /// dropped and the socket is closed.
    pub fn close(&mut self) {
        self.stop_receiving();
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }

    /// Flush the queue, stop receiving, and let the writer send what it
    /// holds before shutting the socket down. A writer still busy after
    /// [`CLOSE_LINGER`] is aborted.
    ///
    /// Must be called from within a tokio runtime.
    pub fn close_after_flush(&mut self) {
        if let Err(err) = self.flush() {
            warn!(net_id = %self.net_id, error = %err, "final flush failed");
        }
        self.stop_receiving();
        if let Some(writer) = self.writer.take() {
            let net_id = self.net_id;
            tokio::spawn(async move {
                let abort = writer.abort_handle();
                if tokio::time::timeout(CLOSE_LINGER, writer).await.is_err() {
                    debug!(%net_id, "writer still busy after linger, aborting");
                    abort.abort();
                }
            });
        }
    }

    fn stop_receiving(&mut self) {
        self.queue.clear();
        self.outbound = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_loop(
    net_id: NetId,
    mut socket: OwnedReadHalf,
    buffer_size: usize,
    pool: Arc<PackagePool>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut buf = vec![0u8; buffer_size];
    loop {
        match socket.read_exact(&mut buf).await {
            Ok(_) => {
                if let Err(err) = pool.receive(net_id, &buf) {
                    warn!(%net_id, error = %err, "dropping received batch");
                }
                buf.fill(0);
            }
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!(%net_id, "remote closed");
                break;
            }
            Err(err) => {
                warn!(%net_id, error = %err, "receive failed");
                break;
            }
        }
    }
    let _ = events.send(TransportEvent::Closed(net_id));
}

async fn write_loop(
    net_id: NetId,
    mut socket: OwnedWriteHalf,
    mut batches: mpsc::UnboundedReceiver<Vec<u8>>,
    recycle: mpsc::UnboundedSender<Vec<u8>>,
) {
    while let Some(mut batch) = batches.recv().await {
        if let Err(err) = socket.write_all(&batch).await {
            warn!(%net_id, error = %err, "send failed");
            return;
        }
        batch.clear();
        let _ = recycle.send(batch);
    }
    if let Err(err) = socket.shutdown().await {
        debug!(%net_id, error = %err, "shutdown failed");
    }
}
