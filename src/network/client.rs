//! Game Client
//!
//! One connection to the host plus a local mirror of the Peer Records.
//! Like the host, all state changes happen inside [`Client::tick`].

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::config::NetConfig;
use crate::network::dispatcher::{dispatch_client, Dispatcher};
use crate::network::events::{NetEvent, NetHandler};
use crate::network::pool::PackagePool;
use crate::network::records::{PeerRecord, PeerTable};
use crate::network::session::{PeerSession, TransportError, TransportEvent};
use crate::protocol::{InputType, Message, NetId, RequestType};

/// Connection state the client dispatcher mutates.
#[derive(Debug)]
pub struct ClientState {
    pub(crate) net_id: Option<NetId>,
    pub(crate) records: PeerTable,
    session: PeerSession,
    closed: bool,
}

impl ClientState {
    pub(crate) fn new(session: PeerSession) -> Self {
        Self { net_id: None, records: PeerTable::new(), session, closed: false }
    }

    pub(crate) fn send(&mut self, msg: &Message) {
        if self.closed {
            debug!(kind = ?msg.kind(), "send after close dropped");
            return;
        }
        if let Err(err) = self.session.enqueue(msg) {
            warn!(kind = ?msg.kind(), error = %err, "dropping outbound message");
        }
    }

    pub(crate) fn flush(&mut self) {
        if let Err(err) = self.session.flush() {
            warn!(error = %err, "flush failed");
        }
    }

    pub(crate) fn close(&mut self) {
        self.session.close();
        self.closed = true;
    }

    /// Close once the queued messages are on their way to the host.
    pub(crate) fn close_after_flush(&mut self) {
        self.session.close_after_flush();
        self.closed = true;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Client side of a game session.
pub struct Client {
    state: ClientState,
    pool: Arc<PackagePool>,
    dispatcher: Dispatcher,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
}

impl Client {
    /// Dial the configured host.
    ///
    /// This is the one call allowed to stall startup. On failure the handler
    /// receives [`NetEvent::ConnectionFailed`] and the error is returned.
    #[instrument(skip_all, fields(addr = tracing::field::Empty))]
    pub async fn connect<H: NetHandler>(config: NetConfig, handler: &mut H) -> Result<Self, TransportError> {
        config.validate()?;
        let addr = config.connect_addr()?;
        tracing::Span::current().record("addr", tracing::field::display(addr));

        let stream = match TcpStream::connect(addr).await {
            Ok(stream) => stream,
            Err(source) => {
                warn!(%addr, error = %source, "connection failed");
                handler.on_event(NetEvent::ConnectionFailed { reason: source.to_string() });
                return Err(TransportError::ConnectionFailed { addr, source });
            }
        };
        info!(%addr, "connected to host");

        let pool = Arc::new(PackagePool::new(config.buffer_size, config.initial_packages));
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        // The host assigns the real netId in SuccessfulConnection.
        let session = PeerSession::spawn(NetId(0), stream, config.buffer_size, pool.clone(), transport_tx);

        Ok(Self {
            state: ClientState::new(session),
            pool,
            dispatcher: Dispatcher::new(config.dispatch_order, config.buffer_size),
            transport_rx,
        })
    }

    /// Id assigned by the host, once admitted.
    pub fn net_id(&self) -> Option<NetId> {
        self.state.net_id
    }

    /// Local mirror of every known player.
    ///
    /// The host announces no departures, so a record of a peer that left
    /// stays here until another peer takes over its gameId.
    pub fn records(&self) -> &PeerTable {
        &self.state.records
    }

    /// This client's own record, once spawned.
    pub fn local_record(&self) -> Option<&PeerRecord> {
        self.state.net_id.and_then(|id| self.state.records.get(id))
    }

    /// True once admitted and until the connection ends.
    pub fn is_connected(&self) -> bool {
        self.state.net_id.is_some() && !self.state.closed
    }

    /// True after rejection, host close or [`disconnect`](Self::disconnect).
    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Process socket completions and received packages, then flush.
    pub fn tick<H: NetHandler>(&mut self, handler: &mut H) {
        let mut host_closed = false;
        while let Ok(event) = self.transport_rx.try_recv() {
            match event {
                TransportEvent::Closed(_) => host_closed = true,
                TransportEvent::Accepted(_, addr) => debug!(%addr, "client ignores accepted socket"),
            }
        }

        let state = &mut self.state;
        self.dispatcher.drain(&self.pool, |_, msg| dispatch_client(state, msg, handler));

        if host_closed && !self.state.closed {
            info!("host closed the connection");
            self.state.records.clear();
            self.state.close();
            handler.on_event(NetEvent::HostClosed);
        }

        if !self.state.closed {
            self.state.flush();
        }
    }

    fn send_as_self(&mut self, build: impl FnOnce(NetId) -> Message) {
        match self.state.net_id {
            Some(net_id) => self.state.send(&build(net_id)),
            None => debug!("not admitted yet, message dropped"),
        }
    }

    /// Send a player input.
    pub fn send_input(&mut self, input: InputType) {
        self.send_as_self(|net_id| Message::Input { net_id, input });
    }

    /// Vote to start the game.
    pub fn request_start(&mut self) {
        self.send_as_self(|net_id| Message::RequestToServer { net_id, request: RequestType::StartGame });
    }

    /// Ask the host to respawn this ship.
    pub fn request_respawn(&mut self) {
        self.send_as_self(|net_id| Message::RequestToServer { net_id, request: RequestType::Respawn });
    }

    /// Tell the host this client is ready for broadcasts.
    pub fn ready_to_update(&mut self) {
        self.send_as_self(|net_id| Message::ReadyToUpdate { net_id });
    }

    /// Close the connection, flushing anything still queued.
    pub fn disconnect(&mut self) {
        if self.state.closed {
            return;
        }
        self.state.records.clear();
        self.state.close_after_flush();
        info!("disconnected from host");
    }
}
