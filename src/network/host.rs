//! Authoritative Host
//!
//! Listens for peers, admits up to `peer_limit` of them, and on every tick:
//!
//! 1. Applies socket completions (new connections, closed sockets)
//! 2. Dispatches received packages through the host handler table
//! 3. Runs the liveness monitor and the periodic synchronization
//! 4. Flushes every session's outbound queue
//!
//! Gameplay drives the host through the outbound API
//! ([`Host::ship_collision`], [`Host::update_position`], ...), which updates
//! the authoritative Peer Records and broadcasts to ready peers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::NetConfig;
use crate::network::dispatcher::{dispatch_host, Dispatcher};
use crate::network::events::{DisconnectCause, NetEvent, NetHandler};
use crate::network::liveness::LivenessMonitor;
use crate::network::pool::PackagePool;
use crate::network::records::PeerTable;
use crate::network::registry::SessionRegistry;
use crate::network::session::{PeerSession, TransportError, TransportEvent};
use crate::protocol::{Collision, GameId, GameState, Message, NetId, Position};

/// The authoritative game host.
pub struct Host {
    config: NetConfig,
    local_addr: SocketAddr,
    registry: SessionRegistry,
    pool: Arc<PackagePool>,
    dispatcher: Dispatcher,
    liveness: LivenessMonitor,
    sync_elapsed: Duration,
    next_net_id: i32,
    game_state: GameState,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    shutdown_tx: broadcast::Sender<()>,
    accept_task: Option<JoinHandle<()>>,
}

impl Host {
    /// Bind the listener and start accepting.
    #[instrument(skip_all, fields(port = config.listen_port))]
    pub async fn bind(config: NetConfig) -> Result<Self, TransportError> {
        config.validate()?;
        let addr = config.listen_addr()?;
        let listener = listen(addr, config.listen_backlog).map_err(|source| TransportError::Bind { addr, source })?;
        let local_addr = listener.local_addr().map_err(|source| TransportError::Bind { addr, source })?;
        info!(%local_addr, peer_limit = config.peer_limit, "host listening");

        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);
        let accept_task = tokio::spawn(accept_loop(listener, transport_tx.clone(), shutdown_tx.subscribe()));

        Ok(Self {
            local_addr,
            registry: SessionRegistry::new(),
            pool: Arc::new(PackagePool::new(config.buffer_size, config.initial_packages)),
            dispatcher: Dispatcher::new(config.dispatch_order, config.buffer_size),
            liveness: LivenessMonitor::from_config(&config),
            sync_elapsed: Duration::ZERO,
            next_net_id: 1,
            game_state: GameState::None,
            transport_tx,
            transport_rx,
            shutdown_tx,
            accept_task: Some(accept_task),
            config,
        })
    }

    /// Address actually bound (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Active configuration.
    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    /// Connected peers and their state.
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Authoritative Peer Records.
    pub fn records(&self) -> &PeerTable {
        self.registry.records()
    }

    /// Last state passed to [`change_game_state`](Self::change_game_state).
    pub fn game_state(&self) -> GameState {
        self.game_state
    }

    /// Advance the network layer by `dt`.
    pub fn tick<H: NetHandler>(&mut self, dt: Duration, handler: &mut H) {
        let mut closed = Vec::new();
        while let Ok(event) = self.transport_rx.try_recv() {
            match event {
                TransportEvent::Accepted(stream, addr) => self.admit(stream, addr, handler),
                TransportEvent::Closed(net_id) => closed.push(net_id),
            }
        }

        let registry = &mut self.registry;
        let config = &self.config;
        self.dispatcher
            .drain(&self.pool, |origin, msg| dispatch_host(registry, config, origin, msg, handler));

        for net_id in closed {
            self.registry.disconnect(net_id, DisconnectCause::Closed, handler);
        }

        for net_id in self.liveness.run(dt, &mut self.registry) {
            warn!(%net_id, "peer unresponsive");
            self.registry.disconnect(net_id, DisconnectCause::Unresponsive, handler);
        }

        self.periodic_sync(dt);
        self.registry.flush_all();
    }

    fn admit<H: NetHandler>(&mut self, stream: TcpStream, addr: SocketAddr, handler: &mut H) {
        if self.registry.len() >= self.config.peer_limit {
            info!(%addr, peers = self.registry.len(), "peer limit reached, rejecting");
            let mut session = PeerSession::spawn(
                NetId(0),
                stream,
                self.config.buffer_size,
                self.pool.clone(),
                self.transport_tx.clone(),
            );
            // Accept, notify, close: there is no way to refuse before accepting.
            if let Err(err) = session.enqueue(&Message::ClientLimitReached) {
                warn!(%addr, error = %err, "reject notice not queued");
            }
            session.close_after_flush();
            return;
        }

        let net_id = NetId(self.next_net_id);
        self.next_net_id += 1;

        let mut session = PeerSession::spawn(
            net_id,
            stream,
            self.config.buffer_size,
            self.pool.clone(),
            self.transport_tx.clone(),
        );
        if let Err(err) = session.enqueue(&Message::SuccessfulConnection { net_id }) {
            warn!(%net_id, error = %err, "handshake not queued");
        }
        self.registry.insert(session);

        info!(%net_id, %addr, peers = self.registry.len(), "peer connected");
        handler.on_event(NetEvent::PeerConnected { net_id });
    }

    fn periodic_sync(&mut self, dt: Duration) {
        if self.registry.is_empty() {
            self.sync_elapsed = Duration::ZERO;
            return;
        }
        self.sync_elapsed += dt;
        if self.sync_elapsed < self.config.sync_interval {
            return;
        }
        self.sync_elapsed = Duration::ZERO;
        if !self.registry.records().is_empty() {
            let peers = self.registry.records().snapshots();
            debug!(peers = peers.len(), ready = self.registry.ready().len(), "periodic sync");
            self.registry.broadcast_ready(&Message::Synchronize { peers });
        }
    }

    // =========================================================================
    // Outbound API
    // =========================================================================

    /// Spawn an obstacle on `path_type` for every ready peer.
    pub fn spawn_bubble(&mut self, path_type: i32) {
        self.registry.broadcast_ready(&Message::SpawnBubble { path_type });
    }

    /// A player's bullet destroyed a bubble. Returns the shooter's new score.
    pub fn bullet_collision(&mut self, game_id: GameId, bullet_id: u32, bubble_id: u32) -> Option<i32> {
        let record = self.registry.records_mut().by_game_id_mut(game_id)?;
        record.score += 1;
        let (net_id, score) = (record.net_id, record.score);

        self.registry.broadcast_ready(&Message::Collision {
            net_id,
            collision: Collision::Bullet { bullet_id, bubble_id },
        });
        Some(score)
    }

    /// A bubble hit a player's ship. Returns the lives left.
    pub fn ship_collision(&mut self, game_id: GameId, bubble_id: u32) -> Option<i32> {
        let record = self.registry.records_mut().by_game_id_mut(game_id)?;
        record.lives -= 1;
        let (net_id, lives) = (record.net_id, record.lives);

        self.registry.broadcast_ready(&Message::Collision {
            net_id,
            collision: Collision::Ship { bubble_id, lives_remaining: lives },
        });
        Some(lives)
    }

    /// Change the game flow state everywhere.
    pub fn change_game_state(&mut self, state: GameState) {
        self.game_state = state;
        self.registry.broadcast_ready(&Message::GameState { state });
    }

    /// Publish an authoritative position. Returns false for an unknown slot.
    pub fn update_position(&mut self, game_id: GameId, position: Position) -> bool {
        let Some(record) = self.registry.records_mut().by_game_id_mut(game_id) else {
            return false;
        };
        record.position = position;
        let net_id = record.net_id;
        self.registry.broadcast_ready(&Message::PlayerPosition { net_id, position });
        true
    }

    /// True while any player still has lives.
    pub fn any_lives_remaining(&self) -> bool {
        self.registry.records().any_lives_remaining()
    }

    /// Connection owning a player slot.
    pub fn net_id_for_game(&self, game_id: GameId) -> Option<NetId> {
        self.registry.records().net_id_for_game(game_id)
    }

    /// Stop accepting and disconnect every peer.
    pub fn shutdown<H: NetHandler>(&mut self, handler: &mut H) {
        let _ = self.shutdown_tx.send(());
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        self.registry.shutdown(handler);
        self.liveness.reset();
        info!("host shut down");
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

fn listen(addr: SocketAddr, backlog: u32) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

async fn accept_loop(
    listener: TcpListener,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!(%addr, "accepted");
                        if events.send(TransportEvent::Accepted(stream, addr)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let err = TransportError::Accept(e);
                        warn!(error = %err, "accept error, still listening");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                debug!("accept loop stopped");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::client::Client;
    use crate::protocol::decode_batch;
    use tokio::io::AsyncReadExt;

    const DT: Duration = Duration::from_millis(10);

    fn test_config(peer_limit: usize) -> NetConfig {
        NetConfig { listen_port: 0, peer_limit, ..Default::default() }
    }

    async fn tick_until<F>(host: &mut Host, events: &mut Vec<NetEvent>, mut done: F)
    where
        F: FnMut(&Host, &[NetEvent]) -> bool,
    {
        for _ in 0..500 {
            host.tick(DT, events);
            if done(&*host, events.as_slice()) {
                return;
            }
            tokio::time::sleep(DT).await;
        }
        panic!("condition not reached, events: {:?}", events);
    }

    async fn read_batch(stream: &mut TcpStream, size: usize) -> Vec<Message> {
        let mut buf = vec![0u8; size];
        stream.read_exact(&mut buf).await.unwrap();
        decode_batch(&buf).map(|m| m.unwrap()).collect()
    }

    #[tokio::test]
    async fn test_third_peer_gets_client_limit_then_close() {
        let mut host = Host::bind(test_config(2)).await.unwrap();
        let addr = host.local_addr();
        let mut events: Vec<NetEvent> = Vec::new();

        let mut first = TcpStream::connect(addr).await.unwrap();
        let mut second = TcpStream::connect(addr).await.unwrap();
        tick_until(&mut host, &mut events, |h, _| h.registry().len() == 2).await;

        assert_eq!(read_batch(&mut first, 1024).await, vec![Message::SuccessfulConnection { net_id: NetId(1) }]);
        assert_eq!(read_batch(&mut second, 1024).await, vec![Message::SuccessfulConnection { net_id: NetId(2) }]);

        let mut third = TcpStream::connect(addr).await.unwrap();
        let reply = tokio::spawn(async move {
            let msgs = read_batch(&mut third, 1024).await;
            let mut rest = Vec::new();
            let n = third.read_to_end(&mut rest).await.unwrap();
            (msgs, n)
        });
        for _ in 0..50 {
            host.tick(DT, &mut events);
            if reply.is_finished() {
                break;
            }
            tokio::time::sleep(DT).await;
        }

        let (msgs, trailing) = tokio::time::timeout(Duration::from_secs(5), reply).await.unwrap().unwrap();
        assert_eq!(msgs, vec![Message::ClientLimitReached]);
        assert_eq!(trailing, 0);
        assert_eq!(host.registry().len(), 2);
        assert_eq!(
            events,
            vec![NetEvent::PeerConnected { net_id: NetId(1) }, NetEvent::PeerConnected { net_id: NetId(2) }]
        );
    }

    #[tokio::test]
    async fn test_client_spawns_and_sees_collisions() {
        let mut host = Host::bind(test_config(1)).await.unwrap();
        let client_config = NetConfig { connect_port: host.local_addr().port(), ..Default::default() };

        let mut host_events: Vec<NetEvent> = Vec::new();
        let mut client_events: Vec<NetEvent> = Vec::new();
        let mut client = Client::connect(client_config, &mut client_events).await.unwrap();

        for _ in 0..500 {
            host.tick(DT, &mut host_events);
            client.tick(&mut client_events);
            if client.local_record().is_some() {
                break;
            }
            tokio::time::sleep(DT).await;
        }
        let local = *client.local_record().expect("spawned");
        assert_eq!(client.net_id(), Some(NetId(1)));
        assert_eq!(local.game_id, GameId(1));
        assert_eq!(local.lives, 3);
        assert_eq!(host.records().get(NetId(1)), Some(&local));
        assert_eq!(client_events[0], NetEvent::Connected { net_id: NetId(1) });
        assert!(client_events.contains(&NetEvent::PlayerSpawned { record: local }));

        client.ready_to_update();
        for _ in 0..500 {
            client.tick(&mut client_events);
            host.tick(DT, &mut host_events);
            if host.registry().is_ready(NetId(1)) {
                break;
            }
            tokio::time::sleep(DT).await;
        }
        assert!(host_events.contains(&NetEvent::PeerReady { net_id: NetId(1) }));

        assert_eq!(host.ship_collision(GameId(1), 9), Some(2));
        assert_eq!(host.bullet_collision(GameId(1), 4, 9), Some(1));
        host.change_game_state(GameState::Game);
        for _ in 0..500 {
            host.tick(DT, &mut host_events);
            client.tick(&mut client_events);
            if client_events.contains(&NetEvent::GameStateChanged { state: GameState::Game }) {
                break;
            }
            tokio::time::sleep(DT).await;
        }

        let mirrored = client.records().get(NetId(1)).unwrap();
        assert_eq!((mirrored.lives, mirrored.score), (2, 1));
        assert!(client_events.contains(&NetEvent::ShipCollision { net_id: NetId(1), bubble_id: 9, lives: 2 }));
        assert!(host.any_lives_remaining());
    }

    #[tokio::test]
    async fn test_periodic_sync_shares_all_records() {
        let config = NetConfig { sync_interval: Duration::from_millis(50), ..test_config(2) };
        let mut host = Host::bind(config).await.unwrap();
        let client_config = NetConfig { connect_port: host.local_addr().port(), ..Default::default() };

        let mut sink: Vec<NetEvent> = Vec::new();
        let mut a = Client::connect(client_config.clone(), &mut sink).await.unwrap();
        let mut b = Client::connect(client_config, &mut sink).await.unwrap();

        let mut ready = (false, false);
        for _ in 0..500 {
            host.tick(DT, &mut sink);
            a.tick(&mut sink);
            b.tick(&mut sink);
            if !ready.0 && a.local_record().is_some() {
                a.ready_to_update();
                ready.0 = true;
            }
            if !ready.1 && b.local_record().is_some() {
                b.ready_to_update();
                ready.1 = true;
            }
            if a.records().len() == 2 && b.records().len() == 2 {
                break;
            }
            tokio::time::sleep(DT).await;
        }

        for client in [&a, &b] {
            assert_eq!(client.records().len(), 2);
            for record in host.records().iter() {
                assert_eq!(client.records().get(record.net_id).map(|r| r.game_id), Some(record.game_id));
            }
        }
    }

    #[tokio::test]
    async fn test_client_disconnect_tears_down_peer() {
        let mut host = Host::bind(test_config(1)).await.unwrap();
        let client_config = NetConfig { connect_port: host.local_addr().port(), ..Default::default() };
        let mut host_events: Vec<NetEvent> = Vec::new();
        let mut client_events: Vec<NetEvent> = Vec::new();
        let mut client = Client::connect(client_config, &mut client_events).await.unwrap();

        for _ in 0..500 {
            host.tick(DT, &mut host_events);
            client.tick(&mut client_events);
            if host.records().len() == 1 {
                break;
            }
            tokio::time::sleep(DT).await;
        }
        let record = *host.records().get(NetId(1)).unwrap();

        client.disconnect();
        tick_until(&mut host, &mut host_events, |h, _| h.registry().is_empty()).await;

        let tail = &host_events[host_events.len() - 2..];
        assert_eq!(
            tail,
            &[
                NetEvent::ActorDestroyed { record },
                NetEvent::PeerDisconnected { net_id: NetId(1), cause: DisconnectCause::Closed },
            ]
        );
        assert!(host.records().is_empty());
        assert!(host.registry().ready().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_closes_clients() {
        let mut host = Host::bind(test_config(1)).await.unwrap();
        let client_config = NetConfig { connect_port: host.local_addr().port(), ..Default::default() };
        let mut host_events: Vec<NetEvent> = Vec::new();
        let mut client_events: Vec<NetEvent> = Vec::new();
        let mut client = Client::connect(client_config, &mut client_events).await.unwrap();

        tick_until(&mut host, &mut host_events, |h, _| h.registry().len() == 1).await;
        host.shutdown(&mut host_events);
        assert!(host.registry().is_empty());
        assert!(matches!(
            host_events.last(),
            Some(NetEvent::PeerDisconnected { cause: DisconnectCause::Shutdown, .. })
        ));

        for _ in 0..500 {
            client.tick(&mut client_events);
            if client.is_closed() {
                break;
            }
            tokio::time::sleep(DT).await;
        }
        assert!(client.is_closed());
        assert_eq!(client_events.last(), Some(&NetEvent::HostClosed));
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = blocker.local_addr().unwrap().port();
        let result = Host::bind(NetConfig { listen_port: port, ..Default::default() }).await;
        assert!(matches!(result, Err(TransportError::Bind { .. })));
    }
}
