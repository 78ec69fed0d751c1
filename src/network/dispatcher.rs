//! Protocol Dispatcher
//!
//! Drains pending packages on the tick, decodes their batches and routes each
//! message to the host or client handler table. Handlers only touch Peer
//! Records where the message itself implies the change; everything else is
//! forwarded to gameplay as a [`NetEvent`].

use tracing::{debug, trace, warn};

use crate::config::{DispatchOrder, NetConfig};
use crate::network::client::ClientState;
use crate::network::events::{NetEvent, NetHandler};
use crate::network::liveness;
use crate::network::pool::PackagePool;
use crate::network::records::Upsert;
use crate::network::registry::SessionRegistry;
use crate::protocol::{
    decode_batch, Collision, GameState, InputType, Message, NetId, PeerSnapshot, RequestType, HEADER_SIZE,
};

/// Package drain loop with a reusable scratch buffer.
#[derive(Debug)]
pub struct Dispatcher {
    order: DispatchOrder,
    scratch: Vec<u8>,
}

impl Dispatcher {
    /// Dispatcher for packages of `buffer_size` bytes.
    pub fn new(order: DispatchOrder, buffer_size: usize) -> Self {
        Self { order, scratch: Vec::with_capacity(buffer_size) }
    }

    /// Dispatch every pending package, releasing each one. A malformed
    /// message drops the rest of its package.
    ///
    /// Returns the number of messages routed.
    pub fn drain(&mut self, pool: &PackagePool, mut route: impl FnMut(NetId, Message)) -> usize {
        let mut routed = 0;
        for id in pool.pending(self.order) {
            let origin = match pool.read(id, &mut self.scratch) {
                Ok(origin) => origin,
                Err(err) => {
                    warn!(error = %err, "package vanished before dispatch");
                    continue;
                }
            };
            if let Err(err) = pool.release(id) {
                warn!(error = %err, "package release failed");
            }

            let mut batch = decode_batch(&self.scratch);
            while let Some(item) = batch.next() {
                match item {
                    Ok(msg) => {
                        trace!(%origin, kind = ?msg.kind(), "dispatch");
                        route(origin, msg);
                        routed += 1;
                    }
                    Err(err) => {
                        let at = batch.offset();
                        let end = (at + HEADER_SIZE).min(self.scratch.len());
                        warn!(
                            %origin,
                            error = %err,
                            offset = at,
                            header = %hex::encode(&self.scratch[at.min(end)..end]),
                            "malformed frame, dropping rest of package"
                        );
                    }
                }
            }
        }
        routed
    }
}

// =============================================================================
// HOST HANDLERS
// =============================================================================

/// Route one message received by the host from `origin`.
pub fn dispatch_host<H: NetHandler>(
    registry: &mut SessionRegistry,
    config: &NetConfig,
    origin: NetId,
    msg: Message,
    handler: &mut H,
) {
    if !registry.contains(origin) {
        debug!(%origin, kind = ?msg.kind(), "message from departed peer");
        return;
    }

    match msg {
        Message::RequestToServer { net_id, request } => {
            check_sender(origin, net_id);
            match request {
                RequestType::Synchronize => handle_sync_request(registry, origin),
                RequestType::Spawn => handle_spawn_request(registry, config, origin, handler),
                RequestType::StartGame => handle_start_vote(registry, config, origin, handler),
                RequestType::Respawn => handle_respawn_request(registry, config, origin, handler),
            }
        }
        Message::ReadyToUpdate { net_id } => {
            check_sender(origin, net_id);
            if registry.mark_ready(origin) {
                debug!(%origin, ready = registry.ready().len(), "peer ready");
                handler.on_event(NetEvent::PeerReady { net_id: origin });
            }
        }
        Message::Ping { net_id } => {
            check_sender(origin, net_id);
            liveness::mark_alive(registry, origin);
        }
        Message::Input { net_id, input } => {
            check_sender(origin, net_id);
            handler.on_event(NetEvent::Input { net_id: origin, input });
            if input == InputType::Shoot {
                registry.broadcast_ready(&Message::Input { net_id: origin, input });
            }
        }
        other => debug!(%origin, kind = ?other.kind(), "ignoring host-bound message of client kind"),
    }
}

fn check_sender(origin: NetId, claimed: NetId) {
    if origin != claimed {
        debug!(%origin, %claimed, "message claims another netId, using the connection's");
    }
}

fn handle_sync_request(registry: &mut SessionRegistry, origin: NetId) {
    if registry.records().is_empty() {
        return;
    }
    let peers = registry.records().snapshots();
    registry.send_to(origin, &Message::Synchronize { peers });
}

fn handle_spawn_request<H: NetHandler>(
    registry: &mut SessionRegistry,
    config: &NetConfig,
    origin: NetId,
    handler: &mut H,
) {
    if let Some(existing) = registry.records().get(origin).copied() {
        debug!(%origin, game_id = %existing.game_id, "repeated spawn request");
        registry.broadcast_ready_and(&Message::SpawnPlayer(existing), origin);
        return;
    }

    let Some(game_id) = registry.records().allocate_game_id() else {
        warn!(%origin, "no free player slot");
        return;
    };
    let position = game_id
        .slot_index()
        .map(|i| config.spawn_points[i])
        .unwrap_or_default();
    let record = registry
        .records_mut()
        .spawn(origin, game_id, position, config.initial_score, config.initial_lives);

    debug!(%origin, %game_id, "player spawned");
    handler.on_event(NetEvent::PlayerSpawned { record });
    // The only broadcast that reaches a peer before it is ready: the
    // requester learns its own slot from it.
    registry.broadcast_ready_and(&Message::SpawnPlayer(record), origin);
}

fn handle_start_vote<H: NetHandler>(
    registry: &mut SessionRegistry,
    config: &NetConfig,
    origin: NetId,
    handler: &mut H,
) {
    let votes = registry.vote_start(origin);
    let needed = config.peer_limit;
    handler.on_event(NetEvent::StartVote { net_id: origin, votes, needed });

    if votes >= needed {
        registry.clear_votes();
        handler.on_event(NetEvent::GameStateChanged { state: GameState::StartGame });
        registry.broadcast_ready(&Message::GameState { state: GameState::StartGame });
    }
}

fn handle_respawn_request<H: NetHandler>(
    registry: &mut SessionRegistry,
    config: &NetConfig,
    origin: NetId,
    handler: &mut H,
) {
    let Some(record) = registry.records_mut().get_mut(origin) else {
        debug!(%origin, "respawn before spawn");
        return;
    };
    if record.lives < 0 {
        debug!(%origin, "respawn refused, no lives left");
        return;
    }

    let position = record
        .game_id
        .slot_index()
        .map(|i| config.spawn_points[i])
        .unwrap_or_default();
    record.position = position;

    handler.on_event(NetEvent::Respawned { net_id: origin, position });
    registry.broadcast_ready(&Message::Respawn { net_id: origin, position });
}

// =============================================================================
// CLIENT HANDLERS
// =============================================================================

/// Route one message received by the client from the host.
pub fn dispatch_client<H: NetHandler>(state: &mut ClientState, msg: Message, handler: &mut H) {
    match msg {
        Message::SuccessfulConnection { net_id } => {
            state.net_id = Some(net_id);
            handler.on_event(NetEvent::Connected { net_id });
            state.send(&Message::RequestToServer { net_id, request: RequestType::Synchronize });
            state.send(&Message::RequestToServer { net_id, request: RequestType::Spawn });
        }
        Message::ClientLimitReached => {
            warn!("host is full");
            state.close();
            handler.on_event(NetEvent::Rejected);
        }
        Message::Synchronize { peers } => {
            for peer in peers {
                upsert_record(state, peer, handler);
            }
        }
        Message::SpawnPlayer(peer) => upsert_record(state, peer, handler),
        Message::Ping { .. } => {
            if let Some(net_id) = state.net_id {
                state.send(&Message::Ping { net_id });
            }
        }
        Message::Input { net_id, input } => handler.on_event(NetEvent::Input { net_id, input }),
        Message::GameState { state: game_state } => {
            handler.on_event(NetEvent::GameStateChanged { state: game_state })
        }
        Message::SpawnBubble { path_type } => handler.on_event(NetEvent::BubbleSpawned { path_type }),
        Message::Collision { net_id, collision } => apply_collision(state, net_id, collision, handler),
        Message::Respawn { net_id, position } => {
            if let Some(record) = state.records.get_mut(net_id) {
                record.position = position;
            }
            handler.on_event(NetEvent::Respawned { net_id, position });
        }
        Message::PlayerPosition { net_id, position } => {
            if let Some(record) = state.records.get_mut(net_id) {
                record.position = position;
            }
            handler.on_event(NetEvent::PositionCorrected { net_id, position });
        }
        other => debug!(kind = ?other.kind(), "ignoring client-bound message of host kind"),
    }
}

fn upsert_record<H: NetHandler>(state: &mut ClientState, record: PeerSnapshot, handler: &mut H) {
    match state.records.upsert(record) {
        Upsert::Inserted => handler.on_event(NetEvent::PlayerSpawned { record }),
        Upsert::Updated => handler.on_event(NetEvent::PlayerSynchronized { record }),
    }
}

fn apply_collision<H: NetHandler>(state: &mut ClientState, net_id: NetId, collision: Collision, handler: &mut H) {
    match collision {
        Collision::Bullet { bullet_id, bubble_id } => {
            let score = match state.records.get_mut(net_id) {
                Some(record) => {
                    record.score += 1;
                    record.score
                }
                None => 0,
            };
            handler.on_event(NetEvent::BulletCollision { net_id, bullet_id, bubble_id, score });
        }
        Collision::Ship { bubble_id, lives_remaining } => {
            if let Some(record) = state.records.get_mut(net_id) {
                record.lives = lives_remaining;
            }
            handler.on_event(NetEvent::ShipCollision { net_id, bubble_id, lives: lives_remaining });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::session::PeerSession;
    use crate::protocol::{encode, encode_batch, GameId, Position};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn received(rx: &mut UnboundedReceiver<Vec<u8>>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(batch) = rx.try_recv() {
            out.extend(decode_batch(&batch).map(|m| m.unwrap()));
        }
        out
    }

    fn host(ids: &[i32]) -> (SessionRegistry, NetConfig, Vec<UnboundedReceiver<Vec<u8>>>) {
        let mut registry = SessionRegistry::new();
        let mut outputs = Vec::new();
        for id in ids {
            let (session, rx) = PeerSession::detached(NetId(*id), 1024);
            registry.insert(session);
            outputs.push(rx);
        }
        let config = NetConfig { peer_limit: ids.len().max(1), ..Default::default() };
        (registry, config, outputs)
    }

    fn request(net: i32, request: RequestType) -> Message {
        Message::RequestToServer { net_id: NetId(net), request }
    }

    #[test]
    fn test_drain_in_arrival_order_and_stops_at_malformed() {
        let pool = PackagePool::new(128, 2);
        let mut bad = encode(&Message::Ping { net_id: NetId(1) });
        bad[4..8].copy_from_slice(&99i32.to_le_bytes());
        let good = encode(&Message::Ping { net_id: NetId(2) });

        let mut first = Vec::new();
        encode_batch([good.as_slice(), bad.as_slice(), good.as_slice()], 128, &mut first).unwrap();
        let mut second = Vec::new();
        encode_batch([good.as_slice()], 128, &mut second).unwrap();
        pool.receive(NetId(7), &first).unwrap();
        pool.receive(NetId(8), &second).unwrap();

        let mut dispatcher = Dispatcher::new(DispatchOrder::Arrival, 128);
        let mut seen = Vec::new();
        let routed = dispatcher.drain(&pool, |origin, msg| seen.push((origin, msg)));

        assert_eq!(routed, 2);
        assert_eq!(seen[0].0, NetId(7));
        assert_eq!(seen[1].0, NetId(8));
        assert_eq!(pool.pending_count(), 0);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn test_spawn_request_creates_record_and_notifies() {
        let (mut registry, config, mut rx) = host(&[1, 2]);
        registry.mark_ready(NetId(2));
        let mut events: Vec<NetEvent> = Vec::new();

        dispatch_host(&mut registry, &config, NetId(1), request(1, RequestType::Spawn), &mut events);
        registry.flush_all();

        let record = *registry.records().get(NetId(1)).unwrap();
        assert_eq!(record.game_id, GameId(1));
        assert_eq!(record.position, config.spawn_points[0]);
        assert_eq!((record.score, record.lives), (0, 3));
        assert_eq!(events, vec![NetEvent::PlayerSpawned { record }]);
        assert_eq!(received(&mut rx[0]), vec![Message::SpawnPlayer(record)]);
        assert_eq!(received(&mut rx[1]), vec![Message::SpawnPlayer(record)]);

        dispatch_host(&mut registry, &config, NetId(2), request(2, RequestType::Spawn), &mut events);
        assert_eq!(registry.records().get(NetId(2)).unwrap().game_id, GameId(2));
    }

    #[test]
    fn test_spawn_skips_bystanders_that_are_not_ready() {
        let (mut registry, config, mut rx) = host(&[1, 2, 3]);
        registry.mark_ready(NetId(2));
        let mut events: Vec<NetEvent> = Vec::new();

        dispatch_host(&mut registry, &config, NetId(1), request(1, RequestType::Spawn), &mut events);
        registry.flush_all();

        let record = *registry.records().get(NetId(1)).unwrap();
        assert_eq!(received(&mut rx[0]), vec![Message::SpawnPlayer(record)]);
        assert_eq!(received(&mut rx[1]), vec![Message::SpawnPlayer(record)]);
        assert!(received(&mut rx[2]).is_empty());
    }

    #[test]
    fn test_sync_request_replies_to_requester_only() {
        let (mut registry, config, mut rx) = host(&[1, 2]);
        registry.mark_ready(NetId(2));
        let mut events: Vec<NetEvent> = Vec::new();

        dispatch_host(&mut registry, &config, NetId(1), request(1, RequestType::Synchronize), &mut events);
        registry.flush_all();
        assert!(received(&mut rx[0]).is_empty());

        registry.records_mut().spawn(NetId(2), GameId(1), Position::new(1.0, 1.0), 4, 2);
        dispatch_host(&mut registry, &config, NetId(1), request(1, RequestType::Synchronize), &mut events);
        registry.flush_all();

        let peers = registry.records().snapshots();
        assert_eq!(received(&mut rx[0]), vec![Message::Synchronize { peers }]);
        assert!(received(&mut rx[1]).is_empty());
    }

    #[test]
    fn test_start_game_needs_every_vote() {
        let (mut registry, config, mut rx) = host(&[1, 2]);
        registry.mark_ready(NetId(1));
        registry.mark_ready(NetId(2));
        let mut events: Vec<NetEvent> = Vec::new();

        dispatch_host(&mut registry, &config, NetId(1), request(1, RequestType::StartGame), &mut events);
        dispatch_host(&mut registry, &config, NetId(1), request(1, RequestType::StartGame), &mut events);
        assert!(!events.iter().any(|e| matches!(e, NetEvent::GameStateChanged { .. })));

        dispatch_host(&mut registry, &config, NetId(2), request(2, RequestType::StartGame), &mut events);
        registry.flush_all();

        assert_eq!(events.last(), Some(&NetEvent::GameStateChanged { state: GameState::StartGame }));
        for rx in rx.iter_mut() {
            assert_eq!(received(rx), vec![Message::GameState { state: GameState::StartGame }]);
        }
        assert_eq!(registry.start_votes(), 0);
    }

    #[test]
    fn test_respawn_only_with_lives() {
        let (mut registry, config, mut rx) = host(&[1]);
        registry.mark_ready(NetId(1));
        registry.records_mut().spawn(NetId(1), GameId(2), Position::new(9.0, 9.0), 0, 0);
        let mut events: Vec<NetEvent> = Vec::new();

        dispatch_host(&mut registry, &config, NetId(1), request(1, RequestType::Respawn), &mut events);
        registry.flush_all();
        let position = config.spawn_points[1];
        assert_eq!(registry.records().get(NetId(1)).unwrap().position, position);
        assert_eq!(received(&mut rx[0]), vec![Message::Respawn { net_id: NetId(1), position }]);

        registry.records_mut().get_mut(NetId(1)).unwrap().lives = -1;
        events.clear();
        dispatch_host(&mut registry, &config, NetId(1), request(1, RequestType::Respawn), &mut events);
        assert!(events.is_empty());
    }

    #[test]
    fn test_shoot_is_rebroadcast_movement_is_not() {
        let (mut registry, config, mut rx) = host(&[1, 2]);
        registry.mark_ready(NetId(2));
        let mut events: Vec<NetEvent> = Vec::new();

        let up = Message::Input { net_id: NetId(1), input: InputType::Up };
        let shoot = Message::Input { net_id: NetId(1), input: InputType::Shoot };
        dispatch_host(&mut registry, &config, NetId(1), up, &mut events);
        dispatch_host(&mut registry, &config, NetId(1), shoot.clone(), &mut events);
        registry.flush_all();

        assert_eq!(events.len(), 2);
        assert!(received(&mut rx[0]).is_empty());
        assert_eq!(received(&mut rx[1]), vec![shoot]);
    }

    #[test]
    fn test_ready_and_ping() {
        let (mut registry, config, _rx) = host(&[1]);
        registry.get_mut(NetId(1)).unwrap().set_active(false);
        registry.get_mut(NetId(1)).unwrap().add_strike();
        let mut events: Vec<NetEvent> = Vec::new();

        dispatch_host(&mut registry, &config, NetId(1), Message::ReadyToUpdate { net_id: NetId(1) }, &mut events);
        dispatch_host(&mut registry, &config, NetId(1), Message::ReadyToUpdate { net_id: NetId(1) }, &mut events);
        dispatch_host(&mut registry, &config, NetId(1), Message::Ping { net_id: NetId(1) }, &mut events);

        assert_eq!(events, vec![NetEvent::PeerReady { net_id: NetId(1) }]);
        let session = registry.get(NetId(1)).unwrap();
        assert!(session.is_active());
        assert_eq!(session.strikes(), 0);
    }

    #[test]
    fn test_departed_peer_is_ignored() {
        let (mut registry, config, _rx) = host(&[1]);
        let mut events: Vec<NetEvent> = Vec::new();
        dispatch_host(&mut registry, &config, NetId(5), request(5, RequestType::Spawn), &mut events);
        assert!(events.is_empty());
        assert!(registry.records().is_empty());
    }

    fn client() -> (ClientState, UnboundedReceiver<Vec<u8>>) {
        let (session, rx) = PeerSession::detached(NetId(0), 1024);
        (ClientState::new(session), rx)
    }

    fn snapshot(net: i32, game: i32, x: f32, score: i32, lives: i32) -> PeerSnapshot {
        PeerSnapshot {
            net_id: NetId(net),
            game_id: GameId(game),
            position: Position::new(x, -x),
            score,
            lives,
        }
    }

    #[test]
    fn test_client_handshake_requests_sync_then_spawn() {
        let (mut state, mut rx) = client();
        let mut events: Vec<NetEvent> = Vec::new();
        dispatch_client(&mut state, Message::SuccessfulConnection { net_id: NetId(3) }, &mut events);
        state.flush();

        assert_eq!(state.net_id, Some(NetId(3)));
        assert_eq!(events, vec![NetEvent::Connected { net_id: NetId(3) }]);
        assert_eq!(
            received(&mut rx),
            vec![request(3, RequestType::Synchronize), request(3, RequestType::Spawn)]
        );
    }

    #[test]
    fn test_client_builds_records_from_synchronize() {
        let (mut state, _rx) = client();
        let mut events: Vec<NetEvent> = Vec::new();
        let peers = vec![snapshot(1, 1, 2.5, 7, 3), snapshot(2, 2, -1.0, 0, 1)];

        dispatch_client(&mut state, Message::Synchronize { peers: peers.clone() }, &mut events);

        assert_eq!(state.records.len(), 2);
        for peer in &peers {
            let record = state.records.get(peer.net_id).unwrap();
            assert_eq!(record.game_id, peer.game_id);
            assert_eq!(record.position, peer.position);
            assert_eq!(record.score, peer.score);
            assert_eq!(record.lives, peer.lives);
        }
        assert!(events.iter().all(|e| matches!(e, NetEvent::PlayerSpawned { .. })));

        events.clear();
        dispatch_client(&mut state, Message::Synchronize { peers }, &mut events);
        assert_eq!(state.records.len(), 2);
        assert!(events.iter().all(|e| matches!(e, NetEvent::PlayerSynchronized { .. })));
    }

    #[test]
    fn test_client_keeps_departed_peer_until_slot_reused() {
        let (mut state, _rx) = client();
        let mut events: Vec<NetEvent> = Vec::new();
        let peers = vec![snapshot(1, 1, 0.0, 0, 3), snapshot(2, 2, 0.0, 0, 3)];
        dispatch_client(&mut state, Message::Synchronize { peers }, &mut events);

        // Peer 2 left: the next sync no longer lists it.
        dispatch_client(&mut state, Message::Synchronize { peers: vec![snapshot(1, 1, 0.0, 0, 3)] }, &mut events);
        assert_eq!(state.records.len(), 2);
        assert!(state.records.get(NetId(2)).is_some());

        dispatch_client(&mut state, Message::SpawnPlayer(snapshot(3, 2, 1.0, 0, 3)), &mut events);
        assert_eq!(state.records.len(), 2);
        assert!(state.records.get(NetId(2)).is_none());
        assert_eq!(state.records.get(NetId(3)).unwrap().game_id, GameId(2));
    }

    #[test]
    fn test_client_applies_ship_collision() {
        let (mut state, _rx) = client();
        state.records.upsert(snapshot(5, 1, 0.0, 0, 2));
        let mut events: Vec<NetEvent> = Vec::new();

        let msg = Message::Collision {
            net_id: NetId(5),
            collision: Collision::Ship { bubble_id: 9, lives_remaining: 1 },
        };
        dispatch_client(&mut state, msg, &mut events);

        assert_eq!(state.records.get(NetId(5)).unwrap().lives, 1);
        assert_eq!(events, vec![NetEvent::ShipCollision { net_id: NetId(5), bubble_id: 9, lives: 1 }]);
    }

    #[test]
    fn test_client_bullet_collision_scores() {
        let (mut state, _rx) = client();
        state.records.upsert(snapshot(5, 1, 0.0, 4, 2));
        let mut events: Vec<NetEvent> = Vec::new();
        let msg = Message::Collision {
            net_id: NetId(5),
            collision: Collision::Bullet { bullet_id: 11, bubble_id: 9 },
        };
        dispatch_client(&mut state, msg, &mut events);
        assert_eq!(state.records.get(NetId(5)).unwrap().score, 5);
        assert!(matches!(events[0], NetEvent::BulletCollision { score: 5, .. }));
    }

    #[test]
    fn test_client_answers_ping_and_moves_records() {
        let (mut state, mut rx) = client();
        state.net_id = Some(NetId(4));
        state.records.upsert(snapshot(4, 1, 0.0, 0, 3));
        let mut events: Vec<NetEvent> = Vec::new();

        dispatch_client(&mut state, Message::Ping { net_id: NetId(4) }, &mut events);
        let position = Position::new(3.0, 4.0);
        dispatch_client(&mut state, Message::PlayerPosition { net_id: NetId(4), position }, &mut events);
        state.flush();

        assert_eq!(received(&mut rx), vec![Message::Ping { net_id: NetId(4) }]);
        assert_eq!(state.records.get(NetId(4)).unwrap().position, position);
        assert_eq!(events, vec![NetEvent::PositionCorrected { net_id: NetId(4), position }]);
    }

    #[test]
    fn test_client_limit_closes() {
        let (mut state, _rx) = client();
        let mut events: Vec<NetEvent> = Vec::new();
        dispatch_client(&mut state, Message::ClientLimitReached, &mut events);
        assert!(state.is_closed());
        assert_eq!(events, vec![NetEvent::Rejected]);
    }
}
