//! Session Registry
//!
//! The host's connected peers, the subset that is ready for simulation
//! broadcasts, the authoritative Peer Records and the start votes. Owned by
//! [`Host`](crate::network::Host) and passed by reference to the dispatcher
//! and the liveness monitor.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use crate::network::events::{DisconnectCause, NetEvent, NetHandler};
use crate::network::records::PeerTable;
use crate::network::session::PeerSession;
use crate::protocol::{Message, NetId};

/// Host-side collection of peer sessions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: BTreeMap<NetId, PeerSession>,
    ready: Vec<NetId>,
    records: PeerTable,
    start_votes: BTreeSet<NetId>,
}

impl SessionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an admitted session.
    pub fn insert(&mut self, session: PeerSession) {
        let net_id = session.net_id();
        if self.sessions.insert(net_id, session).is_some() {
            warn!(%net_id, "replaced existing session");
        }
    }

    /// Session by id.
    pub fn get(&self, net_id: NetId) -> Option<&PeerSession> {
        self.sessions.get(&net_id)
    }

    /// Mutable session by id.
    pub fn get_mut(&mut self, net_id: NetId) -> Option<&mut PeerSession> {
        self.sessions.get_mut(&net_id)
    }

    /// True if `net_id` is connected.
    pub fn contains(&self, net_id: NetId) -> bool {
        self.sessions.contains_key(&net_id)
    }

    /// Connected peers.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// True when nobody is connected.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Connected ids in ascending order.
    pub fn net_ids(&self) -> Vec<NetId> {
        self.sessions.keys().copied().collect()
    }

    pub(crate) fn sessions_mut(&mut self) -> impl Iterator<Item = &mut PeerSession> {
        self.sessions.values_mut()
    }

    // =========================================================================
    // Ready subset
    // =========================================================================

    /// Add a peer to the ready subset. Returns false if it already was ready
    /// or is not connected.
    pub fn mark_ready(&mut self, net_id: NetId) -> bool {
        if !self.contains(net_id) || self.ready.contains(&net_id) {
            return false;
        }
        self.ready.push(net_id);
        true
    }

    /// True if the peer receives broadcasts.
    pub fn is_ready(&self, net_id: NetId) -> bool {
        self.ready.contains(&net_id)
    }

    /// Ready peers in the order they became ready.
    pub fn ready(&self) -> &[NetId] {
        &self.ready
    }

    // =========================================================================
    // Records and votes
    // =========================================================================

    /// Authoritative Peer Records.
    pub fn records(&self) -> &PeerTable {
        &self.records
    }

    /// Mutable Peer Records.
    pub fn records_mut(&mut self) -> &mut PeerTable {
        &mut self.records
    }

    /// Count a start vote, returning the total.
    pub fn vote_start(&mut self, net_id: NetId) -> usize {
        self.start_votes.insert(net_id);
        self.start_votes.len()
    }

    /// Votes collected so far.
    pub fn start_votes(&self) -> usize {
        self.start_votes.len()
    }

    /// Forget every vote.
    pub fn clear_votes(&mut self) {
        self.start_votes.clear();
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Queue `msg` to one peer.
    pub fn send_to(&mut self, net_id: NetId, msg: &Message) {
        match self.sessions.get_mut(&net_id) {
            Some(session) => {
                if let Err(err) = session.enqueue(msg) {
                    warn!(%net_id, kind = ?msg.kind(), error = %err, "dropping outbound message");
                }
            }
            None => debug!(%net_id, kind = ?msg.kind(), "send to unknown peer"),
        }
    }

    /// Queue `msg` to every ready peer.
    pub fn broadcast_ready(&mut self, msg: &Message) {
        for net_id in self.ready.clone() {
            self.send_to(net_id, msg);
        }
    }

    /// Queue `msg` to every ready peer and to `also`, once each.
    pub fn broadcast_ready_and(&mut self, msg: &Message, also: NetId) {
        self.broadcast_ready(msg);
        if !self.is_ready(also) {
            self.send_to(also, msg);
        }
    }

    /// Flush every session's outbound queue.
    pub fn flush_all(&mut self) {
        for session in self.sessions.values_mut() {
            if let Err(err) = session.flush() {
                warn!(net_id = %session.net_id(), error = %err, "flush failed");
            }
        }
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Remove a peer: leave the ready subset, destroy its actor while the
    /// record still exists, drop the record, then close the session.
    ///
    /// Returns false if the peer was not connected.
    pub fn disconnect<H: NetHandler>(&mut self, net_id: NetId, cause: DisconnectCause, handler: &mut H) -> bool {
        let Some(mut session) = self.sessions.remove(&net_id) else {
            return false;
        };

        self.ready.retain(|id| *id != net_id);
        if let Some(record) = self.records.get(net_id).copied() {
            handler.on_event(NetEvent::ActorDestroyed { record });
        }
        self.records.remove(net_id);
        session.close();
        self.start_votes.remove(&net_id);

        info!(%net_id, ?cause, peers = self.sessions.len(), "peer disconnected");
        handler.on_event(NetEvent::PeerDisconnected { net_id, cause });
        true
    }

    /// Disconnect everyone.
    pub fn shutdown<H: NetHandler>(&mut self, handler: &mut H) {
        for net_id in self.net_ids() {
            self.disconnect(net_id, DisconnectCause::Shutdown, handler);
        }
        self.records.clear();
        self.start_votes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode_batch, GameId, Position};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn registry_with(ids: &[i32]) -> (SessionRegistry, Vec<UnboundedReceiver<Vec<u8>>>) {
        let mut registry = SessionRegistry::new();
        let mut outputs = Vec::new();
        for id in ids {
            let (session, rx) = PeerSession::detached(NetId(*id), 256);
            registry.insert(session);
            outputs.push(rx);
        }
        (registry, outputs)
    }

    fn received(rx: &mut UnboundedReceiver<Vec<u8>>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(batch) = rx.try_recv() {
            out.extend(decode_batch(&batch).map(|m| m.unwrap()));
        }
        out
    }

    #[test]
    fn test_broadcast_reaches_only_ready_peers() {
        let (mut registry, mut rx) = registry_with(&[1, 2, 3]);
        assert!(registry.mark_ready(NetId(1)));
        assert!(registry.mark_ready(NetId(3)));
        assert!(!registry.mark_ready(NetId(3)));
        assert!(!registry.mark_ready(NetId(9)));

        let msg = Message::SpawnBubble { path_type: 2 };
        registry.broadcast_ready(&msg);
        registry.flush_all();

        assert_eq!(received(&mut rx[0]), vec![msg.clone()]);
        assert!(received(&mut rx[1]).is_empty());
        assert_eq!(received(&mut rx[2]), vec![msg]);
    }

    #[test]
    fn test_broadcast_ready_and_sends_once() {
        let (mut registry, mut rx) = registry_with(&[1, 2]);
        registry.mark_ready(NetId(1));
        let msg = Message::Ping { net_id: NetId(0) };

        registry.broadcast_ready_and(&msg, NetId(1));
        registry.broadcast_ready_and(&msg, NetId(2));
        registry.flush_all();

        assert_eq!(received(&mut rx[0]).len(), 2);
        assert_eq!(received(&mut rx[1]).len(), 1);
    }

    #[test]
    fn test_disconnect_order() {
        let (mut registry, _rx) = registry_with(&[1, 2]);
        registry.mark_ready(NetId(1));
        registry.vote_start(NetId(1));
        let record = registry.records_mut().spawn(NetId(1), GameId(1), Position::new(1.0, 2.0), 0, 3);

        let mut events: Vec<NetEvent> = Vec::new();
        assert!(registry.disconnect(NetId(1), DisconnectCause::Closed, &mut events));
        assert!(!registry.disconnect(NetId(1), DisconnectCause::Closed, &mut events));

        assert_eq!(
            events,
            vec![
                NetEvent::ActorDestroyed { record },
                NetEvent::PeerDisconnected { net_id: NetId(1), cause: DisconnectCause::Closed },
            ]
        );
        assert!(!registry.is_ready(NetId(1)));
        assert!(registry.records().get(NetId(1)).is_none());
        assert_eq!(registry.start_votes(), 0);
        assert_eq!(registry.net_ids(), vec![NetId(2)]);
    }

    #[test]
    fn test_shutdown_clears_everything() {
        let (mut registry, _rx) = registry_with(&[1, 2, 3]);
        registry.records_mut().spawn(NetId(2), GameId(1), Position::default(), 0, 3);

        let mut events: Vec<NetEvent> = Vec::new();
        registry.shutdown(&mut events);

        assert!(registry.is_empty());
        assert!(registry.records().is_empty());
        let disconnects = events
            .iter()
            .filter(|e| matches!(e, NetEvent::PeerDisconnected { cause: DisconnectCause::Shutdown, .. }))
            .count();
        assert_eq!(disconnects, 3);
        assert!(matches!(events[0], NetEvent::PeerDisconnected { net_id: NetId(1), .. }));
        assert!(matches!(events[1], NetEvent::ActorDestroyed { .. }));
    }
}
