//! Peer Records
//!
//! Per-player state mirrored by both host and client: slot, position,
//! score and lives. The host is authoritative; clients rebuild theirs from
//! `Synchronize` and `SpawnPlayer`.

use std::collections::BTreeMap;

use crate::protocol::{GameId, NetId, PeerSnapshot, Position};

/// One known player. Same shape as its wire form.
pub type PeerRecord = PeerSnapshot;

/// Outcome of [`PeerTable::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// No record existed for this netId.
    Inserted,
    /// An existing record was overwritten.
    Updated,
}

/// Records keyed by netId, with `netId <-> gameId` kept one-to-one.
#[derive(Debug, Default, Clone)]
pub struct PeerTable {
    records: BTreeMap<NetId, PeerRecord>,
}

impl PeerTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record for a connection.
    pub fn get(&self, net_id: NetId) -> Option<&PeerRecord> {
        self.records.get(&net_id)
    }

    /// Mutable record for a connection.
    pub fn get_mut(&mut self, net_id: NetId) -> Option<&mut PeerRecord> {
        self.records.get_mut(&net_id)
    }

    /// Record holding a player slot.
    pub fn by_game_id(&self, game_id: GameId) -> Option<&PeerRecord> {
        self.records.values().find(|r| r.game_id == game_id)
    }

    /// Mutable record holding a player slot.
    pub fn by_game_id_mut(&mut self, game_id: GameId) -> Option<&mut PeerRecord> {
        self.records.values_mut().find(|r| r.game_id == game_id)
    }

    /// Connection that owns a player slot.
    pub fn net_id_for_game(&self, game_id: GameId) -> Option<NetId> {
        self.by_game_id(game_id).map(|r| r.net_id)
    }

    /// Lowest slot in `1..=4` not held by any record.
    pub fn allocate_game_id(&self) -> Option<GameId> {
        (GameId::FIRST.0..=GameId::LAST.0)
            .map(GameId)
            .find(|id| self.by_game_id(*id).is_none())
    }

    /// Create a fresh record for `net_id` at `position`.
    pub fn spawn(&mut self, net_id: NetId, game_id: GameId, position: Position, score: i32, lives: i32) -> PeerRecord {
        let record = PeerRecord { net_id, game_id, position, score, lives };
        self.upsert(record);
        record
    }

    /// Insert or overwrite a record. Any other record claiming the same slot
    /// is stale and gets evicted.
    pub fn upsert(&mut self, record: PeerRecord) -> Upsert {
        let stale: Vec<NetId> = self
            .records
            .values()
            .filter(|r| r.game_id == record.game_id && r.net_id != record.net_id)
            .map(|r| r.net_id)
            .collect();
        for net_id in stale {
            tracing::debug!(%net_id, game_id = %record.game_id, "evicting stale record");
            self.records.remove(&net_id);
        }

        match self.records.insert(record.net_id, record) {
            Some(_) => Upsert::Updated,
            None => Upsert::Inserted,
        }
    }

    /// Drop a record.
    pub fn remove(&mut self, net_id: NetId) -> Option<PeerRecord> {
        self.records.remove(&net_id)
    }

    /// Snapshot of every record, ordered by netId.
    pub fn snapshots(&self) -> Vec<PeerSnapshot> {
        self.records.values().copied().collect()
    }

    /// True if any player still has lives left (zero counts as alive).
    pub fn any_lives_remaining(&self) -> bool {
        self.records.values().any(|r| r.lives >= 0)
    }

    /// Iterate records in netId order.
    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.records.values()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Remove everything.
    pub fn clear(&mut self) {
        self.records.clear();
    }
}
