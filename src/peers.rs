//! # Peer Table
//!
//! The authoritative membership view: one [`PeerRecord`] per live peer, keyed
//! by node id. All mutation goes through [`PeerTable::add_or_update`], the
//! single choke point that enforces per-peer sequence monotonicity and the
//! table cap.
//!
//! Invariants:
//!
//! - `seq` is monotone non-decreasing per id while the record exists
//! - `last_seen` advances only on acceptance
//! - table size never exceeds the configured cap
//! - the local node's record is always present and carries the most
//!   recently emitted sequence number

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use crate::identity::NodeId;

/// One known live peer.
#[derive(Clone, Copy, Debug)]
pub struct PeerRecord {
    /// Last accepted sequence number from this peer.
    pub seq: u64,
    /// Time of the last accepted heartbeat.
    pub last_seen: Instant,
    /// Remote address observed on a 0-hop delivery, if any.
    pub direct_ip: Option<IpAddr>,
}

/// Outcome of [`PeerTable::add_or_update`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdmitOutcome {
    /// A previously unknown peer was admitted.
    New,
    /// An existing record advanced to a newer sequence.
    Refreshed,
    /// The sequence did not advance; no effect.
    StaleSeq,
    /// Unknown peer and the table is at capacity; no effect.
    TableFull,
}

#[derive(Debug)]
pub struct PeerTable {
    local_id: NodeId,
    peers: HashMap<NodeId, PeerRecord>,
    max_peers: usize,
    /// Lifetime count of distinct admitted ids, local node included.
    total_unique: u64,
}

impl PeerTable {
    pub fn new(local_id: NodeId, max_peers: usize, now: Instant) -> Self {
        let mut peers = HashMap::new();
        peers.insert(
            local_id,
            PeerRecord {
                seq: 0,
                last_seen: now,
                direct_ip: None,
            },
        );
        Self {
            local_id,
            peers,
            max_peers,
            total_unique: 1,
        }
    }

    pub fn get(&self, id: &NodeId) -> Option<&PeerRecord> {
        self.peers.get(id)
    }

    /// Whether a heartbeat from `id` could be admitted: already known, or
    /// the cap leaves room.
    pub fn can_accept(&self, id: &NodeId) -> bool {
        self.peers.contains_key(id) || self.peers.len() < self.max_peers
    }

    /// Insert or refresh a record.
    ///
    /// Rejects with no effect unless `seq` strictly exceeds the stored
    /// sequence; unknown ids are admitted only below the cap. `direct_ip`
    /// overwrites only when `Some` (0-hop deliveries); relayed heartbeats
    /// preserve an existing direct address.
    pub fn add_or_update(
        &mut self,
        id: NodeId,
        seq: u64,
        now: Instant,
        direct_ip: Option<IpAddr>,
    ) -> AdmitOutcome {
        if let Some(record) = self.peers.get_mut(&id) {
            if seq <= record.seq {
                return AdmitOutcome::StaleSeq;
            }
            record.seq = seq;
            record.last_seen = now;
            if direct_ip.is_some() {
                record.direct_ip = direct_ip;
            }
            return AdmitOutcome::Refreshed;
        }

        if self.peers.len() >= self.max_peers {
            return AdmitOutcome::TableFull;
        }

        self.peers.insert(
            id,
            PeerRecord {
                seq,
                last_seen: now,
                direct_ip,
            },
        );
        self.total_unique += 1;
        AdmitOutcome::New
    }

    /// Refresh the local node's record after emitting a heartbeat.
    pub fn touch_local(&mut self, seq: u64, now: Instant) {
        if let Some(record) = self.peers.get_mut(&self.local_id) {
            record.seq = seq;
            record.last_seen = now;
        }
    }

    pub fn remove(&mut self, id: &NodeId) -> bool {
        if *id == self.local_id {
            return false;
        }
        self.peers.remove(id).is_some()
    }

    /// Drop the direct-link address for a peer whose socket went away.
    pub fn clear_direct_ip(&mut self, id: &NodeId) {
        if let Some(record) = self.peers.get_mut(id) {
            record.direct_ip = None;
        }
    }

    /// Evict every record not refreshed within `ttl`. The local node is
    /// exempt. Returns the evicted ids.
    pub fn sweep_stale(&mut self, now: Instant, ttl: Duration) -> Vec<NodeId> {
        let local_id = self.local_id;
        let evicted: Vec<NodeId> = self
            .peers
            .iter()
            .filter(|(id, record)| {
                **id != local_id && now.duration_since(record.last_seen) > ttl
            })
            .map(|(id, _)| *id)
            .collect();
        for id in &evicted {
            self.peers.remove(id);
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn total_unique(&self) -> u64 {
        self.total_unique
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.peers.contains_key(id)
    }

    /// Current membership view.
    pub fn snapshot(&self) -> Vec<(NodeId, PeerRecord)> {
        self.peers.iter().map(|(id, rec)| (*id, *rec)).collect()
    }

    /// Peers with a known direct-link address.
    pub fn peers_with_ips(&self) -> Vec<(NodeId, IpAddr)> {
        self.peers
            .iter()
            .filter_map(|(id, rec)| rec.direct_ip.map(|ip| (*id, ip)))
            .collect()
    }
}
