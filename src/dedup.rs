//! # Relay Dedup Filter
//!
//! A pair of Bloom filters in a rotating current/previous scheme identifies
//! `(id, kind)` tuples this node has already forwarded, suppressing gossip
//! loops. Insertions go to the current generation; queries consult both.
//! Every rotation interval the previous generation is dropped and replaced
//! by the current one, which yields bounded memory and automatic forgetting
//! (a peer's sequence advances indefinitely and chat ids accumulate, so
//! nothing can be remembered forever).
//!
//! The rotation window must exceed the worst-case relay propagation time by
//! a wide margin; at the default 60 s window and sub-second hop latency it
//! does so by two orders of magnitude.

use std::time::{Duration, Instant};

use crate::identity::NodeId;
use crate::wire::ChatId;

/// Bits per Bloom generation (32 KiB).
///
/// Sized for ~1% false positives with 7 probes at roughly 27k marks per
/// window, comfortably above the expected load of a full peer table
/// heartbeating through one rotation.
const FILTER_BITS: usize = 1 << 18;

/// Probes per key.
const FILTER_HASHES: u64 = 7;

/// Domain prefix for mark digests.
const MARK_DOMAIN: &[u8] = b"relay-mark-v1:";

/// An opaque token identifying one relayable event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RelayMark([u8; 32]);

impl RelayMark {
    fn digest(kind: &'static [u8], bytes: &[u8], extra: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(MARK_DOMAIN);
        hasher.update(kind);
        hasher.update(bytes);
        hasher.update(extra);
        Self(*hasher.finalize().as_bytes())
    }

    /// Mark for a heartbeat `(id, seq)` pair.
    pub fn heartbeat(id: &NodeId, seq: u64) -> Self {
        Self::digest(b"hb", id.as_bytes(), &seq.to_le_bytes())
    }

    /// Mark for a leave announcement from `id`.
    pub fn leave(id: &NodeId) -> Self {
        Self::digest(b"leave", id.as_bytes(), &[])
    }

    /// Mark for a content-addressed chat message.
    pub fn chat(id: &ChatId) -> Self {
        Self::digest(b"chat", &id.0, &[])
    }
}

struct Bloom {
    bits: Vec<u64>,
}

impl Bloom {
    fn new() -> Self {
        Self {
            bits: vec![0u64; FILTER_BITS / 64],
        }
    }

    /// Double hashing over the mark digest: probe i hits
    /// `h1 + i * h2 (mod FILTER_BITS)`.
    fn probes(mark: &RelayMark) -> impl Iterator<Item = usize> {
        let h1 = u64::from_le_bytes(mark.0[0..8].try_into().expect("digest is 32 bytes"));
        let h2 = u64::from_le_bytes(mark.0[8..16].try_into().expect("digest is 32 bytes")) | 1;
        (0..FILTER_HASHES).map(move |i| (h1.wrapping_add(h2.wrapping_mul(i)) as usize) % FILTER_BITS)
    }

    fn insert(&mut self, mark: &RelayMark) {
        for bit in Self::probes(mark) {
            self.bits[bit / 64] |= 1u64 << (bit % 64);
        }
    }

    fn contains(&self, mark: &RelayMark) -> bool {
        Self::probes(mark).all(|bit| self.bits[bit / 64] & (1u64 << (bit % 64)) != 0)
    }

    fn clear(&mut self) {
        self.bits.fill(0);
    }
}

/// Rotating two-generation relay filter.
pub struct RelayFilter {
    current: Bloom,
    previous: Bloom,
    rotation_interval: Duration,
    last_rotation: Instant,
}

impl RelayFilter {
    pub fn new(rotation_interval: Duration, now: Instant) -> Self {
        Self {
            current: Bloom::new(),
            previous: Bloom::new(),
            rotation_interval,
            last_rotation: now,
        }
    }

    /// Whether this mark was forwarded within the last two rotation windows.
    pub fn has_relayed(&self, mark: &RelayMark) -> bool {
        self.current.contains(mark) || self.previous.contains(mark)
    }

    /// Record a mark in the current generation.
    pub fn mark_relayed(&mut self, mark: &RelayMark) {
        self.current.insert(mark);
    }

    /// Rotate generations if the interval elapsed. Returns whether a
    /// rotation happened.
    pub fn rotate_if_due(&mut self, now: Instant) -> bool {
        if now.duration_since(self.last_rotation) < self.rotation_interval {
            return false;
        }
        std::mem::swap(&mut self.current, &mut self.previous);
        self.current.clear();
        self.last_rotation = now;
        true
    }
}
