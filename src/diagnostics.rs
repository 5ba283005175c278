//! Monotonic engine counters, snapshotable and embedded in every membership
//! event payload.

use serde::Serialize;

/// Counter set for the engine's hot paths. Owned by the engine actor; all
/// increments happen on its single thread of execution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    pub heartbeats_received: u64,
    pub heartbeats_relayed: u64,
    pub duplicate_seq: u64,
    pub invalid_pow: u64,
    pub invalid_sig: u64,
    pub new_peers_added: u64,
    pub leave_messages: u64,
    pub decode_failures: u64,
    pub chats_received: u64,
    pub chats_relayed: u64,
}

impl Diagnostics {
    pub fn snapshot(&self) -> Diagnostics {
        *self
    }
}
