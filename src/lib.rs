//! # Pulsemesh - Gossip Membership and Chat Engine
//!
//! Pulsemesh is the membership and message-dissemination engine of a
//! peer-to-peer presence mesh. Nodes joined to a shared overlay topic keep a
//! live view of every reachable peer via authenticated heartbeats and pass
//! two kinds of events through bounded multi-hop flooding: presence updates
//! and short chat messages.
//!
//! ## Protocol
//!
//! - **Identity**: Ed25519 keypair; the 32-byte public key is the node id.
//!   Admission requires a SHA-256 proof-of-work nonce bound to the id.
//! - **Heartbeats**: signed, strictly increasing sequence numbers; peers
//!   unrefreshed for a liveness TTL are evicted.
//! - **Relay fabric**: flood-with-dedup over the current peer sockets under
//!   a fixed hop budget, loop-suppressed by a rotating Bloom filter.
//! - **Chat**: LOCAL messages trusted only from their directly connected
//!   author; GLOBAL messages content-addressed, signed, freshness-checked,
//!   and relayed on the same fabric.
//!
//! ## Architecture
//!
//! The engine uses the **Actor Pattern**: all mutable state is owned by a
//! private actor task and the public [`Engine`] handle is cheap to clone.
//! The transport is external - anything that yields ordered duplex byte
//! streams (the bundled binary uses plain TCP) is attached with
//! [`Engine::add_connection`].
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `engine` | Engine actor: message handling, gossip tick, connections |
//! | `identity` | Keypairs, node ids, proof-of-work |
//! | `wire` | Line-delimited JSON codec and frame reader |
//! | `peers` | Membership view with cap and TTL eviction |
//! | `dedup` | Rotating Bloom relay filter |
//! | `limiter` | Chat rate limiting |
//! | `events` | Local subscriber fan-out |
//! | `diagnostics` | Engine counters |
//! | `config` | Tunables and environment overrides |

mod config;
mod dedup;
mod diagnostics;
mod engine;
mod events;
mod identity;
mod limiter;
mod peers;
mod wire;

pub use config::EngineConfig;
pub use diagnostics::Diagnostics;
pub use engine::{topic_hash, ChatRejection, Engine};
pub use events::{ChatEvent, EngineEvent, MembershipUpdate, PeerSummary};
pub use identity::{verify_signature, Keypair, NodeId, PowError, PowProof, POW_DIFFICULTY};
pub use wire::{
    chat_content_id, chat_signing_payload, heartbeat_signing_payload, leave_signing_payload,
    Chat, ChatId, ChatScope, Heartbeat, Leave, SigBytes, WireError, WireMessage,
};
