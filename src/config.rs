//! Engine configuration.
//!
//! All tunables in one plain struct with protocol defaults. The binary
//! layers environment overrides on top via [`EngineConfig::from_env`].

use std::time::Duration;

use crate::identity::POW_DIFFICULTY;
use crate::wire::DEFAULT_MAX_MESSAGE_SIZE;

/// Interval between self-heartbeat rounds.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500);

/// Heartbeat intervals a peer may miss before eviction.
pub const LIVENESS_MULTIPLIER: u32 = 5;

/// Relay hop budget.
pub const DEFAULT_MAX_RELAY_HOPS: u8 = 3;

/// Maximum peers admitted to the table.
pub const DEFAULT_MAX_PEERS: usize = 2048;

/// Per-sender chat window and budget.
pub const DEFAULT_CHAT_WINDOW: Duration = Duration::from_secs(10);
pub const DEFAULT_CHAT_MAX: u32 = 5;

/// Maximum age/skew of a GLOBAL chat timestamp.
pub const DEFAULT_CHAT_FRESHNESS: Duration = Duration::from_secs(60);

/// Relay dedup filter rotation interval.
pub const DEFAULT_ROTATION_INTERVAL: Duration = Duration::from_secs(60);

/// Grace period between the LEAVE broadcast and actor exit.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Event bus capacity per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Outbound frame queue per peer socket.
pub const DEFAULT_OUTBOUND_QUEUE: usize = 64;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub heartbeat_interval: Duration,
    /// Eviction threshold; defaults to `LIVENESS_MULTIPLIER` heartbeats.
    pub liveness_ttl: Duration,
    pub max_relay_hops: u8,
    pub max_message_size: usize,
    pub max_peers: usize,
    pub pow_difficulty: u32,
    pub chat_window: Duration,
    pub chat_max: u32,
    pub chat_freshness: Duration,
    pub rotation_interval: Duration,
    pub shutdown_grace: Duration,
    pub enable_chat: bool,
    pub event_capacity: usize,
    pub outbound_queue: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            liveness_ttl: DEFAULT_HEARTBEAT_INTERVAL * LIVENESS_MULTIPLIER,
            max_relay_hops: DEFAULT_MAX_RELAY_HOPS,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_peers: DEFAULT_MAX_PEERS,
            pow_difficulty: POW_DIFFICULTY,
            chat_window: DEFAULT_CHAT_WINDOW,
            chat_max: DEFAULT_CHAT_MAX,
            chat_freshness: DEFAULT_CHAT_FRESHNESS,
            rotation_interval: DEFAULT_ROTATION_INTERVAL,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            enable_chat: true,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
        }
    }
}

impl EngineConfig {
    /// Defaults with documented environment overrides applied:
    /// `HEARTBEAT_INTERVAL_MS`, `LIVENESS_TTL_MS`, `MAX_RELAY_HOPS`,
    /// `MAX_MESSAGE_SIZE`, `MAX_PEERS`, `POW_DIFFICULTY`,
    /// `CHAT_WINDOW_MS`, `CHAT_MAX`, `ENABLE_CHAT`.
    ///
    /// Unless `LIVENESS_TTL_MS` is set explicitly, the TTL tracks the
    /// (possibly overridden) heartbeat interval.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(interval) = env_ms("HEARTBEAT_INTERVAL_MS") {
            config.heartbeat_interval = interval;
            config.liveness_ttl = interval * LIVENESS_MULTIPLIER;
        }
        if let Some(ttl) = env_ms("LIVENESS_TTL_MS") {
            config.liveness_ttl = ttl;
        }
        if let Some(hops) = env_parse::<u8>("MAX_RELAY_HOPS") {
            config.max_relay_hops = hops;
        }
        if let Some(size) = env_parse::<usize>("MAX_MESSAGE_SIZE") {
            config.max_message_size = size;
        }
        if let Some(peers) = env_parse::<usize>("MAX_PEERS") {
            config.max_peers = peers;
        }
        if let Some(difficulty) = env_parse::<u32>("POW_DIFFICULTY") {
            config.pow_difficulty = difficulty;
        }
        if let Some(window) = env_ms("CHAT_WINDOW_MS") {
            config.chat_window = window;
        }
        if let Some(max) = env_parse::<u32>("CHAT_MAX") {
            config.chat_max = max;
        }
        if let Some(enabled) = env_parse::<bool>("ENABLE_CHAT") {
            config.enable_chat = enabled;
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.parse().ok()
}

fn env_ms(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}
