//! # Chat Rate Limiting
//!
//! Fixed-window limiter for chat traffic: one window per sender for
//! peer-originated chat, plus a process-global window for locally submitted
//! chat. Per-sender state lives in a bounded LRU map and is garbage-collected
//! once a sender has been quiet for ten windows.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::identity::NodeId;

/// Maximum senders tracked at once. Bounds the limiter itself against
/// identity churn.
const MAX_TRACKED_SENDERS: usize = 4096;

/// Windows of inactivity after which a sender's state is collected.
const GC_IDLE_WINDOWS: u32 = 10;

/// Per-sender counter over a fixed window.
#[derive(Clone, Copy, Debug)]
pub struct SlidingWindow {
    count: u32,
    window_start: Instant,
}

impl SlidingWindow {
    pub fn new(now: Instant) -> Self {
        Self {
            count: 0,
            window_start: now,
        }
    }

    /// Record one event if the window has room. Returns whether it was
    /// allowed. A window older than `window` resets before counting.
    pub fn check_and_record(&mut self, now: Instant, window: Duration, max: u32) -> bool {
        if now.duration_since(self.window_start) > window {
            self.count = 0;
            self.window_start = now;
        }
        if self.count >= max {
            return false;
        }
        self.count += 1;
        true
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.duration_since(self.window_start)
    }
}

/// Per-sender chat limiter.
pub struct ChatRateLimiter {
    senders: LruCache<NodeId, SlidingWindow>,
    window: Duration,
    max: u32,
}

impl ChatRateLimiter {
    pub fn new(window: Duration, max: u32) -> Self {
        let cap = NonZeroUsize::new(MAX_TRACKED_SENDERS).expect("cap is non-zero");
        Self {
            senders: LruCache::new(cap),
            window,
            max,
        }
    }

    /// Whether a chat from `sender` is within its window budget. Counts the
    /// event when allowed.
    pub fn allow(&mut self, sender: &NodeId, now: Instant) -> bool {
        let state = self
            .senders
            .get_or_insert_mut(*sender, || SlidingWindow::new(now));
        state.check_and_record(now, self.window, self.max)
    }

    /// Drop state for senders idle longer than ten windows.
    pub fn sweep(&mut self, now: Instant) {
        let idle_cutoff = self.window * GC_IDLE_WINDOWS;
        let stale: Vec<NodeId> = self
            .senders
            .iter()
            .filter(|(_, state)| state.idle_for(now) > idle_cutoff)
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            self.senders.pop(&id);
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.senders.len()
    }
}
