use std::time::{Duration, Instant};

use skein_core::config::RateLimitConfig;

/// Fixed-window counter for conversation updates.
///
/// The window opens on the first update after it expired; at most
/// `max_updates` are admitted until `window` has elapsed since it opened.
#[derive(Debug, Clone)]
pub struct UpdateWindow {
    max_updates: u32,
    window: Duration,
    opened_at: Instant,
    count: u32,
}

impl UpdateWindow {
    pub fn new(max_updates: u32, window: Duration) -> Self {
        Self {
            max_updates,
            window,
            opened_at: Instant::now(),
            count: 0,
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.max_updates, config.window())
    }

    /// Record one update at `now`. Returns `false` if the window is full.
    pub fn admit(&mut self, now: Instant) -> bool {
        self.admit_many(now, 1)
    }

    /// Record `n` updates at `now`, all or none.
    pub fn admit_many(&mut self, now: Instant, n: u32) -> bool {
        if now.saturating_duration_since(self.opened_at) >= self.window {
            self.opened_at = now;
            self.count = 0;
        }
        if self.count.saturating_add(n) > self.max_updates {
            return false;
        }
        self.count += n;
        true
    }

    /// Updates admitted in the current window.
    pub fn used(&self) -> u32 {
        self.count
    }

    pub fn max_updates(&self) -> u32 {
        self.max_updates
    }
}

impl Default for UpdateWindow {
    fn default() -> Self {
        Self::from_config(&RateLimitConfig::default())
    }
}
