//! Queue-wide throughput limiter.
//!
//! Caps how many jobs the queue hands out per fixed window, independent of the
//! per-sender rate limiter. When the cap is hit, jobs stay queued until the
//! window resets; nothing fails.

use std::time::Duration;

use tokio::time::Instant;

/// Fixed-window counter of leases handed out.
#[derive(Debug, Clone)]
pub struct ThroughputLimiter {
    max: u32,
    window: Duration,
    window_started: Option<Instant>,
    granted: u32,
}

impl ThroughputLimiter {
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            max,
            window,
            window_started: None,
            granted: 0,
        }
    }

    /// Take one slot in the current window.
    ///
    /// Returns `Err(reset_at)` when the window is full.
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), Instant> {
        let started = match self.window_started {
            Some(started) if now < started + self.window => started,
            _ => {
                self.window_started = Some(now);
                self.granted = 0;
                now
            }
        };

        if self.granted < self.max {
            self.granted += 1;
            Ok(())
        } else {
            Err(started + self.window)
        }
    }

    /// Give back a slot taken for a lease that was never handed out.
    pub fn refund(&mut self) {
        self.granted = self.granted.saturating_sub(1);
    }
}
