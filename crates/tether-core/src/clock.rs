// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Fixed-rate tick scheduler.
//!
//! Ordering invariant:
//! - Tick numbers are strictly monotonic; one tick completes before the next
//!   begins (cooperative, never preempted).
//! - Overruns coalesce: at most one tick stays queued behind the current
//!   one; further accumulation is dropped with a warning.
//! - A regressing time source freezes the stream (no ticks, no rollback)
//!   until monotonicity is restored.
//!
//! Heartbeats are explicit tick counters, never wall-clock sleeps.

use tracing::warn;

use crate::config::ReplicationConfig;
use crate::ident::TickNumber;

/// Injected monotonic clock, in nanoseconds from an arbitrary epoch.
pub trait TimeSource {
    /// Current monotonic time in nanoseconds.
    fn now_nanos(&self) -> u64;
}

/// [`TimeSource`] backed by `std::time::Instant`.
#[derive(Debug)]
pub struct SystemTimeSource {
    epoch: std::time::Instant,
}

impl SystemTimeSource {
    /// Anchors the source at the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: std::time::Instant::now(),
        }
    }
}

impl Default for SystemTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for SystemTimeSource {
    fn now_nanos(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

/// One scheduled simulation tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    /// Monotonic tick number, starting at 1.
    pub number: TickNumber,
    /// Nanosecond instant the tick was due.
    pub at_nanos: u64,
}

/// Maximum ticks released by a single `advance` call: the due tick plus the
/// single queued one.
const MAX_RELEASED: u64 = 2;

/// Fixed-rate tick and heartbeat scheduler.
#[derive(Debug)]
pub struct TickClock {
    interval_nanos: u64,
    heartbeat_every: u64,
    next_number: TickNumber,
    next_due: u64,
    max_seen: u64,
    frozen: bool,
}

impl TickClock {
    /// Builds a clock from the configured rates. The first tick is due one
    /// interval after time zero.
    #[must_use]
    pub fn new(cfg: &ReplicationConfig) -> Self {
        Self {
            interval_nanos: cfg.tick_interval_nanos(),
            heartbeat_every: cfg.heartbeat_interval_ticks(),
            next_number: 1,
            next_due: cfg.tick_interval_nanos(),
            max_seen: 0,
            frozen: false,
        }
    }

    /// Returns the ticks due at `now`, at most [`MAX_RELEASED`] of them.
    ///
    /// When more ticks than that have accumulated the surplus is dropped
    /// with a warning; tick numbers stay contiguous (time is re-anchored,
    /// not renumbered). A regressing `now` freezes the stream until the
    /// previous maximum is reached again.
    pub fn advance(&mut self, now: u64) -> Vec<Tick> {
        if now < self.max_seen {
            if !self.frozen {
                warn!(now, max_seen = self.max_seen, "time source regressed; freezing ticks");
                self.frozen = true;
            }
            return Vec::new();
        }
        if self.frozen {
            self.frozen = false;
            // Re-anchor: the freeze interval produces no backlog.
            self.next_due = now + self.interval_nanos;
            self.max_seen = now;
            return Vec::new();
        }
        self.max_seen = now;

        if now < self.next_due {
            return Vec::new();
        }
        let elapsed = now - self.next_due;
        let due = elapsed / self.interval_nanos + 1;
        let released = due.min(MAX_RELEASED);
        if due > released {
            warn!(dropped = due - released, "tick overrun; coalescing");
        }

        let mut out = Vec::with_capacity(usize::try_from(released).unwrap_or(2));
        for i in 0..released {
            out.push(Tick {
                number: self.next_number + i,
                at_nanos: self.next_due + i * self.interval_nanos,
            });
        }
        self.next_number += released;
        // Skip past every due interval, including the dropped ones.
        self.next_due += due * self.interval_nanos;
        out
    }

    /// Whether `tick` lands on a heartbeat boundary.
    #[must_use]
    pub fn heartbeat_due(&self, tick: &Tick) -> bool {
        tick.number % self.heartbeat_every == 0
    }

    /// Nanoseconds between ticks.
    #[must_use]
    pub fn interval_nanos(&self) -> u64 {
        self.interval_nanos
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn clock() -> TickClock {
        TickClock::new(&ReplicationConfig::default())
    }

    #[test]
    fn ticks_fire_once_per_interval() {
        let mut c = clock();
        let step = c.interval_nanos();
        assert!(c.advance(0).is_empty());
        assert!(c.advance(step - 1).is_empty());
        let ticks = c.advance(step);
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].number, 1);
        assert!(c.advance(step).is_empty(), "same instant fires nothing new");
        let ticks = c.advance(2 * step);
        assert_eq!(ticks[0].number, 2);
    }

    #[test]
    fn overrun_coalesces_to_one_queued_tick() {
        let mut c = clock();
        let step = c.interval_nanos();
        // Five intervals pass without an advance; only two ticks fire.
        let ticks = c.advance(5 * step);
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[0].number, 1);
        assert_eq!(ticks[1].number, 2);
        // The backlog is dropped, not deferred.
        assert!(c.advance(5 * step).is_empty());
        let ticks = c.advance(6 * step);
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].number, 3, "numbers stay contiguous");
    }

    #[test]
    fn regression_freezes_until_monotonic_again() {
        let mut c = clock();
        let step = c.interval_nanos();
        assert_eq!(c.advance(2 * step).len(), 2);
        // Clock jumps backwards: frozen.
        assert!(c.advance(step).is_empty());
        assert!(c.advance(step + 1).is_empty());
        // Restored: the first monotonic advance re-anchors without backlog.
        assert!(c.advance(2 * step).is_empty());
        let ticks = c.advance(3 * step + 1);
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].number, 3);
    }

    #[test]
    fn heartbeat_lands_every_interval_worth_of_ticks() {
        let c = clock();
        let hb = |n| {
            c.heartbeat_due(&Tick {
                number: n,
                at_nanos: 0,
            })
        };
        assert!(!hb(1));
        assert!(!hb(59));
        assert!(hb(60));
        assert!(!hb(61));
        assert!(hb(120));
    }
}
