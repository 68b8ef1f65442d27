//! Trailing-edge throttle for high-frequency event streams.
//!
//! One window per `interval`:
//! - a call with no window open fires immediately and opens one;
//! - the first call inside an open window is parked, and the caller gets
//!   back the delay after which to `flush`;
//! - further calls inside the window replace the parked value, so the
//!   latest value is the one the trailing flush emits.
//!
//! The struct is a pure state machine over caller-supplied [`Instant`]s.
//! Tests drive it with fabricated clocks and never sleep; the session
//! owns the single tokio timer that calls `flush`.

use std::time::{Duration, Instant};

/// Default window for cursor broadcasts (roughly 30 events/second).
pub const CURSOR_INTERVAL: Duration = Duration::from_millis(33);

/// Outcome of offering a value to the throttle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// Emit the value now; a new window is open.
    Fire,
    /// Value parked; arrange a `flush` after this delay.
    Schedule(Duration),
    /// Value parked, replacing the previously parked one. A flush is
    /// already arranged.
    Coalesced,
}

/// Throttle with a trailing call.
#[derive(Debug)]
pub struct Throttle<T> {
    interval: Duration,
    last_fire: Option<Instant>,
    pending: Option<T>,
}

impl<T> Throttle<T> {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_fire: None,
            pending: None,
        }
    }

    /// Offer a value at time `now`.
    pub fn offer(&mut self, value: T, now: Instant) -> Offer {
        match self.last_fire {
            Some(last) if now.duration_since(last) < self.interval => {
                let remaining = self.interval - now.duration_since(last);
                let already_parked = self.pending.is_some();
                self.pending = Some(value);
                if already_parked {
                    Offer::Coalesced
                } else {
                    Offer::Schedule(remaining)
                }
            }
            _ => {
                self.last_fire = Some(now);
                // Anything still parked is older than the value firing now.
                self.pending = None;
                Offer::Fire
            }
        }
    }

    /// Take the parked value if the window has elapsed.
    ///
    /// Returns `None` when nothing is parked or the window is still open.
    /// A successful flush opens a fresh window, so a burst settles into a
    /// steady one-emit-per-interval cadence.
    pub fn flush(&mut self, now: Instant) -> Option<T> {
        self.pending.as_ref()?;
        match self.last_fire {
            Some(last) if now.duration_since(last) < self.interval => None,
            _ => {
                self.last_fire = Some(now);
                self.pending.take()
            }
        }
    }

    /// Discard the parked value without emitting it.
    pub fn cancel(&mut self) {
        self.pending = None;
    }

    /// Forget both the parked value and the open window.
    pub fn reset(&mut self) {
        self.pending = None;
        self.last_fire = None;
    }

    /// Whether a value is parked awaiting flush.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_first_offer_fires_immediately() {
        let mut throttle = Throttle::new(ms(33));
        assert_eq!(throttle.offer(1, Instant::now()), Offer::Fire);
    }

    #[test]
    fn test_second_offer_inside_window_is_scheduled() {
        let base = Instant::now();
        let mut throttle = Throttle::new(ms(33));

        assert_eq!(throttle.offer(1, base), Offer::Fire);
        assert_eq!(throttle.offer(2, base + ms(10)), Offer::Schedule(ms(23)));
        assert!(throttle.has_pending());
    }

    #[test]
    fn test_burst_coalesces_to_latest() {
        let base = Instant::now();
        let mut throttle = Throttle::new(ms(33));

        throttle.offer(1, base);
        assert_eq!(throttle.offer(2, base + ms(5)), Offer::Schedule(ms(28)));
        assert_eq!(throttle.offer(3, base + ms(10)), Offer::Coalesced);
        assert_eq!(throttle.offer(4, base + ms(15)), Offer::Coalesced);

        // The trailing flush emits only the newest value.
        assert_eq!(throttle.flush(base + ms(33)), Some(4));
        assert!(!throttle.has_pending());
    }

    #[test]
    fn test_flush_before_window_elapses_is_noop() {
        let base = Instant::now();
        let mut throttle = Throttle::new(ms(33));

        throttle.offer(1, base);
        throttle.offer(2, base + ms(5));
        assert_eq!(throttle.flush(base + ms(20)), None);
        assert!(throttle.has_pending());
        assert_eq!(throttle.flush(base + ms(33)), Some(2));
    }

    #[test]
    fn test_offer_after_quiet_period_fires_again() {
        let base = Instant::now();
        let mut throttle = Throttle::new(ms(33));

        assert_eq!(throttle.offer(1, base), Offer::Fire);
        assert_eq!(throttle.offer(2, base + ms(40)), Offer::Fire);
    }

    #[test]
    fn test_fire_drops_stale_parked_value() {
        let base = Instant::now();
        let mut throttle = Throttle::new(ms(33));

        throttle.offer(1, base);
        throttle.offer(2, base + ms(5));
        // The flush never happened; the next offer is past the window and
        // supersedes the parked value.
        assert_eq!(throttle.offer(3, base + ms(50)), Offer::Fire);
        assert!(!throttle.has_pending());
        assert_eq!(throttle.flush(base + ms(100)), None);
    }

    #[test]
    fn test_flush_restarts_the_window() {
        let base = Instant::now();
        let mut throttle = Throttle::new(ms(33));

        throttle.offer(1, base);
        throttle.offer(2, base + ms(10));
        assert_eq!(throttle.flush(base + ms(33)), Some(2));

        // Window now runs from the flush, not from the first fire.
        assert_eq!(throttle.offer(3, base + ms(40)), Offer::Schedule(ms(26)));
    }

    #[test]
    fn test_cancel_discards_pending() {
        let base = Instant::now();
        let mut throttle = Throttle::new(ms(33));

        throttle.offer(1, base);
        throttle.offer(2, base + ms(10));
        throttle.cancel();
        assert_eq!(throttle.flush(base + ms(33)), None);
    }

    #[test]
    fn test_reset_reopens_immediately() {
        let base = Instant::now();
        let mut throttle = Throttle::new(ms(33));

        throttle.offer(1, base);
        throttle.reset();
        assert_eq!(throttle.offer(2, base + ms(1)), Offer::Fire);
    }

    #[test]
    fn test_storm_is_rate_limited() {
        // 100 offers spaced 1ms apart must settle to at most 5 emissions
        // (one per 33ms window plus the trailing flush).
        let base = Instant::now();
        let mut throttle = Throttle::new(ms(33));
        let mut emitted = Vec::new();
        let mut flush_due: Option<Instant> = None;

        for i in 0..100u64 {
            let now = base + ms(i);
            if let Some(due) = flush_due {
                if now >= due {
                    if let Some(v) = throttle.flush(now) {
                        emitted.push(v);
                    }
                    flush_due = None;
                }
            }
            match throttle.offer(i, now) {
                Offer::Fire => emitted.push(i),
                Offer::Schedule(delay) => flush_due = Some(now + delay),
                Offer::Coalesced => {}
            }
        }
        if let Some(due) = flush_due {
            if let Some(v) = throttle.flush(due) {
                emitted.push(v);
            }
        }

        assert!(
            emitted.len() <= 5,
            "Emitted {} of 100 offers in 100ms",
            emitted.len()
        );
        assert!(emitted.len() >= 3, "Throttle swallowed too much");
        // The final position always gets through.
        assert_eq!(emitted.last(), Some(&99));
    }
}
