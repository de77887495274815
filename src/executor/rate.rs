//! Cycle-rate limiting shared by the motors of one activity.
//!
//! A [`RateLimiter`] hands out start times ("slots") spaced `1 / rate` apart. Each
//! motor reserves the next slot before it reads its input and waits until that slot
//! arrives, so `N` motors together start at most `rate` cycles per second. The wait
//! ends early when the motor is asked to stop.
//!
//! Slots are never banked while motors are busy: the next slot is always computed
//! from `max(next, now)`, so a stall is not followed by a burst.
//!
//! # Slot arithmetic
//!
//! ```text
//! interval = 1s / rate                (clamped to 1ns ..= one year)
//! slot     = max(next, now)
//! next     = slot + interval
//! ```
//!
//! The rate may be changed at any time (see
//! [`ActivityDefObserver`](crate::motor::ActivityDefObserver)); a change restarts
//! the schedule from the current instant.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::motor::MotorController;

/// Rates above this are treated as this; one slot per nanosecond is "unlimited" in practice.
const MAX_RATE: f64 = 1e9;

/// Slowest accepted rate: one cycle per year.
pub const MIN_RATE: f64 = 1.0 / MAX_INTERVAL_SECS as f64;

const MAX_INTERVAL_SECS: u64 = 365 * 24 * 3600;
const MAX_INTERVAL: Duration = Duration::from_secs(MAX_INTERVAL_SECS);

#[derive(Debug)]
pub struct RateLimiter {
    pacing: Mutex<Pacing>,
}

#[derive(Debug)]
struct Pacing {
    rate: Option<f64>,
    interval: Duration,
    next: Instant,
}

impl RateLimiter {
    /// `None` (or a non-positive rate) means unlimited.
    pub fn new(rate: Option<f64>) -> Self {
        let rate = sanitize(rate);
        Self {
            pacing: Mutex::new(Pacing {
                rate,
                interval: rate.map(interval_for).unwrap_or_default(),
                next: Instant::now(),
            }),
        }
    }

    pub fn rate(&self) -> Option<f64> {
        self.pacing.lock().rate
    }

    pub fn set_rate(&self, rate: Option<f64>) {
        let rate = sanitize(rate);
        let mut pacing = self.pacing.lock();
        if pacing.rate == rate {
            return;
        }
        tracing::debug!("Cycle rate changed from {:?} to {:?}.", pacing.rate, rate);
        pacing.rate = rate;
        pacing.interval = rate.map(interval_for).unwrap_or_default();
        pacing.next = Instant::now();
    }

    /// Reserve the next slot as of `now`. `None` when unlimited.
    pub fn reserve(&self, now: Instant) -> Option<Instant> {
        let mut pacing = self.pacing.lock();
        pacing.rate?;
        let slot = pacing.next.max(now);
        pacing.next = slot.checked_add(pacing.interval).unwrap_or(slot);
        Some(slot)
    }

    /// Wait for the next slot on behalf of the motor owning `controller`.
    ///
    /// Returns `true` if the motor is being stopped; a stop request ends the wait early
    /// and the slot is forfeited.
    pub fn acquire(&self, controller: &MotorController) -> bool {
        match self.reserve(Instant::now()) {
            Some(slot) => controller.await_stop_request(Some(slot)),
            None => false,
        }
    }
}

fn sanitize(rate: Option<f64>) -> Option<f64> {
    rate.filter(|r| r.is_finite() && *r > 0.0)
}

/// Spacing between consecutive slots for `rate` cycles per second.
pub fn interval_for(rate: f64) -> Duration {
    Duration::try_from_secs_f64(1.0 / rate.min(MAX_RATE))
        .unwrap_or(MAX_INTERVAL)
        .clamp(Duration::from_nanos(1), MAX_INTERVAL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn unlimited_never_waits() {
        let limiter = RateLimiter::new(None);
        assert_eq!(limiter.reserve(Instant::now()), None);
        let begun = Instant::now();
        assert!(!limiter.acquire(&MotorController::new()));
        assert!(begun.elapsed() < Duration::from_millis(50));

        let limiter = RateLimiter::new(Some(0.0));
        assert_eq!(limiter.rate(), None);
        let limiter = RateLimiter::new(Some(f64::NAN));
        assert_eq!(limiter.rate(), None);
    }

    #[test]
    fn slots_are_evenly_spaced() {
        let limiter = RateLimiter::new(Some(100.0));
        let now = Instant::now();
        let slots: Vec<Instant> = (0..5).map(|_| limiter.reserve(now).unwrap()).collect();
        for pair in slots.windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::from_millis(10));
        }
    }

    #[test]
    fn idle_time_is_not_banked() {
        let limiter = RateLimiter::new(Some(10.0));
        let start = Instant::now();
        let first = limiter.reserve(start).unwrap();
        let later = start + Duration::from_secs(5);
        // After a long idle period the next slot is "now", not a backlog of 50 slots.
        assert_eq!(limiter.reserve(later).unwrap(), later.max(first));
        assert_eq!(limiter.reserve(later).unwrap(), later + Duration::from_millis(100));
    }

    #[test]
    fn rate_change_restarts_schedule() {
        let limiter = RateLimiter::new(Some(1.0));
        let now = Instant::now();
        limiter.reserve(now);
        limiter.reserve(now);
        limiter.set_rate(Some(1000.0));
        assert_eq!(limiter.rate(), Some(1000.0));
        let slot = limiter.reserve(Instant::now()).unwrap();
        assert!(slot < now + Duration::from_millis(500));

        limiter.set_rate(None);
        assert_eq!(limiter.reserve(Instant::now()), None);
    }

    #[test]
    fn extreme_rate_caps_at_one_nanosecond() {
        assert_eq!(interval_for(f64::MAX), Duration::from_nanos(1));
        assert_eq!(interval_for(1e12), Duration::from_nanos(1));
        assert_eq!(interval_for(4.0), Duration::from_millis(250));
    }

    #[test]
    fn vanishing_rate_caps_at_one_year() {
        assert_eq!(interval_for(1e-20), MAX_INTERVAL);
        assert_eq!(interval_for(MIN_RATE / 2.0), MAX_INTERVAL);
        assert_eq!(interval_for(f64::NAN), MAX_INTERVAL);

        let limiter = RateLimiter::new(Some(1e-20));
        let now = Instant::now();
        assert_eq!(limiter.reserve(now), Some(now));
        assert_eq!(limiter.reserve(now), Some(now + MAX_INTERVAL));
        limiter.set_rate(Some(1e-300));
        assert!(limiter.reserve(Instant::now()).is_some());
    }

    #[test]
    fn stop_request_ends_a_long_wait() {
        let limiter = Arc::new(RateLimiter::new(Some(0.5)));
        let ctl = Arc::new(MotorController::new());
        ctl.enter_running().unwrap();
        let waiter = {
            let (limiter, ctl) = (Arc::clone(&limiter), Arc::clone(&ctl));
            thread::spawn(move || {
                let begun = Instant::now();
                // First slot is immediate, the second is two seconds out.
                assert!(!limiter.acquire(&ctl));
                (limiter.acquire(&ctl), begun.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(50));
        ctl.request_stop();
        let (stopping, waited) = waiter.join().unwrap();
        assert!(stopping);
        assert!(waited < Duration::from_secs(1), "waited out the slot: {waited:?}");
    }

    #[test]
    fn acquire_paces_the_caller() {
        let limiter = RateLimiter::new(Some(50.0));
        let ctl = MotorController::new();
        let start = Instant::now();
        for _ in 0..6 {
            assert!(!limiter.acquire(&ctl));
        }
        // Six slots at 20ms spacing: the last one is 100ms after the first.
        assert!(start.elapsed() >= Duration::from_millis(95));
    }
}
