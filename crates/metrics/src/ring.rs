//! Lock-free per-second ring buffer.
//!
//! Slot `i` holds the aggregate for the most recent epoch second `s` with
//! `s mod BUCKETS == i`. Each field is its own atomic, so writers never
//! serialize on a lock; readers re-derive windows from scratch and tolerate a
//! momentarily torn `(hits, latency)` pair.
//!
//! Latency is accumulated as integer microseconds. Averages are derived as
//! `total_us / hits / 1000` in floating point only at read time, so a
//! sub-millisecond average never rounds to zero.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Number of one-second slots: exactly 24 hours.
pub const BUCKETS: usize = 86_400;
const BUCKETS_I64: i64 = 86_400;

/// Marker for a slot that has never been written.
const VACANT: i64 = i64::MIN;
/// Marker held while one writer zeroes a stale slot.
const RESETTING: i64 = i64::MIN + 1;

/// Source of the current epoch second.
pub trait Clock: Send + Sync {
    fn now_secs(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
    }
}

/// A clock that only moves when told to. Used to drive the ring in tests
/// without sleeping.
#[derive(Debug)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    #[must_use]
    pub fn new(start: i64) -> Self {
        Self(AtomicI64::new(start))
    }

    pub fn set(&self, secs: i64) {
        self.0.store(secs, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

struct Slot {
    second: AtomicI64,
    hits: AtomicU64,
    latency_us: AtomicU64,
}

impl Slot {
    fn vacant() -> Self {
        Self {
            second: AtomicI64::new(VACANT),
            hits: AtomicU64::new(0),
            latency_us: AtomicU64::new(0),
        }
    }

    /// Makes the slot represent `now`, zeroing it first if it holds an older
    /// second. Exactly one writer performs the reset; the others wait for it
    /// to publish `now` so their increments can never be wiped.
    ///
    /// Returns `false` if the slot already holds a newer second.
    fn claim(&self, now: i64) -> bool {
        loop {
            let current = self.second.load(Ordering::Acquire);
            if current == now {
                return true;
            }
            if current == RESETTING {
                std::hint::spin_loop();
                continue;
            }
            if current > now {
                return false;
            }
            if self
                .second
                .compare_exchange(current, RESETTING, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.hits.store(0, Ordering::Relaxed);
                self.latency_us.store(0, Ordering::Relaxed);
                self.second.store(now, Ordering::Release);
                return true;
            }
        }
    }
}

/// Fixed-size ring of per-second request counts and latency sums.
pub struct MetricsRing<C: Clock = SystemClock> {
    slots: Box<[Slot]>,
    clock: C,
}

impl MetricsRing<SystemClock> {
    /// Creates a ring driven by the wall clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl Default for MetricsRing<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

fn slot_index(second: i64) -> usize {
    usize::try_from(second.rem_euclid(BUCKETS_I64)).unwrap_or(0)
}

impl<C: Clock> MetricsRing<C> {
    /// Creates a ring driven by `clock`.
    pub fn with_clock(clock: C) -> Self {
        let slots = (0..BUCKETS).map(|_| Slot::vacant()).collect();
        Self { slots, clock }
    }

    /// Returns the clock driving this ring.
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Adds one completed request taking `elapsed` to the current second.
    pub fn record(&self, elapsed: Duration) {
        let now = self.clock.now_secs();
        let slot = &self.slots[slot_index(now)];
        if !slot.claim(now) {
            return;
        }
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        slot.hits.fetch_add(1, Ordering::Relaxed);
        slot.latency_us.fetch_add(micros, Ordering::Relaxed);
    }

    /// Sums `(hits, latency_us)` over the last `seconds` seconds, the
    /// current one included.
    fn scan(&self, seconds: u32) -> (u64, u64) {
        assert!(
            seconds as usize <= BUCKETS,
            "window of {seconds}s exceeds the {BUCKETS}s ring"
        );
        let now = self.clock.now_secs();
        let mut hits = 0u64;
        let mut latency_us = 0u64;
        for offset in 0..i64::from(seconds) {
            let t = now - offset;
            let slot = &self.slots[slot_index(t)];
            if slot.second.load(Ordering::Acquire) == t {
                hits += slot.hits.load(Ordering::Relaxed);
                latency_us = latency_us.saturating_add(slot.latency_us.load(Ordering::Relaxed));
            }
        }
        (hits, latency_us)
    }

    /// Number of requests completed in the last `seconds` seconds.
    ///
    /// # Panics
    ///
    /// Panics if `seconds` exceeds [`BUCKETS`].
    #[must_use]
    pub fn window_sum(&self, seconds: u32) -> u64 {
        self.scan(seconds).0
    }

    /// Mean latency in milliseconds over the last `seconds` seconds, or
    /// `None` when no request completed in that window.
    ///
    /// # Panics
    ///
    /// Panics if `seconds` exceeds [`BUCKETS`].
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn window_latency_avg_ms(&self, seconds: u32) -> Option<f64> {
        let (hits, latency_us) = self.scan(seconds);
        (hits > 0).then(|| latency_us as f64 / hits as f64 / 1000.0)
    }
}
