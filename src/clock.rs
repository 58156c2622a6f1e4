//! Monotonic instant arithmetic.
//!
//! The core needs to compare and schedule instants without caring how they
//! were obtained, so tests can drive it with synthetic timestamps instead of
//! real wall-clock delays. `Instant` is a thin newtype over `Duration`
//! measured from an arbitrary, process-local epoch.

use std::cmp::Ordering;
use std::sync::OnceLock;
use std::time::{Duration, Instant as StdInstant};

/// A monotonic point in time, opaque except for arithmetic against other
/// `Instant`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant(Duration);

impl Instant {
    /// Constructs an instant `ms` milliseconds past the epoch. Primarily
    /// useful in tests and for `send_down_at` scheduling math.
    pub fn from_ms(ms: u64) -> Self {
        Instant(Duration::from_millis(ms))
    }

    /// Milliseconds since the epoch, truncating any sub-millisecond part.
    pub fn to_ms(self) -> u64 {
        self.0.as_millis() as u64
    }

    /// `self + delta`.
    pub fn add(self, delta: Duration) -> Instant {
        Instant(self.0 + delta)
    }

    /// `self - other`, panicking if `self < other` (callers must only
    /// subtract an earlier instant from a later one).
    pub fn sub(self, other: Instant) -> Duration {
        self.0
            .checked_sub(other.0)
            .expect("Instant::sub precondition violated: self < other")
    }
}

/// Ordered compare between two instants, as an unambiguous `Ordering`
/// rather than a signed `-1`/`0`/`1` return value.
pub fn cmp(a: Instant, b: Instant) -> Ordering {
    a.cmp(&b)
}

pub fn add(a: Instant, delta: Duration) -> Instant {
    a.add(delta)
}

pub fn sub(a: Instant, b: Instant) -> Duration {
    a.sub(b)
}

pub fn from_ms(ms: u64) -> Instant {
    Instant::from_ms(ms)
}

pub fn to_ms(a: Instant) -> u64 {
    a.to_ms()
}

fn epoch() -> StdInstant {
    static EPOCH: OnceLock<StdInstant> = OnceLock::new();
    *EPOCH.get_or_init(StdInstant::now)
}

/// Supplies `now()` to the engine. Production code uses `MonotonicClock`;
/// tests use a clock that can be advanced by hand.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// Wraps `std::time::Instant`, which is already immune to wall-clock jumps
/// on every platform this crate targets.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant(StdInstant::now().saturating_duration_since(epoch()))
    }
}
