//! Durations and clocks.
//!
//! `Duration` mirrors `r3_core::time::Duration` but is widened to a signed
//! 64-bit microsecond count: a hosted kernel has no reason to cap a sleep at
//! the ~35 minutes the teacher's 32-bit microsecond count allows.

use std::sync::OnceLock;
use std::time::Instant as StdInstant;

fn process_epoch() -> StdInstant {
    static EPOCH: OnceLock<StdInstant> = OnceLock::new();
    *EPOCH.get_or_init(StdInstant::now)
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Duration {
    micros: i64,
}

impl Duration {
    pub const ZERO: Self = Self { micros: 0 };
    pub const MAX: Self = Self { micros: i64::MAX };

    #[inline]
    pub const fn from_micros(micros: i64) -> Self {
        Self { micros }
    }

    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self::from_micros(millis * 1_000)
    }

    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self::from_micros(secs * 1_000_000)
    }

    #[inline]
    pub const fn as_micros(self) -> i64 {
        self.micros
    }

    #[inline]
    pub fn as_std(self) -> std::time::Duration {
        std::time::Duration::from_micros(self.micros.max(0) as u64)
    }

    #[inline]
    pub const fn is_zero(self) -> bool {
        self.micros == 0
    }
}

impl From<std::time::Duration> for Duration {
    fn from(d: std::time::Duration) -> Self {
        Self::from_micros(d.as_micros() as i64)
    }
}

impl core::ops::Add for Duration {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::from_micros(self.micros + rhs.micros)
    }
}

impl core::ops::Sub for Duration {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::from_micros(self.micros - rhs.micros)
    }
}

/// A monotonic instant, used internally for event-list ordering. Always
/// derived from the OS monotonic clock (§4.7 "Clock model").
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Instant(StdInstant);

impl Instant {
    pub fn now() -> Self {
        Self(StdInstant::now())
    }

    pub fn checked_add(self, d: Duration) -> Option<Self> {
        self.0.checked_add(d.as_std()).map(Self)
    }

    pub fn saturating_duration_since(self, earlier: Self) -> Duration {
        Duration::from(self.0.saturating_duration_since(earlier.0))
    }

    /// Nanoseconds since an arbitrary process-wide epoch, fixed on first
    /// use. Only meaningful for ordering/keying within one process — used
    /// to key a cluster's event list (§4.7).
    pub fn as_nanos_since_process_epoch(self) -> u128 {
        self.0.saturating_duration_since(process_epoch()).as_nanos()
    }
}

/// A per-instance virtual clock: an offset applied on top of the real
/// wall-clock time, affecting [`Clock::get_time`] but never event scheduling,
/// which always runs off the OS monotonic clock. (§4.7, SPEC_FULL §C)
pub struct Clock {
    offset: std::sync::atomic::AtomicI64,
    epoch: StdInstant,
    epoch_wall: std::time::SystemTime,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            offset: std::sync::atomic::AtomicI64::new(0),
            epoch: StdInstant::now(),
            epoch_wall: std::time::SystemTime::now(),
        }
    }

    /// Install a new offset (in microseconds) from the real wall clock.
    pub fn set_offset(&self, micros: i64) {
        self.offset.store(micros, std::sync::atomic::Ordering::Relaxed);
    }

    /// Return the current virtual wall-clock time as a duration since the
    /// clock's construction, plus whatever offset is installed.
    pub fn get_time(&self) -> Duration {
        let real = StdInstant::now().duration_since(self.epoch);
        let offset = self.offset.load(std::sync::atomic::Ordering::Relaxed);
        Duration::from(real) + Duration::from_micros(offset)
    }

    pub fn epoch_wall(&self) -> std::time::SystemTime {
        self.epoch_wall
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
