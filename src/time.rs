//! Host-supplied monotonic time.
//!
//! The services never read a clock themselves. The host loop passes the
//! current [`Instant`] into every call that starts or checks a deadline, which
//! keeps the stack usable on targets without a system timer and makes
//! deadline behaviour fully deterministic under test.

use core::ops::Add;
use core::time::Duration;

/// Milliseconds elapsed since an arbitrary, host-chosen epoch.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default, Hash)]
pub struct Instant(u64);

impl Instant {
    /// Creates an instant from a millisecond counter.
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the millisecond counter.
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// Returns `true` once `self` has reached or passed `deadline`.
    pub fn has_reached(self, deadline: Instant) -> bool {
        self >= deadline
    }

    /// Time elapsed since `earlier`, or zero if `earlier` lies in the future.
    pub fn saturating_duration_since(self, earlier: Instant) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Instant {
        let millis = u64::try_from(rhs.as_millis()).unwrap_or(u64::MAX);
        Instant(self.0.saturating_add(millis))
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Instant {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "{=u64}ms", self.0)
    }
}
