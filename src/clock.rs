//! Monotonic time seam.
//!
//! The original CircuitPython driver calls `time.monotonic()` directly; this
//! crate is `no_std`-capable and has no OS, so callers inject a clock.

/// A source of monotonic milliseconds.
///
/// Embedded callers implement this over a hardware timer or RTC; under
/// `std` [`SystemClock`] is provided for convenience and for tests.
pub trait Clock {
    /// Milliseconds since some arbitrary but fixed epoch (e.g. power-on).
    fn now_millis(&mut self) -> u64;
}

/// A [`Clock`] backed by `std::time::Instant`.
#[cfg(feature = "std")]
pub struct SystemClock {
    epoch: std::time::Instant,
}

#[cfg(feature = "std")]
impl SystemClock {
    /// Create a clock whose epoch is the moment of construction.
    pub fn new() -> Self {
        Self {
            epoch: std::time::Instant::now(),
        }
    }
}

#[cfg(feature = "std")]
impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "std")]
impl Clock for SystemClock {
    fn now_millis(&mut self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_monotonic_and_near_zero_at_start() {
        let mut clock = SystemClock::new();
        let first = clock.now_millis();
        let second = clock.now_millis();
        assert!(second >= first);
        assert!(first < 1000);
    }
}
