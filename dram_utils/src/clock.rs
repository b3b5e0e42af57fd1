//! Cycle clock used for pacing and latency sampling.
//!
//! The clock hands out raw ticks, cheap to read on the hot path, and the tick rate needed to turn
//! tick differences into nanoseconds afterwards. On x86_64 ticks come from the TSC and the rate is
//! calibrated once against the OS monotonic clock, elsewhere ticks are plain nanoseconds.

use std::hint::spin_loop;
use std::time::{Duration, Instant};

/// Ticks per nanosecond assumed when no calibration was done.
pub const RDTSC_TYPICAL_TICKS_PER_NS: f64 = 2.2;

pub trait Clock: Send + Sync {
    /// Current tick count. Monotonic.
    fn ticks(&self) -> u64;

    fn ticks_per_ns(&self) -> f64;

    fn now_ns(&self) -> u64 {
        (self.ticks() as f64 / self.ticks_per_ns()).round() as u64
    }

    fn elapsed_ns(&self, since_ns: u64) -> u64 {
        self.now_ns().saturating_sub(since_ns)
    }

    /// Busy-wait until `period_ns` nanoseconds have passed since `start_ns`.
    fn spin_until_elapsed(&self, start_ns: u64, period_ns: u64) {
        while self.elapsed_ns(start_ns) < period_ns {
            spin_loop();
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock {
            origin: Instant::now(),
        }
    }

    /// Nothing to calibrate, ticks are nanoseconds.
    pub fn calibrate(_window: Duration) -> Self {
        Self::new()
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn ticks(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    fn ticks_per_ns(&self) -> f64 {
        1.0
    }
}

#[cfg(target_arch = "x86_64")]
#[derive(Debug, Clone, Copy)]
pub struct TscClock {
    ticks_per_ns: f64,
}

#[cfg(target_arch = "x86_64")]
impl TscClock {
    pub fn with_ticks_per_ns(ticks_per_ns: f64) -> Self {
        assert!(ticks_per_ns > 0.0, "tick rate must be positive");
        TscClock { ticks_per_ns }
    }

    pub fn calibrate(window: Duration) -> Self {
        Self::with_ticks_per_ns(calibrate_ticks(window))
    }
}

#[cfg(target_arch = "x86_64")]
impl Default for TscClock {
    fn default() -> Self {
        Self::with_ticks_per_ns(RDTSC_TYPICAL_TICKS_PER_NS)
    }
}

#[cfg(target_arch = "x86_64")]
impl Clock for TscClock {
    fn ticks(&self) -> u64 {
        unsafe { crate::rdtscp() }
    }

    fn ticks_per_ns(&self) -> f64 {
        self.ticks_per_ns
    }
}

/// Measure the TSC rate against the monotonic clock over a busy `window`.
#[cfg(target_arch = "x86_64")]
pub fn calibrate_ticks(window: Duration) -> f64 {
    let begin_ts = Instant::now();
    let begin = unsafe { crate::rdtsc_fence() };
    while begin_ts.elapsed() < window {
        spin_loop();
    }
    let end = unsafe { crate::rdtsc_fence() };
    let ns_elapsed = begin_ts.elapsed().as_nanos().max(1);
    let ticks_per_ns = (end - begin) as f64 / ns_elapsed as f64;
    log::debug!("TSC calibration done (ticks_per_ns: {:.2})", ticks_per_ns);
    ticks_per_ns
}

#[cfg(target_arch = "x86_64")]
pub type CycleClock = TscClock;
#[cfg(not(target_arch = "x86_64"))]
pub type CycleClock = MonotonicClock;

#[cfg(test)]
mod tests {
    use super::{Clock, MonotonicClock};
    use std::time::Duration;

    struct FixedClock(u64, f64);

    impl Clock for FixedClock {
        fn ticks(&self) -> u64 {
            self.0
        }

        fn ticks_per_ns(&self) -> f64 {
            self.1
        }
    }

    #[test]
    fn tick_conversion() {
        let c = FixedClock(2200, 2.2);
        assert_eq!(c.now_ns(), 1000);
        assert_eq!(FixedClock(2199, 2.2).now_ns(), 1000);
        assert_eq!(FixedClock(3, 2.0).now_ns(), 2);
        assert_eq!(c.elapsed_ns(400), 600);
        assert_eq!(c.elapsed_ns(5000), 0);
    }

    #[test]
    fn monotonic_clock_advances() {
        let c = MonotonicClock::new();
        let a = c.now_ns();
        c.spin_until_elapsed(a, 50_000);
        assert!(c.now_ns() - a >= 50_000);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn tsc_calibration_is_positive() {
        let c = super::TscClock::calibrate(Duration::from_millis(20));
        assert!(c.ticks_per_ns() > 0.0);
        let start = c.now_ns();
        c.spin_until_elapsed(start, 10_000);
        assert!(c.elapsed_ns(start) >= 10_000);
    }

    #[test]
    fn monotonic_calibrate_is_identity() {
        let c = MonotonicClock::calibrate(Duration::from_secs(3600));
        assert_eq!(c.ticks_per_ns(), 1.0);
    }
}
