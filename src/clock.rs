//! Wall-clock pacing for emulated cpu time.
//!
//! The run loop feeds every executed instruction's tick cost into the clock.
//! Once enough ticks have accumulated (one sampling period) the clock sleeps
//! away the bulk of the difference between emulated and host time, then
//! busy-spins the final stretch for sub-millisecond accuracy. Oversleep is
//! carried forward and compensated on the next synchronisation point.

use std::time::{Duration, Instant};

use crate::error::Error;

/// Default portion of the pacing target handed to the host sleep; the rest
/// is spun. This is a host property, not a library one: general-purpose
/// kernels oversleep enough that 0.7 is the safe ratio, while schedulers
/// with microsecond sleep granularity (RP2040-class MCUs) can run at ~0.9.
const GENERAL_HOST_SLEEP_RATIO: f64 = 0.7;

/// Don't attempt to sleep for anything less than a millisecond.
const MIN_SLEEP_NANOS: i64 = 1_000_000;

pub(crate) struct CpuClock {
    /// Nanoseconds per cpu tick (500 at 2 MHz).
    time_period: i64,
    /// Host sleep granularity in nanoseconds.
    max_resolution: i64,
    /// Ticks per synchronisation point: -1 unpaced, 0 every tick, >0 bounded.
    total_ticks: i64,
    tick_count: i64,
    /// Portion of each pacing target slept rather than spun; tuned per host.
    sleep_ratio: f64,
    /// Residual over-spin from the last sync, carried into the next target.
    carried_error: i64,
    epoch: Instant,
    last_time: Instant,
    /// Nanoseconds since epoch at the last resample.
    time: u64,
    /// Set when the host clock could not be queried at construction.
    errored: bool,
}

impl CpuClock {
    /// A clock for a cpu running at `speed` hertz.
    pub fn new(speed: u64) -> Self {
        let now = Instant::now();
        let (max_resolution, errored) = match host_resolution() {
            Some(res) => (res, false),
            None => (0, true),
        };

        CpuClock {
            time_period: (1_000_000_000 / speed) as i64,
            max_resolution,
            total_ticks: -1,
            tick_count: 0,
            sleep_ratio: GENERAL_HOST_SLEEP_RATIO,
            carried_error: 0,
            epoch: now,
            last_time: now,
            time: 0,
            errored,
        }
    }

    /// Set how often emulated time is synchronised to the wall clock.
    ///
    /// `hz > 0` paces at that frequency, `hz == 0` paces on every tick and
    /// `hz < 0` disables pacing. A frequency finer than the host timer
    /// resolution is still applied but reported as [`Error::ClockSamplingFreq`].
    pub fn set_sampling_frequency(&mut self, hz: f64) -> Result<i64, Error> {
        if self.errored {
            return Err(Error::ClockSamplingFreq);
        }

        if hz > 0.0 {
            let interval = (1_000_000_000.0 / hz) as i64;
            self.total_ticks = interval / self.time_period;

            if interval < self.max_resolution {
                return Err(Error::ClockSamplingFreq);
            }
        } else if hz == 0.0 {
            self.total_ticks = 0;
        } else {
            self.total_ticks = -1;
        }

        Ok(self.total_ticks)
    }

    /// The sampling period expressed in cpu ticks, as last configured.
    pub fn sampling_period_ticks(&self) -> i64 {
        self.total_ticks
    }

    /// Tune how much of each pacing target is slept rather than spun.
    ///
    /// The default suits general-purpose hosts; raise it on hosts whose
    /// sleep granularity is fine enough that oversleep is not a risk.
    #[allow(dead_code)]
    pub fn set_sleep_ratio(&mut self, ratio: f64) {
        self.sleep_ratio = ratio.clamp(0.0, 1.0);
    }

    /// Re-epoch the wall clock to "now".
    pub fn reset(&mut self) {
        self.epoch = Instant::now();
        self.last_time = self.epoch;
        self.tick_count = 0;
        self.carried_error = 0;
        self.time = 0;
    }

    /// Account for `ticks` executed cpu cycles, pacing against the wall clock
    /// when a synchronisation point is reached. Returns the elapsed emulated
    /// time in nanoseconds since the last reset.
    pub fn tick(&mut self, ticks: u64) -> u64 {
        if self.total_ticks >= 0 {
            self.tick_count += ticks as i64;

            if self.tick_count >= self.total_ticks {
                let behind = self.tick_count * self.time_period
                    - nanos_between(self.last_time, Instant::now())
                    + self.carried_error;

                self.carried_error = spin_for(sleep_for(behind, self.sleep_ratio));
                self.tick_count = 0;
                self.last_time = Instant::now();
                self.time = nanos_between(self.epoch, self.last_time) as u64;
            }
        } else {
            self.last_time = Instant::now();
            self.time = nanos_between(self.epoch, self.last_time) as u64;
        }

        self.time
    }
}

fn nanos_between(start: Instant, end: Instant) -> i64 {
    (end - start).as_nanos() as i64
}

/// Sleep away the bulk of `target`, returning what is left to spin.
fn sleep_for(mut target: i64, sleep_ratio: f64) -> i64 {
    if target >= MIN_SLEEP_NANOS {
        let before = Instant::now();
        std::thread::sleep(Duration::from_nanos((target as f64 * sleep_ratio) as u64));
        target -= nanos_between(before, Instant::now());
    }

    target
}

/// Busy-wait until `target` has elapsed. Returns the residual (zero or
/// negative over-spin) to carry into the next synchronisation point.
fn spin_for(mut target: i64) -> i64 {
    if target > 0 {
        let start = Instant::now();
        let mut now = start;

        while nanos_between(start, now) < target {
            std::hint::spin_loop();
            now = Instant::now();
        }

        target -= nanos_between(start, now);
    }

    target
}

fn host_resolution() -> Option<i64> {
    #[cfg(unix)]
    {
        let mut res = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };

        if unsafe { libc::clock_getres(libc::CLOCK_MONOTONIC, &mut res) } == 0 {
            Some(res.tv_sec as i64 * 1_000_000_000 + res.tv_nsec as i64)
        } else {
            None
        }
    }
    #[cfg(not(unix))]
    {
        // No portable query; assume a coarse scheduler quantum.
        Some(15_000_000)
    }
}
