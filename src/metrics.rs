//! # Metrics Primitives
//!
//! Small measurement tools used by the reader's rate control and debug
//! logging: an exponentially-weighted moving average, a rate counter built
//! on top of it, and conversions between rates and intervals.
//!
//! None of these are thread-safe. They are owned and driven by a single
//! polling task, so locking would buy nothing.

use std::time::{Duration, Instant};

/// Number of samples an [`Ewma`] accumulates before the weighted average
/// takes over. Until then [`Ewma::value`] reports zero so callers can tell
/// the average is not yet primed.
const WARMUP_SAMPLES: u32 = 10;

// =============================================================================
// Exponentially-Weighted Moving Average
// =============================================================================

/// An exponentially-weighted moving average with a configurable age.
///
/// The "age" is the average age of the samples represented by the current
/// value; the decay factor is derived as `2 / (age + 1)`. A larger age
/// smooths harder and reacts more slowly.
///
/// The first [`WARMUP_SAMPLES`] samples are averaged arithmetically to prime
/// the value; until the warmup completes, [`Ewma::value`] returns zero.
#[derive(Debug)]
pub struct Ewma {
    decay: f64,
    value: f64,
    count: u32,
}

impl Ewma {
    /// Creates a moving average smoothing over approximately `age` samples.
    pub fn new(age: f64) -> Self {
        Self {
            decay: 2.0 / (age + 1.0),
            value: 0.0,
            count: 0,
        }
    }

    /// Adds a sample.
    pub fn add(&mut self, sample: f64) {
        if self.count < WARMUP_SAMPLES {
            // Accumulate warmup samples arithmetically.
            self.count += 1;
            self.value += sample;

            if self.count == WARMUP_SAMPLES {
                self.value /= f64::from(WARMUP_SAMPLES);
            }
        } else {
            self.value = sample * self.decay + self.value * (1.0 - self.decay);
        }
    }

    /// Returns the current average, or zero if the warmup has not completed.
    pub fn value(&self) -> f64 {
        if self.count < WARMUP_SAMPLES {
            return 0.0;
        }

        self.value
    }

    /// Returns true once the warmup has completed and [`Ewma::value`]
    /// reports the weighted average rather than zero.
    pub fn primed(&self) -> bool {
        self.count >= WARMUP_SAMPLES
    }
}

// =============================================================================
// Rate Counter
// =============================================================================

/// Tracks the average rate of some event from the interval between calls to
/// [`RateCounter::tick`].
///
/// Used only for debug logging (average poll rate, average fact delivery
/// rate), so its accuracy requirements are modest.
#[derive(Debug)]
pub struct RateCounter {
    avg: Ewma,
    prev: Instant,
}

impl RateCounter {
    /// Returns a new rate counter.
    pub fn new() -> Self {
        Self {
            avg: Ewma::new(30.0),
            prev: Instant::now(),
        }
    }

    /// Records the occurrence of an event.
    pub fn tick(&mut self) {
        let now = Instant::now();
        let delta = now - self.prev;
        self.prev = now;

        self.avg.add(delta.as_secs_f64());
    }

    /// Returns the average number of calls to `tick()` per second, or zero
    /// if not enough samples have been recorded yet.
    pub fn rate(&self) -> f64 {
        if !self.avg.primed() {
            return 0.0;
        }

        let seconds = self.avg.value();
        if seconds == 0.0 {
            // Averaged interval of zero: the ticks are effectively
            // instantaneous, which is a rate too high to represent rather
            // than an absence of data.
            return f64::MAX;
        }

        1.0 / seconds
    }
}

impl Default for RateCounter {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Rate / Interval Conversion
// =============================================================================

/// Converts a rate (events per second) to the interval between events.
///
/// An infinite rate converts to a zero interval.
pub fn rate_to_interval(rate: f64) -> Duration {
    if rate.is_infinite() {
        return Duration::ZERO;
    }

    Duration::from_secs_f64(1.0 / rate)
}

/// Converts an interval between events to a rate (events per second).
///
/// A zero or negative interval converts to an infinite rate, meaning "as
/// fast as allowed". Negative intervals arise when rate adaptation proposes
/// speeding up by more than the current interval.
pub fn interval_to_rate(interval: f64) -> f64 {
    if interval <= 0.0 {
        return f64::INFINITY;
    }

    1.0 / interval
}

// =============================================================================
// Display Helpers
// =============================================================================

/// Formats a rate for display in reader debug logs, e.g. `500.00/s 2.00ms`.
pub fn format_rate(rate: f64) -> String {
    if rate == 0.0 {
        return "  ?.??/s   ?.??µs".to_string();
    }

    format!("{:6.2}/s {}", rate, format_duration(rate_to_interval(rate)))
}

/// Formats a duration for display in reader debug logs.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs_f64();

    if secs >= 3600.0 {
        format!("{:6.2}h ", secs / 3600.0)
    } else if secs >= 60.0 {
        format!("{:6.2}m ", secs / 60.0)
    } else if secs >= 1.0 {
        format!("{:6.2}s ", secs)
    } else if secs >= 0.001 {
        format!("{:6.2}ms", secs * 1e3)
    } else {
        format!("{:6.2}µs", secs * 1e6)
    }
}

// =============================================================================
// Tests
// =============================================================================
