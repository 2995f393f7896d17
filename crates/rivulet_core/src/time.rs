//! Model time for RIVULET.
//!
//! Model time is quantized: a [`ModelTime`] is a signed count of resolution
//! ticks, and a [`TimeResolution`] converts between seconds and ticks with
//! round-to-nearest. Two raw second values that differ by less than one
//! resolution quantize to the same tick count, so "equal within resolution"
//! is ordinary equality and never a floating-point comparison.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Quantized model time - a signed count of resolution ticks
///
/// The extreme tick values represent positive and negative infinity, which
/// absorb all arithmetic. An unbounded stop time is `ModelTime::INFINITY`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ModelTime(i64);

impl ModelTime {
    /// Time zero
    pub const ZERO: Self = Self(0);

    /// Positive infinity (unbounded stop time)
    pub const INFINITY: Self = Self(i64::MAX);

    /// Negative infinity
    pub const NEG_INFINITY: Self = Self(i64::MIN);

    /// Create from a raw tick count
    #[must_use]
    pub const fn from_ticks(ticks: i64) -> Self {
        Self(ticks)
    }

    /// Get the raw tick count
    #[must_use]
    pub const fn as_ticks(&self) -> i64 {
        self.0
    }

    /// True if this time is positive or negative infinity
    #[must_use]
    pub const fn is_infinite(&self) -> bool {
        self.0 == i64::MAX || self.0 == i64::MIN
    }

    /// Advance by a tick count, saturating at the infinities
    ///
    /// Infinity absorbs: advancing an infinite time returns it unchanged.
    #[must_use]
    pub fn advance(&self, ticks: i64) -> Self {
        if self.is_infinite() {
            return *self;
        }
        Self(self.0.saturating_add(ticks))
    }

    /// Tick distance to a later time (`other - self`)
    ///
    /// Saturates when either endpoint is infinite.
    #[must_use]
    pub fn ticks_until(&self, other: ModelTime) -> i64 {
        other.0.saturating_sub(self.0)
    }
}

impl std::fmt::Display for ModelTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            i64::MAX => write!(f, "Infinity"),
            i64::MIN => write!(f, "-Infinity"),
            t => write!(f, "T{}", t),
        }
    }
}

/// Seconds-per-tick scale used to quantize model time
///
/// The default resolution is 1e-10 seconds, the smallest time difference
/// the kernel distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeResolution(f64);

impl TimeResolution {
    /// Default resolution in seconds
    pub const DEFAULT_SECONDS: f64 = 1e-10;

    /// Create a new resolution
    ///
    /// # Errors
    ///
    /// Returns a configuration error unless the value is finite and positive.
    pub fn new(seconds_per_tick: f64) -> CoreResult<Self> {
        if !seconds_per_tick.is_finite() || seconds_per_tick <= 0.0 {
            return Err(CoreError::Config {
                parameter: "time_resolution".to_string(),
                reason: "must be a finite positive number of seconds".to_string(),
            });
        }
        Ok(Self(seconds_per_tick))
    }

    /// The resolution in seconds
    #[must_use]
    pub const fn seconds_per_tick(&self) -> f64 {
        self.0
    }

    /// Quantize a duration in seconds to a tick count (round to nearest)
    #[must_use]
    pub fn ticks(&self, seconds: f64) -> i64 {
        if seconds.is_infinite() {
            return if seconds > 0.0 { i64::MAX } else { i64::MIN };
        }
        let scaled = seconds / self.0;
        // Clamp before the cast: a cast from an out-of-range float is saturating,
        // but the explicit clamp keeps the infinity sentinels exact.
        if scaled >= i64::MAX as f64 {
            i64::MAX
        } else if scaled <= i64::MIN as f64 {
            i64::MIN
        } else {
            scaled.round() as i64
        }
    }

    /// Quantize an absolute time in seconds
    #[must_use]
    pub fn time_from_seconds(&self, seconds: f64) -> ModelTime {
        ModelTime::from_ticks(self.ticks(seconds))
    }

    /// Convert a time back to seconds
    #[must_use]
    pub fn seconds(&self, time: ModelTime) -> f64 {
        match time.as_ticks() {
            i64::MAX => f64::INFINITY,
            i64::MIN => f64::NEG_INFINITY,
            t => t as f64 * self.0,
        }
    }

    /// Advance a time by a duration in seconds
    #[must_use]
    pub fn add_seconds(&self, time: ModelTime, seconds: f64) -> ModelTime {
        time.advance(self.ticks(seconds))
    }

    /// Seconds between two times (`later - earlier`)
    #[must_use]
    pub fn seconds_between(&self, earlier: ModelTime, later: ModelTime) -> f64 {
        if later.is_infinite() || earlier.is_infinite() {
            return self.seconds(later) - self.seconds(earlier);
        }
        earlier.ticks_until(later) as f64 * self.0
    }
}

impl Default for TimeResolution {
    fn default() -> Self {
        Self(Self::DEFAULT_SECONDS)
    }
}

impl std::fmt::Display for TimeResolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}s/tick", self.0)
    }
}
