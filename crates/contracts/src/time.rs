//! TimeValue - Microsecond instant shared by every crate.
//!
//! All stream timestamps, periods and windows in the workspace are carried as
//! this type. A default-constructed value is the null sentinel ("unset").

use std::fmt;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Microseconds per second, the resolution of [`TimeValue`].
pub const MICROS_PER_SECOND: i64 = 1_000_000;

/// A monotonic, comparable instant at microsecond resolution.
///
/// Internally a signed count of microseconds from an arbitrary epoch, so the
/// same type doubles as a duration (periods, timeouts, match windows).
/// Negative values are legal and used for "derive the buffer size but do not
/// look ahead" periods and for match-window offsets.
///
/// The zero value is the distinguished *null* instant, meaning "unset".
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TimeValue {
    micros: i64,
}

impl TimeValue {
    /// The null sentinel ("unset").
    pub const NULL: TimeValue = TimeValue { micros: 0 };

    /// Build from a raw microsecond count.
    #[inline]
    pub const fn from_micros(micros: i64) -> Self {
        Self { micros }
    }

    /// Build from fractional seconds, rounded to the nearest microsecond.
    #[inline]
    pub fn from_seconds(seconds: f64) -> Self {
        Self {
            micros: (seconds * MICROS_PER_SECOND as f64).round() as i64,
        }
    }

    /// Build from a whole millisecond count.
    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self {
            micros: millis * 1_000,
        }
    }

    /// The current wall-clock time.
    ///
    /// Only used to stamp status records; the alignment algorithms never
    /// consult the wall clock.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Self { micros }
    }

    /// Raw microsecond count.
    #[inline]
    pub const fn micros(self) -> i64 {
        self.micros
    }

    /// Fractional seconds.
    #[inline]
    pub fn to_seconds(self) -> f64 {
        self.micros as f64 / MICROS_PER_SECOND as f64
    }

    /// True for the null sentinel.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.micros == 0
    }

    /// Magnitude of this value.
    #[inline]
    pub const fn abs(self) -> Self {
        Self {
            micros: self.micros.abs(),
        }
    }
}

impl Add for TimeValue {
    type Output = TimeValue;

    #[inline]
    fn add(self, rhs: TimeValue) -> TimeValue {
        TimeValue {
            micros: self.micros + rhs.micros,
        }
    }
}

impl AddAssign for TimeValue {
    #[inline]
    fn add_assign(&mut self, rhs: TimeValue) {
        self.micros += rhs.micros;
    }
}

impl Sub for TimeValue {
    type Output = TimeValue;

    #[inline]
    fn sub(self, rhs: TimeValue) -> TimeValue {
        TimeValue {
            micros: self.micros - rhs.micros,
        }
    }
}

impl SubAssign for TimeValue {
    #[inline]
    fn sub_assign(&mut self, rhs: TimeValue) {
        self.micros -= rhs.micros;
    }
}

impl Neg for TimeValue {
    type Output = TimeValue;

    #[inline]
    fn neg(self) -> TimeValue {
        TimeValue {
            micros: -self.micros,
        }
    }
}

impl fmt::Display for TimeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "{:.6}s", self.to_seconds())
        }
    }
}
