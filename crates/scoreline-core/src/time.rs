use std::{
    cmp::Ordering,
    fmt,
    ops::{Add, Sub},
};

use serde::{Deserialize, Serialize};

/// Timeline position in seconds. Totally ordered so it can key ordered maps.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Offset(f64);

impl Offset {
    pub const NEG_INFINITY: Self = Self(f64::NEG_INFINITY);
    pub const INFINITY: Self = Self(f64::INFINITY);
    pub const ZERO: Self = Self(0.0);

    #[must_use]
    pub fn new(seconds: f64) -> Self {
        // -0.0 and 0.0 must share one index slot
        if seconds == 0.0 {
            Self(0.0)
        } else {
            Self(seconds)
        }
    }

    #[must_use]
    pub fn seconds(self) -> f64 {
        self.0
    }

    #[must_use]
    pub fn is_finite(self) -> bool {
        self.0.is_finite()
    }

    #[must_use]
    pub fn is_nan(self) -> bool {
        self.0.is_nan()
    }
}

impl PartialEq for Offset {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Offset {}

impl PartialOrd for Offset {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Offset {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl From<f64> for Offset {
    fn from(value: f64) -> Self {
        Self::new(value)
    }
}

impl From<u32> for Offset {
    fn from(value: u32) -> Self {
        Self::new(f64::from(value))
    }
}

impl From<Offset> for f64 {
    fn from(value: Offset) -> Self {
        value.0
    }
}

impl Add<f64> for Offset {
    type Output = Offset;

    fn add(self, rhs: f64) -> Self::Output {
        Self::new(self.0 + rhs)
    }
}

impl Sub for Offset {
    type Output = f64;

    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_zero_collapses_onto_zero() {
        assert_eq!(Offset::new(-0.0), Offset::ZERO);
        assert_eq!(Offset::from(-0.0).cmp(&Offset::ZERO), Ordering::Equal);
    }

    #[test]
    fn sentinels_bound_every_finite_offset() {
        let mut offsets = vec![
            Offset::from(3.5),
            Offset::INFINITY,
            Offset::ZERO,
            Offset::NEG_INFINITY,
            Offset::from(1.0),
        ];
        offsets.sort();
        assert_eq!(offsets.first(), Some(&Offset::NEG_INFINITY));
        assert_eq!(offsets.last(), Some(&Offset::INFINITY));
        assert_eq!(offsets[1], Offset::ZERO);
    }

    #[test]
    fn arithmetic_keeps_infinity() {
        assert_eq!(Offset::from(2.0) + f64::INFINITY, Offset::INFINITY);
        assert!((Offset::from(7.5) - Offset::from(2.5) - 5.0).abs() < f64::EPSILON);
    }
}
