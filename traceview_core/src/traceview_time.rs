//! The "TIME" layer - Strong Time Indices and Coordinate Systems
//! ==============================================================
//!
//! Every container in a session addresses its data by a [`TimeIndex`]: a
//! signed integer position in a monotonically increasing coordinate vector.
//! Different containers may sample at different rates, so indices only have
//! meaning relative to a [`TimeFrame`]. Conversions between frames go through
//! the frame's value mapping; indices never mix implicitly.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Sub};

// ============================================================================
// TIME INDEX
// ============================================================================

/// Strongly-typed index into a time coordinate system.
///
/// Plain integer arithmetic and ordering are defined; converting an index
/// between two coordinate systems requires going through [`TimeFrame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeIndex(pub i64);

impl TimeIndex {
    /// Raw integer value of the index.
    #[inline]
    pub fn value(self) -> i64 {
        self.0
    }
}

impl Add<i64> for TimeIndex {
    type Output = TimeIndex;

    #[inline]
    fn add(self, rhs: i64) -> TimeIndex {
        TimeIndex(self.0 + rhs)
    }
}

impl AddAssign<i64> for TimeIndex {
    #[inline]
    fn add_assign(&mut self, rhs: i64) {
        self.0 += rhs;
    }
}

impl Sub<i64> for TimeIndex {
    type Output = TimeIndex;

    #[inline]
    fn sub(self, rhs: i64) -> TimeIndex {
        TimeIndex(self.0 - rhs)
    }
}

impl Sub for TimeIndex {
    type Output = i64;

    /// Difference between two indices of the same coordinate system, in frames.
    #[inline]
    fn sub(self, rhs: TimeIndex) -> i64 {
        self.0 - rhs.0
    }
}

impl fmt::Display for TimeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// TIME FRAME (COORDINATE SYSTEM)
// ============================================================================

/// Rounding policy when a sample-space value falls between two indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexRounding {
    /// Pick the nearest index at or below the value.
    Below,
    /// Pick the nearest index at or above the value.
    Above,
}

/// A monotonic mapping between discrete time indices and sample-space values.
///
/// Containers sampled at different rates each bind their own `TimeFrame`;
/// cross-container queries convert through the value axis. Identity is
/// by handle (`Arc::ptr_eq` on the shared frame), matching the session's
/// "same coordinate system" notion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeFrame {
    /// Strictly increasing sample-space values, one per index.
    times: Vec<f64>,
}

impl TimeFrame {
    /// Build a coordinate system from a strictly increasing value vector.
    ///
    /// Returns `None` when the vector is empty or not strictly increasing.
    pub fn new(times: Vec<f64>) -> Option<Self> {
        if times.is_empty() {
            return None;
        }
        if times.windows(2).any(|w| w[1] <= w[0]) {
            return None;
        }
        Some(Self { times })
    }

    /// Uniform coordinate system `0, 1, 2, ... count-1`.
    pub fn uniform(count: usize) -> Self {
        Self {
            times: (0..count).map(|i| i as f64).collect(),
        }
    }

    /// Number of indices in this coordinate system.
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Sample-space value at an index, clamped to the frame's range.
    pub fn time_at_index(&self, index: TimeIndex) -> f64 {
        let clamped = index.value().clamp(0, self.times.len() as i64 - 1) as usize;
        self.times[clamped]
    }

    /// Index whose value is nearest below (or above) the queried value.
    ///
    /// Values outside the covered range clamp to the first/last index.
    pub fn index_at_time(&self, time: f64, rounding: IndexRounding) -> TimeIndex {
        let last = self.times.len() - 1;
        if time <= self.times[0] {
            return TimeIndex(0);
        }
        if time >= self.times[last] {
            return TimeIndex(last as i64);
        }
        // partition_point: first index whose value exceeds `time`
        let upper = self.times.partition_point(|&t| t <= time);
        match rounding {
            IndexRounding::Below => TimeIndex(upper as i64 - 1),
            IndexRounding::Above => {
                if (self.times[upper - 1] - time).abs() < f64::EPSILON {
                    TimeIndex(upper as i64 - 1)
                } else {
                    TimeIndex(upper as i64)
                }
            }
        }
    }

    /// Convert an index from another coordinate system into this one.
    ///
    /// Maps through the sample-space value of `index` in `other`.
    pub fn convert_index(&self, index: TimeIndex, other: &TimeFrame, rounding: IndexRounding) -> TimeIndex {
        let value = other.time_at_index(index);
        self.index_at_time(value, rounding)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_index_arithmetic() {
        let a = TimeIndex(10);
        let b = a + 5;
        assert_eq!(b, TimeIndex(15));
        assert_eq!(b - a, 5);
        assert!(a < b);
        assert_eq!(b - 3, TimeIndex(12));
    }

    #[test]
    fn test_rejects_non_monotonic() {
        assert!(TimeFrame::new(vec![]).is_none());
        assert!(TimeFrame::new(vec![0.0, 1.0, 1.0]).is_none());
        assert!(TimeFrame::new(vec![0.0, 2.0, 1.0]).is_none());
        assert!(TimeFrame::new(vec![0.0, 1.0, 2.0]).is_some());
    }

    #[test]
    fn test_uniform_roundtrip() {
        let tf = TimeFrame::uniform(100);
        assert_eq!(tf.len(), 100);
        assert_relative_eq!(tf.time_at_index(TimeIndex(42)), 42.0);
        assert_eq!(tf.index_at_time(42.0, IndexRounding::Below), TimeIndex(42));
        assert_eq!(tf.index_at_time(42.0, IndexRounding::Above), TimeIndex(42));
    }

    #[test]
    fn test_rounding_between_samples() {
        // Samples at 0, 10, 20, 30
        let tf = TimeFrame::new(vec![0.0, 10.0, 20.0, 30.0]).unwrap();
        assert_eq!(tf.index_at_time(14.0, IndexRounding::Below), TimeIndex(1));
        assert_eq!(tf.index_at_time(14.0, IndexRounding::Above), TimeIndex(2));
        // Exact hits resolve to the same index either way
        assert_eq!(tf.index_at_time(20.0, IndexRounding::Below), TimeIndex(2));
        assert_eq!(tf.index_at_time(20.0, IndexRounding::Above), TimeIndex(2));
    }

    #[test]
    fn test_out_of_range_clamps() {
        let tf = TimeFrame::new(vec![5.0, 10.0, 15.0]).unwrap();
        assert_eq!(tf.index_at_time(-3.0, IndexRounding::Below), TimeIndex(0));
        assert_eq!(tf.index_at_time(100.0, IndexRounding::Above), TimeIndex(2));
        assert_relative_eq!(tf.time_at_index(TimeIndex(99)), 15.0);
    }

    #[test]
    fn test_cross_frame_conversion() {
        // Frame A samples every 1.0, frame B every 2.0 starting at 0
        let a = TimeFrame::new((0..20).map(|i| i as f64).collect()).unwrap();
        let b = TimeFrame::new((0..10).map(|i| (i * 2) as f64).collect()).unwrap();
        // Index 6 in A (value 6.0) lands on index 3 in B (value 6.0)
        assert_eq!(b.convert_index(TimeIndex(6), &a, IndexRounding::Below), TimeIndex(3));
        // Index 7 in A (value 7.0) falls between B indices 3 and 4
        assert_eq!(b.convert_index(TimeIndex(7), &a, IndexRounding::Below), TimeIndex(3));
        assert_eq!(b.convert_index(TimeIndex(7), &a, IndexRounding::Above), TimeIndex(4));
    }
}
