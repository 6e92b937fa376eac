//! The "FEATURES" layer - Measurement Extraction for State Estimation
//! ===================================================================
//!
//! Extractors convert a raw data object (a polyline, a point, ...) into the
//! measurement vector the filter consumes plus an initial filter state for
//! track birth. Each extractor advertises metadata describing how its
//! feature evolves over time; the metadata drives the block structure of the
//! Kalman matrices.

use crate::traceview_filter::FilterState;
use crate::traceview_series::{line_arc_length, line_base_point, line_centroid, Line2};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// METADATA
// ============================================================================

/// How a feature evolves over time; determines its state-space block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureTemporalType {
    /// Time-invariant or slowly varying (length, class). State = measurement.
    Static,
    /// 2D position with velocity: measurement `[x, y]`, state `[x, y, vx, vy]`.
    Kinematic2D,
    /// 3D position with velocity: measurement `[x, y, z]`, state 6D.
    Kinematic3D,
    /// Scalar(s) with first derivative: each scalar gets a rate component.
    ScalarDynamic,
    /// User-supplied state mapping.
    Custom,
}

/// Description of one feature's dimensionality and temporal behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureMetadata {
    /// Identifier, also the key for per-feature measurement noise lookup.
    pub name: String,
    pub measurement_size: usize,
    pub state_size: usize,
    pub temporal_type: FeatureTemporalType,
}

impl FeatureMetadata {
    /// State size implied by the temporal type.
    pub fn state_size_for(measurement_size: usize, temporal_type: FeatureTemporalType) -> usize {
        match temporal_type {
            FeatureTemporalType::Static => measurement_size,
            FeatureTemporalType::Kinematic2D => 4,
            FeatureTemporalType::Kinematic3D => 6,
            FeatureTemporalType::ScalarDynamic => 2 * measurement_size,
            FeatureTemporalType::Custom => measurement_size,
        }
    }

    /// Construct with the state size derived from the temporal type.
    pub fn derive(name: impl Into<String>, measurement_size: usize, temporal_type: FeatureTemporalType) -> Self {
        Self {
            name: name.into(),
            measurement_size,
            state_size: Self::state_size_for(measurement_size, temporal_type),
            temporal_type,
        }
    }

    /// Whether the state tracks derivatives beyond the measurement.
    pub fn has_derivatives(&self) -> bool {
        self.state_size > self.measurement_size
    }
}

// ============================================================================
// EXTRACTOR TRAIT
// ============================================================================

/// Memoized feature vectors for one data object, keyed by feature name.
pub type FeatureCache = HashMap<String, DVector<f64>>;

/// Converts raw data objects into measurement vectors and initial states.
///
/// Implementations must be deterministic and produce vectors of exactly
/// their declared `measurement_size`.
pub trait FeatureExtractor<D>: Send {
    /// The measurement vector consumed by the filter.
    fn filter_features(&self, data: &D) -> DVector<f64>;

    /// Every available feature, keyed for the assignment cache.
    fn all_features(&self, data: &D) -> FeatureCache {
        let mut cache = FeatureCache::new();
        cache.insert(self.filter_feature_name().to_string(), self.filter_features(data));
        cache
    }

    /// Cache key of the filter feature set.
    fn filter_feature_name(&self) -> &str;

    /// Full state (mean + covariance) for initialising a track from its
    /// first observation.
    fn initial_state(&self, data: &D) -> FilterState;

    fn metadata(&self) -> FeatureMetadata;

    fn clone_box(&self) -> Box<dyn FeatureExtractor<D>>;
}

impl<D> Clone for Box<dyn FeatureExtractor<D>> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Initial position uncertainty used by the line extractors.
const INITIAL_VARIANCE: f64 = 100.0;

// ============================================================================
// LINE CENTROID (KINEMATIC 2D)
// ============================================================================

/// Centroid of a polyline, tracked as 2D position + velocity.
#[derive(Debug, Clone, Default)]
pub struct LineCentroidExtractor;

impl FeatureExtractor<Line2> for LineCentroidExtractor {
    fn filter_features(&self, data: &Line2) -> DVector<f64> {
        let (x, y) = line_centroid(data);
        DVector::from_vec(vec![x, y])
    }

    fn filter_feature_name(&self) -> &str {
        "line_centroid"
    }

    fn initial_state(&self, data: &Line2) -> FilterState {
        let (x, y) = line_centroid(data);
        FilterState {
            mean: DVector::from_vec(vec![x, y, 0.0, 0.0]),
            covariance: DMatrix::identity(4, 4) * INITIAL_VARIANCE,
        }
    }

    fn metadata(&self) -> FeatureMetadata {
        FeatureMetadata::derive("line_centroid", 2, FeatureTemporalType::Kinematic2D)
    }

    fn clone_box(&self) -> Box<dyn FeatureExtractor<Line2>> {
        Box::new(self.clone())
    }
}

// ============================================================================
// LINE BASE POINT (KINEMATIC 2D)
// ============================================================================

/// First point of a polyline (e.g. a whisker's follicle), tracked as 2D
/// position + velocity.
#[derive(Debug, Clone, Default)]
pub struct LineBasePointExtractor;

impl FeatureExtractor<Line2> for LineBasePointExtractor {
    fn filter_features(&self, data: &Line2) -> DVector<f64> {
        let (x, y) = line_base_point(data);
        DVector::from_vec(vec![x, y])
    }

    fn filter_feature_name(&self) -> &str {
        "line_base_point"
    }

    fn initial_state(&self, data: &Line2) -> FilterState {
        let (x, y) = line_base_point(data);
        FilterState {
            mean: DVector::from_vec(vec![x, y, 0.0, 0.0]),
            covariance: DMatrix::identity(4, 4) * INITIAL_VARIANCE,
        }
    }

    fn metadata(&self) -> FeatureMetadata {
        FeatureMetadata::derive("line_base_point", 2, FeatureTemporalType::Kinematic2D)
    }

    fn clone_box(&self) -> Box<dyn FeatureExtractor<Line2>> {
        Box::new(self.clone())
    }
}

// ============================================================================
// LINE LENGTH (STATIC)
// ============================================================================

/// Arc length of a polyline, treated as a static scalar.
#[derive(Debug, Clone, Default)]
pub struct LineLengthExtractor;

impl FeatureExtractor<Line2> for LineLengthExtractor {
    fn filter_features(&self, data: &Line2) -> DVector<f64> {
        DVector::from_vec(vec![line_arc_length(data)])
    }

    fn filter_feature_name(&self) -> &str {
        "line_length"
    }

    fn initial_state(&self, data: &Line2) -> FilterState {
        FilterState {
            mean: DVector::from_vec(vec![line_arc_length(data)]),
            covariance: DMatrix::identity(1, 1) * INITIAL_VARIANCE,
        }
    }

    fn metadata(&self) -> FeatureMetadata {
        FeatureMetadata::derive("line_length", 1, FeatureTemporalType::Static)
    }

    fn clone_box(&self) -> Box<dyn FeatureExtractor<Line2>> {
        Box::new(self.clone())
    }
}

// ============================================================================
// COMPOSITE EXTRACTOR
// ============================================================================

/// Cache key under which the concatenated composite feature is stored.
pub const COMPOSITE_FEATURE_NAME: &str = "composite_features";

/// Chains child extractors into one concatenated feature.
///
/// Measurements concatenate in child order; the initial state concatenates
/// child means with a block-diagonal covariance. Child names must be unique
/// within one composite so per-feature noise lookup stays unambiguous.
pub struct CompositeFeatureExtractor<D> {
    extractors: Vec<Box<dyn FeatureExtractor<D>>>,
}

impl<D> Default for CompositeFeatureExtractor<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> CompositeFeatureExtractor<D> {
    pub fn new() -> Self {
        Self {
            extractors: Vec::new(),
        }
    }

    /// Append a child; extraction order follows insertion order.
    pub fn add_extractor(&mut self, extractor: Box<dyn FeatureExtractor<D>>) {
        debug_assert!(
            self.extractors
                .iter()
                .all(|e| e.metadata().name != extractor.metadata().name),
            "feature names must be unique within a composite"
        );
        self.extractors.push(extractor);
    }

    pub fn extractor_count(&self) -> usize {
        self.extractors.len()
    }

    /// Per-child metadata in declaration order, for matrix construction.
    pub fn child_metadata(&self) -> Vec<FeatureMetadata> {
        self.extractors.iter().map(|e| e.metadata()).collect()
    }
}

impl<D: 'static> FeatureExtractor<D> for CompositeFeatureExtractor<D> {
    fn filter_features(&self, data: &D) -> DVector<f64> {
        let parts: Vec<DVector<f64>> = self
            .extractors
            .iter()
            .map(|e| e.filter_features(data))
            .collect();
        let total: usize = parts.iter().map(DVector::len).sum();
        let mut out = DVector::zeros(total);
        let mut offset = 0;
        for part in &parts {
            out.rows_mut(offset, part.len()).copy_from(part);
            offset += part.len();
        }
        out
    }

    fn all_features(&self, data: &D) -> FeatureCache {
        let mut cache = FeatureCache::new();
        cache.insert(COMPOSITE_FEATURE_NAME.to_string(), self.filter_features(data));
        for extractor in &self.extractors {
            cache.extend(extractor.all_features(data));
        }
        cache
    }

    fn filter_feature_name(&self) -> &str {
        COMPOSITE_FEATURE_NAME
    }

    fn initial_state(&self, data: &D) -> FilterState {
        let states: Vec<FilterState> = self
            .extractors
            .iter()
            .map(|e| e.initial_state(data))
            .collect();
        let total: usize = states.iter().map(|s| s.mean.len()).sum();

        let mut mean = DVector::zeros(total);
        let mut covariance = DMatrix::zeros(total, total);
        let mut offset = 0;
        for state in &states {
            let size = state.mean.len();
            mean.rows_mut(offset, size).copy_from(&state.mean);
            covariance
                .view_mut((offset, offset), (size, size))
                .copy_from(&state.covariance);
            offset += size;
        }
        FilterState { mean, covariance }
    }

    fn metadata(&self) -> FeatureMetadata {
        let measurement_size = self
            .extractors
            .iter()
            .map(|e| e.metadata().measurement_size)
            .sum();
        let state_size = self.extractors.iter().map(|e| e.metadata().state_size).sum();
        FeatureMetadata {
            name: COMPOSITE_FEATURE_NAME.to_string(),
            measurement_size,
            state_size,
            temporal_type: FeatureTemporalType::Custom,
        }
    }

    fn clone_box(&self) -> Box<dyn FeatureExtractor<D>> {
        Box::new(CompositeFeatureExtractor {
            extractors: self.extractors.clone(),
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traceview_series::Point2;
    use approx::assert_relative_eq;

    fn sample_line() -> Line2 {
        vec![
            Point2::new(0.0, 0.0),
            Point2::new(3.0, 0.0),
            Point2::new(3.0, 4.0),
        ]
    }

    #[test]
    fn test_state_size_derivation() {
        assert_eq!(FeatureMetadata::state_size_for(1, FeatureTemporalType::Static), 1);
        assert_eq!(FeatureMetadata::state_size_for(2, FeatureTemporalType::Kinematic2D), 4);
        assert_eq!(FeatureMetadata::state_size_for(3, FeatureTemporalType::Kinematic3D), 6);
        assert_eq!(FeatureMetadata::state_size_for(2, FeatureTemporalType::ScalarDynamic), 4);

        let meta = FeatureMetadata::derive("x", 2, FeatureTemporalType::Kinematic2D);
        assert!(meta.has_derivatives());
        let static_meta = FeatureMetadata::derive("y", 3, FeatureTemporalType::Static);
        assert!(!static_meta.has_derivatives());
    }

    #[test]
    fn test_centroid_extractor() {
        let line = sample_line();
        let extractor = LineCentroidExtractor;
        let features = extractor.filter_features(&line);
        assert_eq!(features.len(), 2);
        assert_relative_eq!(features[0], 2.0);
        assert_relative_eq!(features[1], 4.0 / 3.0);

        let state = extractor.initial_state(&line);
        assert_eq!(state.mean.len(), 4);
        assert_relative_eq!(state.mean[0], 2.0);
        assert_relative_eq!(state.mean[2], 0.0, epsilon = 1e-12);
        assert_relative_eq!(state.covariance[(0, 0)], 100.0);
    }

    #[test]
    fn test_base_point_and_length_extractors() {
        let line = sample_line();
        let base = LineBasePointExtractor.filter_features(&line);
        assert_relative_eq!(base[0], 0.0, epsilon = 1e-12);
        assert_relative_eq!(base[1], 0.0, epsilon = 1e-12);

        let length = LineLengthExtractor.filter_features(&line);
        assert_eq!(length.len(), 1);
        assert_relative_eq!(length[0], 7.0);
    }

    #[test]
    fn test_composite_concatenates_in_order() {
        let mut composite = CompositeFeatureExtractor::<Line2>::new();
        composite.add_extractor(Box::new(LineCentroidExtractor));
        composite.add_extractor(Box::new(LineLengthExtractor));

        let line = sample_line();
        let features = composite.filter_features(&line);
        assert_eq!(features.len(), 3);
        assert_relative_eq!(features[0], 2.0);
        assert_relative_eq!(features[2], 7.0);

        let meta = composite.metadata();
        assert_eq!(meta.measurement_size, 3);
        assert_eq!(meta.state_size, 5); // 4 (kinematic) + 1 (static)
        assert_eq!(meta.temporal_type, FeatureTemporalType::Custom);

        let children = composite.child_metadata();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].name, "line_centroid");
        assert_eq!(children[1].name, "line_length");
    }

    #[test]
    fn test_composite_initial_state_is_block_diagonal() {
        let mut composite = CompositeFeatureExtractor::<Line2>::new();
        composite.add_extractor(Box::new(LineCentroidExtractor));
        composite.add_extractor(Box::new(LineLengthExtractor));

        let state = composite.initial_state(&sample_line());
        assert_eq!(state.mean.len(), 5);
        assert_relative_eq!(state.mean[4], 7.0);
        // Off-diagonal block between children is zero
        assert_relative_eq!(state.covariance[(0, 4)], 0.0, epsilon = 1e-12);
        assert_relative_eq!(state.covariance[(4, 4)], 100.0);
    }

    #[test]
    fn test_composite_cache_merges_children() {
        let mut composite = CompositeFeatureExtractor::<Line2>::new();
        composite.add_extractor(Box::new(LineCentroidExtractor));
        composite.add_extractor(Box::new(LineLengthExtractor));

        let cache = composite.all_features(&sample_line());
        assert!(cache.contains_key(COMPOSITE_FEATURE_NAME));
        assert!(cache.contains_key("line_centroid"));
        assert!(cache.contains_key("line_length"));
    }

    #[test]
    fn test_clone_box_is_independent() {
        let mut composite = CompositeFeatureExtractor::<Line2>::new();
        composite.add_extractor(Box::new(LineCentroidExtractor));
        let cloned = composite.clone_box();
        assert_eq!(cloned.metadata().measurement_size, 2);
    }
}
