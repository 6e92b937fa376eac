//! The "OUTLIER" Engine - Smoothed-Residual Outlier Detection
//! ===========================================================
//!
//! For each selected group, the detector forward-filters and RTS-smooths the
//! group's observation sequence, then scores every frame by the squared
//! Mahalanobis distance between the smoothed state and the observation.
//! Frames beyond the chi-squared threshold are flagged and their entities
//! collected into a single outlier group.
//!
//! A second, forward-only variant flags entities whose residual magnitude
//! exceeds `mean + k * std` of the group's residual distribution.

use crate::progress::Progress;
use crate::traceview_cost::CostFn;
use crate::traceview_entity::EntityId;
use crate::traceview_features::FeatureExtractor;
use crate::traceview_filter::{Filter, Measurement};
use crate::traceview_groups::{EntityGroupManager, GroupId};
use crate::traceview_time::TimeIndex;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

/// Chi-squared thresholds for ~3 degrees of freedom.
pub const CHI2_3DOF_95: f64 = 7.81;
pub const CHI2_3DOF_99: f64 = 11.34;
pub const CHI2_3DOF_999: f64 = 16.27;

/// Configuration for [`OutlierDetector`].
#[derive(Debug, Clone)]
pub struct OutlierConfig {
    /// Squared-Mahalanobis threshold above which a frame is an outlier.
    pub chi_squared_threshold: f64,
    /// Leading frames skipped as filter warm-up.
    pub warmup_frames: usize,
    /// Name of the group collecting flagged entities; created if absent.
    pub outlier_group_name: String,
}

impl Default for OutlierConfig {
    fn default() -> Self {
        Self {
            chi_squared_threshold: CHI2_3DOF_99,
            warmup_frames: 3,
            outlier_group_name: "outlier".to_string(),
        }
    }
}

/// One flagged frame.
#[derive(Debug, Clone, PartialEq)]
pub struct OutlierHit {
    pub frame: TimeIndex,
    pub entity_id: EntityId,
    /// Squared Mahalanobis distance that tripped the threshold.
    pub chi_squared: f64,
}

// ============================================================================
// CHI-SQUARED DETECTOR
// ============================================================================

/// Smoothed-residual outlier detector over a raw data type `D`.
pub struct OutlierDetector<D> {
    filter_prototype: Box<dyn Filter>,
    feature_extractor: Box<dyn FeatureExtractor<D>>,
    cost_function: CostFn,
    config: OutlierConfig,
}

impl<D> OutlierDetector<D> {
    pub fn new(
        filter_prototype: Box<dyn Filter>,
        feature_extractor: Box<dyn FeatureExtractor<D>>,
        cost_function: CostFn,
        config: OutlierConfig,
    ) -> Self {
        Self {
            filter_prototype,
            feature_extractor,
            cost_function,
            config,
        }
    }

    /// Scan `group_ids` over `[start_frame, end_frame]`; flagged entities are
    /// added to the outlier group and returned per source group. Observers
    /// are notified once at the end.
    pub fn process<'a, I>(
        &self,
        data_source: I,
        group_manager: &mut EntityGroupManager,
        start_frame: TimeIndex,
        end_frame: TimeIndex,
        group_ids: &[GroupId],
        mut progress: Progress<'_>,
    ) -> BTreeMap<GroupId, Vec<OutlierHit>>
    where
        I: IntoIterator<Item = (&'a D, EntityId, TimeIndex)>,
        D: 'a,
    {
        // (frame, entity, data) in frame order, restricted to the range.
        let mut items: Vec<(TimeIndex, EntityId, &D)> = data_source
            .into_iter()
            .filter(|&(_, _, frame)| frame >= start_frame && frame <= end_frame)
            .map(|(data, entity, frame)| (frame, entity, data))
            .collect();
        items.sort_by_key(|&(frame, entity, _)| (frame, entity));

        let outlier_group = group_manager
            .find_group_by_name(&self.config.outlier_group_name)
            .unwrap_or_else(|| {
                group_manager.create_group(self.config.outlier_group_name.clone(), "flagged outliers")
            });

        let mut results: BTreeMap<GroupId, Vec<OutlierHit>> = BTreeMap::new();
        let total_groups = group_ids.len().max(1);

        for (group_index, &group_id) in group_ids.iter().enumerate() {
            let members: HashSet<EntityId> =
                group_manager.entities_in_group(group_id).into_iter().collect();
            if members.is_empty() {
                continue;
            }

            // One observation per frame: the first member entity seen there.
            let mut sequence: Vec<(TimeIndex, EntityId, &D)> = Vec::new();
            let mut seen_frames: HashSet<TimeIndex> = HashSet::new();
            for &(frame, entity, data) in &items {
                if members.contains(&entity) && seen_frames.insert(frame) {
                    sequence.push((frame, entity, data));
                }
            }
            if sequence.len() < 2 {
                continue;
            }

            // Forward pass, then RTS smoothing.
            let mut filter = self.filter_prototype.clone_box();
            let mut forward_states = Vec::with_capacity(sequence.len());
            for (index, &(_, _, data)) in sequence.iter().enumerate() {
                if index == 0 {
                    filter.initialize(&self.feature_extractor.initial_state(data));
                } else {
                    let predicted = filter.predict();
                    let measurement =
                        Measurement::new(self.feature_extractor.filter_features(data));
                    filter.update(&predicted, &measurement);
                }
                forward_states.push(filter.state());
            }
            let smoothed = self.filter_prototype.smooth(&forward_states);

            let mut hits = Vec::new();
            for (index, &(frame, entity, data)) in sequence.iter().enumerate() {
                if index < self.config.warmup_frames {
                    continue;
                }
                let features = self.feature_extractor.filter_features(data);
                let cost = (self.cost_function)(&smoothed[index], &features, 1);
                let chi_squared = cost * cost;
                if chi_squared > self.config.chi_squared_threshold {
                    debug!(
                        group = group_id,
                        frame = frame.value(),
                        entity = entity.0,
                        chi_squared,
                        "outlier flagged"
                    );
                    group_manager.add_entity_to_group(outlier_group, entity);
                    hits.push(OutlierHit {
                        frame,
                        entity_id: entity,
                        chi_squared,
                    });
                }
            }
            if !hits.is_empty() {
                results.insert(group_id, hits);
            }

            progress.report((((group_index + 1) * 100) / total_groups) as i32);
        }

        group_manager.notify_groups_changed();
        progress.finish();
        results
    }
}

// ============================================================================
// RESIDUAL-STATS DETECTOR (FORWARD-ONLY VARIANT)
// ============================================================================

/// Per-group residual statistics from the forward-only variant.
#[derive(Debug, Clone)]
pub struct ResidualReport {
    pub mean: f64,
    pub std_dev: f64,
    pub threshold: f64,
    pub flagged: Vec<OutlierHit>,
}

/// Forward-only residual detector: flags residual magnitudes above
/// `mean + threshold_sigma * std`.
pub struct ResidualStatsDetector<D> {
    filter_prototype: Box<dyn Filter>,
    feature_extractor: Box<dyn FeatureExtractor<D>>,
    cost_function: CostFn,
    /// Sigma multiplier over the group's residual distribution.
    pub threshold_sigma: f64,
}

impl<D> ResidualStatsDetector<D> {
    pub fn new(
        filter_prototype: Box<dyn Filter>,
        feature_extractor: Box<dyn FeatureExtractor<D>>,
        cost_function: CostFn,
    ) -> Self {
        Self {
            filter_prototype,
            feature_extractor,
            cost_function,
            threshold_sigma: 3.0,
        }
    }

    /// Analyse one group's sequence; gaps are bridged by multi-step
    /// prediction.
    pub fn analyze_group<'a, I>(
        &self,
        data_source: I,
        group_manager: &EntityGroupManager,
        group_id: GroupId,
    ) -> Option<ResidualReport>
    where
        I: IntoIterator<Item = (&'a D, EntityId, TimeIndex)>,
        D: 'a,
    {
        let members: HashSet<EntityId> =
            group_manager.entities_in_group(group_id).into_iter().collect();
        let mut sequence: Vec<(TimeIndex, EntityId, &D)> = data_source
            .into_iter()
            .filter(|&(_, entity, _)| members.contains(&entity))
            .map(|(data, entity, frame)| (frame, entity, data))
            .collect();
        sequence.sort_by_key(|&(frame, entity, _)| (frame, entity));
        if sequence.len() < 2 {
            return None;
        }

        // Forward pass recording pre-update residual magnitudes.
        let mut filter = self.filter_prototype.clone_box();
        let mut magnitudes: Vec<(TimeIndex, EntityId, f64)> = Vec::new();
        let mut prev_frame: Option<TimeIndex> = None;
        for &(frame, entity, data) in &sequence {
            match prev_frame {
                None => filter.initialize(&self.feature_extractor.initial_state(data)),
                Some(prev) => {
                    let num_steps = (frame - prev).max(1);
                    let mut predicted = filter.state();
                    for _ in 0..num_steps {
                        predicted = filter.predict();
                    }
                    let features = self.feature_extractor.filter_features(data);
                    let magnitude = (self.cost_function)(&predicted, &features, num_steps);
                    magnitudes.push((frame, entity, magnitude));
                    filter.update(&predicted, &Measurement::new(features));
                }
            }
            prev_frame = Some(frame);
        }
        if magnitudes.is_empty() {
            return None;
        }

        let n = magnitudes.len() as f64;
        let mean = magnitudes.iter().map(|&(_, _, m)| m).sum::<f64>() / n;
        let variance = magnitudes
            .iter()
            .map(|&(_, _, m)| (m - mean) * (m - mean))
            .sum::<f64>()
            / n;
        let std_dev = variance.sqrt();
        let threshold = mean + self.threshold_sigma * std_dev;

        let flagged = magnitudes
            .iter()
            .filter(|&&(_, _, m)| m > threshold)
            .map(|&(frame, entity_id, m)| OutlierHit {
                frame,
                entity_id,
                chi_squared: m * m,
            })
            .collect();

        Some(ResidualReport {
            mean,
            std_dev,
            threshold,
            flagged,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traceview_cost::mahalanobis_cost;
    use crate::traceview_features::{
        FeatureMetadata, FeatureTemporalType, LineCentroidExtractor,
    };
    use crate::traceview_filter::{KalmanFilter, KalmanMatrixBuilder, NoiseConfig};
    use crate::traceview_series::{Line2, Point2};

    fn point_line(x: f64, y: f64) -> Line2 {
        vec![
            Point2::new(x as f32 - 0.5, y as f32),
            Point2::new(x as f32 + 0.5, y as f32),
        ]
    }

    fn build_detector(threshold: f64) -> OutlierDetector<Line2> {
        let metadata = vec![FeatureMetadata::derive(
            "line_centroid",
            2,
            FeatureTemporalType::Kinematic2D,
        )];
        let noise = NoiseConfig {
            dt: 1.0,
            process_noise_position: 0.05,
            process_noise_velocity: 0.05,
            measurement_noise: 1.0,
            ..Default::default()
        };
        let matrices = KalmanMatrixBuilder::build(&metadata, &noise);
        let cost = mahalanobis_cost(matrices.h.clone(), matrices.r.clone());
        let filter = KalmanFilter::new(matrices.f, matrices.h, matrices.q, matrices.r);
        OutlierDetector::new(
            Box::new(filter),
            Box::new(LineCentroidExtractor),
            cost,
            OutlierConfig {
                chi_squared_threshold: threshold,
                ..Default::default()
            },
        )
    }

    struct Scenario {
        data: Vec<(Line2, EntityId, TimeIndex)>,
        group: GroupId,
        jump_entities: Vec<EntityId>,
    }

    /// A 30-frame linear trajectory with large position jumps injected at
    /// frames 8, 16, and 24.
    fn jump_scenario(manager: &mut EntityGroupManager) -> Scenario {
        let group = manager.create_group("trajectory", "");
        let mut data = Vec::new();
        let mut jump_entities = Vec::new();

        for t in 0..30i64 {
            let entity = EntityId(500 + t as u64);
            let y = if matches!(t, 8 | 16 | 24) {
                jump_entities.push(entity);
                6.0
            } else {
                0.0
            };
            data.push((point_line(t as f64, y), entity, TimeIndex(t)));
            manager.add_entity_to_group(group, entity);
        }

        Scenario {
            data,
            group,
            jump_entities,
        }
    }

    #[test]
    fn test_flags_injected_jumps() {
        let mut manager = EntityGroupManager::new();
        let scenario = jump_scenario(&mut manager);
        let detector = build_detector(CHI2_3DOF_99);

        let results = detector.process(
            scenario.data.iter().map(|(l, e, t)| (l, *e, *t)),
            &mut manager,
            TimeIndex(0),
            TimeIndex(29),
            &[scenario.group],
            Progress::none(),
        );

        let hits = &results[&scenario.group];
        assert!(hits.len() >= 3, "expected at least the three jumps, got {}", hits.len());
        for jump in &scenario.jump_entities {
            assert!(
                hits.iter().any(|h| h.entity_id == *jump),
                "jump entity {jump} not flagged"
            );
        }

        // Flagged entities landed in the outlier group
        let outlier_group = manager.find_group_by_name("outlier").unwrap();
        for jump in &scenario.jump_entities {
            assert!(manager.is_entity_in_group(outlier_group, *jump));
        }
    }

    #[test]
    fn test_lower_threshold_flags_a_superset() {
        let mut strict_manager = EntityGroupManager::new();
        let strict_scenario = jump_scenario(&mut strict_manager);
        let strict = build_detector(CHI2_3DOF_99).process(
            strict_scenario.data.iter().map(|(l, e, t)| (l, *e, *t)),
            &mut strict_manager,
            TimeIndex(0),
            TimeIndex(29),
            &[strict_scenario.group],
            Progress::none(),
        );

        let mut loose_manager = EntityGroupManager::new();
        let loose_scenario = jump_scenario(&mut loose_manager);
        let loose = build_detector(2.25).process(
            loose_scenario.data.iter().map(|(l, e, t)| (l, *e, *t)),
            &mut loose_manager,
            TimeIndex(0),
            TimeIndex(29),
            &[loose_scenario.group],
            Progress::none(),
        );

        let strict_set: HashSet<EntityId> = strict
            .values()
            .flatten()
            .map(|h| h.entity_id)
            .collect();
        let loose_set: HashSet<EntityId> = loose
            .values()
            .flatten()
            .map(|h| h.entity_id)
            .collect();

        assert!(loose_set.len() >= strict_set.len());
        assert!(strict_set.is_subset(&loose_set), "strict hits must survive loosening");
    }

    #[test]
    fn test_clean_trajectory_flags_nothing() {
        let mut manager = EntityGroupManager::new();
        let group = manager.create_group("clean", "");
        let mut data = Vec::new();
        for t in 0..20i64 {
            let entity = EntityId(700 + t as u64);
            data.push((point_line(t as f64, 0.0), entity, TimeIndex(t)));
            manager.add_entity_to_group(group, entity);
        }

        let detector = build_detector(CHI2_3DOF_99);
        let results = detector.process(
            data.iter().map(|(l, e, t)| (l, *e, *t)),
            &mut manager,
            TimeIndex(0),
            TimeIndex(19),
            &[group],
            Progress::none(),
        );
        assert!(results.is_empty());
    }

    #[test]
    fn test_short_or_empty_groups_are_skipped() {
        let mut manager = EntityGroupManager::new();
        let empty = manager.create_group("empty", "");
        let single = manager.create_group("single", "");
        manager.add_entity_to_group(single, EntityId(1));
        let data = vec![(point_line(0.0, 0.0), EntityId(1), TimeIndex(0))];

        let detector = build_detector(CHI2_3DOF_99);
        let results = detector.process(
            data.iter().map(|(l, e, t)| (l, *e, *t)),
            &mut manager,
            TimeIndex(0),
            TimeIndex(10),
            &[empty, single],
            Progress::none(),
        );
        assert!(results.is_empty());
    }

    #[test]
    fn test_custom_outlier_group_name() {
        let mut manager = EntityGroupManager::new();
        let scenario = jump_scenario(&mut manager);

        let metadata = vec![FeatureMetadata::derive(
            "line_centroid",
            2,
            FeatureTemporalType::Kinematic2D,
        )];
        let noise = NoiseConfig {
            process_noise_position: 0.05,
            process_noise_velocity: 0.05,
            measurement_noise: 1.0,
            ..Default::default()
        };
        let matrices = KalmanMatrixBuilder::build(&metadata, &noise);
        let cost = mahalanobis_cost(matrices.h.clone(), matrices.r.clone());
        let filter = KalmanFilter::new(matrices.f, matrices.h, matrices.q, matrices.r);
        let detector = OutlierDetector::new(
            Box::new(filter),
            Box::new(LineCentroidExtractor),
            cost,
            OutlierConfig {
                outlier_group_name: "suspect_frames".to_string(),
                ..Default::default()
            },
        );

        let _ = detector.process(
            scenario.data.iter().map(|(l, e, t)| (l, *e, *t)),
            &mut manager,
            TimeIndex(0),
            TimeIndex(29),
            &[scenario.group],
            Progress::none(),
        );
        assert!(manager.find_group_by_name("suspect_frames").is_some());
        assert!(manager.find_group_by_name("outlier").is_none());
    }

    #[test]
    fn test_residual_stats_variant() {
        let mut manager = EntityGroupManager::new();
        let scenario = jump_scenario(&mut manager);

        let metadata = vec![FeatureMetadata::derive(
            "line_centroid",
            2,
            FeatureTemporalType::Kinematic2D,
        )];
        let noise = NoiseConfig {
            process_noise_position: 0.05,
            process_noise_velocity: 0.05,
            measurement_noise: 1.0,
            ..Default::default()
        };
        let matrices = KalmanMatrixBuilder::build(&metadata, &noise);
        let cost = mahalanobis_cost(matrices.h.clone(), matrices.r.clone());
        let filter = KalmanFilter::new(matrices.f, matrices.h, matrices.q, matrices.r);
        let mut detector = ResidualStatsDetector::new(
            Box::new(filter),
            Box::new(LineCentroidExtractor),
            cost,
        );
        // Three outliers in 29 samples inflate sigma; 2 sigma separates them.
        detector.threshold_sigma = 2.0;

        let report = detector
            .analyze_group(
                scenario.data.iter().map(|(l, e, t)| (l, *e, *t)),
                &manager,
                scenario.group,
            )
            .unwrap();

        assert!(report.std_dev > 0.0);
        assert!(!report.flagged.is_empty());
        // The jump frames dominate the flagged set
        for hit in &report.flagged {
            assert!(scenario.jump_entities.contains(&hit.entity_id));
        }
    }
}
