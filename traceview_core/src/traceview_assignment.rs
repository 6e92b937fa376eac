//! The "ASSIGNMENT" layer - Frame-Local Data Association
//! ======================================================
//!
//! Given the predicted states of the active groups and the unclaimed
//! observations of one frame, the assigner produces a partial injective map
//! observation -> prediction minimising total Mahalanobis cost under a
//! gating threshold. The solver is an integer Munkres/Hungarian on a padded
//! square cost matrix; the infeasible sentinel is finite and strictly above
//! every feasible scaled cost so the integer solver never sees infinities.
//!
//! Determinism: rows (observations) are inserted in index order and column
//! improvements use strict comparison, so equal-cost ties resolve to the
//! smaller observation index first, then the smaller prediction index.

use crate::traceview_cost::{mahalanobis_distance, INVALID_ASSOCIATION_COST};
use crate::traceview_entity::EntityId;
use crate::traceview_features::FeatureCache;
use crate::traceview_filter::FilterState;
use crate::traceview_groups::GroupId;
use nalgebra::DMatrix;
use std::collections::{BTreeMap, HashMap};
use tracing::error;

// ============================================================================
// PROBLEM TYPES
// ============================================================================

/// A predicted state for one tracked group, ready for assignment.
#[derive(Debug, Clone)]
pub struct Prediction {
    pub group_id: GroupId,
    pub state: FilterState,
}

/// An unassigned observation in the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservationRef {
    pub entity_id: EntityId,
}

/// Result of the assignment: observation index -> prediction index.
/// Observations without an entry stayed unassigned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assignment {
    pub observation_to_prediction: BTreeMap<usize, usize>,
}

/// Contract for data-association solvers.
pub trait Assigner: Send {
    /// Solve one frame's association problem. Feature vectors come from the
    /// per-frame cache keyed by observation entity id.
    fn solve(
        &self,
        predictions: &[Prediction],
        observations: &[ObservationRef],
        feature_cache: &HashMap<EntityId, FeatureCache>,
    ) -> Assignment;

    /// Independent copy with the same configuration (solvers are stateless).
    fn clone_box(&self) -> Box<dyn Assigner>;
}

impl Clone for Box<dyn Assigner> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

// ============================================================================
// MUNKRES CORE
// ============================================================================

/// Minimum-cost perfect matching on a square integer matrix.
///
/// Potentials formulation of the Hungarian algorithm, O(n^3). Returns, for
/// each row, the column it is matched to. Costs must be small enough that
/// n * max_cost fits in i64 (the callers scale and clamp accordingly).
pub(crate) fn hungarian_minimize(cost: &[Vec<i64>]) -> Vec<usize> {
    let n = cost.len();
    if n == 0 {
        return Vec::new();
    }
    debug_assert!(cost.iter().all(|row| row.len() == n), "matrix must be square");

    // 1-based potentials over rows (u) and columns (v); p[j] is the row
    // matched to column j, 0 meaning unmatched.
    let mut u = vec![0i64; n + 1];
    let mut v = vec![0i64; n + 1];
    let mut p = vec![0usize; n + 1];
    let mut way = vec![0usize; n + 1];

    for i in 1..=n {
        p[0] = i;
        let mut j0 = 0usize;
        let mut minv = vec![i64::MAX; n + 1];
        let mut used = vec![false; n + 1];
        loop {
            used[j0] = true;
            let i0 = p[j0];
            let mut delta = i64::MAX;
            let mut j1 = 0usize;
            for j in 1..=n {
                if used[j] {
                    continue;
                }
                let cur = cost[i0 - 1][j - 1] - u[i0] - v[j];
                if cur < minv[j] {
                    minv[j] = cur;
                    way[j] = j0;
                }
                if minv[j] < delta {
                    delta = minv[j];
                    j1 = j;
                }
            }
            for j in 0..=n {
                if used[j] {
                    u[p[j]] += delta;
                    v[j] -= delta;
                } else {
                    minv[j] -= delta;
                }
            }
            j0 = j1;
            if p[j0] == 0 {
                break;
            }
        }
        loop {
            let j1 = way[j0];
            p[j0] = p[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut row_to_col = vec![0usize; n];
    for j in 1..=n {
        if p[j] > 0 {
            row_to_col[p[j] - 1] = j - 1;
        }
    }
    row_to_col
}

// ============================================================================
// HUNGARIAN ASSIGNER
// ============================================================================

/// Munkres-based assigner scoring pairs by Mahalanobis distance.
#[derive(Debug, Clone)]
pub struct HungarianAssigner {
    /// Gating threshold: pairs at or above this distance are infeasible.
    max_assignment_distance: f64,
    /// Measurement matrix H (state space -> measurement space).
    h: DMatrix<f64>,
    /// Measurement noise covariance R.
    r: DMatrix<f64>,
    /// Cache key of the feature vector to score against.
    feature_name: String,
    /// Multiplier converting float distances to integer costs.
    cost_scaling_factor: f64,
}

impl HungarianAssigner {
    pub fn new(
        max_assignment_distance: f64,
        h: DMatrix<f64>,
        r: DMatrix<f64>,
        feature_name: impl Into<String>,
    ) -> Self {
        Self {
            max_assignment_distance,
            h,
            r,
            feature_name: feature_name.into(),
            cost_scaling_factor: 1000.0,
        }
    }

    pub fn with_cost_scaling(mut self, factor: f64) -> Self {
        self.cost_scaling_factor = factor;
        self
    }
}

impl Assigner for HungarianAssigner {
    fn solve(
        &self,
        predictions: &[Prediction],
        observations: &[ObservationRef],
        feature_cache: &HashMap<EntityId, FeatureCache>,
    ) -> Assignment {
        if predictions.is_empty() || observations.is_empty() {
            return Assignment::default();
        }

        let max_cost = (self.max_assignment_distance * self.cost_scaling_factor) as i64;
        // Finite sentinel strictly above every feasible cost, shared by the
        // padding cells. Clamped so row sums stay far from i64 overflow.
        let sentinel = max_cost
            .max((INVALID_ASSOCIATION_COST * self.cost_scaling_factor) as i64)
            .saturating_add(1);

        let n = observations.len().max(predictions.len());
        let mut cost_matrix = vec![vec![sentinel; n]; n];

        for (i, observation) in observations.iter().enumerate() {
            let feature = feature_cache
                .get(&observation.entity_id)
                .and_then(|cache| cache.get(&self.feature_name));
            let Some(observation_vec) = feature else {
                error!(
                    entity = observation.entity_id.0,
                    feature = %self.feature_name,
                    "feature missing from cache; observation left unassigned"
                );
                continue;
            };
            for (j, prediction) in predictions.iter().enumerate() {
                let distance =
                    mahalanobis_distance(&prediction.state, observation_vec, &self.h, &self.r);
                let scaled = (distance * self.cost_scaling_factor) as i64;
                if scaled < max_cost {
                    cost_matrix[i][j] = scaled;
                }
            }
        }

        let row_to_col = hungarian_minimize(&cost_matrix);

        let mut result = Assignment::default();
        for (i, &j) in row_to_col.iter().enumerate().take(observations.len()) {
            if j < predictions.len() && cost_matrix[i][j] < max_cost {
                result.observation_to_prediction.insert(i, j);
            }
        }
        result
    }

    fn clone_box(&self) -> Box<dyn Assigner> {
        Box::new(self.clone())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DVector;

    fn state_at(x: f64, y: f64) -> FilterState {
        FilterState {
            mean: DVector::from_vec(vec![x, y]),
            covariance: DMatrix::identity(2, 2),
        }
    }

    fn cache_with(points: &[(EntityId, f64, f64)]) -> HashMap<EntityId, FeatureCache> {
        let mut cache = HashMap::new();
        for &(id, x, y) in points {
            let mut features = FeatureCache::new();
            features.insert("pos".to_string(), DVector::from_vec(vec![x, y]));
            cache.insert(id, features);
        }
        cache
    }

    fn assigner(gate: f64) -> HungarianAssigner {
        HungarianAssigner::new(gate, DMatrix::identity(2, 2), DMatrix::identity(2, 2), "pos")
    }

    #[test]
    fn test_hungarian_minimize_classic() {
        // Classic 3x3: optimal assignment is the anti-diagonal, cost 10
        let cost = vec![
            vec![4, 1, 3],
            vec![2, 0, 5],
            vec![3, 2, 2],
        ];
        let row_to_col = hungarian_minimize(&cost);
        let total: i64 = row_to_col.iter().enumerate().map(|(i, &j)| cost[i][j]).sum();
        assert_eq!(total, 5);
        // Perfect matching: all columns distinct
        let mut cols = row_to_col.clone();
        cols.sort_unstable();
        cols.dedup();
        assert_eq!(cols.len(), 3);
    }

    #[test]
    fn test_hungarian_minimize_identity_case() {
        let cost = vec![vec![0, 9], vec![9, 0]];
        assert_eq!(hungarian_minimize(&cost), vec![0, 1]);
    }

    #[test]
    fn test_solve_matches_nearest() {
        let predictions = vec![
            Prediction { group_id: 1, state: state_at(0.0, 0.0) },
            Prediction { group_id: 2, state: state_at(10.0, 0.0) },
        ];
        let observations = vec![
            ObservationRef { entity_id: EntityId(101) },
            ObservationRef { entity_id: EntityId(102) },
        ];
        // Observation 101 near prediction 2, observation 102 near prediction 1
        let cache = cache_with(&[(EntityId(101), 9.5, 0.0), (EntityId(102), 0.5, 0.0)]);

        let result = assigner(10.0).solve(&predictions, &observations, &cache);
        assert_eq!(result.observation_to_prediction.get(&0), Some(&1));
        assert_eq!(result.observation_to_prediction.get(&1), Some(&0));
    }

    #[test]
    fn test_gating_leaves_far_observations_unassigned() {
        let predictions = vec![Prediction { group_id: 1, state: state_at(0.0, 0.0) }];
        let observations = vec![
            ObservationRef { entity_id: EntityId(101) },
            ObservationRef { entity_id: EntityId(102) },
        ];
        let cache = cache_with(&[(EntityId(101), 0.1, 0.0), (EntityId(102), 500.0, 0.0)]);

        let result = assigner(5.0).solve(&predictions, &observations, &cache);
        assert_eq!(result.observation_to_prediction.len(), 1);
        assert_eq!(result.observation_to_prediction.get(&0), Some(&0));
        assert!(!result.observation_to_prediction.contains_key(&1));
    }

    #[test]
    fn test_rectangular_more_observations_than_predictions() {
        let predictions = vec![Prediction { group_id: 1, state: state_at(0.0, 0.0) }];
        let observations: Vec<ObservationRef> = (0..4)
            .map(|i| ObservationRef { entity_id: EntityId(100 + i) })
            .collect();
        let cache = cache_with(&[
            (EntityId(100), 3.0, 0.0),
            (EntityId(101), 1.0, 0.0),
            (EntityId(102), 2.0, 0.0),
            (EntityId(103), 4.0, 0.0),
        ]);

        let result = assigner(10.0).solve(&predictions, &observations, &cache);
        // Only the cheapest observation claims the single prediction
        assert_eq!(result.observation_to_prediction.len(), 1);
        assert_eq!(result.observation_to_prediction.get(&1), Some(&0));
    }

    #[test]
    fn test_equal_cost_tie_prefers_smaller_observation_index() {
        let predictions = vec![Prediction { group_id: 1, state: state_at(0.0, 0.0) }];
        let observations = vec![
            ObservationRef { entity_id: EntityId(101) },
            ObservationRef { entity_id: EntityId(102) },
        ];
        // Symmetric observations at identical distance
        let cache = cache_with(&[(EntityId(101), 1.0, 0.0), (EntityId(102), -1.0, 0.0)]);

        let result = assigner(10.0).solve(&predictions, &observations, &cache);
        assert_eq!(result.observation_to_prediction.len(), 1);
        assert_eq!(result.observation_to_prediction.get(&0), Some(&0));
    }

    #[test]
    fn test_empty_inputs() {
        let result = assigner(10.0).solve(&[], &[], &HashMap::new());
        assert!(result.observation_to_prediction.is_empty());
    }

    #[test]
    fn test_missing_feature_is_unassigned_not_fatal() {
        let predictions = vec![Prediction { group_id: 1, state: state_at(0.0, 0.0) }];
        let observations = vec![ObservationRef { entity_id: EntityId(7) }];
        let result = assigner(10.0).solve(&predictions, &observations, &HashMap::new());
        assert!(result.observation_to_prediction.is_empty());
    }

    #[test]
    fn test_clone_box_same_config() {
        let original = assigner(10.0);
        let cloned = original.clone_box();
        let predictions = vec![Prediction { group_id: 1, state: state_at(0.0, 0.0) }];
        let observations = vec![ObservationRef { entity_id: EntityId(101) }];
        let cache = cache_with(&[(EntityId(101), 0.5, 0.0)]);
        assert_eq!(
            original.solve(&predictions, &observations, &cache),
            cloned.solve(&predictions, &observations, &cache)
        );
    }
}
