//! The "COST" layer - Association Costs Between Predictions and Observations
//! ==========================================================================
//!
//! Cost functions score how well an observation matches a predicted state.
//! The default is the Mahalanobis distance of the innovation under the
//! predicted measurement covariance; a plain Euclidean variant covers the
//! no-covariance case, and a dynamics-aware variant adds velocity-consistency
//! and implied-acceleration penalties for gap transitions.
//!
//! All variants share the numerical policy: regularise, Cholesky-solve
//! first, SVD pseudo-inverse fallback, and clamp non-finite results to a
//! large-but-finite sentinel so integer solvers stay stable.

use crate::diagnostics;
use crate::traceview_filter::{FilterState, StateIndexMap};
use nalgebra::{DMatrix, DVector};
use std::sync::Arc;

/// Sentinel returned when a cost cannot be computed finitely.
pub const INVALID_ASSOCIATION_COST: f64 = 1e5;

/// Diagonal regularisation for innovation covariances.
const INNOVATION_REG_EPS: f64 = 1e-6;
/// Relative tolerance of the SVD pseudo-inverse fallback.
const SVD_TOL_SCALE: f64 = 1e-10;

/// Cost signature: `(predicted state, observation vector, gap frames) -> cost`.
///
/// `gap_frames` is the frame distance the prediction spans; frame-local
/// association passes 1.
pub type CostFn = Arc<dyn Fn(&FilterState, &DVector<f64>, i64) -> f64 + Send + Sync>;

/// Squared Mahalanobis distance `r^T S^-1 r` with the shared numerical
/// policy. Returns `None` when even the pseudo-inverse path fails finitely.
fn mahalanobis_squared(innovation: &DVector<f64>, covariance: &DMatrix<f64>, context: &str) -> Option<f64> {
    let mut s = covariance.clone();
    for i in 0..s.nrows() {
        s[(i, i)] += INNOVATION_REG_EPS;
    }

    if let Some(cholesky) = s.clone().cholesky() {
        let solved = cholesky.solve(innovation);
        let dist_sq = innovation.dot(&solved);
        if dist_sq.is_finite() && dist_sq >= 0.0 {
            return Some(dist_sq);
        }
    }

    diagnostics::record_cholesky_fallback(context);
    let svd = s.svd(true, true);
    let tol = SVD_TOL_SCALE * svd.singular_values.max();
    let pinv = svd.pseudo_inverse(tol).ok()?;
    let dist_sq = innovation.dot(&(&pinv * innovation));
    (dist_sq.is_finite() && dist_sq >= 0.0).then_some(dist_sq)
}

/// Mahalanobis distance between an observation and a predicted measurement.
///
/// `H` maps the state space to the measurement space, `R` is the measurement
/// noise covariance. Public entry for one-off evaluations (the outlier
/// detector uses it directly).
pub fn mahalanobis_distance(
    predicted: &FilterState,
    observation: &DVector<f64>,
    h: &DMatrix<f64>,
    r: &DMatrix<f64>,
) -> f64 {
    let innovation = observation - h * &predicted.mean;
    let covariance = h * &predicted.covariance * h.transpose() + r;
    match mahalanobis_squared(&innovation, &covariance, "mahalanobis_cost") {
        Some(dist_sq) => dist_sq.sqrt(),
        None => {
            diagnostics::record_sentinel_cost("mahalanobis_cost");
            INVALID_ASSOCIATION_COST
        }
    }
}

/// Factory: the default Mahalanobis cost function.
pub fn mahalanobis_cost(h: DMatrix<f64>, r: DMatrix<f64>) -> CostFn {
    Arc::new(move |predicted, observation, _gap_frames| {
        mahalanobis_distance(predicted, observation, &h, &r)
    })
}

/// Factory: Euclidean distance between the observation and the projected
/// state mean. For callers without usable covariances.
pub fn euclidean_cost(h: DMatrix<f64>) -> CostFn {
    Arc::new(move |predicted, observation, _gap_frames| {
        let residual = observation - &h * &predicted.mean;
        let dist = residual.norm();
        if dist.is_finite() {
            dist
        } else {
            diagnostics::record_sentinel_cost("euclidean_cost");
            INVALID_ASSOCIATION_COST
        }
    })
}

/// Configuration for [`dynamics_aware_cost`].
#[derive(Debug, Clone)]
pub struct DynamicsCostConfig {
    /// Time step per frame.
    pub dt: f64,
    /// Weight of the velocity-consistency term.
    pub beta: f64,
    /// Weight of the implied-acceleration penalty.
    pub gamma: f64,
    /// Linear per-gap-frame penalty; 0 disables it.
    pub lambda_gap: f64,
}

impl Default for DynamicsCostConfig {
    fn default() -> Self {
        Self {
            dt: 1.0,
            beta: 1.0,
            gamma: 0.25,
            lambda_gap: 0.0,
        }
    }
}

/// Factory: gap-transition cost with velocity-consistency and
/// implied-acceleration penalties.
///
/// For each kinematic feature the observation implies a velocity
/// `v_impl = (z_pos - x_pred_pos) / (gap * dt)` and an acceleration
/// `a_impl = 2 (z_pos - x_pred_pos) / (gap * dt)^2`; the cost sums
/// `beta * 0.5 * (v_impl - v_pred)^T Sigma_v^-1 (v_impl - v_pred)` and
/// `gamma * 0.5 * |a_impl|^2`, plus an optional linear gap penalty.
pub fn dynamics_aware_cost(index_map: StateIndexMap, config: DynamicsCostConfig) -> CostFn {
    const MIN_DT: f64 = 1e-9;
    Arc::new(move |predicted, observation, gap_frames| {
        if gap_frames <= 0 {
            return 0.0;
        }
        let gap_dt = gap_frames as f64 * config.dt.max(MIN_DT);

        let gather = |v: &DVector<f64>, idx: &[usize]| -> DVector<f64> {
            DVector::from_iterator(idx.len(), idx.iter().map(|&i| v[i]))
        };
        let gather_cov = |m: &DMatrix<f64>, idx: &[usize]| -> DMatrix<f64> {
            DMatrix::from_fn(idx.len(), idx.len(), |r, c| m[(idx[r], idx[c])])
        };

        let mut cost = 0.0;
        for feature in &index_map.features {
            if feature.velocity_state_indices.is_empty() || feature.position_state_indices.is_empty() {
                continue;
            }
            let x_pred_pos = gather(&predicted.mean, &feature.position_state_indices);
            let v_pred = gather(&predicted.mean, &feature.velocity_state_indices);
            let z_pos = gather(observation, &feature.measurement_indices);

            let displacement = &z_pos - &x_pred_pos;

            // Velocity consistency under the predicted velocity covariance
            let v_impl = &displacement / gap_dt;
            let sigma_v = gather_cov(&predicted.covariance, &feature.velocity_state_indices);
            let residual = v_impl - v_pred;
            match mahalanobis_squared(&residual, &sigma_v, "dynamics_cost") {
                Some(dist_sq) => cost += config.beta * 0.5 * dist_sq,
                None => {
                    diagnostics::record_sentinel_cost("dynamics_cost");
                    cost += INVALID_ASSOCIATION_COST;
                }
            }

            // Implied acceleration toward zero
            let a_impl = &displacement * (2.0 / (gap_dt * gap_dt));
            cost += config.gamma * 0.5 * a_impl.norm_squared();
        }

        if config.lambda_gap > 0.0 {
            cost += config.lambda_gap * gap_frames as f64;
        }
        cost
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traceview_features::{FeatureMetadata, FeatureTemporalType};
    use crate::traceview_filter::{KalmanMatrixBuilder, NoiseConfig};
    use approx::assert_relative_eq;

    fn unit_state_2d() -> FilterState {
        FilterState {
            mean: DVector::zeros(2),
            covariance: DMatrix::identity(2, 2),
        }
    }

    #[test]
    fn test_mahalanobis_reference_value() {
        // H = I, R = I, P = I, mean 0, observation (1, 0):
        // S = 2I, d^2 = 0.5, cost = sqrt(0.5)
        let state = unit_state_2d();
        let h = DMatrix::identity(2, 2);
        let r = DMatrix::identity(2, 2);
        let observation = DVector::from_vec(vec![1.0, 0.0]);
        let cost = mahalanobis_distance(&state, &observation, &h, &r);
        assert_relative_eq!(cost, 0.5f64.sqrt(), epsilon = 1e-3);
    }

    #[test]
    fn test_mahalanobis_zero_at_mean() {
        let state = unit_state_2d();
        let h = DMatrix::identity(2, 2);
        let r = DMatrix::identity(2, 2);
        let cost = mahalanobis_distance(&state, &DVector::zeros(2), &h, &r);
        assert_relative_eq!(cost, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_mahalanobis_scales_with_uncertainty() {
        let h = DMatrix::identity(2, 2);
        let r = DMatrix::identity(2, 2);
        let observation = DVector::from_vec(vec![4.0, 0.0]);

        let tight = unit_state_2d();
        let loose = FilterState {
            mean: DVector::zeros(2),
            covariance: DMatrix::identity(2, 2) * 100.0,
        };
        let tight_cost = mahalanobis_distance(&tight, &observation, &h, &r);
        let loose_cost = mahalanobis_distance(&loose, &observation, &h, &r);
        assert!(loose_cost < tight_cost, "looser prior discounts the residual");
    }

    #[test]
    fn test_singular_covariance_stays_finite() {
        let state = FilterState {
            mean: DVector::zeros(2),
            covariance: DMatrix::zeros(2, 2),
        };
        let h = DMatrix::identity(2, 2);
        let r = DMatrix::zeros(2, 2);
        let cost = mahalanobis_distance(&state, &DVector::from_vec(vec![1.0, 1.0]), &h, &r);
        assert!(cost.is_finite());
    }

    #[test]
    fn test_cost_fn_factories() {
        let h = DMatrix::identity(2, 2);
        let r = DMatrix::identity(2, 2);
        let maha = mahalanobis_cost(h.clone(), r);
        let eucl = euclidean_cost(h);

        let state = unit_state_2d();
        let observation = DVector::from_vec(vec![3.0, 4.0]);
        assert_relative_eq!(eucl(&state, &observation, 1), 5.0, epsilon = 1e-9);
        assert!(maha(&state, &observation, 1) > 0.0);
    }

    #[test]
    fn test_dynamics_aware_cost_prefers_consistent_motion() {
        let metadata = vec![FeatureMetadata::derive(
            "pos",
            2,
            FeatureTemporalType::Kinematic2D,
        )];
        let matrices = KalmanMatrixBuilder::build(&metadata, &NoiseConfig::default());
        let cost = dynamics_aware_cost(matrices.index_map, DynamicsCostConfig::default());

        // Predicted at origin moving +1/frame in x
        let predicted = FilterState {
            mean: DVector::from_vec(vec![0.0, 0.0, 1.0, 0.0]),
            covariance: DMatrix::identity(4, 4),
        };
        // After a 5-frame gap, the consistent observation sits at x = 5
        let consistent = DVector::from_vec(vec![5.0, 0.0]);
        let inconsistent = DVector::from_vec(vec![-5.0, 0.0]);
        assert!(cost(&predicted, &consistent, 5) < cost(&predicted, &inconsistent, 5));
        // Zero-gap transitions cost nothing
        assert_relative_eq!(cost(&predicted, &consistent, 0), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_dynamics_gap_penalty() {
        let metadata = vec![FeatureMetadata::derive(
            "pos",
            2,
            FeatureTemporalType::Kinematic2D,
        )];
        let matrices = KalmanMatrixBuilder::build(&metadata, &NoiseConfig::default());
        let config = DynamicsCostConfig {
            lambda_gap: 1.0,
            ..Default::default()
        };
        let cost = dynamics_aware_cost(matrices.index_map, config);
        let predicted = FilterState {
            mean: DVector::from_vec(vec![0.0, 0.0, 0.0, 0.0]),
            covariance: DMatrix::identity(4, 4),
        };
        let at_mean = DVector::from_vec(vec![0.0, 0.0]);
        assert!(cost(&predicted, &at_mean, 10) > cost(&predicted, &at_mean, 1));
    }
}
