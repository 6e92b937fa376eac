//! The "FILTER" layer - Block-Structured Linear Kalman Filtering
//! ==============================================================
//!
//! A single linear Kalman filter tracks the concatenated state of all
//! features of one group. The matrices (F, H, Q, R) are built block-diagonal
//! from feature metadata, so a composite of kinematic and static features
//! shares one filter instance.
//!
//! Numerical policy: innovation covariances are diagonally regularised,
//! inverses go through Cholesky first with an SVD pseudo-inverse fallback,
//! and fallbacks are recorded in the diagnostics counters.

use crate::diagnostics;
use crate::traceview_features::{FeatureMetadata, FeatureTemporalType};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Diagonal regularisation added to innovation covariances.
const INNOVATION_REG_EPS: f64 = 1e-6;
/// Relative tolerance for the SVD pseudo-inverse fallback.
const SVD_TOL_SCALE: f64 = 1e-10;

// ============================================================================
// STATE TYPES
// ============================================================================

/// Mean and covariance of a tracked state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterState {
    pub mean: DVector<f64>,
    pub covariance: DMatrix<f64>,
}

impl FilterState {
    pub fn zeros(dim: usize) -> Self {
        Self {
            mean: DVector::zeros(dim),
            covariance: DMatrix::zeros(dim, dim),
        }
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }
}

/// A measurement already converted into a feature vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub feature_vector: DVector<f64>,
}

impl Measurement {
    pub fn new(feature_vector: DVector<f64>) -> Self {
        Self { feature_vector }
    }
}

// ============================================================================
// FILTER TRAIT
// ============================================================================

/// Contract for state-estimation filters.
///
/// Only the linear Kalman implementation ships here; the trait is the seam
/// for nonlinear variants.
pub trait Filter: Send {
    /// Set the dynamic state (track birth or hard re-initialisation).
    fn initialize(&mut self, state: &FilterState);

    /// Advance one step through the motion model; returns the prior.
    fn predict(&mut self) -> FilterState;

    /// Fuse a measurement into a predicted state; returns the posterior.
    fn update(&mut self, predicted: &FilterState, measurement: &Measurement) -> FilterState;

    /// Rauch-Tung-Striebel smoothing over a chronological posterior sequence.
    /// Returns one smoothed state per input, same order.
    fn smooth(&self, forward_states: &[FilterState]) -> Vec<FilterState>;

    /// Current internal state.
    fn state(&self) -> FilterState;

    /// Duplicate the configuration (matrices), not the dynamic state.
    fn clone_box(&self) -> Box<dyn Filter>;
}

impl Clone for Box<dyn Filter> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

// ============================================================================
// ROBUST LINEAR ALGEBRA
// ============================================================================

/// Invert a symmetric positive-definite matrix, Cholesky first.
///
/// Falls back to the SVD pseudo-inverse (tolerance `1e-10 * sigma_max`) when
/// the decomposition fails, recording the event for diagnostics.
pub(crate) fn robust_spd_inverse(matrix: &DMatrix<f64>, context: &str) -> DMatrix<f64> {
    if let Some(cholesky) = matrix.clone().cholesky() {
        let inverse = cholesky.inverse();
        if inverse.iter().all(|v| v.is_finite()) {
            return inverse;
        }
    }
    diagnostics::record_cholesky_fallback(context);
    let svd = matrix.clone().svd(true, true);
    let tol = SVD_TOL_SCALE * svd.singular_values.max();
    svd.pseudo_inverse(tol)
        .unwrap_or_else(|_| DMatrix::zeros(matrix.nrows(), matrix.ncols()))
}

// ============================================================================
// LINEAR KALMAN FILTER
// ============================================================================

/// Linear Kalman filter over a fixed (F, H, Q, R) configuration.
#[derive(Debug, Clone)]
pub struct KalmanFilter {
    f: DMatrix<f64>,
    h: DMatrix<f64>,
    q: DMatrix<f64>,
    r: DMatrix<f64>,
    state: FilterState,
}

impl KalmanFilter {
    /// Build a filter from its four matrices.
    ///
    /// Dimensions must be consistent: F and Q square over the state, H
    /// mapping state to measurement, R square over the measurement.
    pub fn new(f: DMatrix<f64>, h: DMatrix<f64>, q: DMatrix<f64>, r: DMatrix<f64>) -> Self {
        let state_dim = f.nrows();
        assert_eq!(f.ncols(), state_dim, "F must be square");
        assert_eq!(q.shape(), (state_dim, state_dim), "Q must match F");
        assert_eq!(h.ncols(), state_dim, "H must map the state space");
        assert_eq!(r.shape(), (h.nrows(), h.nrows()), "R must match H rows");
        Self {
            f,
            h,
            q,
            r,
            state: FilterState::zeros(state_dim),
        }
    }

    pub fn state_dim(&self) -> usize {
        self.f.nrows()
    }

    pub fn measurement_dim(&self) -> usize {
        self.h.nrows()
    }

    pub fn measurement_matrix(&self) -> &DMatrix<f64> {
        &self.h
    }

    pub fn measurement_noise(&self) -> &DMatrix<f64> {
        &self.r
    }
}

impl Filter for KalmanFilter {
    fn initialize(&mut self, state: &FilterState) {
        self.state = state.clone();
    }

    fn predict(&mut self) -> FilterState {
        let mean = &self.f * &self.state.mean;
        let covariance = &self.f * &self.state.covariance * self.f.transpose() + &self.q;
        self.state = FilterState { mean, covariance };
        self.state.clone()
    }

    fn update(&mut self, predicted: &FilterState, measurement: &Measurement) -> FilterState {
        let z = &measurement.feature_vector;
        let innovation = z - &self.h * &predicted.mean;

        let mut s = &self.h * &predicted.covariance * self.h.transpose() + &self.r;
        for i in 0..s.nrows() {
            s[(i, i)] += INNOVATION_REG_EPS;
        }
        let s_inv = robust_spd_inverse(&s, "kalman_update");

        let gain = &predicted.covariance * self.h.transpose() * s_inv;
        let mean = &predicted.mean + &gain * innovation;
        let identity = DMatrix::identity(self.state_dim(), self.state_dim());
        let covariance = (identity - &gain * &self.h) * &predicted.covariance;

        self.state = FilterState { mean, covariance };
        self.state.clone()
    }

    fn smooth(&self, forward_states: &[FilterState]) -> Vec<FilterState> {
        if forward_states.len() < 2 {
            return forward_states.to_vec();
        }
        let n = forward_states.len();
        let mut smoothed = forward_states.to_vec();

        // Backward recursion:
        //   C_k = P_k F^T (F P_k F^T + Q)^-1
        //   x_k^s = x_k + C_k (x_{k+1}^s - F x_k)
        //   P_k^s = P_k + C_k (P_{k+1}^s - F P_k F^T - Q) C_k^T
        for k in (0..n - 1).rev() {
            let p_k = &forward_states[k].covariance;
            let predicted_cov = &self.f * p_k * self.f.transpose() + &self.q;
            let gain = p_k * self.f.transpose() * robust_spd_inverse(&predicted_cov, "rts_smooth");

            let predicted_mean = &self.f * &forward_states[k].mean;
            let mean = &forward_states[k].mean + &gain * (&smoothed[k + 1].mean - predicted_mean);
            let covariance =
                p_k + &gain * (&smoothed[k + 1].covariance - predicted_cov) * gain.transpose();
            smoothed[k] = FilterState { mean, covariance };
        }
        smoothed
    }

    fn state(&self) -> FilterState {
        self.state.clone()
    }

    fn clone_box(&self) -> Box<dyn Filter> {
        // Configuration only; the clone starts with a blank state.
        Box::new(KalmanFilter::new(
            self.f.clone(),
            self.h.clone(),
            self.q.clone(),
            self.r.clone(),
        ))
    }
}

// ============================================================================
// MATRIX BUILDER (METADATA-DRIVEN)
// ============================================================================

/// Per-feature noise configuration for the matrix builder.
///
/// Noise fields are variances. `feature_measurement_noise` overrides the
/// default measurement noise by feature name.
#[derive(Debug, Clone)]
pub struct NoiseConfig {
    /// Time step between frames.
    pub dt: f64,
    /// Process noise variance on position components.
    pub process_noise_position: f64,
    /// Process noise variance on velocity components.
    pub process_noise_velocity: f64,
    /// Scale applied to the position variance for static features.
    pub static_noise_scale: f64,
    /// Default measurement noise variance.
    pub measurement_noise: f64,
    /// Per-feature measurement noise variance, keyed by metadata name.
    pub feature_measurement_noise: HashMap<String, f64>,
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            dt: 1.0,
            process_noise_position: 10.0,
            process_noise_velocity: 1.0,
            static_noise_scale: 1.0,
            measurement_noise: 5.0,
            feature_measurement_noise: HashMap::new(),
        }
    }
}

/// Index bookkeeping for one feature inside the concatenated state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureStateIndices {
    pub name: String,
    /// Rows of this feature inside the measurement vector.
    pub measurement_indices: Vec<usize>,
    /// State positions holding the feature's observable components.
    pub position_state_indices: Vec<usize>,
    /// State positions holding the feature's rate components (empty for
    /// static features).
    pub velocity_state_indices: Vec<usize>,
}

/// Positions of every feature inside the full state vector, built once from
/// the metadata list and consumed by dynamics-aware costs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateIndexMap {
    pub features: Vec<FeatureStateIndices>,
}

/// The four filter matrices plus the index map they imply.
#[derive(Debug, Clone)]
pub struct KalmanMatrices {
    pub f: DMatrix<f64>,
    pub h: DMatrix<f64>,
    pub q: DMatrix<f64>,
    pub r: DMatrix<f64>,
    pub index_map: StateIndexMap,
}

/// Builds block-diagonal (F, H, Q, R) from feature metadata.
pub struct KalmanMatrixBuilder;

impl KalmanMatrixBuilder {
    /// Assemble the matrices for the features in declaration order.
    pub fn build(metadata: &[FeatureMetadata], config: &NoiseConfig) -> KalmanMatrices {
        let state_dim: usize = metadata.iter().map(|m| m.state_size).sum();
        let meas_dim: usize = metadata.iter().map(|m| m.measurement_size).sum();

        let mut f = DMatrix::zeros(state_dim, state_dim);
        let mut h = DMatrix::zeros(meas_dim, state_dim);
        let mut q = DMatrix::zeros(state_dim, state_dim);
        let mut r = DMatrix::zeros(meas_dim, meas_dim);
        let mut index_map = StateIndexMap::default();

        let pos_var = config.process_noise_position;
        let vel_var = config.process_noise_velocity;

        let mut s = 0; // state offset
        let mut m = 0; // measurement offset
        for meta in metadata {
            let meas_var = config
                .feature_measurement_noise
                .get(&meta.name)
                .copied()
                .unwrap_or(config.measurement_noise);

            let mut indices = FeatureStateIndices {
                name: meta.name.clone(),
                measurement_indices: (m..m + meta.measurement_size).collect(),
                position_state_indices: Vec::new(),
                velocity_state_indices: Vec::new(),
            };

            match meta.temporal_type {
                FeatureTemporalType::Static | FeatureTemporalType::Custom => {
                    let size = meta.measurement_size;
                    for i in 0..meta.state_size {
                        f[(s + i, s + i)] = 1.0;
                        q[(s + i, s + i)] = config.static_noise_scale * pos_var;
                    }
                    for i in 0..size {
                        h[(m + i, s + i)] = 1.0;
                        r[(m + i, m + i)] = meas_var;
                        indices.position_state_indices.push(s + i);
                    }
                }
                FeatureTemporalType::Kinematic2D | FeatureTemporalType::Kinematic3D => {
                    let dims = meta.measurement_size; // 2 or 3
                    for i in 0..dims {
                        // Position rows: x_i' = x_i + dt * v_i
                        f[(s + i, s + i)] = 1.0;
                        f[(s + i, s + dims + i)] = config.dt;
                        // Velocity rows
                        f[(s + dims + i, s + dims + i)] = 1.0;

                        h[(m + i, s + i)] = 1.0;
                        q[(s + i, s + i)] = pos_var;
                        q[(s + dims + i, s + dims + i)] = vel_var;
                        r[(m + i, m + i)] = meas_var;

                        indices.position_state_indices.push(s + i);
                        indices.velocity_state_indices.push(s + dims + i);
                    }
                }
                FeatureTemporalType::ScalarDynamic => {
                    for i in 0..meta.measurement_size {
                        let base = s + 2 * i;
                        f[(base, base)] = 1.0;
                        f[(base, base + 1)] = config.dt;
                        f[(base + 1, base + 1)] = 1.0;

                        h[(m + i, base)] = 1.0;
                        q[(base, base)] = pos_var;
                        q[(base + 1, base + 1)] = vel_var;
                        r[(m + i, m + i)] = meas_var;

                        indices.position_state_indices.push(base);
                        indices.velocity_state_indices.push(base + 1);
                    }
                }
            }

            index_map.features.push(indices);
            s += meta.state_size;
            m += meta.measurement_size;
        }

        KalmanMatrices { f, h, q, r, index_map }
    }

    /// Convenience: build the matrices and wrap them in a filter prototype.
    pub fn build_filter(metadata: &[FeatureMetadata], config: &NoiseConfig) -> (KalmanFilter, StateIndexMap) {
        let matrices = Self::build(metadata, config);
        (
            KalmanFilter::new(matrices.f, matrices.h, matrices.q, matrices.r),
            matrices.index_map,
        )
    }
}

// ============================================================================
// TESTS
// ============================================================================
