//! TraceView Core - Session Kernel for Time-Indexed Geometric Data
//! ================================================================
//!
//! A session-scoped data management and analysis kernel built around four
//! pillars:
//! 1. **Entity Substrate**: stable identifiers, groupings, and sparse
//!    directed relationships across heterogeneous time-series containers.
//! 2. **State Estimation**: pluggable feature extraction, a metadata-driven
//!    block-structured linear Kalman filter with RTS smoothing, and
//!    Hungarian data association.
//! 3. **Trackers**: iterative smoothing with identity-consistency checks,
//!    and global min-cost-flow tracking between ground-truth anchors.
//! 4. **Transforms**: a type-dispatched operation pipeline producing derived
//!    time series (intervals from group presence, outlier flags, boolean
//!    interval algebra, peak events).

pub mod diagnostics;
pub mod observer;
pub mod progress;
pub mod traceview_anchors;
pub mod traceview_assignment;
pub mod traceview_cost;
pub mod traceview_entity;
pub mod traceview_features;
pub mod traceview_filter;
pub mod traceview_flow;
pub mod traceview_groups;
pub mod traceview_interval_ops;
pub mod traceview_outlier;
pub mod traceview_relations;
pub mod traceview_series;
pub mod traceview_session;
pub mod traceview_time;
pub mod traceview_tracking;
pub mod traceview_transforms;
pub mod validation;

// Re-export key types for convenience
pub use observer::{Notify, ObserverHandle, ObserverRegistry};
pub use progress::Progress;
pub use traceview_anchors::{FlowNode, FlowPath, GroundTruthSegment, MetaNode};
pub use traceview_assignment::{Assigner, Assignment, HungarianAssigner, ObservationRef, Prediction};
pub use traceview_cost::{
    dynamics_aware_cost, euclidean_cost, mahalanobis_cost, CostFn, DynamicsCostConfig,
};
pub use traceview_entity::{EntityId, EntityKey, EntityKind, EntityRegistry};
pub use traceview_features::{
    CompositeFeatureExtractor, FeatureCache, FeatureExtractor, FeatureMetadata,
    FeatureTemporalType, LineBasePointExtractor, LineCentroidExtractor, LineLengthExtractor,
};
pub use traceview_filter::{
    Filter, FilterState, KalmanFilter, KalmanMatrixBuilder, Measurement, NoiseConfig,
    StateIndexMap,
};
pub use traceview_flow::{FlowProcessOptions, FlowTrackerConfig, MinCostFlowTracker};
pub use traceview_groups::{EntityGroupManager, GroupDescriptor, GroupId, INVALID_GROUP};
pub use traceview_outlier::{OutlierConfig, OutlierDetector, OutlierHit, ResidualStatsDetector};
pub use traceview_relations::{EntityRelationship, EntityRelationshipManager, RelationshipType};
pub use traceview_series::{
    AnalogSeries, EventSeries, Interval, IntervalSeries, Line2, LineSeries, Mask2, MaskSeries,
    Point2, PointSeries, RaggedSeries, SeriesEntry,
};
pub use traceview_session::Session;
pub use traceview_time::{IndexRounding, TimeFrame, TimeIndex};
pub use traceview_tracking::{KalmanTracker, SmoothedResults, TrackerConfig};
pub use traceview_transforms::{
    DataKind, DataVariant, TransformContext, TransformOp, TransformParams, TransformRegistry,
};
pub use validation::{validate_ground_truth, GroundTruthError, GroundTruthMap};
