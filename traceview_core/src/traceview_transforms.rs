//! The "TRANSFORMS" layer - Type-Dispatched Operation Pipeline
//! ============================================================
//!
//! Analyses are exposed as uniformly-invoked operations over a tagged union
//! of container handles: `(input variant, parameters) -> output variant`,
//! with an optional progress callback. Operations never mutate their inputs;
//! outputs are fresh handles. Group-writing operations receive the session's
//! group manager through the execution context.
//!
//! Parameter mismatches fall back to the operation's defaults with a
//! warning; null/missing inputs echo the input or produce an empty output of
//! the appropriate type.

use crate::progress::Progress;
use crate::traceview_groups::EntityGroupManager;
use crate::traceview_interval_ops::{
    BooleanIntervalParams, BooleanIntervalsOp, GroupToIntervalsOp, GroupToIntervalsParams,
    IndexGroupingOp, IndexGroupingParams, IntervalGroupingOp, IntervalGroupingParams,
    IntervalPeakParams, IntervalPeaksOp,
};
use crate::traceview_series::{
    AnalogSeries, EventSeries, IntervalSeries, LineSeries, MaskSeries, PointSeries,
};
use std::sync::Arc;

// ============================================================================
// DATA VARIANT
// ============================================================================

/// Type tag for the variant alternatives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    Points,
    Lines,
    Masks,
    Analog,
    Events,
    Intervals,
    Empty,
}

/// Tagged union of container handles flowing through the pipeline.
#[derive(Debug, Clone)]
pub enum DataVariant {
    Points(Arc<PointSeries>),
    Lines(Arc<LineSeries>),
    Masks(Arc<MaskSeries>),
    Analog(Arc<AnalogSeries>),
    Events(Arc<EventSeries>),
    Intervals(Arc<IntervalSeries>),
    /// Absent result; produced by failed operations.
    Empty,
}

impl DataVariant {
    pub fn kind(&self) -> DataKind {
        match self {
            DataVariant::Points(_) => DataKind::Points,
            DataVariant::Lines(_) => DataKind::Lines,
            DataVariant::Masks(_) => DataKind::Masks,
            DataVariant::Analog(_) => DataKind::Analog,
            DataVariant::Events(_) => DataKind::Events,
            DataVariant::Intervals(_) => DataKind::Intervals,
            DataVariant::Empty => DataKind::Empty,
        }
    }

    pub fn as_lines(&self) -> Option<&Arc<LineSeries>> {
        match self {
            DataVariant::Lines(series) => Some(series),
            _ => None,
        }
    }

    pub fn as_intervals(&self) -> Option<&Arc<IntervalSeries>> {
        match self {
            DataVariant::Intervals(series) => Some(series),
            _ => None,
        }
    }

    pub fn as_analog(&self) -> Option<&Arc<AnalogSeries>> {
        match self {
            DataVariant::Analog(series) => Some(series),
            _ => None,
        }
    }

    pub fn as_events(&self) -> Option<&Arc<EventSeries>> {
        match self {
            DataVariant::Events(series) => Some(series),
            _ => None,
        }
    }
}

// ============================================================================
// PARAMETERS & CONTEXT
// ============================================================================

/// Closed set of operation parameters.
#[derive(Debug, Clone, Default)]
pub enum TransformParams {
    /// No parameters supplied; the operation uses its defaults.
    #[default]
    None,
    GroupToIntervals(GroupToIntervalsParams),
    IndexGrouping(IndexGroupingParams),
    BooleanIntervals(BooleanIntervalParams),
    IntervalGrouping(IntervalGroupingParams),
    IntervalPeaks(IntervalPeakParams),
}

/// Session facilities an operation may need beyond its input variant.
#[derive(Default)]
pub struct TransformContext<'a> {
    /// Group manager for operations that read or write memberships.
    pub group_manager: Option<&'a mut EntityGroupManager>,
}

impl<'a> TransformContext<'a> {
    pub fn with_groups(group_manager: &'a mut EntityGroupManager) -> Self {
        Self {
            group_manager: Some(group_manager),
        }
    }
}

/// Resolve operation parameters: the matching variant is used, `None` means
/// "use defaults", and any other variant falls back to defaults with a
/// warning.
pub(crate) fn resolve_params<P>(
    params: &TransformParams,
    extract: impl Fn(&TransformParams) -> Option<P>,
    default: impl Fn() -> P,
    op_name: &str,
) -> P {
    if matches!(params, TransformParams::None) {
        return default();
    }
    match extract(params) {
        Some(resolved) => resolved,
        None => {
            tracing::warn!(operation = op_name, "incompatible parameter type; using defaults");
            default()
        }
    }
}

// ============================================================================
// OPERATION TRAIT
// ============================================================================

/// One pipeline operation.
pub trait TransformOp {
    /// Introspection name.
    fn name(&self) -> &str;

    /// The variant alternative this operation accepts.
    fn target_input_kind(&self) -> DataKind;

    /// Type match plus non-null check.
    fn can_apply(&self, input: &DataVariant) -> bool {
        input.kind() == self.target_input_kind()
    }

    /// Operation-specific defaults.
    fn default_params(&self) -> TransformParams;

    /// Run the operation. Must accept `Progress::none()` and reach 100
    /// before returning, on every path.
    fn execute(
        &self,
        input: &DataVariant,
        params: &TransformParams,
        ctx: &mut TransformContext<'_>,
        progress: Progress<'_>,
    ) -> DataVariant;
}

// ============================================================================
// REGISTRY
// ============================================================================

/// The built-in operations, uniformly invocable and stageable by callers.
pub struct TransformRegistry {
    operations: Vec<Box<dyn TransformOp>>,
}

impl Default for TransformRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self {
            operations: vec![
                Box::new(GroupToIntervalsOp),
                Box::new(IndexGroupingOp),
                Box::new(BooleanIntervalsOp),
                Box::new(IntervalGroupingOp),
                Box::new(IntervalPeaksOp),
            ],
        }
    }

    pub fn operations(&self) -> &[Box<dyn TransformOp>] {
        &self.operations
    }

    pub fn find(&self, name: &str) -> Option<&dyn TransformOp> {
        self.operations
            .iter()
            .find(|op| op.name() == name)
            .map(Box::as_ref)
    }

    /// Operations whose input type matches the variant.
    pub fn applicable(&self, input: &DataVariant) -> Vec<&dyn TransformOp> {
        self.operations
            .iter()
            .filter(|op| op.can_apply(input))
            .map(Box::as_ref)
            .collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traceview_series::Interval;

    #[test]
    fn test_variant_kinds() {
        let intervals = DataVariant::Intervals(Arc::new(IntervalSeries::from_intervals(vec![
            Interval::new(0, 5),
        ])));
        assert_eq!(intervals.kind(), DataKind::Intervals);
        assert!(intervals.as_intervals().is_some());
        assert!(intervals.as_lines().is_none());
        assert_eq!(DataVariant::Empty.kind(), DataKind::Empty);
    }

    #[test]
    fn test_registry_lookup_and_dispatch() {
        let registry = TransformRegistry::new();
        assert!(registry.operations().len() >= 5);

        let op = registry.find("Group To Intervals").unwrap();
        assert_eq!(op.target_input_kind(), DataKind::Lines);
        assert!(registry.find("No Such Operation").is_none());

        let lines = DataVariant::Lines(Arc::new(LineSeries::new()));
        let applicable = registry.applicable(&lines);
        assert!(applicable.iter().any(|op| op.name() == "Group To Intervals"));
        assert!(applicable.iter().any(|op| op.name() == "Group By Index"));
        assert!(!applicable.iter().any(|op| op.name() == "Boolean Intervals"));
    }

    #[test]
    fn test_can_apply_rejects_wrong_kind() {
        let registry = TransformRegistry::new();
        let op = registry.find("Boolean Intervals").unwrap();
        assert!(!op.can_apply(&DataVariant::Lines(Arc::new(LineSeries::new()))));
        assert!(op.can_apply(&DataVariant::Intervals(Arc::new(IntervalSeries::new()))));
        assert!(!op.can_apply(&DataVariant::Empty));
    }
}
