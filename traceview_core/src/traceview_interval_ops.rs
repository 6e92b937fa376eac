//! The "INTERVAL OPS" layer - Grouping and Interval Transforms
//! ============================================================
//!
//! Concrete pipeline operations over the session containers:
//!
//! - group presence/absence -> digital intervals, with gap merging and
//!   minimum-length filtering
//! - index grouping: entities at local index `i` join group `i`
//! - boolean interval algebra (AND / OR / XOR / AND-NOT / NOT), with
//!   cross-coordinate-system conversion of the second operand
//! - interval grouping by maximum spacing
//! - analog peak detection within (or between the starts of) intervals

use crate::progress::Progress;
use crate::traceview_entity::EntityId;
use crate::traceview_groups::{EntityGroupManager, GroupId, INVALID_GROUP};
use crate::traceview_series::{
    AnalogSeries, EventSeries, Interval, IntervalSeries, RaggedSeries,
};
use crate::traceview_time::{IndexRounding, TimeIndex};
use crate::traceview_transforms::{
    resolve_params, DataKind, DataVariant, TransformContext, TransformOp, TransformParams,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, warn};

// ============================================================================
// GROUP -> INTERVALS
// ============================================================================

/// Parameters for converting group presence/absence into intervals.
#[derive(Debug, Clone)]
pub struct GroupToIntervalsParams {
    /// Group whose presence is tracked across frames.
    pub target_group_id: GroupId,
    /// true: intervals where the group IS present; false: where it is absent.
    pub track_presence: bool,
    /// Intervals shorter than this are dropped.
    pub min_interval_length: i64,
    /// Adjacent intervals separated by a gap at or below this are merged.
    pub merge_gap_threshold: i64,
}

impl Default for GroupToIntervalsParams {
    fn default() -> Self {
        Self {
            target_group_id: INVALID_GROUP,
            track_presence: true,
            min_interval_length: 1,
            merge_gap_threshold: 1,
        }
    }
}

fn merge_intervals(intervals: Vec<Interval>, gap_threshold: i64) -> Vec<Interval> {
    let mut merged: Vec<Interval> = Vec::with_capacity(intervals.len());
    for interval in intervals {
        match merged.last_mut() {
            Some(last) if interval.start - last.end <= gap_threshold => {
                last.end = last.end.max(interval.end);
            }
            _ => merged.push(interval),
        }
    }
    merged
}

fn filter_by_length(intervals: Vec<Interval>, min_length: i64) -> Vec<Interval> {
    intervals
        .into_iter()
        .filter(|interval| interval.length() >= min_length)
        .collect()
}

/// Build presence (or absence) intervals of a group over a ragged series.
///
/// Frames are the series' frames-with-data, in order; runs of consecutive
/// active frames become intervals, then merging and length filtering apply.
/// `None` signals failure (invalid or unknown group); an empty group yields
/// an empty series (success).
pub fn group_presence_to_intervals<T>(
    series: &RaggedSeries<T>,
    group_manager: &EntityGroupManager,
    params: &GroupToIntervalsParams,
    progress: &mut Progress<'_>,
) -> Option<IntervalSeries> {
    if params.target_group_id == INVALID_GROUP {
        error!("group presence: invalid target group id 0");
        return None;
    }
    if !group_manager.has_group(params.target_group_id) {
        error!(group = params.target_group_id, "group presence: unknown group");
        return None;
    }
    progress.report(0);

    let members: HashSet<EntityId> = group_manager
        .entities_in_group(params.target_group_id)
        .into_iter()
        .collect();
    let mut result = IntervalSeries::new();
    if let Some(frame) = series.time_frame() {
        result.set_time_frame(Arc::clone(frame));
    }
    if members.is_empty() {
        progress.finish();
        return Some(result);
    }

    let times = series.times_with_data();
    if times.is_empty() {
        progress.finish();
        return Some(result);
    }
    progress.report(10);

    let mut active = Vec::with_capacity(times.len());
    for (index, &time) in times.iter().enumerate() {
        let has_member = series
            .entity_ids_at_time(time)
            .iter()
            .any(|entity| members.contains(entity));
        active.push(if params.track_presence {
            has_member
        } else {
            !has_member
        });
        if index % 100 == 0 {
            progress.report(10 + ((index * 60) / times.len()) as i32);
        }
    }
    progress.report(70);

    // Runs of consecutive active frames.
    let mut intervals = Vec::new();
    let mut run_start: Option<i64> = None;
    for (index, &time) in times.iter().enumerate() {
        if active[index] {
            if run_start.is_none() {
                run_start = Some(time.value());
            }
        } else if let Some(start) = run_start.take() {
            intervals.push(Interval::new(start, times[index - 1].value()));
        }
    }
    if let Some(start) = run_start {
        intervals.push(Interval::new(start, times.last().unwrap().value()));
    }
    progress.report(80);

    if params.merge_gap_threshold > 1 {
        intervals = merge_intervals(intervals, params.merge_gap_threshold);
    }
    progress.report(90);
    if params.min_interval_length > 1 {
        intervals = filter_by_length(intervals, params.min_interval_length);
    }

    debug!(
        group = params.target_group_id,
        intervals = intervals.len(),
        "group presence intervals built"
    );
    for interval in intervals {
        result.add_interval(interval);
    }
    progress.finish();
    Some(result)
}

/// Operation wrapper over [`group_presence_to_intervals`] for line data.
pub struct GroupToIntervalsOp;

impl TransformOp for GroupToIntervalsOp {
    fn name(&self) -> &str {
        "Group To Intervals"
    }

    fn target_input_kind(&self) -> DataKind {
        DataKind::Lines
    }

    fn default_params(&self) -> TransformParams {
        TransformParams::GroupToIntervals(GroupToIntervalsParams::default())
    }

    fn execute(
        &self,
        input: &DataVariant,
        params: &TransformParams,
        ctx: &mut TransformContext<'_>,
        mut progress: Progress<'_>,
    ) -> DataVariant {
        let Some(series) = input.as_lines() else {
            warn!("group-to-intervals: input is not line data");
            progress.finish();
            return input.clone();
        };
        let Some(group_manager) = ctx.group_manager.as_deref() else {
            error!("group-to-intervals: no group manager in context");
            progress.finish();
            return DataVariant::Empty;
        };
        let params = resolve_params(
            params,
            |p| match p {
                TransformParams::GroupToIntervals(p) => Some(p.clone()),
                _ => None,
            },
            GroupToIntervalsParams::default,
            self.name(),
        );

        match group_presence_to_intervals(series, group_manager, &params, &mut progress) {
            Some(result) => {
                progress.finish();
                DataVariant::Intervals(Arc::new(result))
            }
            None => {
                progress.finish();
                DataVariant::Empty
            }
        }
    }
}

// ============================================================================
// INDEX GROUPING
// ============================================================================

/// Parameters for grouping entries by their local index.
#[derive(Debug, Clone)]
pub struct IndexGroupingParams {
    /// Prefix of the created group names ("Group 0", "Group 1", ...).
    pub group_name_prefix: String,
    /// Description template; `{}` is replaced by the index.
    pub group_description_template: String,
    /// Delete every existing group first.
    pub clear_existing_groups: bool,
}

impl Default for IndexGroupingParams {
    fn default() -> Self {
        Self {
            group_name_prefix: "Group".to_string(),
            group_description_template: "Entities at local index {}".to_string(),
            clear_existing_groups: false,
        }
    }
}

/// Assign each frame's entry at local index `i` to group `i`.
///
/// Creates `max_entries_at_any_time` groups; entries still carrying the
/// invalid entity sentinel are skipped. Returns the number of groups
/// created. Observers are notified once.
pub fn group_by_index<T>(
    series: &RaggedSeries<T>,
    group_manager: &mut EntityGroupManager,
    params: &IndexGroupingParams,
) -> usize {
    if params.clear_existing_groups {
        for group_id in group_manager.all_group_ids() {
            group_manager.delete_group(group_id);
        }
    }

    let max_entries = series.max_entries_at_any_time();
    if max_entries == 0 {
        return 0;
    }

    let mut group_ids = Vec::with_capacity(max_entries);
    for index in 0..max_entries {
        let name = format!("{} {}", params.group_name_prefix, index);
        let description = params
            .group_description_template
            .replace("{}", &index.to_string());
        group_ids.push(group_manager.create_group(name, description));
    }

    for (_, entries) in series.entries() {
        for (index, entry) in entries.iter().enumerate() {
            if entry.entity_id.is_valid() {
                group_manager.add_entity_to_group(group_ids[index], entry.entity_id);
            }
        }
    }

    group_manager.notify_groups_changed();
    max_entries
}

/// Operation wrapper over [`group_by_index`] for line data.
pub struct IndexGroupingOp;

impl TransformOp for IndexGroupingOp {
    fn name(&self) -> &str {
        "Group By Index"
    }

    fn target_input_kind(&self) -> DataKind {
        DataKind::Lines
    }

    fn default_params(&self) -> TransformParams {
        TransformParams::IndexGrouping(IndexGroupingParams::default())
    }

    fn execute(
        &self,
        input: &DataVariant,
        params: &TransformParams,
        ctx: &mut TransformContext<'_>,
        mut progress: Progress<'_>,
    ) -> DataVariant {
        let Some(series) = input.as_lines() else {
            warn!("index grouping: input is not line data");
            progress.finish();
            return input.clone();
        };
        let Some(group_manager) = ctx.group_manager.as_deref_mut() else {
            error!("index grouping: no group manager in context");
            progress.finish();
            return input.clone();
        };
        let params = resolve_params(
            params,
            |p| match p {
                TransformParams::IndexGrouping(p) => Some(p.clone()),
                _ => None,
            },
            IndexGroupingParams::default,
            self.name(),
        );

        progress.report(0);
        let groups = group_by_index(series, group_manager, &params);
        debug!(groups, "index grouping complete");
        progress.finish();
        input.clone()
    }
}

// ============================================================================
// BOOLEAN INTERVAL ALGEBRA
// ============================================================================

/// Boolean operation over two interval series (NOT uses only the first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BooleanIntervalOp {
    #[default]
    And,
    Or,
    Xor,
    AndNot,
    Not,
}

/// Parameters for [`apply_boolean_operation`].
#[derive(Debug, Clone, Default)]
pub struct BooleanIntervalParams {
    pub operation: BooleanIntervalOp,
    /// Second operand; required for every operation except NOT.
    pub other: Option<Arc<IntervalSeries>>,
}

fn intervals_to_flags(intervals: &[Interval], min_time: i64, len: usize) -> Vec<bool> {
    let mut flags = vec![false; len];
    for interval in intervals {
        let lo = (interval.start - min_time).max(0) as usize;
        let hi = ((interval.end - min_time) as usize).min(len.saturating_sub(1));
        for flag in &mut flags[lo..=hi] {
            *flag = true;
        }
    }
    flags
}

fn flags_to_intervals(flags: &[bool], min_time: i64) -> Vec<Interval> {
    let mut intervals = Vec::new();
    let mut run_start: Option<i64> = None;
    for (offset, &flag) in flags.iter().enumerate() {
        if flag {
            if run_start.is_none() {
                run_start = Some(min_time + offset as i64);
            }
        } else if let Some(start) = run_start.take() {
            intervals.push(Interval::new(start, min_time + offset as i64 - 1));
        }
    }
    if let Some(start) = run_start {
        intervals.push(Interval::new(start, min_time + flags.len() as i64 - 1));
    }
    intervals
}

/// Evaluate a boolean operation over the frame lattice of two interval
/// series.
///
/// When the operands live in different coordinate systems, the second is
/// converted into the first through the time-frame index mapping. NOT is
/// defined over the min-max extent of its single input.
pub fn apply_boolean_operation(
    series: &IntervalSeries,
    params: &BooleanIntervalParams,
    progress: &mut Progress<'_>,
) -> IntervalSeries {
    let mut result = IntervalSeries::new();
    if let Some(frame) = series.time_frame() {
        result.set_time_frame(Arc::clone(frame));
    }

    let intervals = series.intervals();

    if params.operation == BooleanIntervalOp::Not {
        if intervals.is_empty() {
            // NOT of empty has no defined range.
            progress.finish();
            return result;
        }
        let min_time = intervals.iter().map(|i| i.start).min().unwrap();
        let max_time = intervals.iter().map(|i| i.end).max().unwrap();
        let len = (max_time - min_time + 1) as usize;
        progress.report(20);

        let mut flags = intervals_to_flags(intervals, min_time, len);
        for flag in &mut flags {
            *flag = !*flag;
        }
        progress.report(60);

        for interval in flags_to_intervals(&flags, min_time) {
            result.add_interval(interval);
        }
        progress.finish();
        return result;
    }

    let Some(other) = params.other.as_ref() else {
        error!("boolean intervals: second operand missing");
        progress.finish();
        return result;
    };

    if intervals.is_empty() && other.intervals().is_empty() {
        progress.finish();
        return result;
    }
    progress.report(10);

    // Convert the other operand into this series' coordinate system when
    // the frames differ.
    let needs_conversion = match (series.time_frame(), other.time_frame()) {
        (Some(own), Some(theirs)) => !Arc::ptr_eq(own, theirs),
        _ => false,
    };
    let other_intervals: Vec<Interval> = if needs_conversion {
        let own = series.time_frame().unwrap();
        let theirs = other.time_frame().unwrap();
        other
            .intervals()
            .iter()
            .map(|interval| {
                let start_value = theirs.time_at_index(TimeIndex(interval.start));
                let end_value = theirs.time_at_index(TimeIndex(interval.end));
                Interval::new(
                    own.index_at_time(start_value, IndexRounding::Below).value(),
                    own.index_at_time(end_value, IndexRounding::Above).value(),
                )
            })
            .collect()
    } else {
        other.intervals().to_vec()
    };
    progress.report(20);

    let min_time = intervals
        .iter()
        .map(|i| i.start)
        .chain(other_intervals.iter().map(|i| i.start))
        .min()
        .unwrap();
    let max_time = intervals
        .iter()
        .map(|i| i.end)
        .chain(other_intervals.iter().map(|i| i.end))
        .max()
        .unwrap();
    if min_time > max_time {
        progress.finish();
        return result;
    }
    let len = (max_time - min_time + 1) as usize;

    let input_flags = intervals_to_flags(intervals, min_time, len);
    progress.report(50);
    let other_flags = intervals_to_flags(&other_intervals, min_time, len);
    progress.report(70);

    let mut result_flags = vec![false; len];
    for offset in 0..len {
        let a = input_flags[offset];
        let b = other_flags[offset];
        result_flags[offset] = match params.operation {
            BooleanIntervalOp::And => a && b,
            BooleanIntervalOp::Or => a || b,
            BooleanIntervalOp::Xor => a != b,
            BooleanIntervalOp::AndNot => a && !b,
            BooleanIntervalOp::Not => unreachable!("handled above"),
        };
    }
    progress.report(85);

    for interval in flags_to_intervals(&result_flags, min_time) {
        result.add_interval(interval);
    }
    progress.finish();
    result
}

/// Operation wrapper over [`apply_boolean_operation`].
pub struct BooleanIntervalsOp;

impl TransformOp for BooleanIntervalsOp {
    fn name(&self) -> &str {
        "Boolean Intervals"
    }

    fn target_input_kind(&self) -> DataKind {
        DataKind::Intervals
    }

    fn default_params(&self) -> TransformParams {
        TransformParams::BooleanIntervals(BooleanIntervalParams::default())
    }

    fn execute(
        &self,
        input: &DataVariant,
        params: &TransformParams,
        _ctx: &mut TransformContext<'_>,
        mut progress: Progress<'_>,
    ) -> DataVariant {
        let Some(series) = input.as_intervals() else {
            warn!("boolean intervals: input is not interval data");
            progress.finish();
            return input.clone();
        };
        let params = resolve_params(
            params,
            |p| match p {
                TransformParams::BooleanIntervals(p) => Some(p.clone()),
                _ => None,
            },
            BooleanIntervalParams::default,
            self.name(),
        );
        let result = apply_boolean_operation(series, &params, &mut progress);
        progress.finish();
        DataVariant::Intervals(Arc::new(result))
    }
}

// ============================================================================
// INTERVAL GROUPING
// ============================================================================

/// Parameters for [`group_intervals`].
#[derive(Debug, Clone, Default)]
pub struct IntervalGroupingParams {
    /// Two consecutive intervals collapse when
    /// `next.start - current.end - 1 <= max_spacing`.
    pub max_spacing: i64,
}

/// Collapse consecutive intervals separated by at most `max_spacing` frames.
pub fn group_intervals(
    series: &IntervalSeries,
    params: &IntervalGroupingParams,
    progress: &mut Progress<'_>,
) -> IntervalSeries {
    let mut result = IntervalSeries::new();
    if let Some(frame) = series.time_frame() {
        result.set_time_frame(Arc::clone(frame));
    }
    let intervals = series.intervals();
    if intervals.is_empty() {
        progress.finish();
        return result;
    }
    progress.report(20);

    let mut current = intervals[0];
    for (index, &next) in intervals.iter().enumerate().skip(1) {
        let gap = next.start - current.end - 1;
        if gap <= params.max_spacing {
            current.end = current.end.max(next.end);
        } else {
            result.add_interval(current);
            current = next;
        }
        if index % 100 == 0 {
            progress.report(20 + ((index * 60) / intervals.len()) as i32);
        }
    }
    result.add_interval(current);
    progress.finish();
    result
}

/// Operation wrapper over [`group_intervals`].
pub struct IntervalGroupingOp;

impl TransformOp for IntervalGroupingOp {
    fn name(&self) -> &str {
        "Group Intervals"
    }

    fn target_input_kind(&self) -> DataKind {
        DataKind::Intervals
    }

    fn default_params(&self) -> TransformParams {
        TransformParams::IntervalGrouping(IntervalGroupingParams::default())
    }

    fn execute(
        &self,
        input: &DataVariant,
        params: &TransformParams,
        _ctx: &mut TransformContext<'_>,
        mut progress: Progress<'_>,
    ) -> DataVariant {
        let Some(series) = input.as_intervals() else {
            warn!("interval grouping: input is not interval data");
            progress.finish();
            return input.clone();
        };
        let params = resolve_params(
            params,
            |p| match p {
                TransformParams::IntervalGrouping(p) => Some(p.clone()),
                _ => None,
            },
            IntervalGroupingParams::default,
            self.name(),
        );
        let result = group_intervals(series, &params, &mut progress);
        progress.finish();
        DataVariant::Intervals(Arc::new(result))
    }
}

// ============================================================================
// ANALOG PEAKS IN INTERVALS
// ============================================================================

/// Which extremum to emit per range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeakType {
    #[default]
    Maximum,
    Minimum,
}

/// How search ranges derive from the interval series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeakSearchMode {
    /// One range per interval: `[start, end]`.
    #[default]
    WithinIntervals,
    /// Ranges between consecutive interval starts:
    /// `[start_i, start_{i+1} - 1]`, the last interval searched in full.
    BetweenIntervalStarts,
}

/// Parameters for [`find_interval_peaks`].
#[derive(Debug, Clone, Default)]
pub struct IntervalPeakParams {
    pub intervals: Option<Arc<IntervalSeries>>,
    pub peak_type: PeakType,
    pub search_mode: PeakSearchMode,
}

/// Emit one event at the extreme analog sample of each search range.
/// Ranges containing no samples are skipped silently.
pub fn find_interval_peaks(
    analog: &AnalogSeries,
    params: &IntervalPeakParams,
    progress: &mut Progress<'_>,
) -> EventSeries {
    let Some(interval_series) = params.intervals.as_ref() else {
        error!("interval peaks: interval series missing");
        progress.finish();
        return EventSeries::new();
    };
    let intervals = interval_series.intervals();
    if intervals.is_empty() || analog.is_empty() {
        progress.finish();
        return EventSeries::new();
    }
    progress.report(10);

    let ranges: Vec<(i64, i64)> = match params.search_mode {
        PeakSearchMode::WithinIntervals => intervals
            .iter()
            .map(|interval| (interval.start, interval.end))
            .collect(),
        PeakSearchMode::BetweenIntervalStarts => {
            let mut ranges: Vec<(i64, i64)> = intervals
                .windows(2)
                .map(|pair| (pair[0].start, pair[1].start - 1))
                .collect();
            let last = intervals.last().unwrap();
            ranges.push((last.start, last.end));
            ranges
        }
    };
    progress.report(15);

    let query_frame = interval_series.time_frame().map(|frame| frame.as_ref());
    let mut peaks = Vec::new();
    for (range_index, &(range_start, range_end)) in ranges.iter().enumerate() {
        let (times, values) = analog.samples_in_range(
            TimeIndex(range_start),
            TimeIndex(range_end),
            query_frame,
        );
        if values.is_empty() {
            continue;
        }

        let mut peak_index = 0;
        for (index, &value) in values.iter().enumerate() {
            let better = match params.peak_type {
                PeakType::Maximum => value > values[peak_index],
                PeakType::Minimum => value < values[peak_index],
            };
            if better {
                peak_index = index;
            }
        }
        peaks.push(times[peak_index]);

        progress.report(15 + (((range_index + 1) * 80) / ranges.len()) as i32);
    }

    let mut result = EventSeries::from_times(peaks);
    if let Some(frame) = analog.time_frame() {
        result.set_time_frame(Arc::clone(frame));
    }
    progress.finish();
    result
}

/// Operation wrapper over [`find_interval_peaks`].
pub struct IntervalPeaksOp;

impl TransformOp for IntervalPeaksOp {
    fn name(&self) -> &str {
        "Interval Peak Detection"
    }

    fn target_input_kind(&self) -> DataKind {
        DataKind::Analog
    }

    fn default_params(&self) -> TransformParams {
        TransformParams::IntervalPeaks(IntervalPeakParams::default())
    }

    fn execute(
        &self,
        input: &DataVariant,
        params: &TransformParams,
        _ctx: &mut TransformContext<'_>,
        mut progress: Progress<'_>,
    ) -> DataVariant {
        let Some(series) = input.as_analog() else {
            warn!("interval peaks: input is not analog data");
            progress.finish();
            return input.clone();
        };
        let params = resolve_params(
            params,
            |p| match p {
                TransformParams::IntervalPeaks(p) => Some(p.clone()),
                _ => None,
            },
            IntervalPeakParams::default,
            self.name(),
        );
        let result = find_interval_peaks(series, &params, &mut progress);
        progress.finish();
        DataVariant::Events(Arc::new(result))
    }
}

// ============================================================================
// TESTS
// ============================================================================
