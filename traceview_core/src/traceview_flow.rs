//! The "FLOW" Engine - Global Min-Cost-Flow Tracking Between Anchors
//! ==================================================================
//!
//! Where the iterative tracker refines frame-local decisions, this tracker
//! finds the globally optimal observation sequence between two ground-truth
//! anchors per group:
//!
//! - **Phase A**: greedily link frame-consecutive observations into
//!   meta-nodes while the association cost stays below the cheap-assignment
//!   threshold (cost-function units, not raw distance).
//! - **Phase B**: per ground-truth segment, trim the meta-nodes to the
//!   anchors, build a time-ordered DAG over them, and solve unit min-cost
//!   flow from source to sink. A failed solve falls back to the trimmed
//!   boundary chains.
//! - **Phase C**: a final forward Kalman pass with multi-step prediction
//!   over gaps, then RTS smoothing.
//! - **Phase D**: write recovered memberships back, never re-labelling an
//!   entity that already belongs to any group.

use crate::progress::Progress;
use crate::traceview_anchors::{
    extract_ground_truth_segments, fallback_path_from_trimmed, slice_meta_nodes_to_segment,
    FlowNode, FlowPath, GroundTruthSegment, MetaNode,
};
use crate::traceview_cost::CostFn;
use crate::traceview_entity::EntityId;
use crate::traceview_features::FeatureExtractor;
use crate::traceview_filter::{Filter, Measurement};
use crate::traceview_groups::{EntityGroupManager, GroupId};
use crate::traceview_time::TimeIndex;
use crate::traceview_tracking::SmoothedResults;
use crate::validation::{validate_ground_truth, GroundTruthMap};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, error, warn};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Tuning knobs for the min-cost-flow tracker.
#[derive(Debug, Clone)]
pub struct FlowTrackerConfig {
    /// Multiplier converting float costs to integer arc costs.
    pub cost_scale_factor: f64,
    /// Greedy chain extension accepts a link only at or below this cost.
    /// Units are cost-function units (Mahalanobis by default), not raw
    /// distance.
    pub cheap_assignment_threshold: f64,
    /// Longest frame gap an arc may bridge between meta-nodes.
    pub max_prediction_horizon: i64,
}

impl Default for FlowTrackerConfig {
    fn default() -> Self {
        Self {
            cost_scale_factor: 100.0,
            cheap_assignment_threshold: 5.0,
            max_prediction_horizon: 50,
        }
    }
}

/// Optional per-call behavior switches.
#[derive(Debug, Clone, Default)]
pub struct FlowProcessOptions {
    /// Redirect a group's recovered path into a different output group.
    pub output_group_ids: BTreeMap<GroupId, GroupId>,
    /// Observations to skip during meta-node construction.
    pub excluded_entities: HashSet<EntityId>,
    /// Exceptions to the exclusion set (used to keep anchors reachable).
    pub include_entities: HashSet<EntityId>,
}

// ============================================================================
// MIN-COST-FLOW SOLVER
// ============================================================================

/// Successive-shortest-paths min-cost flow on a small residual network.
///
/// Arc capacities here are all 1 and the supply is a single unit, but the
/// solver is written for general integer capacities.
struct MinCostFlowSolver {
    num_nodes: usize,
    // Paired residual arcs: arc 2k is forward, 2k+1 its reverse.
    to: Vec<usize>,
    cap: Vec<i64>,
    cost: Vec<i64>,
    adj: Vec<Vec<usize>>,
}

impl MinCostFlowSolver {
    fn new(num_nodes: usize) -> Self {
        Self {
            num_nodes,
            to: Vec::new(),
            cap: Vec::new(),
            cost: Vec::new(),
            adj: vec![Vec::new(); num_nodes],
        }
    }

    /// Add a forward arc; returns its index for flow queries.
    fn add_arc(&mut self, from: usize, to: usize, cap: i64, cost: i64) -> usize {
        let index = self.to.len();
        self.to.push(to);
        self.cap.push(cap);
        self.cost.push(cost);
        self.adj[from].push(index);

        self.to.push(from);
        self.cap.push(0);
        self.cost.push(-cost);
        self.adj[to].push(index + 1);
        index
    }

    /// Push up to `supply` units from `source` to `sink`; returns
    /// `(flow_sent, total_cost)`.
    fn solve(&mut self, source: usize, sink: usize, supply: i64) -> (i64, i64) {
        let mut flow_sent = 0;
        let mut total_cost = 0;

        while flow_sent < supply {
            // Bellman-Ford over the residual network (reverse arcs carry
            // negative costs).
            let mut dist = vec![i64::MAX; self.num_nodes];
            let mut prev_arc = vec![usize::MAX; self.num_nodes];
            dist[source] = 0;
            for _ in 0..self.num_nodes {
                let mut improved = false;
                for node in 0..self.num_nodes {
                    if dist[node] == i64::MAX {
                        continue;
                    }
                    for &arc in &self.adj[node] {
                        if self.cap[arc] <= 0 {
                            continue;
                        }
                        let next = self.to[arc];
                        let candidate = dist[node] + self.cost[arc];
                        if candidate < dist[next] {
                            dist[next] = candidate;
                            prev_arc[next] = arc;
                            improved = true;
                        }
                    }
                }
                if !improved {
                    break;
                }
            }

            if dist[sink] == i64::MAX {
                break;
            }

            // Bottleneck along the path, then augment.
            let mut bottleneck = supply - flow_sent;
            let mut node = sink;
            while node != source {
                let arc = prev_arc[node];
                bottleneck = bottleneck.min(self.cap[arc]);
                node = self.to[arc ^ 1];
            }
            let mut node = sink;
            while node != source {
                let arc = prev_arc[node];
                self.cap[arc] -= bottleneck;
                self.cap[arc ^ 1] += bottleneck;
                node = self.to[arc ^ 1];
            }
            flow_sent += bottleneck;
            total_cost += bottleneck * dist[sink];
        }

        (flow_sent, total_cost)
    }

    /// Units pushed through a forward arc returned by [`Self::add_arc`].
    fn flow(&self, arc: usize) -> i64 {
        self.cap[arc ^ 1]
    }
}

// ============================================================================
// TRACKER
// ============================================================================

/// Global data-association tracker over a raw data type `D`.
pub struct MinCostFlowTracker<D> {
    filter_prototype: Box<dyn Filter>,
    feature_extractor: Box<dyn FeatureExtractor<D>>,
    cost_function: CostFn,
    config: FlowTrackerConfig,
}

type FrameBucket<'a, D> = Vec<(&'a D, EntityId)>;
type FrameLookup<'a, D> = BTreeMap<TimeIndex, FrameBucket<'a, D>>;

impl<D> MinCostFlowTracker<D> {
    pub fn new(
        filter_prototype: Box<dyn Filter>,
        feature_extractor: Box<dyn FeatureExtractor<D>>,
        cost_function: CostFn,
        config: FlowTrackerConfig,
    ) -> Self {
        Self {
            filter_prototype,
            feature_extractor,
            cost_function,
            config,
        }
    }

    /// Process `[start_frame, end_frame]` with global min-cost-flow
    /// optimisation. Groups whose anchors cannot be located are skipped with
    /// a warning; the others continue.
    pub fn process<'a, I>(
        &self,
        data_source: I,
        group_manager: &mut EntityGroupManager,
        ground_truth: &GroundTruthMap,
        start_frame: TimeIndex,
        end_frame: TimeIndex,
        mut progress: Progress<'_>,
        options: &FlowProcessOptions,
    ) -> SmoothedResults
    where
        I: IntoIterator<Item = (&'a D, EntityId, TimeIndex)>,
        D: 'a,
    {
        if let Err(err) = validate_ground_truth(ground_truth) {
            error!(%err, "rejecting ground-truth map");
            progress.finish();
            return SmoothedResults::new();
        }

        let frame_lookup = build_frame_lookup(data_source, start_frame, end_frame);
        debug!(
            start = start_frame.value(),
            end = end_frame.value(),
            "min-cost-flow pass begins"
        );

        let mut in_range = GroundTruthMap::new();
        for (&frame, assignments) in ground_truth.range(start_frame..=end_frame) {
            in_range.insert(frame, assignments.clone());
        }
        let segments = extract_ground_truth_segments(&in_range);
        if segments.is_empty() {
            warn!("no usable anchor pairs in range; nothing to solve");
            progress.finish();
            return SmoothedResults::new();
        }

        // Phase A - group-agnostic meta-node construction.
        let meta_nodes = self.build_meta_nodes(
            &frame_lookup,
            start_frame,
            end_frame,
            &options.excluded_entities,
            &options.include_entities,
        );
        progress.report(30);

        // Phase B - per-segment flow.
        let mut solved_paths: BTreeMap<GroupId, FlowPath> = BTreeMap::new();
        let total_segments = segments.len() as i64;
        for (index, segment) in segments.iter().enumerate() {
            let path = self.solve_segment_flow(&meta_nodes, &frame_lookup, segment);
            if path.is_empty() {
                warn!(
                    group = segment.group_id,
                    start = segment.start_frame.value(),
                    end = segment.end_frame.value(),
                    "anchors not reachable; skipping group segment"
                );
                continue;
            }
            let entry = solved_paths.entry(segment.group_id).or_default();
            for node in path {
                // Consecutive segments share their boundary anchor.
                if entry.last() == Some(&node) {
                    continue;
                }
                entry.push(node);
            }
            progress.report(30 + ((index as i64 + 1) * 40 / total_segments.max(1)) as i32);
        }

        if solved_paths.is_empty() {
            error!("min-cost flow produced no paths");
            progress.finish();
            return SmoothedResults::new();
        }

        // Phase D - write back memberships, never re-labelling grouped
        // entities.
        for (&group_id, path) in &solved_paths {
            let write_group = options
                .output_group_ids
                .get(&group_id)
                .copied()
                .unwrap_or(group_id);
            for node in path {
                if group_manager.groups_containing_entity(node.entity_id).is_empty() {
                    group_manager.add_entity_to_group(write_group, node.entity_id);
                }
            }
        }
        group_manager.notify_groups_changed();
        progress.report(80);

        // Phase C - final smoothing pass over the recovered paths.
        let results = self.smoothed_results(&solved_paths, &frame_lookup);
        progress.finish();
        results
    }

    // ========================================================================
    // PHASE A - META-NODES
    // ========================================================================

    /// Greedily link cheap frame-consecutive assignments into disjoint
    /// chains. Ties in extension resolve to the smaller entity id.
    fn build_meta_nodes(
        &self,
        frame_lookup: &FrameLookup<'_, D>,
        start_frame: TimeIndex,
        end_frame: TimeIndex,
        excluded: &HashSet<EntityId>,
        included: &HashSet<EntityId>,
    ) -> Vec<MetaNode> {
        let mut meta_nodes = Vec::new();
        let mut used: HashSet<(TimeIndex, EntityId)> = HashSet::new();
        let skip =
            |entity: EntityId| excluded.contains(&entity) && !included.contains(&entity);

        let mut frame = start_frame;
        while frame <= end_frame {
            let Some(bucket) = frame_lookup.get(&frame) else {
                frame += 1;
                continue;
            };
            for &(start_data, start_entity) in bucket {
                if used.contains(&(frame, start_entity)) || skip(start_entity) {
                    continue;
                }

                let mut chain_filter = self.filter_prototype.clone_box();
                chain_filter.initialize(&self.feature_extractor.initial_state(start_data));

                let mut node = MetaNode {
                    members: vec![FlowNode {
                        frame,
                        entity_id: start_entity,
                    }],
                    start_frame: frame,
                    end_frame: frame,
                    start_entity,
                    end_entity: start_entity,
                    start_state: chain_filter.state(),
                    end_state: chain_filter.state(),
                };
                used.insert((frame, start_entity));

                let mut current_frame = frame;
                while current_frame + 1 <= end_frame {
                    let next_frame = current_frame + 1;
                    let Some(candidates) = frame_lookup.get(&next_frame) else {
                        break; // no data: the chain ends here
                    };

                    let predicted = chain_filter.predict();
                    let mut best: Option<(f64, EntityId, &D)> = None;
                    for &(candidate_data, candidate_id) in candidates {
                        if used.contains(&(next_frame, candidate_id)) || skip(candidate_id) {
                            continue;
                        }
                        let features = self.feature_extractor.filter_features(candidate_data);
                        let cost = (self.cost_function)(&predicted, &features, 1);
                        let better = match best {
                            None => true,
                            Some((best_cost, best_id, _)) => {
                                cost < best_cost || (cost == best_cost && candidate_id < best_id)
                            }
                        };
                        if better {
                            best = Some((cost, candidate_id, candidate_data));
                        }
                    }

                    match best {
                        Some((cost, best_id, best_data))
                            if cost <= self.config.cheap_assignment_threshold =>
                        {
                            let measurement =
                                Measurement::new(self.feature_extractor.filter_features(best_data));
                            chain_filter.update(&predicted, &measurement);
                            node.members.push(FlowNode {
                                frame: next_frame,
                                entity_id: best_id,
                            });
                            node.end_state = chain_filter.state();
                            used.insert((next_frame, best_id));
                            current_frame = next_frame;
                        }
                        _ => break,
                    }
                }

                node.end_frame = node.members.last().unwrap().frame;
                node.end_entity = node.members.last().unwrap().entity_id;
                meta_nodes.push(node);
            }
            frame += 1;
        }

        debug!(count = meta_nodes.len(), "meta-nodes built");
        meta_nodes
    }

    // ========================================================================
    // PHASE B - PER-SEGMENT FLOW
    // ========================================================================

    fn solve_segment_flow(
        &self,
        meta_nodes: &[MetaNode],
        frame_lookup: &FrameLookup<'_, D>,
        segment: &GroundTruthSegment,
    ) -> FlowPath {
        let trimmed = slice_meta_nodes_to_segment(meta_nodes, segment);
        if trimmed.is_empty() {
            return FlowPath::new();
        }

        let start_meta = trimmed.iter().position(|node| {
            node.start_frame == segment.start_frame && node.start_entity == segment.start_entity
        });
        let end_meta = trimmed.iter().position(|node| {
            node.end_frame == segment.end_frame && node.end_entity == segment.end_entity
        });
        let (Some(start_meta), Some(end_meta)) = (start_meta, end_meta) else {
            return FlowPath::new();
        };

        let num_meta = trimmed.len();
        let source = num_meta;
        let sink = num_meta + 1;
        let mut solver = MinCostFlowSolver::new(num_meta + 2);
        let mut arcs: Vec<(usize, usize, usize)> = Vec::new(); // (arc, from, to)

        solver.add_arc(source, start_meta, 1, 0);
        solver.add_arc(end_meta, sink, 1, 0);

        let mut num_transition_arcs = 0;
        for (i, from) in trimmed.iter().enumerate() {
            for (j, to) in trimmed.iter().enumerate() {
                if to.start_frame <= from.end_frame {
                    continue;
                }
                let num_steps = to.start_frame - from.end_frame;
                if num_steps > self.config.max_prediction_horizon {
                    continue;
                }

                // Predict from the end of `from` across the gap.
                let mut filter = self.filter_prototype.clone_box();
                filter.initialize(&from.end_state);
                let mut predicted = from.end_state.clone();
                for _ in 0..num_steps {
                    predicted = filter.predict();
                }

                let Some(target_data) =
                    find_entity(frame_lookup, to.start_frame, to.start_entity)
                else {
                    continue;
                };
                let features = self.feature_extractor.filter_features(target_data);
                let cost = (self.cost_function)(&predicted, &features, num_steps);
                let arc_cost = (cost * self.config.cost_scale_factor) as i64;
                let arc = solver.add_arc(i, j, 1, arc_cost);
                arcs.push((arc, i, j));
                num_transition_arcs += 1;
            }
        }

        debug!(
            group = segment.group_id,
            meta_nodes = num_meta,
            transitions = num_transition_arcs,
            "segment graph built"
        );

        let (flow_sent, _) = solver.solve(source, sink, 1);
        if flow_sent < 1 {
            warn!(
                group = segment.group_id,
                "flow solve failed; using fallback boundary path"
            );
            return fallback_path_from_trimmed(&trimmed, Some(start_meta), Some(end_meta));
        }

        // Decode the unit path over meta-nodes.
        let mut successor: BTreeMap<usize, usize> = BTreeMap::new();
        for &(arc, from, to) in &arcs {
            if solver.flow(arc) > 0 {
                successor.insert(from, to);
            }
        }

        let mut path = FlowPath::new();
        let mut current = start_meta;
        let mut visited: HashSet<usize> = HashSet::new();
        loop {
            if !visited.insert(current) {
                break;
            }
            path.extend(trimmed[current].members.iter().copied());
            match successor.get(&current) {
                Some(&next) => current = next,
                None => break,
            }
        }

        if path.is_empty() {
            return fallback_path_from_trimmed(&trimmed, Some(start_meta), Some(end_meta));
        }
        path
    }

    // ========================================================================
    // PHASE C - FINAL SMOOTHING
    // ========================================================================

    fn smoothed_results(
        &self,
        solved_paths: &BTreeMap<GroupId, FlowPath>,
        frame_lookup: &FrameLookup<'_, D>,
    ) -> SmoothedResults {
        let mut results = SmoothedResults::new();

        for (&group_id, path) in solved_paths {
            if path.is_empty() {
                continue;
            }
            let mut filter = self.filter_prototype.clone_box();
            let mut forward_states = Vec::with_capacity(path.len());
            let mut prev_frame: Option<TimeIndex> = None;

            for node in path {
                let Some(data) = find_entity(frame_lookup, node.frame, node.entity_id) else {
                    continue;
                };
                match prev_frame {
                    None => {
                        filter.initialize(&self.feature_extractor.initial_state(data));
                    }
                    Some(prev) => {
                        let num_steps = node.frame - prev;
                        if num_steps <= 0 {
                            error!(steps = num_steps, "non-monotonic path; skipping node");
                            continue;
                        }
                        // Multi-step prediction across missing frames.
                        let mut predicted = filter.state();
                        for _ in 0..num_steps {
                            predicted = filter.predict();
                        }
                        let measurement =
                            Measurement::new(self.feature_extractor.filter_features(data));
                        filter.update(&predicted, &measurement);
                    }
                }
                prev_frame = Some(node.frame);
                forward_states.push(filter.state());
            }

            let smoothed = if forward_states.len() > 1 {
                self.filter_prototype.smooth(&forward_states)
            } else {
                forward_states
            };
            results.insert(group_id, smoothed);
        }

        results
    }
}

fn build_frame_lookup<'a, D, I>(
    data_source: I,
    start_frame: TimeIndex,
    end_frame: TimeIndex,
) -> FrameLookup<'a, D>
where
    I: IntoIterator<Item = (&'a D, EntityId, TimeIndex)>,
{
    let mut lookup: FrameLookup<'a, D> = BTreeMap::new();
    for (data, entity_id, frame) in data_source {
        if frame >= start_frame && frame <= end_frame {
            lookup.entry(frame).or_default().push((data, entity_id));
        }
    }
    lookup
}

fn find_entity<'a, D>(
    frame_lookup: &FrameLookup<'a, D>,
    frame: TimeIndex,
    entity_id: EntityId,
) -> Option<&'a D> {
    frame_lookup
        .get(&frame)?
        .iter()
        .find(|&&(_, e)| e == entity_id)
        .map(|&(data, _)| data)
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

    #[test]
    fn test_min_cost_flow_solver_picks_cheaper_path() {
        // 0 -> {1, 2} -> 3, with the path through 2 cheaper.
        let mut solver = MinCostFlowSolver::new(4);
        let via_1a = solver.add_arc(0, 1, 1, 5);
        let via_1b = solver.add_arc(1, 3, 1, 5);
        let via_2a = solver.add_arc(0, 2, 1, 2);
        let via_2b = solver.add_arc(2, 3, 1, 3);

        let (flow, cost) = solver.solve(0, 3, 1);
        assert_eq!(flow, 1);
        assert_eq!(cost, 5);
        assert_eq!(solver.flow(via_2a), 1);
        assert_eq!(solver.flow(via_2b), 1);
        assert_eq!(solver.flow(via_1a), 0);
        assert_eq!(solver.flow(via_1b), 0);
    }

    #[test]
    fn test_min_cost_flow_solver_unreachable_sink() {
        let mut solver = MinCostFlowSolver::new(3);
        solver.add_arc(0, 1, 1, 1);
        let (flow, _) = solver.solve(0, 2, 1);
        assert_eq!(flow, 0);
    }

    fn point_line(x: f64, y: f64) -> Line2 {
        vec![
            Point2::new(x as f32 - 0.5, y as f32),
            Point2::new(x as f32 + 0.5, y as f32),
        ]
    }

    fn build_tracker() -> MinCostFlowTracker<Line2> {
        let metadata = vec![FeatureMetadata::derive(
            "line_centroid",
            2,
            FeatureTemporalType::Kinematic2D,
        )];
        let config = NoiseConfig {
            dt: 1.0,
            process_noise_position: 0.1,
            process_noise_velocity: 0.1,
            measurement_noise: 1.0,
            ..Default::default()
        };
        let matrices = KalmanMatrixBuilder::build(&metadata, &config);
        let cost = mahalanobis_cost(matrices.h.clone(), matrices.r.clone());
        let filter = KalmanFilter::new(matrices.f, matrices.h, matrices.q, matrices.r);
        MinCostFlowTracker::new(
            Box::new(filter),
            Box::new(LineCentroidExtractor),
            cost,
            FlowTrackerConfig::default(),
        )
    }

    struct Scenario {
        data: Vec<(Line2, EntityId, TimeIndex)>,
        ground_truth: GroundTruthMap,
        group_a: GroupId,
        group_b: GroupId,
        entities_a: Vec<EntityId>,
        entities_b: Vec<EntityId>,
    }

    /// Thirty frames, two tracks moving in opposite directions. Track A's
    /// trajectory jumps at frame 15, breaking its cheap chain so the flow
    /// graph has to bridge the transition.
    fn opposite_tracks_scenario(manager: &mut EntityGroupManager) -> Scenario {
        let group_a = manager.create_group("track_a", "");
        let group_b = manager.create_group("track_b", "");

        let mut data = Vec::new();
        let mut entities_a = Vec::new();
        let mut entities_b = Vec::new();
        for t in 0..30i64 {
            let ea = EntityId(1000 + t as u64);
            let eb = EntityId(2000 + t as u64);
            let a_y = if t < 15 { 2.0 } else { 10.0 };
            data.push((point_line(t as f64, a_y), ea, TimeIndex(t)));
            data.push((point_line(29.0 - t as f64, -20.0), eb, TimeIndex(t)));
            entities_a.push(ea);
            entities_b.push(eb);
        }

        let mut ground_truth = GroundTruthMap::new();
        ground_truth.insert(
            TimeIndex(0),
            [(group_a, entities_a[0]), (group_b, entities_b[0])].into(),
        );
        ground_truth.insert(
            TimeIndex(29),
            [(group_a, entities_a[29]), (group_b, entities_b[29])].into(),
        );

        Scenario {
            data,
            ground_truth,
            group_a,
            group_b,
            entities_a,
            entities_b,
        }
    }

    #[test]
    fn test_recovers_both_full_paths() {
        let mut manager = EntityGroupManager::new();
        let scenario = opposite_tracks_scenario(&mut manager);
        let tracker = build_tracker();

        let results = tracker.process(
            scenario.data.iter().map(|(l, e, t)| (l, *e, *t)),
            &mut manager,
            &scenario.ground_truth,
            TimeIndex(0),
            TimeIndex(29),
            Progress::none(),
            &FlowProcessOptions::default(),
        );

        // Each group recovered exactly its 30 entities.
        assert_eq!(manager.group_size(scenario.group_a), 30);
        assert_eq!(manager.group_size(scenario.group_b), 30);
        for entity in &scenario.entities_a {
            assert!(manager.is_entity_in_group(scenario.group_a, *entity));
            assert!(!manager.is_entity_in_group(scenario.group_b, *entity));
        }
        for entity in &scenario.entities_b {
            assert!(manager.is_entity_in_group(scenario.group_b, *entity));
            assert!(!manager.is_entity_in_group(scenario.group_a, *entity));
        }

        // Smoothed sequences align with the processed frames.
        assert_eq!(results[&scenario.group_a].len(), 30);
        assert_eq!(results[&scenario.group_b].len(), 30);
        // Track B moves right-to-left; its smoothed x must descend.
        let states_b = &results[&scenario.group_b];
        assert!(states_b.first().unwrap().mean[0] > states_b.last().unwrap().mean[0]);
    }

    #[test]
    fn test_labelled_entities_are_never_overwritten() {
        let mut manager = EntityGroupManager::new();
        let scenario = opposite_tracks_scenario(&mut manager);

        // Hand-label one of track A's entities into a third group first.
        let manual_group = manager.create_group("manual", "");
        let protected = scenario.entities_a[10];
        manager.add_entity_to_group(manual_group, protected);

        let tracker = build_tracker();
        let _ = tracker.process(
            scenario.data.iter().map(|(l, e, t)| (l, *e, *t)),
            &mut manager,
            &scenario.ground_truth,
            TimeIndex(0),
            TimeIndex(29),
            Progress::none(),
            &FlowProcessOptions::default(),
        );

        assert!(manager.is_entity_in_group(manual_group, protected));
        assert!(!manager.is_entity_in_group(scenario.group_a, protected));
        // Everything else still landed in group A.
        assert_eq!(manager.group_size(scenario.group_a), 29);
    }

    #[test]
    fn test_output_group_remapping() {
        let mut manager = EntityGroupManager::new();
        let scenario = opposite_tracks_scenario(&mut manager);
        let review_group = manager.create_group("review", "");

        let mut options = FlowProcessOptions::default();
        options.output_group_ids.insert(scenario.group_a, review_group);

        let tracker = build_tracker();
        let _ = tracker.process(
            scenario.data.iter().map(|(l, e, t)| (l, *e, *t)),
            &mut manager,
            &scenario.ground_truth,
            TimeIndex(0),
            TimeIndex(29),
            Progress::none(),
            &options,
        );

        assert_eq!(manager.group_size(review_group), 30);
        assert_eq!(manager.group_size(scenario.group_a), 0);
        assert_eq!(manager.group_size(scenario.group_b), 30);
    }

    #[test]
    fn test_missing_anchor_skips_group_but_not_others() {
        let mut manager = EntityGroupManager::new();
        let mut scenario = opposite_tracks_scenario(&mut manager);

        // Break group A's end anchor: point it at an entity that exists
        // nowhere in the data.
        scenario
            .ground_truth
            .get_mut(&TimeIndex(29))
            .unwrap()
            .insert(scenario.group_a, EntityId(999_999));

        let tracker = build_tracker();
        let results = tracker.process(
            scenario.data.iter().map(|(l, e, t)| (l, *e, *t)),
            &mut manager,
            &scenario.ground_truth,
            TimeIndex(0),
            TimeIndex(29),
            Progress::none(),
            &FlowProcessOptions::default(),
        );

        assert!(!results.contains_key(&scenario.group_a));
        assert!(results.contains_key(&scenario.group_b));
        assert_eq!(manager.group_size(scenario.group_b), 30);
    }

    #[test]
    fn test_no_anchors_returns_empty() {
        let mut manager = EntityGroupManager::new();
        let scenario = opposite_tracks_scenario(&mut manager);
        let tracker = build_tracker();
        let results = tracker.process(
            scenario.data.iter().map(|(l, e, t)| (l, *e, *t)),
            &mut manager,
            &GroundTruthMap::new(),
            TimeIndex(0),
            TimeIndex(29),
            Progress::none(),
            &FlowProcessOptions::default(),
        );
        assert!(results.is_empty());
    }
}
