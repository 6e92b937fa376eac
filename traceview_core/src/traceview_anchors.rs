//! The "ANCHORS" layer - Ground-Truth Segments and Meta-Node Slicing
//! ==================================================================
//!
//! The min-cost-flow tracker works per ground-truth segment: a pair of
//! consecutive anchors for one group. This module turns a sparse
//! ground-truth map into segments, locates anchors inside meta-node chains,
//! and trims meta-nodes to a segment so the flow graph starts and ends
//! exactly at the anchors.

use crate::traceview_entity::EntityId;
use crate::traceview_filter::FilterState;
use crate::traceview_groups::GroupId;
use crate::traceview_time::TimeIndex;
use crate::validation::GroundTruthMap;
use std::collections::BTreeMap;

// ============================================================================
// FLOW NODE & META-NODE
// ============================================================================

/// One observation inside a flow path: `(frame, entity)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FlowNode {
    pub frame: TimeIndex,
    pub entity_id: EntityId,
}

/// A recovered per-group path through the observations.
pub type FlowPath = Vec<FlowNode>;

/// Greedily linked chain of frame-consecutive cheap assignments.
///
/// Meta-nodes let the flow solver operate on chains instead of individual
/// observations. Start/end filter states come from running the Kalman filter
/// along the chain during construction.
#[derive(Debug, Clone)]
pub struct MetaNode {
    /// Consecutive members in frame order.
    pub members: Vec<FlowNode>,
    pub start_frame: TimeIndex,
    pub end_frame: TimeIndex,
    pub start_entity: EntityId,
    pub end_entity: EntityId,
    /// Filter state after initialising on the first member.
    pub start_state: FilterState,
    /// Filter state after updating on the last member.
    pub end_state: FilterState,
}

impl MetaNode {
    /// Recompute the frame/entity boundary fields from `members`.
    fn refresh_bounds(&mut self) {
        if let (Some(first), Some(last)) = (self.members.first(), self.members.last()) {
            self.start_frame = first.frame;
            self.start_entity = first.entity_id;
            self.end_frame = last.frame;
            self.end_entity = last.entity_id;
        }
    }
}

// ============================================================================
// GROUND-TRUTH SEGMENTS
// ============================================================================

/// Consecutive anchor pair for one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroundTruthSegment {
    pub group_id: GroupId,
    pub start_frame: TimeIndex,
    pub start_entity: EntityId,
    pub end_frame: TimeIndex,
    pub end_entity: EntityId,
}

/// Split a ground-truth map into per-group segments of consecutive anchors.
///
/// Pairs on adjacent frames (gap <= 1) are skipped: there are no unlabelled
/// frames between them to assign.
pub fn extract_ground_truth_segments(ground_truth: &GroundTruthMap) -> Vec<GroundTruthSegment> {
    let mut per_group: BTreeMap<GroupId, Vec<(TimeIndex, EntityId)>> = BTreeMap::new();
    for (&frame, assignments) in ground_truth {
        for (&group_id, &entity_id) in assignments {
            per_group.entry(group_id).or_default().push((frame, entity_id));
        }
    }

    let mut segments = Vec::new();
    for (group_id, anchors) in per_group {
        // BTreeMap iteration already yields anchors frame-ordered.
        for pair in anchors.windows(2) {
            let (start_frame, start_entity) = pair[0];
            let (end_frame, end_entity) = pair[1];
            if end_frame - start_frame <= 1 {
                continue;
            }
            segments.push(GroundTruthSegment {
                group_id,
                start_frame,
                start_entity,
                end_frame,
                end_entity,
            });
        }
    }
    segments
}

// ============================================================================
// ANCHOR LOCATION
// ============================================================================

/// Positions of the two anchors inside a meta-node collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnchorPositions {
    pub start_meta_index: usize,
    pub start_member_index: usize,
    pub end_meta_index: usize,
    pub end_member_index: usize,
}

/// Find the meta-node and member indices holding each anchor of a segment.
pub fn find_anchor_positions(
    meta_nodes: &[MetaNode],
    segment: &GroundTruthSegment,
) -> Option<AnchorPositions> {
    let mut start: Option<(usize, usize)> = None;
    let mut end: Option<(usize, usize)> = None;

    for (i, node) in meta_nodes.iter().enumerate() {
        for (k, member) in node.members.iter().enumerate() {
            if start.is_none()
                && member.frame == segment.start_frame
                && member.entity_id == segment.start_entity
            {
                start = Some((i, k));
            }
            if end.is_none()
                && member.frame == segment.end_frame
                && member.entity_id == segment.end_entity
            {
                end = Some((i, k));
            }
        }
        if start.is_some() && end.is_some() {
            break;
        }
    }

    let ((start_meta_index, start_member_index), (end_meta_index, end_member_index)) =
        (start?, end?);
    Some(AnchorPositions {
        start_meta_index,
        start_member_index,
        end_meta_index,
        end_member_index,
    })
}

// ============================================================================
// SLICING
// ============================================================================

/// Trim meta-nodes to a segment so anchors sit exactly at the boundary
/// chain ends.
///
/// The meta-node holding the start anchor is spliced to begin at it, the one
/// holding the end anchor to end at it; interior nodes strictly inside the
/// segment are kept, and nodes straddling a boundary without containing its
/// anchor are discarded. Empty when either anchor is not found.
pub fn slice_meta_nodes_to_segment(
    meta_nodes: &[MetaNode],
    segment: &GroundTruthSegment,
) -> Vec<MetaNode> {
    let Some(positions) = find_anchor_positions(meta_nodes, segment) else {
        return Vec::new();
    };

    // Both anchors inside the same meta-node: a single inclusive slice.
    if positions.start_meta_index == positions.end_meta_index {
        if positions.start_member_index > positions.end_member_index {
            return Vec::new();
        }
        let source = &meta_nodes[positions.start_meta_index];
        let mut trimmed = source.clone();
        trimmed.members = source.members
            [positions.start_member_index..=positions.end_member_index]
            .to_vec();
        if trimmed.members.is_empty() {
            return Vec::new();
        }
        trimmed.refresh_bounds();
        return vec![trimmed];
    }

    let mut output = Vec::with_capacity(meta_nodes.len());
    for (i, node) in meta_nodes.iter().enumerate() {
        if node.end_frame < segment.start_frame || node.start_frame > segment.end_frame {
            continue;
        }

        if i == positions.start_meta_index {
            // Suffix from the start anchor, stopping before the end boundary.
            let mut trimmed = node.clone();
            trimmed.members = node.members[positions.start_member_index..]
                .iter()
                .copied()
                .take_while(|m| m.frame < segment.end_frame)
                .collect();
            if trimmed.members.is_empty() {
                continue;
            }
            trimmed.refresh_bounds();
            output.push(trimmed);
            continue;
        }

        if i == positions.end_meta_index {
            // Prefix up to the end anchor, excluding the start boundary.
            let mut trimmed = node.clone();
            trimmed.members = node.members[..=positions.end_member_index]
                .iter()
                .copied()
                .filter(|m| m.frame > segment.start_frame)
                .collect();
            if trimmed.members.is_empty() {
                continue;
            }
            trimmed.refresh_bounds();
            output.push(trimmed);
            continue;
        }

        // Interior nodes must lie strictly within the open segment.
        if node.start_frame > segment.start_frame && node.end_frame < segment.end_frame {
            output.push(node.clone());
        }
    }

    output
}

/// Fallback path when the solver fails: concatenate the trimmed start and
/// end meta-nodes, deduplicating a shared boundary node.
pub fn fallback_path_from_trimmed(
    trimmed: &[MetaNode],
    start_meta_index: Option<usize>,
    end_meta_index: Option<usize>,
) -> FlowPath {
    let mut path = FlowPath::new();
    if let Some(start) = start_meta_index {
        if let Some(node) = trimmed.get(start) {
            path.extend(node.members.iter().copied());
        }
    }
    if let Some(end) = end_meta_index {
        if start_meta_index != Some(end) {
            if let Some(node) = trimmed.get(end) {
                for member in &node.members {
                    if path.last() != Some(member) {
                        path.push(*member);
                    }
                }
            }
        }
    }
    path
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id_base: u64, frames: std::ops::RangeInclusive<i64>) -> MetaNode {
        let members: Vec<FlowNode> = frames
            .map(|f| FlowNode {
                frame: TimeIndex(f),
                entity_id: EntityId(id_base + f as u64),
            })
            .collect();
        let mut meta = MetaNode {
            members,
            start_frame: TimeIndex(0),
            end_frame: TimeIndex(0),
            start_entity: EntityId::INVALID,
            end_entity: EntityId::INVALID,
            start_state: FilterState::zeros(2),
            end_state: FilterState::zeros(2),
        };
        meta.refresh_bounds();
        meta
    }

    fn segment(group: GroupId, start: (i64, u64), end: (i64, u64)) -> GroundTruthSegment {
        GroundTruthSegment {
            group_id: group,
            start_frame: TimeIndex(start.0),
            start_entity: EntityId(start.1),
            end_frame: TimeIndex(end.0),
            end_entity: EntityId(end.1),
        }
    }

    #[test]
    fn test_extract_segments_orders_and_skips_adjacent() {
        let mut ground_truth = GroundTruthMap::new();
        ground_truth.insert(TimeIndex(0), [(1, EntityId(10))].into());
        ground_truth.insert(TimeIndex(1), [(1, EntityId(11))].into());
        ground_truth.insert(TimeIndex(50), [(1, EntityId(12)), (2, EntityId(20))].into());
        ground_truth.insert(TimeIndex(90), [(2, EntityId(21))].into());

        let segments = extract_ground_truth_segments(&ground_truth);
        // (0,1) is adjacent and skipped; (1,50) and the group-2 pair survive
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].group_id, 1);
        assert_eq!(segments[0].start_frame, TimeIndex(1));
        assert_eq!(segments[0].end_frame, TimeIndex(50));
        assert_eq!(segments[1].group_id, 2);
        assert_eq!(segments[1].start_entity, EntityId(20));
    }

    #[test]
    fn test_find_anchor_positions() {
        let nodes = vec![node(100, 0..=4), node(200, 5..=9)];
        let seg = segment(1, (2, 102), (7, 207));
        let positions = find_anchor_positions(&nodes, &seg).unwrap();
        assert_eq!(positions.start_meta_index, 0);
        assert_eq!(positions.start_member_index, 2);
        assert_eq!(positions.end_meta_index, 1);
        assert_eq!(positions.end_member_index, 2);

        let missing = segment(1, (2, 999), (7, 207));
        assert!(find_anchor_positions(&nodes, &missing).is_none());
    }

    #[test]
    fn test_slice_same_meta_node() {
        let nodes = vec![node(100, 0..=9)];
        let seg = segment(1, (2, 102), (6, 106));
        let trimmed = slice_meta_nodes_to_segment(&nodes, &seg);
        assert_eq!(trimmed.len(), 1);
        assert_eq!(trimmed[0].start_frame, TimeIndex(2));
        assert_eq!(trimmed[0].end_frame, TimeIndex(6));
        assert_eq!(trimmed[0].members.len(), 5);
    }

    #[test]
    fn test_slice_splices_boundary_nodes_and_drops_straddlers() {
        let nodes = vec![
            node(100, 0..=4),  // holds the start anchor at frame 2
            node(200, 5..=7),  // interior
            node(300, 6..=12), // straddles the end boundary without the anchor
            node(400, 8..=10), // holds the end anchor at frame 10
            node(500, 11..=14), // past the segment
        ];
        let seg = segment(1, (2, 102), (10, 410));
        let trimmed = slice_meta_nodes_to_segment(&nodes, &seg);

        // Start node spliced to 2..=4, interior kept, straddler discarded,
        // end node kept up to the anchor, tail node gone.
        assert_eq!(trimmed.len(), 3);
        assert_eq!(trimmed[0].start_frame, TimeIndex(2));
        assert_eq!(trimmed[0].end_frame, TimeIndex(4));
        assert_eq!(trimmed[1].start_frame, TimeIndex(5));
        assert_eq!(trimmed[2].start_frame, TimeIndex(8));
        assert_eq!(trimmed[2].end_frame, TimeIndex(10));
        assert_eq!(trimmed[2].end_entity, EntityId(410));
    }

    #[test]
    fn test_slice_missing_anchor_is_empty() {
        let nodes = vec![node(100, 0..=4)];
        let seg = segment(1, (0, 100), (10, 999));
        assert!(slice_meta_nodes_to_segment(&nodes, &seg).is_empty());
    }

    #[test]
    fn test_fallback_path_concatenates_and_dedups() {
        let trimmed = vec![node(100, 0..=3), node(200, 4..=6)];
        let path = fallback_path_from_trimmed(&trimmed, Some(0), Some(1));
        assert_eq!(path.len(), 7);
        assert_eq!(path[0].frame, TimeIndex(0));
        assert_eq!(path[6].frame, TimeIndex(6));

        // Same node on both ends collapses to its members once
        let single = vec![node(100, 0..=3)];
        let path = fallback_path_from_trimmed(&single, Some(0), Some(0));
        assert_eq!(path.len(), 4);
    }
}
