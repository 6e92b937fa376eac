//! Ground-truth map validation.
//!
//! Anchors drive both trackers, so malformed maps are rejected before any
//! filtering starts: an entity bound to two different groups at the same
//! frame has no consistent assignment, and the invalid entity sentinel can
//! never anchor anything.

use crate::traceview_entity::EntityId;
use crate::traceview_groups::GroupId;
use crate::traceview_time::TimeIndex;
use std::collections::BTreeMap;
use thiserror::Error;

/// Sparse anchors: frame -> (group -> entity). Only frames with provided
/// truth appear; the trackers treat these as fixed assignments.
pub type GroundTruthMap = BTreeMap<TimeIndex, BTreeMap<GroupId, EntityId>>;

/// Why a ground-truth map was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GroundTruthError {
    #[error("frame {frame}: entity {entity} anchored under groups {first_group} and {second_group}")]
    DuplicateEntity {
        frame: TimeIndex,
        entity: EntityId,
        first_group: GroupId,
        second_group: GroupId,
    },

    #[error("frame {frame}: group {group} anchored to the invalid entity id")]
    InvalidEntity { frame: TimeIndex, group: GroupId },

    #[error("frame {frame}: anchor references the invalid group id")]
    InvalidGroup { frame: TimeIndex },
}

/// Check a ground-truth map against the anchor invariants.
pub fn validate_ground_truth(ground_truth: &GroundTruthMap) -> Result<(), GroundTruthError> {
    for (&frame, assignments) in ground_truth {
        let mut seen: BTreeMap<EntityId, GroupId> = BTreeMap::new();
        for (&group, &entity) in assignments {
            if group == crate::traceview_groups::INVALID_GROUP {
                return Err(GroundTruthError::InvalidGroup { frame });
            }
            if !entity.is_valid() {
                return Err(GroundTruthError::InvalidEntity { frame, group });
            }
            if let Some(&first_group) = seen.get(&entity) {
                return Err(GroundTruthError::DuplicateEntity {
                    frame,
                    entity,
                    first_group,
                    second_group: group,
                });
            }
            seen.insert(entity, group);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_with(frame: i64, pairs: &[(GroupId, u64)]) -> GroundTruthMap {
        let mut map = GroundTruthMap::new();
        let inner: BTreeMap<GroupId, EntityId> =
            pairs.iter().map(|&(g, e)| (g, EntityId(e))).collect();
        map.insert(TimeIndex(frame), inner);
        map
    }

    #[test]
    fn test_valid_map_passes() {
        let map = map_with(0, &[(1, 10), (2, 20)]);
        assert!(validate_ground_truth(&map).is_ok());
        assert!(validate_ground_truth(&GroundTruthMap::new()).is_ok());
    }

    #[test]
    fn test_duplicate_entity_rejected() {
        let map = map_with(5, &[(1, 10), (2, 10)]);
        let err = validate_ground_truth(&map).unwrap_err();
        assert_eq!(
            err,
            GroundTruthError::DuplicateEntity {
                frame: TimeIndex(5),
                entity: EntityId(10),
                first_group: 1,
                second_group: 2,
            }
        );
    }

    #[test]
    fn test_same_entity_different_frames_allowed() {
        let mut map = map_with(0, &[(1, 10)]);
        map.extend(map_with(1, &[(2, 10)]));
        assert!(validate_ground_truth(&map).is_ok());
    }

    #[test]
    fn test_invalid_ids_rejected() {
        let map = map_with(3, &[(1, 0)]);
        assert!(matches!(
            validate_ground_truth(&map),
            Err(GroundTruthError::InvalidEntity { .. })
        ));

        let map = map_with(3, &[(0, 5)]);
        assert!(matches!(
            validate_ground_truth(&map),
            Err(GroundTruthError::InvalidGroup { .. })
        ));
    }
}
