//! The "GROUPS" layer - User-Defined Sets of Entities
//! ===================================================
//!
//! A group names a semantic identity (a tracked whisker, a labelled object)
//! as a set of entity ids. Membership is many-to-many: an entity may belong
//! to zero, one, or many groups. The manager keeps forward and reverse hash
//! indices that are mutated as a matched pair, so the bidirectional
//! invariant `e ∈ forward(g) ⇔ g ∈ reverse(e)` holds after every operation
//! and no observer can see only half of the pair.

use crate::observer::ObserverRegistry;
use crate::traceview_entity::EntityId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Unique identifier for a user-defined group. `0` is the invalid sentinel;
/// real ids start at 1 and are never reused within a session.
pub type GroupId = u64;

/// Invalid/null group sentinel.
pub const INVALID_GROUP: GroupId = 0;

/// Metadata for one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDescriptor {
    pub id: GroupId,
    pub name: String,
    pub description: String,
    pub entity_count: usize,
}

/// Bidirectional many-to-many map between groups and entities.
#[derive(Default)]
pub struct EntityGroupManager {
    group_names: HashMap<GroupId, String>,
    group_descriptions: HashMap<GroupId, String>,

    /// Forward: group -> member entities.
    group_entities: HashMap<GroupId, HashSet<EntityId>>,
    /// Reverse: entity -> containing groups. Empty entries are purged.
    entity_groups: HashMap<EntityId, HashSet<GroupId>>,

    next_group_id: GroupId,

    group_observers: ObserverRegistry,
}

impl EntityGroupManager {
    pub fn new() -> Self {
        Self {
            group_names: HashMap::new(),
            group_descriptions: HashMap::new(),
            group_entities: HashMap::new(),
            entity_groups: HashMap::new(),
            next_group_id: 1,
            group_observers: ObserverRegistry::new(),
        }
    }

    // ========================================================================
    // GROUP CRUD
    // ========================================================================

    /// Create a new empty group and return its id.
    pub fn create_group(&mut self, name: impl Into<String>, description: impl Into<String>) -> GroupId {
        let id = self.next_group_id;
        self.next_group_id += 1;
        self.group_names.insert(id, name.into());
        self.group_descriptions.insert(id, description.into());
        self.group_entities.insert(id, HashSet::new());
        id
    }

    /// Delete a group and all its memberships. Newly-empty reverse entries
    /// are purged. Returns whether the group existed.
    pub fn delete_group(&mut self, group_id: GroupId) -> bool {
        let Some(members) = self.group_entities.remove(&group_id) else {
            return false;
        };
        self.group_names.remove(&group_id);
        self.group_descriptions.remove(&group_id);
        for entity_id in members {
            if let Some(groups) = self.entity_groups.get_mut(&entity_id) {
                groups.remove(&group_id);
                if groups.is_empty() {
                    self.entity_groups.remove(&entity_id);
                }
            }
        }
        true
    }

    pub fn has_group(&self, group_id: GroupId) -> bool {
        self.group_entities.contains_key(&group_id)
    }

    pub fn group_descriptor(&self, group_id: GroupId) -> Option<GroupDescriptor> {
        let members = self.group_entities.get(&group_id)?;
        Some(GroupDescriptor {
            id: group_id,
            name: self.group_names.get(&group_id).cloned().unwrap_or_default(),
            description: self
                .group_descriptions
                .get(&group_id)
                .cloned()
                .unwrap_or_default(),
            entity_count: members.len(),
        })
    }

    /// Update name and description. Returns whether the group existed.
    pub fn update_group(
        &mut self,
        group_id: GroupId,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> bool {
        if !self.has_group(group_id) {
            return false;
        }
        self.group_names.insert(group_id, name.into());
        self.group_descriptions.insert(group_id, description.into());
        true
    }

    /// Ids of every existing group, sorted ascending for deterministic iteration.
    pub fn all_group_ids(&self) -> Vec<GroupId> {
        let mut ids: Vec<GroupId> = self.group_entities.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn all_group_descriptors(&self) -> Vec<GroupDescriptor> {
        self.all_group_ids()
            .into_iter()
            .filter_map(|id| self.group_descriptor(id))
            .collect()
    }

    /// Find a group by exact name; first match in id order.
    pub fn find_group_by_name(&self, name: &str) -> Option<GroupId> {
        self.all_group_ids()
            .into_iter()
            .find(|id| self.group_names.get(id).map(String::as_str) == Some(name))
    }

    // ========================================================================
    // MEMBERSHIP
    // ========================================================================

    /// Add one entity to a group. Returns false if the group does not exist
    /// or the entity is already a member.
    pub fn add_entity_to_group(&mut self, group_id: GroupId, entity_id: EntityId) -> bool {
        let Some(members) = self.group_entities.get_mut(&group_id) else {
            return false;
        };
        if !members.insert(entity_id) {
            return false;
        }
        self.entity_groups.entry(entity_id).or_default().insert(group_id);
        true
    }

    /// Add a batch of entities. Returns the number actually added
    /// (duplicates and unknown groups excluded).
    pub fn add_entities_to_group(&mut self, group_id: GroupId, entity_ids: &[EntityId]) -> usize {
        let Some(members) = self.group_entities.get_mut(&group_id) else {
            return 0;
        };
        members.reserve(entity_ids.len());
        self.entity_groups.reserve(entity_ids.len());

        let mut added = 0;
        for &entity_id in entity_ids {
            if !members.insert(entity_id) {
                continue;
            }
            self.entity_groups.entry(entity_id).or_default().insert(group_id);
            added += 1;
        }
        added
    }

    /// Remove one entity from a group. Purges an emptied reverse entry.
    pub fn remove_entity_from_group(&mut self, group_id: GroupId, entity_id: EntityId) -> bool {
        let Some(members) = self.group_entities.get_mut(&group_id) else {
            return false;
        };
        if !members.remove(&entity_id) {
            return false;
        }
        if let Some(groups) = self.entity_groups.get_mut(&entity_id) {
            groups.remove(&group_id);
            if groups.is_empty() {
                self.entity_groups.remove(&entity_id);
            }
        }
        true
    }

    /// Remove a batch of entities from a group; returns the number removed.
    pub fn remove_entities_from_group(&mut self, group_id: GroupId, entity_ids: &[EntityId]) -> usize {
        entity_ids
            .iter()
            .filter(|&&e| self.remove_entity_from_group(group_id, e))
            .count()
    }

    /// Members of a group; empty if the group does not exist.
    pub fn entities_in_group(&self, group_id: GroupId) -> Vec<EntityId> {
        let mut out: Vec<EntityId> = self
            .group_entities
            .get(&group_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        out.sort_unstable();
        out
    }

    pub fn is_entity_in_group(&self, group_id: GroupId, entity_id: EntityId) -> bool {
        self.group_entities
            .get(&group_id)
            .is_some_and(|s| s.contains(&entity_id))
    }

    /// Reverse lookup: every group containing the entity.
    pub fn groups_containing_entity(&self, entity_id: EntityId) -> Vec<GroupId> {
        let mut out: Vec<GroupId> = self
            .entity_groups
            .get(&entity_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        out.sort_unstable();
        out
    }

    pub fn group_size(&self, group_id: GroupId) -> usize {
        self.group_entities.get(&group_id).map_or(0, HashSet::len)
    }

    /// Remove every member of a group without deleting the group itself.
    pub fn clear_group(&mut self, group_id: GroupId) -> bool {
        let Some(members) = self.group_entities.get_mut(&group_id) else {
            return false;
        };
        let drained: Vec<EntityId> = members.drain().collect();
        for entity_id in drained {
            if let Some(groups) = self.entity_groups.get_mut(&entity_id) {
                groups.remove(&group_id);
                if groups.is_empty() {
                    self.entity_groups.remove(&entity_id);
                }
            }
        }
        true
    }

    /// Session reset: drop all groups and memberships. Group ids keep
    /// counting up; ids are never reused within a session.
    pub fn clear(&mut self) {
        self.group_names.clear();
        self.group_descriptions.clear();
        self.group_entities.clear();
        self.entity_groups.clear();
    }

    pub fn group_count(&self) -> usize {
        self.group_entities.len()
    }

    /// Unique entities across all groups.
    pub fn total_entity_count(&self) -> usize {
        self.entity_groups.len()
    }

    // ========================================================================
    // OBSERVERS
    // ========================================================================

    /// Observer sink for group changes. Callers notify once per batch
    /// boundary via [`EntityGroupManager::notify_groups_changed`].
    pub fn group_observers(&mut self) -> &mut ObserverRegistry {
        &mut self.group_observers
    }

    pub fn notify_groups_changed(&self) {
        self.group_observers.notify();
    }
}

impl std::fmt::Debug for EntityGroupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityGroupManager")
            .field("group_count", &self.group_count())
            .field("total_entity_count", &self.total_entity_count())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn e(id: u64) -> EntityId {
        EntityId(id)
    }

    #[test]
    fn test_create_and_retrieve_groups() {
        let mut manager = EntityGroupManager::new();
        let g1 = manager.create_group("Whisker 1", "First whisker");
        let g2 = manager.create_group("Whisker 2", "");

        assert_ne!(g1, INVALID_GROUP);
        assert_ne!(g1, g2);
        assert!(manager.has_group(g1));

        let desc = manager.group_descriptor(g1).unwrap();
        assert_eq!(desc.name, "Whisker 1");
        assert_eq!(desc.description, "First whisker");
        assert_eq!(desc.entity_count, 0);
    }

    #[test]
    fn test_update_group_metadata() {
        let mut manager = EntityGroupManager::new();
        let g = manager.create_group("old", "old desc");
        assert!(manager.update_group(g, "new", "new desc"));
        let desc = manager.group_descriptor(g).unwrap();
        assert_eq!(desc.name, "new");
        assert_eq!(desc.description, "new desc");
        assert!(!manager.update_group(9999, "x", "y"));
    }

    #[test]
    fn test_delete_group_purges_reverse_entries() {
        let mut manager = EntityGroupManager::new();
        let g1 = manager.create_group("a", "");
        let g2 = manager.create_group("b", "");
        manager.add_entity_to_group(g1, e(10));
        manager.add_entity_to_group(g2, e(10));
        manager.add_entity_to_group(g1, e(11));

        assert!(manager.delete_group(g1));
        assert!(!manager.has_group(g1));
        // e10 still belongs to g2; e11 is purged entirely
        assert_eq!(manager.groups_containing_entity(e(10)), vec![g2]);
        assert!(manager.groups_containing_entity(e(11)).is_empty());
        assert_eq!(manager.total_entity_count(), 1);
        assert!(!manager.delete_group(g1));
    }

    #[test]
    fn test_group_ids_never_reused() {
        let mut manager = EntityGroupManager::new();
        let g1 = manager.create_group("a", "");
        manager.delete_group(g1);
        let g2 = manager.create_group("b", "");
        assert!(g2 > g1);
    }

    #[test]
    fn test_membership_add_remove() {
        let mut manager = EntityGroupManager::new();
        let g = manager.create_group("g", "");

        assert!(manager.add_entity_to_group(g, e(1)));
        assert!(!manager.add_entity_to_group(g, e(1)), "duplicate add reports false");
        assert!(!manager.add_entity_to_group(9999, e(1)), "unknown group is a no-op");

        assert!(manager.is_entity_in_group(g, e(1)));
        assert!(manager.remove_entity_from_group(g, e(1)));
        assert!(!manager.remove_entity_from_group(g, e(1)));
        assert!(manager.groups_containing_entity(e(1)).is_empty());
    }

    #[test]
    fn test_batch_operations() {
        let mut manager = EntityGroupManager::new();
        let g = manager.create_group("g", "");
        let ids: Vec<EntityId> = (1..=100).map(e).collect();

        assert_eq!(manager.add_entities_to_group(g, &ids), 100);
        // Re-adding with some new ones only counts the new ones
        let more: Vec<EntityId> = (51..=150).map(e).collect();
        assert_eq!(manager.add_entities_to_group(g, &more), 50);
        assert_eq!(manager.group_size(g), 150);

        assert_eq!(manager.remove_entities_from_group(g, &ids), 100);
        assert_eq!(manager.group_size(g), 50);
        assert_eq!(manager.add_entities_to_group(9999, &ids), 0);
    }

    #[test]
    fn test_bidirectional_invariant() {
        let mut manager = EntityGroupManager::new();
        let g1 = manager.create_group("a", "");
        let g2 = manager.create_group("b", "");
        for i in 0..50 {
            manager.add_entity_to_group(g1, e(i));
            if i % 2 == 0 {
                manager.add_entity_to_group(g2, e(i));
            }
        }
        manager.remove_entity_from_group(g1, e(4));
        manager.clear_group(g2);

        for gid in manager.all_group_ids() {
            for entity in manager.entities_in_group(gid) {
                assert!(manager.groups_containing_entity(entity).contains(&gid));
            }
        }
        for i in 0..50 {
            for gid in manager.groups_containing_entity(e(i)) {
                assert!(manager.is_entity_in_group(gid, e(i)));
            }
        }
    }

    #[test]
    fn test_clear_group_keeps_group() {
        let mut manager = EntityGroupManager::new();
        let g = manager.create_group("g", "");
        manager.add_entity_to_group(g, e(1));
        assert!(manager.clear_group(g));
        assert!(manager.has_group(g));
        assert_eq!(manager.group_size(g), 0);
        assert_eq!(manager.total_entity_count(), 0);
    }

    #[test]
    fn test_counts_and_clear_all() {
        let mut manager = EntityGroupManager::new();
        assert_eq!(manager.group_count(), 0);
        assert_eq!(manager.total_entity_count(), 0);

        let g1 = manager.create_group("a", "");
        let g2 = manager.create_group("b", "");
        manager.add_entity_to_group(g1, e(1));
        manager.add_entity_to_group(g1, e(2));
        manager.add_entity_to_group(g2, e(2));
        assert_eq!(manager.group_count(), 2);
        assert_eq!(manager.total_entity_count(), 2);

        manager.clear();
        assert_eq!(manager.group_count(), 0);
        assert_eq!(manager.total_entity_count(), 0);
    }

    #[test]
    fn test_observer_notified_once_per_batch() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let mut manager = EntityGroupManager::new();
        let notified = Arc::new(AtomicUsize::new(0));
        let notified_clone = Arc::clone(&notified);
        manager.group_observers().subscribe(Box::new(move || {
            notified_clone.fetch_add(1, Ordering::Relaxed);
        }));

        let g = manager.create_group("g", "");
        let ids: Vec<EntityId> = (1..=10).map(e).collect();
        manager.add_entities_to_group(g, &ids);
        manager.notify_groups_changed();
        assert_eq!(notified.load(Ordering::Relaxed), 1);
    }
}
