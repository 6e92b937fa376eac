//! The "RELATIONS" layer - Sparse Directed Edges Between Entities
//! ===============================================================
//!
//! Relationships link entities across containers: a mask series to the area
//! values computed from it, raw data to a processed product, correlated
//! observations to each other. Edges are sparse and typed; forward and
//! reverse hash indices are mutated as a matched pair for O(1) lookups in
//! both directions.

use crate::traceview_entity::EntityId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Type of a directed relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationshipType {
    /// Parent-child (e.g. mask series -> calculated area values).
    ParentChild,
    /// Derived data (e.g. input data -> processed output).
    Derived,
    /// General linkage (e.g. correlated entities).
    Linked,
}

/// Full description of one edge, including its optional label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRelationship {
    pub from: EntityId,
    pub to: EntityId,
    pub kind: RelationshipType,
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct RelationshipKey {
    from: EntityId,
    to: EntityId,
    kind: RelationshipType,
}

/// Sparse directed edge store with forward/reverse indices.
#[derive(Debug, Default)]
pub struct EntityRelationshipManager {
    /// from -> full triples originating there.
    forward: HashMap<EntityId, HashSet<RelationshipKey>>,
    /// to -> full triples terminating there.
    reverse: HashMap<EntityId, HashSet<RelationshipKey>>,
    labels: HashMap<RelationshipKey, String>,
}

impl EntityRelationshipManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an edge. Returns false when the exact `(from, to, kind)` triple is
    /// already present; storing a label replaces any prior label either way.
    pub fn add_relationship(
        &mut self,
        from: EntityId,
        to: EntityId,
        kind: RelationshipType,
        label: impl Into<String>,
    ) -> bool {
        let key = RelationshipKey { from, to, kind };
        let label = label.into();
        if !label.is_empty() || self.labels.contains_key(&key) {
            self.labels.insert(key, label);
        }
        let inserted = self.forward.entry(from).or_default().insert(key);
        if inserted {
            self.reverse.entry(to).or_default().insert(key);
        }
        inserted
    }

    /// Remove one edge. Returns false when the triple was absent.
    pub fn remove_relationship(&mut self, from: EntityId, to: EntityId, kind: RelationshipType) -> bool {
        let key = RelationshipKey { from, to, kind };
        let Some(out_edges) = self.forward.get_mut(&from) else {
            return false;
        };
        if !out_edges.remove(&key) {
            return false;
        }
        if out_edges.is_empty() {
            self.forward.remove(&from);
        }
        if let Some(in_edges) = self.reverse.get_mut(&to) {
            in_edges.remove(&key);
            if in_edges.is_empty() {
                self.reverse.remove(&to);
            }
        }
        self.labels.remove(&key);
        true
    }

    /// Remove every edge touching `entity_id`, as source or target.
    /// Runs in O(deg(entity)). Returns the number of edges removed.
    pub fn remove_all_relationships(&mut self, entity_id: EntityId) -> usize {
        let mut removed = 0;

        if let Some(out_edges) = self.forward.remove(&entity_id) {
            for key in out_edges {
                if let Some(in_edges) = self.reverse.get_mut(&key.to) {
                    in_edges.remove(&key);
                    if in_edges.is_empty() {
                        self.reverse.remove(&key.to);
                    }
                }
                self.labels.remove(&key);
                removed += 1;
            }
        }

        if let Some(in_edges) = self.reverse.remove(&entity_id) {
            for key in in_edges {
                if let Some(out_edges) = self.forward.get_mut(&key.from) {
                    if out_edges.remove(&key) {
                        removed += 1;
                        self.labels.remove(&key);
                    }
                    if out_edges.is_empty() {
                        self.forward.remove(&key.from);
                    }
                }
            }
        }

        removed
    }

    pub fn has_relationship(&self, from: EntityId, to: EntityId, kind: RelationshipType) -> bool {
        let key = RelationshipKey { from, to, kind };
        self.forward.get(&from).is_some_and(|s| s.contains(&key))
    }

    /// Targets of outgoing edges, optionally filtered by type.
    pub fn related_entities(&self, entity_id: EntityId, kind: Option<RelationshipType>) -> Vec<EntityId> {
        let mut out: Vec<EntityId> = self
            .forward
            .get(&entity_id)
            .map(|edges| {
                edges
                    .iter()
                    .filter(|k| kind.is_none_or(|t| k.kind == t))
                    .map(|k| k.to)
                    .collect()
            })
            .unwrap_or_default();
        out.sort_unstable();
        out
    }

    /// Sources of incoming edges, optionally filtered by type.
    pub fn reverse_related_entities(&self, entity_id: EntityId, kind: Option<RelationshipType>) -> Vec<EntityId> {
        let mut out: Vec<EntityId> = self
            .reverse
            .get(&entity_id)
            .map(|edges| {
                edges
                    .iter()
                    .filter(|k| kind.is_none_or(|t| k.kind == t))
                    .map(|k| k.from)
                    .collect()
            })
            .unwrap_or_default();
        out.sort_unstable();
        out
    }

    /// Entities with a `ParentChild` edge pointing at `entity_id`.
    pub fn parents(&self, entity_id: EntityId) -> Vec<EntityId> {
        self.reverse_related_entities(entity_id, Some(RelationshipType::ParentChild))
    }

    /// Entities this entity points at with a `ParentChild` edge.
    pub fn children(&self, entity_id: EntityId) -> Vec<EntityId> {
        self.related_entities(entity_id, Some(RelationshipType::ParentChild))
    }

    /// Materialise full edge descriptors for an entity.
    pub fn relationship_details(&self, entity_id: EntityId, include_reverse: bool) -> Vec<EntityRelationship> {
        let mut details = Vec::new();
        if let Some(edges) = self.forward.get(&entity_id) {
            for key in edges {
                details.push(self.materialise(key));
            }
        }
        if include_reverse {
            if let Some(edges) = self.reverse.get(&entity_id) {
                for key in edges {
                    // Self-loops already appear in the forward sweep.
                    if key.from != entity_id {
                        details.push(self.materialise(key));
                    }
                }
            }
        }
        details.sort_by_key(|r| (r.from, r.to));
        details
    }

    pub fn relationship_count(&self) -> usize {
        self.forward.values().map(HashSet::len).sum()
    }

    /// Entities that appear in at least one edge.
    pub fn entity_count(&self) -> usize {
        let mut entities: HashSet<EntityId> = self.forward.keys().copied().collect();
        entities.extend(self.reverse.keys().copied());
        entities.len()
    }

    /// Session reset.
    pub fn clear(&mut self) {
        self.forward.clear();
        self.reverse.clear();
        self.labels.clear();
    }

    fn materialise(&self, key: &RelationshipKey) -> EntityRelationship {
        EntityRelationship {
            from: key.from,
            to: key.to,
            kind: key.kind,
            label: self.labels.get(key).cloned().unwrap_or_default(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
