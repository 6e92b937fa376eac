//! The "SESSION" layer - Per-Session Ownership of Every Component
//! ===============================================================
//!
//! There is no global state in the core: a [`Session`] transitively owns the
//! entity registry, the group and relationship managers, the named container
//! table, and the transform registry. All mutation goes through one writer;
//! read-only analyses may run elsewhere only while no mutating operation is
//! in flight.

use crate::traceview_entity::EntityRegistry;
use crate::traceview_groups::EntityGroupManager;
use crate::traceview_relations::EntityRelationshipManager;
use crate::traceview_transforms::{DataVariant, TransformRegistry};
use std::collections::BTreeMap;
use uuid::Uuid;

/// One analysis session: the single owner of all core state.
pub struct Session {
    id: Uuid,
    registry: EntityRegistry,
    groups: EntityGroupManager,
    relationships: EntityRelationshipManager,
    containers: BTreeMap<String, DataVariant>,
    transforms: TransformRegistry,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            registry: EntityRegistry::new(),
            groups: EntityGroupManager::new(),
            relationships: EntityRelationshipManager::new(),
            containers: BTreeMap::new(),
            transforms: TransformRegistry::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut EntityRegistry {
        &mut self.registry
    }

    pub fn groups(&self) -> &EntityGroupManager {
        &self.groups
    }

    pub fn groups_mut(&mut self) -> &mut EntityGroupManager {
        &mut self.groups
    }

    pub fn relationships(&self) -> &EntityRelationshipManager {
        &self.relationships
    }

    pub fn relationships_mut(&mut self) -> &mut EntityRelationshipManager {
        &mut self.relationships
    }

    pub fn transforms(&self) -> &TransformRegistry {
        &self.transforms
    }

    // ========================================================================
    // NAMED CONTAINERS
    // ========================================================================

    /// Register a container handle under a data key. Replaces any previous
    /// handle of the same name.
    pub fn set_container(&mut self, name: impl Into<String>, variant: DataVariant) {
        self.containers.insert(name.into(), variant);
    }

    pub fn container(&self, name: &str) -> Option<&DataVariant> {
        self.containers.get(name)
    }

    pub fn remove_container(&mut self, name: &str) -> Option<DataVariant> {
        self.containers.remove(name)
    }

    /// Names in sorted order.
    pub fn container_names(&self) -> Vec<&str> {
        self.containers.keys().map(String::as_str).collect()
    }

    /// Session reset: drop every container, group, relationship, and entity
    /// mapping. The session keeps its identity.
    pub fn clear(&mut self) {
        self.containers.clear();
        self.groups.clear();
        self.relationships.clear();
        self.registry.clear();
    }
}
