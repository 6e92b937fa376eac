//! The "ENTITY" layer - Stable Identifiers for Per-Frame Observations
//! ===================================================================
//!
//! Every individually addressable observation in a session (a line at a
//! frame, a point at a time, an interval, ...) is minted a stable
//! [`EntityId`] keyed by `(data key, kind, time index, local index)`. The
//! registry is a bijection for the session lifetime: the same key always
//! resolves to the same id, ids grow monotonically, and id `0` is the
//! reserved invalid sentinel that is never issued.

use crate::traceview_time::TimeIndex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ============================================================================
// ENTITY ID
// ============================================================================

/// Opaque 64-bit handle for one observation. `0` means unbound/invalid.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct EntityId(pub u64);

impl EntityId {
    /// Reserved sentinel: never minted by a registry.
    pub const INVALID: EntityId = EntityId(0);

    #[inline]
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// ENTITY KEY
// ============================================================================

/// Category of time-series data an entity belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Event,
    Interval,
    Point,
    Line,
    Mask,
    Analog,
    Other,
}

/// Composite key identifying one observation across the whole session.
///
/// This tuple is the only persisted identity: reloading a session replays
/// entries in order and re-mints equivalent ids through [`EntityRegistry::ensure_id`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub data_key: String,
    pub kind: EntityKind,
    pub time: TimeIndex,
    pub local_index: usize,
}

impl EntityKey {
    pub fn new(data_key: impl Into<String>, kind: EntityKind, time: TimeIndex, local_index: usize) -> Self {
        Self {
            data_key: data_key.into(),
            kind,
            time,
            local_index,
        }
    }
}

// ============================================================================
// ENTITY REGISTRY
// ============================================================================

/// Ids restart here after [`EntityRegistry::clear`]; stays ≥ 1 so the invalid
/// sentinel is never issued.
const ID_BASE: u64 = 1;

/// Session-scoped bijection from entity keys to entity ids.
#[derive(Debug, Default)]
pub struct EntityRegistry {
    ids_by_key: HashMap<EntityKey, EntityId>,
    keys_by_id: HashMap<EntityId, EntityKey>,
    next_id: u64,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self {
            ids_by_key: HashMap::new(),
            keys_by_id: HashMap::new(),
            next_id: ID_BASE,
        }
    }

    /// Return the id for `key`, minting a fresh one on first sight.
    ///
    /// Idempotent: the same key maps to the same id for the session lifetime.
    pub fn ensure_id(&mut self, key: &EntityKey) -> EntityId {
        if let Some(&id) = self.ids_by_key.get(key) {
            return id;
        }
        let id = EntityId(self.next_id);
        self.next_id += 1;
        self.ids_by_key.insert(key.clone(), id);
        self.keys_by_id.insert(id, key.clone());
        id
    }

    /// Look up an id without minting. `None` if the key was never registered.
    pub fn lookup(&self, key: &EntityKey) -> Option<EntityId> {
        self.ids_by_key.get(key).copied()
    }

    /// Reverse lookup from id to the registered key.
    pub fn key_of(&self, id: EntityId) -> Option<&EntityKey> {
        self.keys_by_id.get(&id)
    }

    /// Number of entities minted so far.
    pub fn entity_count(&self) -> usize {
        self.ids_by_key.len()
    }

    /// Session reset: drop all mappings and restart the generator.
    pub fn clear(&mut self) {
        self.ids_by_key.clear();
        self.keys_by_id.clear();
        self.next_id = ID_BASE;
    }
}

// ============================================================================
// TESTS
// ============================================================================
