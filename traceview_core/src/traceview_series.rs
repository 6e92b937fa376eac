//! The "SERIES" layer - Time-Indexed Containers
//! =============================================
//!
//! Observations live in ragged per-frame containers: each frame holds an
//! ordered sequence of typed entries, each entry carrying the data value and
//! its entity id. Points, lines, and masks share one generic container;
//! intervals, events, and analog samples have flat specialised stores.
//!
//! Identity rules:
//! - Entries added before an identity context is bound carry
//!   [`EntityId::INVALID`] and acquire real ids the first time the container
//!   is materialised against the session registry.
//! - Copying entries to another container mints NEW ids in the destination;
//!   moving preserves the original ids and updates both indices.

use crate::observer::{Notify, ObserverRegistry};
use crate::traceview_entity::{EntityId, EntityKey, EntityKind, EntityRegistry};
use crate::traceview_time::{IndexRounding, TimeFrame, TimeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

// ============================================================================
// GEOMETRIC VALUE TYPES
// ============================================================================

/// 2D point in image/sample coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point2 {
    pub x: f32,
    pub y: f32,
}

impl Point2 {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Ordered polyline.
pub type Line2 = Vec<Point2>;

/// Binary mask stored as its set pixels.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Mask2 {
    pub pixels: Vec<Point2>,
}

/// Mean of all points of a polyline; origin for an empty line.
pub fn line_centroid(line: &Line2) -> (f64, f64) {
    if line.is_empty() {
        return (0.0, 0.0);
    }
    let (mut sx, mut sy) = (0.0f64, 0.0f64);
    for p in line {
        sx += f64::from(p.x);
        sy += f64::from(p.y);
    }
    let n = line.len() as f64;
    (sx / n, sy / n)
}

/// First point of a polyline; origin for an empty line.
pub fn line_base_point(line: &Line2) -> (f64, f64) {
    line.first()
        .map_or((0.0, 0.0), |p| (f64::from(p.x), f64::from(p.y)))
}

/// Cumulative segment length of a polyline.
pub fn line_arc_length(line: &Line2) -> f64 {
    line.windows(2)
        .map(|w| {
            let dx = f64::from(w[1].x) - f64::from(w[0].x);
            let dy = f64::from(w[1].y) - f64::from(w[0].y);
            (dx * dx + dy * dy).sqrt()
        })
        .sum()
}

// ============================================================================
// RAGGED SERIES
// ============================================================================

/// One stored observation: the value plus its stable identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesEntry<T> {
    pub data: T,
    pub entity_id: EntityId,
}

/// Binding that lets a container mint entity ids for its entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityContext {
    pub data_key: String,
    pub kind: EntityKind,
}

/// Flattened view item: `(time, entity, data)` for zero-copy consumption by
/// the trackers.
#[derive(Debug, Clone, Copy)]
pub struct FlatItem<'a, T> {
    pub time: TimeIndex,
    pub entity_id: EntityId,
    pub data: &'a T,
}

/// Ragged per-frame container of typed entries.
pub struct RaggedSeries<T> {
    frames: BTreeMap<TimeIndex, Vec<SeriesEntry<T>>>,
    /// Sublinear lookup by entity id.
    entity_index: HashMap<EntityId, (TimeIndex, usize)>,
    identity: Option<IdentityContext>,
    time_frame: Option<Arc<TimeFrame>>,
    observers: ObserverRegistry,
}

/// Ragged container of points.
pub type PointSeries = RaggedSeries<Point2>;
/// Ragged container of polylines.
pub type LineSeries = RaggedSeries<Line2>;
/// Ragged container of masks.
pub type MaskSeries = RaggedSeries<Mask2>;

impl<T> Default for RaggedSeries<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RaggedSeries<T> {
    pub fn new() -> Self {
        Self {
            frames: BTreeMap::new(),
            entity_index: HashMap::new(),
            identity: None,
            time_frame: None,
            observers: ObserverRegistry::new(),
        }
    }

    pub fn with_identity(data_key: impl Into<String>, kind: EntityKind) -> Self {
        let mut series = Self::new();
        series.bind_identity(data_key, kind);
        series
    }

    /// Bind the identity context used when minting entity ids.
    pub fn bind_identity(&mut self, data_key: impl Into<String>, kind: EntityKind) {
        self.identity = Some(IdentityContext {
            data_key: data_key.into(),
            kind,
        });
    }

    pub fn identity(&self) -> Option<&IdentityContext> {
        self.identity.as_ref()
    }

    pub fn set_time_frame(&mut self, frame: Arc<TimeFrame>) {
        self.time_frame = Some(frame);
    }

    pub fn time_frame(&self) -> Option<&Arc<TimeFrame>> {
        self.time_frame.as_ref()
    }

    pub fn observers(&mut self) -> &mut ObserverRegistry {
        &mut self.observers
    }

    // ========================================================================
    // MUTATION
    // ========================================================================

    /// Append one value at a frame. The entry carries [`EntityId::INVALID`]
    /// until ids are materialised against a registry.
    pub fn add_at_time(&mut self, time: TimeIndex, value: T, notify: Notify) {
        self.frames.entry(time).or_default().push(SeriesEntry {
            data: value,
            entity_id: EntityId::INVALID,
        });
        if notify == Notify::Yes {
            self.observers.notify();
        }
    }

    /// Append a batch of values at a frame, preserving the input order.
    pub fn add_many_at_time(&mut self, time: TimeIndex, values: Vec<T>, notify: Notify) {
        let bucket = self.frames.entry(time).or_default();
        bucket.reserve(values.len());
        for value in values {
            bucket.push(SeriesEntry {
                data: value,
                entity_id: EntityId::INVALID,
            });
        }
        if notify == Notify::Yes {
            self.observers.notify();
        }
    }

    /// Mint real ids for every entry still carrying the invalid sentinel.
    ///
    /// This is the identity-aware read path: ids are keyed by
    /// `(data_key, kind, time, local index)`, so replaying the same entries
    /// in the same order reconstructs the same ids. Returns the number of
    /// ids assigned. No-op without a bound identity context.
    pub fn materialize_entity_ids(&mut self, registry: &mut EntityRegistry) -> usize {
        let Some(identity) = self.identity.clone() else {
            return 0;
        };
        let mut assigned = 0;
        for (&time, bucket) in &mut self.frames {
            for (local_index, entry) in bucket.iter_mut().enumerate() {
                if entry.entity_id.is_valid() {
                    continue;
                }
                let key = EntityKey::new(identity.data_key.clone(), identity.kind, time, local_index);
                let id = registry.ensure_id(&key);
                entry.entity_id = id;
                self.entity_index.insert(id, (time, local_index));
                assigned += 1;
            }
        }
        assigned
    }

    /// Drop every entry at a frame. After this the frame no longer appears
    /// in [`RaggedSeries::times_with_data`].
    pub fn clear_at_time(&mut self, time: TimeIndex, notify: Notify) -> bool {
        let Some(bucket) = self.frames.remove(&time) else {
            return false;
        };
        for entry in &bucket {
            if entry.entity_id.is_valid() {
                self.entity_index.remove(&entry.entity_id);
            }
        }
        if notify == Notify::Yes {
            self.observers.notify();
        }
        true
    }

    /// Drop everything; identity binding and time frame stay.
    pub fn clear(&mut self, notify: Notify) {
        self.frames.clear();
        self.entity_index.clear();
        if notify == Notify::Yes {
            self.observers.notify();
        }
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    /// Entries at a frame in insertion order; empty when the frame holds none.
    pub fn at_time(&self, time: TimeIndex) -> &[SeriesEntry<T>] {
        self.frames.get(&time).map_or(&[], Vec::as_slice)
    }

    /// Entries at a frame expressed in a foreign coordinate system.
    ///
    /// Converts `time` from `query_frame` into this container's bound frame
    /// (nearest-below); falls back to the raw index when either side is
    /// unbound.
    pub fn at_time_in(&self, time: TimeIndex, query_frame: &TimeFrame) -> &[SeriesEntry<T>] {
        let local = match &self.time_frame {
            Some(own) => own.convert_index(time, query_frame, IndexRounding::Below),
            None => time,
        };
        self.at_time(local)
    }

    /// Sorted ascending frames that currently hold at least one entry.
    pub fn times_with_data(&self) -> Vec<TimeIndex> {
        self.frames
            .iter()
            .filter(|(_, bucket)| !bucket.is_empty())
            .map(|(&t, _)| t)
            .collect()
    }

    pub fn max_entries_at_any_time(&self) -> usize {
        self.frames.values().map(Vec::len).max().unwrap_or(0)
    }

    pub fn entity_ids_at_time(&self, time: TimeIndex) -> Vec<EntityId> {
        self.at_time(time).iter().map(|e| e.entity_id).collect()
    }

    pub fn all_entity_ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self.entity_index.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn data_by_entity_id(&self, id: EntityId) -> Option<&T> {
        let &(time, local) = self.entity_index.get(&id)?;
        self.frames.get(&time)?.get(local).map(|e| &e.data)
    }

    pub fn time_and_index_by_entity_id(&self, id: EntityId) -> Option<(TimeIndex, usize)> {
        self.entity_index.get(&id).copied()
    }

    /// Iterate `(frame, entries)` in ascending frame order.
    pub fn entries(&self) -> impl Iterator<Item = (TimeIndex, &[SeriesEntry<T>])> {
        self.frames.iter().map(|(&t, bucket)| (t, bucket.as_slice()))
    }

    /// Flattened `(time, entity, data)` view across all frames, the shape the
    /// trackers consume.
    pub fn flattened(&self) -> impl Iterator<Item = FlatItem<'_, T>> {
        self.frames.iter().flat_map(|(&time, bucket)| {
            bucket.iter().map(move |entry| FlatItem {
                time,
                entity_id: entry.entity_id,
                data: &entry.data,
            })
        })
    }

    pub fn total_entry_count(&self) -> usize {
        self.frames.values().map(Vec::len).sum()
    }

    fn reindex_frame(&mut self, time: TimeIndex) {
        if let Some(bucket) = self.frames.get(&time) {
            for (local, entry) in bucket.iter().enumerate() {
                if entry.entity_id.is_valid() {
                    self.entity_index.insert(entry.entity_id, (time, local));
                }
            }
        }
    }
}

impl<T: Clone> RaggedSeries<T> {
    // ========================================================================
    // COPY / MOVE BY ENTITY ID
    // ========================================================================

    /// Copy entries into `dest`, which mints NEW entity ids for them.
    ///
    /// Values are cloned; the source is untouched, and the copies are fully
    /// independent afterwards. Returns the number of entries copied.
    /// Relationship edges of the sources are not inherited by the copies.
    pub fn copy_by_entity_ids(
        &self,
        dest: &mut RaggedSeries<T>,
        ids: &[EntityId],
        registry: &mut EntityRegistry,
        notify: Notify,
    ) -> usize {
        let mut copied = 0;
        for &id in ids {
            let Some(&(time, local)) = self.entity_index.get(&id) else {
                continue;
            };
            let Some(entry) = self.frames.get(&time).and_then(|b| b.get(local)) else {
                continue;
            };
            let bucket = dest.frames.entry(time).or_default();
            let dest_local = bucket.len();
            let new_id = match &dest.identity {
                Some(identity) => registry.ensure_id(&EntityKey::new(
                    identity.data_key.clone(),
                    identity.kind,
                    time,
                    dest_local,
                )),
                None => EntityId::INVALID,
            };
            bucket.push(SeriesEntry {
                data: entry.data.clone(),
                entity_id: new_id,
            });
            if new_id.is_valid() {
                dest.entity_index.insert(new_id, (time, dest_local));
            }
            copied += 1;
        }
        if notify == Notify::Yes && copied > 0 {
            dest.observers.notify();
        }
        copied
    }

    /// Move entries into `dest`, preserving their entity ids.
    ///
    /// The source removes the entries and updates its entity index; `dest`
    /// gains them unchanged. Returns the number of entries moved.
    pub fn move_by_entity_ids(
        &mut self,
        dest: &mut RaggedSeries<T>,
        ids: &[EntityId],
        notify: Notify,
    ) -> usize {
        let mut moved = 0;
        for &id in ids {
            let Some(&(time, local)) = self.entity_index.get(&id) else {
                continue;
            };
            let Some(bucket) = self.frames.get_mut(&time) else {
                continue;
            };
            if local >= bucket.len() || bucket[local].entity_id != id {
                continue;
            }
            let entry = bucket.remove(local);
            let now_empty = bucket.is_empty();
            self.entity_index.remove(&id);
            if now_empty {
                self.frames.remove(&time);
            } else {
                // Removal shifted the later local indices; refresh them
                // before the next lookup.
                self.reindex_frame(time);
            }

            let dest_bucket = dest.frames.entry(time).or_default();
            let dest_local = dest_bucket.len();
            dest_bucket.push(entry);
            dest.entity_index.insert(id, (time, dest_local));
            moved += 1;
        }
        if notify == Notify::Yes && moved > 0 {
            self.observers.notify();
            dest.observers.notify();
        }
        moved
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for RaggedSeries<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaggedSeries")
            .field("frames", &self.frames.len())
            .field("entries", &self.total_entry_count())
            .field("identity", &self.identity)
            .finish()
    }
}

// ============================================================================
// PERSISTED SNAPSHOT
// ============================================================================

/// Serialisable per-frame ordered entry lists. Entity ids are NOT persisted;
/// loading replays the entries in order and re-mints ids via the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesSnapshot<T> {
    pub frames: Vec<(i64, Vec<T>)>,
}

impl<T: Clone> RaggedSeries<T> {
    pub fn to_snapshot(&self) -> SeriesSnapshot<T> {
        SeriesSnapshot {
            frames: self
                .frames
                .iter()
                .map(|(&t, bucket)| (t.value(), bucket.iter().map(|e| e.data.clone()).collect()))
                .collect(),
        }
    }

    /// Replace contents from a snapshot, minting fresh ids when a registry
    /// and identity context are available.
    pub fn load_snapshot(&mut self, snapshot: SeriesSnapshot<T>, registry: Option<&mut EntityRegistry>) {
        self.frames.clear();
        self.entity_index.clear();
        for (time, values) in snapshot.frames {
            self.add_many_at_time(TimeIndex(time), values, Notify::No);
        }
        if let Some(registry) = registry {
            self.materialize_entity_ids(registry);
        }
        self.observers.notify();
    }
}

// ============================================================================
// INTERVAL SERIES
// ============================================================================

/// Closed interval of time indices, inclusive at both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Interval {
    pub start: i64,
    pub end: i64,
}

impl Interval {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// Inclusive frame count.
    pub fn length(&self) -> i64 {
        self.end - self.start + 1
    }
}

/// Flat series of digital intervals, kept sorted by start.
#[derive(Debug, Clone, Default)]
pub struct IntervalSeries {
    intervals: Vec<Interval>,
    time_frame: Option<Arc<TimeFrame>>,
}

impl IntervalSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_intervals(mut intervals: Vec<Interval>) -> Self {
        intervals.sort();
        Self {
            intervals,
            time_frame: None,
        }
    }

    pub fn add_interval(&mut self, interval: Interval) {
        let pos = self.intervals.partition_point(|i| i.start <= interval.start);
        self.intervals.insert(pos, interval);
    }

    pub fn intervals(&self) -> &[Interval] {
        &self.intervals
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn set_time_frame(&mut self, frame: Arc<TimeFrame>) {
        self.time_frame = Some(frame);
    }

    pub fn time_frame(&self) -> Option<&Arc<TimeFrame>> {
        self.time_frame.as_ref()
    }
}

// ============================================================================
// EVENT SERIES
// ============================================================================

/// Flat series of digital events (time stamps), kept sorted.
#[derive(Debug, Clone, Default)]
pub struct EventSeries {
    events: Vec<TimeIndex>,
    time_frame: Option<Arc<TimeFrame>>,
}

impl EventSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_times(mut events: Vec<TimeIndex>) -> Self {
        events.sort();
        Self {
            events,
            time_frame: None,
        }
    }

    pub fn events(&self) -> &[TimeIndex] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn set_time_frame(&mut self, frame: Arc<TimeFrame>) {
        self.time_frame = Some(frame);
    }

    pub fn time_frame(&self) -> Option<&Arc<TimeFrame>> {
        self.time_frame.as_ref()
    }
}

// ============================================================================
// ANALOG SERIES
// ============================================================================

/// Flat analog signal: parallel vectors of sample times and values.
#[derive(Debug, Clone, Default)]
pub struct AnalogSeries {
    times: Vec<TimeIndex>,
    values: Vec<f32>,
    time_frame: Option<Arc<TimeFrame>>,
}

impl AnalogSeries {
    /// Build from parallel vectors; times must be sorted ascending.
    pub fn from_samples(times: Vec<TimeIndex>, values: Vec<f32>) -> Option<Self> {
        if times.len() != values.len() {
            return None;
        }
        if times.windows(2).any(|w| w[1] < w[0]) {
            return None;
        }
        Some(Self {
            times,
            values,
            time_frame: None,
        })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn times(&self) -> &[TimeIndex] {
        &self.times
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Samples with `start <= time <= end`, expressed in this series' own
    /// coordinate system. When `query_frame` is given and this series has a
    /// bound frame, the range is converted first.
    pub fn samples_in_range(
        &self,
        start: TimeIndex,
        end: TimeIndex,
        query_frame: Option<&TimeFrame>,
    ) -> (&[TimeIndex], &[f32]) {
        let (start, end) = match (query_frame, &self.time_frame) {
            (Some(query), Some(own)) if !std::ptr::eq(query, Arc::as_ptr(own)) => (
                own.convert_index(start, query, IndexRounding::Below),
                own.convert_index(end, query, IndexRounding::Above),
            ),
            _ => (start, end),
        };
        let lo = self.times.partition_point(|&t| t < start);
        let hi = self.times.partition_point(|&t| t <= end);
        (&self.times[lo..hi], &self.values[lo..hi])
    }

    pub fn set_time_frame(&mut self, frame: Arc<TimeFrame>) {
        self.time_frame = Some(frame);
    }

    pub fn time_frame(&self) -> Option<&Arc<TimeFrame>> {
        self.time_frame.as_ref()
    }
}

// ============================================================================
// TESTS
// ============================================================================
