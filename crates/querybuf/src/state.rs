//! Tracked-state store interfaces and an in-memory implementation.
//!
//! The buffer never decides whether an entity is dirty; it only consults an
//! external store for entities that are already tracked, hands newly loaded
//! entities to it when the query tracks, and keeps its relationship
//! snapshots in step with the navigations fixup assigns.

use crate::identity_map::KeyValue;
use crate::metadata::{EntityType, Key, KeyId, Navigation, Property};
use querybuf_core::{EntityRef, NullKeyError, Result, Row, Value, entity_id};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A tracked entity as seen by the buffer.
pub trait EntityEntry: Send + Sync {
    fn entity(&self) -> EntityRef;

    /// Current (possibly edited) value of a property.
    fn current_value(&self, property: &Property) -> Value;

    fn set_relationship_snapshot_value(&self, navigation: &Navigation, value: Option<&EntityRef>);

    fn add_to_collection_snapshot(&self, navigation: &Navigation, value: &EntityRef);

    fn add_range_to_collection_snapshot(&self, navigation: &Navigation, values: &[EntityRef]);

    fn set_is_loaded(&self, navigation: &Navigation);
}

/// The tracked-state store.
pub trait StateManager: Send + Sync {
    /// Find the entry whose key matches the key carried by `row`.
    ///
    /// A null key yields `Ok(None)`, or a [`NullKeyError`] when
    /// `throw_on_null_key` is set.
    fn try_get_entry_for_key(
        &self,
        key: &Arc<Key>,
        row: &Row,
        throw_on_null_key: bool,
    ) -> Result<Option<Arc<dyn EntityEntry>>>;

    fn try_get_entry(&self, entity: &EntityRef) -> Option<Arc<dyn EntityEntry>>;

    /// Begin tracking an entity loaded by a query, returning its entry.
    fn start_tracking_from_query(
        &self,
        entity_type: &Arc<EntityType>,
        entity: &EntityRef,
        row: &Row,
    ) -> Result<Arc<dyn EntityEntry>>;
}

/// Change-notification control used around fixup batches.
pub trait ChangeDetector: Send + Sync {
    fn suspend(&self);

    fn resume(&self);
}

/// The external collaborators a buffer is constructed with.
#[derive(Clone)]
pub struct QueryContextDependencies {
    pub state_manager: Arc<dyn StateManager>,
    pub change_detector: Arc<dyn ChangeDetector>,
}

impl QueryContextDependencies {
    pub fn new(
        state_manager: Arc<dyn StateManager>,
        change_detector: Arc<dyn ChangeDetector>,
    ) -> Self {
        Self {
            state_manager,
            change_detector,
        }
    }

    /// Use one in-memory store as both state manager and change detector.
    pub fn in_memory(store: &Arc<InMemoryStateManager>) -> Self {
        Self {
            state_manager: Arc::clone(store) as Arc<dyn StateManager>,
            change_detector: Arc::clone(store) as Arc<dyn ChangeDetector>,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct EntryState {
    original: Vec<Value>,
    current: Vec<Value>,
    relationships: HashMap<&'static str, Option<usize>>,
    collections: HashMap<&'static str, Vec<usize>>,
    loaded: HashSet<&'static str>,
}

/// An entry held by [`InMemoryStateManager`].
///
/// Property values are snapshotted from the row the entity was loaded from;
/// relationship snapshots record entity identities.
pub struct TrackedEntry {
    entity: EntityRef,
    entity_type: Arc<EntityType>,
    state: Mutex<EntryState>,
}

impl TrackedEntry {
    pub fn entity_type(&self) -> &Arc<EntityType> {
        &self.entity_type
    }

    /// Edit a property's current value.
    pub fn set_current_value(&self, property: &Property, value: Value) {
        let mut state = lock(&self.state);
        if state.current.len() <= property.index {
            state.current.resize(property.index + 1, Value::Null);
        }
        state.current[property.index] = value;
    }

    /// Indexes of properties whose current value differs from the loaded one.
    pub fn changed_properties(&self) -> Vec<usize> {
        let state = lock(&self.state);
        let changed: Vec<usize> = state
            .current
            .iter()
            .enumerate()
            .filter(|(i, v)| state.original.get(*i).unwrap_or(&Value::Null) != *v)
            .map(|(i, _)| i)
            .collect();
        tracing::trace!(
            entity_type = self.entity_type.name(),
            changed_count = changed.len(),
            "Changed properties"
        );
        changed
    }

    /// Snapshot of a reference navigation: `None` if never recorded,
    /// `Some(None)` if recorded as empty.
    pub fn relationship_snapshot(&self, navigation: &str) -> Option<Option<usize>> {
        lock(&self.state).relationships.get(navigation).copied()
    }

    /// Identities recorded in a collection snapshot, in insertion order.
    pub fn collection_snapshot(&self, navigation: &str) -> Vec<usize> {
        lock(&self.state)
            .collections
            .get(navigation)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_loaded(&self, navigation: &str) -> bool {
        lock(&self.state).loaded.contains(navigation)
    }
}

impl EntityEntry for TrackedEntry {
    fn entity(&self) -> EntityRef {
        Arc::clone(&self.entity)
    }

    fn current_value(&self, property: &Property) -> Value {
        lock(&self.state)
            .current
            .get(property.index)
            .cloned()
            .unwrap_or(Value::Null)
    }

    fn set_relationship_snapshot_value(&self, navigation: &Navigation, value: Option<&EntityRef>) {
        lock(&self.state)
            .relationships
            .insert(navigation.name(), value.map(entity_id));
    }

    fn add_to_collection_snapshot(&self, navigation: &Navigation, value: &EntityRef) {
        lock(&self.state)
            .collections
            .entry(navigation.name())
            .or_default()
            .push(entity_id(value));
    }

    fn add_range_to_collection_snapshot(&self, navigation: &Navigation, values: &[EntityRef]) {
        lock(&self.state)
            .collections
            .entry(navigation.name())
            .or_default()
            .extend(values.iter().map(entity_id));
    }

    fn set_is_loaded(&self, navigation: &Navigation) {
        lock(&self.state).loaded.insert(navigation.name());
    }
}

#[derive(Default)]
struct Entries {
    by_entity: HashMap<usize, Arc<TrackedEntry>>,
    by_key: HashMap<(KeyId, KeyValue), usize>,
}

/// A self-contained tracked-state store.
///
/// Suitable for embedding the buffer without a full change tracker, and for
/// observing what the buffer reports to one.
#[derive(Default)]
pub struct InMemoryStateManager {
    entries: Mutex<Entries>,
    suspend_calls: AtomicUsize,
    resume_calls: AtomicUsize,
    depth: AtomicUsize,
}

impl InMemoryStateManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The concrete entry tracking `entity`.
    pub fn entry(&self, entity: &EntityRef) -> Option<Arc<TrackedEntry>> {
        lock(&self.entries).by_entity.get(&entity_id(entity)).cloned()
    }

    pub fn is_tracked(&self, entity: &EntityRef) -> bool {
        self.entry(entity).is_some()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).by_entity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn suspend_count(&self) -> usize {
        self.suspend_calls.load(Ordering::SeqCst)
    }

    pub fn resume_count(&self) -> usize {
        self.resume_calls.load(Ordering::SeqCst)
    }

    /// Is change notification currently suspended?
    pub fn is_suspended(&self) -> bool {
        self.depth.load(Ordering::SeqCst) > 0
    }
}

impl StateManager for InMemoryStateManager {
    fn try_get_entry_for_key(
        &self,
        key: &Arc<Key>,
        row: &Row,
        throw_on_null_key: bool,
    ) -> Result<Option<Arc<dyn EntityEntry>>> {
        let Some(value) = KeyValue::from_row(row, key.properties())? else {
            if throw_on_null_key {
                return Err(NullKeyError {
                    entity_type: key.entity_type(),
                    properties: key.property_names(),
                }
                .into());
            }
            return Ok(None);
        };
        let entries = lock(&self.entries);
        Ok(entries
            .by_key
            .get(&(key.id(), value))
            .and_then(|id| entries.by_entity.get(id))
            .map(|entry| Arc::clone(entry) as Arc<dyn EntityEntry>))
    }

    fn try_get_entry(&self, entity: &EntityRef) -> Option<Arc<dyn EntityEntry>> {
        self.entry(entity).map(|entry| entry as Arc<dyn EntityEntry>)
    }

    #[tracing::instrument(level = "trace", skip_all, fields(entity_type = entity_type.name()))]
    fn start_tracking_from_query(
        &self,
        entity_type: &Arc<EntityType>,
        entity: &EntityRef,
        row: &Row,
    ) -> Result<Arc<dyn EntityEntry>> {
        let id = entity_id(entity);
        let mut entries = lock(&self.entries);
        if let Some(existing) = entries.by_entity.get(&id) {
            return Ok(Arc::clone(existing) as Arc<dyn EntityEntry>);
        }

        let key = entity_type.primary_key();
        let key_value = if row.is_empty() {
            None
        } else {
            KeyValue::from_row(row, key.properties())?
        };
        let values: Vec<Value> = row.values().cloned().collect();
        let entry = Arc::new(TrackedEntry {
            entity: Arc::clone(entity),
            entity_type: Arc::clone(entity_type),
            state: Mutex::new(EntryState {
                original: values.clone(),
                current: values,
                ..EntryState::default()
            }),
        });
        if let Some(key_value) = key_value {
            entries.by_key.insert((key.id(), key_value), id);
        }
        entries.by_entity.insert(id, Arc::clone(&entry));
        tracing::trace!(tracked = entries.by_entity.len(), "Started tracking");
        Ok(entry)
    }
}

impl ChangeDetector for InMemoryStateManager {
    fn suspend(&self) {
        self.suspend_calls.fetch_add(1, Ordering::SeqCst);
        self.depth.fetch_add(1, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.resume_calls.fetch_add(1, Ordering::SeqCst);
        let _ = self
            .depth
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| d.checked_sub(1));
    }
}
