//! Weak identity maps, one per key, scoped to a single query.
//!
//! A map resolves a row's key value to the entity previously materialized
//! for it, without keeping that entity alive. Once the caller drops every
//! strong reference the entry stops resolving and the next row with the same
//! key materializes a fresh object into the same slot.
//!
//! # Example
//!
//! ```ignore
//! let mut map = ValueIdentityMap::new(key);
//! match map.lookup(&row)? {
//!     IdentityLookup::Vacant(k) => map.add(k, &materialize(&row)?),
//!     IdentityLookup::Live(entity) => reuse(entity),
//!     IdentityLookup::Collected(k) => map.add(k, &materialize(&row)?),
//!     IdentityLookup::NullKey => {}
//! }
//! ```

use crate::metadata::{Key, KeyId, Navigation, Property};
use crate::state::EntityEntry;
use querybuf_core::{EntityRef, Result, Row, Value, WeakEntityRef};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Structural key value extracted from a row or a tracked entry.
#[derive(Debug, Clone)]
pub struct KeyValue(Vec<Value>);

impl KeyValue {
    /// Build a key value, or `None` if any component is null.
    pub fn new(values: Vec<Value>) -> Option<Self> {
        if values.iter().any(Value::is_null) {
            None
        } else {
            Some(Self(values))
        }
    }

    /// Read the key properties from a row.
    pub fn from_row(row: &Row, properties: &[Property]) -> Result<Option<Self>> {
        let values = properties
            .iter()
            .map(|p| row.value_at(p.index).cloned())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(values))
    }

    /// Read the key properties from a tracked entry's current values.
    pub fn from_entry(entry: &dyn EntityEntry, properties: &[Property]) -> Option<Self> {
        Self::new(properties.iter().map(|p| entry.current_value(p)).collect())
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }
}

impl PartialEq for KeyValue {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len() && self.0.iter().zip(&other.0).all(|(a, b)| a.key_eq(b))
    }
}

impl Eq for KeyValue {}

impl Hash for KeyValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.len().hash(state);
        for v in &self.0 {
            v.hash_into(state);
        }
    }
}

/// Result of resolving a row against an identity map.
pub enum IdentityLookup {
    /// The row's key is null; nothing may be cached for it.
    NullKey,
    /// No entry exists for the key.
    Vacant(KeyValue),
    /// An entry exists but its entity has been dropped.
    Collected(KeyValue),
    /// The entity for this key is still alive.
    Live(EntityRef),
}

/// Where the outer side of an include takes its key values from.
#[derive(Clone, Copy)]
pub enum KeySource<'a> {
    /// The row the outer entity was materialized from.
    Row(&'a Row),
    /// The tracked-state entry of the outer entity.
    Entry(&'a dyn EntityEntry),
}

/// Tests related rows for membership in one outer entity's navigation.
#[derive(Debug, Clone)]
pub struct IncludeKeyComparer {
    target: Option<KeyValue>,
    related_properties: Vec<Property>,
}

impl IncludeKeyComparer {
    /// Build a comparer for `navigation` with outer key values read from `source`.
    ///
    /// For dependent-to-principal navigations the outer entity supplies its
    /// foreign key and related rows are matched on the principal key;
    /// otherwise the outer entity supplies the principal key and related rows
    /// are matched on the foreign key.
    pub fn new(navigation: &Navigation, source: KeySource<'_>) -> Result<Self> {
        let fk = navigation.foreign_key();
        let (outer, related) = if navigation.is_dependent_to_principal() {
            (fk.properties(), fk.principal_key().properties())
        } else {
            (fk.principal_key().properties(), fk.properties())
        };
        let target = match source {
            KeySource::Row(row) => KeyValue::from_row(row, outer)?,
            KeySource::Entry(entry) => KeyValue::from_entry(entry, outer),
        };
        Ok(Self {
            target,
            related_properties: related.to_vec(),
        })
    }

    /// The outer key value, `None` when it is null.
    pub fn target(&self) -> Option<&KeyValue> {
        self.target.as_ref()
    }

    /// Does `row` belong to the outer entity? A null key on either side never matches.
    pub fn should_include(&self, row: &Row) -> Result<bool> {
        let Some(target) = &self.target else {
            return Ok(false);
        };
        Ok(KeyValue::from_row(row, &self.related_properties)?.is_some_and(|k| &k == target))
    }

    /// Same test against a tracked entry's current values.
    pub fn should_include_entry(&self, entry: &dyn EntityEntry) -> bool {
        self.target.as_ref().is_some_and(|target| {
            KeyValue::from_entry(entry, &self.related_properties).is_some_and(|k| &k == target)
        })
    }
}

/// A per-key cache from key value to a weakly held entity.
pub trait WeakIdentityMap: Send + Sync {
    /// The key this map is scoped to.
    fn key(&self) -> &Arc<Key>;

    /// Resolve the key value carried by `row`.
    fn lookup(&self, row: &Row) -> Result<IdentityLookup>;

    /// Insert or retarget the entry for `key`.
    fn add(&mut self, key: KeyValue, entity: &EntityRef);

    /// Drop entries whose entity is gone. Returns how many were removed.
    fn collect_garbage(&mut self) -> usize;

    /// Number of entries, including dead ones not yet collected.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build the include comparer for an outer entity of this key's type.
    fn create_include_key_comparer(
        &self,
        navigation: &Navigation,
        source: KeySource<'_>,
    ) -> Result<IncludeKeyComparer> {
        IncludeKeyComparer::new(navigation, source)
    }
}

/// Identity map keyed by structural key values.
pub struct ValueIdentityMap {
    key: Arc<Key>,
    entries: HashMap<KeyValue, WeakEntityRef>,
}

impl ValueIdentityMap {
    pub fn new(key: Arc<Key>) -> Self {
        Self {
            key,
            entries: HashMap::new(),
        }
    }

    /// Factory suitable for [`Key::new`].
    pub fn boxed(key: Arc<Key>) -> Box<dyn WeakIdentityMap> {
        Box::new(Self::new(key))
    }
}

impl WeakIdentityMap for ValueIdentityMap {
    fn key(&self) -> &Arc<Key> {
        &self.key
    }

    fn lookup(&self, row: &Row) -> Result<IdentityLookup> {
        let Some(key) = KeyValue::from_row(row, self.key.properties())? else {
            return Ok(IdentityLookup::NullKey);
        };
        Ok(match self.entries.get(&key).map(std::sync::Weak::upgrade) {
            None => IdentityLookup::Vacant(key),
            Some(None) => IdentityLookup::Collected(key),
            Some(Some(entity)) => IdentityLookup::Live(entity),
        })
    }

    fn add(&mut self, key: KeyValue, entity: &EntityRef) {
        self.entries.insert(key, Arc::downgrade(entity));
    }

    fn collect_garbage(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, weak| weak.strong_count() > 0);
        before - self.entries.len()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// The identity maps of one query.
///
/// The first two keys seen get inline slots; any further keys go to an
/// overflow map keyed by [`KeyId`].
#[derive(Default)]
pub(crate) struct IdentityMaps {
    first: Option<Box<dyn WeakIdentityMap>>,
    second: Option<Box<dyn WeakIdentityMap>>,
    overflow: HashMap<KeyId, Box<dyn WeakIdentityMap>>,
}

enum Slot {
    First,
    Second,
    Overflow,
}

fn holds(slot: Option<&dyn WeakIdentityMap>, id: KeyId) -> bool {
    slot.is_some_and(|m| m.key().id() == id)
}

impl IdentityMaps {
    /// Resolve the map for `key`, creating it on first use.
    pub(crate) fn get_or_create(&mut self, key: &Arc<Key>) -> &mut (dyn WeakIdentityMap + 'static) {
        let id = key.id();
        let slot = if holds(self.first.as_deref(), id) || self.first.is_none() {
            Slot::First
        } else if holds(self.second.as_deref(), id) || self.second.is_none() {
            Slot::Second
        } else {
            Slot::Overflow
        };
        match slot {
            Slot::First => &mut **self.first.get_or_insert_with(|| key.create_identity_map()),
            Slot::Second => &mut **self.second.get_or_insert_with(|| key.create_identity_map()),
            Slot::Overflow => &mut **self
                .overflow
                .entry(id)
                .or_insert_with(|| key.create_identity_map()),
        }
    }

    pub(crate) fn len(&self) -> usize {
        usize::from(self.first.is_some()) + usize::from(self.second.is_some()) + self.overflow.len()
    }
}
