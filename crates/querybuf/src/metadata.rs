//! Mapping metadata consumed by the buffer.
//!
//! Keys, entity types and navigations are built once per model and outlive
//! every query. The buffer only reads them: property indexes locate values
//! in row buffers, the navigation kind decides how fixup assigns related
//! entities, and each key knows how to create its own weak identity map.

use crate::identity_map::{ValueIdentityMap, WeakIdentityMap};
use querybuf_core::{EntityRef, MetadataError, Result, read_entity, write_entity};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// A mapped scalar property and its position in the row buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Property {
    pub name: &'static str,
    pub index: usize,
}

impl Property {
    #[must_use]
    pub const fn new(name: &'static str, index: usize) -> Self {
        Self { name, index }
    }
}

/// Unique identifier for a [`Key`] definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(u64);

static NEXT_KEY_ID: AtomicU64 = AtomicU64::new(1);

/// Creates the weak identity map used for one key within a query.
pub type IdentityMapFactory = fn(Arc<Key>) -> Box<dyn WeakIdentityMap>;

/// A key definition: the properties that identify an entity type.
pub struct Key {
    id: KeyId,
    entity_type: &'static str,
    properties: Vec<Property>,
    identity_map_factory: IdentityMapFactory,
}

impl Key {
    /// Define a key backed by the default value-keyed identity map.
    pub fn new(entity_type: &'static str, properties: Vec<Property>) -> Arc<Self> {
        Self::with_identity_map_factory(entity_type, properties, ValueIdentityMap::boxed)
    }

    /// Define a key with a custom identity map implementation.
    pub fn with_identity_map_factory(
        entity_type: &'static str,
        properties: Vec<Property>,
        identity_map_factory: IdentityMapFactory,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: KeyId(NEXT_KEY_ID.fetch_add(1, Ordering::Relaxed)),
            entity_type,
            properties,
            identity_map_factory,
        })
    }

    pub fn id(&self) -> KeyId {
        self.id
    }

    pub fn entity_type(&self) -> &'static str {
        self.entity_type
    }

    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    pub fn property_names(&self) -> Vec<&'static str> {
        self.properties.iter().map(|p| p.name).collect()
    }

    /// Create a fresh identity map for this key.
    pub fn create_identity_map(self: &Arc<Self>) -> Box<dyn WeakIdentityMap> {
        (self.identity_map_factory)(Arc::clone(self))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("id", &self.id)
            .field("entity_type", &self.entity_type)
            .field("properties", &self.properties)
            .finish()
    }
}

/// A mapped entity type.
#[derive(Debug)]
pub struct EntityType {
    name: &'static str,
    primary_key: Arc<Key>,
}

impl EntityType {
    pub fn new(name: &'static str, primary_key: Arc<Key>) -> Arc<Self> {
        Arc::new(Self { name, primary_key })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn primary_key(&self) -> &Arc<Key> {
        &self.primary_key
    }
}

/// A foreign key: dependent-side properties referencing a principal key.
#[derive(Debug)]
pub struct ForeignKey {
    properties: Vec<Property>,
    principal_key: Arc<Key>,
}

impl ForeignKey {
    pub fn new(properties: Vec<Property>, principal_key: Arc<Key>) -> Arc<Self> {
        Arc::new(Self {
            properties,
            principal_key,
        })
    }

    /// Properties on the dependent row.
    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    pub fn principal_key(&self) -> &Arc<Key> {
        &self.principal_key
    }
}

/// Reads and writes a single-valued navigation on an entity.
pub trait ReferenceAccessor: Send + Sync {
    fn get(&self, entity: &EntityRef) -> Result<Option<EntityRef>>;

    fn set(&self, entity: &EntityRef, value: Option<EntityRef>) -> Result<()>;
}

/// Reads and appends to a collection navigation on an entity.
pub trait CollectionAccessor: Send + Sync {
    /// Ensure the collection exists, creating an empty one if unset.
    fn get_or_create(&self, entity: &EntityRef) -> Result<()>;

    fn add(&self, entity: &EntityRef, value: EntityRef) -> Result<()>;

    /// Append a batch. The collection is initialized even if `values` is empty.
    fn add_range(&self, entity: &EntityRef, values: &[EntityRef]) -> Result<()>;

    /// Current members, empty if the collection is unset.
    fn items(&self, entity: &EntityRef) -> Result<Vec<EntityRef>>;
}

/// Reference accessor over a typed field.
pub struct FieldReference<T> {
    get: fn(&T) -> Option<EntityRef>,
    set: fn(&mut T, Option<EntityRef>),
}

impl<T> FieldReference<T> {
    pub const fn new(get: fn(&T) -> Option<EntityRef>, set: fn(&mut T, Option<EntityRef>)) -> Self {
        Self { get, set }
    }
}

impl<T: Any + Send + Sync> ReferenceAccessor for FieldReference<T> {
    fn get(&self, entity: &EntityRef) -> Result<Option<EntityRef>> {
        read_entity::<T, _>(entity, |e| (self.get)(e))
    }

    fn set(&self, entity: &EntityRef, value: Option<EntityRef>) -> Result<()> {
        write_entity::<T, _>(entity, |e| (self.set)(e, value))
    }
}

/// Collection accessor over a typed `Option<Vec<EntityRef>>` field.
///
/// `None` means "not loaded"; fixup always leaves it `Some`.
pub struct FieldCollection<T> {
    field: fn(&mut T) -> &mut Option<Vec<EntityRef>>,
}

impl<T> FieldCollection<T> {
    pub const fn new(field: fn(&mut T) -> &mut Option<Vec<EntityRef>>) -> Self {
        Self { field }
    }
}

impl<T: Any + Send + Sync> CollectionAccessor for FieldCollection<T> {
    fn get_or_create(&self, entity: &EntityRef) -> Result<()> {
        write_entity::<T, _>(entity, |e| {
            (self.field)(e).get_or_insert_with(Vec::new);
        })
    }

    fn add(&self, entity: &EntityRef, value: EntityRef) -> Result<()> {
        write_entity::<T, _>(entity, |e| {
            (self.field)(e).get_or_insert_with(Vec::new).push(value);
        })
    }

    fn add_range(&self, entity: &EntityRef, values: &[EntityRef]) -> Result<()> {
        write_entity::<T, _>(entity, |e| {
            (self.field)(e)
                .get_or_insert_with(Vec::new)
                .extend(values.iter().cloned());
        })
    }

    fn items(&self, entity: &EntityRef) -> Result<Vec<EntityRef>> {
        write_entity::<T, _>(entity, |e| (self.field)(e).clone().unwrap_or_default())
    }
}

/// How a navigation relates its declaring entity to its target.
#[derive(Clone)]
pub enum NavigationKind {
    /// Single reference from the dependent to its principal.
    DependentToPrincipal(Arc<dyn ReferenceAccessor>),
    /// Single reference from the principal to its one dependent.
    PrincipalToDependent(Arc<dyn ReferenceAccessor>),
    /// Collection of dependents on the principal.
    Collection(Arc<dyn CollectionAccessor>),
}

impl NavigationKind {
    fn label(&self) -> &'static str {
        match self {
            NavigationKind::DependentToPrincipal(_) => "dependent-to-principal",
            NavigationKind::PrincipalToDependent(_) => "principal-to-dependent",
            NavigationKind::Collection(_) => "collection",
        }
    }
}

/// A navigation property between two entity types.
pub struct Navigation {
    name: &'static str,
    declaring_type: Arc<EntityType>,
    target_type: Arc<EntityType>,
    foreign_key: Arc<ForeignKey>,
    kind: NavigationKind,
    inverse: OnceLock<Weak<Navigation>>,
}

impl Navigation {
    pub fn new(
        name: &'static str,
        declaring_type: Arc<EntityType>,
        target_type: Arc<EntityType>,
        foreign_key: Arc<ForeignKey>,
        kind: NavigationKind,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            declaring_type,
            target_type,
            foreign_key,
            kind,
            inverse: OnceLock::new(),
        })
    }

    /// Make `a` and `b` each other's inverse.
    ///
    /// Returns an error if either side already has an inverse.
    pub fn link(a: &Arc<Navigation>, b: &Arc<Navigation>) -> Result<()> {
        for (nav, other) in [(a, b), (b, a)] {
            nav.inverse.set(Arc::downgrade(other)).map_err(|_| MetadataError {
                element: nav.name,
                message: "inverse navigation already linked".to_string(),
            })?;
        }
        Ok(())
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn declaring_type(&self) -> &Arc<EntityType> {
        &self.declaring_type
    }

    pub fn target_type(&self) -> &Arc<EntityType> {
        &self.target_type
    }

    pub fn foreign_key(&self) -> &Arc<ForeignKey> {
        &self.foreign_key
    }

    pub fn kind(&self) -> &NavigationKind {
        &self.kind
    }

    pub fn is_collection(&self) -> bool {
        matches!(self.kind, NavigationKind::Collection(_))
    }

    pub fn is_dependent_to_principal(&self) -> bool {
        matches!(self.kind, NavigationKind::DependentToPrincipal(_))
    }

    pub fn find_inverse(&self) -> Option<Arc<Navigation>> {
        self.inverse.get().and_then(Weak::upgrade)
    }

    /// The collection accessor, or a metadata error for reference navigations.
    pub fn collection_accessor(&self) -> Result<&Arc<dyn CollectionAccessor>> {
        match &self.kind {
            NavigationKind::Collection(accessor) => Ok(accessor),
            other => Err(MetadataError {
                element: self.name,
                message: format!("expected a collection navigation, found {}", other.label()),
            }
            .into()),
        }
    }

    /// The reference accessor, or a metadata error for collection navigations.
    pub fn reference_accessor(&self) -> Result<&Arc<dyn ReferenceAccessor>> {
        match &self.kind {
            NavigationKind::DependentToPrincipal(accessor)
            | NavigationKind::PrincipalToDependent(accessor) => Ok(accessor),
            other => Err(MetadataError {
                element: self.name,
                message: format!("expected a reference navigation, found {}", other.label()),
            }
            .into()),
        }
    }

    /// Entities currently reachable through this navigation.
    pub fn current_targets(&self, entity: &EntityRef) -> Result<Vec<EntityRef>> {
        match &self.kind {
            NavigationKind::Collection(accessor) => accessor.items(entity),
            NavigationKind::DependentToPrincipal(accessor)
            | NavigationKind::PrincipalToDependent(accessor) => {
                Ok(accessor.get(entity)?.into_iter().collect())
            }
        }
    }
}

/// A navigation included by a query, with the navigations included beneath it.
#[derive(Debug, Clone)]
pub struct IncludedNavigation {
    pub navigation: Arc<Navigation>,
    pub nested: Vec<IncludedNavigation>,
}

impl IncludedNavigation {
    pub fn new(navigation: Arc<Navigation>) -> Self {
        Self {
            navigation,
            nested: Vec::new(),
        }
    }

    /// Add a navigation included through this one.
    #[must_use]
    pub fn then_include(mut self, nested: IncludedNavigation) -> Self {
        self.nested.push(nested);
        self
    }
}

/// The shape of a loaded entity graph, used to track it as a whole.
#[derive(Debug, Clone)]
pub struct EntityTrackingInfo {
    pub entity_type: Arc<EntityType>,
    pub includes: Vec<IncludedNavigation>,
}

impl EntityTrackingInfo {
    pub fn new(entity_type: Arc<EntityType>) -> Self {
        Self {
            entity_type,
            includes: Vec::new(),
        }
    }

    #[must_use]
    pub fn include(mut self, navigation: IncludedNavigation) -> Self {
        self.includes.push(navigation);
        self
    }
}

impl fmt::Debug for Navigation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Navigation")
            .field("name", &self.name)
            .field("declaring_type", &self.declaring_type.name())
            .field("target_type", &self.target_type.name())
            .field("kind", &self.kind.label())
            .finish()
    }
}
