//! Per-query entity materialization and relationship fixup.
//!
//! `querybuf` is the **query buffer** a query executor drives while it reads
//! rows. One buffer lives for exactly one query execution.
//!
//! # Role In The Architecture
//!
//! - **Weak identity map**: rows with the same key materialize into one object
//!   for as long as the caller keeps that object alive.
//! - **Row associations**: the row an entity was built from stays readable for
//!   shadow properties.
//! - **Merge inclusion**: collection navigations are filled from a single
//!   correlated, sorted stream per include site, shared across outer entities.
//! - **Fixup**: both sides of a relationship are assigned and the tracked-state
//!   store's snapshots are kept in step.
//!
//! # Design
//!
//! - **Scoped state**: nothing is global; the buffer owns every cache and cursor.
//! - **External tracking**: dirty detection belongs to a [`StateManager`]; the
//!   buffer only consults it and reports to it.
//! - **Cancel-correct**: async operations take `Cx` and return `Outcome`, and
//!   suspend only while fetching the next related element.
//!
//! # Example
//!
//! ```ignore
//! let store = Arc::new(InMemoryStateManager::new());
//! let mut buffer = QueryBuffer::new(QueryContextDependencies::in_memory(&store));
//!
//! let site = IncludeSite::for_navigation(0, &blog_posts, false)?;
//! for info in blog_rows {
//!     let blog = buffer.get_entity(blog_key, &info, false, true)?.unwrap();
//!     buffer.include_collection(&site, &blog, || Ok(post_stream()))?;
//! }
//! buffer.dispose();
//! ```

pub mod config;
mod fixup;
pub mod identity_map;
pub mod include;
mod legacy;
pub mod metadata;
pub mod state;
pub mod stream;

mod materializer;
mod row_associations;

pub use config::QueryBufferOptions;
pub use identity_map::{
    IdentityLookup, IncludeKeyComparer, KeySource, KeyValue, ValueIdentityMap, WeakIdentityMap,
};
pub use include::{IncludeId, IncludeSite};
pub use metadata::{
    CollectionAccessor, EntityTrackingInfo, EntityType, FieldCollection, FieldReference,
    ForeignKey, IncludedNavigation, Key, KeyId, Navigation, NavigationKind, Property,
    ReferenceAccessor,
};
pub use querybuf_core::{
    Cx, EntityLoadInfo, EntityRef, Error, Materializer, Outcome, Result, Row, Value,
    WeakEntityRef, entity_id, new_entity, read_entity, write_entity,
};
pub use state::{
    ChangeDetector, EntityEntry, InMemoryStateManager, QueryContextDependencies, StateManager,
    TrackedEntry,
};
pub use stream::{
    AsyncRelatedEntitiesLoader, AsyncRelatedStream, BoxFuture, IterStream, RelatedEntitiesLoader,
    RelatedStream, RowsLoader,
};

use include::IncludeCursors;
use materializer::EntityMaterializer;
use std::sync::Arc;

/// The buffer for one query execution.
///
/// Not meant to be shared between threads; every operation takes `&mut self`
/// or `&self` on a buffer owned by the executing query.
pub struct QueryBuffer {
    cache: EntityMaterializer,
    cursors: IncludeCursors,
}

impl QueryBuffer {
    /// Create a buffer with default options.
    pub fn new(dependencies: QueryContextDependencies) -> Self {
        Self::with_options(dependencies, QueryBufferOptions::default())
    }

    pub fn with_options(dependencies: QueryContextDependencies, options: QueryBufferOptions) -> Self {
        tracing::debug!(
            collect_garbage_on_insert = options.collect_garbage_on_insert,
            association_sweep_interval = options.association_sweep_interval,
            "Creating query buffer"
        );
        Self {
            cache: EntityMaterializer::new(dependencies, options),
            cursors: IncludeCursors::default(),
        }
    }

    /// Return the entity identified by the key in `info`'s row.
    ///
    /// With `query_state_manager`, an entity already tracked for the key wins.
    /// Otherwise the live instance from this query's identity map is reused,
    /// or a new one is materialized and associated with the row. A null key
    /// yields `Ok(None)`, or [`Error::NullKey`] when `throw_on_null_key` is set.
    #[tracing::instrument(level = "trace", skip_all, fields(entity_type = key.entity_type()))]
    pub fn get_entity(
        &mut self,
        key: &Arc<Key>,
        info: &EntityLoadInfo,
        query_state_manager: bool,
        throw_on_null_key: bool,
    ) -> Result<Option<EntityRef>> {
        self.cache
            .get_entity(key, info, query_state_manager, throw_on_null_key)
    }

    /// Read a property of an entity, including shadow properties.
    ///
    /// A tracked entry's current value takes precedence over the row the
    /// entity was materialized from. Entities that are neither tracked nor
    /// materialized by this buffer yield [`Error::AssociationMissing`].
    pub fn get_property_value(&self, entity: &EntityRef, property: &Property) -> Result<Value> {
        self.cache.get_property_value(entity, property)
    }

    /// Start tracking `entity` with the row it was materialized from.
    pub fn start_tracking(&self, entity: &EntityRef, entity_type: &Arc<EntityType>) -> Result<()> {
        self.cache.start_tracking(entity, entity_type).map(|_| ())
    }

    /// Start tracking `entity` and every included entity reachable from it.
    ///
    /// Included entities are tracked only when this buffer materialized them.
    #[tracing::instrument(level = "debug", skip_all, fields(entity_type = info.entity_type.name()))]
    pub fn start_tracking_with_info(
        &self,
        entity: &EntityRef,
        info: &EntityTrackingInfo,
    ) -> Result<()> {
        self.cache.start_tracking(entity, &info.entity_type)?;
        let mut tracked = 0usize;
        self.track_included(entity, &info.includes, &mut tracked)?;
        tracing::debug!(included = tracked, "Tracked included entities");
        Ok(())
    }

    fn track_included(
        &self,
        entity: &EntityRef,
        includes: &[IncludedNavigation],
        tracked: &mut usize,
    ) -> Result<()> {
        for include in includes {
            for target in include.navigation.current_targets(entity)? {
                if self.cache.row_for(&target).is_some() {
                    self.cache
                        .start_tracking(&target, include.navigation.target_type())?;
                    *tracked += 1;
                }
                self.track_included(&target, &include.nested, tracked)?;
            }
        }
        Ok(())
    }

    /// Assign `related` onto `entity` through `path[index]`, both ways.
    ///
    /// When `tracking`, change notification is suspended for the batch and
    /// resumed afterwards, also when an assignment fails.
    pub fn load_navigation_properties(
        &self,
        entity: &EntityRef,
        path: &[Arc<Navigation>],
        index: usize,
        related: &[EntityRef],
        tracking: bool,
    ) -> Result<()> {
        fixup::load_navigation_properties(
            self.cache.dependencies(),
            entity,
            path,
            index,
            related,
            tracking,
        )
    }

    /// Release every include cursor and its stream.
    ///
    /// Safe to call more than once; also runs on drop.
    pub fn dispose(&mut self) {
        let released = self.cursors.release();
        if released > 0 {
            tracing::debug!(released, "Released include cursors");
        }
    }

    /// Number of identity maps created so far.
    pub fn identity_map_count(&self) -> usize {
        self.cache.identity_map_count()
    }

    /// Number of row associations, including ones not yet pruned.
    pub fn association_count(&self) -> usize {
        self.cache.association_count()
    }

    /// Number of include cursors still holding an open stream.
    pub fn active_cursor_count(&self) -> usize {
        self.cursors.active()
    }
}

impl Drop for QueryBuffer {
    fn drop(&mut self) {
        self.dispose();
    }
}
