//! Materialize-or-reuse over the identity maps and the row association table.

use crate::config::QueryBufferOptions;
use crate::identity_map::{IdentityLookup, IdentityMaps, IncludeKeyComparer, KeySource};
use crate::metadata::{EntityType, Key, Navigation, Property};
use crate::row_associations::RowAssociations;
use crate::state::{EntityEntry, QueryContextDependencies};
use querybuf_core::{
    AssociationMissingError, EntityLoadInfo, EntityRef, NullKeyError, Result, Row, Value,
};
use std::sync::Arc;

/// The entity cache of one query: identity maps plus row associations.
pub(crate) struct EntityMaterializer {
    options: QueryBufferOptions,
    identity_maps: IdentityMaps,
    associations: RowAssociations,
    dependencies: QueryContextDependencies,
}

impl EntityMaterializer {
    pub(crate) fn new(dependencies: QueryContextDependencies, options: QueryBufferOptions) -> Self {
        Self {
            options,
            identity_maps: IdentityMaps::default(),
            associations: RowAssociations::new(options.association_sweep_interval),
            dependencies,
        }
    }

    pub(crate) fn dependencies(&self) -> &QueryContextDependencies {
        &self.dependencies
    }

    /// Return the entity for the key carried by `info`, materializing it if
    /// no live instance exists.
    pub(crate) fn get_entity(
        &mut self,
        key: &Arc<Key>,
        info: &EntityLoadInfo,
        query_state_manager: bool,
        throw_on_null_key: bool,
    ) -> Result<Option<EntityRef>> {
        if query_state_manager {
            if let Some(entry) = self.dependencies.state_manager.try_get_entry_for_key(
                key,
                info.row(),
                throw_on_null_key,
            )? {
                tracing::trace!(entity_type = key.entity_type(), "Resolved from tracked state");
                return Ok(Some(entry.entity()));
            }
        }

        let map = self.identity_maps.get_or_create(key);
        let key_value = match map.lookup(info.row())? {
            IdentityLookup::Live(entity) => return Ok(Some(entity)),
            IdentityLookup::NullKey if throw_on_null_key => {
                return Err(NullKeyError {
                    entity_type: key.entity_type(),
                    properties: key.property_names(),
                }
                .into());
            }
            IdentityLookup::NullKey => return Ok(None),
            IdentityLookup::Collected(key_value) => key_value,
            IdentityLookup::Vacant(key_value) => {
                if self.options.collect_garbage_on_insert {
                    let removed = map.collect_garbage();
                    if removed > 0 {
                        tracing::trace!(
                            entity_type = key.entity_type(),
                            removed,
                            "Collected dead identity entries"
                        );
                    }
                }
                key_value
            }
        };

        let entity = info.materialize()?;
        map.add(key_value, &entity);
        self.associations.associate(&entity, info.row().clone());
        tracing::trace!(
            entity_type = key.entity_type(),
            identity_entries = map.len(),
            "Materialized entity"
        );
        Ok(Some(entity))
    }

    /// Read a property: tracked current value first, then the associated row.
    pub(crate) fn get_property_value(&self, entity: &EntityRef, property: &Property) -> Result<Value> {
        if let Some(entry) = self.dependencies.state_manager.try_get_entry(entity) {
            return Ok(entry.current_value(property));
        }
        let row = self.associations.try_get_row(entity).ok_or(AssociationMissingError {
            operation: "property read",
            property: Some(property.name),
        })?;
        Ok(row.value_at(property.index)?.clone())
    }

    pub(crate) fn row_for(&self, entity: &EntityRef) -> Option<&Row> {
        self.associations.try_get_row(entity)
    }

    /// Hand `entity` to the tracked-state store with its associated row.
    pub(crate) fn start_tracking(
        &self,
        entity: &EntityRef,
        entity_type: &Arc<EntityType>,
    ) -> Result<Arc<dyn EntityEntry>> {
        let row = self.row_for(entity).cloned().unwrap_or_else(Row::empty);
        self.dependencies
            .state_manager
            .start_tracking_from_query(entity_type, entity, &row)
    }

    /// Build the comparer scoping `navigation` to `entity`'s key.
    pub(crate) fn create_include_key_comparer(
        &mut self,
        entity: &EntityRef,
        navigation: &Navigation,
    ) -> Result<IncludeKeyComparer> {
        let map = self
            .identity_maps
            .get_or_create(navigation.foreign_key().principal_key());
        if let Some(row) = self.associations.try_get_row(entity) {
            return map.create_include_key_comparer(navigation, KeySource::Row(row));
        }
        let entry = self
            .dependencies
            .state_manager
            .try_get_entry(entity)
            .ok_or(AssociationMissingError {
                operation: "include key comparison",
                property: None,
            })?;
        map.create_include_key_comparer(navigation, KeySource::Entry(entry.as_ref()))
    }

    /// Does `related` belong to the outer entity `comparer` was built for?
    pub(crate) fn should_include(
        &self,
        comparer: &IncludeKeyComparer,
        related: &EntityRef,
    ) -> Result<bool> {
        if let Some(row) = self.associations.try_get_row(related) {
            return comparer.should_include(row);
        }
        let entry = self
            .dependencies
            .state_manager
            .try_get_entry(related)
            .ok_or(AssociationMissingError {
                operation: "include key comparison",
                property: None,
            })?;
        Ok(comparer.should_include_entry(entry.as_ref()))
    }

    pub(crate) fn identity_map_count(&self) -> usize {
        self.identity_maps.len()
    }

    pub(crate) fn association_count(&self) -> usize {
        self.associations.len()
    }
}
