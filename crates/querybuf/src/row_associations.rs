//! Raw-row association table.
//!
//! Keeps the row each materialized entity was built from, keyed by entity
//! identity, so properties that never made it onto the object (shadow
//! fields) can still be read. Entries do not keep their entity alive; dead
//! entries are pruned periodically.

use querybuf_core::{EntityRef, Row, WeakEntityRef, entity_id};
use std::collections::HashMap;
use std::sync::Arc;

struct Association {
    entity: WeakEntityRef,
    row: Row,
}

pub(crate) struct RowAssociations {
    entries: HashMap<usize, Association>,
    sweep_interval: usize,
    since_sweep: usize,
}

impl RowAssociations {
    pub(crate) fn new(sweep_interval: usize) -> Self {
        Self {
            entries: HashMap::new(),
            sweep_interval,
            since_sweep: 0,
        }
    }

    /// Record the row for a freshly materialized entity.
    ///
    /// An existing association for a live entity is never overwritten.
    /// Returns whether the association was recorded.
    pub(crate) fn associate(&mut self, entity: &EntityRef, row: Row) -> bool {
        let id = entity_id(entity);
        if self
            .entries
            .get(&id)
            .is_some_and(|a| a.entity.strong_count() > 0)
        {
            return false;
        }
        self.entries.insert(
            id,
            Association {
                entity: Arc::downgrade(entity),
                row,
            },
        );
        self.since_sweep += 1;
        if self.sweep_interval > 0 && self.since_sweep >= self.sweep_interval {
            self.prune();
        }
        true
    }

    pub(crate) fn try_get_row(&self, entity: &EntityRef) -> Option<&Row> {
        self.entries
            .get(&entity_id(entity))
            .filter(|a| a.entity.strong_count() > 0)
            .map(|a| &a.row)
    }

    /// Drop associations whose entity is gone. Returns how many were removed.
    pub(crate) fn prune(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, a| a.entity.strong_count() > 0);
        self.since_sweep = 0;
        let removed = before - self.entries.len();
        if removed > 0 {
            tracing::trace!(removed, remaining = self.entries.len(), "Pruned row associations");
        }
        removed
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
