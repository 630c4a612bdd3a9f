//! Streaming merge inclusion of collection navigations.
//!
//! Each include site owns one cursor over a related-row stream that is
//! correlated with the outer query and sorted by the same key. Every call
//! consumes the run of related elements belonging to one outer entity and
//! leaves the first non-matching element in place for the next call, so the
//! whole stream is read exactly once across the outer result set.
//!
//! A site's cursor moves through three states: absent (never visited),
//! positioned on a materialized element, and exhausted. Once exhausted the
//! stream is released and is never reopened for that site.

use crate::QueryBuffer;
use crate::identity_map::IncludeKeyComparer;
use crate::materializer::EntityMaterializer;
use crate::metadata::{CollectionAccessor, EntityType, Navigation, ReferenceAccessor};
use crate::stream::{AsyncRelatedStream, RelatedStream};
use querybuf_core::{Cx, EntityLoadInfo, EntityRef, Error, Outcome, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Identifies an include site within a compiled query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IncludeId(pub usize);

/// Everything merge inclusion needs to know about one include site.
#[derive(Clone)]
pub struct IncludeSite {
    pub id: IncludeId,
    pub navigation: Arc<Navigation>,
    pub inverse: Option<Arc<Navigation>>,
    pub target_type: Arc<EntityType>,
    pub collection: Arc<dyn CollectionAccessor>,
    pub inverse_setter: Option<Arc<dyn ReferenceAccessor>>,
    pub tracking: bool,
}

impl IncludeSite {
    /// Derive a site from a collection navigation and its linked inverse.
    pub fn for_navigation(id: usize, navigation: &Arc<Navigation>, tracking: bool) -> Result<Self> {
        let collection = Arc::clone(navigation.collection_accessor()?);
        let inverse = navigation.find_inverse();
        let inverse_setter = inverse
            .as_ref()
            .map(|inverse| inverse.reference_accessor().map(Arc::clone))
            .transpose()?;
        Ok(Self {
            id: IncludeId(id),
            navigation: Arc::clone(navigation),
            target_type: Arc::clone(navigation.target_type()),
            inverse,
            collection,
            inverse_setter,
            tracking,
        })
    }
}

pub(crate) enum CursorState<S> {
    Positioned { stream: S, current: EntityRef },
    Exhausted,
}

impl<S> CursorState<S> {
    fn is_open(&self) -> bool {
        matches!(self, CursorState::Positioned { .. })
    }
}

/// Open include cursors, sync and async, keyed by site.
#[derive(Default)]
pub(crate) struct IncludeCursors {
    sync: HashMap<IncludeId, CursorState<RelatedStream>>,
    asynchronous: HashMap<IncludeId, CursorState<Box<dyn AsyncRelatedStream>>>,
}

impl IncludeCursors {
    /// Cursors still holding an open stream.
    pub(crate) fn active(&self) -> usize {
        self.sync.values().filter(|s| s.is_open()).count()
            + self.asynchronous.values().filter(|s| s.is_open()).count()
    }

    /// Drop every cursor and its stream. Returns how many streams were open.
    pub(crate) fn release(&mut self) -> usize {
        let open = self.active();
        self.sync.clear();
        self.asynchronous.clear();
        open
    }
}

/// Materialize one related element. `None` means the row's key is null.
fn materialize_related(
    cache: &mut EntityMaterializer,
    site: &IncludeSite,
    info: &EntityLoadInfo,
) -> Result<Option<EntityRef>> {
    cache.get_entity(site.target_type.primary_key(), info, site.tracking, false)
}

fn advance(
    cache: &mut EntityMaterializer,
    site: &IncludeSite,
    stream: &mut RelatedStream,
) -> Result<Option<EntityRef>> {
    for item in stream {
        if let Some(entity) = materialize_related(cache, site, &item?)? {
            return Ok(Some(entity));
        }
    }
    Ok(None)
}

async fn advance_async(
    cx: &Cx,
    cache: &mut EntityMaterializer,
    site: &IncludeSite,
    stream: &mut Box<dyn AsyncRelatedStream>,
) -> Outcome<Option<EntityRef>, Error> {
    loop {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        let info = match stream.next(cx).await {
            Outcome::Ok(Some(info)) => info,
            Outcome::Ok(None) => return Outcome::Ok(None),
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        match materialize_related(cache, site, &info) {
            Ok(Some(entity)) => return Outcome::Ok(Some(entity)),
            Ok(None) => {}
            Err(e) => return Outcome::Err(e),
        }
    }
}

/// The related entities gathered for one outer entity.
struct MergeBatch<'s> {
    site: &'s IncludeSite,
    outer: EntityRef,
    comparer: IncludeKeyComparer,
    related: Vec<EntityRef>,
}

impl<'s> MergeBatch<'s> {
    fn new(cache: &mut EntityMaterializer, site: &'s IncludeSite, outer: &EntityRef) -> Result<Self> {
        Ok(Self {
            site,
            outer: Arc::clone(outer),
            comparer: cache.create_include_key_comparer(outer, &site.navigation)?,
            related: Vec::new(),
        })
    }

    /// Take `current` into the batch if it belongs to the outer entity.
    fn offer(&mut self, cache: &EntityMaterializer, current: &EntityRef) -> Result<bool> {
        if !cache.should_include(&self.comparer, current)? {
            return Ok(false);
        }
        let entry = if self.site.tracking {
            Some(cache.start_tracking(current, &self.site.target_type)?)
        } else {
            None
        };
        if let (Some(inverse), Some(setter)) = (&self.site.inverse, &self.site.inverse_setter) {
            setter.set(current, Some(Arc::clone(&self.outer)))?;
            if let Some(entry) = &entry {
                entry.set_relationship_snapshot_value(inverse, Some(&self.outer));
            }
        }
        self.related.push(Arc::clone(current));
        Ok(true)
    }

    /// Assign the batch to the outer collection, initializing it even when empty.
    fn finish(self, cache: &EntityMaterializer) -> Result<()> {
        self.site.collection.add_range(&self.outer, &self.related)?;
        if self.site.tracking {
            if let Some(entry) = cache.dependencies().state_manager.try_get_entry(&self.outer) {
                entry.add_range_to_collection_snapshot(&self.site.navigation, &self.related);
                entry.set_is_loaded(&self.site.navigation);
            }
        }
        tracing::trace!(
            include_id = self.site.id.0,
            navigation = self.site.navigation.name(),
            related = self.related.len(),
            "Included collection"
        );
        Ok(())
    }
}

fn log_exhausted(site: &IncludeSite) {
    tracing::debug!(
        include_id = site.id.0,
        navigation = site.navigation.name(),
        "Include cursor exhausted"
    );
}

impl QueryBuffer {
    /// Include the related entities of `entity` for a collection navigation.
    ///
    /// The stream is created by `related_entities_factory` on the first call
    /// for a site and shared by all later calls. Outer entities must be
    /// presented in the same order the stream is sorted by.
    #[tracing::instrument(level = "trace", skip_all, fields(include_id = site.id.0))]
    pub fn include_collection<F>(
        &mut self,
        site: &IncludeSite,
        entity: &EntityRef,
        related_entities_factory: F,
    ) -> Result<()>
    where
        F: FnOnce() -> Result<RelatedStream>,
    {
        let state = match self.cursors.sync.remove(&site.id) {
            Some(state) => state,
            None => {
                tracing::debug!(
                    include_id = site.id.0,
                    navigation = site.navigation.name(),
                    "Opening include cursor"
                );
                let mut stream = match related_entities_factory() {
                    Ok(stream) => stream,
                    Err(e) => {
                        self.cursors.sync.insert(site.id, CursorState::Exhausted);
                        return Err(e);
                    }
                };
                match advance(&mut self.cache, site, &mut stream) {
                    Ok(Some(current)) => CursorState::Positioned { stream, current },
                    Ok(None) => {
                        log_exhausted(site);
                        CursorState::Exhausted
                    }
                    Err(e) => {
                        self.cursors.sync.insert(site.id, CursorState::Exhausted);
                        return Err(e);
                    }
                }
            }
        };

        let CursorState::Positioned {
            mut stream,
            mut current,
        } = state
        else {
            self.cursors.sync.insert(site.id, CursorState::Exhausted);
            return site.collection.get_or_create(entity);
        };

        let mut batch = match MergeBatch::new(&mut self.cache, site, entity) {
            Ok(batch) => batch,
            Err(e) => {
                self.cursors
                    .sync
                    .insert(site.id, CursorState::Positioned { stream, current });
                return Err(e);
            }
        };

        let next = loop {
            match batch.offer(&self.cache, &current) {
                Ok(true) => {}
                Ok(false) => break Ok(CursorState::Positioned { stream, current }),
                Err(e) => break Err(e),
            }
            match advance(&mut self.cache, site, &mut stream) {
                Ok(Some(entity)) => current = entity,
                Ok(None) => {
                    log_exhausted(site);
                    break Ok(CursorState::Exhausted);
                }
                Err(e) => break Err(e),
            }
        };

        match next {
            Ok(state) => {
                self.cursors.sync.insert(site.id, state);
                batch.finish(&self.cache)
            }
            Err(e) => {
                self.cursors.sync.insert(site.id, CursorState::Exhausted);
                Err(e)
            }
        }
    }

    /// Asynchronous [`include_collection`](Self::include_collection).
    ///
    /// Suspends only while fetching the next related element, and observes
    /// cancellation before each fetch. On cancellation the batch for
    /// `entity` is abandoned and the site's stream is released.
    pub async fn include_collection_async<F>(
        &mut self,
        cx: &Cx,
        site: &IncludeSite,
        entity: &EntityRef,
        related_entities_factory: F,
    ) -> Outcome<(), Error>
    where
        F: FnOnce() -> Result<Box<dyn AsyncRelatedStream>>,
    {
        let state = match self.cursors.asynchronous.remove(&site.id) {
            Some(state) => state,
            None => {
                tracing::debug!(
                    include_id = site.id.0,
                    navigation = site.navigation.name(),
                    "Opening async include cursor"
                );
                let mut stream = match related_entities_factory() {
                    Ok(stream) => stream,
                    Err(e) => return self.abandon_async(site, Outcome::Err(e)),
                };
                match advance_async(cx, &mut self.cache, site, &mut stream).await {
                    Outcome::Ok(Some(current)) => CursorState::Positioned { stream, current },
                    Outcome::Ok(None) => {
                        log_exhausted(site);
                        CursorState::Exhausted
                    }
                    Outcome::Err(e) => return self.abandon_async(site, Outcome::Err(e)),
                    Outcome::Cancelled(r) => return self.abandon_async(site, Outcome::Cancelled(r)),
                    Outcome::Panicked(p) => return self.abandon_async(site, Outcome::Panicked(p)),
                }
            }
        };

        let CursorState::Positioned {
            mut stream,
            mut current,
        } = state
        else {
            self.cursors
                .asynchronous
                .insert(site.id, CursorState::Exhausted);
            return match site.collection.get_or_create(entity) {
                Ok(()) => Outcome::Ok(()),
                Err(e) => Outcome::Err(e),
            };
        };

        let mut batch = match MergeBatch::new(&mut self.cache, site, entity) {
            Ok(batch) => batch,
            Err(e) => {
                self.cursors
                    .asynchronous
                    .insert(site.id, CursorState::Positioned { stream, current });
                return Outcome::Err(e);
            }
        };

        let next = loop {
            match batch.offer(&self.cache, &current) {
                Ok(true) => {}
                Ok(false) => break Outcome::Ok(CursorState::Positioned { stream, current }),
                Err(e) => break Outcome::Err(e),
            }
            match advance_async(cx, &mut self.cache, site, &mut stream).await {
                Outcome::Ok(Some(entity)) => current = entity,
                Outcome::Ok(None) => {
                    log_exhausted(site);
                    break Outcome::Ok(CursorState::Exhausted);
                }
                Outcome::Err(e) => break Outcome::Err(e),
                Outcome::Cancelled(r) => break Outcome::Cancelled(r),
                Outcome::Panicked(p) => break Outcome::Panicked(p),
            }
        };

        let state = match next {
            Outcome::Ok(state) => state,
            Outcome::Err(e) => return self.abandon_async(site, Outcome::Err(e)),
            Outcome::Cancelled(r) => return self.abandon_async(site, Outcome::Cancelled(r)),
            Outcome::Panicked(p) => return self.abandon_async(site, Outcome::Panicked(p)),
        };
        self.cursors.asynchronous.insert(site.id, state);
        match batch.finish(&self.cache) {
            Ok(()) => Outcome::Ok(()),
            Err(e) => Outcome::Err(e),
        }
    }

    /// Release an async site's stream after a failed or cancelled advance.
    fn abandon_async(&mut self, site: &IncludeSite, outcome: Outcome<(), Error>) -> Outcome<(), Error> {
        tracing::debug!(
            include_id = site.id.0,
            navigation = site.navigation.name(),
            "Abandoning async include cursor"
        );
        self.cursors
            .asynchronous
            .insert(site.id, CursorState::Exhausted);
        outcome
    }
}
