//! Recursive inclusion through per-navigation loaders.
//!
//! For each segment of a navigation path the loader is asked for the rows
//! matching the current entity, each row is materialized and included
//! recursively along the rest of the path, and the batch is then wired up by
//! fixup. Nothing is shared between outer entities, so every outer entity
//! costs one loader call per segment.

use crate::QueryBuffer;
use crate::fixup::load_navigation_properties;
use crate::metadata::Navigation;
use crate::stream::{AsyncRelatedEntitiesLoader, RelatedEntitiesLoader};
use querybuf_core::{Cx, EntityRef, Error, MetadataError, Outcome, Result};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

fn path_mismatch(path: usize, loaders: usize) -> MetadataError {
    MetadataError {
        element: "navigation path",
        message: format!("{path} navigations but {loaders} loaders"),
    }
}

impl QueryBuffer {
    /// Include `path` for `entity`, one loader per navigation.
    #[tracing::instrument(level = "debug", skip_all, fields(depth = path.len()))]
    pub fn include(
        &mut self,
        entity: Option<&EntityRef>,
        path: &[Arc<Navigation>],
        loaders: &mut [Box<dyn RelatedEntitiesLoader>],
        query_state_manager: bool,
    ) -> Result<()> {
        if path.len() != loaders.len() {
            return Err(path_mismatch(path.len(), loaders.len()).into());
        }
        self.include_from(entity, path, 0, loaders, query_state_manager)
    }

    fn include_from(
        &mut self,
        entity: Option<&EntityRef>,
        path: &[Arc<Navigation>],
        index: usize,
        loaders: &mut [Box<dyn RelatedEntitiesLoader>],
        query_state_manager: bool,
    ) -> Result<()> {
        let Some(entity) = entity else {
            return Ok(());
        };
        let Some((loader, rest)) = loaders.split_first_mut() else {
            return Ok(());
        };
        let navigation = &path[index];
        let comparer = self.cache.create_include_key_comparer(entity, navigation)?;
        let key = navigation.target_type().primary_key();

        let mut related = Vec::new();
        for info in loader.load(comparer) {
            let target = self.cache.get_entity(key, &info?, query_state_manager, false)?;
            self.include_from(target.as_ref(), path, index + 1, rest, query_state_manager)?;
            related.extend(target);
        }

        load_navigation_properties(
            self.cache.dependencies(),
            entity,
            path,
            index,
            &related,
            query_state_manager,
        )
    }

    /// Asynchronous [`include`](Self::include).
    pub async fn include_async(
        &mut self,
        cx: &Cx,
        entity: Option<&EntityRef>,
        path: &[Arc<Navigation>],
        loaders: &mut [Box<dyn AsyncRelatedEntitiesLoader>],
        query_state_manager: bool,
    ) -> Outcome<(), Error> {
        if path.len() != loaders.len() {
            return Outcome::Err(path_mismatch(path.len(), loaders.len()).into());
        }
        self.include_from_async(cx, entity, path, 0, loaders, query_state_manager)
            .await
    }

    fn include_from_async<'a>(
        &'a mut self,
        cx: &'a Cx,
        entity: Option<&'a EntityRef>,
        path: &'a [Arc<Navigation>],
        index: usize,
        loaders: &'a mut [Box<dyn AsyncRelatedEntitiesLoader>],
        query_state_manager: bool,
    ) -> Pin<Box<dyn Future<Output = Outcome<(), Error>> + 'a>> {
        Box::pin(async move {
            let Some(entity) = entity else {
                return Outcome::Ok(());
            };
            let Some((loader, rest)) = loaders.split_first_mut() else {
                return Outcome::Ok(());
            };
            let navigation = &path[index];
            let comparer = match self.cache.create_include_key_comparer(entity, navigation) {
                Ok(comparer) => comparer,
                Err(e) => return Outcome::Err(e),
            };
            let key = navigation.target_type().primary_key();

            let mut stream = loader.load(comparer);
            let mut related = Vec::new();
            loop {
                if let Some(reason) = cx.cancel_reason() {
                    return Outcome::Cancelled(reason);
                }
                let info = match stream.next(cx).await {
                    Outcome::Ok(Some(info)) => info,
                    Outcome::Ok(None) => break,
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                };
                let target = match self.cache.get_entity(key, &info, query_state_manager, false) {
                    Ok(target) => target,
                    Err(e) => return Outcome::Err(e),
                };
                if let Some(target) = target {
                    match self
                        .include_from_async(
                            cx,
                            Some(&target),
                            path,
                            index + 1,
                            &mut *rest,
                            query_state_manager,
                        )
                        .await
                    {
                        Outcome::Ok(()) => {}
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    }
                    related.push(target);
                }
            }
            drop(stream);

            match load_navigation_properties(
                self.cache.dependencies(),
                entity,
                path,
                index,
                &related,
                query_state_manager,
            ) {
                Ok(()) => Outcome::Ok(()),
                Err(e) => Outcome::Err(e),
            }
        })
    }
}
