//! Navigation fixup.
//!
//! Assigns a batch of related entities onto an entity and, where an inverse
//! navigation exists, assigns the entity back onto each related one. When the
//! query tracks, change notification is suspended for the whole batch and
//! every assignment is mirrored into the owning entry's relationship
//! snapshot so later change detection sees the loaded graph as unchanged.

use crate::metadata::Navigation;
use crate::state::{ChangeDetector, QueryContextDependencies};
use querybuf_core::{EntityRef, MetadataError, Result};
use std::sync::Arc;

/// Suspends change notification for its lifetime.
///
/// Resume runs on drop, so it happens on every exit path.
pub(crate) struct SuspendGuard<'a> {
    detector: Option<&'a dyn ChangeDetector>,
}

impl<'a> SuspendGuard<'a> {
    pub(crate) fn new(detector: &'a dyn ChangeDetector, tracking: bool) -> Self {
        if tracking {
            detector.suspend();
            Self {
                detector: Some(detector),
            }
        } else {
            Self { detector: None }
        }
    }
}

impl Drop for SuspendGuard<'_> {
    fn drop(&mut self) {
        if let Some(detector) = self.detector.take() {
            detector.resume();
        }
    }
}

/// Wire `related` onto `entity` through `path[index]`.
#[tracing::instrument(
    level = "debug",
    skip_all,
    fields(index = index, related = related.len(), tracking = tracking)
)]
pub(crate) fn load_navigation_properties(
    dependencies: &QueryContextDependencies,
    entity: &EntityRef,
    path: &[Arc<Navigation>],
    index: usize,
    related: &[EntityRef],
    tracking: bool,
) -> Result<()> {
    let _guard = SuspendGuard::new(dependencies.change_detector.as_ref(), tracking);

    let navigation = path.get(index).ok_or_else(|| MetadataError {
        element: "navigation path",
        message: format!("index {index} out of range for a path of {}", path.len()),
    })?;
    tracing::debug!(navigation = navigation.name(), "Fixing up navigation");
    let inverse = navigation.find_inverse();

    if navigation.is_dependent_to_principal() {
        if let Some(first) = related.first() {
            set_navigation(dependencies, entity, navigation, Some(first), tracking)?;
            if let Some(inverse) = &inverse {
                if inverse.is_collection() {
                    add_to_collection(dependencies, first, inverse, entity, tracking)?;
                } else {
                    set_navigation(dependencies, first, inverse, Some(entity), tracking)?;
                }
            }
        }
    } else if navigation.is_collection() {
        add_range_to_collection(dependencies, entity, navigation, related, tracking)?;
        if let Some(inverse) = &inverse {
            for item in related {
                set_navigation(dependencies, item, inverse, Some(entity), tracking)?;
            }
        }
    } else if let Some(first) = related.first() {
        set_navigation(dependencies, entity, navigation, Some(first), tracking)?;
        if let Some(inverse) = &inverse {
            set_navigation(dependencies, first, inverse, Some(entity), tracking)?;
        }
    }
    Ok(())
}

pub(crate) fn set_navigation(
    dependencies: &QueryContextDependencies,
    entity: &EntityRef,
    navigation: &Navigation,
    value: Option<&EntityRef>,
    tracking: bool,
) -> Result<()> {
    navigation.reference_accessor()?.set(entity, value.cloned())?;
    if tracking {
        if let Some(entry) = dependencies.state_manager.try_get_entry(entity) {
            entry.set_relationship_snapshot_value(navigation, value);
        }
    }
    Ok(())
}

fn add_to_collection(
    dependencies: &QueryContextDependencies,
    entity: &EntityRef,
    navigation: &Navigation,
    value: &EntityRef,
    tracking: bool,
) -> Result<()> {
    navigation
        .collection_accessor()?
        .add(entity, Arc::clone(value))?;
    if tracking {
        if let Some(entry) = dependencies.state_manager.try_get_entry(entity) {
            entry.add_to_collection_snapshot(navigation, value);
        }
    }
    Ok(())
}

/// Append `values` to a collection navigation, marking it loaded when tracking.
pub(crate) fn add_range_to_collection(
    dependencies: &QueryContextDependencies,
    entity: &EntityRef,
    navigation: &Navigation,
    values: &[EntityRef],
    tracking: bool,
) -> Result<()> {
    navigation.collection_accessor()?.add_range(entity, values)?;
    if tracking {
        if let Some(entry) = dependencies.state_manager.try_get_entry(entity) {
            entry.add_range_to_collection_snapshot(navigation, values);
            entry.set_is_loaded(navigation);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        suspended: AtomicUsize,
        resumed: AtomicUsize,
    }

    impl ChangeDetector for Counter {
        fn suspend(&self) {
            self.suspended.fetch_add(1, Ordering::SeqCst);
        }

        fn resume(&self) {
            self.resumed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn guard_resumes_on_drop_only_when_tracking() {
        let counter = Counter::default();
        {
            let _guard = SuspendGuard::new(&counter, true);
            assert_eq!(counter.suspended.load(Ordering::SeqCst), 1);
            assert_eq!(counter.resumed.load(Ordering::SeqCst), 0);
        }
        assert_eq!(counter.resumed.load(Ordering::SeqCst), 1);

        drop(SuspendGuard::new(&counter, false));
        assert_eq!(counter.suspended.load(Ordering::SeqCst), 1);
        assert_eq!(counter.resumed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn guard_resumes_when_unwinding_through_error() {
        fn failing(counter: &Counter) -> Result<()> {
            let _guard = SuspendGuard::new(counter, true);
            Err(querybuf_core::Error::Custom("midway".into()))
        }
        let counter = Counter::default();
        assert!(failing(&counter).is_err());
        assert_eq!(counter.suspended.load(Ordering::SeqCst), 1);
        assert_eq!(counter.resumed.load(Ordering::SeqCst), 1);
    }
}
