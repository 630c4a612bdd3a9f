//! Type-erased entity handles.
//!
//! Materialized entities are shared as `Arc<RwLock<dyn Any + Send + Sync>>`:
//! the caller's object graph holds the only strong references, while the
//! identity map and the row-association table hold [`WeakEntityRef`]s that
//! stop resolving once the caller lets go.
//!
//! # Example
//!
//! ```ignore
//! let post = new_entity(Post { id: 1, blog: None });
//! let weak = Arc::downgrade(&post);
//!
//! write_entity::<Post, _>(&post, |p| p.id = 2)?;
//! assert_eq!(read_entity::<Post, _>(&post, |p| p.id)?, 2);
//!
//! drop(post);
//! assert!(weak.upgrade().is_none());
//! ```

use crate::Result;
use crate::error::{Error, TypeError};
use crate::row::Row;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, RwLock, Weak};

/// A strong, shared handle to a materialized entity.
pub type EntityRef = Arc<RwLock<dyn Any + Send + Sync>>;

/// A non-owning handle to a materialized entity.
pub type WeakEntityRef = Weak<RwLock<dyn Any + Send + Sync>>;

/// Builds an entity from a row buffer.
pub type Materializer = Arc<dyn Fn(&Row) -> Result<EntityRef> + Send + Sync>;

/// Wrap a concrete value into a shared entity handle.
pub fn new_entity<T: Any + Send + Sync>(value: T) -> EntityRef {
    Arc::new(RwLock::new(value))
}

/// Identity of an entity handle: the address of its allocation.
///
/// Two handles have the same id exactly when they point at the same object.
/// Ids may be reused after the object is dropped, so anything keyed by an id
/// must also check liveness.
pub fn entity_id(entity: &EntityRef) -> usize {
    Arc::as_ptr(entity).cast::<()>() as usize
}

/// Borrow an entity as `T` and run `f` on it.
pub fn read_entity<T: Any, R>(entity: &EntityRef, f: impl FnOnce(&T) -> R) -> Result<R> {
    let guard = entity.read().map_err(|_| poisoned::<T>())?;
    let typed = guard.downcast_ref::<T>().ok_or_else(downcast_failed::<T>)?;
    Ok(f(typed))
}

/// Mutably borrow an entity as `T` and run `f` on it.
pub fn write_entity<T: Any, R>(entity: &EntityRef, f: impl FnOnce(&mut T) -> R) -> Result<R> {
    let mut guard = entity.write().map_err(|_| poisoned::<T>())?;
    let typed = guard.downcast_mut::<T>().ok_or_else(downcast_failed::<T>)?;
    Ok(f(typed))
}

fn poisoned<T>() -> Error {
    Error::Type(TypeError {
        expected: std::any::type_name::<T>(),
        actual: "poisoned entity lock".to_string(),
        index: None,
    })
}

fn downcast_failed<T>() -> Error {
    Error::Type(TypeError {
        expected: std::any::type_name::<T>(),
        actual: "entity of a different type".to_string(),
        index: None,
    })
}

/// A decoded row together with the means to materialize it.
#[derive(Clone)]
pub struct EntityLoadInfo {
    row: Row,
    materializer: Materializer,
}

impl EntityLoadInfo {
    /// Pair a row with its materializer.
    pub fn new(row: Row, materializer: Materializer) -> Self {
        Self { row, materializer }
    }

    /// The raw row this entity would be built from.
    pub fn row(&self) -> &Row {
        &self.row
    }

    /// Build a fresh entity from the row.
    pub fn materialize(&self) -> Result<EntityRef> {
        (self.materializer)(&self.row)
    }
}

impl fmt::Debug for EntityLoadInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityLoadInfo")
            .field("row", &self.row)
            .finish_non_exhaustive()
    }
}
