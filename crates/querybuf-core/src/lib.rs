//! Core types for the querybuf query buffer.
//!
//! This crate provides the foundational pieces every buffer layer shares:
//!
//! - `Value` for dynamically typed field values
//! - `Row` for immutable, index-addressed raw row buffers
//! - `EntityRef` / `WeakEntityRef` for type-erased, shareable entities
//! - `Error` and `Result` for the buffer's error taxonomy
//! - `Outcome` and `Cx` re-exported from asupersync for cancel-correct async

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod entity;
pub mod error;
pub mod row;
pub mod value;

pub use entity::{
    EntityLoadInfo, EntityRef, Materializer, WeakEntityRef, entity_id, new_entity, read_entity,
    write_entity,
};
pub use error::{
    AssociationMissingError, Error, MetadataError, NullKeyError, Result, StreamError, TypeError,
};
pub use row::{FromValue, Row};
pub use value::Value;
