//! `stockroom-core`: identity and entity-shape building blocks.
//!
//! This crate contains **pure** primitives shared by the entity catalog and the
//! synchronization engine (no storage, no network).

pub mod entity;
pub mod error;
pub mod id;
pub mod reference;
pub mod registry;

pub use entity::{ChildCollection, DedupRule, EntityDescriptor, ReferenceField};
pub use error::{DomainError, DomainResult};
pub use id::{EntityKind, ServerId, TempId};
pub use reference::Reference;
pub use registry::Registry;
