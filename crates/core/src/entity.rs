//! Entity descriptors: the per-type shape the sync engine is parameterized over.

use crate::id::EntityKind;

/// A field on an entity that holds the identity of another entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceField {
    /// Wire name of the field (e.g. `productId`).
    pub field: &'static str,
    /// Kind of the referenced entity.
    pub target: EntityKind,
}

/// Nested records the server creates together with their parent
/// (e.g. the line items of a sales return).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildCollection {
    /// Field of the create response holding the child array.
    pub field: &'static str,
    pub kind: EntityKind,
}

/// Client-side duplicate suppression applied before submitting a create.
///
/// Advisory only: the server's idempotency handling is the final arbiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DedupRule {
    #[default]
    None,
    /// Entries sharing `key_field` (e.g. a transaction id) form one unit.
    Grouped { key_field: &'static str },
    /// A recent cached record with equal values for every listed field
    /// (plain fields or references) counts as already applied.
    Content { fields: &'static [&'static str] },
}

/// Static description of one entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityDescriptor {
    pub kind: EntityKind,
    /// Collection path on the remote service (e.g. `/stock-out`).
    pub endpoint: &'static str,
    /// Field carrying the server identity in wire payloads.
    pub id_field: &'static str,
    pub references: &'static [ReferenceField],
    pub dedup: DedupRule,
    pub children: &'static [ChildCollection],
}

impl EntityDescriptor {
    /// Minimal descriptor: no references, no children, no dedup, `id` as id field.
    pub const fn new(kind: EntityKind, endpoint: &'static str) -> Self {
        Self {
            kind,
            endpoint,
            id_field: "id",
            references: &[],
            dedup: DedupRule::None,
            children: &[],
        }
    }

    pub const fn with_id_field(mut self, id_field: &'static str) -> Self {
        self.id_field = id_field;
        self
    }

    pub const fn with_references(mut self, references: &'static [ReferenceField]) -> Self {
        self.references = references;
        self
    }

    pub const fn with_dedup(mut self, dedup: DedupRule) -> Self {
        self.dedup = dedup;
        self
    }

    pub const fn with_children(mut self, children: &'static [ChildCollection]) -> Self {
        self.children = children;
        self
    }

    pub fn reference(&self, field: &str) -> Option<&ReferenceField> {
        self.references.iter().find(|r| r.field == field)
    }

    pub fn is_reference(&self, field: &str) -> bool {
        self.reference(field).is_some()
    }

    /// Kinds this entity depends on (deduplicated, declaration order).
    pub fn dependencies(&self) -> Vec<EntityKind> {
        let mut deps: Vec<EntityKind> = Vec::with_capacity(self.references.len());
        for r in self.references {
            if r.target != self.kind && !deps.contains(&r.target) {
                deps.push(r.target);
            }
        }
        deps
    }
}
