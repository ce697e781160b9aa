//! Registry of entity descriptors with dependency staging.

use std::collections::{BTreeSet, HashMap};

use crate::entity::EntityDescriptor;
use crate::error::{DomainError, DomainResult};
use crate::id::EntityKind;

/// Validated set of entity descriptors.
///
/// Kinds are grouped into **stages**: every dependency of a kind in stage `n`
/// lives in a stage `< n`. Kinds sharing a stage have no dependency relation.
#[derive(Debug, Clone)]
pub struct Registry {
    descriptors: Vec<EntityDescriptor>,
    index: HashMap<EntityKind, usize>,
    stages: Vec<Vec<EntityKind>>,
}

impl Registry {
    pub fn new(descriptors: impl IntoIterator<Item = EntityDescriptor>) -> DomainResult<Self> {
        let descriptors: Vec<EntityDescriptor> = descriptors.into_iter().collect();

        let mut index = HashMap::with_capacity(descriptors.len());
        for (i, d) in descriptors.iter().enumerate() {
            if !d.kind.is_valid_table_prefix() {
                return Err(DomainError::validation(format!(
                    "entity kind '{}' is not a valid table prefix",
                    d.kind
                )));
            }
            if index.insert(d.kind, i).is_some() {
                return Err(DomainError::validation(format!(
                    "entity kind '{}' registered twice",
                    d.kind
                )));
            }
        }

        for d in &descriptors {
            for r in d.references {
                if !index.contains_key(&r.target) {
                    return Err(DomainError::unknown_entity(format!(
                        "{} (referenced by {}.{})",
                        r.target, d.kind, r.field
                    )));
                }
            }
            for c in d.children {
                if !index.contains_key(&c.kind) {
                    return Err(DomainError::unknown_entity(format!(
                        "{} (child collection {}.{})",
                        c.kind, d.kind, c.field
                    )));
                }
            }
        }

        let stages = compute_stages(&descriptors)?;

        Ok(Self {
            descriptors,
            index,
            stages,
        })
    }

    pub fn get(&self, kind: EntityKind) -> Option<&EntityDescriptor> {
        self.index.get(&kind).map(|&i| &self.descriptors[i])
    }

    pub fn descriptor(&self, kind: EntityKind) -> DomainResult<&EntityDescriptor> {
        self.get(kind)
            .ok_or_else(|| DomainError::unknown_entity(kind.as_str()))
    }

    pub fn contains(&self, kind: EntityKind) -> bool {
        self.index.contains_key(&kind)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn stages(&self) -> &[Vec<EntityKind>] {
        &self.stages
    }

    /// All descriptors, dependencies first.
    pub fn in_dependency_order(&self) -> impl Iterator<Item = &EntityDescriptor> + '_ {
        self.stages
            .iter()
            .flatten()
            .map(|k| &self.descriptors[self.index[k]])
    }

    /// `kind` plus everything it transitively references, in stage order.
    pub fn closure(&self, kind: EntityKind) -> DomainResult<Vec<EntityKind>> {
        self.descriptor(kind)?;

        let mut seen = BTreeSet::new();
        let mut stack = vec![kind];
        while let Some(k) = stack.pop() {
            if !seen.insert(k) {
                continue;
            }
            if let Some(d) = self.get(k) {
                stack.extend(d.dependencies());
            }
        }

        Ok(self
            .stages
            .iter()
            .flatten()
            .copied()
            .filter(|k| seen.contains(k))
            .collect())
    }
}

/// Level-by-level topological sort (Kahn). Within a stage kinds keep
/// registration order, so the result is deterministic.
fn compute_stages(descriptors: &[EntityDescriptor]) -> DomainResult<Vec<Vec<EntityKind>>> {
    let mut placed: BTreeSet<EntityKind> = BTreeSet::new();
    let mut stages = Vec::new();

    while placed.len() < descriptors.len() {
        let stage: Vec<EntityKind> = descriptors
            .iter()
            .filter(|d| !placed.contains(&d.kind))
            .filter(|d| d.dependencies().iter().all(|dep| placed.contains(dep)))
            .map(|d| d.kind)
            .collect();

        if stage.is_empty() {
            let stuck: Vec<&str> = descriptors
                .iter()
                .filter(|d| !placed.contains(&d.kind))
                .map(|d| d.kind.as_str())
                .collect();
            return Err(DomainError::DependencyCycle(stuck.join(", ")));
        }

        placed.extend(stage.iter().copied());
        stages.push(stage);
    }

    Ok(stages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{ChildCollection, ReferenceField};

    const A: EntityKind = EntityKind::new("alpha");
    const B: EntityKind = EntityKind::new("beta");
    const C: EntityKind = EntityKind::new("gamma");
    const D: EntityKind = EntityKind::new("delta");

    const B_REFS: &[ReferenceField] = &[ReferenceField { field: "alphaId", target: A }];
    const C_REFS: &[ReferenceField] = &[
        ReferenceField { field: "betaId", target: B },
        ReferenceField { field: "alphaId", target: A },
    ];
    const D_REFS: &[ReferenceField] = &[ReferenceField { field: "alphaId", target: A }];

    fn sample() -> Vec<EntityDescriptor> {
        vec![
            EntityDescriptor::new(C, "/gamma").with_references(C_REFS),
            EntityDescriptor::new(A, "/alpha"),
            EntityDescriptor::new(B, "/beta").with_references(B_REFS),
            EntityDescriptor::new(D, "/delta").with_references(D_REFS),
        ]
    }

    #[test]
    fn stages_put_dependencies_first() {
        let reg = Registry::new(sample()).unwrap();
        assert_eq!(reg.stages(), &[vec![A], vec![B, D], vec![C]]);

        let order: Vec<EntityKind> = reg.in_dependency_order().map(|d| d.kind).collect();
        assert_eq!(order, vec![A, B, D, C]);
    }

    #[test]
    fn closure_contains_transitive_dependencies_only() {
        let reg = Registry::new(sample()).unwrap();
        assert_eq!(reg.closure(C).unwrap(), vec![A, B, C]);
        assert_eq!(reg.closure(D).unwrap(), vec![A, D]);
        assert_eq!(reg.closure(A).unwrap(), vec![A]);
    }

    #[test]
    fn unknown_reference_target_is_rejected() {
        let err = Registry::new(vec![EntityDescriptor::new(B, "/beta").with_references(B_REFS)])
            .unwrap_err();
        assert!(matches!(err, DomainError::UnknownEntity(_)));
    }

    #[test]
    fn unknown_child_kind_is_rejected() {
        const CHILDREN: &[ChildCollection] = &[ChildCollection { field: "items", kind: B }];
        let err = Registry::new(vec![EntityDescriptor::new(A, "/alpha").with_children(CHILDREN)])
            .unwrap_err();
        assert!(matches!(err, DomainError::UnknownEntity(_)));
    }

    #[test]
    fn cycles_are_rejected() {
        const A_TO_B: &[ReferenceField] = &[ReferenceField { field: "betaId", target: B }];
        let err = Registry::new(vec![
            EntityDescriptor::new(A, "/alpha").with_references(A_TO_B),
            EntityDescriptor::new(B, "/beta").with_references(B_REFS),
        ])
        .unwrap_err();
        assert!(matches!(err, DomainError::DependencyCycle(_)));
    }

    #[test]
    fn self_reference_is_not_a_cycle() {
        const SELF: &[ReferenceField] = &[ReferenceField { field: "parentId", target: A }];
        let reg = Registry::new(vec![EntityDescriptor::new(A, "/alpha").with_references(SELF)])
            .unwrap();
        assert_eq!(reg.stages(), &[vec![A]]);
    }

    #[test]
    fn duplicate_kinds_are_rejected() {
        let err = Registry::new(vec![
            EntityDescriptor::new(A, "/alpha"),
            EntityDescriptor::new(A, "/alpha2"),
        ])
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }
}
