use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::{IdNamespace, SpaceName};
use crate::KernelError;

/// Durable record mapping a canonical UUID to every identifier known to denote it.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PersistedIdentifier {
    pub canonical_id: Uuid,
    pub space: SpaceName,
    #[serde(default)]
    pub alternative_ids: BTreeSet<String>,
    #[serde(default)]
    pub deprecated: bool,
}

impl PersistedIdentifier {
    #[must_use]
    pub fn new(canonical_id: Uuid, space: SpaceName) -> Self {
        Self { canonical_id, space, alternative_ids: BTreeSet::new(), deprecated: false }
    }

    #[must_use]
    pub fn with_alternatives<I, S>(mut self, alternatives: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.alternative_ids.extend(alternatives.into_iter().map(Into::into));
        self
    }

    /// Reject candidates carrying blank alternatives.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when any alternative id is blank.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.alternative_ids.iter().any(|alternative| alternative.trim().is_empty()) {
            return Err(KernelError::Validation(format!(
                "identifier {} carries a blank alternative id",
                self.canonical_id
            )));
        }
        Ok(())
    }

    /// Add this record's own absolute id to its alternatives.
    pub fn include_own_id(&mut self, namespace: &IdNamespace) {
        self.alternative_ids.insert(namespace.absolute_id(self.canonical_id));
    }

    /// Union of alternatives; never removes anything already present.
    pub fn absorb_alternatives<'a, I>(&mut self, alternatives: I)
    where
        I: IntoIterator<Item = &'a String>,
    {
        self.alternative_ids.extend(alternatives.into_iter().cloned());
    }

    /// Fold another record into this one. The other record's own absolute id
    /// becomes one of this record's alternatives.
    pub fn fold_in(&mut self, other: &PersistedIdentifier, namespace: &IdNamespace) {
        self.absorb_alternatives(&other.alternative_ids);
        self.alternative_ids.insert(namespace.absolute_id(other.canonical_id));
    }

    #[must_use]
    pub fn shares_alternative_with(&self, other: &PersistedIdentifier) -> bool {
        !self.alternative_ids.is_disjoint(&other.alternative_ids)
    }

    /// Absolute ids of every record that was folded into this one.
    #[must_use]
    pub fn merged_ids(&self, namespace: &IdNamespace) -> Vec<String> {
        let own = namespace.absolute_id(self.canonical_id);
        self.alternative_ids
            .iter()
            .filter(|alternative| **alternative != own && namespace.is_internal(alternative))
            .cloned()
            .collect()
    }
}

/// Query or upsert input: a UUID, a set of alternatives, or both.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct IdWithAlternatives {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub space: Option<SpaceName>,
    #[serde(default)]
    pub alternatives: BTreeSet<String>,
}

impl IdWithAlternatives {
    /// # Errors
    /// Returns [`KernelError::IllegalArgument`] when neither an id nor an alternative is given.
    pub fn validate_query(&self) -> Result<(), KernelError> {
        if self.id.is_none() && self.alternatives.is_empty() {
            return Err(KernelError::IllegalArgument(
                "id-with-alternatives carries neither an id nor alternatives".to_string(),
            ));
        }
        Ok(())
    }

    /// Convert an upsert request into the candidate record it describes.
    ///
    /// # Errors
    /// Returns [`KernelError::IllegalArgument`] when the id or space is missing,
    /// or [`KernelError::Validation`] when an alternative is blank.
    pub fn to_candidate(&self) -> Result<PersistedIdentifier, KernelError> {
        let Some(id) = self.id else {
            return Err(KernelError::IllegalArgument(
                "an upsert requires a canonical id".to_string(),
            ));
        };
        let Some(space) = self.space.clone() else {
            return Err(KernelError::IllegalArgument(format!(
                "an upsert of {id} requires a space"
            )));
        };
        let candidate =
            PersistedIdentifier::new(id, space).with_alternatives(self.alternatives.iter().cloned());
        candidate.validate()?;
        Ok(candidate)
    }

    /// Every string that may appear among stored alternatives for this query.
    #[must_use]
    pub fn lookup_keys(&self, namespace: &IdNamespace) -> BTreeSet<String> {
        let mut keys = self.alternatives.clone();
        if let Some(id) = self.id {
            keys.insert(namespace.absolute_id(id));
        }
        keys
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ResolvedId {
    pub id: String,
    pub canonical_id: Uuid,
    pub space: SpaceName,
    pub deprecated: bool,
}

/// Resolution of one query: zero, one or (ambiguous) several canonical records.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct IdMapping {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_id: Option<Uuid>,
    pub resolved: Vec<ResolvedId>,
}

impl IdMapping {
    #[must_use]
    pub fn is_unresolved(&self) -> bool {
        self.resolved.is_empty()
    }

    #[must_use]
    pub fn is_ambiguous(&self) -> bool {
        self.resolved.len() > 1
    }

    /// # Errors
    /// Returns [`KernelError::AmbiguousId`] when more than one record was resolved.
    pub fn single(&self) -> Result<Option<&ResolvedId>, KernelError> {
        if self.is_ambiguous() {
            return Err(KernelError::AmbiguousId {
                ids: self.resolved.iter().map(|resolved| resolved.id.clone()).collect(),
            });
        }
        Ok(self.resolved.first())
    }
}

/// Result of one identifier upsert.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct UpsertOutcome {
    pub record: PersistedIdentifier,
    pub merged_ids: Vec<String>,
    pub folded: Vec<Uuid>,
}

/// Outcome of planning an upsert against a snapshot of the store.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MergePlan {
    pub survivor: PersistedIdentifier,
    pub folded: Vec<PersistedIdentifier>,
}

/// Plan an upsert: the candidate (or the existing record it updates) survives and
/// every record in `pool` that transitively shares an alternative with it is folded in.
///
/// `pool` should contain the records of the same space and stage; deprecated
/// records and the survivor itself are skipped.
#[must_use]
pub fn plan_merge(
    existing: Option<&PersistedIdentifier>,
    candidate: &PersistedIdentifier,
    pool: &[PersistedIdentifier],
    namespace: &IdNamespace,
) -> MergePlan {
    let mut survivor = match existing {
        Some(existing) => {
            let mut merged = existing.clone();
            merged.absorb_alternatives(&candidate.alternative_ids);
            merged
        }
        None => candidate.clone(),
    };
    survivor.include_own_id(namespace);

    let mut folded: Vec<PersistedIdentifier> = Vec::new();
    loop {
        let before = folded.len();
        for other in pool {
            if other.canonical_id == survivor.canonical_id
                || other.deprecated
                || other.space != survivor.space
                || folded.iter().any(|done| done.canonical_id == other.canonical_id)
            {
                continue;
            }
            if survivor.shares_alternative_with(other) {
                survivor.fold_in(other, namespace);
                folded.push(other.clone());
            }
        }
        if folded.len() == before {
            break;
        }
    }

    MergePlan { survivor, folded }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space(name: &str) -> SpaceName {
        match SpaceName::new(name) {
            Ok(space) => space,
            Err(err) => panic!("invalid fixture space {name}: {err}"),
        }
    }

    fn record(id: Uuid, alternatives: &[&str]) -> PersistedIdentifier {
        PersistedIdentifier::new(id, space("dataset")).with_alternatives(alternatives.iter().copied())
    }

    // Test IDs: TIDM-001
    #[test]
    fn planning_a_new_record_keeps_candidate_and_adds_own_id() {
        let namespace = IdNamespace::default();
        let id = Uuid::new_v4();
        let candidate = record(id, &["https://example.org/a"]);

        let plan = plan_merge(None, &candidate, &[], &namespace);

        assert!(plan.folded.is_empty());
        assert!(plan.survivor.alternative_ids.contains("https://example.org/a"));
        assert!(plan.survivor.alternative_ids.contains(&namespace.absolute_id(id)));
    }

    // Test IDs: TIDM-002
    #[test]
    fn planning_an_update_never_drops_existing_alternatives() {
        let namespace = IdNamespace::default();
        let id = Uuid::new_v4();
        let existing = record(id, &["https://example.org/a", "https://example.org/b"]);
        let candidate = record(id, &["https://example.org/c"]);

        let plan = plan_merge(Some(&existing), &candidate, &[], &namespace);

        for alternative in ["https://example.org/a", "https://example.org/b", "https://example.org/c"]
        {
            assert!(plan.survivor.alternative_ids.contains(alternative));
        }
    }

    // Test IDs: TIDM-003
    #[test]
    fn folding_reaches_records_connected_through_folded_alternatives() {
        let namespace = IdNamespace::default();
        let target = record(Uuid::new_v4(), &["a"]);
        let first_hop = record(Uuid::new_v4(), &["a", "b"]);
        let second_hop = record(Uuid::new_v4(), &["b", "c"]);
        let unrelated = record(Uuid::new_v4(), &["z"]);
        let pool = vec![second_hop.clone(), unrelated, first_hop.clone()];

        let plan = plan_merge(None, &target, &pool, &namespace);

        let folded = plan.folded.iter().map(|other| other.canonical_id).collect::<BTreeSet<_>>();
        assert_eq!(
            folded,
            [first_hop.canonical_id, second_hop.canonical_id].into_iter().collect::<BTreeSet<_>>()
        );
        assert!(plan.survivor.alternative_ids.contains("c"));
        assert!(plan.survivor.alternative_ids.contains(&namespace.absolute_id(first_hop.canonical_id)));
        assert_eq!(plan.survivor.merged_ids(&namespace).len(), 2);
    }

    // Test IDs: TIDM-004
    #[test]
    fn deprecated_and_foreign_space_records_are_never_folded() {
        let namespace = IdNamespace::default();
        let target = record(Uuid::new_v4(), &["a"]);
        let mut deprecated = record(Uuid::new_v4(), &["a"]);
        deprecated.deprecated = true;
        let other_space = PersistedIdentifier::new(Uuid::new_v4(), space("other"))
            .with_alternatives(["a"]);

        let plan = plan_merge(None, &target, &[deprecated, other_space], &namespace);

        assert!(plan.folded.is_empty());
    }

    // Test IDs: TIDM-005
    #[test]
    fn single_lookup_of_ambiguous_mapping_fails_with_all_ids() {
        let dataset = space("dataset");
        let mapping = IdMapping {
            requested_id: None,
            resolved: vec![
                ResolvedId {
                    id: "https://kg.ebrains.eu/api/instances/1".to_string(),
                    canonical_id: Uuid::new_v4(),
                    space: dataset.clone(),
                    deprecated: false,
                },
                ResolvedId {
                    id: "https://kg.ebrains.eu/api/instances/2".to_string(),
                    canonical_id: Uuid::new_v4(),
                    space: dataset,
                    deprecated: false,
                },
            ],
        };

        match mapping.single() {
            Err(KernelError::AmbiguousId { ids }) => assert_eq!(ids.len(), 2),
            other => panic!("expected ambiguous id error, got {other:?}"),
        }
    }

    // Test IDs: TIDM-006
    #[test]
    fn upsert_request_without_id_or_space_is_illegal() {
        let no_id = IdWithAlternatives {
            id: None,
            space: Some(space("dataset")),
            alternatives: ["a".to_string()].into_iter().collect(),
        };
        let no_space = IdWithAlternatives { id: Some(Uuid::new_v4()), ..IdWithAlternatives::default() };
        let empty = IdWithAlternatives::default();

        assert!(matches!(no_id.to_candidate(), Err(KernelError::IllegalArgument(_))));
        assert!(matches!(no_space.to_candidate(), Err(KernelError::IllegalArgument(_))));
        assert!(matches!(empty.validate_query(), Err(KernelError::IllegalArgument(_))));
    }
}
