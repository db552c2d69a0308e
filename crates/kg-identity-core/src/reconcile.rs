use std::collections::{BTreeSet, HashMap, VecDeque};

use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, info};
use uuid::Uuid;

use crate::document::{Alternative, IndexedDocument, InferredDocument, IDENTIFIER_KEY};
use crate::events::{translate_inference_result_to_events, Event};
use crate::ids::{IdNamespace, SpaceName, Stage};
use crate::KernelError;

/// Read-only access to stored documents, keyed by space, id and stage.
pub trait DocumentSource {
    /// The document `id` plus every document of the space sharing an identifier with it.
    ///
    /// # Errors
    /// Returns [`KernelError::Source`] when the backing store cannot be read.
    fn related_instances_by_identifiers(
        &self,
        space: &SpaceName,
        id: Uuid,
        stage: Stage,
    ) -> Result<Vec<IndexedDocument>, KernelError>;

    /// # Errors
    /// Returns [`KernelError::Source`] when the backing store cannot be read.
    fn instance_by_id(
        &self,
        space: &SpaceName,
        id: Uuid,
        stage: Stage,
    ) -> Result<Option<IndexedDocument>, KernelError>;

    /// Inferred instances listing `source_id` in their `inferenceOf`.
    ///
    /// # Errors
    /// Returns [`KernelError::Source`] when the backing store cannot be read.
    fn inferred_instances_of(
        &self,
        space: &SpaceName,
        source_id: &str,
    ) -> Result<Vec<InferredDocument>, KernelError>;
}

#[derive(Debug, Default)]
struct DisjointSet {
    parent: Vec<usize>,
    size: Vec<usize>,
}

impl DisjointSet {
    fn push(&mut self) -> usize {
        let node = self.parent.len();
        self.parent.push(node);
        self.size.push(1);
        node
    }

    fn find(&mut self, mut node: usize) -> usize {
        while self.parent[node] != node {
            let grandparent = self.parent[self.parent[node]];
            self.parent[node] = grandparent;
            node = grandparent;
        }
        node
    }

    fn union(&mut self, a: usize, b: usize) {
        let (mut a, mut b) = (self.find(a), self.find(b));
        if a == b {
            return;
        }
        if self.size[a] < self.size[b] {
            std::mem::swap(&mut a, &mut b);
        }
        self.parent[b] = a;
        self.size[a] += self.size[b];
    }
}

#[derive(Debug, Default)]
struct Component {
    documents: Vec<usize>,
    identifiers: BTreeSet<String>,
}

/// Connected components of `documents` under "shares an identifier within the same space",
/// in order of first appearance.
fn connected_components(documents: &[&IndexedDocument]) -> Vec<Component> {
    let identifier_sets =
        documents.iter().map(|document| document.all_identifiers()).collect::<Vec<_>>();
    let mut sets = DisjointSet::default();
    let mut nodes: HashMap<(&SpaceName, &str), usize> = HashMap::new();
    let mut document_nodes = Vec::with_capacity(documents.len());

    for (document, identifiers) in documents.iter().zip(&identifier_sets) {
        let mut first = None;
        for identifier in identifiers {
            let node =
                *nodes.entry((&document.space, identifier.as_str())).or_insert_with(|| sets.push());
            match first {
                Some(root) => sets.union(root, node),
                None => first = Some(node),
            }
        }
        document_nodes.push(first.unwrap_or_else(|| sets.push()));
    }

    let mut slots: HashMap<usize, usize> = HashMap::new();
    let mut components: Vec<Component> = Vec::new();
    for (index, node) in document_nodes.into_iter().enumerate() {
        let root = sets.find(node);
        let slot = *slots.entry(root).or_insert_with(|| {
            components.push(Component::default());
            components.len() - 1
        });
        components[slot].documents.push(index);
    }
    for ((_, identifier), node) in &nodes {
        let root = sets.find(*node);
        if let Some(slot) = slots.get(&root) {
            components[*slot].identifiers.insert((*identifier).to_string());
        }
    }
    components
}

/// Partition all identifiers of `documents` into the clusters of documents sharing them.
///
/// The closure is transitive: `{A,B}` and `{B,C}` end up in the same cluster as `{C,D}`.
/// Identifiers are only ever connected within one space. Clusters are returned sorted.
#[must_use]
pub fn combine_ids(documents: &[IndexedDocument]) -> Vec<BTreeSet<String>> {
    let references = documents.iter().collect::<Vec<_>>();
    let mut clusters = connected_components(&references)
        .into_iter()
        .map(|component| component.identifiers)
        .filter(|identifiers| !identifiers.is_empty())
        .collect::<Vec<_>>();
    clusters.sort();
    clusters
}

/// The documents of one connected component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileUnit<'a> {
    pub documents: Vec<&'a IndexedDocument>,
}

impl ReconcileUnit<'_> {
    #[must_use]
    pub fn identifiers(&self) -> BTreeSet<String> {
        self.documents.iter().flat_map(|document| document.all_identifiers()).collect()
    }
}

/// Group `documents` by the same connected-component relation as [`combine_ids`].
/// A document without any identifier forms a unit of its own.
#[must_use]
pub fn extract_reconcile_units(documents: &[IndexedDocument]) -> Vec<ReconcileUnit<'_>> {
    let references = documents.iter().collect::<Vec<_>>();
    connected_components(&references)
        .into_iter()
        .map(|component| ReconcileUnit {
            documents: component.documents.into_iter().map(|index| references[index]).collect(),
        })
        .collect()
}

fn alternatives_for(key: &str, contributors: &[&IndexedDocument]) -> Vec<Alternative> {
    let mut alternatives: Vec<Alternative> = Vec::new();
    for (rank, document) in contributors.iter().enumerate() {
        let value = document.properties.get(key).cloned().unwrap_or(Value::Null);
        let slot = match alternatives.iter().position(|alternative| alternative.value == value) {
            Some(slot) => slot,
            None => {
                alternatives.push(Alternative { value, selected: false, users: Vec::new() });
                alternatives.len() - 1
            }
        };
        let alternative = &mut alternatives[slot];
        alternative.selected |= rank == 0;
        if let Some(user) = &document.user {
            if !alternative.users.contains(user) {
                alternative.users.push(user.clone());
            }
        }
    }
    alternatives
}

/// Compute the inferred view of one unit.
///
/// Per property the contributors are ordered newest first by their update time for that
/// property; the newest value is taken and dropped again if it is null. `@id` is kept
/// only when every document carrying one agrees.
#[must_use]
pub fn merge_unit(unit: &ReconcileUnit<'_>, namespace: &IdNamespace) -> Option<InferredDocument> {
    let first = unit.documents.first()?;
    let mut inferred = InferredDocument::new(first.space.clone());

    let ids = unit.documents.iter().filter_map(|document| document.id.as_ref()).collect::<BTreeSet<_>>();
    if ids.len() == 1 {
        inferred.id = ids.into_iter().next().cloned();
    }
    for document in &unit.documents {
        inferred.identifiers.extend(document.identifiers.iter().cloned());
    }

    let keys = unit
        .documents
        .iter()
        .flat_map(|document| document.properties.keys().chain(document.property_updates.keys()))
        .filter(|key| !key.starts_with('_') && *key != "@id" && *key != IDENTIFIER_KEY)
        .collect::<BTreeSet<_>>();

    for key in keys {
        let mut contributors = unit
            .documents
            .iter()
            .copied()
            .filter(|document| {
                document.properties.contains_key(key) || document.property_updates.contains_key(key)
            })
            .collect::<Vec<_>>();
        contributors.sort_by(|a, b| {
            b.updated_at(key).cmp(&a.updated_at(key)).then_with(|| a.document_id.cmp(&b.document_id))
        });
        let Some(newest) = contributors.first() else {
            continue;
        };
        if let Some(value) = newest.properties.get(key).filter(|value| !value.is_null()) {
            inferred.properties.insert(key.clone(), value.clone());
        }
        if !key.starts_with('@') {
            inferred.alternatives.insert(key.clone(), alternatives_for(key, &contributors));
        }
    }

    inferred.inference_of = unit
        .documents
        .iter()
        .map(|document| namespace.absolute_id(document.document_id))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    Some(inferred)
}

/// One inferred document per connected component of `documents`.
#[must_use]
pub fn reconcile_documents(
    documents: &[IndexedDocument],
    namespace: &IdNamespace,
) -> Vec<InferredDocument> {
    extract_reconcile_units(documents)
        .iter()
        .filter_map(|unit| merge_unit(unit, namespace))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpdate {
    pub inferred: InferredDocument,
    pub existing: InferredDocument,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMerge {
    pub inferred: InferredDocument,
    pub existing: Vec<InferredDocument>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InferenceResult {
    pub to_be_inserted: Vec<InferredDocument>,
    pub to_be_updated: Vec<PendingUpdate>,
    pub to_be_removed: Vec<InferredDocument>,
    pub to_be_merged: Vec<PendingMerge>,
    /// Newly computed documents already reflected by their existing instance.
    pub unchanged: usize,
}

impl InferenceResult {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_be_inserted.is_empty()
            && self.to_be_updated.is_empty()
            && self.to_be_removed.is_empty()
            && self.to_be_merged.is_empty()
    }

    #[must_use]
    pub fn event_count(&self) -> usize {
        self.to_be_inserted.len()
            + self.to_be_updated.len()
            + self.to_be_removed.len()
            + self.to_be_merged.iter().map(|merge| merge.existing.len() + 1).sum::<usize>()
    }
}

/// Diff newly computed inferred documents against the existing ones.
///
/// An existing instance sharing identifiers with several new documents belongs to the
/// one sharing the most (the earlier one on ties), so each existing instance lands in
/// exactly one bucket.
#[must_use]
pub fn compare_inferred_instances(
    existing: Vec<InferredDocument>,
    computed: Vec<InferredDocument>,
) -> InferenceResult {
    let existing_identifiers =
        existing.iter().map(InferredDocument::all_identifiers).collect::<Vec<_>>();

    let mut owners: Vec<Option<(usize, usize)>> = vec![None; existing.len()];
    for (new_index, document) in computed.iter().enumerate() {
        let identifiers = document.all_identifiers();
        for (existing_index, candidates) in existing_identifiers.iter().enumerate() {
            let overlap = identifiers.intersection(candidates).count();
            if overlap == 0 {
                continue;
            }
            let replace = match owners[existing_index] {
                Some((_, best)) => overlap > best,
                None => true,
            };
            if replace {
                owners[existing_index] = Some((new_index, overlap));
            }
        }
    }

    let mut claimed: Vec<Vec<usize>> = vec![Vec::new(); computed.len()];
    for (existing_index, owner) in owners.iter().enumerate() {
        if let Some((new_index, _)) = owner {
            claimed[*new_index].push(existing_index);
        }
    }

    let mut slots = existing.into_iter().map(Some).collect::<Vec<_>>();
    let mut result = InferenceResult::default();
    for (document, claims) in computed.into_iter().zip(claimed) {
        let mut matched =
            claims.into_iter().filter_map(|index| slots[index].take()).collect::<Vec<_>>();
        match matched.len() {
            0 => result.to_be_inserted.push(document),
            1 => {
                let Some(existing) = matched.pop() else {
                    continue;
                };
                if document.is_reflected_by(&existing) {
                    result.unchanged += 1;
                } else {
                    result.to_be_updated.push(PendingUpdate { inferred: document, existing });
                }
            }
            _ => result.to_be_merged.push(PendingMerge { inferred: document, existing: matched }),
        }
    }
    result.to_be_removed = slots.into_iter().flatten().collect();
    result
}

/// Documents and existing instances reachable from one changed document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvolvedDocuments {
    pub documents: Vec<IndexedDocument>,
    pub existing_instances: Vec<InferredDocument>,
}

pub struct Reconciler<'a, S: DocumentSource + ?Sized> {
    source: &'a S,
    namespace: &'a IdNamespace,
}

impl<'a, S: DocumentSource + ?Sized> Reconciler<'a, S> {
    #[must_use]
    pub fn new(source: &'a S, namespace: &'a IdNamespace) -> Self {
        Self { source, namespace }
    }

    /// Walk from `id` through shared identifiers and through the sources of existing
    /// inferred instances until no new document turns up.
    ///
    /// # Errors
    /// Returns [`KernelError::InconsistentState`] when a document is the source of more
    /// than one inferred instance, or any error of the document source.
    pub fn find_involved_documents(
        &self,
        space: &SpaceName,
        id: Uuid,
    ) -> Result<InvolvedDocuments, KernelError> {
        let mut involved = InvolvedDocuments::default();
        let mut queue = VecDeque::from([id]);
        let mut handled_documents = BTreeSet::new();
        let mut collected_documents = BTreeSet::new();
        let mut handled_instances = BTreeSet::new();

        while let Some(next) = queue.pop_front() {
            if !handled_documents.insert(next) {
                continue;
            }

            for document in self.source.related_instances_by_identifiers(space, next, Stage::Native)? {
                if document.space != *space || !collected_documents.insert(document.document_id) {
                    continue;
                }
                if !handled_documents.contains(&document.document_id) {
                    queue.push_back(document.document_id);
                }
                involved.documents.push(document);
            }

            let source_id = self.namespace.absolute_id(next);
            let mut instances = self.source.inferred_instances_of(space, &source_id)?;
            if instances.len() > 1 {
                let ids = instances.iter().filter_map(|instance| instance.id.clone()).collect::<Vec<_>>();
                return Err(KernelError::InconsistentState(format!(
                    "there are {} inferred instances for {source_id} ({})",
                    instances.len(),
                    ids.join(", ")
                )));
            }
            if let Some(instance) = instances.pop() {
                let instance_key = instance.id.clone().unwrap_or_default();
                if handled_instances.insert(instance_key) {
                    for source in &instance.inference_of {
                        if let Some(uuid) = self.namespace.uuid_of(source) {
                            if !handled_documents.contains(&uuid) {
                                queue.push_back(uuid);
                            }
                        }
                    }
                    involved.existing_instances.push(instance);
                }
            }
        }

        debug!(
            space = %space,
            document_id = %id,
            documents = involved.documents.len(),
            existing_instances = involved.existing_instances.len(),
            "collected involved documents"
        );
        Ok(involved)
    }

    /// Compute the inference diff for the cluster around `id` without translating it.
    ///
    /// # Errors
    /// Propagates errors of [`Self::find_involved_documents`].
    pub fn infer(&self, space: &SpaceName, id: Uuid) -> Result<InferenceResult, KernelError> {
        let involved = self.find_involved_documents(space, id)?;
        let computed = reconcile_documents(&involved.documents, self.namespace);
        let result = compare_inferred_instances(involved.existing_instances, computed);
        info!(
            space = %space,
            document_id = %id,
            inserted = result.to_be_inserted.len(),
            updated = result.to_be_updated.len(),
            removed = result.to_be_removed.len(),
            merged = result.to_be_merged.len(),
            unchanged = result.unchanged,
            "reconciled document"
        );
        Ok(result)
    }

    /// Reconcile the cluster around document `id` and return the events applying it.
    ///
    /// # Errors
    /// Returns any error of the document source, [`KernelError::InconsistentState`] for
    /// corrupt inferred state.
    pub fn reconcile(&self, space: &SpaceName, id: Uuid) -> Result<Vec<Event>, KernelError> {
        self.reconcile_at(space, id, OffsetDateTime::now_utc())
    }

    /// Like [`Self::reconcile`] with an explicit event timestamp.
    ///
    /// # Errors
    /// Same as [`Self::reconcile`].
    pub fn reconcile_at(
        &self,
        space: &SpaceName,
        id: Uuid,
        now: OffsetDateTime,
    ) -> Result<Vec<Event>, KernelError> {
        let result = self.infer(space, id)?;
        translate_inference_result_to_events(space, result, self.namespace, now)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    use proptest::prelude::*;
    use serde_json::json;
    use time::Duration;

    use super::*;
    use crate::document::Timestamp;
    use crate::events::EventType;

    const GIVEN_NAME: &str = "http://schema.org/givenName";

    fn space(name: &str) -> SpaceName {
        match SpaceName::new(name) {
            Ok(space) => space,
            Err(err) => panic!("invalid fixture space {name}: {err}"),
        }
    }

    fn fixture_time(offset_seconds: i64) -> Timestamp {
        Timestamp(OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000 + offset_seconds))
    }

    fn doc_in(space_name: &str, identifiers: &[&str]) -> IndexedDocument {
        let mut document = IndexedDocument::new(Uuid::new_v4(), space(space_name));
        document.identifiers = identifiers.iter().map(ToString::to_string).collect();
        document
    }

    fn doc(identifiers: &[&str]) -> IndexedDocument {
        doc_in("dataset", identifiers)
    }

    fn inferred(identifiers: &[&str]) -> InferredDocument {
        let mut document = InferredDocument::new(space("dataset"));
        document.identifiers = identifiers.iter().map(ToString::to_string).collect();
        document
    }

    fn stored(namespace: &IdNamespace, identifiers: &[&str]) -> InferredDocument {
        let mut document = inferred(identifiers);
        document.id = Some(namespace.absolute_id(Uuid::new_v4()));
        document
    }

    fn set(identifiers: &[&str]) -> BTreeSet<String> {
        identifiers.iter().map(ToString::to_string).collect()
    }

    /// In-memory document source applying events the way the store does.
    #[derive(Default)]
    struct MemorySource {
        native: Vec<IndexedDocument>,
        inferred: RefCell<BTreeMap<Uuid, InferredDocument>>,
    }

    impl MemorySource {
        fn apply(&self, events: &[Event]) {
            let mut inferred = self.inferred.borrow_mut();
            for event in events {
                match event.event_type {
                    EventType::Insert | EventType::Update => {
                        inferred.insert(event.document_id, event.data.clone());
                    }
                    EventType::Delete => {
                        inferred.remove(&event.document_id);
                    }
                    EventType::Release | EventType::Unrelease => {}
                }
            }
        }
    }

    impl DocumentSource for MemorySource {
        fn related_instances_by_identifiers(
            &self,
            space: &SpaceName,
            id: Uuid,
            _stage: Stage,
        ) -> Result<Vec<IndexedDocument>, KernelError> {
            let Some(origin) = self.native.iter().find(|document| document.document_id == id) else {
                return Ok(Vec::new());
            };
            let identifiers = origin.all_identifiers();
            Ok(self
                .native
                .iter()
                .filter(|document| {
                    document.space == *space && !document.all_identifiers().is_disjoint(&identifiers)
                })
                .cloned()
                .collect())
        }

        fn instance_by_id(
            &self,
            _space: &SpaceName,
            id: Uuid,
            _stage: Stage,
        ) -> Result<Option<IndexedDocument>, KernelError> {
            Ok(self.native.iter().find(|document| document.document_id == id).cloned())
        }

        fn inferred_instances_of(
            &self,
            space: &SpaceName,
            source_id: &str,
        ) -> Result<Vec<InferredDocument>, KernelError> {
            Ok(self
                .inferred
                .borrow()
                .values()
                .filter(|instance| {
                    instance.space == *space
                        && instance.inference_of.iter().any(|source| source == source_id)
                })
                .cloned()
                .collect())
        }
    }

    // Test IDs: TREC-001
    #[test]
    fn combine_ids_groups_documents_sharing_identifiers() {
        let documents = vec![doc(&["A"]), doc(&["B"]), doc(&["C"]), doc(&["A", "B"])];

        let clusters = combine_ids(&documents);

        assert_eq!(clusters, vec![set(&["A", "B"]), set(&["C"])]);
    }

    // Test IDs: TREC-002
    #[test]
    fn combine_ids_closes_chains_transitively() {
        let documents =
            vec![doc(&["A"]), doc(&["B"]), doc(&["C"]), doc(&["B", "C"]), doc(&["A", "B"])];
        let three_hops = vec![doc(&["A", "B"]), doc(&["B", "C"]), doc(&["C", "D"])];

        assert_eq!(combine_ids(&documents), vec![set(&["A", "B", "C"])]);
        assert_eq!(combine_ids(&three_hops), vec![set(&["A", "B", "C", "D"])]);
    }

    // Test IDs: TREC-003
    #[test]
    fn identical_identifiers_in_different_spaces_never_cluster() {
        let documents = vec![doc_in("dataset", &["A"]), doc_in("person", &["A"])];

        let units = extract_reconcile_units(&documents);

        assert_eq!(units.len(), 2);
        assert_eq!(combine_ids(&documents).len(), 2);
        for unit in &units {
            assert_eq!(unit.documents.len(), 1);
        }
    }

    // Test IDs: TREC-004
    #[test]
    fn reconcile_units_hold_the_clustered_documents() {
        let documents = vec![doc(&["A"]), doc(&["C"]), doc(&["A", "B"]), doc(&[])];

        let units = extract_reconcile_units(&documents);

        assert_eq!(units.len(), 3);
        assert_eq!(units[0].documents, vec![&documents[0], &documents[2]]);
        assert_eq!(units[0].identifiers(), set(&["A", "B"]));
        assert_eq!(units[1].documents, vec![&documents[1]]);
        assert_eq!(units[2].documents, vec![&documents[3]]);
    }

    // Test IDs: TREC-005
    #[test]
    fn newest_property_value_wins_and_alternatives_are_kept() {
        let namespace = IdNamespace::default();
        let mut older = doc(&["A"]);
        older.user = Some("alice".to_string());
        older.indexed_at = Some(fixture_time(0));
        older.properties.insert(GIVEN_NAME.to_string(), json!("Bart"));
        let mut newer = doc(&["A"]);
        newer.user = Some("bob".to_string());
        newer.indexed_at = Some(fixture_time(-100));
        newer.property_updates.insert(GIVEN_NAME.to_string(), fixture_time(60));
        newer.properties.insert(GIVEN_NAME.to_string(), json!("Bartholomew"));

        for documents in [vec![older.clone(), newer.clone()], vec![newer.clone(), older.clone()]] {
            let inferred = reconcile_documents(&documents, &namespace);

            assert_eq!(inferred.len(), 1);
            assert_eq!(inferred[0].properties.get(GIVEN_NAME), Some(&json!("Bartholomew")));
            let Some(alternatives) = inferred[0].alternatives.get(GIVEN_NAME) else {
                panic!("missing alternatives for {GIVEN_NAME}");
            };
            assert_eq!(
                alternatives,
                &vec![
                    Alternative {
                        value: json!("Bartholomew"),
                        selected: true,
                        users: vec!["bob".to_string()],
                    },
                    Alternative {
                        value: json!("Bart"),
                        selected: false,
                        users: vec!["alice".to_string()],
                    },
                ]
            );
            assert_eq!(inferred[0].inference_of.len(), 2);
        }
    }

    // Test IDs: TREC-006
    #[test]
    fn property_removed_by_newest_writer_is_dropped() {
        let namespace = IdNamespace::default();
        let mut older = doc(&["A"]);
        older.indexed_at = Some(fixture_time(0));
        older.properties.insert(GIVEN_NAME.to_string(), json!("Bart"));
        let mut newer = doc(&["A"]);
        newer.indexed_at = Some(fixture_time(0));
        newer.property_updates.insert(GIVEN_NAME.to_string(), fixture_time(10));

        let inferred = reconcile_documents(&[older, newer], &namespace);

        assert_eq!(inferred.len(), 1);
        assert!(!inferred[0].properties.contains_key(GIVEN_NAME));
        assert_eq!(inferred[0].alternatives.get(GIVEN_NAME).map(Vec::len), Some(2));
    }

    // Test IDs: TREC-007
    #[test]
    fn id_is_kept_only_when_contributors_agree() {
        let namespace = IdNamespace::default();
        let mut single = doc(&["A"]);
        single.assign_default_id(&namespace);
        let mut other = doc(&["A"]);
        other.assign_default_id(&namespace);

        let alone = reconcile_documents(&[single.clone()], &namespace);
        let together = reconcile_documents(&[single.clone(), other], &namespace);

        assert_eq!(alone[0].id, single.id);
        assert_eq!(together[0].id, None);
        assert!(together[0].identifiers.contains("A"));
    }

    // Test IDs: TREC-008
    #[test]
    fn diff_buckets_inserts_updates_and_removals() {
        let namespace = IdNamespace::default();
        let mut existing_a = stored(&namespace, &["A"]);
        existing_a.properties.insert(GIVEN_NAME.to_string(), json!("Bart"));
        let existing_b = stored(&namespace, &["B"]);
        let mut new_a = inferred(&["A"]);
        new_a.properties.insert(GIVEN_NAME.to_string(), json!("Bartholomew"));
        let new_c = inferred(&["C"]);

        let result = compare_inferred_instances(
            vec![existing_a.clone(), existing_b.clone()],
            vec![new_a.clone(), new_c.clone()],
        );

        assert_eq!(result.to_be_inserted, vec![new_c]);
        assert_eq!(result.to_be_removed, vec![existing_b]);
        assert_eq!(
            result.to_be_updated,
            vec![PendingUpdate { inferred: new_a, existing: existing_a }]
        );
        assert!(result.to_be_merged.is_empty());

        let same_payload = compare_inferred_instances(
            vec![stored(&namespace, &["A"]), stored(&namespace, &["B"])],
            vec![inferred(&["A"]), inferred(&["C"])],
        );
        assert_eq!(same_payload.unchanged, 1);
        assert!(same_payload.to_be_updated.is_empty());
        assert_eq!(same_payload.to_be_inserted.len(), 1);
        assert_eq!(same_payload.to_be_removed.len(), 1);
    }

    // Test IDs: TREC-009
    #[test]
    fn diff_detects_merge_of_two_instances() {
        let namespace = IdNamespace::default();

        let result = compare_inferred_instances(
            vec![stored(&namespace, &["A"]), stored(&namespace, &["B"])],
            vec![inferred(&["X", "A", "B"])],
        );

        assert_eq!(result.to_be_merged.len(), 1);
        assert_eq!(result.to_be_merged[0].existing.len(), 2);
        assert!(result.to_be_inserted.is_empty());
        assert!(result.to_be_updated.is_empty());
        assert!(result.to_be_removed.is_empty());
    }

    // Test IDs: TREC-010
    #[test]
    fn split_assigns_existing_instance_to_largest_overlap() {
        let namespace = IdNamespace::default();
        let existing = stored(&namespace, &["A", "B", "C"]);
        let mut larger = inferred(&["B", "C"]);
        larger.properties.insert(GIVEN_NAME.to_string(), json!("Bart"));

        let result =
            compare_inferred_instances(vec![existing.clone()], vec![inferred(&["A"]), larger]);

        assert_eq!(result.to_be_inserted, vec![inferred(&["A"])]);
        assert_eq!(result.to_be_updated.len(), 1);
        assert_eq!(result.to_be_updated[0].existing, existing);
        assert!(result.to_be_removed.is_empty());
    }

    // Test IDs: TREC-011
    #[test]
    fn reflected_document_is_not_bucketed() {
        let namespace = IdNamespace::default();
        let mut existing = stored(&namespace, &["A", "B"]);
        existing.properties.insert(GIVEN_NAME.to_string(), json!("Bart"));
        let mut computed = inferred(&["A"]);
        computed.properties.insert(GIVEN_NAME.to_string(), json!("Bart"));

        let result = compare_inferred_instances(vec![existing], vec![computed]);

        assert!(result.is_empty());
        assert_eq!(result.unchanged, 1);
    }

    // Test IDs: TREC-012
    #[test]
    fn reconcile_merges_then_settles() -> Result<(), KernelError> {
        let namespace = IdNamespace::default();
        let mut foo = doc(&["foo"]);
        foo.assign_default_id(&namespace);
        let mut bar = doc(&["bar"]);
        bar.assign_default_id(&namespace);
        let mut source = MemorySource { native: vec![foo.clone(), bar.clone()], ..MemorySource::default() };

        for document in [&foo, &bar] {
            let events = Reconciler::new(&source, &namespace).reconcile(&space("dataset"), document.document_id)?;
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].event_type, EventType::Insert);
            source.apply(&events);
        }

        foo.identifiers.insert("bar".to_string());
        source.native = vec![foo.clone(), bar.clone()];
        let events = Reconciler::new(&source, &namespace).reconcile(&space("dataset"), foo.document_id)?;
        let kinds = events.iter().map(|event| event.event_type).collect::<Vec<_>>();
        assert_eq!(kinds, vec![EventType::Insert, EventType::Delete, EventType::Delete]);
        source.apply(&events);
        assert_eq!(source.inferred.borrow().len(), 1);

        let repeat = Reconciler::new(&source, &namespace).reconcile(&space("dataset"), bar.document_id)?;
        assert!(repeat.is_empty());
        Ok(())
    }

    // Test IDs: TREC-013
    #[test]
    fn reconcile_removes_instance_of_deleted_document() -> Result<(), KernelError> {
        let namespace = IdNamespace::default();
        let mut foo = doc(&["foo"]);
        foo.assign_default_id(&namespace);
        let mut source = MemorySource { native: vec![foo.clone()], ..MemorySource::default() };
        let events = Reconciler::new(&source, &namespace).reconcile(&space("dataset"), foo.document_id)?;
        source.apply(&events);

        source.native.clear();
        let events = Reconciler::new(&source, &namespace).reconcile(&space("dataset"), foo.document_id)?;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Delete);
        assert_eq!(events[0].document_id, foo.document_id);
        Ok(())
    }

    // Test IDs: TREC-014
    #[test]
    fn second_inferred_instance_for_a_document_is_inconsistent() {
        let namespace = IdNamespace::default();
        let foo = doc(&["foo"]);
        let source = MemorySource { native: vec![foo.clone()], ..MemorySource::default() };
        for _ in 0..2 {
            let mut instance = stored(&namespace, &["foo"]);
            instance.inference_of = vec![namespace.absolute_id(foo.document_id)];
            let Some(id) = instance.id.as_deref().and_then(|id| namespace.uuid_of(id)) else {
                panic!("fixture instance has no internal id");
            };
            source.inferred.borrow_mut().insert(id, instance);
        }

        let outcome = Reconciler::new(&source, &namespace).reconcile(&space("dataset"), foo.document_id);

        assert!(matches!(outcome, Err(KernelError::InconsistentState(_))));
    }

    fn identifier_groups() -> impl Strategy<Value = Vec<Vec<u8>>> {
        prop::collection::vec(prop::collection::vec(0_u8..24, 0..4), 0..24)
    }

    // Test IDs: TREC-015
    proptest! {
        #[test]
        fn property_combine_ids_is_a_partition_closed_under_sharing(groups in identifier_groups()) {
            let documents = groups
                .iter()
                .map(|group| {
                    let names = group.iter().map(|value| format!("id-{value}")).collect::<Vec<_>>();
                    doc(&names.iter().map(String::as_str).collect::<Vec<_>>())
                })
                .collect::<Vec<_>>();

            let clusters = combine_ids(&documents);

            let mut seen = BTreeSet::new();
            for cluster in &clusters {
                for identifier in cluster {
                    prop_assert!(seen.insert(identifier.clone()));
                }
            }
            let all = documents.iter().flat_map(IndexedDocument::all_identifiers).collect::<BTreeSet<_>>();
            prop_assert_eq!(&seen, &all);
            for document in &documents {
                let identifiers = document.all_identifiers();
                if identifiers.is_empty() {
                    continue;
                }
                let holding = clusters.iter().filter(|cluster| !cluster.is_disjoint(&identifiers)).count();
                prop_assert_eq!(holding, 1);
            }

            let mut reversed = documents.clone();
            reversed.reverse();
            prop_assert_eq!(combine_ids(&reversed), clusters);
        }
    }
}
