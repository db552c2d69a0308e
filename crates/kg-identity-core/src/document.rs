use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::ids::{IdNamespace, SpaceName};

pub const IDENTIFIER_KEY: &str = "http://schema.org/identifier";

/// Point in time used to order contributions of documents to a property.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct Timestamp(#[serde(with = "time::serde::rfc3339")] pub OffsetDateTime);

impl From<OffsetDateTime> for Timestamp {
    fn from(value: OffsetDateTime) -> Self {
        Self(value)
    }
}

fn union_with_id(id: Option<&String>, identifiers: &BTreeSet<String>) -> BTreeSet<String> {
    let mut all = identifiers.clone();
    if let Some(id) = id {
        all.insert(id.clone());
    }
    all
}

/// A native document as stored for one user in one space.
///
/// Named fields hold what reconciliation reads; everything else is carried
/// untouched in `properties`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct IndexedDocument {
    #[serde(rename = "@id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "_documentId")]
    pub document_id: Uuid,
    #[serde(rename = "_space")]
    pub space: SpaceName,
    #[serde(
        rename = "http://schema.org/identifier",
        default,
        skip_serializing_if = "BTreeSet::is_empty"
    )]
    pub identifiers: BTreeSet<String>,
    #[serde(rename = "_user", default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(rename = "_indexTimestamp", default, skip_serializing_if = "Option::is_none")]
    pub indexed_at: Option<Timestamp>,
    #[serde(rename = "_propertyUpdates", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub property_updates: BTreeMap<String, Timestamp>,
    #[serde(flatten)]
    pub properties: BTreeMap<String, Value>,
}

impl IndexedDocument {
    #[must_use]
    pub fn new(document_id: Uuid, space: SpaceName) -> Self {
        Self {
            id: None,
            document_id,
            space,
            identifiers: BTreeSet::new(),
            user: None,
            indexed_at: None,
            property_updates: BTreeMap::new(),
            properties: BTreeMap::new(),
        }
    }

    /// The document's `@id` together with its `identifier` values.
    #[must_use]
    pub fn all_identifiers(&self) -> BTreeSet<String> {
        union_with_id(self.id.as_ref(), &self.identifiers)
    }

    /// When `key` was last written, falling back to when the document was indexed.
    #[must_use]
    pub fn updated_at(&self, key: &str) -> Option<Timestamp> {
        self.property_updates.get(key).copied().or(self.indexed_at)
    }

    /// Give the document its absolute `@id` when it has none.
    pub fn assign_default_id(&mut self, namespace: &IdNamespace) {
        if self.id.is_none() {
            self.id = Some(namespace.absolute_id(self.document_id));
        }
    }
}

/// One candidate value of a reconciled property.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Alternative {
    pub value: Value,
    pub selected: bool,
    #[serde(default)]
    pub users: Vec<String>,
}

/// The reconciled view of one cluster of native documents.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct InferredDocument {
    #[serde(rename = "@id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "_space")]
    pub space: SpaceName,
    #[serde(
        rename = "http://schema.org/identifier",
        default,
        skip_serializing_if = "BTreeSet::is_empty"
    )]
    pub identifiers: BTreeSet<String>,
    #[serde(rename = "_inferenceOf", default, skip_serializing_if = "Vec::is_empty")]
    pub inference_of: Vec<String>,
    #[serde(rename = "_alternatives", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub alternatives: BTreeMap<String, Vec<Alternative>>,
    #[serde(flatten)]
    pub properties: BTreeMap<String, Value>,
}

impl InferredDocument {
    #[must_use]
    pub fn new(space: SpaceName) -> Self {
        Self {
            id: None,
            space,
            identifiers: BTreeSet::new(),
            inference_of: Vec::new(),
            alternatives: BTreeMap::new(),
            properties: BTreeMap::new(),
        }
    }

    /// Minimal document naming an instance, used as the payload of deletions.
    #[must_use]
    pub fn reference(space: SpaceName, id: String) -> Self {
        let mut document = Self::new(space);
        document.id = Some(id);
        document
    }

    #[must_use]
    pub fn all_identifiers(&self) -> BTreeSet<String> {
        union_with_id(self.id.as_ref(), &self.identifiers)
    }

    /// Whether `existing` already reflects everything this document would write.
    #[must_use]
    pub fn is_reflected_by(&self, existing: &InferredDocument) -> bool {
        self.properties == existing.properties
            && self.inference_of == existing.inference_of
            && self.alternatives == existing.alternatives
            && self.all_identifiers().is_subset(&existing.all_identifiers())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    // Test IDs: TDOC-001
    #[test]
    fn unknown_properties_survive_a_json_round_trip() -> Result<(), serde_json::Error> {
        let input = json!({
            "@id": "https://kg.ebrains.eu/api/instances/0d9f5c1e-2b59-4f0e-a1f4-1b1f6c3c8f11",
            "_documentId": "0d9f5c1e-2b59-4f0e-a1f4-1b1f6c3c8f11",
            "_space": "dataset",
            "http://schema.org/identifier": ["https://example.org/a"],
            "_indexTimestamp": "2026-01-01T00:00:00Z",
            "http://schema.org/givenName": "Bart",
            "http://example.org/custom": {"nested": [1, 2, 3]}
        });

        let document: IndexedDocument = serde_json::from_value(input.clone())?;
        assert_eq!(document.properties.len(), 2);
        assert_eq!(document.all_identifiers().len(), 2);

        let output = serde_json::to_value(&document)?;
        assert_eq!(output, input);
        Ok(())
    }

    // Test IDs: TDOC-002
    #[test]
    fn property_update_time_falls_back_to_index_time() {
        let space = match SpaceName::new("dataset") {
            Ok(space) => space,
            Err(err) => panic!("invalid fixture space: {err}"),
        };
        let mut document = IndexedDocument::new(Uuid::new_v4(), space);
        let indexed = Timestamp(OffsetDateTime::UNIX_EPOCH);
        let touched = Timestamp(OffsetDateTime::UNIX_EPOCH + time::Duration::days(1));
        document.indexed_at = Some(indexed);
        document.property_updates.insert("name".to_string(), touched);

        assert_eq!(document.updated_at("name"), Some(touched));
        assert_eq!(document.updated_at("other"), Some(indexed));
    }
}
