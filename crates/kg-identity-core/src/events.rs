use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::document::InferredDocument;
use crate::ids::{IdNamespace, SpaceName};
use crate::reconcile::{InferenceResult, PendingMerge, PendingUpdate};
use crate::KernelError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Insert,
    Update,
    Delete,
    Release,
    Unrelease,
}

impl EventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Release => "RELEASE",
            Self::Unrelease => "UNRELEASE",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "INSERT" => Some(Self::Insert),
            "UPDATE" => Some(Self::Update),
            "DELETE" => Some(Self::Delete),
            "RELEASE" => Some(Self::Release),
            "UNRELEASE" => Some(Self::Unrelease),
            _ => None,
        }
    }
}

impl Display for EventType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Event {
    pub space: SpaceName,
    pub document_id: Uuid,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub data: InferredDocument,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl Event {
    #[must_use]
    pub fn upsert(
        space: &SpaceName,
        document_id: Uuid,
        event_type: EventType,
        data: InferredDocument,
        timestamp: OffsetDateTime,
    ) -> Self {
        Self { space: space.clone(), document_id, event_type, data, timestamp }
    }

    #[must_use]
    pub fn delete(
        space: &SpaceName,
        document_id: Uuid,
        absolute_id: String,
        timestamp: OffsetDateTime,
    ) -> Self {
        Self {
            space: space.clone(),
            document_id,
            event_type: EventType::Delete,
            data: InferredDocument::reference(space.clone(), absolute_id),
            timestamp,
        }
    }
}

fn instance_uuid(
    existing: &InferredDocument,
    namespace: &IdNamespace,
) -> Result<(Uuid, String), KernelError> {
    existing
        .id
        .as_deref()
        .and_then(|id| namespace.uuid_of(id).map(|uuid| (uuid, id.to_string())))
        .ok_or_else(|| {
            KernelError::InconsistentState(format!(
                "existing inferred instance has no internal id (found {:?})",
                existing.id
            ))
        })
}

/// Give `inferred` a fresh internal id, keeping any previous id as an identifier.
fn mint_id(inferred: &mut InferredDocument, namespace: &IdNamespace) -> Uuid {
    let uuid = Uuid::new_v4();
    if let Some(previous) = inferred.id.replace(namespace.absolute_id(uuid)) {
        inferred.identifiers.insert(previous);
    }
    uuid
}

/// Turn the buckets of one reconciliation pass into the events that apply it.
///
/// Events are ordered inserts, updates, removals, then merges; each merge is
/// one INSERT of the merged document followed by one DELETE per constituent.
///
/// # Errors
/// Returns [`KernelError::InconsistentState`] when an existing instance that must
/// be updated or deleted does not carry an internal id.
pub fn translate_inference_result_to_events(
    space: &SpaceName,
    result: InferenceResult,
    namespace: &IdNamespace,
    now: OffsetDateTime,
) -> Result<Vec<Event>, KernelError> {
    let mut events = Vec::with_capacity(result.event_count());

    for mut inferred in result.to_be_inserted {
        let document_id = match inferred.id.as_deref().and_then(|id| namespace.uuid_of(id)) {
            Some(uuid) => uuid,
            None => mint_id(&mut inferred, namespace),
        };
        events.push(Event::upsert(space, document_id, EventType::Insert, inferred, now));
    }

    for PendingUpdate { mut inferred, existing } in result.to_be_updated {
        let (document_id, existing_id) = instance_uuid(&existing, namespace)?;
        inferred.identifiers.extend(existing.all_identifiers());
        if let Some(previous) = inferred.id.replace(existing_id) {
            inferred.identifiers.insert(previous);
        }
        events.push(Event::upsert(space, document_id, EventType::Update, inferred, now));
    }

    for existing in result.to_be_removed {
        let (document_id, existing_id) = instance_uuid(&existing, namespace)?;
        events.push(Event::delete(space, document_id, existing_id, now));
    }

    for PendingMerge { mut inferred, existing } in result.to_be_merged {
        let mut removals = Vec::with_capacity(existing.len());
        for constituent in &existing {
            inferred.identifiers.extend(constituent.all_identifiers());
            removals.push(instance_uuid(constituent, namespace)?);
        }
        let document_id = mint_id(&mut inferred, namespace);
        events.push(Event::upsert(space, document_id, EventType::Insert, inferred, now));
        for (removed_id, absolute_id) in removals {
            events.push(Event::delete(space, removed_id, absolute_id, now));
        }
    }

    Ok(events)
}
