//! Identity reconciliation domain: identifier records, native and inferred documents,
//! the reconciliation engine and the event translator. No I/O happens here; storage is
//! reached through [`DocumentSource`].

mod document;
mod error;
mod events;
mod identifier;
mod ids;
mod reconcile;

pub use document::{Alternative, IndexedDocument, InferredDocument, Timestamp, IDENTIFIER_KEY};
pub use error::KernelError;
pub use events::{translate_inference_result_to_events, Event, EventType};
pub use identifier::{
    plan_merge, IdMapping, IdWithAlternatives, MergePlan, PersistedIdentifier, ResolvedId,
    UpsertOutcome,
};
pub use ids::{IdNamespace, SpaceName, Stage, DEFAULT_NAMESPACE};
pub use reconcile::{
    combine_ids, compare_inferred_instances, extract_reconcile_units, merge_unit,
    reconcile_documents, DocumentSource, InferenceResult, InvolvedDocuments, PendingMerge,
    PendingUpdate, ReconcileUnit, Reconciler,
};
