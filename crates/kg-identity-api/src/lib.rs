use std::path::{Path, PathBuf};

use anyhow::Result;
use kg_identity_core::{
    Event, IdMapping, IdNamespace, IdWithAlternatives, IndexedDocument, InferredDocument,
    PersistedIdentifier, Reconciler, ResolvedId, SpaceName, Stage, UpsertOutcome,
};
use kg_identity_store_sqlite::{
    AppliedEvents, IntegrityReport, LoggedEvent, SchemaStatus, SqliteStore,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestResult {
    pub document: IndexedDocument,
    pub identifier: UpsertOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteDocumentResult {
    pub space: SpaceName,
    pub document_id: Uuid,
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileResult {
    pub space: SpaceName,
    pub document_id: Uuid,
    pub events: Vec<Event>,
    pub applied: Option<AppliedEvents>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FindInstanceRequest {
    #[serde(default)]
    pub space: Option<SpaceName>,
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub identifiers: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct IdentityKernelApi {
    db_path: PathBuf,
    namespace: IdNamespace,
    max_upsert_attempts: u32,
}

impl IdentityKernelApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path, namespace: IdNamespace::default(), max_upsert_attempts: 3 }
    }

    #[must_use]
    pub fn with_namespace(mut self, namespace: IdNamespace) -> Self {
        self.namespace = namespace;
        self
    }

    #[must_use]
    pub fn with_max_upsert_attempts(mut self, attempts: u32) -> Self {
        self.max_upsert_attempts = attempts;
        self
    }

    #[must_use]
    pub fn namespace(&self) -> &IdNamespace {
        &self.namespace
    }

    fn open_store(&self) -> Result<SqliteStore> {
        Ok(SqliteStore::open(&self.db_path)?
            .with_namespace(self.namespace.clone())
            .with_max_upsert_attempts(self.max_upsert_attempts))
    }

    fn open_migrated(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: before.pending_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Create an identifier record or merge new alternatives into it.
    ///
    /// # Errors
    /// Returns an error when the request lacks an id or space, or the upsert fails.
    pub fn create_or_update_id(
        &self,
        stage: Stage,
        request: &IdWithAlternatives,
    ) -> Result<UpsertOutcome> {
        let candidate = request.to_candidate()?;
        let mut store = self.open_migrated()?;
        store.upsert_identifier(stage, &candidate)
    }

    /// # Errors
    /// Returns an error when a query is malformed or lookup fails.
    pub fn resolve_id(&self, stage: Stage, queries: &[IdWithAlternatives]) -> Result<Vec<IdMapping>> {
        if queries.is_empty() {
            return Ok(Vec::new());
        }
        let store = self.open_migrated()?;
        store.resolve(stage, queries)
    }

    /// Deprecate the record `id` resolves to, or revert a deprecation. Empty when
    /// `id` is unknown.
    ///
    /// # Errors
    /// Returns an error when `id` is ambiguous or the write fails.
    pub fn deprecate_id(&self, stage: Stage, id: Uuid, revert: bool) -> Result<Vec<ResolvedId>> {
        let mut store = self.open_migrated()?;
        store.deprecate_identifier(stage, id, revert)
    }

    /// # Errors
    /// Returns an error when several records match or lookup fails.
    pub fn find_instance_by_identifiers(
        &self,
        stage: Stage,
        request: &FindInstanceRequest,
    ) -> Result<Option<ResolvedId>> {
        let store = self.open_migrated()?;
        store.find_instance_by_identifiers(
            stage,
            request.space.as_ref(),
            request.id,
            &request.identifiers,
        )
    }

    /// Store a native document and register its id with its identifiers in the
    /// native stage.
    ///
    /// # Errors
    /// Returns an error when persistence or the identifier upsert fails.
    pub fn ingest_document(&self, mut document: IndexedDocument) -> Result<IngestResult> {
        document.assign_default_id(&self.namespace);
        let mut store = self.open_migrated()?;
        store.put_native_document(&document)?;
        let candidate = PersistedIdentifier::new(document.document_id, document.space.clone())
            .with_alternatives(document.all_identifiers());
        let identifier = store.upsert_identifier(Stage::Native, &candidate)?;
        info!(space = %document.space, document_id = %document.document_id, "ingested native document");
        Ok(IngestResult { document, identifier })
    }

    /// Remove a native document and retire the native identifier record holding it.
    ///
    /// A record whose survivor is still stored stays active. Otherwise the record is
    /// deprecated and every other stored document folded into it gets its own record
    /// back.
    ///
    /// # Errors
    /// Returns an error when the delete or the identifier update fails.
    pub fn delete_document(&self, space: &SpaceName, document_id: Uuid) -> Result<DeleteDocumentResult> {
        let mut store = self.open_migrated()?;
        let deleted = store.delete_native_document(space, document_id)?;
        if deleted {
            self.retire_native_identifier(&mut store, space, document_id)?;
        }
        Ok(DeleteDocumentResult { space: space.clone(), document_id, deleted })
    }

    fn retire_native_identifier(
        &self,
        store: &mut SqliteStore,
        space: &SpaceName,
        document_id: Uuid,
    ) -> Result<()> {
        let holder =
            store.find_instance_by_identifiers(Stage::Native, Some(space), Some(document_id), &[])?;
        let Some(holder) = holder else {
            return Ok(());
        };
        let Some(record) = store.get_identifier(Stage::Native, holder.canonical_id)? else {
            return Ok(());
        };
        if record.canonical_id != document_id
            && store.get_native_document(space, record.canonical_id)?.is_some()
        {
            return Ok(());
        }

        store.set_deprecated(Stage::Native, record.canonical_id, true)?;
        let folded = record
            .merged_ids(&self.namespace)
            .iter()
            .filter_map(|absolute_id| self.namespace.uuid_of(absolute_id))
            .filter(|id| *id != document_id)
            .collect::<Vec<_>>();
        for id in folded {
            if let Some(document) = store.get_native_document(space, id)? {
                let candidate = PersistedIdentifier::new(id, space.clone())
                    .with_alternatives(document.all_identifiers());
                store.upsert_identifier(Stage::Native, &candidate)?;
            }
        }
        info!(%space, %document_id, survivor = %record.canonical_id, "retired native identifier");
        Ok(())
    }

    /// # Errors
    /// Returns an error when lookup fails.
    pub fn get_document(&self, space: &SpaceName, document_id: Uuid) -> Result<Option<IndexedDocument>> {
        let store = self.open_migrated()?;
        store.get_native_document(space, document_id)
    }

    /// Reconcile the cluster around `document_id`; with `apply`, feed the events to
    /// the local event sink.
    ///
    /// # Errors
    /// Returns an error when reconciliation or event application fails.
    pub fn reconcile(&self, space: &SpaceName, document_id: Uuid, apply: bool) -> Result<ReconcileResult> {
        let mut store = self.open_migrated()?;
        let events = Reconciler::new(&store, &self.namespace).reconcile(space, document_id)?;
        let applied = if apply && !events.is_empty() {
            Some(store.apply_events(&events)?)
        } else {
            None
        };
        Ok(ReconcileResult { space: space.clone(), document_id, events, applied })
    }

    /// # Errors
    /// Returns an error when the event log cannot be read.
    pub fn list_events(&self, space: &SpaceName) -> Result<Vec<LoggedEvent>> {
        let store = self.open_migrated()?;
        store.list_events(space)
    }

    /// # Errors
    /// Returns an error when inferred documents cannot be read.
    pub fn list_inferred(&self, space: &SpaceName) -> Result<Vec<InferredDocument>> {
        let store = self.open_migrated()?;
        store.list_inferred_documents(space)
    }

    /// # Errors
    /// Returns an error when any integrity probe fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_store()?;
        store.integrity_check()
    }

    /// # Errors
    /// Returns an error when the backup cannot be written.
    pub fn backup(&self, out_file: &Path) -> Result<()> {
        let store = self.open_store()?;
        store.backup_database(out_file)
    }

    /// # Errors
    /// Returns an error when the backup is missing or restore fails.
    pub fn restore(&self, in_file: &Path) -> Result<()> {
        let mut store = self.open_store()?;
        store.restore_database(in_file)
    }
}
