use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use kg_identity_core::{
    plan_merge, DocumentSource, Event, EventType, IdMapping, IdNamespace, IdWithAlternatives,
    IndexedDocument, InferredDocument, KernelError, MergePlan, PersistedIdentifier, ResolvedId,
    SpaceName, Stage, UpsertOutcome,
};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

const LATEST_SCHEMA_VERSION: i64 = 2;
const DEFAULT_MAX_UPSERT_ATTEMPTS: u32 = 3;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS identifiers (
  stage TEXT NOT NULL CHECK (stage IN ('native','in_progress','released')),
  canonical_id TEXT NOT NULL,
  space TEXT NOT NULL,
  deprecated INTEGER NOT NULL DEFAULT 0 CHECK (deprecated IN (0, 1)),
  version INTEGER NOT NULL CHECK (version >= 1),
  updated_at TEXT NOT NULL,
  PRIMARY KEY (stage, canonical_id)
);

CREATE TABLE IF NOT EXISTS identifier_alternatives (
  stage TEXT NOT NULL,
  canonical_id TEXT NOT NULL,
  alternative_id TEXT NOT NULL,
  PRIMARY KEY (stage, canonical_id, alternative_id),
  FOREIGN KEY (stage, canonical_id) REFERENCES identifiers(stage, canonical_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_identifier_alternatives_lookup
  ON identifier_alternatives(stage, alternative_id);
CREATE INDEX IF NOT EXISTS idx_identifiers_space ON identifiers(stage, space);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS native_documents (
  document_id TEXT PRIMARY KEY,
  space TEXT NOT NULL,
  document_json TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS native_identifiers (
  document_id TEXT NOT NULL,
  space TEXT NOT NULL,
  identifier TEXT NOT NULL,
  PRIMARY KEY (document_id, identifier),
  FOREIGN KEY (document_id) REFERENCES native_documents(document_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS inferred_documents (
  instance_id TEXT PRIMARY KEY,
  space TEXT NOT NULL,
  document_json TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS inferred_sources (
  instance_id TEXT NOT NULL,
  source_id TEXT NOT NULL,
  PRIMARY KEY (instance_id, source_id),
  FOREIGN KEY (instance_id) REFERENCES inferred_documents(instance_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS event_log (
  sequence INTEGER PRIMARY KEY AUTOINCREMENT,
  batch_id TEXT NOT NULL,
  space TEXT NOT NULL,
  document_id TEXT NOT NULL,
  event_type TEXT NOT NULL CHECK (event_type IN ('INSERT','UPDATE','DELETE','RELEASE','UNRELEASE')),
  event_json TEXT NOT NULL,
  recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_native_identifiers_lookup ON native_identifiers(space, identifier);
CREATE INDEX IF NOT EXISTS idx_native_documents_space ON native_documents(space);
CREATE INDEX IF NOT EXISTS idx_inferred_sources_source ON inferred_sources(source_id);
CREATE INDEX IF NOT EXISTS idx_event_log_space ON event_log(space, sequence);
";

pub struct SqliteStore {
    conn: Connection,
    namespace: IdNamespace,
    max_upsert_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

/// Summary of one applied event batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppliedEvents {
    pub batch_id: String,
    pub applied: usize,
    pub materialized: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggedEvent {
    pub sequence: i64,
    pub batch_id: String,
    pub recorded_at: String,
    pub event: Event,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct StoredIdentifier {
    record: PersistedIdentifier,
    version: i64,
}

/// A merge computed from one read of the store, to be committed only if none of the
/// records it read has changed since.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertPlan {
    stage: Stage,
    existing: Option<StoredIdentifier>,
    merge: MergePlan,
    folded_versions: BTreeMap<Uuid, i64>,
}

impl UpsertPlan {
    #[must_use]
    pub fn survivor(&self) -> &PersistedIdentifier {
        &self.merge.survivor
    }

    #[must_use]
    pub fn folded(&self) -> Vec<Uuid> {
        self.merge.folded.iter().map(|record| record.canonical_id).collect()
    }

    fn is_noop(&self) -> bool {
        self.merge.folded.is_empty()
            && self.existing.as_ref().is_some_and(|existing| existing.record == self.merge.survivor)
    }
}

impl SqliteStore {
    /// Open a SQLite-backed identity store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn,
            namespace: IdNamespace::default(),
            max_upsert_attempts: DEFAULT_MAX_UPSERT_ATTEMPTS,
        })
    }

    #[must_use]
    pub fn with_namespace(mut self, namespace: IdNamespace) -> Self {
        self.namespace = namespace;
        self
    }

    #[must_use]
    pub fn with_max_upsert_attempts(mut self, attempts: u32) -> Self {
        self.max_upsert_attempts = attempts.max(1);
        self
    }

    #[must_use]
    pub fn namespace(&self) -> &IdNamespace {
        &self.namespace
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version < 1 {
            apply_migration(&self.conn, 1, MIGRATION_001_SQL)?;
            version = 1;
        }

        if version < 2 {
            apply_migration(&self.conn, 2, MIGRATION_002_SQL)?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Insert or merge an identifier record, retrying on concurrent modification.
    ///
    /// The candidate's record survives; every active record of the same space and stage
    /// that shares an alternative with it (transitively) is folded in and deleted.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] or [`KernelError::IllegalArgument`] for bad input,
    /// [`KernelError::Conflict`] when every attempt lost a race, or a storage error.
    pub fn upsert_identifier(
        &mut self,
        stage: Stage,
        candidate: &PersistedIdentifier,
    ) -> Result<UpsertOutcome> {
        candidate.validate()?;
        self.retry_on_conflict("upsert_identifier", |store| {
            let plan = store.plan_upsert(stage, candidate)?;
            store.commit_upsert(&plan)
        })
    }

    /// Read the current state and compute the merge an upsert of `candidate` would perform.
    ///
    /// # Errors
    /// Returns [`KernelError::IllegalArgument`] when the candidate's id already lives in
    /// another space, or a storage error.
    pub fn plan_upsert(&self, stage: Stage, candidate: &PersistedIdentifier) -> Result<UpsertPlan> {
        let existing = self.load_identifier(stage, candidate.canonical_id)?;
        if let Some(existing) = &existing {
            if existing.record.space != candidate.space {
                return Err(KernelError::IllegalArgument(format!(
                    "identifier {} belongs to space {}, not {}",
                    candidate.canonical_id, existing.record.space, candidate.space
                ))
                .into());
            }
        }
        let base = existing.as_ref().map(|stored| stored.record.clone());
        self.plan_from(stage, existing, base.as_ref(), candidate)
    }

    fn plan_from(
        &self,
        stage: Stage,
        existing: Option<StoredIdentifier>,
        base: Option<&PersistedIdentifier>,
        candidate: &PersistedIdentifier,
    ) -> Result<UpsertPlan> {
        let deprecated = base.map_or(candidate.deprecated, |base| base.deprecated);
        let pool = if deprecated {
            Vec::new()
        } else {
            let mut seed = candidate.alternative_ids.clone();
            if let Some(base) = base {
                seed.extend(base.alternative_ids.iter().cloned());
            }
            seed.insert(self.namespace.absolute_id(candidate.canonical_id));
            self.colliding_identifiers(stage, candidate, seed)?
        };

        let records = pool.iter().map(|stored| stored.record.clone()).collect::<Vec<_>>();
        let merge = plan_merge(base, candidate, &records, &self.namespace);
        let folded_versions = pool
            .into_iter()
            .filter(|stored| {
                merge.folded.iter().any(|folded| folded.canonical_id == stored.record.canonical_id)
            })
            .map(|stored| (stored.record.canonical_id, stored.version))
            .collect();

        Ok(UpsertPlan { stage, existing, merge, folded_versions })
    }

    /// Active records reachable from `seed` through shared alternatives.
    fn colliding_identifiers(
        &self,
        stage: Stage,
        candidate: &PersistedIdentifier,
        seed: BTreeSet<String>,
    ) -> Result<Vec<StoredIdentifier>> {
        let mut pending = seed.into_iter().collect::<Vec<_>>();
        let mut seen_keys = BTreeSet::new();
        let mut found: BTreeMap<Uuid, StoredIdentifier> = BTreeMap::new();

        while let Some(key) = pending.pop() {
            if !seen_keys.insert(key.clone()) {
                continue;
            }
            for canonical_id in
                self.canonical_ids_by_alternative(stage, Some(&candidate.space), &key, true)?
            {
                if canonical_id == candidate.canonical_id || found.contains_key(&canonical_id) {
                    continue;
                }
                if let Some(stored) = self.load_identifier(stage, canonical_id)? {
                    pending.extend(
                        stored
                            .record
                            .alternative_ids
                            .iter()
                            .filter(|alternative| !seen_keys.contains(*alternative))
                            .cloned(),
                    );
                    found.insert(canonical_id, stored);
                }
            }
        }

        Ok(found.into_values().collect())
    }

    /// Write a plan if every record it read is still at the version it read.
    ///
    /// # Errors
    /// Returns [`KernelError::Conflict`] when a guarded write touches no row or another
    /// active record started sharing an alternative in the meantime.
    pub fn commit_upsert(&mut self, plan: &UpsertPlan) -> Result<UpsertOutcome> {
        let survivor = &plan.merge.survivor;
        let outcome = UpsertOutcome {
            record: survivor.clone(),
            merged_ids: survivor.merged_ids(&self.namespace),
            folded: plan.folded(),
        };
        if plan.is_noop() {
            debug!(stage = %plan.stage, canonical_id = %survivor.canonical_id, "identifier unchanged");
            return Ok(outcome);
        }

        let stage = plan.stage;
        let conflict = |canonical_id: Uuid| anyhow::Error::new(KernelError::Conflict { canonical_id, stage });
        let now = now_rfc3339()?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start identifier transaction")?;

        match &plan.existing {
            Some(existing) => {
                let changed = tx
                    .execute(
                        "UPDATE identifiers
                         SET deprecated = ?1, version = version + 1, updated_at = ?2
                         WHERE stage = ?3 AND canonical_id = ?4 AND version = ?5",
                        params![
                            survivor.deprecated,
                            now,
                            stage.as_str(),
                            survivor.canonical_id.to_string(),
                            existing.version,
                        ],
                    )
                    .context("failed to update identifier")?;
                if changed == 0 {
                    return Err(conflict(survivor.canonical_id));
                }
            }
            None => {
                let changed = tx
                    .execute(
                        "INSERT OR IGNORE INTO identifiers(
                            stage, canonical_id, space, deprecated, version, updated_at
                        ) VALUES (?1, ?2, ?3, ?4, 1, ?5)",
                        params![
                            stage.as_str(),
                            survivor.canonical_id.to_string(),
                            survivor.space.as_str(),
                            survivor.deprecated,
                            now,
                        ],
                    )
                    .context("failed to insert identifier")?;
                if changed == 0 {
                    return Err(conflict(survivor.canonical_id));
                }
            }
        }

        for folded in &plan.merge.folded {
            let version = plan.folded_versions.get(&folded.canonical_id).copied().unwrap_or(0);
            let changed = tx
                .execute(
                    "DELETE FROM identifiers WHERE stage = ?1 AND canonical_id = ?2 AND version = ?3",
                    params![stage.as_str(), folded.canonical_id.to_string(), version],
                )
                .context("failed to delete folded identifier")?;
            if changed == 0 {
                return Err(conflict(folded.canonical_id));
            }
        }

        for alternative in &survivor.alternative_ids {
            tx.execute(
                "INSERT OR IGNORE INTO identifier_alternatives(stage, canonical_id, alternative_id)
                 VALUES (?1, ?2, ?3)",
                params![stage.as_str(), survivor.canonical_id.to_string(), alternative],
            )
            .context("failed to insert identifier alternative")?;
        }

        if !survivor.deprecated {
            for alternative in &survivor.alternative_ids {
                let shared_with: Option<String> = tx
                    .query_row(
                        "SELECT a.canonical_id
                         FROM identifier_alternatives a
                         JOIN identifiers i ON i.stage = a.stage AND i.canonical_id = a.canonical_id
                         WHERE a.stage = ?1 AND a.alternative_id = ?2 AND i.space = ?3
                           AND i.deprecated = 0 AND a.canonical_id != ?4
                         LIMIT 1",
                        params![
                            stage.as_str(),
                            alternative,
                            survivor.space.as_str(),
                            survivor.canonical_id.to_string(),
                        ],
                        |row| row.get(0),
                    )
                    .optional()
                    .context("failed to check alternative collisions")?;
                if let Some(other) = shared_with {
                    debug!(stage = %stage, alternative = %alternative, other = %other, "alternative claimed concurrently");
                    return Err(conflict(survivor.canonical_id));
                }
            }
        }

        tx.commit().context("failed to commit identifier transaction")?;

        if !outcome.folded.is_empty() {
            info!(
                stage = %stage,
                survivor = %survivor.canonical_id,
                folded = outcome.folded.len(),
                "folded colliding identifiers into survivor"
            );
        }
        Ok(outcome)
    }

    fn retry_on_conflict<T>(
        &mut self,
        operation: &str,
        mut attempt: impl FnMut(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let mut attempts = 1;
        loop {
            match attempt(self) {
                Err(err) if attempts < self.max_upsert_attempts && is_conflict(&err) => {
                    warn!(operation, attempt = attempts, error = %err, "retrying after concurrent modification");
                    attempts += 1;
                }
                result => return result,
            }
        }
    }

    /// Load one identifier record by canonical id.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn get_identifier(
        &self,
        stage: Stage,
        canonical_id: Uuid,
    ) -> Result<Option<PersistedIdentifier>> {
        Ok(self.load_identifier(stage, canonical_id)?.map(|stored| stored.record))
    }

    fn load_identifier(&self, stage: Stage, canonical_id: Uuid) -> Result<Option<StoredIdentifier>> {
        let row = self
            .conn
            .query_row(
                "SELECT space, deprecated, version FROM identifiers
                 WHERE stage = ?1 AND canonical_id = ?2",
                params![stage.as_str(), canonical_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, bool>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()
            .context("failed to read identifier")?;
        let Some((space, deprecated, version)) = row else {
            return Ok(None);
        };

        let mut stmt = self
            .conn
            .prepare(
                "SELECT alternative_id FROM identifier_alternatives
                 WHERE stage = ?1 AND canonical_id = ?2
                 ORDER BY alternative_id",
            )
            .context("failed to prepare alternative query")?;
        let rows = stmt.query_map(params![stage.as_str(), canonical_id.to_string()], |row| {
            row.get::<_, String>(0)
        })?;
        let mut alternative_ids = BTreeSet::new();
        for row in rows {
            alternative_ids.insert(row?);
        }

        Ok(Some(StoredIdentifier {
            record: PersistedIdentifier {
                canonical_id,
                space: SpaceName::new(&space)?,
                alternative_ids,
                deprecated,
            },
            version,
        }))
    }

    fn canonical_ids_by_alternative(
        &self,
        stage: Stage,
        space: Option<&SpaceName>,
        alternative: &str,
        active_only: bool,
    ) -> Result<Vec<Uuid>> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT DISTINCT i.canonical_id
                 FROM identifier_alternatives a
                 JOIN identifiers i ON i.stage = a.stage AND i.canonical_id = a.canonical_id
                 WHERE a.stage = ?1 AND a.alternative_id = ?2
                   AND (?3 IS NULL OR i.space = ?3)
                   AND (?4 = 0 OR i.deprecated = 0)
                 ORDER BY i.canonical_id",
            )
            .context("failed to prepare alternative lookup")?;
        let rows = stmt.query_map(
            params![stage.as_str(), alternative, space.map(SpaceName::as_str), active_only],
            |row| row.get::<_, String>(0),
        )?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(parse_uuid(&row?)?);
        }
        Ok(ids)
    }

    /// Resolve each query to the canonical records it denotes. An empty batch returns
    /// immediately without touching the database.
    ///
    /// # Errors
    /// Returns [`KernelError::IllegalArgument`] for a query with neither id nor alternatives,
    /// or a storage error.
    pub fn resolve(&self, stage: Stage, queries: &[IdWithAlternatives]) -> Result<Vec<IdMapping>> {
        if queries.is_empty() {
            return Ok(Vec::new());
        }
        queries.iter().map(|query| self.resolve_one(stage, query)).collect()
    }

    fn resolve_one(&self, stage: Stage, query: &IdWithAlternatives) -> Result<IdMapping> {
        query.validate_query()?;
        let in_space = |record: &PersistedIdentifier| {
            query.space.as_ref().map_or(true, |space| *space == record.space)
        };

        if let Some(id) = query.id {
            if let Some(stored) = self.load_identifier(stage, id)? {
                if in_space(&stored.record) {
                    return Ok(IdMapping {
                        requested_id: query.id,
                        resolved: vec![self.resolved_id(&stored.record)],
                    });
                }
            }
        }

        let mut canonical_ids = BTreeSet::new();
        for key in query.lookup_keys(&self.namespace) {
            canonical_ids.extend(self.canonical_ids_by_alternative(
                stage,
                query.space.as_ref(),
                &key,
                false,
            )?);
        }

        let mut resolved = Vec::with_capacity(canonical_ids.len());
        for canonical_id in canonical_ids {
            if let Some(stored) = self.load_identifier(stage, canonical_id)? {
                resolved.push(self.resolved_id(&stored.record));
            }
        }
        Ok(IdMapping { requested_id: query.id, resolved })
    }

    /// The single record denoted by `id` and/or `identifiers`.
    ///
    /// # Errors
    /// Returns [`KernelError::AmbiguousId`] when several records match.
    pub fn find_instance_by_identifiers(
        &self,
        stage: Stage,
        space: Option<&SpaceName>,
        id: Option<Uuid>,
        identifiers: &[String],
    ) -> Result<Option<ResolvedId>> {
        let query = IdWithAlternatives {
            id,
            space: space.cloned(),
            alternatives: identifiers.iter().cloned().collect(),
        };
        if query.validate_query().is_err() {
            return Ok(None);
        }
        let mapping = self.resolve_one(stage, &query)?;
        Ok(mapping.single()?.cloned())
    }

    /// Toggle the deprecation flag of the record `id` resolves to. Reverting a
    /// deprecation folds in records that started sharing alternatives meanwhile.
    ///
    /// Returns the affected record, or nothing when `id` is unknown.
    ///
    /// # Errors
    /// Returns [`KernelError::AmbiguousId`] when `id` resolves to several records,
    /// [`KernelError::Conflict`] when every attempt lost a race, or a storage error.
    pub fn deprecate_identifier(
        &mut self,
        stage: Stage,
        id: Uuid,
        revert: bool,
    ) -> Result<Vec<ResolvedId>> {
        let Some(target) = self.find_instance_by_identifiers(stage, None, Some(id), &[])? else {
            return Ok(Vec::new());
        };
        let updated = self.set_deprecated(stage, target.canonical_id, !revert)?;
        Ok(updated.iter().map(|record| self.resolved_id(record)).collect())
    }

    /// Set the deprecation flag of exactly the record `canonical_id`.
    ///
    /// # Errors
    /// Returns [`KernelError::Conflict`] when every attempt lost a race, or a storage error.
    pub fn set_deprecated(
        &mut self,
        stage: Stage,
        canonical_id: Uuid,
        deprecated: bool,
    ) -> Result<Option<PersistedIdentifier>> {
        self.retry_on_conflict("set_deprecated", |store| {
            let Some(existing) = store.load_identifier(stage, canonical_id)? else {
                return Ok(None);
            };
            let mut base = existing.record.clone();
            base.deprecated = deprecated;
            let plan = store.plan_from(stage, Some(existing), Some(&base), &base)?;
            Ok(Some(store.commit_upsert(&plan)?.record))
        })
    }

    fn resolved_id(&self, record: &PersistedIdentifier) -> ResolvedId {
        ResolvedId {
            id: self.namespace.absolute_id(record.canonical_id),
            canonical_id: record.canonical_id,
            space: record.space.clone(),
            deprecated: record.deprecated,
        }
    }

    /// Insert or replace a native document and index its identifiers.
    ///
    /// # Errors
    /// Returns [`KernelError::IllegalArgument`] when the document id is already stored
    /// in another space, or an error when the document cannot be serialized or written.
    pub fn put_native_document(&mut self, document: &IndexedDocument) -> Result<()> {
        let json = serde_json::to_string(document).context("failed to serialize native document")?;
        let document_id = document.document_id.to_string();
        let now = now_rfc3339()?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start transaction")?;

        let stored_space: Option<String> = tx
            .query_row(
                "SELECT space FROM native_documents WHERE document_id = ?1",
                params![document_id],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read native document space")?;
        if let Some(stored_space) = stored_space {
            if stored_space != document.space.as_str() {
                return Err(KernelError::IllegalArgument(format!(
                    "document {document_id} belongs to space {stored_space}, not {}",
                    document.space
                ))
                .into());
            }
        }

        tx.execute(
            "INSERT INTO native_documents(document_id, space, document_json, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(document_id) DO UPDATE SET
               document_json = excluded.document_json,
               updated_at = excluded.updated_at",
            params![document_id, document.space.as_str(), json, now],
        )
        .context("failed to write native document")?;
        tx.execute("DELETE FROM native_identifiers WHERE document_id = ?1", params![document_id])
            .context("failed to clear native identifiers")?;
        for identifier in document.all_identifiers() {
            tx.execute(
                "INSERT OR IGNORE INTO native_identifiers(document_id, space, identifier)
                 VALUES (?1, ?2, ?3)",
                params![document_id, document.space.as_str(), identifier],
            )
            .context("failed to write native identifier")?;
        }

        tx.commit().context("failed to commit native document")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete_native_document(&mut self, space: &SpaceName, document_id: Uuid) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "DELETE FROM native_documents WHERE space = ?1 AND document_id = ?2",
                params![space.as_str(), document_id.to_string()],
            )
            .context("failed to delete native document")?;
        Ok(changed > 0)
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_native_document(
        &self,
        space: &SpaceName,
        document_id: Uuid,
    ) -> Result<Option<IndexedDocument>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT document_json FROM native_documents WHERE space = ?1 AND document_id = ?2",
                params![space.as_str(), document_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read native document")?;
        json.map(|json| decode_json(&json, "native document")).transpose()
    }

    /// The native document `document_id` and every native document of `space` sharing
    /// an identifier with it.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn related_native_documents(
        &self,
        space: &SpaceName,
        document_id: Uuid,
    ) -> Result<Vec<IndexedDocument>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT d.document_json
                 FROM native_documents d
                 WHERE d.space = ?1
                   AND (d.document_id = ?2 OR d.document_id IN (
                     SELECT n.document_id FROM native_identifiers n
                     WHERE n.space = ?1 AND n.identifier IN (
                       SELECT identifier FROM native_identifiers
                       WHERE space = ?1 AND document_id = ?2
                     )
                   ))
                 ORDER BY d.document_id",
            )
            .context("failed to prepare related document query")?;
        let rows = stmt.query_map(params![space.as_str(), document_id.to_string()], |row| {
            row.get::<_, String>(0)
        })?;

        let mut documents = Vec::new();
        for row in rows {
            documents.push(decode_json(&row?, "native document")?);
        }
        Ok(documents)
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_native_documents(&self, space: &SpaceName) -> Result<Vec<IndexedDocument>> {
        self.query_documents(
            "SELECT document_json FROM native_documents WHERE space = ?1 ORDER BY document_id",
            params![space.as_str()],
            "native document",
        )
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_inferred_document(
        &self,
        space: &SpaceName,
        instance_id: Uuid,
    ) -> Result<Option<InferredDocument>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT document_json FROM inferred_documents WHERE space = ?1 AND instance_id = ?2",
                params![space.as_str(), instance_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read inferred document")?;
        json.map(|json| decode_json(&json, "inferred document")).transpose()
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_inferred_documents(&self, space: &SpaceName) -> Result<Vec<InferredDocument>> {
        self.query_documents(
            "SELECT document_json FROM inferred_documents WHERE space = ?1 ORDER BY instance_id",
            params![space.as_str()],
            "inferred document",
        )
    }

    /// Inferred documents of `space` listing `source_id` among their sources.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn inferred_documents_of(
        &self,
        space: &SpaceName,
        source_id: &str,
    ) -> Result<Vec<InferredDocument>> {
        self.query_documents(
            "SELECT d.document_json
             FROM inferred_documents d
             JOIN inferred_sources s ON s.instance_id = d.instance_id
             WHERE d.space = ?1 AND s.source_id = ?2
             ORDER BY d.instance_id",
            params![space.as_str(), source_id],
            "inferred document",
        )
    }

    fn query_documents<T: serde::de::DeserializeOwned>(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
        what: &str,
    ) -> Result<Vec<T>> {
        let mut stmt = self.conn.prepare(sql).with_context(|| format!("failed to prepare {what} query"))?;
        let rows = stmt.query_map(params, |row| row.get::<_, String>(0))?;
        let mut documents = Vec::new();
        for row in rows {
            documents.push(decode_json(&row?, what)?);
        }
        Ok(documents)
    }

    /// Append events to the log and materialize them into the in-progress stage:
    /// INSERT and UPDATE write the inferred document and register its identifiers,
    /// DELETE removes the document and deprecates its identifier record.
    ///
    /// # Errors
    /// Returns an error when any write fails; the document writes are all-or-nothing.
    pub fn apply_events(&mut self, events: &[Event]) -> Result<AppliedEvents> {
        let batch_id = event_batch_id(events)?;
        let now = now_rfc3339()?;
        let mut materialized = 0;
        let mut removed = 0;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start event transaction")?;
        for event in events {
            let document_id = event.document_id.to_string();
            tx.execute(
                "INSERT INTO event_log(batch_id, space, document_id, event_type, event_json, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    batch_id,
                    event.space.as_str(),
                    document_id,
                    event.event_type.as_str(),
                    serde_json::to_string(event).context("failed to serialize event")?,
                    now,
                ],
            )
            .context("failed to append event")?;

            match event.event_type {
                EventType::Insert | EventType::Update => {
                    let json = serde_json::to_string(&event.data)
                        .context("failed to serialize inferred document")?;
                    tx.execute(
                        "INSERT INTO inferred_documents(instance_id, space, document_json, updated_at)
                         VALUES (?1, ?2, ?3, ?4)
                         ON CONFLICT(instance_id) DO UPDATE SET
                           space = excluded.space,
                           document_json = excluded.document_json,
                           updated_at = excluded.updated_at",
                        params![document_id, event.space.as_str(), json, now],
                    )
                    .context("failed to write inferred document")?;
                    tx.execute(
                        "DELETE FROM inferred_sources WHERE instance_id = ?1",
                        params![document_id],
                    )
                    .context("failed to clear inferred sources")?;
                    for source in &event.data.inference_of {
                        tx.execute(
                            "INSERT OR IGNORE INTO inferred_sources(instance_id, source_id) VALUES (?1, ?2)",
                            params![document_id, source],
                        )
                        .context("failed to write inferred source")?;
                    }
                    materialized += 1;
                }
                EventType::Delete => {
                    removed += tx
                        .execute(
                            "DELETE FROM inferred_documents WHERE instance_id = ?1",
                            params![document_id],
                        )
                        .context("failed to delete inferred document")?;
                }
                EventType::Release | EventType::Unrelease => {}
            }
        }
        tx.commit().context("failed to commit event batch")?;

        for event in events {
            match event.event_type {
                EventType::Insert | EventType::Update => {
                    let candidate = PersistedIdentifier::new(event.document_id, event.space.clone())
                        .with_alternatives(event.data.all_identifiers());
                    self.upsert_identifier(Stage::InProgress, &candidate)?;
                }
                EventType::Delete => {
                    self.set_deprecated(Stage::InProgress, event.document_id, true)?;
                }
                EventType::Release | EventType::Unrelease => {}
            }
        }

        info!(batch_id = %batch_id, events = events.len(), materialized, removed, "applied event batch");
        Ok(AppliedEvents { batch_id, applied: events.len(), materialized, removed })
    }

    /// The event log of `space` in application order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_events(&self, space: &SpaceName) -> Result<Vec<LoggedEvent>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT sequence, batch_id, recorded_at, event_json
                 FROM event_log WHERE space = ?1 ORDER BY sequence",
            )
            .context("failed to prepare event log query")?;
        let rows = stmt.query_map(params![space.as_str()], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (sequence, batch_id, recorded_at, json) = row?;
            events.push(LoggedEvent {
                sequence,
                batch_id,
                recorded_at,
                event: decode_json(&json, "event")?,
            });
        }
        Ok(events)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()?;
        Ok(())
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }
}

fn source_error(err: &anyhow::Error) -> KernelError {
    match err.downcast_ref::<KernelError>() {
        Some(kernel) => kernel.clone(),
        None => KernelError::Source(format!("{err:#}")),
    }
}

fn native_only(stage: Stage) -> Result<(), KernelError> {
    if stage == Stage::Native {
        Ok(())
    } else {
        Err(KernelError::Validation(format!("indexed documents are only stored for stage native, not {stage}")))
    }
}

impl DocumentSource for SqliteStore {
    fn related_instances_by_identifiers(
        &self,
        space: &SpaceName,
        id: Uuid,
        stage: Stage,
    ) -> Result<Vec<IndexedDocument>, KernelError> {
        native_only(stage)?;
        self.related_native_documents(space, id).map_err(|err| source_error(&err))
    }

    fn instance_by_id(
        &self,
        space: &SpaceName,
        id: Uuid,
        stage: Stage,
    ) -> Result<Option<IndexedDocument>, KernelError> {
        native_only(stage)?;
        self.get_native_document(space, id).map_err(|err| source_error(&err))
    }

    fn inferred_instances_of(
        &self,
        space: &SpaceName,
        source_id: &str,
    ) -> Result<Vec<InferredDocument>, KernelError> {
        self.inferred_documents_of(space, source_id).map_err(|err| source_error(&err))
    }
}

fn is_conflict(err: &anyhow::Error) -> bool {
    err.downcast_ref::<KernelError>().is_some_and(KernelError::is_retryable)
}

/// Content hash of a batch, so replays of the same batch share an id.
fn event_batch_id(events: &[Event]) -> Result<String> {
    let mut hasher = Sha256::new();
    for event in events {
        let line = serde_json::to_string(event).context("failed to serialize event")?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn decode_json<T: serde::de::DeserializeOwned>(json: &str, what: &str) -> Result<T> {
    serde_json::from_str(json).with_context(|| format!("failed to decode stored {what}"))
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("invalid UUID: {raw}"))
}

fn apply_migration(conn: &Connection, version: i64, sql: &str) -> Result<()> {
    conn.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
    record_schema_version(conn, version)?;
    Ok(())
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
