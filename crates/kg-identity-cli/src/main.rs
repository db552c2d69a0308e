use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use kg_identity_api::{FindInstanceRequest, IdentityKernelApi};
use kg_identity_core::{
    IdNamespace, IdWithAlternatives, IndexedDocument, SpaceName, Stage, DEFAULT_NAMESPACE,
};
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "kgid")]
#[command(about = "Identifier resolution and reconciliation CLI")]
struct Cli {
    #[arg(long, default_value = "./kg_identity.sqlite3")]
    db: PathBuf,

    #[arg(long, default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    #[arg(long, default_value_t = 3)]
    max_upsert_attempts: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Id {
        #[command(subcommand)]
        command: IdCommand,
    },
    Doc {
        #[command(subcommand)]
        command: DocCommand,
    },
    Reconcile(ReconcileArgs),
    Events(SpaceArgs),
    Inferred(SpaceArgs),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StageArg {
    Native,
    InProgress,
    Released,
}

impl From<StageArg> for Stage {
    fn from(value: StageArg) -> Self {
        match value {
            StageArg::Native => Self::Native,
            StageArg::InProgress => Self::InProgress,
            StageArg::Released => Self::Released,
        }
    }
}

#[derive(Debug, Subcommand)]
enum IdCommand {
    Upsert(IdUpsertArgs),
    Resolve(IdLookupArgs),
    Find(IdLookupArgs),
    Deprecate(IdDeprecateArgs),
}

#[derive(Debug, Args)]
struct IdUpsertArgs {
    #[arg(long)]
    stage: StageArg,
    #[arg(long)]
    id: Uuid,
    #[arg(long)]
    space: String,
    #[arg(long = "alternative")]
    alternatives: Vec<String>,
}

#[derive(Debug, Args)]
struct IdLookupArgs {
    #[arg(long)]
    stage: StageArg,
    #[arg(long)]
    id: Option<Uuid>,
    #[arg(long)]
    space: Option<String>,
    #[arg(long = "alternative")]
    alternatives: Vec<String>,
}

#[derive(Debug, Args)]
struct IdDeprecateArgs {
    #[arg(long)]
    stage: StageArg,
    #[arg(long)]
    id: Uuid,
    #[arg(long, default_value_t = false)]
    revert: bool,
}

#[derive(Debug, Subcommand)]
enum DocCommand {
    Ingest(DocIngestArgs),
    Show(DocRefArgs),
    Delete(DocRefArgs),
}

#[derive(Debug, Args)]
struct DocIngestArgs {
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
struct DocRefArgs {
    #[arg(long)]
    space: String,
    #[arg(long)]
    id: Uuid,
}

#[derive(Debug, Args)]
struct ReconcileArgs {
    #[arg(long)]
    space: String,
    #[arg(long)]
    id: Uuid,
    #[arg(long, default_value_t = false)]
    apply: bool,
}

#[derive(Debug, Args)]
struct SpaceArgs {
    #[arg(long)]
    space: String,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let api = IdentityKernelApi::new(cli.db)
        .with_namespace(IdNamespace::new(&cli.namespace)?)
        .with_max_upsert_attempts(cli.max_upsert_attempts);

    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::Id { command } => run_id(command, &api),
        Command::Doc { command } => run_doc(command, &api),
        Command::Reconcile(args) => run_reconcile(&args, &api),
        Command::Events(args) => {
            let space = SpaceName::new(&args.space)?;
            let events = api.list_events(&space)?;
            emit_json(serde_json::json!({ "space": space, "events": events }))
        }
        Command::Inferred(args) => {
            let space = SpaceName::new(&args.space)?;
            let documents = api.list_inferred(&space)?;
            emit_json(serde_json::json!({ "space": space, "documents": documents }))
        }
    }
}

fn run_db(command: DbCommand, api: &IdentityKernelApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_json(serde_json::to_value(&result).context("failed to serialize migration result")?)
        }
        DbCommand::Backup(args) => {
            api.migrate(false)?;
            api.backup(&args.out)?;
            emit_json(serde_json::json!({ "backup_path": args.out, "status": "ok" }))
        }
        DbCommand::Restore(args) => {
            api.restore(&args.input)?;
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "restored_from": args.input,
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions
            }))
        }
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
        }
    }
}

fn lookup_request(args: &IdLookupArgs) -> Result<IdWithAlternatives> {
    Ok(IdWithAlternatives {
        id: args.id,
        space: args.space.as_deref().map(SpaceName::new).transpose()?,
        alternatives: args.alternatives.iter().cloned().collect(),
    })
}

fn run_id(command: IdCommand, api: &IdentityKernelApi) -> Result<()> {
    match command {
        IdCommand::Upsert(args) => {
            let request = IdWithAlternatives {
                id: Some(args.id),
                space: Some(SpaceName::new(&args.space)?),
                alternatives: args.alternatives.into_iter().collect(),
            };
            let outcome = api.create_or_update_id(args.stage.into(), &request)?;
            emit_json(serde_json::to_value(&outcome).context("failed to serialize upsert outcome")?)
        }
        IdCommand::Resolve(args) => {
            let request = lookup_request(&args)?;
            let mappings = api.resolve_id(args.stage.into(), &[request])?;
            emit_json(serde_json::json!({ "mappings": mappings }))
        }
        IdCommand::Find(args) => {
            let request = FindInstanceRequest {
                space: args.space.as_deref().map(SpaceName::new).transpose()?,
                id: args.id,
                identifiers: args.alternatives,
            };
            let found = api.find_instance_by_identifiers(args.stage.into(), &request)?;
            emit_json(serde_json::json!({ "found": found }))
        }
        IdCommand::Deprecate(args) => {
            let stage = Stage::from(args.stage);
            let updated = api.deprecate_id(stage, args.id, args.revert)?;
            if updated.is_empty() {
                return Err(anyhow!("id {} not found in stage {stage}", args.id));
            }
            emit_json(serde_json::json!({ "revert": args.revert, "updated": updated }))
        }
    }
}

fn run_doc(command: DocCommand, api: &IdentityKernelApi) -> Result<()> {
    match command {
        DocCommand::Ingest(args) => {
            let body = fs::read_to_string(&args.file)
                .with_context(|| format!("failed to read document file {}", args.file.display()))?;
            let document: IndexedDocument = serde_json::from_str(&body)
                .with_context(|| format!("invalid document JSON in {}", args.file.display()))?;
            let result = api.ingest_document(document)?;
            emit_json(serde_json::to_value(&result).context("failed to serialize ingest result")?)
        }
        DocCommand::Show(args) => {
            let space = SpaceName::new(&args.space)?;
            let document = api
                .get_document(&space, args.id)?
                .ok_or_else(|| anyhow!("document {} not found in space {space}", args.id))?;
            emit_json(serde_json::json!({ "document": document }))
        }
        DocCommand::Delete(args) => {
            let result = api.delete_document(&SpaceName::new(&args.space)?, args.id)?;
            emit_json(serde_json::to_value(&result).context("failed to serialize delete result")?)
        }
    }
}

fn run_reconcile(args: &ReconcileArgs, api: &IdentityKernelApi) -> Result<()> {
    let result = api.reconcile(&SpaceName::new(&args.space)?, args.id, args.apply)?;
    emit_json(serde_json::to_value(&result).context("failed to serialize reconcile result")?)
}
