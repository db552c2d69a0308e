use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use kg_identity_api::{
    DeleteDocumentResult, FindInstanceRequest, IdentityKernelApi, IngestResult, MigrateResult,
    ReconcileResult, API_CONTRACT_VERSION,
};
use kg_identity_core::{
    IdMapping, IdNamespace, IdWithAlternatives, IndexedDocument, InferredDocument, KernelError,
    ResolvedId, SpaceName, Stage, UpsertOutcome, DEFAULT_NAMESPACE,
};
use kg_identity_store_sqlite::{LoggedEvent, SchemaStatus};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: IdentityKernelApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    #[serde(default)]
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct DeprecateRequest {
    #[serde(default)]
    revert: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct ReconcileRequest {
    #[serde(default)]
    apply: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "kg-identity-service")]
#[command(about = "Local HTTP service for identifier resolution and reconciliation")]
struct Args {
    #[arg(long, default_value = "./kg_identity.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = DEFAULT_NAMESPACE)]
    namespace: String,
    #[arg(long, default_value_t = 3)]
    max_upsert_attempts: u32,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, service_contract_version: SERVICE_CONTRACT_VERSION, error: message.into() }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        let status = match err.downcast_ref::<KernelError>() {
            Some(KernelError::Validation(_) | KernelError::IllegalArgument(_)) => {
                StatusCode::BAD_REQUEST
            }
            Some(KernelError::AmbiguousId { .. } | KernelError::Conflict { .. }) => {
                StatusCode::CONFLICT
            }
            Some(KernelError::InconsistentState(_) | KernelError::Source(_)) | None => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            warn!(error = %format!("{err:#}"), "request failed");
        }
        Self::new(status, format!("{err:#}"))
    }
}

impl From<KernelError> for ServiceError {
    fn from(err: KernelError) -> Self {
        anyhow::Error::new(err).into()
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

type ServiceResult<T> = Result<Json<ServiceEnvelope<T>>, ServiceError>;

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/ids/:stage", post(ids_upsert))
        .route("/v1/ids/:stage/resolve", post(ids_resolve))
        .route("/v1/ids/:stage/find", post(ids_find))
        .route("/v1/ids/:stage/:id/deprecate", post(ids_deprecate))
        .route("/v1/documents", post(documents_ingest))
        .route("/v1/documents/:space/:id", get(documents_show).delete(documents_delete))
        .route("/v1/reconcile/:space/:id", post(reconcile))
        .route("/v1/inferred/:space", get(inferred_list))
        .route("/v1/events/:space", get(events_list))
        .with_state(state)
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let api = IdentityKernelApi::new(args.db)
        .with_namespace(IdNamespace::new(&args.namespace)?)
        .with_max_upsert_attempts(args.max_upsert_attempts);
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, "kg-identity-service listening");
    axum::serve(listener, app(ServiceState { api })).await?;
    Ok(())
}

fn parse_stage(raw: &str) -> Result<Stage, ServiceError> {
    Ok(Stage::from_str(raw)?)
}

fn parse_space(raw: &str) -> Result<SpaceName, ServiceError> {
    Ok(SpaceName::new(raw)?)
}

fn parse_uuid(raw: &str) -> Result<Uuid, ServiceError> {
    Uuid::parse_str(raw)
        .map_err(|err| ServiceError::new(StatusCode::BAD_REQUEST, format!("invalid id {raw}: {err}")))
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(State(state): State<ServiceState>) -> ServiceResult<SchemaStatus> {
    Ok(Json(envelope(state.api.schema_status()?)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> ServiceResult<MigrateResult> {
    Ok(Json(envelope(state.api.migrate(request.dry_run)?)))
}

async fn ids_upsert(
    State(state): State<ServiceState>,
    Path(stage): Path<String>,
    Json(request): Json<IdWithAlternatives>,
) -> ServiceResult<UpsertOutcome> {
    let stage = parse_stage(&stage)?;
    Ok(Json(envelope(state.api.create_or_update_id(stage, &request)?)))
}

async fn ids_resolve(
    State(state): State<ServiceState>,
    Path(stage): Path<String>,
    Json(queries): Json<Vec<IdWithAlternatives>>,
) -> ServiceResult<Vec<IdMapping>> {
    let stage = parse_stage(&stage)?;
    Ok(Json(envelope(state.api.resolve_id(stage, &queries)?)))
}

async fn ids_find(
    State(state): State<ServiceState>,
    Path(stage): Path<String>,
    Json(request): Json<FindInstanceRequest>,
) -> ServiceResult<ResolvedId> {
    let stage = parse_stage(&stage)?;
    let found = state
        .api
        .find_instance_by_identifiers(stage, &request)?
        .ok_or_else(|| ServiceError::not_found("no instance matches the given identifiers"))?;
    Ok(Json(envelope(found)))
}

async fn ids_deprecate(
    State(state): State<ServiceState>,
    Path((stage, id)): Path<(String, String)>,
    request: Option<Json<DeprecateRequest>>,
) -> ServiceResult<Vec<ResolvedId>> {
    let stage = parse_stage(&stage)?;
    let id = parse_uuid(&id)?;
    let revert = request.is_some_and(|Json(request)| request.revert);
    let updated = state.api.deprecate_id(stage, id, revert)?;
    if updated.is_empty() {
        return Err(ServiceError::not_found(format!("id {id} not found in stage {stage}")));
    }
    Ok(Json(envelope(updated)))
}

async fn documents_ingest(
    State(state): State<ServiceState>,
    Json(document): Json<IndexedDocument>,
) -> ServiceResult<IngestResult> {
    Ok(Json(envelope(state.api.ingest_document(document)?)))
}

async fn documents_show(
    State(state): State<ServiceState>,
    Path((space, id)): Path<(String, String)>,
) -> ServiceResult<IndexedDocument> {
    let space = parse_space(&space)?;
    let id = parse_uuid(&id)?;
    let document = state
        .api
        .get_document(&space, id)?
        .ok_or_else(|| ServiceError::not_found(format!("document {id} not found in space {space}")))?;
    Ok(Json(envelope(document)))
}

async fn documents_delete(
    State(state): State<ServiceState>,
    Path((space, id)): Path<(String, String)>,
) -> ServiceResult<DeleteDocumentResult> {
    let space = parse_space(&space)?;
    let id = parse_uuid(&id)?;
    let result = state.api.delete_document(&space, id)?;
    if !result.deleted {
        return Err(ServiceError::not_found(format!("document {id} not found in space {space}")));
    }
    Ok(Json(envelope(result)))
}

async fn reconcile(
    State(state): State<ServiceState>,
    Path((space, id)): Path<(String, String)>,
    request: Option<Json<ReconcileRequest>>,
) -> ServiceResult<ReconcileResult> {
    let space = parse_space(&space)?;
    let id = parse_uuid(&id)?;
    let apply = request.is_some_and(|Json(request)| request.apply);
    Ok(Json(envelope(state.api.reconcile(&space, id, apply)?)))
}

async fn inferred_list(
    State(state): State<ServiceState>,
    Path(space): Path<String>,
) -> ServiceResult<Vec<InferredDocument>> {
    let space = parse_space(&space)?;
    Ok(Json(envelope(state.api.list_inferred(&space)?)))
}

async fn events_list(
    State(state): State<ServiceState>,
    Path(space): Path<String>,
) -> ServiceResult<Vec<LoggedEvent>> {
    let space = parse_space(&space)?;
    Ok(Json(envelope(state.api.list_events(&space)?)))
}
