use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chronicle_core::{ChronicleError, MemoryId, MemoryPatch, MemoryStatus};
use chronicle_pipeline::{
    load_config, run_dispatcher, run_scheduler, AskRequest, ChronicleApi, CreateMemoryRequest,
    PipelineConfig, API_CONTRACT_VERSION,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Clone)]
struct ServiceState {
    api: ChronicleApi,
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
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    team_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatsQuery {
    #[serde(default)]
    team_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeleteResponse {
    success: bool,
    message: String,
}

#[derive(Debug, Parser)]
#[command(name = "chronicle-service")]
#[command(about = "Local HTTP service for Chronicle")]
struct Args {
    #[arg(long, default_value = "./chronicle.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long)]
    config: Option<PathBuf>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
        }
    }
}

impl From<ChronicleError> for ServiceError {
    fn from(err: ChronicleError) -> Self {
        let status = match &err {
            ChronicleError::Validation(_) => StatusCode::BAD_REQUEST,
            ChronicleError::NotFound { .. } => StatusCode::NOT_FOUND,
            ChronicleError::Capability { .. } => StatusCode::BAD_GATEWAY,
            ChronicleError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: format!("{err:#}"),
        }
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

fn parse_memory_id(raw: &str) -> Result<MemoryId, ServiceError> {
    Ulid::from_string(raw)
        .map(MemoryId)
        .map_err(|_| ServiceError::bad_request(format!("invalid memory id: {raw}")))
}

fn parse_status(raw: &str) -> Result<MemoryStatus, ServiceError> {
    MemoryStatus::parse(raw)
        .ok_or_else(|| ServiceError::bad_request(format!("unknown status filter: {raw}")))
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/memories", post(memory_create).get(memory_list))
        .route("/v1/memories/stats", get(memory_stats))
        .route(
            "/v1/memories/:id",
            get(memory_show).patch(memory_update).delete(memory_delete),
        )
        .route("/v1/ask", post(ask))
        .with_state(state)
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();
    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => PipelineConfig::default(),
    };
    let (api, events) = ChronicleApi::with_config(args.db, &config);
    api.migrate(false)?;
    let pipeline = api.pipeline();
    tokio::spawn(run_dispatcher(Arc::clone(&pipeline), events));
    tokio::spawn(run_scheduler(pipeline));
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "chronicle service listening");
    axum::serve(listener, app(ServiceState { api })).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<chronicle_store_sqlite::SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status()?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<chronicle_pipeline::MigrateResult>>, ServiceError> {
    let result = state.api.migrate(request.dry_run)?;
    Ok(Json(envelope(result)))
}

async fn memory_create(
    State(state): State<ServiceState>,
    Json(request): Json<CreateMemoryRequest>,
) -> Result<(StatusCode, Json<ServiceEnvelope<chronicle_core::Memory>>), ServiceError> {
    let memory = state.api.create_memory(request)?;
    Ok((StatusCode::CREATED, Json(envelope(memory))))
}

async fn memory_list(
    State(state): State<ServiceState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ServiceEnvelope<Vec<chronicle_core::Memory>>>, ServiceError> {
    let status = query.status.as_deref().map(parse_status).transpose()?;
    let memories = state.api.list_memories(status, query.team_id.as_deref())?;
    Ok(Json(envelope(memories)))
}

async fn memory_stats(
    State(state): State<ServiceState>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<ServiceEnvelope<chronicle_core::MemoryStats>>, ServiceError> {
    let stats = state.api.memory_stats(query.team_id.as_deref())?;
    Ok(Json(envelope(stats)))
}

async fn memory_show(
    State(state): State<ServiceState>,
    Path(raw_id): Path<String>,
) -> Result<Json<ServiceEnvelope<chronicle_core::Memory>>, ServiceError> {
    let id = parse_memory_id(&raw_id)?;
    let memory = state.api.get_memory(id)?;
    Ok(Json(envelope(memory)))
}

async fn memory_update(
    State(state): State<ServiceState>,
    Path(raw_id): Path<String>,
    Json(patch): Json<MemoryPatch>,
) -> Result<Json<ServiceEnvelope<chronicle_core::Memory>>, ServiceError> {
    let id = parse_memory_id(&raw_id)?;
    let memory = state.api.update_memory(id, &patch)?;
    Ok(Json(envelope(memory)))
}

async fn memory_delete(
    State(state): State<ServiceState>,
    Path(raw_id): Path<String>,
) -> Result<Json<ServiceEnvelope<DeleteResponse>>, ServiceError> {
    let id = parse_memory_id(&raw_id)?;
    let deleted = state.api.delete_memory(id)?;
    Ok(Json(envelope(DeleteResponse { success: true, message: deleted.message })))
}

async fn ask(
    State(state): State<ServiceState>,
    Json(request): Json<AskRequest>,
) -> Result<Json<ServiceEnvelope<chronicle_pipeline::AskOutcome>>, ServiceError> {
    let outcome = state.api.ask(&request).await?;
    Ok(Json(envelope(outcome)))
}
