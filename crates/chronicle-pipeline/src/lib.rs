//! Event-driven memory lifecycle pipeline over the chronicle store.
//!
//! Entry points persist a change and emit events onto an in-process bus;
//! stage handlers enrich, embed, schedule, reactivate and notify, each one
//! idempotent because delivery is at-least-once. [`ChronicleApi`] is the
//! facade the service and CLI build on.

pub mod bus;
pub mod config;
pub mod providers;
pub mod retry;
pub mod scheduler;
pub mod stages;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chronicle_core::{
    ChronicleError, Event, Memory, MemoryDraft, MemoryId, MemoryPatch, MemoryStats, MemoryStatus,
    MemoryType, Severity, TriggerType,
};
use chronicle_store_sqlite::{
    ExportManifest, ImportSummary, IntegrityReport, SchemaStatus, SqliteStore,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::mpsc::UnboundedReceiver;

pub use crate::bus::EventBus;
pub use crate::config::{load_config, EnrichmentConfig, PipelineConfig};
pub use crate::providers::{
    enrichment_from_config, Capabilities, EnrichmentProvider, HeuristicEnrichment,
    HttpEnrichmentProvider, NotificationTransport, SqliteVectorIndex, TracingNotifier, VectorIndex,
    VectorMatch,
};
pub use crate::retry::{with_retries, RetryPolicy};
pub use crate::scheduler::{run_scheduler, SchedulerHandle};
pub use crate::stages::{run_dispatcher, DeletedMemory, Pipeline, NO_MATCH_ANSWER};

pub const API_CONTRACT_VERSION: &str = "api.v1";

/// Team assigned when a request leaves the field blank.
pub const DEFAULT_TEAM_ID: &str = "default-team";

/// Caller-facing create request. Field names match the event wire contract;
/// everything except the title is optional.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct CreateMemoryRequest {
    pub title: String,
    pub description: String,
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    pub trigger_type: TriggerType,
    #[serde(
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub trigger_date: Option<OffsetDateTime>,
    pub team_id: String,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
}

impl Default for CreateMemoryRequest {
    fn default() -> Self {
        Self {
            title: String::new(),
            description: String::new(),
            memory_type: MemoryType::Context,
            trigger_type: TriggerType::None,
            trigger_date: None,
            team_id: DEFAULT_TEAM_ID.to_string(),
            tags: Vec::new(),
            severity: None,
        }
    }
}

impl CreateMemoryRequest {
    #[must_use]
    pub fn into_draft(self) -> MemoryDraft {
        let team_id = if self.team_id.trim().is_empty() {
            DEFAULT_TEAM_ID.to_string()
        } else {
            self.team_id
        };
        MemoryDraft {
            title: self.title,
            description: self.description,
            memory_type: self.memory_type,
            trigger_type: self.trigger_type,
            trigger_date: self.trigger_date,
            team_id,
            tags: self.tags,
            severity: self.severity,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AskRequest {
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
}

/// One memory an answer was grounded on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AskSource {
    pub memory_id: MemoryId,
    pub title: String,
    pub relevance: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AskOutcome {
    pub answer: String,
    pub sources: Vec<AskSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// Facade over the pipeline: lifecycle entry points, the ask flow, and
/// database management, all against one SQLite path.
#[derive(Clone)]
pub struct ChronicleApi {
    pipeline: Arc<Pipeline>,
    db_path: PathBuf,
}

impl ChronicleApi {
    /// Build the api plus the event stream its pipeline emits into. The
    /// caller owns dispatching: the service spawns [`run_dispatcher`], the
    /// CLI and tests drain inline.
    #[must_use]
    pub fn with_config(
        db_path: PathBuf,
        config: &PipelineConfig,
    ) -> (Self, UnboundedReceiver<Event>) {
        let (bus, events) = EventBus::channel();
        let capabilities = Capabilities {
            enrichment: enrichment_from_config(&config.enrichment),
            index: Arc::new(SqliteVectorIndex::new(db_path.clone())),
            notifier: Arc::new(TracingNotifier),
        };
        let pipeline = Arc::new(Pipeline::new(
            db_path.clone(),
            capabilities,
            bus,
            SchedulerHandle::new(),
            config.retry.clone(),
            config.notification_channels.clone(),
        ));
        (Self { pipeline, db_path }, events)
    }

    /// Wrap an already-built pipeline; tests use this to inject fakes.
    #[must_use]
    pub fn from_pipeline(pipeline: Arc<Pipeline>, db_path: PathBuf) -> Self {
        Self { pipeline, db_path }
    }

    #[must_use]
    pub fn pipeline(&self) -> Arc<Pipeline> {
        Arc::clone(&self.pipeline)
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// # Errors
    /// `Validation` for a bad draft, `Storage` when persistence fails.
    pub fn create_memory(&self, request: CreateMemoryRequest) -> Result<Memory, ChronicleError> {
        self.pipeline.create(request.into_draft())
    }

    /// # Errors
    /// `NotFound` when the id is unknown.
    pub fn get_memory(&self, id: MemoryId) -> Result<Memory, ChronicleError> {
        self.pipeline.get(id)
    }

    /// # Errors
    /// `Storage` when the listing query fails.
    pub fn list_memories(
        &self,
        status: Option<MemoryStatus>,
        team_id: Option<&str>,
    ) -> Result<Vec<Memory>, ChronicleError> {
        self.pipeline.list(status, team_id)
    }

    /// # Errors
    /// `Storage` when the listing query fails.
    pub fn memory_stats(&self, team_id: Option<&str>) -> Result<MemoryStats, ChronicleError> {
        self.pipeline.stats(team_id)
    }

    /// # Errors
    /// `NotFound`, `Validation`, or `Storage` per the patch outcome.
    pub fn update_memory(
        &self,
        id: MemoryId,
        patch: &MemoryPatch,
    ) -> Result<Memory, ChronicleError> {
        self.pipeline.update(id, patch)
    }

    /// # Errors
    /// `NotFound` when the id is unknown, `Storage` when the delete fails.
    pub fn delete_memory(&self, id: MemoryId) -> Result<DeletedMemory, ChronicleError> {
        self.pipeline.delete(id)
    }

    /// # Errors
    /// `Capability` when enrichment or the index fail after retries.
    pub async fn ask(&self, request: &AskRequest) -> Result<AskOutcome, ChronicleError> {
        self.pipeline
            .ask(&request.question, request.team_id.as_deref())
            .await
    }

    fn open_store(&self) -> anyhow::Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    /// # Errors
    /// Returns an error when the database cannot be opened or read.
    pub fn schema_status(&self) -> anyhow::Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Report pending schema versions, then apply them unless `dry_run`.
    ///
    /// # Errors
    /// Returns an error when a migration step fails.
    pub fn migrate(&self, dry_run: bool) -> anyhow::Result<MigrateResult> {
        let mut store = self.open_store()?;
        let status = store.schema_status()?;
        let mut result = MigrateResult {
            dry_run,
            current_version: status.current_version,
            target_version: status.target_version,
            would_apply_versions: status.pending_versions.clone(),
            after_version: None,
            up_to_date: None,
        };
        if dry_run {
            return Ok(result);
        }
        store.migrate()?;
        let after = store.schema_status()?;
        result.after_version = Some(after.current_version);
        result.up_to_date = Some(after.pending_versions.is_empty());
        Ok(result)
    }

    /// # Errors
    /// Returns an error when a table cannot be read or a file written.
    pub fn export_snapshot(&self, out_dir: &Path) -> anyhow::Result<ExportManifest> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.export_snapshot(out_dir)
    }

    /// # Errors
    /// Returns an error when the manifest is invalid or a row cannot be
    /// written.
    pub fn import_snapshot(
        &self,
        in_dir: &Path,
        skip_existing: bool,
    ) -> anyhow::Result<ImportSummary> {
        let mut store = self.open_store()?;
        store.import_snapshot(in_dir, skip_existing)
    }

    /// # Errors
    /// Returns an error when the backup cannot be written.
    pub fn backup_database(&self, out_file: &Path) -> anyhow::Result<()> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.backup_database(out_file)
    }

    /// # Errors
    /// Returns an error when the backup file is missing or unreadable.
    pub fn restore_database(&self, in_file: &Path) -> anyhow::Result<()> {
        let mut store = self.open_store()?;
        store.restore_database(in_file)
    }

    /// # Errors
    /// Returns an error when the checks cannot run at all.
    pub fn integrity_check(&self) -> anyhow::Result<IntegrityReport> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.integrity_check()
    }
}
