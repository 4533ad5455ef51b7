use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use chronicle_core::{
    Event, MemoryId, MemoryPatch, MemoryStatus, MemoryType, Severity, TriggerType,
};
use chronicle_pipeline::{
    load_config, AskRequest, ChronicleApi, CreateMemoryRequest, PipelineConfig, DEFAULT_TEAM_ID,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::mpsc::UnboundedReceiver;
use ulid::Ulid;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "chron")]
#[command(about = "Chronicle CLI")]
struct Cli {
    #[arg(long, default_value = "./chronicle.sqlite3")]
    db: PathBuf,

    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Memory {
        #[command(subcommand)]
        command: Box<MemoryCommand>,
    },
    Stats(StatsArgs),
    Ask(AskArgs),
    Pipeline {
        #[command(subcommand)]
        command: Box<PipelineCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Export(DbExportArgs),
    Import(DbImportArgs),
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
struct DbExportArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
    #[arg(long, default_value_t = true)]
    skip_existing: bool,
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

#[derive(Debug, Subcommand)]
enum MemoryCommand {
    Add(AddArgs),
    List(ListArgs),
    Show(ShowArgs),
    Update(UpdateArgs),
    Delete(DeleteArgs),
}

#[derive(Debug, Args)]
struct AddArgs {
    #[arg(long)]
    title: String,
    #[arg(long, default_value = "")]
    description: String,
    #[arg(long = "type", value_enum, default_value = "context")]
    memory_type: MemoryTypeArg,
    #[arg(long, value_enum, default_value = "none")]
    trigger_type: TriggerTypeArg,
    #[arg(long)]
    trigger_date: Option<String>,
    #[arg(long, default_value = DEFAULT_TEAM_ID)]
    team_id: String,
    #[arg(long = "tag")]
    tags: Vec<String>,
    #[arg(long, value_enum)]
    severity: Option<SeverityArg>,
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(long, value_enum)]
    status: Option<StatusArg>,
    #[arg(long)]
    team_id: Option<String>,
}

#[derive(Debug, Args)]
struct ShowArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
struct UpdateArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    description: Option<String>,
    #[arg(long = "type", value_enum)]
    memory_type: Option<MemoryTypeArg>,
    #[arg(long, value_enum)]
    status: Option<StatusArg>,
    #[arg(long, value_enum)]
    trigger_type: Option<TriggerTypeArg>,
    #[arg(long)]
    trigger_date: Option<String>,
    #[arg(long = "tag")]
    tags: Vec<String>,
    #[arg(long, value_enum)]
    severity: Option<SeverityArg>,
}

#[derive(Debug, Args)]
struct DeleteArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
struct StatsArgs {
    #[arg(long)]
    team_id: Option<String>,
}

#[derive(Debug, Args)]
struct AskArgs {
    #[arg(long)]
    question: String,
    #[arg(long)]
    team_id: Option<String>,
}

#[derive(Debug, Subcommand)]
enum PipelineCommand {
    Run,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MemoryTypeArg {
    Future,
    Decision,
    Failure,
    Context,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StatusArg {
    Active,
    Scheduled,
    Triggered,
    Archived,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TriggerTypeArg {
    None,
    Date,
    Event,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SeverityArg {
    Low,
    Medium,
    High,
    Critical,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "cli_contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "cli_contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => PipelineConfig::default(),
    };
    let (api, mut events) = ChronicleApi::with_config(cli.db, &config);
    let outcome = match cli.command {
        Command::Db { command } => run_db(*command, &api),
        Command::Memory { command } => run_memory(*command, &api),
        Command::Stats(args) => run_stats(&args, &api),
        Command::Ask(args) => run_ask(&args, &api).await,
        Command::Pipeline { command } => run_pipeline(*command, &api, &mut events).await,
    };
    // One-shot process: settle every emitted event before exiting so the
    // enrichment chain and schedule rows land durably.
    api.pipeline().drain(&mut events).await;
    outcome
}

fn run_db(command: DbCommand, api: &ChronicleApi) -> Result<()> {
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
            emit_json(serde_json::to_value(&result).context("failed to serialize migrate result")?)
        }
        DbCommand::Export(args) => {
            let manifest = api.export_snapshot(&args.out)?;
            emit_json(serde_json::json!({
                "out_dir": args.out,
                "manifest": manifest
            }))
        }
        DbCommand::Import(args) => {
            let summary = api.import_snapshot(&args.input, args.skip_existing)?;
            emit_json(serde_json::json!({
                "in_dir": args.input,
                "skip_existing": args.skip_existing,
                "summary": summary
            }))
        }
        DbCommand::Backup(args) => {
            api.backup_database(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
        DbCommand::Restore(args) => {
            api.restore_database(&args.input)?;
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
            emit_json(
                serde_json::to_value(&report).context("failed to serialize integrity report")?,
            )
        }
    }
}

fn run_memory(command: MemoryCommand, api: &ChronicleApi) -> Result<()> {
    match command {
        MemoryCommand::Add(args) => {
            let trigger_date = args.trigger_date.as_deref().map(parse_rfc3339).transpose()?;
            let request = CreateMemoryRequest {
                title: args.title,
                description: args.description,
                memory_type: args.memory_type.into_memory_type(),
                trigger_type: args.trigger_type.into_trigger_type(),
                trigger_date,
                team_id: args.team_id,
                tags: args.tags,
                severity: args.severity.map(SeverityArg::into_severity),
            };
            let memory = api.create_memory(request)?;
            emit_json(serde_json::to_value(&memory).context("failed to serialize memory")?)
        }
        MemoryCommand::List(args) => {
            let status = args.status.map(StatusArg::into_status);
            let memories = api.list_memories(status, args.team_id.as_deref())?;
            emit_json(serde_json::json!({ "memories": memories }))
        }
        MemoryCommand::Show(args) => {
            let memory = api.get_memory(parse_memory_id(&args.id)?)?;
            emit_json(serde_json::to_value(&memory).context("failed to serialize memory")?)
        }
        MemoryCommand::Update(args) => {
            let id = parse_memory_id(&args.id)?;
            let patch = args.into_patch()?;
            let memory = api.update_memory(id, &patch)?;
            emit_json(serde_json::to_value(&memory).context("failed to serialize memory")?)
        }
        MemoryCommand::Delete(args) => {
            let deleted = api.delete_memory(parse_memory_id(&args.id)?)?;
            emit_json(serde_json::json!({
                "success": true,
                "message": deleted.message
            }))
        }
    }
}

fn run_stats(args: &StatsArgs, api: &ChronicleApi) -> Result<()> {
    let stats = api.memory_stats(args.team_id.as_deref())?;
    emit_json(serde_json::to_value(&stats).context("failed to serialize stats")?)
}

async fn run_ask(args: &AskArgs, api: &ChronicleApi) -> Result<()> {
    let request = AskRequest {
        question: args.question.clone(),
        team_id: args.team_id.clone(),
    };
    let outcome = api.ask(&request).await?;
    emit_json(serde_json::to_value(&outcome).context("failed to serialize ask outcome")?)
}

async fn run_pipeline(
    command: PipelineCommand,
    api: &ChronicleApi,
    events: &mut UnboundedReceiver<Event>,
) -> Result<()> {
    match command {
        PipelineCommand::Run => {
            let pipeline = api.pipeline();
            let recovered = pipeline.recover_schedules()?;
            let fired = pipeline.fire_due(OffsetDateTime::now_utc()).await;
            let handled = pipeline.drain(events).await;
            emit_json(serde_json::json!({
                "recovered_schedules": recovered,
                "fired_schedules": fired,
                "handled_events": handled
            }))
        }
    }
}

impl UpdateArgs {
    fn into_patch(self) -> Result<MemoryPatch> {
        let trigger_date = self.trigger_date.as_deref().map(parse_rfc3339).transpose()?;
        let tags = if self.tags.is_empty() { None } else { Some(self.tags) };
        Ok(MemoryPatch {
            title: self.title,
            description: self.description,
            memory_type: self.memory_type.map(MemoryTypeArg::into_memory_type),
            status: self.status.map(StatusArg::into_status),
            trigger_type: self.trigger_type.map(TriggerTypeArg::into_trigger_type),
            trigger_date,
            tags,
            severity: self.severity.map(SeverityArg::into_severity),
        })
    }
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 UTC timestamp: {value}"))?;

    if parsed.offset() != time::UtcOffset::UTC {
        return Err(anyhow!("timestamp MUST use UTC offset Z (received: {value})"));
    }

    Ok(parsed)
}

fn parse_memory_id(value: &str) -> Result<MemoryId> {
    let parsed = Ulid::from_string(value).with_context(|| format!("invalid ULID: {value}"))?;
    Ok(MemoryId(parsed))
}

impl MemoryTypeArg {
    fn into_memory_type(self) -> MemoryType {
        match self {
            Self::Future => MemoryType::Future,
            Self::Decision => MemoryType::Decision,
            Self::Failure => MemoryType::Failure,
            Self::Context => MemoryType::Context,
        }
    }
}

impl StatusArg {
    fn into_status(self) -> MemoryStatus {
        match self {
            Self::Active => MemoryStatus::Active,
            Self::Scheduled => MemoryStatus::Scheduled,
            Self::Triggered => MemoryStatus::Triggered,
            Self::Archived => MemoryStatus::Archived,
        }
    }
}

impl TriggerTypeArg {
    fn into_trigger_type(self) -> TriggerType {
        match self {
            Self::None => TriggerType::None,
            Self::Date => TriggerType::Date,
            Self::Event => TriggerType::Event,
        }
    }
}

impl SeverityArg {
    fn into_severity(self) -> Severity {
        match self {
            Self::Low => Severity::Low,
            Self::Medium => Severity::Medium,
            Self::High => Severity::High,
            Self::Critical => Severity::Critical,
        }
    }
}
