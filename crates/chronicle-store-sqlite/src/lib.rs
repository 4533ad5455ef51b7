use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use chronicle_core::{
    apply_patch, Analysis, AnalyticsEvent, AuditAction, AuditEntry, ChronicleError, CounterFamily,
    EmbeddingId, Memory, MemoryId, MemoryPatch, MemoryStats, MemoryStatus, MemoryType,
    Notification, PatchOutcome, ScheduleDirective, ScheduleRecord, Severity, TriggerType,
    ANALYTICS_SOURCE,
};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::{Date, OffsetDateTime};
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS memories (
  memory_id TEXT PRIMARY KEY,
  title TEXT NOT NULL,
  description TEXT NOT NULL,
  memory_type TEXT NOT NULL CHECK (memory_type IN ('future', 'decision', 'failure', 'context')),
  status TEXT NOT NULL CHECK (status IN ('active', 'scheduled', 'triggered', 'archived')),
  trigger_type TEXT NOT NULL CHECK (trigger_type IN ('none', 'date', 'event')),
  trigger_date TEXT,
  team_id TEXT NOT NULL,
  tags TEXT NOT NULL,
  severity TEXT CHECK (severity IN ('low', 'medium', 'high', 'critical')),
  ai_summary TEXT,
  ai_category TEXT,
  root_cause TEXT,
  key_lessons TEXT,
  embedding_id TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  triggered_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_memories_status ON memories(status);
CREATE INDEX IF NOT EXISTS idx_memories_team ON memories(team_id);
CREATE INDEX IF NOT EXISTS idx_memories_created_at ON memories(created_at);

CREATE TABLE IF NOT EXISTS memory_schedules (
  memory_id TEXT PRIMARY KEY,
  scheduled_for TEXT NOT NULL,
  scheduled_at TEXT NOT NULL,
  delay_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_schedules_scheduled_for ON memory_schedules(scheduled_for);

CREATE TABLE IF NOT EXISTS analysis_history (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  memory_id TEXT NOT NULL,
  analysis TEXT NOT NULL,
  analyzed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_analysis_history_memory ON analysis_history(memory_id);

CREATE TABLE IF NOT EXISTS reanalysis_history (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  memory_id TEXT NOT NULL,
  reanalysis TEXT NOT NULL,
  reactivated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_reanalysis_history_memory ON reanalysis_history(memory_id);

CREATE TABLE IF NOT EXISTS notification_history (
  memory_id TEXT NOT NULL,
  occurrence TEXT NOT NULL,
  notification TEXT NOT NULL,
  sent_at TEXT NOT NULL,
  PRIMARY KEY (memory_id, occurrence)
);

CREATE TABLE IF NOT EXISTS audit_log (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  memory_id TEXT NOT NULL,
  action TEXT NOT NULL CHECK (action IN ('update', 'delete')),
  details TEXT NOT NULL,
  timestamp TEXT NOT NULL,
  recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_log_memory ON audit_log(memory_id);

CREATE TABLE IF NOT EXISTS analytics_events (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  event TEXT NOT NULL,
  memory_id TEXT,
  payload TEXT NOT NULL,
  tracked_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_analytics_events_event ON analytics_events(event);

CREATE TABLE IF NOT EXISTS daily_counters (
  family TEXT NOT NULL CHECK (family IN ('analytics', 'updates', 'deletions', 'notifications')),
  day TEXT NOT NULL,
  name TEXT NOT NULL,
  count INTEGER NOT NULL DEFAULT 0,
  PRIMARY KEY (family, day, name)
);

CREATE TABLE IF NOT EXISTS embeddings (
  embedding_id TEXT PRIMARY KEY,
  memory_id TEXT NOT NULL,
  team_id TEXT NOT NULL,
  vector TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_embeddings_memory ON embeddings(memory_id);
";

const MEMORY_COLUMNS: &str = "memory_id, title, description, memory_type, status, trigger_type, \
     trigger_date, team_id, tags, severity, ai_summary, ai_category, root_cause, key_lessons, \
     embedding_id, created_at, updated_at, triggered_at";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ImportSummary {
    pub imported_memories: usize,
    pub skipped_existing_memories: usize,
    pub imported_schedules: usize,
    pub skipped_existing_schedules: usize,
    pub imported_audit_entries: usize,
    pub skipped_existing_audit_entries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

/// Result of applying a patch through the store. Domain rejections are data,
/// not storage errors; the `Result` channel is reserved for the database.
#[derive(Debug)]
pub enum UpdateOutcome {
    Missing,
    Rejected(ChronicleError),
    Applied(Box<PatchOutcome>),
}

/// Result of the compare-and-set firing transition.
#[derive(Debug)]
pub enum FireOutcome {
    /// The memory was `scheduled` and is now `triggered`.
    Fired(Box<Memory>),
    /// The memory exists but was not `scheduled`; its stale schedule row, if
    /// any, has been removed.
    Refused { status: MemoryStatus },
    Missing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRecord {
    pub analysis: Analysis,
    pub analyzed_at: OffsetDateTime,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReanalysisRecord {
    pub reanalysis: String,
    pub reactivated_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotificationRecord {
    pub notification: Notification,
    pub sent_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredEmbedding {
    pub embedding_id: EmbeddingId,
    pub memory_id: MemoryId,
    pub team_id: String,
    pub vector: Vec<f32>,
}

struct MemoryRow {
    memory_id: String,
    title: String,
    description: String,
    memory_type: String,
    status: String,
    trigger_type: String,
    trigger_date: Option<String>,
    team_id: String,
    tags: String,
    severity: Option<String>,
    ai_summary: Option<String>,
    ai_category: Option<String>,
    root_cause: Option<String>,
    key_lessons: Option<String>,
    embedding_id: Option<String>,
    created_at: String,
    updated_at: String,
    triggered_at: Option<String>,
}

impl SqliteStore {
    /// Open a SQLite-backed chronicle store and configure runtime pragmas.
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

        Ok(Self { conn })
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

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version == 0 {
            self.conn
                .execute_batch(MIGRATION_001_SQL)
                .context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            return Ok(());
        }
        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }
        Ok(())
    }

    /// Insert a freshly created memory.
    ///
    /// # Errors
    /// Returns an error when the row cannot be written, including duplicate ids.
    pub fn insert_memory(&mut self, memory: &Memory) -> Result<()> {
        write_memory_row(
            &self.conn,
            "INSERT INTO memories(memory_id, title, description, memory_type, status, \
             trigger_type, trigger_date, team_id, tags, severity, ai_summary, ai_category, \
             root_cause, key_lessons, embedding_id, created_at, updated_at, triggered_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            memory,
        )
        .with_context(|| format!("failed to insert memory {}", memory.id))?;
        Ok(())
    }

    /// Load a single memory by id.
    ///
    /// # Errors
    /// Returns an error when the query fails or the stored row cannot be decoded.
    pub fn get_memory(&self, id: MemoryId) -> Result<Option<Memory>> {
        load_memory(&self.conn, id)
    }

    /// List memories, newest first, optionally filtered by status and team.
    ///
    /// # Errors
    /// Returns an error when the query fails or a stored row cannot be decoded.
    pub fn list_memories(
        &self,
        status: Option<MemoryStatus>,
        team_id: Option<&str>,
    ) -> Result<Vec<Memory>> {
        let mut sql = format!("SELECT {MEMORY_COLUMNS} FROM memories");
        let mut clauses = Vec::new();
        let mut args = Vec::new();
        if let Some(status) = status {
            clauses.push("status = ?");
            args.push(status.as_str().to_string());
        }
        if let Some(team_id) = team_id {
            clauses.push("team_id = ?");
            args.push(team_id.to_string());
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC, memory_id DESC");

        let mut stmt = self.conn.prepare(&sql).context("failed to prepare memory listing")?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), memory_row)
            .context("failed to list memories")?;

        let mut memories = Vec::new();
        for row in rows {
            memories.push(memory_from_row(row?)?);
        }
        Ok(memories)
    }

    /// Apply a patch to a memory and reconcile its schedule row in the same
    /// transaction.
    ///
    /// # Errors
    /// Returns an error for storage failures only; validation rejections come
    /// back as `UpdateOutcome::Rejected`.
    pub fn update_memory(
        &mut self,
        id: MemoryId,
        patch: &MemoryPatch,
        now: OffsetDateTime,
    ) -> Result<UpdateOutcome> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin update transaction")?;

        let Some(current) = load_memory(&tx, id)? else {
            return Ok(UpdateOutcome::Missing);
        };
        let outcome = match apply_patch(&current, patch, now) {
            Ok(outcome) => outcome,
            Err(err) => return Ok(UpdateOutcome::Rejected(err)),
        };

        store_memory_update(&tx, &outcome.memory)?;
        match outcome.schedule {
            ScheduleDirective::Keep => {}
            ScheduleDirective::Cancel => {
                tx.execute(
                    "DELETE FROM memory_schedules WHERE memory_id = ?1",
                    params![id.to_string()],
                )
                .context("failed to cancel schedule")?;
            }
            ScheduleDirective::Replace => {
                let Some(scheduled_for) = outcome.memory.trigger_date else {
                    return Err(anyhow!("schedule replacement without a trigger date"));
                };
                let millis = (scheduled_for - now).whole_milliseconds();
                let delay_ms = i64::try_from(millis).unwrap_or(if millis < 0 {
                    i64::MIN
                } else {
                    i64::MAX
                });
                upsert_schedule(
                    &tx,
                    &ScheduleRecord {
                        memory_id: id,
                        scheduled_for,
                        scheduled_at: now,
                        delay_ms,
                    },
                )?;
            }
        }
        tx.commit().context("failed to commit update transaction")?;
        Ok(UpdateOutcome::Applied(Box::new(outcome)))
    }

    /// Atomically move a `scheduled` memory to `triggered`, stamping
    /// `triggered_at` and removing its schedule row. Concurrent callers see
    /// exactly one `Fired`.
    ///
    /// # Errors
    /// Returns an error when the transaction cannot run.
    pub fn fire_memory(&mut self, id: MemoryId, now: OffsetDateTime) -> Result<FireOutcome> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin fire transaction")?;

        let stamp = rfc3339(now)?;
        let changed = tx
            .execute(
                "UPDATE memories SET status = 'triggered', triggered_at = ?2, updated_at = ?2 \
                 WHERE memory_id = ?1 AND status = 'scheduled'",
                params![id.to_string(), stamp],
            )
            .context("failed to fire memory")?;
        tx.execute(
            "DELETE FROM memory_schedules WHERE memory_id = ?1",
            params![id.to_string()],
        )
        .context("failed to clear schedule after firing")?;

        if changed == 1 {
            let Some(memory) = load_memory(&tx, id)? else {
                return Err(anyhow!("fired memory vanished mid-transaction: {id}"));
            };
            tx.commit().context("failed to commit fire transaction")?;
            return Ok(FireOutcome::Fired(Box::new(memory)));
        }

        let status = tx
            .query_row(
                "SELECT status FROM memories WHERE memory_id = ?1",
                params![id.to_string()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("failed to read status of unfired memory")?;
        // Commit anyway so a stale schedule row is still cleaned up.
        tx.commit().context("failed to commit fire transaction")?;
        match status {
            Some(raw) => {
                let status = MemoryStatus::parse(&raw)
                    .ok_or_else(|| anyhow!("invalid memory status: {raw}"))?;
                Ok(FireOutcome::Refused { status })
            }
            None => Ok(FireOutcome::Missing),
        }
    }

    /// Delete a memory and its schedule row, returning the prior state.
    ///
    /// # Errors
    /// Returns an error when the transaction cannot run.
    pub fn delete_memory(&mut self, id: MemoryId) -> Result<Option<Memory>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin delete transaction")?;
        let Some(memory) = load_memory(&tx, id)? else {
            return Ok(None);
        };
        tx.execute(
            "DELETE FROM memories WHERE memory_id = ?1",
            params![id.to_string()],
        )
        .context("failed to delete memory")?;
        tx.execute(
            "DELETE FROM memory_schedules WHERE memory_id = ?1",
            params![id.to_string()],
        )
        .context("failed to delete schedule")?;
        tx.commit().context("failed to commit delete transaction")?;
        Ok(Some(memory))
    }

    /// Lifecycle and type counts, optionally restricted to one team.
    ///
    /// # Errors
    /// Returns an error when the listing query fails.
    pub fn stats(&self, team_id: Option<&str>) -> Result<MemoryStats> {
        let memories = self.list_memories(None, team_id)?;
        Ok(MemoryStats::tally(&memories))
    }

    /// Write analysis output onto the memory and append it to the analysis
    /// history in one transaction. Returns false when the memory is gone.
    ///
    /// # Errors
    /// Returns an error when the transaction cannot run.
    pub fn record_analysis(
        &mut self,
        id: MemoryId,
        analysis: &Analysis,
        now: OffsetDateTime,
    ) -> Result<bool> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin analysis transaction")?;
        let lessons = serde_json::to_string(&analysis.lessons)
            .context("failed to serialize analysis lessons")?;
        let changed = tx
            .execute(
                "UPDATE memories SET ai_summary = ?2, ai_category = ?3, root_cause = ?4, \
                 key_lessons = ?5, updated_at = ?6 WHERE memory_id = ?1",
                params![
                    id.to_string(),
                    analysis.summary,
                    analysis.category,
                    analysis.root_cause,
                    lessons,
                    rfc3339(now)?
                ],
            )
            .context("failed to write analysis onto memory")?;
        if changed == 0 {
            return Ok(false);
        }
        let payload =
            serde_json::to_string(analysis).context("failed to serialize analysis")?;
        tx.execute(
            "INSERT INTO analysis_history(memory_id, analysis, analyzed_at) VALUES (?1, ?2, ?3)",
            params![id.to_string(), payload, rfc3339(now)?],
        )
        .context("failed to append analysis history")?;
        tx.commit().context("failed to commit analysis transaction")?;
        Ok(true)
    }

    /// Analysis history for a memory, oldest first.
    ///
    /// # Errors
    /// Returns an error when the query fails or a row cannot be decoded.
    pub fn analysis_history(&self, id: MemoryId) -> Result<Vec<AnalysisRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT analysis, analyzed_at FROM analysis_history \
                 WHERE memory_id = ?1 ORDER BY id ASC",
            )
            .context("failed to prepare analysis history query")?;
        let rows = stmt
            .query_map(params![id.to_string()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .context("failed to read analysis history")?;
        let mut records = Vec::new();
        for row in rows {
            let (payload, analyzed_at) = row?;
            records.push(AnalysisRecord {
                analysis: serde_json::from_str(&payload)
                    .context("failed to parse stored analysis")?,
                analyzed_at: parse_rfc3339(&analyzed_at)?,
            });
        }
        Ok(records)
    }

    /// Stamp the embedding id onto the memory. Returns false when the memory
    /// is gone.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn record_embedding(
        &mut self,
        id: MemoryId,
        embedding_id: &EmbeddingId,
        now: OffsetDateTime,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE memories SET embedding_id = ?2, updated_at = ?3 WHERE memory_id = ?1",
                params![id.to_string(), embedding_id.0, rfc3339(now)?],
            )
            .context("failed to record embedding id")?;
        Ok(changed == 1)
    }

    /// Append a reanalysis produced when the memory fired.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn append_reanalysis(
        &mut self,
        id: MemoryId,
        reanalysis: &str,
        reactivated_at: OffsetDateTime,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO reanalysis_history(memory_id, reanalysis, reactivated_at) \
                 VALUES (?1, ?2, ?3)",
                params![id.to_string(), reanalysis, rfc3339(reactivated_at)?],
            )
            .context("failed to append reanalysis")?;
        Ok(())
    }

    /// Reanalysis history for a memory, oldest first.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn reanalysis_history(&self, id: MemoryId) -> Result<Vec<ReanalysisRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT reanalysis, reactivated_at FROM reanalysis_history \
                 WHERE memory_id = ?1 ORDER BY id ASC",
            )
            .context("failed to prepare reanalysis history query")?;
        let rows = stmt
            .query_map(params![id.to_string()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .context("failed to read reanalysis history")?;
        let mut records = Vec::new();
        for row in rows {
            let (reanalysis, reactivated_at) = row?;
            records.push(ReanalysisRecord {
                reanalysis,
                reactivated_at: parse_rfc3339(&reactivated_at)?,
            });
        }
        Ok(records)
    }

    /// Claim the notification slot for one firing occurrence. Returns false
    /// when another worker already holds or delivered it, making delivery
    /// effectively once per occurrence under at-least-once events.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn claim_notification(
        &mut self,
        id: MemoryId,
        occurrence: OffsetDateTime,
        notification: &Notification,
        now: OffsetDateTime,
    ) -> Result<bool> {
        let payload =
            serde_json::to_string(notification).context("failed to serialize notification")?;
        let changed = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO notification_history(memory_id, occurrence, notification, sent_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![id.to_string(), rfc3339(occurrence)?, payload, rfc3339(now)?],
            )
            .context("failed to claim notification")?;
        Ok(changed == 1)
    }

    /// Give the notification slot back after a failed delivery so a retry or
    /// redelivered event can claim it again.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn release_notification(&mut self, id: MemoryId, occurrence: OffsetDateTime) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM notification_history WHERE memory_id = ?1 AND occurrence = ?2",
                params![id.to_string(), rfc3339(occurrence)?],
            )
            .context("failed to release notification")?;
        Ok(())
    }

    /// Notification history for a memory, oldest occurrence first.
    ///
    /// # Errors
    /// Returns an error when the query fails or a row cannot be decoded.
    pub fn notification_history(&self, id: MemoryId) -> Result<Vec<NotificationRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT notification, sent_at FROM notification_history \
                 WHERE memory_id = ?1 ORDER BY occurrence ASC",
            )
            .context("failed to prepare notification history query")?;
        let rows = stmt
            .query_map(params![id.to_string()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .context("failed to read notification history")?;
        let mut records = Vec::new();
        for row in rows {
            let (payload, sent_at) = row?;
            records.push(NotificationRecord {
                notification: serde_json::from_str(&payload)
                    .context("failed to parse stored notification")?,
                sent_at: parse_rfc3339(&sent_at)?,
            });
        }
        Ok(records)
    }

    /// Persist a schedule record, replacing any previous one for the memory.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn put_schedule(&mut self, record: &ScheduleRecord) -> Result<()> {
        upsert_schedule(&self.conn, record)
    }

    /// Remove the schedule row for a memory. Returns false when none existed.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn delete_schedule(&mut self, id: MemoryId) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "DELETE FROM memory_schedules WHERE memory_id = ?1",
                params![id.to_string()],
            )
            .context("failed to delete schedule")?;
        Ok(changed == 1)
    }

    /// Schedule row for one memory, if any.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn get_schedule(&self, id: MemoryId) -> Result<Option<ScheduleRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT memory_id, scheduled_for, scheduled_at, delay_ms FROM memory_schedules \
                 WHERE memory_id = ?1",
                params![id.to_string()],
                schedule_row,
            )
            .optional()
            .context("failed to read schedule")?;
        row.map(schedule_from_row).transpose()
    }

    /// The earliest pending schedule, the scheduler's next wake-up.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn next_schedule(&self) -> Result<Option<ScheduleRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT memory_id, scheduled_for, scheduled_at, delay_ms FROM memory_schedules \
                 ORDER BY scheduled_for ASC, memory_id ASC LIMIT 1",
                [],
                schedule_row,
            )
            .optional()
            .context("failed to read next schedule")?;
        row.map(schedule_from_row).transpose()
    }

    /// All schedules due at or before `now`, earliest first.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn due_schedules(&self, now: OffsetDateTime) -> Result<Vec<ScheduleRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT memory_id, scheduled_for, scheduled_at, delay_ms FROM memory_schedules \
                 WHERE scheduled_for <= ?1 ORDER BY scheduled_for ASC, memory_id ASC",
            )
            .context("failed to prepare due schedule query")?;
        let rows = stmt
            .query_map(params![rfc3339(now)?], schedule_row)
            .context("failed to read due schedules")?;
        let mut records = Vec::new();
        for row in rows {
            records.push(schedule_from_row(row?)?);
        }
        Ok(records)
    }

    /// Every pending schedule, earliest first.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn pending_schedules(&self) -> Result<Vec<ScheduleRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT memory_id, scheduled_for, scheduled_at, delay_ms FROM memory_schedules \
                 ORDER BY scheduled_for ASC, memory_id ASC",
            )
            .context("failed to prepare pending schedule query")?;
        let rows = stmt.query_map([], schedule_row).context("failed to read pending schedules")?;
        let mut records = Vec::new();
        for row in rows {
            records.push(schedule_from_row(row?)?);
        }
        Ok(records)
    }

    /// Scheduled memories that lost their schedule row, for example when a
    /// crash landed between the memory write and the schedule write. The
    /// catch-up sweep re-plans these.
    ///
    /// # Errors
    /// Returns an error when the query fails or a row cannot be decoded.
    pub fn unscheduled_pending(&self) -> Result<Vec<Memory>> {
        let sql = format!(
            "SELECT {MEMORY_COLUMNS} FROM memories \
             WHERE status = 'scheduled' AND memory_id NOT IN \
             (SELECT memory_id FROM memory_schedules) \
             ORDER BY memory_id ASC"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("failed to prepare unscheduled pending query")?;
        let rows = stmt.query_map([], memory_row).context("failed to read unscheduled pending")?;
        let mut memories = Vec::new();
        for row in rows {
            memories.push(memory_from_row(row?)?);
        }
        Ok(memories)
    }

    /// Append an audit entry. The audit log has no foreign key into memories
    /// so entries survive the deletion they describe.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn append_audit(&mut self, entry: &AuditEntry) -> Result<()> {
        let details =
            serde_json::to_string(&entry.details).context("failed to serialize audit details")?;
        self.conn
            .execute(
                "INSERT INTO audit_log(memory_id, action, details, timestamp, recorded_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    entry.memory_id.to_string(),
                    entry.action.as_str(),
                    details,
                    rfc3339(entry.timestamp)?,
                    rfc3339(entry.recorded_at)?
                ],
            )
            .context("failed to append audit entry")?;
        Ok(())
    }

    /// Audit entries in insertion order, optionally for one memory.
    ///
    /// # Errors
    /// Returns an error when the query fails or a row cannot be decoded.
    pub fn audit_entries(&self, id: Option<MemoryId>) -> Result<Vec<AuditEntry>> {
        let mut sql = String::from(
            "SELECT memory_id, action, details, timestamp, recorded_at FROM audit_log",
        );
        let mut args = Vec::new();
        if let Some(id) = id {
            sql.push_str(" WHERE memory_id = ?");
            args.push(id.to_string());
        }
        sql.push_str(" ORDER BY id ASC");

        let mut stmt = self.conn.prepare(&sql).context("failed to prepare audit query")?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .context("failed to read audit entries")?;

        let mut entries = Vec::new();
        for row in rows {
            let (memory_id, action, details, timestamp, recorded_at) = row?;
            entries.push(AuditEntry {
                memory_id: parse_memory_id(&memory_id)?,
                action: AuditAction::parse(&action)
                    .ok_or_else(|| anyhow!("invalid audit action: {action}"))?,
                details: serde_json::from_str(&details)
                    .context("failed to parse audit details")?,
                timestamp: parse_rfc3339(&timestamp)?,
                recorded_at: parse_rfc3339(&recorded_at)?,
            });
        }
        Ok(entries)
    }

    /// Record a raw analytics event, stamping `trackedAt` and the emitting
    /// source onto the stored payload.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn record_analytics_event(
        &mut self,
        event: &AnalyticsEvent,
        now: OffsetDateTime,
    ) -> Result<()> {
        let mut payload =
            serde_json::to_value(event).context("failed to serialize analytics event")?;
        if let serde_json::Value::Object(map) = &mut payload {
            map.insert(
                "trackedAt".to_string(),
                serde_json::Value::String(rfc3339(now)?),
            );
            map.insert(
                "source".to_string(),
                serde_json::Value::String(ANALYTICS_SOURCE.to_string()),
            );
        }
        let payload =
            serde_json::to_string(&payload).context("failed to serialize analytics payload")?;
        self.conn
            .execute(
                "INSERT INTO analytics_events(event, memory_id, payload, tracked_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    event.event,
                    event.memory_id.map(|id| id.to_string()),
                    payload,
                    rfc3339(now)?
                ],
            )
            .context("failed to record analytics event")?;
        Ok(())
    }

    /// Stored analytics payloads in insertion order, optionally filtered by
    /// event name.
    ///
    /// # Errors
    /// Returns an error when the query fails or a payload cannot be parsed.
    pub fn analytics_events(&self, event: Option<&str>) -> Result<Vec<serde_json::Value>> {
        let mut sql = String::from("SELECT payload FROM analytics_events");
        let mut args = Vec::new();
        if let Some(event) = event {
            sql.push_str(" WHERE event = ?");
            args.push(event.to_string());
        }
        sql.push_str(" ORDER BY id ASC");

        let mut stmt = self.conn.prepare(&sql).context("failed to prepare analytics query")?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), |row| {
                row.get::<_, String>(0)
            })
            .context("failed to read analytics events")?;
        let mut payloads = Vec::new();
        for row in rows {
            payloads.push(
                serde_json::from_str(&row?).context("failed to parse analytics payload")?,
            );
        }
        Ok(payloads)
    }

    /// Atomically bump one daily counter. Concurrent increments never lose
    /// updates; the upsert adds to the stored count in place.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn increment_counter(
        &mut self,
        family: CounterFamily,
        day: Date,
        name: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO daily_counters(family, day, name, count) VALUES (?1, ?2, ?3, 1) \
                 ON CONFLICT(family, day, name) DO UPDATE SET count = count + 1",
                params![family.as_str(), day_string(day), name],
            )
            .context("failed to increment counter")?;
        Ok(())
    }

    /// One family's counters for a day, with the family baseline reported as
    /// zero when nothing has been counted yet.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn counters_for(&self, family: CounterFamily, day: Date) -> Result<BTreeMap<String, i64>> {
        let mut counters = BTreeMap::new();
        for name in family.baseline() {
            counters.insert((*name).to_string(), 0);
        }
        let mut stmt = self
            .conn
            .prepare("SELECT name, count FROM daily_counters WHERE family = ?1 AND day = ?2")
            .context("failed to prepare counter query")?;
        let rows = stmt
            .query_map(params![family.as_str(), day_string(day)], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .context("failed to read counters")?;
        for row in rows {
            let (name, count) = row?;
            counters.insert(name, count);
        }
        Ok(counters)
    }

    /// Store or refresh an embedding vector for a memory.
    ///
    /// # Errors
    /// Returns an error when serialization or the write fails.
    pub fn upsert_embedding(
        &mut self,
        embedding_id: &EmbeddingId,
        memory_id: MemoryId,
        team_id: &str,
        vector: &[f32],
        now: OffsetDateTime,
    ) -> Result<()> {
        let encoded = serde_json::to_string(vector).context("failed to serialize vector")?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO embeddings(embedding_id, memory_id, team_id, vector, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    embedding_id.0,
                    memory_id.to_string(),
                    team_id,
                    encoded,
                    rfc3339(now)?
                ],
            )
            .context("failed to upsert embedding")?;
        Ok(())
    }

    /// Every stored embedding; the similarity search scans these.
    ///
    /// # Errors
    /// Returns an error when the query fails or a vector cannot be decoded.
    pub fn embeddings_all(&self) -> Result<Vec<StoredEmbedding>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT embedding_id, memory_id, team_id, vector FROM embeddings \
                 ORDER BY embedding_id ASC",
            )
            .context("failed to prepare embedding query")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .context("failed to read embeddings")?;
        let mut embeddings = Vec::new();
        for row in rows {
            let (embedding_id, memory_id, team_id, vector) = row?;
            embeddings.push(StoredEmbedding {
                embedding_id: EmbeddingId(embedding_id),
                memory_id: parse_memory_id(&memory_id)?,
                team_id,
                vector: serde_json::from_str(&vector)
                    .context("failed to parse stored vector")?,
            });
        }
        Ok(embeddings)
    }

    /// Drop all embeddings for a memory. Returns how many rows went away.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn delete_embeddings_for(&mut self, id: MemoryId) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM embeddings WHERE memory_id = ?1",
                params![id.to_string()],
            )
            .context("failed to delete embeddings")
    }

    /// Drop the notification history for a memory.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn delete_notification_history(&mut self, id: MemoryId) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM notification_history WHERE memory_id = ?1",
                params![id.to_string()],
            )
            .context("failed to delete notification history")
    }

    /// Drop the analysis history for a memory.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn delete_analysis_history(&mut self, id: MemoryId) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM analysis_history WHERE memory_id = ?1",
                params![id.to_string()],
            )
            .context("failed to delete analysis history")
    }

    /// Drop the reanalysis history for a memory.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn delete_reanalysis_history(&mut self, id: MemoryId) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM reanalysis_history WHERE memory_id = ?1",
                params![id.to_string()],
            )
            .context("failed to delete reanalysis history")
    }

    /// Export memories, schedules and the audit log as NDJSON files plus a
    /// digest manifest.
    ///
    /// # Errors
    /// Returns an error when listing, serialization, or file writes fail.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let memories = self.list_memories(None, None)?;
        let schedules = self.pending_schedules()?;
        let audit = self.audit_entries(None)?;

        let memories_path = out_dir.join("memories.ndjson");
        let memory_digest = write_ndjson_file(&memories_path, &memories)?;

        let schedules_path = out_dir.join("schedules.ndjson");
        let schedule_digest = write_ndjson_file(&schedules_path, &schedules)?;

        let audit_path = out_dir.join("audit_log.ndjson");
        let audit_digest = write_ndjson_file(&audit_path, &audit)?;

        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            exported_at: now_rfc3339()?,
            files: vec![
                ExportFileDigest {
                    path: "memories.ndjson".to_string(),
                    sha256: memory_digest.0,
                    records: memory_digest.1,
                },
                ExportFileDigest {
                    path: "schedules.ndjson".to_string(),
                    sha256: schedule_digest.0,
                    records: schedule_digest.1,
                },
                ExportFileDigest {
                    path: "audit_log.ndjson".to_string(),
                    sha256: audit_digest.0,
                    records: audit_digest.1,
                },
            ],
        };

        let manifest_path = out_dir.join("manifest.json");
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        Ok(manifest)
    }

    /// Import an exported snapshot directory into this database.
    ///
    /// # Errors
    /// Returns an error when migration, manifest validation, parsing,
    /// duplicate handling, or writes fail.
    pub fn import_snapshot(&mut self, in_dir: &Path, skip_existing: bool) -> Result<ImportSummary> {
        self.migrate()?;
        let manifest_path = in_dir.join("manifest.json");
        let manifest = read_export_manifest(&manifest_path)?;
        validate_import_manifest(in_dir, &manifest)?;

        let mut summary = ImportSummary::default();

        for memory in read_ndjson_file::<Memory>(&in_dir.join("memories.ndjson"))? {
            if self.memory_exists(memory.id)? {
                if skip_existing {
                    summary.skipped_existing_memories += 1;
                    continue;
                }
                return Err(anyhow!("memory already exists: {}", memory.id));
            }
            self.insert_memory(&memory)?;
            summary.imported_memories += 1;
        }

        for schedule in read_ndjson_file::<ScheduleRecord>(&in_dir.join("schedules.ndjson"))? {
            if self.schedule_exists(schedule.memory_id)? {
                if skip_existing {
                    summary.skipped_existing_schedules += 1;
                    continue;
                }
                return Err(anyhow!(
                    "schedule already exists for memory {}",
                    schedule.memory_id
                ));
            }
            self.put_schedule(&schedule)?;
            summary.imported_schedules += 1;
        }

        for entry in read_ndjson_file::<AuditEntry>(&in_dir.join("audit_log.ndjson"))? {
            if self.audit_exists(&entry)? {
                if skip_existing {
                    summary.skipped_existing_audit_entries += 1;
                    continue;
                }
                return Err(anyhow!(
                    "audit entry already exists for memory {} at {}",
                    entry.memory_id,
                    entry.recorded_at
                ));
            }
            self.append_audit(&entry)?;
            summary.imported_audit_entries += 1;
        }

        Ok(summary)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!(
                    "failed to create parent directory for backup file {}",
                    out_file.display()
                )
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
            .restore(
                DatabaseName::Main,
                in_file,
                None::<fn(rusqlite::backup::Progress)>,
            )
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

    fn memory_exists(&self, id: MemoryId) -> Result<bool> {
        let exists = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM memories WHERE memory_id = ?1)",
                params![id.to_string()],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to check memory existence")?;
        Ok(exists == 1)
    }

    fn schedule_exists(&self, id: MemoryId) -> Result<bool> {
        let exists = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM memory_schedules WHERE memory_id = ?1)",
                params![id.to_string()],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to check schedule existence")?;
        Ok(exists == 1)
    }

    fn audit_exists(&self, entry: &AuditEntry) -> Result<bool> {
        let exists = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM audit_log \
                 WHERE memory_id = ?1 AND action = ?2 AND recorded_at = ?3)",
                params![
                    entry.memory_id.to_string(),
                    entry.action.as_str(),
                    rfc3339(entry.recorded_at)?
                ],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to check audit entry existence")?;
        Ok(exists == 1)
    }
}

fn load_memory(conn: &Connection, id: MemoryId) -> Result<Option<Memory>> {
    let sql = format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE memory_id = ?1");
    let row = conn
        .query_row(&sql, params![id.to_string()], memory_row)
        .optional()
        .with_context(|| format!("failed to load memory {id}"))?;
    row.map(memory_from_row).transpose()
}

fn store_memory_update(conn: &Connection, memory: &Memory) -> Result<()> {
    let changed = write_memory_row(
        conn,
        "UPDATE memories SET title = ?2, description = ?3, memory_type = ?4, status = ?5, \
         trigger_type = ?6, trigger_date = ?7, team_id = ?8, tags = ?9, severity = ?10, \
         ai_summary = ?11, ai_category = ?12, root_cause = ?13, key_lessons = ?14, \
         embedding_id = ?15, created_at = ?16, updated_at = ?17, triggered_at = ?18 \
         WHERE memory_id = ?1",
        memory,
    )
    .with_context(|| format!("failed to update memory {}", memory.id))?;
    if changed != 1 {
        return Err(anyhow!("memory disappeared during update: {}", memory.id));
    }
    Ok(())
}

// Both the insert and the update bind columns in the same ?1..?18 order.
fn write_memory_row(conn: &Connection, sql: &str, memory: &Memory) -> Result<usize> {
    let tags = serde_json::to_string(&memory.tags).context("failed to serialize tags")?;
    let key_lessons = memory
        .key_lessons
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .context("failed to serialize key lessons")?;
    let trigger_date = memory.trigger_date.map(rfc3339).transpose()?;
    let triggered_at = memory.triggered_at.map(rfc3339).transpose()?;
    let changed = conn.execute(
        sql,
        params![
            memory.id.to_string(),
            memory.title,
            memory.description,
            memory.memory_type.as_str(),
            memory.status.as_str(),
            memory.trigger_type.as_str(),
            trigger_date,
            memory.team_id,
            tags,
            memory.severity.map(Severity::as_str),
            memory.ai_summary,
            memory.ai_category,
            memory.root_cause,
            key_lessons,
            memory.embedding_id.as_ref().map(|id| id.0.clone()),
            rfc3339(memory.created_at)?,
            rfc3339(memory.updated_at)?,
            triggered_at,
        ],
    )?;
    Ok(changed)
}

fn memory_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryRow> {
    Ok(MemoryRow {
        memory_id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        memory_type: row.get(3)?,
        status: row.get(4)?,
        trigger_type: row.get(5)?,
        trigger_date: row.get(6)?,
        team_id: row.get(7)?,
        tags: row.get(8)?,
        severity: row.get(9)?,
        ai_summary: row.get(10)?,
        ai_category: row.get(11)?,
        root_cause: row.get(12)?,
        key_lessons: row.get(13)?,
        embedding_id: row.get(14)?,
        created_at: row.get(15)?,
        updated_at: row.get(16)?,
        triggered_at: row.get(17)?,
    })
}

fn memory_from_row(row: MemoryRow) -> Result<Memory> {
    Ok(Memory {
        id: parse_memory_id(&row.memory_id)?,
        title: row.title,
        description: row.description,
        memory_type: MemoryType::parse(&row.memory_type)
            .ok_or_else(|| anyhow!("invalid memory type: {}", row.memory_type))?,
        status: MemoryStatus::parse(&row.status)
            .ok_or_else(|| anyhow!("invalid memory status: {}", row.status))?,
        trigger_type: TriggerType::parse(&row.trigger_type)
            .ok_or_else(|| anyhow!("invalid trigger type: {}", row.trigger_type))?,
        trigger_date: row.trigger_date.as_deref().map(parse_rfc3339).transpose()?,
        team_id: row.team_id,
        tags: serde_json::from_str(&row.tags).context("failed to parse stored tags")?,
        severity: row
            .severity
            .as_deref()
            .map(|raw| {
                Severity::parse(raw).ok_or_else(|| anyhow!("invalid severity: {raw}"))
            })
            .transpose()?,
        ai_summary: row.ai_summary,
        ai_category: row.ai_category,
        root_cause: row.root_cause,
        key_lessons: row
            .key_lessons
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("failed to parse stored key lessons")?,
        embedding_id: row.embedding_id.map(EmbeddingId),
        created_at: parse_rfc3339(&row.created_at)?,
        updated_at: parse_rfc3339(&row.updated_at)?,
        triggered_at: row.triggered_at.as_deref().map(parse_rfc3339).transpose()?,
    })
}

fn upsert_schedule(conn: &Connection, record: &ScheduleRecord) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO memory_schedules(memory_id, scheduled_for, scheduled_at, delay_ms) \
         VALUES (?1, ?2, ?3, ?4)",
        params![
            record.memory_id.to_string(),
            rfc3339(record.scheduled_for)?,
            rfc3339(record.scheduled_at)?,
            record.delay_ms
        ],
    )
    .with_context(|| format!("failed to persist schedule for {}", record.memory_id))?;
    Ok(())
}

type ScheduleRow = (String, String, String, i64);

fn schedule_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduleRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn schedule_from_row(row: ScheduleRow) -> Result<ScheduleRecord> {
    let (memory_id, scheduled_for, scheduled_at, delay_ms) = row;
    Ok(ScheduleRecord {
        memory_id: parse_memory_id(&memory_id)?,
        scheduled_for: parse_rfc3339(&scheduled_for)?,
        scheduled_at: parse_rfc3339(&scheduled_at)?,
        delay_ms,
    })
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get::<_, i64>(0),
        )
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

fn day_string(day: Date) -> String {
    format!("{:04}-{:02}-{:02}", day.year(), u8::from(day.month()), day.day())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn parse_memory_id(raw: &str) -> Result<MemoryId> {
    let parsed = Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))?;
    Ok(MemoryId(parsed))
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        writer
            .write_all(b"\n")
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer
        .flush()
        .with_context(|| format!("failed to flush export file {}", path.display()))?;

    Ok((format!("{:x}", hasher.finalize()), values.len()))
}

fn read_ndjson_file<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut values = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = serde_json::from_str(trimmed).with_context(|| {
            format!("failed to parse NDJSON row {} from {}", index + 1, path.display())
        })?;
        values.push(value);
    }

    Ok(values)
}

fn read_export_manifest(path: &Path) -> Result<ExportManifest> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read manifest file {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse manifest JSON {}", path.display()))
}

fn ndjson_digest_and_records(path: &Path) -> Result<(String, usize)> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut records = 0_usize;

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
        if !line.trim().is_empty() {
            records += 1;
        }
    }

    Ok((format!("{:x}", hasher.finalize()), records))
}

fn validate_import_manifest(in_dir: &Path, manifest: &ExportManifest) -> Result<()> {
    if manifest.schema_version <= 0 || manifest.schema_version > LATEST_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported export schema version {}; supported range is 1..={}",
            manifest.schema_version,
            LATEST_SCHEMA_VERSION
        ));
    }

    let mut by_path: BTreeMap<&str, &ExportFileDigest> = BTreeMap::new();
    for file in &manifest.files {
        if by_path.insert(file.path.as_str(), file).is_some() {
            return Err(anyhow!("manifest contains duplicate file entry: {}", file.path));
        }
    }

    for required in ["memories.ndjson", "schedules.ndjson", "audit_log.ndjson"] {
        let Some(expected) = by_path.get(required) else {
            return Err(anyhow!("manifest is missing required file entry: {required}"));
        };
        let file_path = in_dir.join(required);
        if !file_path.exists() {
            return Err(anyhow!("manifest references missing file {}", file_path.display()));
        }

        let (actual_sha256, actual_records) = ndjson_digest_and_records(&file_path)?;
        if actual_sha256 != expected.sha256 {
            return Err(anyhow!(
                "manifest digest mismatch for {required}: expected {}, got {}",
                expected.sha256,
                actual_sha256
            ));
        }
        if actual_records != expected.records {
            return Err(anyhow!(
                "manifest record count mismatch for {required}: expected {}, got {}",
                expected.records,
                actual_records
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::thread;

    use super::*;
    use chronicle_core::{MemoryDraft, ScheduleDirective};
    use time::Duration;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn temp_db_path(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("chronicle-{label}-{}.sqlite3", Ulid::new()))
    }

    fn open_migrated(path: &Path) -> Result<SqliteStore> {
        let mut store = SqliteStore::open(path)?;
        store.migrate()?;
        Ok(store)
    }

    fn mk_memory(
        title: &str,
        trigger_type: TriggerType,
        trigger_date: Option<OffsetDateTime>,
        created_at: OffsetDateTime,
    ) -> Result<Memory> {
        let draft = MemoryDraft {
            title: title.to_string(),
            description: "Connection pool exhausted during launch traffic".to_string(),
            memory_type: chronicle_core::MemoryType::Failure,
            trigger_type,
            trigger_date,
            team_id: "platform".to_string(),
            tags: vec!["incident".to_string()],
            severity: Some(Severity::High),
        };
        Ok(Memory::new(draft, created_at)?)
    }

    // Test IDs: TDB-001
    #[test]
    fn migrate_initializes_schema_and_reports_status() -> Result<()> {
        let db_path = temp_db_path("migrate");
        let mut store = SqliteStore::open(&db_path)?;

        let before = store.schema_status()?;
        assert_eq!(before.current_version, 0);
        assert_eq!(before.target_version, LATEST_SCHEMA_VERSION);
        assert_eq!(before.pending_versions, vec![1]);

        store.migrate()?;
        let after = store.schema_status()?;
        assert_eq!(after.current_version, LATEST_SCHEMA_VERSION);
        assert!(after.pending_versions.is_empty());

        // Idempotent on an up-to-date database.
        store.migrate()?;

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TDB-002
    #[test]
    fn insert_get_and_list_round_trip_with_filters() -> Result<()> {
        let db_path = temp_db_path("roundtrip");
        let mut store = open_migrated(&db_path)?;

        let older = mk_memory("older", TriggerType::None, None, fixture_time())?;
        let newer = mk_memory(
            "newer",
            TriggerType::Date,
            Some(fixture_time() + Duration::days(10)),
            fixture_time() + Duration::hours(1),
        )?;
        store.insert_memory(&older)?;
        store.insert_memory(&newer)?;

        let loaded = store.get_memory(older.id)?;
        assert_eq!(loaded.as_ref(), Some(&older));
        assert_eq!(store.get_memory(MemoryId::new())?, None);

        let all = store.list_memories(None, None)?;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, newer.id, "listing must be newest first");

        let scheduled = store.list_memories(Some(MemoryStatus::Scheduled), None)?;
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].id, newer.id);

        let other_team = store.list_memories(None, Some("search"))?;
        assert!(other_team.is_empty());

        let stats = store.stats(Some("platform"))?;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.scheduled, 1);
        assert_eq!(stats.by_type.failure, 2);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TDB-003
    #[test]
    fn sqlite_constraints_reject_invalid_enum_values() -> Result<()> {
        let db_path = temp_db_path("checks");
        let store = open_migrated(&db_path)?;

        let result = store.conn.execute(
            "INSERT INTO memories(memory_id, title, description, memory_type, status, \
             trigger_type, team_id, tags, created_at, updated_at) \
             VALUES ('01ARZ3NDEKTSV4RRFFQ69G5FAV', 't', 'd', 'grudge', 'active', 'none', \
             'platform', '[]', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')",
            [],
        );
        assert!(result.is_err(), "CHECK constraint must reject unknown memory_type");

        let result = store.conn.execute(
            "INSERT INTO daily_counters(family, day, name, count) \
             VALUES ('moods', '2024-01-01', 'total', 1)",
            [],
        );
        assert!(result.is_err(), "CHECK constraint must reject unknown counter family");

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TDB-004
    #[test]
    fn update_applies_patch_and_reconciles_schedule_atomically() -> Result<()> {
        let db_path = temp_db_path("update");
        let mut store = open_migrated(&db_path)?;

        let memory = mk_memory("patchable", TriggerType::None, None, fixture_time())?;
        store.insert_memory(&memory)?;

        // Setting a date trigger replaces the schedule row in the same commit.
        let trigger = fixture_time() + Duration::days(3);
        let patch = MemoryPatch {
            trigger_type: Some(TriggerType::Date),
            trigger_date: Some(trigger),
            ..MemoryPatch::default()
        };
        let now = fixture_time() + Duration::hours(1);
        let outcome = store.update_memory(memory.id, &patch, now)?;
        let applied = match outcome {
            UpdateOutcome::Applied(applied) => applied,
            other => panic!("expected applied outcome, got {other:?}"),
        };
        assert_eq!(applied.memory.status, MemoryStatus::Scheduled);
        assert_eq!(applied.schedule, ScheduleDirective::Replace);

        let schedule = store.get_schedule(memory.id)?;
        let schedule = match schedule {
            Some(schedule) => schedule,
            None => panic!("schedule row must exist after replacement"),
        };
        assert_eq!(schedule.scheduled_for, trigger);
        assert_eq!(schedule.scheduled_at, now);
        assert!(schedule.delay_ms > 0);

        // A rejected patch leaves both the memory and the schedule untouched.
        let bad = MemoryPatch {
            status: Some(MemoryStatus::Active),
            ..MemoryPatch::default()
        };
        let rejected = store.update_memory(memory.id, &bad, now + Duration::hours(1))?;
        assert!(matches!(rejected, UpdateOutcome::Rejected(ChronicleError::Validation(_))));
        let reloaded = store
            .get_memory(memory.id)?
            .ok_or_else(|| anyhow!("memory must still exist"))?;
        assert_eq!(reloaded.status, MemoryStatus::Scheduled);
        assert_eq!(reloaded.updated_at, now);
        assert!(store.get_schedule(memory.id)?.is_some());

        // Clearing the trigger cancels the schedule row.
        let clear = MemoryPatch {
            trigger_type: Some(TriggerType::None),
            ..MemoryPatch::default()
        };
        let cleared = store.update_memory(memory.id, &clear, now + Duration::hours(2))?;
        assert!(matches!(cleared, UpdateOutcome::Applied(_)));
        assert!(store.get_schedule(memory.id)?.is_none());

        let missing = store.update_memory(MemoryId::new(), &MemoryPatch::default(), now)?;
        assert!(matches!(missing, UpdateOutcome::Missing));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TDB-005
    #[test]
    fn firing_is_compare_and_set_and_clears_the_schedule() -> Result<()> {
        let db_path = temp_db_path("fire");
        let mut store = open_migrated(&db_path)?;

        let trigger = fixture_time() + Duration::days(1);
        let memory = mk_memory("due", TriggerType::Date, Some(trigger), fixture_time())?;
        store.insert_memory(&memory)?;
        store.put_schedule(&ScheduleRecord {
            memory_id: memory.id,
            scheduled_for: trigger,
            scheduled_at: fixture_time(),
            delay_ms: 86_400_000,
        })?;

        let fired_at = trigger + Duration::seconds(1);
        let first = store.fire_memory(memory.id, fired_at)?;
        let fired = match first {
            FireOutcome::Fired(memory) => memory,
            other => panic!("expected fired, got {other:?}"),
        };
        assert_eq!(fired.status, MemoryStatus::Triggered);
        assert_eq!(fired.triggered_at, Some(fired_at));
        assert!(store.get_schedule(memory.id)?.is_none());

        // Replayed wake-ups refuse and report the current status.
        let second = store.fire_memory(memory.id, fired_at + Duration::seconds(5))?;
        assert!(matches!(
            second,
            FireOutcome::Refused { status: MemoryStatus::Triggered }
        ));

        // A stale schedule row for a non-scheduled memory is swept on refusal.
        store.put_schedule(&ScheduleRecord {
            memory_id: memory.id,
            scheduled_for: trigger,
            scheduled_at: fixture_time(),
            delay_ms: 1,
        })?;
        let _ = store.fire_memory(memory.id, fired_at + Duration::seconds(10))?;
        assert!(store.get_schedule(memory.id)?.is_none());

        assert!(matches!(
            store.fire_memory(MemoryId::new(), fired_at)?,
            FireOutcome::Missing
        ));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TDB-006
    #[test]
    fn delete_returns_prior_state_and_drops_the_schedule() -> Result<()> {
        let db_path = temp_db_path("delete");
        let mut store = open_migrated(&db_path)?;

        let trigger = fixture_time() + Duration::days(2);
        let memory = mk_memory("doomed", TriggerType::Date, Some(trigger), fixture_time())?;
        store.insert_memory(&memory)?;
        store.put_schedule(&ScheduleRecord {
            memory_id: memory.id,
            scheduled_for: trigger,
            scheduled_at: fixture_time(),
            delay_ms: 1,
        })?;

        let deleted = store.delete_memory(memory.id)?;
        assert_eq!(deleted, Some(memory.clone()));
        assert!(store.get_memory(memory.id)?.is_none());
        assert!(store.get_schedule(memory.id)?.is_none());

        assert_eq!(store.delete_memory(memory.id)?, None);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TDB-007
    #[test]
    fn analysis_and_embedding_writebacks_keep_history() -> Result<()> {
        let db_path = temp_db_path("analysis");
        let mut store = open_migrated(&db_path)?;

        let memory = mk_memory("analyzed", TriggerType::None, None, fixture_time())?;
        store.insert_memory(&memory)?;

        let analysis = Analysis {
            summary: "Pool sizing did not survive burst traffic".to_string(),
            category: "capacity".to_string(),
            root_cause: Some("static pool limits".to_string()),
            lessons: vec!["load test connection limits".to_string()],
        };
        let analyzed_at = fixture_time() + Duration::minutes(1);
        assert!(store.record_analysis(memory.id, &analysis, analyzed_at)?);

        let reloaded = store
            .get_memory(memory.id)?
            .ok_or_else(|| anyhow!("memory must exist"))?;
        assert_eq!(reloaded.ai_summary.as_deref(), Some(analysis.summary.as_str()));
        assert_eq!(reloaded.ai_category.as_deref(), Some("capacity"));
        assert_eq!(reloaded.key_lessons, Some(analysis.lessons.clone()));
        assert_eq!(reloaded.updated_at, analyzed_at);

        let history = store.analysis_history(memory.id)?;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].analysis, analysis);
        assert_eq!(history[0].analyzed_at, analyzed_at);

        let embedding_id = EmbeddingId("emb_01ARZ3NDEKTSV4RRFFQ69G5FAV".to_string());
        assert!(store.record_embedding(memory.id, &embedding_id, analyzed_at)?);
        let reloaded = store
            .get_memory(memory.id)?
            .ok_or_else(|| anyhow!("memory must exist"))?;
        assert_eq!(reloaded.embedding_id, Some(embedding_id.clone()));

        // Writebacks against a deleted memory report false instead of failing.
        let ghost = MemoryId::new();
        assert!(!store.record_analysis(ghost, &analysis, analyzed_at)?);
        assert!(!store.record_embedding(ghost, &embedding_id, analyzed_at)?);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TDB-008
    #[test]
    fn schedule_queries_order_by_due_time() -> Result<()> {
        let db_path = temp_db_path("schedules");
        let mut store = open_migrated(&db_path)?;

        let near = ScheduleRecord {
            memory_id: MemoryId::new(),
            scheduled_for: fixture_time() + Duration::minutes(5),
            scheduled_at: fixture_time(),
            delay_ms: 300_000,
        };
        let far = ScheduleRecord {
            memory_id: MemoryId::new(),
            scheduled_for: fixture_time() + Duration::days(5),
            scheduled_at: fixture_time(),
            delay_ms: 432_000_000,
        };
        store.put_schedule(&far)?;
        store.put_schedule(&near)?;

        let next = store.next_schedule()?;
        assert_eq!(next, Some(near.clone()));

        let due = store.due_schedules(fixture_time() + Duration::hours(1))?;
        assert_eq!(due, vec![near.clone()]);

        let pending = store.pending_schedules()?;
        assert_eq!(pending, vec![near.clone(), far.clone()]);

        assert!(store.delete_schedule(near.memory_id)?);
        assert!(!store.delete_schedule(near.memory_id)?);

        // A scheduled memory without a schedule row shows up in the sweep.
        let orphan = mk_memory(
            "orphaned",
            TriggerType::Date,
            Some(fixture_time() + Duration::days(1)),
            fixture_time(),
        )?;
        store.insert_memory(&orphan)?;
        let unscheduled = store.unscheduled_pending()?;
        assert_eq!(unscheduled.len(), 1);
        assert_eq!(unscheduled[0].id, orphan.id);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TDB-009
    #[test]
    fn notification_claims_are_idempotent_per_occurrence() -> Result<()> {
        let db_path = temp_db_path("notify");
        let mut store = open_migrated(&db_path)?;

        let memory_id = MemoryId::new();
        let occurrence = fixture_time() + Duration::days(1);
        let notification = Notification::reactivation(
            memory_id,
            "Quarterly revisit",
            "Still relevant; the pool limits were never raised.",
            occurrence,
            vec![chronicle_core::Channel::InApp, chronicle_core::Channel::Email],
        );

        let sent_at = occurrence + Duration::seconds(2);
        assert!(store.claim_notification(memory_id, occurrence, &notification, sent_at)?);
        assert!(!store.claim_notification(memory_id, occurrence, &notification, sent_at)?);

        let history = store.notification_history(memory_id)?;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].notification, notification);
        assert_eq!(history[0].sent_at, sent_at);

        // Releasing reopens the slot for a retry.
        store.release_notification(memory_id, occurrence)?;
        assert!(store.claim_notification(memory_id, occurrence, &notification, sent_at)?);

        // A later occurrence is a separate slot.
        let second = occurrence + Duration::days(30);
        assert!(store.claim_notification(memory_id, second, &notification, sent_at)?);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TDB-010
    #[test]
    fn audit_entries_append_and_filter_by_memory() -> Result<()> {
        let db_path = temp_db_path("audit");
        let mut store = open_migrated(&db_path)?;

        let first = MemoryId::new();
        let second = MemoryId::new();
        let entry = AuditEntry {
            memory_id: first,
            action: AuditAction::Update,
            details: serde_json::json!({"changes": {"title": "renamed"}}),
            timestamp: fixture_time(),
            recorded_at: fixture_time() + Duration::seconds(1),
        };
        store.append_audit(&entry)?;
        store.append_audit(&AuditEntry {
            memory_id: second,
            action: AuditAction::Delete,
            details: serde_json::json!({"title": "gone"}),
            timestamp: fixture_time() + Duration::seconds(5),
            recorded_at: fixture_time() + Duration::seconds(6),
        })?;

        let all = store.audit_entries(None)?;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], entry);

        let filtered = store.audit_entries(Some(second))?;
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].action, AuditAction::Delete);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TDB-011
    #[test]
    fn analytics_events_are_stamped_and_counters_upsert() -> Result<()> {
        let db_path = temp_db_path("analytics");
        let mut store = open_migrated(&db_path)?;

        let mut metadata = serde_json::Map::new();
        metadata.insert("type".to_string(), serde_json::json!("failure"));
        let event = AnalyticsEvent {
            event: chronicle_core::EVENT_MEMORY_CREATED.to_string(),
            memory_id: Some(MemoryId::new()),
            timestamp: fixture_time(),
            metadata,
        };
        let tracked_at = fixture_time() + Duration::seconds(3);
        store.record_analytics_event(&event, tracked_at)?;

        let stored = store.analytics_events(Some(chronicle_core::EVENT_MEMORY_CREATED))?;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0]["source"], "chronicle-app");
        assert_eq!(stored[0]["type"], "failure");
        assert!(stored[0].get("trackedAt").is_some());
        assert!(store.analytics_events(Some("question_answered"))?.is_empty());

        let day = chronicle_core::utc_day(fixture_time());
        store.increment_counter(CounterFamily::Analytics, day, "memory_created")?;
        store.increment_counter(CounterFamily::Analytics, day, "memory_created")?;
        store.increment_counter(CounterFamily::Analytics, day, "memory_roasted")?;

        let counters = store.counters_for(CounterFamily::Analytics, day)?;
        assert_eq!(counters.get("memory_created"), Some(&2));
        assert_eq!(counters.get("memory_roasted"), Some(&1), "unknown names still count");
        assert_eq!(counters.get("memory_updated"), Some(&0), "baseline reports zero");
        assert_eq!(counters.get("question_answered"), Some(&0));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TDB-012
    #[test]
    fn embeddings_upsert_list_and_delete() -> Result<()> {
        let db_path = temp_db_path("embeddings");
        let mut store = open_migrated(&db_path)?;

        let memory_id = MemoryId::new();
        let embedding_id = EmbeddingId(format!("emb_{}", Ulid::new()));
        store.upsert_embedding(
            &embedding_id,
            memory_id,
            "platform",
            &[0.5, -0.25, 0.0],
            fixture_time(),
        )?;
        // Re-upserting the same id replaces the vector.
        store.upsert_embedding(
            &embedding_id,
            memory_id,
            "platform",
            &[1.0, 0.0, 0.0],
            fixture_time(),
        )?;

        let all = store.embeddings_all()?;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].embedding_id, embedding_id);
        assert_eq!(all[0].memory_id, memory_id);
        assert_eq!(all[0].team_id, "platform");
        assert_eq!(all[0].vector, vec![1.0, 0.0, 0.0]);

        assert_eq!(store.delete_embeddings_for(memory_id)?, 1);
        assert!(store.embeddings_all()?.is_empty());

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TDB-013
    #[test]
    fn export_and_import_snapshot_round_trip() -> Result<()> {
        let db_path = temp_db_path("export");
        let mut store = open_migrated(&db_path)?;

        let memory = mk_memory("exported", TriggerType::None, None, fixture_time())?;
        let scheduled = mk_memory(
            "exported-scheduled",
            TriggerType::Date,
            Some(fixture_time() + Duration::days(7)),
            fixture_time(),
        )?;
        store.insert_memory(&memory)?;
        store.insert_memory(&scheduled)?;
        store.put_schedule(&ScheduleRecord {
            memory_id: scheduled.id,
            scheduled_for: fixture_time() + Duration::days(7),
            scheduled_at: fixture_time(),
            delay_ms: 604_800_000,
        })?;
        store.append_audit(&AuditEntry {
            memory_id: memory.id,
            action: AuditAction::Update,
            details: serde_json::json!({"changes": {"title": "exported"}}),
            timestamp: fixture_time(),
            recorded_at: fixture_time(),
        })?;

        let out_dir = std::env::temp_dir().join(format!("chronicle-export-{}", Ulid::new()));
        let manifest = store.export_snapshot(&out_dir)?;
        assert_eq!(manifest.schema_version, LATEST_SCHEMA_VERSION);
        assert_eq!(manifest.files.len(), 3);

        let target_path = temp_db_path("import-target");
        let mut target = open_migrated(&target_path)?;
        let summary = target.import_snapshot(&out_dir, false)?;
        assert_eq!(summary.imported_memories, 2);
        assert_eq!(summary.imported_schedules, 1);
        assert_eq!(summary.imported_audit_entries, 1);

        assert_eq!(target.get_memory(memory.id)?, Some(memory.clone()));
        assert!(target.get_schedule(scheduled.id)?.is_some());

        // Re-importing without skip_existing fails; with it, everything skips.
        assert!(target.import_snapshot(&out_dir, false).is_err());
        let skipped = target.import_snapshot(&out_dir, true)?;
        assert_eq!(skipped.imported_memories, 0);
        assert_eq!(skipped.skipped_existing_memories, 2);
        assert_eq!(skipped.skipped_existing_schedules, 1);
        assert_eq!(skipped.skipped_existing_audit_entries, 1);

        let _ = std::fs::remove_file(&db_path);
        let _ = std::fs::remove_file(&target_path);
        let _ = std::fs::remove_dir_all(&out_dir);
        Ok(())
    }

    // Test IDs: TDB-014
    #[test]
    fn import_rejects_manifest_digest_mismatch() -> Result<()> {
        let db_path = temp_db_path("tamper");
        let mut store = open_migrated(&db_path)?;
        let memory = mk_memory("tampered", TriggerType::None, None, fixture_time())?;
        store.insert_memory(&memory)?;

        let out_dir = std::env::temp_dir().join(format!("chronicle-tamper-{}", Ulid::new()));
        store.export_snapshot(&out_dir)?;

        // Corrupt the exported memories file after the manifest was written.
        let memories_path = out_dir.join("memories.ndjson");
        let mut contents = fs::read_to_string(&memories_path)?;
        contents.push_str("{\"sneaky\": true}\n");
        fs::write(&memories_path, contents)?;

        let target_path = temp_db_path("tamper-target");
        let mut target = open_migrated(&target_path)?;
        let result = target.import_snapshot(&out_dir, false);
        match result {
            Err(err) => assert!(format!("{err:#}").contains("digest mismatch")),
            Ok(_) => panic!("tampered import must be rejected"),
        }

        let _ = std::fs::remove_file(&db_path);
        let _ = std::fs::remove_file(&target_path);
        let _ = std::fs::remove_dir_all(&out_dir);
        Ok(())
    }

    // Test IDs: TDB-015
    #[test]
    fn backup_and_restore_database_round_trip() -> Result<()> {
        let db_path = temp_db_path("backup");
        let mut store = open_migrated(&db_path)?;
        let memory = mk_memory("kept", TriggerType::None, None, fixture_time())?;
        store.insert_memory(&memory)?;

        let backup_path =
            std::env::temp_dir().join(format!("chronicle-backup-{}.sqlite3", Ulid::new()));
        store.backup_database(&backup_path)?;

        // Lose the memory, then restore over the live database.
        store.delete_memory(memory.id)?;
        assert!(store.get_memory(memory.id)?.is_none());
        store.restore_database(&backup_path)?;
        assert_eq!(store.get_memory(memory.id)?, Some(memory));

        let missing = std::env::temp_dir().join(format!("chronicle-missing-{}", Ulid::new()));
        assert!(store.restore_database(&missing).is_err());

        let _ = std::fs::remove_file(&db_path);
        let _ = std::fs::remove_file(&backup_path);
        Ok(())
    }

    // Test IDs: TDB-016
    #[test]
    fn integrity_check_reports_clean_database() -> Result<()> {
        let db_path = temp_db_path("integrity");
        let mut store = open_migrated(&db_path)?;
        let memory = mk_memory("healthy", TriggerType::None, None, fixture_time())?;
        store.insert_memory(&memory)?;

        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert_eq!(report.quick_check_message, "ok");
        assert!(report.foreign_key_violations.is_empty());
        assert_eq!(report.schema_status.current_version, LATEST_SCHEMA_VERSION);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TDB-017
    #[test]
    fn concurrent_counter_increments_never_lose_updates() -> Result<()> {
        let db_path = temp_db_path("concurrency");
        {
            let mut init = SqliteStore::open(&db_path)?;
            init.migrate()?;
        }

        let threads = 4;
        let increments_per_thread = 25;
        let day = chronicle_core::utc_day(fixture_time());

        let mut handles = Vec::new();
        for _ in 0..threads {
            let path = db_path.clone();
            handles.push(thread::spawn(move || -> Result<()> {
                let mut store = SqliteStore::open(&path)?;
                store.migrate()?;
                for _ in 0..increments_per_thread {
                    store.increment_counter(CounterFamily::Deletions, day, "total_deletions")?;
                }
                Ok(())
            }));
        }

        for handle in handles {
            let Ok(thread_result) = handle.join() else {
                return Err(anyhow!("concurrency thread panicked"));
            };
            thread_result?;
        }

        let store = SqliteStore::open(&db_path)?;
        let counters = store.counters_for(CounterFamily::Deletions, day)?;
        assert_eq!(
            counters.get("total_deletions"),
            Some(&i64::from(threads * increments_per_thread))
        );

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }
}
