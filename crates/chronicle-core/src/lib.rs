use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub const ANALYTICS_SOURCE: &str = "chronicle-app";

pub const EVENT_MEMORY_CREATED: &str = "memory_created";
pub const EVENT_MEMORY_UPDATED: &str = "memory_updated";
pub const EVENT_MEMORY_DELETED: &str = "memory_deleted";
pub const EVENT_QUESTION_ANSWERED: &str = "question_answered";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ChronicleError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("{capability} capability failed: {message}")]
    Capability {
        capability: &'static str,
        message: String,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

impl ChronicleError {
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    #[must_use]
    pub fn capability(capability: &'static str, message: impl Into<String>) -> Self {
        Self::Capability {
            capability,
            message: message.into(),
        }
    }

    /// Transient failures worth retrying; validation and not-found are final.
    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Capability { .. } | Self::Storage(_))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MemoryId(pub Ulid);

impl MemoryId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for MemoryId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for MemoryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EmbeddingId(pub String);

impl Display for EmbeddingId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    Future,
    Decision,
    Failure,
    Context,
}

impl MemoryType {
    pub const ALL: [Self; 4] = [Self::Future, Self::Decision, Self::Failure, Self::Context];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Future => "future",
            Self::Decision => "decision",
            Self::Failure => "failure",
            Self::Context => "context",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "future" => Some(Self::Future),
            "decision" => Some(Self::Decision),
            "failure" => Some(Self::Failure),
            "context" => Some(Self::Context),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MemoryStatus {
    Active,
    Scheduled,
    Triggered,
    Archived,
}

impl MemoryStatus {
    pub const ALL: [Self; 4] = [Self::Active, Self::Scheduled, Self::Triggered, Self::Archived];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Scheduled => "scheduled",
            Self::Triggered => "triggered",
            Self::Archived => "archived",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "scheduled" => Some(Self::Scheduled),
            "triggered" => Some(Self::Triggered),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    None,
    Date,
    Event,
}

impl TriggerType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Date => "date",
            Self::Event => "event",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Self::None),
            "date" => Some(Self::Date),
            "event" => Some(Self::Event),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Channel {
    InApp,
    Email,
    Push,
}

impl Channel {
    pub const ALL: [Self; 3] = [Self::InApp, Self::Email, Self::Push];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InApp => "in-app",
            Self::Email => "email",
            Self::Push => "push",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "in-app" => Some(Self::InApp),
            "email" => Some(Self::Email),
            "push" => Some(Self::Push),
            _ => None,
        }
    }
}

/// A captured piece of institutional knowledge moving through the lifecycle
/// `active | scheduled -> triggered -> archived`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    pub id: MemoryId,
    pub title: String,
    pub description: String,
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    pub status: MemoryStatus,
    pub trigger_type: TriggerType,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub trigger_date: Option<OffsetDateTime>,
    pub team_id: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_cause: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_lessons: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_id: Option<EmbeddingId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub triggered_at: Option<OffsetDateTime>,
}

/// Caller-supplied fields for a new memory; everything else is derived.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MemoryDraft {
    pub title: String,
    pub description: String,
    pub memory_type: MemoryType,
    pub trigger_type: TriggerType,
    pub trigger_date: Option<OffsetDateTime>,
    pub team_id: String,
    pub tags: Vec<String>,
    pub severity: Option<Severity>,
}

/// Initial status is derived from the trigger: a date trigger enters the
/// lifecycle as `scheduled`, everything else as `active`.
#[must_use]
pub fn initial_status(trigger_type: TriggerType) -> MemoryStatus {
    match trigger_type {
        TriggerType::Date => MemoryStatus::Scheduled,
        TriggerType::None | TriggerType::Event => MemoryStatus::Active,
    }
}

impl Memory {
    /// Builds and validates a memory from a draft.
    ///
    /// # Errors
    ///
    /// Returns `ChronicleError::Validation` when the draft breaks a lifecycle
    /// invariant, for example a date trigger without a trigger date.
    pub fn new(draft: MemoryDraft, now: OffsetDateTime) -> Result<Self, ChronicleError> {
        let memory = Self {
            id: MemoryId::new(),
            title: draft.title,
            description: draft.description,
            memory_type: draft.memory_type,
            status: initial_status(draft.trigger_type),
            trigger_type: draft.trigger_type,
            trigger_date: draft.trigger_date,
            team_id: draft.team_id,
            tags: draft.tags,
            severity: draft.severity,
            ai_summary: None,
            ai_category: None,
            root_cause: None,
            key_lessons: None,
            embedding_id: None,
            created_at: now,
            updated_at: now,
            triggered_at: None,
        };
        memory.validate()?;
        Ok(memory)
    }

    /// Checks the at-rest invariants of the lifecycle.
    ///
    /// # Errors
    ///
    /// Returns `ChronicleError::Validation` naming the first violated rule.
    pub fn validate(&self) -> Result<(), ChronicleError> {
        if self.title.trim().is_empty() {
            return Err(ChronicleError::Validation(
                "title must not be empty".to_string(),
            ));
        }
        if self.team_id.trim().is_empty() {
            return Err(ChronicleError::Validation(
                "teamId must not be empty".to_string(),
            ));
        }
        match self.trigger_type {
            TriggerType::Date => {
                if self.trigger_date.is_none() {
                    return Err(ChronicleError::Validation(
                        "triggerDate is required when triggerType is date".to_string(),
                    ));
                }
                if self.status == MemoryStatus::Active {
                    return Err(ChronicleError::Validation(
                        "a memory with a pending date trigger must be scheduled".to_string(),
                    ));
                }
            }
            TriggerType::None | TriggerType::Event => {
                if self.trigger_date.is_some() {
                    return Err(ChronicleError::Validation(
                        "triggerDate is only valid when triggerType is date".to_string(),
                    ));
                }
            }
        }
        if self.status == MemoryStatus::Scheduled && self.trigger_type != TriggerType::Date {
            return Err(ChronicleError::Validation(
                "scheduled status requires a date trigger".to_string(),
            ));
        }
        if self.status == MemoryStatus::Triggered && self.triggered_at.is_none() {
            return Err(ChronicleError::Validation(
                "triggered status requires triggeredAt".to_string(),
            ));
        }
        if self.triggered_at.is_some()
            && !matches!(self.status, MemoryStatus::Triggered | MemoryStatus::Archived)
        {
            return Err(ChronicleError::Validation(
                "triggeredAt is only valid once the memory has fired".to_string(),
            ));
        }
        Ok(())
    }

    /// The text handed to the embedding capability: title, description,
    /// summary and lessons joined with spaces.
    #[must_use]
    pub fn embedding_text(&self) -> String {
        let mut parts = vec![self.title.clone(), self.description.clone()];
        if let Some(summary) = &self.ai_summary {
            parts.push(summary.clone());
        }
        if let Some(lessons) = &self.key_lessons {
            parts.extend(lessons.iter().cloned());
        }
        parts.join(" ")
    }

    /// Whether a scheduler wake-up may fire this memory. The store enforces
    /// the same rule atomically; this is the readable form of the guard.
    #[must_use]
    pub fn fire_eligible(&self) -> bool {
        self.status == MemoryStatus::Scheduled
    }
}

/// Partial update to a memory. Absent fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct MemoryPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub memory_type: Option<MemoryType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<MemoryStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_type: Option<TriggerType>,
    #[serde(
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub trigger_date: Option<OffsetDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
}

impl MemoryPatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Wire names of the fields this patch sets, for audit entries and
    /// update counters.
    #[must_use]
    pub fn changed_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.title.is_some() {
            fields.push("title");
        }
        if self.description.is_some() {
            fields.push("description");
        }
        if self.memory_type.is_some() {
            fields.push("type");
        }
        if self.status.is_some() {
            fields.push("status");
        }
        if self.trigger_type.is_some() {
            fields.push("triggerType");
        }
        if self.trigger_date.is_some() {
            fields.push("triggerDate");
        }
        if self.tags.is_some() {
            fields.push("tags");
        }
        if self.severity.is_some() {
            fields.push("severity");
        }
        fields
    }
}

/// What the caller must do to the memory's schedule after a patch commits.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ScheduleDirective {
    Keep,
    Cancel,
    /// Persist a fresh record for the patched memory's trigger date.
    Replace,
}

#[derive(Debug, Clone)]
pub struct PatchOutcome {
    pub memory: Memory,
    pub changed_fields: Vec<&'static str>,
    pub schedule: ScheduleDirective,
}

/// Status values a patch may name directly. `active` and `scheduled` are
/// derived from the trigger and cannot be forced; `archived` is terminal.
#[must_use]
pub fn legal_transition(from: MemoryStatus, to: MemoryStatus) -> bool {
    if from == to {
        return true;
    }
    match to {
        MemoryStatus::Archived => true,
        MemoryStatus::Triggered => from != MemoryStatus::Archived,
        MemoryStatus::Active | MemoryStatus::Scheduled => false,
    }
}

/// Applies a patch to a memory, repairing the `active`/`scheduled` split to
/// match the resulting trigger and stamping `triggeredAt` on the first
/// transition into `triggered`.
///
/// # Errors
///
/// Returns `ChronicleError::Validation` for illegal status transitions,
/// patches that touch lifecycle fields of an archived memory, and trigger
/// combinations that would leave the memory inconsistent.
pub fn apply_patch(
    current: &Memory,
    patch: &MemoryPatch,
    now: OffsetDateTime,
) -> Result<PatchOutcome, ChronicleError> {
    if current.status == MemoryStatus::Archived {
        let reopens = matches!(patch.status, Some(status) if status != MemoryStatus::Archived);
        if reopens || patch.trigger_type.is_some() || patch.trigger_date.is_some() {
            return Err(ChronicleError::Validation(
                "archived memories cannot change status or triggers".to_string(),
            ));
        }
    }
    if let Some(target) = patch.status {
        if !legal_transition(current.status, target) {
            return Err(ChronicleError::Validation(format!(
                "illegal status transition: {} -> {}",
                current.status.as_str(),
                target.as_str()
            )));
        }
    }

    let mut next = current.clone();
    if let Some(title) = &patch.title {
        next.title = title.clone();
    }
    if let Some(description) = &patch.description {
        next.description = description.clone();
    }
    if let Some(memory_type) = patch.memory_type {
        next.memory_type = memory_type;
    }
    if let Some(tags) = &patch.tags {
        next.tags = tags.clone();
    }
    if let Some(severity) = patch.severity {
        next.severity = Some(severity);
    }
    if let Some(trigger_type) = patch.trigger_type {
        next.trigger_type = trigger_type;
    }
    if let Some(trigger_date) = patch.trigger_date {
        next.trigger_date = Some(trigger_date);
    }

    if next.trigger_type == TriggerType::Date {
        if next.trigger_date.is_none() {
            return Err(ChronicleError::Validation(
                "triggerDate is required when triggerType is date".to_string(),
            ));
        }
    } else if patch.trigger_date.is_some() {
        return Err(ChronicleError::Validation(
            "triggerDate is only valid when triggerType is date".to_string(),
        ));
    } else {
        next.trigger_date = None;
    }

    match patch.status {
        Some(MemoryStatus::Triggered) => {
            if current.status != MemoryStatus::Triggered {
                next.triggered_at = Some(now);
            }
            next.status = MemoryStatus::Triggered;
        }
        Some(status) => next.status = status,
        None => {}
    }

    // Repair the derived half of the lifecycle: a pending date trigger keeps
    // the memory scheduled, losing it drops the memory back to active.
    let pending = next.trigger_type == TriggerType::Date
        && matches!(next.status, MemoryStatus::Active | MemoryStatus::Scheduled);
    if pending {
        next.status = MemoryStatus::Scheduled;
    } else if next.status == MemoryStatus::Scheduled {
        next.status = MemoryStatus::Active;
    }

    let was_scheduled = current.status == MemoryStatus::Scheduled;
    let now_scheduled = next.status == MemoryStatus::Scheduled;
    let schedule = if now_scheduled {
        if was_scheduled && next.trigger_date == current.trigger_date {
            ScheduleDirective::Keep
        } else {
            ScheduleDirective::Replace
        }
    } else if was_scheduled {
        ScheduleDirective::Cancel
    } else {
        ScheduleDirective::Keep
    };

    next.updated_at = now;
    next.validate()?;
    Ok(PatchOutcome {
        memory: next,
        changed_fields: patch.changed_fields(),
        schedule,
    })
}

/// Durable record of a pending reactivation; survives restarts.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRecord {
    pub memory_id: MemoryId,
    #[serde(with = "time::serde::rfc3339")]
    pub scheduled_for: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub scheduled_at: OffsetDateTime,
    pub delay_ms: i64,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ScheduleDecision {
    /// No date trigger pending; nothing to schedule.
    Skip,
    /// The trigger date is already due; reactivate without persisting.
    Immediate { scheduled_for: OffsetDateTime },
    /// Persist a record and arm the scheduler.
    Defer {
        scheduled_for: OffsetDateTime,
        delay_ms: i64,
    },
}

/// Decides how a memory's date trigger should be scheduled relative to `now`.
#[must_use]
pub fn plan_reactivation(memory: &Memory, now: OffsetDateTime) -> ScheduleDecision {
    if memory.status != MemoryStatus::Scheduled || memory.trigger_type != TriggerType::Date {
        return ScheduleDecision::Skip;
    }
    let scheduled_for = match memory.trigger_date {
        Some(date) => date,
        None => return ScheduleDecision::Skip,
    };
    let delay = (scheduled_for - now).whole_milliseconds();
    if delay <= 0 {
        ScheduleDecision::Immediate { scheduled_for }
    } else {
        ScheduleDecision::Defer {
            scheduled_for,
            delay_ms: i64::try_from(delay).unwrap_or(i64::MAX),
        }
    }
}

/// Output of the analysis capability, copied onto the memory and kept in the
/// analysis history.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Analysis {
    pub summary: String,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_cause: Option<String>,
    #[serde(default)]
    pub lessons: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(rename = "type")]
    pub notification_type: String,
    pub memory_id: MemoryId,
    pub title: String,
    pub reanalysis: String,
    #[serde(with = "time::serde::rfc3339")]
    pub reactivated_at: OffsetDateTime,
    pub channels: Vec<Channel>,
    pub message: String,
}

impl Notification {
    /// The notification sent when a memory fires.
    #[must_use]
    pub fn reactivation(
        memory_id: MemoryId,
        title: &str,
        reanalysis: &str,
        reactivated_at: OffsetDateTime,
        channels: Vec<Channel>,
    ) -> Self {
        Self {
            notification_type: "memory_reactivated".to_string(),
            memory_id,
            title: title.to_string(),
            reanalysis: reanalysis.to_string(),
            reactivated_at,
            channels,
            message: format!("Memory \"{title}\" has been reactivated. {reanalysis}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Update,
    Delete,
}

impl AuditAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// Append-only record of a mutation, written even when the target memory is
/// gone by the time the handler runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub memory_id: MemoryId,
    pub action: AuditAction,
    pub details: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

/// Freeform analytics signal; unknown event names are counted too.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsEvent {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_id: Option<MemoryId>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(flatten)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CounterFamily {
    Analytics,
    Updates,
    Deletions,
    Notifications,
}

impl CounterFamily {
    pub const ALL: [Self; 4] = [
        Self::Analytics,
        Self::Updates,
        Self::Deletions,
        Self::Notifications,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Analytics => "analytics",
            Self::Updates => "updates",
            Self::Deletions => "deletions",
            Self::Notifications => "notifications",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "analytics" => Some(Self::Analytics),
            "updates" => Some(Self::Updates),
            "deletions" => Some(Self::Deletions),
            "notifications" => Some(Self::Notifications),
            _ => None,
        }
    }

    fn bucket_prefix(self) -> &'static str {
        match self {
            Self::Analytics => "daily-metrics",
            Self::Updates => "update-metrics",
            Self::Deletions => "deletion-metrics",
            Self::Notifications => "notification-metrics",
        }
    }

    /// Daily bucket key, for example `daily-metrics-2026-08-25`.
    #[must_use]
    pub fn bucket_key(self, day: Date) -> String {
        format!(
            "{}-{:04}-{:02}-{:02}",
            self.bucket_prefix(),
            day.year(),
            u8::from(day.month()),
            day.day()
        )
    }

    /// Counter names every bucket of this family reports, zeroed when no
    /// increment has happened yet.
    #[must_use]
    pub fn baseline(self) -> &'static [&'static str] {
        match self {
            Self::Analytics => &[
                EVENT_MEMORY_CREATED,
                EVENT_MEMORY_UPDATED,
                EVENT_MEMORY_DELETED,
                EVENT_QUESTION_ANSWERED,
            ],
            Self::Updates => &[
                "total_updates",
                "title_updates",
                "status_updates",
                "description_updates",
            ],
            Self::Deletions => &["total_deletions"],
            Self::Notifications => &["total", "in-app", "email", "push"],
        }
    }
}

/// Counters bucket by the UTC day of the event timestamp, regardless of the
/// timestamp's own offset.
#[must_use]
pub fn utc_day(timestamp: OffsetDateTime) -> Date {
    timestamp.to_offset(UtcOffset::UTC).date()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub total: u64,
    pub active: u64,
    pub scheduled: u64,
    pub triggered: u64,
    pub archived: u64,
    pub by_type: TypeBreakdown,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct TypeBreakdown {
    pub future: u64,
    pub decision: u64,
    pub failure: u64,
    pub context: u64,
}

impl MemoryStats {
    #[must_use]
    pub fn tally(memories: &[Memory]) -> Self {
        let mut stats = Self::default();
        for memory in memories {
            stats.total += 1;
            match memory.status {
                MemoryStatus::Active => stats.active += 1,
                MemoryStatus::Scheduled => stats.scheduled += 1,
                MemoryStatus::Triggered => stats.triggered += 1,
                MemoryStatus::Archived => stats.archived += 1,
            }
            match memory.memory_type {
                MemoryType::Future => stats.by_type.future += 1,
                MemoryType::Decision => stats.by_type.decision += 1,
                MemoryType::Failure => stats.by_type.failure += 1,
                MemoryType::Context => stats.by_type.context += 1,
            }
        }
        stats
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemoryCreatedPayload {
    pub memory_id: MemoryId,
    pub title: String,
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemoryAnalyzedPayload {
    pub memory_id: MemoryId,
    pub analysis: Analysis,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemoryEmbeddedPayload {
    pub memory_id: MemoryId,
    pub embedding_id: EmbeddingId,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReactivationScheduledPayload {
    pub memory_id: MemoryId,
    #[serde(with = "time::serde::rfc3339")]
    pub scheduled_for: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub immediate: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemoryReactivatedPayload {
    pub memory_id: MemoryId,
    pub title: String,
    pub reanalysis: String,
    #[serde(with = "time::serde::rfc3339")]
    pub reactivated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationSentPayload {
    pub memory_id: MemoryId,
    pub channels: Vec<Channel>,
    #[serde(with = "time::serde::rfc3339")]
    pub sent_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUpdatedPayload {
    pub memory_id: MemoryId,
    pub updates: MemoryPatch,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemoryDeletedPayload {
    pub memory_id: MemoryId,
    pub title: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// The wire contract between pipeline stages. Serialized form is
/// `{"topic": "...", "payload": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "topic", content = "payload", rename_all = "kebab-case")]
pub enum Event {
    MemoryCreated(MemoryCreatedPayload),
    MemoryAnalyzed(MemoryAnalyzedPayload),
    MemoryEmbedded(MemoryEmbeddedPayload),
    MemoryReactivationScheduled(ReactivationScheduledPayload),
    MemoryReactivated(MemoryReactivatedPayload),
    NotificationSent(NotificationSentPayload),
    MemoryUpdated(MemoryUpdatedPayload),
    MemoryDeleted(MemoryDeletedPayload),
    TrackAnalytics(AnalyticsEvent),
}

impl Event {
    #[must_use]
    pub fn topic(&self) -> &'static str {
        match self {
            Self::MemoryCreated(_) => "memory-created",
            Self::MemoryAnalyzed(_) => "memory-analyzed",
            Self::MemoryEmbedded(_) => "memory-embedded",
            Self::MemoryReactivationScheduled(_) => "memory-reactivation-scheduled",
            Self::MemoryReactivated(_) => "memory-reactivated",
            Self::NotificationSent(_) => "notification-sent",
            Self::MemoryUpdated(_) => "memory-updated",
            Self::MemoryDeleted(_) => "memory-deleted",
            Self::TrackAnalytics(_) => "track-analytics",
        }
    }

    #[must_use]
    pub fn memory_id(&self) -> Option<MemoryId> {
        match self {
            Self::MemoryCreated(payload) => Some(payload.memory_id),
            Self::MemoryAnalyzed(payload) => Some(payload.memory_id),
            Self::MemoryEmbedded(payload) => Some(payload.memory_id),
            Self::MemoryReactivationScheduled(payload) => Some(payload.memory_id),
            Self::MemoryReactivated(payload) => Some(payload.memory_id),
            Self::NotificationSent(payload) => Some(payload.memory_id),
            Self::MemoryUpdated(payload) => Some(payload.memory_id),
            Self::MemoryDeleted(payload) => Some(payload.memory_id),
            Self::TrackAnalytics(payload) => payload.memory_id,
        }
    }
}
