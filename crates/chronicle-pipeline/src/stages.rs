use std::path::PathBuf;
use std::sync::Arc;

use chronicle_core::{
    plan_reactivation, utc_day, AnalyticsEvent, AuditAction, AuditEntry, Channel, ChronicleError,
    CounterFamily, Event, Memory, MemoryAnalyzedPayload, MemoryCreatedPayload,
    MemoryDeletedPayload, MemoryDraft, MemoryEmbeddedPayload, MemoryId, MemoryPatch,
    MemoryReactivatedPayload, MemoryStats, MemoryStatus, MemoryType, MemoryUpdatedPayload,
    Notification, NotificationSentPayload, ReactivationScheduledPayload, ScheduleDecision,
    ScheduleDirective, ScheduleRecord, EVENT_MEMORY_CREATED, EVENT_MEMORY_DELETED,
    EVENT_MEMORY_UPDATED, EVENT_QUESTION_ANSWERED,
};
use chronicle_store_sqlite::{FireOutcome, SqliteStore, UpdateOutcome};
use serde_json::json;
use time::OffsetDateTime;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::providers::Capabilities;
use crate::retry::{with_retries, RetryPolicy};
use crate::scheduler::SchedulerHandle;
use crate::{AskOutcome, AskSource};

const ASK_RESULT_LIMIT: usize = 5;

/// The answer returned when retrieval finds nothing to ground on.
pub const NO_MATCH_ANSWER: &str = "I couldn't find any relevant memories for that question. \
     Try asking about past decisions, failures, or documented context.";

/// A deleted memory plus the confirmation line callers show.
#[derive(Debug, Clone)]
pub struct DeletedMemory {
    pub memory: Memory,
    pub message: String,
}

/// Event-driven orchestrator. Entry points persist a change and emit events;
/// stage handlers carry memories through analyze, embed, schedule, reactivate
/// and notify. Every handler is idempotent because delivery is at-least-once.
pub struct Pipeline {
    db_path: PathBuf,
    capabilities: Capabilities,
    bus: EventBus,
    scheduler: SchedulerHandle,
    retry: RetryPolicy,
    channels: Vec<Channel>,
}

/// Collapse a storage failure chain into the retryable error taxonomy.
pub(crate) fn storage_err(err: anyhow::Error) -> ChronicleError {
    ChronicleError::Storage(format!("{err:#}"))
}

impl Pipeline {
    #[must_use]
    pub fn new(
        db_path: PathBuf,
        capabilities: Capabilities,
        bus: EventBus,
        scheduler: SchedulerHandle,
        retry: RetryPolicy,
        channels: Vec<Channel>,
    ) -> Self {
        Self {
            db_path,
            capabilities,
            bus,
            scheduler,
            retry,
            channels,
        }
    }

    #[must_use]
    pub fn scheduler(&self) -> SchedulerHandle {
        self.scheduler.clone()
    }

    #[must_use]
    pub fn bus(&self) -> EventBus {
        self.bus.clone()
    }

    fn open_store(&self) -> Result<SqliteStore, ChronicleError> {
        let mut store = SqliteStore::open(&self.db_path).map_err(storage_err)?;
        store.migrate().map_err(storage_err)?;
        Ok(store)
    }

    /// Create a memory and kick off the enrichment chain.
    ///
    /// # Errors
    /// `Validation` for a draft that breaks lifecycle invariants, `Storage`
    /// when persistence fails.
    pub fn create(&self, draft: MemoryDraft) -> Result<Memory, ChronicleError> {
        let now = OffsetDateTime::now_utc();
        let memory = Memory::new(draft, now)?;
        let mut store = self.open_store()?;
        store.insert_memory(&memory).map_err(storage_err)?;
        info!(memory_id = %memory.id, status = memory.status.as_str(), "memory created");

        self.bus.emit(Event::MemoryCreated(MemoryCreatedPayload {
            memory_id: memory.id,
            title: memory.title.clone(),
            memory_type: memory.memory_type,
        }));
        self.bus.emit(Event::TrackAnalytics(AnalyticsEvent {
            event: EVENT_MEMORY_CREATED.to_string(),
            memory_id: Some(memory.id),
            timestamp: now,
            metadata: type_metadata(memory.memory_type),
        }));
        Ok(memory)
    }

    /// # Errors
    /// `NotFound` when the id is unknown.
    pub fn get(&self, id: MemoryId) -> Result<Memory, ChronicleError> {
        let store = self.open_store()?;
        store
            .get_memory(id)
            .map_err(storage_err)?
            .ok_or_else(|| ChronicleError::not_found("memory", id))
    }

    /// # Errors
    /// `Storage` when the listing query fails.
    pub fn list(
        &self,
        status: Option<MemoryStatus>,
        team_id: Option<&str>,
    ) -> Result<Vec<Memory>, ChronicleError> {
        let store = self.open_store()?;
        store.list_memories(status, team_id).map_err(storage_err)
    }

    /// # Errors
    /// `Storage` when the listing query fails.
    pub fn stats(&self, team_id: Option<&str>) -> Result<MemoryStats, ChronicleError> {
        let store = self.open_store()?;
        store.stats(team_id).map_err(storage_err)
    }

    /// Merge a patch, reconcile the schedule, and emit `memory-updated`.
    ///
    /// # Errors
    /// `NotFound` for an unknown id, `Validation` for an illegal patch,
    /// `Storage` when persistence fails.
    pub fn update(&self, id: MemoryId, patch: &MemoryPatch) -> Result<Memory, ChronicleError> {
        let now = OffsetDateTime::now_utc();
        let mut store = self.open_store()?;
        let outcome = store.update_memory(id, patch, now).map_err(storage_err)?;
        let applied = match outcome {
            UpdateOutcome::Missing => return Err(ChronicleError::not_found("memory", id)),
            UpdateOutcome::Rejected(err) => return Err(err),
            UpdateOutcome::Applied(applied) => applied,
        };
        if applied.schedule == ScheduleDirective::Replace {
            self.scheduler.rearm();
        }
        info!(memory_id = %id, fields = ?applied.changed_fields, "memory updated");
        self.bus.emit(Event::MemoryUpdated(MemoryUpdatedPayload {
            memory_id: id,
            updates: patch.clone(),
            timestamp: now,
        }));
        Ok(applied.memory)
    }

    /// Remove a memory and emit `memory-deleted`; audit and cleanup run
    /// through the event chain.
    ///
    /// # Errors
    /// `NotFound` when the id is unknown, `Storage` when the delete fails.
    pub fn delete(&self, id: MemoryId) -> Result<DeletedMemory, ChronicleError> {
        let now = OffsetDateTime::now_utc();
        let mut store = self.open_store()?;
        let Some(memory) = store.delete_memory(id).map_err(storage_err)? else {
            return Err(ChronicleError::not_found("memory", id));
        };
        info!(memory_id = %id, title = %memory.title, "memory deleted");
        self.bus.emit(Event::MemoryDeleted(MemoryDeletedPayload {
            memory_id: id,
            title: memory.title.clone(),
            timestamp: now,
        }));
        let message = format!("Memory \"{}\" deleted successfully", memory.title);
        Ok(DeletedMemory { memory, message })
    }

    /// Retrieval-augmented answer over stored memories.
    ///
    /// # Errors
    /// `Capability` when enrichment or the index fail after retries,
    /// `Storage` when lookups fail.
    pub async fn ask(
        &self,
        question: &str,
        team_id: Option<&str>,
    ) -> Result<AskOutcome, ChronicleError> {
        let now = OffsetDateTime::now_utc();
        let enrichment = &self.capabilities.enrichment;
        let index = &self.capabilities.index;
        let vector = with_retries(&self.retry, "embed-question", || {
            enrichment.embed(question)
        })
        .await?;
        let matches = with_retries(&self.retry, "vector-search", || {
            index.search(&vector, team_id, ASK_RESULT_LIMIT)
        })
        .await?;

        let mut sources = Vec::new();
        let mut context_blocks = Vec::new();
        if !matches.is_empty() {
            let store = self.open_store()?;
            for hit in &matches {
                // The index can lag a deletion; skip rather than fail.
                let Some(memory) = store.get_memory(hit.memory_id).map_err(storage_err)? else {
                    continue;
                };
                context_blocks.push(context_block(&memory)?);
                sources.push(AskSource {
                    memory_id: memory.id,
                    title: memory.title,
                    relevance: hit.score,
                });
            }
        }

        let outcome = if sources.is_empty() {
            AskOutcome {
                answer: NO_MATCH_ANSWER.to_string(),
                sources,
            }
        } else {
            let context = context_blocks.join("\n\n");
            let answer = with_retries(&self.retry, "answer-question", || {
                enrichment.answer(question, &context)
            })
            .await?;
            AskOutcome { answer, sources }
        };

        self.bus.emit(Event::TrackAnalytics(AnalyticsEvent {
            event: EVENT_QUESTION_ANSWERED.to_string(),
            memory_id: None,
            timestamp: now,
            metadata: serde_json::Map::new(),
        }));
        Ok(outcome)
    }

    /// Handle one event, retrying retryable failures with backoff. Stages are
    /// idempotent, so a retry replays the whole stage safely.
    ///
    /// # Errors
    /// The final stage error once retries are exhausted; `Validation` and
    /// `NotFound` abort without retrying.
    pub async fn handle(&self, event: Event) -> Result<(), ChronicleError> {
        let topic = event.topic();
        with_retries(&self.retry, topic, || self.dispatch(event.clone())).await
    }

    async fn dispatch(&self, event: Event) -> Result<(), ChronicleError> {
        match event {
            Event::MemoryCreated(payload) => self.analyze_stage(&payload).await,
            Event::MemoryAnalyzed(payload) => self.embed_stage(&payload).await,
            Event::MemoryEmbedded(payload) => self.schedule_stage(&payload),
            Event::MemoryReactivationScheduled(payload) => {
                if payload.immediate == Some(true) {
                    self.reactivate(payload.memory_id).await
                } else {
                    // Deferred wake-ups belong to the scheduler task.
                    Ok(())
                }
            }
            Event::MemoryReactivated(payload) => self.notify_stage(&payload).await,
            Event::NotificationSent(payload) => {
                debug!(memory_id = %payload.memory_id, "notification recorded");
                Ok(())
            }
            Event::MemoryUpdated(payload) => self.update_side_effects(&payload),
            Event::MemoryDeleted(payload) => self.deletion_side_effects(&payload).await,
            Event::TrackAnalytics(payload) => {
                self.aggregate_analytics(&payload);
                Ok(())
            }
        }
    }

    async fn analyze_stage(&self, payload: &MemoryCreatedPayload) -> Result<(), ChronicleError> {
        let id = payload.memory_id;
        let memory = self.get(id)?;
        let analysis = self
            .capabilities
            .enrichment
            .classify(&memory.embedding_text())
            .await?;
        let now = OffsetDateTime::now_utc();
        let mut store = self.open_store()?;
        if !store
            .record_analysis(id, &analysis, now)
            .map_err(storage_err)?
        {
            return Err(ChronicleError::not_found("memory", id));
        }
        debug!(memory_id = %id, category = %analysis.category, "analysis recorded");
        self.bus.emit(Event::MemoryAnalyzed(MemoryAnalyzedPayload {
            memory_id: id,
            analysis,
            timestamp: now,
        }));
        Ok(())
    }

    async fn embed_stage(&self, payload: &MemoryAnalyzedPayload) -> Result<(), ChronicleError> {
        let id = payload.memory_id;
        // Reload so the embedding text includes the freshly written analysis.
        let memory = self.get(id)?;
        let vector = self
            .capabilities
            .enrichment
            .embed(&memory.embedding_text())
            .await?;
        let embedding_id = self
            .capabilities
            .index
            .upsert(id, &memory.team_id, &vector)
            .await?;
        let now = OffsetDateTime::now_utc();
        let mut store = self.open_store()?;
        if !store
            .record_embedding(id, &embedding_id, now)
            .map_err(storage_err)?
        {
            return Err(ChronicleError::not_found("memory", id));
        }
        debug!(memory_id = %id, embedding_id = %embedding_id, "embedding recorded");
        self.bus.emit(Event::MemoryEmbedded(MemoryEmbeddedPayload {
            memory_id: id,
            embedding_id,
            timestamp: now,
        }));
        Ok(())
    }

    fn schedule_stage(&self, payload: &MemoryEmbeddedPayload) -> Result<(), ChronicleError> {
        let id = payload.memory_id;
        let mut store = self.open_store()?;
        let Some(memory) = store.get_memory(id).map_err(storage_err)? else {
            // A memory can vanish between stages; scheduling just stops.
            warn!(memory_id = %id, "memory missing at scheduling; skipping");
            return Ok(());
        };
        let now = OffsetDateTime::now_utc();
        match plan_reactivation(&memory, now) {
            ScheduleDecision::Skip => Ok(()),
            ScheduleDecision::Immediate { scheduled_for } => {
                info!(memory_id = %id, "trigger date already due; firing immediately");
                self.bus
                    .emit(Event::MemoryReactivationScheduled(ReactivationScheduledPayload {
                        memory_id: id,
                        scheduled_for,
                        delay_ms: None,
                        immediate: Some(true),
                    }));
                Ok(())
            }
            ScheduleDecision::Defer {
                scheduled_for,
                delay_ms,
            } => {
                store
                    .put_schedule(&ScheduleRecord {
                        memory_id: id,
                        scheduled_for,
                        scheduled_at: now,
                        delay_ms,
                    })
                    .map_err(storage_err)?;
                self.scheduler.rearm();
                info!(memory_id = %id, delay_ms, "reactivation scheduled");
                self.bus
                    .emit(Event::MemoryReactivationScheduled(ReactivationScheduledPayload {
                        memory_id: id,
                        scheduled_for,
                        delay_ms: Some(delay_ms),
                        immediate: None,
                    }));
                Ok(())
            }
        }
    }

    /// Fire one memory: reanalyze, then the compare-and-set transition, then
    /// emit. Duplicate wake-ups stop at the eligibility guard, and a lost
    /// race stops at the compare-and-set.
    ///
    /// # Errors
    /// `Capability` when reanalysis fails, `Storage` when the transition
    /// cannot be persisted.
    pub async fn reactivate(&self, id: MemoryId) -> Result<(), ChronicleError> {
        let memory = {
            let mut store = self.open_store()?;
            let Some(memory) = store.get_memory(id).map_err(storage_err)? else {
                store.delete_schedule(id).map_err(storage_err)?;
                info!(memory_id = %id, "fire target missing; schedule dropped");
                return Ok(());
            };
            if !memory.fire_eligible() {
                store.delete_schedule(id).map_err(storage_err)?;
                info!(
                    memory_id = %id,
                    status = memory.status.as_str(),
                    "fire refused; stale schedule dropped"
                );
                return Ok(());
            }
            memory
        };

        let now = OffsetDateTime::now_utc();
        let reanalysis = self.capabilities.enrichment.reanalyze(&memory, now).await?;

        let mut store = self.open_store()?;
        match store.fire_memory(id, now).map_err(storage_err)? {
            FireOutcome::Fired(fired) => {
                store
                    .append_reanalysis(id, &reanalysis, now)
                    .map_err(storage_err)?;
                info!(memory_id = %id, "memory reactivated");
                self.bus
                    .emit(Event::MemoryReactivated(MemoryReactivatedPayload {
                        memory_id: id,
                        title: fired.title.clone(),
                        reanalysis,
                        reactivated_at: now,
                    }));
            }
            FireOutcome::Refused { status } => {
                info!(memory_id = %id, status = status.as_str(), "fire lost the race");
            }
            FireOutcome::Missing => {
                info!(memory_id = %id, "fire target deleted mid-flight");
            }
        }
        Ok(())
    }

    async fn notify_stage(&self, payload: &MemoryReactivatedPayload) -> Result<(), ChronicleError> {
        let id = payload.memory_id;
        // The reactivation timestamp keys the claim, so redelivered events
        // map onto the same occurrence and send nothing twice.
        let occurrence = payload.reactivated_at;
        let notification = Notification::reactivation(
            id,
            &payload.title,
            &payload.reanalysis,
            occurrence,
            self.channels.clone(),
        );

        let now = OffsetDateTime::now_utc();
        {
            let mut store = self.open_store()?;
            if !store
                .claim_notification(id, occurrence, &notification, now)
                .map_err(storage_err)?
            {
                debug!(memory_id = %id, "notification already sent for this occurrence");
                return Ok(());
            }
        }

        for channel in &self.channels {
            if let Err(err) = self
                .capabilities
                .notifier
                .deliver(*channel, &notification)
                .await
            {
                let mut store = self.open_store()?;
                store
                    .release_notification(id, occurrence)
                    .map_err(storage_err)?;
                return Err(err);
            }
        }

        let mut store = self.open_store()?;
        let day = utc_day(now);
        store
            .increment_counter(CounterFamily::Notifications, day, "total")
            .map_err(storage_err)?;
        for channel in &self.channels {
            store
                .increment_counter(CounterFamily::Notifications, day, channel.as_str())
                .map_err(storage_err)?;
        }
        info!(memory_id = %id, channels = self.channels.len(), "notification sent");
        self.bus.emit(Event::NotificationSent(NotificationSentPayload {
            memory_id: id,
            channels: self.channels.clone(),
            sent_at: now,
        }));
        Ok(())
    }

    fn update_side_effects(&self, payload: &MemoryUpdatedPayload) -> Result<(), ChronicleError> {
        let now = OffsetDateTime::now_utc();
        let changed = payload.updates.changed_fields();
        let mut store = self.open_store()?;
        store
            .append_audit(&AuditEntry {
                memory_id: payload.memory_id,
                action: AuditAction::Update,
                details: json!({ "updates": payload.updates, "changedFields": changed }),
                timestamp: payload.timestamp,
                recorded_at: now,
            })
            .map_err(storage_err)?;

        let day = utc_day(payload.timestamp);
        store
            .increment_counter(CounterFamily::Updates, day, "total_updates")
            .map_err(storage_err)?;
        if payload.updates.title.is_some() {
            store
                .increment_counter(CounterFamily::Updates, day, "title_updates")
                .map_err(storage_err)?;
        }
        if payload.updates.status.is_some() {
            store
                .increment_counter(CounterFamily::Updates, day, "status_updates")
                .map_err(storage_err)?;
        }
        if payload.updates.description.is_some() {
            store
                .increment_counter(CounterFamily::Updates, day, "description_updates")
                .map_err(storage_err)?;
        }

        self.bus.emit(Event::TrackAnalytics(AnalyticsEvent {
            event: EVENT_MEMORY_UPDATED.to_string(),
            memory_id: Some(payload.memory_id),
            timestamp: payload.timestamp,
            metadata: serde_json::Map::new(),
        }));
        Ok(())
    }

    async fn deletion_side_effects(
        &self,
        payload: &MemoryDeletedPayload,
    ) -> Result<(), ChronicleError> {
        let id = payload.memory_id;
        let now = OffsetDateTime::now_utc();

        // Each cleanup step is contained: a failure is logged and the
        // remaining steps still run.
        contain("audit-entry", id, self.record_delete_audit(payload, now));
        contain(
            "schedule",
            id,
            self.cleanup_with(id, |store, id| store.delete_schedule(id).map(|_| ())),
        );
        contain("vector-index", id, self.capabilities.index.remove(id).await);
        contain(
            "embedding-rows",
            id,
            self.cleanup_with(id, |store, id| {
                store.delete_embeddings_for(id).map(|_| ())
            }),
        );
        contain(
            "notification-history",
            id,
            self.cleanup_with(id, |store, id| {
                store.delete_notification_history(id).map(|_| ())
            }),
        );
        contain(
            "analysis-history",
            id,
            self.cleanup_with(id, |store, id| {
                store.delete_analysis_history(id).map(|_| ())
            }),
        );
        contain(
            "reanalysis-history",
            id,
            self.cleanup_with(id, |store, id| {
                store.delete_reanalysis_history(id).map(|_| ())
            }),
        );
        contain(
            "deletion-counter",
            id,
            self.bump_deletion_counter(payload.timestamp),
        );

        let mut metadata = serde_json::Map::new();
        metadata.insert("title".to_string(), json!(payload.title));
        self.bus.emit(Event::TrackAnalytics(AnalyticsEvent {
            event: EVENT_MEMORY_DELETED.to_string(),
            memory_id: Some(id),
            timestamp: payload.timestamp,
            metadata,
        }));
        Ok(())
    }

    fn record_delete_audit(
        &self,
        payload: &MemoryDeletedPayload,
        now: OffsetDateTime,
    ) -> Result<(), ChronicleError> {
        let mut store = self.open_store()?;
        store
            .append_audit(&AuditEntry {
                memory_id: payload.memory_id,
                action: AuditAction::Delete,
                details: json!({ "title": payload.title }),
                timestamp: payload.timestamp,
                recorded_at: now,
            })
            .map_err(storage_err)
    }

    fn cleanup_with(
        &self,
        id: MemoryId,
        step: fn(&mut SqliteStore, MemoryId) -> anyhow::Result<()>,
    ) -> Result<(), ChronicleError> {
        let mut store = self.open_store()?;
        step(&mut store, id).map_err(storage_err)
    }

    fn bump_deletion_counter(&self, timestamp: OffsetDateTime) -> Result<(), ChronicleError> {
        let mut store = self.open_store()?;
        store
            .increment_counter(CounterFamily::Deletions, utc_day(timestamp), "total_deletions")
            .map_err(storage_err)
    }

    /// Best-effort aggregation: failures are logged and swallowed so the
    /// primary pipeline never waits on analytics.
    fn aggregate_analytics(&self, event: &AnalyticsEvent) {
        let now = OffsetDateTime::now_utc();
        match self.open_store() {
            Ok(mut store) => {
                if let Err(err) = store.record_analytics_event(event, now).map_err(storage_err) {
                    warn!(event = %event.event, error = %err, "failed to record analytics event");
                }
                let day = utc_day(event.timestamp);
                if let Err(err) = store
                    .increment_counter(CounterFamily::Analytics, day, &event.event)
                    .map_err(storage_err)
                {
                    warn!(event = %event.event, error = %err, "failed to bump analytics counter");
                }
            }
            Err(err) => warn!(event = %event.event, error = %err, "failed to open store for analytics"),
        }
    }

    /// Earliest persisted deadline, if any.
    ///
    /// # Errors
    /// `Storage` when the schedule table cannot be read.
    pub fn next_deadline(&self) -> Result<Option<OffsetDateTime>, ChronicleError> {
        let store = self.open_store()?;
        Ok(store
            .next_schedule()
            .map_err(storage_err)?
            .map(|record| record.scheduled_for))
    }

    /// Fire everything due at `now`. Per-memory failures are logged so one
    /// bad record cannot wedge the loop; returns how many memories fired
    /// cleanly.
    pub async fn fire_due(&self, now: OffsetDateTime) -> usize {
        let due = {
            let store = match self.open_store() {
                Ok(store) => store,
                Err(err) => {
                    warn!(error = %err, "failed to open store for due schedules");
                    return 0;
                }
            };
            match store.due_schedules(now).map_err(storage_err) {
                Ok(due) => due,
                Err(err) => {
                    warn!(error = %err, "failed to read due schedules");
                    return 0;
                }
            }
        };
        let mut fired = 0;
        for record in due {
            let result = with_retries(&self.retry, "reactivate", || {
                self.reactivate(record.memory_id)
            })
            .await;
            match result {
                Ok(()) => fired += 1,
                Err(err) => {
                    warn!(memory_id = %record.memory_id, error = %err, "reactivation failed");
                }
            }
        }
        fired
    }

    /// Restart recovery: re-plan scheduled memories whose schedule row was
    /// lost. Persisted deadlines cover everything else.
    ///
    /// # Errors
    /// `Storage` when the sweep query fails.
    pub fn recover_schedules(&self) -> Result<usize, ChronicleError> {
        let orphans = {
            let store = self.open_store()?;
            store.unscheduled_pending().map_err(storage_err)?
        };
        let mut recovered = 0;
        for memory in orphans {
            let now = OffsetDateTime::now_utc();
            match plan_reactivation(&memory, now) {
                ScheduleDecision::Skip => {}
                ScheduleDecision::Immediate { scheduled_for } => {
                    self.bus
                        .emit(Event::MemoryReactivationScheduled(ReactivationScheduledPayload {
                            memory_id: memory.id,
                            scheduled_for,
                            delay_ms: None,
                            immediate: Some(true),
                        }));
                    recovered += 1;
                }
                ScheduleDecision::Defer {
                    scheduled_for,
                    delay_ms,
                } => {
                    let mut store = self.open_store()?;
                    store
                        .put_schedule(&ScheduleRecord {
                            memory_id: memory.id,
                            scheduled_for,
                            scheduled_at: now,
                            delay_ms,
                        })
                        .map_err(storage_err)?;
                    recovered += 1;
                }
            }
        }
        if recovered > 0 {
            info!(recovered, "recovered schedules for pending memories");
            self.scheduler.rearm();
        }
        Ok(recovered)
    }

    /// Work through everything queued on the bus inline, including events the
    /// handlers themselves emit. Tests and the CLI runner use this; the
    /// service dispatches concurrently instead.
    pub async fn drain(&self, events: &mut UnboundedReceiver<Event>) -> usize {
        let mut handled = 0;
        while let Ok(event) = events.try_recv() {
            let topic = event.topic();
            if let Err(err) = self.handle(event).await {
                warn!(topic, error = %err, "event handler failed");
            }
            handled += 1;
        }
        handled
    }
}

fn type_metadata(memory_type: MemoryType) -> serde_json::Map<String, serde_json::Value> {
    let mut metadata = serde_json::Map::new();
    metadata.insert("type".to_string(), json!(memory_type.as_str()));
    metadata
}

fn context_block(memory: &Memory) -> Result<String, ChronicleError> {
    let created = memory
        .created_at
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| ChronicleError::Storage(format!("timestamp formatting failed: {err}")))?;
    Ok(format!(
        "[{}] {}\n{}\nCreated: {}",
        memory.memory_type.as_str(),
        memory.title,
        memory.description,
        created
    ))
}

fn contain(step: &'static str, id: MemoryId, result: Result<(), ChronicleError>) {
    if let Err(err) = result {
        warn!(memory_id = %id, step, error = %err, "deletion cleanup step failed");
    }
}

/// Spawn a handler task per event until the bus closes. Handlers own their
/// retries; a final failure is logged here.
pub async fn run_dispatcher(pipeline: Arc<Pipeline>, mut events: UnboundedReceiver<Event>) {
    while let Some(event) = events.recv().await {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move {
            let topic = event.topic();
            if let Err(err) = pipeline.handle(event).await {
                warn!(topic, error = %err, "event handler failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Mutex;

    use anyhow::Result;
    use async_trait::async_trait;
    use chronicle_core::{Analysis, EmbeddingId, Severity, TriggerType, ANALYTICS_SOURCE};
    use time::Duration;
    use ulid::Ulid;

    use super::*;
    use crate::providers::{
        EnrichmentProvider, HeuristicEnrichment, NotificationTransport, SqliteVectorIndex,
        VectorIndex, VectorMatch,
    };

    fn temp_db_path(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("chronicle-stages-{label}-{}.sqlite3", Ulid::new()))
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 4,
            backoff_multiplier: 2.0,
        }
    }

    fn draft(
        title: &str,
        trigger_type: TriggerType,
        trigger_date: Option<OffsetDateTime>,
    ) -> MemoryDraft {
        MemoryDraft {
            title: title.to_string(),
            description: "Deploy failed because the connection pool was exhausted. \
                          We should load test pool limits before launch."
                .to_string(),
            memory_type: MemoryType::Failure,
            trigger_type,
            trigger_date,
            team_id: "platform".to_string(),
            tags: vec!["incident".to_string()],
            severity: Some(Severity::High),
        }
    }

    #[derive(Default)]
    struct CountingNotifier {
        calls: AtomicUsize,
        fail_first: AtomicUsize,
        deliveries: Mutex<Vec<(Channel, MemoryId)>>,
    }

    impl CountingNotifier {
        fn failing_first(failures: usize) -> Self {
            let notifier = Self::default();
            notifier.fail_first.store(failures, AtomicOrdering::SeqCst);
            notifier
        }

        fn calls(&self) -> usize {
            self.calls.load(AtomicOrdering::SeqCst)
        }

        fn delivered(&self) -> Vec<(Channel, MemoryId)> {
            match self.deliveries.lock() {
                Ok(deliveries) => deliveries.clone(),
                Err(err) => panic!("notifier mutex poisoned: {err}"),
            }
        }
    }

    #[async_trait]
    impl NotificationTransport for CountingNotifier {
        async fn deliver(
            &self,
            channel: Channel,
            notification: &Notification,
        ) -> Result<(), ChronicleError> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            if self.fail_first.load(AtomicOrdering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, AtomicOrdering::SeqCst);
                return Err(ChronicleError::capability(
                    "notification",
                    "transient delivery failure",
                ));
            }
            match self.deliveries.lock() {
                Ok(mut deliveries) => deliveries.push((channel, notification.memory_id)),
                Err(err) => panic!("notifier mutex poisoned: {err}"),
            }
            Ok(())
        }
    }

    struct FlakyEnrichment {
        inner: HeuristicEnrichment,
        classify_failures: AtomicUsize,
        classify_calls: AtomicUsize,
    }

    impl FlakyEnrichment {
        fn failing_first(failures: usize) -> Self {
            Self {
                inner: HeuristicEnrichment,
                classify_failures: AtomicUsize::new(failures),
                classify_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EnrichmentProvider for FlakyEnrichment {
        async fn classify(&self, text: &str) -> Result<Analysis, ChronicleError> {
            self.classify_calls.fetch_add(1, AtomicOrdering::SeqCst);
            if self.classify_failures.load(AtomicOrdering::SeqCst) > 0 {
                self.classify_failures.fetch_sub(1, AtomicOrdering::SeqCst);
                return Err(ChronicleError::capability(
                    "enrichment",
                    "transient classify failure",
                ));
            }
            self.inner.classify(text).await
        }

        async fn reanalyze(
            &self,
            memory: &Memory,
            now: OffsetDateTime,
        ) -> Result<String, ChronicleError> {
            self.inner.reanalyze(memory, now).await
        }

        async fn answer(&self, question: &str, context: &str) -> Result<String, ChronicleError> {
            self.inner.answer(question, context).await
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>, ChronicleError> {
            self.inner.embed(text).await
        }
    }

    struct RemoveFailsIndex {
        inner: SqliteVectorIndex,
    }

    #[async_trait]
    impl VectorIndex for RemoveFailsIndex {
        async fn upsert(
            &self,
            memory_id: MemoryId,
            team_id: &str,
            vector: &[f32],
        ) -> Result<EmbeddingId, ChronicleError> {
            self.inner.upsert(memory_id, team_id, vector).await
        }

        async fn search(
            &self,
            vector: &[f32],
            team_id: Option<&str>,
            limit: usize,
        ) -> Result<Vec<VectorMatch>, ChronicleError> {
            self.inner.search(vector, team_id, limit).await
        }

        async fn remove(&self, _memory_id: MemoryId) -> Result<(), ChronicleError> {
            Err(ChronicleError::capability(
                "vector-index",
                "remove always fails",
            ))
        }
    }

    struct Harness {
        pipeline: Arc<Pipeline>,
        events: UnboundedReceiver<Event>,
        db_path: PathBuf,
    }

    impl Harness {
        async fn drain(&mut self) -> usize {
            self.pipeline.drain(&mut self.events).await
        }

        fn store(&self) -> Result<SqliteStore> {
            let mut store = SqliteStore::open(&self.db_path)?;
            store.migrate()?;
            Ok(store)
        }

        fn cleanup(&self) {
            let _ = std::fs::remove_file(&self.db_path);
        }
    }

    fn harness_with(
        label: &str,
        enrichment: Arc<dyn EnrichmentProvider>,
        notifier: Arc<dyn NotificationTransport>,
    ) -> Harness {
        let db_path = temp_db_path(label);
        let capabilities = Capabilities {
            enrichment,
            index: Arc::new(SqliteVectorIndex::new(db_path.clone())),
            notifier,
        };
        let (bus, events) = EventBus::channel();
        let pipeline = Arc::new(Pipeline::new(
            db_path.clone(),
            capabilities,
            bus,
            SchedulerHandle::new(),
            quick_retry(),
            vec![Channel::InApp, Channel::Email],
        ));
        Harness {
            pipeline,
            events,
            db_path,
        }
    }

    fn harness(label: &str) -> Harness {
        harness_with(
            label,
            Arc::new(HeuristicEnrichment),
            Arc::new(CountingNotifier::default()),
        )
    }

    // Test IDs: TPIPE-001
    #[tokio::test]
    async fn create_runs_analysis_and_embedding_to_completion() -> Result<()> {
        let mut h = harness("full-chain");
        let memory = h
            .pipeline
            .create(draft("Postgres pool exhaustion", TriggerType::None, None))?;
        assert_eq!(memory.status, MemoryStatus::Active);

        let handled = h.drain().await;
        assert!(handled >= 4);

        let stored = h.pipeline.get(memory.id)?;
        assert_eq!(stored.status, MemoryStatus::Active);
        assert!(stored.ai_summary.is_some());
        assert_eq!(stored.ai_category.as_deref(), Some("incident"));
        assert!(stored.embedding_id.is_some());

        let store = h.store()?;
        assert_eq!(store.analysis_history(memory.id)?.len(), 1);
        assert!(store.get_schedule(memory.id)?.is_none());
        let day = utc_day(OffsetDateTime::now_utc());
        let counters = store.counters_for(CounterFamily::Analytics, day)?;
        assert_eq!(counters.get(EVENT_MEMORY_CREATED), Some(&1));

        h.cleanup();
        Ok(())
    }

    // Test IDs: TPIPE-002
    #[tokio::test]
    async fn past_trigger_dates_fire_immediately() -> Result<()> {
        let notifier = Arc::new(CountingNotifier::default());
        let mut h = harness_with(
            "immediate",
            Arc::new(HeuristicEnrichment),
            notifier.clone(),
        );

        let past = OffsetDateTime::now_utc() - Duration::hours(2);
        let memory = h.pipeline.create(draft(
            "Revisit pool sizing",
            TriggerType::Date,
            Some(past),
        ))?;
        assert_eq!(memory.status, MemoryStatus::Scheduled);

        h.drain().await;

        let stored = h.pipeline.get(memory.id)?;
        assert_eq!(stored.status, MemoryStatus::Triggered);
        assert!(stored.triggered_at.is_some());

        let store = h.store()?;
        assert_eq!(store.reanalysis_history(memory.id)?.len(), 1);
        assert_eq!(store.notification_history(memory.id)?.len(), 1);
        assert!(store.get_schedule(memory.id)?.is_none());

        let day = utc_day(OffsetDateTime::now_utc());
        let counters = store.counters_for(CounterFamily::Notifications, day)?;
        assert_eq!(counters.get("total"), Some(&1));
        assert_eq!(counters.get("in-app"), Some(&1));
        assert_eq!(counters.get("email"), Some(&1));
        assert_eq!(counters.get("push"), Some(&0));
        assert_eq!(notifier.delivered().len(), 2);

        h.cleanup();
        Ok(())
    }

    // Test IDs: TPIPE-003
    #[tokio::test]
    async fn future_trigger_dates_defer_and_fire_once() -> Result<()> {
        let mut h = harness("deferred");
        let future = OffsetDateTime::now_utc() + Duration::days(2);
        let memory = h.pipeline.create(draft(
            "Revisit caching decision",
            TriggerType::Date,
            Some(future),
        ))?;

        h.drain().await;

        let store = h.store()?;
        let schedule = match store.get_schedule(memory.id)? {
            Some(schedule) => schedule,
            None => panic!("expected a persisted schedule"),
        };
        assert!(schedule.delay_ms > 0);
        assert_eq!(schedule.scheduled_for, future);
        assert_eq!(store.reanalysis_history(memory.id)?.len(), 0);
        assert_eq!(h.pipeline.get(memory.id)?.status, MemoryStatus::Scheduled);
        drop(store);

        let fired = h
            .pipeline
            .fire_due(OffsetDateTime::now_utc() + Duration::days(3))
            .await;
        assert_eq!(fired, 1);
        h.drain().await;

        let stored = h.pipeline.get(memory.id)?;
        assert_eq!(stored.status, MemoryStatus::Triggered);

        // A duplicate wake-up stops at the eligibility guard.
        h.pipeline.reactivate(memory.id).await?;
        h.drain().await;
        let store = h.store()?;
        assert_eq!(store.reanalysis_history(memory.id)?.len(), 1);
        assert_eq!(store.notification_history(memory.id)?.len(), 1);

        h.cleanup();
        Ok(())
    }

    // Test IDs: TPIPE-004
    #[tokio::test]
    async fn updates_audit_and_count_changed_fields() -> Result<()> {
        let mut h = harness("update");
        let memory = h
            .pipeline
            .create(draft("Original title", TriggerType::None, None))?;
        h.drain().await;

        let patch = MemoryPatch {
            title: Some("Sharper title".to_string()),
            ..MemoryPatch::default()
        };
        let updated = h.pipeline.update(memory.id, &patch)?;
        assert_eq!(updated.title, "Sharper title");
        h.drain().await;

        let store = h.store()?;
        let audit = store.audit_entries(Some(memory.id))?;
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, AuditAction::Update);
        assert_eq!(
            audit[0].details.get("changedFields"),
            Some(&json!(["title"]))
        );

        let day = utc_day(OffsetDateTime::now_utc());
        let updates = store.counters_for(CounterFamily::Updates, day)?;
        assert_eq!(updates.get("total_updates"), Some(&1));
        assert_eq!(updates.get("title_updates"), Some(&1));
        assert_eq!(updates.get("status_updates"), Some(&0));
        let analytics = store.counters_for(CounterFamily::Analytics, day)?;
        assert_eq!(analytics.get(EVENT_MEMORY_UPDATED), Some(&1));

        h.cleanup();
        Ok(())
    }

    // Test IDs: TPIPE-005
    #[tokio::test]
    async fn entry_points_surface_not_found_and_validation() -> Result<()> {
        let mut h = harness("errors");
        let ghost = MemoryId::new();
        assert!(matches!(
            h.pipeline.get(ghost),
            Err(ChronicleError::NotFound { .. })
        ));
        assert!(matches!(
            h.pipeline.update(ghost, &MemoryPatch::default()),
            Err(ChronicleError::NotFound { .. })
        ));
        assert!(matches!(
            h.pipeline.delete(ghost),
            Err(ChronicleError::NotFound { .. })
        ));

        let memory = h
            .pipeline
            .create(draft("Archive me", TriggerType::None, None))?;
        h.drain().await;
        let archive = MemoryPatch {
            status: Some(MemoryStatus::Archived),
            ..MemoryPatch::default()
        };
        h.pipeline.update(memory.id, &archive)?;
        let reopen = MemoryPatch {
            status: Some(MemoryStatus::Triggered),
            ..MemoryPatch::default()
        };
        assert!(matches!(
            h.pipeline.update(memory.id, &reopen),
            Err(ChronicleError::Validation(_))
        ));

        h.cleanup();
        Ok(())
    }

    // Test IDs: TPIPE-006
    #[tokio::test]
    async fn deletion_cleans_up_and_counts() -> Result<()> {
        let mut h = harness("delete");
        let memory = h
            .pipeline
            .create(draft("Short-lived memory", TriggerType::None, None))?;
        h.drain().await;

        let deleted = h.pipeline.delete(memory.id)?;
        assert_eq!(
            deleted.message,
            "Memory \"Short-lived memory\" deleted successfully"
        );
        h.drain().await;

        assert!(matches!(
            h.pipeline.get(memory.id),
            Err(ChronicleError::NotFound { .. })
        ));

        let store = h.store()?;
        let audit = store.audit_entries(Some(memory.id))?;
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, AuditAction::Delete);
        assert!(store.embeddings_all()?.is_empty());
        assert_eq!(store.analysis_history(memory.id)?.len(), 0);

        let day = utc_day(OffsetDateTime::now_utc());
        let deletions = store.counters_for(CounterFamily::Deletions, day)?;
        assert_eq!(deletions.get("total_deletions"), Some(&1));
        let analytics = store.counters_for(CounterFamily::Analytics, day)?;
        assert_eq!(analytics.get(EVENT_MEMORY_DELETED), Some(&1));

        h.cleanup();
        Ok(())
    }

    // Test IDs: TPIPE-007
    #[tokio::test]
    async fn deletion_cleanup_is_contained_per_step() -> Result<()> {
        let db_path = temp_db_path("contained");
        let capabilities = Capabilities {
            enrichment: Arc::new(HeuristicEnrichment),
            index: Arc::new(RemoveFailsIndex {
                inner: SqliteVectorIndex::new(db_path.clone()),
            }),
            notifier: Arc::new(CountingNotifier::default()),
        };
        let (bus, mut events) = EventBus::channel();
        let pipeline = Pipeline::new(
            db_path.clone(),
            capabilities,
            bus,
            SchedulerHandle::new(),
            quick_retry(),
            vec![Channel::InApp],
        );

        let memory = pipeline.create(draft("Doomed cleanup", TriggerType::None, None))?;
        pipeline.drain(&mut events).await;
        pipeline.delete(memory.id)?;
        pipeline.drain(&mut events).await;

        let mut store = SqliteStore::open(&db_path)?;
        store.migrate()?;
        // The failing index step did not stop audit, history or counters.
        assert_eq!(store.audit_entries(Some(memory.id))?.len(), 1);
        assert_eq!(store.analysis_history(memory.id)?.len(), 0);
        let day = utc_day(OffsetDateTime::now_utc());
        let deletions = store.counters_for(CounterFamily::Deletions, day)?;
        assert_eq!(deletions.get("total_deletions"), Some(&1));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TPIPE-008
    #[tokio::test]
    async fn failed_delivery_releases_the_claim_and_retries() -> Result<()> {
        let notifier = Arc::new(CountingNotifier::failing_first(1));
        let mut h = harness_with(
            "notify-retry",
            Arc::new(HeuristicEnrichment),
            notifier.clone(),
        );

        let past = OffsetDateTime::now_utc() - Duration::minutes(5);
        let memory = h
            .pipeline
            .create(draft("Flaky channel", TriggerType::Date, Some(past)))?;
        h.drain().await;

        // First call failed, the claim was released, and the stage retry
        // delivered to both channels.
        assert_eq!(notifier.calls(), 3);
        assert_eq!(notifier.delivered().len(), 2);
        let store = h.store()?;
        assert_eq!(store.notification_history(memory.id)?.len(), 1);
        let day = utc_day(OffsetDateTime::now_utc());
        let counters = store.counters_for(CounterFamily::Notifications, day)?;
        assert_eq!(counters.get("total"), Some(&1));

        h.cleanup();
        Ok(())
    }

    // Test IDs: TPIPE-009
    #[tokio::test]
    async fn ask_grounds_answers_in_retrieved_memories() -> Result<()> {
        let mut h = harness("ask");
        let relevant = h.pipeline.create(draft(
            "Postgres connection pool exhaustion",
            TriggerType::None,
            None,
        ))?;
        let mut other = draft("Quarterly roadmap narrative", TriggerType::None, None);
        other.description = "Planning notes for the quarter ahead.".to_string();
        other.memory_type = MemoryType::Context;
        let _unrelated = h.pipeline.create(other)?;
        h.drain().await;

        let outcome = h
            .pipeline
            .ask(
                "Why did the postgres connection pool get exhausted?",
                Some("platform"),
            )
            .await?;
        assert_ne!(outcome.answer, NO_MATCH_ANSWER);
        assert!(!outcome.sources.is_empty());
        assert_eq!(outcome.sources[0].memory_id, relevant.id);
        assert!(outcome.sources[0].relevance > 0.0);

        let empty = h
            .pipeline
            .ask("Why did the postgres connection pool get exhausted?", Some("nobody"))
            .await?;
        assert_eq!(empty.answer, NO_MATCH_ANSWER);
        assert!(empty.sources.is_empty());

        h.drain().await;
        let store = h.store()?;
        let day = utc_day(OffsetDateTime::now_utc());
        let analytics = store.counters_for(CounterFamily::Analytics, day)?;
        assert_eq!(analytics.get(EVENT_QUESTION_ANSWERED), Some(&2));

        h.cleanup();
        Ok(())
    }

    // Test IDs: TPIPE-010
    #[tokio::test]
    async fn unknown_analytics_events_are_stamped_and_counted() -> Result<()> {
        let h = harness("analytics");
        let mut metadata = serde_json::Map::new();
        metadata.insert("flavor".to_string(), json!("spicy"));
        h.pipeline
            .handle(Event::TrackAnalytics(AnalyticsEvent {
                event: "memory_roasted".to_string(),
                memory_id: None,
                timestamp: OffsetDateTime::now_utc(),
                metadata,
            }))
            .await?;

        let store = h.store()?;
        let raw = store.analytics_events(Some("memory_roasted"))?;
        assert_eq!(raw.len(), 1);
        assert_eq!(
            raw[0].get("source").and_then(|v| v.as_str()),
            Some(ANALYTICS_SOURCE)
        );
        assert!(raw[0].get("trackedAt").is_some());
        assert_eq!(
            raw[0].get("flavor").and_then(|v| v.as_str()),
            Some("spicy")
        );
        let day = utc_day(OffsetDateTime::now_utc());
        let counters = store.counters_for(CounterFamily::Analytics, day)?;
        assert_eq!(counters.get("memory_roasted"), Some(&1));

        h.cleanup();
        Ok(())
    }

    // Test IDs: TPIPE-011
    #[tokio::test]
    async fn recovery_replans_scheduled_memories_without_rows() -> Result<()> {
        let mut h = harness("recovery");
        let now = OffsetDateTime::now_utc();

        let deferred = Memory::new(
            draft("Lost deferred schedule", TriggerType::Date, Some(now + Duration::days(1))),
            now,
        )?;
        let due = Memory::new(
            draft("Lost due schedule", TriggerType::Date, Some(now - Duration::hours(1))),
            now,
        )?;
        {
            let mut store = h.store()?;
            store.insert_memory(&deferred)?;
            store.insert_memory(&due)?;
            assert_eq!(store.unscheduled_pending()?.len(), 2);
        }

        let recovered = h.pipeline.recover_schedules()?;
        assert_eq!(recovered, 2);

        let store = h.store()?;
        assert!(store.get_schedule(deferred.id)?.is_some());
        assert!(store.get_schedule(due.id)?.is_none());
        drop(store);

        // The already-due memory went through the immediate path.
        h.drain().await;
        assert_eq!(h.pipeline.get(due.id)?.status, MemoryStatus::Triggered);
        assert_eq!(h.pipeline.get(deferred.id)?.status, MemoryStatus::Scheduled);

        h.cleanup();
        Ok(())
    }

    // Test IDs: TPIPE-012
    #[tokio::test]
    async fn transient_classify_failures_are_retried() -> Result<()> {
        let enrichment = Arc::new(FlakyEnrichment::failing_first(2));
        let mut h = harness_with(
            "flaky-classify",
            enrichment.clone(),
            Arc::new(CountingNotifier::default()),
        );

        let memory = h
            .pipeline
            .create(draft("Eventually analyzed", TriggerType::None, None))?;
        h.drain().await;

        assert_eq!(enrichment.classify_calls.load(AtomicOrdering::SeqCst), 3);
        let stored = h.pipeline.get(memory.id)?;
        assert!(stored.ai_summary.is_some());
        assert!(stored.embedding_id.is_some());

        h.cleanup();
        Ok(())
    }
}
