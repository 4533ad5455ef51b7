use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chronicle_core::{
    Analysis, Channel, ChronicleError, EmbeddingId, Memory, MemoryId, Notification,
};
use chronicle_store_sqlite::SqliteStore;
use serde::Deserialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::info;
use ulid::Ulid;

use crate::config::EnrichmentConfig;

/// AI enrichment behind the pipeline's capability seam.
#[async_trait]
pub trait EnrichmentProvider: Send + Sync {
    /// Classify raw memory text into a structured analysis.
    async fn classify(&self, text: &str) -> Result<Analysis, ChronicleError>;

    /// Produce a fresh read on a memory at reactivation time.
    async fn reanalyze(
        &self,
        memory: &Memory,
        now: OffsetDateTime,
    ) -> Result<String, ChronicleError>;

    /// Answer a question given retrieved memory context.
    async fn answer(&self, question: &str, context: &str) -> Result<String, ChronicleError>;

    /// Embed text into a vector for similarity search.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ChronicleError>;
}

/// One ranked hit from the vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatch {
    pub memory_id: MemoryId,
    pub score: f32,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Store or refresh the vector for a memory, returning its handle.
    async fn upsert(
        &self,
        memory_id: MemoryId,
        team_id: &str,
        vector: &[f32],
    ) -> Result<EmbeddingId, ChronicleError>;

    /// Top `limit` matches by cosine similarity, optionally within one team.
    async fn search(
        &self,
        vector: &[f32],
        team_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<VectorMatch>, ChronicleError>;

    /// Drop every vector stored for a memory.
    async fn remove(&self, memory_id: MemoryId) -> Result<(), ChronicleError>;
}

#[async_trait]
pub trait NotificationTransport: Send + Sync {
    /// Deliver one notification on one channel.
    async fn deliver(
        &self,
        channel: Channel,
        notification: &Notification,
    ) -> Result<(), ChronicleError>;
}

/// The pipeline's external capabilities, bundled for construction.
#[derive(Clone)]
pub struct Capabilities {
    pub enrichment: Arc<dyn EnrichmentProvider>,
    pub index: Arc<dyn VectorIndex>,
    pub notifier: Arc<dyn NotificationTransport>,
}

/// Build the enrichment provider the config selects: HTTP when an endpoint is
/// configured, the offline heuristic otherwise.
#[must_use]
pub fn enrichment_from_config(config: &EnrichmentConfig) -> Arc<dyn EnrichmentProvider> {
    match &config.endpoint {
        Some(endpoint) => Arc::new(HttpEnrichmentProvider::new(
            endpoint.clone(),
            config.model.clone(),
            config.embedding_model.clone(),
            std::env::var(&config.api_key_env).ok(),
        )),
        None => Arc::new(HeuristicEnrichment),
    }
}

const HEURISTIC_DIM: usize = 16;
const SUMMARY_LIMIT: usize = 160;

/// Deterministic enrichment used when no endpoint is configured. Keeps the
/// pipeline runnable offline and test output reproducible.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicEnrichment;

impl HeuristicEnrichment {
    fn category_for(text: &str) -> String {
        let lower = text.to_lowercase();
        if lower.contains("fail")
            || lower.contains("outage")
            || lower.contains("incident")
            || lower.contains("error")
        {
            "incident".to_string()
        } else if lower.contains("decision") || lower.contains("decided") || lower.contains("chose")
        {
            "decision-record".to_string()
        } else if lower.contains("migrat") || lower.contains("upgrade") {
            "migration".to_string()
        } else {
            "general".to_string()
        }
    }

    fn summarize(text: &str) -> String {
        let sentence = text
            .split(['.', '\n'])
            .map(str::trim)
            .find(|part| !part.is_empty())
            .unwrap_or("")
            .to_string();
        if sentence.chars().count() <= SUMMARY_LIMIT {
            sentence
        } else {
            sentence.chars().take(SUMMARY_LIMIT).collect()
        }
    }

    fn root_cause_from(text: &str) -> Option<String> {
        let position = text.find("because").or_else(|| text.find("Because"))?;
        let clause = text[position..].split(['.', '\n']).next()?.trim();
        if clause.is_empty() {
            None
        } else {
            Some(clause.to_string())
        }
    }

    fn lessons_from(text: &str) -> Vec<String> {
        text.split(['.', '\n'])
            .map(str::trim)
            .filter(|part| {
                let lower = part.to_lowercase();
                !part.is_empty()
                    && (lower.contains("should")
                        || lower.contains("must")
                        || lower.contains("avoid")
                        || lower.contains("next time"))
            })
            .take(3)
            .map(ToString::to_string)
            .collect()
    }

    /// Bag-of-words embedding: FNV-1a word hashing into a fixed number of
    /// slots, normalized to unit length. Token overlap shows up as cosine
    /// similarity, which is all the offline provider needs.
    fn embed_vector(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; HEURISTIC_DIM];
        for word in text.split_whitespace() {
            let lower = word.to_lowercase();
            let token = lower.trim_matches(|c: char| !c.is_alphanumeric());
            if token.is_empty() {
                continue;
            }
            let mut state: u64 = 0xcbf2_9ce4_8422_2325;
            for byte in token.bytes() {
                state ^= u64::from(byte);
                state = state.wrapping_mul(0x0000_0100_0000_01b3);
            }
            let slot = usize::try_from(state % HEURISTIC_DIM as u64).unwrap_or(0);
            vector[slot] += 1.0;
        }
        let norm = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EnrichmentProvider for HeuristicEnrichment {
    async fn classify(&self, text: &str) -> Result<Analysis, ChronicleError> {
        Ok(Analysis {
            summary: Self::summarize(text),
            category: Self::category_for(text),
            root_cause: Self::root_cause_from(text),
            lessons: Self::lessons_from(text),
        })
    }

    async fn reanalyze(
        &self,
        memory: &Memory,
        now: OffsetDateTime,
    ) -> Result<String, ChronicleError> {
        let stamp = rfc3339(now)?;
        let summary = memory
            .ai_summary
            .clone()
            .unwrap_or_else(|| Self::summarize(&memory.description));
        Ok(format!("Revisited on {stamp}: {summary}"))
    }

    async fn answer(&self, question: &str, context: &str) -> Result<String, ChronicleError> {
        let titles: Vec<&str> = context
            .lines()
            .filter(|line| line.starts_with('['))
            .collect();
        Ok(format!(
            "Found {} related memories for \"{}\". Closest match: {}",
            titles.len(),
            question.trim(),
            titles.first().copied().unwrap_or("none")
        ))
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ChronicleError> {
        Ok(Self::embed_vector(text))
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

/// OpenAI-compatible HTTP enrichment. The blocking `ureq` calls run on the
/// blocking pool so stage handlers never stall the runtime.
pub struct HttpEnrichmentProvider {
    agent: ureq::Agent,
    endpoint: String,
    model: String,
    embedding_model: String,
    api_key: Option<String>,
}

impl HttpEnrichmentProvider {
    #[must_use]
    pub fn new(
        endpoint: String,
        model: String,
        embedding_model: String,
        api_key: Option<String>,
    ) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(60))
            .build();
        Self {
            agent,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model,
            embedding_model,
            api_key,
        }
    }

    async fn chat(&self, system: String, user: String) -> Result<String, ChronicleError> {
        let agent = self.agent.clone();
        let url = format!("{}/chat/completions", self.endpoint);
        let api_key = self.api_key.clone();
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
        });
        let response: ChatResponse =
            tokio::task::spawn_blocking(move || post_json(&agent, &url, api_key.as_deref(), &body))
                .await
                .map_err(worker_failed)??;
        response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| ChronicleError::capability("enrichment", "response held no choices"))
    }
}

fn worker_failed(err: tokio::task::JoinError) -> ChronicleError {
    ChronicleError::capability("enrichment", format!("worker task failed: {err}"))
}

fn post_json<T: serde::de::DeserializeOwned>(
    agent: &ureq::Agent,
    url: &str,
    api_key: Option<&str>,
    body: &serde_json::Value,
) -> Result<T, ChronicleError> {
    let mut request = agent.post(url).set("Content-Type", "application/json");
    if let Some(key) = api_key {
        request = request.set("Authorization", &format!("Bearer {key}"));
    }
    match request.send_json(body.clone()) {
        Ok(response) => response.into_json::<T>().map_err(|err| {
            ChronicleError::capability("enrichment", format!("invalid response body: {err}"))
        }),
        Err(ureq::Error::Status(code, _)) => Err(ChronicleError::capability(
            "enrichment",
            format!("endpoint returned status {code}"),
        )),
        Err(err) => Err(ChronicleError::capability("enrichment", err.to_string())),
    }
}

#[async_trait]
impl EnrichmentProvider for HttpEnrichmentProvider {
    async fn classify(&self, text: &str) -> Result<Analysis, ChronicleError> {
        let system = concat!(
            "You analyze engineering memories. Reply with JSON only: ",
            "{\"summary\": string, \"category\": string, ",
            "\"rootCause\": string or null, \"lessons\": [string]}"
        )
        .to_string();
        let content = self.chat(system, text.to_string()).await?;
        serde_json::from_str(content.trim()).map_err(|err| {
            ChronicleError::capability("enrichment", format!("unparseable analysis: {err}"))
        })
    }

    async fn reanalyze(
        &self,
        memory: &Memory,
        now: OffsetDateTime,
    ) -> Result<String, ChronicleError> {
        let stamp = rfc3339(now)?;
        let system = format!(
            "This memory is being reactivated on {stamp}. \
             Reassess it briefly for the team in two sentences."
        );
        let user = format!(
            "Title: {}\nDescription: {}\nPrior summary: {}",
            memory.title,
            memory.description,
            memory.ai_summary.clone().unwrap_or_default()
        );
        self.chat(system, user).await
    }

    async fn answer(&self, question: &str, context: &str) -> Result<String, ChronicleError> {
        let system = "Answer the question using only the provided memories. \
                      Say so when they do not cover it."
            .to_string();
        let user = format!("Question: {question}\n\nMemories:\n{context}");
        self.chat(system, user).await
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ChronicleError> {
        let agent = self.agent.clone();
        let url = format!("{}/embeddings", self.endpoint);
        let api_key = self.api_key.clone();
        let body = serde_json::json!({ "model": self.embedding_model, "input": text });
        let response: EmbeddingResponse =
            tokio::task::spawn_blocking(move || post_json(&agent, &url, api_key.as_deref(), &body))
                .await
                .map_err(worker_failed)??;
        response
            .data
            .into_iter()
            .next()
            .map(|row| row.embedding)
            .ok_or_else(|| ChronicleError::capability("enrichment", "response held no embedding"))
    }
}

/// Vector index persisted in the chronicle database and ranked by cosine
/// similarity. A linear scan is fine at the index sizes one team produces.
pub struct SqliteVectorIndex {
    db_path: PathBuf,
}

impl SqliteVectorIndex {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore, ChronicleError> {
        let mut store = SqliteStore::open(&self.db_path).map_err(index_err)?;
        store.migrate().map_err(index_err)?;
        Ok(store)
    }
}

fn index_err(err: anyhow::Error) -> ChronicleError {
    ChronicleError::capability("vector-index", format!("{err:#}"))
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn upsert(
        &self,
        memory_id: MemoryId,
        team_id: &str,
        vector: &[f32],
    ) -> Result<EmbeddingId, ChronicleError> {
        let mut store = self.open_store()?;
        let embedding_id = EmbeddingId(format!("emb_{}", Ulid::new()));
        store.delete_embeddings_for(memory_id).map_err(index_err)?;
        store
            .upsert_embedding(
                &embedding_id,
                memory_id,
                team_id,
                vector,
                OffsetDateTime::now_utc(),
            )
            .map_err(index_err)?;
        Ok(embedding_id)
    }

    async fn search(
        &self,
        vector: &[f32],
        team_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<VectorMatch>, ChronicleError> {
        let store = self.open_store()?;
        let mut matches: Vec<VectorMatch> = store
            .embeddings_all()
            .map_err(index_err)?
            .into_iter()
            .filter(|stored| match team_id {
                Some(team) => stored.team_id == team,
                None => true,
            })
            .map(|stored| VectorMatch {
                memory_id: stored.memory_id,
                score: cosine_similarity(vector, &stored.vector),
            })
            .collect();
        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.memory_id.0.cmp(&b.memory_id.0))
        });
        matches.truncate(limit);
        Ok(matches)
    }

    async fn remove(&self, memory_id: MemoryId) -> Result<(), ChronicleError> {
        let mut store = self.open_store()?;
        store.delete_embeddings_for(memory_id).map_err(index_err)?;
        Ok(())
    }
}

/// Cosine similarity; zero when either vector has no magnitude or the
/// dimensions disagree.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Notification transport that records deliveries in the log stream. Real
/// channel integrations implement `NotificationTransport` the same way.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl NotificationTransport for TracingNotifier {
    async fn deliver(
        &self,
        channel: Channel,
        notification: &Notification,
    ) -> Result<(), ChronicleError> {
        info!(
            channel = channel.as_str(),
            memory_id = %notification.memory_id,
            message = %notification.message,
            "notification delivered"
        );
        Ok(())
    }
}

fn rfc3339(value: OffsetDateTime) -> Result<String, ChronicleError> {
    value.format(&Rfc3339).map_err(|err| {
        ChronicleError::capability("enrichment", format!("timestamp formatting failed: {err}"))
    })
}
