//! Per-source business logic binding fetch + embed + store into the queue
//! protocol.
//!
//! Failure semantics: transient upstream trouble defers with an aging
//! budget; malformed or absent upstream items are drained (diagnosed, then
//! completed so they leave the work set); embedding failures stay in `error`
//! for operator replay; a crash mid-processing is covered by the stale-lock
//! reaper.

use std::sync::Arc;

use crate::config::IngestConfig;
use crate::embedder::Embed;
use crate::fetcher::Fetch;
use crate::queue::{QueueEntry, QueueId};
use crate::record::{secondary_embedding_prompt, ThesisRecord};
use crate::retry::{fetch_with_policy, UpstreamOutcome};
use crate::store::{Artifact, Store, StoreError};

/// What a dispatch reports back to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub ok: bool,
    /// True when the upstream looked transiently unhealthy; feeds the
    /// circuit breaker.
    pub transient: bool,
}

impl DispatchOutcome {
    pub const DONE: Self = Self { ok: true, transient: false };
    pub const FAILED: Self = Self { ok: false, transient: false };
    pub const TRANSIENT: Self = Self { ok: false, transient: true };
}

pub struct PrimaryProcessor {
    store: Arc<dyn Store>,
    fetcher: Arc<dyn Fetch>,
    embedder: Arc<dyn Embed>,
    cfg: Arc<IngestConfig>,
}

impl PrimaryProcessor {
    pub fn new(
        store: Arc<dyn Store>,
        fetcher: Arc<dyn Fetch>,
        embedder: Arc<dyn Embed>,
        cfg: Arc<IngestConfig>,
    ) -> Self {
        Self { store, fetcher, embedder, cfg }
    }

    /// Record the diagnosis and complete the entry so it leaves the work set.
    async fn drain(&self, key: &str, message: &str) -> Result<(), StoreError> {
        self.store.mark_error(QueueId::Primary, key, message).await?;
        self.store.mark_completed(QueueId::Primary, key).await
    }

    pub async fn process(&self, entry: &QueueEntry) -> Result<DispatchOutcome, StoreError> {
        let key = entry.key.as_str();

        // At-least-once dedup: a restart or a concurrent worker may have
        // finished this item between seeding and this claim.
        if self.store.artifact_is_processed(QueueId::Primary, key).await? {
            self.store.mark_completed(QueueId::Primary, key).await?;
            tracing::debug!(registro = key, "artifact already processed; completing");
            return Ok(DispatchOutcome::DONE);
        }

        let url = format!("{}{}", self.cfg.primary_url_base, key);
        let body = match fetch_with_policy(self.fetcher.as_ref(), &url, &self.cfg.retry).await {
            UpstreamOutcome::Body(body) => body,
            UpstreamOutcome::Absent(status) => {
                tracing::info!(registro = key, status, "thesis absent upstream; draining");
                self.drain(key, &format!("HTTP {status}")).await?;
                return Ok(DispatchOutcome::DONE);
            }
            UpstreamOutcome::TerminalOther(status) => {
                tracing::warn!(registro = key, status, "unexpected upstream status; draining");
                self.drain(key, &format!("HTTP {status}")).await?;
                return Ok(DispatchOutcome::DONE);
            }
            UpstreamOutcome::TransientExhausted(reason) => {
                let state = self
                    .store
                    .mark_deferred_or_unavailable(QueueId::Primary, key, &reason)
                    .await?;
                tracing::warn!(
                    registro = key,
                    state = state.as_str(),
                    reason = %reason,
                    "upstream transient; rescheduling"
                );
                return Ok(DispatchOutcome::TRANSIENT);
            }
        };

        let (record, raw) = match ThesisRecord::parse(&body) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!(registro = key, error = %err, "undecodable thesis body; draining");
                self.drain(key, &format!("parse-invalid: {err}")).await?;
                return Ok(DispatchOutcome::FAILED);
            }
        };

        if !record.has_required_fields() {
            tracing::warn!(registro = key, "thesis missing rubro/texto; draining");
            self.drain(key, "payload-missing: rubro/texto blank").await?;
            return Ok(DispatchOutcome::DONE);
        }

        let vector = if self.cfg.embedding_wanted(record.anio) {
            match self.embedder.embed(&record.embedding_prompt(key)).await {
                Some(vector) => Some(vector),
                None => {
                    // Stays in `error`; the retry-errors endpoint replays it.
                    self.store
                        .mark_error(QueueId::Primary, key, "embed-failed: no vector after retries")
                        .await?;
                    tracing::warn!(registro = key, "embedding failed; leaving in error");
                    return Ok(DispatchOutcome::FAILED);
                }
            }
        } else {
            None
        };

        let artifact = Artifact {
            key: key.to_string(),
            fields: raw,
            materias: record.materias.normalize(),
            vector,
        };
        self.store.upsert_artifact(QueueId::Primary, &artifact).await?;
        self.store.mark_completed(QueueId::Primary, key).await?;
        tracing::info!(
            registro = key,
            anio = record.anio,
            vectorized = artifact.vector.is_some(),
            "thesis ingested"
        );
        Ok(DispatchOutcome::DONE)
    }
}

pub struct SecondaryProcessor {
    store: Arc<dyn Store>,
    embedder: Arc<dyn Embed>,
}

impl SecondaryProcessor {
    pub fn new(store: Arc<dyn Store>, embedder: Arc<dyn Embed>) -> Self {
        Self { store, embedder }
    }

    async fn drain(&self, key: &str, message: &str) -> Result<(), StoreError> {
        self.store.mark_error(QueueId::Secondary, key, message).await?;
        self.store.mark_completed(QueueId::Secondary, key).await
    }

    pub async fn process(&self, entry: &QueueEntry) -> Result<DispatchOutcome, StoreError> {
        let key = entry.key.as_str();

        if self.store.artifact_is_processed(QueueId::Secondary, key).await? {
            self.store.mark_completed(QueueId::Secondary, key).await?;
            tracing::debug!(doc = key, "document already processed; completing");
            return Ok(DispatchOutcome::DONE);
        }

        let Some(payload) = entry.payload.as_ref() else {
            self.store
                .mark_error(QueueId::Secondary, key, "invariant-violated: entry has no payload")
                .await?;
            tracing::error!(doc = key, "secondary entry carries no payload");
            return Ok(DispatchOutcome::FAILED);
        };

        if payload.rubro.trim().is_empty() || payload.texto.trim().is_empty() {
            tracing::warn!(doc = key, "document missing rubro/texto; draining");
            self.drain(key, "payload-missing: rubro/texto blank").await?;
            return Ok(DispatchOutcome::DONE);
        }

        // No year gate here: the local corpus always embeds.
        let Some(vector) = self.embedder.embed(&secondary_embedding_prompt(payload)).await else {
            self.store
                .mark_error(QueueId::Secondary, key, "embed-failed: no vector after retries")
                .await?;
            tracing::warn!(doc = key, "embedding failed; leaving in error");
            return Ok(DispatchOutcome::FAILED);
        };

        let artifact = Artifact {
            key: key.to_string(),
            fields: serde_json::to_value(payload).unwrap_or_default(),
            materias: "N/A".to_string(),
            vector: Some(vector),
        };
        self.store.upsert_artifact(QueueId::Secondary, &artifact).await?;
        self.store.mark_completed(QueueId::Secondary, key).await?;
        tracing::info!(doc = key, "document ingested");
        Ok(DispatchOutcome::DONE)
    }
}
