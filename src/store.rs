//! Backend-agnostic store port.
//!
//! Every mutation below must be atomic with respect to concurrent workers
//! sharing the same backing store; the claim in particular is a single
//! find-and-modify so no two workers can hold the same entry.

use std::time::Duration;

use async_trait::async_trait;
use mongodb::bson::DateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::queue::{QueueEntry, QueueId, QueueState, SecondaryPayload};

/// Timing knobs consulted by store transitions.
#[derive(Debug, Clone, Copy)]
pub struct QueueTuning {
    /// How far in the future a deferred entry becomes claimable again.
    pub defer_interval: Duration,
    /// Age (since `created_at`) past which a transient failure gives up
    /// permanently instead of deferring.
    pub unavailable_budget: Duration,
    /// How long a `processing` claim may be held before the reaper treats it
    /// as abandoned.
    pub stale_lock_window: Duration,
}

impl Default for QueueTuning {
    fn default() -> Self {
        Self {
            defer_interval: Duration::from_secs(60 * 60),
            unavailable_budget: Duration::from_secs(3 * 24 * 60 * 60),
            stale_lock_window: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend unavailable: {0}")]
    Backend(#[from] mongodb::error::Error),
    #[error("bson encode: {0}")]
    Encode(#[from] mongodb::bson::ser::Error),
    #[error("bson decode: {0}")]
    Decode(#[from] mongodb::bson::de::Error),
    #[error("queue entry {key} missing during {op}")]
    MissingEntry { key: String, op: &'static str },
}

/// Per-state queue counters for the dashboard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounters {
    pub total: u64,
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub error: u64,
    pub deferred: u64,
    pub unavailable: u64,
}

/// Dashboard filters over the primary artifact collection.
#[derive(Debug, Clone, Default)]
pub struct ArtifactFilter {
    /// Exact match on the artifact `epoca` field.
    pub epoca: Option<String>,
    /// Case-insensitive substring match on the artifact `materias` field.
    pub materia: Option<String>,
}

/// Enriched output record, upserted once per natural key.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub key: String,
    /// The parsed upstream fields, carried verbatim.
    pub fields: serde_json::Value,
    /// Canonical comma-joined subject string.
    pub materias: String,
    pub vector: Option<Vec<f32>>,
}

/// Row shape for the dashboard's last-N table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactSummary {
    #[serde(rename = "_id")]
    pub key: String,
    #[serde(default)]
    pub rubro: Option<String>,
    #[serde(default)]
    pub epoca: Option<String>,
    #[serde(default)]
    pub materias: Option<String>,
    #[serde(default)]
    pub vectorized: bool,
    #[serde(default)]
    pub updated_at: Option<DateTime>,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Cheap readiness probe.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Atomically claim the next runnable entry: `pending`, or `deferred`
    /// with `next_run_at <= now`. The claim sets `state = processing`,
    /// stamps `claimed_at`, clears `next_run_at` and increments `attempts`,
    /// returning the post-image. Ordering: earliest `next_run_at` first
    /// (absent sorts as past), then earliest `created_at`.
    async fn claim_next(&self, queue: QueueId) -> Result<Option<QueueEntry>, StoreError>;

    async fn mark_completed(&self, queue: QueueId, key: &str) -> Result<(), StoreError>;

    async fn mark_error(&self, queue: QueueId, key: &str, message: &str) -> Result<(), StoreError>;

    /// Defer a transiently-failed entry, or abandon it as `unavailable` once
    /// its age exceeds the budget. Returns the state actually entered.
    async fn mark_deferred_or_unavailable(
        &self,
        queue: QueueId,
        key: &str,
        message: &str,
    ) -> Result<QueueState, StoreError>;

    /// Return every over-age `processing` entry to `pending`; yields the
    /// number reclaimed.
    async fn reap_stale_locks(&self, queue: QueueId) -> Result<u64, StoreError>;

    /// Idempotent by key; overwrites prior content.
    async fn upsert_artifact(&self, queue: QueueId, artifact: &Artifact) -> Result<(), StoreError>;

    /// Whether an artifact with `processed = true` already exists for `key`.
    async fn artifact_is_processed(&self, queue: QueueId, key: &str) -> Result<bool, StoreError>;

    /// Insert-if-absent a batch of fresh pending entries; returns how many
    /// were actually inserted (duplicates are skipped, not errors).
    async fn seed_batch(&self, queue: QueueId, keys: &[String]) -> Result<u64, StoreError>;

    /// Enqueue one secondary-corpus document; returns false when the key was
    /// already present.
    async fn push_secondary(&self, key: &str, payload: SecondaryPayload)
        -> Result<bool, StoreError>;

    async fn counters(&self, queue: QueueId) -> Result<QueueCounters, StoreError>;

    /// Most recently updated primary artifacts matching the filters,
    /// newest first.
    async fn find_recent(
        &self,
        filter: &ArtifactFilter,
        limit: i64,
    ) -> Result<Vec<ArtifactSummary>, StoreError>;

    /// Operator recovery channel: move up to `limit` entries from `error`
    /// back to `pending`; returns the count moved.
    async fn retry_errors(&self, queue: QueueId, limit: u32) -> Result<u64, StoreError>;

    async fn meta_flag(&self, name: &str) -> Result<bool, StoreError>;

    async fn set_meta_flag(&self, name: &str) -> Result<(), StoreError>;
}
