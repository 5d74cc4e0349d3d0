//! In-process store backend.
//!
//! A single async mutex over plain maps makes every store operation
//! trivially atomic. This is the backend the integration suite drives the
//! real scheduler against; it mirrors the MongoDB backend's transition
//! semantics exactly, including claim ordering and the timestamp
//! iff-invariants.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use mongodb::bson::DateTime;
use tokio::sync::Mutex;

use crate::queue::{truncate_error, QueueEntry, QueueId, QueueState, SecondaryPayload};
use crate::store::{
    Artifact, ArtifactFilter, ArtifactSummary, QueueCounters, QueueTuning, Store, StoreError,
};

#[derive(Debug, Clone)]
struct StoredArtifact {
    fields: serde_json::Value,
    materias: String,
    vector: Option<Vec<f32>>,
    vectorized: bool,
    updated_at: DateTime,
}

#[derive(Default)]
struct Inner {
    queues: BTreeMap<&'static str, BTreeMap<String, QueueEntry>>,
    artifacts: BTreeMap<&'static str, BTreeMap<String, StoredArtifact>>,
    meta: BTreeSet<String>,
}

impl Inner {
    fn queue_mut(&mut self, queue: QueueId) -> &mut BTreeMap<String, QueueEntry> {
        self.queues.entry(queue.queue_collection()).or_default()
    }

    fn artifacts_mut(&mut self, queue: QueueId) -> &mut BTreeMap<String, StoredArtifact> {
        self.artifacts.entry(queue.artifact_collection()).or_default()
    }
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    tuning: QueueTuning,
}

impl MemoryStore {
    pub fn new(tuning: QueueTuning) -> Self {
        Self { inner: Mutex::new(Inner::default()), tuning }
    }

    /// Test/introspection access to a queue entry's post-image.
    pub async fn entry(&self, queue: QueueId, key: &str) -> Option<QueueEntry> {
        let mut inner = self.inner.lock().await;
        inner.queue_mut(queue).get(key).cloned()
    }

    /// Whether the stored artifact, if any, carries a vector.
    pub async fn artifact_vectorized(&self, queue: QueueId, key: &str) -> Option<bool> {
        let mut inner = self.inner.lock().await;
        inner.artifacts_mut(queue).get(key).map(|a| a.vectorized)
    }
}

fn runnable(entry: &QueueEntry, now: DateTime) -> bool {
    match entry.state {
        QueueState::Pending => true,
        QueueState::Deferred => entry.next_run_at.map(|t| t <= now).unwrap_or(true),
        _ => false,
    }
}

/// Claim ordering key: `next_run_at` ascending with absent-as-past, then
/// `created_at`, then key for determinism.
fn claim_order(entry: &QueueEntry) -> (i64, i64, String) {
    (
        entry.next_run_at.map(|t| t.timestamp_millis()).unwrap_or(i64::MIN),
        entry.created_at.timestamp_millis(),
        entry.key.clone(),
    )
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn claim_next(&self, queue: QueueId) -> Result<Option<QueueEntry>, StoreError> {
        let now = DateTime::now();
        let mut inner = self.inner.lock().await;
        let entries = inner.queue_mut(queue);
        let winner = entries
            .values()
            .filter(|e| runnable(e, now))
            .min_by_key(|e| claim_order(e))
            .map(|e| e.key.clone());
        let Some(key) = winner else { return Ok(None) };
        let entry = entries.get_mut(&key).ok_or_else(|| StoreError::MissingEntry {
            key: key.clone(),
            op: "claim_next",
        })?;
        entry.state = QueueState::Processing;
        entry.claimed_at = Some(now);
        entry.next_run_at = None;
        entry.attempts += 1;
        Ok(Some(entry.clone()))
    }

    async fn mark_completed(&self, queue: QueueId, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let entry = inner.queue_mut(queue).get_mut(key).ok_or_else(|| {
            StoreError::MissingEntry { key: key.to_string(), op: "mark_completed" }
        })?;
        entry.state = QueueState::Completed;
        entry.completed_at = Some(DateTime::now());
        entry.claimed_at = None;
        entry.next_run_at = None;
        Ok(())
    }

    async fn mark_error(&self, queue: QueueId, key: &str, message: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let entry = inner.queue_mut(queue).get_mut(key).ok_or_else(|| {
            StoreError::MissingEntry { key: key.to_string(), op: "mark_error" }
        })?;
        entry.state = QueueState::Error;
        entry.errored_at = Some(DateTime::now());
        entry.last_error = Some(truncate_error(message));
        entry.claimed_at = None;
        entry.next_run_at = None;
        Ok(())
    }

    async fn mark_deferred_or_unavailable(
        &self,
        queue: QueueId,
        key: &str,
        message: &str,
    ) -> Result<QueueState, StoreError> {
        let mut inner = self.inner.lock().await;
        let tuning = self.tuning;
        let entry = inner.queue_mut(queue).get_mut(key).ok_or_else(|| {
            StoreError::MissingEntry { key: key.to_string(), op: "mark_deferred_or_unavailable" }
        })?;
        let now = DateTime::now();
        let age_ms = now.timestamp_millis().saturating_sub(entry.created_at.timestamp_millis());
        entry.last_error = Some(truncate_error(message));
        entry.claimed_at = None;
        if age_ms >= tuning.unavailable_budget.as_millis() as i64 {
            entry.state = QueueState::Unavailable;
            entry.unavailable_at = Some(now);
            entry.next_run_at = None;
            Ok(QueueState::Unavailable)
        } else {
            entry.state = QueueState::Deferred;
            entry.deferred_at = Some(now);
            entry.next_run_at = Some(DateTime::from_millis(
                now.timestamp_millis() + tuning.defer_interval.as_millis() as i64,
            ));
            Ok(QueueState::Deferred)
        }
    }

    async fn reap_stale_locks(&self, queue: QueueId) -> Result<u64, StoreError> {
        let cutoff = DateTime::from_millis(
            DateTime::now().timestamp_millis() - self.tuning.stale_lock_window.as_millis() as i64,
        );
        let mut inner = self.inner.lock().await;
        let mut reclaimed = 0u64;
        for entry in inner.queue_mut(queue).values_mut() {
            if entry.state == QueueState::Processing
                && entry.claimed_at.map(|t| t < cutoff).unwrap_or(false)
            {
                entry.state = QueueState::Pending;
                entry.claimed_at = None;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn upsert_artifact(&self, queue: QueueId, artifact: &Artifact) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.artifacts_mut(queue).insert(
            artifact.key.clone(),
            StoredArtifact {
                fields: artifact.fields.clone(),
                materias: artifact.materias.clone(),
                vectorized: artifact.vector.is_some(),
                vector: artifact.vector.clone(),
                updated_at: DateTime::now(),
            },
        );
        Ok(())
    }

    async fn artifact_is_processed(&self, queue: QueueId, key: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.artifacts_mut(queue).contains_key(key))
    }

    async fn seed_batch(&self, queue: QueueId, keys: &[String]) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let entries = inner.queue_mut(queue);
        let mut inserted = 0u64;
        for key in keys {
            if !entries.contains_key(key) {
                entries.insert(key.clone(), QueueEntry::pending(key.clone(), None));
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn push_secondary(
        &self,
        key: &str,
        payload: SecondaryPayload,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let entries = inner.queue_mut(QueueId::Secondary);
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), QueueEntry::pending(key, Some(payload)));
        Ok(true)
    }

    async fn counters(&self, queue: QueueId) -> Result<QueueCounters, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut counters = QueueCounters::default();
        for entry in inner.queue_mut(queue).values() {
            counters.total += 1;
            match entry.state {
                QueueState::Pending => counters.pending += 1,
                QueueState::Processing => counters.processing += 1,
                QueueState::Completed => counters.completed += 1,
                QueueState::Error => counters.error += 1,
                QueueState::Deferred => counters.deferred += 1,
                QueueState::Unavailable => counters.unavailable += 1,
            }
        }
        Ok(counters)
    }

    async fn find_recent(
        &self,
        filter: &ArtifactFilter,
        limit: i64,
    ) -> Result<Vec<ArtifactSummary>, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut rows: Vec<(String, StoredArtifact)> = inner
            .artifacts_mut(QueueId::Primary)
            .iter()
            .filter(|(_, a)| {
                if let Some(epoca) = filter.epoca.as_deref() {
                    if a.fields.get("epoca").and_then(|v| v.as_str()) != Some(epoca) {
                        return false;
                    }
                }
                if let Some(materia) = filter.materia.as_deref() {
                    if !a.materias.to_lowercase().contains(&materia.to_lowercase()) {
                        return false;
                    }
                }
                true
            })
            .map(|(k, a)| (k.clone(), a.clone()))
            .collect();
        rows.sort_by_key(|(_, a)| std::cmp::Reverse(a.updated_at.timestamp_millis()));
        rows.truncate(limit.max(0) as usize);
        Ok(rows
            .into_iter()
            .map(|(key, a)| ArtifactSummary {
                key,
                rubro: a.fields.get("rubro").and_then(|v| v.as_str()).map(String::from),
                epoca: a.fields.get("epoca").and_then(|v| v.as_str()).map(String::from),
                materias: Some(a.materias),
                vectorized: a.vectorized,
                updated_at: Some(a.updated_at),
            })
            .collect())
    }

    async fn retry_errors(&self, queue: QueueId, limit: u32) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut moved = 0u64;
        for entry in inner.queue_mut(queue).values_mut() {
            if moved >= u64::from(limit) {
                break;
            }
            if entry.state == QueueState::Error {
                entry.state = QueueState::Pending;
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn meta_flag(&self, name: &str) -> Result<bool, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.meta.contains(name))
    }

    async fn set_meta_flag(&self, name: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.meta.insert(name.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn tuning_ms(defer_ms: u64, budget_ms: u64, stale_ms: u64) -> QueueTuning {
        QueueTuning {
            defer_interval: Duration::from_millis(defer_ms),
            unavailable_budget: Duration::from_millis(budget_ms),
            stale_lock_window: Duration::from_millis(stale_ms),
        }
    }

    async fn seeded(store: &MemoryStore, keys: &[&str]) {
        let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        store.seed_batch(QueueId::Primary, &keys).await.unwrap();
    }

    #[tokio::test]
    async fn claim_transitions_and_stamps() {
        let store = MemoryStore::new(QueueTuning::default());
        seeded(&store, &["10"]).await;

        let claimed = store.claim_next(QueueId::Primary).await.unwrap().unwrap();
        assert_eq!(claimed.key, "10");
        assert_eq!(claimed.state, QueueState::Processing);
        assert_eq!(claimed.attempts, 1);
        assert!(claimed.claimed_at.is_some());
        assert!(claimed.next_run_at.is_none());

        // Nothing else runnable.
        assert!(store.claim_next(QueueId::Primary).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_prefers_oldest_created() {
        let store = MemoryStore::new(QueueTuning::default());
        seeded(&store, &["b"]).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        seeded(&store, &["a"]).await;

        let first = store.claim_next(QueueId::Primary).await.unwrap().unwrap();
        assert_eq!(first.key, "b");
    }

    #[tokio::test]
    async fn no_two_concurrent_claims_share_an_entry() {
        let store = Arc::new(MemoryStore::new(QueueTuning::default()));
        let keys: Vec<String> = (0..20).map(|i| i.to_string()).collect();
        store.seed_batch(QueueId::Primary, &keys).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.claim_next(QueueId::Primary).await.unwrap().map(|e| e.key)
            }));
        }
        let mut seen = std::collections::BTreeSet::new();
        for handle in handles {
            if let Some(key) = handle.await.unwrap() {
                assert!(seen.insert(key), "entry claimed twice");
            }
        }
        assert_eq!(seen.len(), 20);
    }

    #[tokio::test]
    async fn completed_clears_claim_stamp() {
        let store = MemoryStore::new(QueueTuning::default());
        seeded(&store, &["1"]).await;
        store.claim_next(QueueId::Primary).await.unwrap();
        store.mark_completed(QueueId::Primary, "1").await.unwrap();

        let entry = store.entry(QueueId::Primary, "1").await.unwrap();
        assert_eq!(entry.state, QueueState::Completed);
        assert!(entry.claimed_at.is_none());
        assert!(entry.completed_at.is_some());
    }

    #[tokio::test]
    async fn defer_sets_next_run_and_is_reclaimable() {
        let store = MemoryStore::new(tuning_ms(20, 60_000, 60_000));
        seeded(&store, &["1"]).await;
        store.claim_next(QueueId::Primary).await.unwrap();
        let state = store
            .mark_deferred_or_unavailable(QueueId::Primary, "1", "HTTP 503")
            .await
            .unwrap();
        assert_eq!(state, QueueState::Deferred);

        let entry = store.entry(QueueId::Primary, "1").await.unwrap();
        assert!(entry.next_run_at.is_some());
        assert!(entry.claimed_at.is_none());
        assert_eq!(entry.last_error.as_deref(), Some("HTTP 503"));

        // Not yet due.
        assert!(store.claim_next(QueueId::Primary).await.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(30)).await;
        let reclaimed = store.claim_next(QueueId::Primary).await.unwrap().unwrap();
        assert_eq!(reclaimed.attempts, 2);
        assert!(reclaimed.next_run_at.is_none());
    }

    #[tokio::test]
    async fn over_budget_entries_become_unavailable() {
        let store = MemoryStore::new(tuning_ms(10, 0, 60_000));
        seeded(&store, &["1"]).await;
        store.claim_next(QueueId::Primary).await.unwrap();
        let state = store
            .mark_deferred_or_unavailable(QueueId::Primary, "1", "HTTP 503")
            .await
            .unwrap();
        assert_eq!(state, QueueState::Unavailable);

        let entry = store.entry(QueueId::Primary, "1").await.unwrap();
        assert_eq!(entry.state, QueueState::Unavailable);
        assert!(entry.next_run_at.is_none());
        assert!(store.claim_next(QueueId::Primary).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_locks_return_to_pending() {
        let store = MemoryStore::new(tuning_ms(10, 60_000, 0));
        seeded(&store, &["1"]).await;
        let first = store.claim_next(QueueId::Primary).await.unwrap().unwrap();
        assert_eq!(first.attempts, 1);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let reclaimed = store.reap_stale_locks(QueueId::Primary).await.unwrap();
        assert_eq!(reclaimed, 1);

        let second = store.claim_next(QueueId::Primary).await.unwrap().unwrap();
        assert_eq!(second.attempts, 2, "attempts grow across claims");
    }

    #[tokio::test]
    async fn seeding_is_insert_if_absent() {
        let store = MemoryStore::new(QueueTuning::default());
        let keys: Vec<String> = vec!["1".into(), "2".into()];
        assert_eq!(store.seed_batch(QueueId::Primary, &keys).await.unwrap(), 2);
        store.claim_next(QueueId::Primary).await.unwrap();
        // Re-seeding must not resurrect or duplicate claimed entries.
        assert_eq!(store.seed_batch(QueueId::Primary, &keys).await.unwrap(), 0);
        let entry = store.entry(QueueId::Primary, "1").await.unwrap();
        assert_eq!(entry.state, QueueState::Processing);
    }

    #[tokio::test]
    async fn retry_errors_moves_back_to_pending() {
        let store = MemoryStore::new(QueueTuning::default());
        seeded(&store, &["1", "2", "3"]).await;
        for _ in 0..3 {
            let e = store.claim_next(QueueId::Primary).await.unwrap().unwrap();
            store.mark_error(QueueId::Primary, &e.key, "embed-failed").await.unwrap();
        }
        assert_eq!(store.retry_errors(QueueId::Primary, 2).await.unwrap(), 2);
        let counters = store.counters(QueueId::Primary).await.unwrap();
        assert_eq!(counters.pending, 2);
        assert_eq!(counters.error, 1);
    }

    #[tokio::test]
    async fn upsert_artifact_is_idempotent_by_key() {
        let store = MemoryStore::new(QueueTuning::default());
        let artifact = Artifact {
            key: "7".into(),
            fields: serde_json::json!({ "rubro": "A", "epoca": "11a" }),
            materias: "Penal".into(),
            vector: Some(vec![0.1, 0.2]),
        };
        store.upsert_artifact(QueueId::Primary, &artifact).await.unwrap();
        store.upsert_artifact(QueueId::Primary, &artifact).await.unwrap();
        assert!(store.artifact_is_processed(QueueId::Primary, "7").await.unwrap());

        let rows = store.find_recent(&ArtifactFilter::default(), 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].rubro.as_deref(), Some("A"));
        assert!(rows[0].vectorized);
    }

    #[tokio::test]
    async fn find_recent_applies_filters() {
        let store = MemoryStore::new(QueueTuning::default());
        for (key, epoca, materias) in
            [("1", "10a", "Penal"), ("2", "11a", "Civil"), ("3", "11a", "Laboral, Penal")]
        {
            store
                .upsert_artifact(
                    QueueId::Primary,
                    &Artifact {
                        key: key.into(),
                        fields: serde_json::json!({ "rubro": key, "epoca": epoca }),
                        materias: materias.into(),
                        vector: None,
                    },
                )
                .await
                .unwrap();
        }
        let filter =
            ArtifactFilter { epoca: Some("11a".into()), materia: Some("penal".into()) };
        let rows = store.find_recent(&filter, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, "3");
    }
}
