//! MongoDB store backend.
//!
//! All queue mutations are single find-and-modify / update operations so the
//! at-most-one-in-flight guarantee holds across any number of worker
//! processes sharing the database.

use std::cmp;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{self, doc, Bson, DateTime, Document};
use mongodb::error::{BulkWriteFailure, ErrorKind};
use mongodb::options::{
    FindOneAndUpdateOptions, FindOptions, IndexOptions, InsertManyOptions, ReturnDocument,
    UpdateOptions,
};
use mongodb::{Client, Collection, Database, IndexModel};

use crate::queue::{truncate_error, QueueEntry, QueueId, QueueState, SecondaryPayload};
use crate::store::{
    Artifact, ArtifactFilter, ArtifactSummary, QueueCounters, QueueTuning, Store, StoreError,
};

pub const META_COLLECTION: &str = "meta";

pub struct MongoStore {
    db: Database,
    tuning: QueueTuning,
}

impl MongoStore {
    /// Single connection attempt: parse the URI, ping, ensure indexes.
    pub async fn connect(uri: &str, db_name: &str, tuning: QueueTuning) -> Result<Self, StoreError> {
        let client = Client::with_uri_str(uri).await?;
        let db = client.database(db_name);
        db.run_command(doc! { "ping": 1 }, None).await?;
        let store = Self { db, tuning };
        store.ensure_indexes().await?;
        Ok(store)
    }

    /// Startup policy for `store-unavailable`: retry forever with capped
    /// exponential backoff. Runtime store errors are the caller's concern.
    pub async fn connect_with_backoff(uri: &str, db_name: &str, tuning: QueueTuning) -> Self {
        let mut delay = Duration::from_millis(500);
        loop {
            match Self::connect(uri, db_name, tuning).await {
                Ok(store) => return store,
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        retry_in_s = delay.as_secs_f64(),
                        "store connection failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = cmp::min(delay * 2, Duration::from_secs(30));
                }
            }
        }
    }

    fn queue(&self, queue: QueueId) -> Collection<QueueEntry> {
        self.db.collection(queue.queue_collection())
    }

    fn artifacts(&self, queue: QueueId) -> Collection<Document> {
        self.db.collection(queue.artifact_collection())
    }

    async fn ensure_indexes(&self) -> Result<(), StoreError> {
        for queue in [QueueId::Primary, QueueId::Secondary] {
            self.queue(queue)
                .create_index(
                    IndexModel::builder()
                        .keys(doc! { "state": 1, "next_run_at": 1, "created_at": 1 })
                        .options(IndexOptions::builder().name("claim_order".to_string()).build())
                        .build(),
                    None,
                )
                .await?;
        }
        self.artifacts(QueueId::Primary)
            .create_index(
                IndexModel::builder().keys(doc! { "updated_at": -1 }).build(),
                None,
            )
            .await?;
        Ok(())
    }

    async fn count_state(
        &self,
        queue: QueueId,
        state: Option<QueueState>,
    ) -> Result<u64, StoreError> {
        let filter = match state {
            Some(s) => doc! { "state": s.as_str() },
            None => doc! {},
        };
        Ok(self.queue(queue).count_documents(filter, None).await?)
    }
}

#[async_trait]
impl Store for MongoStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.db.run_command(doc! { "ping": 1 }, None).await?;
        Ok(())
    }

    async fn claim_next(&self, queue: QueueId) -> Result<Option<QueueEntry>, StoreError> {
        let now = DateTime::now();
        let filter = doc! {
            "$or": [
                { "state": "pending" },
                { "state": "deferred", "next_run_at": { "$lte": now } },
            ]
        };
        let update = doc! {
            "$set": { "state": "processing", "claimed_at": now },
            "$unset": { "next_run_at": "" },
            "$inc": { "attempts": 1 },
        };
        // Missing `next_run_at` sorts before any concrete timestamp, which is
        // exactly the "absent means past" tie-break the claim needs.
        let options = FindOneAndUpdateOptions::builder()
            .sort(doc! { "next_run_at": 1, "created_at": 1 })
            .return_document(ReturnDocument::After)
            .build();
        Ok(self.queue(queue).find_one_and_update(filter, update, options).await?)
    }

    async fn mark_completed(&self, queue: QueueId, key: &str) -> Result<(), StoreError> {
        let result = self
            .queue(queue)
            .update_one(
                doc! { "_id": key },
                doc! {
                    "$set": { "state": "completed", "completed_at": DateTime::now() },
                    "$unset": { "claimed_at": "", "next_run_at": "" },
                },
                None,
            )
            .await?;
        if result.matched_count == 0 {
            return Err(StoreError::MissingEntry { key: key.to_string(), op: "mark_completed" });
        }
        Ok(())
    }

    async fn mark_error(&self, queue: QueueId, key: &str, message: &str) -> Result<(), StoreError> {
        let result = self
            .queue(queue)
            .update_one(
                doc! { "_id": key },
                doc! {
                    "$set": {
                        "state": "error",
                        "errored_at": DateTime::now(),
                        "last_error": truncate_error(message),
                    },
                    "$unset": { "claimed_at": "", "next_run_at": "" },
                },
                None,
            )
            .await?;
        if result.matched_count == 0 {
            return Err(StoreError::MissingEntry { key: key.to_string(), op: "mark_error" });
        }
        Ok(())
    }

    async fn mark_deferred_or_unavailable(
        &self,
        queue: QueueId,
        key: &str,
        message: &str,
    ) -> Result<QueueState, StoreError> {
        let entry = self
            .queue(queue)
            .find_one(doc! { "_id": key }, None)
            .await?
            .ok_or_else(|| StoreError::MissingEntry {
                key: key.to_string(),
                op: "mark_deferred_or_unavailable",
            })?;

        let now = DateTime::now();
        let age_ms = now.timestamp_millis().saturating_sub(entry.created_at.timestamp_millis());
        let budget_ms = self.tuning.unavailable_budget.as_millis() as i64;
        let last_error = truncate_error(message);

        let (state, update) = if age_ms >= budget_ms {
            (
                QueueState::Unavailable,
                doc! {
                    "$set": {
                        "state": "unavailable",
                        "unavailable_at": now,
                        "last_error": last_error,
                    },
                    "$unset": { "claimed_at": "", "next_run_at": "" },
                },
            )
        } else {
            let next_run_at = DateTime::from_millis(
                now.timestamp_millis() + self.tuning.defer_interval.as_millis() as i64,
            );
            (
                QueueState::Deferred,
                doc! {
                    "$set": {
                        "state": "deferred",
                        "deferred_at": now,
                        "next_run_at": next_run_at,
                        "last_error": last_error,
                    },
                    "$unset": { "claimed_at": "" },
                },
            )
        };

        self.queue(queue).update_one(doc! { "_id": key }, update, None).await?;
        Ok(state)
    }

    async fn reap_stale_locks(&self, queue: QueueId) -> Result<u64, StoreError> {
        let cutoff = DateTime::from_millis(
            DateTime::now().timestamp_millis() - self.tuning.stale_lock_window.as_millis() as i64,
        );
        let result = self
            .queue(queue)
            .update_many(
                doc! { "state": "processing", "claimed_at": { "$lt": cutoff } },
                doc! {
                    "$set": { "state": "pending" },
                    "$unset": { "claimed_at": "" },
                },
                None,
            )
            .await?;
        Ok(result.modified_count)
    }

    async fn upsert_artifact(&self, queue: QueueId, artifact: &Artifact) -> Result<(), StoreError> {
        let mut doc = bson::to_document(&artifact.fields)?;
        doc.insert("_id", artifact.key.clone());
        doc.insert("materias", artifact.materias.clone());
        match &artifact.vector {
            Some(vector) => {
                let values: Vec<Bson> =
                    vector.iter().map(|v| Bson::Double(f64::from(*v))).collect();
                doc.insert("vector", Bson::Array(values));
                doc.insert("vectorized", true);
            }
            None => {
                doc.insert("vectorized", false);
            }
        }
        doc.insert("processed", true);
        doc.insert("updated_at", DateTime::now());

        self.artifacts(queue)
            .replace_one(
                doc! { "_id": artifact.key.clone() },
                doc,
                mongodb::options::ReplaceOptions::builder().upsert(true).build(),
            )
            .await?;
        Ok(())
    }

    async fn artifact_is_processed(&self, queue: QueueId, key: &str) -> Result<bool, StoreError> {
        let found = self
            .artifacts(queue)
            .find_one(doc! { "_id": key, "processed": true }, None)
            .await?;
        Ok(found.is_some())
    }

    async fn seed_batch(&self, queue: QueueId, keys: &[String]) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let now = DateTime::now();
        let docs: Vec<Document> = keys
            .iter()
            .map(|key| doc! { "_id": key, "state": "pending", "attempts": 0, "created_at": now })
            .collect();

        let options = InsertManyOptions::builder().ordered(false).build();
        match self.queue(queue).clone_with_type::<Document>().insert_many(docs, options).await {
            Ok(result) => Ok(result.inserted_ids.len() as u64),
            Err(err) => match *err.kind {
                // Duplicate keys are the expected idempotence path.
                ErrorKind::BulkWrite(BulkWriteFailure {
                    write_errors: Some(ref write_errors),
                    write_concern_error: None,
                    ..
                }) if write_errors.iter().all(|we| we.code == 11000) => {
                    Ok((keys.len() - write_errors.len()) as u64)
                }
                _ => Err(err.into()),
            },
        }
    }

    async fn push_secondary(
        &self,
        key: &str,
        payload: SecondaryPayload,
    ) -> Result<bool, StoreError> {
        let entry = QueueEntry::pending(key, Some(payload));
        let entry_doc = bson::to_document(&entry)?;
        let result = self
            .queue(QueueId::Secondary)
            .update_one(
                doc! { "_id": key },
                doc! { "$setOnInsert": entry_doc },
                UpdateOptions::builder().upsert(true).build(),
            )
            .await?;
        Ok(result.upserted_id.is_some())
    }

    async fn counters(&self, queue: QueueId) -> Result<QueueCounters, StoreError> {
        Ok(QueueCounters {
            total: self.count_state(queue, None).await?,
            pending: self.count_state(queue, Some(QueueState::Pending)).await?,
            processing: self.count_state(queue, Some(QueueState::Processing)).await?,
            completed: self.count_state(queue, Some(QueueState::Completed)).await?,
            error: self.count_state(queue, Some(QueueState::Error)).await?,
            deferred: self.count_state(queue, Some(QueueState::Deferred)).await?,
            unavailable: self.count_state(queue, Some(QueueState::Unavailable)).await?,
        })
    }

    async fn find_recent(
        &self,
        filter: &ArtifactFilter,
        limit: i64,
    ) -> Result<Vec<ArtifactSummary>, StoreError> {
        let mut query = doc! {};
        if let Some(epoca) = filter.epoca.as_deref() {
            query.insert("epoca", epoca);
        }
        if let Some(materia) = filter.materia.as_deref() {
            query.insert(
                "materias",
                doc! { "$regex": escape_regex(materia), "$options": "i" },
            );
        }
        let options = FindOptions::builder()
            .sort(doc! { "updated_at": -1 })
            .limit(limit)
            .build();
        let cursor = self
            .artifacts(QueueId::Primary)
            .clone_with_type::<ArtifactSummary>()
            .find(query, options)
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn retry_errors(&self, queue: QueueId, limit: u32) -> Result<u64, StoreError> {
        let mut moved = 0u64;
        for _ in 0..limit {
            let flipped = self
                .queue(queue)
                .find_one_and_update(
                    doc! { "state": "error" },
                    doc! { "$set": { "state": "pending" } },
                    FindOneAndUpdateOptions::builder()
                        .return_document(ReturnDocument::After)
                        .build(),
                )
                .await?;
            if flipped.is_none() {
                break;
            }
            moved += 1;
        }
        Ok(moved)
    }

    async fn meta_flag(&self, name: &str) -> Result<bool, StoreError> {
        let found = self
            .db
            .collection::<Document>(META_COLLECTION)
            .find_one(doc! { "_id": name }, None)
            .await?;
        Ok(found.is_some())
    }

    async fn set_meta_flag(&self, name: &str) -> Result<(), StoreError> {
        self.db
            .collection::<Document>(META_COLLECTION)
            .update_one(
                doc! { "_id": name },
                doc! { "$setOnInsert": { "created_at": DateTime::now() } },
                UpdateOptions::builder().upsert(true).build(),
            )
            .await?;
        Ok(())
    }
}

/// Escape a user-supplied substring for use inside a `$regex` filter.
fn escape_regex(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '.' | '+' | '*' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '|' | '\\' | '/') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::escape_regex;

    #[test]
    fn regex_metacharacters_are_escaped() {
        assert_eq!(escape_regex("a.b*c"), "a\\.b\\*c");
        assert_eq!(escape_regex("penal"), "penal");
    }
}
