//! One-shot, idempotent population of the primary queue.

use crate::queue::QueueId;
use crate::store::{Store, StoreError};

/// Meta marker written once seeding has run to completion.
pub const SEED_MARKER: &str = "queue_seeded";

/// Keys per insert batch.
pub const SEED_BATCH: usize = 1000;

/// Hand-curated half-open `[lo, hi)` registro blocks, ordered to approximate
/// chronological relevance: the modern corpus first, the oldest records
/// last. Some blocks overlap earlier ones on purpose; inserts are
/// if-absent, so overlap is harmless and the list must not be de-duplicated.
pub const SEED_BLOCKS: &[(u64, u64)] = &[
    (292_564, 350_000),
    (350_000, 400_000),
    (400_000, 450_000),
    (450_000, 500_000),
    (500_000, 550_000),
    (550_000, 600_000),
    (600_000, 650_000),
    (650_000, 700_000),
    (700_000, 750_000),
    (750_000, 800_000),
    (800_000, 850_000),
    (850_000, 900_000),
    (900_000, 950_000),
    (950_000, 1_000_000),
    (1_000_000, 1_050_000),
    (1_050_000, 1_100_000),
    (1_100_000, 1_150_000),
    (1_150_000, 1_200_000),
    (1_200_000, 1_250_000),
    (1_250_000, 1_300_000),
    (1_300_000, 1_350_000),
    (1_350_000, 1_400_000),
    (1_400_000, 1_450_000),
    (1_450_000, 1_500_000),
    (1_500_000, 1_550_000),
    (1_550_000, 1_600_000),
    (161_000, 206_000),
    (207_000, 2_023_000),
    (2_028_000, 2_031_780),
];

/// Seed every key of every block, batched, then write the meta marker.
/// A marker already present makes this a no-op, so restarts and concurrent
/// workers cannot re-seed.
pub async fn run(store: &dyn Store, blocks: &[(u64, u64)]) -> Result<u64, StoreError> {
    if store.meta_flag(SEED_MARKER).await? {
        tracing::info!("primary queue already seeded; skipping");
        return Ok(0);
    }

    let mut inserted = 0u64;
    let mut batch: Vec<String> = Vec::with_capacity(SEED_BATCH);
    for &(lo, hi) in blocks {
        let before = inserted;
        for registro in lo..hi {
            batch.push(registro.to_string());
            if batch.len() == SEED_BATCH {
                inserted += store.seed_batch(QueueId::Primary, &batch).await?;
                batch.clear();
            }
        }
        if !batch.is_empty() {
            inserted += store.seed_batch(QueueId::Primary, &batch).await?;
            batch.clear();
        }
        tracing::info!(lo, hi, inserted = inserted - before, "seeded block");
    }

    store.set_meta_flag(SEED_MARKER).await?;
    tracing::info!(inserted, "primary queue seeding complete");
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::QueueTuning;
    use crate::store_memory::MemoryStore;

    #[test]
    fn blocks_are_half_open_and_ordered_as_declared() {
        assert_eq!(SEED_BLOCKS.first(), Some(&(292_564, 350_000)));
        assert_eq!(SEED_BLOCKS.last(), Some(&(2_028_000, 2_031_780)));
        for &(lo, hi) in SEED_BLOCKS {
            assert!(lo < hi, "degenerate block [{lo}, {hi})");
        }
        // The trailing hand-ordered blocks intentionally revisit earlier
        // ranges; make sure nobody "fixes" that by sorting or deduping.
        let tail = &SEED_BLOCKS[SEED_BLOCKS.len() - 3..];
        assert_eq!(tail, &[(161_000, 206_000), (207_000, 2_023_000), (2_028_000, 2_031_780)]);
    }

    #[tokio::test]
    async fn seeding_is_idempotent_and_tolerates_overlap() {
        let store = MemoryStore::new(QueueTuning::default());
        // Overlapping blocks: 5 distinct keys across 8 block slots.
        let blocks = [(100, 104), (102, 105)];

        let inserted = run(&store, &blocks).await.unwrap();
        assert_eq!(inserted, 5);
        let counters = store.counters(QueueId::Primary).await.unwrap();
        assert_eq!(counters.pending, 5);

        // Marker makes the second pass a no-op.
        let inserted = run(&store, &blocks).await.unwrap();
        assert_eq!(inserted, 0);
        let counters = store.counters(QueueId::Primary).await.unwrap();
        assert_eq!(counters.total, 5);
    }
}
