//! The cooperative scheduler loop.
//!
//! One logical worker per process; any number of processes may run
//! concurrently because every claim is an atomic find-and-modify against
//! the shared store. The loop fair-shares the queues by weighted round
//! robin, reaps stale locks on a fixed cadence, paces itself between
//! dispatches, and pauses globally when the primary upstream looks
//! unstable.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use eyre::Result;
use tokio::sync::watch;

use crate::config::IngestConfig;
use crate::embedder::Embed;
use crate::fetcher::Fetch;
use crate::processor::{DispatchOutcome, PrimaryProcessor, SecondaryProcessor};
use crate::queue::QueueId;
use crate::store::Store;

/// Stale-lock reap cadence, in loop iterations.
const REAP_EVERY: u64 = 200;
/// Backoff after a store error bubbles out of a dispatch.
const STORE_ERROR_BACKOFF: Duration = Duration::from_secs(5);
/// Throughput window sizing.
const THROUGHPUT_WINDOW: usize = 20;
const THROUGHPUT_MIN_SAMPLES: usize = 10;
/// In drain mode, exit after this many consecutive empty polls per schedule
/// slot.
const DRAIN_IDLE_ROUNDS: u64 = 2;

/// Long-lived worker owning the store handle, configuration, the rolling
/// throughput window and the consecutive-upstream-error counter.
pub struct Worker {
    store: Arc<dyn Store>,
    primary: PrimaryProcessor,
    secondary: SecondaryProcessor,
    cfg: Arc<IngestConfig>,
    schedule: Vec<QueueId>,
    consecutive_upstream_errors: u32,
    recent_dispatches: VecDeque<Instant>,
}

impl Worker {
    pub fn new(
        store: Arc<dyn Store>,
        fetcher: Arc<dyn Fetch>,
        embedder: Arc<dyn Embed>,
        cfg: Arc<IngestConfig>,
    ) -> Self {
        let schedule = cfg.schedule();
        let primary =
            PrimaryProcessor::new(store.clone(), fetcher, embedder.clone(), cfg.clone());
        let secondary = SecondaryProcessor::new(store.clone(), embedder);
        Self {
            store,
            primary,
            secondary,
            cfg,
            schedule,
            consecutive_upstream_errors: 0,
            recent_dispatches: VecDeque::with_capacity(THROUGHPUT_WINDOW),
        }
    }

    /// Run until shutdown is signalled (or, in drain mode, until both
    /// queues stay idle). The in-flight dispatch always completes before
    /// shutdown is honored so entries are not stranded in `processing`.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let idle_exit_after = DRAIN_IDLE_ROUNDS * self.schedule.len() as u64;
        let mut i: u64 = 0;
        let mut idle_streak: u64 = 0;

        tracing::info!(
            schedule_len = self.schedule.len(),
            w_primary = self.cfg.w_primary,
            w_secondary = self.cfg.w_secondary,
            drain = self.cfg.drain,
            "worker loop starting"
        );

        loop {
            if *shutdown.borrow() {
                tracing::info!("shutdown requested; stopping between dispatches");
                break;
            }

            if i % REAP_EVERY == 0 {
                for queue in [QueueId::Primary, QueueId::Secondary] {
                    match self.store.reap_stale_locks(queue).await {
                        Ok(0) => {}
                        Ok(reclaimed) => tracing::warn!(
                            queue = queue.label(),
                            reclaimed,
                            "returned stale processing locks to pending"
                        ),
                        Err(err) => {
                            tracing::error!(queue = queue.label(), error = %err, "stale-lock reap failed");
                            self.pause(STORE_ERROR_BACKOFF, &mut shutdown).await;
                        }
                    }
                }
            }

            let queue = self.schedule[(i % self.schedule.len() as u64) as usize];
            i += 1;

            let claimed = match self.store.claim_next(queue).await {
                Ok(claimed) => claimed,
                Err(err) => {
                    tracing::error!(queue = queue.label(), error = %err, "claim failed");
                    self.pause(STORE_ERROR_BACKOFF, &mut shutdown).await;
                    continue;
                }
            };

            let Some(entry) = claimed else {
                idle_streak += 1;
                if self.cfg.drain && idle_streak >= idle_exit_after {
                    tracing::info!("queues idle; drain complete");
                    break;
                }
                self.pause(self.cfg.idle_pace, &mut shutdown).await;
                continue;
            };
            idle_streak = 0;

            tracing::debug!(
                queue = queue.label(),
                key = %entry.key,
                attempts = entry.attempts,
                "claimed entry"
            );

            let outcome = match queue {
                QueueId::Primary => self.primary.process(&entry).await,
                QueueId::Secondary => self.secondary.process(&entry).await,
            };
            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(err) => {
                    // The entry stays in `processing`; the reaper will
                    // reclaim it once the store is reachable again.
                    tracing::error!(
                        queue = queue.label(),
                        key = %entry.key,
                        error = %err,
                        "dispatch aborted on store error"
                    );
                    self.pause(STORE_ERROR_BACKOFF, &mut shutdown).await;
                    continue;
                }
            };

            if queue == QueueId::Primary {
                self.track_upstream_health(&outcome, &mut shutdown).await;
            }

            if outcome.ok {
                self.note_dispatch();
            }

            self.pause(self.cfg.normal_pace, &mut shutdown).await;
        }

        Ok(())
    }

    /// Circuit breaker over the primary upstream: consecutive transients
    /// trigger a long global pause, success resets the count.
    async fn track_upstream_health(
        &mut self,
        outcome: &DispatchOutcome,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        if outcome.transient {
            self.consecutive_upstream_errors += 1;
        } else if outcome.ok {
            self.consecutive_upstream_errors = 0;
        }

        if self.consecutive_upstream_errors >= self.cfg.max_consec_errors {
            tracing::warn!(
                consecutive = self.consecutive_upstream_errors,
                pause_s = self.cfg.global_pause.as_secs_f64(),
                "primary upstream unstable; pausing all dispatch"
            );
            self.pause(self.cfg.global_pause, shutdown).await;
            self.consecutive_upstream_errors = 0;
        }
    }

    fn note_dispatch(&mut self) {
        let now = Instant::now();
        self.recent_dispatches.push_back(now);
        while self.recent_dispatches.len() > THROUGHPUT_WINDOW {
            self.recent_dispatches.pop_front();
        }
        if self.recent_dispatches.len() >= THROUGHPUT_MIN_SAMPLES {
            if let Some(oldest) = self.recent_dispatches.front() {
                let span = now.duration_since(*oldest).as_secs_f64();
                if span > 0.0 {
                    let rate = (self.recent_dispatches.len() - 1) as f64 / span;
                    tracing::info!(
                        window = self.recent_dispatches.len(),
                        items_per_sec = format!("{rate:.2}"),
                        "throughput"
                    );
                }
            }
        }
    }

    /// Interruptible sleep: wakes early when shutdown flips.
    async fn pause(&self, duration: Duration, shutdown: &mut watch::Receiver<bool>) {
        if duration.is_zero() || *shutdown.borrow() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = shutdown.changed() => {}
        }
    }
}
