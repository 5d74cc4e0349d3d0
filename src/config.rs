use std::time::Duration;

use clap::Parser;
use eyre::{eyre, Result};

use crate::queue::QueueId;
use crate::retry::RetryPolicy;
use crate::store::QueueTuning;

/// Command line for the ingestion worker. Every knob also reads its
/// environment variable so container deployments can stay flag-free.
#[derive(Parser, Debug)]
#[command(name = "tepantlatia-worker", version, about = "Tepantlatia ingestion worker")]
pub struct WorkerArgs {
    /// Document store connection string.
    #[arg(long, env = "STORE_URI")]
    pub store_uri: String,

    #[arg(long, env = "DB_NAME", default_value = "tepantlatia_db")]
    pub db_name: String,

    /// API key for the embedding service.
    #[arg(long, env = "EMBED_API_KEY", hide_env_values = true)]
    pub embed_api_key: String,

    #[arg(long, env = "EMBED_MODEL", default_value = "text-embedding-3-small")]
    pub embed_model: String,

    /// Remote thesis endpoint; the registro ID is appended directly.
    #[arg(
        long,
        env = "PRIMARY_URL_BASE",
        default_value = "https://sjf2.scjn.gob.mx/services/api/tesis/"
    )]
    pub primary_url_base: String,

    /// Per-request upstream deadline in seconds (10-20).
    #[arg(long, env = "PRIMARY_TIMEOUT_SEC", default_value_t = 10)]
    pub primary_timeout_sec: u64,

    #[arg(long, env = "RETRY_ATTEMPTS", default_value_t = 3)]
    pub retry_attempts: u32,

    #[arg(long, env = "RETRY_BACKOFF_BASE", default_value_t = 1.0)]
    pub retry_backoff_base: f64,

    #[arg(long, env = "RETRY_JITTER_MAX", default_value_t = 0.6)]
    pub retry_jitter_max: f64,

    /// Round-robin weight of the primary queue.
    #[arg(long, env = "W_PRIMARY", default_value_t = 6)]
    pub w_primary: usize,

    /// Round-robin weight of the secondary queue.
    #[arg(long, env = "W_SECONDARY", default_value_t = 1)]
    pub w_secondary: usize,

    /// Pause after each successful dispatch, in seconds.
    #[arg(long, env = "NORMAL_PACE_SEC", default_value_t = 0.35)]
    pub normal_pace_sec: f64,

    /// Minutes a processing claim may be held before the reaper reclaims it.
    #[arg(long, env = "LOCK_STALE_MIN", default_value_t = 30)]
    pub lock_stale_min: u64,

    /// Consecutive upstream transients before the global pause kicks in.
    #[arg(long, env = "MAX_CONSEC_ERRORS", default_value_t = 5)]
    pub max_consec_errors: u32,

    #[arg(long, env = "GLOBAL_PAUSE_SEC", default_value_t = 1200)]
    pub global_pause_sec: u64,

    #[arg(long, env = "DEFER_INTERVAL_MIN", default_value_t = 60)]
    pub defer_interval_min: u64,

    /// Days a transiently-failing entry keeps being deferred before it is
    /// abandoned as unavailable.
    #[arg(long, env = "UNAVAILABLE_BUDGET_DAYS", default_value_t = 3)]
    pub unavailable_budget_days: u64,

    /// Only vectorize theses whose year falls inside [year-min, year-max].
    #[arg(long, env = "VECTOR_RANGE_ONLY")]
    pub vector_range_only: bool,

    #[arg(long, env = "YEAR_MIN", default_value_t = 1980)]
    pub year_min: i32,

    #[arg(long, env = "YEAR_MAX", default_value_t = 2026)]
    pub year_max: i32,

    /// With --vector-range-only, whether an unknown year still embeds.
    #[arg(long, env = "VECTOR_IF_YEAR_UNKNOWN")]
    pub vector_if_year_unknown: bool,

    /// Seed the primary queue from the declared ID blocks before starting.
    #[arg(long, env = "SEED_PRIMARY_QUEUE")]
    pub seed_primary_queue: bool,

    /// Process until both queues stay idle, then exit instead of polling.
    #[arg(long)]
    pub drain: bool,
}

/// Resolved worker configuration.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub db_name: String,
    pub embed_model: String,
    pub primary_url_base: String,
    pub primary_timeout: Duration,
    pub retry: RetryPolicy,
    pub w_primary: usize,
    pub w_secondary: usize,
    pub normal_pace: Duration,
    /// Sleep when a queue poll comes back empty.
    pub idle_pace: Duration,
    pub stale_lock_window: Duration,
    pub max_consec_errors: u32,
    pub global_pause: Duration,
    pub defer_interval: Duration,
    pub unavailable_budget: Duration,
    pub vector_range_only: bool,
    pub year_min: i32,
    pub year_max: i32,
    pub vector_if_year_unknown: bool,
    pub seed_primary_queue: bool,
    pub drain: bool,
}

impl IngestConfig {
    pub fn from_args(args: &WorkerArgs) -> Result<Self> {
        if args.w_primary == 0 && args.w_secondary == 0 {
            return Err(eyre!("at least one queue weight must be > 0"));
        }
        if args.retry_attempts == 0 {
            return Err(eyre!("retry attempts must be > 0"));
        }
        if args.year_min > args.year_max {
            return Err(eyre!(
                "year range is inverted: min {} > max {}",
                args.year_min,
                args.year_max
            ));
        }

        let timeout_sec = args.primary_timeout_sec.clamp(10, 20);
        if timeout_sec != args.primary_timeout_sec {
            tracing::warn!(
                requested = args.primary_timeout_sec,
                effective = timeout_sec,
                "primary timeout outside 10-20s; clamping"
            );
        }

        let mut url_base = args.primary_url_base.clone();
        if !url_base.ends_with('/') {
            url_base.push('/');
        }

        Ok(Self {
            db_name: args.db_name.clone(),
            embed_model: args.embed_model.clone(),
            primary_url_base: url_base,
            primary_timeout: Duration::from_secs(timeout_sec),
            retry: RetryPolicy {
                attempts: args.retry_attempts,
                base: Duration::from_secs_f64(args.retry_backoff_base.max(0.0)),
                jitter_max: Duration::from_secs_f64(args.retry_jitter_max.max(0.0)),
            },
            w_primary: args.w_primary,
            w_secondary: args.w_secondary,
            normal_pace: Duration::from_secs_f64(args.normal_pace_sec.max(0.0)),
            idle_pace: Duration::from_secs(1),
            stale_lock_window: Duration::from_secs(args.lock_stale_min * 60),
            max_consec_errors: args.max_consec_errors.max(1),
            global_pause: Duration::from_secs(args.global_pause_sec),
            defer_interval: Duration::from_secs(args.defer_interval_min * 60),
            unavailable_budget: Duration::from_secs(args.unavailable_budget_days * 24 * 60 * 60),
            vector_range_only: args.vector_range_only,
            year_min: args.year_min,
            year_max: args.year_max,
            vector_if_year_unknown: args.vector_if_year_unknown,
            seed_primary_queue: args.seed_primary_queue,
            drain: args.drain,
        })
    }

    pub fn tuning(&self) -> QueueTuning {
        QueueTuning {
            defer_interval: self.defer_interval,
            unavailable_budget: self.unavailable_budget,
            stale_lock_window: self.stale_lock_window,
        }
    }

    /// The weighted round-robin order the scheduler cycles through.
    pub fn schedule(&self) -> Vec<QueueId> {
        let mut schedule = vec![QueueId::Primary; self.w_primary];
        schedule.extend(std::iter::repeat(QueueId::Secondary).take(self.w_secondary));
        schedule
    }

    /// Vector gate for the primary source; the secondary corpus always embeds.
    pub fn embedding_wanted(&self, anio: Option<i32>) -> bool {
        if !self.vector_range_only {
            return true;
        }
        match anio {
            Some(year) => (self.year_min..=self.year_max).contains(&year),
            None => self.vector_if_year_unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> IngestConfig {
        IngestConfig {
            db_name: "tepantlatia_db".into(),
            embed_model: "text-embedding-3-small".into(),
            primary_url_base: "https://example.test/tesis/".into(),
            primary_timeout: Duration::from_secs(10),
            retry: RetryPolicy {
                attempts: 3,
                base: Duration::from_secs(1),
                jitter_max: Duration::from_millis(600),
            },
            w_primary: 6,
            w_secondary: 1,
            normal_pace: Duration::from_millis(350),
            idle_pace: Duration::from_secs(1),
            stale_lock_window: Duration::from_secs(1800),
            max_consec_errors: 5,
            global_pause: Duration::from_secs(1200),
            defer_interval: Duration::from_secs(3600),
            unavailable_budget: Duration::from_secs(259_200),
            vector_range_only: false,
            year_min: 1980,
            year_max: 2026,
            vector_if_year_unknown: false,
            seed_primary_queue: false,
            drain: false,
        }
    }

    #[test]
    fn schedule_respects_weights() {
        let cfg = base_config();
        let schedule = cfg.schedule();
        assert_eq!(schedule.len(), 7);
        assert_eq!(schedule.iter().filter(|q| **q == QueueId::Primary).count(), 6);
        assert_eq!(schedule[6], QueueId::Secondary);
    }

    #[test]
    fn embedding_gate_defaults_open() {
        let cfg = base_config();
        assert!(cfg.embedding_wanted(Some(1850)));
        assert!(cfg.embedding_wanted(None));
    }

    #[test]
    fn embedding_gate_applies_year_range() {
        let mut cfg = base_config();
        cfg.vector_range_only = true;
        assert!(cfg.embedding_wanted(Some(1990)));
        assert!(!cfg.embedding_wanted(Some(1950)));
        assert!(!cfg.embedding_wanted(None));
        cfg.vector_if_year_unknown = true;
        assert!(cfg.embedding_wanted(None));
    }
}
