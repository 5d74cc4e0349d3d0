//! Upstream response classification and the exponential-backoff fetch loop.

use std::time::Duration;

use rand::Rng;

use crate::fetcher::Fetch;

/// How one upstream HTTP status should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Success,
    /// Worth another attempt; becomes a transient signal once exhausted.
    Retryable,
    /// The item does not exist upstream (404/410); drain it.
    TerminalAbsent,
    /// Any other non-200; recorded and drained, never retried.
    TerminalOther,
}

pub fn classify(status: u16) -> Classification {
    match status {
        200 => Classification::Success,
        429 | 500 | 502 | 503 | 504 => Classification::Retryable,
        404 | 410 => Classification::TerminalAbsent,
        _ => Classification::TerminalOther,
    }
}

/// Exponential backoff with full-width additive jitter:
/// `base * 2^i + uniform(0, jitter_max)`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base: Duration,
    pub jitter_max: Duration,
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let backoff = self.base.saturating_mul(2u32.saturating_pow(attempt));
        let jitter_max = self.jitter_max.as_secs_f64();
        if jitter_max <= 0.0 {
            return backoff;
        }
        let jitter = rand::thread_rng().gen_range(0.0..jitter_max);
        backoff + Duration::from_secs_f64(jitter)
    }
}

/// Net result of one upstream fetch under the retry policy.
#[derive(Debug)]
pub enum UpstreamOutcome {
    /// 200 body.
    Body(Vec<u8>),
    Absent(u16),
    TerminalOther(u16),
    /// Retryable statuses and transport errors exhausted the attempt budget;
    /// carries the last diagnostic.
    TransientExhausted(String),
}

pub async fn fetch_with_policy(
    fetcher: &dyn Fetch,
    url: &str,
    policy: &RetryPolicy,
) -> UpstreamOutcome {
    let mut last_error = String::new();
    for attempt in 0..policy.attempts {
        match fetcher.fetch(url).await {
            Ok(response) => match classify(response.status) {
                Classification::Success => return UpstreamOutcome::Body(response.body),
                Classification::TerminalAbsent => return UpstreamOutcome::Absent(response.status),
                Classification::TerminalOther => {
                    return UpstreamOutcome::TerminalOther(response.status)
                }
                Classification::Retryable => {
                    last_error = format!("HTTP {}", response.status);
                }
            },
            Err(err) => {
                last_error = err.to_string();
            }
        }

        if attempt + 1 < policy.attempts {
            let delay = policy.delay(attempt);
            tracing::debug!(
                attempt,
                url,
                sleep_ms = delay.as_millis() as u64,
                error = %last_error,
                "upstream fetch failed; backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }
    UpstreamOutcome::TransientExhausted(last_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_table() {
        assert_eq!(classify(200), Classification::Success);
        for status in [429, 500, 502, 503, 504] {
            assert_eq!(classify(status), Classification::Retryable, "status {status}");
        }
        for status in [404, 410] {
            assert_eq!(classify(status), Classification::TerminalAbsent, "status {status}");
        }
        for status in [301, 400, 401, 403, 418, 501] {
            assert_eq!(classify(status), Classification::TerminalOther, "status {status}");
        }
    }

    #[test]
    fn delay_grows_exponentially_within_jitter_bounds() {
        let policy = RetryPolicy {
            attempts: 3,
            base: Duration::from_millis(100),
            jitter_max: Duration::from_millis(60),
        };
        for attempt in 0..3u32 {
            let floor = Duration::from_millis(100 * 2u64.pow(attempt));
            let ceiling = floor + Duration::from_millis(60);
            for _ in 0..50 {
                let delay = policy.delay(attempt);
                assert!(delay >= floor, "attempt {attempt}: {delay:?} < {floor:?}");
                assert!(delay < ceiling, "attempt {attempt}: {delay:?} >= {ceiling:?}");
            }
        }
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let policy = RetryPolicy {
            attempts: 3,
            base: Duration::from_secs(1),
            jitter_max: Duration::ZERO,
        };
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
    }
}
