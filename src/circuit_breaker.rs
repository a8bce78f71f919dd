//! Per-entity circuit breaker for feed polling.
//!
//! Each entity carries a failure counter and an optional pause window in
//! storage. Failures come in two kinds:
//! - NotFound: the target is broken; pause for the full duration immediately
//! - Transient: expected noise (rate limits, network); pause only once the
//!   counter reaches the threshold
//!
//! A paused entity is skipped without being fetched or counted. Once the pause
//! has elapsed, the next check attempt resets the counter and proceeds.

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::config::env_in;
use crate::storage::Storage;

/// Circuit breaker configuration from environment
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before a Transient failure pauses the entity
    pub failure_threshold: u32,

    /// Length of a pause
    pub pause_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            pause_duration: Duration::minutes(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn from_env() -> Self {
        Self {
            failure_threshold: env_in("MAX_RETRIES", 3u32, 1, 100),
            pause_duration: Duration::minutes(env_in("PAUSE_DURATION_MINUTES", 30, 1, 7 * 24 * 60)),
        }
    }
}

/// Failure classification the breaker branches on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Target entity is invalid or removed
    NotFound,
    /// Rate limit, anti-bot block, network or decode trouble
    Transient,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::NotFound => write!(f, "not found"),
            FailureKind::Transient => write!(f, "transient"),
        }
    }
}

/// Result of consulting the breaker before a fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Go ahead; `failures` is the current counter
    Proceed { failures: u32 },
    /// Paused; do not fetch this cycle
    Skip { paused_until: DateTime<Utc> },
}

/// Outcome of recording a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureRecorded {
    pub failures: u32,
    pub paused_until: Option<DateTime<Utc>>,
}

/// Circuit breaker over persisted per-entity state
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    storage: Storage,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, storage: Storage) -> Self {
        info!("[CB] Circuit breaker initialized:");
        info!("[CB]   Failure threshold: {}", config.failure_threshold);
        info!("[CB]   Pause duration: {}m", config.pause_duration.num_minutes());

        Self { config, storage }
    }

    /// Decide whether `entity_id` may be fetched at `now`.
    ///
    /// An elapsed pause is cleared here, resetting the counter.
    pub async fn admit(&self, entity_id: &str, now: DateTime<Utc>) -> Admission {
        let (failures, paused_until) = self.storage.get_circuit_state(entity_id).await;

        match paused_until {
            Some(until) if now < until => Admission::Skip { paused_until: until },
            Some(_) => {
                info!("[CB] Pause elapsed for {}, resuming", entity_id);
                self.storage.upsert_circuit_state(entity_id, 0, None, now).await;
                Admission::Proceed { failures: 0 }
            }
            None => Admission::Proceed { failures },
        }
    }

    /// Record a successful check. Only writes when there is something to reset.
    pub async fn record_success(&self, entity_id: &str, failures: u32, now: DateTime<Utc>) {
        if failures > 0 {
            info!("[CB] {} recovered after {} failure(s)", entity_id, failures);
            self.storage.upsert_circuit_state(entity_id, 0, None, now).await;
        }
    }

    /// Record a failed check and apply the pause policy for `kind`.
    pub async fn record_failure(
        &self,
        entity_id: &str,
        kind: FailureKind,
        now: DateTime<Utc>,
    ) -> FailureRecorded {
        let (current, _) = self.storage.get_circuit_state(entity_id).await;
        let failures = current.saturating_add(1);

        let pause = match kind {
            FailureKind::NotFound => Some(self.config.pause_duration),
            FailureKind::Transient if failures >= self.config.failure_threshold => {
                Some(self.config.pause_duration)
            }
            FailureKind::Transient => None,
        };
        let paused_until = pause.map(|d| now + d);

        if let Some(until) = paused_until {
            warn!(
                "[CB] Pausing {} until {} ({} failure, {} total)",
                entity_id,
                until.format("%H:%M:%S"),
                kind,
                failures
            );
        } else {
            warn!(
                "[CB] {} failure for {} ({}/{})",
                kind, entity_id, failures, self.config.failure_threshold
            );
        }

        self.storage
            .upsert_circuit_state(entity_id, failures, paused_until, now)
            .await;

        FailureRecorded { failures, paused_until }
    }

    /// Current status for diagnostics
    pub async fn status(&self, entity_id: &str, now: DateTime<Utc>) -> CircuitBreakerStatus {
        let (failures, paused_until) = self.storage.get_circuit_state(entity_id).await;
        CircuitBreakerStatus {
            entity_id: entity_id.to_string(),
            failures,
            threshold: self.config.failure_threshold,
            paused_until: paused_until.filter(|until| now < *until),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerStatus {
    pub entity_id: String,
    pub failures: u32,
    pub threshold: u32,
    pub paused_until: Option<DateTime<Utc>>,
}

impl std::fmt::Display for CircuitBreakerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.paused_until {
            Some(until) => write!(f, "{}: 🛑 PAUSED until {}", self.entity_id, until.format("%Y-%m-%d %H:%M:%S"))?,
            None => write!(f, "{}: ✅ OK", self.entity_id)?,
        }
        write!(f, " | Failures: {}/{}", self.failures, self.threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_storage_in_memory;

    fn breaker() -> CircuitBreaker {
        let config = CircuitBreakerConfig {
            failure_threshold: 3,
            pause_duration: Duration::minutes(30),
        };
        CircuitBreaker::new(config, open_storage_in_memory().unwrap())
    }

    #[tokio::test]
    async fn test_transient_failures_pause_at_threshold() {
        let cb = breaker();
        let now = Utc::now();

        let r1 = cb.record_failure("u", FailureKind::Transient, now).await;
        let r2 = cb.record_failure("u", FailureKind::Transient, now).await;
        assert_eq!(r1.paused_until, None);
        assert_eq!(r2.paused_until, None);
        assert_eq!(cb.admit("u", now).await, Admission::Proceed { failures: 2 });

        // Third error should pause
        let r3 = cb.record_failure("u", FailureKind::Transient, now).await;
        assert_eq!(r3.failures, 3);
        assert_eq!(r3.paused_until, Some(now + Duration::minutes(30)));
        assert!(matches!(cb.admit("u", now).await, Admission::Skip { .. }));
        assert!(matches!(
            cb.admit("u", now + Duration::minutes(29)).await,
            Admission::Skip { .. }
        ));
    }

    #[tokio::test]
    async fn test_not_found_pauses_immediately() {
        let cb = breaker();
        let now = Utc::now();

        let r = cb.record_failure("u", FailureKind::NotFound, now).await;
        assert_eq!(r.failures, 1);
        assert_eq!(r.paused_until, Some(now + Duration::minutes(30)));
        assert!(matches!(cb.admit("u", now).await, Admission::Skip { .. }));
    }

    #[tokio::test]
    async fn test_success_resets_failures() {
        let cb = breaker();
        let now = Utc::now();

        cb.record_failure("u", FailureKind::Transient, now).await;
        cb.record_failure("u", FailureKind::Transient, now).await;
        let Admission::Proceed { failures } = cb.admit("u", now).await else {
            panic!("entity should not be paused");
        };
        cb.record_success("u", failures, now).await;

        assert_eq!(cb.admit("u", now).await, Admission::Proceed { failures: 0 });
        // A fresh failure starts counting from zero again
        let r = cb.record_failure("u", FailureKind::Transient, now).await;
        assert_eq!(r.failures, 1);
    }

    #[tokio::test]
    async fn test_elapsed_pause_resumes_and_resets() {
        let cb = breaker();
        let now = Utc::now();

        cb.record_failure("u", FailureKind::NotFound, now).await;
        let later = now + Duration::minutes(31);
        assert_eq!(cb.admit("u", later).await, Admission::Proceed { failures: 0 });

        let status = cb.status("u", later).await;
        assert_eq!(status.failures, 0);
        assert!(status.paused_until.is_none());
        assert!(status.to_string().contains("OK"));
    }
}
