//! Storage record types for SQLite persistence.

use chrono::{DateTime, Utc};

/// Persisted circuit-breaker state for one entity
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitStateRecord {
    pub entity_id: String,
    pub failures: u32,
    pub paused_until: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Latest odds observed for a prediction key
#[derive(Debug, Clone, PartialEq)]
pub struct OddsSnapshot {
    pub key: String,
    /// Most recent observation; the baseline for the next comparison
    pub odds: f64,
    /// Observation before `odds`
    pub previous_odds: Option<f64>,
    pub updated_at: DateTime<Utc>,
    /// Latch: a movement alert fired and movement has not yet dropped back below threshold
    pub alert_sent: bool,
}

/// Rows removed by a retention purge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeStats {
    pub seen_keys: usize,
    pub snapshots: usize,
}

/// Convert stored unix seconds back into a timestamp
pub(crate) fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::UNIX_EPOCH)
}
