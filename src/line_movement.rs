//! Odds movement detection with an alert latch.
//!
//! Each observation is compared against the immediately preceding snapshot for
//! the same record key, never against the first-seen odds. A crossing of the
//! threshold fires once and sets the latch; the latch clears as soon as a step
//! falls back below threshold, after which a later crossing fires again.
//! Several sub-threshold steps can therefore drift past the threshold in total
//! without ever alerting.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::storage::Storage;
use crate::types::PredictionRecord;

/// A movement worth alerting on
#[derive(Debug, Clone, PartialEq)]
pub struct LineMovement {
    pub record: PredictionRecord,
    pub previous_odds: f64,
    /// Relative change, e.g. 0.167 for 16.7%
    pub movement: f64,
}

impl LineMovement {
    /// Odds shortened since the previous observation
    pub fn is_drop(&self) -> bool {
        self.record.odds < self.previous_odds
    }

    pub fn movement_pct(&self) -> f64 {
        self.movement * 100.0
    }
}

/// Relative movement between two decimal odds
pub fn relative_movement(previous: f64, current: f64) -> f64 {
    (current - previous).abs() / previous
}

pub struct LineMovementTracker {
    storage: Storage,
    threshold: f64,
}

impl LineMovementTracker {
    pub fn new(storage: Storage, threshold: f64) -> Self {
        Self { storage, threshold }
    }

    /// Compare `record` to its previous snapshot, update the latch, and roll the
    /// snapshot forward. Returns the movement when an alert should be sent.
    pub async fn track(&self, record: &PredictionRecord, now: DateTime<Utc>) -> Option<LineMovement> {
        if !record.has_known_odds() {
            return None;
        }

        let snapshot = self.storage.get_snapshot(&record.key).await;
        let previous_odds = snapshot.as_ref().map(|s| s.odds);
        let latched = snapshot.as_ref().map(|s| s.alert_sent).unwrap_or(false);

        let mut alert = None;
        if let Some(previous) = previous_odds.filter(|p| *p > 1.0) {
            let movement = relative_movement(previous, record.odds);

            if movement >= self.threshold {
                if !latched {
                    info!(
                        "[DETECT] 📈 Line movement {}: {:.2} -> {:.2} ({:.1}%)",
                        record.match_label,
                        previous,
                        record.odds,
                        movement * 100.0
                    );
                    self.storage.set_latch(&record.key, true).await;
                    alert = Some(LineMovement {
                        record: record.clone(),
                        previous_odds: previous,
                        movement,
                    });
                }
            } else if latched {
                debug!("[DETECT] Movement normalized for {}, clearing latch", record.key);
                self.storage.set_latch(&record.key, false).await;
            }
        }

        // The current observation becomes the reference for the next one
        self.storage
            .upsert_snapshot(&record.key, record.odds, previous_odds, now)
            .await;

        alert
    }
}
