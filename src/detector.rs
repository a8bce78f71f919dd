//! New-record detection for one entity's fetched activity.
//!
//! Records pass through, in order: terminal filter, time-window filter, movement
//! tracking, and the seen-key check. Records that survive are grouped by event
//! so a single notification covers every new selection on the same match.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::debug;

use crate::config::DetectorConfig;
use crate::line_movement::{LineMovement, LineMovementTracker};
use crate::storage::Storage;
use crate::types::{PredictionRecord, RecordGroup};

/// Where a record sits relative to the admission window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowVerdict {
    /// No start time, upcoming within the lookahead, or started within the grace period
    Admit,
    /// Starts beyond the lookahead horizon; revisit on a later cycle
    TooFar,
    /// Started longer ago than the grace period; suppress for good
    Stale,
}

pub fn window_verdict(
    starts_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    config: &DetectorConfig,
) -> WindowVerdict {
    let Some(start) = starts_at else {
        return WindowVerdict::Admit;
    };
    if start > now + config.lookahead {
        WindowVerdict::TooFar
    } else if start < now && now - start > config.grace_period {
        WindowVerdict::Stale
    } else {
        WindowVerdict::Admit
    }
}

/// Per-call counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetectionStats {
    pub observed: usize,
    pub terminal: usize,
    pub too_far: usize,
    pub stale: usize,
    pub already_seen: usize,
    pub new_records: usize,
}

#[derive(Debug, Default)]
pub struct DetectionOutcome {
    /// New records grouped by event, in order of first appearance; never empty groups
    pub groups: Vec<RecordGroup>,
    pub movements: Vec<LineMovement>,
    pub stats: DetectionStats,
}

pub struct ChangeDetector {
    storage: Storage,
    tracker: LineMovementTracker,
    config: DetectorConfig,
}

impl ChangeDetector {
    pub fn new(config: DetectorConfig, storage: Storage) -> Self {
        let tracker = LineMovementTracker::new(storage.clone(), config.movement_threshold);
        Self { storage, tracker, config }
    }

    /// Run the detection pipeline over one entity's records observed at `now`.
    pub async fn process(&self, records: Vec<PredictionRecord>, now: DateTime<Utc>) -> DetectionOutcome {
        let mut outcome = DetectionOutcome::default();
        let mut group_index: HashMap<i64, usize> = HashMap::new();

        for record in records {
            outcome.stats.observed += 1;

            if record.status.is_terminal() {
                self.storage.mark_seen(&record.key, &record.entity_id, now).await;
                outcome.stats.terminal += 1;
                continue;
            }

            match window_verdict(record.starts_at, now, &self.config) {
                WindowVerdict::Admit => {}
                WindowVerdict::TooFar => {
                    outcome.stats.too_far += 1;
                    continue;
                }
                WindowVerdict::Stale => {
                    self.storage.mark_seen(&record.key, &record.entity_id, now).await;
                    outcome.stats.stale += 1;
                    continue;
                }
            }

            // Movement tracking is independent of whether the record is new
            if let Some(movement) = self.tracker.track(&record, now).await {
                outcome.movements.push(movement);
            }

            if self.storage.is_seen(&record.key).await {
                outcome.stats.already_seen += 1;
                continue;
            }
            // Another check may have claimed the key between the two calls
            if !self.storage.mark_seen(&record.key, &record.entity_id, now).await {
                outcome.stats.already_seen += 1;
                continue;
            }

            debug!("[DETECT] New record {} on event {}", record.key, record.event_id);
            outcome.stats.new_records += 1;
            let idx = *group_index.entry(record.event_id).or_insert_with(|| {
                outcome.groups.push(RecordGroup {
                    event_id: record.event_id,
                    records: Vec::new(),
                });
                outcome.groups.len() - 1
            });
            outcome.groups[idx].records.push(record);
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_storage_in_memory;
    use crate::types::StatusKind;
    use chrono::Duration;

    fn record(key: &str, event_id: i64) -> PredictionRecord {
        PredictionRecord {
            key: key.into(),
            entity_id: "u1".into(),
            event_id,
            event_slug: "a-b".into(),
            custom_id: None,
            sport: "football".into(),
            match_label: "A vs B".into(),
            market: "Match Winner".into(),
            selection: "1".into(),
            odds: 2.0,
            status_label: "Not started".into(),
            status: StatusKind::Active,
            starts_at: None,
            observed_at: Utc::now(),
        }
    }

    fn detector() -> (ChangeDetector, Storage) {
        let storage = open_storage_in_memory().unwrap();
        (ChangeDetector::new(DetectorConfig::default(), storage.clone()), storage)
    }

    #[test]
    fn test_window_verdict_boundaries() {
        let cfg = DetectorConfig::default();
        let now = Utc::now();

        assert_eq!(window_verdict(None, now, &cfg), WindowVerdict::Admit);
        assert_eq!(window_verdict(Some(now + Duration::hours(23)), now, &cfg), WindowVerdict::Admit);
        assert_eq!(window_verdict(Some(now + Duration::hours(24)), now, &cfg), WindowVerdict::Admit);
        assert_eq!(window_verdict(Some(now + Duration::hours(25)), now, &cfg), WindowVerdict::TooFar);
        assert_eq!(window_verdict(Some(now - Duration::minutes(4)), now, &cfg), WindowVerdict::Admit);
        assert_eq!(window_verdict(Some(now - Duration::minutes(5)), now, &cfg), WindowVerdict::Admit);
        assert_eq!(window_verdict(Some(now - Duration::minutes(6)), now, &cfg), WindowVerdict::Stale);
    }

    #[tokio::test]
    async fn test_second_observation_is_seen() {
        let (detector, _) = detector();
        let now = Utc::now();

        let first = detector.process(vec![record("k1", 1)], now).await;
        assert_eq!(first.stats.new_records, 1);
        assert_eq!(first.groups.len(), 1);

        let second = detector.process(vec![record("k1", 1)], now).await;
        assert_eq!(second.stats.already_seen, 1);
        assert!(second.groups.is_empty());
    }

    #[tokio::test]
    async fn test_only_finished_records_are_terminal() {
        let (detector, storage) = detector();
        let now = Utc::now();
        let mut finished = record("k1", 1);
        finished.status = StatusKind::Finished;
        let mut canceled = record("k2", 2);
        canceled.status = StatusKind::Canceled;
        let mut postponed = record("k3", 3);
        postponed.status = StatusKind::from_provider(Some("postponed"));
        postponed.starts_at = Some(now + Duration::hours(2));

        let out = detector.process(vec![finished, canceled, postponed], now).await;
        assert_eq!(out.stats.terminal, 1);
        assert!(storage.is_seen("k1").await);

        let events: Vec<i64> = out.groups.iter().map(|g| g.event_id).collect();
        assert_eq!(events, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_time_window_filtering() {
        let (detector, storage) = detector();
        let now = Utc::now();

        let mut far = record("far", 1);
        far.starts_at = Some(now + Duration::hours(30));
        let mut stale = record("stale", 2);
        stale.starts_at = Some(now - Duration::minutes(30));
        let mut live = record("live", 3);
        live.starts_at = Some(now - Duration::minutes(2));

        let out = detector.process(vec![far, stale, live], now).await;
        assert_eq!(out.stats.too_far, 1);
        assert_eq!(out.stats.stale, 1);
        assert_eq!(out.groups.len(), 1);
        assert_eq!(out.groups[0].event_id, 3);

        // Too-far records stay eligible; stale ones are marked seen
        assert!(!storage.is_seen("far").await);
        assert!(storage.is_seen("stale").await);
    }

    #[tokio::test]
    async fn test_groups_by_event_in_first_seen_order() {
        let (detector, _) = detector();
        let out = detector
            .process(
                vec![record("a", 7), record("b", 3), record("c", 7)],
                Utc::now(),
            )
            .await;

        let shape: Vec<(i64, usize)> = out.groups.iter().map(|g| (g.event_id, g.records.len())).collect();
        assert_eq!(shape, vec![(7, 2), (3, 1)]);
    }

    #[tokio::test]
    async fn test_movement_tracked_for_seen_records() {
        let (detector, _) = detector();
        let now = Utc::now();

        detector.process(vec![record("k1", 1)], now).await;
        let mut moved = record("k1", 1);
        moved.odds = 2.5;

        let out = detector.process(vec![moved], now).await;
        assert!(out.groups.is_empty(), "already seen");
        assert_eq!(out.movements.len(), 1);
        assert_eq!(out.movements[0].previous_odds, 2.0);
    }
}
