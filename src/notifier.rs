//! Outbound notification seam.
//!
//! Delivery is best-effort: every method returns `()` and implementations log
//! and swallow their own failures so nothing propagates back into a check.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::SITE_BASE_URL;
use crate::line_movement::LineMovement;
use crate::types::{PredictionRecord, RecordGroup, TrackedEntity};

/// Lifecycle events reported on the health channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Startup,
    Error,
    Shutdown,
    /// No cycle has completed for longer than expected
    Stalled,
}

impl HealthStatus {
    pub fn is_problem(self) -> bool {
        matches!(self, HealthStatus::Error | HealthStatus::Stalled)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Startup => write!(f, "Startup"),
            HealthStatus::Error => write!(f, "Error"),
            HealthStatus::Shutdown => write!(f, "Shutdown"),
            HealthStatus::Stalled => write!(f, "Stalled"),
        }
    }
}

/// Aggregate counters for one reporting window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorReport {
    pub window_start: DateTime<Utc>,
    pub cycles: u64,
    pub checks: u64,
    pub skipped_paused: u64,
    pub not_found_failures: u64,
    pub transient_failures: u64,
    pub new_records: u64,
    pub movement_alerts: u64,
    pub tracked_entities: usize,
}

impl MonitorReport {
    pub fn new(window_start: DateTime<Utc>) -> Self {
        Self {
            window_start,
            cycles: 0,
            checks: 0,
            skipped_paused: 0,
            not_found_failures: 0,
            transient_failures: 0,
            new_records: 0,
            movement_alerts: 0,
            tracked_entities: 0,
        }
    }

    pub fn failures(&self) -> u64 {
        self.not_found_failures + self.transient_failures
    }

    /// Share of attempted checks that succeeded, 0-100
    pub fn success_rate_pct(&self) -> f64 {
        if self.checks == 0 {
            return 0.0;
        }
        self.checks.saturating_sub(self.failures()) as f64 / self.checks as f64 * 100.0
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// One message per event group; never called with an empty group
    async fn deliver_new_records(&self, entity: &TrackedEntity, group: &RecordGroup);

    async fn deliver_movement_alert(&self, movement: &LineMovement);

    async fn deliver_health_event(&self, status: HealthStatus, message: &str);

    async fn deliver_periodic_report(&self, report: &MonitorReport);
}

// === Links ===

pub fn entity_url(entity_id: &str) -> String {
    format!("{}/user/profile/{}", SITE_BASE_URL, entity_id)
}

/// Public match page for a record
pub fn match_url(record: &PredictionRecord) -> String {
    let slug = if record.event_slug.is_empty() { "match" } else { &record.event_slug };
    match record.custom_id.as_deref() {
        Some(custom_id) => {
            let sport = if record.sport.is_empty() { "sport" } else { &record.sport };
            format!(
                "{}/{}/match/{}/{}#id:{}",
                SITE_BASE_URL, sport, slug, custom_id, record.event_id
            )
        }
        None => format!("{}/{}/{}", SITE_BASE_URL, slug, record.event_id),
    }
}

/// Render odds, showing the unknown sentinel as `?`
pub fn format_odds(odds: f64) -> String {
    if odds > 1.0 {
        format!("{:.2}", odds)
    } else {
        "?".to_string()
    }
}

// === Log Notifier ===

/// Writes notifications to the log; used when no webhook is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver_new_records(&self, entity: &TrackedEntity, group: &RecordGroup) {
        let Some(first) = group.first() else {
            return;
        };
        info!(
            "[NOTIFY] 🎯 {} | {} | {} new ({})",
            entity.name,
            first.match_label,
            group.records.len(),
            match_url(first)
        );
        for (i, record) in group.records.iter().enumerate() {
            info!(
                "[NOTIFY]    {}. {}: {} @ {}",
                i + 1,
                record.market,
                record.selection,
                format_odds(record.odds)
            );
        }
    }

    async fn deliver_movement_alert(&self, movement: &LineMovement) {
        let direction = if movement.is_drop() { "DROP" } else { "RISE" };
        info!(
            "[NOTIFY] Line movement {} {:.1}% | {} | {}: {:.2} -> {:.2}",
            direction,
            movement.movement_pct(),
            movement.record.match_label,
            movement.record.selection,
            movement.previous_odds,
            movement.record.odds
        );
    }

    async fn deliver_health_event(&self, status: HealthStatus, message: &str) {
        if status.is_problem() {
            warn!("[NOTIFY] Health {}: {}", status, message);
        } else {
            info!("[NOTIFY] Health {}: {}", status, message);
        }
    }

    async fn deliver_periodic_report(&self, report: &MonitorReport) {
        info!(
            "[NOTIFY] 📊 Report since {} | cycles={} checks={} skipped={} failures={} (not found {}) new={} movements={} entities={}",
            report.window_start.format("%Y-%m-%d %H:%M"),
            report.cycles,
            report.checks,
            report.skipped_paused,
            report.failures(),
            report.not_found_failures,
            report.new_records,
            report.movement_alerts,
            report.tracked_entities
        );
    }
}
