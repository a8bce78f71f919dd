//! Discord webhook notifier.
//!
//! Embeds are built by pure functions so their shape can be tested without a
//! network. Posting retries only on 429, sleeping for the server's hint.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::NotifierConfig;
use crate::line_movement::LineMovement;
use crate::notifier::{entity_url, format_odds, match_url, HealthStatus, MonitorReport, Notifier};
use crate::types::{RecordGroup, TrackedEntity};

/// Total POST attempts per message
const MAX_ATTEMPTS: u32 = 3;

/// Added on top of the server's retry hint
const RETRY_BUFFER: Duration = Duration::from_millis(100);

/// Used when a 429 carries no usable hint
const DEFAULT_RETRY_SECS: f64 = 1.0;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

const COLOR_PROFITABLE: u32 = 3447003;
const COLOR_NEUTRAL: u32 = 10181046;
const COLOR_DROP: u32 = 15158332;
const COLOR_RISE: u32 = 3066993;
const COLOR_HEALTHY: u32 = 0x00FF00;
const COLOR_PROBLEM: u32 = 0xFF0000;

const FOOTER: &str = "Tipster Monitor";

/// How long to wait after a 429
pub fn retry_delay(hint_secs: Option<f64>) -> Duration {
    let secs = hint_secs
        .filter(|s| s.is_finite() && *s >= 0.0)
        .unwrap_or(DEFAULT_RETRY_SECS)
        .min(60.0);
    Duration::from_secs_f64(secs) + RETRY_BUFFER
}

// === Embeds ===

pub fn new_records_embed(entity: &TrackedEntity, group: &RecordGroup) -> Option<Value> {
    let first = group.first()?;

    let color = if entity.is_profitable() { COLOR_PROFITABLE } else { COLOR_NEUTRAL };
    let current_icon = if entity.current.yield_pct > 10.0 { "🟢" } else { "⚪" };

    let selections = group
        .records
        .iter()
        .enumerate()
        .map(|(i, r)| {
            format!("**{}.** {}: {} @ **{}** 🎯", i + 1, r.market, r.selection, format_odds(r.odds))
        })
        .collect::<Vec<_>>()
        .join("\n");

    let performance = format!(
        "**All Time** ⚪\nROI: **{:.1}%** | P&L: **{:+.0}** | Win: **{:.0}%**\n\n\
         **Current** {}\nROI: **{:.1}%** | P&L: **{:+.0}** | Win: **{:.0}%**",
        entity.all_time.yield_pct,
        entity.all_time.profit_units,
        entity.all_time.win_rate_pct,
        current_icon,
        entity.current.yield_pct,
        entity.current.profit_units,
        entity.current.win_rate_pct,
    );

    Some(json!({
        "title": "⚽️ NEW PREDICTION ALERT",
        "color": color,
        "fields": [
            {"name": "🔮 Predictor", "value": format!("[{}]({})", entity.name, entity_url(&entity.id)), "inline": true},
            {"name": "📊 Performance", "value": performance, "inline": true},
            {"name": "⚽️ Match", "value": format!("[{}]({})", first.match_label, match_url(first)), "inline": false},
            {"name": format!("🎯 Selections ({})", group.records.len()), "value": selections, "inline": false},
        ],
        "footer": {"text": FOOTER},
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

pub fn movement_embed(movement: &LineMovement) -> Value {
    let record = &movement.record;
    let (direction, arrow, color) = if movement.is_drop() {
        ("DROP", "🔻", COLOR_DROP)
    } else {
        ("RISE", "🔺", COLOR_RISE)
    };

    json!({
        "title": format!("{} Line Movement Alert ({:.1}%)", arrow, movement.movement_pct()),
        "color": color,
        "fields": [
            {"name": "Match", "value": format!("[{}]({})", record.match_label, match_url(record)), "inline": false},
            {"name": "Selection", "value": format!("**{}**: {}", record.market, record.selection), "inline": false},
            {"name": "Odds Change", "value": format!("{:.2} ➔ **{:.2}**", movement.previous_odds, record.odds), "inline": true},
            {"name": "Movement", "value": format!("{} of {:.2}", direction, (record.odds - movement.previous_odds).abs()), "inline": true},
        ],
        "footer": {"text": format!("{} • Line Tracking", FOOTER)},
    })
}

pub fn health_embed(status: HealthStatus, message: &str) -> Value {
    json!({
        "title": format!("System Alert: {}", status),
        "description": message,
        "color": if status.is_problem() { COLOR_PROBLEM } else { COLOR_HEALTHY },
        "timestamp": Utc::now().to_rfc3339(),
        "footer": {"text": format!("{} Health", FOOTER)},
    })
}

pub fn report_embed(report: &MonitorReport) -> Value {
    let color = if report.new_records > 0 { COLOR_PROFITABLE } else { COLOR_NEUTRAL };
    json!({
        "title": "📈 Monitor Report",
        "description": format!("Since {}", report.window_start.format("%Y-%m-%d %H:%M UTC")),
        "color": color,
        "fields": [
            {"name": "Cycles", "value": report.cycles.to_string(), "inline": true},
            {"name": "Checks", "value": report.checks.to_string(), "inline": true},
            {"name": "Success Rate", "value": format!("{:.1}%", report.success_rate_pct()), "inline": true},
            {"name": "Skipped (paused)", "value": report.skipped_paused.to_string(), "inline": true},
            {"name": "Not Found", "value": report.not_found_failures.to_string(), "inline": true},
            {"name": "Transient Failures", "value": report.transient_failures.to_string(), "inline": true},
            {"name": "New Predictions", "value": report.new_records.to_string(), "inline": true},
            {"name": "Movement Alerts", "value": report.movement_alerts.to_string(), "inline": true},
            {"name": "Tracked Predictors", "value": report.tracked_entities.to_string(), "inline": true},
        ],
        "footer": {"text": format!("{} • Performance Tracking", FOOTER)},
        "timestamp": Utc::now().to_rfc3339(),
    })
}

// === Notifier ===

pub struct DiscordNotifier {
    http: reqwest::Client,
    webhook_url: String,
    health_webhook_url: Option<String>,
}

impl DiscordNotifier {
    /// Returns `None` when no main webhook is configured
    pub fn from_config(config: &NotifierConfig) -> Result<Option<Self>> {
        let Some(webhook_url) = config.webhook_url.clone() else {
            return Ok(None);
        };
        let http = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .context("building webhook client")?;

        info!(
            "[NOTIFY] Discord webhook configured (health channel: {})",
            if config.health_webhook_url.is_some() { "yes" } else { "no" }
        );

        Ok(Some(Self {
            http,
            webhook_url,
            health_webhook_url: config.health_webhook_url.clone(),
        }))
    }

    async fn post_embed(&self, url: &str, embed: Value, what: &str) {
        let payload = json!({ "embeds": [embed] });

        for attempt in 1..=MAX_ATTEMPTS {
            let response = match self.http.post(url).json(&payload).send().await {
                Ok(r) => r,
                Err(e) => {
                    error!("[NOTIFY] Failed to send {}: {}", what, e);
                    return;
                }
            };

            let status = response.status();
            if status.is_success() {
                debug!("[NOTIFY] Sent {}", what);
                return;
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                let header_hint = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<f64>().ok());
                let body_hint = response
                    .json::<Value>()
                    .await
                    .ok()
                    .and_then(|body| body.get("retry_after").and_then(Value::as_f64));

                let wait = retry_delay(body_hint.or(header_hint));
                warn!(
                    "[NOTIFY] Discord rate limited ({}/{}), sleeping {:.1}s",
                    attempt,
                    MAX_ATTEMPTS,
                    wait.as_secs_f64()
                );
                tokio::time::sleep(wait).await;
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            error!("[NOTIFY] Discord rejected {} ({}): {}", what, status, body);
            return;
        }

        error!("[NOTIFY] Gave up on {} after {} attempts", what, MAX_ATTEMPTS);
    }
}

#[async_trait]
impl Notifier for DiscordNotifier {
    async fn deliver_new_records(&self, entity: &TrackedEntity, group: &RecordGroup) {
        if let Some(embed) = new_records_embed(entity, group) {
            self.post_embed(&self.webhook_url, embed, "new prediction alert").await;
        }
    }

    async fn deliver_movement_alert(&self, movement: &LineMovement) {
        self.post_embed(&self.webhook_url, movement_embed(movement), "line movement alert")
            .await;
    }

    async fn deliver_health_event(&self, status: HealthStatus, message: &str) {
        match &self.health_webhook_url {
            Some(url) => self.post_embed(url, health_embed(status, message), "health alert").await,
            None => debug!("[NOTIFY] No health webhook; {}: {}", status, message),
        }
    }

    async fn deliver_periodic_report(&self, report: &MonitorReport) {
        self.post_embed(&self.webhook_url, report_embed(report), "periodic report")
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PredictionRecord, StatusKind, WindowStats};

    fn record(selection: &str, odds: f64) -> PredictionRecord {
        PredictionRecord {
            key: selection.into(),
            entity_id: "42".into(),
            event_id: 9,
            event_slug: "a-b".into(),
            custom_id: None,
            sport: "football".into(),
            match_label: "A vs B".into(),
            market: "Match Winner".into(),
            selection: selection.into(),
            odds,
            status_label: "Not started".into(),
            status: StatusKind::Active,
            starts_at: None,
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn test_retry_delay_uses_hint_plus_buffer() {
        assert_eq!(retry_delay(Some(2.5)), Duration::from_millis(2600));
        assert_eq!(retry_delay(None), Duration::from_millis(1100));
        assert_eq!(retry_delay(Some(f64::NAN)), Duration::from_millis(1100));
        assert_eq!(retry_delay(Some(-3.0)), Duration::from_millis(1100));
    }

    #[test]
    fn test_new_records_embed_lists_every_selection() {
        let mut entity = TrackedEntity::from_id("42");
        entity.current = WindowStats { yield_pct: 12.0, ..Default::default() };
        let group = RecordGroup {
            event_id: 9,
            records: vec![record("1", 2.0), record("X", 3.4)],
        };

        let embed = new_records_embed(&entity, &group).unwrap();
        assert_eq!(embed["color"], COLOR_PROFITABLE);
        let fields = embed["fields"].as_array().unwrap();
        assert_eq!(fields[3]["name"], "🎯 Selections (2)");
        let listed = fields[3]["value"].as_str().unwrap();
        assert!(listed.contains("**1.** Match Winner: 1 @ **2.00**"));
        assert!(listed.contains("**2.** Match Winner: X @ **3.40**"));
        assert!(fields[0]["value"].as_str().unwrap().contains("/user/profile/42"));
    }

    #[test]
    fn test_empty_group_has_no_embed() {
        let group = RecordGroup { event_id: 9, records: vec![] };
        assert!(new_records_embed(&TrackedEntity::from_id("42"), &group).is_none());
    }

    #[test]
    fn test_movement_embed_direction() {
        let falling = LineMovement { record: record("1", 1.70), previous_odds: 2.05, movement: 0.171 };
        let embed = movement_embed(&falling);
        assert_eq!(embed["color"], COLOR_DROP);
        assert!(embed["title"].as_str().unwrap().contains("17.1%"));
        assert!(embed["fields"][3]["value"].as_str().unwrap().starts_with("DROP"));

        let rise = LineMovement { record: record("1", 2.10), previous_odds: 1.80, movement: 0.167 };
        assert_eq!(movement_embed(&rise)["color"], COLOR_RISE);
    }

    #[test]
    fn test_health_embed_color() {
        assert_eq!(health_embed(HealthStatus::Startup, "up")["color"], COLOR_HEALTHY);
        assert_eq!(health_embed(HealthStatus::Error, "boom")["color"], COLOR_PROBLEM);
        assert_eq!(health_embed(HealthStatus::Stalled, "slow")["title"], "System Alert: Stalled");
    }

    #[test]
    fn test_from_config_without_webhook() {
        assert!(DiscordNotifier::from_config(&NotifierConfig::default()).unwrap().is_none());
    }
}
