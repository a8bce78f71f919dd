//! Core type definitions for the activity monitor.
//!
//! This module provides the tracked-entity model, the normalized prediction
//! record, and the raw wire shapes returned by the ranking and activity feeds.
//! Raw feed data is heterogeneous and frequently malformed, so all numeric
//! extraction goes through the `parse_*_or_zero` helpers at this boundary.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

// === Entities ===

/// Performance statistics for one reporting window
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WindowStats {
    /// Yield percentage: profit / total samples * 100
    pub yield_pct: f64,
    /// Profit in flat-stake units
    pub profit_units: f64,
    /// Win rate percentage (0-100)
    pub win_rate_pct: f64,
    /// Average decimal odds of settled winning predictions
    pub avg_settled_odds: f64,
    /// Number of settled predictions in the window
    pub total_samples: u64,
}

/// A ranked predictor whose activity feed is polled.
///
/// Stats are captured at discovery time and never refreshed per poll.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedEntity {
    pub id: Arc<str>,
    pub name: Arc<str>,
    pub slug: Arc<str>,
    pub all_time: WindowStats,
    pub current: WindowStats,
}

impl TrackedEntity {
    /// Entity configured by id only (no ranking stats available)
    pub fn from_id(id: &str) -> Self {
        Self {
            id: id.into(),
            name: id.into(),
            slug: id.into(),
            all_time: WindowStats::default(),
            current: WindowStats::default(),
        }
    }

    /// Whether either window shows a positive yield
    pub fn is_profitable(&self) -> bool {
        self.all_time.yield_pct > 0.0 || self.current.yield_pct > 0.0
    }
}

// === Prediction Records ===

/// Coarse lifecycle of the event a prediction refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusKind {
    Active,
    Finished,
    Canceled,
}

impl StatusKind {
    pub fn from_provider(type_label: Option<&str>) -> Self {
        match type_label.map(|s| s.to_ascii_lowercase()).as_deref() {
            Some("finished") => StatusKind::Finished,
            Some("canceled") | Some("cancelled") => StatusKind::Canceled,
            _ => StatusKind::Active,
        }
    }

    /// Terminal records are never alerted on. Canceled events stay eligible
    pub fn is_terminal(self) -> bool {
        matches!(self, StatusKind::Finished)
    }
}

impl std::fmt::Display for StatusKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusKind::Active => write!(f, "active"),
            StatusKind::Finished => write!(f, "finished"),
            StatusKind::Canceled => write!(f, "canceled"),
        }
    }
}

/// Sentinel odds value meaning the provider odds could not be parsed
pub const UNKNOWN_ODDS: f64 = 0.0;

/// One observed prediction, normalized from a raw feed record.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionRecord {
    /// Stable idempotency key (identical across repeated observations)
    pub key: String,
    pub entity_id: Arc<str>,
    pub event_id: i64,
    pub event_slug: String,
    pub custom_id: Option<String>,
    pub sport: String,
    /// Human-readable "Home vs Away"
    pub match_label: String,
    pub market: String,
    pub selection: String,
    /// Decimal odds (>= 1.0), or `UNKNOWN_ODDS`
    pub odds: f64,
    pub status_label: String,
    pub status: StatusKind,
    pub starts_at: Option<DateTime<Utc>>,
    pub observed_at: DateTime<Utc>,
}

impl PredictionRecord {
    /// Normalize a raw provider record observed for `entity_id` at `observed_at`.
    pub fn from_raw(entity_id: &Arc<str>, raw: &RawPrediction, observed_at: DateTime<Utc>) -> Self {
        let home = raw.home_team_name.as_deref().unwrap_or("Unknown");
        let away = raw.away_team_name.as_deref().unwrap_or("Unknown");
        let status = raw.status.as_ref();

        Self {
            key: raw.idempotency_key(),
            entity_id: entity_id.clone(),
            event_id: raw.event_id.as_ref().map(parse_i64_or_zero).unwrap_or(0),
            event_slug: raw.event_slug(),
            custom_id: raw.custom_id.clone().filter(|s| !s.is_empty()),
            sport: raw.sport_slug.clone().unwrap_or_else(|| "Unknown".to_string()),
            match_label: format!("{} vs {}", home, away),
            market: "Match Winner".to_string(),
            selection: raw.vote.as_ref().map(value_to_string).unwrap_or_else(|| "Unknown".to_string()),
            odds: raw.odds.as_ref().map(RawOdds::decimal).unwrap_or(UNKNOWN_ODDS),
            status_label: status
                .and_then(|s| s.description.clone())
                .unwrap_or_else(|| "Unknown".to_string()),
            status: StatusKind::from_provider(status.and_then(|s| s.kind.as_deref())),
            starts_at: raw
                .start_date_timestamp
                .as_ref()
                .map(parse_i64_or_zero)
                .filter(|ts| *ts > 0)
                .and_then(|ts| DateTime::from_timestamp(ts, 0)),
            observed_at,
        }
    }

    /// Whether odds carry a usable value (the 0.0 sentinel and 1.0 are not)
    pub fn has_known_odds(&self) -> bool {
        self.odds > 1.0
    }
}

/// All new records for one event within one entity's cycle
#[derive(Debug, Clone, PartialEq)]
pub struct RecordGroup {
    pub event_id: i64,
    pub records: Vec<PredictionRecord>,
}

impl RecordGroup {
    pub fn first(&self) -> Option<&PredictionRecord> {
        self.records.first()
    }
}

// === Raw Feed Shapes ===

/// Body of the ranking endpoint
#[derive(Deserialize, Debug, Default)]
pub struct RankingResponse {
    #[serde(default)]
    pub ranking: Vec<RankingEntry>,
}

/// One ranked candidate, exactly as the provider sends it
#[derive(Deserialize, Debug, Clone, Default)]
pub struct RankingEntry {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
    /// Nested `{allTime: {...}, current: {...}}`; shape varies
    #[serde(default, rename = "voteStatistics")]
    pub vote_statistics: Option<Value>,
}

/// Body of the activity endpoint
#[derive(Deserialize, Debug, Default)]
pub struct ActivityResponse {
    #[serde(default)]
    pub predictions: Vec<RawPrediction>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct RawPrediction {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default, rename = "eventId")]
    pub event_id: Option<Value>,
    #[serde(default)]
    pub vote: Option<Value>,
    #[serde(default, rename = "customId")]
    pub custom_id: Option<String>,
    #[serde(default, rename = "eventSlug")]
    pub event_slug: Option<String>,
    #[serde(default, rename = "homeTeamName")]
    pub home_team_name: Option<String>,
    #[serde(default, rename = "awayTeamName")]
    pub away_team_name: Option<String>,
    #[serde(default, rename = "sportSlug")]
    pub sport_slug: Option<String>,
    #[serde(default)]
    pub odds: Option<RawOdds>,
    #[serde(default)]
    pub status: Option<RawStatus>,
    #[serde(default, rename = "startDateTimestamp")]
    pub start_date_timestamp: Option<Value>,
}

impl RawPrediction {
    /// Provider id when present, else `{eventId}_{vote}`
    pub fn idempotency_key(&self) -> String {
        match self.id.as_ref().filter(|v| !v.is_null()).map(value_to_string) {
            Some(id) if !id.is_empty() => id,
            _ => {
                let event = self.event_id.as_ref().map(value_to_string).unwrap_or_else(|| "None".into());
                let vote = self.vote.as_ref().map(value_to_string).unwrap_or_else(|| "None".into());
                format!("{}_{}", event, vote)
            }
        }
    }

    fn event_slug(&self) -> String {
        if let Some(slug) = self.event_slug.as_deref().filter(|s| !s.is_empty()) {
            return slug.to_string();
        }
        let home = slugify(self.home_team_name.as_deref().unwrap_or("event"));
        let away = slugify(self.away_team_name.as_deref().unwrap_or(""));
        if away.is_empty() {
            home
        } else {
            format!("{}-{}", home, away)
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct RawOdds {
    #[serde(default, rename = "decimalValue")]
    pub decimal_value: Option<Value>,
}

impl RawOdds {
    pub fn decimal(&self) -> f64 {
        self.decimal_value.as_ref().map(parse_f64_or_zero).unwrap_or(UNKNOWN_ODDS)
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct RawStatus {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

// === Parse-with-default helpers ===

/// Parse a JSON number or numeric string (optionally suffixed with `%`).
/// Anything missing, non-numeric or non-finite yields 0.0.
pub fn parse_f64_or_zero(value: &Value) -> f64 {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite()).unwrap_or(0.0)
}

/// Parse a JSON integer or integer string. Anything else yields 0.
pub fn parse_i64_or_zero(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).unwrap_or(0),
        Value::String(s) => s.trim().parse::<i64>().unwrap_or(0),
        _ => 0,
    }
}

/// Walk a dotted path through nested objects and parse the leaf as f64 (0.0 on any miss)
pub fn stat_f64(root: Option<&Value>, path: &[&str]) -> f64 {
    lookup(root, path).map(parse_f64_or_zero).unwrap_or(0.0)
}

/// Walk a dotted path and parse the leaf as a non-negative count (0 on any miss)
pub fn stat_u64(root: Option<&Value>, path: &[&str]) -> u64 {
    lookup(root, path).map(parse_i64_or_zero).unwrap_or(0).max(0) as u64
}

fn lookup<'a>(root: Option<&'a Value>, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(root?, |node, segment| node.get(*segment))
}

/// Render ids that may arrive as numbers or strings
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn slugify(s: &str) -> String {
    s.to_lowercase().replace(' ', "-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> RawPrediction {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_key_prefers_provider_id() {
        let p = raw(json!({"id": 999, "eventId": 555, "vote": "1"}));
        assert_eq!(p.idempotency_key(), "999");
    }

    #[test]
    fn test_key_falls_back_to_event_and_selection() {
        let p = raw(json!({"eventId": 555, "vote": "X"}));
        assert_eq!(p.idempotency_key(), "555_X");

        let p = raw(json!({"id": null, "eventId": "555", "vote": 2}));
        assert_eq!(p.idempotency_key(), "555_2");
    }

    #[test]
    fn test_key_is_stable_across_observations() {
        let body = json!({"eventId": 77, "vote": "2", "odds": {"decimalValue": "2.10"}});
        let entity: Arc<str> = "u1".into();
        let a = PredictionRecord::from_raw(&entity, &raw(body.clone()), Utc::now());
        let b = PredictionRecord::from_raw(&entity, &raw(body), Utc::now());
        assert_eq!(a.key, b.key);
    }

    #[test]
    fn test_from_raw_normalizes_fields() {
        let entity: Arc<str> = "u1".into();
        let p = raw(json!({
            "id": "abc",
            "eventId": 42,
            "vote": "1",
            "homeTeamName": "Real Madrid",
            "awayTeamName": "FC Barcelona",
            "sportSlug": "football",
            "odds": {"decimalValue": "1.85"},
            "status": {"type": "notstarted", "description": "Not started"},
            "startDateTimestamp": 1_700_000_000
        }));
        let rec = PredictionRecord::from_raw(&entity, &p, Utc::now());

        assert_eq!(rec.event_id, 42);
        assert_eq!(rec.event_slug, "real-madrid-fc-barcelona");
        assert_eq!(rec.match_label, "Real Madrid vs FC Barcelona");
        assert_eq!(rec.odds, 1.85);
        assert_eq!(rec.status, StatusKind::Active);
        assert_eq!(rec.status_label, "Not started");
        assert_eq!(rec.starts_at.map(|t| t.timestamp()), Some(1_700_000_000));
    }

    #[test]
    fn test_unparsable_odds_use_sentinel() {
        let entity: Arc<str> = "u1".into();
        let rec = PredictionRecord::from_raw(
            &entity,
            &raw(json!({"id": 1, "odds": {"decimalValue": "5/2"}})),
            Utc::now(),
        );
        assert_eq!(rec.odds, UNKNOWN_ODDS);
        assert!(!rec.has_known_odds());
    }

    #[test]
    fn test_status_kind_mapping() {
        assert_eq!(StatusKind::from_provider(Some("finished")), StatusKind::Finished);
        assert_eq!(StatusKind::from_provider(Some("canceled")), StatusKind::Canceled);
        assert_eq!(StatusKind::from_provider(Some("postponed")), StatusKind::Active);
        assert!(StatusKind::Finished.is_terminal());
        assert!(!StatusKind::Canceled.is_terminal());
        assert_eq!(StatusKind::from_provider(Some("inprogress")), StatusKind::Active);
        assert_eq!(StatusKind::from_provider(None), StatusKind::Active);
    }

    #[test]
    fn test_parse_helpers_default_to_zero() {
        assert_eq!(parse_f64_or_zero(&json!("55.5%")), 55.5);
        assert_eq!(parse_f64_or_zero(&json!("n/a")), 0.0);
        assert_eq!(parse_f64_or_zero(&json!(null)), 0.0);
        assert_eq!(parse_f64_or_zero(&json!({"x": 1})), 0.0);
        assert_eq!(parse_i64_or_zero(&json!("120")), 120);
        assert_eq!(parse_i64_or_zero(&json!("12x")), 0);

        let stats = json!({"allTime": {"total": "40", "avgCorrectOdds": {"decimalValue": "2.11"}}});
        assert_eq!(stat_u64(Some(&stats), &["allTime", "total"]), 40);
        assert_eq!(stat_f64(Some(&stats), &["allTime", "avgCorrectOdds", "decimalValue"]), 2.11);
        assert_eq!(stat_f64(Some(&stats), &["current", "roi"]), 0.0);
        assert_eq!(stat_f64(None, &["allTime", "roi"]), 0.0);
    }
}
