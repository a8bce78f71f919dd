//! System configuration and environment variable parsing.
//!
//! Every component owns a small config struct with a `from_env()` constructor
//! that falls back to defaults for anything unset or unparsable.
//! `MonitorConfig` stitches them together for the binary.

use chrono::{FixedOffset, Offset, Utc};
use std::str::FromStr;
use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;

/// Default feed API root
pub const FEED_BASE_URL: &str = "https://www.sofascore.com/api/v1";

/// Public site root used to build entity and match links
pub const SITE_BASE_URL: &str = "https://www.sofascore.com";

/// Default SQLite path
pub const DEFAULT_DB_PATH: &str = "data/monitor.db";

/// Parse an environment variable, falling back to `default` when unset or malformed
pub fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Integer variable clamped into `[min, max]`
pub fn env_in<T: FromStr + Ord>(key: &str, default: T, min: T, max: T) -> T {
    env_or(key, default).clamp(min, max)
}

/// Float variable clamped into `[min, max]`; NaN and infinities fall back to `default`
pub fn env_f64_in(key: &str, default: f64, min: f64, max: f64) -> f64 {
    let v: f64 = env_or(key, default);
    if v.is_finite() {
        v.clamp(min, max)
    } else {
        default
    }
}

/// Boolean flag: "1" or "true" (any case) enables
pub fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

/// Non-empty string variable
pub fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

// === Scheduler ===

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Base poll interval in minutes
    pub base_interval_minutes: f64,
    /// Never sleep less than this outside burst mode
    pub min_interval: Duration,
    /// Fixed interval used in the last six minutes of each quarter hour
    pub burst_interval: Duration,
    /// Interval multiplier applied on Saturday and Sunday
    pub weekend_multiplier: f64,
    /// Jitter fraction; the interval is scaled by a factor in [1 - j, 1 + j]
    pub jitter: f64,
    /// Clock used for burst/weekend decisions
    pub utc_offset: FixedOffset,
    /// Sleep after a cycle fails
    pub loop_backoff: Duration,
    /// Permit pool size for concurrent entity checks
    pub max_concurrent_checks: usize,
    /// Cadence of the aggregate report
    pub report_interval: Duration,
    /// Cadence of the retention purge
    pub purge_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            base_interval_minutes: 5.0,
            min_interval: Duration::from_secs(180),
            burst_interval: Duration::from_secs(60),
            weekend_multiplier: 0.85,
            jitter: 0.2,
            utc_offset: Utc.fix(),
            loop_backoff: Duration::from_secs(60),
            max_concurrent_checks: 5,
            report_interval: Duration::from_secs(24 * 60 * 60),
            purge_interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let offset_hours: i32 = env_in("SCHEDULE_UTC_OFFSET_HOURS", 0, -12, 14);
        Self {
            base_interval_minutes: env_f64_in("SCAN_INTERVAL_MINUTES", d.base_interval_minutes, 0.1, 24.0 * 60.0),
            min_interval: Duration::from_secs(env_in("MIN_INTERVAL_SECS", d.min_interval.as_secs(), 0, 24 * 60 * 60)),
            burst_interval: Duration::from_secs(env_in("BURST_INTERVAL_SECS", d.burst_interval.as_secs(), 1, 60 * 60)),
            weekend_multiplier: env_f64_in("WEEKEND_MULTIPLIER", d.weekend_multiplier, 0.1, 10.0),
            jitter: env_f64_in("INTERVAL_JITTER", d.jitter, 0.0, 0.9),
            utc_offset: FixedOffset::east_opt(offset_hours * 3600).unwrap_or(d.utc_offset),
            loop_backoff: Duration::from_secs(env_in("LOOP_BACKOFF_SECS", d.loop_backoff.as_secs(), 1, 60 * 60)),
            max_concurrent_checks: env_in("MAX_CONCURRENT_CHECKS", d.max_concurrent_checks, 1, 64),
            report_interval: Duration::from_secs(env_in("REPORT_INTERVAL_HOURS", 24u64, 1, 24 * 30) * 60 * 60),
            purge_interval: d.purge_interval,
        }
    }
}

// === Discovery ===

/// Minimums a ranked candidate must meet (ALL of them) to be tracked
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionFilter {
    pub min_yield_pct: f64,
    pub min_samples: u64,
    pub min_avg_odds: f64,
    pub min_win_rate_pct: f64,
}

impl Default for AdmissionFilter {
    fn default() -> Self {
        Self {
            min_yield_pct: 0.0,
            min_samples: 0,
            min_avg_odds: 1.5,
            min_win_rate_pct: 0.0,
        }
    }
}

impl AdmissionFilter {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            min_yield_pct: env_f64_in("MIN_ROI", d.min_yield_pct, -100.0, 1000.0),
            min_samples: env_or("MIN_TOTAL_BETS", d.min_samples),
            min_avg_odds: env_f64_in("MIN_AVG_ODDS", d.min_avg_odds, 0.0, 1000.0),
            min_win_rate_pct: env_f64_in("MIN_WIN_RATE", d.min_win_rate_pct, 0.0, 100.0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Number of candidates to admit per discovery run
    pub limit: usize,
    /// Run discovery at startup
    pub enabled: bool,
    /// Entities tracked regardless of discovery
    pub static_entity_ids: Vec<String>,
    pub filter: AdmissionFilter,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            limit: 10,
            enabled: true,
            static_entity_ids: Vec::new(),
            filter: AdmissionFilter::default(),
        }
    }
}

impl DiscoveryConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            limit: env_or("TOP_PREDICTORS_LIMIT", d.limit),
            enabled: env_flag("AUTO_DISCOVERY", d.enabled),
            static_entity_ids: env_string("TARGET_ENTITY_IDS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            filter: AdmissionFilter::from_env(),
        }
    }
}

// === Change detection ===

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Records starting later than now + lookahead are not actionable yet
    pub lookahead: chrono::Duration,
    /// Started records older than this past their start are suppressed
    pub grace_period: chrono::Duration,
    /// Relative odds movement that trips a movement alert
    pub movement_threshold: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            lookahead: chrono::Duration::hours(24),
            grace_period: chrono::Duration::minutes(5),
            movement_threshold: 0.15,
        }
    }
}

impl DetectorConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            lookahead: chrono::Duration::hours(env_in("TIME_LOOKAHEAD_HOURS", 24, 1, 24 * 30)),
            grace_period: chrono::Duration::minutes(env_in("MATCH_GRACE_PERIOD_MINUTES", 5, 0, 24 * 60)),
            movement_threshold: env_f64_in("MOVEMENT_THRESHOLD", d.movement_threshold, 0.01, 10.0),
        }
    }
}

// === Storage ===

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub db_path: String,
    /// Seen keys and odds snapshots older than this are purged
    pub retention: chrono::Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: DEFAULT_DB_PATH.to_string(),
            retention: chrono::Duration::days(30),
        }
    }
}

impl StorageConfig {
    pub fn from_env() -> Self {
        Self {
            db_path: env_string("DB_PATH").unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            retention: chrono::Duration::days(env_in("RETENTION_DAYS", 30, 1, 3650)),
        }
    }
}

// === Collaborators ===

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub rate_limit_per_sec: u32,
    pub proxy_url: Option<String>,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            base_url: FEED_BASE_URL.to_string(),
            timeout: Duration::from_secs(15),
            rate_limit_per_sec: 2,
            proxy_url: None,
        }
    }
}

impl FetcherConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: env_string("FEED_BASE_URL").unwrap_or_else(|| FEED_BASE_URL.to_string()),
            timeout: Duration::from_secs(env_in("FEED_TIMEOUT_SECS", 15, 1, 300)),
            rate_limit_per_sec: env_in("FEED_RATE_LIMIT_PER_SEC", 2u32, 1, 100),
            proxy_url: env_string("PROXY_URL"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NotifierConfig {
    pub webhook_url: Option<String>,
    pub health_webhook_url: Option<String>,
}

impl NotifierConfig {
    pub fn from_env() -> Self {
        Self {
            webhook_url: env_string("DISCORD_WEBHOOK_URL"),
            health_webhook_url: env_string("DISCORD_HEALTH_WEBHOOK_URL"),
        }
    }
}

/// Full runtime configuration
#[derive(Debug, Clone, Default)]
pub struct MonitorConfig {
    pub scheduler: SchedulerConfig,
    pub discovery: DiscoveryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub detector: DetectorConfig,
    pub storage: StorageConfig,
    pub fetcher: FetcherConfig,
    pub notifier: NotifierConfig,
}

impl MonitorConfig {
    pub fn from_env() -> Self {
        Self {
            scheduler: SchedulerConfig::from_env(),
            discovery: DiscoveryConfig::from_env(),
            circuit_breaker: CircuitBreakerConfig::from_env(),
            detector: DetectorConfig::from_env(),
            storage: StorageConfig::from_env(),
            fetcher: FetcherConfig::from_env(),
            notifier: NotifierConfig::from_env(),
        }
    }
}
