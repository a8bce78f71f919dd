//! Polling loop orchestration.
//!
//! One long-lived loop. Each cycle fans out a check per tracked entity onto a
//! `JoinSet`, bounded by a permit pool, and waits for all of them before the
//! adaptive sleep. A panicking check is isolated to its task; a panicking
//! cycle is caught, reported, and followed by a fixed backoff. Only the
//! cancellation token ends the loop, and it never interrupts a running cycle.
//!
//! Stalls are caught two ways: between cycles by `housekeeping`, and during a
//! cycle by a watchdog task that fires if the cycle overruns the deadline.
//!
//! Interval selection (`next_interval`) is a pure function of the clock and
//! config so it can be tested without sleeping.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc, Weekday};
use futures_util::FutureExt;
use rand::Rng;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::circuit_breaker::{Admission, CircuitBreaker, FailureKind};
use crate::config::{DiscoveryConfig, MonitorConfig, SchedulerConfig};
use crate::detector::ChangeDetector;
use crate::discovery::Discovery;
use crate::fetcher::Fetcher;
use crate::notifier::{HealthStatus, MonitorReport, Notifier};
use crate::storage::Storage;
use crate::types::{PredictionRecord, TrackedEntity};

/// A cycle is overdue after this many base intervals without completing
const STALL_FACTOR: f64 = 3.0;

// === Interval ===

/// Minute-of-quarter range that triggers burst polling (:09-:14, :24-:29, ...)
fn in_burst_window(minute: u32) -> bool {
    (9..=14).contains(&(minute % 15))
}

/// Sleep before the next cycle, given the local clock and a jitter factor.
///
/// Burst mode returns `burst_interval` unchanged. Otherwise the base interval
/// is scaled by the weekend multiplier and `jitter_factor`, then floored at
/// `min_interval`.
pub fn next_interval<Tz: TimeZone>(
    now: &DateTime<Tz>,
    config: &SchedulerConfig,
    jitter_factor: f64,
) -> Duration {
    if in_burst_window(now.minute()) {
        return config.burst_interval;
    }

    let mut secs = config.base_interval_minutes * 60.0 * jitter_factor;
    if matches!(now.weekday(), Weekday::Sat | Weekday::Sun) {
        secs *= config.weekend_multiplier;
    }

    Duration::try_from_secs_f64(secs)
        .unwrap_or(Duration::ZERO)
        .max(config.min_interval)
}

/// Random multiplier in [1 - jitter, 1 + jitter]
pub fn sample_jitter(jitter: f64) -> f64 {
    if jitter <= 0.0 {
        return 1.0;
    }
    rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter))
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::weeks(52))
}

// === Per-entity check ===

/// What happened to one entity in one cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Paused by the circuit breaker; not fetched
    Skipped,
    Failed(FailureKind),
    Checked { new_records: usize, movements: usize },
}

/// Totals for one cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub checks: usize,
    pub skipped: usize,
    pub not_found: usize,
    pub transient: usize,
    pub new_records: usize,
    pub movements: usize,
    /// Checks whose task panicked
    pub crashed: usize,
}

impl CycleStats {
    fn absorb(&mut self, outcome: CheckOutcome) {
        match outcome {
            CheckOutcome::Skipped => self.skipped += 1,
            CheckOutcome::Failed(kind) => {
                self.checks += 1;
                match kind {
                    FailureKind::NotFound => self.not_found += 1,
                    FailureKind::Transient => self.transient += 1,
                }
            }
            CheckOutcome::Checked { new_records, movements } => {
                self.checks += 1;
                self.new_records += new_records;
                self.movements += movements;
            }
        }
    }
}

/// Everything a check task needs, shared across the cycle's tasks
struct CheckContext {
    fetcher: Arc<dyn Fetcher>,
    notifier: Arc<dyn Notifier>,
    breaker: CircuitBreaker,
    detector: ChangeDetector,
    permits: Semaphore,
}

async fn check_entity(ctx: &CheckContext, entity: &TrackedEntity, now: DateTime<Utc>) -> CheckOutcome {
    let failures = match ctx.breaker.admit(&entity.id, now).await {
        Admission::Skip { paused_until } => {
            debug!(
                "[SCHED] Skipping paused {} until {}",
                entity.name,
                paused_until.format("%H:%M:%S")
            );
            return CheckOutcome::Skipped;
        }
        Admission::Proceed { failures } => failures,
    };

    let fetched = {
        let Ok(_permit) = ctx.permits.acquire().await else {
            return CheckOutcome::Skipped;
        };
        ctx.fetcher.fetch_activity(&entity.id, 0).await
    };

    let raw = match fetched {
        Ok(raw) => raw,
        Err(e) => {
            let kind = e.kind();
            warn!("[SCHED] Check failed for {} ({}): {}", entity.name, entity.id, e);
            ctx.breaker.record_failure(&entity.id, kind, now).await;
            return CheckOutcome::Failed(kind);
        }
    };

    ctx.breaker.record_success(&entity.id, failures, now).await;

    let records: Vec<PredictionRecord> = raw
        .iter()
        .map(|r| PredictionRecord::from_raw(&entity.id, r, now))
        .collect();
    let outcome = ctx.detector.process(records, now).await;

    for movement in &outcome.movements {
        ctx.notifier.deliver_movement_alert(movement).await;
    }
    for group in &outcome.groups {
        info!(
            "[SCHED] 🔔 {} | {} new on event {}",
            entity.name,
            group.records.len(),
            group.event_id
        );
        ctx.notifier.deliver_new_records(entity, group).await;
    }

    CheckOutcome::Checked {
        new_records: outcome.stats.new_records,
        movements: outcome.movements.len(),
    }
}

// === Scheduler ===

/// Loop bookkeeping kept explicitly instead of as ambient globals
#[derive(Debug, Clone)]
pub struct LoopState {
    /// Last time a cycle completed
    pub last_activity: DateTime<Utc>,
    pub last_purge: Option<DateTime<Utc>>,
    /// Set once a stall was reported, cleared by the next completed cycle
    pub stall_reported: bool,
    /// Current reporting window; `window_start` doubles as the last report time
    pub report: MonitorReport,
}

impl LoopState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            last_activity: now,
            last_purge: None,
            stall_reported: false,
            report: MonitorReport::new(now),
        }
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    discovery_config: DiscoveryConfig,
    retention: chrono::Duration,
    storage: Storage,
    notifier: Arc<dyn Notifier>,
    discovery: Discovery,
    ctx: Arc<CheckContext>,
    entities: Vec<Arc<TrackedEntity>>,
    state: LoopState,
}

impl Scheduler {
    pub fn new(
        config: &MonitorConfig,
        storage: Storage,
        fetcher: Arc<dyn Fetcher>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let ctx = CheckContext {
            fetcher: fetcher.clone(),
            notifier: notifier.clone(),
            breaker: CircuitBreaker::new(config.circuit_breaker.clone(), storage.clone()),
            detector: ChangeDetector::new(config.detector.clone(), storage.clone()),
            permits: Semaphore::new(config.scheduler.max_concurrent_checks.max(1)),
        };

        Self {
            config: config.scheduler.clone(),
            discovery_config: config.discovery.clone(),
            retention: config.storage.retention,
            storage,
            notifier,
            discovery: Discovery::new(fetcher, config.discovery.filter.clone()),
            ctx: Arc::new(ctx),
            entities: Vec::new(),
            state: LoopState::new(Utc::now()),
        }
    }

    pub fn entities(&self) -> &[Arc<TrackedEntity>] {
        &self.entities
    }

    pub fn state(&self) -> &LoopState {
        &self.state
    }

    /// Start tracking `entity`; returns false if its id is already tracked
    pub fn track(&mut self, entity: TrackedEntity) -> bool {
        if self.entities.iter().any(|e| e.id == entity.id) {
            return false;
        }
        self.entities.push(Arc::new(entity));
        true
    }

    /// Add statically configured ids, then run discovery if enabled.
    /// Returns the number of entities added.
    pub async fn populate_entities(&mut self) -> usize {
        let before = self.entities.len();

        let static_ids = self.discovery_config.static_entity_ids.clone();
        for id in &static_ids {
            self.track(TrackedEntity::from_id(id));
        }

        if self.discovery_config.enabled {
            let tracked: HashSet<Arc<str>> = self.entities.iter().map(|e| e.id.clone()).collect();
            match self.discovery.discover(self.discovery_config.limit, &tracked).await {
                Ok(found) => {
                    for entity in found {
                        self.track(entity);
                    }
                }
                Err(e) => warn!("[SCHED] Discovery failed, continuing with {} entities: {}", before, e),
            }
        }

        self.entities.len() - before
    }

    /// Check every tracked entity once, concurrently, and wait for all of them.
    pub async fn run_cycle(&mut self, now: DateTime<Utc>) -> CycleStats {
        let started = Instant::now();
        let mut tasks = JoinSet::new();
        for entity in &self.entities {
            let ctx = self.ctx.clone();
            let entity = entity.clone();
            tasks.spawn(async move { check_entity(&ctx, &entity, now).await });
        }

        let mut stats = CycleStats::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => stats.absorb(outcome),
                Err(e) => {
                    error!("[SCHED] Entity check aborted: {}", e);
                    stats.crashed += 1;
                }
            }
        }

        let report = &mut self.state.report;
        report.cycles += 1;
        report.checks += stats.checks as u64;
        report.skipped_paused += stats.skipped as u64;
        report.not_found_failures += stats.not_found as u64;
        report.transient_failures += stats.transient as u64;
        report.new_records += stats.new_records as u64;
        report.movement_alerts += stats.movements as u64;

        self.state.last_activity = now + to_chrono(started.elapsed());
        self.state.stall_reported = false;
        stats
    }

    fn stall_after(&self) -> chrono::Duration {
        to_chrono(
            Duration::try_from_secs_f64(self.config.base_interval_minutes * 60.0 * STALL_FACTOR)
                .unwrap_or(Duration::MAX),
        )
    }

    /// Report a stall if the cycle about to start is still running at the
    /// stall deadline. The flag is set once the event has been sent.
    fn spawn_stall_watchdog(&self) -> Option<(JoinHandle<()>, Arc<AtomicBool>)> {
        if self.state.stall_reported {
            return None;
        }
        let deadline = self.state.last_activity + self.stall_after();
        let notifier = self.notifier.clone();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();

        let handle = tokio::spawn(async move {
            let wait = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait).await;
            let message = format!("Cycle still running past the stall deadline ({})", deadline.format("%H:%M:%S"));
            warn!("[SCHED] ⚠️ {}", message);
            notifier.deliver_health_event(HealthStatus::Stalled, &message).await;
            flag.store(true, Ordering::Release);
        });
        Some((handle, fired))
    }

    /// Purge seen keys and snapshots older than the retention horizon
    pub async fn purge(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.retention;
        let purged = self.storage.purge_older_than(cutoff).await;
        info!(
            "[SCHED] 🧹 Retention purge before {}: {} seen keys, {} snapshots",
            cutoff.format("%Y-%m-%d"),
            purged.seen_keys,
            purged.snapshots
        );
        self.state.last_purge = Some(now);
    }

    /// Between-cycle upkeep: periodic report, retention purge, stall detection
    pub async fn housekeeping(&mut self, now: DateTime<Utc>) {
        if now - self.state.report.window_start >= to_chrono(self.config.report_interval) {
            self.state.report.tracked_entities = self.entities.len();
            self.notifier.deliver_periodic_report(&self.state.report).await;
            self.state.report = MonitorReport::new(now);
        }

        let purge_due = self
            .state
            .last_purge
            .map_or(true, |last| now - last >= to_chrono(self.config.purge_interval));
        if purge_due {
            self.purge(now).await;
        }

        let idle = now - self.state.last_activity;
        if idle > self.stall_after() && !self.state.stall_reported {
            let message = format!("No cycle completed for {} minutes", idle.num_minutes());
            warn!("[SCHED] ⚠️ {}", message);
            self.notifier.deliver_health_event(HealthStatus::Stalled, &message).await;
            self.state.stall_reported = true;
        }
    }

    /// Run until `shutdown` is cancelled. In-flight cycles always finish.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        let started = Utc::now();
        self.state = LoopState::new(started);
        self.purge(started).await;

        let added = self.populate_entities().await;
        info!(
            "[SCHED] Monitoring {} predictors ({} added at startup) with {}m base interval",
            self.entities.len(),
            added,
            self.config.base_interval_minutes
        );
        self.notifier
            .deliver_health_event(
                HealthStatus::Startup,
                &format!("Monitoring {} predictors", self.entities.len()),
            )
            .await;

        while !shutdown.is_cancelled() {
            let cycle_start = Instant::now();
            let now = Utc::now();
            let watchdog = self.spawn_stall_watchdog();

            let result = AssertUnwindSafe(self.run_cycle(now)).catch_unwind().await;
            let watchdog_fired = match watchdog {
                Some((handle, fired)) => {
                    handle.abort();
                    fired.load(Ordering::Acquire)
                }
                None => false,
            };

            match result {
                Ok(stats) => {
                    info!(
                        "[SCHED] Cycle done in {:.1}s | checks={} skipped={} failed={} new={} movements={}",
                        cycle_start.elapsed().as_secs_f64(),
                        stats.checks,
                        stats.skipped,
                        stats.not_found + stats.transient,
                        stats.new_records,
                        stats.movements
                    );
                }
                Err(panic) => {
                    // No cycle completed, so a stall already sent stays reported
                    if watchdog_fired {
                        self.state.stall_reported = true;
                    }
                    let message = panic_message(panic.as_ref());
                    error!("[SCHED] Cycle failed: {}", message);
                    self.notifier
                        .deliver_health_event(HealthStatus::Error, &format!("Cycle failed: {}", message))
                        .await;
                    self.housekeeping(Utc::now()).await;
                    if !sleep_or_cancel(self.config.loop_backoff, &shutdown).await {
                        break;
                    }
                    continue;
                }
            }

            self.housekeeping(Utc::now()).await;

            let local_now = Utc::now().with_timezone(&self.config.utc_offset);
            let interval = next_interval(&local_now, &self.config, sample_jitter(self.config.jitter));
            let elapsed = cycle_start.elapsed();
            let sleep = interval.saturating_sub(elapsed);

            if sleep.is_zero() {
                warn!(
                    "[SCHED] Cycle took {:.1}s, longer than the {:.1}s interval",
                    elapsed.as_secs_f64(),
                    interval.as_secs_f64()
                );
            } else {
                info!("[SCHED] 💤 Sleeping {:.1}s", sleep.as_secs_f64());
            }

            if !sleep_or_cancel(sleep, &shutdown).await {
                break;
            }
        }

        info!("[SCHED] Shutdown requested, loop stopped");
        self.notifier
            .deliver_health_event(HealthStatus::Shutdown, "Monitor stopped")
            .await;
    }
}

/// Sleep for `duration`; false if cancelled first
async fn sleep_or_cancel(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = shutdown.cancelled() => false,
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, NaiveDate};

    /// 2024-06-05 is a Wednesday, 2024-06-08 a Saturday
    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        NaiveDate::from_ymd_opt(2024, 6, day)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
            .and_utc()
    }

    #[test]
    fn test_burst_window_last_six_minutes_of_quarter() {
        let cfg = SchedulerConfig::default();
        for minute in [9, 10, 14, 24, 29, 39, 44, 54, 59] {
            assert_eq!(next_interval(&at(5, 12, minute), &cfg, 1.0), Duration::from_secs(60), "minute {}", minute);
        }
        for minute in [0, 8, 15, 23, 30, 45, 53] {
            assert!(next_interval(&at(5, 12, minute), &cfg, 1.0) >= cfg.min_interval, "minute {}", minute);
            assert_ne!(next_interval(&at(5, 12, minute), &cfg, 1.0), cfg.burst_interval);
        }
    }

    #[test]
    fn test_weekday_interval_scales_with_jitter() {
        let cfg = SchedulerConfig::default();
        assert_eq!(next_interval(&at(5, 12, 0), &cfg, 1.0), Duration::from_secs(300));
        assert_eq!(next_interval(&at(5, 12, 0), &cfg, 1.2), Duration::from_secs(360));
    }

    #[test]
    fn test_weekend_multiplier() {
        let cfg = SchedulerConfig::default();
        assert_eq!(next_interval(&at(8, 12, 0), &cfg, 1.0), Duration::from_secs(255));
    }

    #[test]
    fn test_floor_outside_burst_mode() {
        let cfg = SchedulerConfig {
            base_interval_minutes: 1.0,
            ..SchedulerConfig::default()
        };
        assert_eq!(next_interval(&at(5, 12, 0), &cfg, 0.8), Duration::from_secs(180));
        // Burst mode is not floored
        assert_eq!(next_interval(&at(5, 12, 10), &cfg, 0.8), Duration::from_secs(60));
    }

    #[test]
    fn test_degenerate_base_interval_falls_back_to_floor() {
        for base in [f64::INFINITY, f64::NAN, 1e300, -5.0] {
            let cfg = SchedulerConfig {
                base_interval_minutes: base,
                ..SchedulerConfig::default()
            };
            assert_eq!(next_interval(&at(5, 12, 0), &cfg, 1.0), cfg.min_interval, "base {}", base);
        }
    }

    #[test]
    fn test_interval_uses_local_clock() {
        let cfg = SchedulerConfig::default();
        let offset = FixedOffset::east_opt(2 * 3600).unwrap();
        let local = at(5, 12, 4).with_timezone(&offset);
        assert_eq!(next_interval(&local, &cfg, 1.0), Duration::from_secs(300));
        // Friday 23:00 UTC is Saturday 01:00 at +02:00
        let late = at(7, 23, 0).with_timezone(&offset);
        assert_eq!(next_interval(&late, &cfg, 1.0), Duration::from_secs(255));
    }

    #[test]
    fn test_sample_jitter_bounds() {
        for _ in 0..200 {
            let j = sample_jitter(0.2);
            assert!((0.8..=1.2).contains(&j));
        }
        assert_eq!(sample_jitter(0.0), 1.0);
    }

    #[test]
    fn test_cycle_stats_absorb() {
        let mut stats = CycleStats::default();
        stats.absorb(CheckOutcome::Skipped);
        stats.absorb(CheckOutcome::Failed(FailureKind::NotFound));
        stats.absorb(CheckOutcome::Failed(FailureKind::Transient));
        stats.absorb(CheckOutcome::Checked { new_records: 3, movements: 1 });
        assert_eq!(
            stats,
            CycleStats {
                checks: 3,
                skipped: 1,
                not_found: 1,
                transient: 1,
                new_records: 3,
                movements: 1,
                crashed: 0,
            }
        );
    }

    #[test]
    fn test_panic_message() {
        let caught = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "boom");
    }
}
