//! Predictor discovery from the public ranking.
//!
//! Candidates are examined in rank order. Stats are parsed defensively (every
//! missing or malformed field reads as zero) and filtered against the
//! configured minimums on the all-time window. Discovery stops once `limit`
//! candidates have been admitted, however many it had to examine.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::AdmissionFilter;
use crate::fetcher::{FetchError, Fetcher};
use crate::types::{stat_f64, stat_u64, value_to_string, RankingEntry, TrackedEntity, WindowStats};

impl AdmissionFilter {
    /// A candidate must meet every minimum
    pub fn admits(&self, stats: &WindowStats) -> bool {
        stats.yield_pct >= self.min_yield_pct
            && stats.total_samples >= self.min_samples
            && stats.avg_settled_odds >= self.min_avg_odds
            && stats.win_rate_pct >= self.min_win_rate_pct
    }
}

/// Parse one window (`allTime` / `current`) of a candidate's statistics
pub fn parse_window(entry: &RankingEntry, window: &str) -> WindowStats {
    let root = entry.vote_statistics.as_ref();
    let profit_units = stat_f64(root, &[window, "roi"]);
    let total_samples = stat_u64(root, &[window, "total"]);

    let yield_pct = if total_samples > 0 {
        profit_units / total_samples as f64 * 100.0
    } else {
        0.0
    };

    WindowStats {
        yield_pct,
        profit_units,
        win_rate_pct: stat_f64(root, &[window, "percentage"]),
        avg_settled_odds: stat_f64(root, &[window, "avgCorrectOdds", "decimalValue"]),
        total_samples,
    }
}

/// Build an entity from a ranking entry. Entries without an id are unusable.
pub fn parse_candidate(entry: &RankingEntry) -> Option<TrackedEntity> {
    let id = entry
        .id
        .as_ref()
        .map(value_to_string)
        .filter(|id| !id.is_empty())?;

    let name = entry
        .nickname
        .as_deref()
        .filter(|s| !s.is_empty())
        .or(entry.slug.as_deref().filter(|s| !s.is_empty()))
        .unwrap_or("Unknown")
        .to_string();
    let slug = entry
        .slug
        .clone()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| name.clone());

    Some(TrackedEntity {
        id: id.into(),
        name: name.into(),
        slug: slug.into(),
        all_time: parse_window(entry, "allTime"),
        current: parse_window(entry, "current"),
    })
}

pub struct Discovery {
    fetcher: Arc<dyn Fetcher>,
    filter: AdmissionFilter,
}

impl Discovery {
    pub fn new(fetcher: Arc<dyn Fetcher>, filter: AdmissionFilter) -> Self {
        Self { fetcher, filter }
    }

    /// Admit up to `limit` new entities, skipping ids in `tracked`.
    ///
    /// Rejected candidates are not remembered; a later run re-evaluates them.
    pub async fn discover(
        &self,
        limit: usize,
        tracked: &HashSet<Arc<str>>,
    ) -> Result<Vec<TrackedEntity>, FetchError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        info!("[DISCOVERY] 🔍 Fetching predictor ranking (limit {})", limit);
        let ranking = self.fetcher.fetch_ranking().await.map_err(|e| {
            warn!("[DISCOVERY] Ranking fetch failed: {}", e);
            e
        })?;

        let mut admitted = Vec::with_capacity(limit);
        let mut examined = 0usize;

        for entry in &ranking {
            if admitted.len() >= limit {
                break;
            }
            examined += 1;

            let Some(candidate) = parse_candidate(entry) else {
                debug!("[DISCOVERY] Skipping ranking entry without id");
                continue;
            };
            if tracked.contains(&candidate.id) {
                continue;
            }
            if !self.filter.admits(&candidate.all_time) {
                debug!(
                    "[DISCOVERY] Rejected {}: yield {:.1}% samples {} odds {:.2} win {:.0}%",
                    candidate.name,
                    candidate.all_time.yield_pct,
                    candidate.all_time.total_samples,
                    candidate.all_time.avg_settled_odds,
                    candidate.all_time.win_rate_pct
                );
                continue;
            }

            info!(
                "[DISCOVERY] ✅ {} ({}) | yield {:.1}% over {} | current {:.1}%",
                candidate.name,
                candidate.id,
                candidate.all_time.yield_pct,
                candidate.all_time.total_samples,
                candidate.current.yield_pct
            );
            admitted.push(candidate);
        }

        info!(
            "[DISCOVERY] Admitted {} of {} examined ({} ranked)",
            admitted.len(),
            examined,
            ranking.len()
        );
        Ok(admitted)
    }
}
