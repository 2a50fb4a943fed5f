//! Metric names and the write-only sink VUs report into.
//!
//! Every VU shares one sink. Counters and trends are forwarded to the
//! `metrics` facade (Prometheus when the binary installs a recorder) and also
//! tallied locally so the runner can log a summary at the end of a run.

use dashmap::DashMap;
use metrics::{Label, counter, histogram};

/// Tags attached to a single metric sample.
pub type Tags<'a> = &'a [(&'static str, String)];

pub const SESSIONS: &str = "towerload_sessions_total";
pub const SESSION_DURATION: &str = "towerload_session_duration_ms";
pub const MATCHING_DELAY: &str = "towerload_matching_delay_ms";
pub const ASYNC_GAME_STARTS: &str = "towerload_async_game_starts_total";
pub const ASYNC_GAME_ACCEPTS: &str = "towerload_async_game_accepts_total";
pub const ASYNC_GAME_DECLINES: &str = "towerload_async_game_declines_total";
pub const ASYNC_GAME_MOVES: &str = "towerload_async_game_moves_total";
pub const ASYNC_GAME_COMPLETES: &str = "towerload_async_game_completes_total";
pub const LIVE_GAMES: &str = "towerload_live_games_total";
pub const LIVE_GAME_DURATION: &str = "towerload_live_game_duration_ms";
pub const ROUND_DELAY: &str = "towerload_round_delay_ms";
pub const BOTS_PERCENT: &str = "towerload_bots_percent";
pub const BASIC_SPINS: &str = "towerload_basic_spins_total";
pub const MEGA_SPINS: &str = "towerload_mega_spins_total";
pub const NO_SPINS: &str = "towerload_no_spins_total";
pub const NETWORK_ERRORS: &str = "towerload_network_errors_total";
pub const API_ERRORS: &str = "towerload_api_errors_total";
pub const TIMEOUTS: &str = "towerload_timeouts_total";
pub const IDENTITY_THROTTLES: &str = "towerload_identity_throttles_total";
pub const HOME_SCREEN: &str = "towerload_home_screen_total";
pub const ACTIVITY_SCREEN: &str = "towerload_activity_screen_total";
pub const SETTINGS_SCREEN: &str = "towerload_settings_screen_total";
pub const ARCADE_SCREEN: &str = "towerload_arcade_screen_total";
pub const EVENTS_SCREEN: &str = "towerload_events_screen_total";
pub const EVENT_DETAILS_SCREEN: &str = "towerload_event_details_screen_total";
pub const MATCHUPS_SCREEN: &str = "towerload_matchups_screen_total";
pub const PVP_SCREEN: &str = "towerload_pvp_screen_total";
pub const POWERPLAY_SETTINGS_SCREEN: &str = "towerload_powerplay_settings_screen_total";
pub const GOAL_AWARDS_CLAIMED: &str = "towerload_goal_awards_claimed_total";
pub const EVENT_PRIZES_CLAIMED: &str = "towerload_event_prizes_claimed_total";
pub const REPLAYS_WATCHED: &str = "towerload_replays_watched_total";
pub const LIVE_GAME_CANCEL_REQUESTS: &str = "towerload_live_game_cancel_requests_total";

/// Write-only metrics collaborator.
///
/// Implementations must tolerate concurrent calls from every VU task.
pub trait MetricsSink: Send + Sync {
    /// Add `value` to a monotonically increasing counter.
    fn counter(&self, name: &'static str, value: u64, tags: Tags<'_>);

    /// Record one sample of a distribution (durations in ms, rates as 0/1).
    fn trend(&self, name: &'static str, value: f64, tags: Tags<'_>);
}

/// Running statistics for a trend.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrendSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl TrendSummary {
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    fn record(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
    }
}

/// Production sink: forwards to the `metrics` facade and keeps totals.
#[derive(Debug, Default)]
pub struct Metrics {
    counters: DashMap<&'static str, u64>,
    trends: DashMap<&'static str, TrendSummary>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total of a counter across all tag sets.
    pub fn counter_total(&self, name: &str) -> u64 {
        self.counters.get(name).map(|v| *v).unwrap_or(0)
    }

    /// Summary of a trend across all tag sets.
    pub fn trend_summary(&self, name: &str) -> Option<TrendSummary> {
        self.trends.get(name).map(|v| *v)
    }

    /// Render every non-empty counter and trend, sorted by name.
    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .counters
            .iter()
            .map(|entry| format!("{} = {}", entry.key(), entry.value()))
            .collect();
        lines.extend(self.trends.iter().map(|entry| {
            let t = entry.value();
            format!(
                "{} count={} mean={:.1} min={:.1} max={:.1}",
                entry.key(),
                t.count,
                t.mean(),
                t.min,
                t.max
            )
        }));
        lines.sort();
        lines
    }
}

fn to_labels(tags: Tags<'_>) -> Vec<Label> {
    tags.iter()
        .map(|(key, value)| Label::new(*key, value.clone()))
        .collect()
}

impl MetricsSink for Metrics {
    fn counter(&self, name: &'static str, value: u64, tags: Tags<'_>) {
        *self.counters.entry(name).or_insert(0) += value;
        counter!(name, to_labels(tags)).increment(value);
    }

    fn trend(&self, name: &'static str, value: f64, tags: Tags<'_>) {
        self.trends.entry(name).or_default().record(value);
        histogram!(name, to_labels(tags)).record(value);
    }
}
