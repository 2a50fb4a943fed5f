//! Home, settings, wallet and goals actions.

use rand::Rng;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::client::{AppErrorCode, RequestResult};
use crate::dispatch::ActionOutcome;
use crate::metrics;
use crate::screen::Leaderboard;
use crate::vu::model::{BASIC_SPIN, CashoutStart, MEGA_SPIN, ProgressTrackers, SpecialEventSequence};
use crate::vu::{PowerPlay, Step, VirtualUser, halt, naming};

const INVITER_DRAWS: usize = 10;
/// Ad watched before each spin, seconds
const AD_WATCH: (f64, f64) = (5.0, 35.0);
const CASH_OUT_CONFIRM: (f64, f64) = (1.0, 30.0);

/// Charity share of a cash out: `10 + round(90 * draw)` percent, split off
/// the balance with the player keeping the remainder.
pub(crate) fn cash_out_split(balance: f64, draw: f64) -> (u32, f64, f64) {
    let percent = 10 + (90.0 * draw).round() as u32;
    let charity = (balance * f64::from(percent) / 100.0).floor();
    (percent, charity, balance - charity)
}

impl VirtualUser {
    pub(crate) async fn fetch_progress(&mut self) {
        let result = self.api.get("users/progress_trackers").await;
        if result.is_ok() {
            self.state.progress = result.data_as::<ProgressTrackers>();
        }
    }

    /// Refresh the featured event banner, fetching its leaderboard when the
    /// featured event changed or is a surge.
    pub(crate) async fn update_featured_events(&mut self) {
        let result = self.api.get("special_events").await;
        self.api.get("users/active_count").await;
        let Some(featured) = result
            .data_as::<SpecialEventSequence>()
            .and_then(|seq| seq.current.into_iter().next())
        else {
            return;
        };
        if self.state.featured_event.as_deref() == Some(featured.id.as_str()) && !featured.is_surge() {
            return;
        }
        self.api.get("special_events").await;
        let board = if featured.is_surge() {
            Leaderboard::SurgeScore
        } else {
            Leaderboard::AdHocScore
        };
        self.leaderboard(board, Some(&featured.id)).await;
        self.state.featured_event = Some(featured.id);
    }

    pub(crate) fn load_power_play(&mut self) {
        let profile = self.state.user.as_ref().and_then(|u| u.profile.clone());
        if profile.is_none() {
            error!("VU {}: profile undefined for {}", self.ordinal, self.username());
        }
        let profile = profile.unwrap_or_default();
        let max_level = self.state.max_level;
        // The backend reports "no upper bound" as a huge level
        let max = profile
            .default_matchmaking_level
            .filter(|l| *l > 0.0)
            .map_or(max_level, |l| (l as u32).min(max_level));
        self.state.power_play = PowerPlay {
            active: profile.use_default_matchmaking_level,
            min: profile.lowest_matchmaking_level.map_or(0, |l| l.max(0.0) as u32),
            max,
        };
    }

    async fn update_profile(&mut self, profile: Value) -> Step<RequestResult> {
        let result = self.api.post("users", &json!({ "profile": profile })).await;
        self.check(&result, "users", true)?;
        Ok(result)
    }

    pub(crate) async fn toggle_power_play(&mut self) -> Step<ActionOutcome> {
        let active = !self.state.power_play.active;
        self.state.power_play.active = active;
        debug!("VU {}: power play {}", self.ordinal, if active { "on" } else { "off" });
        let result = self
            .update_profile(json!({ "useDefaultMatchmakingLevel": active }))
            .await?;
        // Likelier to leave after turning it off
        let leave = if active { 0.5 } else { 0.9 };
        let draw = self.chance();
        Ok(result.ok_or_back(leave, draw))
    }

    pub(crate) async fn set_minimum_level(&mut self) -> Step<ActionOutcome> {
        let min = self.rng.random_range(0..=self.state.power_play.max / 2);
        self.state.power_play.min = min;
        let result = self
            .update_profile(json!({ "lowestMatchmakingLevel": min }))
            .await?;
        let draw = self.chance();
        Ok(result.ok_or_back(0.75, draw))
    }

    pub(crate) async fn set_maximum_level(&mut self) -> Step<ActionOutcome> {
        let PowerPlay { min, max, .. } = self.state.power_play;
        let low = (min * 2).min(max);
        let max = self.rng.random_range(low..=self.state.max_level.max(low));
        self.state.power_play.max = max;
        let result = self
            .update_profile(json!({ "defaultMatchmakingLevel": max }))
            .await?;
        let draw = self.chance();
        Ok(result.ok_or_back(0.75, draw))
    }

    pub(crate) async fn toggle_include_bots(&mut self) -> Step<ActionOutcome> {
        self.state.excluding_bots = !self.state.excluding_bots;
        let result = self
            .update_profile(json!({ "excludeBots": self.state.excluding_bots }))
            .await?;
        let draw = self.chance();
        Ok(result.ok_or_back(0.75, draw))
    }

    pub(crate) async fn cash_out(&mut self) -> Step<ActionOutcome> {
        info!("VU {}: Cash out...", self.ordinal);
        self.ensure_user()?;
        let start = self.api.post("users/cashout_start", &json!({})).await;
        self.check(&start, "users/cashout_start", false)?;
        if !start.data_as::<CashoutStart>().is_some_and(|c| c.is_allowed) {
            debug!("VU {}: cash out not allowed", self.ordinal);
            return Ok(ActionOutcome::Continue);
        }
        let draw = self.chance();
        let (percent, charity, player) = cash_out_split(self.balance(), draw);
        self.pause(CASH_OUT_CONFIRM.0, CASH_OUT_CONFIRM.1).await?;
        let payee = format!("fake_{}@tallyup.com", self.phone.get(2..).unwrap_or_default());
        let finish = self
            .api
            .post(
                "users/cashout_finish",
                &json!({
                    "charityPercent": percent,
                    "desiredCharityAmount": charity,
                    "desiredPlayerAmount": player,
                    "payee": payee,
                }),
            )
            .await;
        self.check(&finish, "users/cashout_finish", false)?;
        self.store_user(&finish);
        Ok(finish.ok_or_fatal())
    }

    /// Name another load-test user as this player's inviter.
    pub(crate) async fn set_inviter(&mut self) -> Step<ActionOutcome> {
        self.ensure_user()?;
        if self.state.user.as_ref().is_some_and(|u| u.is_invited()) {
            debug!("VU {}: inviter already set", self.ordinal);
            return Ok(ActionOutcome::NoOpContinue);
        }
        info!("VU {}: Set inviter...", self.ordinal);
        let own = self.username();
        let span = f64::from(self.ctx.config.vus_max.saturating_sub(1));
        for _ in 0..INVITER_DRAWS {
            let n = 1 + (span * self.chance()).floor() as u32;
            let inviter = naming::username(n);
            if inviter == own {
                continue;
            }
            let result = self
                .api
                .post("users/set_inviter", &json!({ "inviter": inviter }))
                .await;
            self.store_user(&result);
            return Ok(result.ok_or_fatal());
        }
        warn!("VU {}: Cannot find another user for setInviter", self.ordinal);
        Ok(ActionOutcome::NoOpContinue)
    }

    /// Wallet screen spin; only a fatal error changes the flow.
    pub(crate) async fn spin(&mut self) -> Step<ActionOutcome> {
        let result = self.home_spinner().await?;
        Ok(result.ok_or_fatal())
    }

    /// Watch an ad, then use a mega or basic spin.
    pub(crate) async fn home_spinner(&mut self) -> Step<RequestResult> {
        let choice = (100.0 * self.chance()).round();
        let result = self.api.post("ads/start", &json!({})).await;
        if result.is_err() {
            return Ok(result);
        }
        debug!("VU {}: Watching ad...", self.ordinal);
        self.pause(AD_WATCH.0, AD_WATCH.1).await?;
        let result = self.api.post("ads/finish", &json!({})).await;
        if result.is_err() || self.state.user.is_none() {
            return Ok(result);
        }

        let (item, metric) = if self.has_mega_spins() && (choice > 50.0 || !self.has_basic_spins()) {
            (MEGA_SPIN, metrics::MEGA_SPINS)
        } else if self.has_basic_spins() {
            (BASIC_SPIN, metrics::BASIC_SPINS)
        } else {
            debug!("VU {}: no spins available", self.ordinal);
            self.count(metrics::NO_SPINS, &[]);
            return Ok(result);
        };
        debug!("VU {}: using {}", self.ordinal, item);
        let result = self
            .api
            .post("users/use_item", &json!({ "itemType": item }))
            .await;
        match &result.error {
            None => {
                self.count(metric, &[]);
                self.store_user(&result);
            }
            Some(e) if self.ctx.catalog.classify(e) == AppErrorCode::RankTooLow => {
                let user = self.state.user.as_ref();
                error!(
                    "VU {}: username={} rank={:?} xp={:?} item={}",
                    self.ordinal,
                    self.username(),
                    user.map(|u| u.rank),
                    user.map(|u| u.xp),
                    item
                );
            }
            Some(_) => {}
        }
        Ok(result)
    }

    pub(crate) async fn claim_goal(&mut self) -> Step<ActionOutcome> {
        info!("VU {}: Claiming goal rewards...", self.ordinal);
        let Some(id) = self.state.progress.as_ref().and_then(ProgressTrackers::claimable) else {
            return Ok(ActionOutcome::Continue);
        };
        info!("VU {}: Claiming award for {}", self.ordinal, id);
        let result = self
            .api
            .post(
                "users/progress_trackers/claim",
                &json!({ "progressTrackerId": id }),
            )
            .await;
        if result.is_ok() {
            self.state.progress = result.data_as::<ProgressTrackers>();
            self.count(metrics::GOAL_AWARDS_CLAIMED, &[]);
        }
        if result.is_fatal() {
            error!("VU {}: Fatal error! claim goal: {}", self.ordinal, result.message());
            return halt(ActionOutcome::FatalAbort);
        }
        Ok(ActionOutcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cash_out_split() {
        assert_eq!(cash_out_split(1000.0, 0.0), (10, 100.0, 900.0));
        assert_eq!(cash_out_split(1000.0, 1.0), (100, 1000.0, 0.0));
        let (percent, charity, player) = cash_out_split(1234.0, 0.5);
        assert_eq!(percent, 55);
        assert_eq!(charity, 678.0);
        assert_eq!(charity + player, 1234.0);
    }
}
