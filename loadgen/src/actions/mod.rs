//! Domain action library
//!
//! Concrete player behaviors, grouped by the area of the app they exercise.
//! Every action returns a [`Step`] so multi-request flows can bail out early
//! with `?`; [`VirtualUser::perform`] settles the step into an
//! [`ActionOutcome`] for the dispatcher.

mod account;
mod bootstrap;
mod events;
mod feeds;
mod gameplay;
mod matchups;

use serde_json::Value;
use tracing::{error, info};

use crate::client::RequestResult;
use crate::dispatch::ActionOutcome;
use crate::screen::Act;
use crate::vu::{FeedKind, SimError, Step, VirtualUser, halt, settle};

/// Idle time on screens that refresh in the background, seconds.
pub(crate) const IDLE: (f64, f64) = (5.0, 45.0);
/// Time spent away from the app before the next session, seconds.
const EXIT_PAUSE: (f64, f64) = (60.0, 120.0);

impl VirtualUser {
    /// Run one action kind to its outcome.
    pub(crate) async fn perform(&mut self, act: Act) -> Result<ActionOutcome, SimError> {
        let step = match act {
            Act::Open(screen) => return self.run_screen(screen).await,
            Act::Exit => self.exit_session().await,
            Act::Back | Act::NewTab => Ok(ActionOutcome::LeaveScreen),
            Act::Stay => Ok(ActionOutcome::Continue),
            Act::PlayRandomLive => self.play_random_live().await,
            Act::PlayArcade => self.practice().await,
            Act::TogglePowerPlay => self.toggle_power_play().await,
            Act::SetMinimumLevel => self.set_minimum_level().await,
            Act::SetMaximumLevel => self.set_maximum_level().await,
            Act::ToggleIncludeBots => self.toggle_include_bots().await,
            Act::CashOut => self.cash_out().await,
            Act::SetInviter => self.set_inviter().await,
            Act::RecentGames => Ok(self.api.get("users/stats").await.ok_or_fatal()),
            Act::Spin => self.spin().await,
            Act::WinningsFeed => self.open_feed(FeedKind::Winnings, None).await,
            Act::Leaderboard(board) => Ok(self.leaderboard(board, None).await.ok_or_fatal()),
            Act::ClaimGoal => self.claim_goal().await,
            Act::EventsIdle => self.events_idle().await,
            Act::SelectEvent => self.select_event().await,
            Act::SelectHiddenEvent => self.select_hidden_event().await,
            Act::EventLeaderboard => self.event_leaderboard_tab().await,
            Act::EventFeed => self.event_feed_tab().await,
            Act::EventDetailsIdle => self.event_details_idle().await,
            Act::EventAction => self.event_action().await,
            Act::SearchForUser => self.search_for_user().await,
            Act::SocialIdle => self.social_idle().await,
            Act::MatchupAction => self.matchup_action().await,
            Act::Accept => self.accept_challenge().await,
            Act::Decline => self.decline_challenge().await,
            Act::Move => self.pvp_move().await,
            Act::AckRejected => self.pvp_ack_rejected().await,
            Act::SeeResult => self.pvp_see_result().await,
            Act::StartChallenge => self.issue_challenge().await,
            Act::FeedIdle => self.feed_idle().await,
            Act::WatchReplay => self.watch_replay().await,
            Act::MatchupAgainst => self.matchup_against().await,
        };
        settle(step)
    }

    async fn exit_session(&mut self) -> Step<ActionOutcome> {
        info!("VU {}: leaving the app", self.ordinal);
        self.pause(EXIT_PAUSE.0, EXIT_PAUSE.1).await?;
        Ok(ActionOutcome::Suspend)
    }

    /// Every user-bound action needs the snapshot from bootstrap.
    pub(crate) fn ensure_user(&self) -> Step {
        if self.state.user.is_none() {
            error!("VU {}: No user!", self.ordinal);
            return halt(ActionOutcome::FatalAbort);
        }
        Ok(())
    }

    /// `users?projection=standard`, refreshing the cached user.
    pub(crate) async fn get_user(&mut self) -> RequestResult {
        let result = self.api.get("users?projection=standard").await;
        self.store_user(&result);
        result
    }

    /// Refresh the cached user from a successful result's payload.
    pub(crate) fn store_user(&mut self, result: &RequestResult) {
        if result.is_ok()
            && let Some(data) = result.data().cloned()
        {
            self.set_user(&data);
        }
    }

    /// Store the `user` field of a successful result's payload.
    pub(crate) fn store_nested_user(&mut self, result: &RequestResult) {
        if result.is_ok()
            && let Some(user) = result.data().and_then(|d| d.get("user")).cloned()
        {
            self.set_user(&user);
        }
    }

    pub(crate) async fn find_user(&mut self, username: &str) -> RequestResult {
        self.api
            .get(&format!(
                "users/find?username={username}&allowBots=True&projection=brief&exact=True"
            ))
            .await
    }

    /// Send a client event to a running game.
    pub(crate) async fn game_event(
        &mut self,
        game_id: &str,
        event_type: &str,
        data: Option<Value>,
    ) -> RequestResult {
        let mut event = serde_json::json!({ "type": event_type });
        if let Some(data) = data {
            event["data"] = data;
        }
        self.api
            .post(
                &format!("games/{game_id}/event"),
                &serde_json::json!({ "event": event }),
            )
            .await
    }

    /// Reload what the app fetches after leaving a game.
    pub(crate) async fn unload_game(&mut self) {
        self.api.get("config/towerdata").await;
        self.api.get("config/appData").await;
        self.get_user().await;
        self.api.get("config/charitydata").await;
        self.api.get("special_events").await;
        let result = self.api.get("users?projection=all").await;
        self.store_user(&result);
        if let Some(opponent) = self.state.last_opponent.as_ref().map(|o| o.username.clone()) {
            self.find_user(&opponent).await;
        }
    }
}
