//! Matchups: challengees, the player-versus-player prompt and async games.

use serde_json::json;
use tracing::{debug, error};

use crate::client::{AppErrorCode, RequestResult};
use crate::dispatch::ActionOutcome;
use crate::metrics;
use crate::screen::{PvpMain, ScreenId};
use crate::vu::model::{Game, MatchRequested, PlaySession, PublicUsers, SessionStatus, SessionType};
use crate::vu::{Halt, Opponent, Step, VirtualUser, halt, naming};

use super::IDLE;
use super::gameplay::{MatchRequest, game_tags};

/// Prompt action offered for the current match state.
fn pvp_main_for(session: Option<&PlaySession>) -> PvpMain {
    let Some(session) = session else {
        return PvpMain::Challenge;
    };
    match session.status {
        Some(SessionStatus::ChallengeReceived) => PvpMain::Respond,
        Some(SessionStatus::Playing) if session.requires_action => PvpMain::Move,
        Some(SessionStatus::ChallengeRejected) => PvpMain::AckRejected,
        Some(SessionStatus::Completed) => PvpMain::SeeResult,
        _ => PvpMain::Nothing,
    }
}

/// Username of an earlier load-test instance, from a `[0, 1)` draw.
fn searched_instance(own: u32, draw: f64) -> Option<u32> {
    if own < 2 {
        return None;
    }
    Some((f64::from(own - 1) * draw).max(1.0).floor() as u32)
}

impl VirtualUser {
    /// Refresh the user and the challengee list.
    pub(crate) async fn update_social(&mut self) -> Step {
        self.refresh_social().await.map(drop)
    }

    async fn refresh_social(&mut self) -> Step<RequestResult> {
        let user = self.get_user().await;
        self.check(&user, "users", true)?;
        let result = self.api.get("users/find_challengees").await;
        self.check(&result, "users/find_challengees", true)?;
        if result.is_ok()
            && let Some(found) = result.data_as::<PublicUsers>()
        {
            self.state.challengees = found.users;
        }
        Ok(result)
    }

    pub(crate) async fn social_idle(&mut self) -> Step<ActionOutcome> {
        self.pause(IDLE.0, IDLE.1).await?;
        Ok(self.refresh_social().await?.to_outcome())
    }

    /// Look up a random earlier load-test user.
    pub(crate) async fn search_for_user(&mut self) -> Step<ActionOutcome> {
        let own = naming::number_from_phone(&self.phone).unwrap_or(0);
        let draw = self.chance();
        let Some(instance) = searched_instance(own, draw) else {
            return Ok(ActionOutcome::NoOpContinue);
        };
        self.open_pvp(naming::username(instance)).await
    }

    /// The matchups screen's main button: the most pressing match first,
    /// otherwise sometimes a new challengee.
    pub(crate) async fn matchup_action(&mut self) -> Step<ActionOutcome> {
        self.ensure_user()?;
        let pressing = self.state.user.as_ref().and_then(|u| {
            u.async_session_with_status(SessionStatus::Playing, true)
                .or_else(|| u.async_session_with_status(SessionStatus::Completed, false))
                .or_else(|| u.async_session_with_status(SessionStatus::ChallengeReceived, false))
                .or_else(|| u.async_session_with_status(SessionStatus::ChallengeRejected, false))
                .cloned()
        });
        if let Some(session) = pressing {
            return match session.status {
                Some(SessionStatus::Playing) => {
                    debug!("VU {}: Make move...", self.ordinal);
                    self.async_make_move(session).await
                }
                Some(SessionStatus::Completed) => {
                    debug!("VU {}: See result...", self.ordinal);
                    self.async_see_result(session).await
                }
                Some(SessionStatus::ChallengeReceived) => match session.opponent_username {
                    Some(opponent) => self.open_pvp(opponent).await,
                    None => Ok(ActionOutcome::NoOpContinue),
                },
                _ => {
                    debug!("VU {}: Acknowledge declined...", self.ordinal);
                    self.acknowledge_match(&session).await
                }
            };
        }
        // Their move everywhere
        let choice = (100.0 * self.chance()).round();
        if choice <= 50.0 && !self.state.challengees.is_empty() {
            let index = self.pick(self.state.challengees.len());
            let opponent = self.state.challengees[index].username.clone();
            let matched = self
                .state
                .user
                .as_ref()
                .is_some_and(|u| u.async_session_against(&opponent).is_some());
            if !matched {
                return self.open_pvp(opponent).await;
            }
        }
        Ok(ActionOutcome::Continue)
    }

    async fn open_pvp(&mut self, opponent: String) -> Step<ActionOutcome> {
        debug!("VU {}: Go to PvP with {}...", self.ordinal, opponent);
        self.state.pvp_opponent = Some(opponent);
        Ok(self.run_screen(ScreenId::Pvp).await?)
    }

    /// Prompt entry: choose the main action and load the opponent's card.
    pub(crate) async fn enter_pvp(&mut self) -> Step {
        let Some(opponent) = self.state.pvp_opponent.clone() else {
            return halt(ActionOutcome::NoOpContinue);
        };
        self.state.pvp_main = pvp_main_for(
            self.state
                .user
                .as_ref()
                .and_then(|u| u.async_session_against(&opponent)),
        );
        let result = self.find_user(&opponent).await;
        self.check(&result, "users/find", true)?;
        let found = result
            .data()
            .and_then(|d| d.as_array())
            .is_some_and(|users| !users.is_empty());
        if result.is_err() || !found {
            error!("VU {}: cannot find opponent {}", self.ordinal, opponent);
            return halt(ActionOutcome::HandledError);
        }
        let stats = self
            .api
            .get(&format!("users/find_stats?username={opponent}"))
            .await;
        self.check(&stats, "users/find_stats", true)
    }

    fn pvp_session(&self) -> Option<PlaySession> {
        let opponent = self.state.pvp_opponent.as_deref()?;
        self.state
            .user
            .as_ref()?
            .async_session_against(opponent)
            .cloned()
    }

    pub(crate) async fn accept_challenge(&mut self) -> Step<ActionOutcome> {
        let Some(session) = self.pvp_session() else {
            return Ok(ActionOutcome::NoOpContinue);
        };
        if self.balance() < session.matched_level_value {
            return Ok(ActionOutcome::NoOpContinue);
        }
        let result = self
            .api
            .post("games/accept_match", &json!({ "sessionId": session.id }))
            .await;
        self.check(&result, "accept_match", false)?;
        self.count(
            metrics::ASYNC_GAME_ACCEPTS,
            &game_tags(session.game_type.as_deref(), session.level_tag()),
        );
        Ok(ActionOutcome::Continue)
    }

    pub(crate) async fn decline_challenge(&mut self) -> Step<ActionOutcome> {
        let Some(session) = self.pvp_session() else {
            return Ok(ActionOutcome::NoOpContinue);
        };
        let result = self
            .api
            .post("games/decline_match", &json!({ "sessionId": session.id }))
            .await;
        self.check(&result, "decline_match", false)?;
        self.count(
            metrics::ASYNC_GAME_DECLINES,
            &game_tags(session.game_type.as_deref(), session.level_tag()),
        );
        Ok(ActionOutcome::Continue)
    }

    pub(crate) async fn pvp_move(&mut self) -> Step<ActionOutcome> {
        match self.pvp_session() {
            Some(session) => self.async_make_move(session).await,
            None => Ok(ActionOutcome::NoOpContinue),
        }
    }

    pub(crate) async fn pvp_see_result(&mut self) -> Step<ActionOutcome> {
        match self.pvp_session() {
            Some(session) => self.async_see_result(session).await,
            None => Ok(ActionOutcome::NoOpContinue),
        }
    }

    pub(crate) async fn pvp_ack_rejected(&mut self) -> Step<ActionOutcome> {
        match self.pvp_session() {
            Some(session) => self.acknowledge_match(&session).await,
            None => Ok(ActionOutcome::NoOpContinue),
        }
    }

    /// Game-over prompt: open a matchup against the player just faced.
    pub(crate) async fn matchup_against(&mut self) -> Step<ActionOutcome> {
        let Some(opponent) = self.state.last_opponent.as_ref().map(|o| o.username.clone()) else {
            return Ok(ActionOutcome::NoOpContinue);
        };
        self.open_pvp(opponent).await
    }

    async fn acknowledge_match(&mut self, session: &PlaySession) -> Step<ActionOutcome> {
        let result = self
            .api
            .post("games/acknowledge_match", &json!({ "sessionId": session.id }))
            .await;
        self.check(&result, "acknowledge_match", false)?;
        Ok(ActionOutcome::Continue)
    }

    /// Challenge the prompt's opponent and play the first move.
    pub(crate) async fn issue_challenge(&mut self) -> Step<ActionOutcome> {
        let Some(opponent) = self.state.pvp_opponent.clone() else {
            return Ok(ActionOutcome::NoOpContinue);
        };
        let active = self.state.user.as_ref().is_some_and(|u| {
            u.sessions.iter().any(|s| {
                s.opponent_username.as_deref() == Some(opponent.as_str())
                    && s.status != Some(SessionStatus::Completed)
            })
        });
        if active {
            return Ok(ActionOutcome::NoOpContinue);
        }
        let draw = self.chance();
        let level = ((f64::from(naming::max_level(self.balance())) * draw).round() as u32)
            .min(self.state.max_level);
        debug!("VU {}: Issuing challenge to {} at level {}", self.ordinal, opponent, level);
        let request = MatchRequest::new(SessionType::Challenge, level, Some(&opponent));
        let result = self.api.post("games/request_match", &request).await;
        if let Some(e) = &result.error
            && self.ctx.catalog.classify(e) == AppErrorCode::RankTooLow
        {
            let user = self.state.user.as_ref();
            error!(
                "VU {}: username={} rank={:?} xp={:?} level={}",
                self.ordinal,
                self.username(),
                user.map(|u| u.rank),
                user.map(|u| u.xp),
                level
            );
        }
        self.check(&result, "request_match", false)?;
        self.store_nested_user(&result);
        let requested = result.data_as::<MatchRequested>().unwrap_or_default();
        let Some(session) = self
            .state
            .user
            .as_ref()
            .and_then(|u| u.sessions.iter().find(|s| s.id == requested.session_id))
            .cloned()
        else {
            error!(
                "VU {}: session {} not found after request_match against {}",
                self.ordinal, requested.session_id, opponent
            );
            return halt(ActionOutcome::HandledError);
        };
        let game_id = self.session_game(&session)?;
        debug!(
            "VU {}: Starting challenge with {}, session {}, game {}",
            self.ordinal, opponent, session.id, game_id
        );
        let game = self.load_async_game(&game_id).await?;
        self.state.last_opponent = Some(Opponent {
            username: opponent,
            is_bot: game.is_bot,
        });
        let game = self.begin_round_timer(&game_id, &game).await?;
        let game = self.make_move(&game_id, &game).await?;
        self.unload_game().await;
        self.count(
            metrics::ASYNC_GAME_STARTS,
            &game_tags(Some(&game.game_type), session.level_tag()),
        );
        Ok(ActionOutcome::Continue)
    }

    fn session_game(&self, session: &PlaySession) -> Step<String> {
        match &session.game {
            Some(game) => Ok(game.clone()),
            None => {
                error!("VU {}: session {} has no game", self.ordinal, session.id);
                halt(ActionOutcome::HandledError)
            }
        }
    }

    fn face(&mut self, session: &PlaySession, game: &Game) {
        if let Some(username) = session.opponent_username.clone() {
            self.state.last_opponent = Some(Opponent {
                username,
                is_bot: game.is_bot,
            });
        }
    }

    /// Take a turn in an async game, or acknowledge it if it already ended.
    pub(crate) async fn async_make_move(&mut self, session: PlaySession) -> Step<ActionOutcome> {
        let game_id = self.session_game(&session)?;
        let game = self.load_async_game(&game_id).await?;
        self.face(&session, &game);
        let level = session.level_tag();
        if game.is_complete() {
            let ack = self.game_event(&game_id, "ackResult", None).await;
            self.check(&ack, "ackResult", true)?;
            let result = self
                .api
                .post("games/acknowledge_match", &json!({ "sessionId": session.id }))
                .await;
            self.check(&result, "acknowledge_match", true)?;
            if result.is_ok() {
                self.count(
                    metrics::ASYNC_GAME_COMPLETES,
                    &game_tags(Some(&game.game_type), level),
                );
            }
        } else {
            match self.take_turn(&game_id, &game).await {
                Ok(played) => self.count(
                    metrics::ASYNC_GAME_MOVES,
                    &game_tags(Some(&played.game_type), level),
                ),
                // Left for the next visit
                Err(Halt::Outcome(ActionOutcome::HandledError)) => {}
                Err(halt) => return Err(halt),
            }
        }
        self.unload_game().await;
        if game.is_complete() {
            return Ok(self.run_screen(ScreenId::AsyncGameOver).await?);
        }
        Ok(ActionOutcome::Continue)
    }

    async fn take_turn(&mut self, game_id: &str, game: &Game) -> Step<Game> {
        let game = self.begin_round_timer(game_id, game).await?;
        self.make_move(game_id, &game).await
    }

    /// Acknowledge a finished async game.
    pub(crate) async fn async_see_result(&mut self, session: PlaySession) -> Step<ActionOutcome> {
        let game_id = self.session_game(&session)?;
        let game = self.load_async_game(&game_id).await?;
        self.face(&session, &game);
        let ack = self.game_event(&game_id, "ackResult", None).await;
        if ack.is_ok() {
            self.count(
                metrics::ASYNC_GAME_COMPLETES,
                &game_tags(Some(&game.game_type), session.level_tag()),
            );
        }
        let result = self
            .api
            .post("games/acknowledge_match", &json!({ "sessionId": session.id }))
            .await;
        self.check(&result, "acknowledge_match", true)?;
        self.unload_game().await;
        if game.is_complete() {
            return Ok(self.run_screen(ScreenId::AsyncGameOver).await?);
        }
        Ok(ActionOutcome::Continue)
    }
}
