//! Live and arcade games: matchmaking, rounds and moves.

use rand::Rng;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::client::AppErrorCode;
use crate::dispatch::ActionOutcome;
use crate::metrics;
use crate::screen::{Leaderboard, ScreenId};
use crate::vu::model::{Game, LevelDesc, MatchRequested, SessionStatus, SessionType};
use crate::vu::{Halt, Opponent, Step, VirtualUser, halt, naming};

/// Matchmaking spinner, seconds
const SPINNER: (f64, f64) = (12.0, 13.0);
const LOADING: (f64, f64) = (2.0, 3.0);
const GET_READY: (f64, f64) = (4.0, 5.0);
const PLAYER_THINK: (f64, f64) = (1.0, 10.0);
const FINISH_ANIMATION: (f64, f64) = (15.0, 18.0);
const MAX_LEVEL_DRAWS: usize = 100;

/// How a level request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LevelPlay {
    Played,
    /// Matchmaking gave up; not an error
    Cancelled,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MatchRequest<'a> {
    #[serde(rename = "type")]
    pub kind: SessionType,
    pub level: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<&'a str>,
    pub strict_matching: bool,
    pub bots_only: bool,
    pub game_type: Option<&'a str>,
}

impl<'a> MatchRequest<'a> {
    pub fn new(kind: SessionType, level: u32, username: Option<&'a str>) -> Self {
        Self {
            kind,
            level,
            username,
            strict_matching: false,
            bots_only: false,
            game_type: None,
        }
    }
}

pub(crate) fn millis(since: Instant) -> f64 {
    since.elapsed().as_secs_f64() * 1000.0
}

pub(crate) fn game_tags(game: Option<&str>, level: String) -> Vec<(&'static str, String)> {
    vec![("game", game.unwrap_or_default().to_string()), ("level", level)]
}

/// Index into `len` choices from a `[0, 1)` draw, rounding to the nearest
/// slot so the end slots are half as likely.
fn rounded_index(len: usize, draw: f64) -> usize {
    ((len.saturating_sub(1)) as f64 * draw).round() as usize
}

/// Answer for the current round, `None` for a game type this client cannot play.
pub(crate) fn choose_move(game: &Game, rng: &mut impl Rng) -> Option<Value> {
    let state = game.player_state();
    match game.game_type.as_str() {
        "MonkeyBusiness" => {
            let water = state.map_or(0.0, |s| s.water).max(0.0);
            trace!("availableWater={water}");
            Some(json!((water * rng.random::<f64>()).round() as i64))
        }
        "CrystalCaverns" => {
            let buttons = [1, 2, 3];
            Some(json!(buttons[rounded_index(buttons.len(), rng.random())]))
        }
        "MagnetMadness" | "Blasteroids" => {
            let active: Vec<&Value> = state?
                .buttons
                .iter()
                .filter(|b| b.is_active)
                .map(|b| &b.value)
                .collect();
            if active.is_empty() {
                return None;
            }
            Some(active[rounded_index(active.len(), rng.random())].clone())
        }
        _ => None,
    }
}

/// Random live level affordable with `balance`, unlocked at `rank` and no
/// higher than `max_level`; `None` when `draws` attempts found none.
pub(crate) fn draw_live_level(
    levels: &[LevelDesc],
    max_level: u32,
    balance: f64,
    rank: u32,
    draws: usize,
    mut draw: impl FnMut() -> f64,
) -> Option<u32> {
    let top = f64::from(naming::max_level(balance));
    (0..draws).find_map(|_| {
        let level = ((top * draw()).round() as u32).min(max_level);
        levels
            .get(level as usize)
            .filter(|desc| rank >= desc.unlocks_at_rank)
            .map(|_| level)
    })
}

impl VirtualUser {
    /// Home screen: play a random live level, then the game-over prompt.
    pub(crate) async fn play_random_live(&mut self) -> Step<ActionOutcome> {
        info!("VU {}: Play random level...", self.ordinal);
        self.ensure_user()?;
        let (balance, rank) = self
            .state
            .user
            .as_ref()
            .map_or((0.0, 0), |u| (u.account, u.rank));
        let level = draw_live_level(
            &self.state.levels,
            self.state.max_level,
            balance,
            rank,
            MAX_LEVEL_DRAWS,
            || self.rng.random(),
        );
        let Some(level) = level else {
            warn!("VU {}: no playable level for rank {}", self.ordinal, rank);
            return Ok(ActionOutcome::NoOpContinue);
        };
        if self.play_to_end(SessionType::Live, level).await? == LevelPlay::Cancelled {
            return Ok(ActionOutcome::Continue);
        }
        self.unload_game().await;
        self.leaderboard(Leaderboard::SurgeScore, None).await;
        Ok(self.run_screen(ScreenId::HomeGameOver).await?)
    }

    /// Goals screen: an arcade game at a level the server picks.
    pub(crate) async fn practice(&mut self) -> Step<ActionOutcome> {
        if self.play_to_end(SessionType::Arcade, 0).await? == LevelPlay::Cancelled {
            return Ok(ActionOutcome::Continue);
        }
        self.unload_game().await;
        Ok(self.run_screen(ScreenId::ArcadeGameOver).await?)
    }

    /// A game that fails part way leaves the VU in an unknown state, so any
    /// error ends it.
    async fn play_to_end(&mut self, kind: SessionType, level: u32) -> Step<LevelPlay> {
        match self.play_level(kind, level).await {
            Err(Halt::Outcome(ActionOutcome::HandledError)) => halt(ActionOutcome::FatalAbort),
            other => other,
        }
    }

    pub(crate) async fn play_level(&mut self, kind: SessionType, level: u32) -> Step<LevelPlay> {
        info!("VU {}: Play level {}...", self.ordinal, level);
        self.ensure_user()?;
        let matchmaking_start = Instant::now();
        if !self.request_level(kind, level).await? {
            return Ok(LevelPlay::Cancelled);
        }
        let live = self
            .state
            .user
            .as_ref()
            .and_then(|u| u.live_session())
            .filter(|s| s.status == Some(SessionStatus::Playing))
            .and_then(|s| {
                let level = s.matched_level.map(|l| l.to_string()).unwrap_or_default();
                Some((s.game.clone()?, game_tags(s.game_type.as_deref(), level)))
            });
        let Some((game_id, tags)) = live else {
            error!("VU {}: No live session found after matchmaking", self.ordinal);
            return halt(ActionOutcome::HandledError);
        };
        self.count(metrics::LIVE_GAMES, &tags);

        let mut game = self.load_live_game(&game_id).await?;
        self.pause(GET_READY.0, GET_READY.1).await?;
        self.trend(metrics::MATCHING_DELAY, millis(matchmaking_start), &tags);
        self.trend(metrics::BOTS_PERCENT, if game.is_bot { 1.0 } else { 0.0 }, &tags);

        let game_start = Instant::now();
        let mut round = 1;
        let mut won = game.win_status().is_some();
        while !won {
            let round_start = Instant::now();
            game = self.begin_round_timer(&game_id, &game).await?;
            game = self.make_move(&game_id, &game).await?;
            let mut advanced = false;
            while !advanced && !won {
                self.poll_wait().await?;
                let result = self.api.get(&format!("games/{game_id}")).await;
                self.check(&result, "games", false)?;
                if let Some(polled) = result.data_as::<Game>()
                    && let Some(data) = &polled.data
                {
                    advanced = data.game_status.round_number != Some(round);
                    won = polled.win_status().is_some();
                    game = polled;
                }
            }
            self.trend(metrics::ROUND_DELAY, millis(round_start), &tags);
            round += 1;
        }
        self.pause(FINISH_ANIMATION.0, FINISH_ANIMATION.1).await?;
        let ack = self.game_event(&game_id, "ackResult", None).await;
        self.trend(metrics::LIVE_GAME_DURATION, millis(game_start), &tags);
        debug!("VU {}: game {} over: {:?}", self.ordinal, game_id, game.win_status());
        self.check(&ack, "ackResult", false)?;
        Ok(LevelPlay::Played)
    }

    /// Request a match and wait until it is playing. `false` when the
    /// request failed or was cancelled after the matchmaking timeout.
    async fn request_level(&mut self, kind: SessionType, level: u32) -> Step<bool> {
        let request = MatchRequest::new(kind, level, None);
        let result = self.api.post("games/request_match", &request).await;
        if let Some(e) = &result.error {
            if e.is_fatal() {
                error!("VU {}: Fatal error! games/request_match: {}", self.ordinal, e);
                return halt(ActionOutcome::FatalAbort);
            }
            error!("VU {}: games/request_match: {}", self.ordinal, e);
            if self.ctx.catalog.classify(e) == AppErrorCode::RankTooLow {
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
            return Ok(false);
        }
        let requested = result.data_as::<MatchRequested>().unwrap_or_default();
        if let Some(user) = &requested.user {
            self.set_user(user);
        }
        let live_id = self
            .state
            .user
            .as_ref()
            .and_then(|u| u.live_session())
            .map(|s| s.id.clone());
        if live_id.as_deref() != Some(requested.session_id.as_str()) {
            return Err(self.invariant(format!(
                "live session {:?} does not match requested session {}",
                live_id, requested.session_id
            )));
        }

        let start = Instant::now();
        let mut polls = 0;
        loop {
            let status = self
                .state
                .user
                .as_ref()
                .and_then(|u| u.live_session())
                .and_then(|s| s.status);
            match status {
                Some(SessionStatus::Playing) => break,
                Some(_) => {}
                None => {
                    return Err(self.invariant(format!(
                        "live session has no status after {polls} polls"
                    )));
                }
            }
            if start.elapsed() > self.ctx.config.matchmaking_timeout {
                error!(
                    "VU {}: No match after {:.0}s, cancelling! status={:?}",
                    self.ordinal,
                    start.elapsed().as_secs_f64(),
                    status
                );
                let cancel = self
                    .api
                    .post("games/cancel_request_level", &json!({}))
                    .await;
                if self.ctx.catalog.classify_result(&cancel) != Some(AppErrorCode::UserAlreadyMatched) {
                    self.poll_wait().await?;
                    self.get_user().await;
                    self.count(metrics::LIVE_GAME_CANCEL_REQUESTS, &[]);
                    return Ok(false);
                }
                warn!("VU {}: {}", self.ordinal, cancel.message());
            }
            self.poll_wait().await?;
            self.get_user().await;
            polls += 1;
        }

        let opponent = self
            .state
            .user
            .as_ref()
            .and_then(|u| u.live_session())
            .and_then(|s| s.opponent_username.clone());
        if let Some(username) = opponent {
            let found = self.find_user(&username).await;
            if let Some(e) = &found.error {
                error!("VU {}: requestLevel({:?}, {}) finding opponent: {}", self.ordinal, kind, level, e);
                return Ok(false);
            }
            self.state.last_opponent = Some(Opponent {
                username,
                is_bot: false,
            });
        }
        self.pause(SPINNER.0, SPINNER.1).await?;
        Ok(true)
    }

    /// Tell the server a live game finished loading and wait for its state.
    async fn load_live_game(&mut self, game_id: &str) -> Step<Game> {
        self.pause(LOADING.0, LOADING.1).await?;
        let mut result = self.game_event(game_id, "finishedLoading", None).await;
        self.check(&result, "finishedLoading", false)?;
        let mut polls = 0;
        let game = loop {
            if let Some(game) = result.data_as::<Game>().filter(|g| g.data.is_some()) {
                break game;
            }
            if polls > 0 {
                self.poll_wait().await?;
            }
            polls += 1;
            result = self.api.get(&format!("games/{game_id}")).await;
            self.check(&result, "games", false)?;
        };
        if let Some(opponent) = self.state.last_opponent.as_mut() {
            opponent.is_bot = game.is_bot;
        }
        Ok(game)
    }

    /// Async games need only the loading event.
    pub(crate) async fn load_async_game(&mut self, game_id: &str) -> Step<Game> {
        self.pause(LOADING.0, LOADING.1).await?;
        let result = self.game_event(game_id, "finishedLoading", None).await;
        self.check(&result, "finishedLoading", false)?;
        Ok(result.data_as::<Game>().unwrap_or_default())
    }

    /// Start the round clock, retrying until the server returns game data.
    pub(crate) async fn begin_round_timer(&mut self, game_id: &str, game: &Game) -> Step<Game> {
        let Some(round) = game.round_number() else {
            error!("VU {}: game {} has no current round", self.ordinal, game_id);
            return halt(ActionOutcome::HandledError);
        };
        let mut first = true;
        loop {
            if !first {
                self.poll_wait().await?;
            }
            first = false;
            let result = self
                .game_event(game_id, "beginRoundTimer", Some(json!({ "round": round })))
                .await;
            self.check(&result, "beginRoundTimer", false)?;
            if let Some(game) = result.data_as::<Game>().filter(|g| g.data.is_some()) {
                return Ok(game);
            }
        }
    }

    /// Think, then answer the current round.
    pub(crate) async fn make_move(&mut self, game_id: &str, game: &Game) -> Step<Game> {
        self.pause(PLAYER_THINK.0, PLAYER_THINK.1).await?;
        let Some(round) = game.round_number() else {
            error!("VU {}: game {} has no current round", self.ordinal, game_id);
            return halt(ActionOutcome::HandledError);
        };
        let Some(data) = choose_move(game, &mut self.rng) else {
            error!(
                "VU {}: no move for game type {:?} in game {}",
                self.ordinal, game.game_type, game_id
            );
            return halt(ActionOutcome::HandledError);
        };
        debug!("VU {}: move {}", self.ordinal, data);
        let result = self
            .api
            .post(
                &format!("games/{game_id}/answer"),
                &json!({ "answer": { "round": round, "data": data } }),
            )
            .await;
        self.check(&result, "submitting game answer", false)?;
        Ok(result.data_as::<Game>().unwrap_or_else(|| game.clone()))
    }
}
