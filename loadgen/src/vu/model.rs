//! Backend payload shapes the simulation reads.
//!
//! Only the fields the VUs react to are modelled. Everything defaults so a
//! partial payload still deserializes.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const MEGA_SPIN: &str = "megaSpin";
pub const BASIC_SPIN: &str = "basicSpin";
/// Item quantities are fixed point with two decimals.
pub const ONE_ITEM: f64 = 100.0;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct User {
    pub username: String,
    pub phone: String,
    pub account: f64,
    pub secondary_account: f64,
    pub rank: u32,
    pub xp: f64,
    pub profile: Option<Profile>,
    pub inventory: Vec<Item>,
    pub sessions: Vec<PlaySession>,
    pub invite_data: Option<InviteData>,
    #[serde(rename = "available_games")]
    pub available_games: HashMap<String, AvailableGame>,
}

impl User {
    /// Payloads carrying both balances are full user snapshots.
    pub fn is_user_payload(value: &Value) -> bool {
        value.get("account").is_some() && value.get("secondaryAccount").is_some()
    }

    pub fn find_item(&self, item_type: &str) -> Option<&Item> {
        self.inventory.iter().find(|i| i.item_type == item_type)
    }

    pub fn is_unlocked(&self, game: &str) -> bool {
        self.available_games.get(game).is_some_and(|g| g.is_unlocked)
    }

    pub fn live_session(&self) -> Option<&PlaySession> {
        self.sessions.iter().find(|s| s.is_live)
    }

    pub fn async_session_against(&self, opponent: &str) -> Option<&PlaySession> {
        self.sessions
            .iter()
            .find(|s| !s.is_live && s.opponent_username.as_deref() == Some(opponent))
    }

    pub fn async_session_with_status(
        &self,
        status: SessionStatus,
        only_requires_action: bool,
    ) -> Option<&PlaySession> {
        self.sessions.iter().find(|s| {
            !s.is_live && s.status == Some(status) && (!only_requires_action || s.requires_action)
        })
    }

    pub fn async_session_for_event(&self, event_id: &str) -> Option<&PlaySession> {
        self.sessions.iter().find(|s| {
            !s.is_live
                && s
                    .special_event_data
                    .as_ref()
                    .is_some_and(|e| e.id == event_id)
        })
    }

    pub fn is_activated(&self) -> bool {
        self.invite_data
            .as_ref()
            .and_then(|d| d.status.as_deref())
            .is_some_and(|s| s == "playing")
    }

    pub fn is_invited(&self) -> bool {
        self.invite_data.as_ref().is_some_and(|d| d.invited)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Profile {
    pub use_default_matchmaking_level: bool,
    pub lowest_matchmaking_level: Option<f64>,
    pub default_matchmaking_level: Option<f64>,
    pub exclude_bots: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Item {
    pub item_type: String,
    pub quantity: f64,
    pub consumable: Option<Consumable>,
}

impl Item {
    /// At least one whole item whose cooldown has passed.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.quantity >= ONE_ITEM
            && self
                .consumable
                .as_ref()
                .and_then(|c| c.next_use_ts)
                .is_none_or(|ts| ts <= now)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Consumable {
    pub next_use_ts: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InviteData {
    pub status: Option<String>,
    pub invited: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AvailableGame {
    pub is_unlocked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    Requested,
    Matched,
    Playing,
    Completed,
    ChallengeSent,
    ChallengeReceived,
    ChallengeRejected,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionType {
    Live,
    Arcade,
    Challenge,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PlaySession {
    pub id: String,
    pub is_live: bool,
    pub status: Option<SessionStatus>,
    pub game: Option<String>,
    pub game_type: Option<String>,
    pub opponent_username: Option<String>,
    pub requires_action: bool,
    pub matched_level: Option<u32>,
    pub requested_level: Option<u32>,
    pub matched_level_value: f64,
    pub special_event_data: Option<EventRef>,
}

impl PlaySession {
    pub fn level_tag(&self) -> String {
        self.requested_level
            .or(self.matched_level)
            .map(|l| l.to_string())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EventRef {
    pub id: String,
}

/// `games/request_match` payload
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MatchRequested {
    pub user: Option<Value>,
    pub session_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventUserStatus {
    Won,
    RunnerUp,
    Playing,
    Active,
    Eliminated,
    Uninvolved,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Currency {
    Primary,
    Secondary,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SpecialEvent {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub user_status: Option<EventUserStatus>,
    pub close: Option<DateTime<Utc>>,
    pub join_cost: f64,
    pub join_currency: Option<Currency>,
    pub has_invite_code: bool,
    pub is_hidden: bool,
    pub user_next_rejoin_cost: f64,
    pub user_rejoin_currency: Option<Currency>,
}

impl SpecialEvent {
    /// Entry window still open. Events without a close time never close.
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.close.is_none_or(|close| now < close)
    }

    pub fn is_surge(&self) -> bool {
        self.event_type == "surge"
    }
}

/// `special_events` payload: past, running and upcoming events
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SpecialEventSequence {
    pub last: Vec<SpecialEvent>,
    pub current: Vec<SpecialEvent>,
    pub next: Vec<SpecialEvent>,
}

impl SpecialEventSequence {
    pub fn find(&self, id: &str) -> Option<&SpecialEvent> {
        self.last
            .iter()
            .chain(&self.current)
            .chain(&self.next)
            .find(|e| e.id == id)
    }

    /// Replace the stored copy of `event`, searching past, current, then next.
    pub fn replace(&mut self, event: &SpecialEvent) {
        for list in [&mut self.last, &mut self.current, &mut self.next] {
            if let Some(slot) = list.iter_mut().find(|e| e.id == event.id) {
                *slot = event.clone();
                return;
            }
        }
    }

    pub fn hidden_joined(&self) -> usize {
        self.current.iter().filter(|e| e.is_hidden).count()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Game {
    pub id: String,
    #[serde(rename = "type")]
    pub game_type: String,
    pub is_bot: bool,
    pub status: Option<String>,
    pub data: Option<GameData>,
}

impl Game {
    pub fn is_complete(&self) -> bool {
        self.status.as_deref() == Some("gameComplete")
    }

    pub fn round_number(&self) -> Option<u32> {
        self.data
            .as_ref()
            .and_then(|d| d.current_round_data.as_ref())
            .and_then(|r| r.round_number)
    }

    pub fn win_status(&self) -> Option<&Value> {
        self.data
            .as_ref()
            .and_then(|d| d.game_status.win_status.as_ref())
            .filter(|w| is_truthy(w))
    }

    pub fn player_state(&self) -> Option<&PlayerState> {
        self.data
            .as_ref()
            .and_then(|d| d.player.as_ref())
            .and_then(|p| p.current_round_data.as_ref())
            .map(|r| &r.player_state)
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GameData {
    pub current_round_data: Option<RoundData>,
    pub game_status: GameStatus,
    pub player: Option<PlayerData>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RoundData {
    pub round_number: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GameStatus {
    pub round_number: Option<u32>,
    pub win_status: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PlayerData {
    pub current_round_data: Option<PlayerRound>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PlayerRound {
    pub player_state: PlayerState,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PlayerState {
    pub water: f64,
    pub buttons: Vec<GameButton>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GameButton {
    pub is_active: bool,
    pub value: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProgressTrackers {
    pub goals: Vec<ProgressTracker>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProgressTracker {
    pub id: i64,
    pub state: Option<String>,
}

impl ProgressTrackers {
    pub fn claimable(&self) -> Option<i64> {
        self.goals
            .iter()
            .find(|t| t.id > 0 && t.state.as_deref() == Some("complete"))
            .map(|t| t.id)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PublicUser {
    pub username: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PublicUsers {
    pub users: Vec<PublicUser>,
}

/// One level of the tower, flattened from `config/towerdata`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LevelDesc {
    pub level: u32,
    pub amount: f64,
    pub available: bool,
    pub unlocks_at_rank: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FeedItem {
    pub game_id: Option<String>,
}

/// `users/cashout_start` payload
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CashoutStart {
    pub is_allowed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_user_from_partial_payload() {
        let user: User = serde_json::from_value(json!({
            "username": "load_00007",
            "account": 250.5,
            "secondaryAccount": 40,
            "rank": 21,
            "inventory": [{ "itemType": "megaSpin", "quantity": 500 }],
            "sessions": [
                { "id": "s1", "isLive": true, "status": "playing", "game": "g1" },
                { "id": "s2", "status": "challengeReceived", "opponentUsername": "load_00003" }
            ],
            "available_games": { "AsteroidGame": { "isUnlocked": true } },
            "inviteData": { "status": "playing" }
        }))
        .unwrap();
        assert_eq!(user.live_session().unwrap().id, "s1");
        assert_eq!(
            user.async_session_against("load_00003").unwrap().status,
            Some(SessionStatus::ChallengeReceived)
        );
        assert!(user.is_unlocked("AsteroidGame"));
        assert!(!user.is_unlocked("CrystalCaveGame"));
        assert!(user.is_activated());
        assert!(user.find_item(MEGA_SPIN).is_some());
    }

    #[test]
    fn test_unknown_status_is_tolerated() {
        let session: PlaySession =
            serde_json::from_value(json!({ "id": "x", "status": "somethingNew" })).unwrap();
        assert_eq!(session.status, Some(SessionStatus::Other));
    }

    #[test]
    fn test_item_cooldown() {
        let now = Utc::now();
        let item: Item = serde_json::from_value(json!({
            "itemType": "basicSpin",
            "quantity": 100,
            "consumable": { "nextUseTs": (now + chrono::Duration::hours(1)).to_rfc3339() }
        }))
        .unwrap();
        assert!(!item.is_usable(now));
        assert!(item.is_usable(now + chrono::Duration::hours(2)));
    }

    #[test]
    fn test_event_sequence_replace() {
        let mut seq: SpecialEventSequence = serde_json::from_value(json!({
            "current": [{ "id": "e1", "name": "Cup", "type": "adHoc", "isHidden": true }],
            "next": [{ "id": "e2" }]
        }))
        .unwrap();
        assert_eq!(seq.hidden_joined(), 1);
        let mut updated = seq.find("e2").unwrap().clone();
        updated.name = "Renamed".into();
        seq.replace(&updated);
        assert_eq!(seq.next[0].name, "Renamed");
    }

    #[test]
    fn test_win_status_truthiness() {
        let mut game: Game = serde_json::from_value(json!({
            "id": "g", "data": { "gameStatus": { "roundNumber": 2, "winStatus": "" } }
        }))
        .unwrap();
        assert!(game.win_status().is_none());
        game.data.as_mut().unwrap().game_status.win_status = Some(json!("won"));
        assert!(game.win_status().is_some());
    }
}
