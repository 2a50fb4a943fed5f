//! Loading screen: authenticate, start the session and top up the account.

use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::client::{ApiError, AppErrorCode, IdentityError, RequestResult};
use crate::dispatch::ActionOutcome;
use crate::metrics;
use crate::vu::model::{BASIC_SPIN, LevelDesc, MEGA_SPIN, User};
use crate::vu::{SimError, Step, VirtualUser, naming};

/// Rank that skips the tutorial goals
const TUTORIAL_RANK: u32 = 20;
const TUTORIAL_XP: u32 = 1734;
const UNLOCKED_GAMES: [&str; 3] = ["CrystalCaveGame", "ShootingGalleryGame", "AsteroidGame"];
const MIN_BALANCE: f64 = 500.0;
const MIN_SECONDARY_BALANCE: f64 = 100.0;
/// Item quantities in hundredths
const SPIN_TOP_UPS: [(&str, u32); 2] = [(MEGA_SPIN, 500), (BASIC_SPIN, 1000)];

const THROTTLE_BACKOFF: f64 = 600.0;
const SERVER_BACKOFF: f64 = 60.0;

/// Why the session could not start
#[derive(Debug, Error)]
enum StartFailure {
    #[error("Identity provider throttled the request")]
    Throttled,
    #[error("{0}")]
    Request(ApiError),
}

impl From<IdentityError> for StartFailure {
    fn from(e: IdentityError) -> Self {
        match e {
            IdentityError::Throttled => Self::Throttled,
            other => Self::Request(other.to_api_error()),
        }
    }
}

fn failed(result: RequestResult) -> Result<RequestResult, StartFailure> {
    match result.error {
        Some(e) => Err(StartFailure::Request(e)),
        None => Ok(result),
    }
}

impl VirtualUser {
    /// Bring the VU from nothing to a playable account with game config loaded.
    pub(crate) async fn bootstrap(&mut self) -> Step<ActionOutcome> {
        if let Err(failure) = self.start_session().await {
            error!("VU {}: Error at start of session: {}", self.ordinal, failure);
            return match failure {
                StartFailure::Throttled => {
                    self.count(metrics::IDENTITY_THROTTLES, &[]);
                    if self.ctx.config.auth.abort_on_throttle {
                        return Err(SimError::IdentityThrottled(self.ordinal).into());
                    }
                    self.ctx.pacer.backoff(&mut self.rng, self.ordinal, THROTTLE_BACKOFF).await;
                    Ok(ActionOutcome::FatalAbort)
                }
                StartFailure::Request(e) if e.status.is_none_or(|s| s >= 500) => {
                    // Backend is struggling; try again from a fresh iteration
                    self.ctx.pacer.backoff(&mut self.rng, self.ordinal, SERVER_BACKOFF).await;
                    Ok(ActionOutcome::Suspend)
                }
                StartFailure::Request(_) => {
                    warn!("VU {}: non-retryable error, stopping", self.ordinal);
                    self.lifecycle.terminate().await;
                    Ok(ActionOutcome::Finished)
                }
            };
        }
        if self.state.user.is_none() {
            error!("VU {}: No user at start of session! Stopping", self.ordinal);
            self.lifecycle.terminate().await;
            return Ok(ActionOutcome::Finished);
        }
        info!("VU {}: session started as {}", self.ordinal, self.username());

        let towers = self.api.get("config/towerdata").await;
        if let Some(stages) = towers.data_as::<Vec<Vec<LevelDesc>>>() {
            self.load_levels(stages);
        }
        self.api.get("config/appData").await;
        self.get_user().await;
        self.api.get("config/charitydata").await;
        Ok(ActionOutcome::Continue)
    }

    fn load_levels(&mut self, stages: Vec<Vec<LevelDesc>>) {
        self.state.levels = stages.into_iter().flatten().collect();
        self.state.max_level = self
            .state
            .levels
            .iter()
            .filter(|l| l.available)
            .map(|l| l.level)
            .max()
            .unwrap_or(0);
        debug!(
            "VU {}: {} levels, highest available {}",
            self.ordinal,
            self.state.levels.len(),
            self.state.max_level
        );
    }

    async fn start_session(&mut self) -> Result<(), StartFailure> {
        failed(
            self.api
                .post("startup", &json!({ "foregrounded": false, "installed": false }))
                .await,
        )?;
        let username = naming::username(self.instance);
        self.api.auth(&username).await?;
        self.state.user = None;

        let mut session = self.api.post("users/session_start", &json!({})).await;
        if self.ctx.catalog.classify_result(&session) == Some(AppErrorCode::UserNotFound) {
            debug!("VU {}: registering {}", self.ordinal, username);
            session = failed(self.api.post("users/register", &json!({})).await)?;
        }
        let activated = session
            .data_as::<User>()
            .is_some_and(|u| u.is_activated());
        if !activated {
            session = failed(
                self.api
                    .post("users/activate", &json!({ "username": username }))
                    .await,
            )?;
        }
        if let Some(data) = session.data().cloned() {
            self.set_user(&data);
        }
        let Some(user) = self.state.user.clone() else {
            return Ok(());
        };

        let mut top_ups: Vec<(&str, Value)> = Vec::new();
        if user.rank < TUTORIAL_RANK {
            top_ups.push(("users/set_xp", json!({ "xp": TUTORIAL_XP })));
        }
        for game in UNLOCKED_GAMES {
            if !user.is_unlocked(game) {
                top_ups.push(("users/unlock_game", json!({ "game": game })));
            }
        }
        if user.account < MIN_BALANCE {
            top_ups.push(("users/set_balance", json!({ "amount": MIN_BALANCE })));
        }
        if user.secondary_account < MIN_SECONDARY_BALANCE {
            top_ups.push((
                "users/set_secondary_balance",
                json!({ "amount": MIN_SECONDARY_BALANCE }),
            ));
        }
        for (item, quantity) in SPIN_TOP_UPS {
            if user.find_item(item).is_none() {
                top_ups.push(("users/add_item", json!({ "item": item, "quantity": quantity })));
            }
        }

        for (path, body) in top_ups {
            let result = failed(self.api.post(path, &body).await)?;
            if let Some(data) = result.data()
                && User::is_user_payload(data)
            {
                let data = data.clone();
                self.set_user(&data);
            }
        }
        Ok(())
    }
}
