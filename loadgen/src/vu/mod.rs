//! Virtual users
//!
//! A [`VirtualUser`] is one simulated player: it owns its backend client,
//! its cached view of server state and its RNG, and runs the screen machine
//! as an [`ActionRunner`] over the screen tables.

pub mod model;
pub mod naming;

use std::sync::Arc;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{error, trace, warn};

use crate::client::{
    ApiClient, ClientSettings, ErrorCatalog, IdentityProvider, RequestResult, Transport,
};
use crate::config::Config;
use crate::dispatch::{ActionOutcome, ActionRunner, DispatchError, ForcedSequence};
use crate::lifecycle::{Lifecycle, Pacer};
use crate::metrics::MetricsSink;
use crate::screen::{Act, Condition, PvpMain, ScreenId, TableView};

use model::{
    BASIC_SPIN, FeedItem, LevelDesc, MEGA_SPIN, ProgressTrackers, PublicUser, SessionStatus,
    SpecialEvent, SpecialEventSequence, User,
};

/// Errors that stop the whole run rather than one VU.
#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("VU {ordinal}: {message}")]
    Invariant { ordinal: u32, message: String },
    #[error("Identity provider throttled VU {0}")]
    IdentityThrottled(u32),
}

/// Early exit from a multi-step action.
#[derive(Debug)]
pub(crate) enum Halt {
    /// Stop here and report this outcome to the screen
    Outcome(ActionOutcome),
    Error(SimError),
}

impl From<SimError> for Halt {
    fn from(e: SimError) -> Self {
        Self::Error(e)
    }
}

impl From<DispatchError> for Halt {
    fn from(e: DispatchError) -> Self {
        Self::Error(e.into())
    }
}

pub(crate) type Step<T = ()> = Result<T, Halt>;

pub(crate) fn settle(step: Step<ActionOutcome>) -> Result<ActionOutcome, SimError> {
    match step {
        Ok(outcome) | Err(Halt::Outcome(outcome)) => Ok(outcome),
        Err(Halt::Error(e)) => Err(e),
    }
}

pub(crate) fn halt<T>(outcome: ActionOutcome) -> Step<T> {
    Err(Halt::Outcome(outcome))
}

/// Everything a VU shares with the rest of the run.
#[derive(Clone)]
pub struct SimContext {
    pub config: Arc<Config>,
    pub settings: Arc<ClientSettings>,
    pub catalog: ErrorCatalog,
    pub transport: Arc<dyn Transport>,
    pub identity: Arc<dyn IdentityProvider>,
    pub metrics: Arc<dyn MetricsSink>,
    pub forced: Option<Arc<ForcedSequence>>,
    pub pacer: Pacer,
}

impl SimContext {
    pub fn new(
        config: Arc<Config>,
        transport: Arc<dyn Transport>,
        identity: Arc<dyn IdentityProvider>,
        metrics: Arc<dyn MetricsSink>,
        pacer: Pacer,
    ) -> Result<Self, SimError> {
        let forced = if config.forced_actions.is_empty() {
            None
        } else {
            Some(Arc::new(ForcedSequence::parse(&config.forced_actions)?))
        };
        Ok(Self {
            settings: Arc::new(ClientSettings::from_config(&config)),
            catalog: ErrorCatalog::new(&config.error_codes),
            config,
            transport,
            identity,
            metrics,
            forced,
            pacer,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PowerPlay {
    pub active: bool,
    pub min: u32,
    pub max: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum DetailTab {
    #[default]
    Leaderboard,
    Feed,
}

/// Event shown by the event-details screen
#[derive(Debug, Clone)]
pub(crate) struct EventDetail {
    pub event: SpecialEvent,
    /// Set when the event was found through a hidden access code
    pub access_code: Option<String>,
    pub tab: DetailTab,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FeedKind {
    Winnings,
    AdHoc,
}

impl FeedKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Winnings => "winnings",
            Self::AdHoc => "adHoc",
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct FeedView {
    pub kind: FeedKind,
    pub event_id: Option<String>,
    pub items: Vec<FeedItem>,
}

#[derive(Debug, Clone)]
pub(crate) struct Opponent {
    pub username: String,
    pub is_bot: bool,
}

/// Cached view of server state plus the screen-local data screens share.
#[derive(Debug, Default)]
pub(crate) struct VuState {
    pub user: Option<User>,
    pub levels: Vec<LevelDesc>,
    pub max_level: u32,
    pub current_screen: Option<ScreenId>,
    pub featured_event: Option<String>,
    pub progress: Option<ProgressTrackers>,
    pub events: SpecialEventSequence,
    pub event_detail: Option<EventDetail>,
    pub feed: Option<FeedView>,
    pub challengees: Vec<PublicUser>,
    pub pvp_opponent: Option<String>,
    pub pvp_main: PvpMain,
    pub last_opponent: Option<Opponent>,
    pub power_play: PowerPlay,
    pub excluding_bots: bool,
    /// Received challenge the home screen already routed to matchups
    pub routed_challenge: Option<String>,
}

/// One simulated player for one session iteration.
pub struct VirtualUser {
    pub(crate) ctx: SimContext,
    pub(crate) api: ApiClient,
    pub(crate) lifecycle: Lifecycle,
    pub(crate) rng: StdRng,
    pub(crate) ordinal: u32,
    pub(crate) instance: u32,
    pub(crate) phone: String,
    pub(crate) state: VuState,
}

impl VirtualUser {
    pub fn new(ctx: &SimContext, lifecycle: Lifecycle, seed: u64) -> Result<Self, SimError> {
        let ordinal = lifecycle.ordinal();
        let instance = naming::instance_number(ctx.config.task_index, ctx.config.vus_max, ordinal)
            .ok_or_else(|| SimError::Invariant {
                ordinal,
                message: format!(
                    "instance number overflows for task {} with {} VUs",
                    ctx.config.task_index, ctx.config.vus_max
                ),
            })?;
        let phone = naming::phone_number(instance).ok_or_else(|| SimError::Invariant {
            ordinal,
            message: format!("instance {instance} is outside the load-test phone range"),
        })?;
        let api = ApiClient::new(
            ctx.transport.clone(),
            ctx.identity.clone(),
            ctx.metrics.clone(),
            ctx.pacer.clone(),
            ctx.settings.clone(),
            instance,
        )
        .with_seed(seed.rotate_left(17));
        Ok(Self {
            ctx: ctx.clone(),
            api,
            lifecycle,
            rng: StdRng::seed_from_u64(seed),
            ordinal,
            instance,
            phone,
            state: VuState::default(),
        })
    }

    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    pub fn phone(&self) -> &str {
        &self.phone
    }

    pub fn user(&self) -> Option<&User> {
        self.state.user.as_ref()
    }

    /// Run one session: bootstrap, then the hub until the iteration ends.
    pub async fn run_session(&mut self) -> Result<ActionOutcome, SimError> {
        self.run_screen(ScreenId::Session).await
    }

    pub(crate) fn table_view(&self) -> TableView {
        TableView {
            play_async: self.ctx.config.play_async,
            power_play_active: self.state.power_play.active,
            excluding_bots: self.state.excluding_bots,
            pvp_main: self.state.pvp_main,
            menu_bar_shares: self.ctx.config.menu_bar_shares,
        }
    }

    pub(crate) fn invariant(&self, message: impl Into<String>) -> Halt {
        let message = message.into();
        error!("VU {}: {}", self.ordinal, message);
        Halt::Error(SimError::Invariant {
            ordinal: self.ordinal,
            message,
        })
    }

    /// Uniform draw in [0, 1).
    pub(crate) fn chance(&mut self) -> f64 {
        self.rng.random()
    }

    /// Uniform index below `len`, which must be positive.
    pub(crate) fn pick(&mut self, len: usize) -> usize {
        self.rng.random_range(0..len)
    }

    /// Scaled wait in `[min, max]`; the deadline ends the action.
    pub(crate) async fn pause(&mut self, min: f64, max: f64) -> Step {
        if self.ctx.pacer.delay_range(&mut self.rng, min, max).await {
            Ok(())
        } else {
            halt(ActionOutcome::Finished)
        }
    }

    pub(crate) async fn poll_wait(&mut self) -> Step {
        if self.ctx.pacer.polling(&mut self.rng).await {
            Ok(())
        } else {
            halt(ActionOutcome::Finished)
        }
    }

    pub(crate) fn count(&self, name: &'static str, tags: &[(&'static str, String)]) {
        self.ctx.metrics.counter(name, 1, tags);
    }

    pub(crate) fn trend(&self, name: &'static str, value: f64, tags: &[(&'static str, String)]) {
        self.ctx.metrics.trend(name, value, tags);
    }

    /// Replace the cached user with a full snapshot.
    pub(crate) fn set_user(&mut self, data: &Value) {
        if data.is_null() {
            return;
        }
        match User::deserialize(data) {
            Ok(user) => self.state.user = Some(user),
            Err(_) => warn!("VU {}: ignoring malformed user payload", self.ordinal),
        }
    }

    /// Log a failed request and turn it into the matching early exit.
    ///
    /// With `only_fatal`, non-fatal errors are logged as warnings and the
    /// caller carries on. Successful payloads that are full user snapshots
    /// refresh the cached user.
    pub(crate) fn check(&mut self, result: &RequestResult, tag: &str, only_fatal: bool) -> Step {
        if let Some(e) = &result.error {
            if e.is_fatal() {
                error!("VU {}: Fatal error! {}: {}", self.ordinal, tag, e);
                return halt(ActionOutcome::FatalAbort);
            }
            if only_fatal {
                warn!("VU {}: {}: {}", self.ordinal, tag, e);
                return Ok(());
            }
            error!("VU {}: {}: {}", self.ordinal, tag, e);
            return halt(ActionOutcome::HandledError);
        }
        if let Some(data) = result.data()
            && User::is_user_payload(data)
        {
            let data = data.clone();
            self.set_user(&data);
        }
        Ok(())
    }

    pub(crate) fn balance(&self) -> f64 {
        self.state.user.as_ref().map_or(0.0, |u| u.account)
    }

    pub(crate) fn secondary_balance(&self) -> f64 {
        self.state.user.as_ref().map_or(0.0, |u| u.secondary_account)
    }

    pub(crate) fn has_spin(&self, item_type: &str) -> bool {
        let now = chrono::Utc::now();
        self.state
            .user
            .as_ref()
            .and_then(|u| u.find_item(item_type))
            .is_some_and(|item| item.is_usable(now))
    }

    pub(crate) fn has_mega_spins(&self) -> bool {
        self.has_spin(MEGA_SPIN)
    }

    pub(crate) fn has_basic_spins(&self) -> bool {
        self.has_spin(BASIC_SPIN)
    }

    /// A received challenge the home screen has not yet sent the player to.
    pub(crate) fn unrouted_challenge(&self) -> Option<String> {
        let session = self
            .state
            .user
            .as_ref()?
            .async_session_with_status(SessionStatus::ChallengeReceived, false)?;
        (self.state.routed_challenge.as_deref() != Some(session.id.as_str()))
            .then(|| session.id.clone())
    }

    pub(crate) fn username(&self) -> String {
        self.state
            .user
            .as_ref()
            .map(|u| u.username.clone())
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| naming::username(self.instance))
    }
}

#[async_trait]
impl ActionRunner<Act, Condition> for VirtualUser {
    type Error = SimError;

    fn condition_holds(&self, condition: &Condition) -> bool {
        match *condition {
            Condition::MinBalance(min) => self.balance() >= min,
            Condition::PowerPlayActive => self.state.power_play.active,
            Condition::OpponentIsHuman => self.state.last_opponent.as_ref().is_some_and(|o| !o.is_bot),
        }
    }

    fn draw(&mut self) -> f64 {
        self.chance()
    }

    async fn run_action(&mut self, act: Act) -> Result<ActionOutcome, SimError> {
        trace!("VU {}: {:?}", self.ordinal, act);
        self.perform(act).await
    }
}
