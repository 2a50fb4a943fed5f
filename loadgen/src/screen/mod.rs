//! Screen state machine
//!
//! Screens are data: each [`ScreenId`] maps to a [`ScreenSpec`] and an action
//! table ([`table::screen_actions`]). One generic executor
//! ([`crate::vu::VirtualUser::run_screen`]) runs every screen's loop.

mod executor;
pub mod table;

pub use table::{build_dispatcher, screen_actions, validate};

use crate::metrics;

/// States of the client-behavior state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScreenId {
    /// Authentication and account bootstrap
    Loading,
    /// Top-level hub over the tab screens
    Session,
    Home,
    PowerPlaySettings,
    Settings,
    WalletDetails,
    Activity,
    Goals,
    Events,
    EventDetails,
    Social,
    Pvp,
    FeedTab,
    HomeGameOver,
    ArcadeGameOver,
    AsyncGameOver,
}

/// How a screen's loop behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreenKind {
    Bootstrap,
    /// Loops over child screens and services `JumpToScreen`
    Hub,
    /// Loops until an action leaves the screen
    Tab,
    /// A tab inside another screen; leaving returns control to the parent
    Nested,
    /// Nested screen that runs exactly one action
    NestedSingle,
    /// One action, no think time, no ramp checkpoint
    Prompt,
}

impl ScreenKind {
    /// Whether the parent becomes the active screen again on return.
    pub fn restores_parent(self) -> bool {
        matches!(self, Self::Nested | Self::NestedSingle | Self::Prompt)
    }
}

/// Static description of a screen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScreenSpec {
    pub dispatcher: &'static str,
    pub kind: ScreenKind,
    pub metric: Option<&'static str>,
    pub requires_user: bool,
    pub requires_async: bool,
}

impl ScreenSpec {
    const fn new(dispatcher: &'static str, kind: ScreenKind) -> Self {
        Self {
            dispatcher,
            kind,
            metric: None,
            requires_user: false,
            requires_async: false,
        }
    }

    const fn metric(mut self, metric: &'static str) -> Self {
        self.metric = Some(metric);
        self
    }

    const fn needs_user(mut self) -> Self {
        self.requires_user = true;
        self
    }

    const fn needs_async(mut self) -> Self {
        self.requires_async = true;
        self
    }
}

impl ScreenId {
    pub const ALL: [ScreenId; 16] = [
        Self::Loading,
        Self::Session,
        Self::Home,
        Self::PowerPlaySettings,
        Self::Settings,
        Self::WalletDetails,
        Self::Activity,
        Self::Goals,
        Self::Events,
        Self::EventDetails,
        Self::Social,
        Self::Pvp,
        Self::FeedTab,
        Self::HomeGameOver,
        Self::ArcadeGameOver,
        Self::AsyncGameOver,
    ];

    pub fn spec(self) -> ScreenSpec {
        use ScreenKind::*;
        match self {
            Self::Loading => ScreenSpec::new("loadingScreen", Bootstrap),
            Self::Session => ScreenSpec::new("session", Hub),
            Self::Home => ScreenSpec::new("homeScreen", Tab).metric(metrics::HOME_SCREEN),
            Self::PowerPlaySettings => ScreenSpec::new("powerPlaySettingsScreen", Nested)
                .metric(metrics::POWERPLAY_SETTINGS_SCREEN)
                .needs_user(),
            Self::Settings => ScreenSpec::new("settingsScreen", NestedSingle)
                .metric(metrics::SETTINGS_SCREEN)
                .needs_user(),
            Self::WalletDetails => ScreenSpec::new("walletDetailsScreen", NestedSingle).needs_user(),
            Self::Activity => ScreenSpec::new("activityScreen", Tab).metric(metrics::ACTIVITY_SCREEN),
            Self::Goals => ScreenSpec::new("goalsScreen", Tab).metric(metrics::ARCADE_SCREEN),
            Self::Events => ScreenSpec::new("eventsScreen", Tab)
                .metric(metrics::EVENTS_SCREEN)
                .needs_async(),
            Self::EventDetails => ScreenSpec::new("eventDetailsScreen", Nested)
                .metric(metrics::EVENT_DETAILS_SCREEN)
                .needs_async(),
            Self::Social => ScreenSpec::new("socialScreen", Tab)
                .metric(metrics::MATCHUPS_SCREEN)
                .needs_async(),
            Self::Pvp => ScreenSpec::new("pvpScreen", Prompt)
                .metric(metrics::PVP_SCREEN)
                .needs_user()
                .needs_async(),
            Self::FeedTab => ScreenSpec::new("feedTab", Nested),
            Self::HomeGameOver => ScreenSpec::new("homeGameOver", Prompt),
            Self::ArcadeGameOver => ScreenSpec::new("arcadeGameOver", Prompt),
            Self::AsyncGameOver => ScreenSpec::new("asyncGameOver", Prompt),
        }
    }

    pub fn name(self) -> &'static str {
        self.spec().dispatcher
    }
}

/// Leaderboards reachable from the activity and event screens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leaderboard {
    WinningsToday,
    WinningsYesterday,
    WinningsThisWeek,
    WinningsLastWeek,
    HighestBalance,
    CurrentBalance,
    MostDonated,
    SurgeScore,
    AdHocScore,
}

impl Leaderboard {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WinningsToday => "winningsToday",
            Self::WinningsYesterday => "winningsYesterday",
            Self::WinningsThisWeek => "winningsThisWeek",
            Self::WinningsLastWeek => "winningsLastWeek",
            Self::HighestBalance => "highestBalance",
            Self::CurrentBalance => "currentBalance",
            Self::MostDonated => "mostDonated",
            Self::SurgeScore => "surgeScore",
            Self::AdHocScore => "adHocScore",
        }
    }
}

/// Main action offered by the player-versus-player prompt, chosen from the
/// state of the match against the opponent when the prompt opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PvpMain {
    /// A challenge awaits an answer
    Respond,
    Move,
    AckRejected,
    SeeResult,
    /// No match yet
    Challenge,
    #[default]
    Nothing,
}

/// Action kinds. The VU interprets each one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Act {
    /// Run another screen's loop to its exit
    Open(ScreenId),
    Exit,
    Back,
    /// Dismiss a prompt and stay on the parent screen
    Stay,
    NewTab,
    PlayRandomLive,
    PlayArcade,
    TogglePowerPlay,
    SetMinimumLevel,
    SetMaximumLevel,
    ToggleIncludeBots,
    CashOut,
    SetInviter,
    RecentGames,
    Spin,
    WinningsFeed,
    Leaderboard(Leaderboard),
    ClaimGoal,
    EventsIdle,
    SelectEvent,
    SelectHiddenEvent,
    EventLeaderboard,
    EventFeed,
    EventDetailsIdle,
    EventAction,
    SearchForUser,
    SocialIdle,
    MatchupAction,
    Accept,
    Decline,
    Move,
    AckRejected,
    SeeResult,
    StartChallenge,
    FeedIdle,
    WatchReplay,
    MatchupAgainst,
}

/// Guards evaluated against the VU's state at draw time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Condition {
    /// Balance at least this much
    MinBalance(f64),
    PowerPlayActive,
    /// Last opponent was a person, not a bot
    OpponentIsHuman,
}

/// Inputs that shape an action table when its screen opens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TableView {
    pub play_async: bool,
    pub power_play_active: bool,
    pub excluding_bots: bool,
    pub pvp_main: PvpMain,
    pub menu_bar_shares: [f64; 3],
}

impl Default for TableView {
    fn default() -> Self {
        Self {
            play_async: false,
            power_play_active: false,
            excluding_bots: false,
            pvp_main: PvpMain::Nothing,
            menu_bar_shares: table::MENU_BAR_SHARES,
        }
    }
}
