//! Declarative action tables for every screen.

use std::sync::Arc;

use crate::config::Config;
use crate::dispatch::{ActionDef, DispatchError, Dispatcher, ForcedSequence};

use super::{Act, Condition, Leaderboard, PvpMain, ScreenId, ScreenKind, TableView};

type Def = ActionDef<Act, Condition>;

pub const MENU_BAR_SHARES: [f64; 3] = [0.833_333_333_333_34, 0.1, 0.066_666_666_666_667];
pub const MENU_BAR_WEIGHT: f64 = 30.0;
const ACTIVITY_MENU_BAR_WEIGHT: f64 = 46.0;
const CASH_OUT_MIN_BALANCE: f64 = 1000.0;

const ACTIVITY_LEADERBOARDS: [(&str, Leaderboard); 8] = [
    ("winningsToday", Leaderboard::WinningsToday),
    ("winningsYesterday", Leaderboard::WinningsYesterday),
    ("winningsThisWeek", Leaderboard::WinningsThisWeek),
    ("winningsLastWeek", Leaderboard::WinningsLastWeek),
    ("highestBalance", Leaderboard::HighestBalance),
    ("currentBalance", Leaderboard::CurrentBalance),
    ("mostDonated", Leaderboard::MostDonated),
    ("surge", Leaderboard::SurgeScore),
];

fn menu_bar(total: f64, shares: [f64; 3]) -> [Def; 3] {
    [
        Def::new("newTab", total * shares[0], Act::NewTab),
        Def::new("settings", total * shares[1], Act::Open(ScreenId::Settings)),
        Def::new("walletDetails", total * shares[2], Act::Open(ScreenId::WalletDetails)),
    ]
}

fn game_over() -> Vec<Def> {
    vec![
        Def::new("matchupAgainst", 10.0, Act::MatchupAgainst).when(Condition::OpponentIsHuman),
        Def::new("back", 90.0, Act::Stay),
    ]
}

/// Action table of `screen` as shaped by `view`.
pub fn screen_actions(screen: ScreenId, view: &TableView) -> Vec<Def> {
    let menu = || menu_bar(MENU_BAR_WEIGHT, view.menu_bar_shares);
    match screen {
        ScreenId::Loading => Vec::new(),
        ScreenId::Session => {
            let mut defs = vec![
                Def::new("exit", 5.0, Act::Exit),
                Def::new("activityScreen", 10.0, Act::Open(ScreenId::Activity)),
                Def::new("goalsScreen", 10.0, Act::Open(ScreenId::Goals)),
                Def::new("homeScreen", 10.0, Act::Open(ScreenId::Home)),
            ];
            if view.play_async {
                defs.push(Def::new("eventsScreen", 10.0, Act::Open(ScreenId::Events)));
                defs.push(Def::new("socialScreen", 10.0, Act::Open(ScreenId::Social)));
            }
            defs
        }
        ScreenId::Home => {
            let mut defs = menu().to_vec();
            defs.push(Def::new("playRandom", 70.0, Act::PlayRandomLive));
            defs.push(Def::new(
                "powerPlaySettings",
                5.0,
                Act::Open(ScreenId::PowerPlaySettings),
            ));
            defs
        }
        ScreenId::PowerPlaySettings => vec![
            Def::new("back", 25.0, Act::Back),
            // Turning Power Play on is likelier than turning it off
            Def::new(
                "toggleActive",
                if view.power_play_active { 10.0 } else { 90.0 },
                Act::TogglePowerPlay,
            ),
            Def::new("setMinimum", 25.0, Act::SetMinimumLevel).when(Condition::PowerPlayActive),
            Def::new("setMaximum", 25.0, Act::SetMaximumLevel).when(Condition::PowerPlayActive),
        ],
        ScreenId::Settings => vec![
            Def::new("back", 25.0, Act::Back),
            Def::new("cashOut", 10.0, Act::CashOut)
                .when(Condition::MinBalance(CASH_OUT_MIN_BALANCE)),
            Def::new("setInviter", 25.0, Act::SetInviter),
            Def::new("recentGames", 25.0, Act::RecentGames),
            Def::new(
                "toggleIncludeBots",
                if view.excluding_bots { 80.0 } else { 5.0 },
                Act::ToggleIncludeBots,
            ),
            Def::new(
                "powerPlaySettings",
                25.0,
                Act::Open(ScreenId::PowerPlaySettings),
            ),
        ],
        ScreenId::WalletDetails => vec![
            Def::new("back", 25.0, Act::Back),
            Def::new("cashOut", 10.0, Act::CashOut)
                .when(Condition::MinBalance(CASH_OUT_MIN_BALANCE)),
            Def::new("spin", 65.0, Act::Spin),
        ],
        ScreenId::Activity => {
            let mut defs = menu_bar(ACTIVITY_MENU_BAR_WEIGHT, view.menu_bar_shares).to_vec();
            defs.push(Def::new("feed", 6.0, Act::WinningsFeed));
            defs.extend(
                ACTIVITY_LEADERBOARDS
                    .iter()
                    .map(|&(name, board)| Def::new(name, 6.0, Act::Leaderboard(board))),
            );
            defs
        }
        ScreenId::Goals => {
            let mut defs = menu().to_vec();
            defs.push(Def::new("claim", 35.0, Act::ClaimGoal));
            defs.push(Def::new("practice", 35.0, Act::PlayArcade));
            defs
        }
        ScreenId::Events => {
            let mut defs = menu().to_vec();
            defs.push(Def::new("idle", 20.0, Act::EventsIdle));
            defs.push(Def::new("selectEventDetails", 50.0, Act::SelectEvent));
            defs.push(Def::new("selectHiddenEventDetails", 10.0, Act::SelectHiddenEvent));
            defs
        }
        ScreenId::EventDetails => vec![
            Def::new("back", 25.0, Act::Back),
            Def::new("leaderboard", 5.0, Act::EventLeaderboard),
            Def::new("feed", 5.0, Act::EventFeed),
            Def::new("idle", 10.0, Act::EventDetailsIdle),
            Def::new("eventAction", 55.0, Act::EventAction),
        ],
        ScreenId::Social => {
            let mut defs = menu().to_vec();
            defs.push(Def::new("searchForUser", 10.0, Act::SearchForUser));
            defs.push(Def::new("idle", 10.0, Act::SocialIdle));
            defs.push(Def::new("matchupAction", 50.0, Act::MatchupAction));
            defs
        }
        ScreenId::Pvp => {
            let mut defs = match view.pvp_main {
                PvpMain::Respond => vec![
                    Def::new("accept", 37.5, Act::Accept),
                    Def::new("reject", 37.5, Act::Decline),
                ],
                PvpMain::Move => vec![Def::new("move", 75.0, Act::Move)],
                PvpMain::AckRejected => vec![Def::new("ackRejected", 75.0, Act::AckRejected)],
                PvpMain::SeeResult => vec![Def::new("seeResult", 75.0, Act::SeeResult)],
                PvpMain::Challenge => vec![Def::new("startChallenge", 75.0, Act::StartChallenge)],
                PvpMain::Nothing => Vec::new(),
            };
            defs.push(Def::new("back", 25.0, Act::Stay));
            defs
        }
        ScreenId::FeedTab => vec![
            Def::new("back", 25.0, Act::Back),
            Def::new("idle", 50.0, Act::FeedIdle),
            Def::new("watchReplay", 25.0, Act::WatchReplay),
        ],
        ScreenId::HomeGameOver | ScreenId::ArcadeGameOver | ScreenId::AsyncGameOver => game_over(),
    }
}

/// Build the dispatcher of `screen` with configured overrides applied.
pub fn build_dispatcher(
    screen: ScreenId,
    view: &TableView,
    config: &Config,
    forced: Option<Arc<ForcedSequence>>,
) -> Result<Dispatcher<Act, Condition>, DispatchError> {
    let spec = screen.spec();
    Ok(
        Dispatcher::new(spec.dispatcher, screen_actions(screen, view), &config.action_weights)?
            .with_no_repeat(spec.kind == ScreenKind::Hub)
            .with_max_retries(config.max_action_retries)
            .with_forced(forced),
    )
}

/// Build every screen's dispatcher under every table-shaping toggle so a
/// broken weight override fails at startup instead of mid-run.
pub fn validate(config: &Config) -> Result<(), DispatchError> {
    const PVP_MAINS: [PvpMain; 6] = [
        PvpMain::Respond,
        PvpMain::Move,
        PvpMain::AckRejected,
        PvpMain::SeeResult,
        PvpMain::Challenge,
        PvpMain::Nothing,
    ];
    for screen in ScreenId::ALL {
        if screen.spec().kind == ScreenKind::Bootstrap {
            continue;
        }
        for play_async in [false, true] {
            for toggled in [false, true] {
                for pvp_main in PVP_MAINS {
                    let view = TableView {
                        play_async,
                        power_play_active: toggled,
                        excluding_bots: toggled,
                        pvp_main,
                        menu_bar_shares: config.menu_bar_shares,
                    };
                    build_dispatcher(screen, &view, config, None)?;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{ActionOutcome, ActionRunner};
    use async_trait::async_trait;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;
    use std::collections::HashMap;

    fn names(screen: ScreenId, view: &TableView) -> Vec<&'static str> {
        screen_actions(screen, view).iter().map(|d| d.name).collect()
    }

    #[test]
    fn test_default_tables_validate() {
        validate(&Config::default()).unwrap();
    }

    #[test]
    fn test_async_screens_only_with_async_play() {
        let sync = TableView::default();
        assert_eq!(
            names(ScreenId::Session, &sync),
            ["exit", "activityScreen", "goalsScreen", "homeScreen"]
        );
        let with_async = TableView {
            play_async: true,
            ..sync
        };
        assert!(names(ScreenId::Session, &with_async).contains(&"socialScreen"));
    }

    #[test]
    fn test_menu_bar_weights() {
        let defs = screen_actions(ScreenId::Activity, &TableView::default());
        let total: f64 = defs[..3].iter().map(|d| d.weight).sum();
        assert!((total - 46.0).abs() < 1e-9);
        assert_eq!(defs.len(), 3 + 1 + 8);
        let home = screen_actions(ScreenId::Home, &TableView::default());
        assert!((home[0].weight - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_toggle_weights_follow_state() {
        let off = screen_actions(ScreenId::PowerPlaySettings, &TableView::default());
        assert_eq!(off[1].weight, 90.0);
        let on = screen_actions(
            ScreenId::PowerPlaySettings,
            &TableView {
                power_play_active: true,
                ..TableView::default()
            },
        );
        assert_eq!(on[1].weight, 10.0);
        assert_eq!(on[2].condition, Some(Condition::PowerPlayActive));
    }

    #[test]
    fn test_pvp_main_action() {
        let respond = TableView {
            pvp_main: PvpMain::Respond,
            ..TableView::default()
        };
        assert_eq!(names(ScreenId::Pvp, &respond), ["accept", "reject", "back"]);
        assert_eq!(names(ScreenId::Pvp, &TableView::default()), ["back"]);
    }

    #[test]
    fn test_zeroed_override_is_rejected() {
        let mut config = Config::default();
        config.action_weights.insert(
            "feedTab".into(),
            HashMap::from([
                ("back".to_string(), 0.0),
                ("idle".to_string(), 0.0),
                ("watchReplay".to_string(), 0.0),
            ]),
        );
        assert!(matches!(validate(&config), Err(DispatchError::AllZero("feedTab"))));
    }

    /// Records which actions the dispatcher picked.
    struct Picks {
        rng: ChaCha8Rng,
        ran: Vec<Act>,
    }

    #[async_trait]
    impl ActionRunner<Act, Condition> for Picks {
        type Error = DispatchError;

        fn condition_holds(&self, _condition: &Condition) -> bool {
            true
        }

        fn draw(&mut self) -> f64 {
            self.rng.random()
        }

        async fn run_action(&mut self, key: Act) -> Result<ActionOutcome, DispatchError> {
            self.ran.push(key);
            Ok(ActionOutcome::Continue)
        }
    }

    #[tokio::test]
    async fn test_hub_is_no_repeat() {
        let config = Config::default();
        let mut hub = build_dispatcher(ScreenId::Session, &TableView::default(), &config, None).unwrap();
        assert_eq!(hub.name(), "session");
        assert!(hub.contains("homeScreen"));
        assert!(hub.is_no_repeat());

        let mut picks = Picks {
            rng: ChaCha8Rng::seed_from_u64(17),
            ran: Vec::new(),
        };
        for _ in 0..500 {
            hub.dispatch(&mut picks).await.unwrap();
        }
        assert!(picks.ran.windows(2).all(|w| w[0] != w[1]));
        assert!(picks.ran.contains(&Act::Exit));
        assert!(picks.ran.contains(&Act::Open(ScreenId::Home)));

        let home = build_dispatcher(ScreenId::Home, &TableView::default(), &config, None).unwrap();
        assert!(!home.is_no_repeat());
    }
}
