//! Generic screen loop shared by every entry in the screen table.

use futures_util::future::BoxFuture;
use tracing::{debug, error, trace};

use crate::dispatch::{ActionOutcome, Dispatcher};
use crate::vu::{FeedKind, SimError, Step, VirtualUser, halt, settle};

use super::{Act, Condition, ScreenId, ScreenKind, ScreenSpec, build_dispatcher};

impl VirtualUser {
    /// Run `screen` until it hands control back to its caller.
    ///
    /// Re-entering the active screen, or a screen whose guards fail, is a
    /// no-op. Nested screens and prompts restore their parent as the active
    /// screen on return.
    pub fn run_screen(&mut self, screen: ScreenId) -> BoxFuture<'_, Result<ActionOutcome, SimError>> {
        Box::pin(async move {
            let spec = screen.spec();
            if spec.kind == ScreenKind::Bootstrap {
                return settle(self.bootstrap().await);
            }
            if self.state.current_screen == Some(screen)
                || (spec.requires_user && self.state.user.is_none())
                || (spec.requires_async && !self.ctx.config.play_async)
            {
                trace!("VU {}: skipping {}", self.ordinal, screen.name());
                return Ok(ActionOutcome::NoOpContinue);
            }
            let parent = self.state.current_screen.replace(screen);
            if let Some(metric) = spec.metric {
                self.count(metric, &[]);
            }
            debug!("VU {}: entering {}", self.ordinal, screen.name());

            let outcome = settle(self.screen_loop(screen, spec).await);
            if spec.kind.restores_parent() {
                self.state.current_screen = parent;
            }
            let outcome = outcome?;
            Ok(match spec.kind {
                ScreenKind::Nested | ScreenKind::NestedSingle
                    if outcome == ActionOutcome::LeaveScreen =>
                {
                    ActionOutcome::Continue
                }
                _ => outcome,
            })
        })
    }

    async fn screen_loop(&mut self, screen: ScreenId, spec: ScreenSpec) -> Step<ActionOutcome> {
        self.enter_screen(screen).await?;
        let mut dispatcher = build_dispatcher(
            screen,
            &self.table_view(),
            &self.ctx.config,
            self.ctx.forced.clone(),
        )?;
        match spec.kind {
            ScreenKind::Bootstrap => Ok(ActionOutcome::Continue),
            ScreenKind::Hub => self.hub_loop(&mut dispatcher).await,
            ScreenKind::Prompt => Ok(dispatcher.dispatch(self).await?),
            ScreenKind::Tab | ScreenKind::Nested | ScreenKind::NestedSingle => {
                let mut outcome = ActionOutcome::Continue;
                loop {
                    self.before_dispatch(screen).await?;
                    if !outcome.skips_think_time() {
                        self.ctx.pacer.think(&mut self.rng).await;
                    }
                    if !self.lifecycle.checkpoint().await {
                        return Ok(ActionOutcome::Finished);
                    }
                    outcome = dispatcher.dispatch(self).await?;
                    if outcome.leaves_screen() || spec.kind == ScreenKind::NestedSingle {
                        self.leave_screen(screen).await;
                        return Ok(outcome);
                    }
                    if outcome != ActionOutcome::NoOpContinue {
                        self.refresh_screen(screen).await?;
                    }
                }
            }
        }
    }

    /// Bootstrap, the home screen, then weighted draws over the tab screens.
    async fn hub_loop(&mut self, hub: &mut Dispatcher<Act, Condition>) -> Step<ActionOutcome> {
        let loaded = self.run_screen(ScreenId::Loading).await?;
        if loaded.exits_iteration() {
            return Ok(loaded);
        }
        let mut outcome = self.run_screen(ScreenId::Home).await?;
        loop {
            if outcome.exits_iteration() {
                return Ok(outcome);
            }
            if !self.lifecycle.checkpoint().await {
                return Ok(ActionOutcome::Finished);
            }
            outcome = match outcome {
                ActionOutcome::JumpToScreen(action) => hub.dispatch_named(action, self).await?,
                _ => hub.dispatch(self).await?,
            };
        }
    }

    /// One-time fetches when a screen opens.
    async fn enter_screen(&mut self, screen: ScreenId) -> Step {
        match screen {
            ScreenId::Home => {
                self.fetch_progress().await;
                self.update_featured_events().await;
            }
            ScreenId::PowerPlaySettings => self.load_power_play(),
            ScreenId::Settings => {
                self.state.excluding_bots = self
                    .state
                    .user
                    .as_ref()
                    .and_then(|u| u.profile.as_ref())
                    .is_some_and(|p| p.exclude_bots);
            }
            ScreenId::Activity => {
                let result = self.activity_feed(FeedKind::Winnings, None).await;
                if result.is_fatal() {
                    return halt(ActionOutcome::FatalAbort);
                }
            }
            ScreenId::Goals => {
                self.api.get("special_events").await;
                self.fetch_progress().await;
            }
            ScreenId::Events => self.update_events().await?,
            ScreenId::EventDetails => self.enter_event_details().await?,
            ScreenId::Social => self.update_social().await?,
            ScreenId::Pvp => self.enter_pvp().await?,
            ScreenId::FeedTab => self.enter_feed().await?,
            ScreenId::Loading
            | ScreenId::Session
            | ScreenId::WalletDetails
            | ScreenId::HomeGameOver
            | ScreenId::ArcadeGameOver
            | ScreenId::AsyncGameOver => {}
        }
        Ok(())
    }

    /// Work done before each think/dispatch cycle.
    async fn before_dispatch(&mut self, screen: ScreenId) -> Step {
        if screen != ScreenId::Home {
            return Ok(());
        }
        if self.balance() < 1.0
            && self.state.user.is_some()
            && (self.has_basic_spins() || self.has_mega_spins())
        {
            let result = self.home_spinner().await?;
            if let Some(e) = &result.error {
                error!("VU {}: spin failed: {}", self.ordinal, e.message);
                self.ctx.pacer.delay(300.0).await;
                return halt(ActionOutcome::Suspend);
            }
        }
        if self.ctx.config.play_async
            && let Some(session) = self.unrouted_challenge()
        {
            debug!("VU {}: challenge {} waiting, going to matchups", self.ordinal, session);
            self.state.routed_challenge = Some(session);
            return halt(ActionOutcome::JumpToScreen(ScreenId::Social.name()));
        }
        Ok(())
    }

    /// Refresh screen-local state after a non-leaving action.
    async fn refresh_screen(&mut self, screen: ScreenId) -> Step {
        match screen {
            ScreenId::Home => self.update_featured_events().await,
            ScreenId::Goals => self.fetch_progress().await,
            ScreenId::Events => self.update_events().await?,
            ScreenId::EventDetails => self.update_event_detail().await?,
            ScreenId::Social => self.update_social().await?,
            _ => {}
        }
        Ok(())
    }

    async fn leave_screen(&mut self, screen: ScreenId) {
        if screen == ScreenId::PowerPlaySettings {
            // First call the app makes when returning to the home screen
            self.api.get("special_events").await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    use crate::client::{
        AuthChallenge, HttpRequest, HttpResponse, IdentityError, IdentityProvider, TokenBundle,
        Transport,
    };
    use crate::config::Config;
    use crate::lifecycle::{Lifecycle, Pacer, RampPlan, Stage};
    use crate::metrics::{self, Metrics};
    use crate::vu::SimContext;

    const BASE_URL: &str = "http://backend";

    /// Answers every request with an empty success body.
    #[derive(Default)]
    struct Backend {
        urls: Mutex<Vec<String>>,
    }

    impl Backend {
        fn paths(&self) -> Vec<String> {
            self.urls
                .lock()
                .unwrap()
                .iter()
                .map(|u| u.trim_start_matches(BASE_URL).trim_start_matches('/').to_string())
                .collect()
        }
    }

    #[async_trait]
    impl Transport for Backend {
        async fn send(&self, request: HttpRequest) -> HttpResponse {
            self.urls.lock().unwrap().push(request.url);
            HttpResponse::new(200, "{}")
        }
    }

    /// The screen machine never signs in on its own.
    struct NoIdentity;

    #[async_trait]
    impl IdentityProvider for NoIdentity {
        async fn sign_up(&self, _username: &str) -> Result<(), IdentityError> {
            Err(IdentityError::Throttled)
        }

        async fn initiate_auth(&self, _username: &str) -> Result<AuthChallenge, IdentityError> {
            Err(IdentityError::Throttled)
        }

        async fn respond_to_challenge(
            &self,
            _username: &str,
            _challenge: &AuthChallenge,
        ) -> Result<TokenBundle, IdentityError> {
            Err(IdentityError::Throttled)
        }

        async fn refresh(&self, _username: &str, _refresh_token: &str) -> Result<TokenBundle, IdentityError> {
            Err(IdentityError::Throttled)
        }
    }

    struct Harness {
        vu: VirtualUser,
        backend: Arc<Backend>,
        metrics: Arc<Metrics>,
    }

    /// One VU over a three stage plan of `stage` each.
    fn harness(mut config: Config, pacer: Pacer, stage: Duration) -> Harness {
        config.base_url = BASE_URL.into();
        let backend = Arc::new(Backend::default());
        let metrics = Arc::new(Metrics::new());
        let ctx = SimContext::new(
            Arc::new(config),
            backend.clone(),
            Arc::new(NoIdentity),
            metrics.clone(),
            pacer.clone(),
        )
        .unwrap();
        let plan = RampPlan::new(
            &[Stage::new(stage, 1), Stage::new(stage, 1), Stage::new(stage, 0)],
            1,
        )
        .unwrap();
        let lifecycle = Lifecycle::new(Arc::new(plan), 1, Instant::now(), pacer);
        Harness {
            vu: VirtualUser::new(&ctx, lifecycle, 7).unwrap(),
            backend,
            metrics,
        }
    }

    fn default_harness(config: Config) -> Harness {
        harness(config, Pacer::immediate(), Duration::from_secs(3600))
    }

    /// Zero every weight of `dispatcher` except `keep`.
    fn only(config: &mut Config, dispatcher: &str, keep: &str, others: &[&str]) {
        let weights = config.action_weights.entry(dispatcher.into()).or_default();
        weights.insert(keep.into(), 1.0);
        for other in others {
            weights.insert((*other).into(), 0.0);
        }
    }

    fn with_user(vu: &mut VirtualUser, sessions: serde_json::Value) {
        vu.set_user(&json!({
            "username": "load_00000",
            "account": 0.0,
            "secondaryAccount": 0.0,
            "sessions": sessions,
        }));
    }

    #[tokio::test]
    async fn test_reentering_active_screen_is_noop() {
        let mut h = default_harness(Config::default());
        h.vu.state.current_screen = Some(ScreenId::Home);
        let outcome = h.vu.run_screen(ScreenId::Home).await.unwrap();
        assert_eq!(outcome, ActionOutcome::NoOpContinue);
        assert_eq!(h.vu.state.current_screen, Some(ScreenId::Home));
        assert!(h.backend.paths().is_empty());
        assert_eq!(h.metrics.counter_total(metrics::HOME_SCREEN), 0);
    }

    #[tokio::test]
    async fn test_guarded_screens_are_skipped() {
        let mut h = default_harness(Config::default());
        // Settings needs the user snapshot
        let outcome = h.vu.run_screen(ScreenId::Settings).await.unwrap();
        assert_eq!(outcome, ActionOutcome::NoOpContinue);
        assert_eq!(h.metrics.counter_total(metrics::SETTINGS_SCREEN), 0);

        // Events needs async play, which is off by default
        with_user(&mut h.vu, json!([]));
        let outcome = h.vu.run_screen(ScreenId::Events).await.unwrap();
        assert_eq!(outcome, ActionOutcome::NoOpContinue);
        assert_eq!(h.metrics.counter_total(metrics::EVENTS_SCREEN), 0);

        assert_eq!(h.vu.state.current_screen, None);
        assert!(h.backend.paths().is_empty());
    }

    #[tokio::test]
    async fn test_leaving_nested_screen_restores_parent() {
        let mut config = Config::default();
        only(
            &mut config,
            "powerPlaySettingsScreen",
            "back",
            &["toggleActive", "setMinimum", "setMaximum"],
        );
        let mut h = default_harness(config);
        with_user(&mut h.vu, json!([]));
        h.vu.state.current_screen = Some(ScreenId::Home);

        let outcome = h.vu.run_screen(ScreenId::PowerPlaySettings).await.unwrap();
        assert_eq!(outcome, ActionOutcome::Continue);
        assert_eq!(h.vu.state.current_screen, Some(ScreenId::Home));
        assert_eq!(h.metrics.counter_total(metrics::POWERPLAY_SETTINGS_SCREEN), 1);
        // Returning home re-fetches the events first
        assert_eq!(h.backend.paths(), ["special_events"]);
    }

    #[tokio::test]
    async fn test_home_routes_received_challenge_to_matchups() {
        let mut config = Config {
            play_async: true,
            ..Config::default()
        };
        only(
            &mut config,
            "socialScreen",
            "newTab",
            &["settings", "walletDetails", "searchForUser", "idle", "matchupAction"],
        );
        let mut h = default_harness(config);
        with_user(
            &mut h.vu,
            json!([{ "id": "s-1", "isLive": false, "status": "challengeReceived" }]),
        );
        h.vu.state.current_screen = Some(ScreenId::Session);

        let outcome = h.vu.run_screen(ScreenId::Home).await.unwrap();
        assert_eq!(outcome, ActionOutcome::JumpToScreen("socialScreen"));
        assert_eq!(h.vu.state.routed_challenge.as_deref(), Some("s-1"));
        assert_eq!(h.vu.unrouted_challenge(), None);

        // The hub follows the jump by name
        let mut hub = build_dispatcher(
            ScreenId::Session,
            &h.vu.table_view(),
            &h.vu.ctx.config,
            None,
        )
        .unwrap();
        let outcome = hub.dispatch_named("socialScreen", &mut h.vu).await.unwrap();
        assert_eq!(outcome, ActionOutcome::LeaveScreen);
        assert_eq!(h.vu.state.current_screen, Some(ScreenId::Social));
        assert_eq!(h.metrics.counter_total(metrics::MATCHUPS_SCREEN), 1);
        assert!(h.backend.paths().iter().any(|p| p == "users/find_challengees"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_noop_action_skips_think_time() {
        let mut config = Config::default();
        // Settings is skipped without a user, then the tab is left
        config.forced_actions = vec!["homeScreen.settings".into(), "homeScreen.newTab".into()];
        let pacer = Pacer::new(false, 1.0, CancellationToken::new());
        let mut h = harness(config, pacer, Duration::from_secs(3600));

        let start = Instant::now();
        let outcome = h.vu.run_screen(ScreenId::Home).await.unwrap();
        let elapsed = start.elapsed();
        assert_eq!(outcome, ActionOutcome::LeaveScreen);
        // One think before the first draw and none after the no-op
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_secs(2), "thought for {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ramp_down_checkpoint_finishes_the_screen() {
        let mut config = Config::default();
        only(
            &mut config,
            "homeScreen",
            "newTab",
            &["settings", "walletDetails", "playRandom", "powerPlaySettings"],
        );
        let mut h = harness(config, Pacer::immediate(), Duration::from_secs(10));
        // Halfway through ramp-down the only VU is gone
        tokio::time::advance(Duration::from_secs(25)).await;

        let outcome = h.vu.run_screen(ScreenId::Home).await.unwrap();
        assert_eq!(outcome, ActionOutcome::Finished);
        assert_eq!(h.vu.state.current_screen, Some(ScreenId::Home));
    }
}
