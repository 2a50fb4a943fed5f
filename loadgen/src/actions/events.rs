//! Special events: the events list, event details and entry.

use chrono::Utc;
use serde_json::json;
use tracing::{debug, error, info};

use crate::client::RequestResult;
use crate::config::EventTemplate;
use crate::dispatch::ActionOutcome;
use crate::metrics;
use crate::screen::{Leaderboard, ScreenId};
use crate::vu::model::{
    Currency, EventUserStatus, SessionStatus, SpecialEvent, SpecialEventSequence,
};
use crate::vu::{DetailTab, EventDetail, FeedKind, Step, VirtualUser, halt};

use super::IDLE;

/// Order in which the events screen picks a running event to open.
const STATUS_PRIORITY: [&[EventUserStatus]; 5] = [
    &[EventUserStatus::Won, EventUserStatus::RunnerUp],
    &[EventUserStatus::Playing],
    &[EventUserStatus::Active],
    &[EventUserStatus::Eliminated],
    &[EventUserStatus::Uninvolved],
];

fn is_template_for(template: &EventTemplate, event: &SpecialEvent) -> bool {
    template.name == event.name && template.event_type == event.event_type
}

/// Invite codes are scoped to one test run.
fn scoped_code(code: &str, test_id: Option<&str>) -> String {
    match test_id {
        Some(id) => format!("{code}_{id}"),
        None => code.to_string(),
    }
}

/// First configured hidden event this player has not joined yet.
fn next_hidden_template<'a>(
    templates: &'a [EventTemplate],
    events: &SpecialEventSequence,
) -> Option<&'a EventTemplate> {
    templates.iter().find(|t| {
        t.is_hidden && t.invite_code.is_some() && !events.current.iter().any(|e| is_template_for(t, e))
    })
}

/// Running event with the most pressing status, if any.
fn prioritized_current(events: &[SpecialEvent]) -> Option<&SpecialEvent> {
    STATUS_PRIORITY.iter().find_map(|statuses| {
        events
            .iter()
            .find(|e| e.user_status.is_some_and(|s| statuses.contains(&s)))
    })
}

impl VirtualUser {
    /// Refresh the user and the event lists.
    pub(crate) async fn update_events(&mut self) -> Step {
        self.refresh_events().await.map(drop)
    }

    async fn refresh_events(&mut self) -> Step<RequestResult> {
        let user = self.get_user().await;
        self.check(&user, "users", true)?;
        let result = self.api.get("special_events").await;
        self.check(&result, "special_events", true)?;
        if result.is_ok()
            && let Some(events) = result.data_as::<SpecialEventSequence>()
        {
            self.state.events = events;
        }
        Ok(result)
    }

    pub(crate) async fn events_idle(&mut self) -> Step<ActionOutcome> {
        self.pause(IDLE.0, IDLE.1).await?;
        Ok(self.refresh_events().await?.to_outcome())
    }

    pub(crate) async fn select_event(&mut self) -> Step<ActionOutcome> {
        let mut event = prioritized_current(&self.state.events.current).cloned();
        if event.is_none() && !self.state.events.last.is_empty() {
            let index = self.pick(self.state.events.last.len());
            event = self.state.events.last.get(index).cloned();
        }
        if event.is_none() && !self.state.events.next.is_empty() {
            let index = self.pick(self.state.events.next.len());
            event = self.state.events.next.get(index).cloned();
        }
        let Some(event) = event else {
            return Ok(ActionOutcome::NoOpContinue);
        };
        self.open_event(event, None).await
    }

    /// Try the access code of a configured hidden event.
    pub(crate) async fn select_hidden_event(&mut self) -> Step<ActionOutcome> {
        if self.state.events.hidden_joined() >= self.ctx.config.max_hidden_tournaments {
            return Ok(ActionOutcome::NoOpContinue);
        }
        let Some(code) = next_hidden_template(&self.ctx.config.events, &self.state.events)
            .and_then(|t| t.invite_code.as_deref())
            .map(|code| scoped_code(code, self.ctx.config.test_id.as_deref()))
        else {
            debug!("VU {}: no hidden event left to try", self.ordinal);
            return Ok(ActionOutcome::NoOpContinue);
        };
        info!("VU {}: Trying hidden access code: {}", self.ordinal, code);
        let result = self.api.get(&format!("special_events/invite_only/{code}")).await;
        match (&result.error, result.data_as::<SpecialEvent>()) {
            (None, Some(event)) => self.open_event(event, Some(code)).await,
            (Some(e), _) => {
                error!("VU {}: {}", self.ordinal, e.message);
                Ok(ActionOutcome::NoOpContinue)
            }
            (None, None) => Ok(ActionOutcome::NoOpContinue),
        }
    }

    async fn open_event(&mut self, event: SpecialEvent, access_code: Option<String>) -> Step<ActionOutcome> {
        debug!("VU {}: opening event {}", self.ordinal, event.name);
        self.state.event_detail = Some(EventDetail {
            event,
            access_code,
            tab: DetailTab::Leaderboard,
        });
        Ok(self.run_screen(ScreenId::EventDetails).await?)
    }

    /// Full refresh of the details screen: user, event lists, the shown
    /// event and the selected tab.
    pub(crate) async fn enter_event_details(&mut self) -> Step {
        let Some(detail) = self.state.event_detail.clone() else {
            return halt(ActionOutcome::NoOpContinue);
        };
        let user = self.get_user().await;
        self.check(&user, "users", true)?;
        let result = self.api.get("special_events").await;
        self.check(&result, "special_events", true)?;
        let mut event = detail.event;
        if result.is_ok()
            && let Some(events) = result.data_as::<SpecialEventSequence>()
        {
            if detail.access_code.is_none() {
                let Some(updated) = events.find(&event.id).cloned() else {
                    error!(
                        "VU {}: Cannot find special event {} after update",
                        self.ordinal, event.id
                    );
                    return halt(ActionOutcome::HandledError);
                };
                event = updated;
            }
            self.state.events = events;
        }
        let result = match detail.tab {
            DetailTab::Leaderboard => self.leaderboard(Leaderboard::AdHocScore, Some(&event.id)).await,
            DetailTab::Feed => self.activity_feed(FeedKind::AdHoc, Some(&event.id)).await,
        };
        if let Some(detail) = self.state.event_detail.as_mut() {
            detail.event = event;
        }
        self.check(&result, "event details", true)
    }

    /// Refresh only the shown event.
    pub(crate) async fn update_event_detail(&mut self) -> Step {
        let Some(detail) = self.state.event_detail.as_ref() else {
            return Ok(());
        };
        let path = match &detail.access_code {
            Some(code)
                if detail
                    .event
                    .user_status
                    .is_none_or(|s| s == EventUserStatus::Uninvolved) =>
            {
                format!("special_events/invite_only/{code}")
            }
            _ => format!("special_events/{}", detail.event.id),
        };
        let result = self.api.get(&path).await;
        self.check(&result, "special_events", true)?;
        if result.is_ok()
            && let Some(event) = result.data_as::<SpecialEvent>()
        {
            self.state.events.replace(&event);
            if let Some(detail) = self.state.event_detail.as_mut() {
                detail.event = event;
            }
        }
        Ok(())
    }

    pub(crate) async fn event_leaderboard_tab(&mut self) -> Step<ActionOutcome> {
        let Some(id) = self.shown_event_id(DetailTab::Leaderboard) else {
            return Ok(ActionOutcome::NoOpContinue);
        };
        let result = self.leaderboard(Leaderboard::AdHocScore, Some(&id)).await;
        if result.is_fatal() {
            error!("VU {}: Fatal error! leaderboard: {}", self.ordinal, result.message());
            return halt(ActionOutcome::FatalAbort);
        }
        if let Some(detail) = self.state.event_detail.as_mut() {
            detail.tab = DetailTab::Leaderboard;
        }
        Ok(ActionOutcome::Continue)
    }

    pub(crate) async fn event_feed_tab(&mut self) -> Step<ActionOutcome> {
        let Some(id) = self.shown_event_id(DetailTab::Feed) else {
            return Ok(ActionOutcome::NoOpContinue);
        };
        if let Some(detail) = self.state.event_detail.as_mut() {
            detail.tab = DetailTab::Feed;
        }
        self.open_feed(FeedKind::AdHoc, Some(id)).await
    }

    /// Id of the shown event, unless `tab` is already selected.
    fn shown_event_id(&self, tab: DetailTab) -> Option<String> {
        self.state
            .event_detail
            .as_ref()
            .filter(|d| d.tab != tab)
            .map(|d| d.event.id.clone())
    }

    pub(crate) async fn event_details_idle(&mut self) -> Step<ActionOutcome> {
        self.pause(IDLE.0, IDLE.1).await?;
        self.enter_event_details().await?;
        Ok(ActionOutcome::Continue)
    }

    /// The details screen's main button, which depends on where the player
    /// stands in the event.
    pub(crate) async fn event_action(&mut self) -> Step<ActionOutcome> {
        let Some(detail) = self.state.event_detail.clone() else {
            return Ok(ActionOutcome::NoOpContinue);
        };
        let event = detail.event;
        match event.user_status {
            Some(EventUserStatus::Active | EventUserStatus::Playing) => {
                let session = self
                    .state
                    .user
                    .as_ref()
                    .and_then(|u| u.async_session_for_event(&event.id))
                    .filter(|s| s.requires_action)
                    .cloned();
                match session {
                    Some(s) if s.status == Some(SessionStatus::Playing) => {
                        debug!("VU {}: Event {}: Make move...", self.ordinal, event.name);
                        self.async_make_move(s).await
                    }
                    Some(s) if s.status != Some(SessionStatus::Completed) => {
                        debug!("VU {}: Event {}: See result...", self.ordinal, event.name);
                        self.async_see_result(s).await
                    }
                    Some(s) => {
                        error!(
                            "VU {}: session {} requires action but is {:?}",
                            self.ordinal, s.id, s.status
                        );
                        Ok(ActionOutcome::NoOpContinue)
                    }
                    // Waiting for the next round or the opponent
                    None => Ok(ActionOutcome::NoOpContinue),
                }
            }
            Some(EventUserStatus::Won | EventUserStatus::RunnerUp) => self.claim_event_prize(&event).await,
            Some(EventUserStatus::Uninvolved) => {
                self.join_event(&event, detail.access_code.as_deref()).await
            }
            Some(EventUserStatus::Eliminated) => self.rejoin_event(&event).await,
            _ => {
                debug!(
                    "VU {}: Event {}: nothing to do ({:?})",
                    self.ordinal, event.name, event.user_status
                );
                Ok(ActionOutcome::NoOpContinue)
            }
        }
    }

    fn can_afford(&self, cost: f64, currency: Option<Currency>) -> bool {
        match currency {
            Some(Currency::Primary) => self.balance() >= cost,
            _ => self.secondary_balance() >= cost,
        }
    }

    async fn claim_event_prize(&mut self, event: &SpecialEvent) -> Step<ActionOutcome> {
        debug!("VU {}: Event {}: Claim...", self.ordinal, event.name);
        let claimant = format!("{}@loadtest.tallyup.com", self.username());
        let result = self
            .api
            .post(
                "special_events/claim",
                &json!({ "eventId": event.id, "claimant": claimant }),
            )
            .await;
        self.check(&result, "special_events/claim", true)?;
        if result.is_ok() {
            self.count(metrics::EVENT_PRIZES_CLAIMED, &[]);
        }
        Ok(result.to_outcome())
    }

    async fn join_event(&mut self, event: &SpecialEvent, access_code: Option<&str>) -> Step<ActionOutcome> {
        if !event.is_open(Utc::now()) {
            return Ok(ActionOutcome::NoOpContinue);
        }
        if event.join_cost > 0.0 && !self.can_afford(event.join_cost, event.join_currency) {
            return Ok(ActionOutcome::NoOpContinue);
        }
        let invite_code = if event.has_invite_code {
            match access_code {
                Some(code) => Some(code.to_string()),
                None => self
                    .ctx
                    .config
                    .events
                    .iter()
                    .find(|t| is_template_for(t, event))
                    .and_then(|t| t.invite_code.as_deref())
                    .map(|code| scoped_code(code, self.ctx.config.test_id.as_deref())),
            }
        } else {
            None
        };
        debug!("VU {}: Event {}: Join...", self.ordinal, event.name);
        let mut body = json!({ "eventId": event.id });
        if let Some(code) = invite_code {
            body["inviteCode"] = json!(code);
        }
        let result = self.api.post("special_events/join", &body).await;
        self.check(&result, "special_events/join", false)?;
        Ok(result.to_outcome())
    }

    /// Rejoin after elimination while the entry window is open.
    async fn rejoin_event(&mut self, event: &SpecialEvent) -> Step<ActionOutcome> {
        let cost = event.user_next_rejoin_cost;
        if cost <= 0.0 || !event.is_open(Utc::now()) {
            return Ok(ActionOutcome::NoOpContinue);
        }
        if !self.can_afford(cost, event.user_rejoin_currency) {
            return Ok(ActionOutcome::NoOpContinue);
        }
        debug!("VU {}: Event {}: Rejoin...", self.ordinal, event.name);
        let result = self
            .api
            .post("special_events/rejoin", &json!({ "eventId": event.id }))
            .await;
        self.check(&result, "special_events/rejoin", false)?;
        Ok(result.to_outcome())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(name: &str, hidden: bool, code: Option<&str>) -> EventTemplate {
        EventTemplate {
            name: name.into(),
            event_type: "adHoc".into(),
            is_hidden: hidden,
            invite_code: code.map(Into::into),
        }
    }

    fn events(value: serde_json::Value) -> SpecialEventSequence {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_prize_claims_come_first() {
        let seq = events(json!({
            "current": [
                { "id": "a", "userStatus": "uninvolved" },
                { "id": "b", "userStatus": "active" },
                { "id": "c", "userStatus": "runnerUp" }
            ]
        }));
        assert_eq!(prioritized_current(&seq.current).unwrap().id, "c");
        let seq = events(json!({
            "current": [
                { "id": "a", "userStatus": "eliminated" },
                { "id": "b", "userStatus": "active" }
            ]
        }));
        assert_eq!(prioritized_current(&seq.current).unwrap().id, "b");
        let seq = events(json!({ "current": [{ "id": "a" }] }));
        assert!(prioritized_current(&seq.current).is_none());
    }

    #[test]
    fn test_next_hidden_template_skips_joined() {
        let templates = vec![
            template("Open Cup", false, None),
            template("Secret Cup", true, Some("SECRET")),
            template("Vault Cup", true, Some("VAULT")),
        ];
        let seq = events(json!({
            "current": [{ "id": "e1", "name": "Secret Cup", "type": "adHoc", "isHidden": true }]
        }));
        let next = next_hidden_template(&templates, &seq).unwrap();
        assert_eq!(next.name, "Vault Cup");
        assert_eq!(scoped_code("VAULT", Some("run42")), "VAULT_run42");
        assert_eq!(scoped_code("VAULT", None), "VAULT");
    }

    #[test]
    fn test_template_matches_name_and_type() {
        let event: SpecialEvent =
            serde_json::from_value(json!({ "id": "e", "name": "Open Cup", "type": "surge" })).unwrap();
        assert!(!is_template_for(&template("Open Cup", false, None), &event));
        let mut surge = template("Open Cup", false, None);
        surge.event_type = "surge".into();
        assert!(is_template_for(&surge, &event));
    }
}
