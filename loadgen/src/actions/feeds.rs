//! Activity feeds, leaderboards and replays.

use tracing::{debug, error};

use crate::client::RequestResult;
use crate::dispatch::ActionOutcome;
use crate::metrics;
use crate::screen::{Leaderboard, ScreenId};
use crate::vu::model::FeedItem;
use crate::vu::{FeedKind, FeedView, Step, VirtualUser, halt};

const PAGE: &str = "offset=0&limit=40";
const FEED_IDLE: (f64, f64) = (5.0, 20.0);
/// Long enough to watch a replay, or give up part way
const REPLAY_WATCH: (f64, f64) = (10.0, 300.0);

fn feed_path(kind: FeedKind, event_id: Option<&str>) -> String {
    format!(
        "feeds/activity?type={}&id={}&{PAGE}",
        kind.as_str(),
        event_id.unwrap_or_default()
    )
}

fn leaderboard_path(board: Leaderboard, id: Option<&str>) -> String {
    match id {
        Some(id) => format!("users/leaderboard?type={}&id={id}&{PAGE}", board.as_str()),
        None => format!("users/leaderboard?type={}&{PAGE}", board.as_str()),
    }
}

impl VirtualUser {
    pub(crate) async fn activity_feed(&mut self, kind: FeedKind, event_id: Option<&str>) -> RequestResult {
        self.api.get(&feed_path(kind, event_id)).await
    }

    pub(crate) async fn leaderboard(&mut self, board: Leaderboard, id: Option<&str>) -> RequestResult {
        self.api.get(&leaderboard_path(board, id)).await
    }

    /// Open the feed tab over `kind`.
    pub(crate) async fn open_feed(&mut self, kind: FeedKind, event_id: Option<String>) -> Step<ActionOutcome> {
        self.state.feed = Some(FeedView {
            kind,
            event_id,
            items: Vec::new(),
        });
        Ok(self.run_screen(ScreenId::FeedTab).await?)
    }

    /// Feed tab entry: load the first page of the chosen feed.
    pub(crate) async fn enter_feed(&mut self) -> Step {
        let Some((kind, event_id)) = self
            .state
            .feed
            .as_ref()
            .map(|f| (f.kind, f.event_id.clone()))
        else {
            return halt(ActionOutcome::NoOpContinue);
        };
        let result = self.activity_feed(kind, event_id.as_deref()).await;
        self.check(&result, "feeds/activity", true)?;
        if result.is_err() {
            return halt(ActionOutcome::HandledError);
        }
        let items = result.data_as::<Vec<FeedItem>>().unwrap_or_default();
        debug!("VU {}: {} {} feed items", self.ordinal, items.len(), kind.as_str());
        if let Some(feed) = self.state.feed.as_mut() {
            feed.items = items;
        }
        Ok(())
    }

    pub(crate) async fn feed_idle(&mut self) -> Step<ActionOutcome> {
        self.pause(FEED_IDLE.0, FEED_IDLE.1).await?;
        Ok(ActionOutcome::Continue)
    }

    pub(crate) async fn watch_replay(&mut self) -> Step<ActionOutcome> {
        let len = self.state.feed.as_ref().map_or(0, |f| f.items.len());
        if len == 0 {
            return Ok(ActionOutcome::NoOpContinue);
        }
        let index = self.pick(len);
        let Some(game_id) = self
            .state
            .feed
            .as_ref()
            .and_then(|f| f.items[index].game_id.clone())
        else {
            return Ok(ActionOutcome::NoOpContinue);
        };
        let result = self.api.get(&format!("games/{game_id}/watch")).await;
        if let Some(e) = &result.error {
            error!("VU {}: watch replay {}: {}", self.ordinal, game_id, e);
            return Ok(result.to_outcome());
        }
        self.count(metrics::REPLAYS_WATCHED, &[]);
        self.pause(REPLAY_WATCH.0, REPLAY_WATCH.1).await?;
        Ok(ActionOutcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_paths() {
        assert_eq!(
            feed_path(FeedKind::Winnings, None),
            "feeds/activity?type=winnings&id=&offset=0&limit=40"
        );
        assert_eq!(
            feed_path(FeedKind::AdHoc, Some("e1")),
            "feeds/activity?type=adHoc&id=e1&offset=0&limit=40"
        );
    }

    #[test]
    fn test_leaderboard_paths() {
        assert_eq!(
            leaderboard_path(Leaderboard::MostDonated, None),
            "users/leaderboard?type=mostDonated&offset=0&limit=40"
        );
        assert_eq!(
            leaderboard_path(Leaderboard::AdHocScore, Some("e7")),
            "users/leaderboard?type=adHocScore&id=e7&offset=0&limit=40"
        );
    }
}
