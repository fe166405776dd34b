//! Activity feed and subscription
//!
//! The feed is a server-managed queue of requested scans and runs. It can
//! only be polled, so [`Subscription`] owns a background task that polls it
//! on an interval and forwards newly seen items to a channel. Items leave the
//! feed when a consumer acknowledges them with
//! [`ApplicationApi::delete_activity`]; the subscription never does.
//!
//! A handled item stays on the feed until it is acknowledged, which for a
//! run can take many poll intervals. The delivery task therefore remembers
//! the URLs it has forwarded and only forwards each one once, forgetting a
//! URL when it no longer appears on the feed. As a consequence an item
//! whose acknowledgement failed is not delivered again by the same
//! subscription; it is picked up by the next one.

use super::ApplicationApi;
use chrono::{DateTime, Utc};
use optimize_core::{Relation, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often the feed is polled unless configured otherwise
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Kinds of work requested through the feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityTag {
    Scan,
    Run,
}

impl ActivityTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityTag::Scan => "scan",
            ActivityTag::Run => "run",
        }
    }
}

impl fmt::Display for ActivityTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single entry of the activity feed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityItem {
    #[serde(default)]
    pub id: String,
    /// Where the item is acknowledged
    #[serde(default)]
    pub url: String,
    /// The scenario the activity refers to
    #[serde(default)]
    pub external_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_published: Option<DateTime<Utc>>,
}

impl ActivityItem {
    pub fn has_tag(&self, tag: ActivityTag) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag.as_str()))
    }
}

/// One page of the activity feed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityFeed {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default)]
    pub items: Vec<ActivityItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_url: Option<String>,
}

/// Filter applied to the activity feed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivityFeedQuery {
    /// Only items carrying at least one of these tags; empty means all
    pub tags: Vec<ActivityTag>,
    pub limit: Option<usize>,
    pub continuation: Option<String>,
}

impl ActivityFeedQuery {
    pub fn set_type(&mut self, tags: impl IntoIterator<Item = ActivityTag>) {
        self.tags = tags.into_iter().collect();
    }

    /// Check an item against the tag filter
    pub fn matches(&self, item: &ActivityItem) -> bool {
        self.tags.is_empty() || self.tags.iter().any(|tag| item.has_tag(*tag))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanActivity {
    pub scenario: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunActivity {
    pub scenario: String,
}

/// A request for work posted to the feed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan: Option<ScanActivity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<RunActivity>,
}

impl Activity {
    /// Request a template scan of the scenario at `scenario`
    pub fn scan(scenario: impl Into<String>) -> Self {
        Self {
            scan: Some(ScanActivity {
                scenario: scenario.into(),
            }),
            run: None,
        }
    }

    /// Request an experiment run of the scenario at `scenario`
    pub fn run(scenario: impl Into<String>) -> Self {
        Self {
            scan: None,
            run: Some(RunActivity {
                scenario: scenario.into(),
            }),
        }
    }
}

/// A validated, not yet started, activity feed subscription
pub struct Subscription<A: ?Sized> {
    api: Arc<A>,
    cancel: CancellationToken,
    query: ActivityFeedQuery,
    feed_url: String,
    poll_interval: Duration,
}

impl<A> Subscription<A>
where
    A: ApplicationApi + ?Sized + 'static,
{
    /// Locate the activity feed and check that it answers `query`
    ///
    /// Delivery does not start until [`Subscription::subscribe`]. A zero
    /// `poll_interval` selects [`DEFAULT_POLL_INTERVAL`].
    pub async fn subscribe_activity(
        api: Arc<A>,
        cancel: CancellationToken,
        query: ActivityFeedQuery,
        poll_interval: Duration,
    ) -> Result<Self> {
        let metadata = api.check_endpoint().await?;
        let feed_url = metadata.require_link(Relation::Alternate)?.to_string();

        api.list_activity(&feed_url, &query).await?;
        debug!("Activity feed available at {}", feed_url);

        let poll_interval = if poll_interval.is_zero() {
            DEFAULT_POLL_INTERVAL
        } else {
            poll_interval
        };

        Ok(Self {
            api,
            cancel,
            query,
            feed_url,
            poll_interval,
        })
    }

    pub fn feed_url(&self) -> &str {
        &self.feed_url
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Start delivering items to `tx` on a background task
    ///
    /// The task stops when the cancellation token fires or the receiver is
    /// dropped, and closes the channel on its way out. A full channel blocks
    /// polling until the consumer catches up.
    pub fn subscribe(self, tx: mpsc::Sender<ActivityItem>) -> JoinHandle<()> {
        tokio::spawn(self.deliver(tx))
    }

    async fn deliver(self, tx: mpsc::Sender<ActivityItem>) {
        info!(
            "Watching activity feed {} every {:?}",
            self.feed_url, self.poll_interval
        );

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Items already forwarded that are still waiting for acknowledgement
        let mut forwarded: HashSet<String> = HashSet::new();

        'poll: loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break 'poll,
                _ = ticker.tick() => {}
            }

            let items = match self.poll().await {
                Ok(items) => items,
                Err(e) => {
                    warn!("Failed to poll activity feed: {}", e);
                    continue;
                }
            };

            {
                let present: HashSet<&str> = items.iter().map(|i| i.url.as_str()).collect();
                forwarded.retain(|url| present.contains(url.as_str()));
            }
            debug!("Polled {} activity items", items.len());

            for item in items {
                if !forwarded.insert(item.url.clone()) {
                    continue;
                }

                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break 'poll,
                    sent = tx.send(item) => {
                        if sent.is_err() {
                            debug!("Activity receiver dropped");
                            break 'poll;
                        }
                    }
                }
            }
        }

        info!("Stopped watching activity feed {}", self.feed_url);
    }

    /// Fetch every page of the feed, keeping items that match the query
    async fn poll(&self) -> Result<Vec<ActivityItem>> {
        let mut query = self.query.clone();
        let mut items = Vec::new();

        loop {
            let feed = self.api.list_activity(&self.feed_url, &query).await?;
            items.extend(feed.items.into_iter().filter(|i| self.query.matches(i)));

            match feed.next_url {
                Some(next) if query.continuation.as_deref() != Some(next.as_str()) => {
                    query.continuation = Some(next);
                }
                _ => return Ok(items),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_wire_format() {
        let feed: ActivityFeed = serde_json::from_str(
            r#"{"title": "Activity", "items": [{
                "id": "1", "url": "https://api.example.com/v2/activity/1",
                "external_url": "https://api.example.com/v2/applications/a/scenarios/s",
                "title": "Run s", "tags": ["run"], "date_published": "2021-03-01T12:00:00Z"
            }]}"#,
        )
        .unwrap();

        let item = &feed.items[0];
        assert!(item.has_tag(ActivityTag::Run));
        assert!(!item.has_tag(ActivityTag::Scan));
        assert_eq!(item.external_url, "https://api.example.com/v2/applications/a/scenarios/s");
        assert!(item.date_published.is_some());
        assert_eq!(feed.next_url, None);
    }

    #[test]
    fn test_query_matches_tags() {
        let run = ActivityItem {
            tags: vec!["run".to_string()],
            ..Default::default()
        };
        let other = ActivityItem {
            tags: vec!["report".to_string()],
            ..Default::default()
        };

        let mut query = ActivityFeedQuery::default();
        assert!(query.matches(&other));

        query.set_type([ActivityTag::Scan, ActivityTag::Run]);
        assert!(query.matches(&run));
        assert!(!query.matches(&other));
    }

    #[test]
    fn test_activity_request_shape() {
        let json = serde_json::to_value(Activity::run("/v2/applications/a/scenarios/s")).unwrap();
        assert_eq!(json["run"]["scenario"], "/v2/applications/a/scenarios/s");
        assert!(json.get("scan").is_none());
    }
}
