//! Integration tests for the activity feed subscription.
//!
//! These run the polling task against the in-memory server and check what
//! reaches the consumer channel.

use optimize_api::applications::{
    ActivityFeedQuery, ActivityItem, ActivityTag, ApplicationApi, Subscription,
};
use optimize_api::mock::MockOptimize;
use optimize_core::ErrorType;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const POLL: Duration = Duration::from_millis(20);

async fn next(rx: &mut mpsc::Receiver<ActivityItem>) -> Option<ActivityItem> {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for activity")
}

fn run_and_scan() -> ActivityFeedQuery {
    let mut query = ActivityFeedQuery::default();
    query.set_type([ActivityTag::Scan, ActivityTag::Run]);
    query
}

#[tokio::test]
async fn test_delivers_items_in_feed_order_then_closes() {
    let mock = Arc::new(MockOptimize::new());
    let urls: Vec<String> = (0..3)
        .map(|i| mock.push_activity(&[ActivityTag::Run], &format!("/scenarios/{}", i)))
        .collect();

    let cancel = CancellationToken::new();
    let sub = Subscription::subscribe_activity(mock.clone(), cancel.clone(), run_and_scan(), POLL)
        .await
        .unwrap();
    assert_eq!(sub.feed_url(), mock.feed_url());

    let (tx, mut rx) = mpsc::channel(8);
    let handle = sub.subscribe(tx);

    for url in &urls {
        assert_eq!(&next(&mut rx).await.unwrap().url, url);
    }

    cancel.cancel();
    assert!(next(&mut rx).await.is_none());
    handle.await.unwrap();
}

#[tokio::test]
async fn test_unacknowledged_items_are_not_redelivered() {
    let mock = Arc::new(MockOptimize::new());
    let first = mock.push_activity(&[ActivityTag::Scan], "/scenarios/a");

    let cancel = CancellationToken::new();
    let sub = Subscription::subscribe_activity(mock.clone(), cancel.clone(), run_and_scan(), POLL)
        .await
        .unwrap();
    let (tx, mut rx) = mpsc::channel(8);
    sub.subscribe(tx);

    assert_eq!(next(&mut rx).await.unwrap().url, first);

    // Several polls go by with the item still on the feed
    tokio::time::sleep(POLL * 5).await;
    assert!(rx.try_recv().is_err());

    let second = mock.push_activity(&[ActivityTag::Run], "/scenarios/b");
    assert_eq!(next(&mut rx).await.unwrap().url, second);

    mock.delete_activity(&first).await.unwrap();
    tokio::time::sleep(POLL * 5).await;
    assert!(rx.try_recv().is_err());

    cancel.cancel();
    assert!(next(&mut rx).await.is_none());
}

#[tokio::test]
async fn test_follows_feed_pages() {
    let mock = Arc::new(MockOptimize::new());
    mock.set_page_size(2);
    let urls: Vec<String> = (0..5)
        .map(|i| mock.push_activity(&[ActivityTag::Run], &format!("/scenarios/{}", i)))
        .collect();

    let cancel = CancellationToken::new();
    let sub = Subscription::subscribe_activity(mock.clone(), cancel.clone(), run_and_scan(), POLL)
        .await
        .unwrap();
    let (tx, mut rx) = mpsc::channel(1);
    sub.subscribe(tx);

    let mut delivered = Vec::new();
    for _ in 0..urls.len() {
        delivered.push(next(&mut rx).await.unwrap().url);
    }
    assert_eq!(delivered, urls);

    cancel.cancel();
    assert!(next(&mut rx).await.is_none());
}

#[tokio::test]
async fn test_only_requested_tags_are_delivered() {
    let mock = Arc::new(MockOptimize::new());
    mock.push_activity(&[ActivityTag::Scan], "/scenarios/a");
    let run = mock.push_activity(&[ActivityTag::Run], "/scenarios/a");

    let mut query = ActivityFeedQuery::default();
    query.set_type([ActivityTag::Run]);

    let cancel = CancellationToken::new();
    let sub = Subscription::subscribe_activity(mock.clone(), cancel.clone(), query, POLL)
        .await
        .unwrap();
    let (tx, mut rx) = mpsc::channel(8);
    sub.subscribe(tx);

    let item = next(&mut rx).await.unwrap();
    assert_eq!(item.url, run);
    assert!(item.has_tag(ActivityTag::Run));

    cancel.cancel();
    assert!(next(&mut rx).await.is_none());
}

#[tokio::test]
async fn test_cancel_while_blocked_on_full_channel() {
    let mock = Arc::new(MockOptimize::new());
    let urls: Vec<String> = (0..4)
        .map(|i| mock.push_activity(&[ActivityTag::Run], &format!("/scenarios/{}", i)))
        .collect();

    let cancel = CancellationToken::new();
    let sub = Subscription::subscribe_activity(mock.clone(), cancel.clone(), run_and_scan(), POLL)
        .await
        .unwrap();
    let (tx, mut rx) = mpsc::channel(1);
    let handle = sub.subscribe(tx);

    // Nobody reads: the first item fills the channel and the next send blocks
    tokio::time::sleep(POLL * 5).await;
    assert!(!handle.is_finished());

    cancel.cancel();
    timeout(Duration::from_secs(5), handle)
        .await
        .expect("blocked send was not cancelled")
        .unwrap();

    assert_eq!(rx.recv().await.unwrap().url, urls[0]);
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn test_dropped_receiver_stops_delivery() {
    let mock = Arc::new(MockOptimize::new());
    mock.push_activity(&[ActivityTag::Run], "/scenarios/a");
    mock.push_activity(&[ActivityTag::Run], "/scenarios/b");

    let sub = Subscription::subscribe_activity(
        mock.clone(),
        CancellationToken::new(),
        run_and_scan(),
        POLL,
    )
    .await
    .unwrap();
    let (tx, rx) = mpsc::channel(1);
    let handle = sub.subscribe(tx);
    drop(rx);

    timeout(Duration::from_secs(5), handle)
        .await
        .expect("delivery task did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_unreachable_feed_fails_subscription() {
    let mock = Arc::new(MockOptimize::new());
    mock.fail_on("check_endpoint", ErrorType::Unauthorized);

    let result = Subscription::subscribe_activity(
        mock.clone(),
        CancellationToken::new(),
        ActivityFeedQuery::default(),
        POLL,
    )
    .await;

    let err = result.err().unwrap();
    assert_eq!(err.error_type(), Some(&ErrorType::Unauthorized));
}
