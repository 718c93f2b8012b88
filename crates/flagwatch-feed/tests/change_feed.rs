//! ChangeFeed behavior across relay failures, plus SseRelay against a
//! mock relay.

use std::time::Duration;

use flagwatch_feed::testing::{ScriptedRelay, flag_event};
use flagwatch_feed::{
    ChangeFeed, FeedConfig, FeedError, FeedStatus, RelayConnector, SseRelay,
};
use flagwatch_protocol::EventKind;
use futures_util::StreamExt;
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(max_retries: u32) -> FeedConfig {
    FeedConfig {
        reconnect_base_delay: Duration::from_millis(10),
        reconnect_max_delay: Duration::from_millis(80),
        max_retries,
        jitter: Duration::ZERO,
        ..Default::default()
    }
}

async fn wait_for(feed: &ChangeFeed, status: FeedStatus) {
    let mut rx = feed.watch_status();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == status))
        .await
        .expect("status not reached")
        .unwrap();
}

#[tokio::test]
async fn test_events_arrive_in_relay_order() {
    let relay = ScriptedRelay::new();
    let stream = relay.push_stream();
    let feed = ChangeFeed::start(relay, config(5));
    let mut sub = feed.subscribe("f");
    wait_for(&feed, FeedStatus::Connected).await;

    for v in 0..20 {
        stream.send(flag_event("f", EventKind::FlagUpdated, Some(json!(v))));
    }
    for v in 0..20 {
        assert_eq!(sub.recv().await.unwrap().value, Some(json!(v)));
    }
    feed.shutdown();
}

#[tokio::test]
async fn test_every_subscriber_gets_each_event_once() {
    let relay = ScriptedRelay::new();
    let stream = relay.push_stream();
    let feed = ChangeFeed::start(relay, config(5));
    let mut first = feed.subscribe("f");
    let mut second = feed.subscribe("f");
    wait_for(&feed, FeedStatus::Connected).await;

    stream.send(flag_event("f", EventKind::FlagUpdated, Some(json!(1))));
    stream.send(flag_event("g", EventKind::FlagUpdated, Some(json!(2))));
    stream.send(flag_event("f", EventKind::FlagDeleted, None));

    for sub in [&mut first, &mut second] {
        assert_eq!(sub.recv().await.unwrap().kind, EventKind::FlagUpdated);
        assert_eq!(sub.recv().await.unwrap().kind, EventKind::FlagDeleted);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), sub.recv())
                .await
                .is_err()
        );
    }
    feed.shutdown();
}

#[tokio::test]
async fn test_reconnects_after_stream_drop() {
    let relay = ScriptedRelay::new();
    let first = relay.push_stream();
    relay.fail_next(2);
    let second = relay.push_stream();
    let feed = ChangeFeed::start(relay.clone(), config(5));
    let mut sub = feed.subscribe("f");
    wait_for(&feed, FeedStatus::Connected).await;

    first.send(flag_event("f", EventKind::FlagUpdated, Some(json!("a"))));
    assert_eq!(sub.recv().await.unwrap().value, Some(json!("a")));
    first.fail("connection reset");

    second.send(flag_event("f", EventKind::FlagUpdated, Some(json!("b"))));
    let event = tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.value, Some(json!("b")));
    assert_eq!(relay.attempts(), 4);
    feed.shutdown();
}

#[tokio::test]
async fn test_retry_budget_exhausted_reports_unavailable() {
    let relay = ScriptedRelay::new();
    relay.fail_next(3);
    let feed = ChangeFeed::start(relay.clone(), config(3));
    let mut sub = feed.subscribe("f");

    let result = tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await
        .unwrap();
    assert!(matches!(result, Err(FeedError::RelayUnavailable(3))));
    assert_eq!(feed.status(), FeedStatus::Unavailable);
    assert_eq!(feed.subscriber_count(), 0);
    feed.shutdown();
}

#[tokio::test]
async fn test_subscribe_while_unavailable_is_fed_after_recovery() {
    let relay = ScriptedRelay::new();
    relay.fail_next(2);
    let stream = relay.push_stream();
    let feed = ChangeFeed::start(relay, config(2));

    let mut early = feed.subscribe("f");
    assert!(matches!(
        tokio::time::timeout(Duration::from_secs(5), early.recv()).await.unwrap(),
        Err(FeedError::RelayUnavailable(_))
    ));

    let mut late = feed.subscribe("f");
    wait_for(&feed, FeedStatus::Connected).await;
    stream.send(flag_event("f", EventKind::FlagUpdated, None));
    assert_eq!(late.recv().await.unwrap().flag_id, "f");
    feed.shutdown();
}

#[tokio::test]
async fn test_subscribe_during_outage_stays_attached() {
    let relay = ScriptedRelay::new();
    relay.fail_next(50);
    let feed = ChangeFeed::start(relay.clone(), config(2));
    wait_for(&feed, FeedStatus::Unavailable).await;

    let mut late = feed.subscribe("f");
    let attempts_at_subscribe = relay.attempts();
    tokio::time::timeout(Duration::from_secs(5), async {
        while relay.attempts() < attempts_at_subscribe + 4 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("relay loop stopped retrying");

    assert!(
        tokio::time::timeout(Duration::from_millis(50), late.recv())
            .await
            .is_err()
    );
    assert_eq!(feed.subscriber_count(), 1);
    assert_eq!(feed.status(), FeedStatus::Unavailable);
    feed.shutdown();
}

#[tokio::test]
async fn test_outage_reaches_subscriber_with_full_queue() {
    let relay = ScriptedRelay::new();
    let stream = relay.push_stream();
    relay.fail_next(10);
    let feed = ChangeFeed::start(
        relay,
        FeedConfig {
            queue_capacity: 1,
            ..config(2)
        },
    );
    let mut sub = feed.subscribe("f");
    wait_for(&feed, FeedStatus::Connected).await;

    stream.send(flag_event("f", EventKind::FlagUpdated, Some(json!(1))));
    stream.fail("connection reset");
    wait_for(&feed, FeedStatus::Unavailable).await;

    assert!(matches!(sub.recv().await, Err(FeedError::RelayUnavailable(2))));
    assert!(matches!(sub.recv().await, Err(FeedError::RelayUnavailable(2))));
    feed.shutdown();
}

#[tokio::test]
async fn test_sse_relay_parses_stream() {
    let server = MockServer::start().await;
    let body = concat!(
        ": keep-alive\n\n",
        "event: heartbeat\ndata: {}\n\n",
        "data: {\"event\":\"patch\",\"domain\":\"flag\",\"identifier\":\"dark-mode\",\"version\":2}\n\n",
        "data: {\"event\":\"delete\",\"domain\":\"flag\",\"identifier\":\"old\"}\n\n",
    );
    Mock::given(method("GET"))
        .and(path("/api/1.0/stream"))
        .and(header("API-Key", "server-key"))
        .and(header("accept", "text/event-stream"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(body),
        )
        .mount(&server)
        .await;

    let relay = SseRelay::new(&format!("{}/api/1.0", server.uri()), "server-key").unwrap();
    let events: Vec<_> = relay
        .connect()
        .await
        .unwrap()
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();

    assert_eq!(events.len(), 2);
    assert_eq!(events[0].flag_id, "dark-mode");
    assert_eq!(events[0].kind, EventKind::FlagUpdated);
    assert_eq!(events[0].version, Some(2));
    assert_eq!(events[1].flag_id, "old");
    assert_eq!(events[1].kind, EventKind::FlagDeleted);
}

#[tokio::test]
async fn test_sse_relay_rejected_key() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/stream"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .mount(&server)
        .await;

    let relay = SseRelay::new(&server.uri(), "wrong").unwrap();
    let result = relay.connect().await;
    assert!(matches!(
        result,
        Err(FeedError::Status { status: 401, ref message }) if message == "bad key"
    ));
}
