use super::*;
use crate::test_support::{ids, message, Peer, ScriptedConnector};
use gateway::MemoryGateway;
use shared::domain::{MessageId, UserIdentity};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

struct Harness {
    gateway: Arc<MemoryGateway>,
    connector: Arc<ScriptedConnector>,
    peers: UnboundedReceiver<Peer>,
    client: SyncClient,
}

fn g(id: &str) -> ConversationId {
    ConversationId::new(id)
}

async fn harness(page_size: u32) -> Harness {
    let gateway = Arc::new(MemoryGateway::new(UserIdentity {
        user_id: UserId::new("u-me"),
        name: "me".to_string(),
        email: None,
        image_url: None,
    }));
    for id in ["g1", "g2"] {
        gateway
            .insert_group(Conversation {
                id: g(id),
                name: id.to_string(),
                description: None,
                image_url: None,
                members: Vec::new(),
                last_activity: None,
            })
            .await;
    }
    let (connector, peers) = ScriptedConnector::new(true);
    let connector = Arc::new(connector);
    let client = SyncClient::new(gateway.clone(), connector.clone()).with_poll_config(PollConfig {
        interval: Duration::from_secs(60),
        page_size,
    });
    Harness {
        gateway,
        connector,
        peers,
        client,
    }
}

async fn next_peer(peers: &mut UnboundedReceiver<Peer>) -> Peer {
    tokio::time::timeout(Duration::from_secs(30), peers.recv())
        .await
        .expect("link opened in time")
        .expect("peer")
}

async fn next_inserted(events: &mut broadcast::Receiver<ViewportEvent>) -> usize {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(30), events.recv())
            .await
            .expect("event in time")
            .expect("event");
        if let ViewportEvent::MessagesInserted { count, .. } = event {
            return count;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn echo_push_and_snapshot_leave_exactly_one_copy() {
    let mut h = harness(20).await;
    let viewport = h.client.mount(g("g1")).await;
    let mut events = viewport.events();
    let mut peer = next_peer(&mut h.peers).await;
    assert_eq!(peer.expect_join().await, g("g1"));

    let echo = viewport.send("hello").await.expect("send");
    assert_eq!(echo.id, MessageId::new("m1"));
    assert!(echo.source_guid.as_deref().is_some_and(|token| !token.is_empty()));
    assert_eq!(next_inserted(&mut events).await, 1);

    // The relay's broadcast of the same write arrives afterwards.
    peer.push(&ServerEvent::NewMessage {
        group_id: g("g1"),
        message: echo.clone(),
    })
    .await;
    // Another participant's message, pushed after the duplicate.
    let other = message("m2", "g1", echo.created_at.timestamp() + 1);
    h.gateway.insert_message(other.clone()).await;
    peer.push(&ServerEvent::NewMessage {
        group_id: g("g1"),
        message: other,
    })
    .await;
    assert_eq!(next_inserted(&mut events).await, 1);

    let snapshot = h
        .gateway
        .fetch_messages(&g("g1"), None, 20)
        .await
        .expect("snapshot");
    let outcome = h
        .client
        .cache()
        .lock()
        .await
        .apply_snapshot(&g("g1"), snapshot);
    assert_eq!(outcome.inserted, 0);
    assert_eq!(outcome.duplicates, 2);

    let messages = viewport.messages().await;
    assert_eq!(ids(&messages), vec!["m1", "m2"]);
    viewport.unmount().await;
}

#[tokio::test(start_paused = true)]
async fn poller_skips_the_fetch_when_latest_activity_is_cached() {
    let mut h = harness(20).await;
    h.gateway.insert_message(message("m7", "g1", 1_700_000_007)).await;
    let viewport = h.client.mount(g("g1")).await;
    let mut events = viewport.events();
    let _peer = next_peer(&mut h.peers).await;
    // The first tick polls straight away.
    assert_eq!(next_inserted(&mut events).await, 1);
    let baseline = h.gateway.message_fetches();

    let outcome = viewport.refresh().await.expect("refresh");
    assert_eq!(outcome, MergeOutcome::default());
    assert_eq!(h.gateway.message_fetches(), baseline);

    h.gateway.insert_message(message("m8", "g1", 1_700_000_008)).await;
    let outcome = viewport.refresh().await.expect("refresh");
    assert_eq!(outcome.inserted, 1);
    assert_eq!(h.gateway.message_fetches(), baseline + 1);
    assert_eq!(ids(&viewport.messages().await), vec!["m7", "m8"]);
    viewport.unmount().await;
}

#[tokio::test(start_paused = true)]
async fn load_older_pages_backwards_in_order() {
    let mut h = harness(2).await;
    for n in 0..5 {
        h.gateway
            .insert_message(message(&format!("m{n}"), "g1", 1_700_000_000 + n))
            .await;
    }
    let viewport = h.client.mount(g("g1")).await;
    let _peer = next_peer(&mut h.peers).await;
    viewport.refresh().await.expect("refresh");
    assert_eq!(ids(&viewport.messages().await), vec!["m3", "m4"]);

    let outcome = viewport.load_older().await.expect("older");
    assert_eq!(outcome.inserted, 2);
    assert_eq!(ids(&viewport.messages().await), vec!["m1", "m2", "m3", "m4"]);

    viewport.load_older().await.expect("older");
    let outcome = viewport.load_older().await.expect("oldest page");
    assert_eq!(outcome, MergeOutcome::default());
    assert_eq!(
        ids(&viewport.messages().await),
        vec!["m0", "m1", "m2", "m3", "m4"]
    );
    viewport.unmount().await;
}

#[tokio::test(start_paused = true)]
async fn membership_and_creation_events_reach_the_viewport() {
    let mut h = harness(20).await;
    let viewport = h.client.mount(g("g1")).await;
    let mut events = viewport.events();
    let mut peer = next_peer(&mut h.peers).await;
    peer.expect_join().await;

    let bob = Member {
        membership_id: None,
        user_id: UserId::new("u-bob"),
        nickname: "bob".into(),
        image_url: None,
    };
    peer.push(&ServerEvent::MemberJoined {
        group_id: g("g2"),
        member: bob.clone(),
    })
    .await;
    peer.push(&ServerEvent::MemberJoined {
        group_id: g("g1"),
        member: bob.clone(),
    })
    .await;
    peer.push(&ServerEvent::MemberLeft {
        group_id: g("g1"),
        user_id: bob.user_id.clone(),
    })
    .await;
    let created = Conversation {
        id: g("g9"),
        name: "new".into(),
        description: None,
        image_url: None,
        members: Vec::new(),
        last_activity: None,
    };
    peer.push(&ServerEvent::GroupCreated {
        group: created.clone(),
    })
    .await;

    let mut seen = Vec::new();
    while seen.len() < 3 {
        let event = tokio::time::timeout(Duration::from_secs(30), events.recv())
            .await
            .expect("event in time")
            .expect("event");
        if !matches!(event, ViewportEvent::ConnectionChanged(_)) {
            seen.push(event);
        }
    }
    assert_eq!(
        seen,
        vec![
            ViewportEvent::MemberJoined {
                conversation_id: g("g1"),
                member: bob.clone(),
            },
            ViewportEvent::MemberLeft {
                conversation_id: g("g1"),
                user_id: bob.user_id,
            },
            ViewportEvent::GroupCreated(created),
        ]
    );
    viewport.unmount().await;
}

#[tokio::test(start_paused = true)]
async fn connection_changes_are_reported() {
    let mut h = harness(20).await;
    let viewport = h.client.mount(g("g1")).await;
    let mut events = viewport.events();
    let _peer = next_peer(&mut h.peers).await;

    let mut watch = viewport.watch_connection().expect("session");
    watch
        .wait_for(|state| *state == SessionState::Open)
        .await
        .expect("open");
    assert_eq!(viewport.connection_state(), SessionState::Open);

    let reported = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            if let ViewportEvent::ConnectionChanged(SessionState::Open) =
                events.recv().await.expect("event")
            {
                break;
            }
        }
    })
    .await;
    assert!(reported.is_ok());
    viewport.unmount().await;
}

#[tokio::test(start_paused = true)]
async fn unmount_stops_every_background_activity() {
    let mut h = harness(20).await;
    let viewport = h.client.mount(g("g1")).await;
    let mut peer = next_peer(&mut h.peers).await;
    peer.expect_join().await;
    viewport.refresh().await.expect("refresh");

    viewport.unmount().await;
    assert!(peer.from_client.recv().await.is_none());
    assert!(!h.client.cache().lock().await.is_tracked(&g("g1")));

    let fetches = h.gateway.group_fetches();
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(h.gateway.group_fetches(), fetches);
    assert_eq!(h.connector.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn blank_sends_are_refused_locally() {
    let mut h = harness(20).await;
    let viewport = h.client.mount(g("g1")).await;
    let _peer = next_peer(&mut h.peers).await;
    assert!(matches!(
        viewport.send("   ").await,
        Err(GatewayError::Invalid(_))
    ));
    assert!(viewport.messages().await.is_empty());
    viewport.unmount().await;
}

#[tokio::test(start_paused = true)]
async fn two_viewports_share_one_cache_entry() {
    let mut h = harness(20).await;
    let first = h.client.mount(g("g1")).await;
    let second = h.client.mount(g("g1")).await;
    let _a = next_peer(&mut h.peers).await;
    let _b = next_peer(&mut h.peers).await;
    assert_eq!(h.client.cache().lock().await.viewers(&g("g1")), 2);

    first.send("from first").await.expect("send");
    assert_eq!(second.messages().await.len(), 1);

    first.unmount().await;
    assert!(h.client.cache().lock().await.is_tracked(&g("g1")));
    second.unmount().await;
    assert!(!h.client.cache().lock().await.is_tracked(&g("g1")));
}

#[tokio::test(start_paused = true)]
async fn dropping_a_viewport_while_the_cache_is_busy_still_releases_it() {
    let mut h = harness(20).await;
    let viewport = h.client.mount(g("g1")).await;
    let _peer = next_peer(&mut h.peers).await;

    let cache = h.client.cache();
    let busy = cache.lock().await;
    drop(viewport);
    drop(busy);

    let released = tokio::time::timeout(Duration::from_secs(30), async {
        while cache.lock().await.is_tracked(&g("g1")) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(released.is_ok());
}
