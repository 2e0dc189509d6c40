use super::*;

use std::time::Duration;

use chrono::TimeZone;
use shared::{
    domain::{DeliveryState, MessageId},
    protocol::{ChatMessage, DirectMessage, ThreadUser},
};

use crate::{
    test_support::{ScriptedConnector, StubBackend},
    SessionRedirect,
};

struct Harness {
    connector: Arc<ScriptedConnector>,
    backend: Arc<StubBackend>,
    session: Arc<ChatSession>,
    events: broadcast::Receiver<ClientEvent>,
}

fn at(secs: i64) -> chrono::DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0)
        .single()
        .expect("timestamp")
}

fn chat(id: &str, sender: &str, content: &str, secs: i64) -> ChatMessage {
    ChatMessage {
        message_id: Some(MessageId::new(id)),
        channel_id: Some(ChannelId::new("c-1")),
        sender_id: UserId::new(sender),
        content: content.into(),
        timestamp: Some(at(secs)),
        client_id: None,
    }
}

fn dm(id: &str, sender: &str, receiver: &str, content: &str, secs: i64) -> DirectMessage {
    DirectMessage {
        id: MessageId::new(id),
        content: content.into(),
        sender_id: UserId::new(sender),
        receiver_id: UserId::new(receiver),
        timestamp: at(secs),
        thread_id: None,
        media_url: None,
        client_id: None,
    }
}

fn channel() -> ConversationKey {
    ConversationKey::Channel(ChannelId::new("c-1"))
}

async fn harness() -> Harness {
    let connector = ScriptedConnector::new();
    let backend = StubBackend::new();
    let session = ChatSession::new_with_dependencies(
        ClientSettings::default(),
        UserId::new("u-1"),
        Arc::new(CredentialStore::in_memory()),
        connector.clone(),
        backend.clone(),
    )
    .expect("session");
    session
        .login(CredentialPair::new(
            "access-1",
            "refresh-1",
            Utc::now() + chrono::Duration::hours(1),
        ))
        .await;
    let events = session.subscribe_events();
    Harness {
        connector,
        backend,
        session,
        events,
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

fn contents(timeline: &[TimelineEntry]) -> Vec<&str> {
    timeline.iter().map(|entry| entry.content.as_str()).collect()
}

#[tokio::test(start_paused = true)]
async fn start_requires_a_session() {
    let h = harness().await;
    h.session.credentials().clear().await;

    let err = h.session.start().await.expect_err("logged out");

    assert_eq!(err, ClientError::AuthExpired);
    assert_eq!(h.connector.connects(), 0);
}

#[tokio::test(start_paused = true)]
async fn reconnect_rejoins_and_refetches_missed_history() {
    let h = harness().await;
    h.backend
        .set_history(&ChannelId::new("c-1"), vec![chat("m-1", "u-2", "before", 0)]);
    h.session.start().await.expect("start");
    let timeline = h
        .session
        .open_channel(ChannelId::new("c-1"))
        .await
        .expect("open");
    assert_eq!(contents(&timeline), vec!["before"]);

    // the socket dies silently and a message arrives while it is down
    h.connector.latest().go_silent();
    h.backend.set_history(
        &ChannelId::new("c-1"),
        vec![
            chat("m-1", "u-2", "before", 0),
            chat("m-2", "u-3", "while away", 10),
        ],
    );
    tokio::time::sleep(Duration::from_millis(5_100)).await;
    settle().await;

    assert_eq!(h.connector.connects(), 2);
    assert_eq!(h.session.connection_state(), ConnectionState::Connected);
    let joins = h.connector.emitted_named("join_room");
    assert_eq!(joins.len(), 2);
    assert_eq!(
        h.backend
            .history_calls
            .load(std::sync::atomic::Ordering::SeqCst),
        2
    );
    assert_eq!(
        contents(&h.session.timeline(&channel()).await),
        vec!["before", "while away"]
    );
}

#[tokio::test(start_paused = true)]
async fn duplicate_and_out_of_order_events_render_once_in_order() {
    let h = harness().await;
    h.session.start().await.expect("start");
    h.session
        .open_channel(ChannelId::new("c-1"))
        .await
        .expect("open");
    let transport = h.connector.latest();

    transport.push(InboundEvent::ChatMessage(chat("m-2", "u-2", "second", 20)));
    transport.push(InboundEvent::ChatMessage(chat("m-2", "u-2", "second", 20)));
    transport.push(InboundEvent::ChatMessage(chat("m-1", "u-3", "first", 10)));
    settle().await;

    assert_eq!(
        contents(&h.session.timeline(&channel()).await),
        vec!["first", "second"]
    );
}

#[tokio::test(start_paused = true)]
async fn own_echo_replaces_the_optimistic_bubble() {
    let h = harness().await;
    h.session.start().await.expect("start");
    h.session
        .open_channel(ChannelId::new("c-1"))
        .await
        .expect("open");

    let envelope = h.session.send_message("hello").await.expect("send");
    assert_eq!(envelope.delivery_state, DeliveryState::Acknowledged);

    let mut echo = chat("m-9", "u-1", "hello", 0);
    echo.timestamp = Some(Utc::now());
    echo.client_id = Some(envelope.local_id);
    h.connector.latest().push(InboundEvent::ChatMessage(echo));
    settle().await;

    let timeline = h.session.timeline(&channel()).await;
    assert_eq!(timeline.len(), 1);
    assert!(timeline[0].authoritative);
    assert_eq!(timeline[0].local_id, Some(envelope.local_id));
    assert_eq!(timeline[0].server_id, Some(MessageId::new("m-9")));
    assert_eq!(h.backend.persisted().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn send_needs_an_open_channel() {
    let h = harness().await;
    h.session.start().await.expect("start");

    let err = h.session.send_message("hello").await.expect_err("no channel");

    assert!(matches!(err, ClientError::Validation(_)));
    assert!(h.connector.emitted_named("chat_message").is_empty());
}

#[tokio::test(start_paused = true)]
async fn direct_messages_land_in_partner_thread() {
    let mut h = harness().await;
    h.session.start().await.expect("start");
    let transport = h.connector.latest();

    transport.push(InboundEvent::ReceiveDm(dm("d-1", "u-2", "u-1", "hey", 0)));
    transport.push(InboundEvent::DmSentConfirmation(dm("d-2", "u-1", "u-2", "hi back", 5)));
    transport.push(InboundEvent::ReceiveDm(dm("d-1", "u-2", "u-1", "hey", 0)));
    transport.push(InboundEvent::DmError("receiver not found".into()));
    settle().await;

    let thread = h
        .session
        .timeline(&ConversationKey::Direct(UserId::new("u-2")))
        .await;
    assert_eq!(contents(&thread), vec!["hey", "hi back"]);

    let mut saw_error = false;
    while let Ok(event) = h.events.try_recv() {
        if matches!(event, ClientEvent::Error(ref msg) if msg.contains("receiver not found")) {
            saw_error = true;
        }
    }
    assert!(saw_error);
}

#[tokio::test(start_paused = true)]
async fn messaging_yourself_is_rejected() {
    let h = harness().await;
    h.session.start().await.expect("start");

    let err = h
        .session
        .send_direct_message(UserId::new("u-1"), "hi me")
        .await
        .expect_err("self message");

    assert!(matches!(err, ClientError::Validation(_)));
}

#[tokio::test(start_paused = true)]
async fn direct_threads_are_merged_by_partner() {
    let h = harness().await;
    *h.backend.threads.lock().expect("threads lock") = vec![DirectThread {
        other_user: Some(ThreadUser {
            id: UserId::new("u-2"),
            username: "bea".into(),
            avatar_url: None,
        }),
        messages: vec![
            dm("d-2", "u-1", "u-2", "second", 10),
            dm("d-1", "u-2", "u-1", "first", 0),
        ],
    }];

    let threads = h.session.load_direct_threads().await.expect("threads");

    assert_eq!(threads.len(), 1);
    assert_eq!(
        contents(
            &h.session
                .timeline(&ConversationKey::Direct(UserId::new("u-2")))
                .await
        ),
        vec!["first", "second"]
    );
}

#[tokio::test(start_paused = true)]
async fn expired_session_closes_the_connection() {
    let h = harness().await;
    h.session.start().await.expect("start");

    h.session
        .request_guard()
        .refresh()
        .terminate_session(SessionRedirect::Login, "refresh rejected")
        .await;
    settle().await;

    assert_eq!(h.session.connection_state(), ConnectionState::Idle);
    assert_eq!(
        h.connector
            .latest()
            .closes
            .load(std::sync::atomic::Ordering::SeqCst),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn logout_clears_credentials_and_can_start_again() {
    let h = harness().await;
    h.session.start().await.expect("start");

    h.session.logout().await;
    assert_eq!(h.session.connection_state(), ConnectionState::Idle);
    assert!(!h.session.credentials().has_session().await);

    h.session
        .login(CredentialPair::new(
            "access-2",
            "refresh-2",
            Utc::now() + chrono::Duration::hours(1),
        ))
        .await;
    h.session.start().await.expect("restart");
    assert_eq!(h.connector.connects(), 2);
    assert_eq!(h.connector.latest().auth.access_token, "access-2");

    h.session.open_channel(ChannelId::new("c-1")).await.expect("open");
    h.connector
        .latest()
        .push(InboundEvent::ChatMessage(chat("m-1", "u-2", "after restart", 0)));
    settle().await;
    assert_eq!(
        contents(&h.session.timeline(&channel()).await),
        vec!["after restart"]
    );
}
