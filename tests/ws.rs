use std::{sync::Arc, time::Duration};

use chatrelay::{AppState, events::ServerEvent, store::SqliteStore};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::{net::TcpStream, time::timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message as Frame};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn serve() -> (String, AppState) {
    let store = SqliteStore::in_memory().await.unwrap();
    let state = AppState::new(Arc::new(store), 64);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = chatrelay::router(state.clone());
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    (format!("ws://{addr}/ws"), state)
}

async fn connect(url: &str) -> Client {
    connect_async(url).await.unwrap().0
}

async fn emit(client: &mut Client, frame: serde_json::Value) {
    client.send(Frame::text(frame.to_string())).await.unwrap();
}

async fn next_event(client: &mut Client) -> ServerEvent {
    loop {
        let frame = timeout(Duration::from_secs(5), client.next())
            .await
            .expect("no frame within 5s")
            .expect("socket closed")
            .unwrap();
        if let Frame::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Skips frames until one satisfies `wanted`, returning every frame read.
async fn read_until(client: &mut Client, wanted: impl Fn(&ServerEvent) -> bool) -> Vec<ServerEvent> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(client).await;
        let done = wanted(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

fn presence_of(identity: &str, online: bool) -> impl Fn(&ServerEvent) -> bool {
    move |event| {
        matches!(
            event,
            ServerEvent::PresenceChanged { identity: who, online: state, .. }
                if who == identity && *state == online
        )
    }
}

async fn join(client: &mut Client, identity: &str) {
    emit(client, json!({"event": "join", "data": {"identity": identity}})).await;
    read_until(client, presence_of(identity, true)).await;
}

#[tokio::test]
async fn join_send_and_close_over_real_sockets() {
    let (url, state) = serve().await;

    let mut watcher = connect(&url).await;
    watcher.send(Frame::text("not an event")).await.unwrap();
    emit(&mut watcher, json!({"event": "sendMessage", "data": {"sender": "x", "receiver": "bob", "text": "early"}})).await;

    let mut bob = connect(&url).await;
    join(&mut bob, "bob").await;
    let mut alice = connect(&url).await;
    join(&mut alice, "alice").await;

    emit(
        &mut alice,
        json!({"event": "sendMessage", "data": {"sender": "alice", "receiver": "bob", "text": "hi"}}),
    )
    .await;

    let received = read_until(&mut bob, |e| matches!(e, ServerEvent::MessageReceived { .. })).await;
    let Some(ServerEvent::MessageReceived { message }) = received.last() else { unreachable!() };
    assert_eq!((message.sender.as_str(), message.text.as_str()), ("alice", "hi"));

    let echoed = read_until(&mut alice, |e| matches!(e, ServerEvent::MessageSent { .. })).await;
    let Some(ServerEvent::MessageSent { message: echo }) = echoed.last() else { unreachable!() };
    assert_eq!(echo, message);

    // The anonymous watcher survived its garbage frames and sees presence.
    read_until(&mut watcher, presence_of("bob", true)).await;
    read_until(&mut watcher, presence_of("alice", true)).await;

    alice.close(None).await.unwrap();

    let offline = read_until(&mut bob, presence_of("alice", false)).await;
    let Some(ServerEvent::PresenceChanged { last_seen, .. }) = offline.last() else { unreachable!() };
    assert!(last_seen.is_some());
    read_until(&mut watcher, presence_of("alice", false)).await;

    // Barrier: bob's own echo comes after anything the close could still emit.
    emit(
        &mut bob,
        json!({"event": "sendMessage", "data": {"sender": "bob", "receiver": "alice", "text": "gone?"}}),
    )
    .await;
    let rest = read_until(&mut bob, |e| matches!(e, ServerEvent::MessageSent { .. })).await;
    assert!(!rest.iter().any(presence_of("alice", false)));

    assert_eq!(state.registry.online(), ["bob"]);
    assert_eq!(state.relay.history("alice", "bob").await.unwrap().len(), 2);
    let users = state.store.users().await.unwrap();
    assert!(users.iter().any(|u| u.id == "alice" && !u.online && u.last_seen.is_some()));
    assert!(users.iter().all(|u| u.id != "x"));
}

#[tokio::test]
async fn typing_reaches_only_the_receiver() {
    let (url, state) = serve().await;
    let mut alice = connect(&url).await;
    join(&mut alice, "alice").await;
    let mut bob = connect(&url).await;
    join(&mut bob, "bob").await;

    emit(&mut alice, json!({"event": "typing", "data": {"sender": "alice", "receiver": "bob"}})).await;

    let seen = read_until(&mut bob, |e| matches!(e, ServerEvent::TypingIndicator { .. })).await;
    assert_eq!(
        seen.last(),
        Some(&ServerEvent::TypingIndicator { sender: "alice".to_owned() })
    );
    assert!(state.store.all_messages().await.unwrap().is_empty());
}
