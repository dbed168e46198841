use std::sync::Arc;

use axum::{debug_handler, extract::{State, WebSocketUpgrade, ws::{Message as Frame, WebSocket}}, response::IntoResponse};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use crate::{AppState, events::{ClientEvent, ServerEvent}, presence::Handle, relay::RelayEngine};

/// Where a connection is in its lifecycle. Closing is the end of
/// [`serve_connection`].
#[derive(Debug, PartialEq, Eq)]
enum Session {
    Anonymous,
    Identified(String),
}

impl Session {
    fn identity(&self) -> Option<&str> {
        match self {
            Session::Anonymous => None,
            Session::Identified(identity) => Some(identity.as_str()),
        }
    }
}

#[debug_handler(state = AppState)]
pub(crate) async fn relay_ws(
    State(relay): State<Arc<RelayEngine>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    // Subscribed before the upgrade response, so a client sees every
    // presence change that happens after its handshake completes.
    let presence = relay.registry().subscribe();
    ws.on_upgrade(async move |stream| serve_connection(relay, presence, stream).await)
}

async fn serve_connection(
    relay: Arc<RelayEngine>,
    mut presence: broadcast::Receiver<ServerEvent>,
    stream: WebSocket,
) {
    let (handle, mut outbound) = Handle::new();
    let (mut sender, mut receiver) = stream.split();
    debug!(handle = %handle.id(), "connection opened");

    let writer = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                event = outbound.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                event = presence.recv() => match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "presence updates dropped for slow connection");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };

            let frame = match serde_json::to_string(&event) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("failed to encode {event:?}: {e}");
                    continue;
                }
            };
            if sender.send(Frame::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    let mut session = Session::Anonymous;
    while let Some(Ok(frame)) = receiver.next().await {
        let event = match frame {
            Frame::Text(text) => serde_json::from_str::<ClientEvent>(text.as_str()),
            Frame::Binary(bytes) => serde_json::from_slice::<ClientEvent>(&bytes),
            Frame::Close(_) => break,
            Frame::Ping(_) | Frame::Pong(_) => continue,
        };
        let Ok(event) = event else {
            debug!(handle = %handle.id(), "dropping undecodable frame");
            continue;
        };

        dispatch(&relay, &handle, &mut session, event).await;
    }

    if let Session::Identified(identity) = &session {
        relay.on_disconnect(identity, &handle).await;
    }
    debug!(handle = %handle.id(), "connection closed");

    writer.abort();
}

async fn dispatch(relay: &RelayEngine, handle: &Handle, session: &mut Session, event: ClientEvent) {
    match event {
        ClientEvent::Join { identity } => {
            if let Session::Identified(previous) = session {
                if *previous != identity {
                    relay.on_disconnect(previous, handle).await;
                }
            }
            relay.on_join(&identity, handle).await;
            *session = Session::Identified(identity);
        }
        ClientEvent::SendMessage { sender, receiver, text } => {
            if !may_speak_as(session, &sender) {
                return;
            }
            if let Err(e) = relay.on_send_message(handle, &sender, &receiver, &text).await {
                warn!(%sender, %receiver, "message not relayed: {e}");
            }
        }
        ClientEvent::Typing { sender, receiver } => {
            if may_speak_as(session, &sender) {
                relay.on_typing(&sender, &receiver);
            }
        }
    }
}

fn may_speak_as(session: &Session, sender: &str) -> bool {
    match session.identity() {
        Some(identity) if identity == sender => true,
        Some(identity) => {
            debug!(identity, sender, "dropping event sent on behalf of someone else");
            false
        }
        None => {
            debug!(sender, "dropping event before join");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::error::TryRecvError;

    use super::*;
    use crate::{presence::PresenceRegistry, store::{ChatStore, SqliteStore}};

    async fn relay() -> (RelayEngine, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let registry = Arc::new(PresenceRegistry::new(store.clone(), 16));
        (RelayEngine::new(registry, store.clone()), store)
    }

    fn send(sender: &str, receiver: &str, text: &str) -> ClientEvent {
        ClientEvent::SendMessage {
            sender: sender.to_owned(),
            receiver: receiver.to_owned(),
            text: text.to_owned(),
        }
    }

    fn join(identity: &str) -> ClientEvent {
        ClientEvent::Join { identity: identity.to_owned() }
    }

    #[tokio::test]
    async fn events_before_join_are_discarded() {
        let (relay, store) = relay().await;
        let (handle, mut rx) = Handle::new();
        let mut session = Session::Anonymous;

        dispatch(&relay, &handle, &mut session, send("alice", "bob", "hi")).await;
        dispatch(
            &relay,
            &handle,
            &mut session,
            ClientEvent::Typing { sender: "alice".to_owned(), receiver: "bob".to_owned() },
        )
        .await;

        assert_eq!(session, Session::Anonymous);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert!(store.all_messages().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn join_identifies_the_connection() {
        let (relay, _) = relay().await;
        let (handle, mut rx) = Handle::new();
        let mut session = Session::Anonymous;

        dispatch(&relay, &handle, &mut session, join("alice")).await;
        assert_eq!(session, Session::Identified("alice".to_owned()));
        assert_eq!(relay.registry().lookup("alice").map(|h| h.id()), Some(handle.id()));

        dispatch(&relay, &handle, &mut session, send("alice", "bob", "hi")).await;
        assert!(matches!(rx.try_recv(), Ok(ServerEvent::MessageSent { .. })));
    }

    #[tokio::test]
    async fn impersonation_is_discarded() {
        let (relay, store) = relay().await;
        let (handle, mut rx) = Handle::new();
        let mut session = Session::Anonymous;

        dispatch(&relay, &handle, &mut session, join("alice")).await;
        dispatch(&relay, &handle, &mut session, send("mallory", "bob", "hi")).await;

        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert!(store.all_messages().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejoining_as_someone_else_releases_the_old_identity() {
        let (relay, _) = relay().await;
        let (handle, _rx) = Handle::new();
        let mut session = Session::Anonymous;

        dispatch(&relay, &handle, &mut session, join("alice")).await;
        dispatch(&relay, &handle, &mut session, join("bob")).await;

        assert!(relay.registry().lookup("alice").is_none());
        assert_eq!(relay.registry().lookup("bob").map(|h| h.id()), Some(handle.id()));
        assert_eq!(relay.registry().online(), ["bob"]);
    }
}
