//! Who is reachable right now.
//!
//! The registry maps an identity to the connection that most recently joined
//! as it. It only keeps a weak link to the connection's outbound queue, so a
//! connection that has gone away can never be reached through it even before
//! its disconnect has been processed.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use time::OffsetDateTime;
use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::ServerEvent;
use crate::store::{ChatStore, truncate_to_millis};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(Uuid);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Sending side of one live connection.
#[derive(Debug, Clone)]
pub struct Handle {
    id: HandleId,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

impl Handle {
    /// Creates a handle and the queue its connection drains.
    pub fn new() -> (Handle, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Handle {
            id: HandleId(Uuid::now_v7()),
            tx,
        };
        (handle, rx)
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Queues `event` for the connection. False once the connection is gone.
    pub fn send(&self, event: ServerEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    fn link(&self) -> Link {
        Link {
            id: self.id,
            tx: self.tx.downgrade(),
        }
    }
}

struct Link {
    id: HandleId,
    tx: mpsc::WeakUnboundedSender<ServerEvent>,
}

impl Link {
    fn upgrade(&self) -> Option<Handle> {
        self.tx.upgrade().map(|tx| Handle { id: self.id, tx })
    }
}

pub struct PresenceRegistry {
    links: RwLock<HashMap<String, Link>>,
    // One lock per identity with a transition in flight. Orders that
    // identity's register/unregister so its stored online flag and presence
    // broadcasts follow the final in-memory state. Other identities and
    // lookups never wait on it.
    transitions: parking_lot::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    store: Arc<dyn ChatStore>,
    events: broadcast::Sender<ServerEvent>,
}

impl PresenceRegistry {
    pub fn new(store: Arc<dyn ChatStore>, buffer: usize) -> Self {
        let (events, _) = broadcast::channel(buffer.max(1));
        Self {
            links: RwLock::new(HashMap::new()),
            transitions: parking_lot::Mutex::new(HashMap::new()),
            store,
            events,
        }
    }

    /// Presence changes for every identity, as they are broadcast.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Points `identity` at `handle`, returning the handle it superseded.
    pub async fn register(&self, identity: &str, handle: &Handle) -> Option<HandleId> {
        let lock = self.transition_lock(identity);
        let superseded = {
            let _transition = lock.lock().await;
            self.mark_online(identity, handle).await
        };
        self.release_transition(identity, lock);
        superseded
    }

    /// Removes `identity` only while it still points at `handle`.
    ///
    /// A stale handle (already superseded or already removed) is a no-op and
    /// emits nothing, which makes repeated disconnects harmless.
    pub async fn unregister(&self, identity: &str, handle: HandleId) -> bool {
        let lock = self.transition_lock(identity);
        let removed = {
            let _transition = lock.lock().await;
            self.mark_offline(identity, handle).await
        };
        self.release_transition(identity, lock);
        removed
    }

    fn transition_lock(&self, identity: &str) -> Arc<Mutex<()>> {
        self.transitions
            .lock()
            .entry(identity.to_owned())
            .or_default()
            .clone()
    }

    fn release_transition(&self, identity: &str, lock: Arc<Mutex<()>>) {
        let mut transitions = self.transitions.lock();
        // Only the map and `lock` left: nobody is waiting on this identity.
        if Arc::strong_count(&lock) == 2 {
            transitions.remove(identity);
        }
    }

    async fn mark_online(&self, identity: &str, handle: &Handle) -> Option<HandleId> {
        let superseded = self
            .links
            .write()
            .insert(identity.to_owned(), handle.link())
            .map(|link| link.id);
        match superseded {
            Some(old) if old != handle.id => {
                info!(identity, %old, new = %handle.id, "handle superseded")
            }
            _ => info!(identity, handle = %handle.id, "online"),
        }

        if let Err(e) = self.store.set_online(identity, true).await {
            warn!(identity, "failed to persist online flag: {e}");
        }
        self.publish(ServerEvent::PresenceChanged {
            identity: identity.to_owned(),
            online: true,
            last_seen: None,
        });

        superseded
    }

    async fn mark_offline(&self, identity: &str, handle: HandleId) -> bool {
        let removed = {
            let mut links = self.links.write();
            let current = links.get(identity).map(|link| link.id);
            current == Some(handle) && links.remove(identity).is_some()
        };
        if !removed {
            debug!(identity, %handle, "stale disconnect ignored");
            return false;
        }

        let last_seen = truncate_to_millis(OffsetDateTime::now_utc());
        info!(identity, %handle, "offline");
        if let Err(e) = self.store.set_online(identity, false).await {
            warn!(identity, "failed to persist online flag: {e}");
        }
        if let Err(e) = self.store.set_last_seen(identity, last_seen).await {
            warn!(identity, "failed to persist last seen: {e}");
        }
        self.publish(ServerEvent::PresenceChanged {
            identity: identity.to_owned(),
            online: false,
            last_seen: Some(last_seen),
        });

        true
    }

    pub fn lookup(&self, identity: &str) -> Option<Handle> {
        self.links.read().get(identity).and_then(Link::upgrade)
    }

    /// Sorted identities whose connection is still alive.
    pub fn online(&self) -> Vec<String> {
        let mut online: Vec<String> = self
            .links
            .read()
            .iter()
            .filter(|(_, link)| link.tx.upgrade().is_some())
            .map(|(identity, _)| identity.clone())
            .collect();
        online.sort();
        online
    }

    fn publish(&self, event: ServerEvent) {
        if self.events.send(event).is_err() {
            debug!("no connections to notify");
        }
    }
}
