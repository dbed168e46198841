use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::debug;

use crate::events::ServerEvent;
use crate::presence::{Handle, PresenceRegistry};
use crate::store::{ChatStore, Message, StoreError, truncate_to_millis};

/// Binds connection events to the presence registry and the store.
pub struct RelayEngine {
    registry: Arc<PresenceRegistry>,
    store: Arc<dyn ChatStore>,
    // Last stamp handed out. Held across the insert so stamps never go
    // backwards in insertion order.
    last_stamp: Mutex<OffsetDateTime>,
}

impl RelayEngine {
    pub fn new(registry: Arc<PresenceRegistry>, store: Arc<dyn ChatStore>) -> Self {
        Self {
            registry,
            store,
            last_stamp: Mutex::new(OffsetDateTime::UNIX_EPOCH),
        }
    }

    pub fn registry(&self) -> &Arc<PresenceRegistry> {
        &self.registry
    }

    pub async fn on_join(&self, identity: &str, handle: &Handle) {
        self.registry.register(identity, handle).await;
    }

    /// Stores the message, forwards it to `receiver` if reachable and echoes
    /// it to `origin`. Nothing is sent when the store fails.
    ///
    /// Inserts go through one at a time: the stamp lock is held until the
    /// row is written, so `created_at` never decreases in insertion order.
    /// Forwarding happens after the lock is released.
    pub async fn on_send_message(
        &self,
        origin: &Handle,
        sender: &str,
        receiver: &str,
        text: &str,
    ) -> Result<Message, StoreError> {
        let message = {
            let mut last_stamp = self.last_stamp.lock().await;
            let created_at = truncate_to_millis(OffsetDateTime::now_utc()).max(*last_stamp);
            let message = self.store.save_message(sender, receiver, text, created_at).await?;
            *last_stamp = message.created_at;
            message
        };

        match self.registry.lookup(receiver) {
            Some(peer) => {
                if !peer.send(ServerEvent::MessageReceived { message: message.clone() }) {
                    debug!(receiver, "receiver went away before delivery");
                }
            }
            None => debug!(receiver, id = %message.id, "receiver offline, stored only"),
        }
        origin.send(ServerEvent::MessageSent { message: message.clone() });

        Ok(message)
    }

    /// Returns whether the indicator reached a live connection.
    pub fn on_typing(&self, sender: &str, receiver: &str) -> bool {
        self.registry
            .lookup(receiver)
            .is_some_and(|peer| peer.send(ServerEvent::TypingIndicator { sender: sender.to_owned() }))
    }

    pub async fn on_disconnect(&self, identity: &str, handle: &Handle) -> bool {
        self.registry.unregister(identity, handle.id()).await
    }

    pub async fn history(&self, a: &str, b: &str) -> Result<Vec<Message>, StoreError> {
        self.store.messages_between(a, b).await
    }

    /// Every stored message, newest first. Callers gate access.
    pub async fn monitor(&self) -> Result<Vec<Message>, StoreError> {
        self.store.all_messages().await
    }
}
