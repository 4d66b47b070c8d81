//! Page clients and log broadcast.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace};
use url::Url;

use crate::message::ClientMessage;
use crate::ServiceWorkerError;

/// Unique identifier for a page client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// An open page.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: ClientId,

    pub url: Url,

    /// Whether this worker controls the page.
    pub controlled: bool,

    tx: mpsc::UnboundedSender<ClientMessage>,
}

impl Client {
    /// Post a message to the page.
    pub fn post_message(&self, message: ClientMessage) -> Result<(), ServiceWorkerError> {
        self.tx
            .send(message)
            .map_err(|_| ServiceWorkerError::StateError(format!("{} has gone away", self.id)))
    }
}

/// Registry of open pages (the `clients` global).
#[derive(Debug, Clone, Default)]
pub struct Clients {
    clients: Arc<RwLock<HashMap<ClientId, Client>>>,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a page. The receiver gets every message posted to it.
    pub async fn connect(
        &self,
        url: Url,
        controlled: bool,
    ) -> (ClientId, mpsc::UnboundedReceiver<ClientMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ClientId::new();

        debug!(client = %id, url = %url, controlled, "Client connected");
        self.clients.write().await.insert(
            id,
            Client {
                id,
                url,
                controlled,
                tx,
            },
        );

        (id, rx)
    }

    pub async fn disconnect(&self, id: ClientId) -> bool {
        self.clients.write().await.remove(&id).is_some()
    }

    pub async fn get(&self, id: ClientId) -> Option<Client> {
        self.clients.read().await.get(&id).cloned()
    }

    /// Controlled clients, like `clients.matchAll()` with default options.
    pub async fn match_all(&self) -> Vec<Client> {
        self.clients
            .read()
            .await
            .values()
            .filter(|c| c.controlled)
            .cloned()
            .collect()
    }

    /// Take control of every open page. Returns how many changed hands.
    pub async fn claim(&self) -> usize {
        let mut clients = self.clients.write().await;
        let mut claimed = 0;
        for client in clients.values_mut().filter(|c| !c.controlled) {
            client.controlled = true;
            claimed += 1;
        }
        claimed
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }

    /// Post `message` to every controlled client.
    ///
    /// Best effort: pages that have gone away are dropped from the registry
    /// and do not fail the broadcast. Returns the number of deliveries.
    pub async fn broadcast(&self, message: ClientMessage) -> usize {
        let targets = self.match_all().await;
        let mut delivered = 0;
        let mut gone = Vec::new();

        for client in targets {
            match client.post_message(message.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => gone.push(client.id),
            }
        }

        if !gone.is_empty() {
            let mut clients = self.clients.write().await;
            for id in gone {
                debug!(client = %id, "Pruning closed client");
                clients.remove(&id);
            }
        }

        trace!(?message, delivered, "Broadcast");
        delivered
    }

    /// Broadcast a log line.
    pub async fn log(&self, message: impl Into<String>) -> usize {
        self.broadcast(ClientMessage::log(message)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> Url {
        Url::parse("http://localhost:8080/").unwrap()
    }

    #[tokio::test]
    async fn test_broadcast_reaches_controlled_only() {
        let clients = Clients::new();
        let (_, mut controlled) = clients.connect(page(), true).await;
        let (_, mut uncontrolled) = clients.connect(page(), false).await;

        assert_eq!(clients.log("installed").await, 1);
        assert_eq!(controlled.recv().await, Some(ClientMessage::log("installed")));
        assert!(uncontrolled.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_claim_takes_uncontrolled_pages() {
        let clients = Clients::new();
        let (_, _a) = clients.connect(page(), true).await;
        let (_, mut b) = clients.connect(page(), false).await;

        assert_eq!(clients.claim().await, 1);
        assert_eq!(clients.claim().await, 0);

        clients.log("activating").await;
        assert_eq!(b.recv().await, Some(ClientMessage::log("activating")));
    }

    #[tokio::test]
    async fn test_broadcast_prunes_closed_clients() {
        let clients = Clients::new();
        let (_, open) = clients.connect(page(), true).await;
        let (closed_id, closed) = clients.connect(page(), true).await;
        drop(closed);

        assert_eq!(clients.log("hello").await, 1);
        assert!(clients.get(closed_id).await.is_none());
        assert_eq!(clients.len().await, 1);
        drop(open);
    }

    #[tokio::test]
    async fn test_disconnect() {
        let clients = Clients::new();
        let (id, _rx) = clients.connect(page(), true).await;

        assert!(clients.disconnect(id).await);
        assert!(!clients.disconnect(id).await);
        assert!(clients.is_empty().await);
    }
}
