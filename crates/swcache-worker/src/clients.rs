//! Connected clients and the messages the worker sends them.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace};
use url::Url;

use crate::worker::WorkerId;
use crate::WorkerError;

// ==================== Messages ====================

/// Storage usage as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSize {
    Bytes(u64),
    /// The store could not report usage.
    Unknown,
}

impl Serialize for CacheSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            CacheSize::Bytes(n) => serializer.serialize_u64(*n),
            CacheSize::Unknown => serializer.serialize_str("unknown"),
        }
    }
}

impl<'de> Deserialize<'de> for CacheSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bytes(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Bytes(n) => Ok(CacheSize::Bytes(n)),
            Raw::Text(s) if s == "unknown" => Ok(CacheSize::Unknown),
            Raw::Text(s) => Err(serde::de::Error::custom(format!("invalid cache size {s:?}"))),
        }
    }
}

/// Message posted from the worker to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    CacheSizeUpdate { size: CacheSize },
}

// ==================== Clients ====================

/// Unique identifier for a connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// A connected page.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: ClientId,
    pub url: Url,
    /// Worker currently serving this client's requests.
    pub controller: Option<WorkerId>,
    sender: mpsc::UnboundedSender<ClientMessage>,
}

impl Client {
    /// Post a message to the client.
    pub fn post_message(&self, message: ClientMessage) -> Result<(), WorkerError> {
        self.sender
            .send(message)
            .map_err(|_| WorkerError::ClientGone(self.id))
    }

    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// Registry of connected clients.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<ClientId, Client>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a client; messages for it arrive on the returned receiver.
    pub async fn connect(&self, url: Url) -> (ClientId, mpsc::UnboundedReceiver<ClientMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let client = Client {
            id: ClientId::new(),
            url,
            controller: None,
            sender,
        };
        let id = client.id;
        debug!(client = %id, url = %client.url, "Client connected");
        self.clients.write().await.insert(id, client);
        (id, receiver)
    }

    pub async fn disconnect(&self, id: ClientId) -> bool {
        self.clients.write().await.remove(&id).is_some()
    }

    pub async fn get(&self, id: ClientId) -> Option<Client> {
        self.clients.read().await.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }

    /// Clients, optionally only those controlled by `controller`.
    pub async fn match_all(&self, controller: Option<WorkerId>) -> Vec<Client> {
        let mut clients: Vec<Client> = self
            .clients
            .read()
            .await
            .values()
            .filter(|c| controller.is_none() || c.controller == controller)
            .cloned()
            .collect();
        clients.sort_by_key(|c| c.id);
        clients
    }

    pub async fn controller_of(&self, id: ClientId) -> Option<WorkerId> {
        self.clients.read().await.get(&id).and_then(|c| c.controller)
    }

    /// Make `worker` the controller of every connected client.
    ///
    /// Returns the clients whose controller changed.
    pub async fn claim(&self, worker: WorkerId) -> Vec<ClientId> {
        let mut changed: Vec<ClientId> = self
            .clients
            .write()
            .await
            .values_mut()
            .filter(|c| c.controller != Some(worker))
            .map(|c| {
                c.controller = Some(worker);
                c.id
            })
            .collect();
        changed.sort();
        changed
    }

    /// Post a message to one client.
    pub async fn post_message(
        &self,
        id: ClientId,
        message: ClientMessage,
    ) -> Result<(), WorkerError> {
        let client = self.get(id).await.ok_or(WorkerError::ClientNotFound(id))?;
        client.post_message(message)
    }

    /// Send `message` to every client. Returns how many accepted it.
    ///
    /// Clients whose receiver is gone are removed.
    pub async fn broadcast(&self, message: ClientMessage) -> usize {
        let mut clients = self.clients.write().await;
        let mut delivered = 0;
        clients.retain(|_, client| match client.post_message(message.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(e) => {
                trace!(error = %e, "Pruning disconnected client");
                false
            }
        });
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> Url {
        Url::parse("https://dicey.test/").unwrap()
    }

    #[test]
    fn test_message_shape() {
        let message = ClientMessage::CacheSizeUpdate {
            size: CacheSize::Bytes(2048),
        };
        assert_eq!(
            serde_json::to_string(&message).unwrap(),
            r#"{"type":"CACHE_SIZE_UPDATE","size":2048}"#
        );

        let unknown = ClientMessage::CacheSizeUpdate {
            size: CacheSize::Unknown,
        };
        assert_eq!(
            serde_json::to_value(&unknown).unwrap(),
            serde_json::json!({ "type": "CACHE_SIZE_UPDATE", "size": "unknown" })
        );
    }

    #[test]
    fn test_message_parse() {
        let parsed: ClientMessage =
            serde_json::from_str(r#"{"type":"CACHE_SIZE_UPDATE","size":"unknown"}"#).unwrap();
        assert_eq!(
            parsed,
            ClientMessage::CacheSizeUpdate {
                size: CacheSize::Unknown
            }
        );
        assert!(serde_json::from_str::<CacheSize>(r#""lots""#).is_err());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_client() {
        let registry = ClientRegistry::new();
        let (_a, mut rx_a) = registry.connect(page()).await;
        let (_b, mut rx_b) = registry.connect(page()).await;

        let message = ClientMessage::CacheSizeUpdate {
            size: CacheSize::Bytes(1),
        };
        assert_eq!(registry.broadcast(message.clone()).await, 2);
        assert_eq!(rx_a.recv().await, Some(message.clone()));
        assert_eq!(rx_b.recv().await, Some(message));
    }

    #[tokio::test]
    async fn test_broadcast_prunes_closed_clients() {
        let registry = ClientRegistry::new();
        let (a, rx_a) = registry.connect(page()).await;
        let (b, _rx_b) = registry.connect(page()).await;
        drop(rx_a);

        let delivered = registry
            .broadcast(ClientMessage::CacheSizeUpdate {
                size: CacheSize::Unknown,
            })
            .await;
        assert_eq!(delivered, 1);
        assert_eq!(registry.len().await, 1);
        assert!(registry.get(a).await.is_none());
        assert!(registry.get(b).await.unwrap().is_connected());
    }

    #[tokio::test]
    async fn test_claim_sets_controller() {
        let registry = ClientRegistry::new();
        let (a, _rx_a) = registry.connect(page()).await;
        let (b, _rx_b) = registry.connect(page()).await;
        let worker = WorkerId::next();

        assert_eq!(registry.claim(worker).await, vec![a, b]);
        assert_eq!(registry.controller_of(a).await, Some(worker));
        assert!(registry.claim(worker).await.is_empty());
        assert_eq!(registry.match_all(Some(worker)).await.len(), 2);
    }

    #[tokio::test]
    async fn test_post_message_to_missing_client() {
        let registry = ClientRegistry::new();
        let (id, _rx) = registry.connect(page()).await;
        assert!(registry.disconnect(id).await);

        let result = registry
            .post_message(
                id,
                ClientMessage::CacheSizeUpdate {
                    size: CacheSize::Unknown,
                },
            )
            .await;
        assert!(matches!(result, Err(WorkerError::ClientNotFound(_))));
    }
}
