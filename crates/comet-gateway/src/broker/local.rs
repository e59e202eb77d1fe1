//! In-process broker
//!
//! Nodes sharing a [`LocalHub`] can reach each other's connections. A lone
//! node uses a private hub.

use super::{BrokerError, MessageBroker};
use crate::protocol::InternalMessage;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

const INBOX_SIZE: usize = 1024;

/// Route table and inboxes shared by local brokers
#[derive(Debug, Default)]
pub struct LocalHub {
    routes: DashMap<String, String>,
    inboxes: DashMap<String, mpsc::Sender<InternalMessage>>,
}

impl LocalHub {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Node currently holding `key`
    pub fn route(&self, key: &str) -> Option<String> {
        self.routes.get(key).map(|node| node.value().clone())
    }
}

pub struct LocalBroker {
    hub: Arc<LocalHub>,
    node_id: String,
    inbox: Mutex<mpsc::Receiver<InternalMessage>>,
}

impl LocalBroker {
    /// Broker on a private hub
    pub fn new(node_id: impl Into<String>) -> Self {
        Self::with_hub(LocalHub::new(), node_id)
    }

    /// Broker joined to a shared hub
    pub fn with_hub(hub: Arc<LocalHub>, node_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        let (tx, rx) = mpsc::channel(INBOX_SIZE);
        hub.inboxes.insert(node_id.clone(), tx);
        Self {
            hub,
            node_id,
            inbox: Mutex::new(rx),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn hub(&self) -> &Arc<LocalHub> {
        &self.hub
    }
}

impl std::fmt::Debug for LocalBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBroker")
            .field("node_id", &self.node_id)
            .finish()
    }
}

#[async_trait]
impl MessageBroker for LocalBroker {
    async fn subscribe(&self, key: &str) -> Result<(), BrokerError> {
        self.hub
            .routes
            .insert(key.to_string(), self.node_id.clone());
        Ok(())
    }

    async fn unsubscribe(&self, key: &str) -> Result<(), BrokerError> {
        self.hub
            .routes
            .remove_if(key, |_, node| *node == self.node_id);
        Ok(())
    }

    async fn send(&self, msg: InternalMessage) -> Result<(), BrokerError> {
        let node = self
            .hub
            .route(&msg.receiver)
            .ok_or_else(|| BrokerError::NoRoute(msg.receiver.clone()))?;
        let inbox = self
            .hub
            .inboxes
            .get(&node)
            .map(|tx| tx.value().clone())
            .ok_or(BrokerError::Closed)?;
        inbox.send(msg).await.map_err(|_| BrokerError::Closed)
    }

    async fn receive(&self) -> Result<Option<InternalMessage>, BrokerError> {
        Ok(self.inbox.lock().await.recv().await)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.hub.inboxes.remove(&self.node_id);
        self.hub.routes.retain(|_, node| *node != self.node_id);
        tracing::debug!(node_id = %self.node_id, "Local broker closed");
        Ok(())
    }
}
