//! Broadcast gateway: registry of push connections and status fan-out.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::SensorResult;
use crate::events::{DomainEvent, EventSubscriber};
use crate::models::{PushMessage, StatusChangeEvent};

pub type ConnectionId = Uuid;

/// Lifecycle of a push connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

struct ConnectionEntry {
    state: ConnectionState,
    connected_at: DateTime<Utc>,
    outbound: mpsc::UnboundedSender<String>,
}

/// Handle given to the socket task for a newly registered connection.
pub struct ClientConnection {
    pub id: ConnectionId,
    /// Serialized frames to write to the socket, in broadcast order.
    pub outbound: mpsc::UnboundedReceiver<String>,
}

/// Snapshot of a registered connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub state: ConnectionState,
    pub connected_at: DateTime<Utc>,
}

/// Fans out status changes to every open push connection.
#[derive(Clone, Default)]
pub struct Gateway {
    connections: Arc<RwLock<HashMap<ConnectionId, ConnectionEntry>>>,
}

impl Gateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection in the `Connecting` state.
    pub async fn on_connect(&self) -> ClientConnection {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        self.connections.write().await.insert(
            id,
            ConnectionEntry {
                state: ConnectionState::Connecting,
                connected_at: Utc::now(),
                outbound: tx,
            },
        );

        info!("Client connected: {}", id);
        ClientConnection { id, outbound: rx }
    }

    /// Move a connection from `Connecting` to `Open`. Returns false if it is gone.
    pub async fn mark_open(&self, id: ConnectionId) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get_mut(&id) {
            Some(entry) if entry.state == ConnectionState::Connecting => {
                entry.state = ConnectionState::Open;
                true
            }
            Some(entry) => entry.state == ConnectionState::Open,
            None => false,
        }
    }

    /// Deregister a connection. Unknown ids are ignored.
    pub async fn on_disconnect(&self, id: ConnectionId) -> bool {
        let removed = self.connections.write().await.remove(&id);
        match removed {
            Some(entry) => {
                debug!("Connection {} {:?} -> {:?}", id, entry.state, ConnectionState::Closed);
                info!("Client disconnected: {}", id);
                true
            }
            None => false,
        }
    }

    /// Push a status change to every open connection.
    ///
    /// Works on a snapshot of the registry, so connections may come and go while
    /// it runs. Connections whose receiving side is gone are dropped without retry.
    /// Returns the number of connections the frame was queued on.
    pub async fn broadcast(&self, event: &StatusChangeEvent) -> SensorResult<usize> {
        let frame = PushMessage::StatusUpdate(*event).to_json()?;

        let targets: Vec<(ConnectionId, mpsc::UnboundedSender<String>)> = self
            .connections
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.state == ConnectionState::Open)
            .map(|(id, entry)| (*id, entry.outbound.clone()))
            .collect();

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, outbound) in targets {
            if outbound.send(frame.clone()).is_ok() {
                delivered += 1;
            } else {
                dead.push(id);
            }
        }

        if !dead.is_empty() {
            let mut connections = self.connections.write().await;
            for id in dead {
                if connections.remove(&id).is_some() {
                    debug!("Dropped closed connection {}", id);
                }
            }
        }

        debug!(
            "Broadcast sensor {} -> {} to {} connections",
            event.id, event.current_status, delivered
        );
        Ok(delivered)
    }

    /// Number of connections currently able to receive broadcasts.
    pub async fn open_count(&self) -> usize {
        self.connections
            .read()
            .await
            .values()
            .filter(|entry| entry.state == ConnectionState::Open)
            .count()
    }

    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        let mut list: Vec<ConnectionInfo> = self
            .connections
            .read()
            .await
            .iter()
            .map(|(id, entry)| ConnectionInfo {
                id: *id,
                state: entry.state,
                connected_at: entry.connected_at,
            })
            .collect();
        list.sort_by_key(|c| c.connected_at);
        list
    }
}

/// Forwards bus status changes to the push channel.
#[async_trait]
impl EventSubscriber for Gateway {
    fn label(&self) -> &str {
        "sensors-gateway"
    }

    async fn handle(&self, event: &DomainEvent) -> Result<()> {
        match event {
            DomainEvent::SensorStatusUpdated(change) => {
                self.broadcast(change).await?;
            }
        }
        Ok(())
    }
}
