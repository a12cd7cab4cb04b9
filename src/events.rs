//! Event bus for distributing domain events to subscribers.
//!
//! Subscribers register against an event name and are invoked in registration
//! order. A subscriber that fails or panics is logged and skipped; delivery to
//! the remaining subscribers continues.

use anyhow::Result;
use async_trait::async_trait;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use crate::models::StatusChangeEvent;

/// Name under which status changes are published.
pub const SENSOR_STATUS_UPDATE: &str = "sensor.statusUpdate";

/// Events raised by the write path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainEvent {
    SensorStatusUpdated(StatusChangeEvent),
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::SensorStatusUpdated(_) => SENSOR_STATUS_UPDATE,
        }
    }
}

/// Something that reacts to published events.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// Label used in logs.
    fn label(&self) -> &str;

    async fn handle(&self, event: &DomainEvent) -> Result<()>;
}

struct Registration {
    event_name: String,
    subscriber: Arc<dyn EventSubscriber>,
}

/// Event bus for distributing domain events.
#[derive(Clone)]
pub struct EventBus {
    registrations: Arc<RwLock<Vec<Registration>>>,
}

impl EventBus {
    /// Create a new event bus.
    pub fn new() -> Self {
        Self {
            registrations: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Register a subscriber for `event_name`.
    pub async fn subscribe(&self, event_name: &str, subscriber: Arc<dyn EventSubscriber>) {
        debug!("{} subscribed to {}", subscriber.label(), event_name);
        self.registrations.write().await.push(Registration {
            event_name: event_name.to_string(),
            subscriber,
        });
    }

    /// Number of subscribers registered for `event_name`.
    pub async fn subscriber_count(&self, event_name: &str) -> usize {
        self.registrations
            .read()
            .await
            .iter()
            .filter(|r| r.event_name == event_name)
            .count()
    }

    /// Publish an event to every subscriber registered under its name.
    ///
    /// Returns how many subscribers handled it successfully.
    pub async fn publish(&self, event: DomainEvent) -> usize {
        let targets: Vec<Arc<dyn EventSubscriber>> = self
            .registrations
            .read()
            .await
            .iter()
            .filter(|r| r.event_name == event.name())
            .map(|r| Arc::clone(&r.subscriber))
            .collect();

        let mut delivered = 0;
        for subscriber in targets {
            match AssertUnwindSafe(subscriber.handle(&event)).catch_unwind().await {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    warn!("Subscriber {} failed on {}: {}", subscriber.label(), event.name(), e);
                }
                Err(_) => {
                    error!("Subscriber {} panicked on {}", subscriber.label(), event.name());
                }
            }
        }
        delivered
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
