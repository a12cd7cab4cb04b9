//! Sensor operations, including detection of status changes on update.

use tracing::{debug, info};

use crate::error::{SensorError, SensorResult};
use crate::events::{DomainEvent, EventBus};
use crate::models::{CreateSensor, Sensor, SensorId, StatusChangeEvent, UpdateSensor};
use crate::storage::Storage;

/// Sensor CRUD on top of storage. Updates that change `currentStatus` publish
/// a [`DomainEvent::SensorStatusUpdated`] once the write has committed.
#[derive(Clone)]
pub struct SensorService {
    storage: Storage,
    bus: EventBus,
}

impl SensorService {
    pub fn new(storage: Storage, bus: EventBus) -> Self {
        Self { storage, bus }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub async fn create(&self, new: CreateSensor) -> SensorResult<Sensor> {
        new.validate()?;
        let sensor = self.storage.insert_sensor(&new).await?;
        info!("Created sensor {} ({})", sensor.id, sensor.serial_number);
        Ok(sensor)
    }

    pub async fn find_all(&self) -> SensorResult<Vec<Sensor>> {
        self.storage.list_sensors().await
    }

    pub async fn find_one(&self, id: SensorId) -> SensorResult<Sensor> {
        self.storage
            .get_sensor(id)
            .await?
            .ok_or(SensorError::NotFound(id))
    }

    /// Apply a partial update. Emits at most one status change event, after commit.
    pub async fn update(&self, id: SensorId, update: UpdateSensor) -> SensorResult<Sensor> {
        update.validate()?;

        let result = self
            .storage
            .update_sensor(id, &update)
            .await?
            .ok_or(SensorError::NotFound(id))?;

        let sensor = result.sensor;
        if result.previous_status != sensor.current_status {
            info!(
                "Sensor {} status {} -> {}",
                sensor.id, result.previous_status, sensor.current_status
            );
            let event = StatusChangeEvent {
                id: sensor.id,
                current_status: sensor.current_status,
            };
            let delivered = self.bus.publish(DomainEvent::SensorStatusUpdated(event)).await;
            debug!("Status change for sensor {} delivered to {} subscribers", sensor.id, delivered);
        }

        Ok(sensor)
    }

    pub async fn remove(&self, id: SensorId) -> SensorResult<Sensor> {
        let sensor = self
            .storage
            .delete_sensor(id)
            .await?
            .ok_or(SensorError::NotFound(id))?;
        info!("Removed sensor {}", id);
        Ok(sensor)
    }
}
