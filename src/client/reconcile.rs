//! Client-side state: the fetched sensor list plus pushed status overrides.
//!
//! Pushed statuses are recorded in an override map that takes precedence over the
//! `currentStatus` carried by the last fetched list, and are also patched into that
//! list so it stays usable on its own. Overrides are kept across refetches.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::models::{Sensor, SensorId, SensorStatus, StatusChangeEvent};

/// Most recently pushed status per sensor.
pub type StatusOverrides = HashMap<SensorId, SensorStatus>;

/// Merge one pushed change into client state.
///
/// Unknown ids still get an override entry so the status applies if the sensor
/// shows up in a later fetch; the list itself is left as is in that case.
pub fn merge(
    mut overrides: StatusOverrides,
    sensors: Vec<Sensor>,
    event: &StatusChangeEvent,
) -> (StatusOverrides, Vec<Sensor>) {
    overrides.insert(event.id, event.current_status);
    let sensors = sensors
        .into_iter()
        .map(|mut sensor| {
            if sensor.id == event.id {
                sensor.current_status = event.current_status;
            }
            sensor
        })
        .collect();
    (overrides, sensors)
}

/// Status to show for `sensor`: the override if present, otherwise the fetched value.
pub fn display_status(overrides: &StatusOverrides, sensor: &Sensor) -> SensorStatus {
    overrides
        .get(&sensor.id)
        .copied()
        .unwrap_or(sensor.current_status)
}

/// A sensor as it should be rendered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorRow {
    pub id: SensorId,
    pub name: String,
    pub serial_number: String,
    pub firmware_version: String,
    pub status: SensorStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientState {
    pub overrides: StatusOverrides,
    pub sensors: Vec<Sensor>,
}

impl ClientState {
    pub fn new(sensors: Vec<Sensor>) -> Self {
        Self {
            overrides: StatusOverrides::new(),
            sensors,
        }
    }

    pub fn apply(&mut self, event: &StatusChangeEvent) {
        let state = std::mem::take(self);
        let (overrides, sensors) = merge(state.overrides, state.sensors, event);
        *self = Self { overrides, sensors };
    }

    /// Swap in a freshly fetched list. Overrides survive.
    pub fn replace_sensors(&mut self, sensors: Vec<Sensor>) {
        self.sensors = sensors;
    }

    /// Displayed status for a sensor in the cached list.
    pub fn display_status(&self, id: SensorId) -> Option<SensorStatus> {
        self.sensors
            .iter()
            .find(|s| s.id == id)
            .map(|s| display_status(&self.overrides, s))
    }

    pub fn rows(&self) -> Vec<SensorRow> {
        self.sensors
            .iter()
            .map(|s| SensorRow {
                id: s.id,
                name: s.name.clone(),
                serial_number: s.serial_number.clone(),
                firmware_version: s.firmware_version.clone(),
                status: display_status(&self.overrides, s),
            })
            .collect()
    }
}

/// [`ClientState`] shared between the socket handler and whoever renders it.
///
/// Every mutation happens under one write lock, so readers never see an override
/// without the matching list patch.
#[derive(Clone, Default)]
pub struct ClientStore {
    inner: Arc<RwLock<ClientState>>,
}

impl ClientStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&self, event: &StatusChangeEvent) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .apply(event);
    }

    pub fn replace_sensors(&self, sensors: Vec<Sensor>) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace_sensors(sensors);
    }

    pub fn snapshot(&self) -> ClientState {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn rows(&self) -> Vec<SensorRow> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .rows()
    }
}
