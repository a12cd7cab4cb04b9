//! Data models for sensors and status propagation.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{SensorError, SensorResult};

/// Identifier assigned by storage when a sensor is created.
pub type SensorId = i64;

/// Connectivity status of a sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SensorStatus {
    Online,
    #[default]
    Offline,
}

impl SensorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorStatus::Online => "ONLINE",
            SensorStatus::Offline => "OFFLINE",
        }
    }
}

impl std::fmt::Display for SensorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensorStatus {
    type Err = SensorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ONLINE" => Ok(SensorStatus::Online),
            "OFFLINE" => Ok(SensorStatus::Offline),
            other => Err(SensorError::Validation(format!(
                "unknown status '{}', expected ONLINE or OFFLINE",
                other
            ))),
        }
    }
}

/// A persisted sensor record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sensor {
    pub id: SensorId,
    pub name: String,
    pub serial_number: String,
    pub firmware_version: String,
    pub current_status: SensorStatus,
}

/// Body of `POST /sensors`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSensor {
    pub name: String,
    pub serial_number: String,
    pub firmware_version: String,
    #[serde(default)]
    pub current_status: SensorStatus,
}

impl CreateSensor {
    /// Check that every required field is present and non-empty.
    pub fn validate(&self) -> SensorResult<()> {
        require_non_empty("name", &self.name)?;
        require_non_empty("serialNumber", &self.serial_number)?;
        require_non_empty("firmwareVersion", &self.firmware_version)?;
        Ok(())
    }
}

/// Body of `PATCH /sensors/:id`. Absent fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSensor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_status: Option<SensorStatus>,
}

impl UpdateSensor {
    pub fn status(status: SensorStatus) -> Self {
        Self {
            current_status: Some(status),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> SensorResult<()> {
        if let Some(name) = &self.name {
            require_non_empty("name", name)?;
        }
        if let Some(serial) = &self.serial_number {
            require_non_empty("serialNumber", serial)?;
        }
        if let Some(firmware) = &self.firmware_version {
            require_non_empty("firmwareVersion", firmware)?;
        }
        Ok(())
    }

    /// Merge this partial update over an existing record. The id never changes.
    pub fn apply_to(&self, sensor: &Sensor) -> Sensor {
        Sensor {
            id: sensor.id,
            name: self.name.clone().unwrap_or_else(|| sensor.name.clone()),
            serial_number: self
                .serial_number
                .clone()
                .unwrap_or_else(|| sensor.serial_number.clone()),
            firmware_version: self
                .firmware_version
                .clone()
                .unwrap_or_else(|| sensor.firmware_version.clone()),
            current_status: self.current_status.unwrap_or(sensor.current_status),
        }
    }
}

fn require_non_empty(field: &str, value: &str) -> SensorResult<()> {
    if value.trim().is_empty() {
        return Err(SensorError::Validation(format!("{} must not be empty", field)));
    }
    Ok(())
}

/// Raised when an update changes a sensor's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StatusChangeEvent {
    pub id: SensorId,
    pub current_status: SensorStatus,
}

/// Frames sent from the server over the push channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum PushMessage {
    #[serde(rename = "statusUpdate")]
    StatusUpdate(StatusChangeEvent),
    #[serde(rename = "pong")]
    Pong,
}

impl PushMessage {
    /// Parse a text frame, rejecting anything that doesn't match the schema.
    pub fn parse(text: &str) -> SensorResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| SensorError::Validation(format!("malformed push frame: {}", e)))
    }

    pub fn to_json(&self) -> SensorResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}
