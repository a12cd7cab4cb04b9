//! Errors raised on the sensor write path.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("sensor {0} not found")]
    NotFound(i64),

    #[error("invalid sensor data: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type SensorResult<T> = std::result::Result<T, SensorError>;
