//! SQLite storage layer for sensor persistence.

use anyhow::Result;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow},
    Row, Sqlite, Transaction,
};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{SensorError, SensorResult};
use crate::models::{CreateSensor, Sensor, SensorId, SensorStatus, UpdateSensor};

/// How long a writer waits for another writer's transaction to finish.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of a committed update.
#[derive(Debug, Clone)]
pub struct SensorUpdate {
    /// Status read at the start of the update transaction.
    pub previous_status: SensorStatus,
    /// The record as written.
    pub sensor: Sensor,
}

/// Storage manager for sensor data.
#[derive(Clone)]
pub struct Storage {
    pool: Arc<SqlitePool>,
}

impl Storage {
    /// Create a new storage instance.
    pub async fn new(db_path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("sqlite:{}", db_path.display());
        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Private in-memory database, schema already initialized.
    pub async fn in_memory() -> Result<Self> {
        // every pooled connection would get its own memory db, so pin to one
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let storage = Self {
            pool: Arc::new(pool),
        };
        storage.initialize().await?;
        Ok(storage)
    }

    /// Initialize the database schema.
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sensors (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                serial_number TEXT NOT NULL,
                firmware_version TEXT NOT NULL,
                current_status TEXT NOT NULL DEFAULT 'OFFLINE'
                    CHECK (current_status IN ('ONLINE', 'OFFLINE')),
                created_at TEXT DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&*self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sensors_status ON sensors(current_status)")
            .execute(&*self.pool)
            .await?;

        Ok(())
    }

    /// Insert a new sensor and return it with its assigned id.
    pub async fn insert_sensor(&self, new: &CreateSensor) -> SensorResult<Sensor> {
        let result = sqlx::query(
            r#"
            INSERT INTO sensors (name, serial_number, firmware_version, current_status)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&new.name)
        .bind(&new.serial_number)
        .bind(&new.firmware_version)
        .bind(new.current_status.as_str())
        .execute(&*self.pool)
        .await?;

        Ok(Sensor {
            id: result.last_insert_rowid(),
            name: new.name.clone(),
            serial_number: new.serial_number.clone(),
            firmware_version: new.firmware_version.clone(),
            current_status: new.current_status,
        })
    }

    /// All sensors, ordered by id.
    pub async fn list_sensors(&self) -> SensorResult<Vec<Sensor>> {
        let rows = sqlx::query("SELECT * FROM sensors ORDER BY id ASC")
            .fetch_all(&*self.pool)
            .await?;

        rows.iter().map(row_to_sensor).collect()
    }

    /// Get a single sensor by ID.
    pub async fn get_sensor(&self, id: SensorId) -> SensorResult<Option<Sensor>> {
        let row = sqlx::query("SELECT * FROM sensors WHERE id = ?")
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?;

        row.as_ref().map(row_to_sensor).transpose()
    }

    /// Apply a partial update inside one transaction.
    ///
    /// Returns `None` when the sensor does not exist. The returned previous status
    /// is the one read inside the same transaction as the write.
    pub async fn update_sensor(
        &self,
        id: SensorId,
        update: &UpdateSensor,
    ) -> SensorResult<Option<SensorUpdate>> {
        let mut tx = self.pool.begin().await?;

        let row = lock_and_fetch(&mut tx, id).await?;

        let current = match row {
            Some(r) => row_to_sensor(&r)?,
            None => return Ok(None),
        };

        let merged = update.apply_to(&current);

        sqlx::query(
            r#"
            UPDATE sensors SET
                name = ?,
                serial_number = ?,
                firmware_version = ?,
                current_status = ?,
                updated_at = CURRENT_TIMESTAMP
            WHERE id = ?
            "#,
        )
        .bind(&merged.name)
        .bind(&merged.serial_number)
        .bind(&merged.firmware_version)
        .bind(merged.current_status.as_str())
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(SensorUpdate {
            previous_status: current.current_status,
            sensor: merged,
        }))
    }

    /// Delete a sensor, returning the removed record.
    pub async fn delete_sensor(&self, id: SensorId) -> SensorResult<Option<Sensor>> {
        let mut tx = self.pool.begin().await?;

        let row = lock_and_fetch(&mut tx, id).await?;

        let sensor = match row {
            Some(r) => row_to_sensor(&r)?,
            None => return Ok(None),
        };

        sqlx::query("DELETE FROM sensors WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(Some(sensor))
    }

    /// Count sensors currently online.
    pub async fn count_online(&self) -> SensorResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS online FROM sensors WHERE current_status = 'ONLINE'")
            .fetch_one(&*self.pool)
            .await?;

        Ok(row.get::<i64, _>("online"))
    }
}

/// Take the write lock, then read the row.
///
/// A deferred transaction that reads first holds a shared lock and cannot be
/// upgraded while another writer is active, so the first statement is a no-op
/// write. Concurrent writers then queue on the busy timeout instead of failing.
async fn lock_and_fetch(
    tx: &mut Transaction<'_, Sqlite>,
    id: SensorId,
) -> SensorResult<Option<SqliteRow>> {
    sqlx::query("UPDATE sensors SET updated_at = updated_at WHERE id = ?")
        .bind(id)
        .execute(&mut **tx)
        .await?;

    let row = sqlx::query("SELECT * FROM sensors WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;

    Ok(row)
}

fn row_to_sensor(row: &SqliteRow) -> SensorResult<Sensor> {
    let status_str: String = row.try_get("current_status")?;
    let current_status = status_str.parse()?;

    Ok(Sensor {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        serial_number: row.try_get("serial_number")?,
        firmware_version: row.try_get("firmware_version")?,
        current_status,
    })
}
