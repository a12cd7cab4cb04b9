//! REST client for the sensor API.

use anyhow::{bail, Context, Result};
use reqwest::{Response, StatusCode};
use std::time::Duration;

use crate::models::{CreateSensor, Sensor, SensorId, SensorStatus, UpdateSensor};

#[derive(Clone)]
pub struct SensorApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl SensorApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn list_sensors(&self) -> Result<Vec<Sensor>> {
        let resp = self
            .client
            .get(self.url("/sensors"))
            .send()
            .await
            .context("failed to fetch sensors")?;
        Ok(check(resp).await?.json().await?)
    }

    pub async fn get_sensor(&self, id: SensorId) -> Result<Sensor> {
        let resp = self.client.get(self.url(&format!("/sensors/{}", id))).send().await?;
        Ok(check(resp).await?.json().await?)
    }

    pub async fn create_sensor(&self, new: &CreateSensor) -> Result<Sensor> {
        let resp = self.client.post(self.url("/sensors")).json(new).send().await?;
        Ok(check(resp).await?.json().await?)
    }

    pub async fn update_sensor(&self, id: SensorId, update: &UpdateSensor) -> Result<Sensor> {
        let resp = self
            .client
            .patch(self.url(&format!("/sensors/{}", id)))
            .json(update)
            .send()
            .await?;
        Ok(check(resp).await?.json().await?)
    }

    pub async fn set_status(&self, id: SensorId, status: SensorStatus) -> Result<Sensor> {
        self.update_sensor(id, &UpdateSensor::status(status)).await
    }

    pub async fn delete_sensor(&self, id: SensorId) -> Result<Sensor> {
        let resp = self
            .client
            .delete(self.url(&format!("/sensors/{}", id)))
            .send()
            .await?;
        Ok(check(resp).await?.json().await?)
    }
}

/// Turn non-success responses into errors carrying the server's message.
async fn check(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let message = resp
        .json::<serde_json::Value>()
        .await
        .ok()
        .and_then(|body| body.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| status.to_string());

    match status {
        StatusCode::NOT_FOUND => bail!("not found: {}", message),
        StatusCode::BAD_REQUEST => bail!("rejected: {}", message),
        _ => bail!("server returned {}: {}", status, message),
    }
}
