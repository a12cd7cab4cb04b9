//! REST endpoints and the WebSocket push channel.

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::SensorError;
use crate::events::{EventBus, SENSOR_STATUS_UPDATE};
use crate::gateway::{ClientConnection, ConnectionInfo, Gateway};
use crate::models::{CreateSensor, PushMessage, Sensor, SensorId, UpdateSensor};
use crate::service::SensorService;
use crate::storage::Storage;

/// Application state for web server.
#[derive(Clone)]
pub struct AppState {
    pub service: SensorService,
    pub gateway: Gateway,
    pub bus: EventBus,
    pub started_at: DateTime<Utc>,
    /// Browser origin allowed on both REST and the push channel.
    pub allowed_origin: HeaderValue,
}

impl AppState {
    /// Wire storage, bus and gateway together.
    pub async fn new(storage: Storage, allowed_origin: &str) -> Result<Self> {
        let allowed_origin: HeaderValue = allowed_origin.parse()?;
        let bus = EventBus::new();
        let gateway = Gateway::new();
        bus.subscribe(SENSOR_STATUS_UPDATE, Arc::new(gateway.clone()))
            .await;

        Ok(Self {
            service: SensorService::new(storage, bus.clone()),
            gateway,
            bus,
            started_at: Utc::now(),
            allowed_origin,
        })
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: i64,
    pub database_ok: bool,
    pub online_sensors: i64,
    pub open_connections: usize,
    pub connections: Vec<ConnectionInfo>,
}

impl IntoResponse for SensorError {
    fn into_response(self) -> Response {
        let status = match &self {
            SensorError::NotFound(_) => StatusCode::NOT_FOUND,
            SensorError::Validation(_) => StatusCode::BAD_REQUEST,
            SensorError::Storage(_) | SensorError::Serialization(_) => {
                error!("Request failed: {}", self);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// Build the application router.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(state.allowed_origin.clone())
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
        ])
        .allow_headers([header::CONTENT_TYPE])
        .allow_credentials(true);

    Router::new()
        .route("/sensors", get(list_handler).post(create_handler))
        .route(
            "/sensors/:id",
            get(get_handler).patch(update_handler).delete(delete_handler),
        )
        .route("/health", get(health_handler))
        .route("/ws", get(websocket_handler))
        .with_state(state)
        .layer(cors)
}

/// Run the web server until ctrl-c.
pub async fn run_web_server(config: &Config) -> Result<()> {
    let storage = Storage::new(&config.db_path).await?;
    storage.initialize().await?;

    let state = AppState::new(storage, &config.allowed_origin).await?;
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.http_port).parse()?;
    info!("Web server listening on http://{}", addr);
    info!("Push channel at ws://{}/ws (origin {})", addr, config.allowed_origin);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;

    Ok(())
}

async fn create_handler(
    State(state): State<AppState>,
    Json(body): Json<CreateSensor>,
) -> Result<(StatusCode, Json<Sensor>), SensorError> {
    let sensor = state.service.create(body).await?;
    Ok((StatusCode::CREATED, Json(sensor)))
}

async fn list_handler(State(state): State<AppState>) -> Result<Json<Vec<Sensor>>, SensorError> {
    Ok(Json(state.service.find_all().await?))
}

async fn get_handler(
    State(state): State<AppState>,
    Path(id): Path<SensorId>,
) -> Result<Json<Sensor>, SensorError> {
    Ok(Json(state.service.find_one(id).await?))
}

async fn update_handler(
    State(state): State<AppState>,
    Path(id): Path<SensorId>,
    Json(body): Json<UpdateSensor>,
) -> Result<Json<Sensor>, SensorError> {
    Ok(Json(state.service.update(id, body).await?))
}

async fn delete_handler(
    State(state): State<AppState>,
    Path(id): Path<SensorId>,
) -> Result<Json<Sensor>, SensorError> {
    Ok(Json(state.service.remove(id).await?))
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let online = state.service.storage().count_online().await;

    Json(HealthResponse {
        status: if online.is_ok() { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: (Utc::now() - state.started_at).num_seconds(),
        database_ok: online.is_ok(),
        online_sensors: online.unwrap_or(0),
        open_connections: state.gateway.open_count().await,
        connections: state.gateway.connections().await,
    })
}

/// WebSocket upgrade handler.
///
/// CORS does not apply to upgrades, so a browser `Origin` is checked here.
/// Requests without one (native clients) are let through.
async fn websocket_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    if let Some(origin) = headers.get(header::ORIGIN) {
        if origin != state.allowed_origin {
            warn!("Rejected push connection from origin {:?}", origin);
            return (
                StatusCode::FORBIDDEN,
                Json(serde_json::json!({ "error": "origin not allowed" })),
            )
                .into_response();
        }
    }

    ws.on_upgrade(|socket| handle_websocket(socket, state.gateway))
}

/// Handle one push connection for its whole lifetime.
async fn handle_websocket(socket: WebSocket, gateway: Gateway) {
    let (mut sender, mut receiver) = socket.split();

    let ClientConnection { id, mut outbound } = gateway.on_connect().await;
    gateway.mark_open(id).await;

    loop {
        tokio::select! {
            // Broadcast frames to client
            frame = outbound.recv() => {
                match frame {
                    Some(text) => {
                        if sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            // Handle incoming messages from client
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(cmd) = serde_json::from_str::<serde_json::Value>(&text) {
                            let action = cmd.get("action").and_then(|v| v.as_str()).unwrap_or("");
                            if action == "ping" {
                                if let Ok(pong) = PushMessage::Pong.to_json() {
                                    let _ = sender.send(Message::Text(pong)).await;
                                }
                            } else {
                                debug!("Ignoring client action '{}' from {}", action, id);
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sender.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!("WebSocket error on {}: {}", id, e);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    gateway.on_disconnect(id).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientStore, SensorApiClient, StatusConnection};
    use crate::events::{DomainEvent, EventSubscriber};
    use crate::models::{SensorStatus, StatusChangeEvent};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_tungstenite::{connect_async, tungstenite};

    const ORIGIN: &str = "http://localhost:3000";

    async fn spawn_app() -> (SocketAddr, AppState) {
        let storage = Storage::in_memory().await.unwrap();
        let state = AppState::new(storage, ORIGIN).await.unwrap();
        let app = build_router(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, state)
    }

    async fn wait_for_open(gateway: &Gateway, count: usize) {
        for _ in 0..200 {
            if gateway.open_count().await >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} open connections", count);
    }

    async fn next_push<S>(ws: &mut S) -> PushMessage
    where
        S: futures_util::Stream<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for push frame")
                .expect("stream ended")
                .unwrap();
            if let tungstenite::Message::Text(text) = msg {
                return PushMessage::parse(&text).unwrap();
            }
        }
    }

    fn s1() -> CreateSensor {
        CreateSensor {
            name: "S1".to_string(),
            serial_number: "SN1".to_string(),
            firmware_version: "1.0".to_string(),
            current_status: SensorStatus::Offline,
        }
    }

    #[derive(Default)]
    struct Counter {
        events: Mutex<Vec<StatusChangeEvent>>,
    }

    #[async_trait]
    impl EventSubscriber for Counter {
        fn label(&self) -> &str {
            "counter"
        }

        async fn handle(&self, event: &DomainEvent) -> anyhow::Result<()> {
            let DomainEvent::SensorStatusUpdated(e) = event;
            self.events.lock().unwrap().push(*e);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_router_patch_status_without_network() {
        use axum::body::Body;
        use axum::http::Request;
        use tower::ServiceExt;

        let storage = Storage::in_memory().await.unwrap();
        let state = AppState::new(storage, ORIGIN).await.unwrap();
        let sensor = state.service.create(s1()).await.unwrap();
        let app = build_router(state.clone());

        let mut conn = state.gateway.on_connect().await;
        state.gateway.mark_open(conn.id).await;

        let request = Request::builder()
            .method("PATCH")
            .uri(format!("/sensors/{}", sensor.id))
            .header("content-type", "application/json")
            .body(Body::from(r#"{"currentStatus":"ONLINE"}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let updated: Sensor = serde_json::from_slice(&body).unwrap();
        assert_eq!(updated.current_status, SensorStatus::Online);

        let frame = conn.outbound.try_recv().unwrap();
        assert_eq!(
            PushMessage::parse(&frame).unwrap(),
            PushMessage::StatusUpdate(StatusChangeEvent {
                id: sensor.id,
                current_status: SensorStatus::Online,
            })
        );
        assert!(conn.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rest_crud() {
        let (addr, _) = spawn_app().await;
        let http = reqwest::Client::new();
        let base = format!("http://{}", addr);

        let resp = http
            .post(format!("{}/sensors", base))
            .json(&serde_json::json!({
                "name": "S1", "serialNumber": "SN1", "firmwareVersion": "1.0"
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::CREATED);
        let created: Sensor = resp.json().await.unwrap();
        assert_eq!(created.current_status, SensorStatus::Offline);

        let list: Vec<Sensor> = http
            .get(format!("{}/sensors", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(list, vec![created.clone()]);

        let patched: Sensor = http
            .patch(format!("{}/sensors/{}", base, created.id))
            .json(&serde_json::json!({ "firmwareVersion": "2.0" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(patched.firmware_version, "2.0");

        let resp = http
            .delete(format!("{}/sensors/{}", base, created.id))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);

        let resp = http
            .get(format!("{}/sensors/{}", base, created.id))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_update_missing_is_404_and_silent() {
        let (addr, state) = spawn_app().await;
        let counter = Arc::new(Counter::default());
        state.bus.subscribe(SENSOR_STATUS_UPDATE, counter.clone()).await;

        let resp = reqwest::Client::new()
            .patch(format!("http://{}/sensors/999", addr))
            .json(&serde_json::json!({ "currentStatus": "ONLINE" }))
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "sensor 999 not found");
        assert!(counter.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_blank_name_is_400() {
        let (addr, _) = spawn_app().await;
        let resp = reqwest::Client::new()
            .post(format!("http://{}/sensors", addr))
            .json(&serde_json::json!({
                "name": "", "serialNumber": "SN1", "firmwareVersion": "1.0"
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_cors_allows_configured_origin() {
        let (addr, _) = spawn_app().await;
        let resp = reqwest::Client::new()
            .get(format!("http://{}/sensors", addr))
            .header("Origin", ORIGIN)
            .send()
            .await
            .unwrap();

        assert_eq!(
            resp.headers()
                .get("access-control-allow-origin")
                .and_then(|v| v.to_str().ok()),
            Some(ORIGIN)
        );
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let (addr, state) = spawn_app().await;
        let (mut ws, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
        wait_for_open(&state.gateway, 1).await;

        ws.send(tungstenite::Message::Text(r#"{"action":"ping"}"#.to_string()))
            .await
            .unwrap();
        assert_eq!(next_push(&mut ws).await, PushMessage::Pong);
    }

    fn ws_request_from(addr: SocketAddr, origin: &str) -> tungstenite::handshake::client::Request {
        use tungstenite::client::IntoClientRequest;

        let mut request = format!("ws://{}/ws", addr).into_client_request().unwrap();
        request
            .headers_mut()
            .insert("origin", origin.parse().unwrap());
        request
    }

    #[tokio::test]
    async fn test_push_channel_rejects_foreign_origin() {
        let (addr, state) = spawn_app().await;

        let err = connect_async(ws_request_from(addr, "http://evil.example"))
            .await
            .unwrap_err();
        match err {
            tungstenite::Error::Http(response) => assert_eq!(response.status(), 403),
            other => panic!("expected HTTP rejection, got {:?}", other),
        }
        assert!(state.gateway.connections().await.is_empty());
    }

    #[tokio::test]
    async fn test_push_channel_accepts_configured_origin() {
        let (addr, state) = spawn_app().await;

        let (mut ws, _) = connect_async(ws_request_from(addr, ORIGIN)).await.unwrap();
        wait_for_open(&state.gateway, 1).await;

        ws.send(tungstenite::Message::Text(r#"{"action":"ping"}"#.to_string()))
            .await
            .unwrap();
        assert_eq!(next_push(&mut ws).await, PushMessage::Pong);
    }

    #[tokio::test]
    async fn test_disconnect_deregisters() {
        let (addr, state) = spawn_app().await;
        let (mut ws, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
        wait_for_open(&state.gateway, 1).await;

        ws.close(None).await.unwrap();
        for _ in 0..200 {
            if state.gateway.connections().await.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("connection was not deregistered");
    }

    #[tokio::test]
    async fn test_end_to_end_status_update() {
        let (addr, state) = spawn_app().await;
        let counter = Arc::new(Counter::default());
        state.bus.subscribe(SENSOR_STATUS_UPDATE, counter.clone()).await;

        let api = SensorApiClient::new(&format!("http://{}", addr));
        let sensor = api.create_sensor(&s1()).await.unwrap();

        let store = ClientStore::new();
        store.replace_sensors(api.list_sensors().await.unwrap());

        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
        let handler_store = store.clone();
        let mut conn = StatusConnection::mount(&format!("ws://{}/ws", addr), move |event| {
            handler_store.apply(&event);
            let _ = seen_tx.send(event);
        })
        .await
        .unwrap();
        wait_for_open(&state.gateway, 1).await;

        api.set_status(sensor.id, SensorStatus::Online).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let expected = StatusChangeEvent {
            id: sensor.id,
            current_status: SensorStatus::Online,
        };
        assert_eq!(received, expected);
        assert_eq!(*counter.events.lock().unwrap(), vec![expected]);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.sensors[0].current_status, SensorStatus::Online);
        assert_eq!(snapshot.display_status(sensor.id), Some(SensorStatus::Online));

        assert!(conn.teardown());
        conn.closed().await;
    }

    #[tokio::test]
    async fn test_two_clients_converge() {
        let (addr, state) = spawn_app().await;
        let api = SensorApiClient::new(&format!("http://{}", addr));
        let sensor = api.create_sensor(&s1()).await.unwrap();
        let other = api
            .create_sensor(&CreateSensor {
                name: "S2".to_string(),
                serial_number: "SN2".to_string(),
                ..s1()
            })
            .await
            .unwrap();

        let (mut a, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
        let (mut b, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
        wait_for_open(&state.gateway, 2).await;

        let initial = api.list_sensors().await.unwrap();
        let store_a = ClientStore::new();
        let store_b = ClientStore::new();
        store_a.replace_sensors(initial.clone());
        store_b.replace_sensors(initial);

        api.set_status(sensor.id, SensorStatus::Online).await.unwrap();

        for (ws, store) in [(&mut a, &store_a), (&mut b, &store_b)] {
            match next_push(ws).await {
                PushMessage::StatusUpdate(event) => store.apply(&event),
                other => panic!("unexpected frame {:?}", other),
            }
        }

        let state_a = store_a.snapshot();
        assert_eq!(state_a, store_b.snapshot());
        assert_eq!(state_a.display_status(sensor.id), Some(SensorStatus::Online));
        assert_eq!(state_a.display_status(other.id), Some(SensorStatus::Offline));
    }

    #[tokio::test]
    async fn test_health_reports_connections() {
        let (addr, state) = spawn_app().await;
        let (_ws, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
        wait_for_open(&state.gateway, 1).await;

        let health: serde_json::Value = reqwest::get(format!("http://{}/health", addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["open_connections"], 1);
        assert_eq!(health["database_ok"], true);
        assert_eq!(health["connections"][0]["state"], "open");
    }
}
