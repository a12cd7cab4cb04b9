//! Long-lived push connection held by a client view.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::models::{PushMessage, StatusChangeEvent};

type PushStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One push connection with a single status handler.
///
/// The handler is never called once [`teardown`](Self::teardown) has started, even
/// for frames that were already read off the socket. Dropping the connection tears
/// it down. Reconnecting is left to the owner: mount a new connection.
pub struct StatusConnection {
    mounted: Arc<AtomicBool>,
    torn_down: bool,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl StatusConnection {
    /// Connect to `url` and start delivering status updates to `handler`.
    pub async fn mount<F>(url: &str, handler: F) -> Result<Self>
    where
        F: FnMut(StatusChangeEvent) + Send + 'static,
    {
        let (ws, _) = connect_async(url)
            .await
            .with_context(|| format!("connecting to push channel {}", url))?;
        info!("Connected to push channel {}", url);

        let mounted = Arc::new(AtomicBool::new(true));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run_session(ws, Arc::clone(&mounted), shutdown_rx, handler));

        Ok(Self {
            mounted,
            torn_down: false,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }

    /// Whether the handler may still be invoked.
    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    /// Whether the socket task has ended (teardown or transport loss).
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Stop delivery and close the socket. Only the first call does anything.
    pub fn teardown(&mut self) -> bool {
        if self.torn_down {
            return false;
        }
        self.torn_down = true;
        self.mounted.store(false, Ordering::SeqCst);
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        debug!("Push connection teardown started");
        true
    }

    /// Wait until the socket task has finished.
    pub async fn closed(&mut self) {
        if let Some(task) = self.task.as_mut() {
            let _ = task.await;
            self.task = None;
        }
    }
}

impl Drop for StatusConnection {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn run_session<F>(
    mut ws: PushStream,
    mounted: Arc<AtomicBool>,
    mut shutdown: oneshot::Receiver<()>,
    mut handler: F,
) where
    F: FnMut(StatusChangeEvent) + Send + 'static,
{
    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                let _ = ws.close(None).await;
                debug!("Push connection closed");
                break;
            }
            msg = ws.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        dispatch_frame(&text, &mounted, &mut handler);
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Push channel closed by server");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("Push channel error: {}", e);
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

/// Hand a text frame to `handler` if it is a valid status update and the
/// connection is still mounted. Returns whether the handler ran.
fn dispatch_frame<F>(text: &str, mounted: &AtomicBool, handler: &mut F) -> bool
where
    F: FnMut(StatusChangeEvent),
{
    if !mounted.load(Ordering::SeqCst) {
        return false;
    }
    match PushMessage::parse(text) {
        Ok(PushMessage::StatusUpdate(event)) => {
            // teardown may have started while the frame was parsed
            if !mounted.load(Ordering::SeqCst) {
                return false;
            }
            debug!("Received status update: {} -> {}", event.id, event.current_status);
            handler(event);
            true
        }
        Ok(PushMessage::Pong) => false,
        Err(e) => {
            warn!("Dropping push frame: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SensorStatus;
    use futures_util::SinkExt;
    use std::time::Duration;
    use tokio::net::TcpListener;

    const FRAME: &str = r#"{"event":"statusUpdate","data":{"id":1,"currentStatus":"ONLINE"}}"#;

    #[test]
    fn test_dispatch_valid_frame() {
        let mounted = AtomicBool::new(true);
        let mut seen = Vec::new();
        assert!(dispatch_frame(FRAME, &mounted, &mut |e| seen.push(e)));
        assert_eq!(
            seen,
            vec![StatusChangeEvent {
                id: 1,
                current_status: SensorStatus::Online
            }]
        );
    }

    #[test]
    fn test_dispatch_after_unmount_is_dropped() {
        let mounted = AtomicBool::new(false);
        let mut calls = 0;
        assert!(!dispatch_frame(FRAME, &mounted, &mut |_| calls += 1));
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_dispatch_malformed_frame_is_dropped() {
        let mounted = AtomicBool::new(true);
        let mut calls = 0;
        let bad = r#"{"event":"statusUpdate","data":{"id":1,"currentStatus":"MAYBE"}}"#;
        assert!(!dispatch_frame(bad, &mounted, &mut |_| calls += 1));
        assert!(!dispatch_frame(r#"{"event":"pong"}"#, &mounted, &mut |_| calls += 1));
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_unmount_from_another_thread_stops_delivery() {
        let mounted = std::sync::Arc::new(AtomicBool::new(true));
        let flag = mounted.clone();
        let unmount = std::thread::spawn(move || flag.store(false, Ordering::SeqCst));

        let mut calls = 0;
        while mounted.load(Ordering::SeqCst) {
            dispatch_frame(FRAME, &mounted, &mut |_| calls += 1);
        }
        unmount.join().unwrap();
        let before = calls;

        for _ in 0..100 {
            assert!(!dispatch_frame(FRAME, &mounted, &mut |_| calls += 1));
        }
        assert_eq!(calls, before);
    }

    /// Accept one websocket client and forward frames from the returned sender.
    async fn push_server() -> (String, tokio::sync::mpsc::UnboundedSender<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(frame) = rx.recv().await {
                if ws.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
        });

        (format!("ws://{}", addr), tx)
    }

    #[tokio::test]
    async fn test_teardown_once_and_no_delivery_afterwards() {
        let (url, push) = push_server().await;
        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut conn = StatusConnection::mount(&url, move |e| {
            let _ = seen_tx.send(e);
        })
        .await
        .unwrap();

        push.send(FRAME.to_string()).unwrap();
        let first = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
            .await
            .unwrap();
        assert!(first.is_some());

        assert!(conn.teardown());
        assert!(!conn.teardown());
        assert!(!conn.is_mounted());

        let _ = push.send(FRAME.to_string());
        conn.closed().await;
        assert!(conn.is_finished());

        // handler was dropped with the session task without seeing the second frame
        assert!(seen_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_server_close_ends_session() {
        let (url, push) = push_server().await;
        let mut conn = StatusConnection::mount(&url, |_| {}).await.unwrap();

        drop(push);
        tokio::time::timeout(Duration::from_secs(5), conn.closed())
            .await
            .unwrap();
        assert!(conn.is_finished());
        // still counts as the one teardown
        assert!(conn.teardown());
    }

    #[tokio::test]
    async fn test_mount_fails_without_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = StatusConnection::mount(&format!("ws://{}", addr), |_| {}).await;
        assert!(result.is_err());
    }
}
