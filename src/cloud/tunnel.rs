use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::commands::CommandHandler;
use super::protocol::{FrameKind, TunnelMessage};
use super::provision::{load_credentials, provision, save_credentials, DeviceCredentials};
use super::shadow::ShadowManager;
use crate::bus::{MessageBus, Topic};
use crate::error::{Result, RuntimeError};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub ws_url: String,
    pub api_base: String,
    pub device_id: Option<String>,
    pub api_key: Option<String>,
    pub provisioning_code: Option<String>,
    pub credentials_path: PathBuf,
    pub version: String,
    pub heartbeat_interval: Duration,
    pub auth_timeout: Duration,
    pub max_reconnect_attempts: u32,
    pub shadow_sync_interval: Duration,
}

impl TunnelConfig {
    pub fn new(ws_url: String, api_base: String, credentials_path: PathBuf) -> Self {
        TunnelConfig {
            ws_url,
            api_base,
            device_id: None,
            api_key: None,
            provisioning_code: None,
            credentials_path,
            version: env!("CARGO_PKG_VERSION").to_string(),
            heartbeat_interval: Duration::from_secs(30),
            auth_timeout: Duration::from_secs(10),
            max_reconnect_attempts: 5,
            shadow_sync_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    BackingOff,
    Stopped,
}

enum SessionEnd {
    /// `stop()` was requested; a close frame went out, no reconnect.
    Stopped,
    /// The server ended the session; reconnect with a fresh attempt count.
    Disconnected(&'static str),
}

/// Persistent bidirectional link to the control plane.
///
/// A single driver task walks the connection state machine: provision if
/// needed, connect, authenticate, then serve reads, heartbeats, outbound
/// commands, and periodic shadow sync until the connection drops. Backoff
/// between attempts is `attempt * 5s` capped at 60s; the attempt counter
/// caps at `max_reconnect_attempts`, after which one terminal error event
/// is published and the tunnel stays down.
pub struct CloudTunnel {
    config: TunnelConfig,
    handler: Arc<CommandHandler>,
    shadow: Arc<ShadowManager>,
    bus: Arc<MessageBus>,
    http: reqwest::Client,
    state: RwLock<TunnelState>,
    pending: Mutex<HashMap<String, oneshot::Sender<TunnelMessage>>>,
    outbound_tx: mpsc::Sender<TunnelMessage>,
    outbound_rx: Mutex<Option<mpsc::Receiver<TunnelMessage>>>,
    cancel: CancellationToken,
    driver: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl CloudTunnel {
    pub fn new(
        config: TunnelConfig,
        handler: Arc<CommandHandler>,
        shadow: Arc<ShadowManager>,
        bus: Arc<MessageBus>,
    ) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        Arc::new(CloudTunnel {
            config,
            handler,
            shadow,
            bus,
            http: reqwest::Client::new(),
            state: RwLock::new(TunnelState::Disconnected),
            pending: Mutex::new(HashMap::new()),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            cancel: CancellationToken::new(),
            driver: std::sync::Mutex::new(None),
        })
    }

    pub fn state(&self) -> TunnelState {
        *self.state.read().expect("tunnel state poisoned")
    }

    fn set_state(&self, state: TunnelState) {
        *self.state.write().expect("tunnel state poisoned") = state;
    }

    pub fn start(self: &Arc<Self>) {
        let mut driver = self.driver.lock().expect("tunnel state poisoned");
        if driver.is_some() {
            return;
        }
        let tunnel = self.clone();
        *driver = Some(tokio::spawn(async move { tunnel.run().await }));
    }

    /// Graceful shutdown: close frame, no reconnection, no further
    /// outbound frames.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.driver.lock().expect("tunnel state poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.set_state(TunnelState::Stopped);
    }

    /// Send a command to the control plane and wait for the correlated
    /// response.
    pub async fn send_command(
        &self,
        action: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<TunnelMessage> {
        if self.state() != TunnelState::Connected {
            return Err(RuntimeError::Resource("tunnel not connected".into()));
        }
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        let frame = TunnelMessage::command(&id, action, payload);
        if self.outbound_tx.send(frame).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(RuntimeError::Resource("tunnel send failed".into()));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(RuntimeError::Resource("connection lost".into())),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(RuntimeError::CommandTimeout { id })
            }
        }
    }

    async fn run(self: Arc<Self>) {
        let Some(mut outbound_rx) = self.outbound_rx.lock().await.take() else {
            tracing::warn!("tunnel driver already consumed, refusing to run twice");
            return;
        };
        let mut attempt: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.set_state(TunnelState::Connecting);

            match self.connect_and_serve(&mut outbound_rx).await {
                Ok(SessionEnd::Stopped) => {
                    self.set_state(TunnelState::Stopped);
                    return;
                }
                Ok(SessionEnd::Disconnected(reason)) => {
                    tracing::info!(reason, "tunnel disconnected");
                    attempt = 0;
                }
                Err(RuntimeError::NotProvisioned) => {
                    tracing::error!("tunnel has no credentials and no provisioning code");
                    self.publish_terminal_error("not provisioned");
                    self.set_state(TunnelState::Stopped);
                    return;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "tunnel connection failed");
                }
            }

            // Waiters from the dead connection never resolve.
            self.pending.lock().await.clear();

            if self.cancel.is_cancelled() {
                break;
            }
            attempt += 1;
            if attempt > self.config.max_reconnect_attempts {
                tracing::error!(attempts = attempt - 1, "tunnel reconnect attempts exhausted");
                self.publish_terminal_error("reconnect attempts exhausted");
                self.set_state(TunnelState::Disconnected);
                return;
            }

            self.set_state(TunnelState::BackingOff);
            let delay = Duration::from_secs((attempt as u64 * 5).min(60));
            tracing::info!(attempt, delay_secs = delay.as_secs(), "tunnel backing off");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => break,
            }
        }
        self.set_state(TunnelState::Stopped);
    }

    async fn credentials(&self) -> Result<DeviceCredentials> {
        if let (Some(device_id), Some(api_key)) =
            (self.config.device_id.clone(), self.config.api_key.clone())
        {
            return Ok(DeviceCredentials { device_id, api_key });
        }
        if let Some(creds) = load_credentials(&self.config.credentials_path) {
            return Ok(creds);
        }
        if let Some(code) = &self.config.provisioning_code {
            let creds = provision(&self.http, &self.config.api_base, code).await?;
            save_credentials(&self.config.credentials_path, &creds)?;
            tracing::info!(device_id = %creds.device_id, "device provisioned");
            return Ok(creds);
        }
        Err(RuntimeError::NotProvisioned)
    }

    async fn connect_and_serve(
        &self,
        outbound_rx: &mut mpsc::Receiver<TunnelMessage>,
    ) -> Result<SessionEnd> {
        let creds = self.credentials().await?;
        self.shadow.set_identity(&creds.device_id, &creds.api_key);

        let (ws, _) = connect_async(self.config.ws_url.as_str())
            .await
            .map_err(|e| RuntimeError::Resource(format!("tunnel connect: {e}")))?;
        let (mut write, mut read) = ws.split();

        self.set_state(TunnelState::Authenticating);
        let hello =
            TunnelMessage::connect(&creds.device_id, &creds.api_key, &self.config.version);
        send_frame(&mut write, &hello).await?;

        let reply = tokio::time::timeout(self.config.auth_timeout, next_frame(&mut read))
            .await
            .map_err(|_| {
                RuntimeError::AuthenticationFailed("no reply within deadline".into())
            })??;
        match reply {
            Some(frame) if frame.kind == FrameKind::Connected => {}
            Some(frame) => {
                return Err(RuntimeError::AuthenticationFailed(format!(
                    "unexpected reply: {:?}",
                    frame.kind
                )));
            }
            None => {
                return Err(RuntimeError::AuthenticationFailed(
                    "closed during authentication".into(),
                ));
            }
        }

        self.set_state(TunnelState::Connected);
        tracing::info!(device_id = %creds.device_id, "tunnel connected");

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        heartbeat.tick().await;
        let mut shadow_sync = tokio::time::interval(self.config.shadow_sync_interval);
        shadow_sync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        shadow_sync.tick().await;

        loop {
            tokio::select! {
                incoming = read.next() => match incoming {
                    None => return Ok(SessionEnd::Disconnected("stream ended")),
                    Some(Err(e)) => {
                        return Err(RuntimeError::Resource(format!("tunnel read: {e}")));
                    }
                    Some(Ok(message)) => {
                        if !self.handle_ws_message(message, &mut write).await? {
                            return Ok(SessionEnd::Disconnected("close frame"));
                        }
                    }
                },
                _ = heartbeat.tick() => {
                    send_frame(&mut write, &TunnelMessage::ping()).await?;
                }
                _ = shadow_sync.tick() => {
                    if let Err(e) = self.shadow.fetch().await {
                        tracing::warn!(error = %e, "periodic shadow sync failed");
                    }
                }
                frame = outbound_rx.recv() => {
                    if let Some(frame) = frame {
                        send_frame(&mut write, &frame).await?;
                    }
                }
                _ = self.cancel.cancelled() => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    return Ok(SessionEnd::Stopped);
                }
            }
        }
    }

    /// Returns false when the server closed the socket.
    async fn handle_ws_message(&self, message: WsMessage, write: &mut WsSink) -> Result<bool> {
        match message {
            WsMessage::Text(text) => {
                let frame = match TunnelMessage::decode(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping undecodable tunnel frame");
                        return Ok(true);
                    }
                };
                match frame.kind {
                    FrameKind::Command => self.dispatch_command(frame),
                    FrameKind::Response => {
                        if let Some(id) = &frame.id {
                            if let Some(waiter) = self.pending.lock().await.remove(id) {
                                let _ = waiter.send(frame);
                            } else {
                                tracing::debug!(id = %id, "response with no waiter");
                            }
                        }
                    }
                    FrameKind::Ping => {
                        send_frame(write, &TunnelMessage::pong()).await?;
                    }
                    FrameKind::Pong => {}
                    other => {
                        tracing::debug!(kind = ?other, "dropping unexpected tunnel frame");
                    }
                }
                Ok(true)
            }
            WsMessage::Ping(data) => {
                write
                    .send(WsMessage::Pong(data))
                    .await
                    .map_err(|e| RuntimeError::Resource(format!("tunnel pong: {e}")))?;
                Ok(true)
            }
            WsMessage::Close(_) => Ok(false),
            _ => Ok(true),
        }
    }

    /// Commands run off the read loop so a slow handler never stalls
    /// heartbeats.
    fn dispatch_command(&self, frame: TunnelMessage) {
        let Some(id) = frame.id.clone() else {
            tracing::warn!("command frame without id dropped");
            return;
        };
        let action = frame.action.clone().unwrap_or_default();
        let payload = frame.payload.clone().unwrap_or(Value::Null);
        let handler = self.handler.clone();
        let outbound = self.outbound_tx.clone();
        tokio::spawn(async move {
            let response = match handler.handle(&action, &payload).await {
                Ok(data) => TunnelMessage::response_success(&id, data),
                Err(e) => TunnelMessage::response_error(&id, &e.to_string()),
            };
            if outbound.send(response).await.is_err() {
                tracing::debug!(id = %id, "connection gone before response could be sent");
            }
        });
    }

    fn publish_terminal_error(&self, reason: &str) {
        self.bus.publish(
            Topic::Log,
            json!({
                "level": "error",
                "source": "tunnel",
                "message": format!("tunnel terminated: {reason}"),
            }),
        );
    }
}

async fn send_frame(write: &mut WsSink, frame: &TunnelMessage) -> Result<()> {
    write
        .send(WsMessage::Text(frame.encode().into()))
        .await
        .map_err(|e| RuntimeError::Resource(format!("tunnel send: {e}")))
}

async fn next_frame(read: &mut WsSource) -> Result<Option<TunnelMessage>> {
    while let Some(message) = read.next().await {
        let message = message.map_err(|e| RuntimeError::Resource(format!("tunnel read: {e}")))?;
        match message {
            WsMessage::Text(text) => {
                return TunnelMessage::decode(&text)
                    .map(Some)
                    .map_err(|e| RuntimeError::Resource(format!("bad frame: {e}")));
            }
            WsMessage::Close(_) => return Ok(None),
            _ => continue,
        }
    }
    Ok(None)
}
