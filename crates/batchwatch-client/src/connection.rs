use crate::config::ReconnectPolicy;
use batchwatch_core::wire::{self, ServerEvent};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

pub type EventReceiver = mpsc::UnboundedReceiver<ServerEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Reconnect attempts are exhausted; only an explicit `connect` resumes.
    GaveUp,
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("websocket connect failed: {0}")]
    Transport(String),
}

/// One logical connection to the processing service: decodes inbound frames,
/// fans them out to registered listeners, captures the session identity, and
/// self-heals with exponential backoff. Constructed and owned explicitly by
/// the composition root; `disconnect` tears down listeners and must not be
/// called by feature code.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    ws_url: Url,
    policy: ReconnectPolicy,
    state_tx: watch::Sender<ConnectionState>,
    listeners: Mutex<HashMap<String, mpsc::UnboundedSender<ServerEvent>>>,
    session: Mutex<Option<String>>,
    attempts: AtomicU32,
    // Bumped on every successful open and on explicit disconnect; read loops
    // from a previous epoch drop their frames and never schedule reconnects.
    epoch: AtomicU64,
    writer: AsyncMutex<Option<WsSink>>,
    reconnect_timer: Mutex<Option<JoinHandle<()>>>,
    connect_gate: AsyncMutex<()>,
}

impl ConnectionManager {
    pub fn new(ws_url: Url, policy: ReconnectPolicy) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                ws_url,
                policy,
                state_tx,
                listeners: Mutex::new(HashMap::new()),
                session: Mutex::new(None),
                attempts: AtomicU32::new(0),
                epoch: AtomicU64::new(0),
                writer: AsyncMutex::new(None),
                reconnect_timer: Mutex::new(None),
                connect_gate: AsyncMutex::new(()),
            }),
        }
    }

    /// Idempotent: resolves immediately when connected or while another
    /// attempt is in flight. A transport failure leaves the manager
    /// disconnected and is returned to the caller; explicit attempts do not
    /// schedule reconnects.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        if self.is_connected() {
            return Ok(());
        }
        let _gate = match self.inner.connect_gate.try_lock() {
            Ok(gate) => gate,
            Err(_) => return Ok(()),
        };
        self.inner.cancel_reconnect_timer();
        open_transport(&self.inner).await
    }

    /// Registers a listener under `key`, returning its event stream.
    /// Re-registering a key replaces the previous channel, so each key sees
    /// an event at most once per emission.
    pub fn add_listener(&self, key: impl Into<String>) -> EventReceiver {
        let key = key.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut listeners = self.inner.listeners.lock().unwrap();
        if listeners.insert(key.clone(), tx).is_some() {
            debug!(event = "listener_replaced", key = %key);
        }
        rx
    }

    /// Safe to call for keys that were never added or already removed.
    pub fn remove_listener(&self, key: &str) {
        self.inner.listeners.lock().unwrap().remove(key);
    }

    /// Serializes and transmits `payload` when connected. Returns `false`
    /// (and logs) otherwise; nothing is queued for later delivery.
    pub async fn send<T: Serialize>(&self, payload: &T) -> bool {
        if !self.is_connected() {
            warn!(event = "send_while_disconnected", url = %self.inner.ws_url);
            return false;
        }
        let text = match serde_json::to_string(payload) {
            Ok(text) => text,
            Err(err) => {
                warn!(event = "send_encode_error", error = %err);
                return false;
            }
        };
        let mut writer = self.inner.writer.lock().await;
        match writer.as_mut() {
            Some(sink) => match sink.send(Message::Text(text)).await {
                Ok(()) => true,
                Err(err) => {
                    warn!(event = "send_error", error = %err);
                    false
                }
            },
            None => {
                warn!(event = "send_while_disconnected", url = %self.inner.ws_url);
                false
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Connection-state changes are pushed here; no polling required.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// The identity captured from the first `identity` frame of the current
    /// connection epoch; `None` before the handshake or after a disconnect.
    pub fn session_id(&self) -> Option<String> {
        self.inner.session.lock().unwrap().clone()
    }

    /// Full teardown: cancels any pending reconnect, closes the transport,
    /// clears every listener and the session identity, and resets the
    /// attempt counter. Composition-root only.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.cancel_reconnect_timer();
        inner.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(mut sink) = inner.writer.lock().await.take() {
            let _ = sink.close().await;
        }
        inner.listeners.lock().unwrap().clear();
        inner.session.lock().unwrap().take();
        inner.attempts.store(0, Ordering::SeqCst);
        inner.set_state(ConnectionState::Disconnected);
        info!(event = "disconnected", url = %inner.ws_url);
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        if *self.state_tx.borrow() != state {
            self.state_tx.send_replace(state);
        }
    }

    fn is_connected(&self) -> bool {
        *self.state_tx.borrow() == ConnectionState::Connected
    }

    fn cancel_reconnect_timer(&self) {
        if let Some(handle) = self.reconnect_timer.lock().unwrap().take() {
            handle.abort();
        }
    }

    fn capture_identity(&self, session_id: &str) {
        let mut session = self.session.lock().unwrap();
        match session.as_deref() {
            None => {
                info!(event = "session_identity", session_id = %session_id);
                *session = Some(session_id.to_string());
            }
            Some(current) if current != session_id => {
                warn!(
                    event = "session_identity_ignored",
                    current = %current,
                    offered = %session_id
                );
            }
            Some(_) => {}
        }
    }

    fn dispatch(&self, event: ServerEvent) {
        let mut dead = Vec::new();
        let mut listeners = self.listeners.lock().unwrap();
        for (key, sender) in listeners.iter() {
            if sender.send(event.clone()).is_err() {
                dead.push(key.clone());
            }
        }
        for key in dead {
            listeners.remove(&key);
            debug!(event = "listener_gone", key = %key);
        }
    }
}

async fn open_transport(inner: &Arc<Inner>) -> Result<(), ConnectError> {
    if inner.is_connected() {
        return Ok(());
    }
    inner.set_state(ConnectionState::Connecting);
    info!(event = "connecting", url = %inner.ws_url);
    match connect_async(inner.ws_url.clone()).await {
        Ok((socket, _response)) => {
            let (sink, stream) = socket.split();
            *inner.writer.lock().await = Some(sink);
            inner.attempts.store(0, Ordering::SeqCst);
            let epoch = inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            inner.set_state(ConnectionState::Connected);
            info!(event = "connected", url = %inner.ws_url, epoch);
            let task_inner = Arc::clone(inner);
            tokio::spawn(async move {
                read_loop(task_inner, stream, epoch).await;
            });
            Ok(())
        }
        Err(err) => {
            inner.set_state(ConnectionState::Disconnected);
            warn!(event = "connect_error", url = %inner.ws_url, error = %err);
            Err(ConnectError::Transport(err.to_string()))
        }
    }
}

async fn read_loop(inner: Arc<Inner>, mut stream: WsStream, epoch: u64) {
    while let Some(result) = stream.next().await {
        if inner.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        match result {
            Ok(Message::Text(text)) => match wire::decode_event(&text) {
                Ok(event) => {
                    if let ServerEvent::Identity(frame) = &event {
                        inner.capture_identity(&frame.session_id);
                    }
                    inner.dispatch(event);
                }
                // Malformed frames are dropped; the stream keeps going.
                Err(err) => warn!(event = "frame_dropped", error = %err),
            },
            Ok(Message::Close(_)) => {
                info!(event = "server_close", url = %inner.ws_url);
                break;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(event = "read_error", error = %err);
                break;
            }
        }
    }
    connection_lost(&inner, epoch).await;
}

async fn connection_lost(inner: &Arc<Inner>, epoch: u64) {
    if inner.epoch.load(Ordering::SeqCst) != epoch {
        return;
    }
    inner.writer.lock().await.take();
    inner.session.lock().unwrap().take();
    inner.set_state(ConnectionState::Disconnected);
    schedule_reconnect(inner);
}

fn schedule_reconnect(inner: &Arc<Inner>) {
    let attempts = inner.attempts.load(Ordering::SeqCst);
    if attempts >= inner.policy.max_attempts {
        warn!(event = "reconnect_exhausted", attempts, url = %inner.ws_url);
        inner.set_state(ConnectionState::GaveUp);
        return;
    }
    let delay = inner.policy.delay_for(attempts);
    inner.attempts.store(attempts + 1, Ordering::SeqCst);
    info!(
        event = "reconnect_scheduled",
        attempt = attempts + 1,
        max_attempts = inner.policy.max_attempts,
        delay_ms = delay.as_millis() as u64
    );
    let task_inner = Arc::clone(inner);
    let handle = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if task_inner.is_connected() {
            return;
        }
        let gate = match task_inner.connect_gate.try_lock() {
            Ok(gate) => gate,
            Err(_) => return,
        };
        let failed = open_transport(&task_inner).await.is_err();
        drop(gate);
        if failed {
            schedule_reconnect(&task_inner);
        }
    });
    // At most one pending timer; a newer schedule supersedes the old one.
    let mut slot = inner.reconnect_timer.lock().unwrap();
    if let Some(previous) = slot.replace(handle) {
        previous.abort();
    }
}
