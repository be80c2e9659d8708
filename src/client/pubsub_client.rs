//! Client connection handle
//!
//! `Client` wraps a `ClientState` behind a lock and drives one WebSocket
//! session at a time against an NT4 server. The handle is cheap to clone;
//! every clone talks to the same session.
//!
//! Lifecycle:
//! - `start` spawns the connect loop. Each session subscribes to every topic,
//!   emits `Connected`, and pumps frames until the socket closes.
//! - When a session ends the mirror, publications and subscriptions are
//!   dropped, `Disconnected` is emitted, and the loop retries after the
//!   configured delay. Only `disconnect` stops it.
//! - Outbound API calls fail with `NotConnected` while no session is open.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::spawn;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};
use tungstenite::client::IntoClientRequest;
use tungstenite::http::header::{HeaderValue, SEC_WEBSOCKET_PROTOCOL};
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use crate::broker::connection::{PubUid, SubUid};
use crate::client::state::{ClientEvent, ClientState, TopicInfo};
use crate::config::ClientSettings;
use crate::transport::frame::{FrameReader, ValueFrame, now_micros};
use crate::transport::message::{
    ClientMessage, Properties, ServerMessage, SubscribeOptions, decode_control_messages,
    encode_control_messages,
};
use crate::transport::value::Value;
use crate::transport::websocket::{SUBPROTOCOL_V40, SUBPROTOCOL_V41};
use crate::utils::error::{Nt4Error, Result};

/// Buffered notifications per `events()` receiver before it lags.
const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct Inner {
    state: ClientState,
    outbound: Option<mpsc::UnboundedSender<WsMessage>>,
}

impl Inner {
    fn sender(&self) -> Result<&mpsc::UnboundedSender<WsMessage>> {
        self.outbound.as_ref().ok_or(Nt4Error::NotConnected)
    }

    fn send_control(&self, message: ClientMessage) -> Result<()> {
        let text = encode_control_messages(&[message])?;
        self.sender()?
            .send(WsMessage::text(text))
            .map_err(|_| Nt4Error::NotConnected)
    }

    fn send_frame(&self, frame: &ValueFrame) -> Result<()> {
        let bytes = frame.encode()?;
        self.sender()?
            .send(WsMessage::binary(bytes))
            .map_err(|_| Nt4Error::NotConnected)
    }
}

#[derive(Debug)]
struct Shared {
    inner: Mutex<Inner>,
    events: broadcast::Sender<ClientEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
    url: String,
    reconnect_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Client {
    pub fn new(settings: &ClientSettings) -> Self {
        let name = settings
            .name
            .clone()
            .unwrap_or_else(|| format!("nt4-{}", Uuid::new_v4()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::default()),
                events,
                task: Mutex::new(None),
                url: format!("ws://{}:{}/nt/{}", settings.host, settings.port, name),
                reconnect_delay: Duration::from_millis(settings.reconnect_delay_ms),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    /// Spawns the connect loop. Calling it while already running is a no-op.
    pub fn start(&self) {
        let mut task = lock(&self.shared.task);
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        *task = Some(spawn(run(self.shared.clone())));
    }

    /// Stops the connect loop and closes the current session, if any.
    pub fn disconnect(&self) {
        if let Some(task) = lock(&self.shared.task).take() {
            task.abort();
        }
        end_session(&self.shared);
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.shared.inner).outbound.is_some()
    }

    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    pub fn topic(&self, name: &str) -> Option<TopicInfo> {
        lock(&self.shared.inner).state.topic(name).cloned()
    }

    pub fn topics(&self) -> HashMap<String, TopicInfo> {
        lock(&self.shared.inner).state.topics().clone()
    }

    pub fn publish(&self, name: &str, type_str: &str, properties: Properties) -> Result<PubUid> {
        let mut inner = lock(&self.shared.inner);
        inner.sender()?;
        let (pubuid, message) = inner.state.publish(name, type_str, properties);
        inner.send_control(message)?;
        Ok(pubuid)
    }

    pub fn unpublish(&self, pubuid: PubUid) -> Result<()> {
        let mut inner = lock(&self.shared.inner);
        inner.sender()?;
        let message = inner.state.unpublish(pubuid)?;
        inner.send_control(message)
    }

    /// Sends a value stamped with the local clock.
    pub fn set_value(&self, pubuid: PubUid, value: Value) -> Result<()> {
        self.set_value_at(pubuid, value, now_micros())
    }

    pub fn set_value_at(&self, pubuid: PubUid, value: Value, timestamp: i64) -> Result<()> {
        let mut inner = lock(&self.shared.inner);
        inner.sender()?;
        match inner.state.set_value(pubuid, value, timestamp)? {
            Some(frame) => inner.send_frame(&frame),
            None => Ok(()),
        }
    }

    pub fn subscribe(&self, patterns: Vec<String>, options: SubscribeOptions) -> Result<SubUid> {
        let mut inner = lock(&self.shared.inner);
        inner.sender()?;
        let (subuid, message) = inner.state.subscribe(patterns, options);
        inner.send_control(message)?;
        Ok(subuid)
    }

    pub fn unsubscribe(&self, subuid: SubUid) -> Result<()> {
        let mut inner = lock(&self.shared.inner);
        inner.sender()?;
        let message = inner.state.unsubscribe(subuid)?;
        inner.send_control(message)
    }

    pub fn set_properties(&self, name: &str, update: Properties) -> Result<()> {
        let mut inner = lock(&self.shared.inner);
        inner.sender()?;
        let message = inner.state.set_properties(name, update);
        inner.send_control(message)
    }
}

fn emit(shared: &Shared, event: ClientEvent) {
    // no receivers is fine
    let _ = shared.events.send(event);
}

async fn run(shared: Arc<Shared>) {
    loop {
        match open_session(&shared).await {
            Ok(()) => info!(url = %shared.url, "Session closed"),
            Err(e) => warn!(url = %shared.url, "Connection failed: {e}"),
        }
        debug!(delay_ms = shared.reconnect_delay.as_millis() as u64, "Reconnecting");
        tokio::time::sleep(shared.reconnect_delay).await;
    }
}

async fn open_session(shared: &Arc<Shared>) -> Result<()> {
    let mut request = shared.url.as_str().into_client_request()?;
    let offer = HeaderValue::from_str(&format!("{SUBPROTOCOL_V41}, {SUBPROTOCOL_V40}"))
        .map_err(|e| Nt4Error::Handshake(e.to_string()))?;
    request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, offer);
    let (ws_stream, _response) = connect_async(request).await?;
    info!(url = %shared.url, "Connected");

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

    {
        let mut inner = lock(&shared.inner);
        inner.outbound = Some(tx);
        let (_, message) = inner
            .state
            .subscribe(vec![String::new()], SubscribeOptions::prefix());
        if let Err(e) = inner.send_control(message) {
            warn!("Failed to send catch-all subscribe: {e}");
        }
        emit(shared, ClientEvent::Connected);
    }

    let send_task = spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = ws_sender.send(msg).await {
                warn!("Failed to send message: {e}");
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => handle_text(shared, text.as_str()),
            Ok(WsMessage::Binary(bytes)) => handle_binary(shared, &bytes),
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("Receive error: {e}");
                break;
            }
        }
    }

    end_session(shared);
    send_task.abort();
    Ok(())
}

fn end_session(shared: &Shared) {
    let mut inner = lock(&shared.inner);
    inner.state.reset();
    if inner.outbound.take().is_some() {
        emit(shared, ClientEvent::Disconnected);
    }
}

fn handle_text(shared: &Shared, text: &str) {
    let messages = match decode_control_messages::<ServerMessage>(text) {
        Ok(messages) => messages,
        Err(e) => {
            warn!("Invalid control frame: {e}");
            return;
        }
    };
    let mut inner = lock(&shared.inner);
    for message in messages {
        let (events, frames) = inner.state.handle_server_message(message);
        for frame in &frames {
            if let Err(e) = inner.send_frame(frame) {
                warn!(id = frame.topic_id, "Failed to flush held value: {e}");
            }
        }
        for event in events {
            emit(shared, event);
        }
    }
}

fn handle_binary(shared: &Shared, bytes: &[u8]) {
    let mut inner = lock(&shared.inner);
    for res in FrameReader::new(bytes) {
        match res {
            Ok((frame, _)) => {
                if let Some(event) = inner.state.handle_value_frame(frame) {
                    emit(shared, event);
                }
            }
            Err(e) => warn!("Invalid value frame: {e}"),
        }
    }
}
