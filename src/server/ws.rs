//! WebSocket notification channels.
//!
//! Clients subscribe to notification events by upgrading on
//! `<api base path>notify/ws/<event>` with the `notify.catenis.io`
//! subprotocol. A fresh channel must authenticate within a deadline by
//! sending a JSON frame carrying the same timestamp and authorization
//! values a signed HTTP request would; the values are injected into the
//! retained upgrade headers and validated against the credentials registry.
//! Authenticated channels are indexed by `(device, event)`, kept alive by a
//! ping/pong heartbeat, and receive whatever payload the notification table
//! holds for them — immediately or after a programmed delay.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::context::{self, EmulatorState};
use crate::server::api::{self, ApiState};
use crate::signer;

/// Subprotocol a client must offer for the upgrade to be accepted.
pub const NOTIFY_CHANNEL_PROTOCOL: &str = "notify.catenis.io";

/// Greeting frame sent once a channel is authenticated.
const CHANNEL_OPEN_MESSAGE: &str = "NOTIFICATION_CHANNEL_OPEN";

const DEFAULT_AUTH_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;

const CLOSE_GOING_AWAY: u16 = 1001;
const CLOSE_PROTOCOL_ERROR: u16 = 1002;
const CLOSE_INTERNAL_ERROR: u16 = 1011;

const CLOSE_REASON_USER: &str = "Connection closed by end user";
const CLOSE_REASON_AUTH_TIMEOUT: &str = "Failed to receive authentication message";
const CLOSE_REASON_BAD_AUTH_FRAME: &str = "Invalid authentication message";

/// Per-channel timing knobs. Production uses the defaults; tests shorten
/// them.
#[derive(Debug, Clone)]
pub struct NotifyTimings {
    pub auth_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl Default for NotifyTimings {
    fn default() -> Self {
        Self {
            auth_timeout_ms: DEFAULT_AUTH_TIMEOUT_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
        }
    }
}

/// Channel bookkeeping. Everything lives under one lock so index mutation,
/// dispatch snapshots, and pending-timer guards serialize.
#[derive(Default)]
struct ChannelRegistry {
    /// device id -> event name -> channel id -> writer. Only authenticated
    /// channels are indexed; empty inner maps are pruned on removal.
    index: HashMap<String, HashMap<String, HashMap<String, mpsc::UnboundedSender<Message>>>>,
    /// Every open channel, authenticated or not, for close-all.
    clients: HashMap<String, mpsc::UnboundedSender<Message>>,
    /// `device\x00event` -> delayed dispatch task. At most one per pair.
    pending: HashMap<String, JoinHandle<()>>,
}

impl ChannelRegistry {
    fn channels_for(&self, device_id: &str, event: &str) -> Vec<mpsc::UnboundedSender<Message>> {
        self.index
            .get(device_id)
            .and_then(|events| events.get(event))
            .map(|channels| channels.values().cloned().collect())
            .unwrap_or_default()
    }

    fn remove_indexed(&mut self, device_id: &str, event: &str, channel_id: &str) {
        if let Some(events) = self.index.get_mut(device_id) {
            if let Some(channels) = events.get_mut(event) {
                channels.remove(channel_id);
                if channels.is_empty() {
                    events.remove(event);
                }
            }
            if events.is_empty() {
                self.index.remove(device_id);
            }
        }
    }
}

fn pending_key(device_id: &str, event: &str) -> String {
    format!("{device_id}\x00{event}")
}

/// Shared state of the notification subsystem.
pub struct NotifyState {
    timings: NotifyTimings,
    registry: Mutex<ChannelRegistry>,
}

impl NotifyState {
    pub fn new(timings: NotifyTimings) -> Self {
        Self {
            timings,
            registry: Mutex::new(ChannelRegistry::default()),
        }
    }

    pub fn timings(&self) -> &NotifyTimings {
        &self.timings
    }

    /// Number of currently indexed (authenticated) channels.
    pub fn authenticated_channel_count(&self) -> usize {
        self.registry
            .lock()
            .index
            .values()
            .flat_map(|events| events.values())
            .map(|channels| channels.len())
            .sum()
    }
}

/// Close every open channel with 1001 and cancel all pending dispatch
/// timers.
pub fn close_all_clients(notify: &NotifyState) {
    let (clients, pending) = {
        let mut registry = notify.registry.lock();
        let clients: Vec<_> = registry.clients.values().cloned().collect();
        let pending: Vec<_> = registry.pending.drain().map(|(_, handle)| handle).collect();
        (clients, pending)
    };
    for handle in pending {
        handle.abort();
    }
    debug!(count = clients.len(), "closing all notification channels");
    for tx in clients {
        let _ = send_close(&tx, CLOSE_GOING_AWAY, CLOSE_REASON_USER);
    }
}

/// Upgrade handler for notification URLs.
pub async fn notify_ws_handler(
    ws: WebSocketUpgrade,
    Path(event): Path<String>,
    State(state): State<ApiState>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    if !context::is_notify_event(&event) {
        return (StatusCode::BAD_REQUEST, "unknown notification event").into_response();
    }
    if !client_offers_protocol(&headers) {
        return (
            StatusCode::BAD_REQUEST,
            "missing notify.catenis.io subprotocol",
        )
            .into_response();
    }
    // The upgrade request URL and headers are retained: the authentication
    // frame is validated as if it were this GET request.
    let request_url = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();
    ws.protocols([NOTIFY_CHANNEL_PROTOCOL])
        .on_upgrade(move |socket| handle_channel(socket, state, event, request_url, headers))
        .into_response()
}

fn client_offers_protocol(headers: &HeaderMap) -> bool {
    headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok())
        .map(|value| {
            value
                .split(',')
                .any(|candidate| candidate.trim() == NOTIFY_CHANNEL_PROTOCOL)
        })
        .unwrap_or(false)
}

async fn handle_channel(
    socket: WebSocket,
    state: ApiState,
    event: String,
    request_url: String,
    upgrade_headers: HeaderMap,
) {
    let channel_id = Uuid::new_v4().to_string();
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let is_close = matches!(msg, Message::Close(_));
            if sender.send(msg).await.is_err() {
                break;
            }
            if is_close {
                break;
            }
        }
    });

    state
        .notify
        .registry
        .lock()
        .clients
        .insert(channel_id.clone(), tx.clone());

    let authenticated = await_authentication(
        &mut receiver,
        &tx,
        &state,
        &request_url,
        &upgrade_headers,
    )
    .await;

    if let Some(device_id) = authenticated {
        debug!(device_id = %device_id, event = %event, "notification channel authenticated");
        state
            .notify
            .registry
            .lock()
            .index
            .entry(device_id.clone())
            .or_default()
            .entry(event.clone())
            .or_default()
            .insert(channel_id.clone(), tx.clone());

        let _ = tx.send(Message::Text(CHANNEL_OPEN_MESSAGE.to_string()));
        auto_dispatch(&state.emulator, &state.notify, &device_id, &event);

        run_heartbeat_loop(
            &mut receiver,
            &tx,
            state.notify.timings.heartbeat_interval_ms,
        )
        .await;

        state
            .notify
            .registry
            .lock()
            .remove_indexed(&device_id, &event, &channel_id);
    }

    state.notify.registry.lock().clients.remove(&channel_id);
    drop(tx);
    let _ = send_task.await;
}

enum AuthWait {
    Frame(String),
    PeerClosed,
    Deadline,
    Invalid,
}

/// Wait for the first text frame within the auth deadline. Control frames
/// are ignored; binary frames are not a valid authentication message.
async fn recv_auth_frame(receiver: &mut SplitStream<WebSocket>, timeout_ms: u64) -> AuthWait {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return AuthWait::Deadline;
        }
        let msg = match tokio::time::timeout(remaining, receiver.next()).await {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(_))) | Ok(None) => return AuthWait::PeerClosed,
            Err(_) => return AuthWait::Deadline,
        };
        match msg {
            Message::Text(text) => return AuthWait::Frame(text),
            Message::Binary(_) => return AuthWait::Invalid,
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => return AuthWait::PeerClosed,
        }
    }
}

/// Run the authentication handshake. Returns the device id on success; on
/// failure the channel has been closed with the appropriate code and reason.
async fn await_authentication(
    receiver: &mut SplitStream<WebSocket>,
    tx: &mpsc::UnboundedSender<Message>,
    state: &ApiState,
    request_url: &str,
    upgrade_headers: &HeaderMap,
) -> Option<String> {
    let text = match recv_auth_frame(receiver, state.notify.timings.auth_timeout_ms).await {
        AuthWait::Frame(text) => text,
        AuthWait::PeerClosed => return None,
        AuthWait::Deadline => {
            let _ = send_close(tx, CLOSE_PROTOCOL_ERROR, CLOSE_REASON_AUTH_TIMEOUT);
            return None;
        }
        AuthWait::Invalid => {
            let _ = send_close(tx, CLOSE_PROTOCOL_ERROR, CLOSE_REASON_BAD_AUTH_FRAME);
            return None;
        }
    };

    let Some((timestamp, authorization)) = parse_auth_frame(&text) else {
        let _ = send_close(tx, CLOSE_PROTOCOL_ERROR, CLOSE_REASON_BAD_AUTH_FRAME);
        return None;
    };
    let (Ok(timestamp_value), Ok(authorization_value)) = (
        HeaderValue::from_str(&timestamp),
        HeaderValue::from_str(&authorization),
    ) else {
        let _ = send_close(tx, CLOSE_PROTOCOL_ERROR, CLOSE_REASON_BAD_AUTH_FRAME);
        return None;
    };

    let mut headers = upgrade_headers.clone();
    headers.insert(signer::TIMESTAMP_HEADER, timestamp_value);
    headers.insert(header::AUTHORIZATION, authorization_value);

    // The upgrade request carries no body, so the signature covers empty
    // bytes.
    match api::authenticate_request(&state.emulator, "GET", request_url, &headers, &[]) {
        Ok(device_id) => Some(device_id),
        Err(failure) => {
            let code = if failure.status.is_server_error() {
                CLOSE_INTERNAL_ERROR
            } else {
                CLOSE_PROTOCOL_ERROR
            };
            let _ = send_close(tx, code, &failure.message);
            None
        }
    }
}

/// Extract the two required string fields from the authentication frame.
fn parse_auth_frame(text: &str) -> Option<(String, String)> {
    let value: Value = serde_json::from_str(text).ok()?;
    let timestamp = value.get(signer::TIMESTAMP_HEADER)?.as_str()?.to_string();
    let authorization = value.get("authorization")?.as_str()?.to_string();
    Some((timestamp, authorization))
}

/// Post-authentication loop: ping the peer every heartbeat period and
/// terminate if no pong arrived since the previous ping. Data frames from
/// the peer are ignored.
async fn run_heartbeat_loop(
    receiver: &mut SplitStream<WebSocket>,
    tx: &mpsc::UnboundedSender<Message>,
    heartbeat_interval_ms: u64,
) {
    let period = Duration::from_millis(heartbeat_interval_ms);
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    let mut alive = true;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !alive {
                    // Peer missed a whole heartbeat period; drop without a
                    // close handshake.
                    break;
                }
                alive = false;
                if tx.send(Message::Ping(Vec::new())).is_err() {
                    break;
                }
            }
            next = receiver.next() => {
                match next {
                    Some(Ok(Message::Pong(_))) => alive = true,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

/// Deliver or schedule the notification installed for `(device, event)`.
///
/// A positive timeout schedules a one-shot timer unless one is already
/// pending for the pair; zero or absent delivers immediately. Delivery
/// targets every indexed channel at fire time.
pub(crate) fn auto_dispatch(
    emulator: &EmulatorState,
    notify: &Arc<NotifyState>,
    device_id: &str,
    event: &str,
) {
    let Some(entry) = emulator.notify_entry(device_id, event) else {
        return;
    };

    match entry.timeout {
        Some(timeout_ms) if timeout_ms > 0 => {
            let key = pending_key(device_id, event);
            let mut registry = notify.registry.lock();
            if registry.pending.contains_key(&key) {
                return;
            }
            let handle = tokio::spawn({
                let notify = Arc::clone(notify);
                let device_id = device_id.to_string();
                let event = event.to_string();
                let data = entry.data;
                async move {
                    tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
                    let targets = {
                        let mut registry = notify.registry.lock();
                        // Guard and removal share the critical section: if
                        // another path already took the entry, do not
                        // dispatch again.
                        if registry
                            .pending
                            .remove(&pending_key(&device_id, &event))
                            .is_none()
                        {
                            return;
                        }
                        registry.channels_for(&device_id, &event)
                    };
                    deliver(&targets, &data);
                }
            });
            // The lock is still held, so the timer cannot observe a missing
            // entry even for very short timeouts.
            registry.pending.insert(key, handle);
        }
        _ => {
            let targets = notify.registry.lock().channels_for(device_id, event);
            deliver(&targets, &entry.data);
        }
    }
}

/// Send the payload to each target as a single text frame. Channels whose
/// writer has gone away are skipped silently.
fn deliver(targets: &[mpsc::UnboundedSender<Message>], data: &str) {
    debug!(count = targets.len(), "delivering notification");
    for tx in targets {
        let _ = tx.send(Message::Text(data.to_string()));
    }
}

fn send_close(tx: &mpsc::UnboundedSender<Message>, code: u16, reason: &str) -> Result<(), ()> {
    // Close reasons are capped at 123 bytes by the protocol.
    let truncated: String = reason.chars().take(123).collect();
    if truncated.len() < reason.len() {
        warn!(code, "close reason truncated");
    }
    tx.send(Message::Close(Some(CloseFrame {
        code,
        reason: truncated.into(),
    })))
    .map_err(|_| ())
}
