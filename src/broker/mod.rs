//! In-process brokerage between golems and minions.
//!
//! The hub keeps two maps keyed by webstrate id: connected golem control
//! sockets (at most one per webstrate) and connected minion sessions. Each
//! socket gets a reader and a writer task communicating over bounded
//! channels; the hub routes frames between paired sockets and emits
//! connect/disconnect events. One mutex guards both maps and is never held
//! across a suspension point.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex};
use uuid::Uuid;

use crate::server::HerderState;

/// Capacity of the per-socket `to`/`from` queues. A full queue blocks the
/// producing read loop, stalling the slow peer instead of reordering or
/// dropping frames.
const QUEUE_CAPACITY: usize = 100;

/// Wait until `rx` reports `true`, or the sender is dropped.
///
/// Equivalent to `rx.wait_for(|v| *v).await` but avoids holding the
/// `watch::Ref` (a non-`Send` guard) across an `.await` point, which would
/// make the enclosing `tokio::select!` future non-`Send` and unspawnable.
async fn wait_true(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// How the hub waits for a golem on behalf of an early minion.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub golem_wait_attempts: u32,
    pub golem_wait_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            golem_wait_attempts: 100,
            golem_wait_interval: Duration::from_millis(200),
        }
    }
}

/// Connect/disconnect event sent over control sockets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectEvent {
    #[serde(rename = "Event")]
    pub event: String,
    #[serde(rename = "ID", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "Type", skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,
}

impl ConnectEvent {
    pub fn golem_not_found(id: &str) -> Self {
        Self {
            event: "golem-not-found".to_string(),
            id: Some(id.to_string()),
            typ: None,
        }
    }

    pub fn minion_connected(id: &str, typ: &str) -> Self {
        Self {
            event: "minion-connected".to_string(),
            id: Some(id.to_string()),
            typ: if typ.is_empty() {
                None
            } else {
                Some(typ.to_string())
            },
        }
    }

    pub fn minion_disconnected(id: &str) -> Self {
        Self {
            event: "minion-disconnected".to_string(),
            id: Some(id.to_string()),
            typ: None,
        }
    }

    pub fn golem_connected() -> Self {
        Self {
            event: "golem-connected".to_string(),
            id: None,
            typ: None,
        }
    }

    pub fn golem_disconnected() -> Self {
        Self {
            event: "golem-disconnected".to_string(),
            id: None,
            typ: None,
        }
    }

    /// The event as a text frame.
    fn frame(&self) -> Option<Message> {
        match serde_json::to_string(self) {
            Ok(json) => Some(Message::Text(json.into())),
            Err(e) => {
                tracing::warn!(error = %e, event = %self.event, "Error serialising event");
                None
            }
        }
    }
}

/// The in-process end of a connected golem control socket.
#[derive(Clone)]
pub struct GolemHandle {
    to: mpsc::Sender<Message>,
    done: watch::Sender<bool>,
}

impl GolemHandle {
    /// Queue a frame for the golem. Blocks when the golem is slow.
    pub async fn send(&self, msg: Message) -> bool {
        self.to.send(msg).await.is_ok()
    }

    pub fn signal_done(&self) {
        let _ = self.done.send(true);
    }

    pub fn done_rx(&self) -> watch::Receiver<bool> {
        self.done.subscribe()
    }
}

/// A connected ad-hoc minion session.
pub struct MinionSession {
    pub id: String,
    pub wsid: String,
    to_tx: mpsc::Sender<Message>,
    from_tx: mpsc::Sender<Message>,
    /// Consumed by the minion socket's writer task.
    to_rx: std::sync::Mutex<Option<mpsc::Receiver<Message>>>,
    /// Consumed by the paired golem's writer task.
    from_rx: std::sync::Mutex<Option<mpsc::Receiver<Message>>>,
    done: watch::Sender<bool>,
}

impl MinionSession {
    fn new(wsid: &str) -> Self {
        let (to_tx, to_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (from_tx, from_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (done, _) = watch::channel(false);
        Self {
            id: Uuid::now_v7().to_string(),
            wsid: wsid.to_string(),
            to_tx,
            from_tx,
            to_rx: std::sync::Mutex::new(Some(to_rx)),
            from_rx: std::sync::Mutex::new(Some(from_rx)),
            done,
        }
    }

    pub async fn send_to_minion(&self, msg: Message) -> bool {
        self.to_tx.send(msg).await.is_ok()
    }

    pub async fn send_from_minion(&self, msg: Message) -> bool {
        self.from_tx.send(msg).await.is_ok()
    }

    pub fn signal_done(&self) {
        let _ = self.done.send(true);
    }

    pub fn done_rx(&self) -> watch::Receiver<bool> {
        self.done.subscribe()
    }

    fn take_to_rx(&self) -> Option<mpsc::Receiver<Message>> {
        self.to_rx.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn take_from_rx(&self) -> Option<mpsc::Receiver<Message>> {
        self.from_rx.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn put_back_from_rx(&self, rx: mpsc::Receiver<Message>) {
        *self.from_rx.lock().unwrap_or_else(|e| e.into_inner()) = Some(rx);
    }
}

#[derive(Default)]
struct Maps {
    golems: HashMap<String, GolemHandle>,
    minions: HashMap<String, HashMap<String, Arc<MinionSession>>>,
}

/// Registry of connected golems and minions. Cheap to clone.
#[derive(Clone)]
pub struct Hub {
    config: Arc<HubConfig>,
    inner: Arc<Mutex<Maps>>,
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config: Arc::new(config),
            inner: Arc::new(Mutex::new(Maps::default())),
        }
    }

    /// Register a new minion session and snapshot the current golem in the
    /// same critical section.
    async fn register_minion(&self, wsid: &str) -> (Arc<MinionSession>, Option<GolemHandle>) {
        let session = Arc::new(MinionSession::new(wsid));
        let mut maps = self.inner.lock().await;
        maps.minions
            .entry(wsid.to_string())
            .or_default()
            .insert(session.id.clone(), session.clone());
        let golem = maps.golems.get(wsid).cloned();
        (session, golem)
    }

    async fn remove_minion(&self, wsid: &str, id: &str) {
        let mut maps = self.inner.lock().await;
        if let Some(sessions) = maps.minions.get_mut(wsid) {
            sessions.remove(id);
            if sessions.is_empty() {
                maps.minions.remove(wsid);
            }
        }
    }

    /// Register a golem control socket. Returns `None` when one is already
    /// connected for the webstrate (the single-golem invariant).
    async fn register_golem(
        &self,
        wsid: &str,
    ) -> Option<(GolemHandle, mpsc::Receiver<Message>)> {
        let mut maps = self.inner.lock().await;
        if maps.golems.contains_key(wsid) {
            return None;
        }
        let (to, to_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (done, _) = watch::channel(false);
        let handle = GolemHandle { to, done };
        maps.golems.insert(wsid.to_string(), handle.clone());
        Some((handle, to_rx))
    }

    async fn remove_golem(&self, wsid: &str) {
        self.inner.lock().await.golems.remove(wsid);
    }

    pub async fn golem(&self, wsid: &str) -> Option<GolemHandle> {
        self.inner.lock().await.golems.get(wsid).cloned()
    }

    pub async fn minion(&self, wsid: &str, id: &str) -> Option<Arc<MinionSession>> {
        self.inner
            .lock()
            .await
            .minions
            .get(wsid)
            .and_then(|sessions| sessions.get(id))
            .cloned()
    }

    /// Poll for a golem on behalf of a freshly connected minion.
    async fn wait_for_golem(&self, wsid: &str) -> Option<GolemHandle> {
        for _ in 0..self.config.golem_wait_attempts {
            if let Some(golem) = self.golem(wsid).await {
                return Some(golem);
            }
            tokio::time::sleep(self.config.golem_wait_interval).await;
        }
        None
    }
}

/// Is this a data frame worth routing to the peer?
fn is_data(msg: &Message) -> bool {
    matches!(msg, Message::Text(_) | Message::Binary(_))
}

// ── Minion connect ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct MinionConnectQuery {
    /// Caller-provided classification, forwarded in the connect event.
    #[serde(rename = "type")]
    pub typ: Option<String>,
}

/// `GET /minion/v1/connect/{wsid}?type=…` — an ad-hoc minion attaches.
pub async fn minion_connect_handler(
    State(state): State<Arc<HerderState>>,
    Path(wsid): Path<String>,
    Query(query): Query<MinionConnectQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    tracing::info!(webstrate = %wsid, "Minion connecting");
    let typ = query.typ.unwrap_or_default();
    ws.on_upgrade(move |socket| minion_socket(state, wsid, typ, socket))
}

async fn minion_socket(state: Arc<HerderState>, wsid: String, typ: String, socket: WebSocket) {
    let hub = state.hub.clone();
    let (session, golem) = hub.register_minion(&wsid).await;
    tracing::info!(minion = %session.id, webstrate = %wsid, "Minion assigned id");

    let (mut sink, mut stream) = socket.split();

    // An early minion gets a grace period for its golem to arrive.
    let golem = match golem {
        Some(golem) => Some(golem),
        None => {
            tracing::warn!(webstrate = %wsid, "No golem connected yet, waiting a little while");
            hub.wait_for_golem(&wsid).await
        }
    };

    let Some(golem) = golem else {
        if let Some(frame) = ConnectEvent::golem_not_found(&wsid).frame() {
            let _ = sink.send(frame).await;
        }
        let _ = sink.close().await;
        hub.remove_minion(&wsid, &session.id).await;
        return;
    };

    // Writer: session.to -> socket, until the golem goes away.
    let Some(mut to_rx) = session.take_to_rx() else {
        let _ = sink.close().await;
        hub.remove_minion(&wsid, &session.id).await;
        return;
    };
    let mut golem_done = golem.done_rx();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                msg = to_rx.recv() => match msg {
                    Some(msg) => {
                        if sink.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = wait_true(&mut golem_done) => {
                    let _ = sink.close().await;
                    break;
                }
            }
        }
    });

    // Tell the golem the minion is here, before any data frame can follow.
    if let Some(frame) = ConnectEvent::minion_connected(&session.id, &typ).frame() {
        golem.send(frame).await;
    }

    // Reader: socket -> session.from.
    while let Some(item) = stream.next().await {
        match item {
            Ok(msg) if is_data(&msg) => {
                if !session.send_from_minion(msg).await {
                    break;
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {} // ping/pong handled by the transport
        }
    }

    tracing::info!(minion = %session.id, webstrate = %wsid, "Minion done");
    if let Some(frame) = ConnectEvent::minion_disconnected(&session.id).frame() {
        golem.send(frame.clone()).await;
        session.send_from_minion(frame).await;
    }
    session.signal_done();
    writer.abort();
    hub.remove_minion(&wsid, &session.id).await;
}

// ── Golem control socket ────────────────────────────────────────

/// `GET /golem/v1/connect/{wsid}` — the golem's control socket. A second
/// connect for the same webstrate is refused with 409 before the upgrade.
pub async fn golem_connect_handler(
    State(state): State<Arc<HerderState>>,
    Path(wsid): Path<String>,
    ws: WebSocketUpgrade,
) -> axum::response::Response {
    tracing::info!(webstrate = %wsid, "Golem connecting");
    match state.hub.register_golem(&wsid).await {
        None => (StatusCode::CONFLICT, "Golem already connected").into_response(),
        Some((handle, to_rx)) => ws
            .on_upgrade(move |socket| golem_socket(state, wsid, handle, to_rx, socket))
            .into_response(),
    }
}

async fn golem_socket(
    state: Arc<HerderState>,
    wsid: String,
    handle: GolemHandle,
    mut to_rx: mpsc::Receiver<Message>,
    socket: WebSocket,
) {
    let hub = state.hub.clone();
    let (mut sink, mut stream) = socket.split();

    // Writer: golem.to -> socket, until done.
    let mut done_rx = handle.done_rx();
    let writer_hub = hub.clone();
    let writer_wsid = wsid.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                msg = to_rx.recv() => match msg {
                    Some(msg) => {
                        if sink.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = wait_true(&mut done_rx) => {
                    let _ = sink.close().await;
                    writer_hub.remove_golem(&writer_wsid).await;
                    break;
                }
            }
        }
    });

    // Reader: inbound frames are reserved for future golem -> hub control
    // messages; just log them for now.
    while let Some(item) = stream.next().await {
        match item {
            Ok(msg) if is_data(&msg) => {
                tracing::debug!(webstrate = %wsid, "Read message from golem");
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    tracing::info!(webstrate = %wsid, "Golem done");
    handle.signal_done();
    let _ = writer.await;
    hub.remove_golem(&wsid).await;
}

// ── Golem ↔ minion pairing ──────────────────────────────────────

/// `GET /golem/v1/connect-to/{wsid}/{minion}` — pair the golem with a
/// specific connected minion. Unknown webstrates or minions get 404 before
/// the upgrade.
pub async fn golem_minion_connect_handler(
    State(state): State<Arc<HerderState>>,
    Path((wsid, minion_id)): Path<(String, String)>,
    ws: WebSocketUpgrade,
) -> axum::response::Response {
    tracing::info!(webstrate = %wsid, minion = %minion_id, "Golem attempting to pair");
    match state.hub.minion(&wsid, &minion_id).await {
        None => (StatusCode::NOT_FOUND, "No such minion registered").into_response(),
        Some(session) => ws
            .on_upgrade(move |socket| pairing_socket(session, socket))
            .into_response(),
    }
}

async fn pairing_socket(session: Arc<MinionSession>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();

    let Some(mut from_rx) = session.take_from_rx() else {
        tracing::warn!(minion = %session.id, "Minion already paired");
        let _ = sink.close().await;
        return;
    };

    tracing::info!(minion = %session.id, webstrate = %session.wsid, "Golem/minion pairing ready");

    if let Some(frame) = ConnectEvent::golem_connected().frame() {
        session.send_to_minion(frame).await;
    }

    // Writer: session.from -> socket, until the minion goes away or this
    // pairing ends.
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let mut done_rx = session.done_rx();
    let writer_session = session.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                msg = from_rx.recv() => match msg {
                    Some(msg) => {
                        if sink.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = wait_true(&mut done_rx) => {
                    tracing::info!(minion = %writer_session.id, "Minion gone, closing pairing socket");
                    let _ = sink.close().await;
                    break;
                }
                _ = wait_true(&mut stop_rx) => {
                    let _ = sink.close().await;
                    break;
                }
            }
        }
        from_rx
    });

    // Reader: socket -> session.to.
    while let Some(item) = stream.next().await {
        match item {
            Ok(msg) if is_data(&msg) => {
                if !session.send_to_minion(msg).await {
                    break;
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    tracing::info!(minion = %session.id, webstrate = %session.wsid, "Pairing session done");
    if let Some(frame) = ConnectEvent::golem_disconnected().frame() {
        session.send_to_minion(frame).await;
    }

    // Hand the queue back so a reconnecting golem can resume the session.
    let _ = stop_tx.send(true);
    if let Ok(from_rx) = writer.await {
        session.put_back_from_rx(from_rx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_event_wire_shape() {
        let event = ConnectEvent::minion_connected("abc", "worker");
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(
            json,
            r#"{"Event":"minion-connected","ID":"abc","Type":"worker"}"#
        );
    }

    #[test]
    fn test_connect_event_omits_empty_fields() {
        let json = serde_json::to_string(&ConnectEvent::golem_connected()).unwrap();
        assert_eq!(json, r#"{"Event":"golem-connected"}"#);

        let json = serde_json::to_string(&ConnectEvent::minion_connected("abc", "")).unwrap();
        assert_eq!(json, r#"{"Event":"minion-connected","ID":"abc"}"#);
    }

    #[tokio::test]
    async fn test_second_golem_registration_refused() {
        let hub = Hub::new(HubConfig::default());
        let first = hub.register_golem("ws-1").await;
        assert!(first.is_some());
        let second = hub.register_golem("ws-1").await;
        assert!(second.is_none());

        // Another webstrate is unaffected.
        assert!(hub.register_golem("ws-2").await.is_some());
    }

    #[tokio::test]
    async fn test_golem_slot_frees_after_removal() {
        let hub = Hub::new(HubConfig::default());
        hub.register_golem("ws-1").await.unwrap();
        hub.remove_golem("ws-1").await;
        assert!(hub.register_golem("ws-1").await.is_some());
    }

    #[tokio::test]
    async fn test_minion_registry_lookup_and_removal() {
        let hub = Hub::new(HubConfig::default());
        let (session, golem) = hub.register_minion("ws-1").await;
        assert!(golem.is_none());
        assert!(hub.minion("ws-1", &session.id).await.is_some());
        assert!(hub.minion("ws-1", "missing").await.is_none());
        assert!(hub.minion("ws-2", &session.id).await.is_none());

        hub.remove_minion("ws-1", &session.id).await;
        assert!(hub.minion("ws-1", &session.id).await.is_none());
    }

    #[tokio::test]
    async fn test_register_minion_snapshots_golem() {
        let hub = Hub::new(HubConfig::default());
        hub.register_golem("ws-1").await.unwrap();
        let (_session, golem) = hub.register_minion("ws-1").await;
        assert!(golem.is_some());
    }

    #[tokio::test]
    async fn test_wait_for_golem_times_out() {
        let hub = Hub::new(HubConfig {
            golem_wait_attempts: 3,
            golem_wait_interval: Duration::from_millis(5),
        });
        let start = std::time::Instant::now();
        assert!(hub.wait_for_golem("ws-1").await.is_none());
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_wait_for_golem_sees_late_arrival() {
        let hub = Hub::new(HubConfig {
            golem_wait_attempts: 50,
            golem_wait_interval: Duration::from_millis(5),
        });
        let hub2 = hub.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            hub2.register_golem("ws-1").await;
        });
        assert!(hub.wait_for_golem("ws-1").await.is_some());
    }

    #[tokio::test]
    async fn test_session_ids_sort_by_arrival() {
        let hub = Hub::new(HubConfig::default());
        let (a, _) = hub.register_minion("ws-1").await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let (b, _) = hub.register_minion("ws-1").await;
        assert!(a.id < b.id);
    }
}
