//! Metered long-lived daemons.
//!
//! A daemon is a user-provided container whose runtime is paid for in
//! credits. Spawning is token-authenticated; the token's grant is applied to
//! the owner's account (once per token id) and a metering task debits one
//! credit per second of uptime. When the balance runs out the container is
//! killed. Containers carry `subject`/`token`/`tokenid` labels so ownership
//! checks resolve by predicate.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Form, Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use bollard::Docker;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

use crate::container::{self, RunSpec, StdioChunk, Supervised};
use crate::error::LedgerError;
use crate::server::{ApiError, HerderState};
use crate::token::Authenticated;

/// How often the metering task debits the owner's account.
const METER_TICK: std::time::Duration = std::time::Duration::from_secs(1);

/// Credits debited per tick.
const CREDITS_PER_TICK: i64 = 1;

/// Supervision handles for running daemons, keyed by container name.
///
/// Halting through the handle before an intentional removal keeps the
/// restart supervisor from resurrecting the container.
#[derive(Default)]
pub struct DaemonRegistry {
    inner: Mutex<HashMap<String, Supervised>>,
}

impl DaemonRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn register(&self, name: String, handle: Supervised) {
        self.inner.lock().await.insert(name, handle);
    }

    /// Halt the supervisor for a daemon, if it is still tracked.
    pub async fn halt(&self, name: &str) {
        if let Some(handle) = self.inner.lock().await.get(name) {
            handle.halt();
        }
    }

    async fn remove(&self, name: &str) {
        self.inner.lock().await.remove(name);
    }
}

/// JSON reply for a spawned daemon.
#[derive(Debug, Serialize, Deserialize)]
pub struct DaemonInfo {
    #[serde(rename = "Name")]
    pub name: String,
    /// The container's address on the engine's bridge network.
    #[serde(rename = "Address")]
    pub address: String,
    /// Container port -> host port.
    #[serde(rename = "Ports")]
    pub ports: HashMap<u16, u16>,
}

/// `POST /daemon/v1/spawn` — form fields `name`, `image`, `ports` (JSON
/// list of container ports); every other field is written into the daemon's
/// persistent mount directory.
pub async fn spawn_handler(
    State(state): State<Arc<HerderState>>,
    auth: Authenticated,
    Form(mut form): Form<HashMap<String, String>>,
) -> Result<Json<DaemonInfo>, ApiError> {
    let name = form
        .remove("name")
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ApiError::BadInput("Missing name POST variable".to_string()))?;
    let image = form
        .remove("image")
        .filter(|image| !image.is_empty())
        .ok_or_else(|| ApiError::BadInput("Missing image POST variable".to_string()))?;
    let inside_ports: Vec<u16> = match form.remove("ports") {
        Some(json) => serde_json::from_str(&json)
            .map_err(|e| ApiError::BadInput(format!("Malformed ports list: {e}")))?,
        None => Vec::new(),
    };

    let claims = auth.claims;
    // The container name encodes owner intent and token uniqueness.
    let unique = format!("{}-{}", name, claims.jti);

    // Apply the token's grant (idempotent per token id), then check there is
    // anything left to spend.
    state
        .ledger
        .top_up(&claims.sub, &claims.jti, claims.exp, claims.crd)?;
    if state.ledger.credits(&claims.sub)? <= 0 {
        return Err(ApiError::PaymentRequired);
    }

    let mut ports = HashMap::new();
    let mut reply_ports = HashMap::new();
    for inside in inside_ports {
        let outside = container::available_port().await?;
        ports.insert(outside, inside);
        reply_ports.insert(inside, outside);
    }

    // Uploaded files land in the daemon's persistent mount directory.
    let mount_dir = state.config.mounts.join(&unique);
    std::fs::create_dir_all(&mount_dir)
        .map_err(|e| ApiError::Internal(format!("Could not create mount dir: {e}")))?;
    let files: HashMap<String, Vec<u8>> = form
        .into_iter()
        .map(|(file_name, content)| (file_name, content.into_bytes()))
        .collect();
    container::load_files(&mount_dir, &files)?;

    let (repo, tag) = match image.split_once(':') {
        Some((repo, tag)) => (repo.to_string(), tag.to_string()),
        None => (image, "latest".to_string()),
    };
    let mut spec = RunSpec::new(&unique, &repo, &tag);
    spec.ports = ports;
    spec.mounts
        .insert(mount_dir.display().to_string(), format!("/{unique}"));
    spec.labels.insert("subject".to_string(), claims.sub.clone());
    spec.labels.insert("token".to_string(), auth.raw.clone());
    spec.labels.insert("tokenid".to_string(), claims.jti.clone());
    spec.attach_stdio = true;

    let (done_tx, done_rx) = mpsc::channel(1);
    let supervised =
        container::run_daemonized(&state.docker, &spec, true, None, None, done_tx).await?;
    let container_id = supervised.id.clone();
    state.daemons.register(unique.clone(), supervised).await;

    tokio::spawn(meter(
        state.clone(),
        claims.sub.clone(),
        unique.clone(),
        done_rx,
    ));

    let address = bridge_ip(&state.docker, &container_id)
        .await
        .unwrap_or_default();

    tracing::info!(daemon = %unique, subject = %claims.sub, "Spawned daemon");
    Ok(Json(DaemonInfo {
        name: unique,
        address,
        ports: reply_ports,
    }))
}

/// Debit the owner every second while the daemon runs. On exhaustion the
/// container is killed; when the container dies on its own the task just
/// winds down.
async fn meter(
    state: Arc<HerderState>,
    subject: String,
    name: String,
    mut done_rx: mpsc::Receiver<()>,
) {
    let mut tick = tokio::time::interval(METER_TICK);
    tick.tick().await; // the first tick fires immediately; skip it
    loop {
        tokio::select! {
            _ = done_rx.recv() => {
                tracing::info!(daemon = %name, "Daemon container gone, metering stops");
                break;
            }
            _ = tick.tick() => {
                match state.ledger.record(&subject, CREDITS_PER_TICK) {
                    Ok(()) => {}
                    Err(LedgerError::NoCredits { .. }) => {
                        tracing::warn!(daemon = %name, subject = %subject, "Credits exhausted, killing daemon");
                        state.daemons.halt(&name).await;
                        let matches = container::with_name(&name);
                        if let Err(e) = container::kill(&state.docker, &matches, false, true).await {
                            tracing::warn!(daemon = %name, error = %e, "Error killing exhausted daemon");
                        }
                        break;
                    }
                    Err(e) => {
                        // A transient store failure must not kill the daemon.
                        tracing::warn!(daemon = %name, error = %e, "Metering debit failed");
                    }
                }
            }
        }
    }
    state.daemons.remove(&name).await;
}

/// The container's IP on the bridge network.
async fn bridge_ip(docker: &Docker, id: &str) -> Option<String> {
    let info = docker.inspect_container(id, None).await.ok()?;
    let networks = info.network_settings?.networks?;
    let endpoint = networks.get("bridge").or_else(|| networks.values().next())?;
    endpoint.ip_address.clone().filter(|ip| !ip.is_empty())
}

/// `GET /daemon/v1/ls` — the caller's daemons.
pub async fn list_handler(
    State(state): State<Arc<HerderState>>,
    auth: Authenticated,
) -> Result<impl IntoResponse, ApiError> {
    let matches = container::with_label("subject", &auth.claims.sub);
    let daemons = container::list(&state.docker, &matches, false).await?;
    Ok(Json(daemons))
}

#[derive(Debug, Deserialize)]
pub struct KillQuery {
    /// Also destroy the daemon's volumes.
    #[serde(default)]
    pub wipe: bool,
}

/// `GET /daemon/v1/kill/{name}?wipe=` — kill an owned daemon by its unique
/// name.
pub async fn kill_handler(
    State(state): State<Arc<HerderState>>,
    auth: Authenticated,
    Path(name): Path<String>,
    Query(query): Query<KillQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let matches = container::all_of(vec![
        container::with_name(&name),
        container::with_label("subject", &auth.claims.sub),
    ]);
    let found = container::list(&state.docker, &matches, true).await?;
    if found.is_empty() {
        return Err(ApiError::NotFound(format!("No daemon named {name}")));
    }

    state.daemons.halt(&name).await;
    container::kill(&state.docker, &matches, query.wipe, true).await?;
    state.daemons.remove(&name).await;

    tracing::info!(daemon = %name, subject = %auth.claims.sub, "Killed daemon");
    Ok(format!("Daemon {name} killed"))
}

/// `GET /daemon/v1/attach/{name}` — bridge the daemon's stdio over a
/// websocket. Inbound frames go to the container's stdin; stdout and stderr
/// come back as binary frames.
pub async fn attach_handler(
    State(state): State<Arc<HerderState>>,
    auth: Authenticated,
    Path(name): Path<String>,
    ws: WebSocketUpgrade,
) -> axum::response::Response {
    let matches = container::all_of(vec![
        container::with_name(&name),
        container::with_label("subject", &auth.claims.sub),
    ]);
    let found = match container::list(&state.docker, &matches, false).await {
        Ok(found) => found,
        Err(e) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };
    if found.len() != 1 {
        return (StatusCode::NOT_FOUND, format!("No daemon named {name}")).into_response();
    }
    let id = found[0].id.clone().unwrap_or_default();

    ws.on_upgrade(move |socket| attach_socket(state, id, socket))
}

async fn attach_socket(state: Arc<HerderState>, id: String, socket: WebSocket) {
    let (stdin_tx, stdin_rx) = mpsc::channel::<Bytes>(32);
    let (output_tx, mut output_rx) = mpsc::channel::<StdioChunk>(32);

    let docker = state.docker.clone();
    let attach_id = id.clone();
    let attached = tokio::spawn(async move {
        if let Err(e) = container::attach(&docker, &attach_id, stdin_rx, output_tx).await {
            tracing::warn!(container = %attach_id, error = %e, "Attach failed");
        }
    });

    let (mut sink, mut stream) = socket.split();

    // Container output -> socket.
    let writer = tokio::spawn(async move {
        while let Some(chunk) = output_rx.recv().await {
            let bytes = match chunk {
                StdioChunk::StdOut(bytes) | StdioChunk::StdErr(bytes) => bytes,
            };
            if sink.send(Message::Binary(bytes)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Socket -> container stdin.
    while let Some(item) = stream.next().await {
        match item {
            Ok(Message::Text(text)) => {
                if stdin_tx.send(Bytes::from(text.to_string())).await.is_err() {
                    break;
                }
            }
            Ok(Message::Binary(bytes)) => {
                if stdin_tx.send(bytes).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    drop(stdin_tx);
    attached.abort();
    writer.abort();
    tracing::info!(container = %id, "Attach session closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_info_wire_shape() {
        let mut ports = HashMap::new();
        ports.insert(8080u16, 32768u16);
        let info = DaemonInfo {
            name: "svc-0190".to_string(),
            address: "172.17.0.2".to_string(),
            ports,
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["Name"], "svc-0190");
        assert_eq!(json["Address"], "172.17.0.2");
        assert_eq!(json["Ports"]["8080"], 32768);
    }

    #[test]
    fn test_ports_json_parses() {
        let ports: Vec<u16> = serde_json::from_str("[8080, 9090]").unwrap();
        assert_eq!(ports, vec![8080, 9090]);

        serde_json::from_str::<Vec<u16>>("8080").unwrap_err();
        serde_json::from_str::<Vec<u16>>("[\"eight\"]").unwrap_err();
    }

    #[test]
    fn test_unique_name_composition() {
        let name = "svc";
        let jti = "0190a5c8-deadbeef";
        assert_eq!(format!("{name}-{jti}"), "svc-0190a5c8-deadbeef");
    }
}
