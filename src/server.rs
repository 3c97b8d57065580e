//! The herder's public HTTP surface.
//!
//! Assembles every endpoint onto one axum router: golem lifecycle, the
//! broker's websocket upgrades, minion lambdas, metered daemons and token
//! issuing. Errors are plain-text bodies with the status codes doing the
//! talking.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use bollard::Docker;
use serde::Deserialize;
use serde_json::json;
use subtle::ConstantTimeEq;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::broker::{self, Hub};
use crate::config::Config;
use crate::daemon::{self, DaemonRegistry};
use crate::error::{ContainerError, LedgerError, TokenError};
use crate::golem;
use crate::ledger::Ledger;
use crate::minion;
use crate::token::{TokenManager, TokenReply};

/// Response timeout for plain HTTP routes. Socket upgrades and container
/// spawns run under their own deadlines.
const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// Default credit grant for generated tokens.
const DEFAULT_CREDITS: i64 = 30_000;

/// The bootstrap script served to browsers, with `{{baseUrl}}` substituted.
const EMET_TEMPLATE: &str = include_str!("../assets/emet.js");

/// Shared state for every handler.
pub struct HerderState {
    pub config: Config,
    pub docker: Docker,
    pub hub: Hub,
    pub ledger: Ledger,
    pub tokens: TokenManager,
    pub daemons: DaemonRegistry,
    pub http: reqwest::Client,
}

/// Error reply carrying the herder's status conventions.
#[derive(Debug)]
pub enum ApiError {
    /// 400 — malformed form input.
    BadInput(String),
    /// 401 — missing or invalid credentials.
    Unauthorized(String),
    /// 402 — the subject's balance is exhausted.
    PaymentRequired,
    /// 404 — no such golem/minion/daemon.
    NotFound(String),
    /// 405 — the endpoint is disabled by configuration.
    MethodNotAllowed(String),
    /// 409 — duplicate golem connect.
    Conflict(String),
    /// 500 — engine or store failure.
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::BadInput(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            Self::PaymentRequired => {
                (StatusCode::PAYMENT_REQUIRED, "No credits left".to_string())
            }
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::MethodNotAllowed(msg) => (StatusCode::METHOD_NOT_ALLOWED, msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, body).into_response()
    }
}

impl From<ContainerError> for ApiError {
    fn from(e: ContainerError) -> Self {
        match e {
            ContainerError::NotFound => Self::NotFound(e.to_string()),
            ContainerError::NotUnique(_)
            | ContainerError::Engine(_)
            | ContainerError::Timeout { .. }
            | ContainerError::Io(_) => Self::Internal(e.to_string()),
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::NoCredits { .. } => Self::PaymentRequired,
            LedgerError::Store(_) => Self::Internal(e.to_string()),
        }
    }
}

impl From<TokenError> for ApiError {
    fn from(e: TokenError) -> Self {
        Self::Unauthorized(e.to_string())
    }
}

/// Build the complete router.
pub fn router(state: Arc<HerderState>) -> Router {
    let plain = Router::new()
        .route("/", get(home_handler))
        .route("/golem/v1/", get(home_handler))
        .route("/golem/v1/ls", get(golem_ls_handler))
        .route("/golem/v1/spawn/{wsid}", get(golem_spawn_handler))
        .route("/golem/v1/reset/{wsid}", get(golem_reset_handler))
        .route("/golem/v1/kill/{wsid}", get(golem_kill_handler))
        .route("/daemon/v1/ls", get(daemon::list_handler))
        .route("/daemon/v1/kill/{name}", get(daemon::kill_handler))
        .route("/token/v1/generate", get(token_generate_handler))
        .route("/token/v1/inspect/{token}", get(token_inspect_handler))
        .route_layer(TimeoutLayer::new(HTTP_TIMEOUT));

    // Spawns run containers under their own deadlines; socket routes live
    // for the whole session. Neither gets the response timeout.
    let long_lived = Router::new()
        .route("/minion/v1/spawn", post(minion::spawn_handler))
        .route("/daemon/v1/spawn", post(daemon::spawn_handler))
        .route("/golem/v1/connect/{wsid}", get(broker::golem_connect_handler))
        .route(
            "/golem/v1/connect-to/{wsid}/{minion}",
            get(broker::golem_minion_connect_handler),
        )
        .route(
            "/minion/v1/connect/{wsid}",
            get(broker::minion_connect_handler),
        )
        .route("/daemon/v1/attach/{name}", get(daemon::attach_handler));

    let mut app = plain.merge(long_lived);
    if state.config.proxy {
        app = app.route(
            "/golem/v1/proxy/{wsid}/{*rest}",
            any(golem::proxy::proxy_handler),
        );
    }

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Bind and serve in the background; returns the bound address. Binding to
/// port 0 picks a free port, which the tests rely on.
pub async fn start_server(
    addr: SocketAddr,
    state: Arc<HerderState>,
) -> std::io::Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound = listener.local_addr()?;
    let app = router(state);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "HTTP server failed");
        }
    });
    Ok(bound)
}

// ── Bootstrap script ────────────────────────────────────────────

fn render_emet(base_url: &str) -> String {
    EMET_TEMPLATE.replace("{{baseUrl}}", base_url)
}

/// `GET /` and `GET /golem/v1/` — the bootstrap script.
async fn home_handler(State(state): State<Arc<HerderState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/javascript")],
        render_emet(&state.config.url),
    )
}

// ── Golem lifecycle ─────────────────────────────────────────────

async fn golem_ls_handler(
    State(state): State<Arc<HerderState>>,
) -> Result<impl IntoResponse, ApiError> {
    let golems = golem::list(&state.docker, &state.config).await?;
    Ok(Json(golems))
}

async fn golem_spawn_handler(
    State(state): State<Arc<HerderState>>,
    Path(wsid): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = golem::spawn(&state.docker, &state.config, &wsid).await?;
    Ok(format!("{id} lumbering along"))
}

async fn golem_reset_handler(
    State(state): State<Arc<HerderState>>,
    Path(wsid): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = golem::restart(&state.docker, &state.config, &wsid).await?;
    Ok(format!("Reset done - new container {id}"))
}

async fn golem_kill_handler(
    State(state): State<Arc<HerderState>>,
    Path(wsid): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    golem::kill(&state.docker, &state.config, &wsid).await?;
    Ok(format!("Golem for {wsid} is no more"))
}

// ── Tokens ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GenerateQuery {
    password: Option<String>,
    email: Option<String>,
    credits: Option<i64>,
}

/// `GET /token/v1/generate?password=&email=&credits=` — issue a token,
/// guarded by the configured shared secret.
async fn token_generate_handler(
    State(state): State<Arc<HerderState>>,
    Query(query): Query<GenerateQuery>,
) -> Result<Json<TokenReply>, ApiError> {
    let Some(configured) = state.config.token_password() else {
        tracing::warn!("Trying to generate token with no token password set");
        return Err(ApiError::MethodNotAllowed(
            "No token password set".to_string(),
        ));
    };

    let supplied = query.password.unwrap_or_default();
    if !bool::from(supplied.as_bytes().ct_eq(configured.as_bytes())) {
        tracing::warn!("Unauthorized token generation attempt");
        return Err(ApiError::Unauthorized("Invalid password".to_string()));
    }

    let email = query
        .email
        .filter(|email| !email.is_empty())
        .unwrap_or_else(|| "none".to_string());
    let credits = query.credits.unwrap_or(DEFAULT_CREDITS);

    let mut extra = serde_json::Map::new();
    extra.insert("crd".to_string(), json!(credits));
    let token = state.tokens.generate(&email, extra)?;

    tracing::info!(email = %email, credits, "Generated token");
    Ok(Json(TokenReply {
        token,
        email,
        credits,
    }))
}

/// `GET /token/v1/inspect/{token}` — remaining credits for the token's
/// subject. An unparseable token is a 404, not a 401: the token names the
/// resource here.
async fn token_inspect_handler(
    State(state): State<Arc<HerderState>>,
    Path(token): Path<String>,
) -> Result<Json<TokenReply>, ApiError> {
    let claims = state
        .tokens
        .validate(&token)
        .map_err(|e| ApiError::NotFound(e.to_string()))?;
    let credits = state.ledger.credits(&claims.sub)?;
    Ok(Json(TokenReply {
        token,
        email: claims.sub,
        credits,
    }))
}
