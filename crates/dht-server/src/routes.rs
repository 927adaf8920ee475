//! Router construction, token auth and the loopback listener.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};

use dht_db::Database;

use crate::handlers;
use crate::state::{AppState, ServerContext};

/// Default request body cap: 32 MiB.
pub const DEFAULT_MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Header carrying the session token on POST requests.
const TOKEN_HEADER: &str = "X-DHT-Token";

/// Listener configuration supplied by the shell.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// 0 asks the OS for an ephemeral port.
    pub port: u16,
    pub token: String,
    pub max_body_bytes: usize,
}

impl ServerConfig {
    pub fn new(port: u16, token: impl Into<String>) -> Self {
        Self {
            port,
            token: token.into(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

/// Where the server actually landed.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub addr: SocketAddr,
    pub token: String,
}

/// Token check for every endpoint.
///
/// POST requests present the token in the `X-DHT-Token` header, GET
/// requests in the `token` query parameter. Mismatch is a bare 403 and the
/// request never reaches a handler, so the database stays untouched.
async fn require_token(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let presented = if req.method() == Method::POST {
        req.headers()
            .get(TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    } else {
        req.uri().query().and_then(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .find(|(key, _)| key == "token")
                .map(|(_, value)| value.into_owned())
        })
    };

    if presented.as_deref() == Some(state.token.as_str()) {
        next.run(req).await
    } else {
        tracing::warn!(path = %req.uri().path(), "request with missing or invalid token");
        StatusCode::FORBIDDEN.into_response()
    }
}

/// Build the ingest router.
///
/// CORS is wide open: the capture script posts cross-origin from the chat
/// site, and the token is the actual gate.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let auth = middleware::from_fn_with_state(state.clone(), require_token);

    Router::new()
        .route("/track-channel", post(handlers::track_channel))
        .route("/track-users", post(handlers::track_users))
        .route("/track-messages", post(handlers::track_messages))
        .route("/get-attachment", get(handlers::get_attachment))
        .route_layer(auth)
        .layer(DefaultBodyLimit::max(state.max_body_bytes))
        .layer(cors)
        .with_state(state)
}

/// Bind the loopback listener and serve until the task is aborted.
pub async fn start_server(
    db: Arc<Database>,
    config: ServerConfig,
) -> std::io::Result<(ServerInfo, JoinHandle<()>)> {
    let token = config.token.clone();
    let state: AppState = Arc::new(ServerContext {
        db,
        token: token.clone(),
        max_body_bytes: config.max_body_bytes,
    });
    let app = build_router(state);

    let listener =
        tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], config.port))).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "ingest endpoint listening");

    let handle = tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, app).await {
            tracing::error!(%error, "ingest server error");
        }
    });

    Ok((ServerInfo { addr, token }, handle))
}
