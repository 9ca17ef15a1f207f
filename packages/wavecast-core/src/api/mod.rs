//! HTTP/WebSocket API layer.
//!
//! Thin handlers delegating to the registry and the source client. This
//! module owns router construction, the shared [`AppState`], and server
//! startup.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::Router;
use parking_lot::Mutex;
use thiserror::Error;
use tower_http::cors::CorsLayer;

use crate::config::Config;
use crate::protocol_constants::{CLIENT_UA, MAX_IDENTIFY_BODY};
use crate::rate_limit::RateLimitTables;
use crate::room::{RoomRegistry, SlugStore};
use crate::session::SessionService;

pub mod http;
pub mod relay;
pub mod ws;
pub mod ws_integration;

/// Errors that can occur when starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to the configured port.
    #[error("Failed to bind to port: {0}")]
    Bind(#[from] std::io::Error),
}

/// Cached ICE provider response with its fetch time.
pub(crate) type IceCache = Mutex<Option<(Instant, serde_json::Value)>>;

/// Shared application state for the API layer.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<RoomRegistry>,
    pub sessions: Arc<SessionService>,
    pub limits: Arc<RateLimitTables>,
    /// Shared client for catalog proxies, admin metadata pushes, and ICE
    /// credential fetches.
    pub http_client: reqwest::Client,
    pub(crate) ice_cache: Arc<IceCache>,
}

impl AppState {
    /// Wires up all services from a resolved configuration.
    pub fn build(config: Config) -> Self {
        let sessions = Arc::new(SessionService::new(config.session_secret.as_deref()));
        let slug_store = SlugStore::load(config.slug_history_path.clone());
        let registry = Arc::new(RoomRegistry::new(slug_store));
        let http_client = reqwest::Client::builder()
            .user_agent(CLIENT_UA)
            .build()
            .unwrap_or_default();
        Self {
            config: Arc::new(config),
            registry,
            sessions,
            limits: Arc::new(RateLimitTables::new()),
            http_client,
            ice_cache: Arc::new(Mutex::new(None)),
        }
    }

    /// Starts the periodic background tasks (room TTL sweep, rate-limit
    /// table sweep).
    pub fn start_background_tasks(&self) {
        self.registry.spawn_ttl_sweeper();
        self.limits.spawn_sweeper();
    }
}

/// Builds the full router: control/proxy endpoints, the relay stream, and
/// both upgrade paths.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/login", post(http::login))
        .route("/api/logout", post(http::logout))
        .route("/api/session", get(http::session_probe))
        .route("/api/ice-config", get(http::ice_config))
        .route("/api/integration-test", post(http::integration_test))
        .route("/api/music-search", get(http::music_search))
        .route("/api/music-detail/{id}", get(http::music_detail))
        .route(
            "/api/identify-audio",
            post(http::identify_audio).layer(DefaultBodyLimit::max(MAX_IDENTIFY_BODY)),
        )
        .route("/admin/rooms", get(http::admin_rooms))
        .route("/api/room-slugs", get(http::list_room_slugs))
        .route("/api/room-slugs/{slug}", delete(http::delete_room_slug))
        .route("/stream/{room_id}", get(relay::stream_room))
        .route("/ws", get(ws::handler))
        .route("/integration-stream", get(ws_integration::handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Binds the configured port and serves until the process exits.
pub async fn start_server(state: AppState) -> Result<(), ServerError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("Server listening on http://{}", addr);

    let app = create_router(state);
    // ConnectInfo gives handlers the socket peer address for rate limiting.
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
