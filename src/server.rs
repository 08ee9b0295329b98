use axum::routing::get;
use axum::Router;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::{HeartbeatConfig, Platform, RunConfig};
use crate::error::ParamedicError;
use crate::events::{EventKind, Subscription};
use crate::resolver::{resolve_connection_url, UrlSources};
use crate::session::{RunStats, Session};

/// How long `shutdown` waits for open connections to drain before aborting
/// the listener task.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// State shared with the route handlers.
pub struct ServerState {
    pub session: Arc<Session>,
    pub heartbeat: HeartbeatConfig,
}

pub type SharedState = Arc<ServerState>;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub platform: Platform,
    pub external_server_url: Option<String>,
    pub use_tunnel: bool,
    pub heartbeat: HeartbeatConfig,
}

impl ServerOptions {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            external_server_url: None,
            use_tunnel: false,
            heartbeat: HeartbeatConfig::default(),
        }
    }

    pub fn from_config(config: &RunConfig, platform: Platform) -> Self {
        Self {
            platform,
            external_server_url: config.external_server_url.clone(),
            use_tunnel: config.use_tunnel,
            heartbeat: config.heartbeat,
        }
    }
}

pub fn build_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Device socket
        .route("/", get(crate::routes::device::device_socket))
        // Diagnostics
        .route("/health", get(crate::routes::health::health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Local server the device under test reports its results to. Owns exactly
/// one [`Session`] for its whole lifetime.
pub struct EventServer {
    port: u16,
    options: ServerOptions,
    session: Arc<Session>,
    tunnel_url: Option<String>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl EventServer {
    /// Bind `port` on all interfaces and start serving. A port that is already
    /// taken is reported as `ServerBind`; picking another one is the port
    /// allocator's job.
    pub async fn start(port: u16, options: ServerOptions) -> Result<Self, ParamedicError> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ParamedicError::ServerBind { port, source })?;
        let port = listener.local_addr()?.port();

        let session = Arc::new(Session::new());
        let state = Arc::new(ServerState {
            session: session.clone(),
            heartbeat: options.heartbeat,
        });
        let router = build_router(state);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = result {
                error!("local-server: server error: {}", e);
            }
        });

        info!("local-server: listening on port {}", port);
        Ok(Self {
            port,
            options,
            session,
            tunnel_url: None,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Record the public URL of a tunnel forwarding to this server.
    pub fn attach_tunnel(&mut self, url: impl Into<String>) {
        let url = url.into();
        info!("local-server: tunnel url {}", url);
        self.tunnel_url = Some(url);
    }

    /// URL the device should connect to.
    pub fn connection_url(&self) -> Result<String, ParamedicError> {
        resolve_connection_url(UrlSources {
            platform: self.options.platform,
            port: self.port,
            tunnel_url: self.tunnel_url.as_deref(),
            external_server_url: self.options.external_server_url.as_deref(),
            use_tunnel: self.options.use_tunnel,
        })
    }

    pub async fn is_device_connected(&self) -> bool {
        self.session.is_device_connected().await
    }

    pub async fn stats(&self) -> RunStats {
        self.session.stats().await
    }

    pub async fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        self.session.subscribe(kinds).await
    }

    /// Number of device connections accepted since start or the last reset.
    pub fn connections(&self) -> watch::Receiver<u64> {
        self.session.connections()
    }

    /// Drop the current connection and statistics and start a new session on
    /// the same listener.
    pub async fn reset(&self) {
        self.session.reset().await;
    }

    /// Close the session and the listener. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        self.session.shutdown().await;

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                warn!("local-server: connections did not drain, aborting listener");
                task.abort();
            }
            info!("local-server: stopped listening on port {}", self.port);
        }
    }
}

impl Drop for EventServer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
