//! WebSocket server for the logcast daemon.
//!
//! The server:
//! - Upgrades `GET /ws` to a WebSocket and runs a `ConnectionHandler` per
//!   subscriber
//! - Serves `GET /healthz` with the subscriber count
//! - Shuts down gracefully via `CancellationToken`
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  DaemonServer   │
//! │  (warp filter)  │
//! └───────┬─────────┘
//!         │ upgrade
//!         ▼
//! ┌─────────────────┐  add/remove  ┌────────────────────┐  snapshot  ┌─────────────┐
//! │ConnectionHandler│─────────────▶│ SubscriberRegistry │◀───────────│ Broadcaster │
//! │ (per subscriber)│              └────────────────────┘            └─────────────┘
//! └─────────────────┘
//! ```

mod connection;

pub use connection::{line_message, ConnectionHandler, DisconnectReason, WsSink};

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use warp::ws::Ws;
use warp::{Filter, Rejection, Reply};

use crate::config::{DEFAULT_PING_INTERVAL_SECS, DEFAULT_SEND_TIMEOUT_MS};
use crate::registry::{SubscriberId, SubscriberRegistry};

/// Path segment of the WebSocket endpoint.
pub const WS_PATH: &str = "ws";

/// Path segment of the health endpoint.
pub const HEALTH_PATH: &str = "healthz";

/// State shared by every request.
#[derive(Clone)]
struct ServerContext {
    registry: SubscriberRegistry,
    connection_counter: Arc<AtomicU64>,
    ping_interval: Option<Duration>,
    write_timeout: Duration,
    cancel_token: CancellationToken,
    started_at: DateTime<Utc>,
}

impl ServerContext {
    fn next_id(&self) -> SubscriberId {
        SubscriberId::new(self.connection_counter.fetch_add(1, Ordering::Relaxed))
    }
}

/// Body of `GET /healthz`.
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    subscribers: usize,
    started_at: DateTime<Utc>,
}

/// WebSocket server for the logcast daemon.
pub struct DaemonServer {
    addr: SocketAddr,
    context: ServerContext,
}

impl DaemonServer {
    /// Creates a new daemon server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Address to listen on (port 0 picks a free port)
    /// * `registry` - Registry that connections join
    /// * `cancel_token` - Token for graceful shutdown
    pub fn new(
        addr: SocketAddr,
        registry: SubscriberRegistry,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            addr,
            context: ServerContext {
                registry,
                connection_counter: Arc::new(AtomicU64::new(0)),
                ping_interval: Some(Duration::from_secs(DEFAULT_PING_INTERVAL_SECS)),
                write_timeout: Duration::from_millis(DEFAULT_SEND_TIMEOUT_MS),
                cancel_token,
                started_at: Utc::now(),
            },
        }
    }

    /// Sets the keep-alive ping cadence (`None` disables pings).
    pub fn with_ping_interval(mut self, ping_interval: Option<Duration>) -> Self {
        self.context.ping_interval = ping_interval;
        self
    }

    /// Sets the bound for pings and close frames written to a subscriber.
    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.context.write_timeout = write_timeout;
        self
    }

    /// The route filter, usable directly with `warp::test`.
    pub fn routes(&self) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
        let context = self.context.clone();
        let with_context = warp::any().map(move || context.clone());

        let subscribe = warp::path(WS_PATH)
            .and(warp::path::end())
            .and(warp::ws())
            .and(warp::addr::remote())
            .and(with_context.clone())
            .map(|ws: Ws, remote: Option<SocketAddr>, context: ServerContext| {
                let id = context.next_id();
                let peer = remote
                    .map(|addr| addr.to_string())
                    .unwrap_or_else(|| "unknown".to_string());

                ws.on_upgrade(move |socket| async move {
                    let handler = ConnectionHandler::new(
                        id,
                        peer,
                        context.registry.clone(),
                        context.ping_interval,
                        context.write_timeout,
                        context.cancel_token.clone(),
                    );
                    handler.run(socket).await;
                })
            });

        let health = warp::path(HEALTH_PATH)
            .and(warp::path::end())
            .and(warp::get())
            .and(with_context)
            .and_then(health_handler);

        subscribe.or(health)
    }

    /// Binds the listener.
    ///
    /// Returns the bound address and the server future, which resolves once
    /// the cancellation token fires.
    ///
    /// # Errors
    ///
    /// `ServerError::Bind` if the address cannot be bound.
    pub fn bind(&self) -> Result<(SocketAddr, impl Future<Output = ()> + 'static), ServerError> {
        let cancel_token = self.context.cancel_token.clone();
        warp::serve(self.routes())
            .try_bind_with_graceful_shutdown(self.addr, async move {
                cancel_token.cancelled().await;
            })
            .map_err(|e| ServerError::Bind {
                addr: self.addr,
                error: e.to_string(),
            })
    }

    /// Runs the server until the cancellation token fires.
    pub async fn run(&self) -> Result<(), ServerError> {
        let (addr, server) = self.bind()?;
        info!(addr = %addr, path = %format!("/{WS_PATH}"), "Daemon server listening");

        server.await;

        self.context.registry.clear().await;
        info!("Server cleanup complete");
        Ok(())
    }
}

async fn health_handler(context: ServerContext) -> Result<impl Reply, Infallible> {
    Ok(warp::reply::json(&HealthResponse {
        status: "ok",
        subscribers: context.registry.len().await,
        started_at: context.started_at,
    }))
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {error}")]
    Bind { addr: SocketAddr, error: String },
}
