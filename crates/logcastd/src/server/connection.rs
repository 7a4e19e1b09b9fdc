//! Per-subscriber WebSocket connection handling.
//!
//! Each upgraded connection gets its own `ConnectionHandler` that:
//! - Wraps the write half as a [`LineSink`] and registers it
//! - Reads (and ignores) inbound frames to detect liveness
//! - Sends keep-alive pings
//! - Deregisters the subscriber when the inbound side closes or fails
//!
//! Every write (line, ping, close) is bounded by the write timeout, so a peer
//! that stops reading cannot park the handler.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Write failures are returned as `SendError` values

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use logcast_core::Line;
use tokio::sync::Mutex;
use tokio::time::{interval_at, timeout, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use warp::ws::{Message, WebSocket};

use crate::registry::{LineSink, SendError, Subscriber, SubscriberId, SubscriberRegistry};

/// Close code sent when the registry is full ("try again later").
const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

/// Close code sent on daemon shutdown ("going away").
const CLOSE_GOING_AWAY: u16 = 1001;

/// Outbound half of a subscriber's WebSocket.
pub struct WsSink {
    tx: Mutex<SplitSink<WebSocket, Message>>,
    peer: String,
    closed: AtomicBool,
    write_timeout: Duration,
}

impl WsSink {
    pub fn new(
        tx: SplitSink<WebSocket, Message>,
        peer: impl Into<String>,
        write_timeout: Duration,
    ) -> Self {
        Self {
            tx: Mutex::new(tx),
            peer: peer.into(),
            closed: AtomicBool::new(false),
            write_timeout,
        }
    }

    /// Sends a keep-alive ping.
    pub async fn ping(&self) -> Result<(), SendError> {
        self.write(Message::ping(Vec::new())).await
    }

    /// Sends a close frame and shuts the write half down.
    pub async fn close(&self, code: u16, reason: &'static str) -> Result<(), SendError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        bounded_write(self.write_timeout, async {
            let mut tx = self.tx.lock().await;
            let sent = tx.send(Message::close_with(code, reason)).await;
            let closed = tx.close().await;
            sent.and(closed)
                .map_err(|e| SendError::Transport(e.to_string()))
        })
        .await
    }

    async fn write(&self, msg: Message) -> Result<(), SendError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SendError::Closed);
        }

        bounded_write(self.write_timeout, async {
            let mut tx = self.tx.lock().await;
            tx.send(msg)
                .await
                .map_err(|e| SendError::Transport(e.to_string()))
        })
        .await
    }
}

/// Runs one write, lock acquisition included, under `limit`.
async fn bounded_write<F>(limit: Duration, write: F) -> Result<(), SendError>
where
    F: Future<Output = Result<(), SendError>>,
{
    match timeout(limit, write).await {
        Ok(result) => result,
        Err(_) => Err(SendError::Timeout(limit)),
    }
}

#[async_trait]
impl LineSink for WsSink {
    async fn send(&self, line: &Line) -> Result<(), SendError> {
        self.write(line_message(line)).await
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

/// One message per line: text when the bytes are UTF-8, binary otherwise.
pub fn line_message(line: &Line) -> Message {
    match line.as_str() {
        Some(text) => Message::text(text),
        None => Message::binary(line.as_bytes().to_vec()),
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Peer sent a close frame
    ClosedByPeer,

    /// Inbound stream ended without a close frame
    Eof,

    /// Inbound stream failed
    Error(String),

    /// Daemon is shutting down
    Shutdown,

    /// Registration was refused; the subscriber never joined
    Rejected(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClosedByPeer => write!(f, "closed by peer"),
            Self::Eof => write!(f, "end of stream"),
            Self::Error(e) => write!(f, "read error: {e}"),
            Self::Shutdown => write!(f, "shutdown"),
            Self::Rejected(e) => write!(f, "rejected: {e}"),
        }
    }
}

/// Connection handler for a single subscriber.
pub struct ConnectionHandler {
    id: SubscriberId,
    peer: String,
    registry: SubscriberRegistry,
    ping_interval: Option<Duration>,
    write_timeout: Duration,
    cancel_token: CancellationToken,
}

impl ConnectionHandler {
    /// Creates a new connection handler.
    ///
    /// # Arguments
    ///
    /// * `id` - Identity assigned to this subscriber
    /// * `peer` - Remote address, for logs
    /// * `registry` - Registry to join for the connection's lifetime
    /// * `ping_interval` - Keep-alive cadence, `None` to disable
    /// * `write_timeout` - Upper bound for any single write to the peer
    /// * `cancel_token` - Daemon shutdown token
    pub fn new(
        id: SubscriberId,
        peer: impl Into<String>,
        registry: SubscriberRegistry,
        ping_interval: Option<Duration>,
        write_timeout: Duration,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            id,
            peer: peer.into(),
            registry,
            ping_interval,
            write_timeout,
            cancel_token,
        }
    }

    /// Runs the connection until it closes, then deregisters it.
    pub async fn run(self, socket: WebSocket) -> DisconnectReason {
        let (tx, mut rx) = socket.split();
        let sink = Arc::new(WsSink::new(tx, self.peer.clone(), self.write_timeout));

        if let Err(e) = self
            .registry
            .add(Subscriber::new(self.id, sink.clone()))
            .await
        {
            warn!(
                subscriber = %self.id,
                peer = %self.peer,
                error = %e,
                "Rejecting subscriber"
            );
            if let Err(e) = sink.close(CLOSE_TRY_AGAIN_LATER, "too many subscribers").await {
                debug!(subscriber = %self.id, error = %e, "Failed to close rejected socket");
            }
            return DisconnectReason::Rejected(e.to_string());
        }

        info!(subscriber = %self.id, peer = %self.peer, "Subscriber connected");

        let reason = self.read_until_closed(&mut rx, &sink).await;

        self.registry.remove(self.id).await;
        info!(
            subscriber = %self.id,
            peer = %self.peer,
            reason = %reason,
            "Subscriber disconnected"
        );
        reason
    }

    /// Reads inbound frames until the peer goes away.
    ///
    /// Inbound content is ignored; reading only serves to notice closure.
    async fn read_until_closed(
        &self,
        rx: &mut SplitStream<WebSocket>,
        sink: &WsSink,
    ) -> DisconnectReason {
        let mut ping = self.ping_interval.map(|period| {
            let mut tick = interval_at(Instant::now() + period, period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tick
        });

        loop {
            tokio::select! {
                biased;

                _ = self.cancel_token.cancelled() => {
                    if let Err(e) = sink.close(CLOSE_GOING_AWAY, "server shutting down").await {
                        debug!(subscriber = %self.id, error = %e, "Failed to close socket");
                    }
                    return DisconnectReason::Shutdown;
                }

                frame = rx.next() => match frame {
                    Some(Ok(msg)) if msg.is_close() => return DisconnectReason::ClosedByPeer,
                    Some(Ok(msg)) => {
                        trace!(subscriber = %self.id, bytes = msg.as_bytes().len(), "Ignoring inbound frame");
                    }
                    Some(Err(e)) => return DisconnectReason::Error(e.to_string()),
                    None => return DisconnectReason::Eof,
                },

                _ = next_ping(&mut ping) => match sink.ping().await {
                    Ok(()) => {}
                    Err(e @ SendError::Timeout(_)) => {
                        warn!(subscriber = %self.id, error = %e, "Peer stopped reading, dropping it");
                        return DisconnectReason::Error(e.to_string());
                    }
                    Err(e) => {
                        debug!(subscriber = %self.id, error = %e, "Keep-alive ping failed");
                    }
                },
            }
        }
    }
}

/// Resolves on the next ping tick, or never if pings are disabled.
async fn next_ping(ping: &mut Option<Interval>) {
    match ping {
        Some(tick) => {
            tick.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utf8_line_is_text() {
        let msg = line_message(&Line::from("hello\n"));
        assert!(msg.is_text());
        assert_eq!(msg.to_str(), Ok("hello\n"));
    }

    #[test]
    fn test_non_utf8_line_is_binary() {
        let msg = line_message(&Line::new(vec![0xff, b'\n']));
        assert!(msg.is_binary());
        assert_eq!(msg.as_bytes(), &[0xff, b'\n']);
    }

    #[test]
    fn test_disconnect_reason_display() {
        assert_eq!(DisconnectReason::ClosedByPeer.to_string(), "closed by peer");
        assert_eq!(
            DisconnectReason::Error("reset".to_string()).to_string(),
            "read error: reset"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_write_times_out() {
        let limit = Duration::from_secs(10);
        let stalled = bounded_write(limit, std::future::pending());
        assert_eq!(stalled.await, Err(SendError::Timeout(limit)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_waiting_on_lock_times_out() {
        let held = Mutex::new(());
        let _guard = held.lock().await;

        let limit = Duration::from_millis(100);
        let result = bounded_write(limit, async {
            let _tx = held.lock().await;
            Ok(())
        })
        .await;

        assert_eq!(result, Err(SendError::Timeout(limit)));
    }

    #[tokio::test]
    async fn test_prompt_write_passes_through() {
        let limit = Duration::from_secs(1);
        assert_eq!(bounded_write(limit, async { Ok(()) }).await, Ok(()));
        assert_eq!(
            bounded_write(limit, async { Err(SendError::Closed) }).await,
            Err(SendError::Closed)
        );
    }
}
