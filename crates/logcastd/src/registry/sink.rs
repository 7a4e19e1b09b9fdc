//! The per-subscriber send primitive.

use std::time::Duration;

use async_trait::async_trait;
use logcast_core::Line;
use thiserror::Error;

/// Outbound half of one subscriber's connection.
///
/// Implemented by the transport layer. A failed send is reported as a value;
/// implementations must not panic.
#[async_trait]
pub trait LineSink: Send + Sync {
    /// Sends one line, trailing delimiter included, as one message.
    async fn send(&self, line: &Line) -> Result<(), SendError>;

    /// Human-readable peer description for logs.
    fn peer(&self) -> String {
        String::from("unknown")
    }
}

/// Why a delivery to one subscriber failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("Send timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection closed")]
    Closed,

    #[error("Transport error: {0}")]
    Transport(String),
}
