//! Change detection for the monitored file.
//!
//! A `ChangeDetector` is a lazy, possibly lossy stream of [`ChangeSignal`]s.
//! Each signal only means "the file may have changed, check it now". The
//! tail loop re-derives everything from the file itself, so signals can be
//! dropped or coalesced without losing data.
//!
//! Two strategies produce the same stream:
//!
//! ```text
//!  Poll:   interval timer ───────────────────────────────┐
//!                                                        ▼
//!  Event:  notify watcher ──▶ raw queue ──▶ Throttle ──▶ signal queue (cap 100) ──▶ TailCycle
//!          (parent dir)                   (1 per window)    try_send, drop if full
//! ```
//!
//! Both stop when the cancellation token fires or when the receiving side is
//! dropped, releasing the timer or the OS watch.

mod event;
mod poll;

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Capacity of the queue between a detector and the tail loop.
pub const SIGNAL_QUEUE_CAPACITY: usize = 100;

/// Default poll interval / throttle window.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

/// A payload-free "re-check the file now" event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChangeSignal;

/// Which detector to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DetectionStrategy {
    /// OS write notifications, throttled to one signal per window
    #[default]
    Event,

    /// Fixed-interval timer
    Poll,
}

impl fmt::Display for DetectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Event => write!(f, "event"),
            Self::Poll => write!(f, "poll"),
        }
    }
}

/// Handle to a running detector task.
pub struct ChangeDetector {
    strategy: DetectionStrategy,
    signals: mpsc::Receiver<ChangeSignal>,
    task: JoinHandle<()>,
}

impl ChangeDetector {
    /// Starts the detector selected by `strategy`.
    ///
    /// `interval` is the poll period for [`DetectionStrategy::Poll`] and the
    /// throttle window for [`DetectionStrategy::Event`].
    ///
    /// # Errors
    ///
    /// `DetectorError::Watch` if OS notifications cannot be set up for
    /// `path`. The poll strategy never fails.
    pub fn spawn(
        strategy: DetectionStrategy,
        path: &Path,
        interval: Duration,
        cancel_token: CancellationToken,
    ) -> Result<Self, DetectorError> {
        match strategy {
            DetectionStrategy::Poll => Ok(Self::poll(interval, cancel_token)),
            DetectionStrategy::Event => Self::watch(path, interval, cancel_token),
        }
    }

    /// Starts a fixed-interval detector.
    pub fn poll(interval: Duration, cancel_token: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(SIGNAL_QUEUE_CAPACITY);
        let task = tokio::spawn(poll::run(interval, tx, cancel_token));
        info!(interval_ms = interval.as_millis() as u64, "Poll detector started");

        Self {
            strategy: DetectionStrategy::Poll,
            signals: rx,
            task,
        }
    }

    /// Starts a notification-driven detector throttled to one signal per
    /// `window`.
    pub fn watch(
        path: &Path,
        window: Duration,
        cancel_token: CancellationToken,
    ) -> Result<Self, DetectorError> {
        let (tx, rx) = mpsc::channel(SIGNAL_QUEUE_CAPACITY);
        let task = event::spawn(path, window, tx, cancel_token)?;
        info!(
            path = %path.display(),
            window_ms = window.as_millis() as u64,
            "Event detector started"
        );

        Ok(Self {
            strategy: DetectionStrategy::Event,
            signals: rx,
            task,
        })
    }

    pub fn strategy(&self) -> DetectionStrategy {
        self.strategy
    }

    /// Waits for the next signal.
    ///
    /// Returns `None` once the detector has stopped, either through
    /// cancellation or because its notification source failed.
    pub async fn next(&mut self) -> Option<ChangeSignal> {
        self.signals.recv().await
    }

    /// Discards signals that are already queued and returns how many.
    pub fn drain(&mut self) -> usize {
        let mut drained = 0;
        while self.signals.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }

}

impl Drop for ChangeDetector {
    fn drop(&mut self) {
        // Releases the timer or OS watch even if cancellation never fires.
        self.task.abort();
    }
}

/// Offers a signal without blocking.
///
/// Returns false when the receiver is gone and the detector should stop.
fn offer(tx: &mpsc::Sender<ChangeSignal>) -> bool {
    match tx.try_send(ChangeSignal) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            debug!("Change signal queue full, dropping signal");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("Change signal receiver dropped");
            false
        }
    }
}

/// Errors that can occur while starting a detector.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DetectorError {
    #[error("Failed to watch {path}: {error}")]
    Watch {
        path: std::path::PathBuf,
        error: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_strategy_is_event() {
        assert_eq!(DetectionStrategy::default(), DetectionStrategy::Event);
    }

    #[test]
    fn test_strategy_display() {
        assert_eq!(DetectionStrategy::Event.to_string(), "event");
        assert_eq!(DetectionStrategy::Poll.to_string(), "poll");
    }

    #[test]
    fn test_offer_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        assert!(offer(&tx));
        assert!(offer(&tx));
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_offer_reports_closed() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        assert!(!offer(&tx));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_counts_queued_signals() {
        let cancel = CancellationToken::new();
        let mut detector = ChangeDetector::poll(Duration::from_millis(10), cancel.clone());

        tokio::time::sleep(Duration::from_millis(55)).await;
        tokio::task::yield_now().await;
        let drained = detector.drain();
        assert!(drained >= 1, "expected queued signals, got {drained}");
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_detector_task() {
        let detector = ChangeDetector::poll(Duration::from_secs(60), CancellationToken::new());
        let task = detector.task.abort_handle();

        drop(detector);
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(task.is_finished());
    }
}
