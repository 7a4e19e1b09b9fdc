//! The tail loop: one orchestration task per monitored file.
//!
//! On each change signal the loop scans the file, hands every complete line
//! to the broadcaster in file order, and only then commits the new offset:
//!
//! ```text
//!  ChangeDetector ──signal──▶ TailCycle::run_once
//!                               │ scan (blocking pool)   MonitoredFile::scan
//!                               │ for line in scan.lines Broadcaster::broadcast (joined)
//!                               │ commit                 MonitoredFile::apply
//!                               └─ repeat while the read window was partial
//! ```
//!
//! The `MonitoredFile` is owned by this task alone. A cycle is never raced
//! against cancellation: shutdown is observed between cycles, so an
//! in-flight broadcast always runs to completion.

use std::sync::Arc;

use logcast_core::{FileChange, MonitoredFile, Scan, TailError};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broadcast::Broadcaster;
use crate::config::DEFAULT_MAX_READ_BYTES;
use crate::detector::ChangeDetector;
use crate::stats::TailStats;

/// Summary of one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Classification of the first scan in the cycle
    pub change: FileChange,

    /// Lines handed to the broadcaster
    pub lines: usize,

    /// Individual sends that failed
    pub failed_deliveries: usize,

    /// Read windows used
    pub windows: usize,
}

/// Tail state machine for one file.
pub struct TailCycle {
    file: MonitoredFile,
    broadcaster: Broadcaster,
    max_read_bytes: u64,
    stats: Arc<TailStats>,
}

impl TailCycle {
    pub fn new(file: MonitoredFile, broadcaster: Broadcaster, stats: Arc<TailStats>) -> Self {
        Self {
            file,
            broadcaster,
            max_read_bytes: DEFAULT_MAX_READ_BYTES,
            stats,
        }
    }

    /// Sets the read window size.
    pub fn with_max_read_bytes(mut self, max_read_bytes: u64) -> Self {
        self.max_read_bytes = max_read_bytes.max(1);
        self
    }

    pub fn file(&self) -> &MonitoredFile {
        &self.file
    }

    /// Runs one cycle.
    ///
    /// On error nothing is committed for the failing window; windows already
    /// delivered earlier in the same cycle stay committed.
    pub async fn run_once(&mut self) -> Result<CycleReport, CycleError> {
        self.stats.record_cycle();

        let mut scan = self.scan().await?;
        let mut report = CycleReport {
            change: scan.change,
            lines: 0,
            failed_deliveries: 0,
            windows: 0,
        };

        loop {
            report.windows += 1;

            if scan.change == FileChange::Rotated {
                self.stats.record_rotation();
                info!(
                    path = %self.file.path().display(),
                    previous_size = self.file.last_known_size(),
                    size = scan.observed_size,
                    "File rotated, reading from the start"
                );
            }
            if scan.oversized {
                warn!(
                    path = %self.file.path().display(),
                    offset = scan.start_offset,
                    bytes = scan.end_offset - scan.start_offset,
                    "Line exceeds read window, delivering it in pieces"
                );
            }

            for line in &scan.lines {
                let outcome = self.broadcaster.broadcast(line).await;
                self.stats.record_line();
                report.lines += 1;
                report.failed_deliveries += outcome.failed.len();
            }

            self.file.apply(&scan);
            debug!(
                offset = self.file.last_offset(),
                size = self.file.last_known_size(),
                lines = scan.lines.len(),
                "Committed read window"
            );

            if !scan.is_partial() {
                break;
            }
            scan = self.scan().await?;
        }

        Ok(report)
    }

    async fn scan(&self) -> Result<Scan, CycleError> {
        let file = self.file.clone();
        let max_read_bytes = self.max_read_bytes;
        let scan = tokio::task::spawn_blocking(move || file.scan(max_read_bytes))
            .await
            .map_err(|e| CycleError::Join(e.to_string()))??;
        Ok(scan)
    }

    /// Runs cycles on every signal until cancelled or the detector stops.
    pub async fn run(mut self, mut detector: ChangeDetector, cancel_token: CancellationToken) {
        info!(
            path = %self.file.path().display(),
            offset = self.file.last_offset(),
            strategy = %detector.strategy(),
            "Tail loop started"
        );

        loop {
            let signal = tokio::select! {
                biased;

                _ = cancel_token.cancelled() => {
                    info!("Tail loop shutting down");
                    break;
                }

                signal = detector.next() => signal,
            };

            if signal.is_none() {
                error!(
                    path = %self.file.path().display(),
                    "Change detector stopped, tail loop exiting"
                );
                break;
            }

            // Signals queued so far are covered by the scan about to run.
            // Anything arriving during the cycle stays queued for the next one.
            let coalesced = detector.drain();
            if coalesced > 0 {
                debug!(coalesced, "Coalesced queued change signals");
            }

            match self.run_once().await {
                Ok(report) if report.lines > 0 => {
                    debug!(
                        lines = report.lines,
                        failed_deliveries = report.failed_deliveries,
                        windows = report.windows,
                        "Tail cycle complete"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    self.stats.record_failed_cycle();
                    error!(
                        error = %e,
                        offset = self.file.last_offset(),
                        "Tail cycle failed, will retry on next signal"
                    );
                }
            }
        }
    }
}

/// Spawns the tail loop for one file.
pub fn spawn_tail(
    cycle: TailCycle,
    detector: ChangeDetector,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(cycle.run(detector, cancel_token))
}

/// Errors that abort one cycle.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CycleError {
    #[error(transparent)]
    Tail(#[from] TailError),

    #[error("Read task failed: {0}")]
    Join(String),
}
