//! Notification-driven detector.
//!
//! The OS watch is placed on the file's parent directory and filtered down to
//! events naming the monitored file. Watching the directory keeps signals
//! flowing after the file is rotated by rename-and-recreate, which would
//! orphan a watch placed on the file's inode.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::event::{AccessKind, AccessMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::{offer, ChangeSignal, DetectorError, SIGNAL_QUEUE_CAPACITY};

/// Raw notifications forwarded from the watcher thread.
type RawNotification = Result<(), notify::Error>;

/// Sets up the OS watch and spawns the throttling task.
pub(super) fn spawn(
    path: &Path,
    window: Duration,
    tx: mpsc::Sender<ChangeSignal>,
    cancel_token: CancellationToken,
) -> Result<JoinHandle<()>, DetectorError> {
    let (raw_tx, raw_rx) = mpsc::channel(SIGNAL_QUEUE_CAPACITY);
    let watcher = start_watcher(path, raw_tx)?;
    Ok(tokio::spawn(run(watcher, raw_rx, window, tx, cancel_token)))
}

fn start_watcher(
    path: &Path,
    raw_tx: mpsc::Sender<RawNotification>,
) -> Result<RecommendedWatcher, DetectorError> {
    let watch_error = |e: notify::Error| DetectorError::Watch {
        path: path.to_path_buf(),
        error: e.to_string(),
    };

    let target = path.file_name().map(OsString::from);
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            if is_relevant(&event, target.as_deref()) {
                // A full queue already holds a pending notification.
                let _ = raw_tx.try_send(Ok(()));
            }
        }
        Err(e) => {
            let _ = raw_tx.try_send(Err(e));
        }
    })
    .map_err(watch_error)?;

    let watch_path: PathBuf = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(path)
        .to_path_buf();
    watcher
        .watch(&watch_path, RecursiveMode::NonRecursive)
        .map_err(watch_error)?;

    debug!(watch_path = %watch_path.display(), "Watching for file changes");
    Ok(watcher)
}

/// Returns true for write-like events that name the monitored file.
fn is_relevant(event: &Event, target: Option<&std::ffi::OsStr>) -> bool {
    let write_like = matches!(
        event.kind,
        EventKind::Modify(_)
            | EventKind::Create(_)
            | EventKind::Access(AccessKind::Close(AccessMode::Write))
    );
    if !write_like {
        return false;
    }

    match target {
        Some(name) => event.paths.iter().any(|p| p.file_name() == Some(name)),
        None => true,
    }
}

/// Limits signals to one per window, deferring (not dropping) the rest.
///
/// A notification inside the window marks a signal as pending; the pending
/// signal fires when the window closes.
#[derive(Debug)]
struct Throttle {
    window: Duration,
    next_allowed: Option<Instant>,
    pending: bool,
}

impl Throttle {
    fn new(window: Duration) -> Self {
        Self {
            window,
            next_allowed: None,
            pending: false,
        }
    }

    /// Registers a notification. Returns true if a signal may go out now.
    fn notify(&mut self, now: Instant) -> bool {
        match self.next_allowed {
            Some(next) if now < next => {
                self.pending = true;
                false
            }
            _ => {
                self.fire(now);
                true
            }
        }
    }

    /// When the deferred signal is due, if one is pending.
    fn deadline(&self) -> Option<Instant> {
        if self.pending {
            self.next_allowed
        } else {
            None
        }
    }

    /// Records that a signal went out at `now`.
    fn fire(&mut self, now: Instant) {
        self.pending = false;
        self.next_allowed = Some(now + self.window);
    }
}

async fn run(
    watcher: RecommendedWatcher,
    mut raw_rx: mpsc::Receiver<RawNotification>,
    window: Duration,
    tx: mpsc::Sender<ChangeSignal>,
    cancel_token: CancellationToken,
) {
    // Dropping the watcher removes the OS watch.
    let _watcher = watcher;
    let mut throttle = Throttle::new(window);

    loop {
        let deadline = throttle.deadline();

        tokio::select! {
            biased;

            _ = cancel_token.cancelled() => {
                debug!("Event detector shutting down");
                break;
            }

            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                throttle.fire(Instant::now());
                if !offer(&tx) {
                    break;
                }
            }

            raw = raw_rx.recv() => match raw {
                Some(Ok(())) => {
                    if throttle.notify(Instant::now()) {
                        if !offer(&tx) {
                            break;
                        }
                    } else {
                        trace!("Change notification throttled");
                    }
                }
                Some(Err(e)) => {
                    error!(error = %e, "File notification source failed");
                    break;
                }
                None => {
                    warn!("File notification source closed");
                    break;
                }
            },
        }
    }
}
