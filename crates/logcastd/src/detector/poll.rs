//! Fixed-interval detector.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{offer, ChangeSignal};

/// Emits one signal per `period` until cancelled or the receiver is dropped.
pub(super) async fn run(
    period: Duration,
    tx: mpsc::Sender<ChangeSignal>,
    cancel_token: CancellationToken,
) {
    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // The first tick completes immediately; the first signal comes one period in.
    tick.tick().await;

    loop {
        tokio::select! {
            biased;

            _ = cancel_token.cancelled() => {
                debug!("Poll detector shutting down");
                break;
            }

            _ = tick.tick() => {
                if !offer(&tx) {
                    break;
                }
            }
        }
    }
}
