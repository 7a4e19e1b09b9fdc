//! Fan-out of one line to every registered subscriber.
//!
//! For each line the broadcaster takes a registry snapshot (shared access),
//! starts one timed send per subscriber, and waits for all of them before
//! returning. Holding the snapshot across the whole fan-out is what keeps
//! per-subscriber order: line N+1 is never handed out while any send of line
//! N is still running.
//!
//! A failed or timed-out send is logged and counted. It does not remove the
//! subscriber; removal belongs to the transport, which notices when the
//! connection's inbound side goes away.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use logcast_core::Line;
use tokio::time::timeout;
use tracing::{trace, warn};

use crate::registry::{SendError, Subscriber, SubscriberId, SubscriberRegistry};
use crate::stats::TailStats;

/// Outcome of broadcasting one line.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Subscribers in the snapshot
    pub attempted: usize,

    /// Sends that completed successfully
    pub delivered: usize,

    /// Sends that failed or timed out
    pub failed: Vec<(SubscriberId, SendError)>,
}

/// Delivers lines to the subscriber registry.
#[derive(Clone)]
pub struct Broadcaster {
    registry: SubscriberRegistry,
    send_timeout: Duration,
    max_concurrent_sends: usize,
    stats: Arc<TailStats>,
}

impl Broadcaster {
    /// Creates a broadcaster.
    ///
    /// # Arguments
    ///
    /// * `registry` - Subscriber set to deliver to
    /// * `send_timeout` - Upper bound for one send to one subscriber
    /// * `max_concurrent_sends` - Bound on sends in flight for one line
    /// * `stats` - Shared pipeline counters
    pub fn new(
        registry: SubscriberRegistry,
        send_timeout: Duration,
        max_concurrent_sends: usize,
        stats: Arc<TailStats>,
    ) -> Self {
        Self {
            registry,
            send_timeout,
            max_concurrent_sends: max_concurrent_sends.max(1),
            stats,
        }
    }

    /// Sends `line` to every current subscriber and waits for all sends to
    /// finish or time out.
    pub async fn broadcast(&self, line: &Line) -> BroadcastReport {
        let snapshot = self.registry.snapshot().await;
        if snapshot.is_empty() {
            trace!("No subscribers, line not sent");
            return BroadcastReport::default();
        }

        // Each send owns its subscriber and line; the guard stays held until
        // every send has finished.
        let subscribers: Vec<Subscriber> = snapshot.iter().cloned().collect();
        let attempted = subscribers.len();
        let line = Arc::new(line.clone());
        let send_timeout = self.send_timeout;
        let outcomes: Vec<(SubscriberId, Result<(), SendError>)> = stream::iter(subscribers)
            .map(|subscriber| deliver(subscriber, Arc::clone(&line), send_timeout))
            .buffer_unordered(self.max_concurrent_sends)
            .collect()
            .await;

        // Add/remove may proceed only once every send of this line is done.
        drop(snapshot);

        let mut report = BroadcastReport {
            attempted,
            ..Default::default()
        };
        for (id, outcome) in outcomes {
            match outcome {
                Ok(()) => report.delivered += 1,
                Err(e) => report.failed.push((id, e)),
            }
        }

        self.stats
            .record_deliveries(report.delivered as u64, report.failed.len() as u64);
        report
    }
}

async fn deliver(
    subscriber: Subscriber,
    line: Arc<Line>,
    send_timeout: Duration,
) -> (SubscriberId, Result<(), SendError>) {
    let result = match timeout(send_timeout, subscriber.sink().send(&line)).await {
        Ok(result) => result,
        Err(_) => Err(SendError::Timeout(send_timeout)),
    };

    if let Err(ref e) = result {
        warn!(
            subscriber = %subscriber.id(),
            peer = %subscriber.sink().peer(),
            error = %e,
            "Failed to deliver line to subscriber"
        );
    }

    (subscriber.id(), result)
}
