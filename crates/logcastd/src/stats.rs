//! Pipeline counters and periodic resource logging.
//!
//! `TailStats` is shared by the tail loop and the broadcaster. The stats task
//! logs a snapshot together with the daemon's own memory and CPU usage at a
//! fixed interval.

use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sysinfo::{Pid, System};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::registry::SubscriberRegistry;

/// How often the stats task logs.
pub const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Counters for the tail pipeline.
#[derive(Debug, Default)]
pub struct TailStats {
    cycles: AtomicU64,
    failed_cycles: AtomicU64,
    rotations: AtomicU64,
    lines: AtomicU64,
    deliveries: AtomicU64,
    delivery_failures: AtomicU64,
}

impl TailStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_cycle(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_cycle(&self) {
        self.failed_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rotation(&self) {
        self.rotations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_line(&self) {
        self.lines.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deliveries(&self, delivered: u64, failed: u64) {
        self.deliveries.fetch_add(delivered, Ordering::Relaxed);
        self.delivery_failures.fetch_add(failed, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            failed_cycles: self.failed_cycles.load(Ordering::Relaxed),
            rotations: self.rotations.load(Ordering::Relaxed),
            lines: self.lines.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`TailStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub cycles: u64,
    pub failed_cycles: u64,
    pub rotations: u64,
    pub lines: u64,
    pub deliveries: u64,
    pub delivery_failures: u64,
}

/// Memory and CPU usage of this process.
#[derive(Debug, Clone, Copy, Default)]
struct ProcessUsage {
    memory_mb: u64,
    cpu_percent: f32,
}

fn sample_process(system: &mut System, pid: Pid) -> ProcessUsage {
    // CPU usage is only computed on a full refresh.
    system.refresh_all();
    system
        .process(pid)
        .map(|p| ProcessUsage {
            memory_mb: p.memory() / 1024 / 1024,
            cpu_percent: p.cpu_usage(),
        })
        .unwrap_or_default()
}

/// Spawns the periodic stats logger.
pub fn spawn_stats_task(
    stats: Arc<TailStats>,
    registry: SubscriberRegistry,
    period: Duration,
    cancel_token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut system = System::new();
        let pid = Pid::from_u32(process::id());
        let mut tick = interval(period);

        // Baseline for CPU usage; the first tick fires immediately.
        let _ = sample_process(&mut system, pid);
        tick.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = cancel_token.cancelled() => {
                    debug!("Stats task shutting down");
                    break;
                }

                _ = tick.tick() => {
                    let usage = sample_process(&mut system, pid);
                    let snap = stats.snapshot();
                    let subscribers = registry.len().await;
                    info!(
                        subscribers,
                        cycles = snap.cycles,
                        failed_cycles = snap.failed_cycles,
                        rotations = snap.rotations,
                        lines = snap.lines,
                        deliveries = snap.deliveries,
                        delivery_failures = snap.delivery_failures,
                        memory_mb = usage.memory_mb,
                        cpu_percent = format!("{:.1}", usage.cpu_percent),
                        "Tail stats"
                    );
                }
            }
        }
    })
}
