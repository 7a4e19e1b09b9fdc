//! logcast daemon - live tail of a log file over WebSocket
//!
//! This binary watches one log file and streams every newly appended line
//! to all WebSocket clients connected to `/ws`.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! logcastd start --logfile /var/log/app.log
//!
//! # Start the daemon (background/daemonized)
//! logcastd start -d --logfile /var/log/app.log --port 9211
//!
//! # Poll every 250ms instead of using file notifications
//! logcastd start --strategy poll --interval-ms 250
//!
//! # Stop the daemon
//! logcastd stop
//!
//! # Check daemon status
//! logcastd status
//!
//! # Use a config file
//! LOGCAST_CONFIG=/etc/logcast.toml logcastd start
//!
//! # Enable debug logging
//! RUST_LOG=logcastd=debug logcastd start
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: Graceful shutdown
//!
//! # Files
//!
//! The PID file and detached-mode output live in `$LOGCAST_STATE_DIR`,
//! defaulting to `<state dir>/logcast`.

use std::env;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use logcast_core::MonitoredFile;
use logcastd::broadcast::Broadcaster;
use logcastd::config::{DaemonConfig, CONFIG_ENV};
use logcastd::detector::{ChangeDetector, DetectionStrategy};
use logcastd::registry::SubscriberRegistry;
use logcastd::server::{DaemonServer, WS_PATH};
use logcastd::stats::{spawn_stats_task, TailStats, STATS_INTERVAL};
use logcastd::tail::{spawn_tail, TailCycle};

/// logcast daemon - stream a log file to WebSocket subscribers
#[derive(Parser, Debug)]
#[command(name = "logcastd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,

        #[command(flatten)]
        overrides: ConfigOverrides,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status {
        #[command(flatten)]
        overrides: ConfigOverrides,
    },
}

/// Command-line settings layered over the config file.
#[derive(clap::Args, Debug, Default)]
struct ConfigOverrides {
    /// TOML config file (defaults to $LOGCAST_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log file to tail
    #[arg(long = "logfile")]
    log_file: Option<PathBuf>,

    /// Host to listen on
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Change detection strategy
    #[arg(long, value_enum)]
    strategy: Option<DetectionStrategy>,

    /// Poll interval, or throttle window for the event strategy (ms)
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Per-subscriber send timeout (ms)
    #[arg(long)]
    send_timeout_ms: Option<u64>,
}

impl ConfigOverrides {
    /// Builds the effective configuration: defaults, then file, then flags.
    fn resolve(self) -> Result<DaemonConfig> {
        let config_path = self
            .config
            .or_else(|| env::var_os(CONFIG_ENV).map(PathBuf::from));

        let mut config = match config_path {
            Some(path) => DaemonConfig::load(&path)?,
            None => DaemonConfig::default(),
        };

        if let Some(log_file) = self.log_file {
            config.log_file = log_file;
        }
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(strategy) = self.strategy {
            config.strategy = strategy;
        }
        if let Some(interval_ms) = self.interval_ms {
            config.interval_ms = interval_ms;
        }
        if let Some(send_timeout_ms) = self.send_timeout_ms {
            config.send_timeout_ms = send_timeout_ms;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Overrides the directory holding the PID file and daemon output.
const STATE_DIR_ENV: &str = "LOGCAST_STATE_DIR";

/// How long `stop` waits for the daemon to exit.
const STOP_WAIT: Duration = Duration::from_secs(5);

/// The daemon's PID file and detached-mode output, kept side by side.
#[derive(Debug, Clone)]
struct RuntimeFiles {
    dir: PathBuf,
}

impl RuntimeFiles {
    /// `$LOGCAST_STATE_DIR`, else `<state dir>/logcast`, else `/tmp/logcast`.
    fn locate() -> Self {
        let dir = env::var_os(STATE_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::state_dir()
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join("logcast")
            });
        Self { dir }
    }

    fn pid_file(&self) -> PathBuf {
        self.dir.join("logcastd.pid")
    }

    fn output_log(&self) -> PathBuf {
        self.dir.join("logcastd.log")
    }

    fn recorded_pid(&self) -> Option<u32> {
        fs::read_to_string(self.pid_file()).ok()?.trim().parse().ok()
    }

    /// The PID of a live daemon. A PID file left by a dead one is removed.
    fn running_pid(&self) -> Option<u32> {
        let pid = self.recorded_pid()?;
        if process_alive(pid) {
            Some(pid)
        } else {
            self.release();
            None
        }
    }

    fn claim(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create state directory {}", self.dir.display()))?;
        fs::write(self.pid_file(), process::id().to_string()).context("Failed to write PID file")
    }

    fn release(&self) {
        let _ = fs::remove_file(self.pid_file());
    }

    /// Forks into the background with stdout/stderr appended to the output log.
    fn detach(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).context("Failed to create log directory")?;

        let open = || {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.output_log())
                .context("Failed to open daemon output log")
        };

        daemonize::Daemonize::new()
            .working_directory("/")
            .stdout(open()?)
            .stderr(open()?)
            .start()
            .context("Failed to daemonize")
    }
}

fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

/// Asks `pid` to shut down gracefully.
fn send_terminate(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        // SAFETY: kill has no memory-safety preconditions.
        if unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) } != 0 {
            bail!("Failed to send SIGTERM to process {pid}");
        }
    }
    #[cfg(not(unix))]
    {
        bail!("Stop command is only supported on Unix systems (pid {pid})");
    }
    Ok(())
}

/// Polls until `pid` exits or `limit` passes. Returns true if it exited.
fn wait_for_exit(pid: u32, limit: Duration) -> bool {
    let step = Duration::from_millis(100);
    let mut waited = Duration::ZERO;
    while waited < limit {
        if !process_alive(pid) {
            return true;
        }
        std::thread::sleep(step);
        waited += step;
    }
    !process_alive(pid)
}

fn main() -> Result<()> {
    let args = Args::parse();

    let command = args.command.unwrap_or(Command::Start {
        daemon: false,
        overrides: ConfigOverrides::default(),
    });

    let runtime = RuntimeFiles::locate();

    match command {
        Command::Start { daemon, overrides } => {
            if let Some(pid) = runtime.running_pid() {
                eprintln!("Daemon is already running (PID {pid})");
                eprintln!("Use 'logcastd stop' to stop it first.");
                process::exit(1);
            }

            let mut config = overrides.resolve()?;

            // Daemonizing changes the working directory, so pin the path first.
            config.log_file = fs::canonicalize(&config.log_file).with_context(|| {
                format!("Cannot monitor log file {}", config.log_file.display())
            })?;

            // Must happen before the tokio runtime exists.
            if daemon {
                runtime.detach()?;
            }

            runtime.claim()?;
            let result = run_daemon(config);
            runtime.release();

            result
        }
        Command::Stop => {
            let Some(pid) = runtime.running_pid() else {
                println!("Daemon is not running.");
                return Ok(());
            };

            println!("Stopping daemon (PID {pid})...");
            send_terminate(pid)?;

            if wait_for_exit(pid, STOP_WAIT) {
                println!("Daemon stopped.");
                Ok(())
            } else {
                eprintln!("Daemon did not stop within {} seconds.", STOP_WAIT.as_secs());
                process::exit(1);
            }
        }
        Command::Status { overrides } => {
            let Some(pid) = runtime.running_pid() else {
                println!("Daemon is not running.");
                process::exit(1);
            };

            println!("Daemon is running (PID {pid})");
            if let Ok(config) = overrides.resolve() {
                println!("Tailing: {}", config.log_file.display());
                println!("Listening: ws://{}:{}/{}", config.host, config.port, WS_PATH);
            }
            println!("Output: {}", runtime.output_log().display());
            Ok(())
        }
    }
}

/// Runs the daemon (async entry point).
#[tokio::main]
async fn run_daemon(config: DaemonConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("logcastd=info".parse()?)
                .add_directive("logcast_core=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        log_file = %config.log_file.display(),
        strategy = %config.strategy,
        interval_ms = config.interval_ms,
        "logcast daemon starting"
    );

    let cancel_token = CancellationToken::new();
    cancel_on_signal(cancel_token.clone())?;

    let registry = SubscriberRegistry::new(config.max_subscribers);
    let stats = TailStats::new();

    // Startup failures below are fatal: the daemon never serves without a file to tail.
    let file = MonitoredFile::open(&config.log_file).context("Cannot begin monitoring log file")?;
    let detector = ChangeDetector::spawn(
        config.strategy,
        file.path(),
        config.interval(),
        cancel_token.clone(),
    )
    .context("Cannot start change detection")?;

    let server = DaemonServer::new(config.listen_addr()?, registry.clone(), cancel_token.clone())
        .with_ping_interval(config.ping_interval())
        .with_write_timeout(config.send_timeout());

    let broadcaster = Broadcaster::new(
        registry.clone(),
        config.send_timeout(),
        config.max_concurrent_sends,
        stats.clone(),
    );
    let cycle = TailCycle::new(file, broadcaster, stats.clone())
        .with_max_read_bytes(config.max_read_bytes);
    let tail_handle = spawn_tail(cycle, detector, cancel_token.clone());

    let _stats_handle = spawn_stats_task(stats, registry.clone(), STATS_INTERVAL, cancel_token.clone());

    let served = server.run().await;

    // A bind failure ends the daemon too; otherwise the token already fired.
    cancel_token.cancel();

    // Let an in-flight broadcast finish before exiting.
    if let Err(e) = tail_handle.await {
        error!(error = %e, "Tail task panicked");
    }
    served?;

    info!("logcast daemon stopped");
    Ok(())
}

/// Installs SIGTERM/SIGINT handlers that cancel `token` on first delivery.
///
/// Handlers are registered before this returns, so a failure to install them
/// is a startup error rather than an immediate shutdown.
#[cfg(unix)]
fn cancel_on_signal(token: CancellationToken) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
            _ = token.cancelled() => return,
        };
        info!(signal = name, "Shutdown signal received");
        token.cancel();
    });
    Ok(())
}

#[cfg(not(unix))]
fn cancel_on_signal(token: CancellationToken) -> Result<()> {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!(signal = "ctrl-c", "Shutdown signal received"),
            Err(e) => error!(error = %e, "Error waiting for Ctrl+C, shutting down"),
        }
        token.cancel();
    });
    Ok(())
}
