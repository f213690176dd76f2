/* igdaemon: user-space daemon multiplexing access to IguanaWorks USB
 * IR transceivers.
 *
 * Each device is owned exclusively by this process and exposed to any
 * number of local clients over per-device Unix sockets.  main() is
 * deliberately thin: parse the command line, set up logging, fork if
 * asked, then hand everything to the registry's command loop. */

mod catalog;
mod client;
mod codec;
mod device;
mod error;
mod hotplug;
mod packet;
mod reader;
mod registry;
mod sockets;
mod transactor;
mod usb;
mod versions;
mod worker;

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Parser};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::device::DeviceSettings;
use crate::registry::{Command, Registry, ServerSettings};

/// igdaemon — user-space driver for IguanaWorks IR transceivers.
#[derive(Parser)]
#[command(name = "igdaemon", version, about)]
struct Args {
    /// Do not fork into the background.
    #[arg(short = 'n', long)]
    no_daemon: bool,

    /// Milliseconds each device read waits before looping.
    #[arg(long = "receive-timeout", value_name = "MS", default_value_t = 1000,
          value_parser = clap::value_parser!(u64).range(0..=10_000))]
    receive_timeout: u64,

    /// Milliseconds allowed for a device write or acknowledgement.
    #[arg(long = "send-timeout", value_name = "MS", default_value_t = 1000,
          value_parser = clap::value_parser!(u64).range(0..=10_000))]
    send_timeout: u64,

    /// Detach kernel drivers before claiming a device.
    #[arg(long = "auto-unbind")]
    auto_unbind: bool,

    /// Treat EPIPE from a device transfer as a disconnect.
    #[arg(long = "no-ignore-epipe")]
    no_ignore_epipe: bool,

    /// Implies --no-daemon.  List detected devices and exit.
    #[arg(long)]
    devices: bool,

    /// Write the daemon's pid to this file.
    #[arg(short = 'p', long = "pid-file", value_name = "FILE")]
    pid_file: Option<PathBuf>,

    /// Use this USB backend in preference to others.  May be given
    /// multiple times.
    #[arg(short = 'd', long = "driver", value_name = "DRIVER")]
    driver: Vec<String>,

    /// Use only the backends named by --driver.
    #[arg(long = "only-preferred")]
    only_preferred: bool,

    /// Accepted for compatibility; backends are compiled in.
    #[arg(long = "driver-dir", value_name = "DIR")]
    driver_dir: Option<PathBuf>,

    /// Do not rescan the USB bus after a device disconnect.
    #[arg(long = "no-auto-rescan")]
    no_auto_rescan: bool,

    /// Do not query devices for their stored labels.
    #[arg(long = "no-ids")]
    no_ids: bool,

    /// Rescan the bus every SECS seconds regardless of hotplug
    /// events.  0 disables the timer.
    #[arg(long = "scan-timer", value_name = "SECS", default_value_t = 0,
          value_parser = clap::value_parser!(u64).range(0..=3600))]
    scan_timer: u64,

    /// Directory the listening sockets live in.
    #[arg(long = "socket-root", value_name = "DIR",
          default_value = sockets::DEFAULT_SOCKET_ROOT)]
    socket_root: PathBuf,

    /// Log level: error, warn, info, debug, or trace.
    #[arg(long = "log-level", value_name = "LEVEL")]
    log_level: Option<String>,

    /// Append log output to this file instead of stderr.
    #[arg(long = "log-file", value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Log less.  May be given multiple times.
    #[arg(short = 'q', action = ArgAction::Count)]
    quiet: u8,

    /// Log more.  May be given multiple times.
    #[arg(short = 'v', action = ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn log_filter(&self) -> EnvFilter {
        if let Some(level) = &self.log_level {
            return EnvFilter::new(level.clone());
        }

        const LEVELS: &[&str] = &["off", "error", "warn", "info", "debug", "trace"];
        let base = 3i32; /* info */
        let idx = (base + self.verbose as i32 - self.quiet as i32)
            .clamp(0, LEVELS.len() as i32 - 1) as usize;
        EnvFilter::new(LEVELS[idx])
    }
}

fn init_logging(args: &Args) {
    let filter = args.log_filter();
    match &args.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .unwrap_or_else(|e| {
                    eprintln!("cannot open log file {}: {e}", path.display());
                    std::process::exit(2);
                });
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(3);
        }
    };

    /* fork before the runtime exists; a forked tokio runtime is not a
     * usable one */
    if !args.no_daemon && !args.devices {
        if let Err(e) = nix::unistd::daemon(false, false) {
            eprintln!("daemon() failed: {e}");
            return ExitCode::from(1);
        }
    }

    init_logging(&args);

    if let Some(path) = &args.pid_file {
        let written = std::fs::File::create(path)
            .and_then(|mut f| writeln!(f, "{}", std::process::id()));
        if let Err(e) = written {
            error!("failed to write pid file {}: {e}", path.display());
            return ExitCode::from(2);
        }
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to start the runtime: {e}");
            return ExitCode::from(1);
        }
    };

    runtime.block_on(run(args))
}

async fn run(args: Args) -> ExitCode {
    if let Some(dir) = &args.driver_dir {
        info!("ignoring --driver-dir {}: backends are compiled in", dir.display());
    }

    let Some(backend) = usb::select_backend(&args.driver, args.only_preferred) else {
        error!("no usable USB backend");
        return ExitCode::from(1);
    };

    if args.devices {
        return list_devices(backend.as_ref()).await;
    }

    let settings = ServerSettings {
        socket_root: args.socket_root.clone(),
        device: DeviceSettings {
            recv_timeout: Duration::from_millis(args.receive_timeout),
            send_timeout: Duration::from_millis(args.send_timeout),
            disconnect_on_epipe: args.no_ignore_epipe,
        },
        auto_rescan: !args.no_auto_rescan,
        read_labels: Arc::new(AtomicBool::new(!args.no_ids)),
        unbind: args.auto_unbind,
    };
    info!(
        "timeouts: receive {}ms, send {}ms",
        args.receive_timeout, args.send_timeout
    );

    let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(16);

    spawn_signal_handlers(cmd_tx.clone());
    hotplug::spawn(cmd_tx.clone());
    if args.scan_timer > 0 {
        registry::spawn_scan_timer(Duration::from_secs(args.scan_timer), cmd_tx.clone());
    }

    Registry::new(backend, settings).run(cmd_rx).await;
    info!("shutdown complete");
    ExitCode::SUCCESS
}

async fn list_devices(backend: &dyn usb::UsbBackend) -> ExitCode {
    match backend.enumerate().await {
        Ok(found) => {
            let list: Vec<registry::DeviceSummary> = found
                .iter()
                .enumerate()
                .map(|(i, d)| registry::DeviceSummary {
                    id: i as u32,
                    location: d.location.to_string(),
                    label: None,
                })
                .collect();
            match serde_json::to_string_pretty(&list) {
                Ok(text) => println!("{text}"),
                Err(e) => {
                    error!("cannot render device list: {e}");
                    return ExitCode::from(1);
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("scan failed: {e}");
            ExitCode::from(1)
        }
    }
}

/// Signals only post commands; the registry loop is the single
/// consumer that acts on them.
fn spawn_signal_handlers(commands: mpsc::Sender<Command>) {
    for (kind, command) in [
        (SignalKind::interrupt(), Command::Quit),
        (SignalKind::terminate(), Command::Quit),
        (SignalKind::hangup(), Command::Scan),
    ] {
        let commands = commands.clone();
        tokio::spawn(async move {
            let mut stream = match signal(kind) {
                Ok(s) => s,
                Err(e) => {
                    warn!("cannot install signal handler: {e}");
                    return;
                }
            };
            while stream.recv().await.is_some() {
                if command == Command::Quit {
                    info!("triggering shutdown");
                }
                if commands.send(command).await.is_err() {
                    break;
                }
            }
        });
    }
}
