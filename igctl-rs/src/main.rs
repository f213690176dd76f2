/* igctl: command-line tool to exercise IguanaWorks IR transceivers
 * through a running igdaemon, over its Unix socket interface. */
mod daemon_client;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use daemon_client::{DaemonClient, DEFAULT_SOCKET_ROOT};

/// igctl — talk to IguanaWorks IR transceivers via igdaemon.
#[derive(Parser)]
#[command(name = "igctl", version, about)]
struct Cli {
    /// Directory the daemon's sockets live in.
    #[arg(long = "socket-root", value_name = "DIR", default_value = DEFAULT_SOCKET_ROOT)]
    socket_root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List devices known to the daemon.
    Devices,

    /// Wait for attach/detach events and print them.
    Monitor,

    /// Show a device's firmware version.
    Version {
        /// Device id or alias (from `igctl devices`).
        device: String,
    },

    /// Show a device's feature flags.
    Features {
        device: String,
    },

    /// Show a device's receive buffer size.
    Bufsize {
        device: String,
    },

    /// Transmit a pulse file.
    Send {
        device: String,
        /// File of `pulse <usec>` / `space <usec>` lines.
        file: PathBuf,
    },

    /// Receive IR codes and print them as pulse lines.
    Receive {
        device: String,
        /// Print undecoded firmware bytes instead.
        #[arg(long)]
        raw: bool,
        /// Stop after this many packets (0 = forever).
        #[arg(long, default_value_t = 0)]
        count: u32,
    },

    /// Get or set the transmit channel mask.
    Channels {
        device: String,
        /// New mask (omit to read the current one).
        mask: Option<u8>,
    },

    /// Get or set the transmit carrier frequency in Hz.
    Carrier {
        device: String,
        /// New frequency (omit to read the current one).
        hz: Option<u32>,
    },

    /// Get or set the device label.
    Id {
        device: String,
        /// New label, at most 12 bytes (omit to read).
        label: Option<String>,
    },

    /// Show the device's USB location word.
    Location {
        device: String,
    },

    /// Show the GPIO pin configuration as hex bytes.
    PinConfig {
        device: String,
        /// Eight new config bytes, hex (omit to read).
        bytes: Vec<String>,
    },

    /// Show the GPIO pin levels.
    Pins {
        device: String,
        /// Two new pin-state bytes, hex (omit to read).
        bytes: Vec<String>,
    },

    /// Put the device into repeater mode.
    Repeater {
        device: String,
    },

    /// Execute the code block stored on the device.
    Execute {
        device: String,
    },

    /// Reset the device.
    Reset {
        device: String,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Devices => {
            let mut ctl = DaemonClient::connect(&cli.socket_root, "ctl").await?;
            let reply = ctl.request(daemon_client::CTL_LIST_DEVICES, &[]).await?;
            println!("{}", String::from_utf8_lossy(&reply.payload));
        }

        Commands::Monitor => {
            let mut ctl = DaemonClient::connect(&cli.socket_root, "ctl").await?;
            ctl.request(daemon_client::CTL_SUBSCRIBE, &[]).await?;
            loop {
                let event = ctl.read_frame().await?;
                if event.opcode == daemon_client::CTL_EVENT {
                    println!("{}", String::from_utf8_lossy(&event.payload));
                }
            }
        }

        Commands::Version { device } => {
            let mut dev = DaemonClient::connect(&cli.socket_root, &device).await?;
            let reply = dev.request(daemon_client::DEV_GETVERSION, &[]).await?;
            if reply.payload.len() != 2 {
                bail!("unexpected version response");
            }
            let version = u16::from_le_bytes([reply.payload[0], reply.payload[1]]);
            println!("firmware version: {version:#06x}");
        }

        Commands::Features { device } => {
            let mut dev = DaemonClient::connect(&cli.socket_root, &device).await?;
            let reply = dev.request(daemon_client::DEV_GETFEATURES, &[]).await?;
            match reply.payload.first() {
                Some(flags) => println!("features: {flags:#04x}"),
                None => println!("no feature flags reported"),
            }
        }

        Commands::Bufsize { device } => {
            let mut dev = DaemonClient::connect(&cli.socket_root, &device).await?;
            let reply = dev.request(daemon_client::DEV_GETBUFSIZE, &[]).await?;
            match reply.payload.first() {
                Some(size) => println!("buffer size: {size}"),
                None => bail!("unexpected buffer size response"),
            }
        }

        Commands::Send { device, file } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let pulses = daemon_client::parse_pulse_file(&text)?;

            let mut dev = DaemonClient::connect(&cli.socket_root, &device).await?;
            dev.request(
                daemon_client::DEV_SEND,
                &daemon_client::pulses_to_bytes(&pulses),
            )
            .await?;
            println!("sent {} pulses", pulses.len());
        }

        Commands::Receive { device, raw, count } => {
            let mut dev = DaemonClient::connect(&cli.socket_root, &device).await?;
            let on = if raw {
                daemon_client::DEV_RAWRECVON
            } else {
                daemon_client::DEV_RECVON
            };
            dev.request(on, &[]).await?;

            let mut seen = 0u32;
            while count == 0 || seen < count {
                let frame = dev.read_frame().await?;
                if frame.opcode != daemon_client::DEV_RECV {
                    continue;
                }
                if raw {
                    let hex: Vec<String> =
                        frame.payload.iter().map(|b| format!("{b:02x}")).collect();
                    println!("{}", hex.join(" "));
                } else {
                    print!("{}", daemon_client::format_pulses(&frame.payload));
                }
                seen += 1;
            }
            /* receives may still be in flight; skip past them to the
             * RECVOFF response */
            dev.write_frame(daemon_client::DEV_RECVOFF, &[]).await?;
            loop {
                let frame = dev.read_frame().await?;
                if frame.opcode == daemon_client::DEV_RECVOFF {
                    break;
                }
            }
        }

        Commands::Channels { device, mask } => {
            let mut dev = DaemonClient::connect(&cli.socket_root, &device).await?;
            match mask {
                Some(mask) => {
                    dev.request(daemon_client::DEV_SETCHANNELS, &[mask]).await?;
                    println!("channels set to {mask:#04x}");
                }
                None => {
                    let reply = dev.request(daemon_client::DEV_GETCHANNELS, &[]).await?;
                    match reply.payload.first() {
                        Some(mask) => println!("channels: {mask:#04x}"),
                        None => bail!("unexpected channels response"),
                    }
                }
            }
        }

        Commands::Carrier { device, hz } => {
            let mut dev = DaemonClient::connect(&cli.socket_root, &device).await?;
            match hz {
                Some(hz) => {
                    let reply = dev
                        .request(daemon_client::DEV_SETCARRIER, &hz.to_be_bytes())
                        .await?;
                    if reply.payload.len() == 4 {
                        let actual = u32::from_be_bytes([
                            reply.payload[0],
                            reply.payload[1],
                            reply.payload[2],
                            reply.payload[3],
                        ]);
                        println!("carrier set to {actual} Hz");
                    }
                }
                None => {
                    let reply = dev.request(daemon_client::DEV_GETCARRIER, &[]).await?;
                    if reply.payload.len() != 4 {
                        bail!("unexpected carrier response");
                    }
                    let hz = u32::from_be_bytes([
                        reply.payload[0],
                        reply.payload[1],
                        reply.payload[2],
                        reply.payload[3],
                    ]);
                    println!("carrier: {hz} Hz");
                }
            }
        }

        Commands::Id { device, label } => {
            let mut dev = DaemonClient::connect(&cli.socket_root, &device).await?;
            match label {
                Some(label) => {
                    if label.len() > 12 {
                        bail!("labels are at most 12 bytes");
                    }
                    dev.request(daemon_client::DEV_SETID, label.as_bytes()).await?;
                    println!("label written; it takes effect after the next reset");
                }
                None => {
                    let reply = dev.request(daemon_client::DEV_GETID, &[]).await?;
                    let end = reply
                        .payload
                        .iter()
                        .position(|&b| b == 0)
                        .unwrap_or(reply.payload.len());
                    println!("{}", String::from_utf8_lossy(&reply.payload[..end]));
                }
            }
        }

        Commands::Location { device } => {
            let mut dev = DaemonClient::connect(&cli.socket_root, &device).await?;
            let reply = dev.request(daemon_client::DEV_GETLOCATION, &[]).await?;
            if reply.payload.len() != 2 {
                bail!("unexpected location response");
            }
            println!(
                "location: {:#06x}",
                u16::from_le_bytes([reply.payload[0], reply.payload[1]])
            );
        }

        Commands::PinConfig { device, bytes } => {
            let mut dev = DaemonClient::connect(&cli.socket_root, &device).await?;
            if bytes.is_empty() {
                let reply = dev.request(daemon_client::DEV_GETPINCONFIG, &[]).await?;
                let hex: Vec<String> =
                    reply.payload.iter().map(|b| format!("{b:02x}")).collect();
                println!("pin config: {}", hex.join(" "));
            } else {
                let parsed = parse_hex_bytes(&bytes, 8)?;
                dev.request(daemon_client::DEV_SETPINCONFIG, &parsed).await?;
                println!("pin config written");
            }
        }

        Commands::Pins { device, bytes } => {
            let mut dev = DaemonClient::connect(&cli.socket_root, &device).await?;
            if bytes.is_empty() {
                let reply = dev.request(daemon_client::DEV_GETPINS, &[]).await?;
                let hex: Vec<String> =
                    reply.payload.iter().map(|b| format!("{b:02x}")).collect();
                println!("pins: {}", hex.join(" "));
            } else {
                let parsed = parse_hex_bytes(&bytes, 2)?;
                dev.request(daemon_client::DEV_SETPINS, &parsed).await?;
                println!("pins written");
            }
        }

        Commands::Repeater { device } => {
            let mut dev = DaemonClient::connect(&cli.socket_root, &device).await?;
            dev.request(daemon_client::DEV_REPEATER, &[]).await?;
            println!("repeater mode enabled until the next reset");
        }

        Commands::Execute { device } => {
            let mut dev = DaemonClient::connect(&cli.socket_root, &device).await?;
            dev.request(daemon_client::DEV_EXECUTE, &[]).await?;
            println!("code block executed");
        }

        Commands::Reset { device } => {
            let mut dev = DaemonClient::connect(&cli.socket_root, &device).await?;
            dev.request(daemon_client::DEV_RESET, &[]).await?;
            println!("device reset");
        }
    }

    Ok(())
}

fn parse_hex_bytes(words: &[String], want: usize) -> Result<Vec<u8>> {
    if words.len() != want {
        bail!("expected {want} hex bytes, got {}", words.len());
    }
    words
        .iter()
        .map(|w| {
            u8::from_str_radix(w.trim_start_matches("0x"), 16)
                .with_context(|| format!("bad hex byte {w:?}"))
        })
        .collect()
}
