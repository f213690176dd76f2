/* Device registry and daemon control plane.
 *
 * The registry owns the device list: it enumerates hardware through
 * the selected USB backend, assigns each new device the lowest free
 * id (freed ids are reused), spawns a reader/worker pair per device,
 * and reaps workers when they exit.  All control flow arrives on one
 * command channel: signal handlers, the scan timer, and the hotplug
 * monitor only ever post Quit or Scan.
 *
 * The registry also answers on the daemon-level ctl socket, where
 * clients list devices and subscribe to attach/detach events. */

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::net::UnixStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::device::{reader_channels, DeviceSettings, DeviceState};
use crate::packet::{opcode, Packet, PROTOCOL_VERSION};
use crate::reader;
use crate::sockets;
use crate::usb::{BusAddress, UsbBackend, UsbError};
use crate::worker::{DeviceAliases, DeviceWorker, WorkerConfig, WorkerMessage};

/// Commands posted to the registry's single consumer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Quit,
    Scan,
}

/* requests understood on the ctl socket, after the usual handshake */
pub mod ctl {
    /// Reply payload: a JSON array of device summaries.
    pub const LIST_DEVICES: u8 = 0x01;
    /// Switches the connection to a stream of EVENT frames.
    pub const SUBSCRIBE: u8 = 0x02;
    /// Unsolicited frame carrying a JSON attach/detach event.
    pub const EVENT: u8 = 0x03;
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub id: u32,
    pub location: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum DeviceEvent {
    Attached { device: DeviceSummary },
    Detached { id: u32 },
}

#[derive(Clone)]
pub struct ServerSettings {
    pub socket_root: PathBuf,
    pub device: DeviceSettings,
    pub auto_rescan: bool,
    pub read_labels: Arc<AtomicBool>,
    pub unbind: bool,
}

struct DeviceEntry {
    id: u32,
    location: BusAddress,
    state: Arc<DeviceState>,
    worker: JoinHandle<()>,
}

pub struct Registry {
    backend: Arc<dyn UsbBackend>,
    settings: ServerSettings,
    devices: Vec<DeviceEntry>,

    worker_tx: mpsc::Sender<WorkerMessage>,
    worker_rx: mpsc::Receiver<WorkerMessage>,

    /// Shared with the ctl socket handlers.
    summaries: Arc<Mutex<Vec<DeviceSummary>>>,
    events: broadcast::Sender<DeviceEvent>,
}

impl Registry {
    pub fn new(backend: Arc<dyn UsbBackend>, settings: ServerSettings) -> Self {
        let (worker_tx, worker_rx) = mpsc::channel(16);
        let (events, _) = broadcast::channel(32);
        Self {
            backend,
            settings,
            devices: Vec::new(),
            worker_tx,
            worker_rx,
            summaries: Arc::new(Mutex::new(Vec::new())),
            events,
        }
    }

    pub fn summaries(&self) -> Arc<Mutex<Vec<DeviceSummary>>> {
        Arc::clone(&self.summaries)
    }

    /// Run until a Quit command (or the command channel closing).
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        /* serve ctl clients for the life of the registry */
        let ctl_task = self.start_ctl_listener();

        /* pick up whatever is already plugged in */
        self.scan().await;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Scan) => self.scan().await,
                    Some(Command::Quit) | None => break,
                },
                message = self.worker_rx.recv() => match message {
                    Some(message) => self.handle_worker_message(message).await,
                    None => unreachable!("registry holds a sender"),
                },
            }
        }

        self.shutdown().await;
        if let Some(task) = ctl_task {
            task.abort();
        }
        sockets::cleanup(&sockets::socket_path(
            &self.settings.socket_root,
            sockets::CTL_SOCKET_NAME,
        ));
    }

    /// Enumerate and claim every supported device we are not already
    /// driving.
    async fn scan(&mut self) {
        let discovered = match self.backend.enumerate().await {
            Ok(d) => d,
            Err(e) => {
                error!("scan failed: {e}");
                return;
            }
        };

        for found in discovered {
            if self.devices.iter().any(|d| d.location == found.location) {
                continue;
            }

            let usb = match self.backend.open(&found, self.settings.unbind).await {
                Ok(usb) => usb,
                Err(UsbError::Busy) => {
                    error!(
                        "device at {} is busy, is another igdaemon running?",
                        found.location
                    );
                    continue;
                }
                Err(e) => {
                    error!("cannot claim device at {}: {e}", found.location);
                    continue;
                }
            };

            let id = self.lowest_free_id();
            info!("device {id} found at {}", found.location);

            let state = Arc::new(DeviceState::new(
                id,
                found.location,
                usb,
                self.settings.device,
                self.backend.serialized_io(),
            ));

            let (reader_side, worker_side) = reader_channels();
            let usb_reader = reader::spawn(Arc::clone(&state), reader_side);
            let worker = DeviceWorker::new(
                Arc::clone(&state),
                worker_side,
                usb_reader,
                WorkerConfig {
                    socket_root: self.settings.socket_root.clone(),
                    read_labels: Arc::clone(&self.settings.read_labels),
                },
                self.worker_tx.clone(),
            );

            self.devices.push(DeviceEntry {
                id,
                location: found.location,
                state,
                worker: tokio::spawn(worker.run()),
            });
        }
    }

    /// The smallest id not assigned to any live device.
    fn lowest_free_id(&self) -> u32 {
        let mut id = 0;
        while self.devices.iter().any(|d| d.id == id) {
            id += 1;
        }
        id
    }

    async fn handle_worker_message(&mut self, message: WorkerMessage) {
        match message {
            WorkerMessage::Ready { id, aliases } => {
                let DeviceAliases { location, user } = aliases;
                let summary = DeviceSummary {
                    id,
                    location,
                    label: user,
                };
                self.summaries.lock().unwrap().push(summary.clone());
                let _ = self.events.send(DeviceEvent::Attached { device: summary });
            }

            WorkerMessage::Exited { id } => {
                let Some(pos) = self.devices.iter().position(|d| d.id == id) else {
                    return;
                };
                let entry = self.devices.swap_remove(pos);
                if let Err(e) = entry.worker.await {
                    if !e.is_cancelled() {
                        warn!("worker {id} failed: {e}");
                    }
                }
                info!("device {id} at {} removed", entry.location);

                self.summaries.lock().unwrap().retain(|s| s.id != id);
                let _ = self.events.send(DeviceEvent::Detached { id });

                /* the same hardware may already be back under a new
                 * bus address */
                if self.settings.auto_rescan {
                    self.scan().await;
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        info!("shutting down {} device(s)", self.devices.len());
        for entry in &self.devices {
            entry.state.stop();
        }

        /* give each worker two receive timeouts to unwind */
        let grace = 2 * self.settings.device.recv_timeout;
        while !self.devices.is_empty() {
            match tokio::time::timeout(grace, self.worker_rx.recv()).await {
                Ok(Some(WorkerMessage::Exited { id })) => {
                    if let Some(pos) = self.devices.iter().position(|d| d.id == id) {
                        let entry = self.devices.swap_remove(pos);
                        let _ = entry.worker.await;
                        debug!("reaped worker {id}");
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }

        for entry in self.devices.drain(..) {
            warn!("force-stopping worker {}", entry.id);
            entry.worker.abort();
        }
    }

    fn start_ctl_listener(&self) -> Option<JoinHandle<()>> {
        let (listener, _path) =
            match sockets::bind(&self.settings.socket_root, sockets::CTL_SOCKET_NAME) {
                Ok(bound) => bound,
                Err(e) => {
                    error!("cannot bind control socket: {e}");
                    return None;
                }
            };

        let summaries = Arc::clone(&self.summaries);
        let events = self.events.clone();
        Some(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let summaries = Arc::clone(&summaries);
                        let events = events.subscribe();
                        tokio::spawn(async move {
                            if let Err(e) = serve_ctl_client(stream, summaries, events).await {
                                debug!("ctl client ended: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        warn!("ctl accept failed: {e}");
                        break;
                    }
                }
            }
        }))
    }
}

/// One ctl-socket conversation: handshake, then list requests, until
/// the client subscribes or goes away.
async fn serve_ctl_client(
    mut stream: UnixStream,
    summaries: Arc<Mutex<Vec<DeviceSummary>>>,
    mut events: broadcast::Receiver<DeviceEvent>,
) -> std::io::Result<()> {
    /* same opening move as the device sockets */
    match Packet::read_from(&mut stream).await {
        Ok(p) if p.opcode == opcode::EXCH_VERSIONS && p.payload.len() == 2 => {}
        _ => return Ok(()),
    }
    Packet::with_payload(opcode::EXCH_VERSIONS, PROTOCOL_VERSION.to_le_bytes().to_vec())
        .write_to(&mut stream)
        .await?;

    loop {
        let request = match Packet::read_from(&mut stream).await {
            Ok(p) => p,
            Err(_) => return Ok(()),
        };

        match request.opcode {
            ctl::LIST_DEVICES => {
                let payload = {
                    let list = summaries.lock().unwrap();
                    serde_json::to_vec(&*list).unwrap_or_default()
                };
                Packet::with_payload(ctl::LIST_DEVICES, payload)
                    .write_to(&mut stream)
                    .await?;
            }

            ctl::SUBSCRIBE => {
                Packet::new(ctl::SUBSCRIBE).write_to(&mut stream).await?;
                /* stream events until either side hangs up */
                loop {
                    match events.recv().await {
                        Ok(event) => {
                            let payload = serde_json::to_vec(&event).unwrap_or_default();
                            Packet::with_payload(ctl::EVENT, payload)
                                .write_to(&mut stream)
                                .await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("ctl subscriber lagged by {n} events");
                        }
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    }
                }
            }

            other => {
                debug!("ctl client sent unknown request {other:#04x}");
                Packet::error(nix::errno::Errno::EINVAL as i32)
                    .write_to(&mut stream)
                    .await?;
            }
        }
    }
}

/// Spawn a task turning the periodic scan timer into Scan commands.
pub fn spawn_scan_timer(period: Duration, commands: mpsc::Sender<Command>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        /* the first tick fires immediately; the initial scan already
         * happened */
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if commands.send(Command::Scan).await.is_err() {
                break;
            }
        }
    })
}
