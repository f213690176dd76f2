/* Per-device worker.
 *
 * One worker owns a device end to end: it probes the firmware at
 * startup, binds the device's listening sockets, serves every client
 * connected to them, and fans device-initiated receives out to
 * subscribers.  Client sockets are read by small forwarder tasks that
 * funnel whole frames into the worker's event queue, so the worker
 * itself stays a single loop and request/response ordering per client
 * falls out for free.
 *
 * The worker ends when the reader does: a closed receive queue means
 * the device was unplugged or the daemon is shutting down.  Either
 * way the registry is told so it can reap the task. */

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::unix::OwnedReadHalf;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::client::{self, ClientSession, Disposition, ReceiveMode, SessionContext};
use crate::codec;
use crate::device::{DeviceState, WorkerSide};
use crate::packet::{opcode, Packet};
use crate::sockets;
use crate::transactor::Transactor;

/// Socket names a device answers on besides its numeric id.
#[derive(Debug, Clone, Default)]
pub struct DeviceAliases {
    pub location: String,
    pub user: Option<String>,
}

/// Messages a worker sends its registry.
#[derive(Debug)]
pub enum WorkerMessage {
    Ready { id: u32, aliases: DeviceAliases },
    Exited { id: u32 },
}

pub struct WorkerConfig {
    pub socket_root: PathBuf,
    pub read_labels: Arc<AtomicBool>,
}

enum WorkerEvent {
    Connected(UnixStream),
    Request { client: u64, packet: Packet },
    Closed { client: u64 },
}

struct ClientEntry {
    session: ClientSession,
    reader: JoinHandle<()>,
}

pub struct DeviceWorker {
    state: Arc<DeviceState>,
    transactor: Transactor,
    recv_rx: mpsc::Receiver<Packet>,
    usb_reader: JoinHandle<()>,
    config: WorkerConfig,
    registry_tx: mpsc::Sender<WorkerMessage>,

    clients: Vec<ClientEntry>,
    receiver_refcount: u32,
    next_client: u64,

    event_tx: mpsc::Sender<WorkerEvent>,
    event_rx: mpsc::Receiver<WorkerEvent>,
    accept_tasks: Vec<JoinHandle<()>>,
    socket_paths: Vec<PathBuf>,
}

impl DeviceWorker {
    pub fn new(
        state: Arc<DeviceState>,
        side: WorkerSide,
        usb_reader: JoinHandle<()>,
        config: WorkerConfig,
        registry_tx: mpsc::Sender<WorkerMessage>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(64);
        Self {
            transactor: Transactor::new(Arc::clone(&state), side.ack_rx),
            recv_rx: side.recv_rx,
            state,
            usb_reader,
            config,
            registry_tx,
            clients: Vec::new(),
            receiver_refcount: 0,
            next_client: 0,
            event_tx,
            event_rx,
            accept_tasks: Vec::new(),
            socket_paths: Vec::new(),
        }
    }

    pub async fn run(mut self) {
        let id = self.state.id;
        info!("worker {id} starting");

        if let Some(aliases) = self.startup().await {
            let _ = self
                .registry_tx
                .send(WorkerMessage::Ready { id, aliases })
                .await;
            self.serve().await;
        }

        self.shutdown().await;
        info!("worker {id} exiting");
        let _ = self.registry_tx.send(WorkerMessage::Exited { id }).await;
    }

    /// Probe the firmware and bind the device's sockets.  Returns
    /// `None` when the device cannot be driven.
    async fn startup(&mut self) -> Option<DeviceAliases> {
        match self.transactor.probe_version().await {
            Ok(_) => {}
            Err(e) => {
                error!("device {}: version probe failed: {e}", self.state.id);
                return None;
            }
        }
        self.transactor.fetch_features().await;

        let mut aliases = DeviceAliases {
            location: self.state.location.to_string(),
            user: None,
        };
        if self.config.read_labels.load(Ordering::Acquire) {
            aliases.user = self.transactor.read_label().await;
        }

        /* the numeric socket is the device's identity; aliases are
         * conveniences and may fail to bind */
        let name = self.state.id.to_string();
        match sockets::bind(&self.config.socket_root, &name) {
            Ok((listener, path)) => self.add_listener(listener, path),
            Err(e) => {
                error!("device {}: cannot bind socket {name}: {e}", self.state.id);
                return None;
            }
        }

        for alias in std::iter::once(&aliases.location).chain(aliases.user.iter()) {
            match sockets::bind(&self.config.socket_root, alias) {
                Ok((listener, path)) => self.add_listener(listener, path),
                Err(e) => warn!(
                    "device {}: cannot bind alias {alias:?}: {e}",
                    self.state.id
                ),
            }
        }

        Some(aliases)
    }

    fn add_listener(&mut self, listener: tokio::net::UnixListener, path: PathBuf) {
        let tx = self.event_tx.clone();
        self.socket_paths.push(path);
        self.accept_tasks.push(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        if tx.send(WorkerEvent::Connected(stream)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("accept failed: {e}");
                        break;
                    }
                }
            }
        }));
    }

    async fn serve(&mut self) {
        loop {
            tokio::select! {
                event = self.event_rx.recv() => {
                    /* both ends are held by this struct, so the event
                     * channel cannot close while we run */
                    match event {
                        Some(WorkerEvent::Connected(stream)) => self.attach_client(stream),
                        Some(WorkerEvent::Request { client, packet }) => {
                            self.handle_request(client, packet).await;
                        }
                        Some(WorkerEvent::Closed { client }) => {
                            if let Some(idx) =
                                self.clients.iter().position(|c| c.session.id == client)
                            {
                                self.release_client(idx).await;
                            }
                        }
                        None => break,
                    }
                }
                received = self.recv_rx.recv() => {
                    match received {
                        Some(packet) => self.fan_out(packet).await,
                        /* reader exited: device gone or daemon quitting */
                        None => break,
                    }
                }
            }
        }
    }

    fn attach_client(&mut self, stream: UnixStream) {
        let id = self.next_client;
        self.next_client += 1;

        let (read_half, write_half) = stream.into_split();
        let reader = spawn_client_reader(id, read_half, self.event_tx.clone());

        debug!("device {}: client {id} connected", self.state.id);
        self.clients.push(ClientEntry {
            session: ClientSession::new(id, write_half),
            reader,
        });
    }

    async fn handle_request(&mut self, client: u64, packet: Packet) {
        let Some(idx) = self.clients.iter().position(|c| c.session.id == client) else {
            return;
        };

        let mut ctx = SessionContext {
            transactor: &mut self.transactor,
            receiver_refcount: &mut self.receiver_refcount,
            read_labels: &self.config.read_labels,
        };

        let entry = &mut self.clients[idx];
        match client::process_request(&mut entry.session, &mut ctx, packet).await {
            Disposition::Reply(reply) => {
                if let Err(e) = entry.session.send_raw(&reply).await {
                    info!("failed to write response to client {client}: {e}");
                    self.release_client(idx).await;
                }
            }
            Disposition::Close => self.release_client(idx).await,
        }
    }

    async fn release_client(&mut self, idx: usize) {
        let entry = self.clients.swap_remove(idx);
        entry.reader.abort();

        debug!("device {}: client {} released", self.state.id, entry.session.id);
        let mut ctx = SessionContext {
            transactor: &mut self.transactor,
            receiver_refcount: &mut self.receiver_refcount,
            read_labels: &self.config.read_labels,
        };
        client::release_subscription(entry.session.receiving, &mut ctx).await;
    }

    /// Deliver one device-initiated packet to every subscriber: raw
    /// listeners get the firmware bytes, cooked listeners the decoded
    /// pulse array.
    async fn fan_out(&mut self, packet: Packet) {
        match packet.opcode {
            opcode::RECV => {
                self.deliver(ReceiveMode::Raw, &packet).await;

                let pulses = codec::decode(&packet.payload);
                let mut bytes = Vec::with_capacity(pulses.len() * 4);
                for pulse in pulses {
                    bytes.extend_from_slice(&pulse.to_le_bytes());
                }
                let cooked = Packet::with_payload(opcode::RECV, bytes);
                self.deliver(ReceiveMode::Cooked, &cooked).await;
            }
            opcode::OVERRECV => {
                error!("device {}: receive overflow", self.state.id);
                self.deliver(ReceiveMode::Raw, &packet).await;
            }
            other => {
                warn!(
                    "device {}: unexpected code {other:#04x} with {} data bytes from usb",
                    self.state.id,
                    packet.payload.len()
                );
            }
        }
    }

    async fn deliver(&mut self, mode: ReceiveMode, packet: &Packet) {
        for entry in &mut self.clients {
            if entry.session.receiving != mode {
                continue;
            }
            if let Err(e) = entry.session.send(packet).await {
                warn!(
                    "failed to send packet to receiver {}: {e}",
                    entry.session.id
                );
            }
        }
    }

    async fn shutdown(&mut self) {
        /* stop accepting, take the sockets out of the filesystem */
        for task in self.accept_tasks.drain(..) {
            task.abort();
        }
        for path in self.socket_paths.drain(..) {
            sockets::cleanup(&path);
        }

        /* make the reader exit if it has not already */
        self.state.stop();

        while let Some(entry) = self.clients.pop() {
            entry.reader.abort();
            let mut ctx = SessionContext {
                transactor: &mut self.transactor,
                receiver_refcount: &mut self.receiver_refcount,
                read_labels: &self.config.read_labels,
            };
            client::release_subscription(entry.session.receiving, &mut ctx).await;
        }

        if let Err(e) = (&mut self.usb_reader).await {
            if !e.is_cancelled() {
                warn!("device {}: reader task failed: {e}", self.state.id);
            }
        }
    }
}

fn spawn_client_reader(
    id: u64,
    mut read_half: OwnedReadHalf,
    events: mpsc::Sender<WorkerEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match Packet::read_from(&mut read_half).await {
                Ok(packet) => {
                    if events
                        .send(WorkerEvent::Request { client: id, packet })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    debug!("client {id}: {e}");
                    let _ = events.send(WorkerEvent::Closed { client: id }).await;
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{reader_channels, DeviceSettings};
    use crate::packet::PROTOCOL_VERSION;
    use crate::reader;
    use crate::usb::mock::MockTransceiver;
    use crate::usb::BusAddress;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "igd-worker-{tag}-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&root);
        root
    }

    /// Start a full worker over a scripted device answering the
    /// startup probes for firmware 0x0306 with no stored label.
    async fn start_worker(
        tag: &str,
        usb: Arc<MockTransceiver>,
    ) -> (PathBuf, mpsc::Receiver<WorkerMessage>, Arc<DeviceState>) {
        /* startup probes: version, then features */
        usb.push_ack_after_write(1, opcode::GETVERSION, &[0x06, 0x03]);
        usb.push_ack_after_write(2, opcode::GETFEATURES, &[0x01, 65]);

        let state = Arc::new(DeviceState::new(
            0,
            BusAddress { bus: 1, address: 5 },
            Arc::clone(&usb) as _,
            DeviceSettings {
                recv_timeout: Duration::from_millis(50),
                send_timeout: Duration::from_millis(200),
                disconnect_on_epipe: false,
            },
            false,
        ));

        let (reader_side, worker_side) = reader_channels();
        let usb_reader = reader::spawn(Arc::clone(&state), reader_side);

        let root = temp_root(tag);
        let (registry_tx, registry_rx) = mpsc::channel(8);
        let worker = DeviceWorker::new(
            Arc::clone(&state),
            worker_side,
            usb_reader,
            WorkerConfig {
                socket_root: root.clone(),
                /* labels off keeps the startup script short */
                read_labels: Arc::new(AtomicBool::new(false)),
            },
            registry_tx,
        );
        tokio::spawn(worker.run());

        (root, registry_rx, state)
    }

    async fn connect_and_handshake(root: &PathBuf) -> UnixStream {
        let path = root.join("0");
        let mut stream = UnixStream::connect(&path).await.unwrap();

        Packet::with_payload(opcode::EXCH_VERSIONS, PROTOCOL_VERSION.to_le_bytes().to_vec())
            .write_to(&mut stream)
            .await
            .unwrap();

        let reply = Packet::read_from(&mut stream).await.unwrap();
        assert_eq!(reply.opcode, opcode::EXCH_VERSIONS);
        assert_eq!(reply.payload, PROTOCOL_VERSION.to_le_bytes());
        stream
    }

    async fn request(stream: &mut UnixStream, packet: Packet) -> Packet {
        packet.write_to(stream).await.unwrap();
        Packet::read_from(stream).await.unwrap()
    }

    #[tokio::test]
    async fn test_worker_startup_and_handshake() {
        let usb = Arc::new(MockTransceiver::new());
        let (root, mut registry_rx, state) = start_worker("handshake", usb).await;

        match registry_rx.recv().await.unwrap() {
            WorkerMessage::Ready { id, aliases } => {
                assert_eq!(id, 0);
                assert_eq!(aliases.location, "001-005");
                assert!(aliases.user.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(state.version(), 0x0306);

        let _stream = connect_and_handshake(&root).await;
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn test_get_version_round_trip() {
        let usb = Arc::new(MockTransceiver::new());
        let (root, mut registry_rx, _state) = start_worker("getversion", Arc::clone(&usb)).await;
        let _ = registry_rx.recv().await.unwrap();

        let mut stream = connect_and_handshake(&root).await;

        usb.push_ack_after_write(3, opcode::GETVERSION, &[0x06, 0x03]);
        let reply = request(&mut stream, Packet::new(opcode::GETVERSION)).await;
        assert_eq!(reply.opcode, opcode::GETVERSION);
        assert_eq!(reply.payload, vec![0x06, 0x03]);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn test_two_receivers_fan_out_and_refcount() {
        let usb = Arc::new(MockTransceiver::new());
        let (root, mut registry_rx, _state) = start_worker("fanout", Arc::clone(&usb)).await;
        let _ = registry_rx.recv().await.unwrap();

        let mut cooked = connect_and_handshake(&root).await;
        let mut raw = connect_and_handshake(&root).await;

        /* first subscriber reaches the device */
        usb.push_ack_after_write(3, opcode::RECVON, &[]);
        let reply = request(&mut cooked, Packet::new(opcode::RECVON)).await;
        assert!(!reply.is_error());
        assert_eq!(usb.written_count(), 3);

        /* second subscriber is bookkeeping only */
        let reply = request(&mut raw, Packet::new(opcode::RAWRECVON)).await;
        assert!(!reply.is_error());
        assert_eq!(usb.written_count(), 3);

        /* the device emits a receive */
        usb.push_recv_data(&[0x9F, 0x0A, 0x8F, 0x02], 4);

        let raw_packet = Packet::read_from(&mut raw).await.unwrap();
        assert_eq!(raw_packet.opcode, opcode::RECV);
        assert_eq!(raw_packet.payload, vec![0x9F, 0x0A, 0x8F, 0x02]);

        let cooked_packet = Packet::read_from(&mut cooked).await.unwrap();
        assert_eq!(cooked_packet.opcode, opcode::RECV);
        let pulses: Vec<u32> = cooked_packet
            .payload
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(
            pulses,
            vec![
                (32 << 6) / 3,
                ((11 << 6) / 3) | codec::PULSE_BIT,
                (19 << 6) / 3
            ]
        );

        /* cooked client drops without RECVOFF; the receiver stays on
         * for the raw client, then its RECVOFF reaches the device */
        drop(cooked);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(usb.written_count(), 3);

        usb.push_ack_after_write(4, opcode::RECVOFF, &[]);
        let reply = request(&mut raw, Packet::new(opcode::RECVOFF)).await;
        assert!(!reply.is_error());
        assert_eq!(usb.written_count(), 4);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn test_device_disconnect_fails_pending_send_and_reaps() {
        let usb = Arc::new(MockTransceiver::new());
        let (root, mut registry_rx, _state) = start_worker("unplug", Arc::clone(&usb)).await;
        let _ = registry_rx.recv().await.unwrap();

        let mut stream = connect_and_handshake(&root).await;

        /* the send goes out (control packet + data, writes 3 and 4)
         * but the device disappears before acking */
        usb.push_in(crate::usb::mock::InAction::DisconnectAfterWrite(4));
        let pulses = (codec::PULSE_BIT | 1000u32).to_le_bytes().to_vec();
        let reply = request(&mut stream, Packet::with_payload(opcode::SEND, pulses)).await;
        assert!(reply.is_error());
        assert_eq!(reply.errno, nix::errno::Errno::ETIMEDOUT as i32);

        /* the worker unwinds and tells the registry */
        match registry_rx.recv().await.unwrap() {
            WorkerMessage::Exited { id } => assert_eq!(id, 0),
            other => panic!("unexpected {other:?}"),
        }

        /* the socket is gone; the client connection dies */
        let mut buf = [0u8; 8];
        let n = stream.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
        assert!(!root.join("0").exists());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn test_request_before_handshake_closes_client() {
        let usb = Arc::new(MockTransceiver::new());
        let (root, mut registry_rx, _state) = start_worker("nohandshake", usb).await;
        let _ = registry_rx.recv().await.unwrap();

        let mut stream = UnixStream::connect(root.join("0")).await.unwrap();
        Packet::new(opcode::GETVERSION)
            .write_to(&mut stream)
            .await
            .unwrap();

        /* the daemon closes without replying */
        let mut buf = [0u8; 8];
        let n = stream.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);

        let _ = std::fs::remove_dir_all(&root);
    }
}
