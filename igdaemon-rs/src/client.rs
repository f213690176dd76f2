/* Per-client session state and request handling.
 *
 * A fresh connection must open with the version exchange; after that
 * every request produces exactly one response frame before the next
 * request is considered.  A handful of opcodes are satisfied inside
 * the daemon (channel and carrier caching, receiver subscription
 * bookkeeping, label-read toggling); the rest are forwarded through
 * the device transactor.  Failures of any kind become an error packet
 * carrying a negative errno, and the connection stays open unless the
 * framing itself broke down. */

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::net::unix::OwnedWriteHalf;
use tracing::{debug, info, warn};

use crate::codec;
use crate::error::{Error, Result};
use crate::packet::{opcode, Packet, PROTOCOL_VERSION};
use crate::transactor::Transactor;
use crate::versions::{self, TranslateDirection};
use crate::catalog::{self, Direction};

/// What receive traffic a client has asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveMode {
    Off,
    /// Decoded pulse/space arrays.
    Cooked,
    /// Undecoded firmware sample bytes.
    Raw,
}

pub struct ClientSession {
    pub id: u64,
    writer: OwnedWriteHalf,
    /// Negotiated protocol version; 0 until the handshake completes.
    pub version: u16,
    pub active: bool,
    pub receiving: ReceiveMode,
}

impl ClientSession {
    pub fn new(id: u64, writer: OwnedWriteHalf) -> Self {
        Self {
            id,
            writer,
            version: 0,
            active: false,
            receiving: ReceiveMode::Off,
        }
    }

    /// Write a response whose opcode is already in the client's
    /// protocol.
    pub async fn send_raw(&mut self, packet: &Packet) -> io::Result<()> {
        packet.write_to(&mut self.writer).await
    }

    /// Write a daemon-protocol packet, translating the opcode for
    /// this client.  Untranslatable packets are skipped.
    pub async fn send(&mut self, packet: &Packet) -> io::Result<()> {
        match versions::translate(packet.opcode, self.version, TranslateDirection::ToWire) {
            Some(code) => {
                let mut out = packet.clone();
                out.opcode = code;
                out.write_to(&mut self.writer).await
            }
            None => {
                warn!(
                    "client {}: no protocol {} translation for {:#04x}, dropping",
                    self.id, self.version, packet.opcode
                );
                Ok(())
            }
        }
    }
}

/// Worker-owned state a request may touch beyond its own session.
pub struct SessionContext<'a> {
    pub transactor: &'a mut Transactor,
    pub receiver_refcount: &'a mut u32,
    pub read_labels: &'a AtomicBool,
}

/// What the worker should do after a request.
#[derive(Debug)]
pub enum Disposition {
    Reply(Packet),
    Close,
}

/// Handle one request frame from a client.
pub async fn process_request(
    session: &mut ClientSession,
    ctx: &mut SessionContext<'_>,
    request: Packet,
) -> Disposition {
    if !session.active {
        return handshake(session, request);
    }

    match handle_active(session, ctx, request).await {
        Ok(reply) => Disposition::Reply(reply),
        Err(e) => {
            info!("client {}: request failed: {e}", session.id);
            Disposition::Reply(Packet::error(e.errno() as i32))
        }
    }
}

/* The first packet must be the version exchange; anything else ends
 * the connection before it begins. */
fn handshake(session: &mut ClientSession, request: Packet) -> Disposition {
    if request.opcode != opcode::EXCH_VERSIONS || request.payload.len() != 2 {
        warn!(
            "client {}: expected version exchange, got {:#04x}",
            session.id, request.opcode
        );
        return Disposition::Close;
    }

    let version = u16::from_le_bytes([request.payload[0], request.payload[1]]);
    if versions::translate(opcode::SEND, version, TranslateDirection::ToWire).is_none() {
        warn!(
            "client {}: cannot support client protocol {version}",
            session.id
        );
        return Disposition::Close;
    }

    info!("client {} using protocol version {version}", session.id);
    session.version = version;
    session.active = true;

    Disposition::Reply(Packet::with_payload(
        opcode::EXCH_VERSIONS,
        PROTOCOL_VERSION.to_le_bytes().to_vec(),
    ))
}

async fn handle_active(
    session: &mut ClientSession,
    ctx: &mut SessionContext<'_>,
    mut request: Packet,
) -> Result<Packet> {
    let client_code = versions::translate(
        request.opcode,
        session.version,
        TranslateDirection::FromWire,
    )
    .ok_or(Error::Untranslatable {
        opcode: request.opcode,
        protocol: session.version,
    })?;

    /* the version is negotiated exactly once */
    if client_code == opcode::EXCH_VERSIONS {
        return Err(Error::BadRequest("protocol version already negotiated"));
    }

    /* raw receive subscriptions ride the normal receiver enable on
     * the wire; only the delivery format differs */
    let (code, wanted_mode) = match client_code {
        opcode::RAWRECVON => (opcode::RECVON, Some(ReceiveMode::Raw)),
        opcode::RECVON => (opcode::RECVON, Some(ReceiveMode::Cooked)),
        other => (other, None),
    };
    request.opcode = code;

    let state = ctx.transactor.state().clone();
    let spec = catalog::lookup(code, state.version()).ok_or(Error::UnknownOpcode {
        opcode: code,
        version: state.version(),
    })?;
    if spec.direction != Direction::ToDevice {
        return Err(Error::WrongDirection(code));
    }
    if !spec.request.matches(request.payload.len()) {
        return Err(Error::RequestPayloadMismatch {
            got: request.payload.len(),
        });
    }

    let mut response = Packet::new(client_code);

    /* requests the daemon can satisfy without touching the device */
    let handled_locally = match code {
        opcode::RECVON => {
            if session.receiving != ReceiveMode::Off {
                true
            } else if *ctx.receiver_refcount > 0 {
                *ctx.receiver_refcount += 1;
                session.receiving = wanted_mode.unwrap_or(ReceiveMode::Cooked);
                true
            } else {
                false
            }
        }

        opcode::RECVOFF => {
            if session.receiving != ReceiveMode::Off {
                session.receiving = ReceiveMode::Off;
                *ctx.receiver_refcount -= 1;
                /* the last receiver going away turns the hardware off */
                *ctx.receiver_refcount > 0
            } else {
                false
            }
        }

        opcode::GETCHANNELS => {
            response.payload = vec![state.channels() >> 4];
            true
        }

        opcode::SETCHANNELS => {
            let value = request.payload[0];
            if value > 0x0F {
                return Err(Error::BadRequest("channel mask wider than the hardware"));
            }
            state.set_channels(value << 4);
            response.payload = request.payload.clone();
            true
        }

        opcode::GETCARRIER => {
            response.payload = state.carrier_hz().to_be_bytes().to_vec();
            true
        }

        opcode::SETCARRIER => {
            let requested = u32::from_be_bytes([
                request.payload[0],
                request.payload[1],
                request.payload[2],
                request.payload[3],
            ]);
            let clamped = codec::clamp_carrier(requested);
            state.set_carrier_hz(clamped);
            response.payload = clamped.to_be_bytes().to_vec();
            true
        }

        opcode::IDSOFF => {
            ctx.read_labels.store(false, Ordering::Release);
            true
        }

        opcode::IDSON => {
            ctx.read_labels.store(true, Ordering::Release);
            true
        }

        opcode::SEND => {
            /* the client speaks pulse arrays; the firmware wants its
             * byte encoding at the cached carrier */
            if request.payload.len() % 4 != 0 {
                return Err(Error::BadRequest("pulse data is not a u32 array"));
            }
            let pulses: Vec<u32> = request
                .payload
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            request.payload = codec::encode(&pulses, state.carrier_hz());
            false
        }

        _ => false,
    };

    if handled_locally {
        debug!("client {}: request {client_code:#04x} handled in daemon", session.id);
    } else {
        let transacted = ctx.transactor.transact(request.clone(), true).await;
        let device_response = match transacted {
            Ok(r) => r,
            Err(e) if code == opcode::DEV_RESET => {
                /* a firmware reset that never made it out can still be
                 * done at the port level */
                warn!("client {}: soft reset failed ({e}), resetting the port", session.id);
                state.usb.reset().await.map_err(Error::from)?;
                None
            }
            Err(e) => return Err(e),
        };

        if let Some(mode) = wanted_mode {
            *ctx.receiver_refcount += 1;
            session.receiving = mode;
        }
        if let Some(device_response) = device_response {
            response.payload = device_response.payload;
        }
    }

    /* back into the client's protocol */
    response.opcode = versions::translate(
        response.opcode,
        session.version,
        TranslateDirection::ToWire,
    )
    .ok_or(Error::Untranslatable {
        opcode: response.opcode,
        protocol: session.version,
    })?;

    Ok(response)
}

/// Undo a departing client's receiver subscription, shutting the
/// hardware receiver off when it was the last one.
pub async fn release_subscription(
    receiving: ReceiveMode,
    ctx: &mut SessionContext<'_>,
) {
    if receiving == ReceiveMode::Off {
        return;
    }

    *ctx.receiver_refcount -= 1;
    if *ctx.receiver_refcount == 0 {
        info!("no more receivers, turning off the receiver");
        if let Err(e) = ctx
            .transactor
            .transact(Packet::new(opcode::RECVOFF), true)
            .await
        {
            warn!("failed to disable the receiver: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{reader_channels, DeviceSettings, DeviceState};
    use crate::reader;
    use crate::usb::mock::MockTransceiver;
    use crate::usb::BusAddress;
    use std::sync::Arc;
    use std::time::Duration;

    struct Harness {
        usb: Arc<MockTransceiver>,
        state: Arc<DeviceState>,
        transactor: Transactor,
        refcount: u32,
        read_labels: AtomicBool,
    }

    fn harness(version: u16) -> Harness {
        let usb = Arc::new(MockTransceiver::new());
        let state = Arc::new(DeviceState::new(
            0,
            BusAddress { bus: 1, address: 9 },
            Arc::clone(&usb) as _,
            DeviceSettings {
                recv_timeout: Duration::from_millis(50),
                send_timeout: Duration::from_millis(100),
                disconnect_on_epipe: false,
            },
            false,
        ));
        state.set_version(version);

        let (reader_side, worker_side) = reader_channels();
        reader::spawn(Arc::clone(&state), reader_side);

        Harness {
            usb,
            transactor: Transactor::new(Arc::clone(&state), worker_side.ack_rx),
            state,
            refcount: 0,
            read_labels: AtomicBool::new(true),
        }
    }

    fn session() -> ClientSession {
        let (_a, b) = tokio::net::UnixStream::pair().unwrap();
        let (_r, w) = b.into_split();
        let mut s = ClientSession::new(7, w);
        s.active = true;
        s.version = PROTOCOL_VERSION;
        s
    }

    impl Harness {
        fn ctx(&mut self) -> SessionContext<'_> {
            SessionContext {
                transactor: &mut self.transactor,
                receiver_refcount: &mut self.refcount,
                read_labels: &self.read_labels,
            }
        }
    }

    #[tokio::test]
    async fn test_handshake_success() {
        let mut s = session();
        s.active = false;
        s.version = 0;

        let mut h = harness(0x0102);
        let request = Packet::with_payload(opcode::EXCH_VERSIONS, vec![0x01, 0x00]);
        let mut ctx = h.ctx();
        match process_request(&mut s, &mut ctx, request).await {
            Disposition::Reply(reply) => {
                assert_eq!(reply.opcode, opcode::EXCH_VERSIONS);
                assert_eq!(reply.payload, PROTOCOL_VERSION.to_le_bytes());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(s.active);
        assert_eq!(s.version, 1);
    }

    #[tokio::test]
    async fn test_handshake_wrong_opcode_closes() {
        let mut s = session();
        s.active = false;

        let mut h = harness(0x0102);
        let mut ctx = h.ctx();
        let d = process_request(&mut s, &mut ctx, Packet::new(opcode::GETVERSION)).await;
        assert!(matches!(d, Disposition::Close));
    }

    #[tokio::test]
    async fn test_set_carrier_clamped_and_echoed() {
        let mut s = session();
        let mut h = harness(0x0102);

        let request = Packet::with_payload(
            opcode::SETCARRIER,
            200_000u32.to_be_bytes().to_vec(),
        );
        let mut ctx = h.ctx();
        let d = process_request(&mut s, &mut ctx, request).await;
        match d {
            Disposition::Reply(reply) => {
                assert_eq!(reply.opcode, opcode::SETCARRIER);
                assert_eq!(reply.payload, 150_000u32.to_be_bytes());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.state.carrier_hz(), 150_000);
        /* handled without a device transaction */
        assert_eq!(h.usb.written_count(), 0);
    }

    #[tokio::test]
    async fn test_channels_cached_shifted() {
        let mut s = session();
        let mut h = harness(0x0102);

        let mut ctx = h.ctx();
        let d = process_request(
            &mut s,
            &mut ctx,
            Packet::with_payload(opcode::SETCHANNELS, vec![0x03]),
        )
        .await;
        assert!(matches!(d, Disposition::Reply(_)));
        assert_eq!(h.state.channels(), 0x30);

        let mut ctx = h.ctx();
        match process_request(&mut s, &mut ctx, Packet::new(opcode::GETCHANNELS)).await {
            Disposition::Reply(reply) => assert_eq!(reply.payload, vec![0x03]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_channel_mask_rejected_when_too_wide() {
        let mut s = session();
        let mut h = harness(0x0102);

        let mut ctx = h.ctx();
        match process_request(
            &mut s,
            &mut ctx,
            Packet::with_payload(opcode::SETCHANNELS, vec![0x10]),
        )
        .await
        {
            Disposition::Reply(reply) => {
                assert!(reply.is_error());
                assert_eq!(reply.errno, nix::errno::Errno::EINVAL as i32);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_second_receiver_not_forwarded() {
        let mut a = session();
        let mut b = session();
        let mut h = harness(0x0102);
        h.usb.push_ack_after_write(1, opcode::RECVON, &[]);

        let mut ctx = h.ctx();
        let d = process_request(&mut a, &mut ctx, Packet::new(opcode::RECVON)).await;
        assert!(matches!(d, Disposition::Reply(p) if !p.is_error()));
        assert_eq!(h.refcount, 1);
        assert_eq!(a.receiving, ReceiveMode::Cooked);
        assert_eq!(h.usb.written_count(), 1);

        let mut ctx = h.ctx();
        let d = process_request(&mut b, &mut ctx, Packet::new(opcode::RAWRECVON)).await;
        assert!(matches!(d, Disposition::Reply(p) if !p.is_error()));
        assert_eq!(h.refcount, 2);
        assert_eq!(b.receiving, ReceiveMode::Raw);
        /* no second RECVON on the wire */
        assert_eq!(h.usb.written_count(), 1);
    }

    #[tokio::test]
    async fn test_last_recvoff_forwarded() {
        let mut a = session();
        let mut b = session();
        let mut h = harness(0x0102);
        h.usb.push_ack_after_write(1, opcode::RECVON, &[]);
        h.usb.push_ack_after_write(2, opcode::RECVOFF, &[]);

        let mut ctx = h.ctx();
        process_request(&mut a, &mut ctx, Packet::new(opcode::RECVON)).await;
        let mut ctx = h.ctx();
        process_request(&mut b, &mut ctx, Packet::new(opcode::RECVON)).await;
        assert_eq!(h.refcount, 2);

        /* first release: bookkeeping only */
        let mut ctx = h.ctx();
        process_request(&mut a, &mut ctx, Packet::new(opcode::RECVOFF)).await;
        assert_eq!(h.refcount, 1);
        assert_eq!(h.usb.written_count(), 1);

        /* last release reaches the device */
        let mut ctx = h.ctx();
        let d = process_request(&mut b, &mut ctx, Packet::new(opcode::RECVOFF)).await;
        assert!(matches!(d, Disposition::Reply(p) if !p.is_error()));
        assert_eq!(h.refcount, 0);
        assert_eq!(h.usb.written_count(), 2);
    }

    #[tokio::test]
    async fn test_send_is_reencoded_for_the_device() {
        let mut s = session();
        let mut h = harness(0x0306);
        h.usb.push_ack_after_write(2, opcode::SEND, &[]);

        /* one 1000us pulse at the default 38kHz carrier */
        let request = Packet::with_payload(
            opcode::SEND,
            (codec::PULSE_BIT | 1000).to_le_bytes().to_vec(),
        );
        let mut ctx = h.ctx();
        let d = process_request(&mut s, &mut ctx, request).await;
        assert!(matches!(d, Disposition::Reply(p) if !p.is_error()));

        let written = h.usb.take_written();
        /* control packet with one-byte length, then the encoded pulse */
        assert_eq!(written[0][4], 1);
        assert_eq!(written[1], vec![38]);
    }

    #[tokio::test]
    async fn test_failure_becomes_error_packet() {
        let mut s = session();
        let mut h = harness(0x0102);
        /* no ack scripted: the transaction times out */

        let mut ctx = h.ctx();
        match process_request(&mut s, &mut ctx, Packet::new(opcode::RECVON)).await {
            Disposition::Reply(reply) => {
                assert!(reply.is_error());
                assert_eq!(reply.errno, nix::errno::Errno::ETIMEDOUT as i32);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.refcount, 0);
    }

    #[tokio::test]
    async fn test_ids_toggle() {
        let mut s = session();
        let mut h = harness(0x0102);

        let mut ctx = h.ctx();
        process_request(&mut s, &mut ctx, Packet::new(opcode::IDSOFF)).await;
        assert!(!h.read_labels.load(Ordering::Acquire));

        let mut ctx = h.ctx();
        process_request(&mut s, &mut ctx, Packet::new(opcode::IDSON)).await;
        assert!(h.read_labels.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_release_subscription_sends_final_recvoff() {
        let mut h = harness(0x0102);
        h.usb.push_ack_after_write(1, opcode::RECVOFF, &[]);
        h.refcount = 1;

        let mut ctx = h.ctx();
        release_subscription(ReceiveMode::Cooked, &mut ctx).await;
        assert_eq!(h.refcount, 0);
        assert_eq!(h.usb.written_count(), 1);
    }

    #[tokio::test]
    async fn test_release_subscription_keeps_receiver_for_others() {
        let mut h = harness(0x0102);
        h.refcount = 2;

        let mut ctx = h.ctx();
        release_subscription(ReceiveMode::Raw, &mut ctx).await;
        assert_eq!(h.refcount, 1);
        assert_eq!(h.usb.written_count(), 0);
    }
}
