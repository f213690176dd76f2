/* Request/acknowledgement transactions toward one device.
 *
 * The transactor is the only writer on the interrupt-OUT endpoint.  A
 * request becomes a 4-byte control packet (two zero bytes, the
 * host-to-device marker, the opcode), up to four inline payload bytes,
 * and for the bulk-data opcodes a streamed tail split into
 * max-packet-size chunks.  Acknowledgements come back through the
 * reader's response slot; the transactor owns the receive side of the
 * slot's signal channel, so transactions are naturally serialized by
 * its &mut methods.
 *
 * Two requests are rewritten on the wire: GETID executes the stored
 * label program (the device answers with the label bytes), and SETID
 * writes a generated code block that reproduces the label when run. */

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::catalog::{self, Direction, PayloadLen};
use crate::codec;
use crate::device::{DeviceState, FirmwareCapabilities, UNKNOWN_FEATURES};
use crate::error::{Error, Result};
use crate::packet::{opcode, Packet};
use crate::versions;

const CTL_TODEV: [u8; 3] = [0x00, 0x00, 0xCD];

/* opcodes whose payload streams after the control packet instead of
 * riding inline */
fn streams_payload(code: u8) -> bool {
    matches!(
        code,
        opcode::SEND | opcode::RESEND | opcode::PINBURST | opcode::REPEATER
    )
}

pub struct Transactor {
    state: Arc<DeviceState>,
    ack_rx: mpsc::Receiver<()>,
}

impl Transactor {
    pub fn new(state: Arc<DeviceState>, ack_rx: mpsc::Receiver<()>) -> Self {
        Self { state, ack_rx }
    }

    pub fn state(&self) -> &Arc<DeviceState> {
        &self.state
    }

    /// Run one request against the device, waiting for the
    /// acknowledgement when the packet type calls for one.
    pub async fn transact(
        &mut self,
        request: Packet,
        want_response: bool,
    ) -> Result<Option<Packet>> {
        let caps = self.state.capabilities();

        /* old firmware stores pin configuration in two register banks
         * reached by separate requests; hide the split here */
        if caps.split_pin_config()
            && matches!(
                request.opcode,
                opcode::GETPINCONFIG | opcode::SETPINCONFIG
            )
        {
            return self.split_pin_config(request).await;
        }

        self.transact_inner(request, want_response).await
    }

    async fn transact_inner(
        &mut self,
        request: Packet,
        want_response: bool,
    ) -> Result<Option<Packet>> {
        let caps = self.state.capabilities();
        let version = caps.version();

        let spec = catalog::lookup(request.opcode, version).ok_or(Error::UnknownOpcode {
            opcode: request.opcode,
            version,
        })?;
        if spec.direction != Direction::ToDevice {
            return Err(Error::WrongDirection(request.opcode));
        }
        if !spec.request.matches(request.payload.len()) {
            return Err(Error::RequestPayloadMismatch {
                got: request.payload.len(),
            });
        }
        if spec.response != PayloadLen::None && !want_response {
            return Err(Error::BadRequest("packet type returns data nobody asked for"));
        }

        /* client-invisible substitutions */
        let (wire_code, payload) = match request.opcode {
            opcode::GETID => (opcode::EXECUTE, request.payload.clone()),
            opcode::SETID => (
                opcode::WRITEBLOCK,
                generate_id_block(&request.payload, version),
            ),
            code => (code, request.payload.clone()),
        };

        let wire_code = versions::to_device(wire_code, version).ok_or(Error::Untranslatable {
            opcode: wire_code,
            protocol: versions::device_protocol(version),
        })?;

        /* assemble the control packet */
        let mut msg = Vec::with_capacity(self.state.max_packet_size);
        msg.extend_from_slice(&CTL_TODEV);
        msg.push(wire_code);

        let mut sent = 0usize;
        if !streams_payload(request.opcode) && request.opcode != opcode::SETPINCONFIG {
            /* inline the first four bytes; block operations use them
             * for addressing and stream the rest */
            sent = payload.len().min(4);
            msg.extend_from_slice(&payload[..sent]);
        } else if caps.length_prefixed_data() && streams_payload(request.opcode) {
            msg.push(payload.len() as u8);

            if matches!(
                request.opcode,
                opcode::SEND | opcode::RESEND | opcode::REPEATER
            ) {
                msg.push(self.state.channels());

                if caps.adjustable_carrier() {
                    let delays =
                        codec::carrier_delays(self.state.carrier_hz(), self.state.loop_cycles());
                    msg.extend_from_slice(&delays);
                }
            }
        }

        self.flush_stale_responses();

        /* when the backend serializes I/O, announce the write so the
         * reader yields the endpoint instead of starving us */
        let io_guard = if self.state.serialized_io {
            self.state.need_write.store(true, Ordering::Release);
            let guard = self.state.io_lock.lock().await;
            self.state.need_write.store(false, Ordering::Release);
            Some(guard)
        } else {
            None
        };

        let started = Instant::now();
        let send_timeout = self.state.settings.send_timeout;

        let result = async {
            self.state.usb.interrupt_out(&msg, send_timeout).await?;

            if payload.len() > sent {
                let terminator = caps.send_terminator() && request.opcode == opcode::SEND;
                self.stream_data(&payload[sent..], terminator, send_timeout)
                    .await?;
            }
            Ok::<(), Error>(())
        }
        .await;

        /* release the endpoint before waiting on the acknowledgement */
        drop(io_guard);
        result?;

        if !spec.ack {
            return Ok(None);
        }

        let response = match tokio::time::timeout(send_timeout, self.ack_rx.recv()).await {
            Err(_) => {
                info!(
                    "device {}: timeout waiting for {:#04x} acknowledgement",
                    self.state.id, request.opcode
                );
                return Err(Error::Timeout);
            }
            /* the reader closing its side means the device is gone;
             * the in-flight request still just times out and the
             * worker learns of the loss through the receive queue */
            Ok(None) => return Err(Error::Timeout),
            Ok(Some(())) => self
                .state
                .response_slot
                .lock()
                .unwrap()
                .take()
                .ok_or(Error::BadRequest("acknowledgement signal without a packet"))?,
        };

        let mut response = response;

        /* un-alias the block write done on SETID's behalf */
        if request.opcode == opcode::SETID && response.opcode == opcode::WRITEBLOCK {
            response.opcode = opcode::SETID;
        }

        if response.opcode == opcode::INVALID_ARG {
            return Err(Error::InvalidArgument);
        }
        if response.opcode != request.opcode {
            return Err(Error::AckMismatch {
                got: response.opcode,
                want: request.opcode,
            });
        }
        if !spec.response.matches(response.payload.len()) {
            return Err(Error::ResponsePayloadMismatch {
                got: response.payload.len(),
            });
        }

        debug!(
            "device {}: transaction {:#04x} took {}us",
            self.state.id,
            request.opcode,
            started.elapsed().as_micros()
        );

        Ok(want_response.then_some(response))
    }

    /// GETPINCONFIG/SETPINCONFIG against firmware that keeps the pin
    /// registers in two 4-byte banks.
    async fn split_pin_config(&mut self, request: Packet) -> Result<Option<Packet>> {
        match request.opcode {
            opcode::GETPINCONFIG => {
                let mut combined = Vec::with_capacity(8);
                for bank in 0..2u8 {
                    let sub = Packet::new(opcode::GETCONFIG0 + bank * 2);
                    let response = self
                        .transact_inner(sub, true)
                        .await?
                        .ok_or(Error::BadRequest("config bank read returned nothing"))?;
                    combined.extend_from_slice(&response.payload);
                }
                Ok(Some(Packet::with_payload(opcode::GETPINCONFIG, combined)))
            }
            opcode::SETPINCONFIG => {
                if request.payload.len() != 8 {
                    return Err(Error::RequestPayloadMismatch {
                        got: request.payload.len(),
                    });
                }
                for bank in 0..2usize {
                    let sub = Packet::with_payload(
                        opcode::SETCONFIG0 + bank as u8 * 2,
                        request.payload[bank * 4..bank * 4 + 4].to_vec(),
                    );
                    self.transact_inner(sub, true).await?;
                }
                Ok(None)
            }
            _ => unreachable!("split_pin_config called for {:#04x}", request.opcode),
        }
    }

    /// Stream a payload tail as raw data packets.  Old-firmware sends
    /// mark the end with a 0x00 terminator on the final packet.
    async fn stream_data(
        &self,
        data: &[u8],
        terminator: bool,
        timeout: Duration,
    ) -> Result<()> {
        let mps = self.state.max_packet_size;
        let full = data.len() / mps * mps;

        for chunk in data[..full].chunks(mps) {
            self.state.usb.interrupt_out(chunk, timeout).await?;
        }

        let last = &data[full..];
        if terminator {
            let mut packet = last.to_vec();
            packet.push(0x00);
            self.state.usb.interrupt_out(&packet, timeout).await?;
        } else if !last.is_empty() {
            self.state.usb.interrupt_out(last, timeout).await?;
        }

        Ok(())
    }

    /// Discard any acknowledgement left over from an earlier
    /// transaction that gave up waiting.
    fn flush_stale_responses(&mut self) {
        while self.ack_rx.try_recv().is_ok() {
            warn!("device {}: flushed extraneous acknowledgement", self.state.id);
        }
        if let Some(stale) = self.state.response_slot.lock().unwrap().take() {
            warn!(
                "device {}: discarded stale {:#04x} response",
                self.state.id, stale.opcode
            );
        }
    }

    /// Ask the device its firmware version and make sure we can drive
    /// it.  A freshly power-cycled repeater-capable loader swallows the
    /// first request it sees, so one retry is part of the protocol.
    pub async fn probe_version(&mut self) -> Result<FirmwareCapabilities> {
        let mut response = self.transact(Packet::new(opcode::GETVERSION), true).await;
        if response.is_err() {
            response = self.transact(Packet::new(opcode::GETVERSION), true).await;
        }

        let packet = response?.ok_or(Error::BadRequest("no version response"))?;
        if packet.payload.len() != 2 {
            return Err(Error::ResponsePayloadMismatch {
                got: packet.payload.len(),
            });
        }

        let version = u16::from_le_bytes([packet.payload[0], packet.payload[1]]);
        info!("device {}: firmware version {version:#06x}", self.state.id);

        let caps = FirmwareCapabilities::new(version);
        if !caps.supported() {
            return Err(Error::UnsupportedFirmware(version));
        }

        self.state.set_version(version);
        Ok(caps)
    }

    /// Best-effort fetch of the feature flags (and, on firmware that
    /// reports it, the transmit-loop cycle count).
    pub async fn fetch_features(&mut self) {
        let caps = self.state.capabilities();
        if !caps.has_body() || self.state.features() != UNKNOWN_FEATURES {
            return;
        }

        match self.transact(Packet::new(opcode::GETFEATURES), true).await {
            Ok(Some(packet)) if !packet.payload.is_empty() => {
                self.state.set_features(packet.payload[0]);
                if caps.reports_loop_cycles() {
                    if let Some(&cycles) = packet.payload.get(1) {
                        self.state.set_loop_cycles(cycles);
                    }
                }
                debug!(
                    "device {}: features {:#04x}, loop cycles {}",
                    self.state.id,
                    self.state.features(),
                    self.state.loop_cycles()
                );
            }
            Ok(_) => info!("device {}: empty feature response", self.state.id),
            Err(e) => info!("device {}: failed to get features: {e}", self.state.id),
        }
    }

    /// Read the label stored on the device, if it has one.
    pub async fn read_label(&mut self) -> Option<String> {
        match self.transact(Packet::new(opcode::GETID), true).await {
            Ok(Some(packet)) => {
                let end = packet
                    .payload
                    .iter()
                    .position(|&b| b == 0)
                    .unwrap_or(packet.payload.len());
                let label = String::from_utf8_lossy(&packet.payload[..end]).into_owned();
                if label.is_empty() { None } else { Some(label) }
            }
            _ => {
                info!(
                    "device {}: failed to get id, it may not have one assigned",
                    self.state.id
                );
                None
            }
        }
    }
}

/// Build the 68-byte writable code block that makes the device emit a
/// 12-byte label when executed.  The page image starts with the target
/// page marker, then per-byte store instructions staging the label
/// into the transmit buffer and two calls into the firmware's
/// send-packet routine, and ends with a return; unused space is filled
/// with halt instructions.
pub fn generate_id_block(label: &[u8], version: u16) -> Vec<u8> {
    let mut data = vec![0x30u8; 68];
    data[0] = 0x7F;
    data[1] = 0;
    data[2] = 0;
    data[3] = 0;
    let mut len = 4;

    if !label.is_empty() {
        /* the wire bytes the stored program will replay: a
         * device-to-host control header plus the label */
        let mut wire = [0u8; 16];
        wire[0] = 0x00;
        wire[1] = 0x00;
        wire[2] = 0xDC;
        wire[3] = versions::to_device(opcode::GETID, version).unwrap_or(opcode::GETID);

        if label.len() > 12 {
            warn!("label is too long, truncating to 12 bytes");
        }
        let take = label.len().min(12);
        wire[4..4 + take].copy_from_slice(&label[..take]);

        /* firmware address constants differ between the old unified
         * images and the loader/body pairs */
        let (packet_start, send_address, size_in_a) = if version >= 0x101 {
            (0xF8u8, 0x94u8, false)
        } else {
            (0x7Cu8, 0x68u8, true)
        };

        for half in 0..2usize {
            /* stage 8 bytes of the message */
            for offset in 0..8usize {
                data[len] = 0x55;
                data[len + 1] = packet_start + offset as u8;
                data[len + 2] = wire[half * 8 + offset];
                len += 3;
            }
            /* load the packet size and location */
            data[len] = if size_in_a { 0x50 } else { 0x57 };
            data[len + 1] = 0x08;
            data[len + 2] = if size_in_a { 0x57 } else { 0x50 };
            data[len + 3] = packet_start;
            len += 4;
            /* lcall write_data */
            data[len] = 0x7C;
            data[len + 1] = 0x00;
            data[len + 2] = send_address;
            len += 3;
        }
    }

    /* trailing ret */
    data[len] = 0x7F;
    data
}
