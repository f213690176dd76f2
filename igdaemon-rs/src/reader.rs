/* Interrupt-IN drain task, one per device.
 *
 * Everything the device sends arrives here.  Acknowledgements carry a
 * control header and land in the response slot for the transactor;
 * anything without a header is IR receive data and is queued for the
 * worker to fan out.  The task exits when the device disappears or the
 * daemon marks it stopped; dropping the queue sender is how the worker
 * learns the reader is gone. */

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::catalog::{self, Direction};
use crate::device::{DeviceState, ReaderSide};
use crate::packet::{opcode, Packet};
use crate::usb::UsbError;
use crate::versions;

const CTL_FROMDEV: [u8; 3] = [0x00, 0x00, 0xDC];
const MIN_CTL_LENGTH: usize = 4;

pub fn spawn(state: Arc<DeviceState>, side: ReaderSide) -> JoinHandle<()> {
    tokio::spawn(run(state, side))
}

async fn run(state: Arc<DeviceState>, side: ReaderSide) {
    let ReaderSide { recv_tx, ack_tx } = side;

    loop {
        if state.stopped() {
            info!("device {} released", state.id);
            break;
        }

        /* when the backend cannot overlap I/O, give a waiting writer
         * the endpoint before grabbing it again */
        let io_guard = if state.serialized_io {
            if state.need_write.load(Ordering::Acquire) {
                tokio::task::yield_now().await;
            }
            Some(state.io_lock.lock().await)
        } else {
            None
        };

        let result = state
            .usb
            .interrupt_in(state.max_packet_size, state.settings.recv_timeout)
            .await;
        drop(io_guard);

        let data = match result {
            Ok(data) => data,
            Err(UsbError::Timeout) => continue,
            Err(UsbError::Disconnected) => {
                info!("device {} unplugged", state.id);
                break;
            }
            Err(UsbError::Epipe) if !state.settings.disconnect_on_epipe => {
                warn!("EPIPE reading device {}, ignoring", state.id);
                continue;
            }
            Err(e) => {
                if !state.stopped() {
                    warn!("cannot read from device {}: {e}", state.id);
                }
                break;
            }
        };

        if data.is_empty() {
            debug!("0 length read on device {}", state.id);
            continue;
        }

        let packet = match assemble_packet(&state, data).await {
            Some(p) => p,
            None => continue,
        };

        /* acknowledgements go to the transactor, everything else to
         * the worker's receive queue */
        let spec = catalog::lookup(packet.opcode, state.version());
        let is_ack = matches!(spec.map(|s| s.direction), Some(Direction::ToDevice));
        if is_ack {
            {
                let mut slot = state.response_slot.lock().unwrap();
                if slot.is_some() {
                    warn!(
                        "device {}: acknowledgement {:#04x} arrived before the \
                         previous one was consumed, flushing",
                        state.id, packet.opcode
                    );
                }
                *slot = Some(packet);
            }
            if ack_tx.try_send(()).is_err() {
                warn!("device {}: failed to signal pending acknowledgement", state.id);
            }
        } else if recv_tx.send(packet).await.is_err() {
            /* worker is gone; nothing left to deliver to */
            break;
        }
    }

    /* recv_tx and ack_tx drop here, waking the worker and transactor */
}

/// Classify one interrupt-IN buffer and, for fixed-size responses that
/// span multiple reads, pull the remainder off the wire.
async fn assemble_packet(state: &DeviceState, data: Vec<u8>) -> Option<Packet> {
    let version = state.version();
    let mut packet;

    if data.len() >= MIN_CTL_LENGTH && data[..3] == CTL_FROMDEV {
        let wire_code = data[3];
        let code = match versions::from_device(wire_code, version) {
            Some(c) => c,
            None => {
                warn!(
                    "device {}: no translation for incoming opcode {wire_code:#04x}",
                    state.id
                );
                wire_code
            }
        };
        debug!("device {}: control header {code:#04x}", state.id);

        match code {
            opcode::OVERRECV => warn!("device {}: receive too long", state.id),
            opcode::OVERSEND => warn!("device {}: transmit too long", state.id),
            _ => {}
        }

        packet = Packet::with_payload(code, data[MIN_CTL_LENGTH..].to_vec());
    } else {
        /* bare data is IR receive samples; the final byte is the
         * firmware's buffer fill level, not signal */
        debug!("device {}: data without control header, assuming receive", state.id);
        packet = Packet::with_payload(opcode::RECV, data[..data.len() - 1].to_vec());
    }

    match catalog::lookup(packet.opcode, version) {
        None => {
            /* unknown but stored verbatim; the worker logs and drops */
            warn!(
                "device {}: unknown packet type {:#04x} from device",
                state.id, packet.opcode
            );
        }
        Some(spec) => {
            let mut remaining = spec.response.remaining(packet.payload.len());
            while remaining > 0 {
                match state
                    .usb
                    .interrupt_in(state.max_packet_size, state.settings.recv_timeout)
                    .await
                {
                    Ok(more) if !more.is_empty() && more.len() <= state.max_packet_size => {
                        packet.payload.extend_from_slice(&more);
                        remaining = remaining.saturating_sub(more.len());
                    }
                    other => {
                        warn!(
                            "device {}: short response for {:#04x} ({} bytes missing): {other:?}",
                            state.id, packet.opcode, remaining
                        );
                        return Some(packet);
                    }
                }
            }
        }
    }

    Some(packet)
}
