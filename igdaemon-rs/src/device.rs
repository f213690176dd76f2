/* Per-device shared state.
 *
 * One `DeviceState` is shared between the reader task, the transactor,
 * and the worker that owns them both.  The reader fills either the
 * response slot (acknowledgements) or the receive queue
 * (device-initiated packets); the transactor drains the slot, the
 * worker drains the queue.  The scalar fields are atomics because they
 * are written rarely (startup, SETCARRIER, SETCHANNELS) and read on
 * every transaction without wanting a lock. */

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::codec;
use crate::packet::Packet;
use crate::usb::{BusAddress, UsbTransceiver};

/// GETFEATURES has not been asked yet, or the firmware has no body.
pub const UNKNOWN_FEATURES: u8 = 0xFF;

/// Timeouts shared by every device, fixed at daemon startup.
#[derive(Debug, Clone, Copy)]
pub struct DeviceSettings {
    pub recv_timeout: Duration,
    pub send_timeout: Duration,
    /// Treat EPIPE from a transfer as a disconnect.
    pub disconnect_on_epipe: bool,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            recv_timeout: Duration::from_millis(1000),
            send_timeout: Duration::from_millis(1000),
            disconnect_on_epipe: false,
        }
    }
}

/// Named capability checks over the raw firmware version word.
///
/// Version numbering: 1..=4 are the old single-image firmwares;
/// 0xFF00 is the reflasher; 0x0100..0x0400 are loader/body pairs with
/// the body generation in the low byte.  Code elsewhere branches on
/// these predicates, never on raw comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareCapabilities {
    version: u16,
}

impl FirmwareCapabilities {
    pub fn new(version: u16) -> Self {
        Self { version }
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    /// Versions this daemon knows how to drive.
    pub fn supported(&self) -> bool {
        (self.version >= 1 && self.version <= 4)
            || self.version == 0xFF00
            || (self.version >= 0x0100 && self.version < 0x0400)
    }

    /// Loader/body split firmware, both halves present.
    pub fn has_body(&self) -> bool {
        self.version & 0x00FF != 0 && self.version & 0xFF00 != 0
    }

    /// The carrier frequency can be tuned per transmission.
    pub fn adjustable_carrier(&self) -> bool {
        self.has_body()
    }

    /// The firmware reports its transmit-loop cycle count through
    /// GETFEATURES instead of relying on the compiled-in constant.
    pub fn reports_loop_cycles(&self) -> bool {
        self.has_body() && self.version & 0x00FF >= 0x0004
    }

    /// SEND-style requests carry an explicit length byte (and channel
    /// selection) in the control packet.
    pub fn length_prefixed_data(&self) -> bool {
        self.version >= 3
    }

    /// SEND data streams must end with a 0x00 terminator byte.
    pub fn send_terminator(&self) -> bool {
        self.version < 3
    }

    /// Pin configuration is split across two 4-byte register banks.
    pub fn split_pin_config(&self) -> bool {
        self.version <= 3
    }

    /// The firmware speaks the original opcode numbering.
    pub fn legacy_protocol(&self) -> bool {
        self.version <= 4
    }
}

/// State shared by the reader, transactor, and worker of one device.
pub struct DeviceState {
    pub id: u32,
    pub location: BusAddress,
    pub usb: Arc<dyn UsbTransceiver>,
    pub max_packet_size: usize,
    pub settings: DeviceSettings,

    /// Firmware version word, 0 until the startup probe stores it.
    version: AtomicU16,
    features: AtomicU8,
    loop_cycles: AtomicU8,
    carrier_hz: AtomicU32,
    channels: AtomicU8,

    /// Set when the daemon is done with the device; makes the reader
    /// exit on its next timeout.
    stopped: AtomicBool,

    /// The single pending acknowledgement from the device.
    pub response_slot: Mutex<Option<Packet>>,

    /// Backends that cannot overlap reads and writes set
    /// `serialized_io`; the transactor then takes `io_lock` around its
    /// writes and raises `need_write` so the reader yields.
    pub serialized_io: bool,
    pub io_lock: tokio::sync::Mutex<()>,
    pub need_write: AtomicBool,
}

impl DeviceState {
    pub fn new(
        id: u32,
        location: BusAddress,
        usb: Arc<dyn UsbTransceiver>,
        settings: DeviceSettings,
        serialized_io: bool,
    ) -> Self {
        let max_packet_size = usb.max_packet_size();
        Self {
            id,
            location,
            usb,
            max_packet_size,
            settings,
            version: AtomicU16::new(0),
            features: AtomicU8::new(UNKNOWN_FEATURES),
            loop_cycles: AtomicU8::new(codec::DEFAULT_LOOP_CYCLES),
            carrier_hz: AtomicU32::new(38_000),
            channels: AtomicU8::new(0),
            stopped: AtomicBool::new(false),
            response_slot: Mutex::new(None),
            serialized_io,
            io_lock: tokio::sync::Mutex::new(()),
            need_write: AtomicBool::new(false),
        }
    }

    pub fn capabilities(&self) -> FirmwareCapabilities {
        FirmwareCapabilities::new(self.version())
    }

    pub fn version(&self) -> u16 {
        self.version.load(Ordering::Acquire)
    }

    pub fn set_version(&self, version: u16) {
        self.version.store(version, Ordering::Release);
    }

    pub fn features(&self) -> u8 {
        self.features.load(Ordering::Acquire)
    }

    pub fn set_features(&self, features: u8) {
        self.features.store(features, Ordering::Release);
    }

    pub fn loop_cycles(&self) -> u8 {
        self.loop_cycles.load(Ordering::Acquire)
    }

    pub fn set_loop_cycles(&self, cycles: u8) {
        self.loop_cycles.store(cycles, Ordering::Release);
    }

    pub fn carrier_hz(&self) -> u32 {
        self.carrier_hz.load(Ordering::Acquire)
    }

    pub fn set_carrier_hz(&self, carrier: u32) {
        self.carrier_hz.store(carrier, Ordering::Release);
    }

    pub fn channels(&self) -> u8 {
        self.channels.load(Ordering::Acquire)
    }

    pub fn set_channels(&self, channels: u8) {
        self.channels.store(channels, Ordering::Release);
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

/// Capacity of the reader->worker receive queue.
pub const RECV_QUEUE_DEPTH: usize = 64;

/// Build the channel pair linking a reader to its worker: the bounded
/// receive queue and the single-slot acknowledgement signal.
pub fn reader_channels() -> (ReaderSide, WorkerSide) {
    let (recv_tx, recv_rx) = mpsc::channel(RECV_QUEUE_DEPTH);
    let (ack_tx, ack_rx) = mpsc::channel(4);
    (
        ReaderSide { recv_tx, ack_tx },
        WorkerSide { recv_rx, ack_rx },
    )
}

pub struct ReaderSide {
    pub recv_tx: mpsc::Sender<Packet>,
    pub ack_tx: mpsc::Sender<()>,
}

pub struct WorkerSide {
    pub recv_rx: mpsc::Receiver<Packet>,
    pub ack_rx: mpsc::Receiver<()>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_versions() {
        for v in [1, 2, 3, 4, 0xFF00, 0x0100, 0x0102, 0x0305, 0x03FF] {
            assert!(FirmwareCapabilities::new(v).supported(), "{v:#06x}");
        }
        for v in [0, 5, 0x0400, 0x0500, 0xFF01] {
            assert!(!FirmwareCapabilities::new(v).supported(), "{v:#06x}");
        }
    }

    #[test]
    fn test_body_detection() {
        assert!(!FirmwareCapabilities::new(2).has_body());
        assert!(!FirmwareCapabilities::new(0xFF00).has_body());
        assert!(FirmwareCapabilities::new(0x0101).has_body());
        assert!(FirmwareCapabilities::new(0x0306).adjustable_carrier());
    }

    #[test]
    fn test_loop_cycle_reporting_needs_body_four() {
        assert!(!FirmwareCapabilities::new(0x0103).reports_loop_cycles());
        assert!(FirmwareCapabilities::new(0x0104).reports_loop_cycles());
        assert!(FirmwareCapabilities::new(0x0306).reports_loop_cycles());
        assert!(!FirmwareCapabilities::new(4).reports_loop_cycles());
    }

    #[test]
    fn test_data_stream_framing_rules() {
        let old = FirmwareCapabilities::new(2);
        assert!(old.send_terminator());
        assert!(!old.length_prefixed_data());

        let new = FirmwareCapabilities::new(0x0102);
        assert!(!new.send_terminator());
        assert!(new.length_prefixed_data());
    }

    #[test]
    fn test_pin_config_split() {
        assert!(FirmwareCapabilities::new(3).split_pin_config());
        assert!(!FirmwareCapabilities::new(4).split_pin_config());
        assert!(!FirmwareCapabilities::new(0x0101).split_pin_config());
    }

    #[test]
    fn test_legacy_protocol_threshold() {
        assert!(FirmwareCapabilities::new(4).legacy_protocol());
        assert!(!FirmwareCapabilities::new(5).legacy_protocol());
        assert!(!FirmwareCapabilities::new(0x0101).legacy_protocol());
    }
}
