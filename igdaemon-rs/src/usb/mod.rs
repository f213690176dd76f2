/* USB access layer.
 *
 * The rest of the daemon never touches a USB library directly; it
 * talks to a `UsbBackend` (enumeration and open) and a
 * `UsbTransceiver` (the claimed interrupt endpoint pair of one
 * device).  Two implementations coexist: the asynchronous `nusb`
 * backend and a legacy Linux usbfs backend driving the character
 * device with blocking ioctls.  The daemon selects one at startup from
 * the `--driver` preference list. */

#[cfg(test)]
pub mod mock;
pub mod nusbdev;
pub mod usbfs;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum UsbError {
    #[error("transfer timed out")]
    Timeout,

    #[error("device disconnected")]
    Disconnected,

    #[error("endpoint stalled")]
    Stall,

    #[error("broken pipe")]
    Epipe,

    #[error("device busy (is another daemon running?)")]
    Busy,

    #[error("unexpected interface layout")]
    BadInterface,

    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// A vendor/product pair the daemon will claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbId {
    pub vendor: u16,
    pub product: u16,
}

/// Hardware the daemon recognizes.
pub const SUPPORTED_IDS: &[UsbId] = &[UsbId {
    vendor: 0x1781,
    product: 0x0938,
}];

pub fn is_supported(vendor: u16, product: u16) -> bool {
    SUPPORTED_IDS
        .iter()
        .any(|id| id.vendor == vendor && id.product == product)
}

/// Physical position of a device on the bus.  Stable for as long as
/// the device stays plugged in, and the key the registry tracks
/// devices by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BusAddress {
    pub bus: u8,
    pub address: u8,
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}-{:03}", self.bus, self.address)
    }
}

/// One device found during enumeration, not yet claimed.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub location: BusAddress,
    pub id: UsbId,
}

/// The claimed interrupt endpoint pair of one transceiver.
///
/// Exactly one reader task calls `interrupt_in` and exactly one
/// transactor calls `interrupt_out`; backends may rely on that.
#[async_trait]
pub trait UsbTransceiver: Send + Sync {
    /// Max packet size of the endpoint pair (minimum of IN and OUT).
    fn max_packet_size(&self) -> usize;

    async fn interrupt_in(&self, len: usize, timeout: Duration) -> Result<Vec<u8>, UsbError>;

    async fn interrupt_out(&self, data: &[u8], timeout: Duration) -> Result<(), UsbError>;

    /// Port-level reset, the fallback when a firmware reset request
    /// cannot be delivered.
    async fn reset(&self) -> Result<(), UsbError>;

    async fn clear_halt(&self) -> Result<(), UsbError>;
}

#[async_trait]
pub trait UsbBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// True when the backend cannot overlap reads and writes on one
    /// device; the reader and transactor then serialize their USB
    /// calls around a shared lock.
    fn serialized_io(&self) -> bool {
        false
    }

    async fn enumerate(&self) -> Result<Vec<DiscoveredDevice>, UsbError>;

    /// Claim a discovered device, locating its interrupt endpoint
    /// pair.  `unbind` detaches any kernel driver first.
    async fn open(
        &self,
        dev: &DiscoveredDevice,
        unbind: bool,
    ) -> Result<Arc<dyn UsbTransceiver>, UsbError>;
}

/// Pick the USB backend to run with.
///
/// `preferred` names are tried in order; with `only_preferred` unset
/// the remaining backends are appended as fallbacks.
pub fn select_backend(
    preferred: &[String],
    only_preferred: bool,
) -> Option<Arc<dyn UsbBackend>> {
    let all: Vec<Arc<dyn UsbBackend>> = vec![
        Arc::new(nusbdev::NusbBackend::new()),
        Arc::new(usbfs::UsbfsBackend::new()),
    ];

    for name in preferred {
        match all.iter().find(|b| b.name() == name.as_str()) {
            Some(b) => {
                info!("using preferred USB backend {}", b.name());
                return Some(Arc::clone(b));
            }
            None => warn!("unknown USB backend {name:?}"),
        }
    }

    if only_preferred {
        return None;
    }

    let fallback = all.into_iter().next();
    if let Some(b) = &fallback {
        info!("using USB backend {}", b.name());
    }
    fallback
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_id_table() {
        assert!(is_supported(0x1781, 0x0938));
        assert!(!is_supported(0x1781, 0x0939));
        assert!(!is_supported(0x046d, 0x0938));
    }

    #[test]
    fn test_bus_address_display() {
        let loc = BusAddress { bus: 4, address: 17 };
        assert_eq!(loc.to_string(), "004-017");
    }

    #[test]
    fn test_backend_selection_prefers_named() {
        let b = select_backend(&["usbfs".into()], true).unwrap();
        assert_eq!(b.name(), "usbfs");
    }

    #[test]
    fn test_backend_selection_falls_back() {
        let b = select_backend(&["no-such-backend".into()], false).unwrap();
        assert_eq!(b.name(), "nusb");
        assert!(select_backend(&["no-such-backend".into()], true).is_none());
    }
}
