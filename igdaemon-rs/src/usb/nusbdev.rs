/* Modern USB backend built on nusb.
 *
 * Transfers are submitted asynchronously and cancelled by dropping the
 * in-flight future, which gives clean timeout behavior without a
 * dedicated thread per device.  Reads and writes can overlap freely,
 * so this backend does not request serialized I/O. */

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nusb::transfer::{Direction, EndpointType, RequestBuffer, TransferError};
use tracing::debug;

use super::{BusAddress, DiscoveredDevice, UsbBackend, UsbError, UsbId, UsbTransceiver};

fn map_transfer_error(e: TransferError) -> UsbError {
    match e {
        TransferError::Stall => UsbError::Stall,
        TransferError::Disconnected => UsbError::Disconnected,
        TransferError::Cancelled => UsbError::Timeout,
        other => UsbError::Other(other.to_string()),
    }
}

fn map_nusb_error(e: std::io::Error) -> UsbError {
    match e.raw_os_error() {
        Some(code) if code == nix::errno::Errno::EBUSY as i32 => UsbError::Busy,
        Some(code) if code == nix::errno::Errno::ENODEV as i32 => UsbError::Disconnected,
        _ => UsbError::Io(e),
    }
}

pub struct NusbTransceiver {
    interface: nusb::Interface,
    device: nusb::Device,
    ep_in: u8,
    ep_out: u8,
    max_packet_size: usize,
}

#[async_trait]
impl UsbTransceiver for NusbTransceiver {
    fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    async fn interrupt_in(&self, len: usize, timeout: Duration) -> Result<Vec<u8>, UsbError> {
        let transfer = self
            .interface
            .interrupt_in(self.ep_in, RequestBuffer::new(len));

        /* dropping the transfer future cancels the URB */
        match tokio::time::timeout(timeout, transfer).await {
            Ok(completion) => {
                completion.status.map_err(map_transfer_error)?;
                Ok(completion.data)
            }
            Err(_) => Err(UsbError::Timeout),
        }
    }

    async fn interrupt_out(&self, data: &[u8], timeout: Duration) -> Result<(), UsbError> {
        let transfer = self.interface.interrupt_out(self.ep_out, data.to_vec());

        match tokio::time::timeout(timeout, transfer).await {
            Ok(completion) => {
                completion.status.map_err(map_transfer_error)?;
                Ok(())
            }
            Err(_) => Err(UsbError::Timeout),
        }
    }

    async fn reset(&self) -> Result<(), UsbError> {
        self.device.reset().map_err(map_nusb_error)
    }

    async fn clear_halt(&self) -> Result<(), UsbError> {
        self.interface
            .clear_halt(self.ep_in)
            .map_err(map_nusb_error)?;
        self.interface
            .clear_halt(self.ep_out)
            .map_err(map_nusb_error)
    }
}

pub struct NusbBackend;

impl NusbBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl UsbBackend for NusbBackend {
    fn name(&self) -> &'static str {
        "nusb"
    }

    async fn enumerate(&self) -> Result<Vec<DiscoveredDevice>, UsbError> {
        let devices = nusb::list_devices().map_err(map_nusb_error)?;

        Ok(devices
            .filter(|d| super::is_supported(d.vendor_id(), d.product_id()))
            .map(|d| DiscoveredDevice {
                location: BusAddress {
                    bus: d.bus_number(),
                    address: d.device_address(),
                },
                id: UsbId {
                    vendor: d.vendor_id(),
                    product: d.product_id(),
                },
            })
            .collect())
    }

    async fn open(
        &self,
        dev: &DiscoveredDevice,
        unbind: bool,
    ) -> Result<Arc<dyn UsbTransceiver>, UsbError> {
        let info = nusb::list_devices()
            .map_err(map_nusb_error)?
            .find(|d| {
                d.bus_number() == dev.location.bus && d.device_address() == dev.location.address
            })
            .ok_or(UsbError::Disconnected)?;

        let device = info.open().map_err(map_nusb_error)?;

        let interface = if unbind {
            device.detach_and_claim_interface(0)
        } else {
            device.claim_interface(0)
        }
        .map_err(map_nusb_error)?;

        /* the transceiver exposes exactly one interrupt endpoint in
         * each direction; find them and size transfers accordingly */
        let config = device
            .active_configuration()
            .map_err(|e| UsbError::Other(e.to_string()))?;

        let mut ep_in = None;
        let mut ep_out = None;
        let mut max_packet_size = usize::MAX;

        for group in config.interfaces() {
            for alt in group.alt_settings() {
                if alt.interface_number() != 0 {
                    continue;
                }
                for ep in alt.endpoints() {
                    if ep.transfer_type() != EndpointType::Interrupt {
                        continue;
                    }
                    if ep.direction() == Direction::In {
                        ep_in.get_or_insert(ep.address());
                    } else {
                        ep_out.get_or_insert(ep.address());
                    }
                    max_packet_size = max_packet_size.min(ep.max_packet_size());
                }
            }
        }

        let (Some(ep_in), Some(ep_out)) = (ep_in, ep_out) else {
            return Err(UsbError::BadInterface);
        };

        debug!(
            "claimed {}: ep_in {ep_in:#04x}, ep_out {ep_out:#04x}, max packet {max_packet_size}",
            dev.location
        );

        Ok(Arc::new(NusbTransceiver {
            interface,
            device,
            ep_in,
            ep_out,
            max_packet_size,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_error_mapping() {
        assert!(matches!(
            map_transfer_error(TransferError::Stall),
            UsbError::Stall
        ));
        assert!(matches!(
            map_transfer_error(TransferError::Disconnected),
            UsbError::Disconnected
        ));
    }
}
