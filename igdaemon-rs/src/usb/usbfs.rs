/* Legacy USB backend driving Linux usbfs directly.
 *
 * Enumeration walks /sys/bus/usb/devices; claimed devices are the
 * /dev/bus/usb/BBB/DDD character nodes, with transfers issued through
 * the blocking USBDEVFS_BULK ioctl (valid for interrupt endpoints) on
 * a `spawn_blocking` worker.  usbfs cannot overlap a blocking read
 * and write on the same device node, so this backend reports
 * serialized I/O and the reader/transactor arbitrate around it. */

use std::fs;
use std::mem::size_of;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::libc::{c_uint, c_void};
use nix::{ioctl_none, ioctl_readwrite, ioctl_write_ptr_bad, request_code_read};
use tracing::{debug, warn};

use super::{BusAddress, DiscoveredDevice, UsbBackend, UsbError, UsbId, UsbTransceiver};

const USB_DIR_IN: u8 = 0x80;
const USB_TRANSFER_TYPE_MASK: u8 = 0x03;
const USB_TRANSFER_TYPE_INTERRUPT: u8 = 0x03;
const DESCRIPTOR_TYPE_ENDPOINT: u8 = 0x05;

#[repr(C)]
struct BulkTransfer {
    ep: c_uint,
    len: c_uint,
    timeout: c_uint, /* milliseconds */
    data: *mut c_void,
}

#[repr(C)]
struct DisconnectClaim {
    interface: c_uint,
    flags: c_uint,
    driver: [u8; 256],
}

/* usbfs request codes; several are declared _IOR in the kernel header
 * even though userspace writes them, hence the *_bad forms. */
ioctl_readwrite!(usbdevfs_bulk, b'U', 2, BulkTransfer);
ioctl_write_ptr_bad!(
    usbdevfs_claim_interface,
    request_code_read!(b'U', 15, size_of::<c_uint>()),
    c_uint
);
ioctl_none!(usbdevfs_reset, b'U', 20);
ioctl_write_ptr_bad!(
    usbdevfs_clear_halt,
    request_code_read!(b'U', 21, size_of::<c_uint>()),
    c_uint
);
ioctl_write_ptr_bad!(
    usbdevfs_disconnect_claim,
    request_code_read!(b'U', 27, size_of::<DisconnectClaim>()),
    DisconnectClaim
);

fn map_errno(e: Errno) -> UsbError {
    match e {
        Errno::ETIMEDOUT | Errno::EAGAIN => UsbError::Timeout,
        Errno::ENODEV | Errno::ENOENT => UsbError::Disconnected,
        Errno::EPIPE => UsbError::Epipe,
        Errno::EBUSY => UsbError::Busy,
        other => UsbError::Io(std::io::Error::from_raw_os_error(other as i32)),
    }
}

/// An interrupt endpoint parsed from the configuration descriptors.
#[derive(Debug, Clone, Copy)]
struct EndpointInfo {
    address: u8,
    max_packet_size: u16,
}

/// Walk the descriptor stream the devnode exposes and pick out the
/// interrupt endpoint pair.  The transceiver hardware presents one
/// configuration with one interface and exactly two interrupt
/// endpoints; anything else is a device we should not claim.
fn parse_endpoints(descriptors: &[u8]) -> Result<(EndpointInfo, EndpointInfo), UsbError> {
    let mut ep_in = None;
    let mut ep_out = None;

    let mut pos = 0usize;
    while pos + 2 <= descriptors.len() {
        let len = descriptors[pos] as usize;
        if len < 2 || pos + len > descriptors.len() {
            break;
        }

        if descriptors[pos + 1] == DESCRIPTOR_TYPE_ENDPOINT && len >= 7 {
            let address = descriptors[pos + 2];
            let attributes = descriptors[pos + 3];
            let max_packet =
                u16::from_le_bytes([descriptors[pos + 4], descriptors[pos + 5]]);

            if attributes & USB_TRANSFER_TYPE_MASK == USB_TRANSFER_TYPE_INTERRUPT {
                let info = EndpointInfo {
                    address,
                    max_packet_size: max_packet,
                };
                if address & USB_DIR_IN != 0 {
                    ep_in.get_or_insert(info);
                } else {
                    ep_out.get_or_insert(info);
                }
            }
        }

        pos += len;
    }

    match (ep_in, ep_out) {
        (Some(i), Some(o)) => Ok((i, o)),
        _ => Err(UsbError::BadInterface),
    }
}

struct UsbfsDevice {
    file: fs::File,
    node: PathBuf,
    ep_in: EndpointInfo,
    ep_out: EndpointInfo,
}

impl UsbfsDevice {
    fn bulk(&self, ep: u8, buf: &mut [u8], timeout: Duration) -> Result<usize, UsbError> {
        let mut xfer = BulkTransfer {
            ep: ep as c_uint,
            len: buf.len() as c_uint,
            timeout: timeout.as_millis() as c_uint,
            data: buf.as_mut_ptr() as *mut c_void,
        };

        /* SAFETY: `file` is an open usbfs node for the lifetime of
         * this call and `buf` outlives the ioctl; the kernel reads or
         * writes at most `len` bytes of it. */
        let n = unsafe { usbdevfs_bulk(self.file.as_raw_fd(), &mut xfer) }
            .map_err(map_errno)?;
        Ok(n as usize)
    }
}

pub struct UsbfsTransceiver {
    dev: Arc<UsbfsDevice>,
    max_packet_size: usize,
}

#[async_trait]
impl UsbTransceiver for UsbfsTransceiver {
    fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    async fn interrupt_in(&self, len: usize, timeout: Duration) -> Result<Vec<u8>, UsbError> {
        let dev = Arc::clone(&self.dev);
        tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; len];
            let n = dev.bulk(dev.ep_in.address, &mut buf, timeout)?;
            buf.truncate(n);
            Ok(buf)
        })
        .await
        .map_err(|e| UsbError::Other(format!("blocking read task failed: {e}")))?
    }

    async fn interrupt_out(&self, data: &[u8], timeout: Duration) -> Result<(), UsbError> {
        let dev = Arc::clone(&self.dev);
        let mut buf = data.to_vec();
        let want = buf.len();
        tokio::task::spawn_blocking(move || {
            let n = dev.bulk(dev.ep_out.address, &mut buf, timeout)?;
            if n != want {
                return Err(UsbError::Other(format!("short write: {n} of {want} bytes")));
            }
            Ok(())
        })
        .await
        .map_err(|e| UsbError::Other(format!("blocking write task failed: {e}")))?
    }

    async fn reset(&self) -> Result<(), UsbError> {
        let dev = Arc::clone(&self.dev);
        tokio::task::spawn_blocking(move || {
            /* SAFETY: plain fd-only ioctl on an open usbfs node. */
            unsafe { usbdevfs_reset(dev.file.as_raw_fd()) }
                .map(|_| ())
                .map_err(map_errno)
        })
        .await
        .map_err(|e| UsbError::Other(format!("blocking reset task failed: {e}")))?
    }

    async fn clear_halt(&self) -> Result<(), UsbError> {
        let dev = Arc::clone(&self.dev);
        tokio::task::spawn_blocking(move || {
            for ep in [dev.ep_in.address, dev.ep_out.address] {
                let ep = ep as c_uint;
                /* SAFETY: the pointer target lives across the call. */
                unsafe { usbdevfs_clear_halt(dev.file.as_raw_fd(), &ep) }
                    .map_err(map_errno)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| UsbError::Other(format!("blocking clear-halt task failed: {e}")))?
    }
}

pub struct UsbfsBackend {
    sysfs_root: PathBuf,
    devfs_root: PathBuf,
}

impl UsbfsBackend {
    pub fn new() -> Self {
        Self {
            sysfs_root: PathBuf::from("/sys/bus/usb/devices"),
            devfs_root: PathBuf::from("/dev/bus/usb"),
        }
    }

    fn devnode(&self, location: BusAddress) -> PathBuf {
        self.devfs_root
            .join(format!("{:03}", location.bus))
            .join(format!("{:03}", location.address))
    }
}

fn read_sysfs_hex(dir: &Path, name: &str) -> Option<u16> {
    let text = fs::read_to_string(dir.join(name)).ok()?;
    u16::from_str_radix(text.trim(), 16).ok()
}

fn read_sysfs_dec(dir: &Path, name: &str) -> Option<u8> {
    let text = fs::read_to_string(dir.join(name)).ok()?;
    text.trim().parse().ok()
}

fn scan_sysfs(root: &Path) -> Result<Vec<DiscoveredDevice>, UsbError> {
    let mut found = Vec::new();

    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name();
        /* interface directories contain ':'; we want whole devices */
        if name.to_string_lossy().contains(':') {
            continue;
        }

        let dir = entry.path();
        let (Some(vendor), Some(product)) = (
            read_sysfs_hex(&dir, "idVendor"),
            read_sysfs_hex(&dir, "idProduct"),
        ) else {
            continue;
        };

        if !super::is_supported(vendor, product) {
            continue;
        }

        let (Some(bus), Some(address)) = (
            read_sysfs_dec(&dir, "busnum"),
            read_sysfs_dec(&dir, "devnum"),
        ) else {
            warn!("device {:?} matches but lacks bus/device numbers", dir);
            continue;
        };

        found.push(DiscoveredDevice {
            location: BusAddress { bus, address },
            id: UsbId { vendor, product },
        });
    }

    Ok(found)
}

#[async_trait]
impl UsbBackend for UsbfsBackend {
    fn name(&self) -> &'static str {
        "usbfs"
    }

    fn serialized_io(&self) -> bool {
        true
    }

    async fn enumerate(&self) -> Result<Vec<DiscoveredDevice>, UsbError> {
        let root = self.sysfs_root.clone();
        tokio::task::spawn_blocking(move || scan_sysfs(&root))
            .await
            .map_err(|e| UsbError::Other(format!("enumeration task failed: {e}")))?
    }

    async fn open(
        &self,
        dev: &DiscoveredDevice,
        unbind: bool,
    ) -> Result<Arc<dyn UsbTransceiver>, UsbError> {
        let node = self.devnode(dev.location);

        let opened = tokio::task::spawn_blocking(move || -> Result<UsbfsDevice, UsbError> {
            let file = fs::OpenOptions::new().read(true).write(true).open(&node)?;

            /* the devnode starts with the descriptor stream */
            let descriptors = fs::read(&node)?;
            let (ep_in, ep_out) = parse_endpoints(&descriptors)?;

            let interface: c_uint = 0;
            if unbind {
                let claim = DisconnectClaim {
                    interface,
                    flags: 0,
                    driver: [0; 256],
                };
                /* SAFETY: the struct outlives the call and its layout
                 * matches the kernel's usbdevfs_disconnect_claim. */
                unsafe { usbdevfs_disconnect_claim(file.as_raw_fd(), &claim) }
                    .map_err(map_errno)?;
            } else {
                /* SAFETY: pointer to a live c_uint. */
                unsafe { usbdevfs_claim_interface(file.as_raw_fd(), &interface) }
                    .map_err(map_errno)?;
            }

            Ok(UsbfsDevice {
                file,
                node,
                ep_in,
                ep_out,
            })
        })
        .await
        .map_err(|e| UsbError::Other(format!("open task failed: {e}")))??;

        let max_packet_size = opened
            .ep_in
            .max_packet_size
            .min(opened.ep_out.max_packet_size) as usize;

        debug!(
            "claimed {:?}: ep_in {:#04x}, ep_out {:#04x}, max packet {}",
            opened.node, opened.ep_in.address, opened.ep_out.address, max_packet_size
        );

        Ok(Arc::new(UsbfsTransceiver {
            dev: Arc::new(opened),
            max_packet_size,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /* device + config + interface + two interrupt endpoints, as the
     * transceiver hardware reports them */
    fn descriptor_stream() -> Vec<u8> {
        let mut d = Vec::new();
        /* device descriptor, 18 bytes */
        d.extend_from_slice(&[
            18, 1, 0x10, 0x01, 0xFF, 0, 0, 8, 0x81, 0x17, 0x38, 0x09, 0x01, 0x00, 1, 2, 0, 1,
        ]);
        /* configuration descriptor */
        d.extend_from_slice(&[9, 2, 32, 0, 1, 1, 0, 0x80, 50]);
        /* interface descriptor */
        d.extend_from_slice(&[9, 4, 0, 0, 2, 0xFF, 0, 0, 0]);
        /* endpoint 0x81 interrupt IN, max packet 8 */
        d.extend_from_slice(&[7, 5, 0x81, 0x03, 8, 0, 10]);
        /* endpoint 0x02 interrupt OUT, max packet 8 */
        d.extend_from_slice(&[7, 5, 0x02, 0x03, 8, 0, 10]);
        d
    }

    #[test]
    fn test_parse_endpoints() {
        let (ep_in, ep_out) = parse_endpoints(&descriptor_stream()).unwrap();
        assert_eq!(ep_in.address, 0x81);
        assert_eq!(ep_out.address, 0x02);
        assert_eq!(ep_in.max_packet_size, 8);
        assert_eq!(ep_out.max_packet_size, 8);
    }

    #[test]
    fn test_parse_endpoints_rejects_bulk_only() {
        let mut d = descriptor_stream();
        /* flip both endpoints to bulk */
        d[36 + 3] = 0x02;
        d[43 + 3] = 0x02;
        assert!(matches!(
            parse_endpoints(&d),
            Err(UsbError::BadInterface)
        ));
    }

    #[test]
    fn test_parse_endpoints_rejects_truncated() {
        assert!(parse_endpoints(&[9, 2, 32]).is_err());
    }

    #[test]
    fn test_errno_mapping() {
        assert!(matches!(map_errno(Errno::ETIMEDOUT), UsbError::Timeout));
        assert!(matches!(map_errno(Errno::ENODEV), UsbError::Disconnected));
        assert!(matches!(map_errno(Errno::EPIPE), UsbError::Epipe));
        assert!(matches!(map_errno(Errno::EBUSY), UsbError::Busy));
    }
}
