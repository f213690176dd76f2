/* Daemon-wide error type.
 *
 * Failures that reach a client are reported as a negative errno in the
 * response frame, so every variant maps onto one.  Transport failures
 * and device disconnects additionally unwind the owning worker; the
 * rest are local to one transaction. */

use nix::errno::Errno;
use thiserror::Error;

use crate::usb::UsbError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("USB transport failure: {0}")]
    Transport(UsbError),

    #[error("timed out waiting for the device")]
    Timeout,

    #[error("device disconnected")]
    DeviceGone,

    #[error("unknown opcode {opcode:#04x} for firmware {version:#06x}")]
    UnknownOpcode { opcode: u8, version: u16 },

    #[error("opcode {0:#04x} is device-initiated and cannot be requested")]
    WrongDirection(u8),

    #[error("request payload of {got} bytes violates the packet type")]
    RequestPayloadMismatch { got: usize },

    #[error("response payload of {got} bytes violates the packet type")]
    ResponsePayloadMismatch { got: usize },

    #[error("acknowledgement opcode {got:#04x} does not match request {want:#04x}")]
    AckMismatch { got: u8, want: u8 },

    #[error("device rejected the request arguments")]
    InvalidArgument,

    #[error("opcode {opcode:#04x} has no translation in protocol {protocol}")]
    Untranslatable { opcode: u8, protocol: u16 },

    #[error("unsupported firmware version {0:#06x}")]
    UnsupportedFirmware(u16),

    #[error("malformed request: {0}")]
    BadRequest(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<UsbError> for Error {
    fn from(e: UsbError) -> Self {
        match e {
            UsbError::Timeout => Error::Timeout,
            UsbError::Disconnected => Error::DeviceGone,
            other => Error::Transport(other),
        }
    }
}

impl Error {
    /// The errno reported to clients for this failure.
    pub fn errno(&self) -> Errno {
        match self {
            Error::Transport(_) | Error::Io(_) => Errno::EIO,
            Error::Timeout => Errno::ETIMEDOUT,
            Error::DeviceGone => Errno::ENODEV,
            Error::UnknownOpcode { .. }
            | Error::WrongDirection(_)
            | Error::RequestPayloadMismatch { .. }
            | Error::ResponsePayloadMismatch { .. }
            | Error::AckMismatch { .. }
            | Error::InvalidArgument
            | Error::Untranslatable { .. }
            | Error::UnsupportedFirmware(_)
            | Error::BadRequest(_) => Errno::EINVAL,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
