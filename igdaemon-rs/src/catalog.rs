/* Versioned catalog of packet types.
 *
 * Every opcode the daemon is willing to move toward or accept from a
 * device is described by one or more table rows: direction, request
 * payload size, whether the firmware acknowledges it, and the size of
 * the acknowledgement payload.  Rows carry a firmware version range
 * because several opcodes changed shape across firmware generations
 * (WRITEBLOCK grew a checksum response, PINBURST lost its fixed size,
 * the pin-config operations moved register formats).
 *
 * Lookup returns the first row matching (opcode, firmware version);
 * absence means the request cannot be expressed for that firmware. */

use crate::packet::opcode;

/// Who originates a packet of this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToDevice,
    FromDevice,
}

/// Payload size constraint for one side of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadLen {
    /// No payload may be present.
    None,
    /// Any length, including zero.
    Any,
    /// Exactly this many bytes.
    Fixed(u16),
}

impl PayloadLen {
    pub fn matches(&self, len: usize) -> bool {
        match *self {
            PayloadLen::None => len == 0,
            PayloadLen::Any => true,
            PayloadLen::Fixed(n) => len == n as usize,
        }
    }

    /// The byte count still owed when `len` bytes have arrived, for
    /// response reassembly across short interrupt reads.
    pub fn remaining(&self, len: usize) -> usize {
        match *self {
            PayloadLen::Fixed(n) if (n as usize) > len => n as usize - len,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PacketSpec {
    pub opcode: u8,
    pub direction: Direction,
    pub request: PayloadLen,
    pub ack: bool,
    pub response: PayloadLen,
}

struct VersionedSpec {
    /// Lowest firmware version the row applies to.
    min: u16,
    /// Highest firmware version, 0 meaning no upper bound.
    max: u16,
    spec: PacketSpec,
}

const fn row(
    min: u16,
    max: u16,
    opcode: u8,
    direction: Direction,
    request: PayloadLen,
    ack: bool,
    response: PayloadLen,
) -> VersionedSpec {
    VersionedSpec {
        min,
        max,
        spec: PacketSpec {
            opcode,
            direction,
            request,
            ack,
            response,
        },
    }
}

use Direction::{FromDevice, ToDevice};
use PayloadLen::{Any, Fixed, None as NoData};

#[rustfmt::skip]
static TABLE: &[VersionedSpec] = &[
    /* exchanging the versions of the client and daemon */
    row(0, 0,     opcode::EXCH_VERSIONS, ToDevice, Fixed(2), true,  Fixed(2)),

    row(0, 0,     opcode::GETVERSION,    ToDevice, NoData,   true,  Fixed(2)),

    /* device functionality */
    row(0x101, 0, opcode::GETFEATURES,   ToDevice, NoData,   true,  Any),
    row(0, 0,     opcode::SEND,          ToDevice, Any,      true,  NoData),
    row(0x307, 0, opcode::RESEND,        ToDevice, Fixed(4), true,  NoData),
    row(0, 0,     opcode::SENDSIZE,      ToDevice, Any,      true,  Fixed(2)),
    row(0, 0,     opcode::RECVON,        ToDevice, NoData,   true,  NoData),
    row(0x101, 0, opcode::RAWRECVON,     ToDevice, NoData,   true,  NoData),
    row(0, 0,     opcode::RECVOFF,       ToDevice, NoData,   true,  NoData),

    /* 1 bit per pin of state */
    row(0, 3,     opcode::GETPINS,       ToDevice, NoData,   true,  Fixed(2)),
    row(0x101, 0, opcode::GETPINS,       ToDevice, NoData,   true,  Fixed(2)),
    row(0, 3,     opcode::SETPINS,       ToDevice, Fixed(2), true,  NoData),
    row(0x101, 0, opcode::SETPINS,       ToDevice, Fixed(2), true,  NoData),

    /* 1 byte per pin, in the register format */
    row(0, 3,     opcode::GETPINCONFIG,  ToDevice, NoData,   true,  Fixed(8)),
    row(0x101, 0, opcode::GETPINCONFIG,  ToDevice, NoData,   true,  Fixed(8)),
    row(0, 3,     opcode::SETPINCONFIG,  ToDevice, Fixed(8), true,  NoData),
    row(0x101, 0, opcode::SETPINCONFIG,  ToDevice, Fixed(8), true,  NoData),
    row(0, 3,     opcode::GETCONFIG0,    ToDevice, NoData,   true,  Fixed(4)),
    row(0, 3,     opcode::SETCONFIG0,    ToDevice, Fixed(4), true,  NoData),
    row(0, 3,     opcode::GETCONFIG1,    ToDevice, NoData,   true,  Fixed(4)),
    row(0, 3,     opcode::SETCONFIG1,    ToDevice, Fixed(4), true,  NoData),

    /* supporting functions */
    row(0, 0,      opcode::GETBUFSIZE,   ToDevice, NoData,    true,  Fixed(1)),
    row(0, 0x1FF,  opcode::WRITEBLOCK,   ToDevice, Fixed(68), true,  NoData),
    row(0x200, 0,  opcode::WRITEBLOCK,   ToDevice, Fixed(68), true,  Fixed(2)),
    row(0x200, 0,  opcode::CHECKSUM,     ToDevice, Fixed(1),  true,  Fixed(2)),
    row(0, 0,      opcode::EXECUTE,      ToDevice, NoData,    false, NoData),
    row(2, 2,      opcode::PINBURST,     ToDevice, Fixed(64), true,  NoData),
    row(3, 0,      opcode::PINBURST,     ToDevice, Any,       true,  NoData),
    row(0, 0,      opcode::GETID,        ToDevice, NoData,    true,  Fixed(12)),
    row(0, 0x1FF,  opcode::SETID,        ToDevice, Any,       true,  NoData),
    row(0x200, 0,  opcode::SETID,        ToDevice, Any,       true,  Fixed(2)),
    row(0, 0,      opcode::IDSOFF,       ToDevice, NoData,    true,  NoData),
    row(0, 0,      opcode::IDSON,        ToDevice, NoData,    true,  NoData),
    row(0, 0,      opcode::IDSTATE,      ToDevice, NoData,    true,  Fixed(1)),
    row(0x306, 0,  opcode::REPEATER,     ToDevice, NoData,    true,  NoData),
    row(0, 0,      opcode::DEV_RESET,    ToDevice, NoData,    false, NoData),
    row(4, 0,      opcode::GETCHANNELS,  ToDevice, NoData,    true,  Fixed(1)),
    row(4, 0,      opcode::SETCHANNELS,  ToDevice, Fixed(1),  true,  NoData),
    row(0x101, 0,  opcode::GETCARRIER,   ToDevice, NoData,    true,  Fixed(4)),
    row(0x101, 0,  opcode::SETCARRIER,   ToDevice, Fixed(4),  true,  Fixed(4)),
    row(0, 0,      opcode::GETLOCATION,  ToDevice, NoData,    true,  Fixed(2)),

    /* packets initiated by the device */
    row(0, 0,     opcode::RECV,          FromDevice, NoData, false, Any),
    row(0, 0,     opcode::OVERSEND,      FromDevice, NoData, false, NoData),
    row(0, 0,     opcode::OVERRECV,      FromDevice, NoData, false, Any),

    /* invalid-argument reply, classified like an acknowledgement */
    row(0x101, 0, opcode::INVALID_ARG,   ToDevice, NoData, false, NoData),
];

/// Find the packet type for an opcode as spoken by a given firmware.
pub fn lookup(opcode: u8, version: u16) -> Option<&'static PacketSpec> {
    TABLE
        .iter()
        .find(|r| {
            r.spec.opcode == opcode && r.min <= version && (r.max >= version || r.max == 0)
        })
        .map(|r| &r.spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_basics() {
        let spec = lookup(opcode::GETVERSION, 1).unwrap();
        assert_eq!(spec.direction, Direction::ToDevice);
        assert!(spec.ack);
        assert_eq!(spec.response, Fixed(2));

        let spec = lookup(opcode::SEND, 0x102).unwrap();
        assert_eq!(spec.request, Any);
        assert_eq!(spec.response, NoData);
    }

    #[test]
    fn test_writeblock_response_split_by_version() {
        assert_eq!(lookup(opcode::WRITEBLOCK, 0x1FF).unwrap().response, NoData);
        assert_eq!(
            lookup(opcode::WRITEBLOCK, 0x200).unwrap().response,
            Fixed(2)
        );
    }

    #[test]
    fn test_version_gated_rows() {
        /* raw receive mode needs body firmware */
        assert!(lookup(opcode::RAWRECVON, 4).is_none());
        assert!(lookup(opcode::RAWRECVON, 0x101).is_some());

        /* pin config exists on both sides of the gap but not between */
        assert!(lookup(opcode::GETPINCONFIG, 3).is_some());
        assert!(lookup(opcode::GETPINCONFIG, 4).is_none());
        assert!(lookup(opcode::GETPINCONFIG, 0x101).is_some());

        /* legacy split config is old firmware only */
        assert!(lookup(opcode::GETCONFIG0, 2).is_some());
        assert!(lookup(opcode::GETCONFIG0, 0x101).is_none());
    }

    #[test]
    fn test_pinburst_changes_shape_at_v3() {
        assert_eq!(lookup(opcode::PINBURST, 2).unwrap().request, Fixed(64));
        assert_eq!(lookup(opcode::PINBURST, 3).unwrap().request, Any);
        assert!(lookup(opcode::PINBURST, 1).is_none());
    }

    #[test]
    fn test_no_ack_opcodes() {
        assert!(!lookup(opcode::EXECUTE, 1).unwrap().ack);
        assert!(!lookup(opcode::DEV_RESET, 0x305).unwrap().ack);
    }

    #[test]
    fn test_from_device_rows() {
        let spec = lookup(opcode::RECV, 1).unwrap();
        assert_eq!(spec.direction, Direction::FromDevice);
        assert_eq!(spec.response, Any);
    }

    #[test]
    fn test_unknown_opcode_is_absent() {
        assert!(lookup(0x7B, 0x305).is_none());
    }

    #[test]
    fn test_payload_len_matching() {
        assert!(NoData.matches(0));
        assert!(!NoData.matches(1));
        assert!(Any.matches(0));
        assert!(Any.matches(500));
        assert!(Fixed(4).matches(4));
        assert!(!Fixed(4).matches(3));
    }

    #[test]
    fn test_payload_len_remaining() {
        assert_eq!(Fixed(12).remaining(4), 8);
        assert_eq!(Fixed(12).remaining(12), 0);
        assert_eq!(Any.remaining(3), 0);
        assert_eq!(NoData.remaining(0), 0);
    }
}
