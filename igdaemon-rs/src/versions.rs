/* Opcode translation between protocol versions.
 *
 * The daemon speaks one current protocol; older clients and firmware
 * bodies up to version 4 speak the original numbering (protocol v0).
 * Each legacy protocol is a table of (current, legacy) opcode pairs;
 * translation walks the table in the requested direction.  Opcodes a
 * legacy protocol cannot express fail the exchange outright rather
 * than leaking an untranslated byte onto the wire. */

use crate::packet::{opcode, PROTOCOL_VERSION};

/* (current, v0) opcode pairs.  RESET never changes and, as the highest
 * opcode value, doubles as the table terminator in spirit; here the
 * slice length does that job. */
#[rustfmt::skip]
static CODE_MAP_V0: &[[u8; 2]] = &[
    [opcode::DEV_ERROR,   0x00],
    [opcode::GETVERSION,  0x01],
    [opcode::SEND,        0x02],
    [opcode::RECVON,      0x03],
    [opcode::RECVOFF,     0x04],
    [opcode::GETPINS,     0x05],
    [opcode::SETPINS,     0x06],
    [opcode::GETCONFIG0,  0x07],
    [opcode::SETCONFIG0,  0x08],
    [opcode::GETCONFIG1,  0x09],
    [opcode::SETCONFIG1,  0x0A],
    [opcode::GETBUFSIZE,  0x0B],
    [opcode::WRITEBLOCK,  0x0C],
    [opcode::EXECUTE,     0x0D],
    [opcode::PINBURST,    0x0E],
    [opcode::GETID,       0x0F],
    [opcode::RECV,        0x10],
    [opcode::SETCHANNELS, 0x11],
    [opcode::OVERRECV,    0x20],
    [opcode::OVERSEND,    0x30],
    [opcode::DEV_RESET,   0xFF],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslateDirection {
    /// From the current numbering to the peer's legacy numbering.
    ToWire,
    /// From the peer's legacy numbering to the current numbering.
    FromWire,
}

/// Translate an opcode to or from a legacy protocol version.
///
/// Returns `None` when the opcode has no equivalent in that protocol,
/// or when the peer claims a protocol newer than ours.  The version
/// exchange opcode always passes unchanged so that the handshake works
/// before any version is known.
pub fn translate(code: u8, protocol: u16, direction: TranslateDirection) -> Option<u8> {
    if protocol == PROTOCOL_VERSION || code == opcode::EXCH_VERSIONS {
        return Some(code);
    }
    if protocol > PROTOCOL_VERSION {
        return None;
    }

    let (from, to) = match direction {
        TranslateDirection::ToWire => (0, 1),
        TranslateDirection::FromWire => (1, 0),
    };
    CODE_MAP_V0
        .iter()
        .find(|pair| pair[from] == code)
        .map(|pair| pair[to])
}

/// The protocol a firmware version speaks: bodies up to version 4 use
/// the original opcode numbering, everything newer the current one.
pub fn device_protocol(firmware_version: u16) -> u16 {
    if firmware_version <= 4 {
        0
    } else {
        PROTOCOL_VERSION
    }
}

pub fn to_device(code: u8, firmware_version: u16) -> Option<u8> {
    translate(
        code,
        device_protocol(firmware_version),
        TranslateDirection::ToWire,
    )
}

pub fn from_device(code: u8, firmware_version: u16) -> Option<u8> {
    translate(
        code,
        device_protocol(firmware_version),
        TranslateDirection::FromWire,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_protocol_is_identity() {
        for code in 0u8..=0xFF {
            assert_eq!(
                translate(code, PROTOCOL_VERSION, TranslateDirection::ToWire),
                Some(code)
            );
        }
    }

    #[test]
    fn test_v0_translations() {
        assert_eq!(
            translate(opcode::SEND, 0, TranslateDirection::ToWire),
            Some(0x02)
        );
        assert_eq!(
            translate(opcode::RECVON, 0, TranslateDirection::ToWire),
            Some(0x03)
        );
        assert_eq!(
            translate(0x10, 0, TranslateDirection::FromWire),
            Some(opcode::RECV)
        );
        assert_eq!(
            translate(0x0F, 0, TranslateDirection::FromWire),
            Some(opcode::GETID)
        );
    }

    #[test]
    fn test_v0_round_trip_is_involutive() {
        for pair in super::CODE_MAP_V0 {
            let wire = translate(pair[0], 0, TranslateDirection::ToWire).unwrap();
            assert_eq!(
                translate(wire, 0, TranslateDirection::FromWire),
                Some(pair[0])
            );
        }
    }

    #[test]
    fn test_untranslatable_opcode_fails() {
        /* raw receive mode does not exist in protocol v0 */
        assert_eq!(translate(opcode::RAWRECVON, 0, TranslateDirection::ToWire), None);
        assert_eq!(translate(opcode::GETCARRIER, 0, TranslateDirection::ToWire), None);
    }

    #[test]
    fn test_future_protocol_rejected() {
        assert_eq!(
            translate(opcode::SEND, PROTOCOL_VERSION + 1, TranslateDirection::ToWire),
            None
        );
    }

    #[test]
    fn test_version_exchange_always_passes() {
        assert_eq!(
            translate(opcode::EXCH_VERSIONS, 0, TranslateDirection::ToWire),
            Some(opcode::EXCH_VERSIONS)
        );
        assert_eq!(
            translate(opcode::EXCH_VERSIONS, 7, TranslateDirection::FromWire),
            Some(opcode::EXCH_VERSIONS)
        );
    }

    #[test]
    fn test_device_protocol_threshold() {
        assert_eq!(device_protocol(0), 0);
        assert_eq!(device_protocol(4), 0);
        assert_eq!(device_protocol(5), PROTOCOL_VERSION);
        assert_eq!(device_protocol(0x102), PROTOCOL_VERSION);
    }

    #[test]
    fn test_old_device_wire_codes() {
        assert_eq!(to_device(opcode::SEND, 2), Some(0x02));
        assert_eq!(to_device(opcode::SEND, 0x102), Some(opcode::SEND));
        assert_eq!(from_device(0x10, 3), Some(opcode::RECV));
    }
}
