/* Pulse/space codec for the transceiver firmware.
 *
 * IR codes cross the client boundary as arrays of u32: bit 24 set for a
 * pulse, clear for a space, bits 0..23 the duration in microseconds.
 * The firmware speaks a compact byte encoding instead: bit 7 set for a
 * space, bits 0..6 a duration unit, with 0 meaning the 1024-unit
 * maximum.  A long pulse or space becomes a run of same-state bytes.
 *
 * Receive timing is fixed by the firmware's sampling loop; the
 * `(units << 6) / 3` conversion below is the fixed-point form of its
 * unit-to-microsecond ratio.  Transmit timing is expressed in carrier
 * cycles, so the encoder needs the currently configured carrier. */

use tracing::warn;

/// Bit flagging a u32 code entry as a pulse rather than a space.
pub const PULSE_BIT: u32 = 0x0100_0000;
/// Mask of the duration bits of a u32 code entry.
pub const PULSE_MASK: u32 = 0x00FF_FFFF;

/* firmware byte layout */
const STATE_MASK: u8 = 0x80;
const LENGTH_MASK: u8 = 0x7F;

/// Highest value of a data byte's length field when written explicitly.
const MAX_DATA_BYTE: u32 = 127;

/// Lowest supported carrier frequency in Hz.
pub const CARRIER_MIN: u32 = 25_000;
/// Highest supported carrier frequency in Hz.
pub const CARRIER_MAX: u32 = 150_000;

/// Per-iteration overhead, in clock cycles, of the firmware's transmit
/// loop.  Body firmware starting at version 4 reports its own count
/// through GETFEATURES; everything older uses this constant.
pub const DEFAULT_LOOP_CYCLES: u8 = 5 + 5 + 7 + 6 + 6 + 7 + (5 + 7) + (5 + 7) + 5;

fn finish_entry(units: u32, in_space: bool) -> u32 {
    let micros = (units << 6) / 3;
    if in_space { micros } else { micros | PULSE_BIT }
}

/// Decode a firmware byte stream into a pulse/space array.
///
/// Runs of bytes with the same state bit accumulate until the state
/// flips or the running total would overflow the duration mask; each
/// completed run becomes one u32 entry.
pub fn decode(code: &[u8]) -> Vec<u32> {
    let mut out = Vec::with_capacity(code.len());
    let mut units: u32 = 0;
    let mut in_space = false;
    let mut started = false;

    for &byte in code {
        let is_space = byte & STATE_MASK != 0;
        let length = (byte & LENGTH_MASK) as u32;

        if started && (is_space != in_space || units + length > PULSE_MASK) {
            out.push(finish_entry(units, in_space));
            units = 0;
        }

        /* a zero length field encodes the 1024-unit maximum */
        units += if length == 0 { 1024 } else { length + 1 };
        in_space = is_space;
        started = true;
    }

    if started {
        out.push(finish_entry(units, in_space));
    }
    out
}

/// Encode a pulse/space array into the firmware byte stream for
/// transmission at the given carrier frequency.
///
/// Each entry becomes `round(duration_us * carrier / 1e6)` carrier
/// cycles, emitted as full-length bytes plus one remainder byte.
/// Zero-cycle entries produce no bytes but still flip the state.
pub fn encode(pulses: &[u32], carrier_hz: u32) -> Vec<u8> {
    let mut out = Vec::new();
    let mut in_space = false;

    for &entry in pulses {
        let micros = (entry & PULSE_MASK) as u64;
        let mut cycles = ((micros * carrier_hz as u64 + 500_000) / 1_000_000) as u32;

        let mut full_bytes = cycles / MAX_DATA_BYTE + 1;
        cycles %= MAX_DATA_BYTE;
        if cycles == 0 {
            /* the length field cannot hold 0; fold the remainder into
             * one fewer full-length byte */
            cycles = MAX_DATA_BYTE;
            full_bytes -= 1;
        }

        if full_bytes > 0 {
            let state = if in_space { STATE_MASK } else { 0 };
            for _ in 0..full_bytes - 1 {
                out.push(LENGTH_MASK | state);
            }
            out.push(cycles as u8 | state);
        }

        in_space = !in_space;
    }

    out
}

/// Clamp a requested carrier frequency into the supported band.
pub fn clamp_carrier(carrier_hz: u32) -> u32 {
    if carrier_hz > CARRIER_MAX {
        warn!("carrier {} Hz above {} Hz, clamping", carrier_hz, CARRIER_MAX);
        CARRIER_MAX
    } else if carrier_hz < CARRIER_MIN {
        warn!("carrier {} Hz below {} Hz, clamping", carrier_hz, CARRIER_MIN);
        CARRIER_MIN
    } else {
        carrier_hz
    }
}

/// Compute the two transmit-loop jump offsets for a carrier frequency.
///
/// The firmware clock runs at 24 MHz and each carrier period has two
/// transitions, so one half-period is `24e6 / (carrier * 2)` cycles.
/// After subtracting the loop overhead, the remainder is decomposed
/// into `a` delays of 7 cycles and `b` delays of 4 cycles; the returned
/// pair is the byte offsets into the firmware's delay ladders,
/// `(4 - a) * 2` and `110 - b`.
pub fn carrier_delays(carrier_hz: u32, loop_cycles: u8) -> [u8; 2] {
    let carrier = clamp_carrier(carrier_hz);

    let half_period = (24_000_000 + carrier) / (carrier * 2);
    let cycles = half_period.saturating_sub(loop_cycles as u32);

    /* at most 3 sevens are ever needed to make the rest divisible by 4 */
    let sevens = (4 - cycles % 4) % 4;
    let fours = (cycles - sevens * 7) / 4;

    [((4 - sevens) * 2) as u8, (110 - fours) as u8]
}
