/* Data packets and the client wire framing.
 *
 * Every exchange between a client and the daemon, and (conceptually)
 * between the daemon and the device firmware, is a `Packet`: one opcode
 * byte plus an opaque payload.  On the client socket a packet travels
 * as an 8-byte little-endian frame header followed by the payload:
 *
 *   opcode:   u8
 *   _pad:     3 bytes, zero on send, ignored on receive
 *   data_len: i32   (negative = -errno, only when opcode == DEV_ERROR)
 *
 * Error responses carry no payload; the errno rides in the length
 * field, mirroring what firmware-level failures report. */

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/* Version of the client<->daemon protocol spoken by this daemon. */
pub const PROTOCOL_VERSION: u16 = 1;

/* Opcodes shared by the client protocol and the device protocol.
 *
 * The namespace is banded: 0x01..=0x0F bootloader functions,
 * 0x10..=0x2F body functions, 0x30..=0x3F device-initiated packets,
 * with the version exchange and the reset request pinned at the ends. */
pub mod opcode {
    /* used in response packets */
    pub const DEV_ERROR: u8 = 0x00;

    /* bootloader functions */
    pub const GETVERSION: u8 = 0x01;
    pub const WRITEBLOCK: u8 = 0x02;
    pub const CHECKSUM: u8 = 0x03;
    pub const INVALID_ARG: u8 = 0x04;

    /* standard "body" functions */
    pub const GETFEATURES: u8 = 0x10;
    pub const GETBUFSIZE: u8 = 0x11;
    pub const RECVON: u8 = 0x12;
    pub const RAWRECVON: u8 = 0x13;
    pub const RECVOFF: u8 = 0x14;
    pub const SEND: u8 = 0x15;
    pub const GETCHANNELS: u8 = 0x16;
    pub const SETCHANNELS: u8 = 0x17;
    pub const GETPINCONFIG: u8 = 0x18;
    pub const SETPINCONFIG: u8 = 0x19;
    pub const GETPINS: u8 = 0x1A;
    pub const SETPINS: u8 = 0x1B;
    pub const PINBURST: u8 = 0x1C;
    pub const EXECUTE: u8 = 0x1D;
    pub const GETID: u8 = 0x1E;
    pub const SETID: u8 = 0x1F;
    pub const IDSOFF: u8 = 0x20;
    pub const IDSON: u8 = 0x21;
    pub const IDSTATE: u8 = 0x22;
    pub const GETLOCATION: u8 = 0x23;
    pub const GETCARRIER: u8 = 0x26;
    pub const SETCARRIER: u8 = 0x27;
    pub const RESEND: u8 = 0x28;
    pub const SENDSIZE: u8 = 0x29;
    pub const REPEATER: u8 = 0x2A;

    /* packets initiated by the device */
    pub const RECV: u8 = 0x30;
    pub const OVERRECV: u8 = 0x31;
    pub const OVERSEND: u8 = 0x32;

    /* legacy pin configuration, present on old firmware and in
     * protocol v0 only */
    pub const GETCONFIG0: u8 = 0x07;
    pub const SETCONFIG0: u8 = 0x08;
    pub const GETCONFIG1: u8 = 0x09;
    pub const SETCONFIG1: u8 = 0x0A;

    /* must be the first packet sent by a client */
    pub const EXCH_VERSIONS: u8 = 0xFE;
    pub const DEV_RESET: u8 = 0xFF;
}

/* Cap on a single client payload.  Pulse codes are a few KB at most;
 * anything near this limit is a confused or hostile client. */
pub const MAX_PAYLOAD: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    #[error("peer closed the connection")]
    Eof,

    #[error("negative payload length {0} in a request frame")]
    NegativeLength(i32),

    #[error("payload length {0} exceeds the {MAX_PAYLOAD} byte limit")]
    Oversized(usize),
}

/* One request or response: an opcode plus its payload.
 *
 * `errno` is nonzero only on synthesized error responses; it is written
 * into the frame's length field and never carries payload bytes. */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub opcode: u8,
    pub payload: Vec<u8>,
    pub errno: i32,
}

impl Packet {
    pub fn new(opcode: u8) -> Self {
        Self {
            opcode,
            payload: Vec::new(),
            errno: 0,
        }
    }

    pub fn with_payload(opcode: u8, payload: Vec<u8>) -> Self {
        Self {
            opcode,
            payload,
            errno: 0,
        }
    }

    /* Build the error response for a failed request. */
    pub fn error(errno: i32) -> Self {
        Self {
            opcode: opcode::DEV_ERROR,
            payload: Vec::new(),
            errno,
        }
    }

    pub fn is_error(&self) -> bool {
        self.opcode == opcode::DEV_ERROR && self.errno != 0
    }

    /* Read one framed packet from a client socket. */
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, FrameError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; 8];
        match reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(FrameError::Eof),
            Err(e) => return Err(e.into()),
        }

        let opcode = header[0];
        let data_len = i32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if data_len < 0 {
            /* clients never send errors; only the daemon does */
            return Err(FrameError::NegativeLength(data_len));
        }

        let len = data_len as usize;
        if len > MAX_PAYLOAD {
            return Err(FrameError::Oversized(len));
        }

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await.map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                FrameError::Eof
            } else {
                FrameError::Io(e)
            }
        })?;

        Ok(Self {
            opcode,
            payload,
            errno: 0,
        })
    }

    /* Write this packet as one frame.  Error packets put `-errno` in
     * the length field and send no payload bytes. */
    pub async fn write_to<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let data_len: i32 = if self.errno != 0 {
            -self.errno
        } else {
            self.payload.len() as i32
        };

        let mut frame = Vec::with_capacity(8 + self.payload.len());
        frame.push(self.opcode);
        frame.extend_from_slice(&[0, 0, 0]);
        frame.extend_from_slice(&data_len.to_le_bytes());
        if self.errno == 0 {
            frame.extend_from_slice(&self.payload);
        }

        writer.write_all(&frame).await?;
        writer.flush().await
    }
}
