/* Socket client for igdaemon.
 *
 * Speaks the daemon's framed packet protocol over the per-device Unix
 * sockets and the daemon-level ctl socket: an 8-byte little-endian
 * header (opcode, three pad bytes, payload length) followed by the
 * payload.  Error responses carry a negative errno in the length
 * field. */

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

/// Protocol version this tool speaks.
pub const PROTOCOL_VERSION: u16 = 1;

/// Default socket directory used by the daemon.
pub const DEFAULT_SOCKET_ROOT: &str = "/var/run/iguanaIR";

/* request opcodes */
pub const DEV_GETVERSION: u8 = 0x01;
pub const DEV_GETFEATURES: u8 = 0x10;
pub const DEV_GETBUFSIZE: u8 = 0x11;
pub const DEV_RECVON: u8 = 0x12;
pub const DEV_RAWRECVON: u8 = 0x13;
pub const DEV_RECVOFF: u8 = 0x14;
pub const DEV_SEND: u8 = 0x15;
pub const DEV_GETCHANNELS: u8 = 0x16;
pub const DEV_SETCHANNELS: u8 = 0x17;
pub const DEV_GETPINCONFIG: u8 = 0x18;
pub const DEV_SETPINCONFIG: u8 = 0x19;
pub const DEV_GETPINS: u8 = 0x1A;
pub const DEV_SETPINS: u8 = 0x1B;
pub const DEV_EXECUTE: u8 = 0x1D;
pub const DEV_GETID: u8 = 0x1E;
pub const DEV_SETID: u8 = 0x1F;
pub const DEV_GETLOCATION: u8 = 0x23;
pub const DEV_GETCARRIER: u8 = 0x26;
pub const DEV_SETCARRIER: u8 = 0x27;
pub const DEV_REPEATER: u8 = 0x2A;
pub const DEV_RECV: u8 = 0x30;
pub const DEV_RESET: u8 = 0xFF;
pub const EXCH_VERSIONS: u8 = 0xFE;

/* ctl socket requests */
pub const CTL_LIST_DEVICES: u8 = 0x01;
pub const CTL_SUBSCRIBE: u8 = 0x02;
pub const CTL_EVENT: u8 = 0x03;

/* pulse array bit layout */
pub const PULSE_BIT: u32 = 0x0100_0000;
pub const PULSE_MASK: u32 = 0x00FF_FFFF;

/// One framed message to or from the daemon.
#[derive(Debug, Clone)]
pub struct Frame {
    pub opcode: u8,
    pub payload: Vec<u8>,
}

pub struct DaemonClient {
    stream: UnixStream,
}

impl DaemonClient {
    /// Connect to a socket under the root and run the version
    /// exchange.  Names containing '/' are used as full paths.
    pub async fn connect(root: &Path, name: &str) -> Result<Self> {
        let path = if name.contains('/') {
            PathBuf::from(name)
        } else {
            root.join(name)
        };

        let stream = UnixStream::connect(&path)
            .await
            .with_context(|| format!("connecting to {}", path.display()))?;
        let mut client = Self { stream };

        client
            .write_frame(EXCH_VERSIONS, &PROTOCOL_VERSION.to_le_bytes())
            .await?;
        let reply = client.read_frame().await?;
        if reply.opcode != EXCH_VERSIONS || reply.payload.len() != 2 {
            bail!("daemon rejected the version exchange");
        }
        let daemon_version = u16::from_le_bytes([reply.payload[0], reply.payload[1]]);
        if daemon_version < PROTOCOL_VERSION {
            bail!("daemon speaks older protocol {daemon_version}");
        }

        Ok(client)
    }

    pub async fn write_frame(&mut self, opcode: u8, payload: &[u8]) -> Result<()> {
        let mut frame = Vec::with_capacity(8 + payload.len());
        frame.push(opcode);
        frame.extend_from_slice(&[0, 0, 0]);
        frame.extend_from_slice(&(payload.len() as i32).to_le_bytes());
        frame.extend_from_slice(payload);
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    pub async fn read_frame(&mut self) -> Result<Frame> {
        let mut header = [0u8; 8];
        self.stream
            .read_exact(&mut header)
            .await
            .context("daemon closed the connection")?;

        let opcode = header[0];
        let data_len = i32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if data_len < 0 {
            let errno = -data_len;
            bail!(
                "daemon reported error: {} (errno {errno})",
                std::io::Error::from_raw_os_error(errno)
            );
        }

        let mut payload = vec![0u8; data_len as usize];
        self.stream.read_exact(&mut payload).await?;
        Ok(Frame { opcode, payload })
    }

    /// Send one request and wait for its response.
    pub async fn request(&mut self, opcode: u8, payload: &[u8]) -> Result<Frame> {
        self.write_frame(opcode, payload).await?;
        self.read_frame().await
    }
}

/// Parse a pulse file: one `pulse <usec>` or `space <usec>` per line,
/// '#' starting a comment.  Returns the packed u32 array.
pub fn parse_pulse_file(text: &str) -> Result<Vec<u32>> {
    let mut pulses = Vec::new();

    for (number, line) in text.lines().enumerate() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }

        let mut parts = line.split_whitespace();
        let kind = parts.next().unwrap_or("");
        let length: u32 = parts
            .next()
            .and_then(|v| v.parse().ok())
            .with_context(|| format!("line {}: missing or bad duration", number + 1))?;
        if length > PULSE_MASK {
            bail!("line {}: duration {} too long", number + 1, length);
        }

        match kind {
            "pulse" => pulses.push(length | PULSE_BIT),
            "space" => pulses.push(length),
            other => bail!("line {}: expected pulse or space, got {other:?}", number + 1),
        }
    }

    if pulses.is_empty() {
        bail!("no pulses found in file");
    }
    Ok(pulses)
}

/// Render a received pulse array the way pulse files are written, so
/// captures can be replayed directly.
pub fn format_pulses(payload: &[u8]) -> String {
    let mut out = String::new();
    for chunk in payload.chunks_exact(4) {
        let value = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        let kind = if value & PULSE_BIT != 0 { "pulse" } else { "space" };
        out.push_str(&format!("{kind} {}\n", value & PULSE_MASK));
    }
    out
}

/// Pack a pulse array for the wire.
pub fn pulses_to_bytes(pulses: &[u32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(pulses.len() * 4);
    for &p in pulses {
        bytes.extend_from_slice(&p.to_le_bytes());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pulse_file() {
        let text = "# NEC power\npulse 9000\nspace 4500\npulse 560\n";
        let pulses = parse_pulse_file(text).unwrap();
        assert_eq!(
            pulses,
            vec![9000 | PULSE_BIT, 4500, 560 | PULSE_BIT]
        );
    }

    #[test]
    fn test_parse_pulse_file_rejects_garbage() {
        assert!(parse_pulse_file("wiggle 100\n").is_err());
        assert!(parse_pulse_file("pulse\n").is_err());
        assert!(parse_pulse_file("").is_err());
        assert!(parse_pulse_file("pulse 99999999\n").is_err());
    }

    #[test]
    fn test_format_pulses_round_trips() {
        let pulses = vec![9000 | PULSE_BIT, 4500, 560 | PULSE_BIT];
        let text = format_pulses(&pulses_to_bytes(&pulses));
        assert_eq!(parse_pulse_file(&text).unwrap(), pulses);
    }
}
