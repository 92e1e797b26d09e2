//! Replay frame codec.
//!
//! Wire layout of one frame:
//!
//! ```text
//! +----------------+--------+-----------------+-----------------+
//! | timestamp (4)  | type(1)| payload len (4) | payload (len)   |
//! +----------------+--------+-----------------+-----------------+
//! ```
//!
//! All integers are big-endian. The timestamp is milliseconds since the start
//! of the recorded session. The session id is not part of the wire format; it
//! keys the stream the frames are written to.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};

/// Size of the fixed frame header.
pub const FRAME_HEADER_LEN: usize = 4 + 1 + 4;

/// Upper bound on a single decoded payload.
pub const MAX_PAYLOAD_LEN: u32 = 16 * 1024 * 1024;

/// Type tag of a replay frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Stdout,
    Stderr,
    WindowSize,
}

impl FrameKind {
    pub fn as_u8(self) -> u8 {
        match self {
            FrameKind::Stdout => 1,
            FrameKind::Stderr => 2,
            FrameKind::WindowSize => 3,
        }
    }

    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(FrameKind::Stdout),
            2 => Some(FrameKind::Stderr),
            3 => Some(FrameKind::WindowSize),
            _ => None,
        }
    }
}

/// One timestamped record of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayFrame {
    pub session_id: i64,
    pub timestamp: u32,
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl ReplayFrame {
    pub fn new(session_id: i64, timestamp: u32, kind: FrameKind, payload: Vec<u8>) -> Self {
        Self {
            session_id,
            timestamp,
            kind,
            payload,
        }
    }

    /// Build a `window-size` frame.
    pub fn window_size(session_id: i64, timestamp: u32, width: u32, height: u32) -> Self {
        Self::new(
            session_id,
            timestamp,
            FrameKind::WindowSize,
            encode_window_size(width, height).to_vec(),
        )
    }

    /// Append the wire encoding of this frame to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.reserve(FRAME_HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.push(self.kind.as_u8());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        self.encode_into(&mut buf);
        buf
    }
}

/// Split a frame header into timestamp, kind and payload length.
fn decode_header(header: &[u8; FRAME_HEADER_LEN]) -> io::Result<(u32, FrameKind, u32)> {
    let timestamp = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let kind = parse_kind(header[4])?;
    let len = u32::from_be_bytes([header[5], header[6], header[7], header[8]]);
    check_len(len)?;
    Ok((timestamp, kind, len))
}

fn parse_kind(tag: u8) -> io::Result<FrameKind> {
    FrameKind::from_u8(tag).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown replay frame type {tag}"),
        )
    })
}

fn check_len(len: u32) -> io::Result<()> {
    if len > MAX_PAYLOAD_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("replay frame payload too large: {len} bytes"),
        ));
    }
    Ok(())
}

/// Payload of a `window-size` frame: width then height, both big-endian u32.
pub fn encode_window_size(width: u32, height: u32) -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf[..4].copy_from_slice(&width.to_be_bytes());
    buf[4..].copy_from_slice(&height.to_be_bytes());
    buf
}

pub fn decode_window_size(payload: &[u8]) -> Option<(u32, u32)> {
    if payload.len() != 8 {
        return None;
    }
    let width = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let height = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
    Some((width, height))
}

/// Write one frame to an async writer.
pub async fn write_frame<W>(writer: &mut W, frame: &ReplayFrame) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame.encode()).await
}

/// Read one frame from an async reader.
///
/// Returns `Ok(None)` on a clean end of stream (no bytes of a new frame
/// read). A stream that ends in the middle of a frame is an error.
pub async fn read_frame<R>(reader: &mut R, session_id: i64) -> io::Result<Option<ReplayFrame>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    let mut filled = 0;
    while filled < FRAME_HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "replay stream ended inside a frame header",
            ));
        }
        filled += n;
    }

    let (timestamp, kind, len) = decode_header(&header)?;

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;

    Ok(Some(ReplayFrame::new(session_id, timestamp, kind, payload)))
}

/// Play a recorded stream back, sleeping between frames to reproduce the
/// original timing. Returns the number of frames played.
pub async fn play<R, O, E>(
    reader: &mut R,
    session_id: i64,
    stdout: &mut O,
    stderr: &mut E,
) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    let mut last = 0u32;
    let mut played = 0;
    while let Some(frame) = read_frame(reader, session_id).await? {
        let gap = frame.timestamp.saturating_sub(last);
        if gap > 0 {
            tokio::time::sleep(Duration::from_millis(u64::from(gap))).await;
        }
        last = last.max(frame.timestamp);

        match frame.kind {
            FrameKind::Stdout => {
                stdout.write_all(&frame.payload).await?;
                stdout.flush().await?;
            }
            FrameKind::Stderr => {
                stderr.write_all(&frame.payload).await?;
                stderr.flush().await?;
            }
            FrameKind::WindowSize => match decode_window_size(&frame.payload) {
                Some((width, height)) => {
                    info!(at_ms = frame.timestamp, width, height, "Window resized")
                }
                None => warn!(at_ms = frame.timestamp, "Malformed window-size frame"),
            },
        }
        played += 1;
    }
    Ok(played)
}
