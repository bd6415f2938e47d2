//! Tunnel frame codec.
//!
//! Every frame is a command plus a channel id, an opaque header block and a
//! body. Encoding (big-endian):
//!
//! ```text
//! magic:      [u8; 2] = "TN"
//! version:    u8      = 1
//! command:    u8
//! channel:    u32
//! header_len: u16
//! body_len:   u32
//! header block (header_len bytes)
//! body (body_len bytes)
//! ```
//!
//! `REQUEST` carries the request target in the header block. `RESPONSE`
//! chunks use a single `0x01` header byte on every chunk that has more
//! data following; the final chunk of a response has an empty header
//! block. Heartbeat frames (`PING`/`PONG`) use channel 0 and no payload.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::TunnelError;

const FRAME_MAGIC: [u8; 2] = *b"TN";
const FRAME_VERSION: u8 = 1;

/// Largest accepted body. Bounds memory per frame on both sides.
pub const MAX_BODY: usize = 4 * 1024 * 1024;

/// Largest accepted header block.
pub const MAX_HEADER: usize = 16 * 1024;

/// Header byte marking a non-final response chunk.
pub const HEADER_MORE: &[u8] = &[0x01];

/// Frame commands. `Connect` doubles as the broker hello.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Connect = 1,
    Request = 2,
    Reset = 3,
    Close = 4,
    Response = 5,
    Ping = 6,
    Pong = 7,
}

impl Command {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Connect),
            2 => Some(Self::Request),
            3 => Some(Self::Reset),
            4 => Some(Self::Close),
            5 => Some(Self::Response),
            6 => Some(Self::Ping),
            7 => Some(Self::Pong),
            _ => None,
        }
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub channel: u32,
    pub headers: Bytes,
    pub body: Bytes,
}

impl Frame {
    pub fn new(command: Command, channel: u32) -> Self {
        Self {
            command,
            channel,
            headers: Bytes::new(),
            body: Bytes::new(),
        }
    }

    pub fn request(channel: u32, target: &str) -> Self {
        Self {
            command: Command::Request,
            channel,
            headers: Bytes::copy_from_slice(target.as_bytes()),
            body: Bytes::new(),
        }
    }

    /// A response chunk; `more` marks chunks with data following.
    pub fn response(channel: u32, chunk: Bytes, more: bool) -> Self {
        Self {
            command: Command::Response,
            channel,
            headers: if more {
                Bytes::from_static(HEADER_MORE)
            } else {
                Bytes::new()
            },
            body: chunk,
        }
    }

    pub fn ping() -> Self {
        Self::new(Command::Ping, 0)
    }

    pub fn pong() -> Self {
        Self::new(Command::Pong, 0)
    }

    /// True for response chunks announcing further chunks.
    pub fn has_more(&self) -> bool {
        self.headers.as_ref() == HEADER_MORE
    }

    /// Encodes the frame into a single contiguous buffer.
    pub fn encode(&self) -> Result<Bytes, TunnelError> {
        if self.body.len() > MAX_BODY {
            return Err(TunnelError::FrameTooLarge {
                size: self.body.len(),
                limit: MAX_BODY,
            });
        }
        if self.headers.len() > MAX_HEADER {
            return Err(TunnelError::FrameTooLarge {
                size: self.headers.len(),
                limit: MAX_HEADER,
            });
        }

        let mut buf = BytesMut::with_capacity(14 + self.headers.len() + self.body.len());
        buf.put_slice(&FRAME_MAGIC);
        buf.put_u8(FRAME_VERSION);
        buf.put_u8(self.command as u8);
        buf.put_u32(self.channel);
        buf.put_u16(self.headers.len() as u16);
        buf.put_u32(self.body.len() as u32);
        buf.put_slice(&self.headers);
        buf.put_slice(&self.body);
        Ok(buf.freeze())
    }
}

/// Reads one frame off the wire. Truncated input surfaces as an IO error;
/// structurally invalid input as a decode error.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, TunnelError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 14];
    reader.read_exact(&mut header).await?;

    if header[0..2] != FRAME_MAGIC {
        return Err(TunnelError::FrameDecode("bad magic".to_string()));
    }
    if header[2] != FRAME_VERSION {
        return Err(TunnelError::FrameDecode(format!(
            "unsupported version {}",
            header[2]
        )));
    }
    let command = Command::from_u8(header[3])
        .ok_or_else(|| TunnelError::FrameDecode(format!("unknown command {}", header[3])))?;
    let channel = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    let header_len = u16::from_be_bytes([header[8], header[9]]) as usize;
    let body_len = u32::from_be_bytes([header[10], header[11], header[12], header[13]]) as usize;

    if header_len > MAX_HEADER {
        return Err(TunnelError::FrameTooLarge {
            size: header_len,
            limit: MAX_HEADER,
        });
    }
    if body_len > MAX_BODY {
        return Err(TunnelError::FrameTooLarge {
            size: body_len,
            limit: MAX_BODY,
        });
    }

    let mut headers = vec![0u8; header_len];
    reader.read_exact(&mut headers).await?;
    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await?;

    Ok(Frame {
        command,
        channel,
        headers: headers.into(),
        body: body.into(),
    })
}
