//! Length-prefixed frames shared by client and server
//!
//! All integers are big-endian `u32`:
//!
//! ```text
//! request:  [ID:4][LEN:4][BODY:LEN]
//! response: [ID:4][STATUS:4][LEN:4][BODY:LEN]
//! ```
//!
//! Status codes: `OK = 0`, `CONNECTION_ESTABLISHED = 1`, `BAD_REQUEST = 2`,
//! `DISCONNECTED = 3`. `LEN == 0` means the frame carries no message.

use crate::common::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest body accepted on either side
pub const MAX_FRAME_BODY: usize = 16 * 1024 * 1024;

const REQUEST_HEADER_LEN: usize = 8;
const RESPONSE_HEADER_LEN: usize = 12;

/// Transport-level status of a response frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Ok,
    ConnectionEstablished,
    BadRequest,
    Disconnected,
}

impl FrameStatus {
    pub fn code(self) -> u32 {
        match self {
            FrameStatus::Ok => 0,
            FrameStatus::ConnectionEstablished => 1,
            FrameStatus::BadRequest => 2,
            FrameStatus::Disconnected => 3,
        }
    }

    pub fn from_code(code: u32) -> Result<Self> {
        match code {
            0 => Ok(FrameStatus::Ok),
            1 => Ok(FrameStatus::ConnectionEstablished),
            2 => Ok(FrameStatus::BadRequest),
            3 => Ok(FrameStatus::Disconnected),
            other => Err(Error::Protocol(format!("unknown status code {}", other))),
        }
    }
}

fn check_body_len(len: usize) -> Result<()> {
    if len > MAX_FRAME_BODY {
        return Err(Error::Protocol(format!(
            "frame body of {} bytes exceeds {}",
            len, MAX_FRAME_BODY
        )));
    }
    Ok(())
}

/// Reads a fixed header, treating EOF before it completes as a closed peer.
async fn read_header<R: AsyncRead + Unpin>(reader: &mut R, header: &mut [u8]) -> Result<bool> {
    match reader.read_exact(header).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}

async fn read_body<R: AsyncRead + Unpin>(reader: &mut R, len: usize) -> Result<Bytes> {
    check_body_len(len)?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Bytes::from(body))
}

/// Client → server frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub id: u32,
    pub body: Bytes,
}

impl RequestFrame {
    pub fn new(id: u32, body: impl Into<Bytes>) -> Self {
        Self {
            id,
            body: body.into(),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(REQUEST_HEADER_LEN + self.body.len());
        buf.put_u32(self.id);
        buf.put_u32(self.body.len() as u32);
        buf.put_slice(&self.body);
    }

    /// Decode one frame from the front of `buf`; `None` until it is complete.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>> {
        if buf.len() < REQUEST_HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
        check_body_len(len)?;
        if buf.len() < REQUEST_HEADER_LEN + len {
            return Ok(None);
        }
        let id = buf.get_u32();
        buf.advance(4);
        let body = buf.split_to(len).freeze();
        Ok(Some(Self { id, body }))
    }

    /// Read the next frame; `None` when the peer closed between frames.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Self>> {
        let mut header = [0u8; REQUEST_HEADER_LEN];
        if !read_header(reader, &mut header).await? {
            return Ok(None);
        }
        let id = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let body = read_body(reader, len).await?;
        Ok(Some(Self { id, body }))
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Server → client frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub id: u32,
    pub status: FrameStatus,
    pub body: Bytes,
}

impl ResponseFrame {
    pub fn new(id: u32, status: FrameStatus, body: impl Into<Bytes>) -> Self {
        Self {
            id,
            status,
            body: body.into(),
        }
    }

    /// Frame without a message.
    pub fn empty(id: u32, status: FrameStatus) -> Self {
        Self::new(id, status, Bytes::new())
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(RESPONSE_HEADER_LEN + self.body.len());
        buf.put_u32(self.id);
        buf.put_u32(self.status.code());
        buf.put_u32(self.body.len() as u32);
        buf.put_slice(&self.body);
    }

    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>> {
        if buf.len() < RESPONSE_HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
        check_body_len(len)?;
        if buf.len() < RESPONSE_HEADER_LEN + len {
            return Ok(None);
        }
        let id = buf.get_u32();
        let status = FrameStatus::from_code(buf.get_u32())?;
        buf.advance(4);
        let body = buf.split_to(len).freeze();
        Ok(Some(Self { id, status, body }))
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Self>> {
        let mut header = [0u8; RESPONSE_HEADER_LEN];
        if !read_header(reader, &mut header).await? {
            return Ok(None);
        }
        let id = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let status =
            FrameStatus::from_code(u32::from_be_bytes([header[4], header[5], header[6], header[7]]))?;
        let len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
        let body = read_body(reader, len).await?;
        Ok(Some(Self { id, status, body }))
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }
}
