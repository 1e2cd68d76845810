//! Frame Streams framing.
//!
//! Data frame:    `len: u32 BE` (non-zero), `payload[len]`
//! Control frame: `0u32`, `len: u32 BE`, `type: u32 BE`, fields...
//! Control field: `type: u32 BE`, `len: u32 BE`, `value[len]`

use crate::error::IngestError;
use bytes::{Buf, BufMut, BytesMut};
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

pub const CONTENT_TYPE_DNSTAP: &[u8] = b"protobuf:dnstap.Dnstap";

pub const MAX_CONTROL_FRAME_SIZE: usize = 512;

const FIELD_CONTENT_TYPE: u32 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlType {
    Accept,
    Start,
    Stop,
    Ready,
    Finish,
}

impl ControlType {
    fn code(self) -> u32 {
        match self {
            ControlType::Accept => 0x01,
            ControlType::Start => 0x02,
            ControlType::Stop => 0x03,
            ControlType::Ready => 0x04,
            ControlType::Finish => 0x05,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        match code {
            0x01 => Some(ControlType::Accept),
            0x02 => Some(ControlType::Start),
            0x03 => Some(ControlType::Stop),
            0x04 => Some(ControlType::Ready),
            0x05 => Some(ControlType::Finish),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFrame {
    pub kind: ControlType,
    pub content_types: Vec<Vec<u8>>,
}

impl ControlFrame {
    pub fn new(kind: ControlType) -> Self {
        Self {
            kind,
            content_types: Vec::new(),
        }
    }

    pub fn with_content_type(mut self, content_type: &[u8]) -> Self {
        self.content_types.push(content_type.to_vec());
        self
    }

    pub fn offers(&self, content_type: &[u8]) -> bool {
        self.content_types.iter().any(|ct| ct == content_type)
    }

    /// Decodes a control frame body (everything after the control length).
    pub fn decode(mut body: &[u8]) -> Result<Self, IngestError> {
        if body.len() < 4 {
            return Err(IngestError::framing("control frame shorter than its type"));
        }
        let code = body.get_u32();
        let kind = ControlType::from_code(code)
            .ok_or_else(|| IngestError::framing(format!("unknown control type {:#x}", code)))?;

        let mut frame = Self::new(kind);
        while !body.is_empty() {
            if body.len() < 8 {
                return Err(IngestError::framing("truncated control field header"));
            }
            let field = body.get_u32();
            let len = body.get_u32() as usize;
            if body.len() < len {
                return Err(IngestError::framing("truncated control field"));
            }
            if field == FIELD_CONTENT_TYPE {
                frame.content_types.push(body[..len].to_vec());
            }
            body.advance(len);
        }
        Ok(frame)
    }

    /// Encodes the complete frame, escape sequence included.
    pub fn encode(&self) -> Vec<u8> {
        let body_len = 4 + self
            .content_types
            .iter()
            .map(|ct| 8 + ct.len())
            .sum::<usize>();

        let mut buf = Vec::with_capacity(8 + body_len);
        buf.put_u32(0);
        buf.put_u32(body_len as u32);
        buf.put_u32(self.kind.code());
        for ct in &self.content_types {
            buf.put_u32(FIELD_CONTENT_TYPE);
            buf.put_u32(ct.len() as u32);
            buf.put_slice(ct);
        }
        buf
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    Data(BytesMut),
    Control(ControlFrame),
}

/// A Frame Streams connection. Works for either end: the ingestor reads
/// data frames and answers control frames, tests use it to play producer.
pub struct FrameStream<S> {
    inner: BufReader<S>,
    max_frame_size: usize,
}

impl<S> FrameStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, max_frame_size: usize) -> Self {
        Self {
            inner: BufReader::new(stream),
            max_frame_size,
        }
    }

    /// Reads the next frame. `Ok(None)` means the peer closed the connection
    /// cleanly on a frame boundary.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, IngestError> {
        let Some(len) = self.read_len().await? else {
            return Ok(None);
        };

        if len != 0 {
            let len = len as usize;
            if len > self.max_frame_size {
                return Err(IngestError::FrameTooLarge {
                    size: len,
                    limit: self.max_frame_size,
                });
            }
            let mut payload = BytesMut::zeroed(len);
            self.read_body(&mut payload).await?;
            return Ok(Some(Frame::Data(payload)));
        }

        let len = self
            .read_len()
            .await?
            .ok_or_else(|| IngestError::framing("connection closed inside control frame"))?
            as usize;
        if len > MAX_CONTROL_FRAME_SIZE {
            return Err(IngestError::FrameTooLarge {
                size: len,
                limit: MAX_CONTROL_FRAME_SIZE,
            });
        }
        let mut body = vec![0u8; len];
        self.read_body(&mut body).await?;
        Ok(Some(Frame::Control(ControlFrame::decode(&body)?)))
    }

    /// Reads a big-endian length, distinguishing clean EOF from a torn one.
    async fn read_len(&mut self) -> Result<Option<u32>, IngestError> {
        let mut buf = [0u8; 4];
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.inner.read(&mut buf[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(IngestError::framing("connection closed inside frame length"));
            }
            filled += n;
        }
        Ok(Some(u32::from_be_bytes(buf)))
    }

    async fn read_body(&mut self, buf: &mut [u8]) -> Result<(), IngestError> {
        match self.inner.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                Err(IngestError::framing("connection closed inside frame body"))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn write_control(&mut self, frame: &ControlFrame) -> Result<(), IngestError> {
        let stream = self.inner.get_mut();
        stream.write_all(&frame.encode()).await?;
        stream.flush().await?;
        Ok(())
    }

    pub async fn write_data(&mut self, payload: &[u8]) -> Result<(), IngestError> {
        if payload.is_empty() {
            return Err(IngestError::framing("data frames cannot be empty"));
        }
        let stream = self.inner.get_mut();
        stream.write_all(&(payload.len() as u32).to_be_bytes()).await?;
        stream.write_all(payload).await?;
        stream.flush().await?;
        Ok(())
    }
}
