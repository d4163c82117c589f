// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Length-prefixed binary frames.
//!
//! ```text
//! +----------+-------------+------------+-------+---------+
//! | len: u32 | dest: u16   | req id:u32 | type  | payload |
//! | big-end. | route code  | echoed     | u8    | opaque  |
//! +----------+-------------+------------+-------+---------+
//! ```
//!
//! `len` counts everything after itself (7 header bytes + payload).

use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Upper bound on a frame body; anything larger is a protocol error.
pub const MAX_FRAME_BYTES: usize = 1 << 20;

const HEADER_BYTES: usize = 7;

/// Built-in route codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Destination {
    Auth = 1,
    Lifecycle = 2,
    ConfigStore = 3,
    Cli = 4,
    Credentials = 5,
}

impl Destination {
    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            1 => Destination::Auth,
            2 => Destination::Lifecycle,
            3 => Destination::ConfigStore,
            4 => Destination::Cli,
            5 => Destination::Credentials,
            _ => return None,
        })
    }

    pub fn code(self) -> u16 {
        self as u16
    }
}

/// Frame kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Request = 0,
    Response = 1,
    Event = 2,
}

impl FrameType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0 => FrameType::Request,
            1 => FrameType::Response,
            2 => FrameType::Event,
            _ => return None,
        })
    }
}

/// One frame on the wire. The destination code is kept raw so unknown
/// routes can be answered with NOT_FOUND instead of dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub destination: u16,
    pub request_id: u32,
    pub frame_type: FrameType,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn request(destination: Destination, request_id: u32, payload: Vec<u8>) -> Self {
        Self { destination: destination.code(), request_id, frame_type: FrameType::Request, payload }
    }

    pub fn response(destination: u16, request_id: u32, payload: Vec<u8>) -> Self {
        Self { destination, request_id, frame_type: FrameType::Response, payload }
    }

    pub fn event(destination: Destination, request_id: u32, payload: Vec<u8>) -> Self {
        Self { destination: destination.code(), request_id, frame_type: FrameType::Event, payload }
    }
}

/// Framing errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("connection closed")]
    ConnectionClosed,

    #[error("timed out")]
    Timeout,

    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    #[error("frame shorter than its header")]
    Truncated,

    #[error("unknown frame type {0}")]
    UnknownFrameType(u8),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Encode a frame to bytes (length prefix included).
pub fn encode(frame: &Frame) -> Vec<u8> {
    let body_len = HEADER_BYTES + frame.payload.len();
    let mut out = Vec::with_capacity(4 + body_len);
    out.extend_from_slice(&(body_len as u32).to_be_bytes());
    out.extend_from_slice(&frame.destination.to_be_bytes());
    out.extend_from_slice(&frame.request_id.to_be_bytes());
    out.push(frame.frame_type as u8);
    out.extend_from_slice(&frame.payload);
    out
}

/// Decode one frame body (the bytes after the length prefix).
pub fn decode(body: &[u8]) -> Result<Frame, ProtocolError> {
    if body.len() < HEADER_BYTES {
        return Err(ProtocolError::Truncated);
    }
    let destination = u16::from_be_bytes([body[0], body[1]]);
    let request_id = u32::from_be_bytes([body[2], body[3], body[4], body[5]]);
    let frame_type =
        FrameType::from_byte(body[6]).ok_or(ProtocolError::UnknownFrameType(body[6]))?;
    Ok(Frame { destination, request_id, frame_type, payload: body[HEADER_BYTES..].to_vec() })
}

/// Read one frame, failing after `limit`.
pub async fn read_frame<R>(reader: &mut R, limit: Duration) -> Result<Frame, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    timeout(limit, read_frame_inner(reader))
        .await
        .map_err(|_| ProtocolError::Timeout)?
}

/// Read one frame with no deadline (long-lived event connections).
pub async fn read_frame_unbounded<R>(reader: &mut R) -> Result<Frame, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    read_frame_inner(reader).await
}

async fn read_frame_inner<R>(reader: &mut R) -> Result<Frame, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::ConnectionClosed)
        }
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    if len < HEADER_BYTES {
        return Err(ProtocolError::Truncated);
    }
    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed,
            _ => ProtocolError::Io(e),
        })?;
    decode(&body)
}

/// Write one frame, failing after `limit`.
pub async fn write_frame<W>(
    writer: &mut W,
    frame: &Frame,
    limit: Duration,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    if frame.payload.len() + HEADER_BYTES > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge(frame.payload.len()));
    }
    let bytes = encode(frame);
    timeout(limit, async {
        writer.write_all(&bytes).await?;
        writer.flush().await
    })
    .await
    .map_err(|_| ProtocolError::Timeout)??;
    Ok(())
}

#[cfg(test)]
#[path = "frame_tests.rs"]
mod tests;
