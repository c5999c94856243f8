//! Length-prefixed JSON frames: `<len> <json>`
//!
//! `len` is the ASCII decimal byte length of the JSON payload, followed by
//! one space. Whitespace between frames is ignored.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest payload accepted from a peer
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Digits needed to write `MAX_FRAME_LEN`
const MAX_HEADER_DIGITS: usize = 7;

/// Framing errors
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame header is not a decimal length")]
    BadHeader,

    #[error("frame of {0} bytes is over the limit")]
    TooLarge(usize),

    #[error("connection closed mid-frame")]
    Truncated,

    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Pull one complete payload off the front of `buf`, if there is one
pub fn decode(buf: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
    let skip = buf.iter().take_while(|b| b.is_ascii_whitespace()).count();
    buf.advance(skip);
    if buf.is_empty() {
        return Ok(None);
    }

    let Some(space) = buf.iter().take(MAX_HEADER_DIGITS + 1).position(|&b| b == b' ') else {
        if buf.len() > MAX_HEADER_DIGITS || !buf.iter().all(u8::is_ascii_digit) {
            return Err(FrameError::BadHeader);
        }
        return Ok(None);
    };

    let header = &buf[..space];
    if header.is_empty() || !header.iter().all(u8::is_ascii_digit) {
        return Err(FrameError::BadHeader);
    }
    let len = header
        .iter()
        .fold(0usize, |acc, d| acc * 10 + usize::from(d - b'0'));
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }

    let total = space + 1 + len;
    if buf.len() < total {
        buf.reserve(total - buf.len());
        return Ok(None);
    }

    buf.advance(space + 1);
    Ok(Some(buf.split_to(len).freeze()))
}

/// Append `msg` as one frame
pub fn encode<T: Serialize>(msg: &T, dst: &mut BytesMut) -> Result<(), FrameError> {
    let payload = serde_json::to_vec(msg)?;
    let header = format!("{} ", payload.len());
    dst.reserve(header.len() + payload.len());
    dst.put_slice(header.as_bytes());
    dst.put_slice(&payload);
    Ok(())
}

/// Read until a whole frame is buffered; `None` on a clean close between frames
pub async fn read_frame<R>(reader: &mut R, buf: &mut BytesMut) -> Result<Option<Bytes>, FrameError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(frame) = decode(buf)? {
            return Ok(Some(frame));
        }
        if reader.read_buf(buf).await? == 0 {
            let leftover = buf.iter().any(|b| !b.is_ascii_whitespace());
            return if leftover {
                Err(FrameError::Truncated)
            } else {
                Ok(None)
            };
        }
    }
}

pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut out = BytesMut::new();
    encode(msg, &mut out)?;
    writer.write_all(&out).await?;
    writer.flush().await?;
    Ok(())
}
